// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Instant;

/// A monotonic clock reporting nanoseconds since an arbitrary process-local
/// epoch.
///
/// Device models take this as a capability (`Arc<Mutex<Clock>>`) so tests can
/// substitute [`FakeClock`] and drive time deterministically.
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since this clock was created.
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

/// A fake clock advanced manually with [`FakeClock::add_ns`].
#[derive(Debug, Default)]
pub struct FakeClock {
    ns_since_epoch: u64,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock { ns_since_epoch: 0 }
    }

    pub fn now_ns(&self) -> u64 {
        self.ns_since_epoch
    }

    /// Advances the fake time by `ns` nanoseconds.
    pub fn add_ns(&mut self, ns: u64) {
        self.ns_since_epoch += ns;
    }
}
