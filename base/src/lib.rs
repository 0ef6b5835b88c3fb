// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host utilities shared by the xtvm workspace: logging, error wrapping, the
//! monotonic clock the device models run on, and the memory mapping backing
//! guest RAM.

mod clock;
mod errno;
mod mmap;
pub mod syslog;

pub use clock::Clock;
pub use clock::FakeClock;
pub use errno::errno_result;
pub use errno::Error;
pub use errno::Result;
pub use mmap::MemoryMapping;

pub use log::*;
