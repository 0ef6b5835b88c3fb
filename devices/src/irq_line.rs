// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use sync::Mutex;

use crate::pic::Pic;

/// One interrupt line of the [`Pic`], handed to the device that drives it.
///
/// Devices never own the interrupt controller; they hold this line-only
/// handle while the run loop owns the chip itself.
#[derive(Clone)]
pub struct IrqLine {
    chip: Arc<Mutex<Pic>>,
    line: u8,
}

impl IrqLine {
    pub fn new(chip: Arc<Mutex<Pic>>, line: u8) -> IrqLine {
        IrqLine { chip, line }
    }

    /// Drives the line high. A low-to-high transition latches a request.
    pub fn raise(&self) {
        self.chip.lock().service_irq(self.line, true);
    }

    /// Drives the line low, releasing the edge detector.
    pub fn lower(&self) {
        self.chip.lock().service_irq(self.line, false);
    }

    /// Produces a single edge: raise immediately followed by lower. The
    /// latched request survives until it is acknowledged.
    pub fn pulse(&self) {
        self.raise();
        self.lower();
    }
}
