// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Single-byte platform latches: the NMI mask, the POST diagnostic port,
//! and the CGA mode/status registers.
//!
//! These used to be loose statics in dispatch code on real-world ports of
//! this machine; here each latch is an ordinary device with explicit state.

use base::debug;
use base::info;
use base::warn;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;

// CGA status bit toggled on every read so BIOS retrace polling makes
// progress.
const CGA_VERTICAL_RETRACE: u8 = 0x08;
// Display-enable bit, always reported active.
const CGA_DISPLAY_ENABLE: u8 = 0x01;

/// The NMI mask latch. Only bit 7 is significant.
#[derive(Default)]
pub struct NmiMask {
    mask: u8,
}

impl NmiMask {
    pub fn new() -> NmiMask {
        NmiMask::default()
    }
}

impl BusDevice for NmiMask {
    fn debug_label(&self) -> String {
        "NMI mask".to_string()
    }

    fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
        if let [byte] = data {
            *byte = self.mask;
        }
    }

    fn write(&mut self, _info: BusAccessInfo, data: &[u8]) {
        if let [byte] = data {
            self.mask = byte & 0x80;
        }
    }
}

/// Port 0x80, the POST diagnostic display. Codes are logged; reads return
/// zero.
#[derive(Default)]
pub struct PostCard {
    last_code: Option<u8>,
}

impl PostCard {
    pub fn new() -> PostCard {
        PostCard::default()
    }
}

impl BusDevice for PostCard {
    fn debug_label(&self) -> String {
        "POST card".to_string()
    }

    fn read(&mut self, _info: BusAccessInfo, data: &mut [u8]) {
        if let [byte] = data {
            *byte = 0;
        }
    }

    fn write(&mut self, _info: BusAccessInfo, data: &[u8]) {
        if let [byte] = data {
            info!("POST code {:#04x}", byte);
            self.last_code = Some(*byte);
        }
    }
}

/// The CGA (and MDA) mode latches and the status register.
///
/// Mode bytes are opaque shadows; the renderer, when present, interprets
/// them. The status read flips the vertical-retrace bit each time so both
/// polarities of a BIOS polling loop terminate.
#[derive(Default)]
pub struct CgaMisc {
    mode_color: u8, // 0x3d8
    mode_mono: u8,  // 0x3b8
    status: u8,
}

impl CgaMisc {
    pub fn new() -> CgaMisc {
        CgaMisc::default()
    }
}

impl BusDevice for CgaMisc {
    fn debug_label(&self) -> String {
        "CGA registers".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            warn!("cga: unsupported read length {}", data.len());
            return;
        }
        data[0] = match info.address {
            0x3d8 => self.mode_color,
            0x3b8 => self.mode_mono,
            0x3da => {
                self.status ^= CGA_VERTICAL_RETRACE;
                self.status | CGA_DISPLAY_ENABLE
            }
            _ => 0,
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            warn!("cga: unsupported write length {}", data.len());
            return;
        }
        match info.address {
            0x3d8 => self.mode_color = data[0],
            0x3b8 => self.mode_mono = data[0],
            // The status register is read-only.
            address => debug!("cga: dropping write to {:#06x}", address),
        }
    }
}
