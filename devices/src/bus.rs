// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handles routing port I/O to devices.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use remain::sorted;
use sync::Mutex;
use thiserror::Error;

/// Information about a port access passed to a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusAccessInfo {
    /// Absolute port number of the access.
    pub address: u16,
    /// Offset of the port from the start of the device's range.
    pub offset: u16,
}

impl fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "port {:#06x}", self.address)
    }
}

/// A device attached to the port I/O bus.
///
/// All accesses reaching a device are byte sized; the dispatcher narrows
/// wider CPU accesses before routing them (and widens the reply on the way
/// back).
pub trait BusDevice: Send {
    /// Label presented in debug output.
    fn debug_label(&self) -> String;

    /// Reads at `offset` within this device.
    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]);

    /// Writes at `offset` within this device.
    fn write(&mut self, info: BusAccessInfo, data: &[u8]);
}

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("new device range overlaps with an existing device")]
    Overlap,
    #[error("device range is empty")]
    ZeroSizedRange,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Holds a base and length representing the port range of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct BusRange {
    base: u16,
    len: u16,
}

impl BusRange {
    fn contains(&self, addr: u16) -> bool {
        self.base <= addr && addr - self.base < self.len
    }

    fn overlaps(&self, other: &BusRange) -> bool {
        self.base < other.base.saturating_add(other.len)
            && other.base < self.base.saturating_add(self.len)
    }
}

/// A port I/O bus.
///
/// A single device may be inserted at several disjoint ranges (the DMA
/// controller owns both its register file and the page-register block); the
/// device tells them apart by `BusAccessInfo::address`.
#[derive(Clone, Default)]
pub struct Bus {
    devices: BTreeMap<u16, (u16, Arc<Mutex<dyn BusDevice>>)>,
}

impl Bus {
    pub fn new() -> Bus {
        Bus {
            devices: BTreeMap::new(),
        }
    }

    /// Puts the given device at the given port range.
    pub fn insert(&mut self, device: Arc<Mutex<dyn BusDevice>>, base: u16, len: u16) -> Result<()> {
        if len == 0 {
            return Err(Error::ZeroSizedRange);
        }
        let range = BusRange { base, len };
        for (&other_base, &(other_len, _)) in &self.devices {
            let other = BusRange {
                base: other_base,
                len: other_len,
            };
            if range.overlaps(&other) {
                return Err(Error::Overlap);
            }
        }
        self.devices.insert(base, (len, device));
        Ok(())
    }

    fn get_device(&self, addr: u16) -> Option<(u16, &Arc<Mutex<dyn BusDevice>>)> {
        let (&base, (len, device)) = self.devices.range(..=addr).next_back()?;
        let range = BusRange { base, len: *len };
        if range.contains(addr) {
            Some((addr - base, device))
        } else {
            None
        }
    }

    /// Reads from the device that owns `addr`, returning true if one exists.
    pub fn read(&self, addr: u16, data: &mut [u8]) -> bool {
        match self.get_device(addr) {
            Some((offset, device)) => {
                device.lock().read(
                    BusAccessInfo {
                        address: addr,
                        offset,
                    },
                    data,
                );
                true
            }
            None => false,
        }
    }

    /// Writes to the device that owns `addr`, returning true if one exists.
    pub fn write(&self, addr: u16, data: &[u8]) -> bool {
        match self.get_device(addr) {
            Some((offset, device)) => {
                device.lock().write(
                    BusAccessInfo {
                        address: addr,
                        offset,
                    },
                    data,
                );
                true
            }
            None => false,
        }
    }
}
