// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest memory for the 1 MiB real-mode address space.
//!
//! The platform layer allocates the backing store once; every other consumer
//! (hypervisor mapping, DMA transfers, the video refresh hook) holds a cloned
//! `GuestMemory` handle sharing the same allocation.

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use base::MemoryMapping;
use remain::sorted;
use thiserror::Error;

/// A guest physical address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Returns the offset from the start of guest memory.
    pub fn offset(self) -> u64 {
        self.0
    }

    /// Returns the address plus `offset`, or `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<GuestAddress> {
        self.0.checked_add(offset).map(GuestAddress)
    }
}

impl Display for GuestAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[sorted]
#[derive(Error, Debug)]
pub enum GuestMemoryError {
    /// The requested range falls outside guest memory.
    #[error("invalid guest memory range {0}..+{1:#x}")]
    InvalidGuestRange(GuestAddress, u64),
    /// Backing store allocation failed.
    #[error("failed to map guest memory: {0}")]
    MemoryMappingFailed(base::Error),
}

pub type Result<T> = std::result::Result<T, GuestMemoryError>;

/// The guest's physical memory, shared by cloning.
#[derive(Clone, Debug)]
pub struct GuestMemory {
    mapping: Arc<MemoryMapping>,
}

impl GuestMemory {
    /// Allocates a zeroed guest memory region of `size` bytes.
    pub fn new(size: u64) -> Result<GuestMemory> {
        let mapping =
            MemoryMapping::new(size as usize).map_err(GuestMemoryError::MemoryMappingFailed)?;
        Ok(GuestMemory {
            mapping: Arc::new(mapping),
        })
    }

    /// Total size of guest memory in bytes.
    pub fn memory_size(&self) -> u64 {
        self.mapping.size() as u64
    }

    /// True if `addr..addr+len` lies entirely inside guest memory.
    pub fn range_is_valid(&self, addr: GuestAddress, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(end) => end.offset() <= self.memory_size(),
            None => false,
        }
    }

    /// Writes all of `buf` at `addr`.
    pub fn write_all_at_addr(&self, buf: &[u8], addr: GuestAddress) -> Result<()> {
        if !self.range_is_valid(addr, buf.len() as u64) {
            return Err(GuestMemoryError::InvalidGuestRange(addr, buf.len() as u64));
        }
        self.mapping
            .write_slice(buf, addr.offset() as usize)
            .map_err(GuestMemoryError::MemoryMappingFailed)
    }

    /// Fills `buf` from guest memory starting at `addr`.
    pub fn read_exact_at_addr(&self, buf: &mut [u8], addr: GuestAddress) -> Result<()> {
        if !self.range_is_valid(addr, buf.len() as u64) {
            return Err(GuestMemoryError::InvalidGuestRange(addr, buf.len() as u64));
        }
        self.mapping
            .read_slice(buf, addr.offset() as usize)
            .map_err(GuestMemoryError::MemoryMappingFailed)
    }

    /// Host address of guest physical address zero, for hypervisor mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_backing_store() {
        let mem = GuestMemory::new(0x2000).unwrap();
        let alias = mem.clone();
        mem.write_all_at_addr(&[0x55, 0xAA], GuestAddress(0x1000))
            .unwrap();
        let mut buf = [0u8; 2];
        alias
            .read_exact_at_addr(&mut buf, GuestAddress(0x1000))
            .unwrap();
        assert_eq!(buf, [0x55, 0xAA]);
    }

    #[test]
    fn range_checks() {
        let mem = GuestMemory::new(0x1000).unwrap();
        assert!(mem.range_is_valid(GuestAddress(0xFFF), 1));
        assert!(!mem.range_is_valid(GuestAddress(0xFFF), 2));
        assert!(!mem.range_is_valid(GuestAddress(u64::MAX), 2));
        assert!(mem
            .write_all_at_addr(&[0u8; 2], GuestAddress(0xFFF))
            .is_err());
        let mut buf = [0u8; 2];
        assert!(mem
            .read_exact_at_addr(&mut buf, GuestAddress(0xFFF))
            .is_err());
    }

    #[test]
    fn memory_starts_zeroed() {
        let mem = GuestMemory::new(0x1000).unwrap();
        let mut buf = [0xFFu8; 8];
        mem.read_exact_at_addr(&mut buf, GuestAddress(0)).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }
}
