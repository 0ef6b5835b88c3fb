// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A page-aligned anonymous memory mapping.
//!
//! Guest RAM must live at a page-aligned, stable host address so the
//! hypervisor can map it into the guest physical address space.

use std::ptr;

use crate::errno_result;
use crate::Error;
use crate::Result;

/// Wraps an anonymous shared memory mapping in the current process.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is exclusively owned for its whole lifetime and all
// accesses go through raw-pointer copies with explicit bounds checks.
unsafe impl Send for MemoryMapping {}
// SAFETY: see above.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Creates an anonymous read/write mapping of `size` bytes, zero filled.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        if size == 0 {
            return Err(Error::new(libc::EINVAL));
        }
        let addr = Self::alloc_pages(size)?;
        Ok(MemoryMapping { addr, size })
    }

    #[cfg(unix)]
    fn alloc_pages(size: usize) -> Result<*mut u8> {
        // SAFETY: anonymous mapping, no file descriptor involved, and the
        // result is checked before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return errno_result();
        }
        Ok(addr as *mut u8)
    }

    #[cfg(windows)]
    fn alloc_pages(size: usize) -> Result<*mut u8> {
        use windows::Win32::System::Memory::VirtualAlloc;
        use windows::Win32::System::Memory::MEM_COMMIT;
        use windows::Win32::System::Memory::MEM_RESERVE;
        use windows::Win32::System::Memory::PAGE_READWRITE;

        // SAFETY: reserving fresh pages, result checked before use.
        let addr = unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
        if addr.is_null() {
            return errno_result();
        }
        Ok(addr as *mut u8)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host address of the start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr
    }

    /// Writes `buf` into the mapping starting at `offset`.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<()> {
        match offset.checked_add(buf.len()) {
            Some(end) if end <= self.size => {
                // SAFETY: the range was just bounds checked and the source
                // buffer cannot overlap an anonymous mapping we own.
                unsafe {
                    ptr::copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), buf.len());
                }
                Ok(())
            }
            _ => Err(Error::new(libc::EINVAL)),
        }
    }

    /// Fills `buf` from the mapping starting at `offset`.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        match offset.checked_add(buf.len()) {
            Some(end) if end <= self.size => {
                // SAFETY: the range was just bounds checked.
                unsafe {
                    ptr::copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), buf.len());
                }
                Ok(())
            }
            _ => Err(Error::new(libc::EINVAL)),
        }
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: the address and size came from a successful mmap call.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.size);
        }
        #[cfg(windows)]
        // SAFETY: the address came from a successful VirtualAlloc call.
        unsafe {
            use windows::Win32::System::Memory::VirtualFree;
            use windows::Win32::System::Memory::MEM_RELEASE;
            VirtualFree(self.addr as *mut _, 0, MEM_RELEASE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_mapping_is_zeroed() {
        let m = MemoryMapping::new(0x1000).unwrap();
        let mut buf = [0xAAu8; 16];
        m.read_slice(&mut buf, 0x800).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let m = MemoryMapping::new(0x1000).unwrap();
        m.write_slice(&[1, 2, 3, 4], 0xFF0).unwrap();
        let mut buf = [0u8; 4];
        m.read_slice(&mut buf, 0xFF0).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let m = MemoryMapping::new(0x1000).unwrap();
        assert!(m.write_slice(&[0u8; 32], 0xFF0).is_err());
        let mut buf = [0u8; 32];
        assert!(m.read_slice(&mut buf, 0xFF0).is_err());
        assert!(m.read_slice(&mut buf, usize::MAX).is_err());
    }

    #[test]
    fn zero_sized_mapping_is_rejected() {
        assert!(MemoryMapping::new(0).is_err());
    }
}
