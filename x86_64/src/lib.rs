// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! PC/XT memory layout and vcpu bring-up.
//!
//! Loads the firmware into the top of the 1 MiB address space, validates the
//! reset vector, and produces the real-mode register state a freshly
//! powered 8088 presents.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base::info;
use base::warn;
use hypervisor::Regs;
use hypervisor::Segment;
use hypervisor::Sregs;
use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use vm_memory::GuestMemoryError;

/// Size of guest physical memory: the 8088's 1 MiB address space.
pub const GUEST_MEM_SIZE: u64 = 0x10_0000;
/// Base of the 64 KiB firmware window.
pub const BIOS_BASE: GuestAddress = GuestAddress(0xf_0000);
/// Size of the firmware window.
pub const BIOS_WINDOW_SIZE: usize = 0x1_0000;
/// Where the processor fetches its first instruction.
pub const RESET_VECTOR: GuestAddress = GuestAddress(0xf_fff0);
/// Load address for flat test programs.
pub const PROGRAM_LOAD_ADDRESS: GuestAddress = GuestAddress(0x1_0100);

// A far jump to F000:0000, patched over an unusable reset vector.
const RESET_VECTOR_PATCH: [u8; 5] = [0xea, 0x00, 0x00, 0x00, 0xf0];

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("BIOS image is empty")]
    BiosEmpty,
    #[error("BIOS image of {0} bytes exceeds the 64 KiB window")]
    BiosTooLarge(u64),
    #[error("failed to open firmware image: {0}")]
    OpenFirmware(#[source] std::io::Error),
    #[error("program of {0} bytes does not fit in guest memory")]
    ProgramTooLarge(u64),
    #[error("failed to read firmware image: {0}")]
    ReadFirmware(#[source] std::io::Error),
    #[error("failed to write firmware to guest memory: {0}")]
    SetupGuestMemory(#[source] GuestMemoryError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(Error::OpenFirmware)?;
    let mut image = Vec::new();
    file.read_to_end(&mut image).map_err(Error::ReadFirmware)?;
    Ok(image)
}

/// Loads the BIOS image into the firmware window, mirroring short images
/// across the full 64 KiB, and makes sure the reset vector is usable.
///
/// Returns the number of bytes read from the image.
pub fn load_bios(mem: &GuestMemory, path: &Path) -> Result<usize> {
    let image = read_image(path)?;
    if image.is_empty() {
        return Err(Error::BiosEmpty);
    }
    if image.len() > BIOS_WINDOW_SIZE {
        return Err(Error::BiosTooLarge(image.len() as u64));
    }

    // Short images repeat until the window is full, so the reset vector at
    // the top of memory always lands inside firmware.
    let mut window_offset = 0;
    while window_offset < BIOS_WINDOW_SIZE {
        let chunk = image.len().min(BIOS_WINDOW_SIZE - window_offset);
        let addr = GuestAddress(BIOS_BASE.offset() + window_offset as u64);
        mem.write_all_at_addr(&image[..chunk], addr)
            .map_err(Error::SetupGuestMemory)?;
        window_offset += chunk;
    }

    check_reset_vector(mem)?;
    info!("BIOS loaded from {} ({} bytes)", path.display(), image.len());
    Ok(image.len())
}

/// The reset vector must hold a far jump into the firmware segment; an
/// 8088 BIOS begins with `EA xx xx xx F0`. Anything else is patched to a
/// jump to F000:0000.
fn check_reset_vector(mem: &GuestMemory) -> Result<()> {
    let mut vector = [0u8; 5];
    mem.read_exact_at_addr(&mut vector, RESET_VECTOR)
        .map_err(Error::SetupGuestMemory)?;
    if vector[0] == 0xea {
        info!(
            "BIOS reset vector jumps to {:02X}{:02X}:{:02X}{:02X}",
            vector[4], vector[3], vector[2], vector[1]
        );
    } else {
        warn!("BIOS reset vector is unexpected; patching far jump to F000:0000");
        mem.write_all_at_addr(&RESET_VECTOR_PATCH, RESET_VECTOR)
            .map_err(Error::SetupGuestMemory)?;
    }
    Ok(())
}

/// Loads a flat binary at [`PROGRAM_LOAD_ADDRESS`]. Returns the number of
/// bytes loaded.
pub fn load_program(mem: &GuestMemory, path: &Path) -> Result<usize> {
    let image = read_image(path)?;
    if !mem.range_is_valid(PROGRAM_LOAD_ADDRESS, image.len() as u64) {
        return Err(Error::ProgramTooLarge(image.len() as u64));
    }
    mem.write_all_at_addr(&image, PROGRAM_LOAD_ADDRESS)
        .map_err(Error::SetupGuestMemory)?;
    Ok(image.len())
}

/// Register state of a just-reset 8088-compatible processor: execution
/// begins at F000:FFF0 with flat 64 KiB real-mode segments.
pub fn vcpu_init() -> (Regs, Sregs) {
    // Intel SDM Vol. 3A, 3.4.5.1: code/data segment descriptor types.
    const SEG_TYPE_CODE_READABLE_ACCESSED: u8 = 0x0b;
    const SEG_TYPE_DATA_WRITABLE_ACCESSED: u8 = 0x03;

    let code_seg = Segment {
        base: BIOS_BASE.offset(),
        limit: 0xffff,
        selector: 0xf000,
        type_: SEG_TYPE_CODE_READABLE_ACCESSED,
        present: 1,
        s: 1,
        ..Default::default()
    };
    let data_seg = Segment {
        base: 0,
        limit: 0xffff,
        selector: 0,
        type_: SEG_TYPE_DATA_WRITABLE_ACCESSED,
        present: 1,
        s: 1,
        ..Default::default()
    };

    let regs = Regs::default();
    let sregs = Sregs {
        cs: code_seg,
        ds: data_seg,
        es: data_seg,
        fs: data_seg,
        gs: data_seg,
        ss: data_seg,
    };
    (regs, sregs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_image(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn guest_mem() -> GuestMemory {
        GuestMemory::new(GUEST_MEM_SIZE).unwrap()
    }

    /// A 16 KiB image mirrors four times across the window and gains a
    /// patched reset vector when its top bytes are zero.
    #[test]
    fn short_bios_mirrors_and_patches() {
        let mem = guest_mem();
        let mut image = vec![0u8; 0x4000];
        image[0] = 0xc3;
        let file = write_image(&image);

        assert_eq!(load_bios(&mem, file.path()).unwrap(), 0x4000);

        // Mirrored copies at each 16 KiB boundary.
        let mut byte = [0u8];
        for copy in 0..4 {
            mem.read_exact_at_addr(&mut byte, GuestAddress(0xf_0000 + copy * 0x4000))
                .unwrap();
            assert_eq!(byte[0], 0xc3, "copy {} not mirrored", copy);
        }

        let mut vector = [0u8; 5];
        mem.read_exact_at_addr(&mut vector, RESET_VECTOR).unwrap();
        assert_eq!(vector, [0xea, 0x00, 0x00, 0x00, 0xf0]);
    }

    /// An image with a valid far jump at the reset vector is left alone.
    #[test]
    fn existing_reset_vector_is_kept() {
        let mem = guest_mem();
        let mut image = vec![0u8; BIOS_WINDOW_SIZE];
        image[0xfff0..0xfff5].copy_from_slice(&[0xea, 0x5b, 0xe0, 0x00, 0xf0]);
        let file = write_image(&image);

        load_bios(&mem, file.path()).unwrap();

        let mut vector = [0u8; 5];
        mem.read_exact_at_addr(&mut vector, RESET_VECTOR).unwrap();
        assert_eq!(vector, [0xea, 0x5b, 0xe0, 0x00, 0xf0]);
    }

    #[test]
    fn oversized_bios_is_rejected() {
        let mem = guest_mem();
        let file = write_image(&vec![0u8; BIOS_WINDOW_SIZE + 1]);
        assert!(matches!(
            load_bios(&mem, file.path()),
            Err(Error::BiosTooLarge(_))
        ));
    }

    #[test]
    fn empty_bios_is_rejected() {
        let mem = guest_mem();
        let file = write_image(&[]);
        assert!(matches!(load_bios(&mem, file.path()), Err(Error::BiosEmpty)));
    }

    #[test]
    fn missing_bios_is_an_open_error() {
        let mem = guest_mem();
        assert!(matches!(
            load_bios(&mem, Path::new("/nonexistent/firmware.bin")),
            Err(Error::OpenFirmware(_))
        ));
    }

    #[test]
    fn program_loads_at_fixed_address() {
        let mem = guest_mem();
        let file = write_image(&[0x90, 0xf4]);
        assert_eq!(load_program(&mem, file.path()).unwrap(), 2);
        let mut buf = [0u8; 2];
        mem.read_exact_at_addr(&mut buf, PROGRAM_LOAD_ADDRESS)
            .unwrap();
        assert_eq!(buf, [0x90, 0xf4]);
    }

    #[test]
    fn vcpu_init_is_real_mode_reset_state() {
        let (regs, sregs) = vcpu_init();
        assert_eq!(regs.rip, 0xfff0);
        assert_eq!(regs.rflags, 0x2);
        assert_eq!(sregs.cs.base, 0xf_0000);
        assert_eq!(sregs.cs.selector, 0xf000);
        assert_eq!(sregs.cs.attributes(), 0x009b);
        assert_eq!(sregs.ds.attributes(), 0x0093);
        // CS:IP points at the reset vector.
        assert_eq!(sregs.cs.base + regs.rip, RESET_VECTOR.offset());
    }
}
