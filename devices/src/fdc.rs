// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software emulation of a NEC 765 style floppy disk controller, covering
//! the command subset an XT BIOS exercises.
//!
//! The controller walks a three-phase state machine: a command byte, its
//! parameter bytes, then an optional result phase read back byte by byte.
//! Sector data never flows through the data port; READ DATA copies straight
//! into guest memory at the address programmed into DMA channel 2.

use std::sync::Arc;

use base::debug;
use base::info;
use base::warn;
use sync::Mutex;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::dma::Dma;
use crate::irq_line::IrqLine;

// Port offsets from 0x3f0.
const DIGITAL_OUTPUT: u16 = 2; // 0x3f2
const MAIN_STATUS: u16 = 4; // 0x3f4
const DATA: u16 = 5; // 0x3f5
const DIGITAL_INPUT: u16 = 7; // 0x3f7

// Main status register values for each phase.
const MSR_IDLE: u8 = 0x80; // RQM
const MSR_PARAMS: u8 = 0x90; // RQM | BUSY
const MSR_RESULT: u8 = 0xd0; // RQM | DIO | BUSY

// DOR bit 2 is the active-low reset release.
const DOR_RESET_RELEASE: u8 = 0x04;

// Commands, keyed by the low five bits of the command byte.
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE_STATUS: u8 = 0x04;
const CMD_READ_DATA: u8 = 0x06;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INTERRUPT_STATUS: u8 = 0x08;
const CMD_SEEK: u8 = 0x0f;

// ST0 bits.
const ST0_SEEK_END: u8 = 0x20;
const ST0_ABNORMAL_TERMINATION: u8 = 0x40;
const ST0_INVALID: u8 = 0xc0;
// ST1 no-data bit, set when the requested sector is unreachable.
const ST1_NO_DATA: u8 = 0x20;
// ST3 bits for SENSE DRIVE STATUS.
const ST3_TRACK0: u8 = 0x10;
const ST3_READY: u8 = 0x20;

// READ DATA transfers go through the floppy's fixed DMA channel.
const FDC_DMA_CHANNEL: usize = 2;

/// Which kind of byte the data port transfers next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting for a command byte.
    Command,
    /// Collecting parameter bytes for the latched command.
    Params,
    /// Producing result bytes.
    Result,
}

/// Floppy geometry, inferred from the image size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DiskGeometry {
    heads: usize,
    sectors_per_track: usize,
    tracks: usize,
    sector_size: usize,
}

impl DiskGeometry {
    /// Matches the common raw image sizes; anything else keeps the 1.44M
    /// default.
    fn detect(image_len: usize) -> DiskGeometry {
        let (heads, sectors_per_track, tracks) = match image_len {
            184_320 => (1, 9, 40),  // 180K 5.25" single sided.
            368_640 => (2, 9, 40),  // 360K 5.25".
            737_280 => (2, 9, 80),  // 720K 3.5".
            1_228_800 => (2, 15, 80), // 1.2M 5.25".
            1_474_560 => (2, 18, 80), // 1.44M 3.5".
            _ => (2, 18, 80),
        };
        DiskGeometry {
            heads,
            sectors_per_track,
            tracks,
            sector_size: 512,
        }
    }
}

/// The floppy disk controller.
pub struct Fdc {
    phase: Phase,
    dor: u8,
    msr: u8,
    command: u8,
    params: [u8; 8],
    param_count: usize,
    param_expected: usize,
    result: [u8; 7],
    result_len: usize,
    result_pos: usize,
    /// Status bytes of the last transfer command.
    st0: u8,
    st1: u8,
    st2: u8,
    /// Shadows reported by SENSE INTERRUPT STATUS.
    st0_irq: u8,
    pcn_irq: u8,
    irq_pending: bool,
    /// Present cylinder of each drive.
    track: [u8; 4],
    disk: Vec<u8>,
    geometry: DiskGeometry,
    mem: GuestMemory,
    dma: Arc<Mutex<Dma>>,
    irq: IrqLine,
}

impl Fdc {
    pub fn new(mem: GuestMemory, dma: Arc<Mutex<Dma>>, irq: IrqLine) -> Fdc {
        Fdc {
            phase: Phase::Command,
            dor: 0,
            msr: MSR_IDLE,
            command: 0,
            params: [0; 8],
            param_count: 0,
            param_expected: 0,
            result: [0; 7],
            result_len: 0,
            result_pos: 0,
            st0: 0,
            st1: 0,
            st2: 0,
            st0_irq: 0,
            pcn_irq: 0,
            irq_pending: false,
            track: [0; 4],
            disk: Vec::new(),
            geometry: DiskGeometry::detect(0),
            mem,
            dma,
            irq,
        }
    }

    /// Loads a raw floppy image and infers its geometry from the size.
    pub fn insert_disk(&mut self, image: Vec<u8>) {
        self.geometry = DiskGeometry::detect(image.len());
        info!(
            "fdc: floppy image of {} bytes, {} heads, {} sectors/track, {} tracks",
            image.len(),
            self.geometry.heads,
            self.geometry.sectors_per_track,
            self.geometry.tracks
        );
        self.disk = image;
    }

    fn raise_irq(&mut self) {
        self.irq_pending = true;
        self.irq.raise();
    }

    fn lower_irq(&mut self) {
        if self.irq_pending {
            self.irq.lower();
            self.irq_pending = false;
        }
    }

    fn finish_command(&mut self) {
        self.phase = Phase::Command;
        self.msr = MSR_IDLE;
        self.param_count = 0;
        self.param_expected = 0;
    }

    fn set_result(&mut self, bytes: &[u8]) {
        self.result[..bytes.len()].copy_from_slice(bytes);
        self.result_len = bytes.len();
        self.result_pos = 0;
        self.phase = Phase::Result;
        self.msr = MSR_RESULT;
    }

    fn write_data(&mut self, value: u8) {
        match self.phase {
            Phase::Command => {
                self.command = value;
                self.param_count = 0;
                let expected = match value & 0x1f {
                    CMD_SPECIFY => 2,
                    CMD_SENSE_DRIVE_STATUS => 1,
                    CMD_RECALIBRATE => 1,
                    CMD_SEEK => 2,
                    CMD_READ_DATA => 8,
                    CMD_SENSE_INTERRUPT_STATUS => 0,
                    unknown => {
                        warn!("fdc: unknown command {:#04x}", unknown);
                        self.finish_command();
                        return;
                    }
                };
                if expected == 0 {
                    self.execute_command();
                } else {
                    self.param_expected = expected;
                    self.phase = Phase::Params;
                    self.msr = MSR_PARAMS;
                }
            }
            Phase::Params => {
                if self.param_count < self.params.len() {
                    self.params[self.param_count] = value;
                    self.param_count += 1;
                }
                if self.param_count >= self.param_expected {
                    self.execute_command();
                }
            }
            Phase::Result => {
                debug!("fdc: dropping data write {:#04x} during result phase", value);
            }
        }
    }

    fn read_data(&mut self) -> u8 {
        if self.phase == Phase::Result && self.result_pos < self.result_len {
            let value = self.result[self.result_pos];
            self.result_pos += 1;
            if self.result_pos >= self.result_len {
                self.finish_command();
            }
            value
        } else {
            0
        }
    }

    fn execute_command(&mut self) {
        match self.command & 0x1f {
            CMD_SPECIFY => {
                // Step-rate and head timings have no observable effect here.
                self.finish_command();
            }
            CMD_RECALIBRATE => {
                let drive = self.params[0] & 3;
                self.track[usize::from(drive)] = 0;
                self.st0_irq = ST0_SEEK_END | drive;
                self.pcn_irq = 0;
                self.raise_irq();
                self.finish_command();
            }
            CMD_SENSE_DRIVE_STATUS => {
                let drive = self.params[0] & 3;
                let mut st3 = ST3_READY | drive;
                if self.track[usize::from(drive)] == 0 {
                    st3 |= ST3_TRACK0;
                }
                self.set_result(&[st3]);
            }
            CMD_SEEK => {
                let drive = self.params[0] & 3;
                let cylinder = self.params[1];
                self.track[usize::from(drive)] = cylinder;
                self.st0_irq = ST0_SEEK_END | drive;
                self.pcn_irq = cylinder;
                self.raise_irq();
                self.finish_command();
            }
            CMD_SENSE_INTERRUPT_STATUS => {
                self.set_result(&[self.st0_irq, self.pcn_irq]);
                self.lower_irq();
            }
            CMD_READ_DATA => self.read_data_command(),
            unknown => {
                warn!("fdc: unexpected command {:#04x}", unknown);
                self.finish_command();
            }
        }
    }

    /// READ DATA: copy one sector from the image into guest memory at the
    /// address programmed into DMA channel 2.
    fn read_data_command(&mut self) {
        let drive = self.params[0] & 3;
        let track = self.params[1];
        let head = self.params[2] & 1;
        let sector = self.params[3];
        let size_code = self.params[4];
        let len = 128usize << size_code;

        let geometry = self.geometry;
        let offset = (usize::from(track) * geometry.heads + usize::from(head))
            * geometry.sectors_per_track
            * geometry.sector_size
            + usize::from(sector.wrapping_sub(1)) * geometry.sector_size;

        let phys = self.dma.lock().physical_address(FDC_DMA_CHANNEL);
        let dest = GuestAddress(u64::from(phys));

        let in_disk = sector >= 1 && offset.checked_add(len).is_some_and(|end| end <= self.disk.len());
        let copied = in_disk
            && self
                .mem
                .write_all_at_addr(&self.disk[offset..offset + len], dest)
                .is_ok();
        if copied {
            self.st0 = drive;
            self.st1 = 0;
            self.st2 = 0;
        } else {
            debug!(
                "fdc: READ DATA out of range: track {} head {} sector {} -> {}",
                track, head, sector, dest
            );
            self.st0 = drive | ST0_ABNORMAL_TERMINATION;
            self.st1 = ST1_NO_DATA;
            self.st2 = 0;
        }
        self.set_result(&[
            self.st0, self.st1, self.st2, track, head, sector, size_code,
        ]);
        self.raise_irq();
    }

    fn write_dor(&mut self, value: u8) {
        let old = self.dor;
        self.dor = value;
        if value & DOR_RESET_RELEASE == 0 {
            // Reset asserted.
            self.st0_irq = ST0_INVALID;
            self.pcn_irq = 0;
            self.lower_irq();
            self.finish_command();
        } else if old & DOR_RESET_RELEASE == 0 {
            // Reset released; raise IRQ 6 so the BIOS notices the
            // controller.
            self.st0_irq = ST0_INVALID;
            self.pcn_irq = 0;
            self.raise_irq();
            self.finish_command();
        }
    }
}

impl BusDevice for Fdc {
    fn debug_label(&self) -> String {
        "FDC".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            warn!("fdc: unsupported read length {}", data.len());
            return;
        }
        data[0] = match info.offset {
            DIGITAL_OUTPUT => self.dor,
            MAIN_STATUS => self.msr,
            DATA => self.read_data(),
            // Disk change is not modeled.
            DIGITAL_INPUT => 0,
            _ => 0xff,
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            warn!("fdc: unsupported write length {}", data.len());
            return;
        }
        match info.offset {
            DIGITAL_OUTPUT => self.write_dor(data[0]),
            DATA => self.write_data(data[0]),
            offset => debug!("fdc: dropping write to offset {}", offset),
        }
    }
}
