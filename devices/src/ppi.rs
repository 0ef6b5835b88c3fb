// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The 8255 programmable peripheral interface at ports 0x61-0x63.
//!
//! Port B gates the PIT's speaker channel and selects which configuration
//! switch group shows up on port C; port C multiplexes the DIP switches and
//! mirrors the timer output back to the BIOS during POST calibration.

use std::sync::Arc;

use base::warn;
use sync::Mutex;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::pit::Pit;

// Offsets from port 0x61.
const PORT_B: u16 = 0; // 0x61
const PORT_C: u16 = 1; // 0x62
const CONTROL: u16 = 2; // 0x63

// Port B bits.
const PORT_B_GATE2: u8 = 0x01;
const PORT_B_TIMER2_MIRROR: u8 = 0x02;
// Either switch-select bit routes the low switch group onto port C.
const PORT_B_SWITCH_SELECT: u8 = 0x0c;

// Port output bits carrying the timer.
const TIMER2_OUT: u8 = 0x20;

// Fixed switch group: one floppy drive, 80x25 color video.
const SWITCH_VIDEO_80X25_COLOR: u8 = 0x20;
const SWITCH_BOOT_FLOPPY: u8 = 0x01;

/// The PPI and the DIP-switch block behind it.
pub struct Ppi {
    pit: Arc<Mutex<Pit>>,
    /// Last value written to port B.
    port_b: u8,
    /// Opaque shadow of the control port.
    control: u8,
    /// Configuration switches, low nibble RAM size, high nibble
    /// drive/video.
    switches: u8,
}

impl Ppi {
    /// `ram_kib` is the conventional memory size the switches report.
    pub fn new(pit: Arc<Mutex<Pit>>, ram_kib: u32) -> Ppi {
        Ppi {
            pit,
            port_b: 0,
            control: 0,
            switches: Self::switch_block(ram_kib),
        }
    }

    /// Composes the power-on DIP switch byte: boot device and memory banks
    /// in the low nibble, video mode and drive count in the high nibble.
    fn switch_block(ram_kib: u32) -> u8 {
        // Banks of 64 KiB beyond the first, saturating at the 4-bank
        // encoding real boards used for 256 KiB and up.
        let banks = (ram_kib / 64).saturating_sub(1).min(3) as u8;
        SWITCH_BOOT_FLOPPY | banks << 2 | SWITCH_VIDEO_80X25_COLOR
    }

    fn timer2_out(&self) -> bool {
        self.pit.lock().channel2_out()
    }

    fn read_port_b(&self) -> u8 {
        let mut value = self.port_b & !TIMER2_OUT;
        if self.timer2_out() {
            value |= TIMER2_OUT;
        }
        value
    }

    fn read_port_c(&self) -> u8 {
        let mut value = if self.port_b & PORT_B_SWITCH_SELECT != 0 {
            self.switches & 0x0f
        } else {
            self.switches >> 4
        };
        if self.port_b & PORT_B_TIMER2_MIRROR != 0 && self.timer2_out() {
            value |= TIMER2_OUT;
        }
        value
    }

    fn write_port_b(&mut self, value: u8) {
        self.port_b = value;
        self.pit
            .lock()
            .set_channel2_gate(value & PORT_B_GATE2 != 0);
    }
}

impl BusDevice for Ppi {
    fn debug_label(&self) -> String {
        "PPI".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            warn!("ppi: unsupported read length {}", data.len());
            return;
        }
        data[0] = match info.offset {
            PORT_B => self.read_port_b(),
            PORT_C => self.read_port_c(),
            CONTROL => self.control,
            _ => 0,
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            warn!("ppi: unsupported write length {}", data.len());
            return;
        }
        match info.offset {
            PORT_B => self.write_port_b(data[0]),
            CONTROL => self.control = data[0],
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::FakeClock as Clock;

    use crate::irq_line::IrqLine;
    use crate::pic::Pic;

    fn set_up() -> (Ppi, Arc<Mutex<Pit>>, Arc<Mutex<Clock>>) {
        let clock = Arc::new(Mutex::new(Clock::new()));
        let pic = Arc::new(Mutex::new(Pic::new()));
        let pit = Arc::new(Mutex::new(Pit::new(
            IrqLine::new(pic, 0),
            clock.clone(),
        )));
        (Ppi::new(pit.clone(), 640), pit, clock)
    }

    fn write(ppi: &mut Ppi, offset: u16, value: u8) {
        ppi.write(
            BusAccessInfo {
                address: 0x61 + offset,
                offset,
            },
            &[value],
        );
    }

    fn read(ppi: &mut Ppi, offset: u16) -> u8 {
        let mut data = [0u8];
        ppi.read(
            BusAccessInfo {
                address: 0x61 + offset,
                offset,
            },
            &mut data,
        );
        data[0]
    }

    /// Port B reads back the written value with bit 5 replaced by the timer
    /// output (high while channel 2 is idle).
    #[test]
    fn port_b_mirrors_timer_out() {
        let (mut ppi, _pit, _clock) = set_up();
        write(&mut ppi, PORT_B, 0x4c);
        assert_eq!(read(&mut ppi, PORT_B), 0x4c | TIMER2_OUT);
    }

    /// Writing the gate bit starts channel 2 and restarts it on each rising
    /// edge.
    #[test]
    fn gate_bit_drives_channel2() {
        let (mut ppi, pit, clock) = set_up();
        // Program channel 2: reload 4, square wave.
        {
            let mut pit = pit.lock();
            pit.write(
                BusAccessInfo {
                    address: 0x43,
                    offset: 3,
                },
                &[0xb6],
            );
            pit.write(
                BusAccessInfo {
                    address: 0x42,
                    offset: 2,
                },
                &[4],
            );
            pit.write(
                BusAccessInfo {
                    address: 0x42,
                    offset: 2,
                },
                &[0],
            );
        }
        write(&mut ppi, PORT_B, PORT_B_GATE2);
        assert_ne!(read(&mut ppi, PORT_B) & TIMER2_OUT, 0);

        // Two ticks into a reload of four: second half, output low.
        clock.lock().add_ns(2 * 1_000_000_000 / 1_193_182 + 1);
        assert_eq!(read(&mut ppi, PORT_B) & TIMER2_OUT, 0);
    }

    /// Port C multiplexes the switch groups on the port B select bits.
    #[test]
    fn switch_multiplexing() {
        let (mut ppi, _pit, _clock) = set_up();
        // Select bits clear: drive/video group (high nibble).
        write(&mut ppi, PORT_B, 0x00);
        assert_eq!(read(&mut ppi, PORT_C) & 0x0f, 0x02); // 80x25 color.

        // Select bit set: RAM size group (low nibble).
        write(&mut ppi, PORT_B, 0x08);
        assert_eq!(read(&mut ppi, PORT_C) & 0x0f, 0x0d); // Floppy boot + 4 banks.
    }

    /// Port C mirrors the timer on bit 5 only when port B bit 1 is set.
    #[test]
    fn port_c_timer_mirror() {
        let (mut ppi, _pit, _clock) = set_up();
        write(&mut ppi, PORT_B, 0x00);
        assert_eq!(read(&mut ppi, PORT_C) & TIMER2_OUT, 0);
        write(&mut ppi, PORT_B, PORT_B_TIMER2_MIRROR);
        assert_ne!(read(&mut ppi, PORT_C) & TIMER2_OUT, 0);
    }

    /// The control port is an opaque byte latch.
    #[test]
    fn control_port_shadow() {
        let (mut ppi, _pit, _clock) = set_up();
        write(&mut ppi, CONTROL, 0x99);
        assert_eq!(read(&mut ppi, CONTROL), 0x99);
    }
}
