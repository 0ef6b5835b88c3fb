// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software emulation of a cascaded pair of 8259A programmable interrupt
//! controllers.
//!
//! The primary chip answers at ports 0x20/0x21 and takes IRQ lines 0-7, the
//! secondary at 0xa0/0xa1 with lines 8-15, cascaded through line 2 of the
//! primary. Input is edge triggered: a line must fall before a new rising
//! edge latches another request.

use base::debug;
use base::warn;
use hypervisor::Vcpu;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;

pub const PIC_PRIMARY_COMMAND: u16 = 0x20;
pub const PIC_PRIMARY_DATA: u16 = 0x21;
pub const PIC_SECONDARY_COMMAND: u16 = 0xa0;
pub const PIC_SECONDARY_DATA: u16 = 0xa1;

// Default vector bases after reset; ICW2 overrides them.
const PRIMARY_VECTOR_BASE: u8 = 0x08;
const SECONDARY_VECTOR_BASE: u8 = 0x70;

// Line of the primary chip the secondary cascades into.
const CASCADE_LINE: u8 = 2;

// ICW1 bits.
const ICW1_INIT: u8 = 0x10;
const ICW1_SINGLE_MODE: u8 = 0x02;
const ICW1_NEED_ICW4: u8 = 0x01;

// ICW4 bits.
const ICW4_AUTO_EOI: u8 = 0x02;

// OCW2 encodings (top three bits).
const OCW2_NON_SPECIFIC_EOI: u8 = 0x20;
const OCW2_SPECIFIC_EOI: u8 = 0x60;
const OCW2_ROTATE_NON_SPECIFIC: u8 = 0xa0;
const OCW2_ROTATE_SPECIFIC: u8 = 0xe0;

// OCW3 bits.
const OCW3_READ_REGISTER: u8 = 0x02;
const OCW3_READ_ISR: u8 = 0x01;

/// Selects one of the two chips in the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PicSelect {
    Primary = 0,
    Secondary = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PicInitState {
    /// Not initializing; data-port writes program the IMR.
    Icw1,
    Icw2,
    Icw3,
    Icw4,
}

#[derive(Debug)]
struct PicState {
    /// Edge detection shadow of each line's raised state.
    last_irr: u8,
    /// Interrupt Request Register.
    irr: u8,
    /// Interrupt Mask Register.
    imr: u8,
    /// In-Service Register.
    isr: u8,
    /// Highest priority line, for priority rotation.
    priority_add: u8,
    /// Interrupt vector base from ICW2, always 8-byte aligned.
    vector_base: u8,
    /// OCW3 selection: command-port reads return ISR instead of IRR.
    read_isr: bool,
    init_state: PicInitState,
    single_mode: bool,
    use_icw4: bool,
    auto_eoi: bool,
}

impl PicState {
    fn new(vector_base: u8) -> PicState {
        PicState {
            last_irr: 0,
            irr: 0,
            imr: 0,
            isr: 0,
            priority_add: 0,
            vector_base,
            read_isr: false,
            init_state: PicInitState::Icw1,
            single_mode: false,
            use_icw4: false,
            auto_eoi: false,
        }
    }

    /// Highest-priority set bit of `bits` under the rotating priority order.
    fn highest_priority_line(&self, bits: u8) -> Option<u8> {
        if bits == 0 {
            return None;
        }
        (0..8)
            .map(|i| (i + self.priority_add) & 7)
            .find(|line| bits & (1 << line) != 0)
    }

    fn pending_line(&self) -> Option<u8> {
        self.highest_priority_line(self.irr & !self.imr)
    }

    /// Moves the highest-priority pending line from IRR to ISR and returns
    /// it.
    fn acknowledge(&mut self) -> Option<u8> {
        let line = self.pending_line()?;
        self.irr &= !(1 << line);
        if !self.auto_eoi {
            self.isr |= 1 << line;
        }
        Some(line)
    }

    fn set_irq(&mut self, line: u8, level: bool) {
        let mask = 1 << line;
        if level {
            // Edge triggered: only a low to high transition latches.
            if self.last_irr & mask == 0 {
                self.irr |= mask;
                self.last_irr |= mask;
            }
        } else {
            self.last_irr &= !mask;
        }
    }

    fn reset_for_init(&mut self, command: u8) {
        self.last_irr = 0;
        self.irr = 0;
        self.imr = 0;
        self.isr = 0;
        self.priority_add = 0;
        self.read_isr = false;
        self.single_mode = command & ICW1_SINGLE_MODE != 0;
        self.use_icw4 = command & ICW1_NEED_ICW4 != 0;
        if !self.use_icw4 {
            self.auto_eoi = false;
        }
        self.init_state = PicInitState::Icw2;
    }

    fn write_command(&mut self, value: u8) {
        if value & ICW1_INIT != 0 {
            self.reset_for_init(value);
        } else if value & 0x18 == 0x08 {
            // OCW3.
            if value & OCW3_READ_REGISTER != 0 {
                self.read_isr = value & OCW3_READ_ISR != 0;
            }
        } else if value & 0x18 == 0x00 {
            // OCW2, the EOI family.
            let level = value & 0x07;
            match value & 0xe0 {
                OCW2_NON_SPECIFIC_EOI => {
                    self.end_of_interrupt(None);
                }
                OCW2_SPECIFIC_EOI => {
                    self.end_of_interrupt(Some(level));
                }
                OCW2_ROTATE_NON_SPECIFIC => {
                    if let Some(serviced) = self.end_of_interrupt(None) {
                        self.priority_add = (serviced + 1) & 7;
                    }
                }
                OCW2_ROTATE_SPECIFIC => {
                    self.end_of_interrupt(Some(level));
                    self.priority_add = (level + 1) & 7;
                }
                other => {
                    debug!("pic: ignoring OCW2 command {:#04x}", other);
                }
            }
        }
    }

    /// Clears the given in-service line, or the highest-priority one when
    /// `None`. Returns the line cleared.
    fn end_of_interrupt(&mut self, line: Option<u8>) -> Option<u8> {
        let line = match line {
            Some(line) => line,
            None => self.highest_priority_line(self.isr)?,
        };
        self.isr &= !(1 << line);
        Some(line)
    }

    fn write_data(&mut self, value: u8) {
        match self.init_state {
            PicInitState::Icw1 => self.imr = value,
            PicInitState::Icw2 => {
                self.vector_base = value & 0xf8;
                self.init_state = if self.single_mode {
                    self.next_after_icw3()
                } else {
                    PicInitState::Icw3
                };
            }
            PicInitState::Icw3 => {
                // Cascade wiring is fixed in this machine; accept and move
                // on.
                self.init_state = self.next_after_icw3();
            }
            PicInitState::Icw4 => {
                self.auto_eoi = value & ICW4_AUTO_EOI != 0;
                self.init_state = PicInitState::Icw1;
            }
        }
    }

    fn next_after_icw3(&self) -> PicInitState {
        if self.use_icw4 {
            PicInitState::Icw4
        } else {
            PicInitState::Icw1
        }
    }

    fn read_command(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }
}

/// The cascaded interrupt controller pair.
pub struct Pic {
    pics: [PicState; 2],
}

impl Default for Pic {
    fn default() -> Self {
        Pic::new()
    }
}

impl Pic {
    pub fn new() -> Pic {
        Pic {
            pics: [
                PicState::new(PRIMARY_VECTOR_BASE),
                PicState::new(SECONDARY_VECTOR_BASE),
            ],
        }
    }

    /// Drives IRQ line `irq` (0-15) to `level`.
    ///
    /// Rising edges latch a request; falling edges only release the edge
    /// detector. Out-of-range lines are masked into range.
    pub fn service_irq(&mut self, irq: u8, level: bool) {
        let irq = irq & 0x0f;
        let chip = if irq < 8 {
            PicSelect::Primary
        } else {
            PicSelect::Secondary
        };
        self.pics[chip as usize].set_irq(irq & 7, level);
        self.update_cascade();
    }

    /// Propagates the secondary chip's pending state onto the primary's
    /// cascade line.
    ///
    /// The line is pulsed low first so that a request left pending on the
    /// secondary re-latches the cascade even after the previous edge was
    /// acknowledged.
    fn update_cascade(&mut self) {
        let pending = self.pics[PicSelect::Secondary as usize]
            .pending_line()
            .is_some();
        let primary = &mut self.pics[PicSelect::Primary as usize];
        primary.set_irq(CASCADE_LINE, false);
        if pending {
            primary.set_irq(CASCADE_LINE, true);
        }
    }

    /// True if an unmasked request is waiting for delivery.
    pub fn interrupt_requested(&self) -> bool {
        self.pics[PicSelect::Primary as usize].pending_line().is_some()
    }

    /// Acknowledges the highest-priority pending request and returns its
    /// vector, following the cascade if line 2 won arbitration.
    pub fn get_external_interrupt(&mut self) -> Option<u8> {
        let primary_line = self.pics[PicSelect::Primary as usize].acknowledge()?;
        let vector = if primary_line == CASCADE_LINE {
            let secondary = &mut self.pics[PicSelect::Secondary as usize];
            match secondary.acknowledge() {
                Some(line) => secondary.vector_base + line,
                // Spurious cascade: the secondary answers with its line 7.
                None => secondary.vector_base + 7,
            }
        } else {
            self.pics[PicSelect::Primary as usize].vector_base + primary_line
        };
        self.update_cascade();
        Some(vector)
    }

    /// Delivers a pending vector to `vcpu` if it can take one.
    ///
    /// The acknowledge and the hypervisor request are adjacent: no other
    /// device state changes in between.
    pub fn inject_interrupts(&mut self, vcpu: &dyn Vcpu) -> hypervisor::Result<()> {
        if !self.interrupt_requested() || !vcpu.ready_for_interrupt() {
            return Ok(());
        }
        if let Some(vector) = self.get_external_interrupt() {
            vcpu.interrupt(vector)?;
        }
        Ok(())
    }

    fn select_chip(address: u16) -> PicSelect {
        if address & 0x80 != 0 {
            PicSelect::Secondary
        } else {
            PicSelect::Primary
        }
    }

    #[cfg(test)]
    fn state(&self, select: PicSelect) -> &PicState {
        &self.pics[select as usize]
    }
}

impl BusDevice for Pic {
    fn debug_label(&self) -> String {
        "userspace PIC".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            warn!("pic: unsupported read length {}", data.len());
            return;
        }
        let chip = &self.pics[Self::select_chip(info.address) as usize];
        data[0] = if info.address & 1 == 0 {
            chip.read_command()
        } else {
            chip.imr
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            warn!("pic: unsupported write length {}", data.len());
            return;
        }
        let chip = &mut self.pics[Self::select_chip(info.address) as usize];
        if info.address & 1 == 0 {
            chip.write_command(data[0]);
        } else {
            chip.write_data(data[0]);
        }
        self.update_cascade();
    }
}
