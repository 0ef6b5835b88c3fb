// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Processor state shared by every x64 exit: where the intercepted
/// instruction lives and how long it is, so the handler can advance RIP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VpContext {
    pub rip: u64,
    pub instruction_length: u8,
}

impl VpContext {
    /// The address of the instruction following the intercepted one.
    pub fn next_rip(&self) -> u64 {
        self.rip + u64::from(self.instruction_length)
    }
}

/// A port I/O access intercepted by the hypervisor.
///
/// `rax` carries the full 64-bit register: for OUT the value to write is in
/// its low `access_size` bytes, for IN the handler must merge the device's
/// reply into those bytes and preserve the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoPortAccess {
    pub port: u16,
    /// Access width in bytes: 1, 2 or 4.
    pub access_size: u8,
    pub is_write: bool,
    pub rax: u64,
}

/// Reasons why a vcpu stopped running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuExit {
    /// An IN or OUT instruction was intercepted.
    IoPortAccess { context: VpContext, io: IoPortAccess },
    /// The guest executed HLT.
    Hlt { context: VpContext },
    /// The guest can accept an interrupt.
    IrqWindowOpen,
    /// The run was cancelled from outside the guest.
    Canceled,
    /// An exit reason this machine does not handle.
    Unknown(u32),
}

/// State of a VCPU's general purpose registers.
#[derive(Clone, Copy, Debug)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl Default for Regs {
    fn default() -> Self {
        Regs {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rsp: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0xfff0, // Reset vector.
            rflags: 0x2, // Bit 1 (0x2) is always 1.
        }
    }
}

/// State of a memory segment.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

impl Segment {
    /// Packs the descriptor attribute bits the way hypervisor register
    /// interfaces expect them (type in bits 3:0, S, DPL, P, AVL, L, D/B, G).
    pub fn attributes(&self) -> u16 {
        u16::from(self.type_ & 0xf)
            | u16::from(self.s & 1) << 4
            | u16::from(self.dpl & 3) << 5
            | u16::from(self.present & 1) << 7
            | u16::from(self.avl & 1) << 12
            | u16::from(self.l & 1) << 13
            | u16::from(self.db & 1) << 14
            | u16::from(self.g & 1) << 15
    }
}

/// State of a VCPU's segment registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_rip_adds_instruction_length() {
        let context = VpContext {
            rip: 0xFFF0,
            instruction_length: 2,
        };
        assert_eq!(context.next_rip(), 0xFFF2);
    }

    #[test]
    fn segment_attribute_packing() {
        // 16-bit real-mode code segment: present, code, readable, accessed.
        let code = Segment {
            type_: 0x0b,
            present: 1,
            s: 1,
            ..Default::default()
        };
        assert_eq!(code.attributes(), 0x009b);

        // 16-bit real-mode data segment: present, data, writable, accessed.
        let data = Segment {
            type_: 0x03,
            present: 1,
            s: 1,
            ..Default::default()
        };
        assert_eq!(data.attributes(), 0x0093);
    }
}
