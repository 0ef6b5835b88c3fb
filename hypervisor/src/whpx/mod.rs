// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Windows Hypervisor Platform backend.
//!
//! One partition, one virtual processor. Guest memory is mapped twice: at
//! physical zero and again at +1 MiB so real-mode segment arithmetic that
//! crosses the top of memory wraps the way an 8088 with 20 address lines
//! would.

use std::ffi::c_void;
use std::mem::size_of;

use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use windows::Win32::System::Hypervisor::*;

use crate::Error;
use crate::IoPortAccess;
use crate::Regs;
use crate::Result;
use crate::Segment;
use crate::Sregs;
use crate::Vcpu;
use crate::VcpuExit;
use crate::Vm;
use crate::VpContext;

fn platform_err(op: &'static str, e: windows::core::Error) -> Error {
    Error::PlatformCall {
        op,
        status: e.code().0 as i64,
    }
}

/// Entry point for the Windows Hypervisor Platform.
pub struct Whpx;

impl Whpx {
    /// True if the hypervisor is present and usable.
    pub fn is_enabled() -> bool {
        let mut present: i32 = 0;
        let mut written: u32 = 0;
        // SAFETY: the buffer outlives the call and its size is passed.
        let res = unsafe {
            WHvGetCapability(
                WHvCapabilityCodeHypervisorPresent,
                &mut present as *mut i32 as *mut c_void,
                size_of::<i32>() as u32,
                &mut written,
            )
        };
        res.is_ok() && present != 0
    }
}

/// A WHPX partition configured for a single processor.
pub struct WhpxVm {
    partition: WHV_PARTITION_HANDLE,
}

impl WhpxVm {
    pub fn new() -> Result<WhpxVm> {
        if !Whpx::is_enabled() {
            return Err(Error::NotPresent);
        }
        // SAFETY: the handle is owned by the returned WhpxVm and deleted on
        // drop.
        let partition =
            unsafe { WHvCreatePartition() }.map_err(|e| platform_err("WHvCreatePartition", e))?;

        // SAFETY: zero-initialized property unions are valid for every
        // property code.
        let mut prop: WHV_PARTITION_PROPERTY = unsafe { std::mem::zeroed() };
        prop.ProcessorCount = 1;
        // SAFETY: the property buffer outlives the call and its size is
        // passed.
        unsafe {
            WHvSetPartitionProperty(
                partition,
                WHvPartitionPropertyCodeProcessorCount,
                &prop as *const WHV_PARTITION_PROPERTY as *const c_void,
                size_of::<WHV_PARTITION_PROPERTY>() as u32,
            )
        }
        .map_err(|e| platform_err("WHvSetPartitionProperty", e))?;

        // SAFETY: the partition handle is valid and properties are set.
        unsafe { WHvSetupPartition(partition) }
            .map_err(|e| platform_err("WHvSetupPartition", e))?;

        Ok(WhpxVm { partition })
    }
}

impl Vm for WhpxVm {
    fn add_memory_region(&mut self, addr: GuestAddress, mem: &GuestMemory) -> Result<()> {
        // SAFETY: the host range belongs to `mem`, which the caller keeps
        // alive for the lifetime of the partition.
        unsafe {
            WHvMapGpaRange(
                self.partition,
                mem.as_ptr() as *const c_void,
                addr.offset(),
                mem.memory_size(),
                WHvMapGpaRangeFlagRead | WHvMapGpaRangeFlagWrite | WHvMapGpaRangeFlagExecute,
            )
        }
        .map_err(|e| platform_err("WHvMapGpaRange", e))
    }

    fn create_vcpu(&self) -> Result<Box<dyn Vcpu>> {
        // SAFETY: the partition is set up and vp index 0 is unused.
        unsafe { WHvCreateVirtualProcessor(self.partition, 0, 0) }
            .map_err(|e| platform_err("WHvCreateVirtualProcessor", e))?;
        Ok(Box::new(WhpxVcpu {
            partition: self.partition,
            index: 0,
        }))
    }
}

impl Drop for WhpxVm {
    fn drop(&mut self) {
        // SAFETY: the handle was created by WHvCreatePartition and is not
        // used after this point.
        unsafe {
            WHvDeleteVirtualProcessor(self.partition, 0).ok();
            WHvDeletePartition(self.partition).ok();
        }
    }
}

/// The machine's only virtual processor.
pub struct WhpxVcpu {
    partition: WHV_PARTITION_HANDLE,
    index: u32,
}

impl WhpxVcpu {
    fn set_registers(&self, names: &[WHV_REGISTER_NAME], values: &[WHV_REGISTER_VALUE]) -> Result<()> {
        debug_assert_eq!(names.len(), values.len());
        // SAFETY: both slices outlive the call and their length is passed.
        unsafe {
            WHvSetVirtualProcessorRegisters(
                self.partition,
                self.index,
                names.as_ptr(),
                names.len() as u32,
                values.as_ptr(),
            )
        }
        .map_err(|e| platform_err("WHvSetVirtualProcessorRegisters", e))
    }
}

fn reg64(value: u64) -> WHV_REGISTER_VALUE {
    // SAFETY: zero-initialized register values are valid for every register.
    let mut reg: WHV_REGISTER_VALUE = unsafe { std::mem::zeroed() };
    reg.Reg64 = value;
    reg
}

fn segment_reg(segment: &Segment) -> WHV_REGISTER_VALUE {
    // SAFETY: zero-initialized register values are valid for every register.
    let mut reg: WHV_REGISTER_VALUE = unsafe { std::mem::zeroed() };
    reg.Segment.Base = segment.base;
    reg.Segment.Limit = segment.limit;
    reg.Segment.Selector = segment.selector;
    reg.Segment.Anonymous.Attributes = segment.attributes();
    reg
}

impl Vcpu for WhpxVcpu {
    fn run(&mut self) -> Result<VcpuExit> {
        // SAFETY: zero-initialized exit contexts are valid out-buffers.
        let mut exit: WHV_RUN_VP_EXIT_CONTEXT = unsafe { std::mem::zeroed() };
        // SAFETY: the context buffer outlives the call and its size is
        // passed.
        unsafe {
            WHvRunVirtualProcessor(
                self.partition,
                self.index,
                &mut exit as *mut WHV_RUN_VP_EXIT_CONTEXT as *mut c_void,
                size_of::<WHV_RUN_VP_EXIT_CONTEXT>() as u32,
            )
        }
        .map_err(|e| platform_err("WHvRunVirtualProcessor", e))?;

        let context = VpContext {
            rip: exit.VpContext.Rip,
            instruction_length: exit.VpContext._bitfield & 0x0f,
        };
        Ok(match exit.ExitReason {
            WHvRunVpExitReasonX64IoPortAccess => {
                // SAFETY: the union arm matches the exit reason.
                let io = unsafe { &exit.Anonymous.IoPortAccess };
                // SAFETY: AccessInfo is a plain bitfield in every arm.
                let access_info = unsafe { io.AccessInfo.AsUINT32 };
                VcpuExit::IoPortAccess {
                    context,
                    io: IoPortAccess {
                        port: io.PortNumber,
                        access_size: ((access_info >> 1) & 0x7) as u8,
                        is_write: access_info & 1 != 0,
                        rax: io.Rax,
                    },
                }
            }
            WHvRunVpExitReasonX64Halt => VcpuExit::Hlt { context },
            WHvRunVpExitReasonX64InterruptWindow => VcpuExit::IrqWindowOpen,
            WHvRunVpExitReasonCanceled => VcpuExit::Canceled,
            reason => VcpuExit::Unknown(reason.0 as u32),
        })
    }

    fn ready_for_interrupt(&self) -> bool {
        // WHvRequestInterrupt queues the interrupt for delivery when the
        // processor can take it, so injection is never refused here.
        true
    }

    fn interrupt(&self, vector: u8) -> Result<()> {
        // SAFETY: zero-initialized control means fixed type, physical
        // destination mode, edge trigger.
        let mut control: WHV_INTERRUPT_CONTROL = unsafe { std::mem::zeroed() };
        control.Destination = 0; // APIC ID 0, the only processor.
        control.Vector = u32::from(vector);
        // SAFETY: the control structure outlives the call and its size is
        // passed.
        unsafe {
            WHvRequestInterrupt(
                self.partition,
                &control,
                size_of::<WHV_INTERRUPT_CONTROL>() as u32,
            )
        }
        .map_err(|e| platform_err("WHvRequestInterrupt", e))
    }

    fn complete_io(&mut self, rip: u64, rax: Option<u64>) -> Result<()> {
        let mut names = vec![WHvX64RegisterRip];
        let mut values = vec![reg64(rip)];
        if let Some(rax) = rax {
            names.push(WHvX64RegisterRax);
            values.push(reg64(rax));
        }
        self.set_registers(&names, &values)
    }

    fn set_regs(&self, regs: &Regs) -> Result<()> {
        let names = [
            WHvX64RegisterRax,
            WHvX64RegisterRbx,
            WHvX64RegisterRcx,
            WHvX64RegisterRdx,
            WHvX64RegisterRsi,
            WHvX64RegisterRdi,
            WHvX64RegisterRsp,
            WHvX64RegisterRbp,
            WHvX64RegisterRip,
            WHvX64RegisterRflags,
        ];
        let values = [
            reg64(regs.rax),
            reg64(regs.rbx),
            reg64(regs.rcx),
            reg64(regs.rdx),
            reg64(regs.rsi),
            reg64(regs.rdi),
            reg64(regs.rsp),
            reg64(regs.rbp),
            reg64(regs.rip),
            reg64(regs.rflags),
        ];
        self.set_registers(&names, &values)
    }

    fn set_sregs(&self, sregs: &Sregs) -> Result<()> {
        let names = [
            WHvX64RegisterCs,
            WHvX64RegisterDs,
            WHvX64RegisterEs,
            WHvX64RegisterFs,
            WHvX64RegisterGs,
            WHvX64RegisterSs,
        ];
        let values = [
            segment_reg(&sregs.cs),
            segment_reg(&sregs.ds),
            segment_reg(&sregs.es),
            segment_reg(&sregs.fs),
            segment_reg(&sregs.gs),
            segment_reg(&sregs.ss),
        ];
        self.set_registers(&names, &values)
    }
}
