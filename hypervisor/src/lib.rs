// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hypervisor abstraction for the PC/XT machine.
//!
//! The device model never talks to the platform hypervisor directly; it runs
//! against the small [`Vm`]/[`Vcpu`] traits defined here. Exits are shaped
//! like the raw platform exit context (port, access size, RAX, RIP,
//! instruction length) because the dispatcher is responsible for merging the
//! device's reply into RAX and advancing RIP. The hypervisor does not
//! emulate IN/OUT on our behalf.

mod x86_64;

#[cfg(windows)]
pub mod whpx;

use remain::sorted;
use thiserror::Error;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

pub use x86_64::IoPortAccess;
pub use x86_64::Regs;
pub use x86_64::Segment;
pub use x86_64::Sregs;
pub use x86_64::VcpuExit;
pub use x86_64::VpContext;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    /// The host has no usable hardware hypervisor.
    #[error("hypervisor is not present on this host")]
    NotPresent,
    /// A platform hypervisor call failed.
    #[error("{op} failed with hypervisor status {status:#010x}")]
    PlatformCall { op: &'static str, status: i64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A created and configured guest partition.
pub trait Vm {
    /// Maps `mem` into the guest physical address space at `addr` with
    /// read/write/execute access. The same memory may be mapped at several
    /// guest addresses to model aliasing.
    fn add_memory_region(&mut self, addr: GuestAddress, mem: &GuestMemory) -> Result<()>;

    /// Creates the single virtual processor of this machine.
    fn create_vcpu(&self) -> Result<Box<dyn Vcpu>>;
}

/// A single virtual processor.
pub trait Vcpu {
    /// Runs the vcpu until its next exit.
    fn run(&mut self) -> Result<VcpuExit>;

    /// True if a fixed interrupt can be accepted right now.
    fn ready_for_interrupt(&self) -> bool;

    /// Requests delivery of `vector` as a fixed, edge-triggered interrupt to
    /// this vcpu.
    fn interrupt(&self, vector: u8) -> Result<()>;

    /// Completes a handled exit: sets the next RIP and, for IN accesses, the
    /// merged RAX value.
    fn complete_io(&mut self, rip: u64, rax: Option<u64>) -> Result<()>;

    /// Sets the general purpose registers.
    fn set_regs(&self, regs: &Regs) -> Result<()>;

    /// Sets the segment registers.
    fn set_sregs(&self, sregs: &Sregs) -> Result<()>;
}
