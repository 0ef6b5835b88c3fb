// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VM construction and the single-threaded run loop.
//!
//! Each iteration resumes the vcpu, services exactly one exit to completion
//! (register merge and RIP advance included), then ticks the PIT and
//! attempts PIC injection. The whole machine is cooperative: no device
//! state changes between an acknowledge and its hypervisor interrupt
//! request.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use base::debug;
use base::info;
use base::warn;
use base::Clock;
use devices::Bus;
use devices::CgaMisc;
use devices::Dma;
use devices::Fdc;
use devices::IrqLine;
use devices::NmiMask;
use devices::Pic;
use devices::Pit;
use devices::PostCard;
use devices::Ppi;
use devices::FDC_IRQ;
use devices::PIT_CHANNEL0_IRQ;
use hypervisor::IoPortAccess;
use hypervisor::Vcpu;
use hypervisor::VcpuExit;
#[cfg(windows)]
use hypervisor::Vm;
use sync::Mutex;
#[cfg(windows)]
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;

/// The firmware image used when none is named on the command line.
pub const DEFAULT_BIOS: &str = "ami_8088_bios_31jan89.bin";
/// Fallback firmware probed when the default image is missing.
const FALLBACK_BIOS: &str = "ivt.fw";

/// Consecutive polls of one unknown port, with no progress in between,
/// after which the guest is declared wedged.
const MAX_UNKNOWN_PORT_POLLS: u32 = 16;

/// Brief pause after HLT so a halted guest does not spin the host.
const HALT_YIELD: Duration = Duration::from_micros(100);

pub struct Config {
    pub program: Option<PathBuf>,
    pub bios: PathBuf,
    pub floppy: Option<PathBuf>,
    pub ram_kib: u32,
}

/// The device complement of the machine, owned by the run loop.
struct PlatformDevices {
    bus: Bus,
    pic: Arc<Mutex<Pic>>,
    pit: Arc<Mutex<Pit>>,
}

pub fn run_config(cfg: Config) -> Result<()> {
    let mem =
        GuestMemory::new(x86_64::GUEST_MEM_SIZE).context("failed to allocate guest memory")?;
    load_firmware(&mem, &cfg)?;
    if let Some(program) = &cfg.program {
        match x86_64::load_program(&mem, program) {
            Ok(len) => info!("loaded program {} ({} bytes)", program.display(), len),
            Err(e) => warn!("failed to load program {}: {}", program.display(), e),
        }
    }

    let (_vm, mut vcpu) =
        create_vm(&mem).context("failed to create the virtual machine")?;
    let devices = build_devices(&mem, &cfg)?;
    // No renderer is attached in this build; a video layer would pass its
    // refresh callback here and read the CGA window out of guest memory.
    run_loop(vcpu.as_mut(), &devices, None)
}

fn load_firmware(mem: &GuestMemory, cfg: &Config) -> Result<()> {
    match x86_64::load_bios(mem, &cfg.bios) {
        Ok(_) => Ok(()),
        Err(x86_64::Error::OpenFirmware(_))
            if cfg.bios.as_os_str() == DEFAULT_BIOS && Path::new(FALLBACK_BIOS).exists() =>
        {
            warn!(
                "default BIOS {} is missing; falling back to {}",
                DEFAULT_BIOS, FALLBACK_BIOS
            );
            x86_64::load_bios(mem, Path::new(FALLBACK_BIOS))
                .context("failed to load fallback BIOS")?;
            Ok(())
        }
        Err(e) => Err(e).context("failed to load BIOS"),
    }
}

#[cfg(windows)]
fn create_vm(mem: &GuestMemory) -> hypervisor::Result<(Box<dyn Vm>, Box<dyn Vcpu>)> {
    let mut vm = hypervisor::whpx::WhpxVm::new()?;
    vm.add_memory_region(GuestAddress(0), mem)?;
    // Alias the first megabyte at +1 MiB so real-mode address arithmetic
    // wraps like a 20-bit address bus.
    vm.add_memory_region(GuestAddress(x86_64::GUEST_MEM_SIZE), mem)?;
    let vcpu = vm.create_vcpu()?;
    let (regs, sregs) = x86_64::vcpu_init();
    vcpu.set_regs(&regs)?;
    vcpu.set_sregs(&sregs)?;
    Ok((Box::new(vm), vcpu))
}

#[cfg(not(windows))]
fn create_vm(_mem: &GuestMemory) -> hypervisor::Result<(Box<()>, Box<dyn Vcpu>)> {
    Err(hypervisor::Error::NotPresent)
}

fn build_devices(mem: &GuestMemory, cfg: &Config) -> Result<PlatformDevices> {
    let pic = Arc::new(Mutex::new(Pic::new()));
    let clock = Arc::new(Mutex::new(Clock::new()));
    let pit = Arc::new(Mutex::new(Pit::new(
        IrqLine::new(pic.clone(), PIT_CHANNEL0_IRQ),
        clock,
    )));
    let dma = Arc::new(Mutex::new(Dma::new()));
    let fdc = Arc::new(Mutex::new(Fdc::new(
        mem.clone(),
        dma.clone(),
        IrqLine::new(pic.clone(), FDC_IRQ),
    )));
    if let Some(floppy) = &cfg.floppy {
        match std::fs::read(floppy) {
            Ok(image) => fdc.lock().insert_disk(image),
            Err(e) => warn!("failed to read floppy image {}: {}", floppy.display(), e),
        }
    }
    let ppi = Arc::new(Mutex::new(Ppi::new(pit.clone(), cfg.ram_kib)));
    let nmi = Arc::new(Mutex::new(NmiMask::new()));
    let post = Arc::new(Mutex::new(PostCard::new()));
    let cga = Arc::new(Mutex::new(CgaMisc::new()));

    let mut bus = Bus::new();
    bus.insert(dma.clone(), 0x00, 0x10)
        .context("failed to insert DMA registers")?;
    bus.insert(pic.clone(), devices::PIC_PRIMARY_COMMAND, 0x2)
        .context("failed to insert primary PIC")?;
    bus.insert(pit.clone(), 0x40, 0x4)
        .context("failed to insert PIT")?;
    bus.insert(ppi, 0x61, 0x3).context("failed to insert PPI")?;
    bus.insert(nmi, 0x70, 0x1)
        .context("failed to insert NMI mask")?;
    bus.insert(post, 0x80, 0x1)
        .context("failed to insert POST port")?;
    bus.insert(dma, 0x81, 0xf)
        .context("failed to insert DMA page registers")?;
    bus.insert(pic.clone(), devices::PIC_SECONDARY_COMMAND, 0x2)
        .context("failed to insert secondary PIC")?;
    bus.insert(cga.clone(), 0x3b8, 0x1)
        .context("failed to insert MDA mode register")?;
    bus.insert(cga.clone(), 0x3d8, 0x1)
        .context("failed to insert CGA mode register")?;
    bus.insert(cga, 0x3da, 0x1)
        .context("failed to insert CGA status register")?;
    bus.insert(fdc, 0x3f0, 0x8)
        .context("failed to insert FDC")?;

    Ok(PlatformDevices { bus, pic, pit })
}

/// Aborts the run loop when the guest polls a single unimplemented port
/// without making any other progress.
struct StallGuard {
    port: u16,
    strikes: u32,
}

impl StallGuard {
    fn new() -> StallGuard {
        StallGuard { port: 0, strikes: 0 }
    }

    /// Records an access to an unknown port; true means the guest is
    /// wedged.
    fn unknown_access(&mut self, port: u16) -> bool {
        if self.strikes > 0 && self.port == port {
            self.strikes += 1;
        } else {
            self.port = port;
            self.strikes = 1;
        }
        self.strikes >= MAX_UNKNOWN_PORT_POLLS
    }

    fn progress(&mut self) {
        self.strikes = 0;
    }
}

/// Merges a device reply into the low `access_size` bytes of RAX,
/// preserving everything above the accessed width.
fn merge_rax(prev: u64, value: u64, access_size: u8) -> u64 {
    let mask: u64 = match access_size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    };
    (prev & !mask) | (value & mask)
}

/// Routes one intercepted port access. Devices see byte-wide accesses only;
/// a wider read is the device byte zero-extended before the merge. Unknown
/// ports read as zero.
///
/// Returns whether a device claimed the port and, for reads, the merged
/// RAX value to write back.
fn dispatch_io(bus: &Bus, io: &IoPortAccess) -> (bool, Option<u64>) {
    let mut data = [0u8];
    if io.is_write {
        data[0] = io.rax as u8;
        let known = bus.write(io.port, &data);
        debug!(
            "OUT {:#06x} <- {:#04x}{}",
            io.port,
            data[0],
            if known { "" } else { " (unhandled)" }
        );
        (known, None)
    } else {
        let known = bus.read(io.port, &mut data);
        let value = if known { u64::from(data[0]) } else { 0 };
        debug!(
            "IN  {:#06x} -> {:#04x}{}",
            io.port,
            value,
            if known { "" } else { " (unhandled)" }
        );
        (known, Some(merge_rax(io.rax, value, io.access_size)))
    }
}

fn run_loop(
    vcpu: &mut dyn Vcpu,
    devices: &PlatformDevices,
    mut video_refresh: Option<Box<dyn FnMut()>>,
) -> Result<()> {
    let mut stall = StallGuard::new();
    loop {
        let exit = vcpu.run().context("failed to run the vcpu")?;
        match exit {
            VcpuExit::IoPortAccess { context, io } => {
                let (known, rax) = dispatch_io(&devices.bus, &io);
                if known {
                    stall.progress();
                } else if stall.unknown_access(io.port) {
                    bail!("guest wedged polling unknown port {:#06x}", io.port);
                }
                vcpu.complete_io(context.next_rip(), rax)
                    .context("failed to write back I/O registers")?;
            }
            VcpuExit::Hlt { context } => {
                vcpu.complete_io(context.next_rip(), None)
                    .context("failed to advance past HLT")?;
                std::thread::sleep(HALT_YIELD);
            }
            VcpuExit::IrqWindowOpen => {
                // The guest just became able to take an interrupt; deliver
                // and resume without touching anything else.
                devices
                    .pic
                    .lock()
                    .inject_interrupts(&*vcpu)
                    .context("failed to inject interrupt")?;
                continue;
            }
            VcpuExit::Canceled => return Ok(()),
            VcpuExit::Unknown(reason) => bail!("unhandled vcpu exit reason {}", reason),
        }
        devices.pit.lock().tick();
        devices
            .pic
            .lock()
            .inject_interrupts(&*vcpu)
            .context("failed to inject interrupt")?;
        if let Some(refresh) = video_refresh.as_mut() {
            refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use hypervisor::VpContext;

    use super::*;

    struct FakeVcpu {
        exits: VecDeque<VcpuExit>,
        completions: Vec<(u64, Option<u64>)>,
        interrupts: RefCell<Vec<u8>>,
    }

    impl FakeVcpu {
        fn new(exits: Vec<VcpuExit>) -> FakeVcpu {
            FakeVcpu {
                exits: exits.into(),
                completions: Vec::new(),
                interrupts: RefCell::new(Vec::new()),
            }
        }
    }

    impl Vcpu for FakeVcpu {
        fn run(&mut self) -> hypervisor::Result<VcpuExit> {
            Ok(self.exits.pop_front().unwrap_or(VcpuExit::Canceled))
        }

        fn ready_for_interrupt(&self) -> bool {
            true
        }

        fn interrupt(&self, vector: u8) -> hypervisor::Result<()> {
            self.interrupts.borrow_mut().push(vector);
            Ok(())
        }

        fn complete_io(&mut self, rip: u64, rax: Option<u64>) -> hypervisor::Result<()> {
            self.completions.push((rip, rax));
            Ok(())
        }

        fn set_regs(&self, _regs: &hypervisor::Regs) -> hypervisor::Result<()> {
            Ok(())
        }

        fn set_sregs(&self, _sregs: &hypervisor::Sregs) -> hypervisor::Result<()> {
            Ok(())
        }
    }

    fn test_devices() -> PlatformDevices {
        let mem = GuestMemory::new(x86_64::GUEST_MEM_SIZE).unwrap();
        let cfg = Config {
            program: None,
            bios: PathBuf::from(DEFAULT_BIOS),
            floppy: None,
            ram_kib: 640,
        };
        build_devices(&mem, &cfg).unwrap()
    }

    fn io_exit(port: u16, is_write: bool, rax: u64, access_size: u8, rip: u64) -> VcpuExit {
        VcpuExit::IoPortAccess {
            context: VpContext {
                rip,
                instruction_length: 2,
            },
            io: IoPortAccess {
                port,
                access_size,
                is_write,
                rax,
            },
        }
    }

    /// Register merge for each access width, with upper bits preserved.
    #[test]
    fn rax_merge_widths() {
        assert_eq!(
            merge_rax(0xdead_beef_cafe_babe, 0x12, 1),
            0xdead_beef_cafe_ba12
        );
        assert_eq!(
            merge_rax(0xdead_beef_cafe_babe, 0x12, 2),
            0xdead_beef_cafe_0012
        );
        assert_eq!(
            merge_rax(0xdead_beef_cafe_babe, 0x12, 4),
            0xdead_beef_0000_0012
        );
    }

    /// A write then a read of the PIC mask register flows through dispatch
    /// with a width-correct merge and advanced RIP.
    #[test]
    fn dispatch_round_trip() {
        let devices = test_devices();
        let mut vcpu = FakeVcpu::new(vec![
            io_exit(0x21, true, 0xfd, 1, 0x1000),
            io_exit(0x21, false, 0xdead_beef_cafe_babe, 1, 0x1002),
        ]);
        run_loop(&mut vcpu, &devices, None).unwrap();

        assert_eq!(vcpu.completions.len(), 2);
        assert_eq!(vcpu.completions[0], (0x1002, None));
        assert_eq!(vcpu.completions[1], (0x1004, Some(0xdead_beef_cafe_bafd)));
    }

    /// Unknown ports read as zero within the accessed width.
    #[test]
    fn unknown_port_reads_zero() {
        let devices = test_devices();
        let mut vcpu = FakeVcpu::new(vec![io_exit(0x260, false, 0x1122_3344, 2, 0)]);
        run_loop(&mut vcpu, &devices, None).unwrap();
        assert_eq!(vcpu.completions[0], (2, Some(0x1122_0000)));
    }

    /// Sixteen consecutive polls of one unknown port abort the loop.
    #[test]
    fn stall_guard_aborts() {
        let devices = test_devices();
        let exits = (0..16).map(|i| io_exit(0x260, false, 0, 1, i * 2)).collect();
        let mut vcpu = FakeVcpu::new(exits);
        assert!(run_loop(&mut vcpu, &devices, None).is_err());
        assert_eq!(vcpu.completions.len(), 15);
    }

    /// Progress on a known port resets the stall counter.
    #[test]
    fn stall_guard_resets_on_progress() {
        let devices = test_devices();
        let mut exits: Vec<VcpuExit> = (0..15).map(|i| io_exit(0x260, false, 0, 1, i * 2)).collect();
        exits.push(io_exit(0x21, false, 0, 1, 0x100));
        exits.extend((0..15).map(|i| io_exit(0x260, false, 0, 1, i * 2)));
        let mut vcpu = FakeVcpu::new(exits);
        run_loop(&mut vcpu, &devices, None).unwrap();
    }

    /// A different unknown port also resets the counter.
    #[test]
    fn stall_guard_tracks_single_port() {
        let devices = test_devices();
        let mut exits: Vec<VcpuExit> = (0..15).map(|i| io_exit(0x260, false, 0, 1, i * 2)).collect();
        exits.push(io_exit(0x261, false, 0, 1, 0));
        exits.extend((0..14).map(|i| io_exit(0x260, false, 0, 1, i * 2)));
        let mut vcpu = FakeVcpu::new(exits);
        run_loop(&mut vcpu, &devices, None).unwrap();
    }

    /// A pending PIC line is delivered after an exit, and an
    /// interrupt-window exit only injects.
    #[test]
    fn pending_interrupt_is_injected() {
        let devices = test_devices();
        devices.pic.lock().service_irq(3, true);
        let mut vcpu = FakeVcpu::new(vec![
            // Mask IRQ 0 so a coincidental timer tick cannot interfere.
            io_exit(0x21, true, 0x01, 1, 0),
            VcpuExit::IrqWindowOpen,
        ]);
        run_loop(&mut vcpu, &devices, None).unwrap();
        assert_eq!(*vcpu.interrupts.borrow(), vec![0x08 + 3]);
    }

    /// HLT advances RIP past the instruction with no RAX write-back.
    #[test]
    fn halt_advances_rip() {
        let devices = test_devices();
        let mut vcpu = FakeVcpu::new(vec![VcpuExit::Hlt {
            context: VpContext {
                rip: 0xf_e05b,
                instruction_length: 1,
            },
        }]);
        run_loop(&mut vcpu, &devices, None).unwrap();
        assert_eq!(vcpu.completions, vec![(0xf_e05c, None)]);
    }
}
