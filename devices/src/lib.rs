// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates the fixed PC/XT chipset.
//!
//! Every device is a small state machine driven by byte-wide register reads
//! and writes delivered over the port I/O [`Bus`]. The models are close
//! enough to the real chips to carry an unmodified 8088-era BIOS through
//! POST: latch and flip-flop read sequencing, initialization command
//! sequences, priority and EOI handling, and free-running down-counters
//! sampled at arbitrary host times.

mod bus;
mod dma;
mod fdc;
mod irq_line;
mod pic;
mod pit;
mod platform;
mod ppi;

pub use self::bus::Bus;
pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::Error as BusError;
pub use self::dma::Dma;
pub use self::fdc::Fdc;
pub use self::irq_line::IrqLine;
pub use self::pic::Pic;
pub use self::pic::PicSelect;
pub use self::pic::PIC_PRIMARY_COMMAND;
pub use self::pic::PIC_PRIMARY_DATA;
pub use self::pic::PIC_SECONDARY_COMMAND;
pub use self::pic::PIC_SECONDARY_DATA;
pub use self::pit::Pit;
pub use self::platform::CgaMisc;
pub use self::platform::NmiMask;
pub use self::platform::PostCard;
pub use self::ppi::Ppi;

/// IRQ line of the PIT's channel 0 output.
pub const PIT_CHANNEL0_IRQ: u8 = 0;
/// IRQ line of the floppy disk controller.
pub const FDC_IRQ: u8 = 6;
