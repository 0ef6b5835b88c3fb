// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software emulation of an 8253/8254 programmable interval timer.
//!
//! The three channels are free-running down-counters derived from the
//! monotonic clock rather than from a tick thread: a channel's live count is
//! computed on demand from the time its reload value was programmed. Channel
//! 0 drives IRQ 0, channel 1 exists for BIOS calibration reads, channel 2
//! feeds the speaker gate logic on the PPI.

use std::sync::Arc;

use base::debug;
use base::warn;
use sync::Mutex;

use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::irq_line::IrqLine;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        use base::FakeClock as Clock;
    } else {
        use base::Clock;
    }
}

/// The PIT reference frequency: 1.193182 MHz.
pub const FREQUENCY_HZ: u64 = 1_193_182;

const NANOS_PER_SEC: u64 = 1_000_000_000;

// Number of channels.
const NUM_CHANNELS: usize = 3;
// Register offsets from port 0x40: three data ports and the control word.
const CHANNEL0_DATA: u16 = 0;
const CHANNEL2_DATA: u16 = 2;
const CONTROL_WORD: u16 = 3;

// Control word field: a channel value of 3 selects 8254 read-back, which
// this chip does not implement.
const READ_BACK: u8 = 3;

/// Access mode of a channel, from bits 5-4 of the control word.
#[derive(enumn::N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PitRWMode {
    /// No access mode has been programmed yet.
    None = 0,
    /// Reads and writes transfer the least significant byte only.
    Least = 1,
    /// Reads and writes transfer the most significant byte only.
    Most = 2,
    /// The least significant byte is transferred first, then the most
    /// significant.
    Both = 3,
}

impl From<u8> for PitRWMode {
    fn from(item: u8) -> Self {
        PitRWMode::n(item).unwrap_or_else(|| {
            warn!("invalid PitRWMode value {}, setting to 0", item);
            PitRWMode::None
        })
    }
}

#[derive(Debug)]
struct PitChannel {
    /// Effective reload value, 1..=65536 (a programmed zero means 65536).
    reload_value: u32,
    rw_mode: PitRWMode,
    /// Operating mode from the control word; only channel 2 distinguishes
    /// mode 2 (rate generator) from mode 3 (square wave).
    mode: u8,
    /// Pair-write helper: the LSB captured while waiting for the MSB.
    write_low_byte: Option<u8>,
    /// Count sampled by a latch command, consumed LSB then MSB.
    latched_count: Option<u16>,
    /// Next-byte selector for reads; alternates on every data-port read.
    read_high_byte: bool,
    programmed: bool,
    /// Gate input; only meaningful on channel 2 where the PPI drives it.
    gate: bool,
    /// Clock timestamp of the last reload.
    count_load_time: u64,
}

impl PitChannel {
    fn new(now: u64) -> PitChannel {
        PitChannel {
            reload_value: 0x10000,
            rw_mode: PitRWMode::Both,
            mode: 3,
            write_low_byte: None,
            latched_count: None,
            read_high_byte: false,
            programmed: false,
            gate: false,
            count_load_time: now,
        }
    }

    /// Ticks elapsed since the last reload, rounded to the nearest PIT tick.
    fn elapsed_ticks(&self, now: u64) -> u64 {
        let elapsed_ns = now.saturating_sub(self.count_load_time);
        ns_to_pit_ticks(elapsed_ns)
    }

    /// The live down-counter value, in 1..=reload.
    fn live_count(&self, now: u64) -> u32 {
        let reload = u64::from(self.reload_value);
        let down = reload - (self.elapsed_ticks(now) % reload);
        down as u32
    }
}

fn ns_to_pit_ticks(ns: u64) -> u64 {
    ((u128::from(ns) * u128::from(FREQUENCY_HZ) + u128::from(NANOS_PER_SEC / 2))
        / u128::from(NANOS_PER_SEC)) as u64
}

fn pit_ticks_to_ns(ticks: u64) -> u64 {
    ((u128::from(ticks) * u128::from(NANOS_PER_SEC) + u128::from(FREQUENCY_HZ / 2))
        / u128::from(FREQUENCY_HZ)) as u64
}

/// The three-channel interval timer.
pub struct Pit {
    channels: [PitChannel; NUM_CHANNELS],
    clock: Arc<Mutex<Clock>>,
    /// IRQ 0, pulsed whenever channel 0 wraps.
    irq: IrqLine,
    /// Deadline of the next channel-0 wrap, advanced without drift.
    next_fire_ns: u64,
}

impl Pit {
    pub fn new(irq: IrqLine, clock: Arc<Mutex<Clock>>) -> Pit {
        let now = clock.lock().now_ns();
        let mut channels = [PitChannel::new(now), PitChannel::new(now), PitChannel::new(now)];
        // Channel 0 runs from power-on with the maximum reload so the first
        // BIOS read of port 0x40 observes a moving count and IRQ 0 ticks
        // from boot.
        channels[0].programmed = true;
        let next_fire_ns = now + pit_ticks_to_ns(u64::from(channels[0].reload_value));
        Pit {
            channels,
            clock,
            irq,
            next_fire_ns,
        }
    }

    fn now_ns(&self) -> u64 {
        self.clock.lock().now_ns()
    }

    /// Emits any channel-0 edges that have become due.
    ///
    /// The deadline advances by whole periods so latency in calling this
    /// never accumulates drift.
    pub fn tick(&mut self) {
        let now = self.now_ns();
        let period = pit_ticks_to_ns(u64::from(self.channels[0].reload_value));
        while now >= self.next_fire_ns {
            self.irq.pulse();
            self.next_fire_ns += period;
        }
    }

    /// Drives channel 2's gate input; a rising edge restarts the counter.
    pub fn set_channel2_gate(&mut self, gate: bool) {
        let rising = gate && !self.channels[2].gate;
        self.channels[2].gate = gate;
        if rising {
            self.channels[2].count_load_time = self.now_ns();
        }
    }

    /// Channel 2's OUT pin, surfaced on PPI port 0x61 bit 5.
    pub fn channel2_out(&self) -> bool {
        let channel = &self.channels[2];
        if !channel.programmed || !channel.gate {
            // OUT idles high while the channel is not counting.
            return true;
        }
        let reload = u64::from(channel.reload_value);
        let phase = channel.elapsed_ticks(self.now_ns()) % reload;
        if channel.mode == 3 {
            // Square wave: high for the first half of each period.
            phase < reload / 2
        } else {
            // Rate generator: one low tick at the end of each period.
            phase != reload - 1
        }
    }

    fn write_control_word(&mut self, value: u8) {
        let channel_index = (value >> 6) & 3;
        if channel_index == READ_BACK {
            debug!("pit: ignoring read-back control word {:#04x}", value);
            return;
        }
        let access = (value >> 4) & 3;
        let mode = match (value >> 1) & 7 {
            6 => 2,
            7 => 3,
            mode => mode,
        };
        let now = self.now_ns();
        let channel = &mut self.channels[channel_index as usize];
        if access == 0 {
            // Counter latch: sample the live count for a stable byte pair.
            channel.latched_count = Some(channel.live_count(now) as u16);
            channel.read_high_byte = false;
        } else {
            channel.rw_mode = PitRWMode::from(access);
            channel.mode = mode;
            channel.write_low_byte = None;
        }
    }

    fn write_counter(&mut self, index: usize, value: u8) {
        let now = self.now_ns();
        let channel = &mut self.channels[index];
        let reload = match channel.rw_mode {
            PitRWMode::None => {
                debug!("pit: dropping write to unprogrammed channel {}", index);
                return;
            }
            PitRWMode::Least => (channel.reload_value & 0xff00) | u32::from(value),
            PitRWMode::Most => (channel.reload_value & 0x00ff) | u32::from(value) << 8,
            PitRWMode::Both => match channel.write_low_byte.take() {
                None => {
                    channel.write_low_byte = Some(value);
                    return;
                }
                Some(low) => u32::from(low) | u32::from(value) << 8,
            },
        };
        // A 16-bit zero encodes the maximum count of 65536.
        channel.reload_value = if reload & 0xffff == 0 { 0x10000 } else { reload };
        channel.programmed = true;
        channel.count_load_time = now;
        channel.read_high_byte = false;
        if index == 0 {
            self.next_fire_ns = now + pit_ticks_to_ns(u64::from(self.channels[0].reload_value));
        }
    }

    fn read_counter(&mut self, index: usize) -> u8 {
        let now = self.now_ns();
        let channel = &mut self.channels[index];
        let value = match channel.latched_count {
            Some(latched) => latched,
            None => channel.live_count(now) as u16,
        };
        let byte = if channel.read_high_byte {
            (value >> 8) as u8
        } else {
            value as u8
        };
        channel.read_high_byte = !channel.read_high_byte;
        if !channel.read_high_byte {
            // Both bytes consumed; the latch releases.
            channel.latched_count = None;
        }
        byte
    }
}

impl BusDevice for Pit {
    fn debug_label(&self) -> String {
        "userspace PIT".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        if data.len() != 1 {
            warn!("pit: unsupported read length {}", data.len());
            return;
        }
        data[0] = match info.offset {
            CHANNEL0_DATA..=CHANNEL2_DATA => self.read_counter(info.offset as usize),
            // The control word is write-only.
            _ => 0,
        };
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        if data.len() != 1 {
            warn!("pit: unsupported write length {}", data.len());
            return;
        }
        match info.offset {
            CHANNEL0_DATA..=CHANNEL2_DATA => self.write_counter(info.offset as usize, data[0]),
            CONTROL_WORD => self.write_control_word(data[0]),
            offset => debug!("pit: write to unknown offset {}", offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pic::Pic;

    struct TestPit {
        pit: Pit,
        clock: Arc<Mutex<Clock>>,
        pic: Arc<Mutex<Pic>>,
    }

    fn set_up() -> TestPit {
        let clock = Arc::new(Mutex::new(Clock::new()));
        let pic = Arc::new(Mutex::new(Pic::new()));
        let pit = Pit::new(IrqLine::new(pic.clone(), 0), clock.clone());
        TestPit { pit, clock, pic }
    }

    /// Nanoseconds that round to exactly `ticks` PIT ticks.
    fn ns_for_ticks(ticks: u64) -> u64 {
        ticks * NANOS_PER_SEC / FREQUENCY_HZ + 1
    }

    fn write(pit: &mut Pit, offset: u16, value: u8) {
        pit.write(
            BusAccessInfo {
                address: 0x40 + offset,
                offset,
            },
            &[value],
        );
    }

    fn read(pit: &mut Pit, offset: u16) -> u8 {
        let mut data = [0u8];
        pit.read(
            BusAccessInfo {
                address: 0x40 + offset,
                offset,
            },
            &mut data,
        );
        data[0]
    }

    /// Channel 1 latch pair: program 0x7474 (mode 2, LSB+MSB), run 11 ticks,
    /// latch, then read LSB and MSB.
    #[test]
    fn channel1_latch_pair() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0x74);
        write(&mut pit, 1, 0x74);
        write(&mut pit, 1, 0x74);
        assert_eq!(pit.channels[1].reload_value, 0x7474);
        assert_eq!(pit.channels[1].rw_mode, PitRWMode::Both);

        clock.lock().add_ns(ns_for_ticks(11));
        write(&mut pit, CONTROL_WORD, 0x40); // Latch channel 1.

        assert_eq!(read(&mut pit, 1), 0x69);
        assert_eq!(read(&mut pit, 1), 0x74);
        assert!(pit.channels[1].latched_count.is_none());
    }

    /// The latch resets the byte selector, so a pair always starts at the
    /// LSB even if a stray single read left the selector on the MSB.
    #[test]
    fn latch_resets_byte_selector() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0x74);
        write(&mut pit, 1, 0x00);
        write(&mut pit, 1, 0x01); // Reload 0x100.

        read(&mut pit, 1); // Selector now on the MSB.
        clock.lock().add_ns(ns_for_ticks(3));
        write(&mut pit, CONTROL_WORD, 0x40);
        let latched = pit.channels[1].latched_count.unwrap();
        assert_eq!(read(&mut pit, 1), latched as u8);
        assert_eq!(read(&mut pit, 1), (latched >> 8) as u8);
    }

    /// Channel 0 counts from power-on: the first read returns a live,
    /// in-range count without any programming.
    #[test]
    fn channel0_runs_at_reset() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        clock.lock().add_ns(ns_for_ticks(3));
        let low = read(&mut pit, 0);
        let high = read(&mut pit, 0);
        let count = u16::from_le_bytes([low, high]);
        assert_eq!(count, 0xfffd); // 65536 - 3.
    }

    /// The live count stays within 1..=reload at all times.
    #[test]
    fn live_count_bounds() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0x34); // Channel 0, LSB+MSB, mode 2.
        write(&mut pit, 0, 16);
        write(&mut pit, 0, 0); // Reload 16.

        for step in 0..64 {
            let count = u32::from(pit.channels[0].live_count(pit.now_ns()));
            assert!(
                (1..=16).contains(&count),
                "step {}: count {} out of range",
                step,
                count
            );
            clock.lock().add_ns(ns_for_ticks(1));
        }
    }

    /// A 16-bit zero write means 65536.
    #[test]
    fn zero_reload_means_65536() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0x34);
        write(&mut pit, 0, 0);
        write(&mut pit, 0, 0);
        assert_eq!(pit.channels[0].reload_value, 0x10000);

        clock.lock().add_ns(ns_for_ticks(1));
        assert_eq!(read(&mut pit, 0), 0xff);
        assert_eq!(read(&mut pit, 0), 0xff);
    }

    /// LSB-only access mode merges into the low byte and re-arms.
    #[test]
    fn lsb_only_write() {
        let TestPit { mut pit, .. } = set_up();
        write(&mut pit, CONTROL_WORD, 0x14); // Channel 0, LSB only, mode 2.
        write(&mut pit, 0, 0x20);
        assert_eq!(pit.channels[0].reload_value, 0x20);
        assert!(pit.channels[0].programmed);
    }

    /// Channel 0 wraps pulse IRQ 0 through the PIC, catching up on missed
    /// periods without drift.
    #[test]
    fn irq0_emission_and_catch_up() {
        let TestPit {
            mut pit,
            clock,
            pic,
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0x34);
        write(&mut pit, 0, 0x00);
        write(&mut pit, 0, 0x10); // Reload 0x1000.

        assert!(!pic.lock().interrupt_requested());

        // Three periods elapse before the next tick call.
        clock.lock().add_ns(3 * pit_ticks_to_ns(0x1000));
        pit.tick();
        assert!(pic.lock().interrupt_requested());
        assert_eq!(pic.lock().get_external_interrupt(), Some(0x08));
        assert!(!pic.lock().interrupt_requested());

        // The deadline advanced past all three periods: one more period,
        // one more edge.
        clock.lock().add_ns(pit_ticks_to_ns(0x1000));
        pit.tick();
        assert!(pic.lock().interrupt_requested());
    }

    /// Channel 2 square wave output is high for the first half of each
    /// period, and idles high when the gate is off.
    #[test]
    fn channel2_square_wave() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0xb6); // Channel 2, LSB+MSB, mode 3.
        write(&mut pit, 2, 4);
        write(&mut pit, 2, 0); // Reload 4.

        // Gate low: output idles high.
        assert!(pit.channel2_out());

        pit.set_channel2_gate(true);
        assert!(pit.channel2_out()); // Phase 0.
        clock.lock().add_ns(ns_for_ticks(1));
        assert!(pit.channel2_out()); // Phase 1.
        clock.lock().add_ns(ns_for_ticks(1));
        assert!(!pit.channel2_out()); // Phase 2.
        clock.lock().add_ns(ns_for_ticks(1));
        assert!(!pit.channel2_out()); // Phase 3.
    }

    /// Mode 2 output drops only on the final tick of each period.
    #[test]
    fn channel2_rate_generator() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0xb4); // Channel 2, LSB+MSB, mode 2.
        write(&mut pit, 2, 4);
        write(&mut pit, 2, 0);
        pit.set_channel2_gate(true);

        assert!(pit.channel2_out()); // Phase 0.
        clock.lock().add_ns(ns_for_ticks(2));
        assert!(pit.channel2_out()); // Phase 2.
        clock.lock().add_ns(ns_for_ticks(1));
        assert!(!pit.channel2_out()); // Phase 3 == reload - 1.
    }

    /// A rising gate edge restarts channel 2 from the top of its count.
    #[test]
    fn gate_rising_edge_restarts() {
        let TestPit {
            mut pit, clock, ..
        } = set_up();
        write(&mut pit, CONTROL_WORD, 0xb6);
        write(&mut pit, 2, 4);
        write(&mut pit, 2, 0);
        pit.set_channel2_gate(true);

        clock.lock().add_ns(ns_for_ticks(2));
        assert!(!pit.channel2_out()); // Second half of the wave.

        pit.set_channel2_gate(false);
        pit.set_channel2_gate(true); // Restart.
        assert!(pit.channel2_out()); // Back at phase 0.
    }
}
