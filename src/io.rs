//! Hardware and OS seams consumed by the engine.
//!
//! This module contains the traits the device-driver shell implements to
//! give the engine access to the M57 register file and to a tick source.
//!
//! # Possible implementations
//!
//! - For a real board: wrap the mapped A08 register space of the M-module
//!   slot, using volatile 8 and 16-bit accesses.  Byte swapping performed by
//!   the bus access layer belongs in the implementation, so that 16-bit
//!   reads return the value the controller stored in big endian order.
//! - For tests and simulation: an in-memory model of the DPRAM and window
//!   registers.
//!
//! # Address Space
//!
//! Register offsets are relative to the M57 A08 base.  Offsets `0x00..0x80`
//! address the current 128-byte window, `0x80` is the data port, `0xa0` and
//! `0xa2` take the window pointer halves, and `0xfe`/`0xff` are the control
//! and ID registers (their order depends on the bus variant).

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::time::{Duration, Instant};

/// Register access to one M57 module.
///
/// Accesses are infallible, as bus errors on the A08 space are reported by
/// the platform, not the module.
pub trait Registers: Send {
    /// Read a byte register
    fn read_u8(&mut self, offset: u32) -> u8;

    /// Write a byte register
    fn write_u8(&mut self, offset: u32, value: u8);

    /// Read a 16-bit register at an even offset
    fn read_u16(&mut self, offset: u32) -> u16;

    /// Write a 16-bit register at an even offset
    fn write_u16(&mut self, offset: u32, value: u16);
}

/// Tick source and delay used by every bounded polling loop.
///
/// Keeping this behind a trait lets tests drive the handshake with a fake
/// clock instead of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current tick count, wrapping
    fn ticks(&self) -> u32;

    /// Ticks per second
    fn tick_rate(&self) -> u32;

    /// Sleep for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32);

    /// Convert a duration in milliseconds to ticks, rounding up so that a
    /// non-zero duration never becomes zero ticks.
    fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = (u64::from(ms) * u64::from(self.tick_rate())).div_ceil(1000);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Whether `timeout_ms` has elapsed since `start`
    fn expired(&self, start: u32, timeout_ms: u32) -> bool {
        self.ticks().wrapping_sub(start) >= self.ms_to_ticks(timeout_ms)
    }
}

/// Millisecond clock backed by [`Instant`] and [`std::thread::sleep`]
#[derive(Debug, Clone, Copy)]
pub struct StdClock {
    start: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

impl StdClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn ticks(&self) -> u32 {
        // Truncation gives the wrapping tick counter
        self.start.elapsed().as_millis() as u32
    }

    fn tick_rate(&self) -> u32 {
        1000
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
