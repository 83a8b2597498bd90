//! Windowed access to the M57 DPRAM.
//!
//! The host sees only a 128-byte slice of the DPRAM at a time.  The slice is
//! selected by writing a window pointer, after which the first 128 register
//! offsets alias the window page and the data port streams words from the
//! pointer, advancing it by 2 on every access.
//!
//! [`Window`] owns the [`Registers`] and tracks the window most recently
//! selected by a caller, so the event task can restore it after borrowing
//! the window to read the interrupt mailbox.  Exclusive access is provided
//! by whoever owns the `Window`, normally the window lock inside
//! [`crate::handle::Handle`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::byteorder::ByteOrder;
use crate::io::Registers;
use crate::layout::{Layout, RegisterLayout, WINDOW_MASK};

bitflags! {
    /// M57 control register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u8 {
        /// Written: raise an interrupt to the module.  Read: set while the
        /// module has no interrupt from the host outstanding.
        const IRQ_TO_MODULE = 0x10;
        /// Interrupts from the module to the host enabled
        const IRQ_ENABLE = 0x40;
    }
}

/// Value written to the ID register to hold the controller in reset
pub const RESET_ASSERT: u8 = 0x04;

/// Windowed memory accessor for one M57
pub struct Window<R: Registers> {
    regs: R,
    layout: Layout,
    current: u32,
}

impl<R: Registers> Window<R> {
    pub fn new(regs: R, order: ByteOrder) -> Self {
        Self {
            regs,
            layout: Layout::new(order),
            current: 0,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn order(&self) -> ByteOrder {
        self.layout.order
    }

    /// Position the window at DPRAM offset `start` and remember it as the
    /// window to restore after an interrupt.
    pub fn set_window(&mut self, start: u32) {
        self.move_window(start);
        self.current = start;
    }

    /// Position the window without touching the restore value.  Used by the
    /// event task.
    pub(crate) fn move_window(&mut self, start: u32) {
        self.regs
            .write_u16(RegisterLayout::WINDOW_HI, (start >> 16) as u16);
        self.regs
            .write_u16(RegisterLayout::WINDOW_LO, (start & 0xffff) as u16);
    }

    /// Window most recently selected by [`Self::set_window`]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Reposition the window to [`Self::current`]
    pub fn restore(&mut self) {
        self.move_window(self.current);
    }

    // Direct access to the window page

    pub fn read_u8(&mut self, offset: u32) -> u8 {
        self.regs.read_u8(offset)
    }

    pub fn write_u8(&mut self, offset: u32, value: u8) {
        self.regs.write_u8(offset, value)
    }

    pub fn read_u16(&mut self, offset: u32) -> u16 {
        self.regs.read_u16(offset)
    }

    pub fn write_u16(&mut self, offset: u32, value: u16) {
        self.regs.write_u16(offset, value)
    }

    /// 32-bit read as two word accesses, returned exactly as the bus
    /// assembles it (halves possibly swapped).
    pub fn read_u32_raw(&mut self, offset: u32) -> u32 {
        if self.layout.order.word_little() {
            (u32::from(self.regs.read_u16(offset + 2)) << 16)
                | u32::from(self.regs.read_u16(offset))
        } else {
            (u32::from(self.regs.read_u16(offset)) << 16)
                | u32::from(self.regs.read_u16(offset + 2))
        }
    }

    /// 32-bit write as two word accesses, `value` in bus assembly order.
    pub fn write_u32_raw(&mut self, offset: u32, value: u32) {
        let hi = (value >> 16) as u16;
        let lo = (value & 0xffff) as u16;
        if self.layout.order.word_little() {
            self.regs.write_u16(offset + 2, hi);
            self.regs.write_u16(offset, lo);
        } else {
            self.regs.write_u16(offset, hi);
            self.regs.write_u16(offset + 2, lo);
        }
    }

    /// Word-order corrected 32-bit read
    pub fn read_u32(&mut self, offset: u32) -> u32 {
        let raw = self.read_u32_raw(offset);
        self.layout.order.twist_long_w(raw)
    }

    /// Word-order corrected 32-bit write
    pub fn write_u32(&mut self, offset: u32, value: u32) {
        let raw = self.layout.order.twist_long_w(value);
        self.write_u32_raw(offset, raw)
    }

    // Absolute DPRAM offsets, repositioning the window for every access so
    // that a field may sit on either side of a page boundary.

    pub fn read_at_u8(&mut self, addr: u32) -> u8 {
        self.set_window(addr & WINDOW_MASK);
        self.read_u8(addr & !WINDOW_MASK)
    }

    pub fn write_at_u8(&mut self, addr: u32, value: u8) {
        self.set_window(addr & WINDOW_MASK);
        self.write_u8(addr & !WINDOW_MASK, value)
    }

    pub fn read_at_u16(&mut self, addr: u32) -> u16 {
        self.set_window(addr & WINDOW_MASK);
        self.read_u16(addr & !WINDOW_MASK)
    }

    /// Word-order corrected 32-bit read at an absolute offset
    pub fn read_at_u32(&mut self, addr: u32) -> u32 {
        let first = u32::from(self.read_at_u16(addr));
        let second = u32::from(self.read_at_u16(addr + 2));
        let raw = if self.layout.order.word_little() {
            (second << 16) | first
        } else {
            (first << 16) | second
        };
        self.layout.order.twist_long_w(raw)
    }

    // Data port

    pub fn read_word(&mut self) -> u16 {
        self.regs.read_u16(RegisterLayout::DATA_PORT)
    }

    pub fn write_word(&mut self, value: u16) {
        self.regs.write_u16(RegisterLayout::DATA_PORT, value)
    }

    pub fn read_byte(&mut self, lane: u32) -> u8 {
        self.regs.read_u8(RegisterLayout::DATA_PORT + lane)
    }

    pub fn write_byte(&mut self, lane: u32, value: u8) {
        self.regs.write_u8(RegisterLayout::DATA_PORT + lane, value)
    }

    /// Read one byte at an absolute DPRAM offset via the data port, without
    /// touching the restore value.
    pub(crate) fn read_int8(&mut self, offset: u32) -> u8 {
        self.move_window(offset);
        self.read_byte(offset & 1)
    }

    /// Write one byte at an absolute DPRAM offset via the data port, without
    /// touching the restore value.
    pub(crate) fn write_int8(&mut self, offset: u32, value: u8) {
        self.move_window(offset);
        self.write_byte(offset & 1, value)
    }

    // M57 control register

    fn control(&mut self) -> Control {
        Control::from_bits_retain(self.regs.read_u8(self.layout.regs.cntr))
    }

    fn set_control(&mut self, value: Control) {
        self.regs.write_u8(self.layout.regs.cntr, value.bits())
    }

    /// Assert (`true`) or release (`false`) the controller reset line
    pub fn reset(&mut self, on: bool) {
        let value = if on { RESET_ASSERT } else { 0 };
        self.regs.write_u8(self.layout.regs.id, value)
    }

    /// Raise an interrupt to the module
    pub fn irq_to_module(&mut self) {
        let c = self.control() | Control::IRQ_TO_MODULE;
        self.set_control(c)
    }

    /// Whether the previous interrupt to the module is still outstanding
    pub fn irq_to_module_pending(&mut self) -> bool {
        !self.control().contains(Control::IRQ_TO_MODULE)
    }

    /// Enable interrupts from the module
    pub fn irq_enable(&mut self) {
        let c = (self.control() - Control::IRQ_TO_MODULE) | Control::IRQ_ENABLE;
        self.set_control(c)
    }

    /// Disable interrupts from the module
    pub fn irq_disable(&mut self) {
        let c = self.control() - (Control::IRQ_TO_MODULE | Control::IRQ_ENABLE);
        self.set_control(c)
    }

    /// Release the interrupt line after servicing
    pub fn irq_ack(&mut self) {
        self.irq_disable();
        self.irq_enable();
    }
}
