//! Shared memory layout of the CMI descriptor block, the data descriptor
//! list and the M57 register file.
//!
//! The descriptor block holds two mirrored sub-blocks, host first and
//! controller 32 bytes later.  Byte fields inside each 16-bit lane trade
//! places between the Motorola and Intel bus orders, so there are two offset
//! tables.  The four build variants collapse onto these two, chosen by
//! [`ByteOrder::word_little`].
//!
//! ## Firmware images
//!
//! Loading firmware is up to the platform, but for reference the images it
//! loads start with the sync marker `0xDEADFACE` (word order corrected like
//! every other 32-bit field), followed by segment descriptors of
//! (offset, length, load address), ended by a zero offset.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::byteorder::ByteOrder;

/// Offset of the CMI descriptor block in DPRAM
pub const COMM_OFF: u32 = 0x8000;

/// Size of the directly addressable window
pub const WINDOW_SIZE: u32 = 0x80;

/// Mask selecting the window page of a DPRAM offset
pub const WINDOW_MASK: u32 = !(WINDOW_SIZE - 1);

/// Offset of the controller sub-block relative to the host sub-block
pub const CONTROLLER_BLOCK: u32 = 32;

/// Size of the whole descriptor block
pub const DESCRIPTOR_LEN: u32 = 64;

/// Field offsets of one side (host or controller) of the descriptor block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideOffsets {
    pub ready_mask: u32,
    pub base_address: u32,
    /// Repurposed as the interrupt mailbox byte
    pub id: u32,
    pub int_enable: u32,
    pub address_swap_mode: u32,
    pub state: u32,
    pub param_addr: u32,
    pub data_addr: u32,
    pub param_size: u32,
    pub data_size: u32,
    pub sema: u32,
    pub ret_val: u32,
    pub head: u32,
    pub tail: u32,
    pub data_descr_addr: u32,
}

impl SideOffsets {
    const MOTOROLA: Self = Self {
        ready_mask: 0,
        base_address: 4,
        id: 8,
        int_enable: 9,
        address_swap_mode: 10,
        state: 11,
        param_addr: 12,
        data_addr: 16,
        param_size: 20,
        data_size: 22,
        sema: 24,
        ret_val: 25,
        head: 26,
        tail: 27,
        data_descr_addr: 28,
    };

    const INTEL: Self = Self {
        ready_mask: 0,
        base_address: 4,
        int_enable: 8,
        id: 9,
        state: 10,
        address_swap_mode: 11,
        param_addr: 12,
        data_addr: 16,
        param_size: 20,
        data_size: 22,
        ret_val: 24,
        sema: 25,
        tail: 26,
        head: 27,
        data_descr_addr: 28,
    };

    const fn shifted(self, by: u32) -> Self {
        Self {
            ready_mask: self.ready_mask + by,
            base_address: self.base_address + by,
            id: self.id + by,
            int_enable: self.int_enable + by,
            address_swap_mode: self.address_swap_mode + by,
            state: self.state + by,
            param_addr: self.param_addr + by,
            data_addr: self.data_addr + by,
            param_size: self.param_size + by,
            data_size: self.data_size + by,
            sema: self.sema + by,
            ret_val: self.ret_val + by,
            head: self.head + by,
            tail: self.tail + by,
            data_descr_addr: self.data_descr_addr + by,
        }
    }
}

/// Offsets of both sides of the descriptor block, relative to the window
/// positioned at [`COMM_OFF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorLayout {
    pub host: SideOffsets,
    pub controller: SideOffsets,
}

impl DescriptorLayout {
    pub const MOTOROLA: Self = Self {
        host: SideOffsets::MOTOROLA,
        controller: SideOffsets::MOTOROLA.shifted(CONTROLLER_BLOCK),
    };

    pub const INTEL: Self = Self {
        host: SideOffsets::INTEL,
        controller: SideOffsets::INTEL.shifted(CONTROLLER_BLOCK),
    };

    pub const fn for_order(order: ByteOrder) -> Self {
        if order.word_little() {
            Self::INTEL
        } else {
            Self::MOTOROLA
        }
    }
}

/// Offsets inside one data descriptor list entry.
///
/// Note the semaphore offsets are identical in both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescrLayout {
    pub id: u32,
    pub sema_h: u32,
    pub sema_c: u32,
    pub data_size: u32,
    pub data_addr: u32,
}

impl DataDescrLayout {
    /// Length of one list entry
    pub const ENTRY_LEN: u32 = 10;

    pub const MOTOROLA: Self = Self {
        id: 0,
        sema_h: 2,
        sema_c: 3,
        data_size: 4,
        data_addr: 6,
    };

    pub const INTEL: Self = Self {
        id: 1,
        sema_h: 2,
        sema_c: 3,
        data_size: 4,
        data_addr: 6,
    };

    pub const fn for_order(order: ByteOrder) -> Self {
        if order.word_little() {
            Self::INTEL
        } else {
            Self::MOTOROLA
        }
    }

    /// Offset of entry `index` relative to the list start
    pub const fn entry(index: u32) -> u32 {
        index * Self::ENTRY_LEN
    }
}

/// M57 register file in A08 mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Control register: interrupt enable/request bits
    pub cntr: u32,
    /// ID EEPROM register, doubling as the controller reset line
    pub id: u32,
}

impl RegisterLayout {
    /// Data port, auto-incrementing the window pointer by 2 per access
    pub const DATA_PORT: u32 = 0x80;
    /// Upper half of the window pointer
    pub const WINDOW_HI: u32 = 0xa0;
    /// Lower half of the window pointer
    pub const WINDOW_LO: u32 = 0xa2;

    pub const fn for_order(order: ByteOrder) -> Self {
        if order.word_little() {
            Self { cntr: 0xff, id: 0xfe }
        } else {
            Self { cntr: 0xfe, id: 0xff }
        }
    }
}

/// All offset tables for one byte order, resolved once at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub order: ByteOrder,
    pub descr: DescriptorLayout,
    pub data_descr: DataDescrLayout,
    pub regs: RegisterLayout,
}

impl Layout {
    pub const fn new(order: ByteOrder) -> Self {
        Self {
            order,
            descr: DescriptorLayout::for_order(order),
            data_descr: DataDescrLayout::for_order(order),
            regs: RegisterLayout::for_order(order),
        }
    }
}
