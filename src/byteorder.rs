//! Byte and word order conversion between the host and the M57 controller.
//!
//! The controller stores multi-byte values in Motorola (big endian) order.
//! Two independent corrections are needed on the host:
//!
//! - Intra-word: 16-bit values read through the data port are in controller
//!   order, so a little endian host swaps them before storing to memory.
//! - Word order: 32-bit values are assembled from two 16-bit bus accesses.
//!   Whether the two halves arrive swapped depends on the XOR of the host
//!   endianness and the byte-swapped bus variant, see
//!   [`ByteOrder::word_little`].
//!
//! Addresses reported by the controller are in the controller's address
//! space and must be translated with [`correct_address`] before use.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

/// Host byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    /// Byte order of the machine this crate was compiled for
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// Byte order configuration of one host/bus combination.
///
/// Chosen once at attach time.  The four combinations of host endianness
/// and `swapped` select one of two shared memory offset tables and the
/// conversions below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteOrder {
    host: Endian,
    swapped: bool,
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::build()
    }
}

impl ByteOrder {
    pub const fn new(host: Endian, swapped: bool) -> Self {
        Self { host, swapped }
    }

    /// Native host endianness, with the bus variant selected by the
    /// `swapped` cargo feature.
    pub const fn build() -> Self {
        Self::new(Endian::native(), cfg!(feature = "swapped"))
    }

    pub const fn host(&self) -> Endian {
        self.host
    }

    pub const fn swapped(&self) -> bool {
        self.swapped
    }

    /// True when the bus presents the shared memory in Intel order, i.e. a
    /// little endian host on a straight bus, or a big endian host on a
    /// byte-swapped bus.
    pub const fn word_little(&self) -> bool {
        matches!(self.host, Endian::Little) != self.swapped
    }

    /// Intra-word swap applied to every word moved through the data port.
    pub const fn twist_word(&self, w: u16) -> u16 {
        match self.host {
            Endian::Big => w,
            Endian::Little => swap16(w),
        }
    }

    /// Full 32-bit endianness swap for values stored in host memory.
    pub const fn twist_long(&self, l: u32) -> u32 {
        match self.host {
            Endian::Big => l,
            Endian::Little => swap32(l),
        }
    }

    /// Swap the 16-bit halves of a 32-bit value assembled from two word
    /// accesses, when the bus delivers them low half first.
    pub const fn twist_long_w(&self, l: u32) -> u32 {
        if self.word_little() {
            swap_halves(l)
        } else {
            l
        }
    }

    /// Data port byte lane holding an odd shared memory address.
    pub const fn odd_lane(&self) -> u32 {
        if self.word_little() { 0 } else { 1 }
    }

    /// Data port byte lane holding an even shared memory address.
    pub const fn even_lane(&self) -> u32 {
        if self.word_little() { 1 } else { 0 }
    }

    /// Store a data port word into two bytes of host memory.
    ///
    /// The word is twisted and then laid down in host order, so the byte
    /// stream in host memory matches the byte stream in shared memory.
    pub const fn word_to_host(&self, w: u16) -> [u8; 2] {
        let w = self.twist_word(w);
        match self.host {
            Endian::Big => w.to_be_bytes(),
            Endian::Little => w.to_le_bytes(),
        }
    }

    /// Inverse of [`Self::word_to_host`].
    pub const fn host_to_word(&self, b: [u8; 2]) -> u16 {
        let w = match self.host {
            Endian::Big => u16::from_be_bytes(b),
            Endian::Little => u16::from_le_bytes(b),
        };
        self.twist_word(w)
    }
}

pub const fn swap16(w: u16) -> u16 {
    w.rotate_left(8)
}

pub const fn swap32(l: u32) -> u32 {
    l.swap_bytes()
}

pub const fn swap_halves(l: u32) -> u32 {
    l.rotate_left(16)
}

/// Translate an address found in a controller descriptor field into a host
/// shared memory offset.
///
/// A zero address stays zero, it marks an absent block.
pub const fn correct_address(addr: u32, c_base: u32, h_base: u32) -> u32 {
    if addr == 0 {
        0
    } else {
        addr.wrapping_sub(c_base).wrapping_add(h_base)
    }
}
