//! Host-side Common Memory Interface (CMI) engine for M57 Profibus-DP
//! coprocessor modules.
//!
//! The M57 carries an intelligent Profibus-DP controller that shares a
//! dual-ported RAM (DPRAM) with the host.  Host and controller exchange
//! service requests, confirmations and indications through a descriptor
//! block in that DPRAM, guarded by semaphore bytes and signalled with a
//! one-byte interrupt mailbox in each direction.
//!
//! The host only sees a 128-byte window of the DPRAM at a time, through an
//! 8/16-bit A08 bus.  The window must be repositioned to reach anything else,
//! and an interrupt arriving on the host may need to move it while a caller
//! is in the middle of a transfer.  This crate serialises all window access
//! behind one lock, and moves all interrupt work into a dedicated event
//! thread so that the interrupt handler itself only signals.
//!
//! The controller stores everything in Motorola (big endian) order.  Host
//! endianness and the optional byte-swapped bus variant combine into one of
//! two shared memory layouts; see [`byteorder`] and [`layout`].
//!
//! ## Architecture
//!
//! - **Protocol engine** ([`cmi`]): reset and ready/config handshake, then
//!   reading and writing service blocks and the data descriptor areas.
//! - **Service dispatch** ([`service`]): service descriptors, layers and
//!   per-service payload length rules.
//! - **Event pipeline** ([`event`]): mailbox dispatch, the confirmation
//!   wait slot, the con/ind ring buffer, cyclic slave diagnostics and the
//!   firmware alive check.
//! - **Device** ([`device`]): attach/detach and the blocking API used by a
//!   device-driver shell.
//! - **Client** ([`client`]): async front-end that polls the con/ind buffer
//!   rather than blocking.
//!
//! The crate needs two things from its platform, both in [`io`]:
//! - [`io::Registers`] - access to the M57 A08 register space
//! - [`io::Clock`] - a tick source and millisecond delay
//!
//! ## Getting Started
//!
//! 1. Implement [`io::Registers`] for the mapped module slot.
//! 2. Attach with [`device::Device::attach`], passing a
//!    [`device::DeviceConfig`] describing the slave I/O layout.
//! 3. Route the module interrupt to [`device::Device::irq`] (or to the
//!    [`device::IrqTrigger`] obtained from it).
//! 4. Call [`device::Device::init`] to bring the controller online, then
//!    [`device::Device::irq_enable`].
//! 5. Start the stack with [`device::Device::start_stack`] and exchange
//!    process data with [`device::Device::read_channel`] and
//!    [`device::Device::write_channel`].
//!
//! ## Features
//!
//! Default features:
//! - `async` - Enable the async client
//!
//! Optional:
//! - `swapped` - Default to the byte-swapped bus variant

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod byteorder;
pub mod client;
pub mod cmi;
pub mod device;
pub mod event;
pub mod handle;
pub mod io;
pub mod layout;
pub mod sem;
pub mod service;
pub mod transfer;
pub mod window;

#[cfg(test)]
pub(crate) mod test_utils;

/// CMI errors
///
/// Interface errors carry the numbering of the controller firmware
/// documentation, see [`Error::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Controller does not respond
    #[error("controller does not respond")]
    NoControllerResponse,
    /// Controller reported an invalid type or software version
    #[error("invalid controller type or software version")]
    InvalidControllerTypeVersion,
    /// Invalid layer
    #[error("invalid layer")]
    InvalidLayer,
    /// Invalid service identifier
    #[error("invalid service identifier")]
    InvalidService,
    /// Invalid service primitive
    #[error("invalid service primitive")]
    InvalidPrimitive,
    /// Invalid communication reference
    #[error("invalid communication reference")]
    InvalidCommRef,
    /// Payload larger than the block or entry it goes into
    #[error("payload too large")]
    PayloadTooLarge,
    /// Caller buffer too small for a pending message, which stays pending
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    /// Invalid CMI call
    #[error("invalid CMI call")]
    InvalidCmiCall,
    /// Data area temporarily owned by the controller
    #[error("service temporarily not executable")]
    ServiceConstrConflict,
    /// Service not supported
    #[error("service not supported")]
    ServiceNotSupported,
    /// Other error code passed through from the controller
    #[error("controller error {0:#04x}")]
    Controller(u8),
    /// Timeout waiting for a confirmation
    #[error("timeout")]
    Timeout,
    /// No data available
    #[error("no data available")]
    NoData,
    /// Firmware did not answer the alive check
    #[error("firmware not alive")]
    FirmwareNotAlive,
    /// Negative confirmation with the given status
    #[error("negative confirmation, status {0:#06x}")]
    NegativeConfirmation(u16),
    /// Channel does not exist or has no data in the requested direction
    #[error("invalid channel")]
    InvalidChannel,
    /// No slave has inputs
    #[error("no inputs available")]
    NoInputs,
    /// No slave has outputs
    #[error("no outputs available")]
    NoOutputs,
    /// Engine not initialised
    #[error("not initialised")]
    Uninit,
    /// The event task could not be started
    #[error("failed to start event task")]
    EventTask,
}

impl Error {
    /// Numeric code of this error.
    ///
    /// Interface errors use the controller's `E_IF_*` numbering (7 to 26),
    /// driver-side conditions start at 0x30.
    pub const fn code(&self) -> u8 {
        match self {
            Error::NoControllerResponse => 10,
            Error::InvalidControllerTypeVersion => 11,
            Error::InvalidLayer => 12,
            Error::InvalidService => 13,
            Error::InvalidPrimitive => 14,
            Error::PayloadTooLarge | Error::BufferTooSmall { .. } => 15,
            Error::InvalidCommRef => 16,
            Error::InvalidCmiCall => 19,
            Error::ServiceConstrConflict => 23,
            Error::ServiceNotSupported => 24,
            Error::Controller(code) => *code,
            Error::Timeout => 0x30,
            Error::NoData => 0x31,
            Error::FirmwareNotAlive => 0x32,
            Error::NegativeConfirmation(_) => 0x33,
            Error::InvalidChannel => 0x34,
            Error::NoInputs => 0x35,
            Error::NoOutputs => 0x36,
            Error::Uninit => 0x37,
            Error::EventTask => 0x38,
        }
    }

    /// Map a non-zero return byte from the controller to an error
    pub const fn from_code(code: u8) -> Self {
        match code {
            10 => Error::NoControllerResponse,
            11 => Error::InvalidControllerTypeVersion,
            12 => Error::InvalidLayer,
            13 => Error::InvalidService,
            14 => Error::InvalidPrimitive,
            15 => Error::PayloadTooLarge,
            16 => Error::InvalidCommRef,
            19 => Error::InvalidCmiCall,
            23 => Error::ServiceConstrConflict,
            24 => Error::ServiceNotSupported,
            other => Error::Controller(other),
        }
    }
}

/// Type to represent the result of a CMI operation
pub type Result<T> = core::result::Result<T, Error>;
