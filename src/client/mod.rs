//! Async front-end to a [`crate::device::Device`].
//!
//! Instead of blocking on the confirmation wait slot, the client posts a
//! request without waiting and then polls the con/ind buffer, yielding to
//! the application's executor between polls.  This only sees con/inds that
//! are buffered, so the device must run with `cyclic_data_transfer` off;
//! requests on a cyclic device fail with [`crate::Error::InvalidCmiCall`].
//! A request holds the device's exchange lock until its con/ind is taken,
//! so blocking [`crate::device::Device::req_con`] callers wait their turn.
//!
//! See [`AsyncProfiClient`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[cfg(feature = "async")]
pub mod futures;

#[cfg(feature = "async")]
pub use futures::{AsyncConIndSource, AsyncDelay, AsyncProfiClient};

/// How long the client polls the con/ind buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollLimit {
    /// Poll until something arrives
    #[default]
    Forever,
    /// Give up with [`crate::Error::Timeout`] after this many empty polls
    Polls(u32),
}

impl PollLimit {
    #[cfg(feature = "async")]
    fn exhausted(&self, polls: u32) -> bool {
        match self {
            PollLimit::Forever => false,
            PollLimit::Polls(max) => polls >= *max,
        }
    }
}
