//! Bulk copies between host memory and DPRAM through the data port.
//!
//! Each transfer positions the window once and then streams through the
//! auto-incrementing data port.  An odd start address is handled with one
//! leading byte access, an odd remainder with one trailing byte access, and
//! everything in between moves as whole words.
//!
//! These functions take the [`Window`] directly, so they can only be called
//! by code already holding the window lock.  Callers outside the lock go
//! through [`crate::handle::Handle::copy_from_dpram`] and
//! [`crate::handle::Handle::copy_to_dpram`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::io::Registers;
use crate::window::Window;

/// Copy `dst.len()` bytes starting at DPRAM offset `src` into `dst`.
///
/// The window is left positioned at `src`, also for a zero length copy.
pub fn copy_from_dpram<R: Registers>(win: &mut Window<R>, dst: &mut [u8], src: u32) {
    trace!("copy_from_dpram: src={src:#x} len={}", dst.len());
    win.set_window(src);

    let order = win.order();
    let mut rest = dst;

    if src & 1 == 1 {
        if let Some((first, tail)) = std::mem::take(&mut rest).split_first_mut() {
            *first = win.read_byte(order.odd_lane());
            rest = tail;
        }
    }

    let mut words = rest.chunks_exact_mut(2);
    for pair in &mut words {
        let w = win.read_word();
        pair.copy_from_slice(&order.word_to_host(w));
    }

    if let [last] = words.into_remainder() {
        *last = win.read_byte(order.even_lane());
    }
}

/// Copy `src` into DPRAM starting at offset `dst`.
///
/// The window is left positioned at `dst`, also for a zero length copy.
pub fn copy_to_dpram<R: Registers>(win: &mut Window<R>, dst: u32, src: &[u8]) {
    trace!("copy_to_dpram: dst={dst:#x} len={}", src.len());
    win.set_window(dst);

    let order = win.order();
    let mut rest = src;

    if dst & 1 == 1 {
        if let Some((first, tail)) = rest.split_first() {
            win.write_byte(order.odd_lane(), *first);
            rest = tail;
        }
    }

    let mut words = rest.chunks_exact(2);
    for pair in &mut words {
        win.write_word(order.host_to_word([pair[0], pair[1]]));
    }

    if let [last] = words.remainder() {
        win.write_byte(order.even_lane(), *last);
    }
}
