//! Per-device state shared between caller threads and the event task.
//!
//! The window lock is the `Mutex` around [`Shared`]: it owns the
//! [`Window`], the protocol engine and every flag both sides touch, so that
//! holding the lock is both necessary and sufficient to move the window.
//! Code already inside the lock calls [`crate::cmi`] and
//! [`crate::transfer`] with the window directly; everything else goes
//! through the locking methods here.
//!
//! The semaphores live outside the lock.  They are signalled by the event
//! task and waited on by callers, never while the lock is held by the
//! waiter.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cmi::{Cmi, CmiState};
use crate::device::DeviceConfig;
use crate::event::{AliveState, EventState, WaitSlot};
use crate::io::{Clock, Registers};
use crate::sem::Semaphore;
use crate::service::ServiceDescr;
use crate::transfer;
use crate::window::Window;
use crate::{Error, Result};

/// User notification, called from the event task after a con/ind has been
/// buffered or the diagnostic table or event reasons changed.
pub type Signal = Box<dyn Fn() + Send + Sync>;

/// Everything guarded by the window lock
pub struct Shared<R: Registers> {
    pub win: Window<R>,
    pub cmi: Cmi,
    pub ev: EventState,
}

/// Low-level handle, one per attached device
pub struct Handle<R: Registers, C: Clock> {
    shared: Mutex<Shared<R>>,
    clock: Arc<C>,
    config: DeviceConfig,
    /// Interrupt to event task
    pub(crate) isr: Arc<Semaphore>,
    /// Request acknowledged (mailbox 0xF0)
    pub(crate) ack: Semaphore,
    /// Awaited confirmation arrived (mailbox 0x0F into the wait slot)
    pub(crate) con: Semaphore,
    /// Mirrors the con/ind ring occupancy
    pub(crate) con_buf: Semaphore,
    pub(crate) alive: Mutex<AliveState>,
    stop: AtomicBool,
    con_ind_timeout_ms: AtomicU32,
    signal: Mutex<Option<Signal>>,
}

impl<R: Registers, C: Clock> Handle<R, C> {
    pub fn new(regs: R, clock: Arc<C>, config: DeviceConfig) -> Self {
        let shared = Shared {
            win: Window::new(regs, config.byte_order),
            cmi: Cmi::new(config.cmi()),
            ev: EventState::new(&config),
        };
        Self {
            shared: Mutex::new(shared),
            clock,
            con_ind_timeout_ms: AtomicU32::new(config.con_ind_timeout_ms),
            config,
            isr: Arc::new(Semaphore::binary()),
            ack: Semaphore::binary(),
            con: Semaphore::binary(),
            con_buf: Semaphore::counting(),
            alive: Mutex::new(AliveState::default()),
            stop: AtomicBool::new(false),
            signal: Mutex::new(None),
        }
    }

    /// Take the window lock
    pub fn lock(&self) -> MutexGuard<'_, Shared<R>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> CmiState {
        self.lock().cmi.state()
    }

    /// Reset the controller and run the handshake
    pub fn init(&self) -> Result<()> {
        self.reset_alive();
        let mut guard = self.lock();
        let s = &mut *guard;
        s.ev.reset();
        self.con_buf.clear();
        s.cmi.init(&mut s.win, &*self.clock)
    }

    pub fn irq_enable(&self, enable: bool) {
        let mut s = self.lock();
        if enable {
            s.win.irq_enable();
        } else {
            s.win.irq_disable();
        }
    }

    pub fn copy_from_dpram(&self, dst: &mut [u8], src: u32) {
        let mut s = self.lock();
        transfer::copy_from_dpram(&mut s.win, dst, src);
    }

    pub fn copy_to_dpram(&self, dst: u32, src: &[u8]) {
        let mut s = self.lock();
        transfer::copy_to_dpram(&mut s.win, dst, src);
    }

    /// Fetch a pending confirmation or indication, bypassing the event task
    pub fn cmi_read(&self, buf: &mut [u8]) -> Result<Option<(ServiceDescr, usize)>> {
        let mut guard = self.lock();
        let s = &mut *guard;
        s.cmi.read(&mut s.win, &*self.clock, buf, false)
    }

    /// Post a request.
    ///
    /// With `wait_for_ack` this blocks until the event task sees the
    /// controller's acknowledge, then returns the controller's verdict.
    /// Without, the host semaphore is released by the event task when the
    /// acknowledge arrives and any error is only logged.
    pub fn cmi_write(&self, descr: &ServiceDescr, data: &[u8], wait_for_ack: bool) -> Result<()> {
        self.ack.clear();
        {
            let mut guard = self.lock();
            let s = &mut *guard;
            s.cmi.write(&mut s.win, &*self.clock, descr, data, false)?;
            s.ev.detached_req = !wait_for_ack;
        }
        if !wait_for_ack {
            return Ok(());
        }

        let timeout = Duration::from_millis(u64::from(self.config.ack_timeout_ms));
        if !self.ack.wait(timeout) {
            error!("No acknowledge for service {:#04x}", descr.service);
            let mut guard = self.lock();
            let s = &mut *guard;
            s.cmi.release_host_sema(&mut s.win);
            return Err(Error::NoControllerResponse);
        }

        let mut guard = self.lock();
        let s = &mut *guard;
        s.cmi.finish_write(&mut s.win)
    }

    /// Take the request slot if neither a user request nor a diagnostic
    /// poll is in flight, arming the wait slot with `slot`
    pub(crate) fn try_claim_request(&self, slot: Option<WaitSlot>) -> bool {
        let mut s = self.lock();
        if s.ev.diag_req_wait_con || s.ev.req_pending {
            return false;
        }
        s.ev.req_pending = true;
        s.ev.wait_for = slot;
        s.ev.confirmation = None;
        true
    }

    /// Give the request slot back after a failed post
    pub(crate) fn release_request(&self) {
        let mut s = self.lock();
        s.ev.req_pending = false;
        s.ev.wait_for = None;
    }

    pub fn get_data_descr(&self, id: u8, offset: u16, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.lock();
        let s = &mut *guard;
        s.cmi.get_data_descr(&mut s.win, id, offset, buf)
    }

    pub fn set_data_descr(&self, id: u8, offset: u16, data: &[u8]) -> Result<()> {
        let mut guard = self.lock();
        let s = &mut *guard;
        s.cmi.set_data_descr(&mut s.win, id, offset, data)
    }

    /// Keep data area claims across accesses.  Dropping the hold releases
    /// every claim still in place.
    pub fn set_hold_all(&self, hold: bool) {
        let mut guard = self.lock();
        let s = &mut *guard;
        s.cmi.set_hold_all(hold);
        if !hold {
            s.cmi.release_all(&mut s.win);
        }
    }

    pub fn con_ind_timeout_ms(&self) -> u32 {
        self.con_ind_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_con_ind_timeout_ms(&self, ms: u32) {
        self.con_ind_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_signal(&self, signal: Option<Signal>) {
        *self.signal.lock().unwrap_or_else(PoisonError::into_inner) = signal;
    }

    pub(crate) fn notify(&self) {
        if let Some(signal) = self
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            signal();
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.isr.signal();
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}
