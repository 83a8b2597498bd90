//! Event delivery pipeline.
//!
//! The interrupt entry only signals; the event task then does all the work
//! under the window lock:
//!
//! - `0xF0` (request acknowledged): releases whoever posted the request.
//!   Internally issued diagnostic polls and detached requests are completed
//!   here, anything else wakes the caller blocked in
//!   [`Handle::cmi_write`].
//! - `0x0F` (con/ind pending): the con/ind is fetched and routed, first to
//!   a caller waiting on the matching wait slot, then to the con/ind ring
//!   (acyclic mode) or to the slave diagnostic table and FM2 event reasons
//!   (cyclic mode).
//!
//! In cyclic mode slave diagnostics arrive by a self-resubmitting chain of
//! `DP_GET_SLAVE_DIAG` requests, which the alive check also uses to see
//! whether the firmware still answers.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::collections::VecDeque;
use std::sync::{PoisonError, TryLockError};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::cmi::{ACK_IRQ, REQ_IRQ};
use crate::device::DeviceConfig;
use crate::handle::{Handle, Shared};
use crate::io::{Clock, Registers};
use crate::layout::COMM_OFF;
use crate::service::{Layer, Primitive, ServiceDescr, dp, fmb};
use crate::{Error, Result};

/// Number of slave diagnostic slots, one per DP address 0..=126
pub const SLAVE_DIAG_SLOTS: usize = dp::MAX_NUMBER_SLAVES + 1;

/// rem_add, dummy, status, diag_entries, diag_data_len
const DIAG_CON_HEADER: usize = 8;

/// Highest FM2 event reason kept in the sticky reason bits
const FM2_MAX_REASON: u16 = 7;

/// How long the event task sleeps before looking at the stop flag again
const EVENT_POLL: Duration = Duration::from_millis(100);

/// A confirmation or indication with its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConInd {
    pub descr: ServiceDescr,
    pub data: Vec<u8>,
}

impl ConInd {
    /// Status word leading a DP confirmation payload
    pub fn status(&self) -> u16 {
        match self.data.as_slice() {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => 0,
        }
    }
}

/// Bounded buffer of confirmations and indications.
///
/// When full, new elements are dropped and the overflow flag raised.  The
/// flag stays up until the next element is accepted; draining alone does
/// not clear it.
#[derive(Debug)]
pub struct ConIndRing {
    items: VecDeque<ConInd>,
    capacity: usize,
    overflow: bool,
}

impl ConIndRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            overflow: false,
        }
    }

    /// Append `item`, returning false if it was dropped
    pub fn push(&mut self, item: ConInd) -> bool {
        if self.items.len() >= self.capacity {
            self.overflow = true;
            return false;
        }
        self.overflow = false;
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<ConInd> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow(&self) -> bool {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.overflow = false;
    }
}

/// The (layer, service, primitive) a blocked caller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSlot {
    pub layer: u8,
    pub service: u8,
    pub primitive: u8,
}

impl WaitSlot {
    pub fn confirmation(layer: Layer, service: u8) -> Self {
        Self {
            layer: layer as u8,
            service,
            primitive: Primitive::Con as u8,
        }
    }

    pub fn matches(&self, descr: &ServiceDescr) -> bool {
        self.layer == descr.layer
            && self.service == descr.service
            && self.primitive == descr.primitive
    }
}

/// Event state guarded by the window lock
#[derive(Debug)]
pub struct EventState {
    /// A caller's request has been posted and not yet acknowledged
    pub req_pending: bool,
    /// A detached (no-wait) request awaits its acknowledge
    pub detached_req: bool,
    /// The next diagnostic poll waits for the in-flight request to finish
    pub diag_req_delayed: bool,
    pub diag_req_wait_ack: bool,
    pub diag_req_wait_con: bool,
    /// Cleared by any slave diagnostic con/ind
    pub alive_check_wait: bool,
    pub wait_for: Option<WaitSlot>,
    /// Con/ind delivered into the wait slot
    pub confirmation: Option<ConInd>,
    pub ring: ConIndRing,
    /// Sticky FM2 event reason bits
    pub fm2_reason: u8,
    pub slave_diag: Vec<Vec<u8>>,
    pub irq_count: u32,
    pub cyclic: bool,
}

impl EventState {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            req_pending: false,
            detached_req: false,
            diag_req_delayed: false,
            diag_req_wait_ack: false,
            diag_req_wait_con: false,
            alive_check_wait: false,
            wait_for: None,
            confirmation: None,
            ring: ConIndRing::new(config.con_ind_capacity),
            fm2_reason: 0,
            slave_diag: vec![Vec::new(); SLAVE_DIAG_SLOTS],
            irq_count: 0,
            cyclic: config.cyclic_data_transfer,
        }
    }

    /// Forget all in-flight exchanges, as after a controller reset
    pub fn reset(&mut self) {
        self.req_pending = false;
        self.detached_req = false;
        self.diag_req_delayed = false;
        self.diag_req_wait_ack = false;
        self.diag_req_wait_con = false;
        self.alive_check_wait = false;
        self.wait_for = None;
        self.confirmation = None;
        self.ring.clear();
    }
}

/// Alive check phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlivePhase {
    #[default]
    Idle,
    WaitConfirmation,
}

#[derive(Debug, Default)]
pub struct AliveState {
    pub phase: AlivePhase,
    /// Tick of the last answered check
    pub last_check: u32,
    /// Tick the outstanding poll was sent
    pub sent_at: u32,
}

/// Post a `DP_GET_SLAVE_DIAG` request without waiting for anything.  The
/// acknowledge and confirmation are consumed by the event task.
pub(crate) fn send_diag_req<R: Registers, C: Clock>(s: &mut Shared<R>, clock: &C, in_event: bool) {
    s.ev.diag_req_wait_ack = true;
    s.ev.diag_req_wait_con = true;
    let descr = ServiceDescr::request(Layer::Dp, dp::GET_SLAVE_DIAG);
    if let Err(e) = s.cmi.write(&mut s.win, clock, &descr, &[], in_event) {
        warn!("Slave diagnostic poll not sent: {e}");
        s.ev.diag_req_wait_ack = false;
        s.ev.diag_req_wait_con = false;
    }
}

impl<R: Registers, C: Clock> Handle<R, C> {
    /// Handle one interrupt from the module
    pub(crate) fn process_event(&self) {
        let notify = {
            let mut guard = self.lock();
            let s = &mut *guard;
            let saved = s.win.current();
            s.win.irq_ack();

            let mailbox = COMM_OFF + s.win.layout().descr.host.id;
            let value = s.win.read_int8(mailbox);
            trace!("mailbox {value:#04x}");

            let notify = match value {
                REQ_IRQ => {
                    self.on_ack(s);
                    false
                }
                ACK_IRQ => self.on_con_ind(s),
                0 => {
                    trace!("Spurious wakeup");
                    false
                }
                other => {
                    warn!("Unexpected mailbox value {other:#04x}");
                    false
                }
            };

            if value == REQ_IRQ || value == ACK_IRQ {
                s.ev.irq_count = s.ev.irq_count.wrapping_add(1);
                s.win.write_int8(mailbox, 0);
            }
            s.win.set_window(saved);
            notify
        };

        if notify {
            self.notify();
        }
    }

    fn on_ack(&self, s: &mut Shared<R>) {
        if s.ev.diag_req_wait_ack {
            s.cmi.release_host_sema(&mut s.win);
            s.ev.diag_req_wait_ack = false;
        } else if s.ev.detached_req {
            if let Err(e) = s.cmi.finish_write(&mut s.win) {
                warn!("Detached request rejected: {e}");
            }
            s.ev.detached_req = false;
        } else {
            self.ack.signal();
        }
        s.ev.req_pending = false;
    }

    /// Returns whether the user signal should be raised
    fn on_con_ind(&self, s: &mut Shared<R>) -> bool {
        let mut buf = vec![0u8; usize::from(s.cmi.blocks().data_block_size)];
        let (descr, len) = match s.cmi.read(&mut s.win, self.clock(), &mut buf, true) {
            Ok(Some(got)) => got,
            Ok(None) => {
                debug!("Con/ind interrupt with nothing pending");
                return false;
            }
            Err(e) => {
                warn!("Con/ind retrieval failed: {e}");
                return false;
            }
        };
        buf.truncate(len);
        debug!(
            "con/ind layer={:#04x} service={:#04x} primitive={} len={len}",
            descr.layer, descr.service, descr.primitive
        );

        if s.ev.wait_for.is_some_and(|w| w.matches(&descr)) {
            s.ev.confirmation = Some(ConInd { descr, data: buf });
            self.con.signal();
            if s.ev.diag_req_delayed {
                s.ev.diag_req_delayed = false;
                send_diag_req(s, self.clock(), true);
            }
            return false;
        }

        if !s.ev.cyclic {
            if s.ev.ring.push(ConInd { descr, data: buf }) {
                self.con_buf.signal();
            } else {
                warn!("Con/ind buffer full, dropped service {:#04x}", descr.service);
            }
            return true;
        }

        let is_diag = descr.layer == Layer::DpUsr as u8
            && descr.service == dp::GET_SLAVE_DIAG
            && (descr.primitive == Primitive::Con as u8 || descr.primitive == Primitive::Ind as u8);
        if is_diag {
            return self.on_slave_diag(s, &buf);
        }

        if descr.is(Layer::FmbUsr, fmb::FM2_EVENT, Primitive::Ind) {
            if let [hi, lo, ..] = buf.as_slice() {
                let reason = u16::from_be_bytes([*hi, *lo]);
                if reason < FM2_MAX_REASON {
                    s.ev.fm2_reason |= 1 << reason;
                }
            }
            return true;
        }

        debug!("Unhandled con/ind service {:#04x}", descr.service);
        false
    }

    fn on_slave_diag(&self, s: &mut Shared<R>, data: &[u8]) -> bool {
        let mut notify = false;
        let mut entries = 0i16;

        if data.len() >= DIAG_CON_HEADER {
            let rem_add = usize::from(data[0]);
            let status = u16::from_be_bytes([data[2], data[3]]);
            entries = i16::from_be_bytes([data[4], data[5]]);
            let diag_len = usize::from(u16::from_be_bytes([data[6], data[7]]));

            if rem_add < SLAVE_DIAG_SLOTS && status == 0 {
                let end = (DIAG_CON_HEADER + diag_len).min(data.len());
                s.ev.slave_diag[rem_add] = data[DIAG_CON_HEADER..end].to_vec();
                notify = true;
            } else {
                warn!("Slave diagnostic rejected: rem_add={rem_add:#04x} status={status:#06x}");
            }
        } else {
            warn!("Short slave diagnostic: {} bytes", data.len());
        }

        s.ev.diag_req_wait_con = false;
        s.ev.alive_check_wait = false;

        // A negative count means the firmware's diagnostic queue overflowed
        if entries != 0 {
            if s.ev.req_pending {
                s.ev.diag_req_delayed = true;
            } else {
                send_diag_req(s, self.clock(), true);
            }
        }
        notify
    }

    /// Event task body: wait for interrupts until asked to stop
    pub(crate) fn run_events(&self) {
        debug!("Event task running");
        loop {
            let woken = self.isr.wait(EVENT_POLL);
            if self.stopping() {
                break;
            }
            if woken {
                self.process_event();
            }
        }
        debug!("Event task stopped");
    }

    /// Check the firmware still answers diagnostic polls.
    ///
    /// Only active in cyclic mode.  At most every alive cycle a diagnostic
    /// poll is sent, provided nothing else is in flight; if no diagnostic
    /// con/ind arrives within the alive timeout the firmware is declared
    /// dead.
    pub fn alive_check(&self) -> Result<()> {
        if !self.config().cyclic_data_transfer {
            return Ok(());
        }
        let mut alive = match self.alive.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            // Another caller is checking
            Err(TryLockError::WouldBlock) => return Ok(()),
        };

        let clock = self.clock();
        let now = clock.ticks();
        match alive.phase {
            AlivePhase::Idle => {
                let cycle = clock.ms_to_ticks(self.config().alive_cycle_ms);
                if now.wrapping_sub(alive.last_check) > cycle {
                    let mut guard = self.lock();
                    let s = &mut *guard;
                    if !s.ev.req_pending && !s.ev.diag_req_delayed && !s.ev.diag_req_wait_con {
                        debug!("Alive check poll");
                        send_diag_req(s, clock, false);
                        alive.sent_at = now;
                        alive.phase = AlivePhase::WaitConfirmation;
                        s.ev.alive_check_wait = true;
                    }
                }
            }
            AlivePhase::WaitConfirmation => {
                let waiting = self.lock().ev.alive_check_wait;
                if !waiting {
                    alive.phase = AlivePhase::Idle;
                    alive.last_check = now;
                } else {
                    let timeout = clock.ms_to_ticks(self.config().alive_timeout_ms);
                    if now.wrapping_sub(alive.sent_at) > timeout {
                        error!("Firmware did not answer the alive check");
                        return Err(Error::FirmwareNotAlive);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop the alive check state, e.g. after re-initialising
    pub(crate) fn reset_alive(&self) {
        *self.alive.lock().unwrap_or_else(PoisonError::into_inner) = AliveState::default();
    }
}
