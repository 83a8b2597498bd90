//! CMI protocol engine.
//!
//! Brings the controller online with the ready/config handshake and then
//! moves service blocks and data areas through the descriptor block.  All
//! functions here take the [`Window`] directly and so run inside the window
//! lock; [`crate::handle::Handle`] provides the locking entry points.
//!
//! The handshake:
//!
//! 1. Pulse the controller reset line.
//! 2. Clear both ready masks and return values, then fill in the host side
//!    of the descriptor block with the host ready magic.
//! 3. Poll the controller ready mask, rewriting the host magic on every
//!    poll as the controller clears it while it boots.
//! 4. Translate the block addresses the controller reported into host
//!    offsets, writing the host ones back.
//! 5. Enter config mode and wait for the controller to follow.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::byteorder::correct_address;
use crate::io::{Clock, Registers};
use crate::layout::{COMM_OFF, DataDescrLayout};
use crate::service::ServiceDescr;
use crate::transfer::{copy_from_dpram, copy_to_dpram};
use crate::window::Window;
use crate::{Error, Result};

/// Host ready mask magic
pub const H_READY_MASK: u32 = 0x1E2D_4B87;
/// Controller ready mask magic
pub const C_READY_MASK: u32 = 0xE1D2_B478;

/// Mailbox value: request (host to controller) or acknowledge of a request
/// (controller to host)
pub const REQ_IRQ: u8 = 0xF0;
/// Mailbox value: acknowledge of a con/ind (host to controller) or con/ind
/// pending (controller to host)
pub const ACK_IRQ: u8 = 0x0F;

pub const SEMA_IDLE: u8 = 0;
pub const SEMA_BUSY: u8 = 1;

/// Written to a data descriptor's host semaphore to claim the entry
pub const DATA_DESCR_CLAIM: u8 = 0xAA;

/// Host int-enable: requests and acknowledges by interrupt
pub const REQ_ACK_BY_IR: u8 = 0x03;
/// Host address mode
pub const ABS_32BIT_MOTOROLA: u8 = 0x00;

/// Controller int-enable bit: raise an interrupt after posting a request
pub const INT_ENABLE_REQ: u8 = 0x01;
/// Controller int-enable bit: raise an interrupt after taking a con/ind
pub const INT_ENABLE_ACK: u8 = 0x02;

/// Upper bound on the data descriptor list scan, in case the terminator is
/// missing
pub const MAX_DATA_DESCR: u32 = 32;

/// Descriptor block state byte values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Init = 0,
    Config = 5,
    Comm = 8,
}

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmiState {
    #[default]
    Uninitialized,
    Reset,
    WaitControllerReady,
    WaitControllerConfig,
    Comm,
}

/// Timing used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmiConfig {
    /// Bound on each handshake phase and on the interrupt-to-controller
    /// waits
    pub timeout_ms: u32,
    /// Delay between handshake polls
    pub poll_interval_ms: u32,
    /// Delay after asserting and after releasing reset
    pub reset_delay_ms: u32,
}

impl Default for CmiConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_interval_ms: 10,
            reset_delay_ms: 50,
        }
    }
}

/// Host offsets of the blocks negotiated during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Blocks {
    pub h_base: u32,
    pub c_base: u32,
    /// Host service description block
    pub h_param: u32,
    /// Host service data block
    pub h_data: u32,
    pub data_descr_list: u32,
    pub param_block_size: u16,
    pub data_block_size: u16,
    /// Controller service description block
    pub c_param: u32,
    /// Controller service data block
    pub c_data: u32,
}

/// Protocol engine state for one controller
#[derive(Debug, Default)]
pub struct Cmi {
    state: CmiState,
    config: CmiConfig,
    blocks: Blocks,
    hold_all: bool,
}

impl Cmi {
    pub fn new(config: CmiConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn state(&self) -> CmiState {
        self.state
    }

    pub fn config(&self) -> &CmiConfig {
        &self.config
    }

    pub fn blocks(&self) -> &Blocks {
        &self.blocks
    }

    /// While set, data descriptor claims are kept after each access so that
    /// several channels sharing one area are read or written consistently.
    pub fn hold_all(&self) -> bool {
        self.hold_all
    }

    pub fn set_hold_all(&mut self, hold: bool) {
        self.hold_all = hold;
    }

    fn check_comm(&self) -> Result<()> {
        if self.state == CmiState::Comm {
            Ok(())
        } else {
            Err(Error::Uninit)
        }
    }

    fn set_state(&mut self, state: CmiState) {
        debug!("CMI state {:?} -> {state:?}", self.state);
        self.state = state;
    }

    /// Reset the controller and run the handshake up to communication mode.
    ///
    /// Interrupts from the module stay disabled; enabling them is up to the
    /// caller.
    pub fn init<R: Registers, C: Clock>(&mut self, win: &mut Window<R>, clock: &C) -> Result<()> {
        let cfg = self.config;
        let h = win.layout().descr.host;
        let c = win.layout().descr.controller;

        self.set_state(CmiState::Reset);
        win.reset(true);
        clock.delay_ms(cfg.reset_delay_ms);
        win.reset(false);
        clock.delay_ms(cfg.reset_delay_ms);

        win.set_window(COMM_OFF);
        win.write_u32(h.ready_mask, 0);
        win.write_u32(c.ready_mask, 0);
        win.write_u8(h.ret_val, 0);
        win.write_u8(c.ret_val, 0);

        win.write_u32(h.ready_mask, H_READY_MASK);
        win.write_u32(h.base_address, COMM_OFF);
        win.write_u8(h.id, 0);
        win.write_u8(h.int_enable, REQ_ACK_BY_IR);
        win.write_u8(h.address_swap_mode, ABS_32BIT_MOTOROLA);
        win.write_u8(h.state, Mode::Init as u8);
        win.write_u8(h.sema, SEMA_IDLE);

        self.set_state(CmiState::WaitControllerReady);
        let start = clock.ticks();
        while win.read_u32(c.ready_mask) != C_READY_MASK {
            // The controller zeroes the host mask while it boots
            win.write_u32(h.ready_mask, H_READY_MASK);
            clock.delay_ms(cfg.poll_interval_ms);
            let ret = win.read_u8(c.ret_val);
            if ret != 0 {
                error!("Controller reported {ret:#04x} while booting");
                return Err(Error::NoControllerResponse);
            }
            if clock.expired(start, cfg.timeout_ms) {
                error!("Controller not ready after {}ms", cfg.timeout_ms);
                return Err(Error::NoControllerResponse);
            }
        }
        win.write_u32(h.ready_mask, H_READY_MASK);

        let h_base = COMM_OFF;
        let c_base = win.read_u32(c.base_address);
        let fix_up = |win: &mut Window<R>, field: u32| {
            let addr = correct_address(win.read_u32(field), c_base, h_base);
            win.write_u32(field, addr);
            addr
        };
        let h_param = fix_up(win, h.param_addr);
        let h_data = fix_up(win, h.data_addr);
        let data_descr_list = fix_up(win, h.data_descr_addr);

        self.blocks = Blocks {
            h_base,
            c_base,
            h_param,
            h_data,
            data_descr_list,
            param_block_size: win.read_u16(h.param_size),
            data_block_size: win.read_u16(h.data_size),
            c_param: correct_address(win.read_u32(c.param_addr), c_base, h_base),
            c_data: correct_address(win.read_u32(c.data_addr), c_base, h_base),
        };
        debug!("CMI blocks {:x?}", self.blocks);

        win.write_u8(h.ret_val, 0);
        win.write_u8(h.state, Mode::Config as u8);

        self.set_state(CmiState::WaitControllerConfig);
        let start = clock.ticks();
        while win.read_u8(c.state) != Mode::Config as u8 {
            clock.delay_ms(cfg.poll_interval_ms);
            let ret = win.read_u8(c.ret_val);
            if ret != 0 {
                error!("Controller rejected config mode: {ret:#04x}");
                return Err(Error::from_code(ret));
            }
            if clock.expired(start, cfg.timeout_ms) {
                error!("Controller did not enter config mode");
                return Err(Error::NoControllerResponse);
            }
        }

        if win.read_u8(c.id) != 0 {
            win.write_u8(c.id, 0);
        }

        self.set_state(CmiState::Comm);
        info!(
            "CMI up: data block {} bytes, c_base {c_base:#x}",
            self.blocks.data_block_size
        );
        Ok(())
    }

    /// Fetch a pending confirmation or indication into `buf`.
    ///
    /// Returns `Ok(None)` when nothing is pending.  A payload larger than
    /// `buf` yields [`Error::BufferTooSmall`] and stays pending, so the
    /// caller can retry with a larger buffer.
    pub fn read<R: Registers, C: Clock>(
        &mut self,
        win: &mut Window<R>,
        clock: &C,
        buf: &mut [u8],
        in_event: bool,
    ) -> Result<Option<(ServiceDescr, usize)>> {
        self.check_comm()?;
        let c = win.layout().descr.controller;

        win.set_window(COMM_OFF);
        if win.read_u8(c.sema) == SEMA_IDLE {
            return Ok(None);
        }

        let ret = win.read_u8(c.ret_val);
        if ret != 0 {
            win.write_u8(c.ret_val, 0);
            win.write_u8(c.sema, SEMA_IDLE);
            if win.read_u8(c.int_enable) & INT_ENABLE_ACK != 0 {
                self.irq_to_controller(win, clock, ACK_IRQ, in_event);
            }
            warn!("Controller con/ind carried error {ret:#04x}");
            return Err(Error::from_code(ret));
        }

        let mut sdb = [0u8; ServiceDescr::LEN];
        copy_from_dpram(win, &mut sdb, self.blocks.c_param);
        win.set_window(COMM_OFF);

        let len = usize::from(win.read_u16(c.data_size));
        if len > buf.len() {
            debug!("con/ind needs {len} bytes, have {}", buf.len());
            return Err(Error::BufferTooSmall { required: len });
        }

        copy_from_dpram(win, &mut buf[..len], self.blocks.c_data);
        win.set_window(COMM_OFF);
        win.write_u8(c.sema, SEMA_IDLE);
        if win.read_u8(c.int_enable) & INT_ENABLE_ACK != 0 {
            self.irq_to_controller(win, clock, ACK_IRQ, in_event);
        }

        Ok(Some((ServiceDescr::from_bytes(&sdb), len)))
    }

    /// Post a request or response and raise the request interrupt.
    ///
    /// The host semaphore is left busy.  The controller acknowledges through
    /// the mailbox, after which [`Self::finish_write`] collects the result.
    pub fn write<R: Registers, C: Clock>(
        &mut self,
        win: &mut Window<R>,
        clock: &C,
        descr: &ServiceDescr,
        data: &[u8],
        in_event: bool,
    ) -> Result<()> {
        self.check_comm()?;
        if data.len() > usize::from(self.blocks.data_block_size) {
            return Err(Error::PayloadTooLarge);
        }
        let h = win.layout().descr.host;
        let c = win.layout().descr.controller;

        copy_to_dpram(win, self.blocks.h_param, &descr.to_bytes());
        win.set_window(COMM_OFF);
        win.write_u16(h.param_size, ServiceDescr::LEN as u16);

        copy_to_dpram(win, self.blocks.h_data, data);
        win.set_window(COMM_OFF);
        // Bounded by data_block_size above
        win.write_u16(h.data_size, data.len() as u16);
        win.write_u8(h.sema, SEMA_BUSY);

        if win.read_u8(c.int_enable) & INT_ENABLE_REQ != 0 {
            self.irq_to_controller(win, clock, REQ_IRQ, in_event);
        }
        Ok(())
    }

    /// Release the host semaphore after the acknowledge and return the
    /// controller's verdict on the request.
    pub fn finish_write<R: Registers>(&mut self, win: &mut Window<R>) -> Result<()> {
        let h = win.layout().descr.host;
        win.set_window(COMM_OFF);
        win.write_u8(h.sema, SEMA_IDLE);
        let ret = win.read_u8(h.ret_val);
        win.write_u8(h.ret_val, 0);
        if ret != 0 {
            warn!("Controller rejected request: {ret:#04x}");
            return Err(Error::from_code(ret));
        }
        Ok(())
    }

    /// Return the host semaphore to idle without looking at the result
    pub fn release_host_sema<R: Registers>(&mut self, win: &mut Window<R>) {
        let h = win.layout().descr.host;
        win.set_window(COMM_OFF);
        win.write_u8(h.sema, SEMA_IDLE);
    }

    /// Hand a mailbox value to the controller and interrupt it.
    ///
    /// Waits for the previous interrupt to be taken (not from the event
    /// task, which may be servicing the very interrupt the controller is
    /// blocked on) and for the controller mailbox to drain.  Either wait
    /// gives up after the timeout and the interrupt is raised anyway.
    pub fn irq_to_controller<R: Registers, C: Clock>(
        &self,
        win: &mut Window<R>,
        clock: &C,
        value: u8,
        in_event: bool,
    ) {
        let c_id = win.layout().descr.controller.id;
        win.set_window(COMM_OFF);

        if !in_event {
            let start = clock.ticks();
            while win.irq_to_module_pending() {
                if clock.expired(start, self.config.timeout_ms) {
                    warn!("Previous interrupt to controller not taken");
                    break;
                }
                clock.delay_ms(1);
            }
        }

        let start = clock.ticks();
        while win.read_u8(c_id) != 0 {
            if clock.expired(start, self.config.timeout_ms) {
                warn!("Controller mailbox not drained");
                break;
            }
            clock.delay_ms(1);
        }

        trace!("irq to controller {value:#04x}");
        win.write_u8(c_id, value);
        win.irq_to_module();
    }

    fn find_data_descr<R: Registers>(&self, win: &mut Window<R>, id: u8) -> Result<u32> {
        let dd = win.layout().data_descr;
        for i in 0..MAX_DATA_DESCR {
            let entry = self.blocks.data_descr_list + DataDescrLayout::entry(i);
            match win.read_at_u8(entry + dd.id) {
                0 => break,
                found if found == id => return Ok(entry),
                _ => {}
            }
        }
        Err(Error::ServiceNotSupported)
    }

    fn claim<R: Registers>(&self, win: &mut Window<R>, entry: u32) -> Result<()> {
        let dd = win.layout().data_descr;
        win.write_at_u8(entry + dd.sema_h, DATA_DESCR_CLAIM);
        if win.read_at_u8(entry + dd.sema_c) != 0 {
            win.write_at_u8(entry + dd.sema_h, 0);
            return Err(Error::ServiceConstrConflict);
        }
        Ok(())
    }

    fn release<R: Registers>(&self, win: &mut Window<R>, entry: u32) {
        if !self.hold_all {
            let dd = win.layout().data_descr;
            win.write_at_u8(entry + dd.sema_h, 0);
        }
    }

    fn entry_area<R: Registers>(&self, win: &mut Window<R>, entry: u32) -> (u32, u16) {
        let dd = win.layout().data_descr;
        let addr = correct_address(
            win.read_at_u32(entry + dd.data_addr),
            self.blocks.c_base,
            self.blocks.h_base,
        );
        (addr, win.read_at_u16(entry + dd.data_size))
    }

    /// Read from data area `id` starting `offset` bytes in.
    ///
    /// Reads at most the rest of the area and returns the number of bytes
    /// placed in `buf`.
    pub fn get_data_descr<R: Registers>(
        &mut self,
        win: &mut Window<R>,
        id: u8,
        offset: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.check_comm()?;
        let entry = self.find_data_descr(win, id)?;
        self.claim(win, entry)?;

        let (addr, cap) = self.entry_area(win, entry);
        let len = buf.len().min(usize::from(cap.saturating_sub(offset)));
        copy_from_dpram(win, &mut buf[..len], addr + u32::from(offset));

        self.release(win, entry);
        Ok(len)
    }

    /// Write `data` into data area `id` starting `offset` bytes in
    pub fn set_data_descr<R: Registers>(
        &mut self,
        win: &mut Window<R>,
        id: u8,
        offset: u16,
        data: &[u8],
    ) -> Result<()> {
        self.check_comm()?;
        let dd = win.layout().data_descr;
        let entry = self.find_data_descr(win, id)?;
        let cap = usize::from(win.read_at_u16(entry + dd.data_size));
        if usize::from(offset) + data.len() > cap {
            return Err(Error::PayloadTooLarge);
        }
        self.claim(win, entry)?;

        let (addr, _) = self.entry_area(win, entry);
        copy_to_dpram(win, addr + u32::from(offset), data);

        self.release(win, entry);
        Ok(())
    }

    /// Drop every host claim in the data descriptor list, as held by
    /// [`Self::set_hold_all`]
    pub fn release_all<R: Registers>(&mut self, win: &mut Window<R>) {
        if self.state != CmiState::Comm {
            return;
        }
        let dd = win.layout().data_descr;
        for i in 0..MAX_DATA_DESCR {
            let entry = self.blocks.data_descr_list + DataDescrLayout::entry(i);
            if win.read_at_u8(entry + dd.id) == 0 {
                break;
            }
            if win.read_at_u8(entry + dd.sema_h) == DATA_DESCR_CLAIM {
                win.write_at_u8(entry + dd.sema_h, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byteorder::{ByteOrder, Endian};
    use crate::layout::Layout;
    use crate::service::{Layer, Primitive, dp};
    use crate::test_utils::*;
    use std::sync::Arc;

    const ALL: [ByteOrder; 4] = [
        ByteOrder::new(Endian::Big, false),
        ByteOrder::new(Endian::Big, true),
        ByteOrder::new(Endian::Little, false),
        ByteOrder::new(Endian::Little, true),
    ];

    struct Rig {
        cmi: Cmi,
        win: Window<FakeM57>,
        fake: FakeM57,
        sim: SimController,
        clock: Arc<FakeClock>,
        layout: Layout,
    }

    fn rig(order: ByteOrder) -> Rig {
        let fake = FakeM57::new(order);
        let sim = SimController::new(fake.clone(), order, 2);
        let clock = Arc::new(FakeClock::new());
        let stepper = sim.clone();
        clock.set_hook(move || stepper.step());
        Rig {
            cmi: Cmi::new(CmiConfig::default()),
            win: Window::new(fake.clone(), order),
            fake,
            sim,
            clock,
            layout: Layout::new(order),
        }
    }

    fn booted(order: ByteOrder) -> Rig {
        let mut r = rig(order);
        r.cmi.init(&mut r.win, &*r.clock).unwrap();
        r
    }

    fn con(service: u8) -> ServiceDescr {
        ServiceDescr::new(Layer::DpUsr, service, Primitive::Con)
    }

    #[test]
    fn handshake_completes_in_two_polls() {
        for order in ALL {
            let r = booted(order);
            assert_eq!(r.cmi.state(), CmiState::Comm);
            assert_eq!(r.sim.boots(), 1);
            // Two reset delays, two ready polls, one config poll
            assert_eq!(r.clock.delays(), 5, "{order:?}");

            let b = r.cmi.blocks();
            assert_eq!(b.c_base, SIM_C_BASE);
            assert_eq!(b.h_param, SIM_H_PARAM);
            assert_eq!(b.h_data, SIM_H_DATA);
            assert_eq!(b.data_descr_list, SIM_DATA_DESCR);
            assert_eq!(b.c_param, SIM_C_PARAM);
            assert_eq!(b.c_data, SIM_C_DATA);
            assert_eq!(b.data_block_size, SIM_DATA_BLOCK);

            let h = r.layout.descr.host;
            assert_eq!(r.fake.ctrl_read_u32(COMM_OFF + h.base_address), COMM_OFF);
            assert_eq!(r.fake.ctrl_read_u32(COMM_OFF + h.param_addr), SIM_H_PARAM);
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.int_enable), REQ_ACK_BY_IR);
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.state), Mode::Config as u8);
            assert!(!r.fake.in_reset());
        }
    }

    #[test]
    fn handshake_times_out_without_controller() {
        let order = ByteOrder::new(Endian::Little, false);
        let fake = FakeM57::new(order);
        let clock = FakeClock::new();
        let mut win = Window::new(fake.clone(), order);
        let mut cmi = Cmi::new(CmiConfig::default());

        assert_eq!(cmi.init(&mut win, &clock), Err(Error::NoControllerResponse));
        assert_eq!(cmi.state(), CmiState::WaitControllerReady);
        let waited = clock.now() - 2 * 50;
        assert!((5000..=5010).contains(&waited), "waited {waited}ms");

        let mut buf = [0u8; 4];
        assert_eq!(cmi.read(&mut win, &clock, &mut buf, false), Err(Error::Uninit));
    }

    #[test]
    fn config_phase_passes_controller_error_through() {
        let order = ByteOrder::new(Endian::Big, false);
        let mut r = rig(order);
        let (sim, fake, d) = (r.sim.clone(), r.fake.clone(), r.layout.descr);
        r.clock.set_hook(move || {
            sim.step();
            if fake.ctrl_read_u8(COMM_OFF + d.host.state) == Mode::Config as u8 {
                fake.ctrl_write_u8(COMM_OFF + d.controller.ret_val, 11);
            }
        });
        assert_eq!(
            r.cmi.init(&mut r.win, &*r.clock),
            Err(Error::InvalidControllerTypeVersion)
        );
    }

    #[test]
    fn read_buffer_too_small_leaves_message_pending() {
        for order in ALL {
            let mut r = booted(order);
            let descr = con(dp::DATA_TRANSFER);
            r.sim.post_con_ind(&descr, &[1, 2, 3, 4, 5]);

            let mut small = [0u8; 4];
            assert_eq!(
                r.cmi.read(&mut r.win, &*r.clock, &mut small, false),
                Err(Error::BufferTooSmall { required: 5 })
            );
            assert!(r.sim.con_ind_pending());
            assert_eq!(r.fake.take_module_irqs(), 0);

            let mut buf = [0u8; 5];
            let got = r.cmi.read(&mut r.win, &*r.clock, &mut buf, false).unwrap();
            assert_eq!(got, Some((descr, 5)));
            assert_eq!(buf, [1, 2, 3, 4, 5]);
            assert!(!r.sim.con_ind_pending());

            // Acknowledged through the controller mailbox
            let c_id = COMM_OFF + r.layout.descr.controller.id;
            assert_eq!(r.fake.ctrl_read_u8(c_id), ACK_IRQ);
            assert_eq!(r.fake.take_module_irqs(), 1);

            r.fake.ctrl_write_u8(c_id, 0);
            r.fake.module_idle();
            assert_eq!(r.cmi.read(&mut r.win, &*r.clock, &mut buf, false), Ok(None));
        }
    }

    #[test]
    fn read_reports_controller_return_value() {
        let mut r = booted(ByteOrder::new(Endian::Little, true));
        let c = r.layout.descr.controller;
        r.sim.post_con_ind(&con(dp::GET_SLAVE_DIAG), &[]);
        r.fake.ctrl_write_u8(COMM_OFF + c.ret_val, 23);

        let mut buf = [0u8; 8];
        assert_eq!(
            r.cmi.read(&mut r.win, &*r.clock, &mut buf, false),
            Err(Error::ServiceConstrConflict)
        );
        assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + c.ret_val), 0);
        assert!(!r.sim.con_ind_pending());
    }

    #[test]
    fn write_posts_request_and_interrupts() {
        for order in ALL {
            let mut r = booted(order);
            let h = r.layout.descr.host;
            let c = r.layout.descr.controller;
            let descr = ServiceDescr::request(Layer::Dp, dp::ACT_PARAM_LOC);

            r.cmi
                .write(&mut r.win, &*r.clock, &descr, &[1, 0x80, 0xc0], false)
                .unwrap();
            let req = r.sim.read_request();
            assert_eq!(req.descr, descr);
            assert_eq!(req.data, vec![1, 0x80, 0xc0]);
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.sema), SEMA_BUSY);
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + c.id), REQ_IRQ);
            assert_eq!(r.fake.take_module_irqs(), 1);

            assert_eq!(r.cmi.finish_write(&mut r.win), Ok(()));
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.sema), SEMA_IDLE);

            r.fake.ctrl_write_u8(COMM_OFF + h.ret_val, 13);
            assert_eq!(r.cmi.finish_write(&mut r.win), Err(Error::InvalidService));
            assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.ret_val), 0);
        }
    }

    #[test]
    fn write_rejects_oversized_payload_untouched() {
        let mut r = booted(ByteOrder::new(Endian::Big, false));
        let h = r.layout.descr.host;
        let descr = ServiceDescr::request(Layer::Dp, dp::DATA_TRANSFER);
        let data = vec![0u8; usize::from(SIM_DATA_BLOCK) + 1];
        assert_eq!(
            r.cmi.write(&mut r.win, &*r.clock, &descr, &data, false),
            Err(Error::PayloadTooLarge)
        );
        assert_eq!(r.fake.ctrl_read_u8(COMM_OFF + h.sema), SEMA_IDLE);
        assert_eq!(r.fake.take_module_irqs(), 0);
    }

    #[test]
    fn event_side_interrupt_skips_pending_wait() {
        let mut r = booted(ByteOrder::new(Endian::Big, false));
        r.win.irq_to_module();
        assert!(r.fake.module_irq_pending());
        let before = r.clock.now();
        r.cmi.irq_to_controller(&mut r.win, &*r.clock, ACK_IRQ, true);
        assert_eq!(r.clock.now(), before);
        assert_eq!(
            r.fake.ctrl_read_u8(COMM_OFF + r.layout.descr.controller.id),
            ACK_IRQ
        );
    }

    #[test]
    fn data_descriptor_access() {
        for order in ALL {
            let mut r = booted(order);
            let io = crate::service::ID_DP_SLAVE_IO_IMAGE;
            let status = crate::service::ID_DP_STATUS_IMAGE;

            r.cmi.set_data_descr(&mut r.win, io, 3, &[7, 8, 9]).unwrap();
            assert_eq!(r.fake.peek(SIM_IO_IMAGE + 3, 3), vec![7, 8, 9]);
            assert_eq!(r.sim.host_claim(0), 0);

            let mut buf = [0u8; 3];
            assert_eq!(r.cmi.get_data_descr(&mut r.win, io, 3, &mut buf), Ok(3));
            assert_eq!(buf, [7, 8, 9]);

            // Clamped to what is left of the area
            let mut big = vec![0u8; 0x300];
            let off = SIM_IO_IMAGE_LEN - 0x10;
            assert_eq!(r.cmi.get_data_descr(&mut r.win, io, off, &mut big), Ok(0x10));

            assert_eq!(
                r.cmi.set_data_descr(&mut r.win, io, SIM_IO_IMAGE_LEN - 1, &[1, 2]),
                Err(Error::PayloadTooLarge)
            );

            r.sim.claim_entry(1, true);
            assert_eq!(
                r.cmi.get_data_descr(&mut r.win, status, 0, &mut buf),
                Err(Error::ServiceConstrConflict)
            );
            assert_eq!(r.sim.host_claim(1), 0);
            r.sim.claim_entry(1, false);

            assert_eq!(
                r.cmi.get_data_descr(&mut r.win, 0x99, 0, &mut buf),
                Err(Error::ServiceNotSupported)
            );
        }
    }

    #[test]
    fn hold_all_keeps_claims_until_released() {
        let mut r = booted(ByteOrder::new(Endian::Little, false));
        let io = crate::service::ID_DP_SLAVE_IO_IMAGE;
        r.cmi.set_hold_all(true);
        let mut buf = [0u8; 4];
        r.cmi.get_data_descr(&mut r.win, io, 0, &mut buf).unwrap();
        r.cmi.set_data_descr(&mut r.win, io, 0x100, &buf).unwrap();
        assert_eq!(r.sim.host_claim(0), DATA_DESCR_CLAIM);

        r.cmi.set_hold_all(false);
        r.cmi.release_all(&mut r.win);
        assert_eq!(r.sim.host_claim(0), 0);
    }
}
