//! Test doubles: an instrumented M57 register model, a deterministic clock
//! and a scripted controller.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::byteorder::ByteOrder;
use crate::io::{Clock, Registers};
use crate::layout::{COMM_OFF, DataDescrLayout, Layout, RegisterLayout, WINDOW_MASK};
use crate::service::ServiceDescr;
use crate::window::Control;

pub const DPRAM_SIZE: usize = 0x2_0000;

struct FakeState {
    mem: Vec<u8>,
    wptr: u32,
    flip: u32,
    enable: bool,
    module_irq_pending: bool,
    module_irqs: u32,
    id_reg: u8,
    window_owner: Option<ThreadId>,
    violations: u32,
}

impl FakeState {
    fn idx(&self, addr: u32) -> usize {
        (addr as usize) & (DPRAM_SIZE - 1)
    }

    fn word(&self, addr: u32) -> u16 {
        let a = self.idx(addr & !1);
        u16::from_be_bytes([self.mem[a], self.mem[a + 1]])
    }

    fn set_word(&mut self, addr: u32, value: u16) {
        let a = self.idx(addr & !1);
        self.mem[a..a + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn check_owner(&mut self) {
        if self.window_owner != Some(thread::current().id()) {
            self.violations += 1;
        }
    }

    fn window_at(&mut self, offset: u32) -> u32 {
        self.check_owner();
        (self.wptr & WINDOW_MASK) + offset
    }

    fn data_port_access(&mut self) -> u32 {
        self.check_owner();
        let at = self.wptr & !1;
        self.wptr = self.wptr.wrapping_add(2);
        at
    }

    fn control(&self) -> u8 {
        let mut c = Control::empty();
        if !self.module_irq_pending {
            c |= Control::IRQ_TO_MODULE;
        }
        if self.enable {
            c |= Control::IRQ_ENABLE;
        }
        c.bits()
    }

    fn set_control(&mut self, value: u8) {
        let c = Control::from_bits_retain(value);
        self.enable = c.contains(Control::IRQ_ENABLE);
        if c.contains(Control::IRQ_TO_MODULE) {
            self.module_irq_pending = true;
            self.module_irqs += 1;
        }
    }
}

/// In-memory M57: DPRAM, window pointer, data port and control registers.
///
/// Word accesses see big endian words, byte accesses are XORed with the
/// lane flip of the configured byte order.  Every data port access made by
/// a thread other than the one that last positioned the window counts as a
/// torn-window violation.
#[derive(Clone)]
pub struct FakeM57 {
    state: Arc<Mutex<FakeState>>,
}

impl FakeM57 {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                mem: vec![0; DPRAM_SIZE],
                wptr: 0,
                flip: u32::from(order.word_little()),
                enable: false,
                module_irq_pending: false,
                module_irqs: 0,
                id_reg: 0,
                window_owner: None,
                violations: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn window_pointer(&self) -> u32 {
        self.lock().wptr
    }

    pub fn violations(&self) -> u32 {
        self.lock().violations
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let s = self.lock();
        let a = s.idx(addr);
        s.mem[a..a + len].to_vec()
    }

    pub fn poke(&self, addr: u32, data: &[u8]) {
        let mut s = self.lock();
        let a = s.idx(addr);
        s.mem[a..a + data.len()].copy_from_slice(data);
    }

    pub fn take_module_irqs(&self) -> u32 {
        std::mem::take(&mut self.lock().module_irqs)
    }

    pub fn module_irq_pending(&self) -> bool {
        self.lock().module_irq_pending
    }

    /// The module has taken the interrupt
    pub fn module_idle(&self) {
        self.lock().module_irq_pending = false;
    }

    pub fn host_irq_enabled(&self) -> bool {
        self.lock().enable
    }

    pub fn in_reset(&self) -> bool {
        self.lock().id_reg & crate::window::RESET_ASSERT != 0
    }

    // Controller side accessors, addressed with host layout offsets

    pub fn ctrl_read_u8(&self, addr: u32) -> u8 {
        let s = self.lock();
        s.mem[s.idx(addr ^ s.flip)]
    }

    pub fn ctrl_write_u8(&self, addr: u32, value: u8) {
        let mut s = self.lock();
        let a = s.idx(addr ^ s.flip);
        s.mem[a] = value;
    }

    pub fn ctrl_read_u16(&self, addr: u32) -> u16 {
        self.lock().word(addr)
    }

    pub fn ctrl_write_u16(&self, addr: u32, value: u16) {
        self.lock().set_word(addr, value)
    }

    pub fn ctrl_read_u32(&self, addr: u32) -> u32 {
        let s = self.lock();
        (u32::from(s.word(addr)) << 16) | u32::from(s.word(addr + 2))
    }

    pub fn ctrl_write_u32(&self, addr: u32, value: u32) {
        let mut s = self.lock();
        s.set_word(addr, (value >> 16) as u16);
        s.set_word(addr + 2, value as u16);
    }
}

impl Registers for FakeM57 {
    fn read_u8(&mut self, offset: u32) -> u8 {
        let mut s = self.lock();
        match offset {
            0..0x80 => {
                let flip = s.flip;
                let at = s.window_at(offset ^ flip);
                s.mem[s.idx(at)]
            }
            0x80 | 0x81 => {
                let lane = (offset - RegisterLayout::DATA_PORT) ^ s.flip;
                let at = s.data_port_access();
                s.mem[s.idx(at + lane)]
            }
            0xfe | 0xff => {
                if offset ^ s.flip == 0xfe {
                    s.control()
                } else {
                    s.id_reg
                }
            }
            _ => 0xff,
        }
    }

    fn write_u8(&mut self, offset: u32, value: u8) {
        let mut s = self.lock();
        match offset {
            0..0x80 => {
                let flip = s.flip;
                let at = s.window_at(offset ^ flip);
                let a = s.idx(at);
                s.mem[a] = value;
            }
            0x80 | 0x81 => {
                let lane = (offset - RegisterLayout::DATA_PORT) ^ s.flip;
                let at = s.data_port_access();
                let a = s.idx(at + lane);
                s.mem[a] = value;
            }
            0xfe | 0xff => {
                if offset ^ s.flip == 0xfe {
                    s.set_control(value);
                } else {
                    s.id_reg = value;
                }
            }
            _ => {}
        }
    }

    fn read_u16(&mut self, offset: u32) -> u16 {
        let mut s = self.lock();
        match offset {
            0..0x80 => {
                let at = s.window_at(offset);
                s.word(at)
            }
            RegisterLayout::DATA_PORT => {
                let at = s.data_port_access();
                s.word(at)
            }
            RegisterLayout::WINDOW_HI => (s.wptr >> 16) as u16,
            RegisterLayout::WINDOW_LO => s.wptr as u16,
            _ => 0xffff,
        }
    }

    fn write_u16(&mut self, offset: u32, value: u16) {
        let mut s = self.lock();
        match offset {
            0..0x80 => {
                let at = s.window_at(offset);
                s.set_word(at, value);
            }
            RegisterLayout::DATA_PORT => {
                let at = s.data_port_access();
                s.set_word(at, value);
            }
            RegisterLayout::WINDOW_HI => {
                s.wptr = (s.wptr & 0xffff) | (u32::from(value) << 16);
                s.window_owner = Some(thread::current().id());
            }
            RegisterLayout::WINDOW_LO => {
                s.wptr = (s.wptr & 0xffff_0000) | u32::from(value);
                s.window_owner = Some(thread::current().id());
            }
            _ => {}
        }
    }
}

type Hook = Box<dyn FnMut() + Send>;

/// Millisecond clock that only moves when somebody delays.
///
/// `delay_ms` advances time and then runs the installed hook, letting a
/// scripted controller make progress between host polls.
/// After [`FakeClock::follow_wall_clock`] it instead tracks real time from
/// the current tick, for tests with threads that wait on real semaphores.
#[derive(Default)]
pub struct FakeClock {
    now: AtomicU32,
    delays: AtomicU32,
    hook: Mutex<Option<Hook>>,
    wall: Mutex<Option<(Instant, u32)>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hook(&self, hook: impl FnMut() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn now(&self) -> u32 {
        match *self.wall.lock().unwrap() {
            Some((since, base)) => base.wrapping_add(since.elapsed().as_millis() as u32),
            None => self.now.load(Ordering::SeqCst),
        }
    }

    /// Drop the hook and let time pass in real time from here on
    pub fn follow_wall_clock(&self) {
        *self.hook.lock().unwrap() = None;
        let base = self.now.load(Ordering::SeqCst);
        *self.wall.lock().unwrap() = Some((Instant::now(), base));
    }

    pub fn delays(&self) -> u32 {
        self.delays.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn ticks(&self) -> u32 {
        self.now()
    }

    fn tick_rate(&self) -> u32 {
        1000
    }

    fn delay_ms(&self, ms: u32) {
        self.delays.fetch_add(1, Ordering::SeqCst);
        if self.wall.lock().unwrap().is_some() {
            thread::sleep(Duration::from_millis(u64::from(ms)));
            return;
        }
        self.now.fetch_add(ms, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook();
        }
        thread::yield_now();
    }
}

/// Controller-space address of the CMI descriptor block
pub const SIM_C_BASE: u32 = 0x0010_8000;
pub const SIM_H_PARAM: u32 = 0x8040;
pub const SIM_C_PARAM: u32 = 0x8050;
pub const SIM_DATA_DESCR: u32 = 0x8060;
pub const SIM_H_DATA: u32 = 0x8100;
pub const SIM_C_DATA: u32 = 0x8200;
pub const SIM_DATA_BLOCK: u16 = 0x100;
pub const SIM_IO_IMAGE: u32 = 0x9000;
pub const SIM_IO_IMAGE_LEN: u16 = 0x200;
pub const SIM_STATUS_IMAGE: u32 = 0x9200;
pub const SIM_STATUS_IMAGE_LEN: u16 = 0x40;

const H_READY: u32 = 0x1E2D_4B87;
const C_READY: u32 = 0xE1D2_B478;
const CONFIG_MODE: u8 = 5;

fn to_ctrl(addr: u32) -> u32 {
    addr - COMM_OFF + SIM_C_BASE
}

/// A received request as seen by the scripted controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimRequest {
    pub descr: ServiceDescr,
    pub data: Vec<u8>,
}

type Script = Box<dyn FnMut(&SimRequest) -> Vec<(ServiceDescr, Vec<u8>)> + Send>;

struct SimState {
    boot_after: u32,
    polls: u32,
    boots: u32,
}

/// Scripted coprocessor.
///
/// Boots once the host ready mask has been seen on `boot_after` polls, and
/// enters config mode on the poll after the host asks for it.  With
/// [`SimController::spawn`] it also serves requests from a thread.
#[derive(Clone)]
pub struct SimController {
    fake: FakeM57,
    layout: Layout,
    state: Arc<Mutex<SimState>>,
}

impl SimController {
    pub fn new(fake: FakeM57, order: ByteOrder, boot_after: u32) -> Self {
        Self {
            fake,
            layout: Layout::new(order),
            state: Arc::new(Mutex::new(SimState {
                boot_after,
                polls: 0,
                boots: 0,
            })),
        }
    }

    pub fn boots(&self) -> u32 {
        self.state.lock().unwrap().boots
    }

    fn h(&self, field: u32) -> u32 {
        COMM_OFF + field
    }

    /// One controller step, normally run from the clock hook
    pub fn step(&self) {
        let mut st = self.state.lock().unwrap();
        let d = self.layout.descr;
        if self.fake.in_reset() {
            st.polls = 0;
            return;
        }

        let host_ready = self.fake.ctrl_read_u32(self.h(d.host.ready_mask)) == H_READY;
        let ctrl_ready = self.fake.ctrl_read_u32(self.h(d.controller.ready_mask)) == C_READY;
        if host_ready && !ctrl_ready {
            st.polls += 1;
            if st.polls >= st.boot_after {
                drop(st);
                self.boot();
                return;
            }
        }

        if ctrl_ready
            && self.fake.ctrl_read_u8(self.h(d.host.state)) == CONFIG_MODE
            && self.fake.ctrl_read_u8(self.h(d.controller.state)) != CONFIG_MODE
        {
            self.fake.ctrl_write_u8(self.h(d.controller.state), CONFIG_MODE);
        }
    }

    fn boot(&self) {
        let d = self.layout.descr;
        let f = &self.fake;
        f.ctrl_write_u32(self.h(d.controller.base_address), SIM_C_BASE);
        f.ctrl_write_u32(self.h(d.host.param_addr), to_ctrl(SIM_H_PARAM));
        f.ctrl_write_u32(self.h(d.host.data_addr), to_ctrl(SIM_H_DATA));
        f.ctrl_write_u32(self.h(d.host.data_descr_addr), to_ctrl(SIM_DATA_DESCR));
        f.ctrl_write_u16(self.h(d.host.param_size), ServiceDescr::LEN as u16);
        f.ctrl_write_u16(self.h(d.host.data_size), SIM_DATA_BLOCK);
        f.ctrl_write_u32(self.h(d.controller.param_addr), to_ctrl(SIM_C_PARAM));
        f.ctrl_write_u32(self.h(d.controller.data_addr), to_ctrl(SIM_C_DATA));
        f.ctrl_write_u8(self.h(d.controller.int_enable), 0x03);
        f.ctrl_write_u8(self.h(d.controller.ret_val), 0);
        f.ctrl_write_u8(self.h(d.controller.id), 0);
        f.ctrl_write_u8(self.h(d.controller.state), 0);

        let dd = self.layout.data_descr;
        let entries = [
            (0x80, SIM_IO_IMAGE, SIM_IO_IMAGE_LEN),
            (0x81, SIM_STATUS_IMAGE, SIM_STATUS_IMAGE_LEN),
        ];
        for (i, (id, addr, len)) in entries.into_iter().enumerate() {
            let e = SIM_DATA_DESCR + DataDescrLayout::entry(i as u32);
            f.ctrl_write_u8(e + dd.id, id);
            f.ctrl_write_u8(e + dd.sema_h, 0);
            f.ctrl_write_u8(e + dd.sema_c, 0);
            f.ctrl_write_u16(e + dd.data_size, len);
            f.ctrl_write_u32(e + dd.data_addr, to_ctrl(addr));
        }
        let end = SIM_DATA_DESCR + DataDescrLayout::entry(entries.len() as u32);
        f.ctrl_write_u8(end + dd.id, 0);

        f.ctrl_write_u32(self.h(d.controller.ready_mask), C_READY);
        self.state.lock().unwrap().boots += 1;
    }

    /// Mark a data descriptor entry as owned by the controller
    pub fn claim_entry(&self, index: u32, claimed: bool) {
        let e = SIM_DATA_DESCR + DataDescrLayout::entry(index);
        self.fake
            .ctrl_write_u8(e + self.layout.data_descr.sema_c, u8::from(claimed));
    }

    pub fn host_claim(&self, index: u32) -> u8 {
        let e = SIM_DATA_DESCR + DataDescrLayout::entry(index);
        self.fake.ctrl_read_u8(e + self.layout.data_descr.sema_h)
    }

    /// Place a confirmation or indication in the controller blocks and mark
    /// it pending, without raising an interrupt.
    pub fn post_con_ind(&self, descr: &ServiceDescr, data: &[u8]) {
        let d = self.layout.descr;
        self.fake.poke(SIM_C_PARAM, &descr.to_bytes());
        self.fake.poke(SIM_C_DATA, data);
        self.fake
            .ctrl_write_u16(self.h(d.controller.data_size), data.len() as u16);
        self.fake.ctrl_write_u8(self.h(d.controller.sema), 1);
    }

    pub fn con_ind_pending(&self) -> bool {
        self.fake
            .ctrl_read_u8(self.h(self.layout.descr.controller.sema))
            != 0
    }

    /// The request currently held in the host blocks
    pub fn read_request(&self) -> SimRequest {
        let d = self.layout.descr;
        let raw = self.fake.peek(SIM_H_PARAM, ServiceDescr::LEN);
        let mut b = [0u8; ServiceDescr::LEN];
        b.copy_from_slice(&raw);
        let len = self.fake.ctrl_read_u16(self.h(d.host.data_size)) as usize;
        SimRequest {
            descr: ServiceDescr::from_bytes(&b),
            data: self.fake.peek(SIM_H_DATA, len),
        }
    }

    fn wait_for(&self, mut cond: impl FnMut() -> bool, stop: &AtomicBool) -> bool {
        let start = Instant::now();
        while !cond() {
            if stop.load(Ordering::SeqCst) || start.elapsed() > Duration::from_secs(5) {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn raise(&self, irq: &(dyn Fn() + Send + Sync), stop: &AtomicBool) {
        if self.wait_for(|| self.fake.host_irq_enabled(), stop) {
            irq();
        }
    }

    fn serve_once(
        &self,
        script: &mut Script,
        irq: &(dyn Fn() + Send + Sync),
        log: &Mutex<Vec<SimRequest>>,
        stop: &AtomicBool,
    ) {
        let d = self.layout.descr;
        let c_id = self.h(d.controller.id);
        let h_id = self.h(d.host.id);
        match self.fake.ctrl_read_u8(c_id) {
            0xf0 => {
                let req = self.read_request();
                self.fake.ctrl_write_u8(self.h(d.host.ret_val), 0);
                self.fake.ctrl_write_u8(c_id, 0);
                self.fake.module_idle();
                log.lock().unwrap().push(req.clone());

                // A confirmation may still sit in the host mailbox
                if !self.wait_for(|| self.fake.ctrl_read_u8(h_id) == 0, stop) {
                    return;
                }
                self.fake.ctrl_write_u8(h_id, 0xf0);
                self.raise(irq, stop);

                for (descr, data) in script(&req) {
                    let idle = self.wait_for(
                        || self.fake.ctrl_read_u8(h_id) == 0 && !self.con_ind_pending(),
                        stop,
                    );
                    if !idle {
                        return;
                    }
                    self.post_con_ind(&descr, &data);
                    self.fake.ctrl_write_u8(h_id, 0x0f);
                    self.raise(irq, stop);
                }
            }
            _ => {
                self.fake.ctrl_write_u8(c_id, 0);
                self.fake.module_idle();
            }
        }
    }

    /// Serve requests from a thread until the returned [`SimRunner`] is
    /// dropped.  `irq` raises the host interrupt.
    pub fn spawn(
        self,
        irq: impl Fn() + Send + Sync + 'static,
        script: impl FnMut(&SimRequest) -> Vec<(ServiceDescr, Vec<u8>)> + Send + 'static,
    ) -> SimRunner {
        let stop = Arc::new(AtomicBool::new(false));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (stop2, log2) = (Arc::clone(&stop), Arc::clone(&log));
        let mut script: Script = Box::new(script);
        let thread = thread::spawn(move || {
            while !stop2.load(Ordering::SeqCst) {
                if self.fake.module_irq_pending() {
                    self.serve_once(&mut script, &irq, &log2, &stop2);
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        });
        SimRunner {
            stop,
            log,
            thread: Some(thread),
        }
    }
}

/// Handle to a running [`SimController`] thread
pub struct SimRunner {
    stop: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<SimRequest>>>,
    thread: Option<JoinHandle<()>>,
}

impl SimRunner {
    pub fn requests(&self) -> Vec<SimRequest> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for SimRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
