//! Device attachment and the blocking API.
//!
//! A [`Device`] owns the [`Handle`] and the event task.  It is what a
//! device-driver shell holds per module slot: route the module interrupt to
//! [`Device::irq`], call [`Device::init`], enable interrupts, then use the
//! request/confirmation, stack state, channel I/O and con/ind buffer calls.
//!
//! ```ignore
//! let dev = Device::attach(regs, Arc::new(StdClock::new()), config)?;
//! let trigger = dev.irq_trigger();
//! platform.on_interrupt(move || trigger.raise());
//! dev.init()?;
//! dev.irq_enable(true);
//! dev.start_stack()?;
//! let n = dev.read_channel(3, &mut buf)?;
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::byteorder::ByteOrder;
use crate::cmi::CmiConfig;
use crate::event::{ConInd, SLAVE_DIAG_SLOTS, WaitSlot};
use crate::handle::Handle;
use crate::io::{Clock, Registers};
use crate::sem::Semaphore;
use crate::service::{ID_DP_SLAVE_IO_IMAGE, Layer, NEG, ServiceDescr, dp};
use crate::{Error, Result};

/// Tunables for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Host endianness and bus variant
    pub byte_order: ByteOrder,
    /// Bound on each handshake phase, the interrupt-to-controller waits and
    /// the wait for a free request slot
    pub cmi_timeout_ms: u32,
    /// How long a handshaked write waits for the controller to take it
    pub ack_timeout_ms: u32,
    /// How long a caller waits for a confirmation
    pub con_timeout_ms: u32,
    pub poll_interval_ms: u32,
    pub reset_delay_ms: u32,
    /// How long data area accesses retry while the controller owns the area
    pub data_retry_ms: u32,
    /// Con/ind ring size
    pub con_ind_capacity: usize,
    /// Initial timeout of [`Device::receive_con_ind_wait`]
    pub con_ind_timeout_ms: u32,
    /// Process data is exchanged cyclically by the firmware.  Enables the
    /// slave diagnostic chain and the alive check, and routes unsolicited
    /// con/inds to the diagnostic table instead of the ring.
    pub cyclic_data_transfer: bool,
    /// Minimum time between alive check polls
    pub alive_cycle_ms: u32,
    /// How long an alive check poll may go unanswered
    pub alive_timeout_ms: u32,
    pub channels: ChannelMap,
    /// DP address of this master
    pub master_default_address: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            cmi_timeout_ms: 5000,
            ack_timeout_ms: 5000,
            con_timeout_ms: 5000,
            poll_interval_ms: 10,
            reset_delay_ms: 50,
            data_retry_ms: 5000,
            con_ind_capacity: 20,
            con_ind_timeout_ms: 5000,
            cyclic_data_transfer: true,
            alive_cycle_ms: 2000,
            alive_timeout_ms: 1000,
            channels: ChannelMap::default(),
            master_default_address: 1,
        }
    }
}

impl DeviceConfig {
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_cmi_timeout_ms(mut self, ms: u32) -> Self {
        self.cmi_timeout_ms = ms;
        self
    }

    pub fn with_ack_timeout_ms(mut self, ms: u32) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_con_timeout_ms(mut self, ms: u32) -> Self {
        self.con_timeout_ms = ms;
        self
    }

    pub fn with_con_ind_capacity(mut self, capacity: usize) -> Self {
        self.con_ind_capacity = capacity;
        self
    }

    pub fn with_con_ind_timeout_ms(mut self, ms: u32) -> Self {
        self.con_ind_timeout_ms = ms;
        self
    }

    pub fn with_cyclic_data_transfer(mut self, cyclic: bool) -> Self {
        self.cyclic_data_transfer = cyclic;
        self
    }

    pub fn with_alive(mut self, cycle_ms: u32, timeout_ms: u32) -> Self {
        self.alive_cycle_ms = cycle_ms;
        self.alive_timeout_ms = timeout_ms;
        self
    }

    pub fn with_channels(mut self, channels: ChannelMap) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_master_default_address(mut self, address: u8) -> Self {
        self.master_default_address = address;
        self
    }

    /// The part of the configuration the protocol engine uses
    pub fn cmi(&self) -> CmiConfig {
        CmiConfig {
            timeout_ms: self.cmi_timeout_ms,
            poll_interval_ms: self.poll_interval_ms,
            reset_delay_ms: self.reset_delay_ms,
        }
    }
}

/// I/O sizes of one slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub num_in: u16,
    pub num_out: u16,
}

/// Layout of the slave I/O image.
///
/// Channels are DP slave addresses.  Inputs occupy one `max_input_len`
/// stride per slave from the start of the image, outputs follow after
/// `max_slaves` input strides.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelMap {
    pub max_slaves: u16,
    pub lowest_slave_address: u16,
    pub max_input_len: u16,
    pub max_output_len: u16,
    /// Indexed by channel
    pub channels: Vec<ChannelInfo>,
}

impl ChannelMap {
    pub fn new(max_slaves: u16, lowest_slave_address: u16, max_input_len: u16, max_output_len: u16) -> Self {
        Self {
            max_slaves,
            lowest_slave_address,
            max_input_len,
            max_output_len,
            channels: Vec::new(),
        }
    }

    /// Set the I/O sizes of channel `ch`
    pub fn with_channel(mut self, ch: u16, num_in: u16, num_out: u16) -> Self {
        let idx = usize::from(ch);
        if self.channels.len() <= idx {
            self.channels.resize(idx + 1, ChannelInfo::default());
        }
        self.channels[idx] = ChannelInfo { num_in, num_out };
        self
    }

    pub fn channel(&self, ch: u16) -> Option<&ChannelInfo> {
        self.channels.get(usize::from(ch))
    }

    fn stride(&self, ch: u16) -> Result<u32> {
        ch.checked_sub(self.lowest_slave_address)
            .map(u32::from)
            .ok_or(Error::InvalidChannel)
    }

    /// Offset of the channel's inputs in the I/O image
    pub fn input_offset(&self, ch: u16) -> Result<u16> {
        let off = self.stride(ch)? * u32::from(self.max_input_len);
        u16::try_from(off).map_err(|_| Error::InvalidChannel)
    }

    /// Offset of the output area in the I/O image
    pub fn output_area(&self) -> u32 {
        u32::from(self.max_slaves) * u32::from(self.max_input_len)
    }

    /// Offset of the channel's outputs in the I/O image
    pub fn output_offset(&self, ch: u16) -> Result<u16> {
        let off = self.output_area() + self.stride(ch)? * u32::from(self.max_output_len);
        u16::try_from(off).map_err(|_| Error::InvalidChannel)
    }

    pub fn input_area_len(&self) -> usize {
        usize::from(self.max_slaves) * usize::from(self.max_input_len)
    }

    pub fn output_area_len(&self) -> usize {
        usize::from(self.max_slaves) * usize::from(self.max_output_len)
    }
}

/// DP master stack states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DpState {
    Offline = dp::ST_OFFLINE,
    Stop = dp::ST_STOP,
    Clear = dp::ST_CLEAR,
    Operate = dp::ST_OPERATE,
}

/// Cloneable interrupt entry, for platforms that route the interrupt from
/// somewhere that cannot hold the [`Device`].
#[derive(Clone)]
pub struct IrqTrigger {
    isr: Arc<Semaphore>,
}

impl IrqTrigger {
    /// Wake the event task.  Safe from any context that may signal.
    pub fn raise(&self) {
        self.isr.signal();
    }
}

/// An attached M57 with its event task
pub struct Device<R: Registers + 'static, C: Clock + 'static> {
    handle: Arc<Handle<R, C>>,
    task: Option<JoinHandle<()>>,
    /// Held from posting a request until its confirmation is taken
    exchange: Mutex<()>,
}

impl<R: Registers + 'static, C: Clock + 'static> Device<R, C> {
    /// Create the handle and start the event task.  The controller is not
    /// touched until [`Self::init`].
    pub fn attach(regs: R, clock: Arc<C>, config: DeviceConfig) -> Result<Self> {
        let handle = Arc::new(Handle::new(regs, clock, config));
        let task_handle = Arc::clone(&handle);
        let task = thread::Builder::new()
            .name("profidp-event".into())
            .spawn(move || task_handle.run_events())
            .map_err(|e| {
                error!("Event task not started: {e}");
                Error::EventTask
            })?;
        info!("Device attached");
        Ok(Self {
            handle,
            task: Some(task),
            exchange: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> &Arc<Handle<R, C>> {
        &self.handle
    }

    /// Reset the controller and bring it to communication mode
    pub fn init(&self) -> Result<()> {
        self.handle.init()
    }

    /// Interrupt entry.  Only signals the event task.
    pub fn irq(&self) {
        self.handle.isr.signal();
    }

    pub fn irq_trigger(&self) -> IrqTrigger {
        IrqTrigger {
            isr: Arc::clone(&self.handle.isr),
        }
    }

    pub fn irq_enable(&self, enable: bool) {
        self.handle.irq_enable(enable);
    }

    /// Keep data area claims across channel accesses, for reading or
    /// writing several channels of one image consistently
    pub fn hold_all_channels(&self, hold: bool) {
        self.handle.set_hold_all(hold);
    }

    fn exchange(&self) -> MutexGuard<'_, ()> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the request slot without blocking, for the async client.  The
    /// guard keeps blocking callers out until the client has its con/ind.
    pub(crate) fn try_claim_request(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = match self.exchange.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        self.handle.try_claim_request(None).then_some(guard)
    }

    /// Send a user request, optionally arming the confirmation wait slot.
    ///
    /// Waits for any exchange in progress through [`Self::req_con`], the
    /// previous request and any outstanding diagnostic poll to clear first.
    /// Returns once the controller has taken the request.  Use
    /// [`Self::req_con`] to also wait for the confirmation.
    pub fn send_req_res_usr(
        &self,
        descr: &mut ServiceDescr,
        data: &[u8],
        wait_confirmation: bool,
    ) -> Result<()> {
        let _exchange = self.exchange();
        self.post_usr(descr, data, wait_confirmation)
    }

    fn post_usr(
        &self,
        descr: &mut ServiceDescr,
        data: &[u8],
        wait_confirmation: bool,
    ) -> Result<()> {
        let h = &*self.handle;
        let slot = if wait_confirmation {
            let layer = Layer::try_from(descr.layer)?.user();
            Some(WaitSlot::confirmation(layer, descr.service))
        } else {
            None
        };

        h.con.clear();
        let start = h.clock().ticks();
        while !h.try_claim_request(slot) {
            if h.clock().expired(start, h.config().cmi_timeout_ms) {
                error!("Request slot still busy, service {:#04x}", descr.service);
                return Err(Error::NoControllerResponse);
            }
            h.clock().delay_ms(1);
        }

        let result = h.send_req_res(descr, data, true);
        if result.is_err() {
            h.release_request();
        }
        result
    }

    /// Send a request and block until its confirmation arrives.
    ///
    /// Exchanges from several threads are serialised.  A negative
    /// confirmation with a non-zero status is an error; one with a zero
    /// status is returned like a positive one.
    pub fn req_con(&self, layer: Layer, service: u8, data: &[u8]) -> Result<ConInd> {
        let _exchange = self.exchange();
        let mut descr = ServiceDescr::request(layer, service);
        self.post_usr(&mut descr, data, true)?;

        let timeout = Duration::from_millis(u64::from(self.handle.config().con_timeout_ms));
        let arrived = self.handle.con.wait(timeout);
        let con = {
            let mut s = self.handle.lock();
            s.ev.wait_for = None;
            s.ev.confirmation.take()
        };
        let Some(con) = con else {
            error!("No confirmation for service {service:#04x}");
            return Err(Error::Timeout);
        };
        if !arrived {
            debug!("Confirmation for {service:#04x} arrived as the wait expired");
        }
        if !WaitSlot::confirmation(layer.user(), service).matches(&con.descr) {
            error!(
                "Confirmation for service {:#04x} taken while waiting for {service:#04x}",
                con.descr.service
            );
            return Err(Error::Timeout);
        }

        if con.descr.result == NEG {
            let status = con.status();
            if status != 0 {
                warn!("Service {service:#04x} confirmed negative, status {status:#06x}");
                return Err(Error::NegativeConfirmation(status));
            }
        }
        Ok(con)
    }

    /// Move the master stack to `state`
    pub fn set_stack_state(&self, state: DpState) -> Result<()> {
        debug!("Stack state {state:?}");
        // rem_add, area_code, activate, dummy
        let req = [
            self.handle.config().master_default_address,
            dp::AREA_SET_MODE,
            state as u8,
            0,
        ];
        self.req_con(Layer::Dp, dp::ACT_PARAM_LOC, &req).map(|_| ())
    }

    /// STOP, CLEAR, OPERATE
    pub fn start_stack(&self) -> Result<()> {
        for state in [DpState::Stop, DpState::Clear, DpState::Operate] {
            self.set_stack_state(state)?;
        }
        info!("Stack operating");
        Ok(())
    }

    /// CLEAR, STOP
    pub fn stop_stack(&self) -> Result<()> {
        for state in [DpState::Clear, DpState::Stop] {
            self.set_stack_state(state)?;
        }
        info!("Stack stopped");
        Ok(())
    }

    /// Run a data transfer and return the confirmation payload
    pub fn data_transfer(&self) -> Result<Vec<u8>> {
        self.req_con(Layer::Dp, dp::DATA_TRANSFER, &[]).map(|c| c.data)
    }

    /// Fetch the next slave diagnostic directly
    pub fn get_slave_diag(&self) -> Result<Vec<u8>> {
        self.req_con(Layer::Dp, dp::GET_SLAVE_DIAG, &[]).map(|c| c.data)
    }

    /// Last diagnostic data received from slave `addr` by the diagnostic
    /// chain
    pub fn slave_diag(&self, addr: u8) -> Result<Vec<u8>> {
        if usize::from(addr) >= SLAVE_DIAG_SLOTS {
            return Err(Error::InvalidChannel);
        }
        Ok(self.handle.lock().ev.slave_diag[usize::from(addr)].clone())
    }

    /// Return and clear the FM2 event reason bits
    pub fn take_fm2_reason(&self) -> u8 {
        std::mem::take(&mut self.handle.lock().ev.fm2_reason)
    }

    fn channels(&self) -> &ChannelMap {
        &self.handle.config().channels
    }

    fn input_channel(&self, ch: u16) -> Result<&ChannelInfo> {
        let map = self.channels();
        map.channel(ch)
            .filter(|c| c.num_in != 0 && ch >= map.lowest_slave_address)
            .ok_or(Error::InvalidChannel)
    }

    fn output_channel(&self, ch: u16) -> Result<&ChannelInfo> {
        let map = self.channels();
        map.channel(ch)
            .filter(|c| c.num_out != 0 && ch >= map.lowest_slave_address)
            .ok_or(Error::InvalidChannel)
    }

    /// Read the inputs of slave `ch` into `buf`.  Returns the number of
    /// bytes read.
    pub fn read_channel(&self, ch: u16, buf: &mut [u8]) -> Result<usize> {
        let len = usize::from(self.input_channel(ch)?.num_in);
        if buf.len() < len {
            return Err(Error::BufferTooSmall { required: len });
        }
        let offset = self.channels().input_offset(ch)?;
        let n = self
            .handle
            .get_data(ID_DP_SLAVE_IO_IMAGE, offset, &mut buf[..len])?;
        self.handle.alive_check()?;
        Ok(n)
    }

    /// Write the outputs of slave `ch` from the start of `buf`.  Returns the
    /// number of bytes written.
    pub fn write_channel(&self, ch: u16, buf: &[u8]) -> Result<usize> {
        let len = usize::from(self.output_channel(ch)?.num_out);
        if buf.len() < len {
            return Err(Error::BufferTooSmall { required: len });
        }
        let offset = self.channels().output_offset(ch)?;
        self.handle
            .set_data(ID_DP_SLAVE_IO_IMAGE, offset, &buf[..len])?;
        self.handle.alive_check()?;
        Ok(len)
    }

    /// Read the whole input area, up to `buf.len()` bytes
    pub fn read_all_inputs(&self, buf: &mut [u8]) -> Result<usize> {
        let map = self.channels();
        if map.max_input_len == 0 {
            return Err(Error::NoInputs);
        }
        let len = buf.len().min(map.input_area_len());
        let n = self
            .handle
            .get_data(ID_DP_SLAVE_IO_IMAGE, 0, &mut buf[..len])?;
        self.handle.alive_check()?;
        Ok(n)
    }

    /// Write `buf` to the start of the output area
    pub fn write_all_outputs(&self, buf: &[u8]) -> Result<()> {
        let map = self.channels();
        if buf.len() > map.output_area_len() {
            return Err(Error::PayloadTooLarge);
        }
        if map.max_output_len == 0 {
            return Err(Error::NoOutputs);
        }
        let offset = u16::try_from(map.output_area()).map_err(|_| Error::NoOutputs)?;
        self.handle.set_data(ID_DP_SLAVE_IO_IMAGE, offset, buf)?;
        self.handle.alive_check()
    }

    pub fn max_input_len(&self) -> u16 {
        self.channels().max_input_len
    }

    pub fn max_output_len(&self) -> u16 {
        self.channels().max_output_len
    }

    pub fn channel_input_len(&self, ch: u16) -> u16 {
        self.channels().channel(ch).map_or(0, |c| c.num_in)
    }

    pub fn channel_output_len(&self, ch: u16) -> u16 {
        self.channels().channel(ch).map_or(0, |c| c.num_out)
    }

    /// Take the oldest buffered con/ind.  [`Error::NoData`] when empty.
    pub fn receive_con_ind(&self) -> Result<ConInd> {
        let item = self.handle.lock().ev.ring.pop();
        match item {
            Some(ci) => {
                self.handle.con_buf.try_wait();
                Ok(ci)
            }
            None => Err(Error::NoData),
        }
    }

    /// Take the oldest buffered con/ind, waiting up to the con/ind timeout
    /// for one to arrive
    pub fn receive_con_ind_wait(&self) -> Result<ConInd> {
        let timeout = Duration::from_millis(u64::from(self.handle.con_ind_timeout_ms()));
        if !self.handle.con_buf.wait(timeout) {
            return Err(Error::Timeout);
        }
        self.handle.lock().ev.ring.pop().ok_or(Error::NoData)
    }

    pub fn num_con_ind(&self) -> usize {
        self.handle.lock().ev.ring.len()
    }

    /// Whether a con/ind was dropped since the last one was accepted
    pub fn con_ind_overflow(&self) -> bool {
        self.handle.lock().ev.ring.overflow()
    }

    pub fn set_con_ind_timeout(&self, ms: u32) {
        self.handle.set_con_ind_timeout_ms(ms);
    }

    /// Install the user notification, replacing any previous one
    pub fn set_signal(&self, signal: impl Fn() + Send + Sync + 'static) {
        self.handle.set_signal(Some(Box::new(signal)));
    }

    pub fn clear_signal(&self) {
        self.handle.set_signal(None);
    }

    /// Handled interrupts since attach or the last reset
    pub fn irq_count(&self) -> u32 {
        self.handle.lock().ev.irq_count
    }

    pub fn reset_irq_count(&self) {
        self.handle.lock().ev.irq_count = 0;
    }
}

impl<R: Registers + 'static, C: Clock + 'static> Drop for Device<R, C> {
    fn drop(&mut self) {
        self.handle.irq_enable(false);
        self.handle.request_stop();
        if let Some(task) = self.task.take() {
            if task.join().is_err() {
                error!("Event task panicked");
            }
        }
        info!("Device detached");
    }
}
