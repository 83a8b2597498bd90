//! Service descriptors and the service dispatch layer.
//!
//! Every request, response, confirmation and indication exchanged with the
//! controller starts with an 8-byte [`ServiceDescr`], followed by a service
//! specific payload.  Before a request goes out its payload length is
//! resolved per layer and service: either a fixed structure size, or a
//! header plus a big endian length field inside the payload, bound-checked
//! against the service maximum.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::handle::Handle;
use crate::io::{Clock, Registers};
use crate::{Error, Result};

/// Highest valid communication reference
pub const MAX_COMREF: u16 = 128;

/// Positive service result
pub const POS: i16 = 0;
/// Negative service result
pub const NEG: i16 = 1;

/// Process image of the slave inputs and outputs
pub const ID_DP_SLAVE_IO_IMAGE: u8 = 0x80;
/// Status image
pub const ID_DP_STATUS_IMAGE: u8 = 0x81;
/// Exception image
pub const ID_EXCEPTION_IMAGE: u8 = 0xF0;
/// Firmware version image
pub const ID_FW_VERS_IMAGE: u8 = 0xF1;

/// Protocol layers.  The `*Usr` variants address the user side of a layer
/// and carry its confirmations and indications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Layer {
    Usr = 0x00,
    Fms = 0x01,
    Lli = 0x02,
    Fdl = 0x03,
    Fm7 = 0x04,
    Fmb = 0x05,
    FmsUsr = 0x06,
    Fm7Usr = 0x07,
    FmbUsr = 0x08,
    Sm7 = 0x09,
    Sm7Usr = 0x0A,
    Dp = 0x0B,
    DpUsr = 0x0C,
    FdlIf = 0x0D,
    FdlIfUsr = 0x0E,
}

impl TryFrom<u8> for Layer {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => Layer::Usr,
            0x01 => Layer::Fms,
            0x02 => Layer::Lli,
            0x03 => Layer::Fdl,
            0x04 => Layer::Fm7,
            0x05 => Layer::Fmb,
            0x06 => Layer::FmsUsr,
            0x07 => Layer::Fm7Usr,
            0x08 => Layer::FmbUsr,
            0x09 => Layer::Sm7,
            0x0A => Layer::Sm7Usr,
            0x0B => Layer::Dp,
            0x0C => Layer::DpUsr,
            0x0D => Layer::FdlIf,
            0x0E => Layer::FdlIfUsr,
            _ => return Err(Error::InvalidLayer),
        })
    }
}

impl Layer {
    /// Layer that carries the confirmations for requests sent to `self`
    pub const fn user(self) -> Layer {
        match self {
            Layer::Dp => Layer::DpUsr,
            _ => Layer::FmbUsr,
        }
    }
}

/// Service primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Primitive {
    Req = 0,
    Con = 1,
    Ind = 2,
    Res = 3,
}

impl TryFrom<u8> for Primitive {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Primitive::Req,
            1 => Primitive::Con,
            2 => Primitive::Ind,
            3 => Primitive::Res,
            _ => return Err(Error::InvalidPrimitive),
        })
    }
}

/// DP service identifiers
pub mod dp {
    pub const SET_PRM: u8 = 0x01;
    pub const CHK_CFG: u8 = 0x02;
    pub const SLAVE_DIAG: u8 = 0x03;
    pub const RD_INP: u8 = 0x04;
    pub const RD_OUTP: u8 = 0x05;
    pub const DATA_EXCHANGE: u8 = 0x06;
    pub const GET_CFG: u8 = 0x07;
    pub const SET_SLAVE_ADD: u8 = 0x08;
    pub const GLOBAL_CONTROL: u8 = 0x09;
    pub const DOWNLOAD: u8 = 0x0A;
    pub const UPLOAD: u8 = 0x0B;
    pub const START_SEQ: u8 = 0x0C;
    pub const END_SEQ: u8 = 0x0D;
    pub const ACT_PARAM: u8 = 0x0E;
    pub const GET_MASTER_DIAG: u8 = 0x0F;
    pub const ACT_PARA_BRCT: u8 = 0x10;
    pub const DOWNLOAD_LOC: u8 = 0x11;
    pub const UPLOAD_LOC: u8 = 0x12;
    pub const START_SEQ_LOC: u8 = 0x13;
    pub const END_SEQ_LOC: u8 = 0x14;
    pub const ACT_PARAM_LOC: u8 = 0x15;
    pub const SET_PRM_LOC: u8 = 0x16;
    pub const INIT_MASTER: u8 = 0x17;
    pub const DATA_TRANSFER: u8 = 0x18;
    pub const GET_SLAVE_DIAG: u8 = 0x19;

    /// Area code of ACT_PARAM_LOC selecting the stack operating mode
    pub const AREA_SET_MODE: u8 = 0x80;
    /// Area code of ACT_PARAM_LOC selecting the bus parameters
    pub const AREA_BUS_PARAM: u8 = 0x7F;

    pub const MAX_TELEGRAM_LEN: usize = 244;
    pub const MAX_NUMBER_SLAVES: usize = 126;

    pub const GLOBAL_CONTROL_REQ_LEN: usize = 4;
    pub const ACT_PARAM_REQ_LEN: usize = 4;
    pub const INIT_MASTER_REQ_LEN: usize = 8;
    pub const UPLOAD_REQ_LEN: usize = 6;
    pub const START_SEQ_REQ_LEN: usize = 4;
    pub const END_SEQ_REQ_LEN: usize = 2;
    /// GET_CFG, SLAVE_DIAG, RD_INP and RD_OUTP requests: address and
    /// padding
    pub const SLAVE_ADDR_REQ_LEN: usize = 2;

    pub const MAX_DOWNLOAD_DATA_LEN: usize = 240;
    pub const MAX_PRM_DATA_LEN: usize = 234;
    pub const MAX_CFG_DATA_LEN: usize = 244;
    pub const MAX_OUTPUT_DATA_LEN: usize = 244;
    pub const MAX_REM_SLAVE_DATA_LEN: usize = 240;

    /// Stack operating states for ACT_PARAM_LOC with [`AREA_SET_MODE`]
    pub const ST_OFFLINE: u8 = 0x00;
    pub const ST_STOP: u8 = 0x40;
    pub const ST_CLEAR: u8 = 0x80;
    pub const ST_OPERATE: u8 = 0xC0;
}

/// FMB service identifiers
pub mod fmb {
    pub const FM2_EVENT: u8 = 19;
    pub const RESET: u8 = 20;
    pub const EXIT: u8 = 21;
    pub const SET_BUSPARAMETER: u8 = 22;
    pub const SET_CONFIGURATION: u8 = 27;

    pub const SET_CONFIGURATION_REQ_LEN: usize = 46;
    pub const SET_BUSPARAMETER_REQ_LEN: usize = 20;
}

/// Service description block, as laid out in the CMI parameter blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceDescr {
    pub comm_ref: u16,
    pub layer: u8,
    pub service: u8,
    pub primitive: u8,
    pub invoke_id: i8,
    pub result: i16,
}

impl ServiceDescr {
    /// Size on the wire
    pub const LEN: usize = 8;

    pub const fn new(layer: Layer, service: u8, primitive: Primitive) -> Self {
        Self {
            comm_ref: 0,
            layer: layer as u8,
            service,
            primitive: primitive as u8,
            invoke_id: 0,
            result: POS,
        }
    }

    /// Request on `layer`, communication reference 0
    pub const fn request(layer: Layer, service: u8) -> Self {
        Self::new(layer, service, Primitive::Req)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let c = self.comm_ref.to_be_bytes();
        let r = self.result.to_be_bytes();
        [
            c[0],
            c[1],
            self.layer,
            self.service,
            self.primitive,
            self.invoke_id as u8,
            r[0],
            r[1],
        ]
    }

    pub fn from_bytes(b: &[u8; Self::LEN]) -> Self {
        Self {
            comm_ref: u16::from_be_bytes([b[0], b[1]]),
            layer: b[2],
            service: b[3],
            primitive: b[4],
            invoke_id: b[5] as i8,
            result: i16::from_be_bytes([b[6], b[7]]),
        }
    }

    pub fn is(&self, layer: Layer, service: u8, primitive: Primitive) -> bool {
        self.layer == layer as u8 && self.service == service && self.primitive == primitive as u8
    }
}

fn embedded_len(data: &[u8], header: usize, len_at: usize, max: usize) -> Result<usize> {
    if data.len() < header {
        return Err(Error::InvalidCmiCall);
    }
    let len = usize::from(u16::from_be_bytes([data[len_at], data[len_at + 1]]));
    if len > max {
        return Err(Error::PayloadTooLarge);
    }
    Ok(header + len)
}

/// Payload length of a DP request
pub fn dp_data_len(service: u8, data: &[u8]) -> Result<usize> {
    match service {
        dp::DATA_TRANSFER | dp::GET_SLAVE_DIAG => Ok(0),
        dp::GLOBAL_CONTROL => Ok(dp::GLOBAL_CONTROL_REQ_LEN),
        dp::ACT_PARAM_LOC => Ok(dp::ACT_PARAM_REQ_LEN),
        dp::INIT_MASTER => Ok(dp::INIT_MASTER_REQ_LEN),
        dp::UPLOAD_LOC => Ok(dp::UPLOAD_REQ_LEN),
        dp::START_SEQ_LOC => Ok(dp::START_SEQ_REQ_LEN),
        dp::END_SEQ_LOC => Ok(dp::END_SEQ_REQ_LEN),
        dp::GET_CFG | dp::SLAVE_DIAG | dp::RD_INP | dp::RD_OUTP => Ok(dp::SLAVE_ADDR_REQ_LEN),
        // rem_add, area_code, add_offset, data_len
        dp::DOWNLOAD_LOC => embedded_len(data, 6, 4, dp::MAX_DOWNLOAD_DATA_LEN),
        // rem_add, dummy, prm_data_len
        dp::SET_PRM | dp::SET_PRM_LOC => embedded_len(data, 4, 2, dp::MAX_PRM_DATA_LEN),
        // rem_add, dummy, cfg_data_len
        dp::CHK_CFG => embedded_len(data, 4, 2, dp::MAX_CFG_DATA_LEN),
        // rem_add, dummy, outp_data_len
        dp::DATA_EXCHANGE => embedded_len(data, 4, 2, dp::MAX_OUTPUT_DATA_LEN),
        // rem_add, new_slave_add, ident_number, no_add_chg, dummy,
        // rem_slave_data_len
        dp::SET_SLAVE_ADD => embedded_len(data, 8, 6, dp::MAX_REM_SLAVE_DATA_LEN),
        dp::DOWNLOAD
        | dp::UPLOAD
        | dp::START_SEQ
        | dp::END_SEQ
        | dp::ACT_PARAM
        | dp::GET_MASTER_DIAG
        | dp::ACT_PARA_BRCT => Err(Error::ServiceNotSupported),
        _ => Err(Error::InvalidService),
    }
}

/// Payload length of an FMB request
pub fn fmb_data_len(service: u8) -> Result<usize> {
    match service {
        fmb::SET_CONFIGURATION => Ok(fmb::SET_CONFIGURATION_REQ_LEN),
        fmb::SET_BUSPARAMETER => Ok(fmb::SET_BUSPARAMETER_REQ_LEN),
        fmb::EXIT => Ok(0),
        _ => Err(Error::InvalidService),
    }
}

/// Validate a request or response and resolve the number of payload bytes
/// to send.
///
/// A request always goes out with a positive result.
pub fn prepare(descr: &mut ServiceDescr, data: &[u8]) -> Result<usize> {
    if descr.comm_ref > MAX_COMREF {
        return Err(Error::InvalidCommRef);
    }
    match Primitive::try_from(descr.primitive) {
        Ok(Primitive::Ind) | Ok(Primitive::Con) => return Err(Error::InvalidPrimitive),
        Ok(Primitive::Req) => descr.result = POS,
        _ => {}
    }

    let len = match Layer::try_from(descr.layer) {
        Ok(Layer::Dp) => dp_data_len(descr.service, data)?,
        Ok(Layer::Fmb) => fmb_data_len(descr.service)?,
        _ => return Err(Error::InvalidLayer),
    };

    if data.len() < len {
        return Err(Error::InvalidCmiCall);
    }
    Ok(len)
}

impl<R: Registers, C: Clock> Handle<R, C> {
    /// Send a request or response to the controller.
    ///
    /// With `wait_for_ack` the call returns once the controller has taken
    /// the request; without it the request is only posted.
    pub fn send_req_res(
        &self,
        descr: &mut ServiceDescr,
        data: &[u8],
        wait_for_ack: bool,
    ) -> Result<()> {
        let len = prepare(descr, data)?;
        debug!(
            "send_req_res: layer={:#04x} service={:#04x} primitive={} len={len}",
            descr.layer, descr.service, descr.primitive
        );
        self.cmi_write(descr, &data[..len], wait_for_ack)
    }

    /// Fetch a pending confirmation or indication, if there is one.
    ///
    /// Returns the descriptor and the payload length written to `data`.
    pub fn rcv_con_ind(&self, data: &mut [u8]) -> Result<Option<(ServiceDescr, usize)>> {
        self.cmi_read(data)
    }

    /// Poll until a confirmation or indication arrives, bounded by the
    /// confirmation timeout.
    pub fn rcv_con_ind_wait(&self, data: &mut [u8]) -> Result<(ServiceDescr, usize)> {
        let start = self.clock().ticks();
        let timeout = self.config().con_timeout_ms;
        loop {
            if let Some(got) = self.cmi_read(data)? {
                return Ok(got);
            }
            if self.clock().expired(start, timeout) {
                return Err(Error::Timeout);
            }
            self.clock().delay_ms(self.config().poll_interval_ms);
        }
    }

    /// Write to a data area, retrying while the controller owns it
    pub fn set_data(&self, id: u8, offset: u16, data: &[u8]) -> Result<()> {
        self.retry_data(|| self.set_data_descr(id, offset, data))
    }

    /// Read from a data area, retrying while the controller owns it.
    ///
    /// Returns the number of bytes read, which may be less than
    /// `data.len()` near the end of the area.
    pub fn get_data(&self, id: u8, offset: u16, data: &mut [u8]) -> Result<usize> {
        let start = self.clock().ticks();
        loop {
            match self.get_data_descr(id, offset, data) {
                Err(Error::ServiceConstrConflict) => {}
                other => return other,
            }
            if self.clock().expired(start, self.config().data_retry_ms) {
                warn!("get_data: data area {id:#04x} still owned by controller");
                return Err(Error::ServiceConstrConflict);
            }
            self.clock().delay_ms(1);
        }
    }

    fn retry_data(&self, mut f: impl FnMut() -> Result<()>) -> Result<()> {
        let start = self.clock().ticks();
        loop {
            match f() {
                Err(Error::ServiceConstrConflict) => {}
                other => return other,
            }
            if self.clock().expired(start, self.config().data_retry_ms) {
                warn!("set_data: data area still owned by controller");
                return Err(Error::ServiceConstrConflict);
            }
            self.clock().delay_ms(1);
        }
    }
}
