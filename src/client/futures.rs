//! Asynchronous client, polling the con/ind buffer.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use async_trait::async_trait;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::client::PollLimit;
use crate::device::Device;
use crate::event::ConInd;
use crate::io::{Clock, Registers};
use crate::service::ServiceDescr;
use crate::{Error, Result};

/// Yield delay for async polling loops.
///
/// The application provides an implementation so the client can yield
/// while waiting for the controller.  This keeps `profidp-cmi` free of any
/// specific async runtime.
///
/// Example:
///
/// ```ignore
/// use tokio::time::{Duration, sleep};
/// struct Delay;
/// impl AsyncDelay for Delay {
///     async fn delay() {
///         sleep(Duration::from_millis(5)).await;
///     }
/// }
/// ```
pub trait AsyncDelay {
    fn delay() -> impl Future<Output = ()>;
}

/// Something that hands out confirmations and indications asynchronously
#[async_trait(?Send)]
pub trait AsyncConIndSource {
    /// Post a request or response and wait for the next con/ind
    async fn request(&mut self, descr: ServiceDescr, data: &[u8]) -> Result<ConInd>;

    /// Wait for the next con/ind
    async fn next_con_ind(&mut self) -> Result<ConInd>;
}

/// Async client over a [`Device`].
///
/// ```ignore
/// let mut client = AsyncProfiClient::<_, _, Delay>::new(&dev, PollLimit::Polls(200));
/// let descr = ServiceDescr::request(Layer::Dp, dp::DATA_TRANSFER);
/// let con = client.request(descr, &[]).await?;
/// ```
pub struct AsyncProfiClient<'a, R: Registers + 'static, C: Clock + 'static, D: AsyncDelay> {
    device: &'a Device<R, C>,
    limit: PollLimit,
    _delay: core::marker::PhantomData<D>,
}

impl<'a, R: Registers + 'static, C: Clock + 'static, D: AsyncDelay> AsyncProfiClient<'a, R, C, D> {
    pub fn new(device: &'a Device<R, C>, limit: PollLimit) -> Self {
        Self {
            device,
            limit,
            _delay: core::marker::PhantomData,
        }
    }

    pub fn device(&self) -> &Device<R, C> {
        self.device
    }
}

#[async_trait(?Send)]
impl<R: Registers + 'static, C: Clock + 'static, D: AsyncDelay> AsyncConIndSource
    for AsyncProfiClient<'_, R, C, D>
{
    async fn request(&mut self, mut descr: ServiceDescr, data: &[u8]) -> Result<ConInd> {
        debug!("Async request, service {:#04x}", descr.service);
        let device = self.device;
        if device.handle().config().cyclic_data_transfer {
            error!("Async requests need acyclic mode");
            return Err(Error::InvalidCmiCall);
        }

        let mut polls = 0;
        let _exchange = loop {
            if let Some(guard) = device.try_claim_request() {
                break guard;
            }
            polls += 1;
            if self.limit.exhausted(polls) {
                return Err(Error::Timeout);
            }
            D::delay().await;
        };

        if let Err(e) = device.handle().send_req_res(&mut descr, data, false) {
            device.handle().release_request();
            return Err(e);
        }
        self.next_con_ind().await
    }

    async fn next_con_ind(&mut self) -> Result<ConInd> {
        let mut polls = 0;
        loop {
            match self.device.receive_con_ind() {
                Ok(ci) => {
                    debug!(
                        "Async con/ind, service {:#04x} after {polls} polls",
                        ci.descr.service
                    );
                    return Ok(ci);
                }
                Err(Error::NoData) => {}
                Err(e) => return Err(e),
            }
            polls += 1;
            if self.limit.exhausted(polls) {
                return Err(Error::Timeout);
            }
            D::delay().await;
        }
    }
}
