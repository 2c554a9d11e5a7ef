// Instrument link - Serialised, time-bounded access to the single device
use crate::application::instrument::{Instrument, InstrumentError};
use crate::domain::telemetry::DeviceState;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Shared handle to the instrument.
///
/// All device traffic goes through [`InstrumentLink::lock`]; a sequence of
/// calls made on one guard cannot interleave with calls from another task.
pub struct InstrumentLink {
    device: Mutex<Box<dyn Instrument>>,
    call_timeout: Duration,
    open: AtomicBool,
    claimed: AtomicBool,
}

impl InstrumentLink {
    pub fn new(device: Box<dyn Instrument>, call_timeout: Duration) -> Self {
        let open = device.is_open();
        Self {
            device: Mutex::new(device),
            call_timeout,
            open: AtomicBool::new(open),
            claimed: AtomicBool::new(false),
        }
    }

    pub async fn lock(&self) -> LinkGuard<'_> {
        LinkGuard {
            device: self.device.lock().await,
            link: self,
        }
    }

    /// Whether the link was open after the last connect/close, without waiting
    /// for the lock.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Take exclusive ownership of the link for a scripted run.
    ///
    /// Returns `None` if another claim is outstanding. The claim is released
    /// when the returned value is dropped.
    pub fn try_claim(self: &Arc<Self>) -> Option<LinkClaim> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LinkClaim { link: self.clone() })
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

pub struct LinkClaim {
    link: Arc<InstrumentLink>,
}

impl Drop for LinkClaim {
    fn drop(&mut self) {
        self.link.claimed.store(false, Ordering::Release);
    }
}

async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, InstrumentError>>,
) -> Result<T, InstrumentError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(InstrumentError::Timeout(limit)),
    }
}

/// Exclusive access to the instrument for as long as it is held.
pub struct LinkGuard<'a> {
    device: MutexGuard<'a, Box<dyn Instrument>>,
    link: &'a InstrumentLink,
}

impl LinkGuard<'_> {
    pub async fn refresh(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.refresh()).await
    }

    pub async fn read_state(&mut self) -> Result<DeviceState, InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.read_state()).await
    }

    /// Refresh then read, the pair a poll needs.
    pub async fn poll_state(&mut self) -> Result<DeviceState, InstrumentError> {
        self.refresh().await?;
        self.read_state().await
    }

    pub async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.set_current(amps)).await
    }

    pub async fn set_cutoff(&mut self, volts: f64) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.set_cutoff(volts)).await
    }

    pub async fn set_output(&mut self, on: bool) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.set_output(on)).await
    }

    pub async fn reset_accumulators(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.reset_accumulators()).await
    }

    pub async fn flush(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        bounded(limit, self.device.flush()).await
    }

    pub async fn connect(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        let result = bounded(limit, self.device.connect()).await;
        self.sync_open();
        result
    }

    /// Close (ignoring failures) and open again.
    pub async fn reopen(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        if let Err(e) = bounded(limit, self.device.close()).await {
            tracing::debug!("Ignoring close failure during reopen: {}", e);
        }
        self.sync_open();
        self.connect().await
    }

    pub async fn close(&mut self) -> Result<(), InstrumentError> {
        let limit = self.link.call_timeout;
        let result = bounded(limit, self.device.close()).await;
        self.sync_open();
        result
    }

    fn sync_open(&self) {
        self.link.open.store(self.device.is_open(), Ordering::Release);
    }
}
