//! The bus transport. All traffic to a device funnels through here as ordered lists of
//! [`Transfer`]s, each list submitted as one chip-select framed transaction with the caller blocked
//! until the controller is done with it.

pub mod mock;
#[cfg(all(target_os = "linux", target_endian = "little"))]
pub mod spidev;

use crate::{
    config::Settings,
    lock,
};
use std::sync::{
    Arc,
    Mutex,
};
use thiserror::Error;
use tracing::{
    debug,
    trace,
    warn,
};

/// A status code from the controller, an errno
pub type Status = i32;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("The device is no longer attached")]
    Detached,
    #[error("The controller failed with status {0}")]
    Controller(Status),
}

/// One physical bus operation over a region of a scratch buffer.
///
/// The region is both the transmit source and the receive destination. When the transfer doesn't
/// transmit, the controller clocks out zeros instead of the region contents. When it doesn't
/// receive, incoming bytes are discarded and the region is left alone.
#[derive(Debug)]
pub struct Transfer<'a> {
    buf: &'a mut [u8],
    tx: bool,
    rx: bool,
    /// Release chip select after this transfer, before the next one starts
    pub cs_change: bool,
    /// Word size override, zero for the device default
    pub bits_per_word: u8,
    /// Delay after this transfer, before changing chip select or starting the next transfer
    pub delay_usecs: u16,
    /// Clock override, zero for the device default
    pub speed_hz: u32,
}

impl<'a> Transfer<'a> {
    #[must_use]
    pub fn new(buf: &'a mut [u8], tx: bool, rx: bool) -> Self {
        Self {
            buf,
            tx,
            rx,
            cs_change: false,
            bits_per_word: 0,
            delay_usecs: 0,
            speed_hz: 0,
        }
    }

    /// Shift `buf` out and replace it with what comes back
    #[must_use]
    pub fn duplex(buf: &'a mut [u8]) -> Self {
        Self::new(buf, true, true)
    }

    /// Shift `buf` out, ignore what comes back
    #[must_use]
    pub fn write(buf: &'a mut [u8]) -> Self {
        Self::new(buf, true, false)
    }

    /// Shift zeros out, fill `buf` with what comes back
    #[must_use]
    pub fn read(buf: &'a mut [u8]) -> Self {
        Self::new(buf, false, true)
    }

    #[must_use]
    pub fn cs_change(mut self, cs_change: bool) -> Self {
        self.cs_change = cs_change;
        self
    }

    #[must_use]
    pub fn bits_per_word(mut self, bits: u8) -> Self {
        self.bits_per_word = bits;
        self
    }

    #[must_use]
    pub fn delay_usecs(mut self, delay: u16) -> Self {
        self.delay_usecs = delay;
        self
    }

    #[must_use]
    pub fn speed_hz(mut self, speed: u32) -> Self {
        self.speed_hz = speed;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn is_tx(&self) -> bool {
        self.tx
    }

    #[must_use]
    pub fn is_rx(&self) -> bool {
        self.rx
    }

    /// The bytes to shift out, if this transfer transmits
    #[must_use]
    pub fn tx_buf(&self) -> Option<&[u8]> {
        self.tx.then_some(&*self.buf)
    }

    /// Where to put received bytes, if this transfer receives
    pub fn rx_buf(&mut self) -> Option<&mut [u8]> {
        self.rx.then_some(&mut *self.buf)
    }

    /// The whole region regardless of direction, for controllers that hand it to hardware
    pub fn region(&mut self) -> &mut [u8] {
        &mut *self.buf
    }
}

/// The trait implemented by SPI controllers.
pub trait Controller: Send + Sync {
    /// Run `transfers` as one transaction. Chip select stays asserted for the whole list, except
    /// where a transfer's `cs_change` releases it. Blocks until the transaction is complete.
    /// Returns the number of bytes clocked.
    /// # Errors
    /// Returns the controller's status code if the transaction failed
    fn transfer(&self, transfers: &mut [Transfer<'_>]) -> Result<usize, Status>;

    /// Validate and apply new device settings. On error, the previous settings stay in effect.
    /// # Errors
    /// Returns the controller's status code if it rejects the settings
    fn setup(&self, settings: &Settings) -> Result<(), Status>;
}

/// The attachment between a session and its controller.
///
/// Taking a reference to the controller and checking the attachment happen under one lock, so a
/// concurrent [`Link::detach`] either happens before (and the submission fails) or after (and the
/// submission holds its own reference, keeping the controller alive until it completes). Detach
/// never waits for a transaction in flight.
#[derive(Debug)]
pub(crate) struct Link<C> {
    spi: Mutex<Option<Arc<C>>>,
}

impl<C: Controller> Link<C> {
    pub(crate) fn new(controller: C) -> Self {
        Self {
            spi: Mutex::new(Some(Arc::new(controller))),
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        lock(&self.spi).is_some()
    }

    /// Drop our reference to the controller, returning it if we were still attached
    pub(crate) fn detach(&self) -> Option<Arc<C>> {
        lock(&self.spi).take()
    }

    pub(crate) fn get(&self) -> Result<Arc<C>, BusError> {
        lock(&self.spi).clone().ok_or(BusError::Detached)
    }

    /// Submit `transfers` as one transaction and wait for it
    pub(crate) fn execute(&self, transfers: &mut [Transfer<'_>]) -> Result<usize, BusError> {
        let spi = self.get().map_err(|e| {
            debug!("Transaction refused, device detached");
            e
        })?;
        trace!(transfers = transfers.len(), "Submitting transaction");
        spi.transfer(transfers).map_err(|code| {
            warn!(code, "Controller failed the transaction");
            BusError::Controller(code)
        })
    }
}
