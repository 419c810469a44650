//! # spifpga
//!
//! A synchronous transaction engine for reaching the registers of an FPGA hanging off an SPI bus.
//!
//! Devices are attached to a [`Registry`](session::Registry) under a bus number and chip select.
//! Opening one gives a [`Handle`](session::Handle) that can
//! - read and write runs of 32-bit registers, paged into bus transactions that fit the session's
//!   scratch buffer ([`words`])
//! - run arbitrary scatter-gather transactions described by caller memory addresses ([`raw`],
//!   [`ioctl`])
//! - get and set the device's SPI mode, word size and clock
//!
//! Every path ends in the [`transport`], which refuses to touch a controller once its device has
//! been detached.
//!
//! ```
//! use spifpga::prelude::*;
//!
//! let registry = Registry::new(Config::default())?;
//! let key = SessionKey::new(0, 0);
//! registry.attach(key, Mock::new())?;
//! let handle = registry.acquire(key)?;
//! handle.write_word(0x0001_0004, 0xDEAD_BEEF)?;
//! assert_eq!(handle.read_word(0x0001_0004)?, 0xDEAD_BEEF);
//! # Ok::<(), spifpga::Error>(())
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod error;
pub mod ioctl;
pub mod memory;
pub mod port;
pub mod prelude;
pub mod raw;
pub mod session;
pub mod transport;
pub mod words;

pub use error::{
    Error,
    Result,
};

use std::sync::{
    Mutex,
    MutexGuard,
    PoisonError,
};

/// Lock a mutex, carrying on with the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocate an empty list with room for `n` items, reporting allocation failure instead of aborting
pub(crate) fn alloc_list<T>(n: usize) -> Result<Vec<T>> {
    let mut list = Vec::new();
    list.try_reserve_exact(n).map_err(|_| Error::OutOfMemory)?;
    Ok(list)
}
