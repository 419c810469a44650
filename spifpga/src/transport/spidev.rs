//! Controller for a Linux `/dev/spidevB.C` node.
//!
//! Transactions go out through `SPI_IOC_MESSAGE` with descriptors pointing straight at the
//! engine's scratch regions, so the kernel's own bounce buffer is the only copy.

use super::{
    Controller,
    Status,
    Transfer,
};
use crate::{
    config::Settings,
    error::Result,
    ioctl::{
        ioc_size,
        spi_ioc_message,
        SPI_IOC_RD_BITS_PER_WORD,
        SPI_IOC_RD_MAX_SPEED_HZ,
        SPI_IOC_RD_MODE32,
        SPI_IOC_WR_BITS_PER_WORD,
        SPI_IOC_WR_MAX_SPEED_HZ,
        SPI_IOC_WR_MODE32,
    },
    raw::{
        IocTransfer,
        IOC_TRANSFER_SIZE,
    },
    session::SessionKey,
};
use packed_struct::prelude::*;
use std::{
    fs::File,
    os::fd::AsRawFd,
    path::{
        Path,
        PathBuf,
    },
};
use tracing::{
    debug,
    warn,
};

fn last_status() -> Status {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Kernel descriptors for `transfers`, each pointing at its transfer's region
fn descriptors(transfers: &mut [Transfer<'_>]) -> std::result::Result<Vec<u8>, Status> {
    let mut out = Vec::new();
    out.try_reserve_exact(transfers.len() * IOC_TRANSFER_SIZE)
        .map_err(|_| libc::ENOMEM)?;
    for t in transfers.iter_mut() {
        let len = u32::try_from(t.len()).map_err(|_| libc::EMSGSIZE)?;
        let (tx, rx) = (t.is_tx(), t.is_rx());
        let addr = t.region().as_mut_ptr() as u64;
        let d = IocTransfer {
            tx_buf: if tx { addr } else { 0 },
            rx_buf: if rx { addr } else { 0 },
            len,
            speed_hz: t.speed_hz,
            delay_usecs: t.delay_usecs,
            bits_per_word: t.bits_per_word,
            cs_change: u8::from(t.cs_change),
            pad: 0,
        };
        out.extend_from_slice(&d.pack().map_err(|_| libc::EINVAL)?);
    }
    Ok(out)
}

/// An open spidev node
#[derive(Debug)]
pub struct Spidev {
    file: File,
    path: PathBuf,
}

impl Spidev {
    /// Open the node at `path` for reading and writing
    /// # Errors
    /// Returns an error if the node can't be opened
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().read(true).write(true).open(&path)?;
        debug!(path = %path.display(), "Opened spidev node");
        Ok(Self { file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bus and chip select, if the node has a standard name
    #[must_use]
    pub fn key(&self) -> Option<SessionKey> {
        self.path.to_str().and_then(SessionKey::from_node_name)
    }

    fn write_value<T>(&self, request: u32, value: &T) -> std::result::Result<(), Status> {
        // SAFETY: `request` takes a `T` in from the caller and `value` is a live `T`
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, value as *const T) };
        if rc < 0 {
            return Err(last_status());
        }
        Ok(())
    }

    fn read_value<T: Default>(&self, request: u32) -> std::result::Result<T, Status> {
        let mut value = T::default();
        // SAFETY: `request` writes one `T` out to the caller and `value` is a live `T`
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request as _,
                std::ptr::addr_of_mut!(value),
            )
        };
        if rc < 0 {
            return Err(last_status());
        }
        Ok(value)
    }

    fn current(&self) -> std::result::Result<Settings, Status> {
        Ok(Settings {
            mode: self.read_value(SPI_IOC_RD_MODE32)?,
            bits_per_word: self.read_value(SPI_IOC_RD_BITS_PER_WORD)?,
            max_speed_hz: self.read_value(SPI_IOC_RD_MAX_SPEED_HZ)?,
        })
    }

    fn apply(&self, settings: &Settings) -> std::result::Result<(), Status> {
        self.write_value(SPI_IOC_WR_MODE32, &settings.mode)?;
        self.write_value(SPI_IOC_WR_BITS_PER_WORD, &settings.bits_per_word)?;
        self.write_value(SPI_IOC_WR_MAX_SPEED_HZ, &settings.max_speed_hz)
    }
}

impl Controller for Spidev {
    fn transfer(&self, transfers: &mut [Transfer<'_>]) -> std::result::Result<usize, Status> {
        if transfers.is_empty() {
            return Ok(0);
        }
        let request = spi_ioc_message(transfers.len());
        if ioc_size(request) == 0 {
            return Err(libc::EMSGSIZE);
        }
        let descriptors = descriptors(transfers)?;
        // SAFETY: each descriptor points at a region of `transfers`, which stays mutably borrowed
        // for the whole call, and `request` encodes exactly `descriptors.len()` bytes
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request as _,
                descriptors.as_ptr(),
            )
        };
        if rc < 0 {
            return Err(last_status());
        }
        Ok(usize::try_from(rc).unwrap_or_default())
    }

    fn setup(&self, settings: &Settings) -> std::result::Result<(), Status> {
        let previous = self.current()?;
        if let Err(code) = self.apply(settings) {
            if self.apply(&previous).is_err() {
                warn!(path = %self.path.display(), "Couldn't restore previous settings");
            }
            return Err(code);
        }
        Ok(())
    }
}
