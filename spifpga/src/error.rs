//! The error taxonomy shared by every operation on a session

use crate::{
    session::SessionKey,
    transport::BusError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Could not allocate the scratch buffer")]
    OutOfMemory,
    #[error("The SPI device has been detached")]
    Detached,
    #[error("Message of {len} bytes exceeds the {max} byte scratch buffer")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Bad address in caller memory")]
    Fault,
    /// The transaction ran on the bus but its receive data could not be delivered
    #[error("Transaction of {transferred} bytes committed, but the result could not be copied to caller memory")]
    FaultAfterCommit { transferred: usize },
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("The SPI controller failed with status {0}")]
    Controller(i32),
    #[error("No device attached at {0}")]
    NoDevice(SessionKey),
    #[error("Unsupported ioctl request {0:#010x}")]
    NotTty(u32),
    #[error("Could not pack or unpack a bit field")]
    Packing(#[from] packed_struct::PackingError),
    #[error("Malformed frame")]
    Frame(#[from] spiframe::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<BusError> for Error {
    fn from(value: BusError) -> Self {
        match value {
            BusError::Detached => Error::Detached,
            BusError::Controller(code) => Error::Controller(code),
        }
    }
}

impl Error {
    /// The errno a character device would have returned for this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Error::OutOfMemory => libc::ENOMEM,
            Error::Detached => libc::ESHUTDOWN,
            Error::MessageTooLarge { .. } => libc::EMSGSIZE,
            Error::Fault | Error::FaultAfterCommit { .. } => libc::EFAULT,
            Error::InvalidArgument(_) | Error::Packing(_) => libc::EINVAL,
            Error::Controller(code) => *code,
            Error::NoDevice(_) => libc::ENXIO,
            Error::NotTty(_) => libc::ENOTTY,
            Error::Frame(_) => libc::EIO,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True if caller memory could not be accessed, whether or not the bus was touched
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Error::Fault | Error::FaultAfterCommit { .. })
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        if let Error::Io(e) = value {
            return e;
        }
        let kind = match value {
            Error::Detached => std::io::ErrorKind::NotConnected,
            Error::InvalidArgument(_) | Error::Packing(_) => std::io::ErrorKind::InvalidInput,
            Error::OutOfMemory => std::io::ErrorKind::OutOfMemory,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, value)
    }
}
