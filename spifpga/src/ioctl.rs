//! The ioctl request surface of a device node.
//!
//! Request numbers use the Linux `_IOC` encoding with the spidev magic, so a number built here is
//! the same one a C program would pass for the matching `SPI_IOC_*` request.

use crate::{
    alloc_list,
    error::{
        Error,
        Result,
    },
    memory::{
        Access,
        AddressSpace,
    },
    raw::{
        IocTransfer,
        IOC_TRANSFER_SIZE,
    },
    session::Handle,
    transport::Controller,
};
use packed_struct::prelude::*;
use tracing::trace;

pub const IOC_NONE: u32 = 0;
pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

const NR_SHIFT: u32 = 0;
const TYPE_SHIFT: u32 = 8;
const SIZE_SHIFT: u32 = 16;
const DIR_SHIFT: u32 = 30;
const SIZE_MASK: u32 = (1 << 14) - 1;

/// Type byte shared by every SPI request
pub const SPI_IOC_MAGIC: u8 = b'k';

/// Build a request number
#[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
#[must_use]
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << DIR_SHIFT)
        | (((size as u32) & SIZE_MASK) << SIZE_SHIFT)
        | ((ty as u32) << TYPE_SHIFT)
        | ((nr as u32) << NR_SHIFT)
}

/// A request that reads `size` bytes out to the caller
#[must_use]
pub const fn ior(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_READ, ty, nr, size)
}

/// A request that takes `size` bytes in from the caller
#[must_use]
pub const fn iow(ty: u8, nr: u8, size: usize) -> u32 {
    ioc(IOC_WRITE, ty, nr, size)
}

#[must_use]
pub const fn ioc_dir(cmd: u32) -> u32 {
    cmd >> DIR_SHIFT
}

#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub const fn ioc_type(cmd: u32) -> u8 {
    (cmd >> TYPE_SHIFT) as u8
}

#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub const fn ioc_nr(cmd: u32) -> u8 {
    (cmd >> NR_SHIFT) as u8
}

#[must_use]
pub const fn ioc_size(cmd: u32) -> usize {
    ((cmd >> SIZE_SHIFT) & SIZE_MASK) as usize
}

pub const SPI_IOC_RD_MODE: u32 = ior(SPI_IOC_MAGIC, 1, 1);
pub const SPI_IOC_WR_MODE: u32 = iow(SPI_IOC_MAGIC, 1, 1);
pub const SPI_IOC_RD_LSB_FIRST: u32 = ior(SPI_IOC_MAGIC, 2, 1);
pub const SPI_IOC_WR_LSB_FIRST: u32 = iow(SPI_IOC_MAGIC, 2, 1);
pub const SPI_IOC_RD_BITS_PER_WORD: u32 = ior(SPI_IOC_MAGIC, 3, 1);
pub const SPI_IOC_WR_BITS_PER_WORD: u32 = iow(SPI_IOC_MAGIC, 3, 1);
pub const SPI_IOC_RD_MAX_SPEED_HZ: u32 = ior(SPI_IOC_MAGIC, 4, 4);
pub const SPI_IOC_WR_MAX_SPEED_HZ: u32 = iow(SPI_IOC_MAGIC, 4, 4);
pub const SPI_IOC_RD_MODE32: u32 = ior(SPI_IOC_MAGIC, 5, 4);
pub const SPI_IOC_WR_MODE32: u32 = iow(SPI_IOC_MAGIC, 5, 4);

/// The request number for a message of `n` transfers. Messages too large to encode get a size of
/// zero, which runs nothing.
#[must_use]
pub fn spi_ioc_message(n: usize) -> u32 {
    let size = n
        .checked_mul(IOC_TRANSFER_SIZE)
        .filter(|&size| size < 1 << 14)
        .unwrap_or(0);
    iow(SPI_IOC_MAGIC, 0, size)
}

/// A decoded request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Request {
    RdMode,
    WrMode,
    RdLsbFirst,
    WrLsbFirst,
    RdBitsPerWord,
    WrBitsPerWord,
    RdMaxSpeedHz,
    WrMaxSpeedHz,
    RdMode32,
    WrMode32,
    /// A raw transaction of this many transfers
    Message(usize),
}

impl Request {
    /// # Errors
    /// Returns [`Error::NotTty`] for numbers that aren't SPI requests, and
    /// [`Error::InvalidArgument`] for a message that isn't a whole number of transfers
    pub fn decode(cmd: u32) -> Result<Self> {
        Ok(match cmd {
            SPI_IOC_RD_MODE => Self::RdMode,
            SPI_IOC_WR_MODE => Self::WrMode,
            SPI_IOC_RD_LSB_FIRST => Self::RdLsbFirst,
            SPI_IOC_WR_LSB_FIRST => Self::WrLsbFirst,
            SPI_IOC_RD_BITS_PER_WORD => Self::RdBitsPerWord,
            SPI_IOC_WR_BITS_PER_WORD => Self::WrBitsPerWord,
            SPI_IOC_RD_MAX_SPEED_HZ => Self::RdMaxSpeedHz,
            SPI_IOC_WR_MAX_SPEED_HZ => Self::WrMaxSpeedHz,
            SPI_IOC_RD_MODE32 => Self::RdMode32,
            SPI_IOC_WR_MODE32 => Self::WrMode32,
            _ => {
                if ioc_type(cmd) != SPI_IOC_MAGIC || ioc_nr(cmd) != 0 || ioc_dir(cmd) != IOC_WRITE
                {
                    return Err(Error::NotTty(cmd));
                }
                let size = ioc_size(cmd);
                if size % IOC_TRANSFER_SIZE != 0 {
                    return Err(Error::InvalidArgument(
                        "message size is not a whole number of transfers",
                    ));
                }
                Self::Message(size / IOC_TRANSFER_SIZE)
            }
        })
    }

    /// The request number
    #[must_use]
    pub fn number(self) -> u32 {
        match self {
            Self::RdMode => SPI_IOC_RD_MODE,
            Self::WrMode => SPI_IOC_WR_MODE,
            Self::RdLsbFirst => SPI_IOC_RD_LSB_FIRST,
            Self::WrLsbFirst => SPI_IOC_WR_LSB_FIRST,
            Self::RdBitsPerWord => SPI_IOC_RD_BITS_PER_WORD,
            Self::WrBitsPerWord => SPI_IOC_WR_BITS_PER_WORD,
            Self::RdMaxSpeedHz => SPI_IOC_RD_MAX_SPEED_HZ,
            Self::WrMaxSpeedHz => SPI_IOC_WR_MAX_SPEED_HZ,
            Self::RdMode32 => SPI_IOC_RD_MODE32,
            Self::WrMode32 => SPI_IOC_WR_MODE32,
            Self::Message(n) => spi_ioc_message(n),
        }
    }
}

fn get<const N: usize, M: AddressSpace + ?Sized>(mem: &M, arg: u64) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    mem.copy_from(arg, &mut bytes)?;
    Ok(bytes)
}

impl<C: Controller> Handle<C> {
    /// Run the request `cmd` with argument address `arg` in `mem`. Returns the number of bytes
    /// transferred for messages, zero for everything else.
    /// # Errors
    /// - [`Error::NotTty`] for anything that isn't an SPI request
    /// - [`Error::Fault`] if `arg` can't be accessed the way the request needs
    /// - [`Error::Detached`] if the device is gone
    /// - whatever the request itself fails with
    #[allow(clippy::cast_possible_truncation)]
    pub fn ioctl<M: AddressSpace + ?Sized>(&self, cmd: u32, arg: u64, mem: &mut M) -> Result<usize> {
        if ioc_type(cmd) != SPI_IOC_MAGIC {
            return Err(Error::NotTty(cmd));
        }
        let size = ioc_size(cmd);
        if size > 0 {
            let dir = ioc_dir(cmd);
            if dir & IOC_READ != 0 && !mem.access_ok(Access::Write, arg, size) {
                return Err(Error::Fault);
            }
            if dir & IOC_WRITE != 0 && !mem.access_ok(Access::Read, arg, size) {
                return Err(Error::Fault);
            }
        }
        if !self.session().is_attached() {
            return Err(Error::Detached);
        }
        let request = Request::decode(cmd)?;
        trace!(key = %self.key(), ?request, arg, "ioctl");
        match request {
            Request::RdMode => mem.copy_to(arg, &[self.mode()? as u8])?,
            Request::RdMode32 => mem.copy_to(arg, &self.mode()?.to_ne_bytes())?,
            Request::RdLsbFirst => mem.copy_to(arg, &[u8::from(self.lsb_first()?)])?,
            Request::RdBitsPerWord => mem.copy_to(arg, &[self.bits_per_word()?])?,
            Request::RdMaxSpeedHz => mem.copy_to(arg, &self.max_speed_hz()?.to_ne_bytes())?,
            Request::WrMode => {
                let [mode] = get(&*mem, arg)?;
                self.set_mode(u32::from(mode))?;
            }
            Request::WrMode32 => self.set_mode(u32::from_ne_bytes(get(&*mem, arg)?))?,
            Request::WrLsbFirst => {
                let [lsb_first] = get(&*mem, arg)?;
                self.set_lsb_first(lsb_first != 0)?;
            }
            Request::WrBitsPerWord => {
                let [bits] = get(&*mem, arg)?;
                self.set_bits_per_word(bits)?;
            }
            Request::WrMaxSpeedHz => self.set_max_speed_hz(u32::from_ne_bytes(get(&*mem, arg)?))?,
            Request::Message(0) => (),
            Request::Message(n) => {
                let mut raw = alloc_list(n * IOC_TRANSFER_SIZE)?;
                raw.resize(n * IOC_TRANSFER_SIZE, 0);
                mem.copy_from(arg, &mut raw)?;
                let mut descriptors = alloc_list(n)?;
                for chunk in raw.chunks_exact(IOC_TRANSFER_SIZE) {
                    let bytes = <&[u8; IOC_TRANSFER_SIZE]>::try_from(chunk)
                        .map_err(|_| Error::InvalidArgument("short transfer descriptor"))?;
                    descriptors.push(IocTransfer::unpack(bytes)?);
                }
                return self.execute_raw(mem, &descriptors);
            }
        }
        Ok(0)
    }
}
