//! A seekable byte-stream view of a device's register space

use crate::{
    session::Handle,
    transport::Controller,
};
use std::io::{
    self,
    Read,
    Seek,
    SeekFrom,
    Write,
};

/// Size of the FPGA register space in bytes. Seeking from the end is relative to this.
pub const REGISTER_SPACE: u64 = 0x0400_0000;

/// [`Read`], [`Write`] and [`Seek`] over a device's registers.
///
/// The position is a register byte address. Reads and writes move whole words only, so a call
/// with fewer than four bytes of room moves nothing and returns zero; both stop at
/// [`REGISTER_SPACE`].
#[derive(Debug)]
pub struct WordPort<C: Controller> {
    handle: Handle<C>,
    pos: u64,
}

impl<C: Controller> WordPort<C> {
    #[must_use]
    pub fn new(handle: Handle<C>) -> Self {
        Self { handle, pos: 0 }
    }

    #[must_use]
    pub fn handle(&self) -> &Handle<C> {
        &self.handle
    }

    #[must_use]
    pub fn into_handle(self) -> Handle<C> {
        self.handle
    }

    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// The register address to start at and how many bytes of `len` fit before the end
    #[allow(clippy::cast_possible_truncation)]
    fn span(&self, len: usize) -> io::Result<(u32, usize)> {
        let room = REGISTER_SPACE.saturating_sub(self.pos);
        let len = (len as u64).min(room) as usize;
        if len == 0 {
            return Ok((0, 0));
        }
        let offset = u32::try_from(self.pos)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position out of range"))?;
        Ok((offset, len))
    }
}

impl<C: Controller> Read for WordPort<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (offset, len) = self.span(buf.len())?;
        let n = self.handle.read_words_into(offset, &mut buf[..len])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<C: Controller> Write for WordPort<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (offset, len) = self.span(buf.len())?;
        let n = self.handle.write_words(offset, &buf[..len])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: Controller> Seek for WordPort<C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => REGISTER_SPACE.checked_add_signed(delta),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.pos = next;
        Ok(next)
    }
}
