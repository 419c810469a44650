//! # spiframe
//!
//! The command frame used to reach 32-bit registers on an FPGA through an SPI slave core.
//!
//! Every register access is a single full-duplex exchange of a 14 byte frame. The master clocks
//! out the command, address and (for writes) the outbound word; the FPGA fills in the inbound word
//! and a status byte on the same frame as it is shifted back.
//!
//! | offset | field  | size |
//! |--------|--------|------|
//! | 0      | `cmd`  | 1    |
//! | 1      | `addr` | 4    |
//! | 5      | `dout` | 4    |
//! | 9      | `din`  | 4    |
//! | 13     | `resp` | 1    |
//!
//! Multi-byte fields are little endian, there is no padding.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod paging;

pub use paging::Paging;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

/// The size of one command frame in bytes. This is also the unit used to size pages.
pub const FRAME_SIZE: usize = 14;
/// The size of the register word a frame carries
pub const WORD_SIZE: usize = 4;

const CMD: usize = 0;
const ADDR: usize = 1;
const DOUT: usize = 5;
const DIN: usize = 9;
const RESP: usize = 13;

/// Errors that can be thrown when interpreting frames off the wire
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Not enough bytes for a frame, got {0} of 14")]
    Incomplete(usize),
    #[error("The command byte wasn't one we know about: {0:#04x}")]
    BadCommand(u8),
}

/// The kind of register access requested by a frame.
/// Bit 7 selects a write, bits 3 through 6 are the per-byte enables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum Command {
    /// Read a word
    Read = 0x78,
    /// Write a word with all four byte enables set
    Write = 0xF8,
}

impl Command {
    const WRITE: u8 = 0x80;
    const BYTE_ENABLES: u8 = 0x78;

    /// The raw command byte
    #[must_use]
    pub fn byte(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        self.byte() & Self::WRITE != 0
    }

    /// The four byte-enable bits, lowest byte first
    #[must_use]
    pub fn byte_enables(self) -> u8 {
        (self.byte() & Self::BYTE_ENABLES) >> 3
    }
}

/// One command/response frame
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    /// Register byte address
    pub addr: u32,
    /// Outbound word, zero for reads
    pub dout: u32,
    /// Inbound word, filled in by the FPGA
    pub din: u32,
    /// Status byte, filled in by the FPGA
    pub resp: u8,
}

impl Frame {
    /// A frame that reads the word at `addr`
    #[must_use]
    pub fn read(addr: u32) -> Self {
        Self {
            cmd: Command::Read.byte(),
            addr,
            ..Default::default()
        }
    }

    /// A frame that writes `word` to `addr`
    #[must_use]
    pub fn write(addr: u32, word: u32) -> Self {
        Self {
            cmd: Command::Write.byte(),
            addr,
            dout: word,
            ..Default::default()
        }
    }

    /// Interpret the command byte
    /// # Errors
    /// Returns an error if the byte isn't a known command
    pub fn command(&self) -> Result<Command, Error> {
        Command::from_u8(self.cmd).ok_or(Error::BadCommand(self.cmd))
    }

    /// Serialize into the fixed wire layout
    #[must_use]
    pub fn pack(&self) -> [u8; FRAME_SIZE] {
        let mut bytes = [0u8; FRAME_SIZE];
        self.pack_into(&mut bytes);
        bytes
    }

    /// Serialize into an existing frame-sized slot, such as a region of a scratch buffer
    pub fn pack_into(&self, bytes: &mut [u8; FRAME_SIZE]) {
        bytes[CMD] = self.cmd;
        bytes[ADDR..DOUT].copy_from_slice(&self.addr.to_le_bytes());
        bytes[DOUT..DIN].copy_from_slice(&self.dout.to_le_bytes());
        bytes[DIN..RESP].copy_from_slice(&self.din.to_le_bytes());
        bytes[RESP] = self.resp;
    }

    /// Deserialize the first [`FRAME_SIZE`] bytes of `bytes`
    /// # Errors
    /// Returns an error if there are fewer than [`FRAME_SIZE`] bytes
    pub fn unpack(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: &[u8; FRAME_SIZE] = bytes
            .get(..FRAME_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or(Error::Incomplete(bytes.len()))?;
        Ok(Self {
            cmd: bytes[CMD],
            addr: word_at(bytes, ADDR),
            dout: word_at(bytes, DOUT),
            din: word_at(bytes, DIN),
            resp: bytes[RESP],
        })
    }
}

fn word_at(bytes: &[u8; FRAME_SIZE], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Build the wire bytes for a register access. Reads ignore `word` and send zero.
#[must_use]
pub fn encode(command: Command, addr: u32, word: u32) -> [u8; FRAME_SIZE] {
    match command {
        Command::Read => Frame::read(addr),
        Command::Write => Frame::write(addr, word),
    }
    .pack()
}

/// Pull the inbound word out of a returned frame
#[must_use]
pub fn decode(frame: &[u8; FRAME_SIZE]) -> u32 {
    word_at(frame, DIN)
}
