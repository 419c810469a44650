//! Engine and device configuration

use crate::error::{
    Error,
    Result,
};
use packed_struct::prelude::*;

/// Size of the scratch buffer, the largest message a session can move in one transaction
pub const DEFAULT_BUFSIZ: usize = 2048;
/// Clock rate a freshly attached device starts at
pub const DEFAULT_SPEED_HZ: u32 = 500_000;
/// Every mode bit a caller is allowed to change
pub const MODE_MASK: u32 = 0xFF;

/// The user-settable SPI mode bits.
/// Incorrect values for some of these can upset other devices on a shared bus: `cs_high` makes the
/// device active when it shouldn't be, `no_cs` removes message boundaries altogether.
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
pub struct Mode {
    #[packed_field(bits = "0")]
    /// Clock phase
    pub cpha: bool,
    #[packed_field(bits = "1")]
    /// Clock polarity
    pub cpol: bool,
    #[packed_field(bits = "2")]
    /// Chip select is active high
    pub cs_high: bool,
    #[packed_field(bits = "3")]
    pub lsb_first: bool,
    #[packed_field(bits = "4")]
    /// Shared SI/SO signal
    pub three_wire: bool,
    #[packed_field(bits = "5")]
    pub loopback: bool,
    #[packed_field(bits = "6")]
    /// One device per bus, no chip select
    pub no_cs: bool,
    #[packed_field(bits = "7")]
    /// Slave pulls low to pause
    pub ready: bool,
}

impl Mode {
    /// Interpret raw mode bits
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if any bit outside of [`MODE_MASK`] is set
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !MODE_MASK != 0 {
            return Err(Error::InvalidArgument("mode bits outside the supported set"));
        }
        let byte = u8::try_from(bits).map_err(|_| Error::InvalidArgument("mode"))?;
        Ok(Self::unpack(&[byte])?)
    }

    /// The raw mode bits
    /// # Errors
    /// Returns an error if the bit field can't be packed
    pub fn bits(&self) -> Result<u32> {
        let [byte] = self.pack()?;
        Ok(u32::from(byte))
    }

    /// The classic SPI mode number, 0 through 3
    #[must_use]
    pub fn number(&self) -> u8 {
        (u8::from(self.cpol) << 1) | u8::from(self.cpha)
    }
}

/// Per-device controller configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Mode bits. Bits outside of [`MODE_MASK`] belong to the controller and are never changed by
    /// callers.
    pub mode: u32,
    pub bits_per_word: u8,
    pub max_speed_hz: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: 0,
            bits_per_word: 8,
            max_speed_hz: DEFAULT_SPEED_HZ,
        }
    }
}

impl Settings {
    /// The caller-visible part of the mode
    /// # Errors
    /// Returns an error if the bit field can't be unpacked
    pub fn mode_flags(&self) -> Result<Mode> {
        Mode::from_bits(self.mode & MODE_MASK)
    }
}

/// Configuration for a [`Registry`](crate::session::Registry) and the sessions it creates
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Scratch buffer capacity in bytes
    pub bufsiz: usize,
    /// Settings applied to a device when it attaches
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bufsiz: DEFAULT_BUFSIZ,
            settings: Settings::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_bufsiz(mut self, bufsiz: usize) -> Self {
        self.bufsiz = bufsiz;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// # Errors
    /// Returns [`Error::InvalidArgument`] for an empty scratch buffer
    pub fn validate(&self) -> Result<()> {
        if self.bufsiz == 0 {
            return Err(Error::InvalidArgument("bufsiz must be nonzero"));
        }
        Ok(())
    }
}
