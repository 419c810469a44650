//! A single-device client, the way command line tools use the engine

use crate::{
    config::Config,
    error::Result,
    port::WordPort,
    session::{
        Handle,
        Registry,
        SessionKey,
    },
    transport::Controller,
};
use tracing::debug;

/// One attached and opened device
#[derive(Debug)]
pub struct Client<C: Controller> {
    handle: Handle<C>,
    registry: Registry<C>,
}

impl<C: Controller> Client<C> {
    /// Attach `controller` as the device at `key` with `config`'s settings, and open it
    /// # Errors
    /// Returns an error if the config is invalid, the controller rejects the settings, or the
    /// scratch buffer can't be allocated
    pub fn new(key: SessionKey, controller: C, config: &Config) -> Result<Self> {
        let registry = Registry::new(*config)?;
        registry.attach(key, controller)?;
        let handle = registry.acquire(key)?;
        debug!(%key, bufsiz = config.bufsiz, settings = ?config.settings, "Client ready");
        Ok(Self { handle, registry })
    }

    #[must_use]
    pub fn handle(&self) -> &Handle<C> {
        &self.handle
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.handle.key()
    }

    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn read_word(&self, addr: u32) -> Result<u32> {
        self.handle.read_word(addr)
    }

    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn write_word(&self, addr: u32, word: u32) -> Result<()> {
        self.handle.write_word(addr, word)
    }

    /// Fill `buf` with the registers starting at `addr`. Returns the number of bytes read.
    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn bulk_read(&self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        self.handle.read_words_into(addr, buf)
    }

    /// Write `data` to the registers starting at `addr`. Returns the number of bytes written.
    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn bulk_write(&self, addr: u32, data: &[u8]) -> Result<usize> {
        self.handle.write_words(addr, data)
    }

    /// Mark the device as gone, failing everything that follows
    pub fn detach(&self) -> bool {
        self.registry.mark_detached(self.key())
    }

    /// Trade the client for a seekable port over the device's registers
    #[must_use]
    pub fn into_port(self) -> WordPort<C> {
        WordPort::new(self.handle)
    }
}

/// Open the spidev node at `path` and attach it as a client
/// # Errors
/// Returns an error if the node can't be opened or rejects the configured settings
#[cfg(all(target_os = "linux", target_endian = "little"))]
pub fn config_spi(
    path: impl AsRef<std::path::Path>,
    config: &Config,
) -> Result<Client<crate::transport::spidev::Spidev>> {
    let spi = crate::transport::spidev::Spidev::open(path)?;
    let key = spi.key().unwrap_or(SessionKey::new(0, 0));
    Client::new(key, spi, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Settings,
        transport::mock::Mock,
        Error,
    };
    use std::io::{
        Read,
        Seek,
        SeekFrom,
    };

    const KEY: SessionKey = SessionKey::new(0, 0);

    #[test]
    fn test_words() {
        let mock = Mock::new();
        let client = Client::new(KEY, mock.clone(), &Config::default()).unwrap();
        client.write_word(0x1_0004, 0xDEAD_BEEF).unwrap();
        assert_eq!(client.read_word(0x1_0004).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mock.peek(0x1_0004), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_bulk() {
        let client = Client::new(KEY, Mock::new(), &Config::default()).unwrap();
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(client.bulk_write(0x400, &data).unwrap(), 256);
        let mut back = vec![0; 256];
        assert_eq!(client.bulk_read(0x400, &mut back).unwrap(), 256);
        assert_eq!(back, data);
    }

    #[test]
    fn test_settings_applied() {
        let mock = Mock::new();
        let settings = Settings {
            mode: 3,
            max_speed_hz: 4_000_000,
            ..Default::default()
        };
        let client =
            Client::new(KEY, mock.clone(), &Config::default().with_settings(settings)).unwrap();
        assert_eq!(mock.applied(), Some(settings));
        assert_eq!(client.handle().mode().unwrap(), 3);
    }

    #[test]
    fn test_rejected_settings() {
        let mock = Mock::new();
        mock.reject_setup(Some(libc::EINVAL));
        assert!(matches!(
            Client::new(KEY, mock, &Config::default()),
            Err(Error::Controller(libc::EINVAL))
        ));
    }

    #[test]
    fn test_into_port() {
        let mock = Mock::new();
        mock.poke(0x10, 7);
        let client = Client::new(KEY, mock, &Config::default()).unwrap();
        let mut port = client.into_port();
        port.seek(SeekFrom::Start(0x10)).unwrap();
        let mut word = [0u8; 4];
        port.read_exact(&mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 7);
    }

    #[test]
    fn test_detach() {
        let client = Client::new(KEY, Mock::new(), &Config::default()).unwrap();
        assert!(client.detach());
        assert!(matches!(client.read_word(0), Err(Error::Detached)));
    }
}
