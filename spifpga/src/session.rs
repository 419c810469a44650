//! Device sessions and the registry that owns them.
//!
//! A session is one SPI device. It outlives individual openers: the scratch buffer exists while
//! at least one [`Handle`] is open, and the session itself is only destroyed once the device has
//! been detached *and* the last handle is gone.

use crate::{
    alloc_list,
    config::{
        Config,
        Mode,
        Settings,
        MODE_MASK,
    },
    error::{
        Error,
        Result,
    },
    lock,
    transport::{
        Controller,
        Link,
    },
};
use kstring::KString;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        Mutex,
    },
};
use tracing::{
    debug,
    warn,
};

/// Identity of a device: its SPI bus number and chip select
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub bus: u16,
    pub chip_select: u8,
}

impl SessionKey {
    #[must_use]
    pub const fn new(bus: u16, chip_select: u8) -> Self {
        Self { bus, chip_select }
    }

    /// Name of the raw byte-stream node for this device
    #[must_use]
    pub fn spidev_name(&self) -> KString {
        format!("spidev{self}").into()
    }

    /// Name of the register node for this device
    #[must_use]
    pub fn spifpga_name(&self) -> KString {
        format!("spifpga{self}").into()
    }

    /// Parse a node name like `spidev0.1` or `spifpga0.1`, or a path ending in one
    #[must_use]
    pub fn from_node_name(name: &str) -> Option<Self> {
        let name = name.rsplit('/').next()?;
        let rest = name
            .strip_prefix("spidev")
            .or_else(|| name.strip_prefix("spifpga"))?;
        let (bus, cs) = rest.split_once('.')?;
        Some(Self::new(bus.parse().ok()?, cs.parse().ok()?))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bus, self.chip_select)
    }
}

/// Everything guarded by the transfer lock
#[derive(Debug)]
struct Io {
    users: usize,
    /// Present only while `users > 0`
    buffer: Option<Vec<u8>>,
    settings: Settings,
}

/// One attached (or formerly attached) SPI device
#[derive(Debug)]
pub struct Session<C> {
    key: SessionKey,
    bufsiz: usize,
    link: Link<C>,
    /// The transfer lock. Held for the whole of every transaction and configuration change.
    io: Mutex<Io>,
}

impl<C: Controller> Session<C> {
    fn new(key: SessionKey, controller: C, config: &Config) -> Self {
        Self {
            key,
            bufsiz: config.bufsiz,
            link: Link::new(controller),
            io: Mutex::new(Io {
                users: 0,
                buffer: None,
                settings: config.settings,
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Capacity of the scratch buffer
    #[must_use]
    pub fn bufsiz(&self) -> usize {
        self.bufsiz
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.link.is_attached()
    }

    /// Number of open handles. Waits for any transaction in flight.
    #[must_use]
    pub fn users(&self) -> usize {
        lock(&self.io).users
    }

    /// Whether the scratch buffer is currently allocated. Waits for any transaction in flight.
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        lock(&self.io).buffer.is_some()
    }

    fn open(&self) -> Result<()> {
        let mut io = lock(&self.io);
        if !self.link.is_attached() {
            return Err(Error::NoDevice(self.key));
        }
        if io.buffer.is_none() {
            let mut buffer = alloc_list(self.bufsiz).map_err(|e| {
                debug!(key = %self.key, "open/ENOMEM");
                e
            })?;
            buffer.resize(self.bufsiz, 0);
            io.buffer = Some(buffer);
        }
        io.users += 1;
        debug!(key = %self.key, users = io.users, "Opened");
        Ok(())
    }

    fn close(&self) {
        let mut io = lock(&self.io);
        io.users = io.users.saturating_sub(1);
        if io.users == 0 {
            io.buffer = None;
            debug!(key = %self.key, "Last close, scratch buffer freed");
        }
    }

    /// Run `f` with exclusive use of the scratch buffer. Fails fast if the device is detached,
    /// both before waiting for the transfer lock and after getting it.
    pub(crate) fn with_scratch<R>(
        &self,
        f: impl FnOnce(&mut [u8], &Link<C>) -> Result<R>,
    ) -> Result<R> {
        if !self.link.is_attached() {
            return Err(Error::Detached);
        }
        let mut guard = lock(&self.io);
        if !self.link.is_attached() {
            return Err(Error::Detached);
        }
        let io = &mut *guard;
        let scratch = io
            .buffer
            .as_deref_mut()
            .ok_or(Error::InvalidArgument("session is not open"))?;
        f(scratch, &self.link)
    }

    fn settings(&self) -> Result<Settings> {
        if !self.link.is_attached() {
            return Err(Error::Detached);
        }
        Ok(lock(&self.io).settings)
    }

    /// Apply `change` to a copy of the settings and hand it to the controller. The session keeps
    /// its previous settings if either the change or the controller rejects it. A detach that
    /// lands while waiting for the transfer lock fails the change without touching the controller.
    fn reconfigure(&self, change: impl FnOnce(&mut Settings) -> Result<()>) -> Result<Settings> {
        if !self.link.is_attached() {
            return Err(Error::Detached);
        }
        let mut io = lock(&self.io);
        let spi = self.link.get()?;
        let mut next = io.settings;
        change(&mut next)?;
        if let Err(code) = spi.setup(&next) {
            warn!(key = %self.key, code, "Controller rejected new settings, keeping the old ones");
            return Err(Error::Controller(code));
        }
        io.settings = next;
        Ok(next)
    }
}

impl<C> Drop for Session<C> {
    fn drop(&mut self) {
        debug!(key = %self.key, "Session destroyed");
    }
}

/// An open session. Dropping it closes the session.
#[derive(Debug)]
pub struct Handle<C: Controller> {
    pub(crate) session: Arc<Session<C>>,
}

impl<C: Controller> Drop for Handle<C> {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl<C: Controller> Handle<C> {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.session.key()
    }

    #[must_use]
    pub fn session(&self) -> &Session<C> {
        &self.session
    }

    /// The device's current settings
    /// # Errors
    /// Returns [`Error::Detached`] if the device is gone
    pub fn settings(&self) -> Result<Settings> {
        self.session.settings()
    }

    /// The caller-visible mode bits
    /// # Errors
    /// Returns [`Error::Detached`] if the device is gone
    pub fn mode(&self) -> Result<u32> {
        Ok(self.settings()?.mode & MODE_MASK)
    }

    /// # Errors
    /// Returns [`Error::Detached`] if the device is gone
    pub fn lsb_first(&self) -> Result<bool> {
        Ok(self.settings()?.mode_flags()?.lsb_first)
    }

    /// # Errors
    /// Returns [`Error::Detached`] if the device is gone
    pub fn bits_per_word(&self) -> Result<u8> {
        Ok(self.settings()?.bits_per_word)
    }

    /// # Errors
    /// Returns [`Error::Detached`] if the device is gone
    pub fn max_speed_hz(&self) -> Result<u32> {
        Ok(self.settings()?.max_speed_hz)
    }

    /// Replace the caller-visible mode bits. Controller-owned bits outside of [`MODE_MASK`] are
    /// kept as they are.
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for bits outside of [`MODE_MASK`], or the controller's
    /// status if it rejects the mode. Either way the previous mode stays in effect.
    pub fn set_mode(&self, mode: u32) -> Result<()> {
        let flags = Mode::from_bits(mode)?;
        self.session.reconfigure(|s| {
            s.mode = mode | (s.mode & !MODE_MASK);
            Ok(())
        })?;
        debug!(key = %self.key(), mode, ?flags, "SPI mode set");
        Ok(())
    }

    /// # Errors
    /// Returns the controller's status if it rejects the change
    pub fn set_lsb_first(&self, lsb_first: bool) -> Result<()> {
        self.session.reconfigure(|s| {
            let mut flags = s.mode_flags()?;
            flags.lsb_first = lsb_first;
            s.mode = flags.bits()? | (s.mode & !MODE_MASK);
            Ok(())
        })?;
        debug!(
            key = %self.key(),
            "{}sb first",
            if lsb_first { 'l' } else { 'm' }
        );
        Ok(())
    }

    /// # Errors
    /// Returns the controller's status if it rejects the word size
    pub fn set_bits_per_word(&self, bits: u8) -> Result<()> {
        self.session.reconfigure(|s| {
            s.bits_per_word = bits;
            Ok(())
        })?;
        debug!(key = %self.key(), "{bits} bits per word");
        Ok(())
    }

    /// # Errors
    /// Returns the controller's status if it rejects the clock rate
    pub fn set_max_speed_hz(&self, speed: u32) -> Result<()> {
        self.session.reconfigure(|s| {
            s.max_speed_hz = speed;
            Ok(())
        })?;
        debug!(key = %self.key(), "{speed} Hz (max)");
        Ok(())
    }
}

/// The set of attached devices
#[derive(Debug)]
pub struct Registry<C> {
    config: Config,
    sessions: Mutex<HashMap<SessionKey, Arc<Session<C>>>>,
}

impl<C: Controller> Registry<C> {
    /// # Errors
    /// Returns an error if `config` is invalid
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a newly discovered device, applying the configured settings to it
    /// # Errors
    /// Returns an error if a device is already attached at `key`, or if the controller rejects the
    /// initial settings
    pub fn attach(&self, key: SessionKey, controller: C) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&key) {
            return Err(Error::InvalidArgument("a device is already attached at this key"));
        }
        controller
            .setup(&self.config.settings)
            .map_err(Error::Controller)?;
        sessions.insert(key, Arc::new(Session::new(key, controller, &self.config)));
        debug!(
            %key,
            spidev = %key.spidev_name(),
            spifpga = %key.spifpga_name(),
            "Attached"
        );
        Ok(())
    }

    /// Open the device at `key`, allocating its scratch buffer if this is the first opener
    /// # Errors
    /// Returns [`Error::NoDevice`] if nothing is attached at `key`, or [`Error::OutOfMemory`] if
    /// the scratch buffer can't be allocated
    pub fn acquire(&self, key: SessionKey) -> Result<Handle<C>> {
        let session = lock(&self.sessions)
            .get(&key)
            .cloned()
            .ok_or(Error::NoDevice(key))?;
        session.open()?;
        Ok(Handle { session })
    }

    /// Close a handle. Equivalent to dropping it.
    pub fn release(&self, handle: Handle<C>) {
        drop(handle);
    }

    /// The device at `key` is gone. Transactions already submitted run to completion, everything
    /// after fails with [`Error::Detached`]. The session is destroyed once its last handle closes.
    /// Returns false if nothing was attached at `key`.
    pub fn mark_detached(&self, key: SessionKey) -> bool {
        let Some(session) = lock(&self.sessions).remove(&key) else {
            return false;
        };
        session.link.detach();
        debug!(%key, "Detached");
        true
    }

    #[must_use]
    pub fn contains(&self, key: SessionKey) -> bool {
        lock(&self.sessions).contains_key(&key)
    }

    /// Keys of every attached device, in order
    #[must_use]
    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<_> = lock(&self.sessions).keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::Mock;
    use std::{
        sync::Arc,
        thread,
        time::Duration,
    };

    const KEY: SessionKey = SessionKey::new(0, 1);

    fn registry(mock: &Mock) -> Registry<Mock> {
        let registry = Registry::new(Config::default()).unwrap();
        registry.attach(KEY, mock.clone()).unwrap();
        registry
    }

    #[test]
    fn test_names() {
        assert_eq!(KEY.spidev_name(), "spidev0.1");
        assert_eq!(KEY.spifpga_name(), "spifpga0.1");
        assert_eq!(SessionKey::from_node_name("/dev/spidev2.3"), Some(SessionKey::new(2, 3)));
        assert_eq!(SessionKey::from_node_name("spifpga0.1"), Some(KEY));
        assert_eq!(SessionKey::from_node_name("/dev/ttyS0"), None);
        assert_eq!(SessionKey::from_node_name("spidev0"), None);
    }

    #[test]
    fn test_attach_applies_settings() {
        let mock = Mock::new();
        let _registry = registry(&mock);
        assert_eq!(mock.applied(), Some(Settings::default()));
    }

    #[test]
    fn test_attach_twice() {
        let mock = Mock::new();
        let registry = registry(&mock);
        assert!(matches!(
            registry.attach(KEY, Mock::new()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_acquire_missing() {
        let registry: Registry<Mock> = Registry::new(Config::default()).unwrap();
        assert!(matches!(registry.acquire(KEY), Err(Error::NoDevice(k)) if k == KEY));
    }

    #[test]
    fn test_buffer_follows_users() {
        let registry = registry(&Mock::new());
        let a = registry.acquire(KEY).unwrap();
        assert!(a.session().has_buffer());
        let b = registry.acquire(KEY).unwrap();
        assert_eq!(a.session().users(), 2);
        registry.release(b);
        assert_eq!(a.session().users(), 1);
        assert!(a.session().has_buffer());
        let session = a.session.clone();
        registry.release(a);
        assert_eq!(session.users(), 0);
        assert!(!session.has_buffer());
        // Still attached, so the registry keeps it
        assert!(registry.contains(KEY));
    }

    #[test]
    fn test_detach_without_users_destroys() {
        let registry = registry(&Mock::new());
        let weak = Arc::downgrade(&registry.acquire(KEY).unwrap().session);
        assert!(weak.upgrade().is_some());
        assert!(registry.mark_detached(KEY));
        assert!(weak.upgrade().is_none());
        assert!(!registry.mark_detached(KEY));
        assert!(registry.keys().is_empty());
    }

    #[test]
    fn test_detach_with_users_defers_destruction() {
        let registry = registry(&Mock::new());
        let handle = registry.acquire(KEY).unwrap();
        let weak = Arc::downgrade(&handle.session);
        registry.mark_detached(KEY);
        assert!(!handle.session().is_attached());
        assert!(weak.upgrade().is_some());
        assert!(matches!(registry.acquire(KEY), Err(Error::NoDevice(_))));
        drop(handle);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let mock = Mock::new();
        let registry = Arc::new(registry(&mock));
        let keeper = registry.acquire(KEY).unwrap();
        let threads: Vec<_> = (0..8u32)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let base = t * 0x1000;
                    for i in 0..100u32 {
                        let handle = registry.acquire(KEY).unwrap();
                        let data: Vec<u8> = (0..4u32)
                            .flat_map(|w| (t << 24 | i << 8 | w).to_le_bytes())
                            .collect();
                        handle.write_words(base + 16 * i, &data).unwrap();
                        let back = handle.read_words(base + 16 * i, data.len()).unwrap();
                        assert_eq!(back, data);
                        registry.release(handle);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        for t in 0..8u32 {
            for i in 0..100u32 {
                for w in 0..4u32 {
                    assert_eq!(
                        mock.peek(t * 0x1000 + 16 * i + 4 * w),
                        Some(t << 24 | i << 8 | w)
                    );
                }
            }
        }
        assert_eq!(keeper.session().users(), 1);
        assert!(keeper.session().has_buffer());
        let session = keeper.session.clone();
        drop(keeper);
        assert_eq!(session.users(), 0);
        assert!(!session.has_buffer());
    }

    #[test]
    fn test_release_waits_for_transaction() {
        let (mock, gate) = Mock::gated();
        let registry = registry(&mock);
        let busy = registry.acquire(KEY).unwrap();
        let other = registry.acquire(KEY).unwrap();
        let session = busy.session.clone();
        thread::scope(|s| {
            let writer = s.spawn(|| busy.write_word(0x40, 7));
            gate.wait_for(1);
            let closer = s.spawn(move || drop(other));
            gate.open();
            writer.join().unwrap().unwrap();
            closer.join().unwrap();
        });
        assert_eq!(session.users(), 1);
        assert!(session.has_buffer());
        assert_eq!(mock.peek(0x40), Some(7));
    }

    #[test]
    fn test_detach_during_transaction() {
        let (mock, gate) = Mock::gated();
        let registry = registry(&mock);
        let busy = registry.acquire(KEY).unwrap();
        let idle = registry.acquire(KEY).unwrap();
        thread::scope(|s| {
            let writer = s.spawn(|| busy.write_word(0x80, 0xAA));
            gate.wait_for(1);
            registry.mark_detached(KEY);
            // Fails without waiting on the transaction that holds the transfer lock
            assert!(matches!(idle.read_word(0x80), Err(Error::Detached)));
            gate.open();
            // The submitted transaction is not aborted
            writer.join().unwrap().unwrap();
        });
        assert_eq!(mock.peek(0x80), Some(0xAA));
        assert!(matches!(busy.write_word(0x80, 0), Err(Error::Detached)));
        assert_eq!(mock.transactions(), 1);
    }

    #[test]
    fn test_detach_while_setter_waits() {
        let (mock, gate) = Mock::gated();
        let registry = registry(&mock);
        let busy = registry.acquire(KEY).unwrap();
        let other = registry.acquire(KEY).unwrap();
        thread::scope(|s| {
            let writer = s.spawn(|| busy.write_word(0x80, 0xAA));
            gate.wait_for(1);
            let setter = s.spawn(|| other.set_max_speed_hz(1_234_567));
            // Let the setter queue on the transfer lock
            thread::sleep(Duration::from_millis(50));
            registry.mark_detached(KEY);
            gate.open();
            writer.join().unwrap().unwrap();
            assert!(matches!(setter.join().unwrap(), Err(Error::Detached)));
        });
        assert_eq!(mock.applied(), Some(Settings::default()));
        assert!(!other.session().is_attached());
    }

    #[test]
    fn test_set_mode_invalid_keeps_mode() {
        let mock = Mock::new();
        let registry = registry(&mock);
        let handle = registry.acquire(KEY).unwrap();
        handle.set_mode(0x03).unwrap();
        assert!(matches!(
            handle.set_mode(0x1_0000),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(handle.mode().unwrap(), 0x03);
        assert_eq!(mock.applied().unwrap().mode, 0x03);
    }

    #[test]
    fn test_rejected_settings_roll_back() {
        let mock = Mock::new();
        let registry = registry(&mock);
        let handle = registry.acquire(KEY).unwrap();
        handle.set_max_speed_hz(2_000_000).unwrap();
        mock.reject_setup(Some(libc::EINVAL));
        assert!(matches!(
            handle.set_max_speed_hz(100_000_000),
            Err(Error::Controller(libc::EINVAL))
        ));
        assert!(matches!(handle.set_mode(0x01), Err(Error::Controller(_))));
        assert_eq!(handle.max_speed_hz().unwrap(), 2_000_000);
        assert_eq!(handle.mode().unwrap(), 0);
    }

    #[test]
    fn test_bits_per_word_validated_by_controller() {
        let registry = registry(&Mock::new());
        let handle = registry.acquire(KEY).unwrap();
        handle.set_bits_per_word(16).unwrap();
        assert!(handle.set_bits_per_word(33).is_err());
        assert_eq!(handle.bits_per_word().unwrap(), 16);
    }

    #[test]
    fn test_controller_mode_bits_preserved() {
        let mock = Mock::new();
        let config = Config::default().with_settings(Settings {
            mode: 0x400,
            ..Default::default()
        });
        let registry = Registry::new(config).unwrap();
        registry.attach(KEY, mock.clone()).unwrap();
        let handle = registry.acquire(KEY).unwrap();
        handle.set_lsb_first(true).unwrap();
        assert!(handle.lsb_first().unwrap());
        assert_eq!(handle.mode().unwrap(), 0x08);
        assert_eq!(handle.settings().unwrap().mode, 0x408);
        handle.set_mode(0x01).unwrap();
        assert!(!handle.lsb_first().unwrap());
        assert_eq!(mock.applied().unwrap().mode, 0x401);
    }

    #[test]
    fn test_config_after_detach() {
        let registry = registry(&Mock::new());
        let handle = registry.acquire(KEY).unwrap();
        registry.mark_detached(KEY);
        assert!(matches!(handle.mode(), Err(Error::Detached)));
        assert!(matches!(handle.set_max_speed_hz(1), Err(Error::Detached)));
    }
}
