//! The word protocol engine.
//!
//! A run of register words is split into pages of as many frames as fit in the session's scratch
//! buffer. Every frame is its own transfer with chip select pulsed after it, and every page is one
//! bus transaction. A failed page ends the whole run, and pages that already completed stay
//! completed: a failed write may have changed some of the registers it was asked to write.

use crate::{
    alloc_list,
    error::{
        Error,
        Result,
    },
    session::Handle,
    transport::{
        Controller,
        Transfer,
    },
};
use spiframe::{
    Frame,
    Paging,
    FRAME_SIZE,
    WORD_SIZE,
};
use tracing::{
    debug,
    trace,
};

/// Byte address of word `index` in a run starting at `offset`
#[allow(clippy::cast_possible_truncation)]
fn word_addr(offset: u32, index: usize) -> u32 {
    offset.wrapping_add((index * WORD_SIZE) as u32)
}

impl<C: Controller> Handle<C> {
    fn paging(&self, byte_count: usize) -> Result<Paging> {
        let bufsiz = self.session().bufsiz();
        let paging = Paging::new(byte_count, bufsiz);
        if paging.words > 0 && paging.per_page == 0 {
            return Err(Error::MessageTooLarge {
                len: FRAME_SIZE,
                max: bufsiz,
            });
        }
        Ok(paging)
    }

    /// Read the registers starting at byte address `offset` into `out`, one word per four bytes.
    /// Trailing bytes of a partial word are left alone. Returns the number of bytes filled.
    /// # Errors
    /// Returns an error if the device is detached or the controller fails a page. Words of pages
    /// before the failing one have already been written to `out`.
    pub fn read_words_into(&self, offset: u32, out: &mut [u8]) -> Result<usize> {
        let paging = self.paging(out.len())?;
        debug!(
            key = %self.key(),
            offset,
            words = paging.words,
            pages = paging.pages(),
            per_page = paging.per_page,
            "Reading words"
        );
        self.session().with_scratch(|scratch, link| {
            for words in paging.iter() {
                let frames = &mut scratch[..words.len() * FRAME_SIZE];
                for (slot, i) in frames.chunks_exact_mut(FRAME_SIZE).zip(words.clone()) {
                    slot.copy_from_slice(&Frame::read(word_addr(offset, i)).pack());
                }
                let mut transfers = alloc_list(words.len())?;
                transfers.extend(
                    frames
                        .chunks_exact_mut(FRAME_SIZE)
                        .map(|frame| Transfer::duplex(frame).cs_change(true)),
                );
                trace!(first = words.start, frames = transfers.len(), "Read page");
                link.execute(&mut transfers)?;
                drop(transfers);
                for (frame, i) in frames.chunks_exact(FRAME_SIZE).zip(words) {
                    let din = Frame::unpack(frame)?.din;
                    out[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&din.to_le_bytes());
                }
            }
            Ok(paging.byte_len())
        })
    }

    /// Read `count / 4` registers starting at byte address `offset`
    /// # Errors
    /// Returns an error if the device is detached, the controller fails a page, or the result
    /// can't be allocated
    pub fn read_words(&self, offset: u32, count: usize) -> Result<Vec<u8>> {
        let len = count - count % WORD_SIZE;
        let mut out = alloc_list(len)?;
        out.resize(len, 0);
        let n = self.read_words_into(offset, &mut out)?;
        out.truncate(n);
        Ok(out)
    }

    /// Write `data` to the registers starting at byte address `offset`, one word per four bytes.
    /// Trailing bytes of a partial word are ignored. Returns the number of bytes written.
    /// # Errors
    /// Returns an error if the device is detached or the controller fails a page. Registers
    /// written by pages before the failing one keep their new values.
    pub fn write_words(&self, offset: u32, data: &[u8]) -> Result<usize> {
        let paging = self.paging(data.len())?;
        debug!(
            key = %self.key(),
            offset,
            words = paging.words,
            pages = paging.pages(),
            per_page = paging.per_page,
            "Writing words"
        );
        self.session().with_scratch(|scratch, link| {
            for words in paging.iter() {
                let frames = &mut scratch[..words.len() * FRAME_SIZE];
                for (slot, i) in frames.chunks_exact_mut(FRAME_SIZE).zip(words.clone()) {
                    let mut word = [0u8; WORD_SIZE];
                    word.copy_from_slice(&data[i * WORD_SIZE..(i + 1) * WORD_SIZE]);
                    let frame = Frame::write(word_addr(offset, i), u32::from_le_bytes(word));
                    slot.copy_from_slice(&frame.pack());
                }
                let mut transfers = alloc_list(words.len())?;
                transfers.extend(
                    frames
                        .chunks_exact_mut(FRAME_SIZE)
                        .map(|frame| Transfer::write(frame).cs_change(true)),
                );
                trace!(first = words.start, frames = transfers.len(), "Write page");
                link.execute(&mut transfers)?;
            }
            Ok(paging.byte_len())
        })
    }

    /// Read the single register at byte address `addr`
    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn read_word(&self, addr: u32) -> Result<u32> {
        let mut word = [0u8; WORD_SIZE];
        self.read_words_into(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write the single register at byte address `addr`
    /// # Errors
    /// Returns an error if the device is detached or the controller fails
    pub fn write_word(&self, addr: u32, word: u32) -> Result<()> {
        self.write_words(addr, &word.to_le_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        session::{
            Registry,
            SessionKey,
        },
        transport::mock::Mock,
    };
    use paste::paste;
    use spiframe::Command;

    const KEY: SessionKey = SessionKey::new(1, 0);

    fn open(mock: &Mock, bufsiz: usize) -> (Registry<Mock>, Handle<Mock>) {
        let registry = Registry::new(Config::default().with_bufsiz(bufsiz)).unwrap();
        registry.attach(KEY, mock.clone()).unwrap();
        let handle = registry.acquire(KEY).unwrap();
        (registry, handle)
    }

    fn pattern(words: usize) -> Vec<u8> {
        (0..words as u32)
            .flat_map(|i| (0xA500_0000 | i).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        let data = pattern(1024);
        assert_eq!(handle.write_words(0x1000, &data).unwrap(), 4096);
        assert_eq!(handle.read_words(0x1000, 4096).unwrap(), data);
    }

    #[test]
    fn test_global_word_addresses() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        handle.write_words(0x2000, &pattern(300)).unwrap();
        for i in 0..300u32 {
            assert_eq!(mock.peek(0x2000 + 4 * i), Some(0xA500_0000 | i));
        }
    }

    #[test]
    fn test_page_shape() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        handle.write_words(0, &pattern(1024)).unwrap();
        let history = mock.history();
        assert_eq!(history.len(), 8);
        assert!(history[..7].iter().all(|page| page.len() == 146));
        assert_eq!(history[7].len(), 1024 - 7 * 146);
        for record in history.iter().flatten() {
            assert_eq!(record.len, FRAME_SIZE);
            assert!(record.cs_change);
            assert!(!record.rx);
        }
    }

    #[test]
    fn test_read_frames() {
        let mock = Mock::new();
        mock.poke(0x44, 0x1234_5678);
        let (_registry, handle) = open(&mock, 2048);
        assert_eq!(handle.read_word(0x44).unwrap(), 0x1234_5678);
        let history = mock.history();
        let record = &history[0][0];
        assert!(record.rx);
        let sent = Frame::unpack(record.tx.as_deref().unwrap()).unwrap();
        assert_eq!(sent.command(), Ok(Command::Read));
        assert_eq!(sent.addr, 0x44);
        assert_eq!(sent.dout, 0);
    }

    #[test]
    fn test_partial_words_dropped() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        assert_eq!(handle.write_words(0, &[1, 0, 0, 0, 9, 9, 9]).unwrap(), 4);
        assert_eq!(mock.peek(0), Some(1));
        assert_eq!(mock.peek(4), None);
        let mut out = [0xEEu8; 6];
        assert_eq!(handle.read_words_into(0, &mut out).unwrap(), 4);
        assert_eq!(out, [1, 0, 0, 0, 0xEE, 0xEE]);
    }

    #[test]
    fn test_short_counts_do_nothing() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        for count in 0..4 {
            assert!(handle.read_words(0, count).unwrap().is_empty());
            assert_eq!(handle.write_words(0, &vec![0xFF; count]).unwrap(), 0);
        }
        assert_eq!(mock.transactions(), 0);
    }

    #[test]
    fn test_failed_page_keeps_earlier_pages() {
        let mock = Mock::new();
        // Two frames per page
        let (_registry, handle) = open(&mock, 28);
        mock.fail_after(1, libc::EIO);
        assert!(matches!(
            handle.write_words(0, &pattern(6)),
            Err(Error::Controller(libc::EIO))
        ));
        assert_eq!(mock.transactions(), 2);
        assert_eq!(mock.peek(0), Some(0xA500_0000));
        assert_eq!(mock.peek(4), Some(0xA500_0001));
        assert_eq!(mock.peek(8), None);
    }

    #[test]
    fn test_buffer_smaller_than_frame() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 13);
        assert!(matches!(
            handle.read_word(0),
            Err(Error::MessageTooLarge { len: 14, max: 13 })
        ));
        assert_eq!(handle.write_words(0, &[0; 3]).unwrap(), 0);
        assert_eq!(mock.transactions(), 0);
    }

    #[test]
    fn test_detached() {
        let mock = Mock::new();
        let (registry, handle) = open(&mock, 2048);
        registry.mark_detached(KEY);
        assert!(matches!(handle.read_words(0, 64), Err(Error::Detached)));
        assert!(matches!(handle.write_word(0, 1), Err(Error::Detached)));
        assert_eq!(mock.transactions(), 0);
    }

    #[test]
    fn test_address_wraps() {
        let mock = Mock::new();
        let (_registry, handle) = open(&mock, 2048);
        handle.write_words(0xFFFF_FFFC, &pattern(2)).unwrap();
        assert_eq!(mock.peek(0xFFFF_FFFC), Some(0xA500_0000));
        assert_eq!(mock.peek(0), Some(0xA500_0001));
    }

    macro_rules! test_transactions {
        ($bufsiz:literal, $words:literal, $pages:literal) => {
            paste! {
                #[test]
                fn [<test_transactions_ $bufsiz _ $words>]() {
                    let mock = Mock::new();
                    let (_registry, handle) = open(&mock, $bufsiz);
                    handle.read_words(0, $words * 4).unwrap();
                    assert_eq!(mock.transactions(), $pages);
                }
            }
        };
    }

    test_transactions!(2048, 1024, 8);
    test_transactions!(2048, 146, 1);
    test_transactions!(2048, 147, 2);
    test_transactions!(14, 5, 5);
    test_transactions!(4096, 1, 1);
}
