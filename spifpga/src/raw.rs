//! Raw transactions: arbitrary transfer lists staged through the scratch buffer

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
    session::Handle,
    transport::{
        Controller,
        Transfer,
    },
};
use packed_struct::prelude::*;
use tracing::{
    debug,
    trace,
    warn,
};

/// Size of one packed [`IocTransfer`]
pub const IOC_TRANSFER_SIZE: usize = 32;

/// A caller's description of one transfer, laid out like the kernel's `spi_ioc_transfer`.
/// Buffers are addresses in the caller's [`AddressSpace`], zero for none.
#[derive(PackedStruct, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(endian = "lsb", bit_numbering = "msb0", size_bytes = "32")]
pub struct IocTransfer {
    #[packed_field(bytes = "0..=7")]
    pub tx_buf: u64,
    #[packed_field(bytes = "8..=15")]
    pub rx_buf: u64,
    #[packed_field(bytes = "16..=19")]
    pub len: u32,
    #[packed_field(bytes = "20..=23")]
    pub speed_hz: u32,
    #[packed_field(bytes = "24..=25")]
    pub delay_usecs: u16,
    #[packed_field(bytes = "26")]
    pub bits_per_word: u8,
    #[packed_field(bytes = "27")]
    pub cs_change: u8,
    #[packed_field(bytes = "28..=31")]
    pub pad: u32,
}

impl IocTransfer {
    /// A transfer of `len` bytes from `tx_buf` into `rx_buf`
    #[must_use]
    pub fn new(tx_buf: u64, rx_buf: u64, len: u32) -> Self {
        Self {
            tx_buf,
            rx_buf,
            len,
            ..Default::default()
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn byte_len(&self) -> usize {
        self.len as usize
    }
}

impl<C: Controller> Handle<C> {
    /// Run `descriptors` as one transaction.
    ///
    /// Nothing touches the bus unless the whole list fits in the scratch buffer, every transmit
    /// source can be read and every receive destination can be written. Received bytes are copied
    /// back in descriptor order once the transaction completes. Returns the number of bytes the
    /// controller transferred. An empty list is a no-op that never reaches the controller.
    /// # Errors
    /// - [`Error::MessageTooLarge`] if the lengths add up to more than the scratch buffer
    /// - [`Error::Fault`] if caller memory is bad, before anything was sent
    /// - [`Error::FaultAfterCommit`] if the transaction ran but its results couldn't be delivered
    /// - [`Error::Detached`] or [`Error::Controller`] from the transport
    pub fn execute_raw<M: AddressSpace + ?Sized>(
        &self,
        mem: &mut M,
        descriptors: &[IocTransfer],
    ) -> Result<usize> {
        if descriptors.is_empty() {
            return Ok(0);
        }
        let max = self.session().bufsiz();
        let requested: u64 = descriptors.iter().map(|d| u64::from(d.len)).sum();
        let total = usize::try_from(requested).unwrap_or(usize::MAX);
        if total > max {
            return Err(Error::MessageTooLarge { len: total, max });
        }
        debug!(
            key = %self.key(),
            transfers = descriptors.len(),
            total,
            "Raw transaction"
        );
        self.session().with_scratch(|scratch, link| {
            let mut transfers = alloc_list(descriptors.len())?;
            let mut rest = scratch;
            for d in descriptors {
                let len = d.byte_len();
                let (region, tail) = std::mem::take(&mut rest).split_at_mut(len);
                rest = tail;
                if d.rx_buf != 0 && !mem.access_ok(Access::Write, d.rx_buf, len) {
                    debug!(rx_buf = d.rx_buf, len, "Receive buffer not writable");
                    return Err(Error::Fault);
                }
                if d.tx_buf != 0 {
                    mem.copy_from(d.tx_buf, region)?;
                }
                trace!(?d, "Staged");
                transfers.push(
                    Transfer::new(region, d.tx_buf != 0, d.rx_buf != 0)
                        .cs_change(d.cs_change != 0)
                        .bits_per_word(d.bits_per_word)
                        .delay_usecs(d.delay_usecs)
                        .speed_hz(d.speed_hz),
                );
            }
            let transferred = link.execute(&mut transfers)?;
            for (d, t) in descriptors.iter().zip(transfers.iter_mut()) {
                if let Some(rx) = t.rx_buf() {
                    if mem.copy_to(d.rx_buf, rx).is_err() {
                        warn!(
                            rx_buf = d.rx_buf,
                            transferred, "Couldn't copy back a committed transaction"
                        );
                        return Err(Error::FaultAfterCommit { transferred });
                    }
                }
            }
            Ok(transferred)
        })
    }

    /// Clock `count` bytes in as a single receive-only transfer
    /// # Errors
    /// Returns [`Error::MessageTooLarge`] if `count` exceeds the scratch buffer, or the transport's
    /// error
    pub fn read_stream(&self, count: usize) -> Result<Vec<u8>> {
        let max = self.session().bufsiz();
        if count > max {
            return Err(Error::MessageTooLarge { len: count, max });
        }
        self.session().with_scratch(|scratch, link| {
            let n = link
                .execute(&mut [Transfer::read(&mut scratch[..count])])?
                .min(count);
            let mut out = alloc_list(n)?;
            out.extend_from_slice(&scratch[..n]);
            Ok(out)
        })
    }

    /// Clock `data` out as a single transmit-only transfer
    /// # Errors
    /// Returns [`Error::MessageTooLarge`] if `data` exceeds the scratch buffer, or the transport's
    /// error
    pub fn write_stream(&self, data: &[u8]) -> Result<usize> {
        let max = self.session().bufsiz();
        if data.len() > max {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                max,
            });
        }
        self.session().with_scratch(|scratch, link| {
            let region = &mut scratch[..data.len()];
            region.copy_from_slice(data);
            Ok(link.execute(&mut [Transfer::write(region)])?)
        })
    }
}
