//! Caller memory, as seen by raw transactions.
//!
//! Raw transaction descriptors name their buffers by address in the caller's address space rather
//! than by reference, so every access goes through an [`AddressSpace`] that can refuse it. Address
//! zero always means "no buffer".

use crate::error::{
    Error,
    Result,
};

/// The direction of an access to caller memory
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    /// The engine reads from the caller
    Read,
    /// The engine writes to the caller
    Write,
}

/// A caller's address space
pub trait AddressSpace {
    /// Whether `len` bytes at `addr` may be accessed in direction `access`
    fn access_ok(&self, access: Access, addr: u64, len: usize) -> bool;

    /// Copy `dst.len()` bytes from caller memory at `addr`
    /// # Errors
    /// Returns [`Error::Fault`] if any of the bytes are not readable
    fn copy_from(&self, addr: u64, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into caller memory at `addr`
    /// # Errors
    /// Returns [`Error::Fault`] if any of the bytes are not writable
    fn copy_to(&mut self, addr: u64, src: &[u8]) -> Result<()>;
}

#[derive(Debug)]
struct Region {
    base: u64,
    data: Vec<u8>,
    writable: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// The byte range of `data` covering `len` bytes at `addr`, if it lies wholly in this region
    #[allow(clippy::cast_possible_truncation)]
    fn span(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let end = addr.checked_add(len as u64)?;
        (addr >= self.base && end <= self.end())
            .then(|| (addr - self.base) as usize..(end - self.base) as usize)
    }
}

/// An in-process address space made of mapped regions. Every region is readable; writes are only
/// allowed into regions mapped writable. An access must lie wholly within one region.
#[derive(Debug, Default)]
pub struct UserMemory {
    regions: Vec<Region>,
}

impl UserMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `data` at `base`
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for a mapping at address zero, one that wraps around the
    /// end of the address space, or one that overlaps an existing region
    pub fn map(&mut self, base: u64, data: Vec<u8>, writable: bool) -> Result<()> {
        if base == 0 {
            return Err(Error::InvalidArgument("address zero can't be mapped"));
        }
        let region = Region {
            base,
            data,
            writable,
        };
        if base.checked_add(region.data.len() as u64).is_none() {
            return Err(Error::InvalidArgument("mapping wraps the address space"));
        }
        if self
            .regions
            .iter()
            .any(|r| region.base < r.end() && r.base < region.end())
        {
            return Err(Error::InvalidArgument("mapping overlaps an existing region"));
        }
        self.regions.push(region);
        Ok(())
    }

    /// The contents of the region mapped at `base`
    #[must_use]
    pub fn region(&self, base: u64) -> Option<&[u8]> {
        self.regions
            .iter()
            .find(|r| r.base == base)
            .map(|r| r.data.as_slice())
    }

    fn find(&self, addr: u64, len: usize) -> Option<(usize, std::ops::Range<usize>)> {
        if addr == 0 {
            return None;
        }
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.span(addr, len).map(|span| (i, span)))
    }
}

impl AddressSpace for UserMemory {
    fn access_ok(&self, access: Access, addr: u64, len: usize) -> bool {
        self.find(addr, len)
            .is_some_and(|(i, _)| access == Access::Read || self.regions[i].writable)
    }

    fn copy_from(&self, addr: u64, dst: &mut [u8]) -> Result<()> {
        let (i, span) = self.find(addr, dst.len()).ok_or(Error::Fault)?;
        dst.copy_from_slice(&self.regions[i].data[span]);
        Ok(())
    }

    fn copy_to(&mut self, addr: u64, src: &[u8]) -> Result<()> {
        let (i, span) = self.find(addr, src.len()).ok_or(Error::Fault)?;
        let region = &mut self.regions[i];
        if !region.writable {
            return Err(Error::Fault);
        }
        region.data[span].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> UserMemory {
        let mut mem = UserMemory::new();
        mem.map(0x1000, vec![1, 2, 3, 4], false).unwrap();
        mem.map(0x2000, vec![0; 8], true).unwrap();
        mem
    }

    #[test]
    fn test_access_ok() {
        let mem = memory();
        assert!(mem.access_ok(Access::Read, 0x1000, 4));
        assert!(!mem.access_ok(Access::Write, 0x1000, 4));
        assert!(mem.access_ok(Access::Write, 0x2004, 4));
        assert!(!mem.access_ok(Access::Read, 0x1002, 4));
        assert!(!mem.access_ok(Access::Read, 0, 0));
        assert!(!mem.access_ok(Access::Read, u64::MAX, 2));
    }

    #[test]
    fn test_copy() {
        let mut mem = memory();
        let mut buf = [0u8; 2];
        mem.copy_from(0x1001, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        mem.copy_to(0x2002, &buf).unwrap();
        assert_eq!(mem.region(0x2000), Some(&[0, 0, 2, 3, 0, 0, 0, 0][..]));
    }

    #[test]
    fn test_faults() {
        let mut mem = memory();
        assert!(matches!(mem.copy_to(0x1000, &[9]), Err(Error::Fault)));
        assert_eq!(mem.region(0x1000), Some(&[1, 2, 3, 4][..]));
        let mut buf = [0u8; 16];
        assert!(matches!(mem.copy_from(0x2000, &mut buf), Err(Error::Fault)));
        assert!(matches!(mem.copy_from(0x3000, &mut buf[..1]), Err(Error::Fault)));
    }

    #[test]
    fn test_bad_mappings() {
        let mut mem = memory();
        assert!(mem.map(0, vec![0], true).is_err());
        assert!(mem.map(0x1003, vec![0; 4], true).is_err());
        assert!(mem.map(u64::MAX, vec![0; 2], true).is_err());
        assert!(mem.map(0x1004, vec![0; 4], true).is_ok());
    }
}
