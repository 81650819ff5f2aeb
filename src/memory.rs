//! This module provides [`GuestMemory`], the host-side view of the guest physical address space.
//!
//! The guest never holds a host address. Every reference the guest hands to the host is an offset
//! into this window, and every offset is untrusted: all accessors go through [`validate`] first
//! and fail with [`Error::InvalidGuestAddress`] instead of touching memory outside the window.

use crate::error::Error;
use vm_memory::{
    ByteValued, Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap,
};

/// The default size of guest physical memory (2 MiB).
pub const DEFAULT_MEMORY_SIZE: usize = 0x20_0000;

/// Returns whether the `length` bytes starting at `offset` lie entirely within a window of
/// `window_size` bytes starting at offset zero.
///
/// Negative offsets and ranges whose end overflows are rejected.
pub fn validate(window_size: usize, offset: i64, length: usize) -> bool {
    let start = match u64::try_from(offset) {
        Ok(start) => start,
        _ => return false,
    };

    match start.checked_add(length as u64) {
        Some(end) => end <= window_size as u64,
        None => false,
    }
}

/// A single anonymous memory region that backs the guest physical address space starting at
/// guest physical address zero.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: usize,
}

impl GuestMemory {
    /// Allocates `size` bytes of zeroed guest memory.
    pub fn new(size: usize) -> Result<Self, Error> {
        let inner = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|e| Error::Allocation(size, e.to_string()))?;

        Ok(Self {
            inner,
            size,
        })
    }

    /// The size of the window in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Yields the host address of guest physical address zero, for registering the window with
    /// the hypervisor.
    pub(crate) fn host_address(&self) -> Result<*mut u8, Error> {
        Ok(self.inner.get_host_address(GuestAddress(0))?)
    }

    /// Returns whether `length` bytes at `offset` lie within the window.
    #[inline]
    pub fn contains(&self, offset: i64, length: usize) -> bool {
        validate(self.size, offset, length)
    }

    fn address(&self, offset: i64, length: usize) -> Result<GuestAddress, Error> {
        if !self.contains(offset, length) {
            return Err(Error::InvalidGuestAddress);
        }

        Ok(GuestAddress(offset as u64))
    }

    /// Reads a value of type `T` at `offset`. Guest and host share the x86 byte order.
    pub fn read_obj<T: ByteValued>(&self, offset: i64) -> Result<T, Error> {
        let address = self.address(offset, std::mem::size_of::<T>())?;

        Ok(self.inner.read_obj(address)?)
    }

    /// Writes `value` at `offset`.
    pub fn write_obj<T: ByteValued>(&mut self, offset: i64, value: T) -> Result<(), Error> {
        let address = self.address(offset, std::mem::size_of::<T>())?;

        Ok(self.inner.write_obj(value, address)?)
    }

    /// Reads a little-endian word of `width` bytes (1, 2, 4 or 8), zero-extended to 64 bits.
    pub fn read_uint(&self, offset: i64, width: usize) -> Result<u64, Error> {
        match width {
            1 => self.read_obj::<u8>(offset).map(u64::from),
            2 => self.read_obj::<u16>(offset).map(u64::from),
            4 => self.read_obj::<u32>(offset).map(u64::from),
            8 => self.read_obj::<u64>(offset),
            _ => Err(Error::InvalidGuestAddress),
        }
    }

    /// Copies `length` bytes at `offset` out of the window.
    pub fn read_vec(&self, offset: i64, length: usize) -> Result<Vec<u8>, Error> {
        let address = self.address(offset, length)?;
        let mut bytes = vec![0u8; length];

        self.inner.read_slice(&mut bytes, address)?;

        Ok(bytes)
    }

    /// Copies `bytes` into the window at `offset`.
    pub fn write(&mut self, offset: i64, bytes: &[u8]) -> Result<(), Error> {
        let address = self.address(offset, bytes.len())?;

        Ok(self.inner.write_slice(bytes, address)?)
    }

    /// Copies out the NUL-terminated string at `offset`, without its terminator.
    ///
    /// At most `max_length` bytes, terminator included, are scanned, and never past the end of the
    /// window. A string with no terminator within that bound is rejected with
    /// [`Error::MissingTerminator`].
    pub fn c_str(&self, offset: i64, max_length: usize) -> Result<Vec<u8>, Error> {
        if !self.contains(offset, 0) {
            return Err(Error::InvalidGuestAddress);
        }

        let available = self.size - offset as usize;
        let mut bytes = self.read_vec(offset, max_length.min(available))?;

        match bytes.iter().position(|&byte| byte == 0) {
            Some(length) => {
                bytes.truncate(length);
                Ok(bytes)
            }
            None => Err(Error::MissingTerminator(bytes.len())),
        }
    }
}
