//! This module provides the paravirtualized file system: the [`OpenFileTable`] that maps guest
//! descriptors to host descriptors, and the [`FileSystem`] bridge that decodes guest requests,
//! performs the host calls and writes the results back into guest memory.
//!
//! A malformed request only ever fails that request. The guest sees `-1` in the result field and
//! the reason is logged on the host.

use crate::error::Error;
use crate::memory::GuestMemory;
use crate::protocol::{
    self, Envelope, FsOp, OpenRequest, ReadRequest, Record, SeekRequest, WriteRequest,
    MAX_DATA, MAX_PATHNAME, MODE_UNSPECIFIED,
};
use log::{debug, info, warn};
use nix::sys::stat::Mode;
use nix::unistd::{self, Whence};
use num_traits::FromPrimitive;
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use thiserror::Error;

/// The result the guest sees for any failed request.
pub const FAILURE: i32 = -1;

/// The mode used when the guest creates a file without asking for a mode.
pub const DEFAULT_CREATE_MODE: u32 = 0o600;

/// Why a single guest request was rejected.
#[derive(Debug, Error)]
pub enum RequestError {
    /// A record, pathname or buffer lies outside guest memory.
    #[error(transparent)]
    Memory(#[from] Error),
    /// The guest descriptor does not refer to an open file.
    #[error("guest fd {0} is not open")]
    NotOpen(i32),
    /// The op-code is not one of the known operations.
    #[error("unknown file operation {0}")]
    UnknownOp(i32),
    #[error("invalid open flags {0:#x}")]
    InvalidFlags(i32),
    #[error("invalid open mode {0:#x}")]
    InvalidMode(i32),
    #[error("invalid whence {0:#x}")]
    InvalidWhence(i32),
    /// The read asks for more than [`MAX_DATA`] bytes.
    #[error("read of {0} bytes exceeds the limit of {max} bytes", max = MAX_DATA)]
    TooLarge(u32),
    /// The host result does not fit the 32-bit result field.
    #[error("result {0} does not fit the result field")]
    Overflow(i64),
    /// The host call itself failed.
    #[error("host call failed: {0}")]
    Host(#[from] nix::Error),
}

/// A file the guest has open.
#[derive(Debug)]
pub struct OpenFile {
    /// The descriptor of the file in the host process.
    pub host_fd: RawFd,
    /// The pathname the guest opened the file with.
    pub pathname: String,
}

/// A slot of the [`OpenFileTable`]. The index of the slot is the guest descriptor.
#[derive(Debug)]
pub enum Slot {
    Free,
    Open(OpenFile),
}

/// Maps guest descriptors to host descriptors.
///
/// Guest descriptors are dense: they are slot indices, assigned in allocation order starting at
/// zero. A freed slot is reused by the next allocation before the table grows. Any host
/// descriptors still open when the table is dropped are closed.
#[derive(Debug)]
pub struct OpenFileTable {
    slots: Vec<Slot>,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    /// Creates a table with a single free slot.
    pub fn new() -> Self {
        Self {
            slots: vec![Slot::Free],
        }
    }

    /// Stores `file` in the first free slot, appending a slot if there is none, and returns the
    /// guest descriptor of that slot.
    pub fn allocate(&mut self, file: OpenFile) -> i32 {
        let index = match self.slots.iter().position(|slot| matches!(slot, Slot::Free)) {
            Some(index) => index,
            _ => {
                self.slots.push(Slot::Free);
                self.slots.len() - 1
            }
        };

        self.slots[index] = Slot::Open(file);

        index as i32
    }

    /// Looks up an open guest descriptor. Negative, out of range and freed descriptors yield
    /// `None`.
    pub fn lookup(&self, guest_fd: i32) -> Option<&OpenFile> {
        let index = usize::try_from(guest_fd).ok()?;

        match self.slots.get(index) {
            Some(Slot::Open(file)) => Some(file),
            _ => None,
        }
    }

    /// Frees the slot of `guest_fd` and returns the file it held, or `None` if it was not open.
    pub fn free(&mut self, guest_fd: i32) -> Option<OpenFile> {
        let index = usize::try_from(guest_fd).ok()?;
        let slot = self.slots.get_mut(index)?;

        match std::mem::replace(slot, Slot::Free) {
            Slot::Open(file) => Some(file),
            Slot::Free => None,
        }
    }

    /// The number of slots, free ones included.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The number of open files.
    pub fn open_count(&self) -> usize {
        self.open_files().count()
    }

    /// Iterates over the open files and their guest descriptors.
    pub fn open_files(&self) -> impl Iterator<Item = (i32, &OpenFile)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Open(file) => Some((index as i32, file)),
                Slot::Free => None,
            })
    }
}

impl fmt::Display for OpenFileTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "open file table:")?;

        for (guest_fd, file) in self.open_files() {
            writeln!(f, "  guest fd {}, host fd {}, pathname {}", guest_fd, file.host_fd, file.pathname)?;
        }

        Ok(())
    }
}

impl Drop for OpenFileTable {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Slot::Open(file) = slot {
                let _ = unistd::close(file.host_fd);
            }
        }
    }
}

/// The host side of the paravirtualized file system.
#[derive(Debug, Default)]
pub struct FileSystem {
    table: OpenFileTable,
}

impl FileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &OpenFileTable {
        &self.table
    }

    /// Services the request whose [`Envelope`] lies at `offset` in guest memory.
    pub fn handle_request(&mut self, memory: &mut GuestMemory, offset: u32) {
        let offset = i64::from(offset);

        let envelope = match Envelope::read_from(memory, offset) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("rejected file system request at {:#x}: {}", offset, e);
                return;
            }
        };

        let payload = i64::from(envelope.payload);

        match FsOp::from_i32(envelope.op) {
            Some(FsOp::Open) => self.complete(memory, payload, Self::open),
            Some(FsOp::Read) => self.complete(memory, payload, Self::read),
            Some(FsOp::Write) => self.complete(memory, payload, Self::write),
            Some(FsOp::Seek) => self.complete(memory, payload, Self::seek),
            Some(FsOp::Close) => {
                let result = self.close(envelope.fd).unwrap_or_else(|e| {
                    warn!("close of guest fd {} failed: {}", envelope.fd, e);
                    FAILURE
                });

                Self::reply::<Envelope>(memory, offset, result);
            }
            Some(FsOp::IsOpen) => {
                let open = self.table.lookup(envelope.fd).is_some();

                Self::reply::<Envelope>(memory, offset, open as i32);
            }
            None => {
                warn!("{}", RequestError::UnknownOp(envelope.op));
                Self::reply::<Envelope>(memory, offset, FAILURE);
            }
        }
    }

    /// Decodes the payload record `R` at `offset`, runs `op` on it and writes the result back.
    fn complete<R: Record>(
        &mut self,
        memory: &mut GuestMemory,
        offset: i64,
        op: fn(&mut Self, &mut GuestMemory, i64, &R) -> Result<i32, RequestError>,
    ) {
        let request = match R::read_from(memory, offset) {
            Ok(request) => request,
            Err(e) => {
                warn!("rejected {} record at {:#x}: {}", R::NAME, offset, e);
                return;
            }
        };

        let result = match op(self, memory, offset, &request) {
            Ok(result) => result,
            Err(e) => {
                warn!("{} request failed: {}", R::NAME, e);
                FAILURE
            }
        };

        debug!("{} request at {:#x} returned {}", R::NAME, offset, result);
        Self::reply::<R>(memory, offset, result);
    }

    fn reply<R: Record>(memory: &mut GuestMemory, offset: i64, result: i32) {
        if let Err(e) = memory.write_obj(offset + R::RESULT as i64, result) {
            warn!("cannot deliver {} result to {:#x}: {}", R::NAME, offset, e);
        }
    }

    fn open(
        &mut self,
        memory: &mut GuestMemory,
        _offset: i64,
        request: &OpenRequest,
    ) -> Result<i32, RequestError> {
        let pathname = memory.c_str(i64::from(request.pathname), MAX_PATHNAME)?;
        let flags = protocol::host_open_flags(request.flags)
            .ok_or(RequestError::InvalidFlags(request.flags))?;

        let mode = if request.mode == MODE_UNSPECIFIED {
            Mode::from_bits_truncate(DEFAULT_CREATE_MODE)
        } else {
            protocol::host_mode(request.mode)
                .ok_or(RequestError::InvalidMode(request.mode))?
        };

        let host_fd = nix::fcntl::open(Path::new(OsStr::from_bytes(&pathname)), flags, mode)?;
        let pathname = String::from_utf8_lossy(&pathname).into_owned();

        info!("opened {} as host fd {}", pathname, host_fd);

        let guest_fd = self.table.allocate(OpenFile {
            host_fd,
            pathname,
        });

        info!("{}", self.table);

        Ok(guest_fd)
    }

    fn read(
        &mut self,
        memory: &mut GuestMemory,
        _offset: i64,
        request: &ReadRequest,
    ) -> Result<i32, RequestError> {
        let host_fd = self.host_fd(request.fd)?;

        if request.size as usize > MAX_DATA {
            return Err(RequestError::TooLarge(request.size));
        }

        let buf = i64::from(request.buf);
        let mut buffer = vec![0u8; request.size as usize];

        if !memory.contains(buf, buffer.len()) {
            return Err(Error::InvalidGuestAddress.into());
        }

        let size = unistd::read(host_fd, &mut buffer)?;

        memory.write(buf, &buffer[..size])?;

        Ok(size as i32)
    }

    /// Writes the guest buffer up to its first NUL byte, or `count` bytes if it has none. The
    /// shortened count is written back to the request. Binary data containing NUL bytes cannot be
    /// written through this request.
    fn write(
        &mut self,
        memory: &mut GuestMemory,
        offset: i64,
        request: &WriteRequest,
    ) -> Result<i32, RequestError> {
        let host_fd = self.host_fd(request.fd)?;
        let buffer = memory.read_vec(i64::from(request.buf), request.count as usize)?;
        let length = buffer
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(buffer.len());
        let size = unistd::write(host_fd, &buffer[..length])?;

        if length < request.count as usize {
            memory.write_obj(offset + WriteRequest::COUNT as i64, length as u32)?;
        }

        Ok(size as i32)
    }

    fn seek(
        &mut self,
        _memory: &mut GuestMemory,
        _offset: i64,
        request: &SeekRequest,
    ) -> Result<i32, RequestError> {
        let host_fd = self.host_fd(request.fd)?;
        let whence = protocol::host_whence(request.whence)
            .ok_or(RequestError::InvalidWhence(request.whence))?;
        let previous = unistd::lseek(host_fd, 0, Whence::SeekCur)?;
        let position = unistd::lseek(host_fd, request.offset.into(), whence)?;

        match i32::try_from(position) {
            Ok(position) => Ok(position),
            Err(_) => {
                // The guest cannot see the new offset, so put the old one back.
                unistd::lseek(host_fd, previous, Whence::SeekSet)?;
                Err(RequestError::Overflow(position))
            }
        }
    }

    /// Closes `guest_fd`. The slot is freed even if the host `close` fails: Linux releases the
    /// host descriptor either way, and the next open may be handed the same number.
    fn close(&mut self, guest_fd: i32) -> Result<i32, RequestError> {
        let file = self.table.free(guest_fd).ok_or(RequestError::NotOpen(guest_fd))?;
        let result = unistd::close(file.host_fd);

        info!("closed {} (guest fd {})", file.pathname, guest_fd);
        info!("{}", self.table);

        result?;

        Ok(0)
    }

    fn host_fd(&self, guest_fd: i32) -> Result<RawFd, RequestError> {
        self.table
            .lookup(guest_fd)
            .map(|file| file.host_fd)
            .ok_or(RequestError::NotOpen(guest_fd))
    }
}
