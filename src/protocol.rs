//! This module defines the guest/host protocol: the well-known I/O ports, the binary layout of the
//! paravirtualized file system records, and the tables that translate the guest's private flag
//! encodings into host values.
//!
//! The guest encodings are deliberately unrelated to the host ABI. Every translation is total and
//! reports values it does not recognize instead of passing them through.
//!
//! # Record layout
//!
//! Every record is four little-endian 32-bit fields, 16 bytes in total, stored in guest memory
//! and moved as a whole with [`GuestMemory::read_obj`] and [`GuestMemory::write_obj`].
//! Fields that reference other guest data (pathnames, buffers, payload records) hold offsets
//! into guest memory, never host addresses.
//!
//! ```text
//! envelope  op      fd        flag     payload
//! open      flags   pathname  mode     fd (result)
//! read      fd      size      buf      ssize (result)
//! write     fd      buf       count    ssize (result)
//! seek      fd      offset    whence   foffset (result)
//! ```

use bitflags::bitflags;
use crate::error::Error;
use crate::memory::GuestMemory;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Whence;
use num_derive::FromPrimitive;
use vm_memory::ByteValued;

/// Single bytes written here are copied to the console.
pub const CONSOLE_PORT: u16 = 0xe9;
/// A 32-bit offset of a NUL-terminated string to display.
pub const STRING_PORT: u16 = 0x0001;
/// A 32-bit value to display as an unsigned decimal.
pub const VALUE_PORT: u16 = 0x3201;
/// Reading yields the number of I/O exits so far, the read itself included.
pub const EXIT_COUNT_PORT: u16 = 0x3200;
/// A 32-bit offset of a file system request [`Envelope`].
pub const FS_PORT: u16 = 0xff00;

/// The longest pathname the guest may pass, terminator included.
pub const MAX_PATHNAME: usize = 100;
/// The largest number of bytes a single read request may ask for.
pub const MAX_DATA: usize = 10000;

/// The raw mode value by which the guest asks for no particular mode.
pub const MODE_UNSPECIFIED: i32 = -1;

/// The file system operations, as encoded in [`Envelope::op`].
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
#[repr(i32)]
pub enum FsOp {
    Open   = 0,
    Read   = 1,
    Write  = 2,
    Seek   = 3,
    Close  = 4,
    IsOpen = 5,
}

bitflags! {
    /// The guest encoding of the flags passed to open.
    pub struct GuestOpenFlags: u32 {
        const RDONLY = 1 << 0;
        const WRONLY = 1 << 1;
        const RDWR   = 1 << 2;
        const CREAT  = 1 << 3;
        const TRUNC  = 1 << 4;
        const APPEND = 1 << 5;
    }

    /// The guest encoding of the permission bits passed to open.
    pub struct GuestMode: u32 {
        const IRWXU = 1 << 0;
        const IRUSR = 1 << 1;
        const IWUSR = 1 << 2;
        const IXUSR = 1 << 3;
    }

    /// The guest encoding of the whence argument of seek.
    pub struct GuestWhence: u32 {
        const SET = 1 << 0;
        const CUR = 1 << 1;
        const END = 1 << 2;
    }
}

/// Translates guest open flags into host flags.
///
/// Exactly one of `RDONLY`, `WRONLY` and `RDWR` must be set, otherwise the flags are invalid and
/// `None` is returned. Unknown bits are ignored.
pub fn host_open_flags(raw: i32) -> Option<OFlag> {
    let guest = GuestOpenFlags::from_bits_truncate(raw as u32);
    let access = guest & (GuestOpenFlags::RDONLY | GuestOpenFlags::WRONLY | GuestOpenFlags::RDWR);

    let mut flags = if access == GuestOpenFlags::RDONLY {
        OFlag::O_RDONLY
    } else if access == GuestOpenFlags::WRONLY {
        OFlag::O_WRONLY
    } else if access == GuestOpenFlags::RDWR {
        OFlag::O_RDWR
    } else {
        return None;
    };

    if guest.contains(GuestOpenFlags::CREAT) {
        flags |= OFlag::O_CREAT;
    }

    if guest.contains(GuestOpenFlags::TRUNC) {
        flags |= OFlag::O_TRUNC;
    }

    if guest.contains(GuestOpenFlags::APPEND) {
        flags |= OFlag::O_APPEND;
    }

    Some(flags)
}

/// Translates guest permission bits into a host mode. `None` means no recognized bit was set.
///
/// Only `IRWXU` is recognized: `IRUSR`, `IWUSR` and `IXUSR` on their own yield `None`.
pub fn host_mode(raw: i32) -> Option<Mode> {
    let guest = GuestMode::from_bits_truncate(raw as u32);

    if guest.contains(GuestMode::IRWXU) {
        return Some(Mode::S_IRWXU);
    }

    None
}

/// Translates a guest whence into the host one, checking `SET`, `CUR` and `END` in that order.
/// `None` means no recognized bit was set.
pub fn host_whence(raw: i32) -> Option<Whence> {
    let guest = GuestWhence::from_bits_truncate(raw as u32);

    if guest.contains(GuestWhence::SET) {
        Some(Whence::SeekSet)
    } else if guest.contains(GuestWhence::CUR) {
        Some(Whence::SeekCur)
    } else if guest.contains(GuestWhence::END) {
        Some(Whence::SeekEnd)
    } else {
        None
    }
}

/// A fixed-layout record of four 32-bit fields in guest memory.
pub trait Record: ByteValued {
    /// The byte offset of the field the host writes its result to.
    const RESULT: usize;
    /// Used in diagnostics.
    const NAME: &'static str;

    /// Decodes the record at `offset`, failing if any of it lies outside guest memory.
    fn read_from(memory: &GuestMemory, offset: i64) -> Result<Self, Error> {
        memory.read_obj(offset)
    }
}

macro_rules! record {
    ($name:ident, $label:expr, result = $result:expr) => {
        // SAFETY: `$name` is `repr(C)` and made of four 32-bit integers, so it has no padding and
        // every bit pattern is a valid value.
        unsafe impl ByteValued for $name {}

        impl Record for $name {
            const RESULT: usize = $result;
            const NAME: &'static str = $label;
        }
    };
}

/// Identifies the operation. Open, read, write and seek carry their arguments in a payload
/// record; close and is-open use `fd` and return through `flag`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Envelope {
    pub op: i32,
    pub fd: i32,
    pub flag: i32,
    pub payload: u32,
}

/// Arguments and result of open. `fd` receives the guest descriptor or `-1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenRequest {
    pub flags: i32,
    pub pathname: u32,
    pub mode: i32,
    pub fd: i32,
}

/// Arguments and result of read. `ssize` receives the number of bytes read or `-1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReadRequest {
    pub fd: i32,
    pub size: u32,
    pub buf: u32,
    pub ssize: i32,
}

/// Arguments and result of write. `ssize` receives the number of bytes written or `-1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteRequest {
    pub fd: i32,
    pub buf: u32,
    pub count: u32,
    pub ssize: i32,
}

/// Arguments and result of seek. `foffset` receives the new file offset or `-1`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SeekRequest {
    pub fd: i32,
    pub offset: i32,
    pub whence: i32,
    pub foffset: i32,
}

record!(Envelope, "envelope", result = 8);
record!(OpenRequest, "open", result = 12);
record!(ReadRequest, "read", result = 12);
record!(WriteRequest, "write", result = 12);
record!(SeekRequest, "seek", result = 12);

impl WriteRequest {
    /// The byte offset of `count`, which the host rewrites when it shortens the write.
    pub const COUNT: usize = 8;
}

/// Decodes the 32-bit word transferred through an I/O port. Shorter transfers are zero-extended.
pub fn io_word(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let length = data.len().min(4);

    bytes[..length].copy_from_slice(&data[..length]);

    u32::from_le_bytes(bytes)
}
