//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// The guest address is invalid.
    #[error("invalid guest address")]
    InvalidGuestAddress,
    /// No NUL terminator was found within the given number of bytes.
    #[error("string is not terminated within {0} bytes")]
    MissingTerminator(usize),
    /// The kernel speaks a different version of the KVM API.
    #[error("KVM API version {found}, expected {expected}")]
    ApiVersion {
        found: i32,
        expected: i32,
    },
    /// The guest image does not fit in the space reserved for it.
    #[error("guest image of {size} bytes does not fit below {limit:#x}")]
    ImageTooLarge {
        size: usize,
        limit: u64,
    },
    /// The model-specific register cannot be set on this platform.
    #[error("unsupported MSR {0:#x}")]
    UnsupportedMsr(u32),
    /// The vCPU stopped for a reason outside of the supported protocol.
    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),
    /// Wraps ['std::io::Error'].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Guest memory of the given size could not be allocated.
    #[error("cannot allocate {0} bytes of guest memory: {1}")]
    Allocation(usize, String),
    /// Wraps an error from a [`vm_memory`] access.
    #[error(transparent)]
    Memory(#[from] vm_memory::GuestMemoryError),
    /// Wraps an error that originates from any calls to the [`kvm_ioctls`] crate.
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    KvmError(#[from] kvm_ioctls::Error),
}
