//! This module provides the [`Hypervisor`] struct, which mostly serves as an entry point to the
//! API, as KVM requires an open file descriptor to `/dev/kvm` before any VM can be created.

use crate::error::Error;
use crate::memory::DEFAULT_MEMORY_SIZE;
use crate::platform;
use crate::vm::VmBuilder;

/// The `Hypervisor` struct serving as an entry point to the API.
pub struct Hypervisor {
    /// The internal platform-specific implementation of the [`platform::Hypervisor`] struct.
    inner: platform::Hypervisor,
}

impl Hypervisor {
    /// Opens the hypervisor API and checks that it speaks the expected API version.
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            inner: platform::Hypervisor::new()?,
        })
    }

    /// Returns a [`VmBuilder`] that uses the builder pattern to create a new VM.
    pub fn build_vm(&self) -> Result<VmBuilder, Error> {
        Ok(VmBuilder {
            inner: self.inner.build_vm()?,
            memory_size: DEFAULT_MEMORY_SIZE,
        })
    }
}
