//! This module provides the [`Vm`] struct which represents a virtual machine with a single
//! physical memory window starting at guest physical address zero.

use crate::error::Error;
use crate::memory::GuestMemory;
use crate::platform;
use crate::vcpu::Vcpu;
use log::info;

/// The `VmBuilder` allows for the configuration of certain properties for the new VM before
/// constructing it, as these properties are immutable once the VM has been built.
pub struct VmBuilder {
    /// The internal platform-specific implementation of the [`platform::VmBuilder`] struct.
    pub(crate) inner: platform::VmBuilder,
    pub(crate) memory_size: usize,
}

impl VmBuilder {
    /// This is used to specify the size of guest physical memory. Defaults to
    /// [`crate::memory::DEFAULT_MEMORY_SIZE`].
    pub fn with_memory_size(self, size: usize) -> Self {
        Self {
            memory_size: size,
            ..self
        }
    }

    /// Builds the VM, allocating its guest physical memory and mapping it at guest physical
    /// address zero.
    pub fn build(self) -> Result<Vm, Error> {
        let mut inner = self.inner.build()?;
        let memory = GuestMemory::new(self.memory_size)?;
        let host_address = memory.host_address()?;

        // The mapping stays alive as long as the returned `Vm`, which owns it.
        unsafe {
            inner.map_physical_memory(0, host_address, memory.size())
        }?;

        info!("guest memory: {} KiB at host address {:p}", memory.size() / 1024, host_address);

        Ok(Vm {
            inner,
            memory,
        })
    }
}

/// The `Vm` struct represents a virtual machine: a virtual CPU and the guest memory it runs in.
pub struct Vm {
    /// The internal platform-specific implementation of the [`platform::Vm`] struct. Declared
    /// before `memory` so that the memory region is torn down before its backing is unmapped.
    pub(crate) inner: platform::Vm,
    memory: GuestMemory,
}

impl Vm {
    /// Create a virtual CPU with the given vCPU ID.
    pub fn create_vcpu(&mut self, id: usize) -> Result<Vcpu, Error> {
        Ok(Vcpu {
            inner: self.inner.create_vcpu(id)?,
        })
    }

    /// The guest physical memory of the VM.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.memory
    }
}
