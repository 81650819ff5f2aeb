//! The hy-hello crate runs a tiny guest program inside a single-vCPU virtual machine created
//! through the [KVM API](https://github.com/rust-vmm/kvm-ioctls) and services the requests the
//! guest makes through a handful of well-known I/O ports.
//!
//! Besides console and value display ports, the guest gets a paravirtualized file system: it
//! places a request record in its own physical memory and writes the offset of that record to
//! [`protocol::FS_PORT`]. The host validates every guest-supplied offset against the guest memory
//! window, performs the real file system call and writes the result back into the record. See
//! [`dispatch::Dispatcher`] for the exit loop and [`fs::FileSystem`] for the bridge.

pub mod arch;
pub mod boot;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod hypervisor;
pub mod memory;
pub mod protocol;
pub mod vcpu;
pub mod vm;
mod os_impl;

#[cfg(target_os = "linux")]
pub(crate) use os_impl::linux as platform;

pub use boot::CpuMode;
pub use dispatch::Dispatcher;
pub use error::Error;
pub use hypervisor::Hypervisor;
pub use memory::GuestMemory;
pub use vm::{Vm, VmBuilder};
pub use vcpu::{ExitReason, RunVcpu, Vcpu};
