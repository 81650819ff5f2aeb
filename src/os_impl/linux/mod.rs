//! The KVM implementation of the platform types.

mod hypervisor;
mod vcpu;
mod vm;

pub use hypervisor::Hypervisor;
pub use vcpu::Vcpu;
pub use vm::{Vm, VmBuilder};
