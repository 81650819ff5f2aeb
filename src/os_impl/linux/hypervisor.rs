use crate::error::Error;
use kvm_ioctls::Kvm;
use log::debug;
use super::vm::VmBuilder;

/// The only KVM API version there has ever been.
const KVM_API_VERSION: i32 = 12;

pub struct Hypervisor {
    kvm: Kvm,
}

impl Hypervisor {
    pub fn new() -> Result<Self, Error> {
        let kvm = Kvm::new()?;
        let version = kvm.get_api_version();

        if version != KVM_API_VERSION {
            return Err(Error::ApiVersion {
                found: version,
                expected: KVM_API_VERSION,
            });
        }

        debug!("opened /dev/kvm, API version {}", version);

        Ok(Self {
            kvm,
        })
    }

    pub fn build_vm(&self) -> Result<VmBuilder, Error> {
        let vm = self.kvm.create_vm()?;
        let vcpu_mmap_size = self.kvm.get_vcpu_mmap_size()?;

        Ok(VmBuilder {
            vm,
            vcpu_mmap_size,
        })
    }
}
