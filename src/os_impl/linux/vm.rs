use crate::error::Error;
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use log::debug;
use super::vcpu::Vcpu;

/// The guest physical address of the three pages KVM needs for the real-mode TSS on Intel.
const TSS_ADDRESS: usize = 0xfffb_d000;

pub struct VmBuilder {
    pub(crate) vm: VmFd,
    pub(crate) vcpu_mmap_size: usize,
}

impl VmBuilder {
    pub fn build(self) -> Result<Vm, Error> {
        self.vm.set_tss_address(TSS_ADDRESS)?;

        Ok(Vm {
            vm: self.vm,
            vcpu_mmap_size: self.vcpu_mmap_size,
            next_slot: 0,
        })
    }
}

pub struct Vm {
    pub(crate) vm: VmFd,
    vcpu_mmap_size: usize,
    next_slot: u32,
}

impl Vm {
    pub fn create_vcpu(&mut self, id: usize) -> Result<Vcpu, Error> {
        let vcpu = self.vm.create_vcpu(id as u64)?;

        debug!("created vCPU {}, shared run region of {} KiB", id, self.vcpu_mmap_size / 1024);

        Ok(Vcpu {
            vcpu,
        })
    }

    /// Maps `size` bytes of host memory at `bytes` into the guest at `guest_address`.
    ///
    /// # Safety
    ///
    /// The host memory must stay mapped for as long as the VM exists.
    pub unsafe fn map_physical_memory(
        &mut self,
        guest_address: u64,
        bytes: *mut u8,
        size: usize,
    ) -> Result<(), Error> {
        let mem_region = kvm_userspace_memory_region {
            slot: self.next_slot,
            guest_phys_addr: guest_address,
            userspace_addr: bytes as u64,
            memory_size: size as u64,
            flags: 0,
        };

        self.vm.set_user_memory_region(mem_region)?;
        self.next_slot += 1;

        Ok(())
    }
}
