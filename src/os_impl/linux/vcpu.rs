use crate::arch::x86_64::{
    ControlRegister, CpuRegs, Register, Segment, SegmentRegister, MSR_IA32_EFER,
};
use crate::error::Error;
use crate::vcpu::ExitReason;
use kvm_ioctls::{VcpuExit, VcpuFd};

pub struct Vcpu {
    pub(crate) vcpu: VcpuFd,
}

impl Vcpu {
    pub fn run(&mut self) -> Result<ExitReason<'_>, Error> {
        let exit_reason = self.vcpu.run()?;

        let exit_reason = match exit_reason {
            VcpuExit::IoOut(port, data) =>
                ExitReason::IoOut { port, data },
            VcpuExit::IoIn(port, data) =>
                ExitReason::IoIn { port, data },
            VcpuExit::MmioRead(address, _) =>
                ExitReason::MmioRead { address },
            VcpuExit::MmioWrite(address, data) =>
                ExitReason::MmioWrite { address, data },
            VcpuExit::Hlt =>
                ExitReason::Halted,
            VcpuExit::Shutdown =>
                ExitReason::UnhandledException,
            other =>
                ExitReason::Unknown(format!("{:?}", other)),
        };

        Ok(exit_reason)
    }
}

impl CpuRegs for Vcpu {
    fn get_registers(
        &self,
        registers: &[Register],
    ) -> Result<Vec<u64>, Error> {
        let regs = self.vcpu.get_regs()?;

        let values = registers
            .iter()
            .map(|register| match register {
                Register::Rax    => regs.rax,
                Register::Rcx    => regs.rcx,
                Register::Rdx    => regs.rdx,
                Register::Rbx    => regs.rbx,
                Register::Rsp    => regs.rsp,
                Register::Rbp    => regs.rbp,
                Register::Rsi    => regs.rsi,
                Register::Rdi    => regs.rdi,
                Register::Rip    => regs.rip,
                Register::Rflags => regs.rflags,
            })
            .collect();

        Ok(values)
    }

    fn set_registers(
        &mut self,
        registers: &[Register],
        values: &[u64],
    ) -> Result<(), Error> {
        let mut regs = self.vcpu.get_regs()?;

        for (register, value) in registers.iter().zip(values.iter()) {
            let register = match register {
                Register::Rax    => &mut regs.rax,
                Register::Rcx    => &mut regs.rcx,
                Register::Rdx    => &mut regs.rdx,
                Register::Rbx    => &mut regs.rbx,
                Register::Rsp    => &mut regs.rsp,
                Register::Rbp    => &mut regs.rbp,
                Register::Rsi    => &mut regs.rsi,
                Register::Rdi    => &mut regs.rdi,
                Register::Rip    => &mut regs.rip,
                Register::Rflags => &mut regs.rflags,
            };

            *register = *value;
        }

        self.vcpu.set_regs(&regs)?;

        Ok(())
    }

    fn get_control_registers(
        &self,
        registers: &[ControlRegister],
    ) -> Result<Vec<u64>, Error> {
        let regs = self.vcpu.get_sregs()?;

        let values = registers
            .iter()
            .map(|register| match register {
                ControlRegister::Cr0 => regs.cr0,
                ControlRegister::Cr3 => regs.cr3,
                ControlRegister::Cr4 => regs.cr4,
            })
            .collect();

        Ok(values)
    }

    fn set_control_registers(
        &mut self,
        registers: &[ControlRegister],
        values: &[u64],
    ) -> Result<(), Error> {
        let mut regs = self.vcpu.get_sregs()?;

        for (register, value) in registers.iter().zip(values.iter()) {
            let register = match register {
                ControlRegister::Cr0 => &mut regs.cr0,
                ControlRegister::Cr3 => &mut regs.cr3,
                ControlRegister::Cr4 => &mut regs.cr4,
            };

            *register = *value;
        }

        self.vcpu.set_sregs(&regs)?;

        Ok(())
    }

    fn set_msrs(
        &mut self,
        registers: &[u32],
        values: &[u64],
    ) -> Result<(), Error> {
        let mut regs = self.vcpu.get_sregs()?;

        // KVM keeps EFER in the special registers rather than the MSR list, and EFER is the only
        // MSR the guest modes need.
        for (register, value) in registers.iter().zip(values.iter()) {
            match *register {
                MSR_IA32_EFER => regs.efer = *value,
                other => return Err(Error::UnsupportedMsr(other)),
            }
        }

        self.vcpu.set_sregs(&regs)?;

        Ok(())
    }

    fn set_segment_registers(
        &mut self,
        registers: &[SegmentRegister],
        values: &[Segment],
    ) -> Result<(), Error> {
        let mut regs = self.vcpu.get_sregs()?;

        for (register, value) in registers.iter().zip(values.iter()) {
            let register = match register {
                SegmentRegister::Cs => &mut regs.cs,
                SegmentRegister::Ds => &mut regs.ds,
                SegmentRegister::Es => &mut regs.es,
                SegmentRegister::Fs => &mut regs.fs,
                SegmentRegister::Gs => &mut regs.gs,
                SegmentRegister::Ss => &mut regs.ss,
            };

            register.base     = value.base;
            register.limit    = value.limit;
            register.selector = value.selector;
            register.type_    = value.segment_type;
            register.s        = value.non_system_segment as u8;
            register.dpl      = value.dpl;
            register.present  = value.present as u8;
            register.avl      = value.available as u8;
            register.l        = value.long as u8;
            register.db       = value.default as u8;
            register.g        = value.granularity as u8;
        }

        self.vcpu.set_sregs(&regs)?;

        Ok(())
    }
}
