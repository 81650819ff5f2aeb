//! This modules provides the [`Vcpu`] struct which represents the single virtual CPU of the VM,
//! and the [`RunVcpu`] trait the exit loop drives it through.

use crate::arch::x86_64::{ControlRegister, CpuRegs, Register, Segment, SegmentRegister};
use crate::error::Error;
use crate::platform;

/// The exit reason that describes why [`RunVcpu::run`] quit.
#[derive(Debug)]
pub enum ExitReason<'a> {
    /// The virtual CPU executed an `out` instruction on the given port with the given data.
    IoOut { port: u16, data: &'a [u8] },
    /// The virtual CPU executed an `in` instruction on the given port. The `data` slice should be
    /// filled with data before calling [`RunVcpu::run`] to resume execution of the virtual CPU.
    IoIn { port: u16, data: &'a mut [u8] },
    /// The virtual CPU tried to read from the given MMIO address.
    MmioRead { address: u64 },
    /// The virtual CPU tried to write the given data to the given MMIO address.
    MmioWrite { address: u64, data: &'a [u8] },
    /// The virtual CPU executed the `hlt` instruction.
    Halted,
    /// The virtual CPU raised an exception that was not handled by the guest, i.e. a triple
    /// fault. The virtual CPU state should not be relied upon afterwards.
    UnhandledException,
    /// The virtual CPU exited for some other reason, described by the string.
    Unknown(String),
}

/// Runs a virtual CPU until its next exit.
pub trait RunVcpu {
    /// Consumes the current thread to run the virtual CPU until the next exit point. This
    /// function returns an [`ExitReason`] to describe why the virtual CPU exited.
    fn run(&mut self) -> Result<ExitReason<'_>, Error>;
}

/// The `Vcpu` struct represents a virtual CPU that is part of the VM.
pub struct Vcpu {
    /// The internal platform-specific implementation of the [`platform::Vcpu`] struct.
    pub(crate) inner: platform::Vcpu,
}

impl RunVcpu for Vcpu {
    fn run(&mut self) -> Result<ExitReason<'_>, Error> {
        self.inner.run()
    }
}

impl CpuRegs for Vcpu {
    fn get_registers(
        &self,
        registers: &[Register],
    ) -> Result<Vec<u64>, Error> {
        self.inner.get_registers(registers)
    }

    fn set_registers(
        &mut self,
        registers: &[Register],
        values: &[u64],
    ) -> Result<(), Error> {
        self.inner.set_registers(registers, values)
    }

    fn get_control_registers(
        &self,
        registers: &[ControlRegister],
    ) -> Result<Vec<u64>, Error> {
        self.inner.get_control_registers(registers)
    }

    fn set_control_registers(
        &mut self,
        registers: &[ControlRegister],
        values: &[u64],
    ) -> Result<(), Error> {
        self.inner.set_control_registers(registers, values)
    }

    fn set_msrs(
        &mut self,
        registers: &[u32],
        values: &[u64],
    ) -> Result<(), Error> {
        self.inner.set_msrs(registers, values)
    }

    fn set_segment_registers(
        &mut self,
        registers: &[SegmentRegister],
        values: &[Segment],
    ) -> Result<(), Error> {
        self.inner.set_segment_registers(registers, values)
    }
}
