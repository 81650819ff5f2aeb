//! A fake vCPU that replays a fixed sequence of exits, for driving the exit loop and the bootstrap
//! code without KVM.

#![allow(dead_code)]

use hy_hello::arch::x86_64::{ControlRegister, CpuRegs, Register, Segment, SegmentRegister};
use hy_hello::{Error, ExitReason, RunVcpu};
use std::collections::{HashMap, VecDeque};

/// One exit of the script.
#[derive(Clone, Debug)]
pub enum Step {
    Out(u16, Vec<u8>),
    /// An `in` of the given width from the given port.
    In(u16, usize),
    MmioWrite(u64, Vec<u8>),
    Shutdown,
    Halt,
}

#[derive(Debug, Default)]
pub struct ScriptedVcpu {
    steps: VecDeque<Step>,
    buffer: Vec<u8>,
    pending_in: bool,
    /// The data the host supplied for each `in`, in order.
    pub inputs: Vec<Vec<u8>>,
    pub registers: HashMap<Register, u64>,
    pub control_registers: HashMap<ControlRegister, u64>,
    pub msrs: HashMap<u32, u64>,
    pub segments: HashMap<SegmentRegister, Segment>,
}

impl ScriptedVcpu {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl RunVcpu for ScriptedVcpu {
    fn run(&mut self) -> Result<ExitReason<'_>, Error> {
        if self.pending_in {
            self.inputs.push(self.buffer.clone());
            self.pending_in = false;
        }

        let step = match self.steps.pop_front() {
            Some(step) => step,
            None => return Ok(ExitReason::Unknown("script exhausted".to_string())),
        };

        let exit = match step {
            Step::Out(port, data) => {
                self.buffer = data;
                ExitReason::IoOut { port, data: &self.buffer }
            }
            Step::In(port, width) => {
                self.buffer = vec![0xff; width];
                self.pending_in = true;
                ExitReason::IoIn { port, data: &mut self.buffer }
            }
            Step::MmioWrite(address, data) => {
                self.buffer = data;
                ExitReason::MmioWrite { address, data: &self.buffer }
            }
            Step::Shutdown => ExitReason::UnhandledException,
            Step::Halt => ExitReason::Halted,
        };

        Ok(exit)
    }
}

impl CpuRegs for ScriptedVcpu {
    fn get_registers(&self, registers: &[Register]) -> Result<Vec<u64>, Error> {
        Ok(registers
            .iter()
            .map(|register| self.registers.get(register).copied().unwrap_or(0))
            .collect())
    }

    fn set_registers(&mut self, registers: &[Register], values: &[u64]) -> Result<(), Error> {
        self.registers.extend(registers.iter().copied().zip(values.iter().copied()));
        Ok(())
    }

    fn get_control_registers(&self, registers: &[ControlRegister]) -> Result<Vec<u64>, Error> {
        Ok(registers
            .iter()
            .map(|register| self.control_registers.get(register).copied().unwrap_or(0))
            .collect())
    }

    fn set_control_registers(
        &mut self,
        registers: &[ControlRegister],
        values: &[u64],
    ) -> Result<(), Error> {
        self.control_registers.extend(registers.iter().copied().zip(values.iter().copied()));
        Ok(())
    }

    fn set_msrs(&mut self, registers: &[u32], values: &[u64]) -> Result<(), Error> {
        self.msrs.extend(registers.iter().copied().zip(values.iter().copied()));
        Ok(())
    }

    fn set_segment_registers(
        &mut self,
        registers: &[SegmentRegister],
        values: &[Segment],
    ) -> Result<(), Error> {
        self.segments.extend(registers.iter().copied().zip(values.iter().cloned()));
        Ok(())
    }
}

/// The port data of an `out` of a 32-bit word.
pub fn word(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}
