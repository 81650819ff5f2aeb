//! This module provides the exit loop: [`Dispatcher::run`] resumes the vCPU, decodes why it
//! stopped and services the guest's port I/O until the guest halts.
//!
//! Console output is not buffered across exits: every byte the guest writes to
//! [`CONSOLE_PORT`] is an exit of its own and reaches the console before the guest resumes.

use crate::arch::x86_64::{CpuRegs, Register};
use crate::boot::{HALT_MARKER_ADDRESS, HALT_SENTINEL};
use crate::error::Error;
use crate::fs::FileSystem;
use crate::memory::GuestMemory;
use crate::protocol::{self, CONSOLE_PORT, EXIT_COUNT_PORT, FS_PORT, STRING_PORT, VALUE_PORT};
use crate::vcpu::{ExitReason, RunVcpu};
use log::{debug, info, warn};
use std::io::Write;

/// What the loop does after an exit has been handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Resume the vCPU.
    Resume,
    /// The guest halted.
    Halt,
}

/// The outcome of checking the guest's state after it halted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Both the accumulator and the halt marker hold [`HALT_SENTINEL`].
    Success,
    /// The accumulator holds the given value instead.
    WrongAccumulator(u64),
    /// The halt marker holds the given value instead.
    WrongMarker(u64),
}

/// The state owned by the exit loop: guest memory, the open files of the guest, the console and
/// the number of I/O exits so far.
pub struct Dispatcher<'a, W: Write> {
    memory: &'a mut GuestMemory,
    files: FileSystem,
    console: W,
    io_exits: u32,
}

impl<'a, W: Write> Dispatcher<'a, W> {
    /// Creates a dispatcher with an empty open file table that writes guest output to `console`.
    pub fn new(memory: &'a mut GuestMemory, console: W) -> Self {
        Self {
            memory,
            files: FileSystem::new(),
            console,
            io_exits: 0,
        }
    }

    /// The number of I/O exits handled so far, wrapping around after `u32::MAX`.
    pub fn io_exits(&self) -> u32 {
        self.io_exits
    }

    pub fn files(&self) -> &FileSystem {
        &self.files
    }

    pub fn console(&self) -> &W {
        &self.console
    }

    pub fn memory(&self) -> &GuestMemory {
        &*self.memory
    }

    pub fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut *self.memory
    }

    /// Runs `vcpu` until the guest halts.
    ///
    /// Any exit other than port I/O or `hlt` ends the loop with [`Error::UnexpectedExit`]: the
    /// guest has left the supported protocol and its state cannot be trusted.
    pub fn run<V: RunVcpu>(&mut self, vcpu: &mut V) -> Result<(), Error> {
        loop {
            let exit = vcpu.run()?;

            if self.handle_exit(exit)? == Flow::Halt {
                info!("guest halted after {} I/O exits", self.io_exits);
                return Ok(());
            }
        }
    }

    /// Handles a single exit.
    pub fn handle_exit(&mut self, exit: ExitReason<'_>) -> Result<Flow, Error> {
        match exit {
            ExitReason::Halted => Ok(Flow::Halt),
            ExitReason::IoOut { port, data } => {
                self.io_exits = self.io_exits.wrapping_add(1);
                self.handle_out(port, data)?;

                Ok(Flow::Resume)
            }
            ExitReason::IoIn { port, data } => {
                self.io_exits = self.io_exits.wrapping_add(1);
                self.handle_in(port, data);

                Ok(Flow::Resume)
            }
            other => Err(Error::UnexpectedExit(format!("{:?}", other))),
        }
    }

    fn handle_out(&mut self, port: u16, data: &[u8]) -> Result<(), Error> {
        match port {
            CONSOLE_PORT => {
                self.console.write_all(data)?;
                self.console.flush()?;
            }
            STRING_PORT => {
                let offset = i64::from(protocol::io_word(data));
                let available = self.memory.size().saturating_sub(offset as usize);

                match self.memory.c_str(offset, available) {
                    Ok(string) => {
                        self.console.write_all(&string)?;
                        self.console.flush()?;
                    }
                    Err(e) => warn!("cannot display string at {:#x}: {}", offset, e),
                }
            }
            VALUE_PORT => {
                writeln!(self.console, "{}", protocol::io_word(data))?;
                self.console.flush()?;
            }
            FS_PORT => {
                self.files.handle_request(&mut *self.memory, protocol::io_word(data));
            }
            _ => warn!("ignoring write of {:02x?} to port {:#x}", data, port),
        }

        Ok(())
    }

    fn handle_in(&mut self, port: u16, data: &mut [u8]) {
        match port {
            EXIT_COUNT_PORT => {
                let count = self.io_exits.to_le_bytes();
                let length = data.len().min(count.len());

                data[..length].copy_from_slice(&count[..length]);
                debug!("reported {} I/O exits to the guest", self.io_exits);
            }
            _ => warn!("ignoring read of {} bytes from port {:#x}", data.len(), port),
        }
    }
}

/// Checks that the guest ran to completion: the accumulator and the `word_size` bytes at
/// [`HALT_MARKER_ADDRESS`] must both hold [`HALT_SENTINEL`].
pub fn verify_halt<V: CpuRegs>(
    vcpu: &V,
    memory: &GuestMemory,
    word_size: usize,
) -> Result<Verdict, Error> {
    let accumulator = vcpu.get_registers(&[Register::Rax])?[0];

    if accumulator != HALT_SENTINEL {
        return Ok(Verdict::WrongAccumulator(accumulator));
    }

    let marker = memory.read_uint(HALT_MARKER_ADDRESS as i64, word_size)?;

    if marker != HALT_SENTINEL {
        return Ok(Verdict::WrongMarker(marker));
    }

    Ok(Verdict::Success)
}
