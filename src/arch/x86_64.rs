//! This module provides code specific to the x86-64 architecture.

use bitflags::bitflags;
use crate::error::Error;

/// Represents the general-purpose registers of the x86-64 architecture.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Register {
    /// The accumulator register. The guest leaves its result here before halting.
    Rax,
    Rcx,
    Rdx,
    Rbx,
    /// The stack pointer register.
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    /// The instruction pointer register.
    Rip,
    /// The status register.
    Rflags,
}

/// Protected Mode Enable.
pub const CR0_PE: u64 = 1 << 0;
/// Monitor Co-Processor.
pub const CR0_MP: u64 = 1 << 1;
/// Extension Type.
pub const CR0_ET: u64 = 1 << 4;
/// Numeric Error.
pub const CR0_NE: u64 = 1 << 5;
/// Write Protect.
pub const CR0_WP: u64 = 1 << 16;
/// Alignment Mask.
pub const CR0_AM: u64 = 1 << 18;
/// Paging.
pub const CR0_PG: u64 = 1 << 31;

/// Page Size Extension.
pub const CR4_PSE: u64 = 1 << 4;
/// Physical Address Extension.
pub const CR4_PAE: u64 = 1 << 5;

/// The Extended Feature Enable Register (EFER).
pub const MSR_IA32_EFER: u32 = 0xc000_0080;

/// Enables long mode.
pub const EFER_LME: u64 = 1 << 8;
/// Indicates long mode is active.
pub const EFER_LMA: u64 = 1 << 10;

/// Bit 1 of RFLAGS is reserved and always reads as one.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ControlRegister {
    /// Control register CR0.
    Cr0,
    /// Control register CR3. This contains the physical address of the page table at the root of
    /// the page table hierarchy.
    Cr3,
    /// Control register CR4.
    Cr4,
}

bitflags! {
    /// The bits of a page table entry that are shared by 32-bit page directories and the 64-bit
    /// paging structures.
    pub struct PageTableFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        /// Maps a 4 MiB (32-bit) or 2 MiB (64-bit) page instead of pointing to the next level.
        const HUGE_PAGE = 1 << 7;
    }
}

/// Represents a segment descriptor on the x86-64 architecture.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    /// The base address of the segment.
    pub base: u64,
    /// The limit of the segment.
    pub limit: u32,
    /// The segment selector, i.e. the value stored in the actual segment registers described by
    /// [`SegmentRegister`]. For 16-bit real mode, this describes a 16-bit value that is multiplied
    /// by 16 to get the base of the segment. For 32-bit protected mode and 64-bit long mode, this
    /// describes an index into the global descriptor table.
    pub selector: u16,
    /// The type of the segment.
    pub segment_type: u8,
    /// Whether the segment descriptor describes a code/data segment rather than a system segment.
    pub non_system_segment: bool,
    /// The privilege level of the segment, where 0 is supervisor mode and 3 is user mode.
    pub dpl: u8,
    /// Whether the segment descriptor is valid/present.
    pub present: bool,
    pub available: bool,
    /// Whether this segment uses long mode. This is only checked for 64-bit code segments.
    pub long: bool,
    pub default: bool,
    /// Whether the limit is described in bytes or in units of 4 kiB.
    pub granularity: bool,
}

/// Segment type of an execute/read code segment that has been accessed.
pub const SEGMENT_TYPE_CODE: u8 = 11;
/// Segment type of a read/write data segment that has been accessed.
pub const SEGMENT_TYPE_DATA: u8 = 3;

/// Represents the segment registers of the x86-64 architecture.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SegmentRegister {
    /// The code segment register.
    Cs,
    /// The data segment register.
    Ds,
    Es,
    Fs,
    Gs,
    /// The stack segment register.
    Ss,
}

impl SegmentRegister {
    /// Every segment register that holds a data segment.
    pub const DATA: [SegmentRegister; 5] = [
        SegmentRegister::Ds,
        SegmentRegister::Es,
        SegmentRegister::Fs,
        SegmentRegister::Gs,
        SegmentRegister::Ss,
    ];
}

/// Extends the virtual CPU with functions to access the architecture-specific registers.
pub trait CpuRegs {
    /// Gets the general-purpose registers specified by the array of [`Register`]s.
    fn get_registers(
        &self,
        registers: &[Register],
    ) -> Result<Vec<u64>, Error>;

    /// Sets the general-purpose registers specified by the array of [`Register`]s to the
    /// corresponding values.
    fn set_registers(
        &mut self,
        registers: &[Register],
        values: &[u64],
    ) -> Result<(), Error>;

    /// Gets the control registers specified by the array of [`ControlRegister`]s.
    fn get_control_registers(
        &self,
        registers: &[ControlRegister],
    ) -> Result<Vec<u64>, Error>;

    /// Sets the control registers specified by the array of [`ControlRegister`]s to the
    /// corresponding values.
    fn set_control_registers(
        &mut self,
        registers: &[ControlRegister],
        values: &[u64],
    ) -> Result<(), Error>;

    /// Sets the model-specific registers specified by the array of [`u32`]s to the corresponding
    /// values.
    fn set_msrs(
        &mut self,
        registers: &[u32],
        values: &[u64],
    ) -> Result<(), Error>;

    /// Sets the segment registers specified by the array of [`SegmentRegister`]s to the
    /// corresponding values.
    fn set_segment_registers(
        &mut self,
        registers: &[SegmentRegister],
        values: &[Segment],
    ) -> Result<(), Error>;
}
