//! This module puts the vCPU into one of the supported CPU modes and loads the guest image.
//!
//! Every mode is described by a [`ModeSetup`] value and applied by the single [`bootstrap`]
//! function: the guest is identity mapped, its code starts at guest physical address zero and the
//! page tables of the paged modes live at [`PAGE_TABLE_BASE`].

use crate::arch::x86_64::{
    ControlRegister, CpuRegs, PageTableFlags, Register, Segment, SegmentRegister,
    CR0_AM, CR0_ET, CR0_MP, CR0_NE, CR0_PE, CR0_PG, CR0_WP, CR4_PAE, CR4_PSE, EFER_LMA,
    EFER_LME, MSR_IA32_EFER, RFLAGS_RESERVED, SEGMENT_TYPE_CODE, SEGMENT_TYPE_DATA,
};
use crate::error::Error;
use crate::memory::GuestMemory;
use log::info;

/// Where the first paging structure is placed. The guest image must end below it.
pub const PAGE_TABLE_BASE: u64 = 0x2000;
const PDPT_ADDRESS: u64 = 0x3000;
const PD_ADDRESS: u64 = 0x4000;

/// The guest stores [`HALT_SENTINEL`] here right before it halts.
pub const HALT_MARKER_ADDRESS: u64 = 0x400;
/// The value the guest leaves in the accumulator and at [`HALT_MARKER_ADDRESS`].
pub const HALT_SENTINEL: u64 = 42;

/// CR0 of the paged modes.
const PAGED_CR0: u64 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;

/// The CPU mode the guest starts executing in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum CpuMode {
    /// 16-bit real mode.
    Real,
    /// 32-bit protected mode without paging.
    Protected,
    /// 32-bit protected mode with a single 4 MiB page.
    Paged32,
    /// 64-bit long mode with a single 2 MiB page.
    Long,
}

/// The paging structures a mode needs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Paging {
    Disabled,
    /// A page directory with one 4 MiB page.
    Flat32,
    /// PML4, PDPT and page directory mapping one 2 MiB page.
    Long,
}

/// The initial vCPU state of a [`CpuMode`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModeSetup {
    pub code: Segment,
    pub data: Segment,
    /// Sets CR0.PE on top of the reset value of CR0. Ignored when paging is enabled, since the
    /// paged modes load CR0 as a whole.
    pub protected: bool,
    pub paging: Paging,
    /// The initial stack pointer.
    pub stack_pointer: u64,
    /// The width in bytes of the word compared against [`HALT_SENTINEL`] after the guest halts.
    pub word_size: usize,
}

fn flat_segment(selector: u16, segment_type: u8) -> Segment {
    Segment {
        base: 0,
        limit: 0xffff_ffff,
        selector,
        segment_type,
        non_system_segment: true,
        dpl: 0,
        present: true,
        default: true,
        // 4 kiB granularity.
        granularity: true,
        ..Default::default()
    }
}

impl CpuMode {
    /// Describes the initial state of this mode for a guest with `memory_size` bytes of memory.
    pub fn setup(self, memory_size: usize) -> ModeSetup {
        match self {
            CpuMode::Real => {
                let code = Segment {
                    limit: 0xffff,
                    segment_type: SEGMENT_TYPE_CODE,
                    non_system_segment: true,
                    present: true,
                    ..Default::default()
                };

                ModeSetup {
                    data: Segment { segment_type: SEGMENT_TYPE_DATA, ..code.clone() },
                    code,
                    protected: false,
                    paging: Paging::Disabled,
                    stack_pointer: 0,
                    word_size: 2,
                }
            }
            CpuMode::Protected | CpuMode::Paged32 => ModeSetup {
                code: flat_segment(1 << 3, SEGMENT_TYPE_CODE),
                data: flat_segment(2 << 3, SEGMENT_TYPE_DATA),
                protected: true,
                paging: if self == CpuMode::Paged32 { Paging::Flat32 } else { Paging::Disabled },
                stack_pointer: memory_size as u64,
                word_size: 4,
            },
            CpuMode::Long => {
                let code = Segment {
                    default: false,
                    long: true,
                    ..flat_segment(1 << 3, SEGMENT_TYPE_CODE)
                };

                ModeSetup {
                    data: Segment {
                        selector: 2 << 3,
                        segment_type: SEGMENT_TYPE_DATA,
                        ..code.clone()
                    },
                    code,
                    protected: true,
                    paging: Paging::Long,
                    stack_pointer: memory_size as u64,
                    word_size: 8,
                }
            }
        }
    }

    /// A minimal guest for this mode: it writes `Hello, world!` to the console port one byte at a
    /// time, stores [`HALT_SENTINEL`] at [`HALT_MARKER_ADDRESS`] and in the accumulator, and halts.
    pub fn builtin_guest(self) -> Vec<u8> {
        let mut code = vec![];

        for &byte in b"Hello, world!\n" {
            // mov al, imm8; out 0xe9, al
            code.extend_from_slice(&[0xb0, byte, 0xe6, crate::protocol::CONSOLE_PORT as u8]);
        }

        let marker = (HALT_MARKER_ADDRESS as u32).to_le_bytes();
        let sentinel = HALT_SENTINEL as u8;

        match self {
            CpuMode::Real => {
                // mov byte [disp16], imm8; mov ax, imm16
                code.extend_from_slice(&[0xc6, 0x06, marker[0], marker[1], sentinel]);
                code.extend_from_slice(&[0xb8, sentinel, 0x00]);
            }
            CpuMode::Protected | CpuMode::Paged32 => {
                // mov byte [disp32], imm8; mov eax, imm32
                code.extend_from_slice(&[0xc6, 0x05]);
                code.extend_from_slice(&marker);
                code.push(sentinel);
                code.extend_from_slice(&[0xb8, sentinel, 0x00, 0x00, 0x00]);
            }
            CpuMode::Long => {
                // mov byte [disp32] (SIB, no base), imm8; mov eax, imm32
                code.extend_from_slice(&[0xc6, 0x04, 0x25]);
                code.extend_from_slice(&marker);
                code.push(sentinel);
                code.extend_from_slice(&[0xb8, sentinel, 0x00, 0x00, 0x00]);
            }
        }

        // 1: hlt; jmp 1b
        code.extend_from_slice(&[0xf4, 0xeb, 0xfd]);

        code
    }
}

fn write_page_tables(memory: &mut GuestMemory, paging: Paging) -> Result<(), Error> {
    let entry = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER;

    match paging {
        Paging::Disabled => {}
        Paging::Flat32 => {
            let pde = (entry | PageTableFlags::HUGE_PAGE).bits() as u32;

            memory.write_obj(PAGE_TABLE_BASE as i64, pde)?;
        }
        Paging::Long => {
            let pml4e = entry.bits() | PDPT_ADDRESS;
            let pdpte = entry.bits() | PD_ADDRESS;
            let pde = (entry | PageTableFlags::HUGE_PAGE).bits();

            memory.write_obj(PAGE_TABLE_BASE as i64, pml4e)?;
            memory.write_obj(PDPT_ADDRESS as i64, pdpte)?;
            memory.write_obj(PD_ADDRESS as i64, pde)?;
        }
    }

    Ok(())
}

/// Puts `vcpu` into `mode`, writes the page tables the mode needs and copies `image` to guest
/// physical address zero, where execution starts.
pub fn bootstrap<V: CpuRegs>(
    vcpu: &mut V,
    memory: &mut GuestMemory,
    mode: CpuMode,
    image: &[u8],
) -> Result<ModeSetup, Error> {
    let setup = mode.setup(memory.size());

    if setup.paging != Paging::Disabled && image.len() as u64 > PAGE_TABLE_BASE {
        return Err(Error::ImageTooLarge {
            size: image.len(),
            limit: PAGE_TABLE_BASE,
        });
    }

    let mut segments = vec![setup.code.clone()];
    segments.extend(std::iter::repeat(setup.data.clone()).take(SegmentRegister::DATA.len()));

    let mut registers = vec![SegmentRegister::Cs];
    registers.extend_from_slice(&SegmentRegister::DATA);

    vcpu.set_segment_registers(&registers, &segments)?;

    match setup.paging {
        Paging::Disabled if setup.protected => {
            let cr0 = vcpu.get_control_registers(&[ControlRegister::Cr0])?[0];

            vcpu.set_control_registers(&[ControlRegister::Cr0], &[cr0 | CR0_PE])?;
        }
        Paging::Disabled => {}
        Paging::Flat32 | Paging::Long => {
            write_page_tables(memory, setup.paging)?;

            let (cr4, efer) = match setup.paging {
                Paging::Long => (CR4_PAE, EFER_LME | EFER_LMA),
                _ => (CR4_PSE, 0),
            };

            vcpu.set_control_registers(
                &[ControlRegister::Cr3, ControlRegister::Cr4, ControlRegister::Cr0],
                &[PAGE_TABLE_BASE, cr4, PAGED_CR0],
            )?;
            vcpu.set_msrs(&[MSR_IA32_EFER], &[efer])?;
        }
    }

    vcpu.set_registers(
        &[Register::Rflags, Register::Rip, Register::Rsp],
        &[RFLAGS_RESERVED, 0, setup.stack_pointer],
    )?;

    memory.write(0, image)?;

    info!("starting guest in {:?} mode, {} byte image", mode, image.len());

    Ok(setup)
}
