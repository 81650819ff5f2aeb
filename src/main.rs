use clap::Parser;
use env_logger::Env;
use hy_hello::arch::x86_64::Register;
use hy_hello::dispatch::{self, Verdict};
use hy_hello::memory::DEFAULT_MEMORY_SIZE;
use hy_hello::{boot, CpuMode, Dispatcher, Error, Hypervisor};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// Runs a tiny guest program in a single-vCPU KVM virtual machine.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// The CPU mode the guest starts in.
    #[arg(short, long, value_enum, default_value_t = CpuMode::Real)]
    mode: CpuMode,
    /// A flat binary to load at guest physical address 0 instead of the built-in guest.
    #[arg(short, long)]
    guest: Option<PathBuf>,
    /// The size of guest physical memory in bytes.
    #[arg(long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: usize,
}

fn run(args: &Args) -> Result<bool, Error> {
    let image = match &args.guest {
        Some(path) => std::fs::read(path)?,
        None => args.mode.builtin_guest(),
    };

    // Access the hypervisor API native to this system.
    let hypervisor = Hypervisor::new()?;

    let mut vm = hypervisor
        .build_vm()?
        .with_memory_size(args.memory_size)
        .build()?;

    let mut vcpu = vm.create_vcpu(0)?;
    let setup = boot::bootstrap(&mut vcpu, vm.memory_mut(), args.mode, &image)?;

    let mut dispatcher = Dispatcher::new(vm.memory_mut(), std::io::stdout());
    dispatcher.run(&mut vcpu)?;

    match dispatch::verify_halt(&vcpu, vm.memory(), setup.word_size)? {
        Verdict::Success => {
            info!("guest halted with {} in {:?}", boot::HALT_SENTINEL, Register::Rax);
            Ok(true)
        }
        Verdict::WrongAccumulator(value) => {
            error!("wrong result: {:?} is {}", Register::Rax, value);
            Ok(false)
        }
        Verdict::WrongMarker(value) => {
            error!("wrong result: memory at {:#x} is {}", boot::HALT_MARKER_ADDRESS, value);
            Ok(false)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
