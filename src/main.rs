use std::fs;
use std::path::PathBuf;
use std::process;

use allegrex_vm::cpu::reg;
use allegrex_vm::{Emulator, EmulatorConfig, KernelHandler, RunExit};
use clap::Parser;

#[derive(Parser)]
#[command(name = "allegrex-vm", about = "MIPS32 emulator with a native-code JIT")]
struct Args {
    /// Guest image: ELF executable or raw binary.
    image: PathBuf,

    /// Maximum units of work (interpreted instructions or compiled
    /// blocks) before giving up.
    #[arg(long, default_value_t = 10_000_000)]
    cycles: u64,

    /// Run the interpreter only.
    #[arg(long)]
    no_jit: bool,

    /// Decode vector-unit fields on COP2 words.
    #[arg(long)]
    vfpu: bool,

    /// Dump JIT statistics as JSON on exit.
    #[arg(long)]
    stats: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let image = fs::read(&args.image)?;

    let mut config = EmulatorConfig::default();
    config.jit.enabled &= !args.no_jit;
    config.vfpu_decode = args.vfpu;

    let mut emu = Emulator::new(config);
    emu.load(&image)?;
    emu.set_syscall_handler(Box::new(KernelHandler::new()));

    let result = emu.run(args.cycles);

    if args.stats {
        if let Some(diag) = emu.jit_diagnostics() {
            println!("{}", serde_json::to_string_pretty(&diag)?);
        }
    }

    match result {
        Ok(RunExit::Halted) => {
            eprintln!(
                "guest exited: $v0={:#010x}, {} interpreted steps, {} compiled blocks",
                emu.state.gpr[reg::V0],
                emu.steps_interpreted(),
                emu.blocks_executed()
            );
        }
        Ok(RunExit::BudgetExhausted) => {
            eprintln!("cycle budget exhausted at pc={:#010x}", emu.state.pc);
        }
        Err(err) => {
            eprintln!("emulation fault: {err}");
            eprintln!(
                "pc={:#010x} next_pc={:#010x} cause={:#x} epc={:#010x}",
                emu.state.pc, emu.state.next_pc, emu.state.cp0_cause, emu.state.cp0_epc
            );
            process::exit(1);
        }
    }

    Ok(())
}
