//! MIPS32 (Allegrex-class) CPU emulation core.
//!
//! Two execution strategies share one machine state: a reference
//! interpreter that is always correct, and a dynamic translator that
//! compiles hot straight-line runs into native host code. Generated code
//! hands control back through a single trap bridge, and the execution
//! loop falls back to the interpreter for exactly one step whenever that
//! happens.
//!
//! Out of scope here, reached only through the register/memory/syscall
//! contracts: disc parsing, audio/video, input devices, save states.

pub mod cpu;
pub mod decoder;
pub mod jit;
pub mod loader;
pub mod memory;
pub mod syscall;
pub mod vm;

pub use cpu::interpreter::{Interpreter, StepOutcome, TrapEvent};
pub use cpu::{CpuError, CpuState, TRAP_VECTOR};
pub use decoder::{DecodedInstruction, Decoder, Op};
pub use loader::{LoadError, LoadedImage, load_image};
pub use memory::{Memory, MemoryError, RAM_SIZE};
pub use syscall::{KernelHandler, SyscallHandler};
pub use vm::{Emulator, EmulatorConfig, RunExit};

// ═══════════════════════════════════════════════════════════════════════════
// JIT Exports
// ═══════════════════════════════════════════════════════════════════════════

pub use jit::{
    BlockCache, BlockFn, CacheStats, CodeArena, Emitter, JitBlock, JitCompiler, JitConfig,
    JitDiagnostics, JitError, JitStats,
};
