//! Execution loop.
//!
//! [`Emulator`] owns the session: one [`CpuState`], one [`Memory`], the
//! interpreter and (when the host supports it) the translation engine.
//! Per unit of work it tries the JIT; when generated code raises the
//! exit-request flag it runs exactly one interpreter step, which handles
//! the pending trap fully; when nothing can be compiled it interprets.
//!
//! ```text
//! Dispatching ──block──▶ JitExecuting ──exit flag──▶ Interpreting
//!      ▲  │                    │                          │
//!      │  └──no block──────────┼──────────────────────────┤
//!      │                       ▼                          │
//!      └───────────────────────┴◀─────────────────────────┘
//!                         (running == false ▶ Halted)
//! ```

use crate::cpu::interpreter::{Interpreter, TrapEvent};
use crate::cpu::{CpuError, CpuState};
use crate::decoder::Decoder;
use crate::jit::compiler::{BlockEntry, JitCompiler};
use crate::jit::types::{JitConfig, JitDiagnostics};
use crate::loader::{LoadError, load_image};
use crate::memory::Memory;
use crate::syscall::SyscallHandler;

#[derive(Debug, Clone, Default)]
pub struct EmulatorConfig {
    pub jit: JitConfig,
    /// Decode vector-unit fields on COP2 words.
    pub vfpu_decode: bool,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The guest signalled termination (`running` cleared).
    Halted,
    /// The step budget ran out; call `run` again to continue.
    BudgetExhausted,
}

enum Phase {
    Dispatching,
    JitExecuting(BlockEntry),
    Interpreting,
    Halted,
}

pub struct Emulator {
    pub state: CpuState,
    pub memory: Memory,
    interpreter: Interpreter,
    jit: Option<JitCompiler>,
    handler: Option<Box<dyn SyscallHandler>>,
    steps_interpreted: u64,
    blocks_executed: u64,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let decoder = if config.vfpu_decode {
            Decoder::with_vfpu()
        } else {
            Decoder::new()
        };
        let jit = if config.jit.enabled {
            match JitCompiler::new(config.jit.clone()) {
                Ok(jit) => Some(jit),
                Err(err) => {
                    log::warn!("translation engine unavailable ({err}); interpreting only");
                    None
                }
            }
        } else {
            None
        };

        Self {
            state: CpuState::new(),
            memory: Memory::new(),
            interpreter: Interpreter::new(decoder),
            jit,
            handler: None,
            steps_interpreted: 0,
            blocks_executed: 0,
        }
    }

    pub fn set_syscall_handler(&mut self, handler: Box<dyn SyscallHandler>) {
        self.handler = Some(handler);
    }

    /// Load a guest image and reset the session to its entry point. Any
    /// previously compiled code is dropped.
    pub fn load(&mut self, image: &[u8]) -> Result<(), LoadError> {
        let loaded = load_image(&mut self.memory, image)?;
        self.state.reset_to(loaded.entry_pc, loaded.gp);
        if let Some(jit) = &mut self.jit {
            jit.flush();
        }
        Ok(())
    }

    /// Run up to `max_units` units of work (one interpreted instruction
    /// or one compiled block each).
    pub fn run(&mut self, max_units: u64) -> Result<RunExit, CpuError> {
        let mut phase = Phase::Dispatching;
        let mut units: u64 = 0;

        loop {
            phase = match phase {
                Phase::Dispatching => {
                    if !self.state.running {
                        Phase::Halted
                    } else if units >= max_units {
                        return Ok(RunExit::BudgetExhausted);
                    } else {
                        self.state.jit_exit_request = false;
                        match self.dispatch() {
                            Some(entry) => Phase::JitExecuting(entry),
                            None => Phase::Interpreting,
                        }
                    }
                }
                Phase::JitExecuting(entry) => {
                    entry.invoke(&mut self.state);
                    self.blocks_executed += 1;
                    units += 1;
                    if self.state.jit_exit_request {
                        // The trap is handled by exactly one interpreter
                        // step, budget or not.
                        Phase::Interpreting
                    } else {
                        Phase::Dispatching
                    }
                }
                Phase::Interpreting => {
                    self.interpret_one()?;
                    units += 1;
                    Phase::Dispatching
                }
                Phase::Halted => return Ok(RunExit::Halted),
            };
        }
    }

    /// Pick a compiled block for the current PC, if the fast path
    /// applies.
    fn dispatch(&mut self) -> Option<BlockEntry> {
        // A pending branch target in next_pc means the next instruction
        // is a delay slot; only the interpreter handles those.
        if self.state.next_pc != self.state.pc.wrapping_add(4) {
            return None;
        }
        self.jit
            .as_mut()
            .and_then(|jit| jit.compile(self.state.pc, &self.memory))
    }

    fn interpret_one(&mut self) -> Result<(), CpuError> {
        let outcome = self.interpreter.step(&mut self.state, &mut self.memory)?;
        self.steps_interpreted += 1;

        if let Some(addr) = outcome.store {
            if let Some(jit) = &mut self.jit {
                jit.invalidate_write(addr);
            }
        }

        match outcome.event {
            Some(TrapEvent::Syscall { id }) => {
                if let Some(handler) = self.handler.as_mut() {
                    handler.handle(&mut self.state, &mut self.memory, id)?;
                }
            }
            Some(TrapEvent::Break) | None => {}
        }
        Ok(())
    }

    pub fn jit_diagnostics(&self) -> Option<JitDiagnostics> {
        self.jit.as_ref().map(|jit| jit.diagnostics())
    }

    pub fn jit(&self) -> Option<&JitCompiler> {
        self.jit.as_ref()
    }

    pub fn steps_interpreted(&self) -> u64 {
        self.steps_interpreted
    }

    pub fn blocks_executed(&self) -> u64 {
        self.blocks_executed
    }
}
