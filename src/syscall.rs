//! Syscall dispatch.
//!
//! The ABI: the syscall identifier arrives in $v0, arguments in $a0–$a3;
//! the handler writes its result back into $v0 and may redirect PC. The
//! trap itself (cause, EPC, vectoring) has already been taken by the
//! interpreter when a handler runs.

use crate::cpu::{CpuError, CpuState, STATUS_EXL, reg};
use crate::memory::Memory;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kernel service identifiers.
pub mod ids {
    pub const EXIT: u32 = 0x0001;
    pub const EXIT_THREAD: u32 = 0x0002;
    pub const GET_TIME: u32 = 0x0100;
    pub const CTRL_INPUT: u32 = 0x0200;
}

/// Callback contract between the core and the surrounding kernel
/// emulation. Implementations access guest state only through the
/// register and memory contracts.
pub trait SyscallHandler {
    fn handle(&mut self, state: &mut CpuState, memory: &mut Memory, id: u32)
    -> Result<(), CpuError>;
}

/// Minimal kernel services: enough to exit cleanly, read wall-clock time
/// and poll a (host-fed) button mask.
#[derive(Debug, Default)]
pub struct KernelHandler {
    buttons: u32,
}

impl KernelHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the button mask CTRL_INPUT reports to the guest.
    pub fn set_buttons(&mut self, mask: u32) {
        self.buttons = mask;
    }
}

impl SyscallHandler for KernelHandler {
    fn handle(
        &mut self,
        state: &mut CpuState,
        _memory: &mut Memory,
        id: u32,
    ) -> Result<(), CpuError> {
        match id {
            ids::EXIT | ids::EXIT_THREAD => {
                log::info!("exit syscall (status={})", state.gpr(reg::A0)?);
                state.running = false;
                state.set_gpr(reg::V0, 0)?;
            }
            ids::GET_TIME => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                state.set_gpr(reg::V0, now)?;
            }
            ids::CTRL_INPUT => {
                state.set_gpr(reg::V0, self.buttons)?;
            }
            _ => {
                log::warn!("unknown syscall {id:#06x}; returning 0");
                state.set_gpr(reg::V0, 0)?;
            }
        }

        // Resume past the trapping instruction.
        state.set_pc(state.cp0_epc.wrapping_add(4));
        state.cp0_status &= !STATUS_EXL;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trapped_state(id: u32, epc: u32) -> CpuState {
        let mut state = CpuState::new();
        state.set_gpr(reg::V0, id).unwrap();
        state.cp0_epc = epc;
        state.cp0_status |= STATUS_EXL;
        state
    }

    #[test]
    fn test_exit_clears_running() {
        let mut state = trapped_state(ids::EXIT, 0x100);
        let mut memory = Memory::with_size(0x1000);

        KernelHandler::new()
            .handle(&mut state, &mut memory, ids::EXIT)
            .unwrap();

        assert!(!state.running);
        assert_eq!(state.gpr(reg::V0).unwrap(), 0);
    }

    #[test]
    fn test_handler_resumes_after_trap() {
        let mut state = trapped_state(ids::CTRL_INPUT, 0x200);
        let mut memory = Memory::with_size(0x1000);
        let mut handler = KernelHandler::new();
        handler.set_buttons(0x8000);

        handler
            .handle(&mut state, &mut memory, ids::CTRL_INPUT)
            .unwrap();

        assert_eq!(state.gpr(reg::V0).unwrap(), 0x8000);
        assert_eq!(state.pc, 0x204);
        assert_eq!(state.next_pc, 0x208);
        assert_eq!(state.cp0_status & STATUS_EXL, 0);
    }

    #[test]
    fn test_unknown_syscall_returns_zero() {
        let mut state = trapped_state(0xDEAD, 0x300);
        let mut memory = Memory::with_size(0x1000);

        KernelHandler::new()
            .handle(&mut state, &mut memory, 0xDEAD)
            .unwrap();

        assert_eq!(state.gpr(reg::V0).unwrap(), 0);
        assert!(state.running);
    }
}
