//! Trap bridge.
//!
//! The single function generated code calls to leave fast-path execution.
//! It records the exception cause and raises the exit-request flag on
//! [`CpuState`]; the execution loop observes the flag after the block
//! returns and runs one interpreter step to handle the trap fully.
//! Generated code never calls back into the interpreter or the cache —
//! this flag is the only channel out of the fast path.

use crate::cpu::CpuState;

pub extern "C" fn jit_trap_bridge(state: *mut CpuState, cause: u32) {
    debug_assert!(!state.is_null());
    // SAFETY: generated code passes through the CpuState pointer it was
    // invoked with, which the execution loop guarantees is live for the
    // duration of the block call.
    let state = unsafe { &mut *state };
    state.cp0_cause = cause;
    state.jit_exit_request = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CAUSE_SYSCALL;

    #[test]
    fn test_bridge_sets_flag_and_cause() {
        let mut state = CpuState::new();
        assert!(!state.jit_exit_request);

        jit_trap_bridge(&mut state, CAUSE_SYSCALL);

        assert!(state.jit_exit_request);
        assert_eq!(state.cp0_cause, CAUSE_SYSCALL);
    }
}
