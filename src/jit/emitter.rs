//! Native code emitter.
//!
//! Translates decoded guest instructions into x86-64 bytes, one guest
//! instruction to a short host sequence. The generated function follows
//! the System V calling convention:
//!
//! - single argument: `*mut CpuState`, which stays in `rdi` for the whole
//!   block; guest registers are read and written through `[rdi + offset]`,
//! - `eax` is the one scratch register,
//! - a trapping instruction stores its own pc back (so the interpreter
//!   re-executes it and vectors), then calls the trap bridge; the call is
//!   always the last thing before the epilogue, so clobbers don't matter.
//!
//! Every translated instruction computes exactly what the interpreter
//! computes for the same inputs.

use super::bridge::jit_trap_bridge;
use crate::cpu::{CAUSE_BREAK, CAUSE_SYSCALL, CpuState};
use crate::decoder::{DecodedInstruction, Op};
use std::mem::offset_of;

fn gpr_offset(index: u8) -> i32 {
    (offset_of!(CpuState, gpr) + 4 * index as usize) as i32
}

fn pc_offset() -> i32 {
    offset_of!(CpuState, pc) as i32
}

fn next_pc_offset() -> i32 {
    offset_of!(CpuState, next_pc) as i32
}

/// Raw little-endian byte buffer.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.code
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }
}

pub struct Emitter {
    buf: CodeBuffer,
}

impl Emitter {
    pub fn new() -> Self {
        let mut emitter = Self {
            buf: CodeBuffer::default(),
        };
        emitter.emit_prologue();
        emitter
    }

    /// Translate one decoded instruction. Returns false (emitting
    /// nothing) when the instruction has no native mapping and the block
    /// must be truncated before it.
    pub fn translate(&mut self, d: &DecodedInstruction) -> bool {
        match d.op {
            Op::Lui => {
                if d.rt != 0 {
                    self.store_gpr_imm(d.rt, d.uimm() << 16);
                }
            }
            Op::Ori => self.alu_imm(d, 0x0D),
            Op::Andi => self.alu_imm(d, 0x25),
            Op::Xori => self.alu_imm(d, 0x35),
            Op::Addi | Op::Addiu => {
                if d.rt != 0 {
                    self.load_gpr(d.rs);
                    // add eax, imm32 (sign-extended guest immediate)
                    self.buf.emit_u8(0x05);
                    self.buf.emit_u32(d.simm() as u32);
                    self.store_gpr(d.rt);
                }
            }
            Op::Add | Op::Addu => self.alu_reg(d, 0x03),
            Op::Sub | Op::Subu => self.alu_reg(d, 0x2B),
            Op::And => self.alu_reg(d, 0x23),
            Op::Or => self.alu_reg(d, 0x0B),
            Op::Xor => self.alu_reg(d, 0x33),
            Op::Nor => {
                if d.rd != 0 {
                    self.load_gpr(d.rs);
                    self.mem_op(0x0B, gpr_offset(d.rt)); // or eax, [rdi+rt]
                    self.buf.emit_u8(0xF7); // not eax
                    self.buf.emit_u8(0xD0);
                    self.store_gpr(d.rd);
                }
            }
            Op::Sll => self.shift_imm(d, 0xE0),
            Op::Srl => self.shift_imm(d, 0xE8),
            Op::Sra => self.shift_imm(d, 0xF8),
            Op::Syscall => self.emit_trap(d.pc, CAUSE_SYSCALL),
            Op::Break => self.emit_trap(d.pc, CAUSE_BREAK),
            _ => return false,
        }
        true
    }

    /// Store the fall-through continuation point for a block that ends
    /// without trapping.
    pub fn finish_fallthrough(&mut self, end_pc: u32) {
        self.store_state_imm(pc_offset(), end_pc);
        self.store_state_imm(next_pc_offset(), end_pc.wrapping_add(4));
    }

    /// Append the return sequence and yield the finished bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.emit_u8(0x5D); // pop rbp
        self.buf.emit_u8(0xC3); // ret
        self.buf.into_bytes()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    // ── host instruction helpers ───────────────────────────────────────

    fn emit_prologue(&mut self) {
        self.buf.emit_u8(0x55); // push rbp
        self.buf.emit_u8(0x48); // mov rbp, rsp
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(0xE5);
    }

    /// `op eax, [rdi + disp]` for the given opcode byte.
    fn mem_op(&mut self, opcode: u8, disp: i32) {
        self.buf.emit_u8(opcode);
        self.buf.emit_u8(0x87); // ModRM: mod=10 reg=eax rm=rdi
        self.buf.emit_u32(disp as u32);
    }

    /// `mov eax, [rdi + gpr]`
    fn load_gpr(&mut self, index: u8) {
        self.mem_op(0x8B, gpr_offset(index));
    }

    /// `mov [rdi + gpr], eax`
    fn store_gpr(&mut self, index: u8) {
        self.mem_op(0x89, gpr_offset(index));
    }

    /// `mov dword [rdi + disp], imm32`
    fn store_state_imm(&mut self, disp: i32, value: u32) {
        self.buf.emit_u8(0xC7);
        self.buf.emit_u8(0x87);
        self.buf.emit_u32(disp as u32);
        self.buf.emit_u32(value);
    }

    fn store_gpr_imm(&mut self, index: u8, value: u32) {
        self.store_state_imm(gpr_offset(index), value);
    }

    /// rt = rs `op` zero-extended immediate.
    fn alu_imm(&mut self, d: &DecodedInstruction, imm_opcode: u8) {
        if d.rt == 0 {
            return;
        }
        self.load_gpr(d.rs);
        self.buf.emit_u8(imm_opcode);
        self.buf.emit_u32(d.uimm());
        self.store_gpr(d.rt);
    }

    /// rd = rs `op` rt.
    fn alu_reg(&mut self, d: &DecodedInstruction, mem_opcode: u8) {
        if d.rd == 0 {
            return;
        }
        self.load_gpr(d.rs);
        self.mem_op(mem_opcode, gpr_offset(d.rt));
        self.store_gpr(d.rd);
    }

    /// rd = rt shifted by shamt; `modrm` selects shl/shr/sar.
    fn shift_imm(&mut self, d: &DecodedInstruction, modrm: u8) {
        if d.rd == 0 {
            return;
        }
        self.load_gpr(d.rt);
        self.buf.emit_u8(0xC1);
        self.buf.emit_u8(modrm);
        self.buf.emit_u8(d.shamt);
        self.store_gpr(d.rd);
    }

    /// Store the trapping instruction's own pc (the interpreter will
    /// re-execute it and vector), then call the bridge.
    fn emit_trap(&mut self, pc: u32, cause: u32) {
        self.store_state_imm(pc_offset(), pc);
        self.store_state_imm(next_pc_offset(), pc.wrapping_add(4));

        self.buf.emit_u8(0xBE); // mov esi, cause
        self.buf.emit_u32(cause);

        let bridge: extern "C" fn(*mut CpuState, u32) = jit_trap_bridge;
        self.buf.emit_u8(0x48); // mov rax, imm64
        self.buf.emit_u8(0xB8);
        self.buf.emit_u64(bridge as usize as u64);

        self.buf.emit_u8(0xFF); // call rax
        self.buf.emit_u8(0xD0);
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;

    fn decode(pc: u32, word: u32) -> DecodedInstruction {
        Decoder::new().decode(pc, word)
    }

    fn itype(opcode: u32, rs: u32, rt: u32, imm: u32) -> u32 {
        (opcode << 26) | (rs << 21) | (rt << 16) | (imm & 0xFFFF)
    }

    fn rtype(funct: u32, rs: u32, rt: u32, rd: u32, shamt: u32) -> u32 {
        (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | funct
    }

    #[test]
    fn test_prologue_and_return_sequence() {
        let code = Emitter::new().finish();
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(&code[code.len() - 2..], &[0x5D, 0xC3]);
    }

    #[test]
    fn test_unsupported_emits_nothing() {
        let mut emitter = Emitter::new();
        let before = emitter.len();

        // JR terminates blocks; it is never translated.
        assert!(!emitter.translate(&decode(0, rtype(0x08, 31, 0, 0, 0))));
        assert_eq!(emitter.len(), before);

        assert!(!emitter.translate(&decode(0, itype(0x23, 0, 1, 0)))); // lw
        assert_eq!(emitter.len(), before);
    }

    #[test]
    fn test_writes_to_zero_register_are_dropped() {
        let mut emitter = Emitter::new();
        let before = emitter.len();
        assert!(emitter.translate(&decode(0, itype(0x0F, 0, 0, 0x1234)))); // lui $0
        assert_eq!(emitter.len(), before);
    }

    #[test]
    fn test_supported_coverage() {
        let words = [
            itype(0x0F, 0, 1, 0x1234),  // lui
            itype(0x0D, 1, 1, 0x5678),  // ori
            itype(0x09, 1, 2, 0xFFFF),  // addiu
            rtype(0x21, 1, 2, 3, 0),    // addu
            rtype(0x27, 1, 2, 4, 0),    // nor
            rtype(0x00, 0, 3, 5, 4),    // sll
            0x0000_000C,                // syscall
        ];
        let mut emitter = Emitter::new();
        for (i, w) in words.iter().enumerate() {
            assert!(emitter.translate(&decode((i * 4) as u32, *w)), "{w:#x}");
        }
        assert!(!emitter.finish().is_empty());
    }

    // Executes emitted code; host-specific.
    #[cfg(all(unix, target_arch = "x86_64"))]
    mod native {
        use super::{decode, itype, rtype};
        use crate::cpu::{CAUSE_SYSCALL, CpuState};
        use crate::jit::arena::CodeArena;
        use crate::jit::block::BlockFn;
        use crate::jit::emitter::Emitter;

        fn run(code: &[u8], state: &mut CpuState) {
            let mut arena = CodeArena::new(4096).unwrap();
            let ptr = arena.commit(code).unwrap();
            // SAFETY: ptr holds a complete function emitted above.
            let f: BlockFn = unsafe { std::mem::transmute(ptr) };
            unsafe { f(state) };
        }

        #[test]
        fn test_immediate_load_matches_interpreter() {
            // lui $1, 0x1234 ; ori $1, $1, 0x5678
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0, itype(0x0F, 0, 1, 0x1234))));
            assert!(emitter.translate(&decode(4, itype(0x0D, 1, 1, 0x5678))));
            emitter.finish_fallthrough(8);

            let mut state = CpuState::new();
            run(&emitter.finish(), &mut state);

            assert_eq!(state.gpr(1).unwrap(), 0x1234_5678);
            assert_eq!(state.pc, 8);
            assert_eq!(state.next_pc, 12);
        }

        #[test]
        fn test_register_add_matches_interpreter() {
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0, rtype(0x21, 1, 2, 3, 0))));
            emitter.finish_fallthrough(4);

            let mut state = CpuState::new();
            state.set_gpr(1, 5).unwrap();
            state.set_gpr(2, 7).unwrap();
            run(&emitter.finish(), &mut state);

            assert_eq!(state.gpr(3).unwrap(), 12);
        }

        #[test]
        fn test_add_wraps() {
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0, rtype(0x20, 1, 2, 3, 0))));
            emitter.finish_fallthrough(4);

            let mut state = CpuState::new();
            state.set_gpr(1, 0xFFFF_FFFF).unwrap();
            state.set_gpr(2, 2).unwrap();
            run(&emitter.finish(), &mut state);

            assert_eq!(state.gpr(3).unwrap(), 1);
        }

        #[test]
        fn test_negative_addiu() {
            // addiu $2, $1, -4
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0, itype(0x09, 1, 2, 0xFFFC))));
            emitter.finish_fallthrough(4);

            let mut state = CpuState::new();
            state.set_gpr(1, 10).unwrap();
            run(&emitter.finish(), &mut state);

            assert_eq!(state.gpr(2).unwrap(), 6);
        }

        #[test]
        fn test_syscall_trap_raises_exit_flag() {
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0x40, 0x0000_000C)));

            let mut state = CpuState::new();
            run(&emitter.finish(), &mut state);

            assert!(state.jit_exit_request);
            assert_eq!(state.cp0_cause, CAUSE_SYSCALL);
            // pc parked on the syscall itself for the interpreter.
            assert_eq!(state.pc, 0x40);
            assert_eq!(state.next_pc, 0x44);
        }

        #[test]
        fn test_shift_and_bitwise() {
            // sll $3, $1, 4 ; nor $4, $1, $2
            let mut emitter = Emitter::new();
            assert!(emitter.translate(&decode(0, rtype(0x00, 0, 1, 3, 4))));
            assert!(emitter.translate(&decode(4, rtype(0x27, 1, 2, 4, 0))));
            emitter.finish_fallthrough(8);

            let mut state = CpuState::new();
            state.set_gpr(1, 0x0000_00F1).unwrap();
            state.set_gpr(2, 0x0F00_0000).unwrap();
            run(&emitter.finish(), &mut state);

            assert_eq!(state.gpr(3).unwrap(), 0x0000_0F10);
            assert_eq!(state.gpr(4).unwrap(), !(0x0000_00F1 | 0x0F00_0000));
        }
    }
}
