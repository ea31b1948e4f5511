//! Reference interpreter.
//!
//! One instruction per `step`: fetch the word at `pc`, decode, dispatch by
//! opcode family and apply the effects to [`CpuState`]/[`Memory`]. This is
//! the always-correct slow path; the JIT must agree with it instruction
//! for instruction.
//!
//! Branches use real delay-slot semantics: a taken branch rewrites
//! `next_pc`, so the following instruction executes before control
//! transfers, and link registers store the address *after* the delay slot.
//!
//! Unknown opcodes are reported and treated as no-ops so that emulation of
//! a partially-understood program keeps going.

use super::{
    CAUSE_BREAK, CAUSE_SYSCALL, CpuError, CpuState, STATUS_EXL, TRAP_VECTOR, reg,
};
use crate::decoder::{DecodedInstruction, Decoder, Op};
use crate::memory::Memory;

/// What a single step produced, beyond the state mutation itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepOutcome {
    /// Trap taken during this step, if any. Syscall dispatch happens in
    /// the execution loop, not here.
    pub event: Option<TrapEvent>,
    /// Address written by a store, so compiled blocks covering it can be
    /// invalidated.
    pub store: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapEvent {
    Syscall { id: u32 },
    Break,
}

pub struct Interpreter {
    decoder: Decoder,
}

impl Interpreter {
    pub fn new(decoder: Decoder) -> Self {
        Self { decoder }
    }

    /// Execute exactly one instruction.
    pub fn step(&self, state: &mut CpuState, memory: &mut Memory) -> Result<StepOutcome, CpuError> {
        let word = memory.read32(state.pc)?;
        let d = self.decoder.decode(state.pc, word);

        // Advance before dispatch: a pending branch target in next_pc
        // becomes the new pc, and branches below rewrite next_pc.
        state.pc = state.next_pc;
        state.next_pc = state.next_pc.wrapping_add(4);

        match d.opcode {
            0x00 => self.exec_special(&d, state),
            0x01 => self.exec_regimm(&d, state),
            0x02 | 0x03 => self.exec_jump(&d, state),
            0x10 => self.exec_cop0(&d, state),
            _ => self.exec_itype(&d, state, memory),
        }
    }

    fn exec_special(
        &self,
        d: &DecodedInstruction,
        state: &mut CpuState,
    ) -> Result<StepOutcome, CpuError> {
        let rs = state.gpr[d.rs as usize];
        let rt = state.gpr[d.rt as usize];

        match d.op {
            Op::Sll => state.set_gpr(d.rd as usize, rt << d.shamt)?,
            Op::Srl => state.set_gpr(d.rd as usize, rt >> d.shamt)?,
            Op::Sra => state.set_gpr(d.rd as usize, ((rt as i32) >> d.shamt) as u32)?,
            Op::Sllv => state.set_gpr(d.rd as usize, rt << (rs & 0x1F))?,
            Op::Srlv => state.set_gpr(d.rd as usize, rt >> (rs & 0x1F))?,
            Op::Srav => state.set_gpr(d.rd as usize, ((rt as i32) >> (rs & 0x1F)) as u32)?,
            Op::Jr => state.next_pc = rs,
            Op::Jalr => {
                state.set_gpr(d.rd as usize, d.pc.wrapping_add(8))?;
                state.next_pc = rs;
            }
            Op::Syscall => {
                raise_trap(state, CAUSE_SYSCALL, d.pc);
                return Ok(StepOutcome {
                    event: Some(TrapEvent::Syscall {
                        id: state.gpr[reg::V0],
                    }),
                    store: None,
                });
            }
            Op::Break => {
                raise_trap(state, CAUSE_BREAK, d.pc);
                return Ok(StepOutcome {
                    event: Some(TrapEvent::Break),
                    store: None,
                });
            }
            Op::Mfhi => state.set_gpr(d.rd as usize, state.hi)?,
            Op::Mthi => state.hi = rs,
            Op::Mflo => state.set_gpr(d.rd as usize, state.lo)?,
            Op::Mtlo => state.lo = rs,
            Op::Mult => {
                let product = (rs as i32 as i64) * (rt as i32 as i64);
                state.hi = (product >> 32) as u32;
                state.lo = product as u32;
            }
            Op::Multu => {
                let product = (rs as u64) * (rt as u64);
                state.hi = (product >> 32) as u32;
                state.lo = product as u32;
            }
            Op::Div => {
                let a = rs as i32;
                let b = rt as i32;
                if b == 0 {
                    // Divide-by-zero convention: sentinel results, no fault.
                    state.hi = 0;
                    state.lo = if a >= 0 { 0xFFFF_FFFF } else { 1 };
                } else if a == i32::MIN && b == -1 {
                    state.lo = a as u32;
                    state.hi = 0;
                } else {
                    state.lo = (a / b) as u32;
                    state.hi = (a % b) as u32;
                }
            }
            Op::Divu => {
                if rt == 0 {
                    state.hi = 0;
                    state.lo = 0xFFFF_FFFF;
                } else {
                    state.lo = rs / rt;
                    state.hi = rs % rt;
                }
            }
            // 32-bit wraparound; no overflow trap on this core.
            Op::Add | Op::Addu => state.set_gpr(d.rd as usize, rs.wrapping_add(rt))?,
            Op::Sub | Op::Subu => state.set_gpr(d.rd as usize, rs.wrapping_sub(rt))?,
            Op::And => state.set_gpr(d.rd as usize, rs & rt)?,
            Op::Or => state.set_gpr(d.rd as usize, rs | rt)?,
            Op::Xor => state.set_gpr(d.rd as usize, rs ^ rt)?,
            Op::Nor => state.set_gpr(d.rd as usize, !(rs | rt))?,
            Op::Slt => state.set_gpr(d.rd as usize, ((rs as i32) < (rt as i32)) as u32)?,
            Op::Sltu => state.set_gpr(d.rd as usize, (rs < rt) as u32)?,
            _ => report_gap(d),
        }

        Ok(StepOutcome::default())
    }

    fn exec_regimm(
        &self,
        d: &DecodedInstruction,
        state: &mut CpuState,
    ) -> Result<StepOutcome, CpuError> {
        let value = state.gpr[d.rs as usize] as i32;

        match d.op {
            Op::Bltz => {
                if value < 0 {
                    state.next_pc = d.branch_target;
                }
            }
            Op::Bgez => {
                if value >= 0 {
                    state.next_pc = d.branch_target;
                }
            }
            // The link register is written whether or not the branch is
            // taken.
            Op::Bltzal => {
                state.set_gpr(reg::RA, d.pc.wrapping_add(8))?;
                if value < 0 {
                    state.next_pc = d.branch_target;
                }
            }
            Op::Bgezal => {
                state.set_gpr(reg::RA, d.pc.wrapping_add(8))?;
                if value >= 0 {
                    state.next_pc = d.branch_target;
                }
            }
            _ => report_gap(d),
        }

        Ok(StepOutcome::default())
    }

    fn exec_jump(
        &self,
        d: &DecodedInstruction,
        state: &mut CpuState,
    ) -> Result<StepOutcome, CpuError> {
        match d.op {
            Op::J => state.next_pc = d.jump_target,
            Op::Jal => {
                state.set_gpr(reg::RA, d.pc.wrapping_add(8))?;
                state.next_pc = d.jump_target;
            }
            _ => report_gap(d),
        }

        Ok(StepOutcome::default())
    }

    fn exec_cop0(
        &self,
        d: &DecodedInstruction,
        state: &mut CpuState,
    ) -> Result<StepOutcome, CpuError> {
        match d.op {
            Op::Mfc0 => {
                let value = match d.rd {
                    12 => state.cp0_status,
                    13 => state.cp0_cause,
                    14 => state.cp0_epc,
                    _ => {
                        log::warn!("mfc0 from unimplemented CP0 register {}", d.rd);
                        0
                    }
                };
                state.set_gpr(d.rt as usize, value)?;
            }
            Op::Mtc0 => {
                let value = state.gpr[d.rt as usize];
                match d.rd {
                    12 => state.cp0_status = value,
                    13 => state.cp0_cause = value,
                    14 => state.cp0_epc = value,
                    _ => log::warn!("mtc0 to unimplemented CP0 register {}", d.rd),
                }
            }
            _ => report_gap(d),
        }

        Ok(StepOutcome::default())
    }

    fn exec_itype(
        &self,
        d: &DecodedInstruction,
        state: &mut CpuState,
        memory: &mut Memory,
    ) -> Result<StepOutcome, CpuError> {
        let rs = state.gpr[d.rs as usize];
        let rt = state.gpr[d.rt as usize];
        let addr = rs.wrapping_add(d.simm() as u32);
        let mut outcome = StepOutcome::default();

        match d.op {
            Op::Beq => {
                if rs == rt {
                    state.next_pc = d.branch_target;
                }
            }
            Op::Bne => {
                if rs != rt {
                    state.next_pc = d.branch_target;
                }
            }
            Op::Blez => {
                if (rs as i32) <= 0 {
                    state.next_pc = d.branch_target;
                }
            }
            Op::Bgtz => {
                if (rs as i32) > 0 {
                    state.next_pc = d.branch_target;
                }
            }
            // Arithmetic immediates are signed, bitwise immediates
            // unsigned.
            Op::Addi | Op::Addiu => {
                state.set_gpr(d.rt as usize, rs.wrapping_add(d.simm() as u32))?
            }
            Op::Slti => state.set_gpr(d.rt as usize, ((rs as i32) < d.simm()) as u32)?,
            Op::Sltiu => state.set_gpr(d.rt as usize, (rs < d.simm() as u32) as u32)?,
            Op::Andi => state.set_gpr(d.rt as usize, rs & d.uimm())?,
            Op::Ori => state.set_gpr(d.rt as usize, rs | d.uimm())?,
            Op::Xori => state.set_gpr(d.rt as usize, rs ^ d.uimm())?,
            Op::Lui => state.set_gpr(d.rt as usize, d.uimm() << 16)?,
            Op::Lb => {
                let value = memory.read8(addr)? as i8 as i32 as u32;
                state.set_gpr(d.rt as usize, value)?;
            }
            Op::Lbu => state.set_gpr(d.rt as usize, memory.read8(addr)? as u32)?,
            Op::Lh => {
                let value = memory.read16(addr)? as i16 as i32 as u32;
                state.set_gpr(d.rt as usize, value)?;
            }
            Op::Lhu => state.set_gpr(d.rt as usize, memory.read16(addr)? as u32)?,
            Op::Lw => state.set_gpr(d.rt as usize, memory.read32(addr)?)?,
            Op::Sb => {
                memory.write8(addr, rt as u8)?;
                outcome.store = Some(addr);
            }
            Op::Sh => {
                memory.write16(addr, rt as u16)?;
                outcome.store = Some(addr);
            }
            Op::Sw => {
                memory.write32(addr, rt)?;
                outcome.store = Some(addr);
            }
            _ => report_gap(d),
        }

        Ok(outcome)
    }
}

/// SYSCALL/BREAK/exception entry: record cause and the faulting pc, set
/// the exception level and vector to the trap handler address.
fn raise_trap(state: &mut CpuState, cause: u32, epc: u32) {
    state.cp0_cause = cause;
    state.cp0_epc = epc;
    state.cp0_status |= STATUS_EXL;
    state.set_pc(TRAP_VECTOR);
}

fn report_gap(d: &DecodedInstruction) {
    log::warn!(
        "unimplemented instruction {:#010x} (opcode {:#04x}, funct {:#04x}) at {:#010x}; treated as nop",
        d.word,
        d.opcode,
        d.funct,
        d.pc
    );
}
