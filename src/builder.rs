//! Stateless factory for instruction sequences.
//!
//! Random builders draw every operand from an explicit seeded RNG so a run
//! is reproducible from (seed, configuration). Call-sequence builders take
//! offsets measured from the first instruction of the emitted sequence and
//! rebase them internally to the program counter of the instruction that
//! consumes them.

use std::collections::BTreeSet;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::constants::{CALLEE_SAVED_REG, CALL_TMP_REG, RA, SP};
use crate::errors::BuildError;
use crate::instr::Instr;
use crate::utils::{align, sign_extend};

type RInstrFn = fn(u32, u32, u32) -> Instr;
type IInstrFn = fn(u32, u32, i32) -> Instr;
type UInstrFn = fn(u32, u32) -> Instr;

const R_INSTRUCTIONS: [RInstrFn; 20] = [
    Instr::add,
    Instr::addw,
    Instr::and,
    Instr::mul,
    Instr::mulh,
    Instr::mulhsu,
    Instr::mulhu,
    Instr::mulw,
    Instr::or,
    Instr::sll,
    Instr::sllw,
    Instr::slt,
    Instr::sltu,
    Instr::sra,
    Instr::sraw,
    Instr::srl,
    Instr::srlw,
    Instr::sub,
    Instr::subw,
    Instr::xor,
];

const I_INSTRUCTIONS: [IInstrFn; 7] = [
    Instr::addi,
    Instr::addiw,
    Instr::andi,
    Instr::ori,
    Instr::slti,
    Instr::sltiu,
    Instr::xori,
];

/// Load pool, with the access width each entry must align to.
const L_INSTRUCTIONS: [(IInstrFn, u64); 5] = [
    (Instr::lb, 1),
    (Instr::lbu, 1),
    (Instr::ld, 8),
    (Instr::lh, 2),
    (Instr::lhu, 2),
];

const U_INSTRUCTIONS: [UInstrFn; 2] = [Instr::auipc, Instr::lui];

/// Store pool, with access widths.
const S_INSTRUCTIONS: [(IInstrFn, u64); 4] = [
    (Instr::sb, 1),
    (Instr::sd, 8),
    (Instr::sh, 2),
    (Instr::sw, 4),
];

const B_INSTRUCTIONS: [IInstrFn; 6] = [
    Instr::beq,
    Instr::bge,
    Instr::bgeu,
    Instr::blt,
    Instr::bltu,
    Instr::bne,
];

/// The seven instruction categories the weighted dispatcher chooses from,
/// in weight-vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstrCategory {
    R,
    I,
    U,
    J,
    B,
    S,
    L,
}

const CATEGORIES: [InstrCategory; 7] = [
    InstrCategory::R,
    InstrCategory::I,
    InstrCategory::U,
    InstrCategory::J,
    InstrCategory::B,
    InstrCategory::S,
    InstrCategory::L,
];

fn pick_reg(rng: &mut ChaCha8Rng, registers: &[u32]) -> u32 {
    registers[rng.gen_range(0..registers.len())]
}

pub fn build_nop() -> Instr {
    Instr::nop()
}

pub fn build_ret() -> Instr {
    Instr::ret()
}

/// Split a PC-relative offset into the (jalr, auipc) halves. The returned
/// low half is sign-extended; the high half compensates for the sign
/// extension jalr will apply, so `pc + high + sext(low) == pc + offset`.
pub fn split_offset(offset: i64) -> Result<(i32, u32), BuildError> {
    if offset.abs() < 8 || i32::try_from(offset).is_err() {
        return Err(BuildError::WrongOffset { offset });
    }
    let off = offset as u32;
    let low = off & 0xfff;
    let high = (off & 0xffff_f000).wrapping_add((off & 0x800) << 1);
    Ok((sign_extend(low, 12), high))
}

/// Candidate forward displacements for a random jump or branch sitting
/// `max_offset` bytes before the end of the body: the next instruction, the
/// end itself, and the ladder of 12-byte steps congruent to the end.
/// Displacements off this ladder could land inside a reserved call slot.
pub fn size_offset(max_offset: i64) -> Vec<i64> {
    let mut offsets = BTreeSet::new();
    offsets.insert(4);
    offsets.insert(max_offset);
    let rem = max_offset % 12;
    for k in 1..=max_offset / 12 {
        offsets.insert(k * 12 + rem);
    }
    if rem == 8 {
        offsets.insert(8);
    }
    offsets.into_iter().collect()
}

pub fn build_random_r_instruction(rng: &mut ChaCha8Rng, registers: &[u32]) -> Instr {
    let constr = R_INSTRUCTIONS[rng.gen_range(0..R_INSTRUCTIONS.len())];
    let rd = pick_reg(rng, registers);
    let rs1 = pick_reg(rng, registers);
    let rs2 = pick_reg(rng, registers);
    constr(rd, rs1, rs2)
}

pub fn build_random_i_instruction(rng: &mut ChaCha8Rng, registers: &[u32]) -> Instr {
    let constr = I_INSTRUCTIONS[rng.gen_range(0..I_INSTRUCTIONS.len())];
    let rd = pick_reg(rng, registers);
    let rs1 = pick_reg(rng, registers);
    let imm = rng.gen_range(-0x800..=0x7ff);
    constr(rd, rs1, imm)
}

pub fn build_random_u_instruction(rng: &mut ChaCha8Rng, registers: &[u32]) -> Instr {
    let constr = U_INSTRUCTIONS[rng.gen_range(0..U_INSTRUCTIONS.len())];
    let rd = pick_reg(rng, registers);
    constr(rd, rng.gen::<u32>())
}

/// Stores always use the data register as base with a non-negative offset
/// inside the data region, aligned to the access width.
pub fn build_random_s_instruction(
    rng: &mut ChaCha8Rng,
    registers: &[u32],
    data_reg: u32,
    data_size: u64,
) -> Instr {
    let (constr, alignment) = S_INSTRUCTIONS[rng.gen_range(0..S_INSTRUCTIONS.len())];
    let rs2 = pick_reg(rng, registers);
    let imm = align(rng.gen_range(0..=data_size.min(0x7ff)), alignment);
    constr(data_reg, rs2, imm as i32)
}

pub fn build_random_l_instruction(
    rng: &mut ChaCha8Rng,
    registers: &[u32],
    data_reg: u32,
    data_size: u64,
) -> Instr {
    let (constr, alignment) = L_INSTRUCTIONS[rng.gen_range(0..L_INSTRUCTIONS.len())];
    let rd = pick_reg(rng, registers);
    let imm = align(rng.gen_range(0..=data_size.min(0x7ff)), alignment);
    constr(rd, data_reg, imm as i32)
}

/// Jump forward within the method, keeping 4-byte alignment.
pub fn build_random_j_instruction(
    rng: &mut ChaCha8Rng,
    registers: &[u32],
    max_offset: i64,
) -> Instr {
    let rd = pick_reg(rng, registers);
    let offsets = size_offset(max_offset);
    let offset = offsets[rng.gen_range(0..offsets.len())];
    Instr::jal(rd, offset as i32)
}

pub fn build_random_b_instruction(
    rng: &mut ChaCha8Rng,
    registers: &[u32],
    max_offset: i64,
) -> Instr {
    let constr = B_INSTRUCTIONS[rng.gen_range(0..B_INSTRUCTIONS.len())];
    let rs1 = pick_reg(rng, registers);
    let rs2 = pick_reg(rng, registers);
    let offsets = size_offset(max_offset);
    let offset = offsets[rng.gen_range(0..offsets.len())];
    constr(rs1, rs2, offset as i32)
}

/// Weighted categorical draw over the seven per-format builders. Weights
/// are nonnegative; categories with weight 0 are never drawn. When the
/// remaining body is too small for a legal jump the B and J categories
/// decline and the draw falls on the others.
pub fn build_random_instruction(
    rng: &mut ChaCha8Rng,
    registers: &[u32],
    max_offset: i64,
    data_reg: u32,
    data_size: u64,
    weights: &[u32; 7],
) -> Result<Instr, BuildError> {
    let mut weights = *weights;
    if max_offset < 4 {
        weights[3] = 0;
        weights[4] = 0;
    }
    let dist = WeightedIndex::new(weights).map_err(|_| BuildError::EmptyWeights)?;
    let instr = match CATEGORIES[dist.sample(rng)] {
        InstrCategory::R => build_random_r_instruction(rng, registers),
        InstrCategory::I => build_random_i_instruction(rng, registers),
        InstrCategory::U => build_random_u_instruction(rng, registers),
        InstrCategory::J => build_random_j_instruction(rng, registers, max_offset),
        InstrCategory::B => build_random_b_instruction(rng, registers, max_offset),
        InstrCategory::S => build_random_s_instruction(rng, registers, data_reg, data_size),
        InstrCategory::L => build_random_l_instruction(rng, registers, data_reg, data_size),
    };
    Ok(instr)
}

/// Materialize a PC-relative address into a register:
/// `auipc reg, high; addi reg, reg, low`.
pub fn build_pc_relative_reg_save(offset: i64, register: u32) -> Result<Vec<Instr>, BuildError> {
    let (low, high) = split_offset(offset)?;
    Ok(vec![
        Instr::auipc(register, high),
        Instr::addi(register, register, low),
    ])
}

/// Direct call to a method: `auipc ra, high; jalr ra, ra, low`. Two raw
/// instructions; the accounting footprint of a base call site is 3 slots.
pub fn build_method_base_call(offset: i64) -> Result<Vec<Instr>, BuildError> {
    let (low, high) = split_offset(offset)?;
    Ok(vec![Instr::auipc(RA, high), Instr::jalr(RA, RA, low)])
}

/// Call routed through the call_jit_elt trampoline: the callee address is
/// materialized into the scratch register, then the trampoline is called so
/// it performs the transfer. Both offsets are relative to the first
/// instruction of the sequence; the trampoline pair sits two slots in.
pub fn build_method_trampoline_call(
    offset: i64,
    call_trampoline_offset: i64,
) -> Result<Vec<Instr>, BuildError> {
    let mut instructions = build_pc_relative_reg_save(offset, CALL_TMP_REG)?;
    let (low, high) = split_offset(call_trampoline_offset - 8)?;
    instructions.push(Instr::auipc(RA, high));
    instructions.push(Instr::jalr(RA, RA, low));
    Ok(instructions)
}

/// Call to a PIC: load the requested hit case, then a base call. The auipc
/// sits one slot into the sequence, so the element offset is rebased by -4.
pub fn build_pic_call(
    offset: i64,
    hit_case: u32,
    hit_case_reg: u32,
) -> Result<Vec<Instr>, BuildError> {
    let (low, high) = split_offset(offset - 4)?;
    Ok(vec![
        Instr::addi(hit_case_reg, 0, hit_case as i32),
        Instr::auipc(RA, high),
        Instr::jalr(RA, RA, low),
    ])
}

/// Trampoline-mode PIC call: hit case, address materialization, trampoline
/// call (5 raw instructions, accounting footprint 6).
pub fn build_pic_trampoline_call(
    offset: i64,
    call_trampoline_offset: i64,
    hit_case: u32,
    hit_case_reg: u32,
) -> Result<Vec<Instr>, BuildError> {
    let mut instructions = vec![Instr::addi(hit_case_reg, 0, hit_case as i32)];
    instructions.extend(build_pc_relative_reg_save(offset - 4, CALL_TMP_REG)?);
    let (low, high) = split_offset(call_trampoline_offset - 12)?;
    instructions.push(Instr::auipc(RA, high));
    instructions.push(Instr::jalr(RA, RA, low));
    Ok(instructions)
}

/// One PIC switch case:
///   1 - load the case number into the compare register
///   2 - compare with the hit case, skipping the jump on mismatch
///   3 - jump to the corresponding method
/// bne rather than beq carries the branch, so the method displacement rides
/// the jal and gets the full ±1 MiB range instead of ±4 KiB.
pub fn build_switch_case(
    case_number: u32,
    method_offset: i64,
    hit_case_reg: u32,
    cmp_reg: u32,
) -> [Instr; 3] {
    [
        Instr::addi(cmp_reg, 0, case_number as i32),
        Instr::bne(cmp_reg, hit_case_reg, 8),
        Instr::jal(0, method_offset as i32),
    ]
}

/// Standard frame setup: bump sp, store the saved-register window, store ra
/// if the body performs calls.
pub fn build_prologue(used_s_regs: usize, local_var_nb: usize, contains_call: bool) -> Vec<Instr> {
    let stack_space = (used_s_regs + local_var_nb + usize::from(contains_call)) * 8;
    let mut instructions = vec![Instr::addi(SP, SP, -(stack_space as i32))];
    for (i, reg) in CALLEE_SAVED_REG.iter().take(used_s_regs).enumerate() {
        instructions.push(Instr::sd(SP, *reg, (i * 8) as i32));
    }
    if contains_call {
        instructions.push(Instr::sd(SP, RA, (used_s_regs * 8) as i32));
    }
    instructions
}

/// Exact mirror of the prologue, ending with ret.
pub fn build_epilogue(used_s_regs: usize, local_var_nb: usize, contains_call: bool) -> Vec<Instr> {
    let stack_space = (used_s_regs + local_var_nb + usize::from(contains_call)) * 8;
    let mut instructions = Vec::new();
    for (i, reg) in CALLEE_SAVED_REG.iter().take(used_s_regs).enumerate() {
        instructions.push(Instr::ld(*reg, SP, (i * 8) as i32));
    }
    if contains_call {
        instructions.push(Instr::ld(RA, SP, (used_s_regs * 8) as i32));
    }
    instructions.push(Instr::addi(SP, SP, stack_space as i32));
    instructions.push(Instr::ret());
    instructions
}

/// Trampoline-mode epilogue: the frame teardown is unchanged but the return
/// goes through the ret_from_jit_elt trampoline. `ret_trampoline_offset` is
/// relative to the final jump instruction itself.
pub fn build_trampoline_epilogue(
    used_s_regs: usize,
    local_var_nb: usize,
    contains_call: bool,
    ret_trampoline_offset: i64,
) -> Vec<Instr> {
    let mut instructions = build_epilogue(used_s_regs, local_var_nb, contains_call);
    instructions.pop();
    instructions.push(Instr::jal(0, ret_trampoline_offset as i32));
    instructions
}

/// Isolation-dependent code fragments. The base implementation performs the
/// bare control transfers; overlays wrap them with shadow-stack and
/// domain-switch operations.
pub trait IsolationBuilder {
    /// Body of the call_jit_elt trampoline. The return address is set by
    /// the caller; the callee address waits in CALL_TMP_REG.
    fn build_call_jit_elt_trampoline(&self) -> Vec<Instr> {
        vec![Instr::jr(CALL_TMP_REG)]
    }

    /// Body of the ret_from_jit_elt trampoline.
    fn build_ret_from_jit_elt_trampoline(&self) -> Vec<Instr> {
        vec![Instr::ret()]
    }
}

/// Builder used outside RIMI modes.
pub struct BaseBuilder;

impl IsolationBuilder for BaseBuilder {}
