//! Register conventions and default generation parameters.
//!
//! Register indices are byte-level constants: x0 = zero, x1 = ra, x2 = sp,
//! x5/x6/x7 = the PIC hit-case, call-scratch and compare registers,
//! x8..x9 and x18..x27 = the callee-saved window, x31 = the data-region
//! base.

pub const RA: u32 = 1;
pub const SP: u32 = 2;

/// Register loaded with the requested case before a PIC call (t0).
pub const HIT_CASE_REG: u32 = 5;
/// Scratch register holding the callee address across a trampoline call (t1).
pub const CALL_TMP_REG: u32 = 6;
/// Register a PIC switch case compares against the hit case (t2).
pub const CMP_REG: u32 = 7;
/// Base register of every generated load and store (t6).
pub const DATA_REG: u32 = 31;

/// s0..s11.
pub const CALLEE_SAVED_REG: [u32; 12] = [8, 9, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27];

/// Default pool random bodies draw their operands from. ra, sp and the
/// unsaved s10/s11 are never here, so a body cannot corrupt the return path.
/// The generator removes the data register (and the shadow-stack pointer in
/// RIMI modes) before use.
pub const CALLER_SAVED_REG: [u32; 15] = [5, 6, 7, 10, 11, 12, 13, 14, 15, 16, 17, 28, 29, 30, 31];

/// Default weights of the categorical draw over instruction builders, in
/// R, I, U, J, B, S, L order.
pub const INSTRUCTION_WEIGHTS: [u32; 7] = [35, 30, 10, 5, 5, 10, 5];

/// Maximal prologue footprint in instruction slots: stack bump, ten saved
/// registers, ra store.
pub const MAX_PROLOGUE_SIZE: usize = 12;
/// Maximal epilogue footprint: ten reloads, ra reload, stack restore, ret.
pub const MAX_EPILOGUE_SIZE: usize = 13;

/// Saved-register window generated methods and the interpretation loop use.
pub const USED_S_REGS: usize = 10;

/// Call-site footprint in instruction slots, without and with trampolines.
pub const BASE_CALL_SIZE: usize = 3;
pub const TRAMPOLINE_CALL_SIZE: usize = 6;
