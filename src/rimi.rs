//! Isolation overlays for the RIMI ISA extension: shadow-stack bookkeeping
//! around JIT calls and returns, and domain switches on the full variant.
//!
//! Both overlays are drop-in `IsolationBuilder`s; only the trampoline bodies
//! change, so the rest of the pipeline is untouched.

use crate::builder::IsolationBuilder;
use crate::constants::{CALL_TMP_REG, RA};
use crate::instr::Instr;
use crate::opcodes::OP_CUSTOM_0;

/// Shadow-stack pointer (t3).
pub const RIMI_SSP_REG: u32 = 28;
/// Default shadow-stack binary size in bytes.
pub const SHADOW_STACK_SIZE: u64 = 0x100;

/// Switch execution into the JIT domain.
fn domain_enter() -> Instr {
    Instr::itype(OP_CUSTOM_0, 0b000, 0, 0, 0)
}

/// Switch execution back to the calling domain.
fn domain_return() -> Instr {
    Instr::itype(OP_CUSTOM_0, 0b001, 0, 0, 0)
}

/// Push ra onto the shadow stack and bump the pointer.
fn shadow_stack_push(ssp_reg: u32) -> Vec<Instr> {
    vec![
        Instr::sd(ssp_reg, RA, 0),
        Instr::addi(ssp_reg, ssp_reg, 8),
    ]
}

/// Pop the saved return address and trap if it no longer matches ra.
fn shadow_stack_pop_check(ssp_reg: u32) -> Vec<Instr> {
    vec![
        Instr::addi(ssp_reg, ssp_reg, -8),
        Instr::ld(CALL_TMP_REG, ssp_reg, 0),
        Instr::beq(CALL_TMP_REG, RA, 8),
        Instr::ebreak(),
    ]
}

/// Overlay adding shadow-stack protection to the call/return trampolines.
pub struct ShadowStackBuilder {
    pub ssp_reg: u32,
}

impl IsolationBuilder for ShadowStackBuilder {
    fn build_call_jit_elt_trampoline(&self) -> Vec<Instr> {
        let mut instructions = shadow_stack_push(self.ssp_reg);
        instructions.push(Instr::jr(CALL_TMP_REG));
        instructions
    }

    fn build_ret_from_jit_elt_trampoline(&self) -> Vec<Instr> {
        let mut instructions = shadow_stack_pop_check(self.ssp_reg);
        instructions.push(Instr::ret());
        instructions
    }
}

/// Shadow stack plus domain switches around every transfer into and out of
/// the JIT region.
pub struct FullBuilder {
    pub ssp_reg: u32,
}

impl IsolationBuilder for FullBuilder {
    fn build_call_jit_elt_trampoline(&self) -> Vec<Instr> {
        let mut instructions = shadow_stack_push(self.ssp_reg);
        instructions.push(domain_enter());
        instructions.push(Instr::jr(CALL_TMP_REG));
        instructions
    }

    fn build_ret_from_jit_elt_trampoline(&self) -> Vec<Instr> {
        let mut instructions = shadow_stack_pop_check(self.ssp_reg);
        instructions.push(domain_return());
        instructions.push(Instr::ret());
        instructions
    }
}
