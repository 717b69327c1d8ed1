//! Polymorphic inline caches: a switch prelude dispatching on a hit-case
//! register, followed by one method per case laid out contiguously.

use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::builder;
use crate::constants::{MAX_EPILOGUE_SIZE, MAX_PROLOGUE_SIZE};
use crate::errors::{EncodingError, MethodError};
use crate::instr::{consolidate_bytes, Instr};
use crate::method::{Method, MethodSizing};

/// Instruction slots per switch case (load case, compare, jump).
pub const CASE_SIZE: usize = 3;

/// Smallest possible method footprint: maximal frame plus a one-instruction
/// body. Used to reserve room for the remaining cases while the earlier
/// ones are sized.
pub const MIN_METHOD_SIZE: usize = MAX_PROLOGUE_SIZE + MAX_EPILOGUE_SIZE + 1;

#[derive(Debug, Clone)]
pub struct Pic {
    address: u64,
    case_number: usize,
    methods: Vec<Method>,
    hit_case_reg: u32,
    cmp_reg: u32,
    switch_instructions: Vec<Instr>,
}

impl Pic {
    /// Synthesize `case_number` inner methods with independently sampled
    /// profiles. Their addresses are fixed immediately: the first method
    /// starts right after the switch prelude. `limit` is the end of the
    /// JIT region; oversized draws are clamped so the PIC never crosses it
    /// (the caller reserves at least `CASE_SIZE + MIN_METHOD_SIZE` slots
    /// per case).
    pub fn new(
        rng: &mut ChaCha8Rng,
        next_id: &mut usize,
        address: u64,
        case_number: usize,
        sizing: &MethodSizing,
        hit_case_reg: u32,
        cmp_reg: u32,
        limit: u64,
    ) -> Result<Self, MethodError> {
        let mut methods = Vec::with_capacity(case_number);
        let mut cursor = address + (CASE_SIZE * case_number * 4) as u64;
        for case in 0..case_number {
            let reserved = (case_number - case - 1) * MIN_METHOD_SIZE;
            let max_slots =
                (((limit.saturating_sub(cursor)) / 4) as usize).saturating_sub(reserved);
            let spec = sizing
                .sample_spec(rng)
                .clamped_to(max_slots, sizing.call_size)
                .ok_or(MethodError::EmptySection)?;
            let method = Method::new(*next_id, cursor, spec, sizing.call_size)?;
            *next_id += 1;
            cursor += (method.total_size() * 4) as u64;
            debug!(
                address = method.address(),
                body_size = method.body_size(),
                call_number = method.call_number(),
                call_depth = method.call_depth(),
                "pic case method added"
            );
            methods.push(method);
        }
        Ok(Self {
            address,
            case_number,
            methods,
            hit_case_reg,
            cmp_reg,
            switch_instructions: Vec::new(),
        })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn case_number(&self) -> usize {
        self.case_number
    }

    pub fn hit_case_reg(&self) -> u32 {
        self.hit_case_reg
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut [Method] {
        &mut self.methods
    }

    pub fn switch_instructions(&self) -> &[Instr] {
        &self.switch_instructions
    }

    pub fn method_nb(&self) -> usize {
        self.case_number
    }

    pub fn total_size(&self) -> usize {
        CASE_SIZE * self.case_number
            + self
                .methods
                .iter()
                .map(|method| method.total_size())
                .sum::<usize>()
    }

    fn build_switch(&mut self) {
        self.switch_instructions.clear();
        for (case, method) in self.methods.iter().enumerate() {
            // the jal is the third instruction of the triple
            let jump_address = self.address + ((CASE_SIZE * case + 2) * 4) as u64;
            let method_offset = method.address() as i64 - jump_address as i64;
            self.switch_instructions.extend(builder::build_switch_case(
                (case + 1) as u32,
                method_offset,
                self.hit_case_reg,
                self.cmp_reg,
            ));
        }
    }

    pub fn fill_with_instructions(
        &mut self,
        rng: &mut ChaCha8Rng,
        registers: &[u32],
        data_reg: u32,
        data_size: u64,
        weights: &[u32; 7],
    ) -> Result<(), MethodError> {
        self.build_switch();
        for method in &mut self.methods {
            method.fill_with_instructions(rng, registers, data_reg, data_size, weights)?;
        }
        Ok(())
    }

    /// `ret_trampoline_offset` is relative to the PIC start; each inner
    /// method gets it rebased to its own start.
    pub fn fill_with_trampoline_instructions(
        &mut self,
        rng: &mut ChaCha8Rng,
        registers: &[u32],
        data_reg: u32,
        data_size: u64,
        weights: &[u32; 7],
        ret_trampoline_offset: i64,
    ) -> Result<(), MethodError> {
        self.build_switch();
        let address = self.address;
        for method in &mut self.methods {
            let rebased = ret_trampoline_offset - (method.address() - address) as i64;
            method.fill_with_trampoline_instructions(
                rng, registers, data_reg, data_size, weights, rebased,
            )?;
        }
        Ok(())
    }

    pub fn bytes(&self) -> Result<Vec<u8>, EncodingError> {
        let mut bytes = consolidate_bytes(&self.switch_instructions)?;
        for method in &self.methods {
            bytes.extend(method.bytes()?);
        }
        Ok(bytes)
    }
}
