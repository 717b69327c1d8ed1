//! A generated JIT method: a prologue, a randomized body with reserved
//! call slots, and an epilogue.
//!
//! Lifecycle: constructed with a sampled sizing spec, filled exactly once,
//! patched exactly once (if it performs calls), then frozen until byte
//! emission.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::builder;
use crate::constants::{MAX_EPILOGUE_SIZE, MAX_PROLOGUE_SIZE, USED_S_REGS};
use crate::errors::{EncodingError, MethodError};
use crate::instr::{consolidate_bytes, Instr};
use crate::utils::{sample_poisson, sample_trunc_norm};

/// Non-owning descriptor of a call target, enough to patch a call site and
/// check the depth invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalleeHandle {
    pub id: usize,
    pub address: u64,
    pub call_depth: u64,
}

/// Sampled size and call profile of one method.
#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub body_size: usize,
    pub call_number: usize,
    pub call_depth: u64,
}

impl MethodSpec {
    /// Shrink the spec so prologue + body + epilogue fit in `max_slots`
    /// instruction slots, dropping call slots that no longer fit. Returns
    /// None when even a one-instruction body cannot fit.
    pub fn clamped_to(self, max_slots: usize, call_size: usize) -> Option<MethodSpec> {
        let budget = max_slots.checked_sub(MAX_PROLOGUE_SIZE + MAX_EPILOGUE_SIZE)?;
        if budget == 0 {
            return None;
        }
        if self.body_size <= budget {
            return Some(self);
        }
        let body_size = budget;
        let call_number = self.call_number.min(body_size / call_size);
        let call_depth = if call_number > 0 { self.call_depth.max(1) } else { 0 };
        Some(MethodSpec {
            body_size,
            call_number,
            call_depth,
        })
    }
}

/// The distributions method specs are drawn from, shared between the
/// generator and the PICs it creates.
#[derive(Debug, Clone, Copy)]
pub struct MethodSizing {
    /// Mean body size in instructions.
    pub mean_body_size: usize,
    pub variation_mean: f64,
    pub variation_stdev: f64,
    pub call_occupation_mean: f64,
    pub call_occupation_stdev: f64,
    pub call_depth_mean: u64,
    pub call_size: usize,
}

impl MethodSizing {
    fn sample_body_size(&self, rng: &mut ChaCha8Rng) -> usize {
        let variation = sample_trunc_norm(rng, self.variation_mean, self.variation_stdev, 0.0, 1.0);
        let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        (self.mean_body_size as f64 * (1.0 + sign * variation)).ceil() as usize
    }

    /// Sample a full profile: body size, call count derived from the call
    /// occupation, call depth from a Poisson draw. A method that calls is
    /// always at depth 1 or more.
    pub fn sample_spec(&self, rng: &mut ChaCha8Rng) -> MethodSpec {
        let body_size = self.sample_body_size(rng);
        let occupation = sample_trunc_norm(
            rng,
            self.call_occupation_mean,
            self.call_occupation_stdev,
            0.0,
            1.0,
        );
        let max_call_nb = body_size / self.call_size;
        let call_number = (occupation * max_call_nb as f64).trunc() as usize;
        let call_depth = if call_number > 0 {
            sample_poisson(rng, self.call_depth_mean).max(1)
        } else {
            0
        };
        MethodSpec {
            body_size,
            call_number,
            call_depth,
        }
    }

    pub fn sample_leaf_spec(&self, rng: &mut ChaCha8Rng) -> MethodSpec {
        MethodSpec {
            body_size: self.sample_body_size(rng),
            call_number: 0,
            call_depth: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Method {
    id: usize,
    address: u64,
    body_size: usize,
    call_number: usize,
    call_depth: u64,
    call_size: usize,
    used_s_regs: usize,
    local_var_nb: usize,
    contains_call: bool,
    instructions: Vec<Instr>,
    /// Absolute instruction indices of the reserved call slots, in order.
    call_site_indices: Vec<usize>,
    callees: Vec<CalleeHandle>,
}

impl Method {
    pub fn new(id: usize, address: u64, spec: MethodSpec, call_size: usize) -> Result<Self, MethodError> {
        if spec.body_size == 0 {
            return Err(MethodError::EmptySection);
        }
        if spec.call_number * call_size > spec.body_size {
            return Err(MethodError::CallNumber {
                expected: spec.body_size / call_size,
                provided: spec.call_number,
            });
        }
        Ok(Self {
            id,
            address,
            body_size: spec.body_size,
            call_number: spec.call_number,
            call_depth: spec.call_depth,
            call_size,
            used_s_regs: USED_S_REGS,
            local_var_nb: 0,
            contains_call: spec.call_number > 0,
            instructions: Vec::new(),
            call_site_indices: Vec::new(),
            callees: Vec::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn body_size(&self) -> usize {
        self.body_size
    }

    pub fn call_number(&self) -> usize {
        self.call_number
    }

    pub fn call_depth(&self) -> u64 {
        self.call_depth
    }

    pub fn call_size(&self) -> usize {
        self.call_size
    }

    pub fn contains_call(&self) -> bool {
        self.contains_call
    }

    pub fn callees(&self) -> &[CalleeHandle] {
        &self.callees
    }

    pub fn call_site_indices(&self) -> &[usize] {
        &self.call_site_indices
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instructions
    }

    /// The randomized body, without prologue and epilogue.
    pub fn body_instructions(&self) -> &[Instr] {
        let start = self.prologue_size();
        &self.instructions[start..start + self.body_size]
    }

    pub fn handle(&self) -> CalleeHandle {
        CalleeHandle {
            id: self.id,
            address: self.address,
            call_depth: self.call_depth,
        }
    }

    pub fn prologue_size(&self) -> usize {
        1 + self.used_s_regs + usize::from(self.contains_call)
    }

    pub fn epilogue_size(&self) -> usize {
        self.used_s_regs + usize::from(self.contains_call) + 2
    }

    /// Total footprint in instruction slots; known before filling, so the
    /// generator can advance its address cursor up front.
    pub fn total_size(&self) -> usize {
        self.prologue_size() + self.body_size + self.epilogue_size()
    }

    pub fn method_nb(&self) -> usize {
        1
    }

    /// Fraction of the body occupied by reserved call slots.
    pub fn call_occupation(&self) -> f64 {
        (self.call_number * self.call_size) as f64 / self.body_size as f64
    }

    /// Reserve the call slots, fill the rest of the body with random
    /// instructions whose jumps cannot escape, and wrap in
    /// prologue/epilogue.
    pub fn fill_with_instructions(
        &mut self,
        rng: &mut ChaCha8Rng,
        registers: &[u32],
        data_reg: u32,
        data_size: u64,
        weights: &[u32; 7],
    ) -> Result<(), MethodError> {
        let epilogue =
            builder::build_epilogue(self.used_s_regs, self.local_var_nb, self.contains_call);
        self.fill(rng, registers, data_reg, data_size, weights, epilogue)
    }

    /// Same as `fill_with_instructions`, but the epilogue returns through
    /// the ret_from_jit_elt trampoline. `ret_trampoline_offset` is relative
    /// to the method start.
    pub fn fill_with_trampoline_instructions(
        &mut self,
        rng: &mut ChaCha8Rng,
        registers: &[u32],
        data_reg: u32,
        data_size: u64,
        weights: &[u32; 7],
        ret_trampoline_offset: i64,
    ) -> Result<(), MethodError> {
        let jump_slot = (self.total_size() - 1) as i64;
        let epilogue = builder::build_trampoline_epilogue(
            self.used_s_regs,
            self.local_var_nb,
            self.contains_call,
            ret_trampoline_offset - jump_slot * 4,
        );
        self.fill(rng, registers, data_reg, data_size, weights, epilogue)
    }

    fn fill(
        &mut self,
        rng: &mut ChaCha8Rng,
        registers: &[u32],
        data_reg: u32,
        data_size: u64,
        weights: &[u32; 7],
        epilogue: Vec<Instr>,
    ) -> Result<(), MethodError> {
        let prologue =
            builder::build_prologue(self.used_s_regs, self.local_var_nb, self.contains_call);
        let prologue_len = prologue.len();
        self.instructions = prologue;
        self.call_site_indices.clear();

        // Call slots are drawn without replacement from the call-size
        // aligned chunks of the body, so they cannot overlap each other or
        // the surrounding frame code.
        let chunk_count = if self.call_number > 0 {
            self.body_size / self.call_size
        } else {
            0
        };
        let chunks: Vec<usize> = (0..chunk_count).collect();
        let mut slot_starts: Vec<usize> = chunks
            .choose_multiple(rng, self.call_number)
            .map(|chunk| chunk * self.call_size)
            .collect();
        slot_starts.sort_unstable();

        let mut next_slot = slot_starts.iter().peekable();
        let mut position = 0;
        while position < self.body_size {
            if next_slot.peek() == Some(&&position) {
                self.call_site_indices.push(prologue_len + position);
                for _ in 0..self.call_size {
                    self.instructions.push(builder::build_nop());
                }
                position += self.call_size;
                next_slot.next();
            } else {
                let max_offset = ((self.body_size - position) * 4) as i64;
                self.instructions.push(builder::build_random_instruction(
                    rng, registers, max_offset, data_reg, data_size, weights,
                )?);
                position += 1;
            }
        }
        self.instructions.extend(epilogue);
        debug_assert_eq!(self.instructions.len(), self.total_size());
        Ok(())
    }

    fn check_callees(&self, callees: &[CalleeHandle]) -> Result<(), MethodError> {
        if callees.len() != self.call_number {
            return Err(MethodError::CallNumber {
                expected: self.call_number,
                provided: callees.len(),
            });
        }
        for callee in callees {
            if callee.id == self.id {
                return Err(MethodError::RecursiveCall {
                    address: self.address,
                });
            }
            if callee.call_depth >= self.call_depth {
                return Err(MethodError::MutualCall {
                    caller_depth: self.call_depth,
                    callee_depth: callee.call_depth,
                });
            }
        }
        Ok(())
    }

    /// Overwrite each reserved slot with a direct auipc/jalr call to its
    /// callee. Done exactly once, after every element has its address.
    pub fn patch_base_calls(&mut self, callees: &[CalleeHandle]) -> Result<(), MethodError> {
        self.check_callees(callees)?;
        for (slot, callee) in self.call_site_indices.iter().zip(callees) {
            let slot_address = self.address + (*slot as u64) * 4;
            let offset = callee.address as i64 - slot_address as i64;
            let call = builder::build_method_base_call(offset)?;
            self.instructions[*slot..*slot + call.len()].copy_from_slice(&call);
        }
        self.callees = callees.to_vec();
        Ok(())
    }

    /// Trampoline-mode patching: each slot materializes the callee address
    /// and calls the call_jit_elt trampoline. `call_trampoline_offset` is
    /// relative to the method start.
    pub fn patch_trampoline_calls(
        &mut self,
        callees: &[CalleeHandle],
        call_trampoline_offset: i64,
    ) -> Result<(), MethodError> {
        self.check_callees(callees)?;
        for (slot, callee) in self.call_site_indices.iter().zip(callees) {
            let slot_address = self.address + (*slot as u64) * 4;
            let offset = callee.address as i64 - slot_address as i64;
            let call = builder::build_method_trampoline_call(
                offset,
                call_trampoline_offset - (*slot as i64) * 4,
            )?;
            self.instructions[*slot..*slot + call.len()].copy_from_slice(&call);
        }
        self.callees = callees.to_vec();
        Ok(())
    }

    /// A method whose depth has no shallower candidates keeps its nop
    /// placeholders and becomes a leaf.
    pub fn demote_to_leaf(&mut self) {
        debug!(
            address = self.address,
            "demoting method to leaf"
        );
        self.call_number = 0;
        self.call_depth = 0;
        self.call_site_indices.clear();
    }

    pub fn bytes(&self) -> Result<Vec<u8>, EncodingError> {
        consolidate_bytes(&self.instructions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DATA_REG, INSTRUCTION_WEIGHTS};
    use crate::instr::Format;
    use crate::opcodes::{OP_AUIPC, OP_JALR};
    use rand::SeedableRng;

    const REGISTERS: [u32; 8] = [10, 11, 12, 13, 14, 15, 16, 17];

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(11)
    }

    fn spec(body_size: usize, call_number: usize, call_depth: u64) -> MethodSpec {
        MethodSpec {
            body_size,
            call_number,
            call_depth,
        }
    }

    fn filled_method(body_size: usize, call_number: usize, call_depth: u64) -> Method {
        let mut method = Method::new(0, 0x2000, spec(body_size, call_number, call_depth), 3).unwrap();
        method
            .fill_with_instructions(&mut rng(), &REGISTERS, DATA_REG, 0x400, &INSTRUCTION_WEIGHTS)
            .unwrap();
        method
    }

    #[test]
    fn check_zero_body_is_rejected() {
        assert!(matches!(
            Method::new(0, 0x2000, spec(0, 0, 0), 3),
            Err(MethodError::EmptySection)
        ));
    }

    #[test]
    fn check_too_many_calls_rejected() {
        assert!(matches!(
            Method::new(0, 0x2000, spec(8, 3, 1), 3),
            Err(MethodError::CallNumber { .. })
        ));
    }

    #[test]
    fn check_total_size_accounting() {
        let leaf = Method::new(0, 0x2000, spec(30, 0, 0), 3).unwrap();
        assert_eq!(leaf.total_size(), 11 + 30 + 12);
        let caller = Method::new(1, 0x2000, spec(30, 2, 1), 3).unwrap();
        assert_eq!(caller.total_size(), 12 + 30 + 13);
    }

    #[test]
    fn check_fill_emits_declared_size() {
        let method = filled_method(40, 3, 1);
        assert_eq!(method.instructions().len(), method.total_size());
        assert_eq!(method.call_site_indices().len(), 3);
    }

    #[test]
    fn check_call_slots_hold_nops_before_patching() {
        let method = filled_method(40, 3, 1);
        for slot in method.call_site_indices() {
            for k in 0..method.call_size() {
                assert_eq!(method.instructions()[slot + k], Instr::nop());
            }
        }
    }

    #[test]
    fn check_call_slots_do_not_overlap() {
        for seed in 0..20 {
            let mut method = Method::new(0, 0x2000, spec(30, 5, 1), 3).unwrap();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            method
                .fill_with_instructions(&mut rng, &REGISTERS, DATA_REG, 0x400, &INSTRUCTION_WEIGHTS)
                .unwrap();
            let slots = method.call_site_indices();
            for pair in slots.windows(2) {
                assert!(pair[1] - pair[0] >= 3);
            }
            let body_end = method.prologue_size() + method.body_size();
            assert!(slots.iter().all(|s| *s >= method.prologue_size()));
            assert!(slots.iter().all(|s| s + 3 <= body_end));
        }
    }

    #[test]
    fn check_branches_stay_inside_method() {
        let method = filled_method(60, 2, 1);
        let body_end = (method.prologue_size() + method.body_size()) * 4;
        for (i, instr) in method.instructions().iter().enumerate() {
            if matches!(instr.format, Format::B | Format::J) {
                let target = (i * 4) as i64 + instr.imm as i64;
                assert!(target >= 0 && target <= body_end as i64);
            }
        }
    }

    #[test]
    fn check_patch_replaces_slots_with_calls() {
        let mut method = filled_method(40, 2, 1);
        let callees = [
            CalleeHandle {
                id: 7,
                address: 0x2800,
                call_depth: 0,
            },
            CalleeHandle {
                id: 8,
                address: 0x1800,
                call_depth: 0,
            },
        ];
        method.patch_base_calls(&callees).unwrap();
        for (slot, callee) in method.call_site_indices().iter().zip(&callees) {
            let auipc = method.instructions()[*slot];
            let jalr = method.instructions()[slot + 1];
            assert_eq!(auipc.opcode, OP_AUIPC);
            assert_eq!(jalr.opcode, OP_JALR);
            // the pair recombines to the callee address
            let slot_address = 0x2000 + (*slot as i64) * 4;
            let target = slot_address + (auipc.imm as i64) + (jalr.imm as i64);
            assert_eq!(target, callee.address as i64);
            // the third slot instruction stays a nop
            assert_eq!(method.instructions()[slot + 2], Instr::nop());
        }
    }

    #[test]
    fn check_patch_rejects_self_call() {
        let mut method = filled_method(40, 1, 1);
        let own = method.handle();
        assert!(matches!(
            method.patch_base_calls(&[own]),
            Err(MethodError::RecursiveCall { .. })
        ));
    }

    #[test]
    fn check_patch_rejects_deeper_callee() {
        let mut method = filled_method(40, 1, 1);
        let callee = CalleeHandle {
            id: 9,
            address: 0x3000,
            call_depth: 1,
        };
        assert!(matches!(
            method.patch_base_calls(&[callee]),
            Err(MethodError::MutualCall { .. })
        ));
    }

    #[test]
    fn check_patch_rejects_wrong_callee_count() {
        let mut method = filled_method(40, 2, 1);
        let callee = CalleeHandle {
            id: 9,
            address: 0x3000,
            call_depth: 0,
        };
        assert!(matches!(
            method.patch_base_calls(&[callee]),
            Err(MethodError::CallNumber {
                expected: 2,
                provided: 1
            })
        ));
    }

    #[test]
    fn check_trampoline_fill_routes_return_through_trampoline() {
        let mut method = Method::new(0, 0x2100, spec(20, 0, 0), 6).unwrap();
        let ret_trampoline = 0x2004i64 - 0x2100;
        method
            .fill_with_trampoline_instructions(
                &mut rng(),
                &REGISTERS,
                DATA_REG,
                0x400,
                &INSTRUCTION_WEIGHTS,
                ret_trampoline,
            )
            .unwrap();
        let last = method.instructions()[method.total_size() - 1];
        assert_eq!(last.format, Format::J);
        assert_eq!(last.rd, 0);
        // the jump lands exactly on the trampoline
        let jump_address = 0x2100 + ((method.total_size() - 1) * 4) as i64;
        assert_eq!(jump_address + last.imm as i64, 0x2004);
    }
}
