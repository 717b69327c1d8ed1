//! The four-phase generation pipeline: fill the JIT region, patch the call
//! DAG, lay out the interpretation loop, emit the image.
//!
//! The generator owns every element it creates. Call targets circulate as
//! `CalleeHandle` descriptors, and the call-depth index is an ordered map so
//! the seeded draw sequence is reproducible. One `Generator` performs one
//! run.

use std::collections::BTreeMap;

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::builder::{self, BaseBuilder, IsolationBuilder};
use crate::config::{GeneratorConfig, IsolationMode};
use crate::constants::{
    CMP_REG, HIT_CASE_REG, MAX_EPILOGUE_SIZE, MAX_PROLOGUE_SIZE, USED_S_REGS,
};
use crate::data;
use crate::errors::{EncodingError, GeneratorError, MethodError};
use crate::instr::{consolidate_bytes, Instr};
use crate::method::{CalleeHandle, Method, MethodSizing, MethodSpec};
use crate::pic::Pic;
use crate::rimi::{FullBuilder, ShadowStackBuilder};
use crate::trampoline::{Trampoline, TrampolineKind};
use crate::utils::sample_poisson;

/// A callable JIT element: either a plain method or a PIC.
#[derive(Debug, Clone)]
pub enum JitElement {
    Method(Method),
    Pic(Pic),
}

impl JitElement {
    pub fn address(&self) -> u64 {
        match self {
            JitElement::Method(method) => method.address(),
            JitElement::Pic(pic) => pic.address(),
        }
    }

    pub fn total_size(&self) -> usize {
        match self {
            JitElement::Method(method) => method.total_size(),
            JitElement::Pic(pic) => pic.total_size(),
        }
    }

    pub fn method_nb(&self) -> usize {
        match self {
            JitElement::Method(method) => method.method_nb(),
            JitElement::Pic(pic) => pic.method_nb(),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            JitElement::Method(method) => method.bytes(),
            JitElement::Pic(pic) => pic.bytes(),
        }
    }
}

/// The finished binaries of one run.
#[derive(Debug, Clone)]
pub struct Image {
    pub interpreter: Vec<u8>,
    pub padding: Vec<u8>,
    pub jit: Vec<u8>,
    pub data: Vec<u8>,
    pub shadow_stack: Vec<u8>,
}

impl Image {
    /// interpreter || nop padding || trampolines and JIT elements.
    pub fn unified(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.interpreter.len() + self.padding.len() + self.jit.len(),
        );
        out.extend_from_slice(&self.interpreter);
        out.extend_from_slice(&self.padding);
        out.extend_from_slice(&self.jit);
        out
    }
}

pub struct Generator {
    config: GeneratorConfig,
    registers: Vec<u32>,
    call_size: usize,
    sizing: MethodSizing,
    rng: ChaCha8Rng,
    builder: Box<dyn IsolationBuilder>,
    elements: Vec<JitElement>,
    trampolines: Vec<Trampoline>,
    call_depth_index: BTreeMap<u64, Vec<CalleeHandle>>,
    interpreter_instructions: Vec<Instr>,
    method_count: usize,
    pic_count: usize,
    next_id: usize,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GeneratorError> {
        config.validate()?;
        let slot_budget = (config.jit_size / 4 / config.jit_nb_methods) as usize;
        let mean_body_size = slot_budget
            .checked_sub(MAX_PROLOGUE_SIZE + MAX_EPILOGUE_SIZE)
            .filter(|size| *size > 0)
            .ok_or(MethodError::EmptySection)?;
        let call_size = config.isolation.call_size();
        let sizing = MethodSizing {
            mean_body_size,
            variation_mean: config.method_variation_mean,
            variation_stdev: config.method_variation_stdev,
            call_occupation_mean: config.call_occupation_mean,
            call_occupation_stdev: config.call_occupation_stdev,
            call_depth_mean: config.call_depth_mean,
            call_size,
        };
        let builder: Box<dyn IsolationBuilder> = match config.isolation {
            IsolationMode::None | IsolationMode::Trampolines => Box::new(BaseBuilder),
            IsolationMode::RimiShadowStack => Box::new(ShadowStackBuilder {
                ssp_reg: config.rimi_ssp_reg,
            }),
            IsolationMode::RimiFull => Box::new(FullBuilder {
                ssp_reg: config.rimi_ssp_reg,
            }),
        };
        let registers = config.usable_registers();
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        debug!(
            mean_body_size,
            call_size,
            variation_mean = config.method_variation_mean,
            variation_stdev = config.method_variation_stdev,
            call_occupation_mean = config.call_occupation_mean,
            call_depth_mean = config.call_depth_mean,
            "generator instantiated"
        );
        Ok(Self {
            config,
            registers,
            call_size,
            sizing,
            rng,
            builder,
            elements: Vec::new(),
            trampolines: Vec::new(),
            call_depth_index: BTreeMap::new(),
            interpreter_instructions: Vec::new(),
            method_count: 0,
            pic_count: 0,
            next_id: 0,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn elements(&self) -> &[JitElement] {
        &self.elements
    }

    pub fn trampolines(&self) -> &[Trampoline] {
        &self.trampolines
    }

    pub fn method_count(&self) -> usize {
        self.method_count
    }

    pub fn pic_count(&self) -> usize {
        self.pic_count
    }

    pub fn interpreter_instructions(&self) -> &[Instr] {
        &self.interpreter_instructions
    }

    /// Run all four phases and return the finished binaries. Nothing is
    /// written to disk here; a failure in any phase aborts the whole run.
    pub fn generate(&mut self) -> Result<Image, GeneratorError> {
        self.fill_jit_code()?;
        self.patch_jit_calls()?;
        self.fill_interpretation_loop()?;
        self.emit()
    }

    fn trampoline_address(&self, kind: TrampolineKind) -> Option<u64> {
        self.trampolines
            .iter()
            .find(|trampoline| trampoline.kind == kind)
            .map(|trampoline| trampoline.address)
    }

    //  Phase 1
    // \_______

    fn fill_jit_code(&mut self) -> Result<(), GeneratorError> {
        debug!("phase 1: filling JIT code");
        let mut current = self.config.jit_start_address;
        if self.config.isolation.uses_trampolines() {
            for kind in TrampolineKind::ALL {
                let trampoline = Trampoline::new(kind, current, self.builder.as_ref());
                debug!(
                    name = kind.label(),
                    address = current,
                    "trampoline placed"
                );
                current += (trampoline.size() * 4) as u64;
                self.trampolines.push(trampoline);
            }
        }
        let jit_end = self.config.jit_start_address + self.config.jit_size;
        // The first element is always a leaf, so every later depth has a
        // candidate callee below it.
        let leaf_spec = self.sizing.sample_leaf_spec(&mut self.rng);
        current = self.add_method_at(current, leaf_spec, jit_end)?;
        while (self.method_count as u64) < self.config.jit_nb_methods {
            let remaining = self.config.jit_nb_methods as usize - self.method_count;
            current = if self.rng.gen_bool(self.config.pics_ratio) {
                self.add_pic_at(current, remaining, jit_end)?
            } else {
                let spec = self.sizing.sample_spec(&mut self.rng);
                self.add_method_at(current, spec, jit_end)?
            };
        }
        debug!("phase 1: JIT code elements filled");
        Ok(())
    }

    fn add_method_at(
        &mut self,
        address: u64,
        spec: MethodSpec,
        jit_end: u64,
    ) -> Result<u64, GeneratorError> {
        // Oversized draws shrink to the remaining region, so the cursor
        // never crosses jit_end; the error fires only when not even a
        // minimal method fits.
        let max_slots = (jit_end.saturating_sub(address) / 4) as usize;
        let spec = spec.clamped_to(max_slots, self.call_size).ok_or_else(|| {
            GeneratorError::WrongAddress(format!(
                "method at {address:#x} would cross the end of the JIT region ({jit_end:#x})"
            ))
        })?;
        let mut method = Method::new(self.next_id, address, spec, self.call_size)?;
        self.next_id += 1;
        let end = address + (method.total_size() * 4) as u64;
        debug_assert!(end <= jit_end);
        self.fill_method(&mut method)?;
        debug!(
            address,
            body_size = method.body_size(),
            call_number = method.call_number(),
            call_depth = method.call_depth(),
            call_occupation = method.call_occupation(),
            "method added"
        );
        self.call_depth_index
            .entry(method.call_depth())
            .or_default()
            .push(method.handle());
        self.method_count += 1;
        self.elements.push(JitElement::Method(method));
        Ok(end)
    }

    fn fill_method(&mut self, method: &mut Method) -> Result<(), MethodError> {
        match self.trampoline_address(TrampolineKind::RetFromJitElt) {
            Some(ret_address) => method.fill_with_trampoline_instructions(
                &mut self.rng,
                &self.registers,
                self.config.data_reg,
                self.config.data_size,
                &self.config.weights,
                ret_address as i64 - method.address() as i64,
            ),
            None => method.fill_with_instructions(
                &mut self.rng,
                &self.registers,
                self.config.data_reg,
                self.config.data_size,
                &self.config.weights,
            ),
        }
    }

    fn add_pic_at(
        &mut self,
        address: u64,
        remaining_methods: usize,
        jit_end: u64,
    ) -> Result<u64, GeneratorError> {
        let available_slots = (jit_end.saturating_sub(address) / 4) as usize;
        let max_cases = available_slots / (crate::pic::CASE_SIZE + crate::pic::MIN_METHOD_SIZE);
        if max_cases == 0 {
            return Err(GeneratorError::WrongAddress(format!(
                "pic at {address:#x} would cross the end of the JIT region ({jit_end:#x})"
            )));
        }
        let case_number = (sample_poisson(&mut self.rng, self.config.pics_mean_case_nb) as usize
            + 1)
            .min(remaining_methods)
            .min(max_cases);
        let mut pic = Pic::new(
            &mut self.rng,
            &mut self.next_id,
            address,
            case_number,
            &self.sizing,
            HIT_CASE_REG,
            CMP_REG,
            jit_end,
        )?;
        let end = address + (pic.total_size() * 4) as u64;
        debug_assert!(end <= jit_end);
        match self.trampoline_address(TrampolineKind::RetFromJitElt) {
            Some(ret_address) => pic.fill_with_trampoline_instructions(
                &mut self.rng,
                &self.registers,
                self.config.data_reg,
                self.config.data_size,
                &self.config.weights,
                ret_address as i64 - address as i64,
            )?,
            None => pic.fill_with_instructions(
                &mut self.rng,
                &self.registers,
                self.config.data_reg,
                self.config.data_size,
                &self.config.weights,
            )?,
        }
        debug!(
            address,
            case_number, "pic added"
        );
        for method in pic.methods() {
            self.call_depth_index
                .entry(method.call_depth())
                .or_default()
                .push(method.handle());
        }
        self.method_count += pic.method_nb();
        self.pic_count += 1;
        self.elements.push(JitElement::Pic(pic));
        Ok(end)
    }

    //  Phase 2
    // \_______

    fn patch_jit_calls(&mut self) -> Result<(), GeneratorError> {
        debug!("phase 2: patching calls");
        let call_trampoline = self.trampoline_address(TrampolineKind::CallJitElt);
        let index = &self.call_depth_index;
        let rng = &mut self.rng;
        for element in self.elements.iter_mut() {
            match element {
                JitElement::Method(method) => {
                    patch_method_calls(method, index, rng, call_trampoline)?
                }
                JitElement::Pic(pic) => {
                    for method in pic.methods_mut() {
                        patch_method_calls(method, index, rng, call_trampoline)?;
                    }
                }
            }
        }
        debug!("phase 2: calls patched");
        Ok(())
    }

    //  Phase 3
    // \_______

    fn fill_interpretation_loop(&mut self) -> Result<(), GeneratorError> {
        debug!("phase 3: filling interpretation loop");
        let call_trampoline = self.trampoline_address(TrampolineKind::CallJitElt);
        // The loop frame saves everything the JIT bodies might clobber.
        let mut instructions = builder::build_prologue(USED_S_REGS, 0, true);
        let mut current =
            self.config.interpreter_start_address + (instructions.len() * 4) as u64;
        let mut order = (0..self.elements.len()).collect_vec();
        order.shuffle(&mut self.rng);
        for element_index in order {
            let offset = self.elements[element_index].address() as i64 - current as i64;
            let call = match (&self.elements[element_index], call_trampoline) {
                (JitElement::Method(_), None) => builder::build_method_base_call(offset)?,
                (JitElement::Method(_), Some(trampoline)) => builder::build_method_trampoline_call(
                    offset,
                    trampoline as i64 - current as i64,
                )?,
                (JitElement::Pic(pic), None) => {
                    let hit_case = self.rng.gen_range(1..=pic.case_number() as u32);
                    builder::build_pic_call(offset, hit_case, pic.hit_case_reg())?
                }
                (JitElement::Pic(pic), Some(trampoline)) => {
                    let hit_case = self.rng.gen_range(1..=pic.case_number() as u32);
                    builder::build_pic_trampoline_call(
                        offset,
                        trampoline as i64 - current as i64,
                        hit_case,
                        pic.hit_case_reg(),
                    )?
                }
            };
            debug!(
                call_site = current,
                target = self.elements[element_index].address(),
                "interpreter call added"
            );
            current += (call.len() * 4) as u64;
            instructions.extend(call);
        }
        instructions.extend(builder::build_epilogue(USED_S_REGS, 0, true));
        let end = self.config.interpreter_start_address + (instructions.len() * 4) as u64;
        if end > self.config.jit_start_address {
            return Err(GeneratorError::WrongAddress(format!(
                "interpretation loop end ({end:#x}) overwrites the JIT region ({:#x})",
                self.config.jit_start_address
            )));
        }
        self.interpreter_instructions = instructions;
        debug!("phase 3: interpretation loop filled");
        Ok(())
    }

    //  Phase 4
    // \_______

    fn emit(&mut self) -> Result<Image, GeneratorError> {
        debug!("phase 4: emitting binaries");
        let interpreter = consolidate_bytes(&self.interpreter_instructions)?;
        let gap =
            (self.config.jit_start_address - self.config.interpreter_start_address) as usize
                - interpreter.len();
        let padding = Instr::nop().bytes()?.repeat(gap / 4);
        let mut jit = Vec::new();
        for trampoline in &self.trampolines {
            jit.extend(trampoline.bytes()?);
        }
        for element in &self.elements {
            jit.extend(element.bytes()?);
        }
        let data = data::generate_data(
            self.config.data_strategy,
            self.config.data_size,
            &mut self.rng,
        );
        let shadow_stack_size = if self.config.isolation.is_rimi() {
            self.config.shadow_stack_size
        } else {
            8
        };
        let shadow_stack = data::generate_shadow_stack(shadow_stack_size);
        info!(
            methods = self.method_count,
            pics = self.pic_count,
            interpreter_bytes = interpreter.len(),
            jit_bytes = jit.len(),
            "generation complete"
        );
        Ok(Image {
            interpreter,
            padding,
            jit,
            data,
            shadow_stack,
        })
    }
}

/// `n` draws with replacement from the methods strictly below `call_depth`.
fn extract_callees(
    index: &BTreeMap<u64, Vec<CalleeHandle>>,
    rng: &mut ChaCha8Rng,
    call_depth: u64,
    nb: usize,
) -> Vec<CalleeHandle> {
    let pool = index
        .range(..call_depth)
        .flat_map(|(_, handles)| handles)
        .copied()
        .collect_vec();
    if pool.is_empty() {
        return Vec::new();
    }
    (0..nb)
        .map(|_| pool[rng.gen_range(0..pool.len())])
        .collect()
}

fn patch_method_calls(
    method: &mut Method,
    index: &BTreeMap<u64, Vec<CalleeHandle>>,
    rng: &mut ChaCha8Rng,
    call_trampoline: Option<u64>,
) -> Result<(), GeneratorError> {
    if method.call_number() == 0 {
        return Ok(());
    }
    let callees = extract_callees(index, rng, method.call_depth(), method.call_number());
    if callees.is_empty() {
        warn!(
            address = method.address(),
            call_depth = method.call_depth(),
            "no candidate callees below this depth"
        );
        method.demote_to_leaf();
        return Ok(());
    }
    match call_trampoline {
        Some(trampoline) => method
            .patch_trampoline_calls(&callees, trampoline as i64 - method.address() as i64)?,
        None => method.patch_base_calls(&callees)?,
    }
    debug!(
        address = method.address(),
        callees = callees.len(),
        "method calls patched"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataStrategy;

    fn small_config() -> GeneratorConfig {
        GeneratorConfig {
            interpreter_start_address: 0x1000,
            jit_start_address: 0x2000,
            jit_size: 0x4000,
            jit_nb_methods: 6,
            method_variation_mean: 0.1,
            method_variation_stdev: 0.05,
            call_depth_mean: 2,
            call_occupation_mean: 0.2,
            call_occupation_stdev: 0.1,
            pics_ratio: 0.3,
            pics_mean_case_nb: 2,
            data_size: 0x400,
            data_strategy: DataStrategy::Zeroes,
            seed: 17,
            ..Default::default()
        }
    }

    #[test]
    fn check_first_element_is_leaf_method() {
        let mut generator = Generator::new(small_config()).unwrap();
        generator.generate().unwrap();
        match &generator.elements()[0] {
            JitElement::Method(method) => {
                assert_eq!(method.call_number(), 0);
                assert_eq!(method.call_depth(), 0);
            }
            JitElement::Pic(_) => panic!("first element should be a leaf method"),
        }
    }

    #[test]
    fn check_elements_are_contiguous() {
        let mut generator = Generator::new(small_config()).unwrap();
        generator.generate().unwrap();
        let mut cursor = generator.config().jit_start_address;
        for element in generator.elements() {
            assert_eq!(element.address(), cursor);
            cursor += (element.total_size() * 4) as u64;
        }
        assert!(cursor <= generator.config().jit_start_address + generator.config().jit_size);
    }

    #[test]
    fn check_method_count_reaches_request() {
        let mut generator = Generator::new(small_config()).unwrap();
        generator.generate().unwrap();
        assert!(generator.method_count() >= 6);
    }

    #[test]
    fn check_undersized_method_budget_is_rejected() {
        let config = GeneratorConfig {
            jit_size: 0x100,
            jit_nb_methods: 10,
            ..small_config()
        };
        assert!(matches!(
            Generator::new(config),
            Err(GeneratorError::Method(MethodError::EmptySection))
        ));
    }

    #[test]
    fn check_interpreter_overrun_is_rejected() {
        // interpreter region far too small for the call list
        let config = GeneratorConfig {
            interpreter_start_address: 0x1000,
            jit_start_address: 0x1040,
            jit_size: 0x8000,
            jit_nb_methods: 8,
            ..small_config()
        };
        let mut generator = Generator::new(config).unwrap();
        assert!(matches!(
            generator.generate(),
            Err(GeneratorError::WrongAddress(_))
        ));
    }

    #[test]
    fn check_trampolines_sit_at_jit_start() {
        let config = GeneratorConfig {
            isolation: IsolationMode::Trampolines,
            ..small_config()
        };
        let mut generator = Generator::new(config).unwrap();
        generator.generate().unwrap();
        let trampolines = generator.trampolines();
        assert_eq!(trampolines.len(), 2);
        assert_eq!(trampolines[0].address, 0x2000);
        assert_eq!(trampolines[0].kind, TrampolineKind::CallJitElt);
        assert!(trampolines[1].address > trampolines[0].address);
        // first element starts right after
        let tramp_bytes: usize = trampolines.iter().map(|t| t.size() * 4).sum();
        assert_eq!(
            generator.elements()[0].address(),
            0x2000 + tramp_bytes as u64
        );
    }

    #[test]
    fn check_extract_callees_only_picks_shallower() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut index: BTreeMap<u64, Vec<CalleeHandle>> = BTreeMap::new();
        for (id, depth) in [(0, 0), (1, 0), (2, 1), (3, 2)] {
            index.entry(depth).or_default().push(CalleeHandle {
                id,
                address: 0x2000 + id as u64 * 0x100,
                call_depth: depth,
            });
        }
        for _ in 0..50 {
            for callee in extract_callees(&index, &mut rng, 2, 4) {
                assert!(callee.call_depth < 2);
            }
        }
        assert!(extract_callees(&index, &mut rng, 0, 3).is_empty());
    }
}
