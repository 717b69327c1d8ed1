//! Generation configuration and its validation. The CLI maps flags onto
//! `GeneratorConfig` one to one; library callers fill it directly.

use clap::ValueEnum;

use crate::constants::{
    BASE_CALL_SIZE, CALLER_SAVED_REG, DATA_REG, INSTRUCTION_WEIGHTS, TRAMPOLINE_CALL_SIZE,
};
use crate::data::DataStrategy;
use crate::errors::GeneratorError;
use crate::rimi::{RIMI_SSP_REG, SHADOW_STACK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IsolationMode {
    /// Direct calls, no trampolines.
    None,
    /// Calls and returns routed through trampolines.
    Trampolines,
    /// Trampolines with RIMI shadow-stack protection.
    RimiShadowStack,
    /// Trampolines with shadow stack and domain switches.
    RimiFull,
}

impl IsolationMode {
    pub fn uses_trampolines(&self) -> bool {
        !matches!(self, IsolationMode::None)
    }

    pub fn is_rimi(&self) -> bool {
        matches!(self, IsolationMode::RimiShadowStack | IsolationMode::RimiFull)
    }

    /// Accounting footprint of one call site in instruction slots.
    pub fn call_size(&self) -> usize {
        if self.uses_trampolines() {
            TRAMPOLINE_CALL_SIZE
        } else {
            BASE_CALL_SIZE
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub interpreter_start_address: u64,
    pub jit_start_address: u64,
    /// Total JIT region budget in bytes.
    pub jit_size: u64,
    pub jit_nb_methods: u64,
    pub method_variation_mean: f64,
    pub method_variation_stdev: f64,
    pub call_depth_mean: u64,
    pub call_occupation_mean: f64,
    pub call_occupation_stdev: f64,
    pub pics_ratio: f64,
    pub pics_mean_case_nb: u64,
    pub data_size: u64,
    pub data_strategy: DataStrategy,
    /// Registers random bodies may use; the data register (and the
    /// shadow-stack pointer in RIMI modes) is removed by the generator.
    pub registers: Vec<u32>,
    pub data_reg: u32,
    /// Weights of the R, I, U, J, B, S, L instruction categories.
    pub weights: [u32; 7],
    pub isolation: IsolationMode,
    pub shadow_stack_size: u64,
    pub rimi_ssp_reg: u32,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            interpreter_start_address: 0x1000,
            jit_start_address: 0x3000,
            jit_size: 0x2000,
            jit_nb_methods: 10,
            method_variation_mean: 0.2,
            method_variation_stdev: 0.1,
            call_depth_mean: 2,
            call_occupation_mean: 0.2,
            call_occupation_stdev: 0.1,
            pics_ratio: 0.2,
            pics_mean_case_nb: 2,
            data_size: 0x400,
            data_strategy: DataStrategy::Random,
            registers: CALLER_SAVED_REG.to_vec(),
            data_reg: DATA_REG,
            weights: INSTRUCTION_WEIGHTS,
            isolation: IsolationMode::None,
            shadow_stack_size: SHADOW_STACK_SIZE,
            rimi_ssp_reg: RIMI_SSP_REG,
            seed: 0,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), GeneratorError> {
        if self.interpreter_start_address % 4 != 0 || self.jit_start_address % 4 != 0 {
            return Err(GeneratorError::Config(
                "start addresses must be 4-byte aligned".into(),
            ));
        }
        if self.interpreter_start_address >= self.jit_start_address {
            return Err(GeneratorError::WrongAddress(format!(
                "interpretation loop start address {:#x} should be lower than JIT start address {:#x}",
                self.interpreter_start_address, self.jit_start_address
            )));
        }
        if self.jit_nb_methods == 0 {
            return Err(GeneratorError::Config(
                "at least one JIT method is required".into(),
            ));
        }
        for (name, value) in [
            ("method_variation_mean", self.method_variation_mean),
            ("method_variation_stdev", self.method_variation_stdev),
            ("call_occupation_mean", self.call_occupation_mean),
            ("call_occupation_stdev", self.call_occupation_stdev),
            ("pics_ratio", self.pics_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GeneratorError::Config(format!(
                    "{name} must lie in [0, 1] (got {value})"
                )));
            }
        }
        if self.pics_mean_case_nb == 0 {
            return Err(GeneratorError::Config(
                "pics_mean_case_nb must be at least 1".into(),
            ));
        }
        if self.weights.iter().all(|w| *w == 0) {
            return Err(GeneratorError::Config(
                "instruction weights must have nonzero total mass".into(),
            ));
        }
        if self.weights[..3].iter().all(|w| *w == 0) && self.weights[5..].iter().all(|w| *w == 0) {
            return Err(GeneratorError::Config(
                "instruction weights need mass outside the jump and branch categories".into(),
            ));
        }
        let forbidden = |reg: u32| {
            reg == 0 || reg == 2 || reg == self.data_reg
                || (self.isolation.is_rimi() && reg == self.rimi_ssp_reg)
        };
        let usable = self.registers.iter().filter(|reg| !forbidden(**reg)).count();
        if usable == 0 {
            return Err(GeneratorError::Config(
                "no usable registers remain after exclusions".into(),
            ));
        }
        if self.registers.iter().any(|reg| *reg > 31) {
            return Err(GeneratorError::Config(
                "register indices must lie in x1..x31".into(),
            ));
        }
        Ok(())
    }

    /// The register pool random bodies actually draw from.
    pub fn usable_registers(&self) -> Vec<u32> {
        self.registers
            .iter()
            .copied()
            .filter(|reg| {
                *reg != 0
                    && *reg != 2
                    && *reg != self.data_reg
                    && !(self.isolation.is_rimi() && *reg == self.rimi_ssp_reg)
            })
            .collect()
    }
}
