use std::fs;

use clap::Parser;
use clap_num::maybe_hex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gigue::config::{GeneratorConfig, IsolationMode};
use gigue::data::DataStrategy;
use gigue::errors::GeneratorError;
use gigue::generator::Generator;

/// Generate a synthetic RV64IM binary laid out like a managed runtime:
/// an interpretation loop dispatching into randomly generated methods and
/// polymorphic inline caches.
///
///
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Start address of the interpretation loop (use 0x prefix for
    /// hexadecimal)
    #[arg(long, default_value = "0x1000", value_parser = maybe_hex::<u64>)]
    interpreter_start_address: u64,

    /// Start address of the JIT region
    #[arg(long, default_value = "0x3000", value_parser = maybe_hex::<u64>)]
    jit_start_address: u64,

    /// JIT region budget in bytes
    #[arg(long, default_value = "0x2000", value_parser = maybe_hex::<u64>)]
    jit_size: u64,

    /// Number of methods to generate (PIC cases count individually)
    #[arg(long, default_value_t = 10)]
    jit_nb_methods: u64,

    /// Mean of the per-method size variation, in [0, 1]
    #[arg(long, default_value_t = 0.2)]
    method_variation_mean: f64,

    /// Standard deviation of the per-method size variation
    #[arg(long, default_value_t = 0.1)]
    method_variation_stdev: f64,

    /// Mean call depth (Poisson parameter)
    #[arg(long, default_value_t = 2)]
    call_depth_mean: u64,

    /// Mean fraction of a body occupied by call sites, in [0, 1]
    #[arg(long, default_value_t = 0.2)]
    call_occupation_mean: f64,

    /// Standard deviation of the call occupation
    #[arg(long, default_value_t = 0.1)]
    call_occupation_stdev: f64,

    /// Probability of emitting a PIC instead of a method, in [0, 1]
    #[arg(long, default_value_t = 0.2)]
    pics_ratio: f64,

    /// Mean PIC case count (Poisson parameter, shifted by one)
    #[arg(long, default_value_t = 2)]
    pics_mean_case_nb: u64,

    /// Data region size in bytes
    #[arg(long, default_value = "0x400", value_parser = maybe_hex::<u64>)]
    data_size: u64,

    /// Data region content strategy
    #[arg(long, value_enum, default_value = "random")]
    data_strategy: DataStrategy,

    /// Isolation mode: trampolines and RIMI overlays
    #[arg(long, value_enum, default_value = "none")]
    isolation: IsolationMode,

    /// Shadow-stack binary size in bytes (RIMI modes)
    #[arg(long, default_value = "0x100", value_parser = maybe_hex::<u64>)]
    shadow_stack_size: u64,

    /// Shadow-stack pointer register (RIMI modes)
    #[arg(long, default_value_t = 28)]
    rimi_ssp_reg: u32,

    /// Instruction category weights, in R,I,U,J,B,S,L order
    #[arg(long, value_delimiter = ',', num_args = 7)]
    weights: Option<Vec<u32>>,

    /// Random seed for reproducibility
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Path of the unified image
    #[arg(long, default_value = "bin/out.bin")]
    output_bin_file: String,

    /// Path of the data region binary
    #[arg(long, default_value = "bin/data.bin")]
    output_data_bin_file: String,

    /// Path of the shadow-stack binary
    #[arg(long, default_value = "bin/ss.bin")]
    output_ss_bin_file: String,
}

impl Args {
    fn into_config(self) -> Result<(GeneratorConfig, [String; 3]), GeneratorError> {
        let mut config = GeneratorConfig {
            interpreter_start_address: self.interpreter_start_address,
            jit_start_address: self.jit_start_address,
            jit_size: self.jit_size,
            jit_nb_methods: self.jit_nb_methods,
            method_variation_mean: self.method_variation_mean,
            method_variation_stdev: self.method_variation_stdev,
            call_depth_mean: self.call_depth_mean,
            call_occupation_mean: self.call_occupation_mean,
            call_occupation_stdev: self.call_occupation_stdev,
            pics_ratio: self.pics_ratio,
            pics_mean_case_nb: self.pics_mean_case_nb,
            data_size: self.data_size,
            data_strategy: self.data_strategy,
            isolation: self.isolation,
            shadow_stack_size: self.shadow_stack_size,
            rimi_ssp_reg: self.rimi_ssp_reg,
            seed: self.seed,
            ..Default::default()
        };
        if let Some(weights) = self.weights {
            let weights: [u32; 7] = weights.try_into().map_err(|_| {
                GeneratorError::Config("expected exactly 7 instruction weights".into())
            })?;
            config.weights = weights;
        }
        let outputs = [
            self.output_bin_file,
            self.output_data_bin_file,
            self.output_ss_bin_file,
        ];
        Ok((config, outputs))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run(Args::parse()) {
        tracing::error!("generation failed: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), GeneratorError> {
    let (config, [bin_path, data_path, ss_path]) = args.into_config()?;
    let mut generator = Generator::new(config)?;

    // Generate everything first; files are only touched on success, so a
    // failed run leaves nothing behind.
    let image = generator.generate()?;

    for path in [&bin_path, &data_path, &ss_path] {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
    }
    fs::write(&bin_path, image.unified())?;
    fs::write(&data_path, &image.data)?;
    fs::write(&ss_path, &image.shadow_stack)?;

    info!(
        image = %bin_path,
        data = %data_path,
        shadow_stack = %ss_path,
        "binaries written"
    );
    Ok(())
}
