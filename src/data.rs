//! Byte generation for the data region and the shadow stack.
//!
//! Every load and store the builder emits targets the data region, so its
//! contents only matter for making emulated reads observable. The strategies
//! trade recognizability against entropy.

use clap::ValueEnum;
use rand::RngCore;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataStrategy {
    /// All zero bytes.
    Zeroes,
    /// Uniform random bytes from the seeded source.
    Random,
    /// Little-endian 32-bit counter: 0, 1, 2, ...
    Iterative32,
    /// Little-endian 64-bit counter.
    Iterative64,
}

pub fn generate_data(strategy: DataStrategy, size: u64, rng: &mut ChaCha8Rng) -> Vec<u8> {
    let size = size as usize;
    match strategy {
        DataStrategy::Zeroes => vec![0; size],
        DataStrategy::Random => {
            let mut data = vec![0; size];
            rng.fill_bytes(&mut data);
            data
        }
        DataStrategy::Iterative32 => (0..)
            .flat_map(|i: u32| i.to_le_bytes())
            .take(size)
            .collect(),
        DataStrategy::Iterative64 => (0..)
            .flat_map(|i: u64| i.to_le_bytes())
            .take(size)
            .collect(),
    }
}

/// The shadow stack starts out as zero-filled memory.
pub fn generate_shadow_stack(size: u64) -> Vec<u8> {
    vec![0; size as usize]
}
