use rand::Rng;
use rand_chacha::ChaCha8Rng;

pub fn n_bit_mask(num_bits: u32) -> u32 {
    if num_bits >= 32 {
        u32::MAX
    } else {
        (1 << num_bits) - 1
    }
}

/// Return val[end:start] (verilog notation).
pub fn extract_field(val: u32, end: u32, start: u32) -> u32 {
    n_bit_mask(end - start + 1) & (val >> start)
}

/// Round value down to the previous multiple of alignment.
pub fn align(value: u64, alignment: u64) -> u64 {
    value - value % alignment
}

/// Sign-extend the low `bits` bits of a value to a full i32.
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Draw from a normal distribution with the given mean and standard
/// deviation, truncated to [lower, upper]. Sampling is by rejection over
/// Box-Muller draws; after too many rejections the mean is clamped into the
/// interval instead, which only happens for degenerate parameter choices.
pub fn sample_trunc_norm(
    rng: &mut ChaCha8Rng,
    mean: f64,
    std_dev: f64,
    lower: f64,
    upper: f64,
) -> f64 {
    if std_dev == 0.0 {
        return mean.clamp(lower, upper);
    }
    for _ in 0..100 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        let value = mean + std_dev * z;
        if (lower..=upper).contains(&value) {
            return value;
        }
    }
    mean.clamp(lower, upper)
}

/// Draw from a Poisson distribution with parameter lambda, by Knuth's
/// product-of-uniforms method. lambda = 0 always yields 0.
pub fn sample_poisson(rng: &mut ChaCha8Rng, lambda: u64) -> u64 {
    if lambda == 0 {
        return 0;
    }
    let threshold = (-(lambda as f64)).exp();
    let mut k = 0u64;
    let mut product = 1.0f64;
    loop {
        product *= rng.gen_range(0.0f64..1.0);
        if product <= threshold {
            return k;
        }
        k += 1;
    }
}
