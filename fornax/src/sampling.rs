//! Per-request sampling: temperature scaling and nucleus (top-p) sampling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ops::softmax;

/// Per-request generation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    /// Temperature for logit scaling; 0 selects greedy (argmax) decoding.
    pub temperature: f32,
    /// Nucleus probability threshold; values outside (0, 1) disable the
    /// nucleus cut and sample from the full distribution.
    pub top_p: f32,
    /// Maximum number of tokens to generate.
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            max_tokens: 256,
        }
    }
}

/// Stateful sampler owning a seeded RNG.
///
/// The same seed and logit sequence reproduce the same tokens. Greedy
/// decoding (temperature 0) does not consume randomness.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler with a deterministic seed.
    #[must_use]
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sample the next token id from `logits`, mutating them in place
    /// (temperature scale followed by softmax).
    ///
    /// Contract of the nucleus path: probabilities are sorted descending and
    /// cut at the first index where the cumulative mass exceeds `top_p`; the
    /// uniform draw is rescaled by that nucleus mass before walking the
    /// nucleus CDF, so the cut never biases towards the fallback token.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample(&mut self, logits: &mut [f32]) -> u32 {
        if self.temperature == 0.0 {
            return argmax(logits);
        }

        for logit in logits.iter_mut() {
            *logit /= self.temperature;
        }
        softmax(logits);

        let r: f32 = self.rng.gen();

        if self.top_p > 0.0 && self.top_p < 1.0 {
            // Sort indices by probability, highest first.
            let mut indexed: Vec<(f32, u32)> = logits
                .iter()
                .enumerate()
                .map(|(i, &p)| (p, i as u32))
                .collect();
            indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).expect("probabilities are finite"));

            // Nucleus cut: smallest prefix whose mass exceeds top_p.
            let mut nucleus_mass = 0.0f32;
            let mut cutoff = indexed.len();
            for (i, &(p, _)) in indexed.iter().enumerate() {
                nucleus_mass += p;
                if nucleus_mass > self.top_p {
                    cutoff = i + 1;
                    break;
                }
            }
            let nucleus = &indexed[..cutoff];

            let r_scaled = r * nucleus_mass;
            let mut cdf = 0.0f32;
            for &(p, id) in nucleus {
                cdf += p;
                if r_scaled < cdf {
                    return id;
                }
            }
            nucleus[nucleus.len() - 1].1
        } else {
            let mut cdf = 0.0f32;
            for (i, &p) in logits.iter().enumerate() {
                cdf += p;
                if r < cdf {
                    return i as u32;
                }
            }
            logits.len() as u32 - 1
        }
    }
}

/// Index of the largest logit.
#[allow(clippy::cast_possible_truncation)]
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = Sampler::new(0.0, 0.9, 42);
        let mut logits = vec![0.1, 2.5, -1.0, 2.4];
        assert_eq!(sampler.sample(&mut logits), 1);
        // Greedy leaves logits untouched.
        assert_eq!(logits[1], 2.5);
    }

    #[test]
    fn same_seed_same_tokens() {
        let logits = vec![0.5f32, 1.5, 0.2, 1.0, -0.3];
        let mut a = Sampler::new(0.8, 0.9, 7);
        let mut b = Sampler::new(0.8, 0.9, 7);
        for _ in 0..16 {
            let mut la = logits.clone();
            let mut lb = logits.clone();
            assert_eq!(a.sample(&mut la), b.sample(&mut lb));
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let logits = vec![1.0f32; 64];
        let mut a = Sampler::new(1.0, 0.9, 1);
        let mut b = Sampler::new(1.0, 0.9, 2);
        let tokens_a: Vec<u32> = (0..8).map(|_| a.sample(&mut logits.clone())).collect();
        let tokens_b: Vec<u32> = (0..8).map(|_| b.sample(&mut logits.clone())).collect();
        assert_ne!(tokens_a, tokens_b);
    }

    #[test]
    fn nucleus_excludes_tail() {
        // One token carries almost all the mass; top_p = 0.5 keeps only it.
        let mut sampler = Sampler::new(1.0, 0.5, 42);
        for _ in 0..32 {
            let mut logits = vec![10.0f32, 0.0, 0.0, 0.0];
            assert_eq!(sampler.sample(&mut logits), 0);
        }
    }

    #[test]
    fn full_distribution_when_top_p_is_one() {
        // top_p = 1.0 disables the nucleus cut; sampling still lands on a
        // valid id and respects the CDF.
        let mut sampler = Sampler::new(1.0, 1.0, 3);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let mut logits = vec![1.0f32, 1.0, 1.0, 1.0];
            seen.insert(sampler.sample(&mut logits));
        }
        assert!(seen.iter().all(|&t| t < 4));
        assert!(seen.len() > 1, "uniform logits should hit several tokens");
    }
}
