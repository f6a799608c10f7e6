//! Next-token selection
//!
//! Temperature softmax followed by nucleus (top-p) filtering, or arg-max when
//! the temperature is zero. Every shard seeds its sampler identically so that
//! identical logits produce identical tokens across the pool.

use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shardchat_common::{Result, ShardChatError};
use shardchat_proto::GenerateRequest;

/// Decode parameters of one request
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_gen_len: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_symbols: Vec<String>,
}

impl SamplingParams {
    pub fn from_request(request: &GenerateRequest) -> Self {
        Self {
            max_gen_len: request.max_gen_len,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_symbols: request.stop_symbols.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_gen_len == 0 {
            return Err(ShardChatError::invalid_input("max_gen_len must be at least 1"));
        }
        if !(self.temperature >= 0.0) || !self.temperature.is_finite() {
            return Err(ShardChatError::invalid_input(format!(
                "Invalid temperature: {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ShardChatError::invalid_input(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.stop_symbols.iter().any(String::is_empty) {
            return Err(ShardChatError::invalid_input("stop symbols must not be empty"));
        }
        Ok(())
    }
}

/// Seeded token sampler
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64, temperature: f32, top_p: f32) -> Self {
        Self {
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick the next token id from a logits tensor
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = logits
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| ShardChatError::model_failure(format!("unreadable logits: {}", e)))?;

        self.sample_logits(&logits)
    }

    pub fn sample_logits(&mut self, logits: &[f32]) -> Result<u32> {
        if self.temperature <= 0.0 {
            return argmax(logits).ok_or_else(|| ShardChatError::model_failure("empty logits"));
        }

        let probs = softmax(logits, self.temperature);
        let kept = nucleus(&probs, self.top_p);
        let dist = WeightedIndex::new(kept.iter().map(|(_, p)| *p)).map_err(|e| {
            ShardChatError::model_failure(format!("cannot sample from logits: {}", e))
        })?;

        Ok(kept[dist.sample(&mut self.rng)].0)
    }
}

/// Index of the largest logit; the first one wins ties
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &value) in logits.iter().enumerate() {
        match best {
            Some((_, current)) if !(value > current) => {}
            _ => best = Some((i, value)),
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Softmax of `logits / temperature`
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|&x| ((x - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Nucleus filtering over a probability vector.
///
/// Returns `(token id, renormalized probability)` in descending probability
/// order. An entry is dropped once the mass before it already exceeds
/// `top_p`, so the entry that first pushes the cumulative mass over the
/// threshold is kept.
pub fn nucleus(probs: &[f32], top_p: f32) -> Vec<(u32, f32)> {
    let mut sorted: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p))
        .collect();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut cumulative = 0.0f32;
    let mut kept = Vec::new();
    for (id, p) in sorted {
        cumulative += p;
        if cumulative - p > top_p {
            continue;
        }
        kept.push((id, p));
    }

    let mass: f32 = kept.iter().map(|(_, p)| p).sum();
    for (_, p) in kept.iter_mut() {
        *p /= mass;
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn raw_mass(probs: &[f32], kept: &[(u32, f32)]) -> f32 {
        kept.iter().map(|(id, _)| probs[*id as usize]).sum()
    }

    #[test]
    fn test_nucleus_keeps_boundary_entry() {
        let probs = [0.5, 0.3, 0.15, 0.05];

        let kept = nucleus(&probs, 0.6);

        // 0.5 alone is below 0.6, so 0.3 crosses the threshold and stays
        let ids: Vec<u32> = kept.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!((kept[0].1 - 0.625).abs() < 1e-6);
        assert!((kept[1].1 - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_nucleus_mass_bounds() {
        let probs = softmax(&[2.0, 1.5, 0.3, -1.0, 0.9, 0.0, -0.5, 1.1], 0.7);

        for step in 1..=20 {
            let top_p = step as f32 / 20.0;
            let kept = nucleus(&probs, top_p);
            let mass = raw_mass(&probs, &kept);
            let without_last = mass - probs[kept.last().unwrap().0 as usize];

            assert!(mass >= top_p - 1e-6, "top_p={} mass={}", top_p, mass);
            assert!(without_last <= top_p + 1e-6, "top_p={} without_last={}", top_p, without_last);
        }
    }

    #[test]
    fn test_full_nucleus_keeps_everything() {
        let probs = [0.25, 0.25, 0.25, 0.25];
        assert_eq!(nucleus(&probs, 1.0).len(), 4);
    }

    #[test]
    fn test_argmax_first_max_wins() {
        assert_eq!(argmax(&[0.1, 3.0, 3.0, -2.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_zero_temperature_is_greedy() {
        let logits = Tensor::new(&[0.1f32, 0.2, 5.0, 0.3], &Device::Cpu).unwrap();
        let mut a = Sampler::new(1, 0.0, 0.9);
        let mut b = Sampler::new(99, 0.0, 0.9);

        for _ in 0..5 {
            assert_eq!(a.sample(&logits).unwrap(), 2);
            assert_eq!(b.sample(&logits).unwrap(), 2);
        }
    }

    #[test]
    fn test_same_seed_same_samples() {
        let logits = [1.0f32, 0.9, 0.8, 0.7, 0.6, 0.5];
        let mut a = Sampler::new(7, 1.0, 0.95);
        let mut b = Sampler::new(7, 1.0, 0.95);

        let left: Vec<u32> = (0..32).map(|_| a.sample_logits(&logits).unwrap()).collect();
        let right: Vec<u32> = (0..32).map(|_| b.sample_logits(&logits).unwrap()).collect();

        assert_eq!(left, right);
    }

    #[test]
    fn test_tiny_top_p_is_effectively_greedy() {
        let logits = [0.0f32, 4.0, 1.0];
        let mut sampler = Sampler::new(3, 1.0, 0.01);

        for _ in 0..16 {
            assert_eq!(sampler.sample_logits(&logits).unwrap(), 1);
        }
    }

    #[test]
    fn test_params_validation() {
        let mut params = SamplingParams {
            max_gen_len: 8,
            temperature: 0.1,
            top_p: 0.75,
            stop_symbols: Vec::new(),
        };
        assert!(params.validate().is_ok());

        params.max_gen_len = 0;
        assert!(matches!(params.validate(), Err(ShardChatError::InvalidInput(_))));

        params.max_gen_len = 8;
        params.top_p = 1.5;
        assert!(params.validate().is_err());
    }
}
