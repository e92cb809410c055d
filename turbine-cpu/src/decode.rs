//! Host-side token sampler.

#![allow(clippy::cast_possible_truncation)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use turbine::model::{DecodeStep, DynamicDecode, SlotSampling, HISTORY, LOGITS, RNG_STATE, SAMPLED_IDS};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

/// Greedy, top-k, top-p and min-p sampling over host logits.
///
/// Each slot carries its own RNG state in the `rng_state` tensor: the state
/// seeds a [`StdRng`] for one draw and is replaced by the next value the
/// generator yields, so a slot's sequence of draws is reproducible from its
/// seed regardless of which other slots share the batch.
#[derive(Debug, Default)]
pub struct HostSampler {
    slots: Vec<SlotSampling>,
}

impl HostSampler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters of the current batch, one entry per row.
    #[must_use]
    pub fn slots(&self) -> &[SlotSampling] {
        &self.slots
    }
}

impl DynamicDecode<CpuBackend> for HostSampler {
    fn setup(&mut self, _backend: &CpuBackend, slots: &[SlotSampling]) -> Result<()> {
        if let Some(bad) = slots.iter().find(|s| !(0.0..=1.0).contains(&s.top_p)) {
            return Err(Error::Other(format!("top_p {} outside [0, 1]", bad.top_p)));
        }
        self.slots = slots.to_vec();
        Ok(())
    }

    fn forward(
        &mut self,
        _backend: &CpuBackend,
        step: DecodeStep,
        inputs: &turbine::TensorMap<'_, CpuTensor>,
        outputs: &mut turbine::TensorMap<'_, CpuTensor>,
    ) -> Result<()> {
        let logits = inputs.get(LOGITS)?;
        let padded = logits.row_numel();
        if logits.rows() < step.batch_size || step.vocab_size > padded {
            return Err(Error::InvalidShape(format!(
                "logits {:?} for {} rows of vocab {}",
                logits.shape(),
                step.batch_size,
                step.vocab_size
            )));
        }
        if self.slots.len() < step.batch_size {
            return Err(Error::Other(format!(
                "sampler set up for {} rows, asked for {}",
                self.slots.len(),
                step.batch_size
            )));
        }
        let values = logits.to_f32_vec()?;
        let history = inputs.get(HISTORY)?.as_slice::<u32>()?;

        let mut sampled = Vec::with_capacity(step.batch_size);
        let states = outputs.get_mut(RNG_STATE)?.as_mut_slice::<u64>()?;
        if states.len() < step.batch_size {
            return Err(Error::InvalidShape(format!(
                "{} rng states for {} rows",
                states.len(),
                step.batch_size
            )));
        }
        for (row, state) in states.iter_mut().enumerate().take(step.batch_size) {
            let mut row_logits = values[row * padded..row * padded + step.vocab_size].to_vec();
            let slot = &self.slots[row];
            let previous = row_history(history, row, step);
            mask_bad_words(&mut row_logits, &slot.bad_ids, &previous);
            let (token, next) = sample_row(&row_logits, slot, *state);
            sampled.push(token);
            *state = next;
        }

        let ids = outputs.get_mut(SAMPLED_IDS)?.as_mut_slice::<u32>()?;
        if ids.len() < sampled.len() {
            return Err(Error::InvalidShape(format!(
                "sampled_ids holds {} of {} rows",
                ids.len(),
                sampled.len()
            )));
        }
        ids[..sampled.len()].copy_from_slice(&sampled);
        Ok(())
    }
}

fn row_history(history: &[u32], row: usize, step: DecodeStep) -> Vec<u32> {
    (0..step.step)
        .map(|p| p * step.history_stride + row)
        .take_while(|&i| i < history.len())
        .map(|i| history[i])
        .collect()
}

/// Mask the final token of every bad word whose prefix ends the history.
fn mask_bad_words(logits: &mut [f32], bad_ids: &[Vec<u32>], history: &[u32]) {
    for word in bad_ids {
        let Some((&last, prefix)) = word.split_last() else {
            continue;
        };
        if history.ends_with(prefix) {
            if let Some(l) = logits.get_mut(last as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
    }
}

/// Sample one token; returns it with the slot's next RNG state.
fn sample_row(logits: &[f32], slot: &SlotSampling, state: u64) -> (u32, u64) {
    let mut rng = StdRng::seed_from_u64(state);
    let next = rng.gen::<u64>();
    if slot.top_k == 1 {
        return (argmax(logits), next);
    }

    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut indexed: Vec<(usize, f32)> = logits
        .iter()
        .map(|&l| (l - max_logit).exp())
        .enumerate()
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    if slot.top_k > 0 {
        indexed.truncate(slot.top_k as usize);
    }
    let sum: f32 = indexed.iter().map(|(_, p)| p).sum();
    if sum <= 0.0 || !sum.is_finite() {
        return (argmax(logits), next);
    }

    // Top-p nucleus
    let mut cumulative = 0.0f32;
    let mut cutoff = indexed.len();
    for (i, &(_, p)) in indexed.iter().enumerate() {
        cumulative += p / sum;
        if cumulative >= slot.top_p {
            cutoff = i + 1;
            break;
        }
    }
    indexed.truncate(cutoff.max(1));

    if slot.min_p > 0.0 {
        let floor = indexed[0].1 * slot.min_p;
        indexed.retain(|&(_, p)| p >= floor);
    }

    let nucleus_sum: f32 = indexed.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.gen();
    let mut cumul = 0.0;
    for &(idx, p) in &indexed {
        cumul += p / nucleus_sum;
        if cumul >= r {
            return (idx as u32, next);
        }
    }
    // Fallback: most probable
    (indexed[0].0 as u32, next)
}

fn argmax(logits: &[f32]) -> u32 {
    let mut max_idx = 0u32;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > max_val {
            max_val = v;
            max_idx = i as u32;
        }
    }
    max_idx
}

#[cfg(test)]
mod tests {
    use turbine::{DType, TensorMap};

    use super::*;

    fn greedy() -> SlotSampling {
        SlotSampling {
            top_k: 1,
            top_p: 1.0,
            ..SlotSampling::default()
        }
    }

    fn run(sampler: &mut HostSampler, logits: &CpuTensor, history: &CpuTensor, step: DecodeStep) -> (Vec<u32>, Vec<u64>) {
        let backend = CpuBackend::new();
        let mut ids = CpuTensor::zeros(&[4], DType::U32);
        let mut rng = CpuTensor::from_slice(&[4], &[1u64, 2, 3, 4]);
        let mut inputs = TensorMap::new();
        inputs.insert(LOGITS, logits).insert(HISTORY, history);
        let mut outputs = TensorMap::new();
        outputs.insert_mut(SAMPLED_IDS, &mut ids).insert_mut(RNG_STATE, &mut rng);
        sampler.forward(&backend, step, &inputs, &mut outputs).unwrap();
        drop(outputs);
        (ids.to_vec().unwrap(), rng.to_vec().unwrap())
    }

    #[test]
    fn greedy_takes_argmax_and_advances_state() {
        let mut sampler = HostSampler::new();
        sampler.setup(&CpuBackend::new(), &[greedy(), greedy()]).unwrap();
        let logits = CpuTensor::from_slice(&[2, 4], &[0.1f32, 0.9, 0.2, 0.0, 3.0, 1.0, 2.0, f32::MIN]);
        let history = CpuTensor::zeros(&[8], DType::U32);
        let step = DecodeStep { step: 0, batch_size: 2, history_stride: 2, vocab_size: 3 };

        let (ids, states) = run(&mut sampler, &logits, &history, step);
        assert_eq!(&ids[..2], &[1, 0]);
        assert_ne!(states[0], 1);
        assert_eq!(&states[2..], &[3, 4]);
    }

    #[test]
    fn bad_words_are_masked_after_their_prefix() {
        let mut sampler = HostSampler::new();
        let slot = SlotSampling {
            bad_ids: vec![vec![1], vec![7, 2]],
            ..greedy()
        };
        sampler.setup(&CpuBackend::new(), &[slot]).unwrap();
        let logits = CpuTensor::from_slice(&[1, 4], &[0.0f32, 5.0, 4.0, 3.0]);
        let history = CpuTensor::from_slice(&[2], &[6u32, 7]);
        let step = DecodeStep { step: 2, batch_size: 1, history_stride: 1, vocab_size: 4 };

        let (ids, _) = run(&mut sampler, &logits, &history, step);
        assert_eq!(ids[0], 3);
    }

    #[test]
    fn sampling_is_reproducible_from_state() {
        let slot = SlotSampling {
            top_k: 0,
            top_p: 0.9,
            ..SlotSampling::default()
        };
        let logits: Vec<f32> = (0..16).map(|i| (i % 5) as f32 * 0.3).collect();
        for seed in [0u64, 42, 1234] {
            let a = sample_row(&logits, &slot, seed);
            let b = sample_row(&logits, &slot, seed);
            assert_eq!(a, b);
            assert!((a.0 as usize) < logits.len());
        }
    }

    #[test]
    fn top_k_limits_candidates() {
        let slot = SlotSampling {
            top_k: 2,
            top_p: 1.0,
            ..SlotSampling::default()
        };
        let logits = [0.0f32, 10.0, 9.5, -3.0];
        for seed in 0..32 {
            let (token, _) = sample_row(&logits, &slot, seed);
            assert!(token == 1 || token == 2);
        }
    }

    #[test]
    fn setup_rejects_bad_top_p() {
        let mut sampler = HostSampler::new();
        let slot = SlotSampling { top_p: 1.5, ..greedy() };
        assert!(sampler.setup(&CpuBackend::new(), &[slot]).is_err());
    }
}
