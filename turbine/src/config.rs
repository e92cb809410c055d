//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::penalty::InvalidTokenPolicy;
use crate::{Error, Result};

/// Configuration for the batch engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of batch slots.
    pub max_batch_size: usize,
    /// Maximum tokens per sequence (history plus generated).
    pub session_len: usize,
    /// Maximum tokens fed to one forward pass.
    pub max_forward_token_num: usize,
    /// Maximum prefill tokens admitted per iteration.
    pub max_context_token_num: usize,
    /// Minimum per-iteration token budget.
    pub num_tokens_per_iter: usize,
    /// A prefill is spread over at most this many iterations.
    pub max_prefill_iters: usize,
    /// Tokens per cache block.
    pub cache_block_seq_len: usize,
    /// Default rope base for new sequences.
    pub rope_theta: f32,
    pub tp_size: usize,
    pub tp_rank: usize,
    pub dp_rank: usize,
    pub device_id: usize,
    /// Handling of out-of-vocabulary ids in repetition-penalty history.
    pub invalid_token_policy: InvalidTokenPolicy,
    /// Run one throwaway forward per batch size before serving.
    pub enable_warmup: bool,
    /// Log per-slot token ids on interrupt.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 64,
            session_len: 4096,
            max_forward_token_num: 8192,
            max_context_token_num: 8192,
            num_tokens_per_iter: 0,
            max_prefill_iters: 1,
            cache_block_seq_len: 64,
            rope_theta: 10_000.0,
            tp_size: 1,
            tp_rank: 0,
            dp_rank: 0,
            device_id: 0,
            invalid_token_policy: InvalidTokenPolicy::Skip,
            enable_warmup: false,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; absent fields take their default values.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable together.
    ///
    /// # Errors
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_batch_size", self.max_batch_size),
            ("session_len", self.session_len),
            ("max_forward_token_num", self.max_forward_token_num),
            ("max_context_token_num", self.max_context_token_num),
            ("max_prefill_iters", self.max_prefill_iters),
            ("cache_block_seq_len", self.cache_block_seq_len),
            ("tp_size", self.tp_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be > 0")));
        }
        if self.session_len < 2 {
            return Err(Error::Config("session_len must be at least 2".into()));
        }
        if self.tp_rank >= self.tp_size {
            return Err(Error::Config(format!(
                "tp_rank {} out of range for tp_size {}",
                self.tp_rank, self.tp_size
            )));
        }
        // Every decoding slot needs one token of budget.
        if self.max_forward_token_num < self.max_batch_size {
            return Err(Error::Config(format!(
                "max_forward_token_num ({}) must be >= max_batch_size ({})",
                self.max_forward_token_num, self.max_batch_size
            )));
        }
        if self.max_context_token_num < self.max_batch_size {
            return Err(Error::Config(format!(
                "max_context_token_num ({}) must be >= max_batch_size ({})",
                self.max_context_token_num, self.max_batch_size
            )));
        }
        Ok(())
    }

    /// Per-iteration token ceiling: the tighter of the two budgets.
    #[must_use]
    pub fn token_ceiling(&self) -> usize {
        self.max_forward_token_num.min(self.max_context_token_num)
    }
}
