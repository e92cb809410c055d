//! Per-request generation configuration

use serde::{Deserialize, Serialize};

use crate::penalty::RepetitionMode;

/// Maximum number of end-of-sequence ids per request.
pub const MAX_END_IDS: usize = 32;

/// Maximum total number of tokens across a request's stop-word list, and
/// separately across its bad-word list.
pub const MAX_STOP_BAD_WORDS_LEN: usize = 32;

/// Which logits a request wants returned alongside its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLogits {
    #[default]
    None,
    /// The post-penalty logits of every generated token.
    Generation,
}

/// Sampling and stopping parameters of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: usize,
    /// End ids are masked until this many tokens have been generated.
    pub min_new_tokens: usize,
    /// Temperature for logit scaling. Zero gives greedy decoding.
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens (0 disables).
    pub top_k: u32,
    /// Nucleus probability threshold in (0, 1].
    pub top_p: f32,
    /// Drop tokens whose probability is below `min_p` times the maximum.
    pub min_p: f32,
    pub repetition_penalty: f32,
    pub repetition_mode: RepetitionMode,
    /// Token sequences that end generation when produced.
    pub stop_ids: Vec<Vec<u32>>,
    /// Token sequences that may never be produced.
    pub bad_ids: Vec<Vec<u32>>,
    /// End-of-sequence ids. Ids of 0 are treated as unset.
    pub end_ids: Vec<u32>,
    /// Seed for the slot's PRNG when a new sequence starts.
    pub random_seed: u64,
    pub output_logits: OutputLogits,
    pub output_last_hidden_state: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            min_new_tokens: 0,
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
            min_p: 0.0,
            repetition_penalty: 1.0,
            repetition_mode: RepetitionMode::None,
            stop_ids: Vec::new(),
            bad_ids: Vec::new(),
            end_ids: Vec::new(),
            random_seed: 0,
            output_logits: OutputLogits::None,
            output_last_hidden_state: false,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding limited to `max_new_tokens`, stopping at `end_id`.
    #[must_use]
    pub fn greedy(max_new_tokens: usize, end_id: u32) -> Self {
        Self {
            max_new_tokens,
            end_ids: vec![end_id],
            ..Self::default()
        }
    }

    /// Whether the end ids and word lists fit the fixed per-slot limits.
    #[must_use]
    pub fn within_limits(&self) -> bool {
        let words = |lists: &[Vec<u32>]| lists.iter().map(Vec::len).sum::<usize>();
        self.end_ids.len() <= MAX_END_IDS
            && words(&self.stop_ids) <= MAX_STOP_BAD_WORDS_LEN
            && words(&self.bad_ids) <= MAX_STOP_BAD_WORDS_LEN
    }

    /// Whether `token` is one of the configured end ids.
    #[must_use]
    pub fn is_end_id(&self, token: u32) -> bool {
        self.end_ids.iter().any(|&e| e > 0 && e == token)
    }

    /// Whether `generated` currently ends with one of the stop sequences.
    #[must_use]
    pub fn matches_stop(&self, generated: &[u32]) -> bool {
        self.stop_ids
            .iter()
            .any(|stop| !stop.is_empty() && generated.ends_with(stop))
    }
}
