//! Logit penalty parameters shared by every backend.
//!
//! The formulas live here as small inline functions so the host kernels and
//! the tests agree on a single definition. Device kernels implement the same
//! arithmetic: everything is computed in f32 and rounded once on store.

use serde::{Deserialize, Serialize};

/// Added to the temperature before dividing.
pub const TEMPERATURE_EPSILON: f32 = 1e-6;

/// Temperature applied by a single kernel call.
pub enum Temperature<'a, T> {
    /// One temperature for every row.
    Scalar(f32),
    /// One f32 temperature per row, shape `[rows]`.
    PerRow(&'a T),
}

impl<T> Clone for Temperature<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Temperature<'_, T> {}

/// How the repetition penalty modifies a previously emitted token's logit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepetitionMode {
    /// No penalty; the kernel is not invoked.
    #[default]
    None,
    /// `logit - penalty`
    Additive,
    /// `logit * penalty` for negative logits, `logit / penalty` otherwise.
    Multiplicative,
}

/// What to do with history ids at or beyond the vocabulary size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTokenPolicy {
    /// Ignore the id; no logit is touched.
    #[default]
    Skip,
    /// Fail the call before any logit is modified.
    Reject,
}

/// Scalar arguments of a repetition-penalty call.
#[derive(Debug, Clone, Copy)]
pub struct RepetitionParams {
    /// Real vocabulary size; ids `>= vocab_size` are invalid.
    pub vocab_size: usize,
    /// Number of history positions to scan.
    pub step: usize,
    /// Distance between consecutive positions of one row in the history
    /// buffer (the batch width the history was laid out with).
    pub history_stride: usize,
    /// Positions `input_length <= p < max_input_length` are prompt padding.
    pub max_input_length: usize,
    pub mode: RepetitionMode,
    pub policy: InvalidTokenPolicy,
}

/// `(logit + bias) / (temperature + eps)`
#[inline]
#[must_use]
pub fn scaled_logit(logit: f32, bias: f32, temperature: f32) -> f32 {
    (logit + bias) / (temperature + TEMPERATURE_EPSILON)
}

/// Penalized value of a logit whose token already appeared in the history.
#[inline]
#[must_use]
pub fn penalized_logit(logit: f32, penalty: f32, mode: RepetitionMode) -> f32 {
    match mode {
        RepetitionMode::None => logit,
        RepetitionMode::Additive => logit - penalty,
        RepetitionMode::Multiplicative => {
            if logit < 0.0 {
                logit * penalty
            } else {
                logit / penalty
            }
        }
    }
}

/// Whether history position `pos` is interior prompt padding for a row
/// whose prompt has `input_length` tokens.
#[inline]
#[must_use]
pub fn is_padding_position(pos: usize, input_length: usize, max_input_length: usize) -> bool {
    pos >= input_length && pos < max_input_length
}

/// Whether the end ids of a row must be masked before sampling the next
/// token. `sequence_length` counts the tokens generated so far.
#[inline]
#[must_use]
pub fn needs_min_length_mask(sequence_length: u32, min_length: u32) -> bool {
    sequence_length + 1 < min_length
}
