//! Host logit penalty kernels.
//!
//! Rows are processed in parallel with rayon. Temperature scaling picks a
//! lane width per row at runtime: 4 or 2 contiguous columns when the padded
//! width and the row's address allow it, otherwise the scalar loop. Each
//! lane computes in f32 exactly like the scalar loop, so both paths produce
//! identical results.

#![allow(clippy::cast_possible_truncation)]

use rayon::prelude::*;

use turbine::dtype::LogitDType;
use turbine::penalty::{
    is_padding_position, needs_min_length_mask, penalized_logit, scaled_logit,
    InvalidTokenPolicy, RepetitionParams,
};
use turbine::{Error, Result};

/// Temperature source for [`apply_temperature`].
#[derive(Debug, Clone, Copy)]
pub enum RowTemperature<'a> {
    Scalar(f32),
    PerRow(&'a [f32]),
}

impl RowTemperature<'_> {
    fn get(self, row: usize) -> f32 {
        match self {
            Self::Scalar(t) => t,
            Self::PerRow(ts) => ts[row],
        }
    }
}

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

/// Scale `[rows, padded_vocab]` logits in place.
///
/// # Errors
/// Returns an error if the buffer sizes disagree with `padded_vocab`.
pub fn apply_temperature<T: LogitDType>(
    logits: &mut [T],
    padded_vocab: usize,
    vocab_size: usize,
    bias: Option<&[T]>,
    temperature: RowTemperature<'_>,
) -> Result<()> {
    let rows = check_rows(logits.len(), padded_vocab)?;
    if vocab_size > padded_vocab {
        return Err(Error::InvalidShape(format!(
            "vocab_size {vocab_size} exceeds padded width {padded_vocab}"
        )));
    }
    if let Some(b) = bias {
        if b.len() < vocab_size {
            return Err(Error::InvalidShape(format!(
                "bias has {} entries, vocab_size is {vocab_size}",
                b.len()
            )));
        }
    }
    if let RowTemperature::PerRow(ts) = temperature {
        if ts.len() < rows {
            return Err(Error::InvalidShape(format!(
                "{} temperatures for {rows} rows",
                ts.len()
            )));
        }
    }

    logits
        .par_chunks_mut(padded_vocab)
        .enumerate()
        .for_each(|(row, values)| {
            let t = temperature.get(row);
            match vector_width(values) {
                4 => scale_row_vectorized::<T, 4>(values, vocab_size, bias, t),
                2 => scale_row_vectorized::<T, 2>(values, vocab_size, bias, t),
                _ => scale_row_scalar(values, vocab_size, bias, t),
            }
        });
    Ok(())
}

/// Widest lane count (4, 2, or 1) usable for this row.
#[must_use]
pub fn vector_width<T>(row: &[T]) -> usize {
    let addr = row.as_ptr() as usize;
    let elem = std::mem::size_of::<T>();
    [4, 2]
        .into_iter()
        .find(|&w| row.len() % w == 0 && addr % (w * elem) == 0)
        .unwrap_or(1)
}

/// One column at a time.
pub fn scale_row_scalar<T: LogitDType>(row: &mut [T], vocab_size: usize, bias: Option<&[T]>, t: f32) {
    for (v, x) in row.iter_mut().enumerate() {
        *x = if v < vocab_size {
            let b = bias.map_or(0.0, |b| b[v].to_f32());
            T::from_f32(scaled_logit(x.to_f32(), b, t))
        } else {
            T::MIN_FINITE
        };
    }
}

/// `W` contiguous columns per load/store.
///
/// # Panics
/// Panics if the row length is not a multiple of `W`.
pub fn scale_row_vectorized<T: LogitDType, const W: usize>(
    row: &mut [T],
    vocab_size: usize,
    bias: Option<&[T]>,
    t: f32,
) {
    assert_eq!(row.len() % W, 0, "row width not divisible by {W}");
    for (chunk_idx, chunk) in row.chunks_exact_mut(W).enumerate() {
        let base = chunk_idx * W;
        let mut lanes = [0.0f32; W];
        for (lane, x) in lanes.iter_mut().zip(chunk.iter()) {
            *lane = x.to_f32();
        }
        let mut out = [T::MIN_FINITE; W];
        for (l, o) in out.iter_mut().enumerate() {
            let v = base + l;
            if v < vocab_size {
                let b = bias.map_or(0.0, |b| b[v].to_f32());
                *o = T::from_f32(scaled_logit(lanes[l], b, t));
            }
        }
        chunk.copy_from_slice(&out);
    }
}

// ---------------------------------------------------------------------------
// Repetition penalty
// ---------------------------------------------------------------------------

/// Penalize, once per distinct id, every token present in each row's
/// history. `history[pos * history_stride + row]`.
///
/// # Errors
/// Returns an error for undersized buffers, or [`Error::InvalidTokenId`]
/// under [`InvalidTokenPolicy::Reject`] (in which case nothing is modified).
pub fn apply_repetition_penalty<T: LogitDType>(
    logits: &mut [T],
    padded_vocab: usize,
    penalties: &[f32],
    history: &[u32],
    input_lengths: Option<&[u32]>,
    params: RepetitionParams,
) -> Result<()> {
    let rows = check_rows(logits.len(), padded_vocab)?;
    if penalties.len() < rows {
        return Err(Error::InvalidShape(format!(
            "{} penalties for {rows} rows",
            penalties.len()
        )));
    }
    if rows > params.history_stride || history.len() < params.step * params.history_stride {
        return Err(Error::InvalidShape(format!(
            "history of {} entries cannot hold {} steps of stride {} for {rows} rows",
            history.len(),
            params.step,
            params.history_stride
        )));
    }
    let input_length = |row: usize| {
        input_lengths.map_or(params.max_input_length, |l| l[row] as usize)
    };
    let positions = |row: usize| {
        let len = input_length(row);
        (0..params.step)
            .filter(move |&pos| !is_padding_position(pos, len, params.max_input_length))
            .map(move |pos| (pos, history[pos * params.history_stride + row]))
    };

    if params.policy == InvalidTokenPolicy::Reject {
        for row in 0..rows {
            if let Some((position, token)) =
                positions(row).find(|&(_, t)| t as usize >= params.vocab_size)
            {
                return Err(Error::InvalidTokenId {
                    token,
                    row,
                    position,
                    vocab_size: params.vocab_size,
                });
            }
        }
    }

    logits
        .par_chunks_mut(padded_vocab)
        .enumerate()
        .for_each(|(row, values)| {
            let penalty = penalties[row];
            // Read everything from the unmodified row first so an id seen
            // twice is penalized once.
            let updates: Vec<(usize, T)> = positions(row)
                .map(|(_, token)| token as usize)
                .filter(|&token| token < params.vocab_size)
                .map(|token| {
                    let value = penalized_logit(values[token].to_f32(), penalty, params.mode);
                    (token, T::from_f32(value))
                })
                .collect();
            for (token, value) in updates {
                values[token] = value;
            }
        });
    Ok(())
}

// ---------------------------------------------------------------------------
// Minimum length
// ---------------------------------------------------------------------------

/// Mask every configured end id of rows that are still below their minimum
/// length. `end_ids[row * end_ids_size + k]`; zero entries are unset.
///
/// # Errors
/// Returns an error for undersized buffers.
pub fn apply_min_length_penalty<T: LogitDType>(
    logits: &mut [T],
    padded_vocab: usize,
    vocab_size: usize,
    min_lengths: &[u32],
    sequence_lengths: &[u32],
    end_ids: &[u32],
) -> Result<()> {
    let rows = check_rows(logits.len(), padded_vocab)?;
    if min_lengths.len() < rows || sequence_lengths.len() < rows {
        return Err(Error::InvalidShape(format!(
            "length arrays shorter than {rows} rows"
        )));
    }
    if rows == 0 {
        return Ok(());
    }
    if end_ids.len() % rows != 0 {
        return Err(Error::InvalidShape(format!(
            "{} end ids do not split into {rows} rows",
            end_ids.len()
        )));
    }
    let end_ids_size = end_ids.len() / rows;

    for (row, values) in logits.chunks_mut(padded_vocab).enumerate() {
        if !needs_min_length_mask(sequence_lengths[row], min_lengths[row]) {
            continue;
        }
        for &end_id in &end_ids[row * end_ids_size..(row + 1) * end_ids_size] {
            let id = end_id as usize;
            if end_id > 0 && id < vocab_size {
                values[id] = T::MIN_FINITE;
            }
        }
    }
    Ok(())
}

fn check_rows(len: usize, padded_vocab: usize) -> Result<usize> {
    if padded_vocab == 0 || len % padded_vocab != 0 {
        return Err(Error::InvalidShape(format!(
            "{len} logits do not split into rows of {padded_vocab}"
        )));
    }
    Ok(len / padded_vocab)
}
