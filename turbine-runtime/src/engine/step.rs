//! One iteration over the active region: admission and compaction,
//! sampling setup, the forward step and finish detection.

use half::{bf16, f16};

use turbine::model::{
    DecodeStep, SlotSampling, BLOCK_PTRS, CONTEXT_LENGTHS, CU_BLOCK_COUNTS, HISTORY, INPUT_IDS,
    INPUT_LENGTHS, LAST_HIDDEN_STATE, LOGITS, RNG_STATE, ROPE_THETA, SAMPLED_IDS,
};
use turbine::signal::stream_signal;
use turbine::{
    Backend, DType, Error, GenerationEvent, OutputLogits, RepetitionMode, RepetitionParams,
    RequestId, RequestStatus, Result, SequenceId, SequenceManager, SequenceStatus, Signal,
    TensorMap, Temperature, MAX_END_IDS,
};

use super::Engine;
use crate::admission::{self, Candidate, Priority};
use crate::batch_state::{copy_state, SlotMove, Source};
use crate::EngineBackend;

/// Per-row sampling parameters of the active region, rebuilt whenever its
/// composition changes.
pub(super) struct SamplingBuffers<B: Backend> {
    rows: usize,
    /// f32 `[rows]`
    temperature: B::Tensor,
    /// f32 `[rows]`, present when some row uses additive repetition penalty.
    additive: Option<B::Tensor>,
    /// f32 `[rows]`, present when some row uses multiplicative penalty.
    multiplicative: Option<B::Tensor>,
    /// u32 `[rows]`: context length of each row when the history was laid
    /// out.
    input_lengths: B::Tensor,
    max_input_length: usize,
    /// u32 `[rows]`, present when some row has a minimum length.
    min_lengths: Option<B::Tensor>,
    /// u32 `[rows, MAX_END_IDS]`
    end_ids: B::Tensor,
    /// u32 `[rows]`: generated tokens so far, uploaded every step.
    sequence_lengths: B::Tensor,
    /// u32 `[rows]`: `output_ids` column each sampled token is written to.
    positions: B::Tensor,
    wants_logits: Vec<bool>,
    wants_hidden: Vec<bool>,
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Other(format!("{value} does not fit in u32")))
}

fn to_u32_vec(values: &[usize]) -> Result<Vec<u32>> {
    values.iter().map(|&v| to_u32(v)).collect()
}

/// Download `len` elements at `offset` of a float tensor as f32.
fn download_f32<B: Backend>(
    backend: &B,
    tensor: &B::Tensor,
    dtype: DType,
    offset: usize,
    len: usize,
) -> Result<Vec<f32>> {
    match dtype {
        DType::F32 => backend.download::<f32>(tensor, offset, len),
        DType::F16 => Ok(backend
            .download::<f16>(tensor, offset, len)?
            .into_iter()
            .map(f16::to_f32)
            .collect()),
        DType::BF16 => Ok(backend
            .download::<bf16>(tensor, offset, len)?
            .into_iter()
            .map(bf16::to_f32)
            .collect()),
        other => Err(Error::UnsupportedDtype(other)),
    }
}

/// Reserve cache for `tokens` more inputs of `id` and record them on the
/// sequence. Returns the block pointers, or `None` if the pool is full.
fn admit_sequence(
    sequences: &mut dyn SequenceManager,
    id: SequenceId,
    cache_len: usize,
    tokens: usize,
) -> Result<Option<Vec<u64>>> {
    if !sequences.reserve(id, cache_len + tokens)? {
        return Ok(None);
    }
    let ptrs = sequences.block_ptrs(id)?;
    let seq = sequences
        .lookup_mut(id)
        .ok_or_else(|| Error::Sequence(format!("sequence {id} vanished")))?;
    seq.cache_len = cache_len;
    seq.input_length = tokens;
    Ok(Some(ptrs))
}

impl<B: EngineBackend> Engine<B> {
    /// Decide which sequences run this iteration and lay them out in the
    /// active buffer.
    ///
    /// A slot whose sequence fails in the manager is completed with
    /// [`RequestStatus::Fail`] and its signal pushed to `signals`; the other
    /// slots are unaffected. When no candidate can reserve cache space the
    /// youngest one holding blocks is preempted, or failed if nothing is
    /// left to preempt.
    ///
    /// # Errors
    /// Returns an error if a device copy fails.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn initialize(&mut self, signals: &mut Vec<Signal>) -> Result<()> {
        let mut slots: Vec<(Source, usize)> = Vec::new();
        let mut candidates = Vec::new();
        let mut cache_lens = Vec::new();
        let mut sessions = Vec::new();
        let mut request_ids = Vec::new();
        let mut failed = Vec::new();
        for (source, state) in [
            (Source::Active, self.buffers.active()),
            (Source::Incoming, self.buffers.incoming()),
        ] {
            for slot in state.occupied() {
                let (Some(id), Some(request)) = (state.sequences[slot], &state.requests[slot])
                else {
                    continue;
                };
                let key = slots.len();
                slots.push((source, slot));
                sessions.push(id);
                request_ids.push(request.id);
                let Some(seq) = self.sequences.lookup(id) else {
                    tracing::warn!(sequence = id, request = request.id, "sequence vanished");
                    cache_lens.push(0);
                    failed.push(key);
                    continue;
                };
                let context_length = state.context_length[slot];
                let cache_len = seq.cache_len.min(context_length.saturating_sub(1));
                let need = context_length - cache_len;
                let priority = if need <= 1 {
                    Priority::Decoding
                } else if state.mid_prefill[slot] {
                    Priority::MidPrefill
                } else {
                    Priority::Fresh
                };
                candidates.push(Candidate {
                    key,
                    request_id: request.id,
                    need,
                    priority,
                });
                cache_lens.push(cache_len);
            }
        }

        let pending: usize = candidates.iter().map(|c| c.need).sum();
        let budget = admission::adjust_max_input_count(
            &mut self.generation.min_input_count,
            &self.config,
            pending,
            candidates.len(),
        );
        let sequences = self.sequences.as_mut();
        let mut block_ptrs: Vec<Vec<u64>> = vec![Vec::new(); slots.len()];
        let plan = admission::plan(
            candidates,
            budget,
            self.config.max_batch_size,
            |c, tokens| {
                let id = sessions[c.key];
                match admit_sequence(sequences, id, cache_lens[c.key], tokens) {
                    Ok(Some(ptrs)) => {
                        block_ptrs[c.key] = ptrs;
                        Ok(true)
                    }
                    Ok(None) => Ok(false),
                    Err(e) => {
                        tracing::warn!(
                            sequence = id,
                            request = c.request_id,
                            error = %e,
                            "sequence failed during admission"
                        );
                        failed.push(c.key);
                        Ok(false)
                    }
                }
            },
        )?;
        tracing::debug!(
            budget,
            full = plan.full.len(),
            partial = plan.partial.is_some(),
            inactive = plan.inactive.len(),
            failed = failed.len(),
            tokens = plan.tokens(),
            "admission"
        );

        // Previously active slots keep their relative order, swap-ins follow
        // by ascending input length.
        let (mut full, mut swap_ins): (Vec<_>, Vec<_>) = plan
            .full
            .iter()
            .copied()
            .partition(|&(key, _)| slots[key].0 == Source::Active);
        full.sort_by_key(|&(key, _)| slots[key].1);
        swap_ins.sort_by_key(|&(key, tokens)| (tokens, slots[key].1));
        full.extend(swap_ins);
        let admitted: Vec<(usize, usize)> = full.into_iter().chain(plan.partial).collect();

        let mut inactive: Vec<usize> = plan
            .inactive
            .iter()
            .copied()
            .filter(|key| !failed.contains(key))
            .collect();
        if admitted.is_empty() && failed.is_empty() && !inactive.is_empty() {
            if let Some(key) = self.relieve_cache_pressure(&inactive, &sessions, &request_ids) {
                inactive.retain(|&k| k != key);
                failed.push(key);
            }
        }
        inactive.sort_by_key(|&key| (slots[key].0 == Source::Incoming, slots[key].1));
        let first_failed = admitted.len() + inactive.len();
        let order: Vec<usize> = admitted
            .iter()
            .map(|&(key, _)| key)
            .chain(inactive)
            .chain(failed.iter().copied())
            .collect();

        let moves: Vec<SlotMove> = order
            .iter()
            .enumerate()
            .map(|(dst, &key)| SlotMove {
                source: slots[key].0,
                src: slots[key].1,
                dst,
            })
            .collect();
        let identity = self.buffers.incoming().size == 0
            && moves.len() == self.buffers.active().size
            && moves
                .iter()
                .enumerate()
                .all(|(i, m)| m.source == Source::Active && m.src == i);
        if !identity {
            tracing::debug!(slots = moves.len(), "compacting batch");
            copy_state(&self.backend, &mut self.buffers, &moves)?;
            self.buffers.roles().back.size = moves.len();
            self.buffers.swap_active_back();
            let roles = self.buffers.roles();
            roles.back.clear();
            roles.incoming.clear();
        }

        // Per-slot admission results, now in active slot order.
        let g = &mut self.generation;
        let active = self.buffers.active_mut();
        active.active_size = admitted.len();
        g.partial = usize::from(plan.partial.is_some());
        active.mid_prefill[..admitted.len()].fill(false);
        if let Some((key, tokens)) = plan.partial {
            let slot = admitted.len() - 1;
            active.mid_prefill[slot] = true;
            g.partial_context_length = active.context_length[slot];
            active.context_length[slot] = cache_lens[key] + tokens;
        }

        let mut table = super::BlockTable::default();
        table.cu_block_counts.push(0);
        for &(key, _) in &admitted {
            table.block_ptrs.append(&mut block_ptrs[key]);
            table.cu_block_counts.push(to_u32(table.block_ptrs.len())?);
        }
        self.blocks = table;

        let sampling_rows = g.sampling_rows(active.active_size);
        let unique_ids: Vec<u64> = active.requests[..sampling_rows]
            .iter()
            .map(|r| r.as_ref().map_or(0, |r| r.id))
            .collect();
        g.skip_init_sampling = !unique_ids.is_empty()
            && unique_ids == g.unique_ids
            && self
                .sampling
                .as_ref()
                .is_some_and(|s| s.rows == active.active_size);
        g.unique_ids = unique_ids;
        if !g.skip_init_sampling && active.active_size > 0 {
            let max_ctx = active.context_length[..active.active_size]
                .iter()
                .copied()
                .max()
                .unwrap_or(0);
            g.step = max_ctx;
            g.max_init_ctx_len = max_ctx;
            self.initialize_sampling()?;
        }

        for slot in first_failed..first_failed + failed.len() {
            self.buffers.active_mut().errors[slot] = RequestStatus::Fail;
            signals.push(self.interrupt(slot, false, true)?);
        }
        Ok(())
    }

    /// Free cache space when no candidate could reserve any. Preempts the
    /// youngest inactive sequence that still pins blocks; its cache is
    /// recomputed once it is admitted again. Returns the key of the
    /// candidate to fail when nothing pins blocks, or when it is the only
    /// candidate.
    fn relieve_cache_pressure(
        &mut self,
        inactive: &[usize],
        sessions: &[SequenceId],
        request_ids: &[RequestId],
    ) -> Option<usize> {
        let pinned = inactive
            .iter()
            .copied()
            .filter(|&key| {
                self.sequences
                    .lookup(sessions[key])
                    .is_some_and(|s| s.status != SequenceStatus::Cached && !s.blocks.is_empty())
            })
            .max_by_key(|&key| request_ids[key]);
        if let (Some(key), true) = (pinned, inactive.len() > 1) {
            let id = sessions[key];
            match self.sequences.unlock(id) {
                Ok(()) => {
                    if let Some(seq) = self.sequences.lookup_mut(id) {
                        seq.cache_len = 0;
                    }
                    tracing::info!(
                        sequence = id,
                        request = request_ids[key],
                        "cache pool exhausted, preempting sequence"
                    );
                    return None;
                }
                Err(e) => {
                    tracing::warn!(sequence = id, error = %e, "sequence failed during preemption");
                    return Some(key);
                }
            }
        }
        let key = inactive
            .iter()
            .copied()
            .max_by_key(|&key| request_ids[key])?;
        tracing::warn!(
            sequence = sessions[key],
            request = request_ids[key],
            free_blocks = self.sequences.free_blocks(),
            "cache pool cannot hold sequence, failing request"
        );
        Some(key)
    }

    /// Upload the per-row sampling parameters of the active region, lay out
    /// its history and configure the sampler.
    ///
    /// # Errors
    /// Returns an error if an upload fails or the sampler rejects the
    /// parameters.
    pub(crate) fn initialize_sampling(&mut self) -> Result<()> {
        let active = self.buffers.active();
        let rows = active.active_size;
        let mut temperature = Vec::with_capacity(rows);
        let mut additive = Vec::with_capacity(rows);
        let mut multiplicative = Vec::with_capacity(rows);
        let mut min_lengths = Vec::with_capacity(rows);
        let mut end_ids = vec![0u32; rows * MAX_END_IDS];
        let mut slots = Vec::with_capacity(rows);
        let mut wants_logits = Vec::with_capacity(rows);
        let mut wants_hidden = Vec::with_capacity(rows);
        for (i, request) in active.requests[..rows].iter().enumerate() {
            let request = request
                .as_ref()
                .ok_or_else(|| Error::Sequence(format!("active slot {i} is empty")))?;
            let cfg = &request.gen_cfg;
            temperature.push(cfg.temperature);
            additive.push(match cfg.repetition_mode {
                RepetitionMode::Additive => cfg.repetition_penalty,
                _ => 0.0,
            });
            multiplicative.push(match cfg.repetition_mode {
                RepetitionMode::Multiplicative => cfg.repetition_penalty,
                _ => 1.0,
            });
            min_lengths.push(to_u32(cfg.min_new_tokens)?);
            for (dst, &id) in end_ids[i * MAX_END_IDS..].iter_mut().zip(&cfg.end_ids) {
                *dst = id;
            }
            slots.push(SlotSampling {
                top_k: cfg.top_k,
                top_p: cfg.top_p,
                min_p: cfg.min_p,
                bad_ids: cfg.bad_ids.clone(),
            });
            wants_logits.push(cfg.output_logits == OutputLogits::Generation);
            wants_hidden.push(cfg.output_last_hidden_state);
        }

        let uses = |mode: RepetitionMode| {
            active.requests[..rows]
                .iter()
                .flatten()
                .any(|r| r.gen_cfg.repetition_mode == mode)
        };
        let backend = &self.backend;
        let sampling = SamplingBuffers {
            rows,
            temperature: backend.from_slice(&[rows], &temperature)?,
            additive: if uses(RepetitionMode::Additive) {
                Some(backend.from_slice(&[rows], &additive)?)
            } else {
                None
            },
            multiplicative: if uses(RepetitionMode::Multiplicative) {
                Some(backend.from_slice(&[rows], &multiplicative)?)
            } else {
                None
            },
            input_lengths: backend
                .from_slice(&[rows], &to_u32_vec(&active.context_length[..rows])?)?,
            max_input_length: self.generation.max_init_ctx_len,
            min_lengths: if min_lengths.iter().any(|&m| m > 0) {
                Some(backend.from_slice(&[rows], &min_lengths)?)
            } else {
                None
            },
            end_ids: backend.from_slice(&[rows, MAX_END_IDS], &end_ids)?,
            sequence_lengths: backend.zeros(&[rows], DType::U32)?,
            positions: backend.zeros(&[rows], DType::U32)?,
            wants_logits,
            wants_hidden,
        };

        backend.transpose_history(
            &active.output_ids,
            &mut self.history,
            rows,
            self.generation.step,
        )?;
        self.decode.setup(backend, &slots)?;
        tracing::debug!(rows, step = self.generation.step, "sampling initialized");
        self.sampling = Some(sampling);
        Ok(())
    }

    /// Run the model, the penalty kernels and the sampler over the active
    /// region, and append the sampled tokens.
    ///
    /// # Errors
    /// Returns any model, kernel or sampler error.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn forward(&mut self) -> Result<()> {
        let session_len = self.config.session_len;
        let vocab_size = self.model.vocab_size();
        let padded_vocab = self.model.padded_vocab_size();
        let logits_dtype = self.model.logits_dtype();
        let g = &mut self.generation;
        let active = self.buffers.active_mut();
        let rows = active.active_size;
        let sampling_rows = g.sampling_rows(rows);
        let sampling = self
            .sampling
            .as_mut()
            .ok_or_else(|| Error::Other("forward before sampling setup".into()))?;
        let comm = self
            .comm
            .as_mut()
            .ok_or_else(|| Error::Other("comm buffers not allocated".into()))?;

        // Inputs
        let mut input_ids = Vec::new();
        let mut input_lengths = Vec::with_capacity(rows);
        let mut context_lengths = Vec::with_capacity(rows);
        for slot in 0..rows {
            let id = active.sequences[slot]
                .ok_or_else(|| Error::Sequence(format!("active slot {slot} has no sequence")))?;
            let seq = self
                .sequences
                .lookup_mut(id)
                .ok_or_else(|| Error::Sequence(format!("sequence {id} vanished")))?;
            let (cache_len, len) = (seq.cache_len, seq.input_length);
            input_ids.extend(self.backend.download::<u32>(
                &active.output_ids,
                slot * session_len + cache_len,
                len,
            )?);
            input_lengths.push(len);
            context_lengths.push(cache_len + len);
            seq.cache_len = cache_len + len;
        }
        let backend = &self.backend;
        let input_ids = backend.from_slice(&[input_ids.len()], &input_ids)?;
        let input_lengths = backend.from_slice(&[rows], &to_u32_vec(&input_lengths)?)?;
        let context_lengths_t = backend.from_slice(&[rows], &to_u32_vec(&context_lengths)?)?;
        let cu_block_counts =
            backend.from_slice(&[rows + 1], &self.blocks.cu_block_counts)?;
        let block_ptrs =
            backend.from_slice(&[self.blocks.block_ptrs.len()], &self.blocks.block_ptrs)?;
        let rope_theta = backend.from_slice(&[rows], &active.rope_theta[..rows])?;

        let mut logits = backend.zeros(&[rows, padded_vocab], logits_dtype)?;
        let wants_hidden = sampling.wants_hidden[..sampling_rows].iter().any(|&w| w);
        let mut hidden = if wants_hidden {
            Some(backend.zeros(&[rows, self.model.hidden_size()], logits_dtype)?)
        } else {
            None
        };
        {
            let mut inputs = TensorMap::new();
            inputs
                .insert(INPUT_IDS, &input_ids)
                .insert(INPUT_LENGTHS, &input_lengths)
                .insert(CONTEXT_LENGTHS, &context_lengths_t)
                .insert(CU_BLOCK_COUNTS, &cu_block_counts)
                .insert(BLOCK_PTRS, &block_ptrs)
                .insert(ROPE_THETA, &rope_theta);
            let mut outputs = TensorMap::new();
            outputs.insert_mut(LOGITS, &mut logits);
            if let Some(hidden) = hidden.as_mut() {
                outputs.insert_mut(LAST_HIDDEN_STATE, hidden);
            }
            self.model.forward(backend, &inputs, &mut outputs)?;
        }

        if g.partial == 1 {
            active.context_length[rows - 1] = g.partial_context_length;
        }

        // Penalties
        backend.apply_temperature(
            &mut logits,
            None,
            Temperature::PerRow(&sampling.temperature),
            vocab_size,
        )?;
        for (mode, penalties) in [
            (RepetitionMode::Additive, &sampling.additive),
            (RepetitionMode::Multiplicative, &sampling.multiplicative),
        ] {
            if let Some(penalties) = penalties {
                backend.apply_repetition_penalty(
                    &mut logits,
                    penalties,
                    &self.history,
                    Some(&sampling.input_lengths),
                    RepetitionParams {
                        vocab_size,
                        step: g.step,
                        history_stride: rows,
                        max_input_length: sampling.max_input_length,
                        mode,
                        policy: self.config.invalid_token_policy,
                    },
                )?;
            }
        }
        if let Some(min_lengths) = &sampling.min_lengths {
            let generated: Vec<usize> = (0..rows)
                .map(|i| active.context_length[i] - active.prompt_length[i].min(active.context_length[i]))
                .collect();
            backend.upload(&mut sampling.sequence_lengths, 0, &to_u32_vec(&generated)?)?;
            backend.apply_min_length_penalty(
                &mut logits,
                min_lengths,
                &sampling.sequence_lengths,
                &sampling.end_ids,
                vocab_size,
            )?;
        }

        self.captured.clear();
        if sampling_rows == 0 {
            return Ok(());
        }

        // Sampling
        {
            let mut inputs = TensorMap::new();
            inputs.insert(LOGITS, &logits).insert(HISTORY, &self.history);
            let mut outputs = TensorMap::new();
            outputs
                .insert_mut(SAMPLED_IDS, &mut comm.sampled_ids)
                .insert_mut(RNG_STATE, &mut active.rng_state);
            self.decode.forward(
                backend,
                DecodeStep {
                    step: g.step,
                    batch_size: sampling_rows,
                    history_stride: rows,
                    vocab_size,
                },
                &inputs,
                &mut outputs,
            )?;
        }
        if self.config.tp_size > 1 {
            backend.broadcast_comm_buffer(&mut comm.sampled_ids, 0)?;
        }

        backend.upload(
            &mut sampling.positions,
            0,
            &to_u32_vec(&active.context_length[..sampling_rows])?,
        )?;
        backend.append_tokens(
            &comm.sampled_ids,
            &sampling.positions,
            sampling_rows,
            rows,
            g.step,
            &mut self.history,
            &mut active.output_ids,
        )?;
        for ctx in &mut active.context_length[..sampling_rows] {
            *ctx += 1;
        }
        g.step += 1;

        for slot in 0..sampling_rows {
            if sampling.wants_logits[slot] {
                let row = download_f32(
                    backend,
                    &logits,
                    logits_dtype,
                    slot * padded_vocab,
                    vocab_size,
                )?;
                self.captured.push((slot, GenerationEvent::Logits(row)));
            }
            if let (true, Some(hidden)) = (sampling.wants_hidden[slot], hidden.as_ref()) {
                let width = self.model.hidden_size();
                let row = download_f32(backend, hidden, logits_dtype, slot * width, width)?;
                self.captured.push((slot, GenerationEvent::HiddenState(row)));
            }
        }
        Ok(())
    }

    /// Detect finished slots, stream tokens and interrupt the finished ones.
    ///
    /// # Errors
    /// Returns an error if the device cannot be synchronized or read.
    pub(crate) fn finish(&mut self, signals: &mut Vec<Signal>) -> Result<()> {
        self.backend.synchronize()?;
        let session_len = self.config.session_len;
        let active = self.buffers.active_mut();
        let sampling_rows = self.generation.sampling_rows(active.active_size);
        if sampling_rows == 0 {
            return Ok(());
        }
        let comm = self
            .comm
            .as_ref()
            .ok_or_else(|| Error::Other("comm buffers not allocated".into()))?;
        let sampled = self
            .backend
            .download::<u32>(&comm.sampled_ids, 0, sampling_rows)?;

        for (slot, event) in self.captured.drain(..) {
            if let Some(request) = &active.requests[slot] {
                signals.push(stream_signal(request.clone(), event));
            }
        }

        for (slot, &token) in sampled.iter().enumerate() {
            let Some(request) = active.requests[slot].clone() else {
                continue;
            };
            let cfg = &request.gen_cfg;
            let mut finished = false;
            if cfg.is_end_id(token) {
                // The end id stays out of the output.
                active.context_length[slot] -= 1;
                finished = true;
            } else {
                if request.stream_output {
                    signals.push(stream_signal(request.clone(), GenerationEvent::Token(token)));
                }
                let ctx = active.context_length[slot];
                if ctx >= active.seq_len_limit[slot] {
                    finished = true;
                } else if !cfg.stop_ids.is_empty() {
                    let longest = cfg.stop_ids.iter().map(Vec::len).max().unwrap_or(0);
                    let start = ctx
                        .saturating_sub(longest)
                        .max(active.prompt_length[slot]);
                    let tail = self.backend.download::<u32>(
                        &active.output_ids,
                        slot * session_len + start,
                        ctx - start,
                    )?;
                    finished = finished || cfg.matches_stop(&tail);
                }
            }
            active.finished[slot] = finished;
        }

        let done: Vec<usize> = (0..sampling_rows)
            .filter(|&slot| active.finished[slot])
            .collect();
        for slot in done {
            signals.push(self.interrupt(slot, false, false)?);
            self.generation.finished_count += 1;
        }
        Ok(())
    }
}
