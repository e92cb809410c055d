//! Request intake: validation, kills, admission into `incoming`,
//! cancellation and slot interruption.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use turbine::signal::{complete_signal, status_signal};
use turbine::{
    Error, FinishReason, GenerationEvent, Request, RequestStatus, Result, SequenceId,
    SequenceStatus, Signal,
};

use super::Engine;
use crate::EngineBackend;

impl<B: EngineBackend> Engine<B> {
    /// Reject requests that cannot be admitted, without consuming a slot.
    ///
    /// Returns the surviving infer and kill requests.
    pub(crate) fn disable_invalid_requests(
        &mut self,
        infer: Vec<Arc<Request>>,
        kill: Vec<Arc<Request>>,
        signals: &mut Vec<Signal>,
    ) -> (Vec<Arc<Request>>, Vec<Arc<Request>>) {
        let mut occurrences: HashMap<SequenceId, usize> = HashMap::new();
        for r in &infer {
            *occurrences.entry(r.session.id).or_default() += 1;
        }
        let killed: HashSet<SequenceId> = kill.iter().map(|r| r.session.id).collect();

        let mut valid = Vec::with_capacity(infer.len());
        for request in infer {
            let status = if occurrences[&request.session.id] > 1
                || killed.contains(&request.session.id)
            {
                RequestStatus::Conflict
            } else {
                self.validate_infer(&request)
            };
            if status.is_ok() {
                valid.push(request);
            } else {
                if status != RequestStatus::Cancel {
                    tracing::warn!(
                        request = request.id,
                        session = request.session.id,
                        ?status,
                        "rejected request"
                    );
                }
                signals.push(status_signal(request, status));
            }
        }
        (valid, kill)
    }

    fn validate_infer(&self, request: &Request) -> RequestStatus {
        let session = &request.session;
        if request.is_cancelled() {
            return RequestStatus::Cancel;
        }
        if self.buffers.active().find_session(session.id).is_some()
            || self.buffers.incoming().find_session(session.id).is_some()
        {
            return RequestStatus::Busy;
        }
        if session.start_flag && session.step != 0 {
            return RequestStatus::Inconsistency;
        }
        if request.input_ids.is_empty()
            || request.gen_cfg.max_new_tokens == 0
            || !request.gen_cfg.within_limits()
        {
            return RequestStatus::Invalid;
        }
        let history = if session.start_flag {
            0
        } else {
            let Some(seq) = self.sequences.lookup(session.id) else {
                return RequestStatus::Invalid;
            };
            if session.step > seq.tokens.len() {
                return RequestStatus::Invalid;
            }
            if session.step > 0 {
                session.step
            } else {
                seq.tokens.len()
            }
        };
        if history + request.input_ids.len() >= self.config.session_len {
            return RequestStatus::TooLong;
        }
        RequestStatus::Ok
    }

    /// Terminate the sessions named by kill requests.
    ///
    /// A session generating in a slot is interrupted and its request
    /// cancelled; the sequence is erased either way.
    pub(crate) fn process_kill_requests(
        &mut self,
        kill: &[Arc<Request>],
        signals: &mut Vec<Signal>,
    ) -> Result<()> {
        for request in kill {
            let id = request.session.id;
            let status = if let Some(slot) = self.buffers.active().find_session(id) {
                signals.push(self.interrupt(slot, true, true)?);
                RequestStatus::Ok
            } else if self.sequences.erase(id) {
                RequestStatus::Ok
            } else {
                tracing::warn!(request = request.id, session = id, "kill for unknown session");
                RequestStatus::Invalid
            };
            tracing::info!(request = request.id, session = id, ?status, "kill request");
            signals.push(status_signal(Arc::clone(request), status));
        }
        Ok(())
    }

    /// Place validated requests in the `incoming` buffer.
    ///
    /// The gateway never hands out more requests than there are free slots,
    /// so every request gets one.
    pub(crate) fn process_infer_requests(
        &mut self,
        infer: Vec<Arc<Request>>,
        signals: &mut Vec<Signal>,
    ) -> Result<()> {
        let session_len = self.config.session_len;
        for request in infer {
            let occupied = self.buffers.active().size + self.buffers.incoming().size;
            if occupied >= self.config.max_batch_size {
                tracing::warn!(request = request.id, "no free slot for pulled request");
                signals.push(status_signal(request, RequestStatus::Fail));
                continue;
            }

            let session = request.session;
            let seq = if session.start_flag {
                match self.sequences.create(session.id) {
                    Ok(seq) => {
                        seq.prompt.clone_from(&request.input_ids);
                        seq
                    }
                    Err(e) => {
                        tracing::warn!(request = request.id, error = %e, "cannot create sequence");
                        signals.push(status_signal(request, RequestStatus::Fail));
                        continue;
                    }
                }
            } else {
                let Some(seq) = self.sequences.lookup_mut(session.id) else {
                    signals.push(status_signal(request, RequestStatus::Invalid));
                    continue;
                };
                if session.step > 0 {
                    seq.tokens.truncate(session.step);
                }
                seq
            };
            seq.cache_len = seq.cache_len.min(seq.tokens.len());
            seq.status = SequenceStatus::Locked;
            let rng_state = match seq.random_state {
                Some(state) if !session.start_flag => state,
                _ => request.gen_cfg.random_seed,
            };
            let rope_theta = if seq.rope_theta > 0.0 {
                seq.rope_theta
            } else {
                self.config.rope_theta
            };
            let mut row = seq.tokens.clone();
            row.extend_from_slice(&request.input_ids);

            let context_length = row.len();
            let mut limit = context_length + request.gen_cfg.max_new_tokens;
            if limit > session_len - 1 {
                tracing::warn!(
                    request = request.id,
                    requested = limit,
                    session_len,
                    "generation limit truncated to session length"
                );
                limit = session_len - 1;
            }

            let incoming = self.buffers.incoming_mut();
            let slot = incoming.size;
            incoming.size += 1;
            self.backend
                .upload(&mut incoming.output_ids, slot * session_len, &row)?;
            self.backend.upload(&mut incoming.rng_state, slot, &[rng_state])?;
            incoming.prompt_length[slot] = context_length;
            incoming.context_length[slot] = context_length;
            incoming.finished[slot] = false;
            incoming.rope_theta[slot] = rope_theta;
            incoming.seq_len_limit[slot] = limit;
            incoming.errors[slot] = RequestStatus::Ok;
            incoming.mid_prefill[slot] = false;
            incoming.sequences[slot] = Some(session.id);
            tracing::debug!(
                request = request.id,
                session = session.id,
                slot,
                context_length,
                "request admitted to incoming"
            );
            incoming.requests[slot] = Some(request);
        }
        Ok(())
    }

    /// Active slots whose request has been cancelled by its caller.
    pub(crate) fn find_canceled_indices(&self) -> Vec<usize> {
        let active = self.buffers.active();
        active
            .occupied()
            .filter(|&i| active.requests[i].as_ref().is_some_and(|r| r.is_cancelled()))
            .collect()
    }

    pub(crate) fn process_cancel_requests(
        &mut self,
        indices: &[usize],
        signals: &mut Vec<Signal>,
    ) -> Result<()> {
        for &slot in indices {
            signals.push(self.interrupt(slot, true, false)?);
        }
        Ok(())
    }

    /// Release active slot `slot` and build the signal completing its
    /// request.
    ///
    /// The sequence is erased when the request ends the session or
    /// `force_end` is set; otherwise it keeps the slot's tokens and RNG
    /// state and is unlocked for a later continuation.
    ///
    /// # Errors
    /// Returns an error if the slot is empty or its rows cannot be read.
    pub(crate) fn interrupt(
        &mut self,
        slot: usize,
        force_stop: bool,
        force_end: bool,
    ) -> Result<Signal> {
        let session_len = self.config.session_len;
        let active = self.buffers.active_mut();
        let request = active.requests[slot]
            .take()
            .ok_or_else(|| Error::Sequence(format!("interrupt of empty slot {slot}")))?;
        let context_length = active.context_length[slot];
        let prompt_length = active.prompt_length[slot].min(context_length);
        let tokens =
            self.backend
                .download::<u32>(&active.output_ids, slot * session_len, context_length)?;
        let generated = tokens[prompt_length..].to_vec();

        let event = if force_stop {
            GenerationEvent::Finished {
                reason: FinishReason::Cancelled,
                output_ids: generated,
            }
        } else if !active.errors[slot].is_ok() {
            GenerationEvent::Error(active.errors[slot])
        } else {
            let reason = if context_length >= active.seq_len_limit[slot] {
                FinishReason::Length
            } else {
                FinishReason::Stop
            };
            GenerationEvent::Finished {
                reason,
                output_ids: generated,
            }
        };

        if let Some(id) = active.sequences[slot] {
            if request.session.end_flag || force_end {
                self.sequences.erase(id);
            } else if let Some(seq) = self.sequences.lookup_mut(id) {
                let state = self.backend.download::<u64>(&active.rng_state, slot, 1)?;
                seq.random_state = state.first().copied();
                seq.cache_len = seq.cache_len.min(tokens.len());
                seq.tokens = tokens;
                self.sequences.unlock(id)?;
            }
        }

        if self.config.debug {
            let tokens = self
                .backend
                .download::<u32>(&active.output_ids, slot * session_len, context_length)?;
            tracing::debug!(slot, ?tokens, "slot tokens at interrupt");
        }
        tracing::info!(
            request = request.id,
            slot,
            force_stop,
            force_end,
            context_length,
            "slot interrupted"
        );

        active.clear_slot(slot);
        self.released += 1;
        Ok(complete_signal(request, event))
    }
}
