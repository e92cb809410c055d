//! Admission control: the per-iteration token budget and the greedy plan
//! that spends it.
//!
//! The budget is derived from a sliding window of recent prefill demand so
//! that a long prompt arriving alone is still spread over at most
//! `max_prefill_iters` iterations, while decoding sequences always get their
//! single token.

use std::collections::VecDeque;

use turbine::{EngineConfig, RequestId, Result};

/// Admission class of a candidate; lower classes are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Needs exactly one token.
    Decoding,
    /// Was partially prefilled in an earlier iteration.
    MidPrefill,
    /// Has not started its prefill.
    Fresh,
}

/// A sequence competing for this iteration's budget.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Caller-defined handle, returned unchanged in the plan.
    pub key: usize,
    pub request_id: RequestId,
    /// Tokens not yet in the cache (`context_length - cache_len`).
    pub need: usize,
    pub priority: Priority,
}

/// Outcome of [`plan`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AdmissionPlan {
    /// `(key, tokens)` of fully admitted candidates, in service order.
    pub full: Vec<(usize, usize)>,
    /// The one candidate admitted with a truncated prefill, if any.
    pub partial: Option<(usize, usize)>,
    /// Keys of candidates that stay inactive this iteration.
    pub inactive: Vec<usize>,
}

impl AdmissionPlan {
    /// Tokens fed to the model by this plan.
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.full.iter().chain(self.partial.iter()).map(|&(_, n)| n).sum()
    }
}

/// Update the demand window and return this iteration's token budget.
///
/// `pending_tokens` sums `context_length - cache_len` over all candidates;
/// `batch_size` is the number of candidates.
pub fn adjust_max_input_count(
    window: &mut VecDeque<usize>,
    config: &EngineConfig,
    pending_tokens: usize,
    batch_size: usize,
) -> usize {
    let input_count = pending_tokens
        .saturating_sub(batch_size)
        .div_ceil(config.max_prefill_iters.max(1));

    window.pop_front();
    window.push_back(input_count);
    for count in window.iter_mut() {
        *count = (*count).max(input_count);
    }

    let front = window.front().copied().unwrap_or(input_count);
    (front + batch_size)
        .max(config.num_tokens_per_iter)
        .min(config.token_ceiling())
}

/// Spend `budget` greedily: decoding candidates first, then mid-prefill,
/// then fresh ones, each class in request order.
///
/// `reserve(candidate, tokens)` must pin cache space for the admitted
/// tokens; a `false` return leaves the candidate inactive without consuming
/// budget. Only the last admitted candidate can be truncated, and at most
/// `max_active` candidates are admitted.
///
/// # Errors
/// Propagates errors returned by `reserve`.
pub fn plan<F>(
    mut candidates: Vec<Candidate>,
    budget: usize,
    max_active: usize,
    mut reserve: F,
) -> Result<AdmissionPlan>
where
    F: FnMut(&Candidate, usize) -> Result<bool>,
{
    candidates.sort_by_key(|c| (c.priority, c.request_id));

    let mut out = AdmissionPlan::default();
    let mut remaining = budget;
    for candidate in candidates {
        let admitted = out.full.len() + usize::from(out.partial.is_some());
        if remaining == 0 || admitted >= max_active || candidate.need == 0 {
            out.inactive.push(candidate.key);
            continue;
        }
        let tokens = candidate.need.min(remaining);
        if !reserve(&candidate, tokens)? {
            tracing::debug!(
                request = candidate.request_id,
                tokens,
                "cache reservation failed, sequence stays inactive"
            );
            out.inactive.push(candidate.key);
            continue;
        }
        if tokens == candidate.need {
            out.full.push((candidate.key, tokens));
            remaining -= tokens;
        } else {
            out.partial = Some((candidate.key, tokens));
            remaining = 0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(iters: usize) -> EngineConfig {
        EngineConfig {
            max_batch_size: 8,
            max_prefill_iters: iters,
            max_forward_token_num: 1024,
            max_context_token_num: 1024,
            ..EngineConfig::default()
        }
    }

    fn candidate(key: usize, request_id: RequestId, need: usize, priority: Priority) -> Candidate {
        Candidate {
            key,
            request_id,
            need,
            priority,
        }
    }

    fn always(_: &Candidate, _: usize) -> Result<bool> {
        Ok(true)
    }

    #[test]
    fn budget_spreads_a_lone_prompt() {
        let cfg = config(4);
        let mut window = VecDeque::from(vec![0; 4]);
        // 101 pending tokens for one sequence: (101 - 1) / 4 = 25
        assert_eq!(adjust_max_input_count(&mut window, &cfg, 101, 1), 26);
        assert_eq!(window, VecDeque::from(vec![25; 4]));
    }

    #[test]
    fn budget_respects_floor_and_ceiling() {
        let mut cfg = config(1);
        cfg.num_tokens_per_iter = 64;
        let mut window = VecDeque::from(vec![0]);
        assert_eq!(adjust_max_input_count(&mut window, &cfg, 4, 4), 64);

        cfg.max_context_token_num = 100;
        let mut window = VecDeque::from(vec![0]);
        assert_eq!(adjust_max_input_count(&mut window, &cfg, 5000, 2), 100);
    }

    #[test]
    fn window_keeps_recent_maximum() {
        let cfg = config(3);
        let mut window = VecDeque::from(vec![0; 3]);
        adjust_max_input_count(&mut window, &cfg, 61, 1); // 20
        let budget = adjust_max_input_count(&mut window, &cfg, 4, 1); // 1
        assert_eq!(budget, 21);
        assert_eq!(window, VecDeque::from(vec![20, 20, 1]));
    }

    #[test]
    fn plan_serves_classes_in_order() {
        let candidates = vec![
            candidate(0, 5, 40, Priority::Fresh),
            candidate(1, 9, 1, Priority::Decoding),
            candidate(2, 7, 10, Priority::MidPrefill),
            candidate(3, 2, 1, Priority::Decoding),
            candidate(4, 3, 30, Priority::Fresh),
        ];
        let plan = plan(candidates, 50, 8, always).unwrap();

        assert_eq!(plan.full, vec![(3, 1), (1, 1), (2, 10), (4, 30)]);
        assert_eq!(plan.partial, Some((0, 8)));
        assert!(plan.inactive.is_empty());
        assert_eq!(plan.tokens(), 50);
    }

    #[test]
    fn only_the_last_admission_is_partial() {
        let candidates = vec![
            candidate(0, 1, 20, Priority::Fresh),
            candidate(1, 2, 20, Priority::Fresh),
            candidate(2, 3, 1, Priority::Fresh),
        ];
        let plan = plan(candidates, 25, 8, always).unwrap();
        assert_eq!(plan.full, vec![(0, 20)]);
        assert_eq!(plan.partial, Some((1, 5)));
        assert_eq!(plan.inactive, vec![2]);
    }

    #[test]
    fn failed_reservation_leaves_budget_for_others() {
        let candidates = vec![
            candidate(0, 1, 10, Priority::Fresh),
            candidate(1, 2, 10, Priority::Fresh),
        ];
        let plan = plan(candidates, 10, 8, |c, _| Ok(c.key != 0)).unwrap();
        assert_eq!(plan.full, vec![(1, 10)]);
        assert_eq!(plan.inactive, vec![0]);
    }

    #[test]
    fn active_count_is_capped() {
        let candidates = (0..5)
            .map(|i| candidate(i, i as RequestId, 1, Priority::Decoding))
            .collect();
        let plan = plan(candidates, 100, 3, always).unwrap();
        assert_eq!(plan.full.len(), 3);
        assert_eq!(plan.inactive, vec![3, 4]);
    }

    #[test]
    fn long_prompt_finishes_within_prefill_iters() {
        // A 100-token prompt sharing the batch with three decoders.
        let cfg = config(4);
        let mut window = VecDeque::from(vec![0; 4]);
        let mut remaining = 100;
        let mut iterations = 0;
        let mut mid = false;
        while remaining > 0 {
            iterations += 1;
            let mut candidates: Vec<Candidate> = (0..3)
                .map(|i| candidate(i, i as RequestId, 1, Priority::Decoding))
                .collect();
            let priority = if mid { Priority::MidPrefill } else { Priority::Fresh };
            candidates.push(candidate(3, 10, remaining, priority));

            let pending: usize = candidates.iter().map(|c| c.need).sum();
            let budget = adjust_max_input_count(&mut window, &cfg, pending, candidates.len());
            let plan = plan(candidates, budget, 8, always).unwrap();
            assert!(plan.tokens() <= budget);

            let served = plan
                .full
                .iter()
                .chain(plan.partial.iter())
                .find(|&&(key, _)| key == 3)
                .map_or(0, |&(_, n)| n);
            remaining -= served;
            mid = true;
        }
        assert!(iterations <= 4, "took {iterations} iterations");
    }
}
