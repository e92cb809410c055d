//! Slot release accounting.
//!
//! A slot interrupted in some iteration is cleared immediately, but the
//! request it held is only finished once the output loop has invoked its
//! signal. Until then the slot counts as outstanding and may not be handed
//! to a new request.

use std::collections::VecDeque;

/// Outstanding slot releases grouped by delivery epoch.
#[derive(Debug, Default)]
pub struct ReleaseLedger {
    pending: VecDeque<(u64, usize)>,
}

impl ReleaseLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `slots` releases whose signals travel in `epoch`.
    pub fn record(&mut self, epoch: u64, slots: usize) {
        if slots == 0 {
            return;
        }
        match self.pending.back_mut() {
            Some((last, count)) if *last == epoch => *count += slots,
            _ => self.pending.push_back((epoch, slots)),
        }
    }

    /// Forget releases delivered up to `delivered_epoch` and return how many
    /// slots are still outstanding.
    pub fn outstanding(&mut self, delivered_epoch: u64) -> usize {
        while self
            .pending
            .front()
            .is_some_and(|&(epoch, _)| epoch <= delivered_epoch)
        {
            self.pending.pop_front();
        }
        self.pending.iter().map(|&(_, n)| n).sum()
    }
}
