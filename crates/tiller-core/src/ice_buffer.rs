use std::collections::VecDeque;

use crate::signaling::IceCandidate;

pub const DEFAULT_CANDIDATE_LIMIT: usize = 64;

/// Remote candidates that arrived before the remote description was applied.
///
/// Bounded; when full the oldest candidate is evicted.
#[derive(Debug)]
pub struct IceCandidateBuffer {
    pending: VecDeque<IceCandidate>,
    limit: usize,
}

impl Default for IceCandidateBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_CANDIDATE_LIMIT)
    }
}

impl IceCandidateBuffer {
    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            pending: VecDeque::with_capacity(limit.min(DEFAULT_CANDIDATE_LIMIT)),
            limit,
        }
    }

    /// Buffers `candidate`, returning the evicted oldest entry if the buffer
    /// was already at its limit.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        let evicted = if self.pending.len() >= self.limit {
            self.pending.pop_front()
        } else {
            None
        };
        self.pending.push_back(candidate);
        evicted
    }

    /// Takes every buffered candidate in receipt order.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
