//! Early ICE candidate buffering
//!
//! Remote candidates and the remote description travel on different watched
//! streams, so candidates can arrive before the transport is able to take
//! them. [`CandidateBuffer`] holds them until the remote description is set,
//! then releases them in arrival order and passes later ones straight through.

use crate::types::IceCandidateRecord;
use std::collections::{HashSet, VecDeque};

type CandidateKey = (String, Option<String>, Option<u16>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Buffering,
    PassThrough,
    Closed,
}

/// What to do with a pushed candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDecision {
    /// Apply to the transport now
    Apply(IceCandidateRecord),
    /// Held until the remote description is set
    Queued,
    /// Already seen; no effect
    Duplicate,
    /// Session is ending or gone; dropped
    Discarded,
}

/// Candidate queue for one session
#[derive(Debug)]
pub struct CandidateBuffer {
    phase: Phase,
    pending: VecDeque<IceCandidateRecord>,
    seen: HashSet<CandidateKey>,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateBuffer {
    /// Create an empty buffer waiting for a remote description
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Buffering,
            pending: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Offer a candidate to the buffer
    pub fn push(&mut self, candidate: IceCandidateRecord) -> BufferDecision {
        if self.phase == Phase::Closed {
            return BufferDecision::Discarded;
        }
        if !self.seen.insert(candidate.dedup_key()) {
            return BufferDecision::Duplicate;
        }
        match self.phase {
            Phase::Buffering => {
                self.pending.push_back(candidate);
                BufferDecision::Queued
            }
            Phase::PassThrough => BufferDecision::Apply(candidate),
            Phase::Closed => BufferDecision::Discarded,
        }
    }

    /// Mark the remote description applied and drain the queue in arrival order
    ///
    /// Later calls return nothing.
    pub fn remote_description_set(&mut self) -> Vec<IceCandidateRecord> {
        if self.phase != Phase::Buffering {
            return Vec::new();
        }
        self.phase = Phase::PassThrough;
        self.pending.drain(..).collect()
    }

    /// Drop everything; later pushes are discarded
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.pending.clear();
    }

    /// Whether the remote description has been applied
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.phase == Phase::PassThrough
    }

    /// Candidates currently held
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn candidate(n: u32) -> IceCandidateRecord {
        IceCandidateRecord::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
            .with_media("0", 0)
    }

    #[test]
    fn test_queues_until_remote_description() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.push(candidate(1)), BufferDecision::Queued);
        assert_eq!(buffer.push(candidate(2)), BufferDecision::Queued);
        assert_eq!(buffer.pending_len(), 2);

        let flushed = buffer.remote_description_set();
        assert_eq!(flushed, vec![candidate(1), candidate(2)]);
        assert!(buffer.is_pass_through());

        assert_eq!(buffer.push(candidate(3)), BufferDecision::Apply(candidate(3)));
        assert!(buffer.remote_description_set().is_empty());
    }

    #[test]
    fn test_duplicates_have_no_effect() {
        let mut buffer = CandidateBuffer::new();
        assert_eq!(buffer.push(candidate(1)), BufferDecision::Queued);
        assert_eq!(buffer.push(candidate(1)), BufferDecision::Duplicate);
        assert_eq!(buffer.remote_description_set(), vec![candidate(1)]);
        assert_eq!(buffer.push(candidate(1)), BufferDecision::Duplicate);
    }

    #[test]
    fn test_same_line_different_mid_is_distinct() {
        let mut buffer = CandidateBuffer::new();
        buffer.remote_description_set();
        let a = IceCandidateRecord::new("candidate:1").with_media("0", 0);
        let b = IceCandidateRecord::new("candidate:1").with_media("1", 1);
        assert_eq!(buffer.push(a.clone()), BufferDecision::Apply(a));
        assert_eq!(buffer.push(b.clone()), BufferDecision::Apply(b));
    }

    #[test]
    fn test_closed_discards() {
        let mut buffer = CandidateBuffer::new();
        buffer.push(candidate(1));
        buffer.close();
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.push(candidate(2)), BufferDecision::Discarded);
        assert!(buffer.remote_description_set().is_empty());
    }
}
