//! Property tests for remote candidate buffering

use peercall_core::{BufferDecision, CandidateBuffer, IceCandidateRecord};
use proptest::prelude::*;
use std::collections::HashSet;

fn candidate(n: u8) -> IceCandidateRecord {
    IceCandidateRecord::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
        .with_media("0", 0)
}

/// Feed `arrivals`, setting the remote description before index `switch_at`
fn applied_sequence(arrivals: &[u8], switch_at: usize) -> Vec<IceCandidateRecord> {
    let mut buffer = CandidateBuffer::new();
    let mut applied = Vec::new();
    for (i, n) in arrivals.iter().enumerate() {
        if i == switch_at {
            applied.extend(buffer.remote_description_set());
        }
        if let BufferDecision::Apply(c) = buffer.push(candidate(*n)) {
            applied.push(c);
        }
    }
    if switch_at >= arrivals.len() {
        applied.extend(buffer.remote_description_set());
    }
    applied
}

proptest! {
    #[test]
    fn prop_each_candidate_applied_once_in_arrival_order(
        arrivals in prop::collection::vec(0u8..16, 0..40),
        switch_at in 0usize..45,
    ) {
        let applied = applied_sequence(&arrivals, switch_at);

        let mut seen = HashSet::new();
        let expected: Vec<_> = arrivals
            .iter()
            .filter(|n| seen.insert(**n))
            .map(|n| candidate(*n))
            .collect();
        prop_assert_eq!(applied, expected);
    }

    #[test]
    fn prop_nothing_applied_before_remote_description(
        arrivals in prop::collection::vec(0u8..16, 1..20),
    ) {
        let mut buffer = CandidateBuffer::new();
        for n in &arrivals {
            let decision = buffer.push(candidate(*n));
            prop_assert!(!matches!(decision, BufferDecision::Apply(_)));
        }
        let unique: HashSet<_> = arrivals.iter().collect();
        prop_assert_eq!(buffer.pending_len(), unique.len());
    }

    #[test]
    fn prop_closed_buffer_applies_nothing(
        before in prop::collection::vec(0u8..16, 0..10),
        after in prop::collection::vec(0u8..16, 0..10),
    ) {
        let mut buffer = CandidateBuffer::new();
        for n in &before {
            buffer.push(candidate(*n));
        }
        buffer.close();
        for n in &after {
            prop_assert_eq!(buffer.push(candidate(*n)), BufferDecision::Discarded);
        }
        prop_assert!(buffer.remote_description_set().is_empty());
    }
}
