//! Property tests for the delivery guarantees of importers and exporters.
//!
//! # Test Strategy
//!
//! 1. **Idempotence**: any pattern of duplicated deliveries is seen once
//! 2. **Cumulative acknowledgement**: acking N settles exactly the prefix <= N
//! 3. **Retransmission timing**: never before the expiration interval
//! 4. **Lossy link**: a linker pair over a lossy, duplicating link converges

use proptest::prelude::*;

use corelib::{
    Body, ControllerId, Envelope, GapPolicy, Handle, Identity, NodeId, NodeSettings, TimingConfig,
};
use messaging::{Exporter, Frame, Importer, Linker, Packet, Receipt};

fn handle(receiver: u128, sender: u128) -> Handle {
    Handle::issue(NodeId(receiver), ControllerId(1), receiver as u64 + 1000, NodeId(sender))
}

fn timing(expiration: u64) -> TimingConfig {
    TimingConfig {
        pending_expiration_ms: expiration,
        send_interval_ms: 0,
        acknowledgement_interval_ms: 5,
        retransmission_check_interval_ms: 5,
    }
}

// ============================================================================
// Importer Properties
// ============================================================================

proptest! {
    #[test]
    fn duplicate_deliveries_are_seen_once(repeats in proptest::collection::vec(1usize..4, 1..30)) {
        let mut importer = Importer::new(handle(1, 2), GapPolicy::Reject);
        let mut seen = Vec::new();
        for (n, copies) in repeats.iter().enumerate() {
            for _ in 0..*copies {
                let env = Envelope::new(n as u64, Body::new("ping"));
                if let Receipt::Delivered(envs) = importer.receive(env).unwrap() {
                    seen.extend(envs.into_iter().map(|e| e.sequence_number));
                }
            }
        }
        let expected: Vec<u64> = (0..repeats.len() as u64).collect();
        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn buffered_importer_delivers_any_permutation_in_order(
        order in Just((0u64..20).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let mut importer = Importer::new(handle(1, 2), GapPolicy::Buffer);
        let mut seen = Vec::new();
        for n in order {
            if let Receipt::Delivered(envs) = importer.receive(Envelope::new(n, Body::new("x"))).unwrap() {
                seen.extend(envs.into_iter().map(|e| e.sequence_number));
            }
        }
        prop_assert_eq!(seen, (0u64..20).collect::<Vec<_>>());
    }
}

// ============================================================================
// Exporter Properties
// ============================================================================

proptest! {
    #[test]
    fn cumulative_ack_settles_exactly_the_prefix(count in 1u64..40, ack in 0u64..40) {
        prop_assume!(ack < count);
        let mut exporter = Exporter::new(handle(2, 1), handle(1, 2), &timing(50));
        let mut out = Vec::new();
        for _ in 0..count {
            exporter.export(Envelope::new(0, Body::new("ping")), 0, &mut out);
        }
        let acked = exporter.on_ack(ack).unwrap();
        prop_assert_eq!(acked.len() as u64, ack + 1);
        prop_assert!(acked.iter().all(|e| e.sequence_number <= ack));
        prop_assert_eq!(exporter.pending_count() as u64, count - ack - 1);
        prop_assert_eq!(exporter.least_unacknowledged_sequence_number(), ack + 1);
    }

    #[test]
    fn never_retransmits_before_expiration(expiration in 1u64..500, at in 0u64..1000) {
        let mut exporter = Exporter::new(handle(2, 1), handle(1, 2), &timing(expiration));
        let mut out = Vec::new();
        exporter.export(Envelope::new(0, Body::new("ping")), 0, &mut out);
        out.clear();
        let retransmitted = exporter.tick(at, &mut out);
        prop_assert_eq!(retransmitted == 1, at >= expiration);
        if let Some(o) = out.first() {
            match &o.frame {
                Frame::Sequenced { envelope, .. } => {
                    prop_assert_eq!(envelope.sequence_number, 0);
                    prop_assert!(envelope.body.is("ping"));
                }
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }
    }
}

// ============================================================================
// Lossy Link
// ============================================================================

/// Deliver `frames` keeping those whose mask bit is 0 and duplicating those
/// whose mask bit is 2.
fn lossy(frames: Vec<messaging::Outgoing>, mask: &mut impl Iterator<Item = u8>) -> Vec<Packet> {
    let mut kept = Vec::new();
    for out in frames {
        match mask.next().unwrap_or(0) {
            1 => {}
            2 => {
                kept.push(out.packet());
                kept.push(out.packet());
            }
            _ => kept.push(out.packet()),
        }
    }
    kept
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lossy_link_delivers_every_envelope_exactly_once(
        count in 1u64..15,
        mask in proptest::collection::vec(0u8..3, 0..200),
    ) {
        let settings = NodeSettings { timing: timing(20), ..NodeSettings::default() };
        let a_id = Identity::new(NodeId(1), ControllerId(1), 11);
        let b_id = Identity::new(NodeId(2), ControllerId(1), 22);
        let mut a = Linker::new(a_id, settings);
        let mut b = Linker::new(b_id, settings);
        let mut mask = mask.into_iter();

        for n in 0..count {
            a.export(&b_id.new_handle(a_id.node), Envelope::new(0, Body::new("n").with("n", n).unwrap())).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..400 {
            for packet in lossy(a.drain_outbox(), &mut mask) {
                for d in b.receive(a_id.node, packet).unwrap_or_default() {
                    seen.push(d.envelope.body.field::<u64>("n").unwrap());
                    b.release(d.id).unwrap();
                }
            }
            for packet in lossy(b.drain_outbox(), &mut mask) {
                a.receive(b_id.node, packet).unwrap();
            }
            if a.is_quiescent() && b.is_quiescent() {
                break;
            }
            a.elapse(5);
            b.elapse(5);
        }

        prop_assert_eq!(seen, (0..count).collect::<Vec<_>>());
        prop_assert!(a.is_quiescent());
    }
}
