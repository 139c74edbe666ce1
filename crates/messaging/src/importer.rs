//! Per-sender receive side of a link.
//!
//! An `Importer` accepts sequenced envelopes from one sender, drops duplicates,
//! hands every fresh envelope to the node exactly once, and tracks which
//! delivered envelopes still have outstanding causal obligations. It only
//! becomes willing to acknowledge an envelope once its obligation count has
//! dropped to zero.
//!
//! # Obligations
//!
//! Every delivered envelope starts with one obligation: its own processing.
//! The node releases it when processing is done. Each outbound envelope
//! exported on its behalf adds one more, released when that outbound envelope
//! is acknowledged by its own receiver. Acknowledgements are cumulative, so
//! the acknowledged prefix stops at the first envelope that still has
//! obligations.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use corelib::{Envelope, Error, GapPolicy, Handle, NodeId, Result};

/// What happened to an envelope handed to [`Importer::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// The envelope, plus any buffered successors it unblocked, in order.
    Delivered(Vec<Envelope>),
    /// Already received; dropped without side effects.
    Duplicate,
    /// Ahead of the next expected number and kept for later (`GapPolicy::Buffer`).
    Buffered,
    /// The importer is deactivated.
    Ignored,
}

#[derive(Debug)]
pub struct Importer {
    /// Handle used to send acknowledgements back to the sender.
    sender: Handle,
    gap_policy: GapPolicy,
    least_unreceived_sequence_number: u64,
    /// Received envelopes with numbers above `least_unreceived_sequence_number`.
    early: BTreeMap<u64, Envelope>,
    /// Delivered sequence number -> count of outstanding obligations.
    obligations: BTreeMap<u64, u32>,
    /// Highest sequence number acknowledged to the sender so far.
    acknowledged_through: Option<u64>,
    /// Resend the current acknowledgement even if it has not advanced.
    rearm_acknowledgement: bool,
    deactivated: bool,
}

impl Importer {
    pub fn new(sender: Handle, gap_policy: GapPolicy) -> Self {
        Self {
            sender,
            gap_policy,
            least_unreceived_sequence_number: 0,
            early: BTreeMap::new(),
            obligations: BTreeMap::new(),
            acknowledged_through: None,
            rearm_acknowledgement: false,
            deactivated: false,
        }
    }

    pub fn sender(&self) -> &Handle {
        &self.sender
    }

    pub fn sender_id(&self) -> NodeId {
        self.sender.id
    }

    /// The next sequence number this importer expects.
    pub fn least_unreceived_sequence_number(&self) -> u64 {
        self.least_unreceived_sequence_number
    }

    pub fn active(&self) -> bool {
        !self.deactivated
    }

    /// Ignore every envelope received from now on.
    pub fn deactivate(&mut self) {
        self.deactivated = true;
    }

    /// Accept one envelope from the sender.
    ///
    /// # Errors
    /// `ProtocolViolation` when the envelope skips ahead of the next expected
    /// number and the gap policy is `Reject`. Nothing is recorded in that case,
    /// so the sender's retransmission can still fill the gap in order.
    pub fn receive(&mut self, envelope: Envelope) -> Result<Receipt> {
        if self.deactivated {
            debug!(sender = %self.sender.id, "deactivated importer is ignoring an envelope");
            return Ok(Receipt::Ignored);
        }

        let sequence_number = envelope.sequence_number;
        if sequence_number < self.least_unreceived_sequence_number || self.early.contains_key(&sequence_number) {
            warn!(
                sender = %self.sender.id,
                sequence_number,
                "received duplicate envelope"
            );
            // The sender is retransmitting, so our last acknowledgement may have been lost.
            self.rearm_acknowledgement = true;
            return Ok(Receipt::Duplicate);
        }

        if sequence_number > self.least_unreceived_sequence_number {
            return match self.gap_policy {
                GapPolicy::Reject => Err(Error::ProtocolViolation(format!(
                    "sender {} skipped from sequence number {} to {}",
                    self.sender.id, self.least_unreceived_sequence_number, sequence_number
                ))),
                GapPolicy::Buffer => {
                    debug!(sender = %self.sender.id, sequence_number, "buffering early envelope");
                    self.early.insert(sequence_number, envelope);
                    Ok(Receipt::Buffered)
                }
            };
        }

        let mut delivered = vec![envelope];
        self.admit(sequence_number);
        while let Some(next) = self.early.remove(&self.least_unreceived_sequence_number) {
            self.admit(next.sequence_number);
            delivered.push(next);
        }
        Ok(Receipt::Delivered(delivered))
    }

    fn admit(&mut self, sequence_number: u64) {
        self.least_unreceived_sequence_number = sequence_number + 1;
        self.obligations.insert(sequence_number, 1);
    }

    /// Add an obligation to a delivered envelope that is not yet acknowledged.
    pub fn hold(&mut self, sequence_number: u64) -> Result<()> {
        match self.obligations.get_mut(&sequence_number) {
            Some(count) => {
                *count += 1;
                Ok(())
            }
            None => Err(Error::InternalInvariant(format!(
                "cannot hold envelope {} from {}: it has no outstanding obligations",
                sequence_number, self.sender.id
            ))),
        }
    }

    /// Drop one obligation. Returns true when the envelope became acknowledgeable.
    pub fn release(&mut self, sequence_number: u64) -> Result<bool> {
        let count = self.obligations.get_mut(&sequence_number).ok_or_else(|| {
            Error::InternalInvariant(format!(
                "released envelope {} from {} more often than it was held",
                sequence_number, self.sender.id
            ))
        })?;
        *count -= 1;
        if *count == 0 {
            self.obligations.remove(&sequence_number);
            return Ok(true);
        }
        Ok(false)
    }

    /// Outstanding obligations of one delivered envelope.
    pub fn obligations(&self, sequence_number: u64) -> u32 {
        self.obligations.get(&sequence_number).copied().unwrap_or(0)
    }

    pub fn has_obligations(&self) -> bool {
        !self.obligations.is_empty()
    }

    /// The highest sequence number whose whole prefix is free of obligations.
    pub fn acknowledgeable_through(&self) -> Option<u64> {
        let bound = self
            .obligations
            .keys()
            .next()
            .copied()
            .unwrap_or(self.least_unreceived_sequence_number);
        bound.checked_sub(1)
    }

    /// The cumulative acknowledgement to send now, if any.
    ///
    /// Returns a number when the acknowledgeable prefix advanced since the last
    /// call, or when a duplicate arrived since then.
    pub fn take_acknowledgement(&mut self) -> Option<u64> {
        let through = self.acknowledgeable_through()?;
        let advanced = self.acknowledged_through.map_or(true, |sent| through > sent);
        if advanced || self.rearm_acknowledgement {
            self.acknowledged_through = Some(through);
            self.rearm_acknowledgement = false;
            return Some(through);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::{Body, ControllerId};

    fn importer(policy: GapPolicy) -> Importer {
        Importer::new(Handle::issue(NodeId(1), ControllerId(1), 5, NodeId(2)), policy)
    }

    fn env(n: u64) -> Envelope {
        Envelope::new(n, Body::new("ping"))
    }

    fn delivered_numbers(receipt: Receipt) -> Vec<u64> {
        match receipt {
            Receipt::Delivered(envs) => envs.iter().map(|e| e.sequence_number).collect(),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut imp = importer(GapPolicy::Reject);
        assert_eq!(delivered_numbers(imp.receive(env(0)).unwrap()), vec![0]);
        assert_eq!(imp.receive(env(0)).unwrap(), Receipt::Duplicate);
        assert_eq!(imp.least_unreceived_sequence_number(), 1);
    }

    #[test]
    fn test_gap_rejected_without_side_effects() {
        let mut imp = importer(GapPolicy::Reject);
        let err = imp.receive(env(1)).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(imp.least_unreceived_sequence_number(), 0);
        assert_eq!(delivered_numbers(imp.receive(env(0)).unwrap()), vec![0]);
        assert_eq!(delivered_numbers(imp.receive(env(1)).unwrap()), vec![1]);
    }

    #[test]
    fn test_gap_buffered_then_delivered_in_order() {
        let mut imp = importer(GapPolicy::Buffer);
        assert_eq!(imp.receive(env(2)).unwrap(), Receipt::Buffered);
        assert_eq!(imp.receive(env(1)).unwrap(), Receipt::Buffered);
        assert_eq!(imp.receive(env(2)).unwrap(), Receipt::Duplicate);
        assert_eq!(delivered_numbers(imp.receive(env(0)).unwrap()), vec![0, 1, 2]);
        assert_eq!(imp.least_unreceived_sequence_number(), 3);
    }

    #[test]
    fn test_acknowledgement_waits_for_obligations() {
        let mut imp = importer(GapPolicy::Reject);
        imp.receive(env(0)).unwrap();
        imp.receive(env(1)).unwrap();
        assert_eq!(imp.take_acknowledgement(), None);

        // Envelope 1 finishes first; the prefix is still blocked by 0.
        assert!(imp.release(1).unwrap());
        assert_eq!(imp.take_acknowledgement(), None);

        imp.hold(0).unwrap();
        assert!(!imp.release(0).unwrap());
        assert_eq!(imp.take_acknowledgement(), None);
        assert!(imp.release(0).unwrap());
        assert_eq!(imp.take_acknowledgement(), Some(1));
        assert_eq!(imp.take_acknowledgement(), None);
    }

    #[test]
    fn test_duplicate_rearms_acknowledgement() {
        let mut imp = importer(GapPolicy::Reject);
        imp.receive(env(0)).unwrap();
        imp.release(0).unwrap();
        assert_eq!(imp.take_acknowledgement(), Some(0));
        assert_eq!(imp.take_acknowledgement(), None);

        imp.receive(env(0)).unwrap();
        assert_eq!(imp.take_acknowledgement(), Some(0));
    }

    #[test]
    fn test_release_without_hold_is_an_invariant_error() {
        let mut imp = importer(GapPolicy::Reject);
        assert!(matches!(imp.release(0), Err(Error::InternalInvariant(_))));
        assert!(matches!(imp.hold(0), Err(Error::InternalInvariant(_))));
    }

    #[test]
    fn test_deactivated_importer_ignores_everything() {
        let mut imp = importer(GapPolicy::Reject);
        imp.deactivate();
        assert_eq!(imp.receive(env(0)).unwrap(), Receipt::Ignored);
        assert!(!imp.active());
    }
}
