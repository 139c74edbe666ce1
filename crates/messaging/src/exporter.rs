//! Per-receiver send side of a link.
//!
//! An `Exporter` numbers every envelope it sends to one receiver, keeps it
//! until the receiver acknowledges it, and retransmits it unchanged when it has
//! been pending for longer than the expiration interval. Retransmission on
//! timeout is the only retry mechanism: there are no negative acknowledgements.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use corelib::{Envelope, Error, Handle, NodeId, Result, TimingConfig};

use crate::protocol::{Frame, Outgoing};

#[derive(Debug, Clone)]
struct Pending {
    envelope: Envelope,
    /// `None` while the envelope waits for the next batch flush.
    send_time_ms: Option<u64>,
}

#[derive(Debug)]
pub struct Exporter {
    receiver: Handle,
    /// Handle the receiver uses to acknowledge back to us.
    reply: Handle,
    pending_expiration_ms: u64,
    send_interval_ms: u64,
    next_sequence_number: u64,
    least_unacknowledged_sequence_number: u64,
    pending: BTreeMap<u64, Pending>,
    last_flush_ms: u64,
}

impl Exporter {
    pub fn new(receiver: Handle, reply: Handle, timing: &TimingConfig) -> Self {
        Self {
            receiver,
            reply,
            pending_expiration_ms: timing.pending_expiration_ms,
            send_interval_ms: timing.send_interval_ms,
            next_sequence_number: 0,
            least_unacknowledged_sequence_number: 0,
            pending: BTreeMap::new(),
            last_flush_ms: 0,
        }
    }

    /// A second exporter for the same logical stream, aimed at `receiver`.
    ///
    /// The new exporter keeps its own sequence space starting at 0.
    pub fn duplicate(&self, receiver: Handle, reply: Handle) -> Self {
        Self {
            receiver,
            reply,
            pending_expiration_ms: self.pending_expiration_ms,
            send_interval_ms: self.send_interval_ms,
            next_sequence_number: 0,
            least_unacknowledged_sequence_number: 0,
            pending: BTreeMap::new(),
            last_flush_ms: self.last_flush_ms,
        }
    }

    pub fn receiver(&self) -> &Handle {
        &self.receiver
    }

    pub fn receiver_id(&self) -> NodeId {
        self.receiver.id
    }

    pub fn next_sequence_number(&self) -> u64 {
        self.next_sequence_number
    }

    /// The least sequence number not yet acknowledged. Never decreases.
    pub fn least_unacknowledged_sequence_number(&self) -> u64 {
        self.least_unacknowledged_sequence_number
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number `envelope`, record it as pending at `now_ms` and transmit it.
    ///
    /// Any sequence number already on `envelope` is overwritten. With a non-zero
    /// send interval the envelope waits for the next [`Exporter::tick`] flush.
    pub fn export(&mut self, mut envelope: Envelope, now_ms: u64, out: &mut Vec<Outgoing>) -> u64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;
        envelope.sequence_number = sequence_number;

        let send_time_ms = if self.send_interval_ms == 0 {
            out.push(sequenced(&self.receiver, &self.reply, &envelope));
            Some(now_ms)
        } else {
            None
        };
        debug!(
            receiver = %self.receiver.id,
            sequence_number,
            kind = %envelope.body.kind,
            "exporting envelope"
        );
        self.pending.insert(sequence_number, Pending { envelope, send_time_ms });
        sequence_number
    }

    /// Apply a cumulative acknowledgement of every number <= `sequence_number`.
    ///
    /// Returns the envelopes that became acknowledged, in order. Stale
    /// acknowledgements return nothing.
    ///
    /// # Errors
    /// `ProtocolViolation` when the receiver acknowledges a number never sent.
    pub fn on_ack(&mut self, sequence_number: u64) -> Result<Vec<Envelope>> {
        if sequence_number >= self.next_sequence_number {
            return Err(Error::ProtocolViolation(format!(
                "receiver {} acknowledged {} but only {} envelopes were sent",
                self.receiver.id, sequence_number, self.next_sequence_number
            )));
        }
        if sequence_number < self.least_unacknowledged_sequence_number {
            return Ok(Vec::new());
        }

        debug!(
            receiver = %self.receiver.id,
            sequence_number,
            "exporter acknowledges all sequence numbers up to"
        );
        let still_pending = self.pending.split_off(&(sequence_number + 1));
        let acknowledged = std::mem::replace(&mut self.pending, still_pending);
        self.least_unacknowledged_sequence_number = sequence_number + 1;
        Ok(acknowledged.into_values().map(|p| p.envelope).collect())
    }

    /// Housekeeping at time `now_ms`: flush a due batch and retransmit every
    /// envelope pending for at least the expiration interval.
    ///
    /// Returns the number of retransmissions.
    pub fn tick(&mut self, now_ms: u64, out: &mut Vec<Outgoing>) -> usize {
        self.flush(now_ms, out);

        let mut retransmitted = 0;
        for (sequence_number, pending) in self.pending.iter_mut() {
            let Some(sent) = pending.send_time_ms else {
                continue;
            };
            if now_ms.saturating_sub(sent) < self.pending_expiration_ms {
                continue;
            }
            warn!(
                receiver = %self.receiver.id,
                sequence_number = *sequence_number,
                "retransmitting envelope"
            );
            out.push(sequenced(&self.receiver, &self.reply, &pending.envelope));
            pending.send_time_ms = Some(now_ms);
            retransmitted += 1;
        }
        retransmitted
    }

    /// Send every batched envelope if the send interval has passed.
    pub fn flush(&mut self, now_ms: u64, out: &mut Vec<Outgoing>) {
        if self.send_interval_ms == 0 || now_ms.saturating_sub(self.last_flush_ms) < self.send_interval_ms {
            return;
        }
        self.last_flush_ms = now_ms;
        for pending in self.pending.values_mut().filter(|p| p.send_time_ms.is_none()) {
            out.push(sequenced(&self.receiver, &self.reply, &pending.envelope));
            pending.send_time_ms = Some(now_ms);
        }
    }

    /// Give up on every pending envelope, returning them for bookkeeping.
    pub(crate) fn abandon(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|p| p.envelope)
            .collect()
    }
}

/// The frame carrying `envelope`. The local `caused_by` never leaves the node.
fn sequenced(receiver: &Handle, reply: &Handle, envelope: &Envelope) -> Outgoing {
    Outgoing {
        receiver: receiver.clone(),
        frame: Frame::Sequenced {
            reply: reply.clone(),
            envelope: envelope.clone().with_cause(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::{Body, ControllerId};

    fn exporter(timing: TimingConfig) -> Exporter {
        Exporter::new(
            Handle::issue(NodeId(2), ControllerId(1), 7, NodeId(1)),
            Handle::issue(NodeId(1), ControllerId(1), 8, NodeId(2)),
            &timing,
        )
    }

    fn sequenced(out: &[Outgoing]) -> Vec<(u64, String)> {
        out.iter()
            .filter_map(|o| match &o.frame {
                Frame::Sequenced { envelope, .. } => {
                    Some((envelope.sequence_number, envelope.body.kind.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequence_numbers_start_at_zero_without_gaps() {
        let mut exp = exporter(TimingConfig::default());
        let mut out = Vec::new();
        let numbers: Vec<u64> = (0..4)
            .map(|_| exp.export(Envelope::new(99, Body::new("ping")), 0, &mut out))
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_cumulative_ack_leaves_later_pending() {
        let mut exp = exporter(TimingConfig::default());
        let mut out = Vec::new();
        for _ in 0..5 {
            exp.export(Envelope::new(0, Body::new("ping")), 0, &mut out);
        }
        let acked = exp.on_ack(2).unwrap();
        assert_eq!(acked.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(exp.least_unacknowledged_sequence_number(), 3);
        assert_eq!(exp.pending_count(), 2);

        // Stale acknowledgement changes nothing.
        assert!(exp.on_ack(1).unwrap().is_empty());
        assert_eq!(exp.least_unacknowledged_sequence_number(), 3);
    }

    #[test]
    fn test_ack_beyond_sent_is_a_protocol_violation() {
        let mut exp = exporter(TimingConfig::default());
        assert!(exp.on_ack(0).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_retransmits_at_expiration_not_before() {
        let timing = TimingConfig {
            pending_expiration_ms: 50,
            ..TimingConfig::default()
        };
        let mut exp = exporter(timing);
        let mut out = Vec::new();
        exp.export(Envelope::new(0, Body::new("ping")), 0, &mut out);
        assert_eq!(sequenced(&out), vec![(0, "ping".to_string())]);

        out.clear();
        assert_eq!(exp.tick(49, &mut out), 0);
        assert!(out.is_empty());

        assert_eq!(exp.tick(50, &mut out), 1);
        assert_eq!(sequenced(&out), vec![(0, "ping".to_string())]);

        // The send time was reset.
        out.clear();
        assert_eq!(exp.tick(99, &mut out), 0);
        assert_eq!(exp.tick(100, &mut out), 1);
    }

    #[test]
    fn test_batched_exports_wait_for_flush() {
        let timing = TimingConfig {
            send_interval_ms: 10,
            ..TimingConfig::default()
        };
        let mut exp = exporter(timing);
        let mut out = Vec::new();
        exp.export(Envelope::new(0, Body::new("a")), 0, &mut out);
        exp.export(Envelope::new(0, Body::new("b")), 3, &mut out);
        assert!(out.is_empty());

        exp.tick(5, &mut out);
        assert!(out.is_empty());
        exp.tick(10, &mut out);
        assert_eq!(sequenced(&out), vec![(0, "a".to_string()), (1, "b".to_string())]);
    }

    #[test]
    fn test_duplicate_has_its_own_sequence_space() {
        let mut exp = exporter(TimingConfig::default());
        let mut out = Vec::new();
        exp.export(Envelope::new(0, Body::new("a")), 0, &mut out);
        let mut dup = exp.duplicate(
            Handle::issue(NodeId(3), ControllerId(1), 9, NodeId(1)),
            Handle::issue(NodeId(1), ControllerId(1), 8, NodeId(3)),
        );
        assert_eq!(dup.export(Envelope::new(0, Body::new("b")), 0, &mut out), 0);
        assert_eq!(exp.export(Envelope::new(0, Body::new("b")), 0, &mut out), 1);
        assert_eq!(dup.receiver_id(), NodeId(3));
    }
}
