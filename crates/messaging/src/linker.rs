//! Links a node's importers to its exporters.
//!
//! Each node owns one `Linker`. It holds one `Importer` per live sender and one
//! `Exporter` per live receiver, and it records which inbound envelope caused
//! each outbound envelope. An inbound envelope is acknowledged upstream only
//! once every outbound envelope it caused has been acknowledged downstream, so
//! acknowledgements cascade back through arbitrarily long causal chains.
//!
//! # Causal bookkeeping
//!
//! Every outbound envelope carries its optional `caused_by` id. Exporting it
//! adds one obligation to that inbound envelope in its importer; the
//! exporter's acknowledgement hands the envelope back and the obligation is
//! released. Both steps are O(1) amortized: no graph is walked at ack time.
//!
//! The linker is sans-IO. Frames to transmit accumulate in an outbox that the
//! owner drains and hands to the hardware layer.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use corelib::{
    Envelope, EnvelopeId, Error, Handle, Identity, NodeId, NodeSettings, Result, Ticker,
};

use crate::exporter::Exporter;
use crate::importer::{Importer, Receipt};
use crate::protocol::{Frame, Outgoing, Packet};

/// An inbound envelope handed to the node, with its id for later release.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: EnvelopeId,
    pub envelope: Envelope,
}

/// Running counters kept by a linker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkerStats {
    /// Envelopes handed to the node.
    pub delivered: u64,
    /// Times an envelope was retransmitted.
    pub retransmissions: u64,
    /// Envelopes received that were already received.
    pub duplicates: u64,
    /// Envelopes received ahead of their turn and buffered.
    pub reorders: u64,
    /// Envelopes or frames refused as protocol violations.
    pub protocol_violations: u64,
    /// Acknowledgement frames sent.
    pub acknowledgements_sent: u64,
}

#[derive(Debug)]
pub struct Linker {
    identity: Identity,
    settings: NodeSettings,
    now_ms: u64,
    /// Ordered so that housekeeping emits frames in a reproducible order.
    importers: BTreeMap<NodeId, Importer>,
    exporters: BTreeMap<NodeId, Exporter>,
    /// Exporter receiver -> additional receivers every export is fanned out to.
    duplicating: BTreeMap<NodeId, Vec<NodeId>>,
    acknowledgement_ticker: Ticker,
    retransmission_ticker: Ticker,
    outbox: Vec<Outgoing>,
    stats: LinkerStats,
}

impl Linker {
    pub fn new(identity: Identity, settings: NodeSettings) -> Self {
        Self {
            identity,
            settings,
            now_ms: 0,
            importers: BTreeMap::new(),
            exporters: BTreeMap::new(),
            duplicating: BTreeMap::new(),
            acknowledgement_ticker: Ticker::new(settings.timing.acknowledgement_interval_ms),
            retransmission_ticker: Ticker::new(settings.timing.retransmission_check_interval_ms),
            outbox: Vec::new(),
            stats: LinkerStats::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn stats(&self) -> LinkerStats {
        self.stats
    }

    pub fn importer(&self, sender: NodeId) -> Option<&Importer> {
        self.importers.get(&sender)
    }

    pub fn exporter(&self, receiver: NodeId) -> Option<&Exporter> {
        self.exporters.get(&receiver)
    }

    /// Register an importer for `sender` ahead of its first envelope.
    pub fn new_importer(&mut self, sender: Handle) -> &mut Importer {
        let gap_policy = self.settings.gap_policy;
        self.importers
            .entry(sender.id)
            .or_insert_with(|| Importer::new(sender, gap_policy))
    }

    /// Register an exporter for `receiver` ahead of its first envelope.
    pub fn new_exporter(&mut self, receiver: Handle) -> Result<&mut Exporter> {
        if !receiver.usable_by(self.identity.node) {
            return Err(Error::UnreachablePeer {
                sender: self.identity.node,
                receiver: receiver.id,
            });
        }
        let reply = self.identity.new_handle(receiver.id);
        let timing = self.settings.timing;
        Ok(self
            .exporters
            .entry(receiver.id)
            .or_insert_with(|| Exporter::new(receiver, reply, &timing)))
    }

    /// Handle one packet that arrived from `sender`.
    ///
    /// Returns the envelopes now deliverable to the node, in order. Each
    /// delivered envelope starts with one obligation that the node must
    /// [`release`](Linker::release) once it has finished processing it.
    ///
    /// # Errors
    /// `ProtocolViolation` for packets that cannot be accepted, including any
    /// whose transport was not issued by this node to `sender`. The linker's
    /// state is unchanged and the caller should log and drop the packet.
    pub fn receive(&mut self, sender: NodeId, packet: Packet) -> Result<Vec<Delivery>> {
        let result = self
            .authorize(sender, &packet)
            .and_then(|()| self.receive_inner(sender, packet.frame));
        if matches!(result, Err(ref e) if e.is_protocol_violation()) {
            self.stats.protocol_violations += 1;
            metrics::counter!("messaging_protocol_violations_total").increment(1);
        }
        result
    }

    fn authorize(&self, sender: NodeId, packet: &Packet) -> Result<()> {
        if packet.transport.sender != sender || !self.identity.accepts(&packet.transport) {
            return Err(Error::ProtocolViolation(format!(
                "{} frame from {sender} carries a transport this node never issued to it",
                packet.frame.kind()
            )));
        }
        Ok(())
    }

    fn receive_inner(&mut self, sender: NodeId, frame: Frame) -> Result<Vec<Delivery>> {
        match frame {
            Frame::Acknowledge { sequence_number } => {
                self.acknowledge(sender, sequence_number)?;
                Ok(Vec::new())
            }
            Frame::Sequenced { reply, envelope } => {
                if reply.id != sender || !reply.usable_by(self.identity.node) {
                    return Err(Error::ProtocolViolation(format!(
                        "envelope from {sender} carries a reply handle for {} issued to {}",
                        reply.id,
                        reply.sender()
                    )));
                }
                let importer = self.new_importer(reply);
                match importer.receive(envelope)? {
                    Receipt::Delivered(envelopes) => {
                        self.stats.delivered += envelopes.len() as u64;
                        Ok(envelopes
                            .into_iter()
                            .map(|envelope| Delivery {
                                id: EnvelopeId {
                                    sender,
                                    sequence_number: envelope.sequence_number,
                                },
                                envelope,
                            })
                            .collect())
                    }
                    Receipt::Duplicate => {
                        self.stats.duplicates += 1;
                        metrics::counter!("messaging_duplicates_total").increment(1);
                        Ok(Vec::new())
                    }
                    Receipt::Buffered => {
                        self.stats.reorders += 1;
                        metrics::counter!("messaging_reorders_total").increment(1);
                        Ok(Vec::new())
                    }
                    Receipt::Ignored => Ok(Vec::new()),
                }
            }
        }
    }

    fn acknowledge(&mut self, receiver: NodeId, sequence_number: u64) -> Result<()> {
        let Some(exporter) = self.exporters.get_mut(&receiver) else {
            // An acknowledgement can still be in flight after its exporter was removed.
            info!(
                node = %self.identity.node,
                unrecognized_receiver = %receiver,
                "ignoring an acknowledgement for an unknown exporter"
            );
            return Ok(());
        };
        let acknowledged = exporter.on_ack(sequence_number)?;
        for envelope in acknowledged {
            if let Some(cause) = envelope.caused_by {
                self.release(cause)?;
            }
        }
        Ok(())
    }

    /// Export `envelope` to `receiver` and to every receiver duplicating it.
    ///
    /// When `envelope.caused_by` names an inbound envelope, that envelope gains
    /// one obligation per transmission and will not be acknowledged upstream
    /// until all of them are acknowledged downstream.
    ///
    /// Returns the sequence number assigned on `receiver`'s exporter.
    ///
    /// Nothing is held or transmitted unless every target can take the
    /// envelope.
    ///
    /// # Errors
    /// - `UnreachablePeer` when `receiver` is not a handle this node may use.
    /// - `ProtocolViolation` when a body field collides with an envelope key.
    /// - `InternalInvariant` when `caused_by` names an envelope that is not
    ///   currently held, or a duplicate's exporter is gone.
    pub fn export(&mut self, receiver: &Handle, envelope: Envelope) -> Result<u64> {
        envelope.body.validate()?;
        self.new_exporter(receiver.clone())?;

        let mut targets = vec![receiver.id];
        if let Some(extra) = self.duplicating.get(&receiver.id) {
            targets.extend(extra.iter().copied());
        }
        if let Some(missing) = targets.iter().find(|t| !self.exporters.contains_key(t)) {
            return Err(Error::InternalInvariant(format!("duplicate exporter for {missing} is missing")));
        }
        if let Some(cause) = envelope.caused_by {
            let held = self
                .importers
                .get(&cause.sender)
                .is_some_and(|importer| importer.obligations(cause.sequence_number) > 0);
            if !held {
                return Err(Error::InternalInvariant(format!("{cause} is not held")));
            }
        }

        if let Some(cause) = envelope.caused_by {
            for _ in &targets {
                self.hold(cause)?;
            }
        }

        let mut assigned = 0;
        for (i, target) in targets.iter().enumerate() {
            let exporter = self.exporters.get_mut(target).ok_or_else(|| {
                Error::InternalInvariant(format!("duplicate exporter for {target} is missing"))
            })?;
            let sequence_number = exporter.export(envelope.clone(), self.now_ms, &mut self.outbox);
            if i == 0 {
                assigned = sequence_number;
            }
        }
        Ok(assigned)
    }

    /// Add an obligation to a delivered, not yet acknowledged envelope.
    pub fn hold(&mut self, id: EnvelopeId) -> Result<()> {
        self.importers
            .get_mut(&id.sender)
            .ok_or_else(|| Error::InternalInvariant(format!("no importer for {}", id.sender)))?
            .hold(id.sequence_number)
    }

    /// Drop one obligation of a delivered envelope.
    pub fn release(&mut self, id: EnvelopeId) -> Result<()> {
        let importer = self
            .importers
            .get_mut(&id.sender)
            .ok_or_else(|| Error::InternalInvariant(format!("no importer for {}", id.sender)))?;
        if importer.release(id.sequence_number)? {
            debug!(node = %self.identity.node, envelope = %id, "envelope has no outstanding obligations");
        }
        Ok(())
    }

    /// Elapse `ms` of time, running acknowledgement and retransmission
    /// housekeeping when their intervals come around.
    pub fn elapse(&mut self, ms: u64) {
        self.now_ms += ms;

        for exporter in self.exporters.values_mut() {
            exporter.flush(self.now_ms, &mut self.outbox);
        }

        if self.acknowledgement_ticker.elapse(ms) > 0 {
            self.send_acknowledgements();
        }

        if self.retransmission_ticker.elapse(ms) > 0 {
            let mut retransmitted = 0;
            for exporter in self.exporters.values_mut() {
                retransmitted += exporter.tick(self.now_ms, &mut self.outbox);
            }
            if retransmitted > 0 {
                self.stats.retransmissions += retransmitted as u64;
                metrics::counter!("messaging_retransmissions_total").increment(retransmitted as u64);
            }
        }
    }

    /// Queue a cumulative acknowledgement for every sender whose
    /// acknowledgeable prefix advanced.
    pub fn send_acknowledgements(&mut self) {
        for importer in self.importers.values_mut() {
            if let Some(sequence_number) = importer.take_acknowledgement() {
                debug!(
                    node = %self.identity.node,
                    sender = %importer.sender_id(),
                    sequence_number,
                    "sending acknowledgement"
                );
                self.outbox.push(Outgoing {
                    receiver: importer.sender().clone(),
                    frame: Frame::Acknowledge { sequence_number },
                });
                self.stats.acknowledgements_sent += 1;
                metrics::counter!("messaging_acknowledgements_total").increment(1);
            }
        }
    }

    /// Take every frame waiting to be transmitted.
    pub fn drain_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Start fanning every later export to `existing` out to `new_receiver` too.
    pub fn duplicate_exporter(&mut self, existing: NodeId, new_receiver: Handle) -> Result<()> {
        if !new_receiver.usable_by(self.identity.node) {
            return Err(Error::UnreachablePeer {
                sender: self.identity.node,
                receiver: new_receiver.id,
            });
        }
        let source = self.exporters.get(&existing).ok_or_else(|| {
            Error::InternalInvariant(format!("cannot duplicate missing exporter for {existing}"))
        })?;
        let reply = self.identity.new_handle(new_receiver.id);
        let new_id = new_receiver.id;
        let duplicate = source.duplicate(new_receiver, reply);
        self.exporters.entry(new_id).or_insert(duplicate);

        let targets = self.duplicating.entry(existing).or_default();
        if !targets.contains(&new_id) {
            targets.push(new_id);
        }
        info!(node = %self.identity.node, %existing, duplicate = %new_id, "duplicating exporter");
        Ok(())
    }

    /// Stop fanning exports to `existing` out to its duplicates.
    pub fn stop_duplicating(&mut self, existing: NodeId) -> Vec<NodeId> {
        self.duplicating.remove(&existing).unwrap_or_default()
    }

    /// Remove the exporter for `receiver`.
    ///
    /// # Errors
    /// `InternalInvariant` while it still has unacknowledged envelopes: a
    /// stale receiver may only be torn down once its cascade has completed.
    pub fn remove_exporter(&mut self, receiver: NodeId) -> Result<Exporter> {
        let pending = self
            .exporters
            .get(&receiver)
            .map(Exporter::pending_count)
            .ok_or_else(|| Error::InternalInvariant(format!("no exporter for {receiver}")))?;
        if pending > 0 {
            return Err(Error::InternalInvariant(format!(
                "exporter for {receiver} still has {pending} pending envelopes"
            )));
        }
        self.duplicating.remove(&receiver);
        for targets in self.duplicating.values_mut() {
            targets.retain(|t| *t != receiver);
        }
        self.exporters
            .remove(&receiver)
            .ok_or_else(|| Error::InternalInvariant(format!("no exporter for {receiver}")))
    }

    /// Drop the exporter for an unreachable receiver, releasing every
    /// obligation its pending envelopes held.
    pub fn abandon_exporter(&mut self, receiver: NodeId) -> Result<usize> {
        let Some(mut exporter) = self.exporters.remove(&receiver) else {
            return Ok(0);
        };
        self.duplicating.remove(&receiver);
        for targets in self.duplicating.values_mut() {
            targets.retain(|t| *t != receiver);
        }
        let abandoned = exporter.abandon();
        error!(
            node = %self.identity.node,
            %receiver,
            abandoned = abandoned.len(),
            "abandoning exporter with unacknowledged envelopes"
        );
        for envelope in &abandoned {
            if let Some(cause) = envelope.caused_by {
                self.release(cause)?;
            }
        }
        Ok(abandoned.len())
    }

    /// Remove the importer for `sender`.
    pub fn remove_importer(&mut self, sender: NodeId) -> Option<Importer> {
        self.importers.remove(&sender)
    }

    /// Ignore every later envelope from `sender`.
    pub fn deactivate_importer(&mut self, sender: NodeId) -> bool {
        match self.importers.get_mut(&sender) {
            Some(importer) => {
                importer.deactivate();
                true
            }
            None => false,
        }
    }

    /// True when nothing is pending in either direction.
    pub fn is_quiescent(&self) -> bool {
        self.exporters.values().all(|e| !e.has_pending())
            && self.importers.values().all(|i| !i.has_obligations())
            && self.outbox.is_empty()
    }
}
