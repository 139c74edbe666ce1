//! Deterministic in-memory network for running many nodes in one thread.
//!
//! The simulator plays the hardware layer: it carries encoded frames between
//! node runtimes with configurable latency, loss and duplication, drives each
//! node's clock, and creates or removes nodes on request. Every random choice
//! comes from one seeded ChaCha stream, so a run is fully reproducible.
//!
//! Frames on one sender/receiver link are never reordered; loss is the only
//! way a gap appears. Frames on different links interleave freely.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use priority_queue::PriorityQueue;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use corelib::{ControllerId, Handle, Hardware, HardwareError, NodeConfig, NodeId, TransactionId};

use crate::error::Result;
use crate::node::NodeRuntime;
use crate::role::Program;

/// Knobs of a simulated network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Probability in [0, 1] that a frame is lost.
    pub drop_rate: f64,
    /// Probability in [0, 1] that a delivered frame arrives twice.
    pub duplicate_rate: f64,
    pub latency_ms: u64,
    /// Extra random delay in [0, jitter_ms] per frame.
    pub jitter_ms: u64,
    /// Simulated time per [`Simulation::step`].
    pub step_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            latency_ms: 5,
            jitter_ms: 0,
            step_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub delivered: u64,
    /// Frames a node refused.
    pub rejected: u64,
}

struct InFlight {
    sender: NodeId,
    receiver: NodeId,
    payload: Bytes,
}

/// The `Hardware` side of the simulation.
pub struct SimulatedNetwork {
    controller_id: ControllerId,
    config: SimulationConfig,
    rng: ChaCha20Rng,
    now_ms: u64,
    next_frame: u64,
    /// Frame number -> (delivery time, frame number), earliest first.
    in_flight: PriorityQueue<u64, Reverse<(u64, u64)>>,
    frames: HashMap<u64, InFlight>,
    /// Latest delivery time scheduled on each link.
    link_clock: HashMap<(NodeId, NodeId), u64>,
    live: HashSet<NodeId>,
    spawned: Vec<NodeConfig>,
    terminated: Vec<NodeId>,
    stats: NetworkStats,
}

impl SimulatedNetwork {
    fn new(config: SimulationConfig) -> Self {
        Self {
            controller_id: ControllerId(1),
            config,
            rng: ChaCha20Rng::seed_from_u64(config.seed),
            now_ms: 0,
            next_frame: 0,
            in_flight: PriorityQueue::new(),
            frames: HashMap::new(),
            link_clock: HashMap::new(),
            live: HashSet::new(),
            spawned: Vec::new(),
            terminated: Vec::new(),
            stats: NetworkStats::default(),
        }
    }

    fn chance(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    fn schedule(&mut self, frame: InFlight) {
        let jitter = if self.config.jitter_ms > 0 {
            self.rng.gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        let earliest = self.now_ms + (self.config.latency_ms + jitter).max(1);
        let clock = self.link_clock.entry((frame.sender, frame.receiver)).or_insert(0);
        let at = earliest.max(*clock);
        *clock = at;

        let number = self.next_frame;
        self.next_frame += 1;
        self.in_flight.push(number, Reverse((at, number)));
        self.frames.insert(number, frame);
    }

    /// The next frame due at or before the current time.
    fn pop_due(&mut self) -> Option<InFlight> {
        let (_, Reverse((at, _))) = self.in_flight.peek()?;
        if *at > self.now_ms {
            return None;
        }
        let (number, _) = self.in_flight.pop()?;
        self.frames.remove(&number)
    }
}

impl Hardware for SimulatedNetwork {
    fn controller_id(&self) -> ControllerId {
        self.controller_id
    }

    fn is_reachable(&self, sender: NodeId, receiver: &Handle) -> bool {
        self.live.contains(&receiver.id) && receiver.usable_by(sender)
    }

    fn send(&mut self, sender: NodeId, receiver: &Handle, payload: Bytes) -> std::result::Result<(), HardwareError> {
        if !self.live.contains(&receiver.id) {
            return Err(HardwareError::NoNodeForId(receiver.id));
        }
        if !receiver.usable_by(sender) {
            return Err(HardwareError::NoTransport {
                sender,
                receiver: receiver.id,
            });
        }
        self.stats.sent += 1;
        if self.chance(self.config.drop_rate) {
            trace!(%sender, receiver = %receiver.id, "dropping frame");
            self.stats.dropped += 1;
            return Ok(());
        }
        if self.chance(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            self.schedule(InFlight {
                sender,
                receiver: receiver.id,
                payload: payload.clone(),
            });
        }
        self.schedule(InFlight {
            sender,
            receiver: receiver.id,
            payload,
        });
        Ok(())
    }

    fn spawn_node(&mut self, config: NodeConfig) -> std::result::Result<ControllerId, HardwareError> {
        if !self.live.insert(config.id) {
            return Err(HardwareError::NodeExists(config.id));
        }
        self.spawned.push(config);
        Ok(self.controller_id)
    }

    fn terminate_node(&mut self, node: NodeId) -> std::result::Result<(), HardwareError> {
        if !self.live.remove(&node) {
            return Err(HardwareError::NoNodeForId(node));
        }
        self.terminated.push(node);
        Ok(())
    }
}

/// A set of node runtimes on one simulated network.
///
/// # Example
/// ```ignore
/// let mut sim: Simulation<MyProgram> = Simulation::new(SimulationConfig::default(), |_| MyState::default());
/// let root = sim.add_node(NodeConfig::new(NodeId(1), 7))?;
/// sim.start_transaction(root, MyOriginator::new())?;
/// sim.run_for(1_000);
/// ```
pub struct Simulation<P: Program> {
    network: SimulatedNetwork,
    nodes: BTreeMap<NodeId, NodeRuntime<P>>,
    new_state: Box<dyn FnMut(&NodeConfig) -> P::State>,
}

impl<P: Program> Simulation<P> {
    /// `new_state` builds the private state of every node, including spawned ones.
    pub fn new(config: SimulationConfig, new_state: impl FnMut(&NodeConfig) -> P::State + 'static) -> Self {
        Self {
            network: SimulatedNetwork::new(config),
            nodes: BTreeMap::new(),
            new_state: Box::new(new_state),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.network.now_ms
    }

    pub fn stats(&self) -> NetworkStats {
        self.network.stats
    }

    /// Bring up a node outside of any transaction.
    pub fn add_node(&mut self, config: NodeConfig) -> Result<NodeId> {
        let id = config.id;
        if self.network.live.contains(&id) {
            return Err(HardwareError::NodeExists(id).into());
        }
        let state = (self.new_state)(&config);
        let runtime = NodeRuntime::new(config, self.network.controller_id, state)?;
        self.network.live.insert(id);
        self.nodes.insert(id, runtime);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRuntime<P>> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeRuntime<P>> {
        self.nodes.get_mut(&id)
    }

    /// Every live node, in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeRuntime<P>> {
        self.nodes.values()
    }

    /// A handle `for_sender` can use to reach `receiver`.
    pub fn handle(&self, receiver: NodeId, for_sender: NodeId) -> Option<Handle> {
        self.nodes.get(&receiver).map(|node| node.new_handle(for_sender))
    }

    pub fn start_transaction(&mut self, node: NodeId, originator: P::Originator) -> Result<TransactionId> {
        let runtime = self
            .nodes
            .get_mut(&node)
            .ok_or(HardwareError::NoNodeForId(node))?;
        Ok(runtime.start_transaction(originator))
    }

    /// Remove a node and everything still addressed to it.
    pub fn terminate(&mut self, node: NodeId) -> Result<()> {
        self.network.terminate_node(node)?;
        self.apply_lifecycle();
        Ok(())
    }

    /// Advance the whole network by one step.
    ///
    /// Order within a step: deliver due frames, advance every node's clock,
    /// give every node one scheduler turn, then apply spawns and terminations.
    pub fn step(&mut self) {
        let step_ms = self.network.config.step_ms.max(1);
        self.network.now_ms += step_ms;

        while let Some(frame) = self.network.pop_due() {
            let Some(node) = self.nodes.get_mut(&frame.receiver) else {
                debug!(receiver = %frame.receiver, "discarding frame for a removed node");
                continue;
            };
            self.network.stats.delivered += 1;
            if node.receive(&mut self.network, frame.sender, &frame.payload).is_err() {
                self.network.stats.rejected += 1;
            }
        }

        for node in self.nodes.values_mut() {
            node.elapse(&mut self.network, step_ms);
        }
        for node in self.nodes.values_mut() {
            node.run_ready(&mut self.network);
        }
        self.apply_lifecycle();
    }

    /// Step until at least `ms` of simulated time has passed.
    pub fn run_for(&mut self, ms: u64) {
        let until = self.network.now_ms + ms;
        while self.network.now_ms < until {
            self.step();
        }
    }

    /// Step until `done` holds or `max_ms` has passed. Returns whether `done` held.
    pub fn run_until(&mut self, max_ms: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        let until = self.network.now_ms + max_ms;
        while self.network.now_ms < until {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Nothing in flight, no role pending anywhere and every envelope acknowledged.
    pub fn is_quiescent(&self) -> bool {
        self.network.in_flight.is_empty() && self.nodes.values().all(NodeRuntime::is_quiescent)
    }

    fn apply_lifecycle(&mut self) {
        for config in std::mem::take(&mut self.network.spawned) {
            let id = config.id;
            let state = (self.new_state)(&config);
            match NodeRuntime::new(config, self.network.controller_id, state) {
                Ok(runtime) => {
                    debug!(node = %id, "node spawned");
                    self.nodes.insert(id, runtime);
                }
                Err(e) => {
                    error!(node = %id, error = %e, "failed to spawn node");
                    self.network.live.remove(&id);
                }
            }
        }
        for id in std::mem::take(&mut self.network.terminated) {
            debug!(node = %id, "node terminated");
            self.nodes.remove(&id);
        }
    }
}
