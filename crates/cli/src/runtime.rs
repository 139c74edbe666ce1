//! In-process runtime: one tokio task per node.
//!
//! Every node gets an unbounded mpsc channel as its inbound transport and a
//! `tokio::time::interval` as its clock. The [`Router`] is the hardware layer
//! shared by all node tasks: it maps node ids to channels, optionally loses
//! frames, and spawns a task for every node a role creates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use corelib::{ControllerId, Handle, Hardware, HardwareError, NodeConfig, NodeId, NodeSettings};
use messaging::LinkerStats;
use transaction::NodeRuntime;

use crate::commands::{sum_stats, CommandResult, RunArgs};
use crate::demo::{root_config, Fanout, Roster, SpawnKids};

struct Inbound {
    sender: NodeId,
    payload: Bytes,
}

/// Latest observable state of one node task.
#[derive(Debug, Clone, Default)]
pub struct NodeReport {
    pub roster: Roster,
    pub roles_completed: u64,
    pub quiescent: bool,
    pub stats: LinkerStats,
}

impl NodeReport {
    fn of(node: &NodeRuntime<Fanout>) -> Self {
        Self {
            roster: node.state().clone(),
            roles_completed: node.stats().roles_completed,
            quiescent: node.is_quiescent(),
            stats: node.linker().stats(),
        }
    }
}

struct Inner {
    controller_id: ControllerId,
    tick_ms: u64,
    drop_rate: f64,
    mailboxes: DashMap<NodeId, mpsc::UnboundedSender<Inbound>>,
    reports: DashMap<NodeId, NodeReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The hardware layer of the in-process runtime. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn new(tick_ms: u64, drop_rate: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                controller_id: ControllerId(1),
                tick_ms: tick_ms.max(1),
                drop_rate,
                mailboxes: DashMap::new(),
                reports: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start a task for the node described by `config`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn launch(&self, config: NodeConfig, originator: Option<SpawnKids>) -> Result<(), HardwareError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(HardwareError::NoNodeForId(config.id));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.inner.mailboxes.entry(config.id) {
            Entry::Occupied(_) => return Err(HardwareError::NodeExists(config.id)),
            Entry::Vacant(slot) => {
                slot.insert(sender);
            }
        }
        let task = tokio::spawn(node_task(self.clone(), config, receiver, originator));
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    pub fn report(&self, node: NodeId) -> Option<NodeReport> {
        self.inner.reports.get(&node).map(|r| r.value().clone())
    }

    /// `expected` nodes have reported, `root` finished a role and nobody has
    /// anything left to send or acknowledge.
    pub fn settled(&self, root: NodeId, expected: usize) -> bool {
        self.inner.reports.len() == expected
            && self.report(root).is_some_and(|r| r.roles_completed > 0)
            && self.inner.reports.iter().all(|r| r.value().quiescent)
    }

    /// Close every mailbox and wait for the node tasks to exit.
    pub async fn shutdown(&self) -> Vec<(NodeId, NodeReport)> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.mailboxes.clear();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "node task panicked");
            }
        }
        self.inner
            .reports
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect()
    }
}

impl Hardware for Router {
    fn controller_id(&self) -> ControllerId {
        self.inner.controller_id
    }

    fn is_reachable(&self, sender: NodeId, receiver: &Handle) -> bool {
        self.inner.mailboxes.contains_key(&receiver.id) && receiver.usable_by(sender)
    }

    fn send(&mut self, sender: NodeId, receiver: &Handle, payload: Bytes) -> Result<(), HardwareError> {
        if !receiver.usable_by(sender) {
            return Err(HardwareError::NoTransport {
                sender,
                receiver: receiver.id,
            });
        }
        if self.inner.drop_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.inner.drop_rate {
            return Ok(());
        }
        let mailbox = self
            .inner
            .mailboxes
            .get(&receiver.id)
            .ok_or(HardwareError::NoNodeForId(receiver.id))?;
        mailbox
            .send(Inbound { sender, payload })
            .map_err(|_| HardwareError::NoNodeForId(receiver.id))
    }

    fn spawn_node(&mut self, config: NodeConfig) -> Result<ControllerId, HardwareError> {
        self.launch(config, None)?;
        Ok(self.inner.controller_id)
    }

    fn terminate_node(&mut self, node: NodeId) -> Result<(), HardwareError> {
        self.inner
            .mailboxes
            .remove(&node)
            .map(|_| ())
            .ok_or(HardwareError::NoNodeForId(node))
    }
}

/// Event loop of one node: inbound frames and clock ticks, each followed by
/// a scheduler turn.
async fn node_task(
    mut router: Router,
    config: NodeConfig,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    originator: Option<SpawnKids>,
) {
    let id = config.id;
    let tick_ms = router.inner.tick_ms;
    let mut node: NodeRuntime<Fanout> = match NodeRuntime::new(config, router.controller_id(), Roster::default()) {
        Ok(node) => node,
        Err(e) => {
            error!(node = %id, error = %e, "node failed to start");
            router.inner.mailboxes.remove(&id);
            return;
        }
    };
    if let Some(originator) = originator {
        node.start_transaction(originator);
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(node = %id, "node started");

    loop {
        tokio::select! {
            inbound = inbox.recv() => match inbound {
                Some(Inbound { sender, payload }) => {
                    if let Err(e) = node.receive(&mut router, sender, &payload) {
                        debug!(node = %id, %sender, error = %e, "frame refused");
                    }
                }
                None => break,
            },
            _ = ticker.tick() => node.elapse(&mut router, tick_ms),
        }
        node.run_ready(&mut router);
        router.inner.reports.insert(id, NodeReport::of(&node));
    }
    debug!(node = %id, "node stopped");
}

/// Run the demo transaction on a fresh multi-threaded runtime.
pub fn run(args: &RunArgs, settings: NodeSettings) -> anyhow::Result<CommandResult> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run_async(args, settings))
}

async fn run_async(args: &RunArgs, settings: NodeSettings) -> anyhow::Result<CommandResult> {
    let router = Router::new(args.tick_ms, args.drop_rate);
    let config = root_config(settings);
    let root = config.id;
    let started = Instant::now();
    router.launch(config, Some(SpawnKids::new(args.kids)))?;

    let poll = Duration::from_millis(args.tick_ms.max(1));
    let settled = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        while !router.settled(root, args.kids + 1) {
            tokio::time::sleep(poll).await;
        }
    })
    .await
    .is_ok();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let reports = router.shutdown().await;
    let kids = reports
        .iter()
        .find(|(id, _)| *id == root)
        .map(|(_, r)| r.roster.kids.clone())
        .unwrap_or_default();
    Ok(CommandResult {
        mode: "run",
        root,
        kids,
        adopted: reports.iter().filter(|(_, r)| r.roster.parent == Some(root)).count(),
        settled,
        elapsed_ms,
        stats: sum_stats(reports.into_iter().map(|(_, r)| r.stats)),
    })
}
