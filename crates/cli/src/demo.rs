//! The demonstration program: a parent node spawns children and adopts them.
//!
//! The originator spawns `count` nodes with `spawn_enlist`. Each child greets
//! its enlister, the parent records every child, and once all have greeted it
//! tells each child who its parent is.

use serde::{Deserialize, Serialize};

use corelib::{Body, IdGenerator, NodeConfig, NodeId, NodeSettings};
use transaction::{Listen, Procedure, Program, Resume, RoleController, RoleHandle, Step, TransactionError};

pub struct Fanout;

/// Node-private state of every demo node.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub kids: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Program for Fanout {
    type State = Roster;
    type Originator = SpawnKids;
    type Participant = JoinParent;
}

pub struct SpawnKids {
    count: usize,
    kids: Vec<RoleHandle>,
    greeted: usize,
}

impl SpawnKids {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            kids: Vec::with_capacity(count),
            greeted: 0,
        }
    }
}

impl Procedure<Fanout> for SpawnKids {
    fn run(&mut self, ctl: &mut RoleController<'_, Fanout>, resume: Resume) -> transaction::Result<Step> {
        match resume {
            Resume::Start => {
                for _ in 0..self.count {
                    let config = ctl.node().new_node_config();
                    self.kids.push(ctl.spawn_enlist(config, JoinParent)?);
                }
            }
            Resume::Rejected { node, .. } => return Err(TransactionError::EnlistRejected { node }),
            Resume::Message(message) => {
                let kid: NodeId = message.body.field("node")?;
                ctl.state().kids.push(kid);
                self.greeted += 1;
            }
        }

        if self.greeted < self.count {
            return Ok(ctl.listen(Listen::kind("hello")));
        }
        let parent = ctl.node_id();
        for kid in &self.kids {
            ctl.send(kid, Body::new("adopted").with("parent", parent)?)?;
        }
        Ok(Step::Complete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinParent;

impl Procedure<Fanout> for JoinParent {
    fn run(&mut self, ctl: &mut RoleController<'_, Fanout>, resume: Resume) -> transaction::Result<Step> {
        match resume {
            Resume::Start => {
                let parent = ctl
                    .enlister()
                    .cloned()
                    .ok_or_else(|| TransactionError::Aborted("spawned without an enlister".into()))?;
                let me = ctl.node_id();
                ctl.send(&parent, Body::new("hello").with("node", me)?)?;
                Ok(ctl.listen(Listen::kind("adopted")))
            }
            Resume::Rejected { node, .. } => Err(TransactionError::EnlistRejected { node }),
            Resume::Message(message) => {
                let parent: NodeId = message.body.field("parent")?;
                ctl.state().parent = Some(parent);
                Ok(Step::Complete)
            }
        }
    }
}

/// Config of the node that starts the demo.
pub fn root_config(settings: NodeSettings) -> NodeConfig {
    let mut ids = IdGenerator::new(NodeId(0));
    NodeConfig::new(ids.node_id(), ids.secret()).with_settings(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use transaction::{Simulation, SimulationConfig};

    #[test]
    fn test_every_kid_is_adopted() {
        let mut sim: Simulation<Fanout> = Simulation::new(SimulationConfig::default(), |_| Roster::default());
        let root = sim.add_node(root_config(NodeSettings::default())).unwrap();
        sim.start_transaction(root, SpawnKids::new(3)).unwrap();

        assert!(sim.run_until(10_000, Simulation::is_quiescent));
        assert_eq!(sim.node(root).unwrap().state().kids.len(), 3);
        let adopted = sim.nodes().filter(|n| n.state().parent == Some(root)).count();
        assert_eq!(adopted, 3);
    }

    #[test]
    fn test_zero_kids_completes_immediately() {
        let mut sim: Simulation<Fanout> = Simulation::new(SimulationConfig::default(), |_| Roster::default());
        let root = sim.add_node(root_config(NodeSettings::default())).unwrap();
        sim.start_transaction(root, SpawnKids::new(0)).unwrap();

        assert!(sim.run_until(100, Simulation::is_quiescent));
        assert_eq!(sim.nodes().count(), 1);
        assert_eq!(sim.node(root).unwrap().history().len(), 1);
    }
}
