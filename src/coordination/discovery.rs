//! Topology discovery
//!
//! Every non-root rank sends its node name to root once. Root takes the
//! names in rank order and groups the ranks by node, in order of first
//! appearance.

use std::slice;

use tracing::{debug, error};

use crate::coordination::{failure, primitives, Context, Phase};
use crate::datatype::{Equivalence, UserDatatype};
use crate::error::Result;
use crate::records::ProcessorName;
use crate::request::PendingOperation;
use crate::topology::{Rank, ROOT};
use crate::Tag;

const NAME_TAG: Tag = 1;

/// The ranks running on one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeGroup {
    /// Node name
    pub name: String,
    /// Ranks on the node, in increasing order
    pub ranks: Vec<Rank>,
}

impl NodeGroup {
    /// Number of processes on the node
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the node has no processes
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }
}

/// Ranks grouped by node, in order of discovery
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTopology {
    nodes: Vec<NodeGroup>,
}

impl NodeTopology {
    /// An empty topology
    pub fn new() -> NodeTopology {
        NodeTopology::default()
    }

    /// Topology of ranks `0..` running on `names[rank]`
    pub fn from_names<I, S>(names: I) -> NodeTopology
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut topology = NodeTopology::new();
        for (rank, name) in (0..).zip(names) {
            topology.add(rank, name.as_ref());
        }
        topology
    }

    /// Record that `rank` runs on `name`.
    pub fn add(&mut self, rank: Rank, name: &str) {
        match self.nodes.iter_mut().find(|node| node.name == name) {
            Some(node) => node.ranks.push(rank),
            None => self.nodes.push(NodeGroup {
                name: name.to_string(),
                ranks: vec![rank],
            }),
        }
    }

    /// The nodes, in order of discovery
    pub fn nodes(&self) -> &[NodeGroup] {
        &self.nodes
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of processes on each node
    pub fn process_counts(&self) -> Vec<usize> {
        self.nodes.iter().map(NodeGroup::len).collect()
    }

    /// The node `rank` runs on
    pub fn node_of(&self, rank: Rank) -> Option<&NodeGroup> {
        self.nodes.iter().find(|node| node.ranks.contains(&rank))
    }
}

/// Collect the topology on root; `None` elsewhere.
///
/// Collective over the world communicator.
pub fn discover(ctx: &Context) -> Result<Option<NodeTopology>> {
    let world = ctx.world();
    let datatype = ProcessorName::equivalent_datatype()?;

    if !ctx.is_root() {
        let name = ProcessorName::new(ctx.node_name());
        primitives::send(
            world,
            &datatype,
            slice::from_ref(&name),
            1,
            ROOT,
            true,
            NAME_TAG,
            &mut PendingOperation::new(),
        )?;
        return failure::settle(world, Phase::Topology, Ok(None));
    }

    let local = collect(ctx, &datatype);
    if let Ok(topology) = &local {
        debug!(
            nodes = topology.node_count(),
            processes = ?topology.process_counts(),
            "topology discovered"
        );
    }
    failure::settle(world, Phase::Topology, local.map(Some))
}

fn collect(ctx: &Context, datatype: &UserDatatype) -> Result<NodeTopology> {
    let world = ctx.world();

    if let Err(err) = ctx.allocation_guard(Phase::Topology, "node list") {
        error!(%err, "cannot record topology, draining node names");
        for rank in 1..world.size() {
            primitives::recv_discard(world, datatype, 1, rank, NAME_TAG)?;
        }
        return Err(err);
    }

    let mut topology = NodeTopology::new();
    topology.add(ROOT, ctx.node_name());

    let mut name = [ProcessorName::default()];
    for rank in 1..world.size() {
        primitives::recv(
            world,
            datatype,
            &mut name,
            1,
            rank,
            true,
            NAME_TAG,
            &mut PendingOperation::new(),
        )?;
        topology.add(rank, &name[0].decode());
    }
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_are_grouped_in_discovery_order() {
        let topology = NodeTopology::from_names(["b", "a", "b", "a", "c"]);
        assert_eq!(topology.node_count(), 3);
        assert_eq!(topology.nodes()[0].name, "b");
        assert_eq!(topology.nodes()[0].ranks, vec![0, 2]);
        assert_eq!(topology.nodes()[1].ranks, vec![1, 3]);
        assert_eq!(topology.process_counts(), vec![2, 2, 1]);
        assert_eq!(topology.node_of(4).map(|node| node.name.as_str()), Some("c"));
    }
}
