//! Start-up coordination
//!
//! [`setup`] runs the coordination phases in order:
//!
//! 1. topology discovery: root learns which ranks share a node,
//! 2. designation: root splits every node into compute and I/O ranks and
//!    partitions the work units across the I/O ranks,
//! 3. handoff: root sends every rank its designation,
//! 4. groups: the compute and I/O communicators are created.
//!
//! Every phase ends in a collective failure check. A local failure never
//! aborts the job on its own: the failing rank finishes the message exchange
//! of the phase (sending placeholders or receiving into throw-away buffers),
//! the check reports the failure to everyone, and root aborts the job.
//! Transport failures are the exception and abort right away.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::CoordinatorConfig;
use crate::datatype::UserDatatype;
use crate::environment::Universe;
use crate::error::{Error, Result};
use crate::registry::{TypeKind, TypeRegistry};
use crate::topology::{Rank, SimpleCommunicator, ROOT};

pub mod designation;
pub mod discovery;
pub mod failure;
pub mod groups;
pub mod handoff;
pub mod primitives;
pub mod resolver;
pub mod share;

pub use self::designation::{Designation, IoAssignment, Role, WorkUnits};
pub use self::discovery::NodeTopology;
pub use self::groups::Groups;
pub use self::resolver::DesignationTable;

/// Coordination phases, each closed by a collective failure check
#[derive(Deserialize, Serialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Wire-format registry creation
    Registry,
    /// Topology discovery
    Topology,
    /// Role and workload designation
    Designation,
    /// Delivery of designations
    Handoff,
    /// Communicator creation
    Groups,
    /// Configuration sharing
    Sharing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Registry => "registry",
            Phase::Topology => "topology",
            Phase::Designation => "designation",
            Phase::Handoff => "handoff",
            Phase::Groups => "groups",
            Phase::Sharing => "sharing",
        };
        f.write_str(name)
    }
}

/// Per-process coordination state, replacing global communicator state.
pub struct Context {
    world: SimpleCommunicator,
    node_name: String,
    config: CoordinatorConfig,
    registry: TypeRegistry,
}

impl Context {
    /// Validate `config` and build the wire formats on every process.
    ///
    /// Collective over the world communicator.
    pub fn new(universe: &Universe, config: CoordinatorConfig) -> Result<Context> {
        let world = universe.world();
        let prepared = config.validate().and_then(|()| TypeRegistry::create());
        if let Err(err) = &prepared {
            error!(rank = world.rank(), %err, "cannot prepare coordinator");
        }
        let registry = failure::settle(&world, Phase::Registry, prepared)?;
        debug!(rank = world.rank(), node = universe.processor_name(), "coordinator ready");
        Ok(Context {
            node_name: universe.processor_name().to_string(),
            world,
            config,
            registry,
        })
    }

    /// The world communicator
    pub fn world(&self) -> &SimpleCommunicator {
        &self.world
    }

    /// World rank of the calling process
    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    /// Number of processes in the job
    pub fn size(&self) -> Rank {
        self.world.size()
    }

    /// Whether the calling process drives the coordination
    pub fn is_root(&self) -> bool {
        self.rank() == ROOT
    }

    /// Node the calling process runs on
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The settings of the job
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The registered wire formats
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// The wire format of `kind`
    pub fn datatype(&self, kind: TypeKind) -> &UserDatatype {
        self.registry.get(kind)
    }

    /// Fail if an allocation during `phase` is set up to fail on this process.
    pub(crate) fn allocation_guard(&self, phase: Phase, what: &'static str) -> Result<()> {
        if self.config.fails_allocation(self.rank(), phase) {
            return Err(Error::ResourceExhaustion {
                context: what,
                source: None,
            });
        }
        Ok(())
    }

    /// A vector of `len` copies of `value`, reporting allocation failure as an error.
    pub(crate) fn try_vec<T: Clone>(
        &self,
        phase: Phase,
        what: &'static str,
        len: usize,
        value: T,
    ) -> Result<Vec<T>> {
        self.allocation_guard(phase, what)?;
        let mut items = Vec::new();
        items
            .try_reserve_exact(len)
            .map_err(|err| Error::out_of_memory(what, err))?;
        items.resize(len, value);
        Ok(items)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("node_name", &self.node_name)
            .finish()
    }
}

/// Everything a process knows after setup
///
/// Dropping it releases the communicators.
#[derive(Debug)]
pub struct Setup {
    /// The calling process's designation
    pub designation: Designation,
    /// Every designation; root only
    pub table: Option<DesignationTable>,
    /// Ranks grouped by node; root only
    pub topology: Option<NodeTopology>,
    /// Compute and I/O communicators
    pub groups: Groups,
}

/// Run every coordination phase.
///
/// `units` is the work-unit list; only root reads it. Collective over the
/// world communicator.
pub fn setup(ctx: &Context, units: Option<&WorkUnits>) -> Result<Setup> {
    let topology = discovery::discover(ctx)?;
    let handoff::Handoff { designation, table } =
        handoff::distribute(ctx, topology.as_ref(), units)?;
    let groups = groups::build(ctx, &designation, table.as_ref())?;
    info!(
        rank = ctx.rank(),
        node = ctx.node_name(),
        role = %designation.role(),
        "setup complete"
    );
    Ok(Setup {
        designation,
        table,
        topology,
        groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_use_snake_case_names() {
        assert_eq!(Phase::Handoff.to_string(), "handoff");
        let phase: Phase = serde_yaml::from_str("designation").unwrap();
        assert_eq!(phase, Phase::Designation);
    }
}
