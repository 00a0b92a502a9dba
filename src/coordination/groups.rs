//! Compute and I/O communicators
//!
//! The I/O group holds every I/O rank, root included. The compute group
//! holds every compute rank plus root, so root can broadcast into it; root
//! keeps its handle apart as [`Groups::root_compute`].
//!
//! Group creation is collective over the members, so every member must pass
//! the same rank list. Root broadcasts the group sizes, every process
//! allocates room for its list, root sends each rank the list of its group,
//! and then the I/O group is created, the whole job passes a barrier, and
//! the compute group is created.

use conv::ConvUtil;
use tracing::debug;

use crate::collective::CommunicatorCollectives;
use crate::coordination::designation::{Designation, Role};
use crate::coordination::resolver::DesignationTable;
use crate::coordination::{failure, primitives, Context, Phase};
use crate::datatype::Equivalence;
use crate::error::{Error, Result};
use crate::request::PendingOperation;
use crate::topology::{Rank, SimpleCommunicator, ROOT};
use crate::Tag;

const LIST_TAG: Tag = 6;
const IO_TAG: Tag = 7;
const COMPUTE_TAG: Tag = 8;

/// The communicators of one process
#[derive(Debug, Default)]
pub struct Groups {
    io: Option<SimpleCommunicator>,
    compute: Option<SimpleCommunicator>,
    root_compute: Option<SimpleCommunicator>,
}

impl Groups {
    /// The I/O group; I/O ranks only
    pub fn io(&self) -> Option<&SimpleCommunicator> {
        self.io.as_ref()
    }

    /// The compute group; compute ranks only
    pub fn compute(&self) -> Option<&SimpleCommunicator> {
        self.compute.as_ref()
    }

    /// Root's handle on the compute group
    pub fn root_compute(&self) -> Option<&SimpleCommunicator> {
        self.root_compute.as_ref()
    }

    /// The compute group as seen by the calling process, if it is a member
    pub fn compute_scope(&self) -> Option<&SimpleCommunicator> {
        self.root_compute.as_ref().or(self.compute.as_ref())
    }
}

impl Drop for Groups {
    fn drop(&mut self) {
        let held = [&self.io, &self.compute, &self.root_compute]
            .iter()
            .filter(|comm| comm.is_some())
            .count();
        if held > 0 {
            debug!(communicators = held, "releasing groups");
        }
    }
}

/// Rank lists of the two groups, in group-rank order
struct Lists {
    io: Vec<Rank>,
    compute: Vec<Rank>,
}

/// Create the groups.
///
/// `table` is only read on root. Collective over the world communicator.
pub fn build(ctx: &Context, designation: &Designation, table: Option<&DesignationTable>) -> Result<Groups> {
    let world = ctx.world();
    let datatype = Rank::equivalent_datatype()?;

    let agreed = table.filter(|_| ctx.is_root()).map(sizes).transpose();
    let mut counts = match &agreed {
        Ok(Some(counts)) => *counts,
        _ => [0; 2],
    };
    primitives::bcast(&datatype, &mut counts, 2, ROOT, world)?;
    let [n_io, n_compute] = counts;
    debug!(rank = ctx.rank(), n_io, n_compute, "group sizes agreed");

    let local = agreed.and_then(|_| allocate(ctx, designation, table, counts));
    let lists = failure::settle(world, Phase::Groups, local)?;
    let lists = failure::settle(world, Phase::Groups, exchange(ctx, designation, table, lists))?;

    let mut groups = Groups::default();
    if designation.role() == Role::Io {
        groups.io = world
            .split_by_subgroup_with_tag(&lists.io, IO_TAG)
            .map_err(|err| primitives::fatal(world, "create I/O group", err))?;
    }
    world
        .barrier()
        .map_err(|err| primitives::fatal(world, "barrier", err))?;
    if ctx.is_root() || designation.role() == Role::Compute {
        let compute = world
            .split_by_subgroup_with_tag(&lists.compute, COMPUTE_TAG)
            .map_err(|err| primitives::fatal(world, "create compute group", err))?;
        if ctx.is_root() {
            groups.root_compute = compute;
        } else {
            groups.compute = compute;
        }
    }
    debug!(
        rank = ctx.rank(),
        io = groups.io.is_some(),
        compute = groups.compute_scope().is_some(),
        "groups created"
    );
    Ok(groups)
}

fn sizes(table: &DesignationTable) -> Result<[Rank; 2]> {
    let n_io = table
        .iter()
        .filter(|(_, designation)| designation.role() == Role::Io)
        .count();
    let n_compute = table.iter().count() - n_io + 1;
    let convert = |n: usize| {
        n.value_as::<Rank>()
            .map_err(|_| Error::Configuration(format!("group of {} processes is too large", n)))
    };
    Ok([convert(n_io)?, convert(n_compute)?])
}

fn length(count: Rank) -> Result<usize> {
    count
        .value_as::<usize>()
        .map_err(|_| Error::ProtocolDefect(format!("negative group size {}", count)))
}

/// Room for the lists the calling process needs; root fills them in.
fn allocate(
    ctx: &Context,
    designation: &Designation,
    table: Option<&DesignationTable>,
    [n_io, n_compute]: [Rank; 2],
) -> Result<Lists> {
    let mut lists = Lists {
        io: Vec::new(),
        compute: Vec::new(),
    };
    if ctx.is_root() || designation.role() == Role::Io {
        lists.io = ctx.try_vec(Phase::Groups, "I/O rank list", length(n_io)?, 0)?;
    }
    if ctx.is_root() || designation.role() == Role::Compute {
        lists.compute = ctx.try_vec(Phase::Groups, "compute rank list", length(n_compute)?, 0)?;
    }

    if let Some(table) = table.filter(|_| ctx.is_root()) {
        let io = table
            .iter()
            .filter(|(_, designation)| designation.role() == Role::Io)
            .map(|(rank, _)| rank);
        let compute = std::iter::once(ROOT).chain(
            table
                .iter()
                .filter(|(_, designation)| designation.role() == Role::Compute)
                .map(|(rank, _)| rank),
        );
        for (slot, rank) in lists.io.iter_mut().zip(io) {
            *slot = rank;
        }
        for (slot, rank) in lists.compute.iter_mut().zip(compute) {
            *slot = rank;
        }
    }
    Ok(lists)
}

/// Root sends every other rank the list of its group.
fn exchange(
    ctx: &Context,
    designation: &Designation,
    table: Option<&DesignationTable>,
    mut lists: Lists,
) -> Result<Lists> {
    let world = ctx.world();
    let datatype = Rank::equivalent_datatype()?;

    if ctx.is_root() {
        let table = table.ok_or_else(|| Error::ProtocolDefect("root has no designation table".into()))?;
        for (rank, designation) in table.iter().skip(1) {
            let list = match designation.role() {
                Role::Io => &lists.io,
                Role::Compute => &lists.compute,
            };
            primitives::send(
                world,
                &datatype,
                list,
                list.len(),
                rank,
                true,
                LIST_TAG,
                &mut PendingOperation::new(),
            )?;
        }
        return Ok(lists);
    }

    let list = match designation.role() {
        Role::Io => &mut lists.io,
        Role::Compute => &mut lists.compute,
    };
    let capacity = list.len();
    primitives::recv(
        world,
        &datatype,
        &mut list[..],
        capacity,
        ROOT,
        true,
        LIST_TAG,
        &mut PendingOperation::new(),
    )?;
    if !list.contains(&ctx.rank()) {
        return Err(Error::ProtocolDefect(format!(
            "rank {} is missing from its {} group",
            ctx.rank(),
            designation.role()
        )));
    }
    Ok(lists)
}
