//! Delivery of designations
//!
//! Root sends every other rank, in rank order, its designation record and,
//! for I/O ranks, the owned work units, each translated unit list and the
//! served compute ranks, in that sequence. The bulk lists go out
//! asynchronously on a single pending handle.
//!
//! If root cannot designate, every waiting rank is sent a placeholder record
//! (a compute process without units) so nobody blocks. A rank that cannot
//! store its designation or its lists still receives them into nothing. Either way the phase
//! ends in a failure check that stops the job.

use std::slice;

use conv::ConvUtil;
use tracing::{debug, error, info};

use crate::coordination::designation::{self, Designation, IoAssignment, Role, WorkUnits};
use crate::coordination::discovery::NodeTopology;
use crate::coordination::resolver::DesignationTable;
use crate::coordination::{failure, primitives, Context, Phase};
use crate::datatype::{Equivalence, UserDatatype};
use crate::error::{Error, FailureKind, Result};
use crate::records::{DesignationRecord, Suid};
use crate::registry::TypeKind;
use crate::request::PendingOperation;
use crate::topology::{Rank, ROOT};
use crate::Tag;

const RECORD_TAG: Tag = 2;
const SUIDS_TAG: Tag = 3;
const TRANSLATED_TAG: Tag = 4;
const RANKS_TAG: Tag = 5;

/// Outcome of the handoff on one process
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handoff {
    /// The calling process's designation
    pub designation: Designation,
    /// Every designation; root only
    pub table: Option<DesignationTable>,
}

/// Designate every rank on root and deliver the designations.
///
/// `topology` and `units` are only read on root. Collective over the world
/// communicator.
pub fn distribute(
    ctx: &Context,
    topology: Option<&NodeTopology>,
    units: Option<&WorkUnits>,
) -> Result<Handoff> {
    let world = ctx.world();
    let wire = Wire::new(ctx)?;

    if !ctx.is_root() {
        let local = receive(ctx, &wire);
        let designation = failure::settle(world, Phase::Handoff, local)?;
        debug!(rank = ctx.rank(), role = %designation.role(), "designation received");
        return Ok(Handoff {
            designation,
            table: None,
        });
    }

    let local = match plan(ctx, topology, units) {
        Ok(table) => deliver(ctx, &wire, &table).map(|()| table),
        Err(err) => {
            error!(%err, "designation failed, releasing waiting ranks");
            release(ctx, &wire)?;
            Err(err)
        }
    };
    let table = failure::settle(world, Phase::Handoff, local)?;
    info!(processes = table.len(), "designations delivered");
    Ok(Handoff {
        designation: table.root().clone(),
        table: Some(table),
    })
}

struct Wire<'c> {
    record: &'c UserDatatype,
    suid: UserDatatype,
    rank: UserDatatype,
}

impl<'c> Wire<'c> {
    fn new(ctx: &'c Context) -> Result<Wire<'c>> {
        Ok(Wire {
            record: ctx.datatype(TypeKind::Designate),
            suid: Suid::equivalent_datatype()?,
            rank: Rank::equivalent_datatype()?,
        })
    }
}

fn plan(
    ctx: &Context,
    topology: Option<&NodeTopology>,
    units: Option<&WorkUnits>,
) -> Result<DesignationTable> {
    ctx.allocation_guard(Phase::Designation, "designation table")?;
    let topology =
        topology.ok_or_else(|| Error::Configuration("root has no node topology".into()))?;
    let units = units.ok_or_else(|| Error::Configuration("root has no work units".into()))?;
    designation::designate(topology, units, ctx.config().io_target)
}

fn send_record(ctx: &Context, wire: &Wire<'_>, record: &DesignationRecord, rank: Rank) -> Result<()> {
    primitives::send(
        ctx.world(),
        wire.record,
        slice::from_ref(record),
        1,
        rank,
        true,
        RECORD_TAG,
        &mut PendingOperation::new(),
    )
}

fn deliver(ctx: &Context, wire: &Wire<'_>, table: &DesignationTable) -> Result<()> {
    let world = ctx.world();
    let mut pending = PendingOperation::new();
    let mut failed = None;

    for (rank, designation) in table.iter().skip(1) {
        let record = match (&failed, designation.record()) {
            (None, Ok(record)) => record,
            (None, Err(err)) => {
                error!(rank, %err, "cannot encode designation");
                failed = Some(err);
                Designation::placeholder()
            }
            (Some(_), _) => Designation::placeholder(),
        };
        send_record(ctx, wire, &record, rank)?;

        if let (None, Designation::Io(io)) = (&failed, designation) {
            let n = io.suids.len();
            primitives::send(world, &wire.suid, &io.suids, n, rank, false, SUIDS_TAG, &mut pending)?;
            for set in &io.translated {
                primitives::send(world, &wire.suid, set, n, rank, false, TRANSLATED_TAG, &mut pending)?;
            }
            let served = io.compute_ranks.len();
            primitives::send(
                world,
                &wire.rank,
                &io.compute_ranks,
                served,
                rank,
                false,
                RANKS_TAG,
                &mut pending,
            )?;
            debug!(rank, units = n, served, "I/O designation sent");
        }
    }
    primitives::finalize(world, &mut pending)?;
    failed.map_or(Ok(()), Err)
}

/// Send the placeholder record to every rank waiting for a designation.
fn release(ctx: &Context, wire: &Wire<'_>) -> Result<()> {
    let record = Designation::placeholder();
    for rank in 1..ctx.size() {
        send_record(ctx, wire, &record, rank)?;
    }
    Ok(())
}

fn receive(ctx: &Context, wire: &Wire<'_>) -> Result<Designation> {
    let world = ctx.world();
    let mut record = [DesignationRecord::default()];
    primitives::recv(
        world,
        wire.record,
        &mut record,
        1,
        ROOT,
        true,
        RECORD_TAG,
        &mut PendingOperation::new(),
    )?;
    let record = record[0];

    match Role::from_code(record.proc_job) {
        Some(Role::Compute) => {
            ctx.allocation_guard(Phase::Designation, "designation")?;
            Ok(Designation::Compute {
                io_rank: record.io_rank,
            })
        }
        Some(Role::Io) => {
            let counts = Counts::of(&record)
                .ok_or_else(|| failure::fail(ctx, FailureKind::Setup, "malformed designation record"))?;
            let stored = ctx
                .allocation_guard(Phase::Designation, "designation")
                .and_then(|()| allocate(ctx, &counts));
            match stored {
                Ok(io) => receive_lists(ctx, wire, &counts, io).map(Designation::Io),
                Err(err) => {
                    error!(rank = ctx.rank(), %err, "cannot store designation, draining");
                    drain(ctx, wire, &counts)?;
                    Err(err)
                }
            }
        }
        None => Err(failure::fail(ctx, FailureKind::Setup, "unknown role in designation record")),
    }
}

struct Counts {
    suids: usize,
    sets: usize,
    served: usize,
}

impl Counts {
    fn of(record: &DesignationRecord) -> Option<Counts> {
        Some(Counts {
            suids: record.n_suids.value_as::<usize>().ok()?,
            sets: record.n_translated_sets.value_as::<usize>().ok()?,
            served: record.n_comp_procs.value_as::<usize>().ok()?,
        })
    }
}

fn allocate(ctx: &Context, counts: &Counts) -> Result<IoAssignment> {
    let suids = ctx.try_vec(Phase::Handoff, "work units", counts.suids, Suid::default())?;
    let mut translated = ctx.try_vec(Phase::Handoff, "translated unit lists", counts.sets, Vec::new())?;
    for set in &mut translated {
        *set = ctx.try_vec(Phase::Handoff, "translated work units", counts.suids, Suid::default())?;
    }
    let compute_ranks = ctx.try_vec(Phase::Handoff, "served compute ranks", counts.served, 0)?;
    Ok(IoAssignment {
        compute_ranks,
        suids,
        translated,
    })
}

fn receive_lists(ctx: &Context, wire: &Wire<'_>, counts: &Counts, mut io: IoAssignment) -> Result<IoAssignment> {
    let world = ctx.world();
    primitives::recv(
        world,
        &wire.suid,
        &mut io.suids[..],
        counts.suids,
        ROOT,
        true,
        SUIDS_TAG,
        &mut PendingOperation::new(),
    )?;
    for set in &mut io.translated {
        primitives::recv(
            world,
            &wire.suid,
            &mut set[..],
            counts.suids,
            ROOT,
            true,
            TRANSLATED_TAG,
            &mut PendingOperation::new(),
        )?;
    }
    primitives::recv(
        world,
        &wire.rank,
        &mut io.compute_ranks[..],
        counts.served,
        ROOT,
        true,
        RANKS_TAG,
        &mut PendingOperation::new(),
    )?;
    Ok(io)
}

/// Receive the lists a healthy I/O rank would have stored, and drop them.
fn drain(ctx: &Context, wire: &Wire<'_>, counts: &Counts) -> Result<()> {
    let world = ctx.world();
    primitives::recv_discard(world, &wire.suid, counts.suids, ROOT, SUIDS_TAG)?;
    for _ in 0..counts.sets {
        primitives::recv_discard(world, &wire.suid, counts.suids, ROOT, TRANSLATED_TAG)?;
    }
    primitives::recv_discard(world, &wire.rank, counts.served, ROOT, RANKS_TAG)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::coordination::discovery;
    use crate::environment::Launcher;

    fn units(n: u64) -> WorkUnits {
        WorkUnits::new((0..n).map(|i| Suid::new(i, i)).collect())
    }

    #[test]
    fn every_rank_receives_its_designation() {
        let units = units(12);
        let outcome = Launcher::from_layout(&[("a", 4), ("b", 3)]).run(|universe| {
            let ctx = Context::new(&universe, CoordinatorConfig::default())?;
            let topology = discovery::discover(&ctx)?;
            distribute(&ctx, topology.as_ref(), Some(&units))
        });
        let handoffs = outcome.into_values().unwrap();
        let table = handoffs[0].table.clone().unwrap();
        for (rank, handoff) in (0..).zip(&handoffs) {
            assert_eq!(&handoff.designation, table.get(rank).unwrap());
        }
        assert!(handoffs[1..].iter().all(|handoff| handoff.table.is_none()));
    }

    #[test]
    fn root_failure_releases_waiting_ranks() {
        let units = units(12);
        let config = CoordinatorConfig::default().with_allocation_failure(ROOT, Phase::Designation);
        let outcome = Launcher::from_layout(&[("a", 3)]).run(|universe| {
            let ctx = Context::new(&universe, config.clone())?;
            let topology = discovery::discover(&ctx)?;
            distribute(&ctx, topology.as_ref(), Some(&units))
        });
        assert_eq!(outcome.failure(), Some(FailureKind::Setup));
        for result in &outcome.results {
            assert!(matches!(
                result,
                Err(Error::SetupFailed {
                    phase: Phase::Handoff,
                    ..
                })
            ));
        }
    }
}
