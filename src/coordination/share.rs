//! Configuration sharing and wall-time reporting
//!
//! Once the groups exist, root hands out what every process needs to run:
//! domain and spin-up settings go to the whole job, the run-input template
//! and the establishment records go to the compute group, and the output
//! settings go to the I/O group. At the end of a run every process reports
//! its timing statistics back to root.

use std::slice;

use conv::ConvUtil;
use tracing::{debug, error, info};

use crate::coordination::groups::Groups;
use crate::coordination::{failure, primitives, Context, Phase};
use crate::datatype::Equivalence;
use crate::error::{Error, Result};
use crate::records::{DomainConfig, OutDomIo, RunInputs, SpinupConfig, VegEstabInfo, WallTime};
use crate::registry::TypeKind;
use crate::request::PendingOperation;
use crate::topology::ROOT;
use crate::Tag;

const WALL_TIME_TAG: Tag = 9;

/// Broadcast root's domain and spin-up settings to every process.
///
/// Collective over the world communicator.
pub fn share_domain_info(ctx: &Context, domain: &mut DomainConfig, spinup: &mut SpinupConfig) -> Result<()> {
    let world = ctx.world();
    primitives::bcast(ctx.datatype(TypeKind::Domain), slice::from_mut(domain), 1, ROOT, world)?;
    primitives::bcast(ctx.datatype(TypeKind::Spinup), slice::from_mut(spinup), 1, ROOT, world)?;
    debug!(rank = ctx.rank(), "domain settings shared");
    Ok(())
}

/// Broadcast root's run-input template and establishment records into the
/// compute group.
///
/// Collective over the compute group; processes outside it return right
/// away. The record count goes first so that receivers can make room; a
/// receiver that cannot still takes part in the broadcast and the phase
/// fails on every member.
pub fn share_template(
    ctx: &Context,
    groups: &Groups,
    inputs: &mut RunInputs,
    estab: &mut Vec<VegEstabInfo>,
) -> Result<()> {
    let Some(scope) = groups.compute_scope() else {
        return Ok(());
    };
    let estab_type = ctx.datatype(TypeKind::VegEstabIn);
    primitives::bcast(ctx.datatype(TypeKind::Inputs), slice::from_mut(inputs), 1, ROOT, scope)?;

    let mut count = [estab.len().value_as::<u64>().unwrap_or(u64::MAX)];
    primitives::bcast(&u64::equivalent_datatype()?, &mut count, 1, ROOT, scope)?;
    let count = count[0]
        .value_as::<usize>()
        .map_err(|_| Error::ProtocolDefect(format!("{} establishment records", count[0])))?;

    if ctx.is_root() {
        let records = &mut estab[..];
        primitives::bcast(estab_type, records, count, ROOT, scope)?;
        return failure::settle(scope, Phase::Sharing, Ok(()));
    }

    let local = match ctx.try_vec(Phase::Sharing, "establishment records", count, VegEstabInfo::default()) {
        Ok(mut records) => primitives::bcast(estab_type, &mut records[..], count, ROOT, scope).map(|()| records),
        Err(err) => {
            error!(rank = ctx.rank(), %err, "cannot store establishment records, draining");
            primitives::bcast_discard(estab_type, count, ROOT, scope)?;
            Err(err)
        }
    };
    *estab = failure::settle(scope, Phase::Sharing, local)?;
    debug!(rank = ctx.rank(), records = estab.len(), "template received");
    Ok(())
}

/// Broadcast root's output settings into the I/O group.
///
/// Collective over the I/O group; processes outside it return right away.
pub fn share_output_config(ctx: &Context, groups: &Groups, output: &mut OutDomIo) -> Result<()> {
    match groups.io() {
        Some(io) => primitives::bcast(ctx.datatype(TypeKind::OutDomIo), slice::from_mut(output), 1, ROOT, io),
        None => Ok(()),
    }
}

/// Send the timing statistics of every process to root and merge them there.
///
/// Returns the job-wide statistics on root and `None` elsewhere. Collective
/// over the world communicator.
pub fn report_wall_time(ctx: &Context, local: &WallTime) -> Result<Option<WallTime>> {
    let world = ctx.world();
    let datatype = ctx.datatype(TypeKind::WallTime);

    if !ctx.is_root() {
        primitives::send(
            world,
            datatype,
            slice::from_ref(local),
            1,
            ROOT,
            true,
            WALL_TIME_TAG,
            &mut PendingOperation::new(),
        )?;
        return Ok(None);
    }

    let size = world.size().value_as::<usize>().unwrap_or(0);
    let mut stats = Vec::new();
    if let Err(err) = stats.try_reserve_exact(size) {
        error!(%err, "cannot collect wall times, draining");
        for rank in 1..world.size() {
            primitives::recv_discard(world, datatype, 1, rank, WALL_TIME_TAG)?;
        }
        return Err(Error::out_of_memory("collecting wall times", err));
    }
    stats.push(*local);
    let mut incoming = [WallTime::default()];
    for rank in 1..world.size() {
        primitives::recv(
            world,
            datatype,
            &mut incoming,
            1,
            rank,
            true,
            WALL_TIME_TAG,
            &mut PendingOperation::new(),
        )?;
        stats.push(incoming[0]);
    }

    let merged = merge_wall_times(&stats);
    info!(
        mean = merged.time_mean,
        sd = merged.time_sd,
        min = merged.time_min,
        max = merged.time_max,
        timed = merged.n_timed_runs,
        untimed = merged.n_untimed_runs,
        "wall time"
    );
    Ok(Some(merged))
}

/// Combine per-process timing statistics.
///
/// The mean is weighted by the number of timed runs and the standard
/// deviation is the pooled sample deviation over all timed runs. Processes
/// without timed runs only contribute their untimed count.
pub fn merge_wall_times(stats: &[WallTime]) -> WallTime {
    let timed = stats.iter().filter(|s| s.n_timed_runs > 0);
    let n: u64 = timed.clone().map(|s| s.n_timed_runs).sum();
    let untimed = stats.iter().map(|s| s.n_untimed_runs).sum();
    if n == 0 {
        return WallTime {
            n_untimed_runs: untimed,
            ..WallTime::default()
        };
    }

    let total = n as f64;
    let mean = timed.clone().map(|s| s.n_timed_runs as f64 * s.time_mean).sum::<f64>() / total;
    let sd = if n < 2 {
        0.0
    } else {
        let squares: f64 = timed
            .clone()
            .map(|s| {
                let k = s.n_timed_runs as f64;
                (k - 1.0) * s.time_sd * s.time_sd + k * s.time_mean * s.time_mean
            })
            .sum();
        ((squares - total * mean * mean) / (total - 1.0)).max(0.0).sqrt()
    };

    WallTime {
        time_mean: mean,
        time_sd: sd,
        time_min: timed.clone().map(|s| s.time_min).fold(f64::INFINITY, f64::min),
        time_max: timed.map(|s| s.time_max).fold(f64::NEG_INFINITY, f64::max),
        n_timed_runs: n,
        n_untimed_runs: untimed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn pooled_statistics() {
        // runs of 1 s and 3 s on one process, 5 s on another
        let first = WallTime {
            time_mean: 2.0,
            time_sd: 2f64.sqrt(),
            time_min: 1.0,
            time_max: 3.0,
            n_timed_runs: 2,
            n_untimed_runs: 1,
        };
        let second = WallTime {
            time_mean: 5.0,
            time_sd: 0.0,
            time_min: 5.0,
            time_max: 5.0,
            n_timed_runs: 1,
            n_untimed_runs: 0,
        };
        let idle = WallTime {
            n_untimed_runs: 4,
            ..WallTime::default()
        };
        let merged = merge_wall_times(&[first, idle, second]);
        assert!(close(merged.time_mean, 3.0));
        assert!(close(merged.time_sd, 2.0));
        assert_eq!(merged.time_min, 1.0);
        assert_eq!(merged.time_max, 5.0);
        assert_eq!(merged.n_timed_runs, 3);
        assert_eq!(merged.n_untimed_runs, 5);
    }

    #[test]
    fn nothing_timed() {
        let merged = merge_wall_times(&[WallTime::default(), WallTime::default()]);
        assert_eq!(merged, WallTime::default());
        assert_eq!(merge_wall_times(&[]), WallTime::default());
    }
}
