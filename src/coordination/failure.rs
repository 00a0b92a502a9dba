//! Collective failure detection
//!
//! After every fallible local step, all participants of a phase sum a 0/1
//! failure flag. A non-zero sum stops the phase everywhere: every process
//! returns [`Error::SetupFailed`] and the process with local rank 0 aborts
//! the job once the flag has reached everyone.

use tracing::{debug, error, warn};

use crate::collective::{CommunicatorCollectives, SystemOperation};
use crate::coordination::primitives;
use crate::coordination::{Context, Phase};
use crate::error::{Error, FailureKind, Result};
use crate::topology::{SimpleCommunicator, ROOT};

/// Whether any participant of `comm` reports `local_failed`.
///
/// Collective over `comm`.
pub fn check_setup_status(local_failed: bool, comm: &SimpleCommunicator) -> Result<bool> {
    let flag = i32::from(local_failed);
    let mut failures = 0;
    comm.all_reduce_into(&flag, &mut failures, SystemOperation::sum())
        .map_err(|err| primitives::fatal(comm, "failure check", err))?;
    if failures > 0 {
        debug!(rank = comm.rank(), failures, "failure check reported failures");
    }
    Ok(failures > 0)
}

/// Close a phase: run the failure check on `local` and stop everywhere if
/// any participant failed.
///
/// A job that has already been aborted skips the check.
pub fn settle<T>(comm: &SimpleCommunicator, phase: Phase, local: Result<T>) -> Result<T> {
    if let Err(err @ Error::Aborted { .. }) = local {
        return Err(err);
    }
    if !check_setup_status(local.is_err(), comm)? {
        return local;
    }
    let cause = local.err();
    match &cause {
        Some(err) => error!(rank = comm.rank(), %phase, %err, "setup failed"),
        None => warn!(rank = comm.rank(), %phase, "setup failed on another process"),
    }
    if comm.rank() == ROOT {
        comm.abort(FailureKind::Setup.code());
    }
    Err(Error::SetupFailed {
        phase,
        cause: cause.map(Box::new),
    })
}

/// Log `message` and abort the job with `kind`.
pub fn fail(ctx: &Context, kind: FailureKind, message: &str) -> Error {
    error!(rank = ctx.rank(), node = ctx.node_name(), %kind, "{}", message);
    ctx.world().abort(kind.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Launcher;

    #[test]
    fn any_failure_is_seen_everywhere() {
        let outcome = Launcher::from_layout(&[("a", 4)]).run(|universe| {
            let world = universe.world();
            check_setup_status(universe.rank() == 2, &world)
        });
        assert_eq!(outcome.into_values().unwrap(), vec![true; 4]);
    }

    #[test]
    fn healthy_check_passes() {
        let outcome = Launcher::from_layout(&[("a", 3)]).run(|universe| {
            let world = universe.world();
            settle(&world, Phase::Topology, Ok(universe.rank()))
        });
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.into_values().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn settled_failure_aborts_through_root() {
        let outcome = Launcher::from_layout(&[("a", 3)]).run(|universe| {
            let world = universe.world();
            let local = if universe.rank() == 1 {
                Err(Error::Configuration("bad".into()))
            } else {
                Ok(())
            };
            settle(&world, Phase::Groups, local)
        });
        assert_eq!(outcome.failure(), Some(FailureKind::Setup));
        for result in &outcome.results {
            assert!(matches!(
                result,
                Err(Error::SetupFailed {
                    phase: Phase::Groups,
                    ..
                })
            ));
        }
    }
}
