//! Environmental management
//!
//! A job runs one process per rank. Under an MPI launcher (`mpirun`, `srun`,
//! ...) every process calls [`initialize`] once, which reads its rank, the
//! job size and its node name from the library. This needs the `mpi`
//! feature.
//!
//! A [`Launcher`] runs a whole job inside the calling process instead, one
//! thread per rank over an in-process transport, and is what tests and demos
//! use. It hands every rank its [`Universe`]. When a rank fails with an error
//! that has not already been settled collectively, or panics, the launcher
//! aborts the job so that no peer stays blocked. The job's exit status is the
//! abort code, or zero.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use conv::ConvUtil;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, FailureKind, Result};
use crate::topology::{Rank, SimpleCommunicator};
use crate::transport::fabric::{Endpoint, Fabric};
use crate::transport::Transport;

/// Install a `tracing` subscriber for the process.
///
/// `RUST_LOG` takes precedence over `default_filter`. Installing twice is
/// harmless; the first subscriber stays.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}

/// Initialize the MPI library and return the calling process's [`Universe`].
///
/// Rank, job size and node name come from the launcher that started the
/// process. The library is finalized once the universe and every
/// communicator derived from it are dropped. Fails if the library has
/// already been initialized.
///
/// # Examples
/// See `demos/mpirun.rs`
#[cfg(feature = "mpi")]
pub fn initialize() -> Result<Universe> {
    let launched = crate::transport::native::initialize()?;
    Ok(Universe {
        world: Rc::new(launched.world),
        size: launched.size,
        rank: launched.rank,
        processor_name: launched.processor_name,
    })
}

/// Global context of one rank
pub struct Universe {
    world: Rc<dyn Transport>,
    size: Rank,
    rank: Rank,
    processor_name: String,
}

impl Universe {
    /// The 'world communicator'
    ///
    /// Contains all processes initially partaking in the job.
    pub fn world(&self) -> SimpleCommunicator {
        SimpleCommunicator::world(Rc::clone(&self.world), self.size, self.rank)
    }

    /// Rank of the calling process in the world communicator
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of processes in the job
    pub fn size(&self) -> Rank {
        self.size
    }

    /// Name of the node the calling process runs on
    pub fn processor_name(&self) -> &str {
        &self.processor_name
    }

    /// Abort every process of the job with `kind` as the exit status.
    pub fn abort(&self, kind: FailureKind) -> Error {
        self.world.abort(kind.code())
    }

    /// Pass `result` through, aborting the job first if it is an error the
    /// other ranks have not already learned about.
    ///
    /// Setup failures and aborts are settled collectively; any other error
    /// would leave peers blocked.
    pub fn finish<T>(&self, result: Result<T>) -> Result<T> {
        abort_unsettled(&*self.world, self.rank, result)
    }
}

fn abort_unsettled<T>(world: &dyn Transport, rank: Rank, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        if !matches!(err, Error::SetupFailed { .. } | Error::Aborted { .. }) {
            error!(rank, %err, "rank failed");
            world.abort(err.failure_kind().code());
        }
    }
    result
}

/// What a finished job left behind
#[derive(Debug)]
pub struct JobOutcome<T> {
    /// Per-rank results, indexed by world rank
    pub results: Vec<Result<T>>,
    /// Zero on success, otherwise the abort code
    pub exit_code: i32,
}

impl<T> JobOutcome<T> {
    /// Whether every rank succeeded
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.results.iter().all(Result::is_ok)
    }

    /// The failure reason behind a non-zero exit code
    pub fn failure(&self) -> Option<FailureKind> {
        FailureKind::from_code(self.exit_code)
    }

    /// The per-rank values if every rank succeeded, the first error otherwise
    pub fn into_values(self) -> Result<Vec<T>> {
        self.results.into_iter().collect()
    }
}

/// Starts the ranks of a job.
#[derive(Clone, Debug)]
pub struct Launcher {
    names: Vec<String>,
}

impl Launcher {
    /// One rank per entry of `names`; entry `i` is the node of rank `i`.
    pub fn new<I, S>(names: I) -> Launcher
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Launcher {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Ranks laid out node by node: `count` consecutive ranks per `(node, count)`.
    pub fn from_layout(layout: &[(&str, usize)]) -> Launcher {
        Launcher::new(
            layout
                .iter()
                .flat_map(|&(node, count)| std::iter::repeat(node).take(count)),
        )
    }

    /// Number of ranks started by `run`
    pub fn size(&self) -> usize {
        self.names.len()
    }

    /// Run `job` on every rank and wait for all of them.
    pub fn run<T, F>(&self, job: F) -> JobOutcome<T>
    where
        T: Send,
        F: Fn(Universe) -> Result<T> + Sync,
    {
        let size = match self.names.len().value_as::<Rank>() {
            Ok(size) if size > 0 => size,
            _ => {
                error!(ranks = self.names.len(), "unsupported job size");
                return JobOutcome {
                    results: Vec::new(),
                    exit_code: FailureKind::Setup.code(),
                };
            }
        };
        let fabric = Arc::new(Fabric::new(self.names.clone()));
        info!(size, "starting job");

        let results: Vec<Result<T>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let fabric = Arc::clone(&fabric);
                    let job = &job;
                    thread::Builder::new()
                        .name(format!("rank-{}", rank))
                        .spawn_scoped(scope, move || run_rank(fabric, size, rank, job))
                })
                .collect();

            handles
                .into_iter()
                .zip(0..)
                .map(|(handle, rank)| match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Panicked { rank })),
                    Err(err) => {
                        let err = Error::Spawn(err);
                        error!(rank, %err, "cannot start rank");
                        Err(fabric.abort(err.failure_kind().code()))
                    }
                })
                .collect()
        });

        let exit_code = fabric.abort_code().unwrap_or_else(|| {
            results
                .iter()
                .find_map(|result| result.as_ref().err())
                .map_or(0, |err| err.failure_kind().code())
        });
        if exit_code != 0 {
            warn!(exit_code, "job terminated");
        }
        JobOutcome { results, exit_code }
    }
}

fn run_rank<T, F>(fabric: Arc<Fabric>, size: Rank, rank: Rank, job: &F) -> Result<T>
where
    F: Fn(Universe) -> Result<T>,
{
    let world: Rc<dyn Transport> = Rc::new(Endpoint::world(Arc::clone(&fabric), size, rank));
    let universe = Universe {
        world: Rc::clone(&world),
        size,
        rank,
        processor_name: fabric.processor_name(rank).to_string(),
    };
    match panic::catch_unwind(AssertUnwindSafe(|| job(universe))) {
        Ok(result) => abort_unsettled(&*world, rank, result),
        Err(_) => {
            error!(rank, "rank panicked");
            world.abort(FailureKind::Computation.code());
            Err(Error::Panicked { rank })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point_to_point::traits::*;

    #[test]
    fn layout_assigns_consecutive_ranks() {
        let launcher = Launcher::from_layout(&[("a", 2), ("b", 1)]);
        assert_eq!(launcher.size(), 3);
        let outcome = launcher.run(|universe| Ok(universe.processor_name().to_string()));
        assert!(outcome.is_success());
        assert_eq!(outcome.into_values().unwrap(), vec!["a", "a", "b"]);
    }

    #[test]
    fn failing_rank_unblocks_its_peers() {
        let outcome = Launcher::from_layout(&[("a", 2)]).run(|universe| {
            let world = universe.world();
            if universe.rank() == 0 {
                Err(Error::Configuration("broken".into()))
            } else {
                let mut buf = [0i32];
                world.process_at_rank(0).receive_into(&mut buf)?;
                Ok(())
            }
        });
        assert_eq!(outcome.failure(), Some(FailureKind::Setup));
        assert!(matches!(outcome.results[1], Err(Error::Aborted { code: 4 })));
    }

    #[test]
    fn panicking_rank_is_reported() {
        let outcome = Launcher::from_layout(&[("a", 1)]).run(|_| -> Result<()> {
            panic!("boom");
        });
        assert_eq!(outcome.failure(), Some(FailureKind::Computation));
        assert!(matches!(outcome.results[0], Err(Error::Panicked { rank: 0 })));
    }
}
