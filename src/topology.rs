//! Organizing processes as groups and communicators
//!
//! Processes are organized in communicators. All processes initially
//! partaking in the job are organized in the 'world communicator', which is
//! available from the [`Universe`](crate::environment::Universe). Sub-groups
//! such as the compute and the I/O group are created from it with
//! [`SimpleCommunicator::split_by_subgroup_with_tag`]. Processes are
//! addressed via their `Rank` within a specific communicator; this
//! information is encapsulated in a [`Process`].

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use conv::ConvUtil;
use tracing::debug;

use crate::collective::CommunicatorCollectives;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::Tag;

/// Identifies a certain process within a communicator.
pub type Rank = i32;

/// The rank that drives the coordination protocol
pub const ROOT: Rank = 0;

/// A communicator: a context for communication among an ordered set of processes.
///
/// Cloning a communicator yields another handle to the same context.
#[derive(Clone)]
pub struct SimpleCommunicator {
    transport: Rc<dyn Transport>,
    members: Rc<[Rank]>,
    rank: Rank,
}

impl SimpleCommunicator {
    pub(crate) fn world(transport: Rc<dyn Transport>, size: Rank, rank: Rank) -> SimpleCommunicator {
        SimpleCommunicator {
            transport,
            members: (0..size).collect(),
            rank,
        }
    }

    /// Number of processes in this communicator
    pub fn size(&self) -> Rank {
        self.members.len().value_as::<Rank>().unwrap_or(Rank::MAX)
    }

    /// The `Rank` that identifies the calling process within this communicator
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// World ranks of the members, in local rank order
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// The process with the given local `rank`.
    pub fn process_at_rank(&self, rank: Rank) -> Process<'_> {
        Process { comm: self, rank }
    }

    /// The process with rank [`ROOT`]
    pub fn root_process(&self) -> Process<'_> {
        self.process_at_rank(ROOT)
    }

    /// The world rank of local rank `rank`
    pub fn world_rank(&self, rank: Rank) -> Result<Rank> {
        usize::try_from(rank)
            .ok()
            .and_then(|index| self.members.get(index))
            .copied()
            .ok_or(Error::InvalidRank {
                rank,
                size: self.size(),
            })
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Create a communicator containing the processes at local `ranks`, in that order.
    ///
    /// Only the listed processes take part; each of them has to pass the same
    /// list and `tag`. Processes not listed get `None` without communicating.
    /// The call returns once every member has created the communicator.
    pub fn split_by_subgroup_with_tag(
        &self,
        ranks: &[Rank],
        tag: Tag,
    ) -> Result<Option<SimpleCommunicator>> {
        let mut seen = HashSet::with_capacity(ranks.len());
        let mut members = Vec::with_capacity(ranks.len());
        for &rank in ranks {
            if !seen.insert(rank) {
                return Err(Error::Configuration(format!(
                    "rank {} is listed twice in a group",
                    rank
                )));
            }
            members.push(self.world_rank(rank)?);
        }

        let Some(position) = ranks.iter().position(|&rank| rank == self.rank) else {
            return Ok(None);
        };

        let comm = SimpleCommunicator {
            transport: self.transport.create_group(ranks, tag)?,
            members: members.into(),
            rank: position.value_as::<Rank>().unwrap_or(Rank::MAX),
        };
        comm.barrier()?;
        debug!(tag, rank = comm.rank, size = comm.size(), "created group");
        Ok(Some(comm))
    }

    /// Abort every process of the job with `code` and return the resulting error.
    pub fn abort(&self, code: i32) -> Error {
        self.transport.abort(code)
    }

    /// The abort code, once the job has been aborted
    pub fn abort_code(&self) -> Option<i32> {
        self.transport.abort_code()
    }
}

impl fmt::Debug for SimpleCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCommunicator")
            .field("rank", &self.rank)
            .field("members", &self.members)
            .finish()
    }
}

/// Identifies a process by its `Rank` within a certain communicator.
#[derive(Copy, Clone, Debug)]
pub struct Process<'a> {
    comm: &'a SimpleCommunicator,
    rank: Rank,
}

impl<'a> Process<'a> {
    /// The process rank
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The communicator the rank refers to
    pub fn communicator(&self) -> &'a SimpleCommunicator {
        self.comm
    }

    /// Whether this is the calling process
    pub fn is_self(&self) -> bool {
        self.rank == self.comm.rank
    }
}
