//! Collective communication
//!
//! Collective operations run on a plane of their own, so they never match
//! point to point traffic of the same communicator. Every member has to call
//! the collectives of a communicator in the same order. The process with
//! local rank 0 acts as the hub of barriers and reductions.

use tracing::trace;

use crate::datatype::{Equivalence, UserDatatype};
use crate::error::Result;
use crate::point_to_point::{accept, check_packet, transmit};
use crate::topology::{Process, Rank, SimpleCommunicator};
use crate::transport::Plane;
use crate::Count;

/// Collective traits
pub mod traits {
    pub use super::{CommunicatorCollectives, Reduce, Root};
}

const HUB: Rank = 0;
const COLLECTIVE_TAG: i32 = 0;

/// Collective communication operations over all members of a communicator
pub trait CommunicatorCollectives {
    /// Barrier synchronization among all processes of a communicator
    ///
    /// Returns once every member has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Combine `send` of every member with `op` and store the result in `recv` on every member.
    fn all_reduce_into<T: Reduce>(&self, send: &T, recv: &mut T, op: SystemOperation) -> Result<()>;
}

impl CommunicatorCollectives for SimpleCommunicator {
    fn barrier(&self) -> Result<()> {
        let datatype = u8::equivalent_datatype()?;
        let mut token = [0u8];
        if self.rank() == HUB {
            for rank in 1..self.size() {
                accept(self, Plane::Collective, &datatype, &mut token, 1, rank, COLLECTIVE_TAG)?;
            }
            for rank in 1..self.size() {
                transmit(self, Plane::Collective, &datatype, &token, 1, rank, COLLECTIVE_TAG)?;
            }
        } else {
            transmit(self, Plane::Collective, &datatype, &token, 1, HUB, COLLECTIVE_TAG)?;
            accept(self, Plane::Collective, &datatype, &mut token, 1, HUB, COLLECTIVE_TAG)?;
        }
        trace!(rank = self.rank(), size = self.size(), "barrier passed");
        Ok(())
    }

    fn all_reduce_into<T: Reduce>(&self, send: &T, recv: &mut T, op: SystemOperation) -> Result<()> {
        let datatype = T::equivalent_datatype()?;
        let mut value = [*send];
        if self.rank() == HUB {
            let mut incoming = [*send];
            for rank in 1..self.size() {
                accept(self, Plane::Collective, &datatype, &mut incoming, 1, rank, COLLECTIVE_TAG)?;
                value[0] = value[0].combine(incoming[0], op);
            }
        } else {
            transmit(self, Plane::Collective, &datatype, &value, 1, HUB, COLLECTIVE_TAG)?;
        }
        self.process_at_rank(HUB).broadcast_described_into(&datatype, &mut value, 1)?;
        *recv = value[0];
        Ok(())
    }
}

/// Something that can take the role of 'root' in a collective operation.
pub trait Root {
    /// The communicator the root belongs to
    fn root_communicator(&self) -> &SimpleCommunicator;

    /// Rank of the root within its communicator
    fn root_rank(&self) -> Rank;

    /// Broadcast the contents of `buf` on the root to `buf` on all other members.
    fn broadcast_into<T: Equivalence>(&self, buf: &mut [T]) -> Result<()> {
        let datatype = T::equivalent_datatype()?;
        let count = buf.len();
        self.broadcast_described_into(&datatype, buf, count)
    }

    /// Broadcast the first `count` values of `buf`, described by `datatype`.
    fn broadcast_described_into<T: 'static>(
        &self,
        datatype: &UserDatatype,
        buf: &mut [T],
        count: Count,
    ) -> Result<()> {
        let comm = self.root_communicator();
        let root = self.root_rank();
        comm.world_rank(root)?;
        if comm.rank() == root {
            for rank in (0..comm.size()).filter(|&rank| rank != root) {
                transmit(comm, Plane::Collective, datatype, buf, count, rank, COLLECTIVE_TAG)?;
            }
        } else {
            accept(comm, Plane::Collective, datatype, buf, count, root, COLLECTIVE_TAG)?;
        }
        Ok(())
    }
}

/// Take part in a broadcast from local rank `root` without keeping the message.
///
/// The message is checked against `datatype` and `capacity` like one
/// received by [`Root::broadcast_described_into`].
pub(crate) fn discard_broadcast(
    comm: &SimpleCommunicator,
    root: Rank,
    datatype: &UserDatatype,
    capacity: Count,
) -> Result<()> {
    comm.world_rank(root)?;
    let packet = comm.transport().receive(Plane::Collective, root, COLLECTIVE_TAG)?;
    check_packet(datatype, &packet, capacity, root)?;
    trace!(root, count = packet.count, "broadcast discarded");
    Ok(())
}

impl<'a> Root for Process<'a> {
    fn root_communicator(&self) -> &SimpleCommunicator {
        self.communicator()
    }

    fn root_rank(&self) -> Rank {
        self.rank()
    }
}

/// A built-in reduction operation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SystemOperation {
    /// Sum
    Sum,
    /// Maximum
    Max,
    /// Minimum
    Min,
}

impl SystemOperation {
    /// Sum
    pub fn sum() -> SystemOperation {
        SystemOperation::Sum
    }

    /// Maximum
    pub fn max() -> SystemOperation {
        SystemOperation::Max
    }

    /// Minimum
    pub fn min() -> SystemOperation {
        SystemOperation::Min
    }
}

/// Values that built-in operations can combine
pub trait Reduce: Equivalence + Copy {
    /// Combine two values with `op`
    fn combine(self, other: Self, op: SystemOperation) -> Self;
}

macro_rules! reduce_integer {
    ($($t:ty),*) => {$(
        impl Reduce for $t {
            fn combine(self, other: Self, op: SystemOperation) -> Self {
                match op {
                    SystemOperation::Sum => self.wrapping_add(other),
                    SystemOperation::Max => Ord::max(self, other),
                    SystemOperation::Min => Ord::min(self, other),
                }
            }
        }
    )*};
}

macro_rules! reduce_float {
    ($($t:ty),*) => {$(
        impl Reduce for $t {
            fn combine(self, other: Self, op: SystemOperation) -> Self {
                match op {
                    SystemOperation::Sum => self + other,
                    SystemOperation::Max => self.max(other),
                    SystemOperation::Min => self.min(other),
                }
            }
        }
    )*};
}

reduce_integer!(i32, i64, u32, u64);
reduce_float!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_operations() {
        assert_eq!(3i32.combine(4, SystemOperation::sum()), 7);
        assert_eq!(3u64.combine(4, SystemOperation::max()), 4);
        assert_eq!((-3i64).combine(4, SystemOperation::min()), -3);
    }

    #[test]
    fn float_operations() {
        assert_eq!(1.5f64.combine(2.0, SystemOperation::sum()), 3.5);
        assert_eq!(1.5f32.combine(2.0, SystemOperation::min()), 1.5);
    }
}
