//! Moving packed messages between the members of a communicator
//!
//! A [`Transport`] carries [`Packet`]s between the members of one
//! communicator, addressed by their rank within it. Two implementations
//! exist:
//!
//! - [`native`] runs on an MPI library, one process per rank, as started by
//!   the site's launcher (`mpirun`, `srun`, ...). Enabled by the `mpi`
//!   feature.
//! - [`fabric`] connects ranks that share one address space. It backs the
//!   [`Launcher`](crate::environment::Launcher) used by tests and demos.
//!
//! Sends are synchronous: a send completes only once the receiver has taken
//! the message. Posted operations never start a thread; a posted send is
//! handed to the transport right away, a posted receive takes its message
//! when it is waited on.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::topology::Rank;
use crate::{Count, Tag};

pub(crate) mod fabric;
#[cfg(feature = "mpi")]
pub(crate) mod native;

/// Point-to-point and collective traffic of one communicator never mix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Plane {
    PointToPoint,
    Collective,
}

/// A message in flight.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Packet {
    pub signature: u64,
    pub count: Count,
    pub bytes: Vec<u8>,
}

const HEADER: usize = 16;

#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
impl Packet {
    /// The packet as one byte string: signature, count, then the payload.
    pub fn encode(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER + self.bytes.len());
        frame.extend_from_slice(&self.signature.to_le_bytes());
        frame.extend_from_slice(&(self.count as u64).to_le_bytes());
        frame.extend_from_slice(&self.bytes);
        frame
    }

    /// Split a byte string produced by [`Packet::encode`].
    pub fn decode(mut frame: Vec<u8>, source_rank: Rank) -> Result<Packet> {
        let malformed = || Error::MalformedFrame {
            source_rank,
            len: frame.len(),
        };
        if frame.len() < HEADER {
            return Err(malformed());
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&frame[..8]);
        let signature = u64::from_le_bytes(word);
        word.copy_from_slice(&frame[8..HEADER]);
        let count = usize::try_from(u64::from_le_bytes(word)).map_err(|_| malformed())?;
        let bytes = frame.split_off(HEADER);
        Ok(Packet {
            signature,
            count,
            bytes,
        })
    }
}

/// How the members of one communicator reach each other.
///
/// Ranks are local to the communicator.
pub(crate) trait Transport {
    /// Hand `packet` to `destination`, blocking until it has been taken.
    fn send(&self, plane: Plane, destination: Rank, tag: Tag, packet: Packet) -> Result<()>;

    /// Take the next packet from `source`, blocking until one arrives.
    fn receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Packet>;

    /// Start a send that completes once `destination` has taken `packet`.
    fn post_send(
        &self,
        plane: Plane,
        destination: Rank,
        tag: Tag,
        packet: Packet,
    ) -> Result<Box<dyn Transfer>>;

    /// Start a receive from `source`.
    fn post_receive(&self, plane: Plane, source: Rank, tag: Tag) -> Result<Box<dyn Transfer>>;

    /// The transport of the group made of the members at `ranks`, in that order.
    ///
    /// Called by exactly the listed members, each passing the same list and
    /// `tag`.
    fn create_group(&self, ranks: &[Rank], tag: Tag) -> Result<Rc<dyn Transport>>;

    /// Abort every process of the job with `code`.
    fn abort(&self, code: i32) -> Error;

    /// The abort code, once the job has been aborted and this process still runs
    fn abort_code(&self) -> Option<i32>;
}

/// A posted send or receive.
pub(crate) trait Transfer {
    /// Block until the operation has finished; receives yield their packet.
    fn wait(self: Box<Self>) -> Result<Option<Packet>>;

    /// Whether `wait` would return without blocking
    fn is_complete(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_header_and_payload() {
        let packet = Packet {
            signature: 0xfeed,
            count: 3,
            bytes: vec![1, 2, 3],
        };
        let frame = packet.encode();
        assert_eq!(frame.len(), HEADER + 3);
        let packet = Packet::decode(frame, 2).unwrap();
        assert_eq!(packet.signature, 0xfeed);
        assert_eq!(packet.count, 3);
        assert_eq!(packet.bytes, vec![1, 2, 3]);
    }

    #[test]
    fn short_frames_are_rejected() {
        let result = Packet::decode(vec![0; HEADER - 1], 5);
        assert!(matches!(
            result,
            Err(Error::MalformedFrame {
                source_rank: 5,
                len: 15
            })
        ));
    }
}
