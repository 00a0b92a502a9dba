//! Point to point communication
//!
//! Endpoints of communication are described by types that implement the
//! [`Source`] and [`Destination`] traits. Communication operations are
//! provided methods of these traits.
//!
//! Every send is a synchronous hand-shake: it returns only once the
//! receiver has taken the message. Messages between a pair of processes on
//! one tag are received in the order they were sent.

use tracing::trace;

use crate::datatype::{Equivalence, UserDatatype};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::topology::{Process, Rank, SimpleCommunicator};
use crate::transport::{Packet, Plane};
use crate::{Count, Tag};

/// Point to point traits
pub mod traits {
    pub use super::{Destination, Source};
}

/// Describes a received message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    source_rank: Rank,
    tag: Tag,
    count: Count,
}

impl Status {
    /// The rank of the message source
    pub fn source_rank(&self) -> Rank {
        self.source_rank
    }

    /// The message tag
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Number of values received; zero for sends
    pub fn count(&self) -> Count {
        self.count
    }
}

pub(crate) fn pack<T: 'static>(datatype: &UserDatatype, buf: &[T], count: Count) -> Result<Packet> {
    Ok(Packet {
        signature: datatype.signature(),
        count,
        bytes: datatype.pack(buf, count)?,
    })
}

/// Check `packet` against the receive descriptor and unpack it into `buf`.
pub(crate) fn deliver<T: 'static>(
    datatype: &UserDatatype,
    packet: Packet,
    buf: &mut [T],
    capacity: Count,
    source_rank: Rank,
    tag: Tag,
) -> Result<Status> {
    check_packet(datatype, &packet, capacity, source_rank)?;
    datatype.unpack(&packet.bytes, buf, packet.count)?;
    Ok(Status {
        source_rank,
        tag,
        count: packet.count,
    })
}

pub(crate) fn check_packet(datatype: &UserDatatype, packet: &Packet, capacity: Count, source_rank: Rank) -> Result<()> {
    if packet.count > 0 && packet.signature != datatype.signature() {
        return Err(Error::SignatureMismatch { source_rank });
    }
    if packet.count > capacity {
        return Err(Error::Truncated {
            capacity,
            received: packet.count,
        });
    }
    Ok(())
}

/// Blocking send of `count` values on `plane` from the calling process to local rank `destination`.
pub(crate) fn transmit<T: 'static>(
    comm: &SimpleCommunicator,
    plane: Plane,
    datatype: &UserDatatype,
    buf: &[T],
    count: Count,
    destination: Rank,
    tag: Tag,
) -> Result<()> {
    comm.world_rank(destination)?;
    let packet = pack(datatype, buf, count)?;
    trace!(?plane, destination, tag, count, "send");
    comm.transport().send(plane, destination, tag, packet)
}

/// Blocking receive of at most `capacity` values on `plane` from local rank `source`.
pub(crate) fn accept<T: 'static>(
    comm: &SimpleCommunicator,
    plane: Plane,
    datatype: &UserDatatype,
    buf: &mut [T],
    capacity: Count,
    source: Rank,
    tag: Tag,
) -> Result<Status> {
    datatype.check_buffer::<T>(buf.len(), capacity)?;
    comm.world_rank(source)?;
    let packet = comm.transport().receive(plane, source, tag)?;
    trace!(?plane, source, tag, count = packet.count, "receive");
    deliver(datatype, packet, buf, capacity, source, tag)
}

/// Something that can be used as the source in a point to point receive operation
pub trait Source {
    /// The communicator the source belongs to
    fn source_communicator(&self) -> &SimpleCommunicator;

    /// Rank of the source within its communicator
    fn source_rank(&self) -> Rank;

    /// Receive a message into `buf`, which must be large enough to hold it.
    fn receive_into<T: Equivalence>(&self, buf: &mut [T]) -> Result<Status> {
        self.receive_into_with_tag(buf, 0)
    }

    /// Receive a message with tag `tag` into `buf`.
    fn receive_into_with_tag<T: Equivalence>(&self, buf: &mut [T], tag: Tag) -> Result<Status> {
        let datatype = T::equivalent_datatype()?;
        let capacity = buf.len();
        self.receive_described_into(&datatype, buf, capacity, tag)
    }

    /// Receive at most `capacity` values described by `datatype` into `buf`.
    fn receive_described_into<T: 'static>(
        &self,
        datatype: &UserDatatype,
        buf: &mut [T],
        capacity: Count,
        tag: Tag,
    ) -> Result<Status> {
        accept(
            self.source_communicator(),
            Plane::PointToPoint,
            datatype,
            buf,
            capacity,
            self.source_rank(),
            tag,
        )
    }

    /// Receive a message of at most `capacity` values and throw it away.
    ///
    /// The message is matched and checked against `datatype` like any other
    /// receive, only its contents are not kept.
    fn receive_discard(&self, datatype: &UserDatatype, capacity: Count, tag: Tag) -> Result<Status> {
        let comm = self.source_communicator();
        let source = self.source_rank();
        comm.world_rank(source)?;
        let packet = comm.transport().receive(Plane::PointToPoint, source, tag)?;
        check_packet(datatype, &packet, capacity, source)?;
        trace!(source, tag, count = packet.count, "discarded");
        Ok(Status {
            source_rank: source,
            tag,
            count: packet.count,
        })
    }

    /// Start a non-blocking receive of at most `capacity` values into `buf`.
    fn immediate_receive_described_into<'b, T: 'static>(
        &self,
        datatype: &UserDatatype,
        buf: &'b mut [T],
        capacity: Count,
        tag: Tag,
    ) -> Result<Request<'b>> {
        datatype.check_buffer::<T>(buf.len(), capacity)?;
        let comm = self.source_communicator();
        let source = self.source_rank();
        comm.world_rank(source)?;
        let transfer = comm.transport().post_receive(Plane::PointToPoint, source, tag)?;
        let datatype = datatype.clone();
        Ok(Request::new(comm.rank(), transfer, move |packet| match packet {
            Some(packet) => deliver(&datatype, packet, buf, capacity, source, tag),
            None => Err(Error::ProtocolDefect("receive finished without a message".into())),
        }))
    }
}

/// Something that can be used as the destination in a point to point send operation
pub trait Destination {
    /// The communicator the destination belongs to
    fn destination_communicator(&self) -> &SimpleCommunicator;

    /// Rank of the destination within its communicator
    fn destination_rank(&self) -> Rank;

    /// Send the contents of `buf`, returning once the receiver has taken it.
    fn synchronous_send<T: Equivalence>(&self, buf: &[T]) -> Result<()> {
        self.synchronous_send_with_tag(buf, 0)
    }

    /// Send the contents of `buf` with tag `tag`.
    fn synchronous_send_with_tag<T: Equivalence>(&self, buf: &[T], tag: Tag) -> Result<()> {
        let datatype = T::equivalent_datatype()?;
        self.synchronous_send_described(&datatype, buf, buf.len(), tag)
    }

    /// Send the first `count` values of `buf` described by `datatype`.
    fn synchronous_send_described<T: 'static>(
        &self,
        datatype: &UserDatatype,
        buf: &[T],
        count: Count,
        tag: Tag,
    ) -> Result<()> {
        transmit(
            self.destination_communicator(),
            Plane::PointToPoint,
            datatype,
            buf,
            count,
            self.destination_rank(),
            tag,
        )
    }

    /// Start a non-blocking synchronous send of the first `count` values of `buf`.
    ///
    /// The values are copied out before this returns; the request completes
    /// once the receiver has taken the message.
    fn immediate_synchronous_send_described<'b, T: 'static>(
        &self,
        datatype: &UserDatatype,
        buf: &'b [T],
        count: Count,
        tag: Tag,
    ) -> Result<Request<'b>> {
        let comm = self.destination_communicator();
        let destination = self.destination_rank();
        comm.world_rank(destination)?;
        let packet = pack(datatype, buf, count)?;
        let transfer = comm
            .transport()
            .post_send(Plane::PointToPoint, destination, tag, packet)?;
        let source_rank = comm.rank();
        Ok(Request::new(comm.rank(), transfer, move |_| {
            Ok(Status {
                source_rank,
                tag,
                count: 0,
            })
        }))
    }
}

impl<'a> Source for Process<'a> {
    fn source_communicator(&self) -> &SimpleCommunicator {
        self.communicator()
    }

    fn source_rank(&self) -> Rank {
        self.rank()
    }
}

impl<'a> Destination for Process<'a> {
    fn destination_communicator(&self) -> &SimpleCommunicator {
        self.communicator()
    }

    fn destination_rank(&self) -> Rank {
        self.rank()
    }
}
