//! Send, receive and broadcast with uniform failure handling
//!
//! Any transport failure is logged and aborts the whole job; there are no
//! retries. In synchronous mode a call returns once the message has been
//! exchanged. In asynchronous mode the call first finalizes whatever is
//! outstanding on the `pending` handle and then starts the new operation
//! on it.

use tracing::error;

use crate::collective::{self, Root};
use crate::datatype::UserDatatype;
use crate::error::{Error, FailureKind, Result};
use crate::point_to_point::{Destination, Source, Status};
use crate::request::PendingOperation;
use crate::topology::{Rank, SimpleCommunicator};
use crate::{Count, Tag};

/// Turn a failed transport operation into a job abort.
///
/// Errors from an abort that is already under way pass through unchanged.
pub fn fatal(comm: &SimpleCommunicator, operation: &'static str, err: Error) -> Error {
    match err {
        Error::Aborted { .. } => err,
        err => {
            error!(rank = comm.rank(), operation, %err, "transport failure");
            comm.abort(FailureKind::Transport.code())
        }
    }
}

/// Send `count` values of `buf` to `destination`.
#[allow(clippy::too_many_arguments)]
pub fn send<'b, T: 'static>(
    comm: &SimpleCommunicator,
    datatype: &UserDatatype,
    buf: &'b [T],
    count: Count,
    destination: Rank,
    sync: bool,
    tag: Tag,
    pending: &mut PendingOperation<'b>,
) -> Result<()> {
    let process = comm.process_at_rank(destination);
    let result = if sync {
        process.synchronous_send_described(datatype, buf, count, tag)
    } else {
        pending.issue(move || process.immediate_synchronous_send_described(datatype, buf, count, tag))
    };
    result.map_err(|err| fatal(comm, "send", err))
}

/// Receive at most `count` values from `source` into `buf`.
///
/// Returns the status in synchronous mode; asynchronous receives report it
/// when `pending` is finalized.
#[allow(clippy::too_many_arguments)]
pub fn recv<'b, T: 'static>(
    comm: &SimpleCommunicator,
    datatype: &UserDatatype,
    buf: &'b mut [T],
    count: Count,
    source: Rank,
    sync: bool,
    tag: Tag,
    pending: &mut PendingOperation<'b>,
) -> Result<Option<Status>> {
    let process = comm.process_at_rank(source);
    let result = if sync {
        process
            .receive_described_into(datatype, buf, count, tag)
            .map(Some)
    } else {
        pending
            .issue(move || process.immediate_receive_described_into(datatype, buf, count, tag))
            .map(|()| None)
    };
    result.map_err(|err| fatal(comm, "receive", err))
}

/// Receive a message of at most `count` values from `source` and drop it.
pub fn recv_discard(
    comm: &SimpleCommunicator,
    datatype: &UserDatatype,
    count: Count,
    source: Rank,
    tag: Tag,
) -> Result<Status> {
    comm.process_at_rank(source)
        .receive_discard(datatype, count, tag)
        .map_err(|err| fatal(comm, "receive", err))
}

/// Broadcast `count` values of `buf` from `source` to every member of `comm`.
pub fn bcast<T: 'static>(
    datatype: &UserDatatype,
    buf: &mut [T],
    count: Count,
    source: Rank,
    comm: &SimpleCommunicator,
) -> Result<()> {
    comm.process_at_rank(source)
        .broadcast_described_into(datatype, buf, count)
        .map_err(|err| fatal(comm, "broadcast", err))
}

/// Take part in a broadcast from `source` and drop the message.
pub fn bcast_discard(
    datatype: &UserDatatype,
    count: Count,
    source: Rank,
    comm: &SimpleCommunicator,
) -> Result<()> {
    collective::discard_broadcast(comm, source, datatype, count)
        .map_err(|err| fatal(comm, "broadcast", err))
}

/// Wait on and release the operation outstanding on `pending`.
pub fn finalize(comm: &SimpleCommunicator, pending: &mut PendingOperation<'_>) -> Result<Option<Status>> {
    pending.finalize().map_err(|err| fatal(comm, "wait", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Equivalence;
    use crate::environment::Launcher;

    #[test]
    fn truncation_aborts_the_job() {
        let outcome = Launcher::from_layout(&[("a", 2)]).run(|universe| {
            let world = universe.world();
            let datatype = i32::equivalent_datatype()?;
            if world.rank() == 0 {
                let values = [1, 2, 3];
                let mut pending = PendingOperation::new();
                send(&world, &datatype, &values, 3, 1, true, 0, &mut pending)
            } else {
                let mut values = [0; 2];
                let mut pending = PendingOperation::new();
                recv(&world, &datatype, &mut values, 2, 0, true, 0, &mut pending).map(|_| ())
            }
        });
        assert_eq!(outcome.failure(), Some(FailureKind::Transport));
    }
}
