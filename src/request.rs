//! Request objects for non-blocking operations
//!
//! Non-blocking operations such as `immediate_synchronous_send_described()`
//! return a [`Request`] that borrows the buffers involved in the operation.
//! The transport carries the operation; `wait()` blocks until it has
//! finished and, for receives, writes the message into the borrowed buffer.
//!
//! A request that is dropped without being waited on is completed in its
//! destructor, so a borrowed receive buffer is always filled before the
//! borrow ends.
//!
//! [`PendingOperation`] is an in-out handle holding at most one outstanding
//! request: issuing a new operation on it first finalizes the previous one.

use std::fmt;

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::point_to_point::Status;
use crate::topology::Rank;
use crate::transport::{Packet, Transfer};

type Completion<'b> = Box<dyn FnOnce(Option<Packet>) -> Result<Status> + 'b>;

/// A non-blocking operation borrowing buffers for the lifetime `'b`
#[must_use]
pub struct Request<'b> {
    rank: Rank,
    transfer: Option<Box<dyn Transfer>>,
    complete: Option<Completion<'b>>,
}

impl<'b> Request<'b> {
    /// Track `transfer`; `complete` runs on its outcome in `wait()`.
    pub(crate) fn new<C>(rank: Rank, transfer: Box<dyn Transfer>, complete: C) -> Request<'b>
    where
        C: FnOnce(Option<Packet>) -> Result<Status> + 'b,
    {
        Request {
            rank,
            transfer: Some(transfer),
            complete: Some(Box::new(complete)),
        }
    }

    /// Wait for the operation to finish.
    ///
    /// Blocks the calling process until the operation has finished.
    pub fn wait(mut self) -> Result<Status> {
        self.finish()
    }

    /// Whether `wait()` would return without blocking
    pub fn is_complete(&self) -> bool {
        self.transfer.as_ref().map_or(true, |transfer| transfer.is_complete())
    }

    fn finish(&mut self) -> Result<Status> {
        let (Some(transfer), Some(complete)) = (self.transfer.take(), self.complete.take()) else {
            return Err(Error::ProtocolDefect("request completed twice".into()));
        };
        complete(transfer.wait()?)
    }
}

impl<'b> Drop for Request<'b> {
    fn drop(&mut self) {
        if self.transfer.is_some() {
            if let Err(err) = self.finish() {
                warn!(rank = self.rank, %err, "non-blocking operation failed during drop");
            }
        }
    }
}

impl<'b> fmt::Debug for Request<'b> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("rank", &self.rank)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// In-out handle with at most one outstanding operation.
#[derive(Debug, Default)]
pub struct PendingOperation<'b> {
    request: Option<Request<'b>>,
}

impl<'b> PendingOperation<'b> {
    /// A handle without an outstanding operation
    pub fn new() -> PendingOperation<'b> {
        PendingOperation { request: None }
    }

    /// Whether an operation is outstanding
    pub fn is_pending(&self) -> bool {
        self.request.is_some()
    }

    /// Wait on and release the outstanding operation, if any.
    pub fn finalize(&mut self) -> Result<Option<Status>> {
        match self.request.take() {
            Some(request) => {
                trace!(rank = request.rank, "finalizing pending operation");
                request.wait().map(Some)
            }
            None => Ok(None),
        }
    }

    /// Finalize the outstanding operation, then issue a new one.
    pub fn issue<F>(&mut self, start: F) -> Result<()>
    where
        F: FnOnce() -> Result<Request<'b>>,
    {
        self.finalize()?;
        self.request = Some(start()?);
        Ok(())
    }
}
