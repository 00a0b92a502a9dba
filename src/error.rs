//! Error handling and failure reasons
//!
//! Every fallible operation in this crate returns [`Result`]. Errors are
//! grouped into an [`ErrorKind`] that decides how the coordination layer
//! reacts: transport failures abort the job right away, everything else is
//! recorded locally and settled through the collective setup check.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use crate::coordination::Phase;
use crate::topology::Rank;

/// Shorthand for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reason codes used when the whole job is aborted.
///
/// The numeric value becomes the exit status reported by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FailureKind {
    /// The geospatial input/output layer failed
    NetCdf = 1,
    /// A simulation run failed
    Computation = 2,
    /// A send, receive, broadcast or group creation failed
    Transport = 3,
    /// A setup phase failed on at least one process
    Setup = 4,
}

impl FailureKind {
    /// The abort code of this failure reason
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an abort code back onto a failure reason
    pub fn from_code(code: i32) -> Option<FailureKind> {
        match code {
            1 => Some(FailureKind::NetCdf),
            2 => Some(FailureKind::Computation),
            3 => Some(FailureKind::Transport),
            4 => Some(FailureKind::Setup),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::NetCdf => "netCDF failure",
            FailureKind::Computation => "computation failure",
            FailureKind::Transport => "transport failure",
            FailureKind::Setup => "setup failure",
        };
        f.write_str(name)
    }
}

/// Error classes, deciding how a failure propagates through the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A send/receive/broadcast/group primitive failed; always fatal
    Transport,
    /// An allocation could not be satisfied
    ResourceExhaustion,
    /// The job layout or the supplied inputs cannot be coordinated
    Configuration,
    /// The designation data is internally inconsistent
    ProtocolDefect,
    /// The job has been aborted, or a setup phase failed collectively
    Aborted,
}

/// Errors raised by the coordination layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The destination or source rank is not part of the communicator
    #[error("rank {rank} is out of range for a communicator of size {size}")]
    InvalidRank { rank: Rank, size: Rank },

    /// More elements arrived than the receive buffer can hold
    #[error("message truncated: buffer holds {capacity} elements but {received} arrived")]
    Truncated { capacity: usize, received: usize },

    /// The element count exceeds the supplied buffer
    #[error("count {count} exceeds the buffer length {len}")]
    CountOutOfRange { count: usize, len: usize },

    /// Sender and receiver disagree on the message layout
    #[error("type signature mismatch between sender and receiver (from rank {source_rank})")]
    SignatureMismatch { source_rank: Rank },

    /// A descriptor was used with a buffer of a different Rust type
    #[error("descriptor `{descriptor}` does not describe `{buffer}`")]
    DatatypeMismatch {
        descriptor: &'static str,
        buffer: &'static str,
    },

    /// A wire-format descriptor could not be built
    #[error("cannot build wire format for `{type_name}`: {reason}")]
    Datatype {
        type_name: &'static str,
        reason: String,
    },

    /// A rank of an in-process job could not be started
    #[error("cannot start rank: {0}")]
    Spawn(#[source] std::io::Error),

    /// A received frame is too short to carry a message header
    #[error("malformed frame of {len} bytes from rank {source_rank}")]
    MalformedFrame { source_rank: Rank, len: usize },

    /// A message is too large for the transport
    #[error("message of {len} bytes exceeds the transport limit")]
    Oversized { len: usize },

    /// The MPI library reported an error
    #[error("{call} failed with code {code}")]
    Native { call: &'static str, code: i32 },

    /// A peer vanished without completing the operation
    #[error("link from rank {source_rank} to rank {destination} is closed")]
    Disconnected { source_rank: Rank, destination: Rank },

    /// An allocation failed
    #[error("out of memory while {context}")]
    ResourceExhaustion {
        context: &'static str,
        #[source]
        source: Option<TryReserveError>,
    },

    /// The job layout or inputs cannot be coordinated
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The coordinator configuration could not be parsed
    #[error("cannot parse coordinator configuration")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The designation data is internally inconsistent
    #[error("protocol defect: {0}")]
    ProtocolDefect(String),

    /// At least one process reported a failure during a setup phase
    #[error("setup failed during {phase}")]
    SetupFailed {
        phase: Phase,
        #[source]
        cause: Option<Box<Error>>,
    },

    /// The job was aborted
    #[error("job aborted with code {code}")]
    Aborted { code: i32 },

    /// A rank panicked
    #[error("rank {rank} panicked")]
    Panicked { rank: Rank },
}

impl Error {
    /// The class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRank { .. }
            | Error::Truncated { .. }
            | Error::CountOutOfRange { .. }
            | Error::SignatureMismatch { .. }
            | Error::DatatypeMismatch { .. }
            | Error::Spawn(_)
            | Error::MalformedFrame { .. }
            | Error::Oversized { .. }
            | Error::Native { .. }
            | Error::Disconnected { .. } => ErrorKind::Transport,
            Error::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Error::Datatype { .. } | Error::Configuration(_) | Error::ConfigParse(_) => {
                ErrorKind::Configuration
            }
            Error::ProtocolDefect(_) => ErrorKind::ProtocolDefect,
            Error::SetupFailed { .. } | Error::Aborted { .. } | Error::Panicked { .. } => {
                ErrorKind::Aborted
            }
        }
    }

    /// Abort code used when this error ends the job
    pub fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            ErrorKind::Transport => FailureKind::Transport,
            ErrorKind::Aborted => match self {
                Error::Aborted { code } => {
                    FailureKind::from_code(*code).unwrap_or(FailureKind::Setup)
                }
                Error::Panicked { .. } => FailureKind::Computation,
                _ => FailureKind::Setup,
            },
            _ => FailureKind::Setup,
        }
    }

    /// The error that started a collective setup failure, if known locally
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::SetupFailed {
                cause: Some(cause), ..
            } => cause.root_cause(),
            other => other,
        }
    }

    pub(crate) fn out_of_memory(context: &'static str, source: TryReserveError) -> Error {
        Error::ResourceExhaustion {
            context,
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_round_trip() {
        for kind in [
            FailureKind::NetCdf,
            FailureKind::Computation,
            FailureKind::Transport,
            FailureKind::Setup,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FailureKind::from_code(0), None);
    }

    #[test]
    fn transport_errors_abort_with_transport_code() {
        let err = Error::Truncated {
            capacity: 1,
            received: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.failure_kind(), FailureKind::Transport);
    }

    #[test]
    fn root_cause_unwraps_setup_failures() {
        let err = Error::SetupFailed {
            phase: Phase::Designation,
            cause: Some(Box::new(Error::Configuration("single process node".into()))),
        };
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_eq!(err.root_cause().kind(), ErrorKind::Configuration);
    }
}
