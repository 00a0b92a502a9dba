#![warn(missing_docs)]
#![warn(missing_copy_implementations)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_qualifications)]

//! Start-up coordination layer for distributed ecohydrological simulations
//!
//! A simulation job is spread over many processes on one or more compute
//! nodes. Before the bulk of the computation starts, the processes have to
//! agree on who does what. This crate implements that agreement:
//!
//! - topology discovery (which ranks share a node),
//! - designation of every rank as a compute or an I/O process and the
//!   partition of the simulation units ("SUIDs") across I/O processes,
//! - delivery of every designation to its owner,
//! - the compute and I/O communication groups,
//! - wire formats for the configuration records shipped to every process,
//! - a collective failure check with a drain protocol, so that a failure on
//!   one process shuts the job down on every process instead of hanging it.
//!
//! A job runs one process per rank. With the `mpi` feature the processes are
//! started by the site's MPI launcher and talk through the MPI library, see
//! [`environment::initialize`]. Without it, [`environment::Launcher`] runs a
//! whole job inside one process over an in-process transport; tests and
//! demos use that. Either way a synchronous send returns only once its
//! receiver has taken the message.
//!
//! # Usage
//!
//! ```no_run
//! use swmpi::config::CoordinatorConfig;
//! use swmpi::coordination::{self, Context};
//! use swmpi::environment::Launcher;
//! use swmpi::records::Suid;
//!
//! let units: Vec<Suid> = (0..10).map(|i| Suid::new(i / 5, i % 5)).collect();
//! let units = coordination::WorkUnits::new(units);
//!
//! let outcome = Launcher::from_layout(&[("node-a", 3), ("node-b", 3)]).run(|universe| {
//!     let ctx = Context::new(&universe, CoordinatorConfig::default())?;
//!     let setup = coordination::setup(&ctx, Some(&units))?;
//!     Ok(setup.designation.role())
//! });
//! assert_eq!(outcome.exit_code, 0);
//! ```

extern crate self as swmpi;

pub mod collective;
pub mod config;
pub mod coordination;
pub mod datatype;
pub mod environment;
pub mod error;
pub mod point_to_point;
pub mod records;
pub mod registry;
pub mod request;
pub mod topology;
mod transport;

/// Re-exports all traits.
pub mod traits {
    pub use crate::collective::traits::*;
    pub use crate::datatype::traits::*;
    pub use crate::point_to_point::traits::*;
}

pub use crate::error::{Error, ErrorKind, FailureKind, Result};
pub use crate::topology::{Rank, ROOT};
pub use swmpi_derive::Equivalence;

#[doc(hidden)]
pub use memoffset;

/// Can be used to tag messages on the sender side and match on the receiver side.
pub type Tag = i32;
/// Encodes number of values in multi-value messages.
pub type Count = usize;
