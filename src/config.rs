//! Coordinator configuration
//!
//! Every process of a job must be started with the same configuration. It
//! can be built in code or read from YAML:
//!
//! ```yaml
//! io_target: 4
//! log_filter: "swmpi=debug"
//! fault:
//!   kind: allocation_failure
//!   rank: 3
//!   phase: handoff
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coordination::Phase;
use crate::error::{Error, Result};
use crate::topology::{Rank, ROOT};

/// Upper bound on the I/O processes designated per node
pub const DEFAULT_IO_TARGET: usize = 4;

fn default_io_target() -> usize {
    DEFAULT_IO_TARGET
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Settings shared by every process of a job
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Upper bound on the I/O processes per node
    #[serde(default = "default_io_target")]
    pub io_target: usize,

    /// The coordinating rank; only rank 0 is supported
    #[serde(default)]
    pub root: Rank,

    /// Log directives used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Failure to inject, for exercising the shutdown path
    #[serde(default)]
    pub fault: Option<InjectedFault>,
}

/// A simulated local failure
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InjectedFault {
    /// Allocations of `phase` on `rank` fail
    ///
    /// [`Phase::Topology`] hits root's node list. [`Phase::Designation`] hits
    /// root's designation table, or the stored designation on any other rank.
    /// [`Phase::Handoff`] hits an I/O rank's unit and served-rank lists.
    /// [`Phase::Groups`] and [`Phase::Sharing`] hit the rank lists and the
    /// received records of those phases.
    AllocationFailure {
        /// World rank that fails
        rank: Rank,
        /// Setup phase in which it fails
        phase: Phase,
    },
}

impl Default for CoordinatorConfig {
    fn default() -> CoordinatorConfig {
        CoordinatorConfig {
            io_target: DEFAULT_IO_TARGET,
            root: ROOT,
            log_filter: default_log_filter(),
            fault: None,
        }
    }
}

impl CoordinatorConfig {
    /// Parse a configuration from YAML and validate it.
    pub fn from_yaml(text: &str) -> Result<CoordinatorConfig> {
        let config: CoordinatorConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<CoordinatorConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), err))
        })?;
        CoordinatorConfig::from_yaml(&text)
    }

    /// Check the settings for values the coordinator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.io_target == 0 {
            return Err(Error::Configuration(
                "io_target must allow at least one I/O process per node".into(),
            ));
        }
        if self.root != ROOT {
            return Err(Error::Configuration(format!(
                "root must be rank {}, not {}",
                ROOT, self.root
            )));
        }
        Ok(())
    }

    /// Set the I/O target.
    pub fn with_io_target(mut self, io_target: usize) -> CoordinatorConfig {
        self.io_target = io_target;
        self
    }

    /// Inject an allocation failure on `rank` during `phase`.
    pub fn with_allocation_failure(mut self, rank: Rank, phase: Phase) -> CoordinatorConfig {
        self.fault = Some(InjectedFault::AllocationFailure { rank, phase });
        self
    }

    /// Whether an allocation on `rank` during `phase` is set up to fail
    pub fn fails_allocation(&self, rank: Rank, phase: Phase) -> bool {
        matches!(
            self.fault,
            Some(InjectedFault::AllocationFailure { rank: r, phase: p }) if r == rank && p == phase
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_document_gives_defaults() {
        let config = CoordinatorConfig::from_yaml("{}").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.io_target, 4);
    }

    #[test]
    fn fault_is_parsed() {
        let config = CoordinatorConfig::from_yaml(
            "io_target: 2\nfault:\n  kind: allocation_failure\n  rank: 3\n  phase: handoff\n",
        )
        .unwrap();
        assert_eq!(config.io_target, 2);
        assert!(config.fails_allocation(3, Phase::Handoff));
        assert!(!config.fails_allocation(3, Phase::Groups));
        assert!(!config.fails_allocation(2, Phase::Handoff));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = CoordinatorConfig::from_yaml("io_targets: 2\n").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn zero_io_target_is_invalid() {
        let err = CoordinatorConfig::from_yaml("io_target: 0\n").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn only_rank_zero_can_be_root() {
        assert!(CoordinatorConfig::from_yaml("root: 1\n").is_err());
    }
}
