use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use flatdb_core::{DispatchError, PartitionId};

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("invalid value {value:?} for `{key}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("You must specify partitions in config file!")]
    NoPartitions,

    #[error("no backend selected (set `backend`)")]
    MissingBackend,

    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Construction of a [`DataServer`](crate::DataServer) failed.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("partition {0} configured twice")]
    DuplicatePartition(PartitionId),

    #[error("cannot spawn execution context")]
    Spawn(#[source] io::Error),
}

/// One partition's share of a failed start or stop.
#[derive(Debug)]
pub struct PartitionFailure {
    pub partition: PartitionId,
    pub error: DispatchError,
}

impl fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error.partition() {
            Some(_) => write!(f, "{}", self.error),
            None => write!(f, "partition {}: {}", self.partition, self.error),
        }
    }
}

/// Aggregated per-partition failures from `start` or `stop`.
///
/// Partitions not listed completed successfully.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to open {}", join(.0))]
    Open(Vec<PartitionFailure>),

    #[error("failed to close {}", join(.0))]
    Close(Vec<PartitionFailure>),
}

impl LifecycleError {
    pub fn failures(&self) -> &[PartitionFailure] {
        match self {
            Self::Open(f) | Self::Close(f) => f,
        }
    }

    pub fn failed_partitions(&self) -> Vec<PartitionId> {
        self.failures().iter().map(|f| f.partition).collect()
    }
}

fn join(failures: &[PartitionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
