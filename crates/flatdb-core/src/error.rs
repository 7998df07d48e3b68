//! FlatDB error types.
//!
//! Each concern gets its own enum. Connection-level problems are
//! [`ProtocolError`]s, plugin failures are [`BackendError`]s, and
//! everything that can go wrong between a decoded request and its
//! response is a [`DispatchError`].

use std::fmt;

use thiserror::Error;

use crate::partition::PartitionId;

/// Framing errors. Fatal to the offending connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Size prefix too small to hold the fixed request header, or negative.
    #[error("frame length {0} cannot hold the 9-byte request header")]
    InvalidLength(i32),
    /// Size prefix larger than the configured limit.
    #[error("frame length {len} exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    /// Operation byte is neither read nor write.
    #[error("Unsupported operation {0}")]
    UnsupportedOperation(u8),
    /// Response bytes do not form a valid response frame.
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
}

/// Failure reported by a backend plugin.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend does not implement this operation.
    #[error("operation not supported by this backend")]
    Unsupported,
    /// The request body was not understood by the backend.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Free-form failure with an optional underlying cause.
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BackendError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Everything that can fail between a parsed request and its response.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unsupported operation {0}")]
    UnsupportedOperation(u8),
    /// Partition id not in the configured set. A client/config bug, not retryable.
    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),
    /// Partition exists but its backend is not open.
    #[error("partition {0} is not started")]
    NotStarted(PartitionId),
    /// The partition's execution context has shut down.
    #[error("execution context for partition {0} is closed")]
    ContextClosed(PartitionId),
    /// The completion was dropped without ever being completed.
    #[error("operation abandoned before completion")]
    Abandoned,
    #[error("partition {partition}: {source}")]
    Backend {
        partition: PartitionId,
        #[source]
        source: BackendError,
    },
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            Self::UnknownPartition(_) => ErrorKind::UnknownPartition,
            Self::NotStarted(_) | Self::ContextClosed(_) => ErrorKind::PartitionUnavailable,
            Self::Abandoned => ErrorKind::Abandoned,
            Self::Backend { .. } => ErrorKind::BackendFailure,
        }
    }

    /// Partition the error is attributed to, if any.
    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            Self::UnknownPartition(p) | Self::NotStarted(p) | Self::ContextClosed(p) => Some(*p),
            Self::Backend { partition, .. } => Some(*partition),
            Self::UnsupportedOperation(_) | Self::Abandoned => None,
        }
    }
}

/// Coarse error category carried in failure response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedOperation,
    UnknownPartition,
    PartitionUnavailable,
    BackendFailure,
    Abandoned,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedOperation => "unsupported_operation",
            Self::UnknownPartition => "unknown_partition",
            Self::PartitionUnavailable => "partition_unavailable",
            Self::BackendFailure => "backend_failure",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
