//! Error types for the commit engine.
//!
//! Each is a marker; details travel as `error_stack` attachments.

use std::fmt;

/// A local log operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogError {
    /// The CAS store could not be read or written.
    StorageUnavailable,
    /// Every compare-and-swap retry lost to a concurrent writer.
    TooConcurrent,
    /// The slot's row holds bytes that are not a WAL entry.
    CorruptEntry,
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageUnavailable => f.write_str("log storage unavailable"),
            Self::TooConcurrent => f.write_str("too much contention on log slot"),
            Self::CorruptEntry => f.write_str("corrupt log entry"),
        }
    }
}

impl std::error::Error for LogError {}

/// Marker error raised by a [`crate::CasStore`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageError;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("storage operation failed")
    }
}

impl std::error::Error for StorageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// The stage's backlog is full.
    Overloaded,
    /// An item was routed to a stage that was never configured.
    StageNotRegistered,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overloaded => f.write_str("pipeline stage is overloaded"),
            Self::StageNotRegistered => f.write_str("pipeline stage is not registered"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// A commit request was refused before any consensus work began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    Overloaded,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overloaded => f.write_str("commit engine is overloaded"),
        }
    }
}

impl std::error::Error for CommitError {}

/// A bounded wait elapsed before the commit resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out waiting for commit")
    }
}

impl std::error::Error for TimedOut {}

/// A request was handed to a transport but no response will arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The connection dropped while the request was in flight.
    ConnectionLost,
    /// The transport has shut down.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost => f.write_str("connection lost before response"),
            Self::Closed => f.write_str("transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Why a commit attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    StorageUnavailable,
    TooConcurrent,
    /// Enough replicas failed or stayed silent that a majority is out of reach.
    QuorumUnreachable,
    /// The local replica already holds a higher proposal for the slot.
    Superseded,
}

impl From<LogError> for AbortReason {
    fn from(err: LogError) -> Self {
        match err {
            LogError::StorageUnavailable | LogError::CorruptEntry => Self::StorageUnavailable,
            LogError::TooConcurrent => Self::TooConcurrent,
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageUnavailable => f.write_str("storage unavailable"),
            Self::TooConcurrent => f.write_str("too concurrent"),
            Self::QuorumUnreachable => f.write_str("quorum unreachable"),
            Self::Superseded => f.write_str("superseded by a higher proposal"),
        }
    }
}
