//! Error taxonomy for the replay engine
//!
//! Trace and model consistency errors are fatal: every participant assumes its
//! peers reach the next collective call, so a participant that cannot continue
//! aborts the whole job. Callback errors raised by external analysis callbacks
//! are recoverable and are only recorded on the replay context.

use thiserror::Error;

use crate::defs::{CallpathId, CommId, LocationId, WindowId};
use crate::trace::EventId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("unknown callpath id {0:?}")]
    UnknownCallpath(CallpathId),

    #[error("unknown communicator id {0:?}")]
    UnknownCommunicator(CommId),

    #[error("unknown window id {0:?}")]
    UnknownWindow(WindowId),

    #[error("unknown location id {0:?}")]
    UnknownLocation(LocationId),

    #[error("event {0:?} is already classified as a synchpoint")]
    DuplicateSynchpoint(EventId),

    #[error("event {0:?} is not a recorded synchpoint")]
    NotASynchpoint(EventId),

    #[error("no synchpoint before event {event:?} involves rank {rank}")]
    NoPreviousSynchpoint { event: EventId, rank: usize },

    #[error("timemap boundary {0:?} was never flushed")]
    UnflushedBoundary(EventId),

    #[error("malformed trace for location {location:?}: {reason}")]
    MalformedTrace { location: LocationId, reason: String },

    #[error("malformed group reference: {0}")]
    MalformedGroup(String),

    #[error("unknown collective category in communicator {0:?}")]
    UnknownCollective(CommId),

    #[error("collective mismatch on rank {rank}: expected {expected}, got {found}")]
    CollectiveMismatch {
        rank: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("job aborted by another participant: {0}")]
    Aborted(String),

    #[error("health check failed: {0} participant(s) hold unrecovered callback errors")]
    HealthCheck(usize),

    #[error("callback error: {0}")]
    Callback(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplayError {
    /// Whether this error must abort the whole job.
    ///
    /// Only callback errors are recoverable; they are stored on the replay
    /// context and surface again at the next health check.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReplayError::Callback(_))
    }

    /// Whether this error was induced by another participant's abort.
    pub fn is_secondary(&self) -> bool {
        matches!(self, ReplayError::Aborted(_))
    }

    pub(crate) fn malformed(location: LocationId, reason: impl Into<String>) -> Self {
        ReplayError::MalformedTrace {
            location,
            reason: reason.into(),
        }
    }
}
