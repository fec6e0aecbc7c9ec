//! Per-participant replay context
//!
//! The context is the scratch state that flows through every handler while a
//! single event is processed: what the paradigm drivers detected, the
//! collective timing they computed, delay results produced at this event and
//! any recoverable callback errors. [`ReplayContext::reset`] clears the
//! per-event part once all handlers have run. The call stack, the pending
//! send pool and the error log persist across events.

use serde::Serialize;

use crate::callstack::Callstack;
use crate::comm::{PendingPool, TimeRank};
use crate::rankset::RankSet;
use crate::synchpoint::SynchpointInfo;

/// What kind of synchronization produced a synchpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    LateSender,
    LateReceiver,
    Barrier,
    Init,
    Finalize,
    NToN,
    OneToN,
    NToOne,
    Scan,
    ThreadBarrier,
    ThreadFork,
}

impl WaitKind {
    pub const ALL: [WaitKind; 11] = [
        WaitKind::LateSender,
        WaitKind::LateReceiver,
        WaitKind::Barrier,
        WaitKind::Init,
        WaitKind::Finalize,
        WaitKind::NToN,
        WaitKind::OneToN,
        WaitKind::NToOne,
        WaitKind::Scan,
        WaitKind::ThreadBarrier,
        WaitKind::ThreadFork,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            WaitKind::LateSender => "late_sender",
            WaitKind::LateReceiver => "late_receiver",
            WaitKind::Barrier => "barrier",
            WaitKind::Init => "init",
            WaitKind::Finalize => "finalize",
            WaitKind::NToN => "n_to_n",
            WaitKind::OneToN => "one_to_n",
            WaitKind::NToOne => "n_to_one",
            WaitKind::Scan => "scan",
            WaitKind::ThreadBarrier => "thread_barrier",
            WaitKind::ThreadFork => "thread_fork",
        }
    }
}

/// Timing relationships of one collective operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CollectiveInfo {
    /// Own begin time and communicator-local rank
    pub my: TimeRank,
    /// Begin time of the root, for rooted operations
    pub root: TimeRank,
    /// Latest-beginning participant
    pub latest: TimeRank,
    /// Earliest end among synchronizing participants
    pub earliest_end: TimeRank,
}

impl CollectiveInfo {
    pub fn new(my: TimeRank) -> Self {
        CollectiveInfo {
            my,
            root: my,
            latest: my,
            earliest_end: TimeRank::highest(),
        }
    }
}

/// Synchpoint classification a driver produced for the current event
#[derive(Debug, Clone)]
pub struct Detection {
    pub kind: WaitKind,
    pub info: SynchpointInfo,
    /// Process ranks that met here; `None` for thread-level synchpoints
    pub ranks: Option<RankSet>,
}

/// Wait time to assign to an already recorded synchpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitUpdate {
    pub wait_time: f64,
}

/// One-sided synchronization timing exposed for the current event
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RmaTiming {
    /// Time waited for a remote epoch to open or close
    pub wait_time: f64,
    /// Time between the last remote access and the epoch end
    pub completion_time: f64,
    /// Number of origins that accessed this member during the epoch
    pub accesses: usize,
}

pub struct ReplayContext {
    pub callstack: Callstack,
    pub pending: PendingPool,
    pub detection: Option<Detection>,
    pub wait_update: Option<WaitUpdate>,
    pub collinfo: Option<CollectiveInfo>,
    /// Fork or join idle time the timemap cache moves to a parallel region
    pub fork_join: Option<f64>,
    pub rma: Option<RmaTiming>,
    /// Recoverable callback errors, oldest first
    pub errors: Vec<String>,
}

impl ReplayContext {
    pub fn new(pool_capacity: usize) -> Self {
        ReplayContext {
            callstack: Callstack::new(),
            pending: PendingPool::new(pool_capacity),
            detection: None,
            wait_update: None,
            collinfo: None,
            fork_join: None,
            rma: None,
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "callback error recorded");
        self.errors.push(message);
    }

    /// Drop everything that belongs to the event just processed
    pub fn reset(&mut self) {
        self.detection = None;
        self.wait_update = None;
        self.collinfo = None;
        self.fork_join = None;
        self.rma = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_errors() {
        let mut ctx = ReplayContext::new(4);
        ctx.fork_join = Some(1.0);
        ctx.collinfo = Some(CollectiveInfo::new(TimeRank::new(0.0, 0)));
        ctx.record_error("pattern failed");
        ctx.reset();
        assert!(ctx.fork_join.is_none());
        assert!(ctx.collinfo.is_none());
        assert!(ctx.has_errors());
    }

    #[test]
    fn test_wait_kind_index_is_dense() {
        for (i, kind) in WaitKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
