//! Recorded per-location event streams
//!
//! A [`LocalTrace`] owns the immutable events of one location. Construction
//! validates region nesting and precomputes, for every event, the call-tree
//! node it belongs to and the enter/leave pair of its enclosing region, so the
//! replay passes can move forward and backward through the stream in O(1) per
//! step.
//!
//! # Example
//!
//! ```
//! use waitcause::defs::{
//!     Callpath, CallpathId, Definitions, Location, LocationId, Region, RegionId,
//! };
//! use waitcause::trace::{EventKind, EventRecord, LocalTrace};
//!
//! let defs = Definitions {
//!     regions: vec![Region { name: "main".into(), role: Default::default() }],
//!     callpaths: vec![Callpath { region: RegionId(0), parent: None }],
//!     locations: vec![Location { process: 0, thread: 0 }],
//!     ..Default::default()
//! };
//! let events = vec![
//!     EventRecord::new(0.0, EventKind::Enter { callpath: CallpathId(0) }),
//!     EventRecord::new(4.0, EventKind::Leave { callpath: CallpathId(0) }),
//! ];
//! let trace = LocalTrace::new(LocationId(0), events, &defs).unwrap();
//! assert_eq!(trace.len(), 2);
//! ```

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::defs::{CallpathId, CommId, Definitions, LocationId, WindowId};
use crate::error::{ReplayError, Result};

/// Position of an event in its location's stream (monotone in time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub usize);

/// Collective operation category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveOp {
    Barrier,
    /// One-to-many (broadcast, scatter)
    OneToN,
    /// Many-to-one (reduce, gather)
    NToOne,
    /// All-to-all (allreduce, allgather, alltoall)
    NToN,
    /// Inclusive or exclusive prefix reduction
    Scan,
    /// Irregular all-to-all, skipped by the replay
    AllToAllV,
    /// Irregular all-to-all with per-peer types, skipped by the replay
    AllToAllW,
}

impl CollectiveOp {
    pub fn is_irregular(self) -> bool {
        matches!(self, CollectiveOp::AllToAllV | CollectiveOp::AllToAllW)
    }
}

/// Collective window synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmaSync {
    Create,
    Fence,
    Free,
}

/// General active-target synchronization step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RmaGroupOp {
    Post,
    Start,
    Complete,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Enter {
        callpath: CallpathId,
    },
    Leave {
        callpath: CallpathId,
    },
    /// Blocking send, with `dest` as a communicator-local rank
    Send {
        comm: CommId,
        dest: usize,
        tag: u32,
        #[serde(default)]
        bytes: u64,
        #[serde(default)]
        synchronous: bool,
    },
    /// Blocking receive, with `source` as a communicator-local rank
    Recv {
        comm: CommId,
        source: usize,
        tag: u32,
        #[serde(default)]
        bytes: u64,
    },
    CollBegin,
    CollEnd {
        comm: CommId,
        op: CollectiveOp,
        /// Communicator-local root of rooted operations
        #[serde(default)]
        root: Option<usize>,
        #[serde(default)]
        bytes_sent: u64,
        #[serde(default)]
        bytes_received: u64,
    },
    RmaCollective {
        window: WindowId,
        op: RmaSync,
    },
    /// Post/start/complete/wait with its access group as window-local ranks
    RmaGroup {
        window: WindowId,
        op: RmaGroupOp,
        group: Vec<usize>,
    },
    RmaPut {
        window: WindowId,
        target: usize,
        #[serde(default)]
        bytes: u64,
    },
    RmaGet {
        window: WindowId,
        target: usize,
        #[serde(default)]
        bytes: u64,
    },
    RmaLock {
        window: WindowId,
        target: usize,
        #[serde(default)]
        exclusive: bool,
    },
    RmaUnlock {
        window: WindowId,
        target: usize,
    },
    /// Master thread forks a team; the parallel region enter follows
    Fork {
        team_size: usize,
    },
    /// Master thread joins the team after the parallel region leave
    Join,
    TaskSwitch {
        task: u64,
    },
    TaskComplete {
        task: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EventRecord {
    pub fn new(time: f64, kind: EventKind) -> Self {
        EventRecord { time, kind }
    }
}

/// Task executing when no explicit task is active
pub const IMPLICIT_TASK: u64 = 0;

#[derive(Debug, Clone)]
pub struct LocalTrace {
    location: LocationId,
    events: Vec<EventRecord>,
    cnodes: Vec<CallpathId>,
    enters: Vec<Option<EventId>>,
    leaves: Vec<Option<EventId>>,
}

impl LocalTrace {
    pub fn new(location: LocationId, events: Vec<EventRecord>, defs: &Definitions) -> Result<Self> {
        let n = events.len();
        let mut cnodes = Vec::with_capacity(n);
        let mut enters = Vec::with_capacity(n);
        let mut leaves = vec![None; n];
        let mut stacks: FnvHashMap<u64, Vec<usize>> = FnvHashMap::default();
        let mut current = IMPLICIT_TASK;
        let mut last_time = f64::NEG_INFINITY;
        // Callpath of the last non-task context, used by events between a
        // task switch and the task's first enter.
        let mut origin: Option<CallpathId> = None;

        for (i, record) in events.iter().enumerate() {
            if !record.time.is_finite() || record.time < last_time {
                return Err(ReplayError::malformed(
                    location,
                    format!("event {} has timestamp {} before {}", i, record.time, last_time),
                ));
            }
            last_time = record.time;

            let stack = stacks.entry(current).or_default();
            match &record.kind {
                EventKind::Enter { callpath } => {
                    defs.callpath(*callpath)?;
                    stack.push(i);
                    cnodes.push(*callpath);
                    enters.push(Some(EventId(i)));
                }
                EventKind::Leave { callpath } => {
                    let open = stack.pop().ok_or_else(|| {
                        ReplayError::malformed(location, format!("leave {} without enter", i))
                    })?;
                    if !matches!(events[open].kind, EventKind::Enter { callpath: c } if c == *callpath)
                    {
                        return Err(ReplayError::malformed(
                            location,
                            format!("leave {} does not match enter {}", i, open),
                        ));
                    }
                    leaves[open] = Some(EventId(i));
                    cnodes.push(*callpath);
                    enters.push(Some(EventId(open)));
                }
                other => {
                    let top = stack.last().copied();
                    let cnode = match top {
                        Some(open) => cnodes[open],
                        None => origin.ok_or_else(|| {
                            ReplayError::malformed(
                                location,
                                format!("event {} occurs outside of any region", i),
                            )
                        })?,
                    };
                    cnodes.push(cnode);
                    enters.push(top.map(EventId));
                    match other {
                        EventKind::TaskSwitch { task } => {
                            if current == IMPLICIT_TASK {
                                origin = Some(cnode);
                            }
                            current = *task;
                        }
                        EventKind::TaskComplete { task } => {
                            if stacks.get(task).is_some_and(|s| !s.is_empty()) {
                                return Err(ReplayError::malformed(
                                    location,
                                    format!("task {} completed with open regions", task),
                                ));
                            }
                            stacks.remove(task);
                            current = IMPLICIT_TASK;
                        }
                        _ => {}
                    }
                }
            }
        }

        if stacks.values().any(|s| !s.is_empty()) {
            return Err(ReplayError::malformed(location, "unbalanced enter/leave"));
        }

        // Now that every region is closed, inner events inherit their
        // region's leave.
        for i in 0..n {
            if leaves[i].is_none() {
                if let Some(open) = enters[i] {
                    leaves[i] = leaves[open.0];
                }
            }
        }

        Ok(LocalTrace {
            location,
            events,
            cnodes,
            enters,
            leaves,
        })
    }

    pub fn location(&self) -> LocationId {
        self.location
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event(&self, id: EventId) -> Event<'_> {
        Event { trace: self, id }
    }

    pub fn get(&self, id: EventId) -> Option<Event<'_>> {
        (id.0 < self.events.len()).then(|| self.event(id))
    }

    /// Events in recorded order
    pub fn forward(&self) -> impl Iterator<Item = Event<'_>> + '_ {
        (0..self.events.len()).map(move |i| self.event(EventId(i)))
    }

    /// Events in reverse recorded order
    pub fn backward(&self) -> impl Iterator<Item = Event<'_>> + '_ {
        (0..self.events.len()).rev().map(move |i| self.event(EventId(i)))
    }
}

/// Lightweight handle to one recorded event
#[derive(Clone, Copy)]
pub struct Event<'a> {
    trace: &'a LocalTrace,
    id: EventId,
}

impl<'a> Event<'a> {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn trace(&self) -> &'a LocalTrace {
        self.trace
    }

    pub fn record(&self) -> &'a EventRecord {
        &self.trace.events[self.id.0]
    }

    pub fn time(&self) -> f64 {
        self.record().time
    }

    pub fn kind(&self) -> &'a EventKind {
        &self.record().kind
    }

    /// Call-tree node the event belongs to; for enter and leave it is the
    /// node being entered or left
    pub fn cnode(&self) -> CallpathId {
        self.trace.cnodes[self.id.0]
    }

    /// Enter event of the enclosing region
    pub fn enter(&self) -> Option<Event<'a>> {
        self.trace.enters[self.id.0].map(|id| self.trace.event(id))
    }

    /// Leave event of the enclosing region
    pub fn leave(&self) -> Option<Event<'a>> {
        self.trace.leaves[self.id.0].map(|id| self.trace.event(id))
    }

    pub fn prev(&self) -> Option<Event<'a>> {
        self.id.0.checked_sub(1).map(|i| self.trace.event(EventId(i)))
    }

    pub fn next(&self) -> Option<Event<'a>> {
        self.trace.get(EventId(self.id.0 + 1))
    }

    /// Begin time of the enclosing region, or the event's own time
    pub fn enter_time(&self) -> f64 {
        self.enter().map_or(self.time(), |e| e.time())
    }

    /// End time of the enclosing region, or the event's own time
    pub fn leave_time(&self) -> f64 {
        self.leave().map_or(self.time(), |e| e.time())
    }

    pub fn is_enter(&self) -> bool {
        matches!(self.kind(), EventKind::Enter { .. })
    }

    pub fn is_leave(&self) -> bool {
        matches!(self.kind(), EventKind::Leave { .. })
    }
}

impl std::fmt::Debug for Event<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("time", &self.time())
            .field("kind", self.kind())
            .finish()
    }
}
