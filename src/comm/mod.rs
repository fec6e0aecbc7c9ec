//! In-process analysis communication runtime
//!
//! Every analysis participant owns an [`Endpoint`]. Endpoints exchange typed
//! messages over crossbeam channels; matching follows the usual message
//! passing rules (source, communicator, channel, tag, non-overtaking per
//! sender). Collectives are built on top of the point-to-point layer in
//! [`collective`], one-sided windows live in [`window`], thread teams in
//! [`team`].
//!
//! # Design
//!
//! ```text
//! participant 0 ──isend──► inbox[1] ──recv──► participant 1
//!      │                                         │
//!      └────────────── AbortLatch ───────────────┘
//! ```
//!
//! Blocking receives poll their inbox with a timeout and give up as soon as
//! any participant trips the shared [`AbortLatch`], so one participant's
//! fatal error never leaves the others blocked forever.

pub mod collective;
pub mod pool;
pub mod team;
pub mod window;

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::defs::{CommId, Communicator};
use crate::error::{ReplayError, Result};

pub use collective::CommHandle;
pub use pool::PendingPool;
pub use team::Team;
pub use window::{SharedWindow, WindowBuffer};

/// A timestamp tagged with the rank that produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRank {
    pub time: f64,
    pub rank: usize,
}

impl TimeRank {
    pub fn new(time: f64, rank: usize) -> Self {
        TimeRank { time, rank }
    }

    /// Neutral element for `maxloc`
    pub fn lowest() -> Self {
        TimeRank::new(-f64::MAX, usize::MAX)
    }

    /// Neutral element for `minloc`
    pub fn highest() -> Self {
        TimeRank::new(f64::MAX, usize::MAX)
    }

    /// Later time wins; ties go to the lower rank
    pub fn maxloc(a: TimeRank, b: TimeRank) -> TimeRank {
        if b.time > a.time || (b.time == a.time && b.rank < a.rank) {
            b
        } else {
            a
        }
    }

    /// Earlier time wins; ties go to the lower rank
    pub fn minloc(a: TimeRank, b: TimeRank) -> TimeRank {
        if b.time < a.time || (b.time == a.time && b.rank < a.rank) {
            b
        } else {
            a
        }
    }
}

impl Default for TimeRank {
    fn default() -> Self {
        TimeRank::lowest()
    }
}

/// Traffic class, kept apart so different protocols never match each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Replayed point-to-point messages in recorded direction
    P2p,
    /// Point-to-point messages flowing against the recorded direction
    Inverse,
    /// Collective operations
    Collective,
    /// Delay attribution side traffic
    Delay,
    /// Window epoch tokens
    Window,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgKey {
    pub comm: CommId,
    pub channel: Channel,
    pub tag: u32,
}

const PENDING: u8 = 0;
const MATCHED: u8 = 1;
const CANCELLED: u8 = 2;

struct Envelope {
    source: usize,
    key: MsgKey,
    op: &'static str,
    payload: Box<dyn Any + Send>,
    state: Arc<AtomicU8>,
}

impl Envelope {
    fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, MATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Handle of a non-blocking send
#[derive(Debug, Clone)]
pub struct Request {
    state: Arc<AtomicU8>,
}

impl Request {
    /// Completed once the receiver matched the message
    pub fn test(&self) -> bool {
        self.state.load(Ordering::Acquire) == MATCHED
    }

    /// Withdraw an unmatched message; returns false if it was already matched
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Job-wide latch raised by the first participant hitting a fatal error
#[derive(Debug, Default)]
pub struct AbortLatch {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl AbortLatch {
    pub fn raise(&self, reason: &str) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert_with(|| reason.to_string());
        }
        self.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Error to report when the latch interrupts a blocking operation
    pub fn check(&self) -> Result<()> {
        if !self.is_raised() {
            return Ok(());
        }
        let reason = self
            .reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "unknown".to_string());
        Err(ReplayError::Aborted(reason))
    }
}

struct World {
    inboxes: Vec<Sender<Envelope>>,
    latch: Arc<AbortLatch>,
}

/// One participant's connection to the job
pub struct Endpoint {
    rank: usize,
    world: Arc<World>,
    inbox: Receiver<Envelope>,
    unexpected: RefCell<VecDeque<Envelope>>,
    poll: Duration,
}

impl Endpoint {
    /// Create one connected endpoint per rank of a job of `size` processes
    pub fn connect(size: usize, latch: Arc<AbortLatch>, poll: Duration) -> Vec<Endpoint> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel::unbounded()).unzip();
        let world = Arc::new(World {
            inboxes: senders,
            latch,
        });
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Endpoint {
                rank,
                world: Arc::clone(&world),
                inbox,
                unexpected: RefCell::new(VecDeque::new()),
                poll,
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.world.inboxes.len()
    }

    pub fn latch(&self) -> &Arc<AbortLatch> {
        &self.world.latch
    }

    pub fn abort(&self, reason: &str) {
        self.world.latch.raise(reason);
    }

    /// Bind this endpoint to `comm`
    pub fn bind<'a>(&'a self, comm: &'a Communicator) -> Result<CommHandle<'a>> {
        CommHandle::new(self, comm)
    }

    fn post(&self, dest: usize, key: MsgKey, op: &'static str, payload: Box<dyn Any + Send>) -> Result<Request> {
        let state = Arc::new(AtomicU8::new(PENDING));
        let envelope = Envelope {
            source: self.rank,
            key,
            op,
            payload,
            state: Arc::clone(&state),
        };
        let inbox = self
            .world
            .inboxes
            .get(dest)
            .ok_or_else(|| ReplayError::Transport(format!("no participant with rank {}", dest)))?;
        inbox
            .send(envelope)
            .map_err(|_| ReplayError::Transport(format!("participant {} is gone", dest)))?;
        Ok(Request { state })
    }

    /// Non-blocking typed send to global rank `dest`
    pub fn isend<T: Send + 'static>(&self, dest: usize, key: MsgKey, value: T) -> Result<Request> {
        self.post(dest, key, "p2p", Box::new(value))
    }

    /// Blocking typed receive from global rank `source`
    pub fn recv<T: 'static>(&self, source: usize, key: MsgKey) -> Result<T> {
        let envelope = self.take(source, key)?;
        downcast(envelope.payload)
    }

    fn take(&self, source: usize, key: MsgKey) -> Result<Envelope> {
        let matches = |e: &Envelope| e.source == source && e.key == key;

        {
            let mut queue = self.unexpected.borrow_mut();
            queue.retain(|e| !e.is_cancelled());
            if let Some(pos) = queue.iter().position(|e| matches(e)) {
                if let Some(envelope) = queue.remove(pos) {
                    if envelope.claim() {
                        return Ok(envelope);
                    }
                }
            }
        }

        loop {
            match self.inbox.recv_timeout(self.poll) {
                Ok(envelope) => {
                    if matches(&envelope) {
                        if envelope.claim() {
                            return Ok(envelope);
                        }
                    } else if !envelope.is_cancelled() {
                        self.unexpected.borrow_mut().push_back(envelope);
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.world.latch.check()?,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ReplayError::Transport("inbox disconnected".to_string()))
                }
            }
        }
    }
}

fn downcast<T: 'static>(payload: Box<dyn Any + Send>) -> Result<T> {
    payload
        .downcast::<T>()
        .map(|b| *b)
        .map_err(|_| ReplayError::Transport(format!("unexpected payload, wanted {}", std::any::type_name::<T>())))
}
