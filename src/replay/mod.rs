//! Replay orchestration
//!
//! A job runs one [`Analyzer`] per traced location, each on its own thread.
//! Every analyzer walks its local trace once per pass of the [`PassPlan`],
//! forward or backward, and runs the handlers the [`Registry`] lists for
//! the event's class in that pass. Handlers of different locations meet
//! only through the communication runtime, so all analyzers progress in
//! lock step at every collective and every matched message.

pub mod analyzer;
pub mod job;
pub mod registry;
pub mod scope;
pub mod stage;

pub use analyzer::Analyzer;
pub use job::{Job, ParticipantOutput, TraceBundle, TraceInput};
pub use registry::{EventClass, HandlerId, Registry};
pub use scope::ReplayScope;
pub use stage::{Direction, PassPlan, Stage};

use crate::context::{ReplayContext, WaitKind};
use crate::defs::{Definitions, Location};
use crate::delay::{DelayOutcome, DelayState, WaitStateProfile};
use crate::error::Result;
use crate::synchpoint::{SynchpointDetector, SynchpointInfo};
use crate::trace::{Event, EventId, LocalTrace};

/// What an external callback sees of one replayed event
pub struct EventView<'a> {
    pub event: Event<'a>,
    pub defs: &'a Definitions,
    pub location: Location,
    pub ctx: &'a ReplayContext,
    /// Synchpoint recorded at this event during this pass
    pub detected: Option<(WaitKind, SynchpointInfo)>,
    /// Delay attributed at this event, in the backward delay pass
    pub delay: Option<&'a DelayOutcome>,
    /// Waiter-side profile, once final for this event
    pub profile: Option<&'a WaitStateProfile>,
}

/// Everything one location accumulated over the whole replay
pub struct FinishView<'a> {
    pub defs: &'a Definitions,
    pub location: Location,
    pub trace: &'a LocalTrace,
    pub detector: &'a SynchpointDetector,
    pub kinds: &'a std::collections::BTreeMap<EventId, WaitKind>,
    pub delay: &'a DelayState,
    /// Lock contention per lock event
    pub lock_waits: &'a [(EventId, f64)],
}

/// Downstream analysis plugged into the replay
///
/// Returning [`crate::ReplayError::Callback`] is recoverable: the error is
/// recorded and the whole job stops at the next health check. Any other error
/// aborts the job immediately.
pub trait AnalysisCallback: Send {
    fn on_event(&mut self, stage: Stage, view: &EventView<'_>) -> Result<()>;

    fn finish(&mut self, _view: &FinishView<'_>) -> Result<()> {
        Ok(())
    }
}

/// Callback that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCallback;

impl AnalysisCallback for NoCallback {
    fn on_event(&mut self, _stage: Stage, _view: &EventView<'_>) -> Result<()> {
        Ok(())
    }
}
