// Handler table: which handlers run, in which order, for each pass and
// event class

use crate::config::AnalysisConfig;
use crate::defs::{Definitions, RegionRole};
use crate::error::Result;
use crate::trace::{Event, EventKind};

use super::{PassPlan, Stage};

/// Handler groups in the order they run for one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerId {
    /// Progresses pending sends before any driver talks
    ReplayControl,
    P2p,
    Collective,
    OneSided,
    Thread,
    /// Records whatever the drivers detected
    Detector,
    /// Maintains the per-call-tree-node runtime log
    Timemap,
    Delay,
    Callbacks,
}

/// Coarse event classification used to index the handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Enter,
    Leave,
    /// Leave of a region that synchronizes by itself (init, finalize,
    /// thread barrier, parallel region)
    SyncLeave,
    Send,
    Recv,
    Collective,
    Rma,
    Fork,
    Task,
    Other,
}

impl EventClass {
    pub const COUNT: usize = 10;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn of(event: &Event<'_>, defs: &Definitions) -> Result<Self> {
        Ok(match event.kind() {
            EventKind::Enter { .. } => EventClass::Enter,
            EventKind::Leave { callpath } => match defs.role_of(*callpath)? {
                RegionRole::Init | RegionRole::Finalize | RegionRole::ThreadBarrier | RegionRole::Parallel => {
                    EventClass::SyncLeave
                }
                _ => EventClass::Leave,
            },
            EventKind::Send { .. } => EventClass::Send,
            EventKind::Recv { .. } => EventClass::Recv,
            EventKind::CollEnd { .. } => EventClass::Collective,
            EventKind::RmaCollective { .. }
            | EventKind::RmaGroup { .. }
            | EventKind::RmaPut { .. }
            | EventKind::RmaGet { .. }
            | EventKind::RmaLock { .. }
            | EventKind::RmaUnlock { .. } => EventClass::Rma,
            EventKind::Fork { .. } | EventKind::Join => EventClass::Fork,
            EventKind::TaskSwitch { .. } | EventKind::TaskComplete { .. } => EventClass::Task,
            EventKind::CollBegin => EventClass::Other,
        })
    }
}

const ALL_CLASSES: [EventClass; EventClass::COUNT] = [
    EventClass::Enter,
    EventClass::Leave,
    EventClass::SyncLeave,
    EventClass::Send,
    EventClass::Recv,
    EventClass::Collective,
    EventClass::Rma,
    EventClass::Fork,
    EventClass::Task,
    EventClass::Other,
];

/// Stage x event-class table, built once per job and shared read-only
#[derive(Debug, Clone)]
pub struct Registry {
    plan: PassPlan,
    table: Vec<Vec<Vec<HandlerId>>>,
}

impl Registry {
    pub fn new(config: &AnalysisConfig) -> Self {
        let plan = config.pass_plan();
        let table = Stage::ALL
            .iter()
            .map(|&stage| {
                ALL_CLASSES
                    .iter()
                    .map(|&class| {
                        if plan.stages().contains(&stage) {
                            handlers(stage, class)
                        } else {
                            Vec::new()
                        }
                    })
                    .collect()
            })
            .collect();
        Registry { plan, table }
    }

    pub fn plan(&self) -> PassPlan {
        self.plan
    }

    pub fn handlers(&self, stage: Stage, class: EventClass) -> &[HandlerId] {
        &self.table[stage.index()][class.index()]
    }
}

fn handlers(stage: Stage, class: EventClass) -> Vec<HandlerId> {
    use EventClass as C;
    use HandlerId::{Callbacks, Collective, Delay, Detector, OneSided, P2p, ReplayControl, Thread, Timemap};

    let mut out = Vec::new();
    if matches!(class, C::Send | C::Recv | C::Collective | C::SyncLeave | C::Rma) {
        out.push(ReplayControl);
    }
    match stage {
        Stage::Main => match class {
            C::Send | C::Recv => out.extend([P2p, Detector]),
            C::Collective => out.extend([Collective, Detector]),
            C::SyncLeave => out.extend([Collective, Thread, Detector]),
            C::Enter => out.extend([Thread, Detector]),
            C::Rma => out.push(OneSided),
            C::Fork => out.push(Thread),
            _ => {}
        },
        Stage::BackwardWaitStates => match class {
            C::Send | C::Recv => out.extend([P2p, Detector]),
            C::Collective | C::SyncLeave => out.push(Collective),
            _ => {}
        },
        Stage::ForwardSynchpoints => {
            match class {
                C::Send | C::Recv => out.extend([P2p, Detector]),
                C::Collective => out.push(Collective),
                C::SyncLeave => out.extend([Collective, Thread]),
                C::Enter | C::Fork => out.push(Thread),
                _ => {}
            }
            out.push(Timemap);
        }
        Stage::BackwardDelay => match class {
            C::Send | C::Recv => out.push(Delay),
            C::Collective => out.extend([Collective, Delay]),
            C::SyncLeave => out.extend([Collective, Thread, Delay]),
            _ => {}
        },
        Stage::ForwardPropagation => {
            if matches!(class, C::Send | C::Recv) {
                out.push(Delay);
            }
        }
    }
    out.push(Callbacks);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handlers_run_in_dependency_order() {
        let registry = Registry::new(&AnalysisConfig::full());
        for &stage in &Stage::ALL {
            for &class in &ALL_CLASSES {
                let hs = registry.handlers(stage, class);
                assert!(hs.windows(2).all(|w| w[0] < w[1]), "{:?} {:?}: {:?}", stage, class, hs);
            }
        }
    }

    #[test]
    fn test_delay_only_in_delay_passes() {
        let registry = Registry::new(&AnalysisConfig::full());
        for &stage in &[Stage::Main, Stage::BackwardWaitStates, Stage::ForwardSynchpoints] {
            for &class in &ALL_CLASSES {
                assert!(!registry.handlers(stage, class).contains(&HandlerId::Delay));
            }
        }
        assert!(registry
            .handlers(Stage::ForwardPropagation, EventClass::Recv)
            .contains(&HandlerId::Delay));
    }

    #[test]
    fn test_plan_limits_table() {
        let registry = Registry::new(&AnalysisConfig::basic());
        assert_eq!(registry.plan(), PassPlan::Basic);
        assert!(registry.handlers(Stage::BackwardDelay, EventClass::Send).is_empty());
        assert_eq!(
            registry.handlers(Stage::BackwardWaitStates, EventClass::Send),
            &[HandlerId::ReplayControl, HandlerId::P2p, HandlerId::Detector, HandlerId::Callbacks]
        );
    }

    #[test]
    fn test_timemap_in_every_fws_class() {
        let registry = Registry::new(&AnalysisConfig::full());
        for &class in &ALL_CLASSES {
            assert!(registry
                .handlers(Stage::ForwardSynchpoints, class)
                .contains(&HandlerId::Timemap));
        }
    }
}
