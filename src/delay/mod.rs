//! Delay attribution
//!
//! During the backward delay pass every detected wait state is traced back
//! to its cause: the participant whose lateness produced it. The cause
//! compares its own runtime since the previous synchronization with the
//! waiter against the waiter's runtime over the same interval. Call-tree
//! nodes where the cause spent more time absorb the wait time as delay cost.
//!
//! Each wait state carries a fixed vector of budgets. Slot 0 is its own
//! direct wait time; slot `1 + k` is long-term cost of [`WaitKind`] `k` that
//! downstream waiters pushed onto it. Costs flow upstream one hop per wait
//! state, so a chain of wait states is resolved over the backward pass.
//!
//! - [`p2p`]: one waiter, one cause, message on the delay or inverse channel
//! - [`group`]: collectives over a communicator
//! - [`thread`]: barriers within a thread team

pub mod group;
pub mod ops;
pub mod p2p;
pub mod thread;

use std::collections::BTreeMap;

use fnv::FnvHashMap;
use serde::Serialize;

use crate::context::{ReplayContext, WaitKind};
use crate::defs::{CommId, RegionRole};
use crate::error::Result;
use crate::replay::{ReplayScope, Stage};
use crate::timemap::TimeMapSum;
use crate::trace::{CollectiveOp, Event, EventId, EventKind};

pub use ops::Oracle;

/// Number of budget slots per wait state
pub const BUDGETS: usize = 1 + WaitKind::ALL.len();

pub type Budgets = [f64; BUDGETS];

/// What a delay cost is charged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    /// The waiter's own wait time
    Direct,
    /// Wait time of kind `k` further downstream, propagated through the waiter
    LongTerm(WaitKind),
}

impl CostCategory {
    pub fn of_slot(slot: usize) -> Self {
        match slot.checked_sub(1).and_then(|k| WaitKind::ALL.get(k)) {
            Some(&kind) => CostCategory::LongTerm(kind),
            None => CostCategory::Direct,
        }
    }

    /// Stable name used in reports, e.g. `direct` or `long_term.late_sender`
    pub fn name(self) -> String {
        match self {
            CostCategory::Direct => "direct".to_string(),
            CostCategory::LongTerm(kind) => format!("long_term.{}", kind.name()),
        }
    }

    pub fn slot(self) -> usize {
        match self {
            CostCategory::Direct => 0,
            CostCategory::LongTerm(kind) => 1 + kind.index(),
        }
    }

    /// Slot at the cause's own wait states that a cost of this category
    /// feeds, for a waiter of `kind`
    pub fn long_term_slot(self, kind: WaitKind) -> usize {
        match self {
            CostCategory::Direct => 1 + kind.index(),
            CostCategory::LongTerm(k) => 1 + k.index(),
        }
    }
}

/// Scale factors per interval, keyed by interval start (`None` is the
/// trace start)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleMap(BTreeMap<Option<EventId>, f64>);

impl ScaleMap {
    pub fn starting(start: Option<EventId>, scale: f64) -> Self {
        ScaleMap(BTreeMap::from([(start, scale)]))
    }

    pub fn insert(&mut self, start: Option<EventId>, scale: f64) {
        self.0.insert(start, scale);
    }

    /// Scale of the interval containing `event`: the entry with the largest
    /// start strictly before it
    pub fn lookup(&self, event: EventId) -> f64 {
        self.0
            .range(..Some(event))
            .next_back()
            .map_or(0.0, |(_, &scale)| scale)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<EventId>, f64)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }
}

/// Delay costs a cause computed at one of its synchpoints
#[derive(Debug, Clone, Default)]
pub struct DelayOutcome {
    /// Kind of the wait state that was explained
    pub kind: Option<WaitKind>,
    pub costs: BTreeMap<CostCategory, TimeMapSum>,
    /// Per budget slot: summed waiter scales, used to propagate long-term cost
    pub sum_scales: Vec<ScaleMap>,
    /// Per budget slot: strongest waiter scale, for classification
    pub max_scales: Vec<ScaleMap>,
}

impl DelayOutcome {
    fn new(kind: WaitKind) -> Self {
        DelayOutcome {
            kind: Some(kind),
            costs: BTreeMap::new(),
            sum_scales: vec![ScaleMap::default(); BUDGETS],
            max_scales: vec![ScaleMap::default(); BUDGETS],
        }
    }

    fn add_cost(&mut self, slot: usize, cost: TimeMapSum) {
        if cost.sum > 0.0 {
            self.costs.entry(CostCategory::of_slot(slot)).or_default().merge(&cost);
        }
    }

    pub fn total(&self) -> f64 {
        self.costs.values().map(|c| c.sum).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitClass {
    /// The cause was itself waiting on someone further upstream
    Propagating,
    /// The cause was computing
    Terminal,
}

/// How one wait state relates to its causes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaitStateProfile {
    pub kind: WaitKind,
    pub wait: f64,
    /// Part of `wait` explained by wait states of the cause
    pub indirect: f64,
    /// Long-term cost pushed onto this wait state by downstream waiters
    pub propagated: f64,
}

impl WaitStateProfile {
    pub fn class(&self) -> WaitClass {
        if self.indirect > 0.0 {
            WaitClass::Propagating
        } else {
            WaitClass::Terminal
        }
    }
}

/// Delay analysis results of one location
#[derive(Debug, Default)]
pub struct DelayState {
    rcost: BTreeMap<EventId, Budgets>,
    outcomes: Vec<(EventId, DelayOutcome)>,
    profiles: BTreeMap<EventId, WaitStateProfile>,
    /// Indirect share a cause forwards to its point-to-point waiter
    shares: FnvHashMap<EventId, f64>,
}

impl DelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Budget vector of wait state `event` with direct wait `wait`
    pub fn budgets(&self, event: EventId, wait: f64) -> Budgets {
        let mut budgets = self.rcost.get(&event).copied().unwrap_or([0.0; BUDGETS]);
        budgets[0] = wait.max(0.0);
        budgets
    }

    /// Long-term cost accumulated on `event`
    pub fn propagated(&self, event: EventId) -> f64 {
        self.rcost.get(&event).map_or(0.0, |b| b[1..].iter().sum())
    }

    /// Charge the cause's own wait states in `(from, to)` with the long-term
    /// share of the costs just attributed at `to`
    pub(crate) fn propagate(
        &mut self,
        oracle: &Oracle<'_>,
        from: Option<EventId>,
        to: EventId,
        kind: WaitKind,
        sum_scales: &[ScaleMap],
    ) -> Result<()> {
        for (event, wait) in oracle.wait_states(from, to)? {
            let budgets = self.rcost.entry(event).or_insert([0.0; BUDGETS]);
            for (slot, scales) in sum_scales.iter().enumerate() {
                let scale = scales.lookup(event);
                if scale > 0.0 {
                    budgets[CostCategory::of_slot(slot).long_term_slot(kind)] += wait * scale;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn record_outcome(&mut self, event: EventId, outcome: DelayOutcome) {
        tracing::trace!(?event, total = outcome.total(), "delay attributed");
        self.outcomes.push((event, outcome));
    }

    pub(crate) fn record_profile(&mut self, event: EventId, profile: WaitStateProfile) {
        self.profiles.insert(event, profile);
    }

    pub(crate) fn set_indirect(&mut self, event: EventId, indirect: f64) {
        if let Some(profile) = self.profiles.get_mut(&event) {
            profile.indirect = indirect.max(0.0);
        }
    }

    pub(crate) fn store_share(&mut self, event: EventId, share: f64) {
        self.shares.insert(event, share);
    }

    pub(crate) fn share(&self, event: EventId) -> f64 {
        self.shares.get(&event).copied().unwrap_or(0.0)
    }

    /// Attribute the wait states of `event` in the delay passes
    pub fn on_event(
        &mut self,
        scope: &ReplayScope<'_>,
        stage: Stage,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
        oracle: &Oracle<'_>,
    ) -> Result<()> {
        match event.kind() {
            EventKind::Send { .. } | EventKind::Recv { .. } => p2p::on_event(scope, stage, event, ctx, oracle, self),
            _ if stage != Stage::BackwardDelay => Ok(()),
            EventKind::CollEnd { comm, op, root, .. } => {
                let Some(info) = ctx.collinfo else {
                    return Ok(());
                };
                let (kind, cause) = match op {
                    CollectiveOp::Barrier => (WaitKind::Barrier, info.latest.rank),
                    CollectiveOp::NToN => (WaitKind::NToN, info.latest.rank),
                    CollectiveOp::OneToN => (WaitKind::OneToN, root.unwrap_or(0)),
                    CollectiveOp::NToOne => (WaitKind::NToOne, info.latest.rank),
                    _ => return Ok(()),
                };
                let handle = scope.bind(*comm)?;
                if cause >= handle.size() {
                    // Nobody contributed data; no member synchronized.
                    return Ok(());
                }
                group::attribute(&handle, cause, kind, event.id(), ctx, oracle, self)
            }
            EventKind::Leave { callpath } => {
                let Some(info) = ctx.collinfo else {
                    return Ok(());
                };
                match scope.defs.role_of(*callpath)? {
                    RegionRole::ThreadBarrier => thread::attribute(scope, &info, event.id(), ctx, oracle, self),
                    role @ (RegionRole::Init | RegionRole::Finalize) => {
                        let kind = if role == RegionRole::Init {
                            WaitKind::Init
                        } else {
                            WaitKind::Finalize
                        };
                        let handle = scope.bind(CommId::WORLD)?;
                        group::attribute(&handle, info.latest.rank, kind, event.id(), ctx, oracle, self)
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    pub fn outcomes(&self) -> &[(EventId, DelayOutcome)] {
        &self.outcomes
    }

    pub fn profiles(&self) -> &BTreeMap<EventId, WaitStateProfile> {
        &self.profiles
    }

    pub fn profile(&self, event: EventId) -> Option<&WaitStateProfile> {
        self.profiles.get(&event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_category_slots() {
        assert_eq!(CostCategory::of_slot(0), CostCategory::Direct);
        assert_eq!(CostCategory::of_slot(1), CostCategory::LongTerm(WaitKind::LateSender));
        for slot in 0..BUDGETS {
            assert_eq!(CostCategory::of_slot(slot).slot(), slot);
        }
        assert_eq!(
            CostCategory::Direct.long_term_slot(WaitKind::Barrier),
            CostCategory::LongTerm(WaitKind::Barrier).slot()
        );
        assert_eq!(
            CostCategory::LongTerm(WaitKind::LateSender).long_term_slot(WaitKind::Barrier),
            1
        );
    }

    #[test]
    fn test_scale_map_lookup_uses_interval_start() {
        let mut scales = ScaleMap::starting(Some(EventId(2)), 0.5);
        scales.insert(Some(EventId(6)), 0.75);
        assert_eq!(scales.lookup(EventId(2)), 0.0);
        assert_eq!(scales.lookup(EventId(3)), 0.5);
        assert_eq!(scales.lookup(EventId(6)), 0.5);
        assert_eq!(scales.lookup(EventId(9)), 0.75);

        let from_start = ScaleMap::starting(None, 1.0);
        assert_eq!(from_start.lookup(EventId(0)), 1.0);
    }

    #[test]
    fn test_budgets_combine_direct_and_long_term() {
        let mut state = DelayState::new();
        state.rcost.insert(EventId(4), {
            let mut b = [0.0; BUDGETS];
            b[3] = 2.0;
            b
        });
        let budgets = state.budgets(EventId(4), 1.5);
        assert_eq!(budgets[0], 1.5);
        assert_eq!(budgets[3], 2.0);
        assert_eq!(state.propagated(EventId(4)), 2.0);
        assert_eq!(state.budgets(EventId(5), -1.0), [0.0; BUDGETS]);
    }

    #[test]
    fn test_profile_class() {
        let mut p = WaitStateProfile {
            kind: WaitKind::LateSender,
            wait: 3.0,
            indirect: 0.0,
            propagated: 0.0,
        };
        assert_eq!(p.class(), WaitClass::Terminal);
        p.indirect = 1.0;
        assert_eq!(p.class(), WaitClass::Propagating);
    }
}
