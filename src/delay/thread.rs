//! Delay attribution for thread barriers
//!
//! Same arithmetic as the group form, but the threads of a process share
//! memory: the latest thread publishes its interval in the team scratch
//! area, every thread folds its scaled residual in under the critical
//! section, and the latest thread collects the sum.

use crate::comm::Team;
use crate::context::{CollectiveInfo, ReplayContext, WaitKind};
use crate::error::Result;
use crate::replay::ReplayScope;
use crate::synchpoint::Peer;
use crate::timemap::{TimeMap, TimeMapSum};
use crate::trace::EventId;

use super::ops::{self, Oracle};
use super::{DelayOutcome, DelayState, ScaleMap, WaitStateProfile, BUDGETS};

#[derive(Debug, Default)]
struct BarrierScratch {
    latest: TimeMap,
    prop_wait: f64,
    delay: Vec<TimeMapSum>,
    sum_scale: Vec<f64>,
    max_scale: Vec<f64>,
}

impl BarrierScratch {
    fn publish(latest: TimeMap, prop_wait: f64) -> Self {
        BarrierScratch {
            latest,
            prop_wait,
            delay: vec![TimeMapSum::default(); BUDGETS],
            sum_scale: vec![0.0; BUDGETS],
            max_scale: vec![0.0; BUDGETS],
        }
    }
}

pub fn attribute(
    scope: &ReplayScope<'_>,
    info: &CollectiveInfo,
    event: EventId,
    ctx: &mut ReplayContext,
    oracle: &Oracle<'_>,
    state: &mut DelayState,
) -> Result<()> {
    let team: &Team = scope.team;
    let is_latest = scope.thread() == info.latest.rank;

    let prev = oracle.previous(event, Peer::Team)?;
    let own = oracle.interval(prev, event)?;

    scope.team_exchange(ctx, ())?;
    if is_latest {
        let published = BarrierScratch::publish(own.map.clone(), own.prop_wait);
        team.critical(move |s: &mut BarrierScratch| *s = published)?;
    }
    team.barrier()?;

    let (latest_map, prop_wait) = team.critical(|s: &mut BarrierScratch| (s.latest.clone(), s.prop_wait))?;
    let wait = oracle.detector.info(event).map_or(0.0, |i| i.wait_time);
    let residual = if is_latest {
        TimeMapSum::default()
    } else {
        ops::diff(&latest_map, &own.map)
    };
    let budgets = state.budgets(event, if is_latest { 0.0 } else { wait });
    let scales: Vec<f64> = budgets
        .iter()
        .map(|&b| if is_latest { 0.0 } else { ops::scale(b, residual.sum, prop_wait) })
        .collect();

    team.critical(|s: &mut BarrierScratch| {
        for (slot, &scale) in scales.iter().enumerate() {
            if let Some(delay) = s.delay.get_mut(slot) {
                ops::add_scaled(&residual, scale, delay);
            }
            if let Some(sum) = s.sum_scale.get_mut(slot) {
                *sum += scale;
            }
            if let Some(max) = s.max_scale.get_mut(slot) {
                *max = max.max(scale);
            }
        }
    })?;
    team.barrier()?;

    if !is_latest && wait > 0.0 {
        state.record_profile(
            event,
            WaitStateProfile {
                kind: WaitKind::ThreadBarrier,
                wait,
                indirect: wait * ops::scale(prop_wait, residual.sum, prop_wait),
                propagated: state.propagated(event),
            },
        );
    }

    if is_latest {
        let collected = team.critical(|s: &mut BarrierScratch| std::mem::take(s))?;
        let mut outcome = DelayOutcome::new(WaitKind::ThreadBarrier);
        for (slot, cost) in collected.delay.into_iter().enumerate() {
            outcome.add_cost(slot, cost);
        }
        for slot in 0..BUDGETS {
            let sum = collected.sum_scale.get(slot).copied().unwrap_or(0.0);
            let max = collected.max_scale.get(slot).copied().unwrap_or(0.0);
            outcome.sum_scales[slot] = ScaleMap::starting(prev, sum);
            outcome.max_scales[slot] = ScaleMap::starting(prev, max);
        }
        state.propagate(oracle, prev, event, WaitKind::ThreadBarrier, &outcome.sum_scales)?;
        state.record_outcome(event, outcome);
    }
    team.barrier()
}
