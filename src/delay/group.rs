//! Delay attribution for collective wait states
//!
//! The cause publishes its runtime since the last point at which it had met
//! every group member. Members that met the cause again later get a private
//! copy for their shorter interval. Each waiter subtracts its own runtime,
//! scales the residual by its budgets and the per-node costs are reduced
//! back to the cause, together with the scale factors the cause needs to
//! propagate long-term cost onto its own earlier wait states.
//!
//! Every member runs every step, synchpoint or not, so all members issue the
//! same sequence of collectives.

use std::collections::BTreeMap;

use crate::comm::{Channel, CommHandle};
use crate::context::{ReplayContext, WaitKind};
use crate::defs::CallpathId;
use crate::error::{ReplayError, Result};
use crate::replay::scope::check_health;
use crate::synchpoint::Peer;
use crate::timemap::TimeMapSum;
use crate::trace::EventId;

use super::ops::{self, IntervalTimes, Oracle};
use super::{DelayOutcome, DelayState, ScaleMap, WaitStateProfile, BUDGETS};

/// Tag of the point-to-point side traffic of the group form
const GROUP_TAG: u32 = u32::MAX;

#[derive(Debug, Clone, Default)]
struct Header {
    prop_wait: f64,
    cnodes: Vec<CallpathId>,
    times: Vec<f64>,
}

/// Cause-side view of the delay interval
struct CauseSetup {
    prev: Option<EventId>,
    /// Members met again after `prev`, by local rank
    individual: BTreeMap<usize, EventId>,
    group: IntervalTimes,
    individual_times: BTreeMap<usize, IntervalTimes>,
}

fn align(cnodes: &[CallpathId], times: &IntervalTimes) -> Vec<f64> {
    cnodes
        .iter()
        .map(|c| times.map.get(c).copied().unwrap_or(0.0))
        .collect()
}

fn sum_vectors(mut a: Vec<Vec<f64>>, b: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    for (x, y) in a.iter_mut().zip(b) {
        for (p, q) in x.iter_mut().zip(y) {
            *p += q;
        }
    }
    a
}

fn sum_max(a: (Vec<f64>, Vec<f64>), b: (Vec<f64>, Vec<f64>)) -> (Vec<f64>, Vec<f64>) {
    let sum = a.0.iter().zip(&b.0).map(|(x, y)| x + y).collect();
    let max = a.1.iter().zip(&b.1).map(|(x, y)| x.max(*y)).collect();
    (sum, max)
}

/// Run the group form for the collective at `event` with cause `cause`
/// (local rank)
pub fn attribute(
    handle: &CommHandle<'_>,
    cause: usize,
    kind: WaitKind,
    event: EventId,
    ctx: &mut ReplayContext,
    oracle: &Oracle<'_>,
    state: &mut DelayState,
) -> Result<()> {
    let me = handle.rank();
    let is_cause = me == cause;
    let synch = oracle.detector.is_synchpoint(event);
    let cause_global = handle.global(cause)?;

    let setup = if is_cause && synch {
        let (prev, individual) = match oracle.detector.find_previous_group(event, handle.communicator()) {
            Ok((stop, individual)) => (Some(stop), individual),
            Err(ReplayError::NoPreviousSynchpoint { .. }) => (None, BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let group = oracle.interval(prev, event)?;
        let individual_times = individual
            .iter()
            .map(|(&local, &ev)| Ok((local, oracle.interval(Some(ev), event)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Some(CauseSetup {
            prev,
            individual,
            group,
            individual_times,
        })
    } else {
        None
    };
    let local = if synch && !is_cause {
        let prev = oracle.previous(event, Peer::Rank(cause_global))?;
        oracle.interval(prev, event)?.map
    } else {
        Default::default()
    };

    // Transfer: who met the cause after the group synchpoint, the cause's
    // interval times, and private times for those members.
    let flags = is_cause.then(|| {
        (0..handle.size())
            .map(|l| setup.as_ref().is_some_and(|s| s.individual.contains_key(&l)))
            .collect::<Vec<bool>>()
    });
    check_health(handle, ctx)?;
    let met_later = handle.scatter(cause, flags)?;

    let header = is_cause.then(|| match &setup {
        Some(s) => Header {
            prop_wait: s.group.prop_wait,
            cnodes: s.group.map.keys().copied().collect(),
            times: s.group.map.values().copied().collect(),
        },
        None => Header::default(),
    });
    let mut header = handle.bcast(cause, header)?;

    if let Some(s) = &setup {
        for (&member, times) in &s.individual_times {
            let private = (times.prop_wait, align(&header.cnodes, times));
            ctx.pending
                .push(handle.isend(member, Channel::Delay, GROUP_TAG, private)?);
        }
    } else if met_later {
        let (prop_wait, times): (f64, Vec<f64>) = handle.recv(cause, Channel::Delay, GROUP_TAG)?;
        header.prop_wait = prop_wait;
        header.times = times;
    }

    // Local residual of the cause's times over our own.
    let diff: Vec<f64> = if synch && !is_cause {
        header
            .cnodes
            .iter()
            .zip(&header.times)
            .map(|(c, &t)| (t - local.get(c).copied().unwrap_or(0.0)).max(0.0))
            .collect()
    } else {
        vec![0.0; header.cnodes.len()]
    };
    let dsum: f64 = diff.iter().sum();

    let wait = oracle.detector.info(event).map_or(0.0, |i| i.wait_time);
    let budgets = state.budgets(event, if is_cause { 0.0 } else { wait });
    let scales: Vec<f64> = budgets
        .iter()
        .map(|&b| if synch && !is_cause { ops::scale(b, dsum, header.prop_wait) } else { 0.0 })
        .collect();
    let contribution: Vec<Vec<f64>> = scales
        .iter()
        .map(|&s| diff.iter().map(|d| d * s).collect())
        .collect();
    let costs = handle.reduce(cause, contribution, sum_vectors)?;

    // Scale factors for long-term propagation at the cause.
    let max_in = if met_later { vec![0.0; BUDGETS] } else { scales.clone() };
    let reduced = handle.reduce(cause, (scales.clone(), max_in), sum_max)?;
    if met_later && !is_cause {
        ctx.pending
            .push(handle.isend(cause, Channel::Delay, GROUP_TAG, scales)?);
    }

    if synch && !is_cause && wait > 0.0 {
        state.record_profile(
            event,
            WaitStateProfile {
                kind,
                wait,
                indirect: wait * ops::scale(header.prop_wait, dsum, header.prop_wait),
                propagated: state.propagated(event),
            },
        );
    }

    let (Some(setup), Some(costs), Some((mut sum_out, mut max_out))) = (setup, costs, reduced) else {
        return Ok(());
    };

    let mut outcome = DelayOutcome::new(kind);
    for (slot, per_node) in costs.into_iter().enumerate() {
        let mut cost = TimeMapSum::default();
        for (&cnode, time) in header.cnodes.iter().zip(per_node) {
            cost.add(cnode, time);
        }
        outcome.add_cost(slot, cost);
        outcome.max_scales[slot] = ScaleMap::starting(setup.prev, max_out[slot]);
    }

    let mut increments: BTreeMap<EventId, Vec<f64>> = BTreeMap::new();
    for (&member, &ev) in &setup.individual {
        let s: Vec<f64> = handle.recv(member, Channel::Delay, GROUP_TAG)?;
        let inc = increments.entry(ev).or_insert_with(|| vec![0.0; BUDGETS]);
        for slot in 0..BUDGETS {
            outcome.max_scales[slot].insert(Some(ev), max_out[slot]);
            max_out[slot] = max_out[slot].max(s[slot]);
            sum_out[slot] -= s[slot];
            inc[slot] += s[slot];
        }
    }
    for slot in 0..BUDGETS {
        let mut running = sum_out[slot];
        outcome.sum_scales[slot] = ScaleMap::starting(setup.prev, running);
        for (&ev, inc) in &increments {
            running += inc[slot];
            outcome.sum_scales[slot].insert(Some(ev), running);
        }
    }

    state.propagate(oracle, setup.prev, event, kind, &outcome.sum_scales)?;
    state.record_outcome(event, outcome);
    Ok(())
}
