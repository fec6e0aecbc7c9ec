//! One-to-one delay attribution for point-to-point wait states
//!
//! Late sender: the receiver waited, the sender is the cause. Late
//! receiver: the synchronous sender waited, the receiver is the cause and
//! the exchange runs on the inverse channel. In both cases the waiter ships
//! its budgets and its runtime since the last synchronization with the
//! cause; the cause does the arithmetic.

use crate::comm::{Channel, CommHandle};
use crate::context::{ReplayContext, WaitKind};
use crate::error::Result;
use crate::replay::{ReplayScope, Stage};
use crate::synchpoint::Peer;
use crate::timemap::{TimeMap, TimeMapSum};
use crate::trace::{Event, EventKind};

use super::ops::{self, Oracle};
use super::{Budgets, DelayOutcome, DelayState, ScaleMap, WaitStateProfile, BUDGETS};

#[derive(Debug, Clone)]
struct DelayRequest {
    kind: WaitKind,
    budgets: Budgets,
    runtimes: TimeMap,
}

/// Which side of a point-to-point synchpoint this event is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Waiter,
    Cause,
}

/// Point-to-point pairing of one event
struct Pairing<'a> {
    handle: CommHandle<'a>,
    peer: usize,
    tag: u32,
    role: Role,
    kind: WaitKind,
    channel: Channel,
}

fn pairing<'a>(scope: &ReplayScope<'a>, event: &Event<'_>, oracle: &Oracle<'_>) -> Result<Option<Pairing<'a>>> {
    let id = event.id();
    if !oracle.detector.is_synchpoint(id) {
        return Ok(None);
    }
    let waiting = oracle.detector.is_waitstate(id);
    let (comm, peer, tag, role, kind, channel) = match event.kind() {
        EventKind::Recv { comm, source, tag, .. } if waiting => {
            (*comm, *source, *tag, Role::Waiter, WaitKind::LateSender, Channel::Delay)
        }
        EventKind::Recv { comm, source, tag, .. } => {
            (*comm, *source, *tag, Role::Cause, WaitKind::LateReceiver, Channel::Inverse)
        }
        EventKind::Send { comm, dest, tag, .. } if waiting => {
            (*comm, *dest, *tag, Role::Waiter, WaitKind::LateReceiver, Channel::Inverse)
        }
        EventKind::Send { comm, dest, tag, .. } => {
            (*comm, *dest, *tag, Role::Cause, WaitKind::LateSender, Channel::Delay)
        }
        _ => return Ok(None),
    };
    Ok(Some(Pairing {
        handle: scope.bind(comm)?,
        peer,
        tag,
        role,
        kind,
        channel,
    }))
}

pub fn on_event(
    scope: &ReplayScope<'_>,
    stage: Stage,
    event: &Event<'_>,
    ctx: &mut ReplayContext,
    oracle: &Oracle<'_>,
    state: &mut DelayState,
) -> Result<()> {
    let Some(pair) = pairing(scope, event, oracle)? else {
        return Ok(());
    };
    let peer_global = pair.handle.global(pair.peer)?;
    let id = event.id();

    match (stage, pair.role) {
        (Stage::BackwardDelay, Role::Waiter) => {
            let wait = oracle.detector.info(id).map_or(0.0, |i| i.wait_time);
            let prev = oracle.previous(id, Peer::Rank(peer_global))?;
            let request = DelayRequest {
                kind: pair.kind,
                budgets: state.budgets(id, wait),
                runtimes: oracle.interval(prev, id)?.map,
            };
            state.record_profile(
                id,
                WaitStateProfile {
                    kind: pair.kind,
                    wait,
                    indirect: 0.0,
                    propagated: state.propagated(id),
                },
            );
            ctx.pending
                .push(pair.handle.isend(pair.peer, pair.channel, pair.tag, request)?);
        }
        (Stage::BackwardDelay, Role::Cause) => {
            let request: DelayRequest = pair.handle.recv(pair.peer, pair.channel, pair.tag)?;
            let prev = oracle.previous(id, Peer::Rank(peer_global))?;
            let own = oracle.interval(prev, id)?;
            let residual = ops::diff(&own.map, &request.runtimes);

            let mut outcome = DelayOutcome::new(request.kind);
            for slot in 0..BUDGETS {
                let scale = ops::scale(request.budgets[slot], residual.sum, own.prop_wait);
                let mut cost = TimeMapSum::default();
                ops::add_scaled(&residual, scale, &mut cost);
                outcome.add_cost(slot, cost);
                outcome.sum_scales[slot] = ScaleMap::starting(prev, scale);
                outcome.max_scales[slot] = ScaleMap::starting(prev, scale);
            }
            state.propagate(oracle, prev, id, request.kind, &outcome.sum_scales)?;
            state.record_outcome(id, outcome);
            state.store_share(id, ops::scale(own.prop_wait, residual.sum, own.prop_wait));
        }
        (Stage::ForwardPropagation, Role::Cause) => {
            let share = state.share(id);
            ctx.pending
                .push(pair.handle.isend(pair.peer, pair.channel, pair.tag, share)?);
        }
        (Stage::ForwardPropagation, Role::Waiter) => {
            let share: f64 = pair.handle.recv(pair.peer, pair.channel, pair.tag)?;
            let wait = state.profile(id).map_or(0.0, |p| p.wait);
            state.set_indirect(id, wait * share);
        }
        _ => {}
    }
    Ok(())
}
