//! Collective replay
//!
//! In the main pass every participant contributes its begin time to a small
//! reduction that reconstructs who waited for whom. The result is cached per
//! event, so the delay pass restores the exact same [`CollectiveInfo`]
//! without communicating again. The point-to-point-only passes merely keep
//! processes in step with an optional barrier.

use fnv::FnvHashMap;

use super::p2p::region_begin;
use crate::comm::{CommHandle, TimeRank};
use crate::context::{CollectiveInfo, Detection, ReplayContext, WaitKind};
use crate::defs::{CommId, Communicator, RegionRole};
use crate::error::Result;
use crate::rankset::RankSet;
use crate::replay::{ReplayScope, Stage};
use crate::synchpoint::SynchpointInfo;
use crate::trace::{CollectiveOp, Event, EventId, EventKind};

/// Collective reconstructed from one event
#[derive(Debug, Clone, Copy)]
struct CollectiveCall {
    comm: CommId,
    op: CollectiveOp,
    kind: WaitKind,
    root: Option<usize>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl CollectiveCall {
    /// Calls that move no data create no synchpoint
    fn has_payload(&self) -> bool {
        self.bytes_sent > 0 || self.bytes_received > 0
    }

    fn from_event(scope: &ReplayScope<'_>, event: &Event<'_>) -> Result<Option<Self>> {
        match event.kind() {
            EventKind::CollEnd {
                comm,
                op,
                root,
                bytes_sent,
                bytes_received,
            } => Ok(Some(CollectiveCall {
                comm: *comm,
                op: *op,
                kind: match op {
                    CollectiveOp::Barrier => WaitKind::Barrier,
                    CollectiveOp::OneToN => WaitKind::OneToN,
                    CollectiveOp::NToOne => WaitKind::NToOne,
                    CollectiveOp::Scan => WaitKind::Scan,
                    _ => WaitKind::NToN,
                },
                root: *root,
                bytes_sent: *bytes_sent,
                bytes_received: *bytes_received,
            })),
            EventKind::Leave { callpath } => {
                let kind = match scope.defs.role_of(*callpath)? {
                    RegionRole::Init => WaitKind::Init,
                    RegionRole::Finalize => WaitKind::Finalize,
                    _ => return Ok(None),
                };
                Ok(Some(CollectiveCall {
                    comm: CommId::WORLD,
                    op: CollectiveOp::Barrier,
                    kind,
                    root: None,
                    bytes_sent: 0,
                    bytes_received: 0,
                }))
            }
            _ => Ok(None),
        }
    }

    fn is_replayed(&self, comm: &Communicator) -> bool {
        comm.size() > 1 && !self.op.is_irregular()
    }
}

/// Outcome of the timing reduction for one participant
struct Resolution {
    info: CollectiveInfo,
    /// `None` if this participant did not synchronize
    synch: Option<(f64, f64, RankSet)>,
}

#[derive(Debug, Default)]
pub struct CollectiveDriver {
    infos: FnvHashMap<EventId, CollectiveInfo>,
}

impl CollectiveDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collective timing cached in the main pass
    pub fn cached(&self, event: EventId) -> Option<&CollectiveInfo> {
        self.infos.get(&event)
    }

    pub fn on_event(
        &mut self,
        scope: &ReplayScope<'_>,
        stage: Stage,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
    ) -> Result<()> {
        let Some(call) = CollectiveCall::from_event(scope, event)? else {
            return Ok(());
        };
        let comm = scope.communicator(call.comm)?;
        if !call.is_replayed(comm) {
            return Ok(());
        }
        match stage {
            Stage::Main => self.resolve(scope, event, ctx, call, comm),
            Stage::BackwardWaitStates | Stage::ForwardSynchpoints => {
                if scope.config.progress_barrier {
                    let handle = scope.bind_comm(comm)?;
                    scope.health_check(&handle, ctx)?;
                    handle.barrier()?;
                }
                Ok(())
            }
            Stage::BackwardDelay => {
                ctx.collinfo = self.infos.get(&event.id()).copied();
                Ok(())
            }
            Stage::ForwardPropagation => Ok(()),
        }
    }

    fn resolve(
        &mut self,
        scope: &ReplayScope<'_>,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
        call: CollectiveCall,
        comm: &Communicator,
    ) -> Result<()> {
        let handle = scope.bind_comm(comm)?;
        scope.health_check(&handle, ctx)?;

        let begin = region_begin(scope, event, ctx);
        let end = event.leave_time();
        let my = TimeRank::new(begin, handle.rank());
        let world = scope.world.size();

        let resolution = match call.op {
            CollectiveOp::OneToN => {
                let root = call.root.unwrap_or(0);
                one_to_n(&handle, my, end, root, &call, world)?
            }
            CollectiveOp::NToOne => {
                let root = call.root.unwrap_or(0);
                n_to_one(&handle, my, end, root, &call, world)?
            }
            CollectiveOp::Scan => scan(&handle, my, &call, world)?,
            CollectiveOp::NToN => n_to_n(&handle, my, end, &call, world)?,
            _ => barrier(&handle, my, end, world)?,
        };

        if let Some((wait, completion, ranks)) = resolution.synch {
            ctx.detection = Some(Detection {
                kind: call.kind,
                info: SynchpointInfo::new(wait, completion, end - begin),
                ranks: Some(ranks),
            });
        }
        self.infos.insert(event.id(), resolution.info);
        ctx.collinfo = Some(resolution.info);
        Ok(())
    }
}

fn global_set(handle: &CommHandle<'_>, world: usize, locals: impl IntoIterator<Item = usize>) -> Result<RankSet> {
    let mut set = RankSet::new(world);
    for local in locals {
        set.insert(handle.global(local)?);
    }
    Ok(set)
}

fn or_words(mut a: Vec<u64>, b: Vec<u64>) -> Vec<u64> {
    for (x, y) in a.iter_mut().zip(b) {
        *x |= y;
    }
    a
}

fn completion(end: f64, earliest_end: TimeRank) -> f64 {
    if earliest_end.time < f64::MAX {
        end - earliest_end.time
    } else {
        0.0
    }
}

fn barrier(handle: &CommHandle<'_>, my: TimeRank, end: f64, world: usize) -> Result<Resolution> {
    let latest = handle.allreduce(my, TimeRank::maxloc)?;
    let earliest_end = handle.allreduce(TimeRank::new(end, my.rank), TimeRank::minloc)?;
    let info = CollectiveInfo {
        latest,
        earliest_end,
        ..CollectiveInfo::new(my)
    };
    let ranks = global_set(handle, world, 0..handle.size())?;
    Ok(Resolution {
        info,
        synch: Some((latest.time - my.time, completion(end, earliest_end), ranks)),
    })
}

fn one_to_n(
    handle: &CommHandle<'_>,
    my: TimeRank,
    end: f64,
    root: usize,
    call: &CollectiveCall,
    world: usize,
) -> Result<Resolution> {
    let is_root = handle.rank() == root;
    let sent = handle.bcast(root, is_root.then_some(call.bytes_sent))?;
    let mut info = CollectiveInfo::new(my);
    if sent == 0 {
        return Ok(Resolution { info, synch: None });
    }
    info.root = handle.bcast(root, is_root.then_some(my))?;

    let waits = !is_root && call.bytes_received > 0 && my.time < info.root.time;
    let candidate = if waits {
        TimeRank::new(end, my.rank)
    } else {
        TimeRank::highest()
    };
    info.earliest_end = handle.allreduce(candidate, TimeRank::minloc)?;
    info.latest = info.root;

    let bits = if waits {
        RankSet::singleton(world, handle.global(my.rank)?)
    } else {
        RankSet::new(world)
    };
    let waiters = handle.reduce(root, bits.to_words(), or_words)?;

    let synch = if waits {
        let ranks = global_set(handle, world, [root])?;
        Some((info.root.time - my.time, completion(end, info.earliest_end), ranks))
    } else if is_root && info.earliest_end.time < f64::MAX {
        let ranks = RankSet::from_words(world, waiters.unwrap_or_default());
        Some((0.0, 0.0, ranks))
    } else {
        None
    };
    Ok(Resolution { info, synch })
}

fn n_to_one(
    handle: &CommHandle<'_>,
    my: TimeRank,
    end: f64,
    root: usize,
    call: &CollectiveCall,
    world: usize,
) -> Result<Resolution> {
    let is_root = handle.rank() == root;
    let mut info = CollectiveInfo::new(my);
    info.root = handle.bcast(root, is_root.then_some(my))?;
    let sender = if call.bytes_sent > 0 { my } else { TimeRank::lowest() };
    info.latest = handle.allreduce(sender, TimeRank::maxloc)?;

    let synchronizes = info.root.time < info.latest.time && (is_root || my.rank == info.latest.rank);
    let candidate = if synchronizes {
        TimeRank::new(end, my.rank)
    } else {
        TimeRank::highest()
    };
    info.earliest_end = handle.allreduce(candidate, TimeRank::minloc)?;

    let synch = if !synchronizes {
        None
    } else if is_root {
        let ranks = global_set(handle, world, [info.latest.rank])?;
        Some((info.latest.time - my.time, completion(end, info.earliest_end), ranks))
    } else {
        Some((0.0, 0.0, global_set(handle, world, [root])?))
    };
    Ok(Resolution { info, synch })
}

fn n_to_n(
    handle: &CommHandle<'_>,
    my: TimeRank,
    end: f64,
    call: &CollectiveCall,
    world: usize,
) -> Result<Resolution> {
    let mut info = CollectiveInfo::new(my);
    if !call.has_payload() {
        return Ok(Resolution { info, synch: None });
    }
    let latest = handle.allreduce(my, TimeRank::maxloc)?;
    let earliest = handle.allreduce(TimeRank::new(end, my.rank), TimeRank::minloc)?;

    if earliest.time > latest.time {
        // Every participant was inside the operation at the same time.
        info.latest = latest;
        info.earliest_end = earliest;
        let ranks = global_set(handle, world, 0..handle.size())?;
        return Ok(Resolution {
            info,
            synch: Some((latest.time - my.time, completion(end, earliest), ranks)),
        });
    }

    let sender = if call.bytes_sent > 0 { my } else { TimeRank::lowest() };
    info.latest = handle.allreduce(sender, TimeRank::maxloc)?;
    let waits = call.bytes_received > 0 && my.time < info.latest.time;
    let synchronizes = waits || (call.bytes_sent > 0 && my.rank == info.latest.rank);

    let candidate = if synchronizes {
        TimeRank::new(end, my.rank)
    } else {
        TimeRank::highest()
    };
    info.earliest_end = handle.allreduce(candidate, TimeRank::minloc)?;

    let bits = if synchronizes {
        RankSet::singleton(world, handle.global(my.rank)?)
    } else {
        RankSet::new(world)
    };
    let members = handle.allreduce(bits.to_words(), or_words)?;

    let synch = synchronizes.then(|| {
        let wait = if waits { info.latest.time - my.time } else { 0.0 };
        (wait, completion(end, info.earliest_end), RankSet::from_words(world, members))
    });
    Ok(Resolution { info, synch })
}

fn scan(handle: &CommHandle<'_>, my: TimeRank, call: &CollectiveCall, world: usize) -> Result<Resolution> {
    let mut info = CollectiveInfo::new(my);
    if !call.has_payload() {
        return Ok(Resolution { info, synch: None });
    }
    let sender = if call.bytes_sent > 0 { my } else { TimeRank::lowest() };
    info.latest = handle.scan(sender, TimeRank::maxloc)?;
    let synch = if my.time < info.latest.time {
        let ranks = global_set(handle, world, [info.latest.rank])?;
        Some((info.latest.time - my.time, 0.0, ranks))
    } else {
        None
    };
    Ok(Resolution { info, synch })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::comm::{AbortLatch, Endpoint};

    fn spmd<R: Send>(n: usize, f: impl Fn(CommHandle<'_>) -> R + Sync) -> Vec<R> {
        let eps = Endpoint::connect(n, Arc::new(AbortLatch::default()), Duration::from_millis(5));
        let world = Communicator::world(n);
        std::thread::scope(|s| {
            let handles: Vec<_> = eps
                .into_iter()
                .map(|ep| {
                    let f = &f;
                    let world = &world;
                    s.spawn(move || f(ep.bind(world).unwrap()))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    fn call(op: CollectiveOp, root: Option<usize>, sent: u64, received: u64) -> CollectiveCall {
        CollectiveCall {
            comm: CommId::WORLD,
            op,
            kind: WaitKind::NToN,
            root,
            bytes_sent: sent,
            bytes_received: received,
        }
    }

    #[test]
    fn test_barrier_waits_for_latest() {
        let begins = [0.0, 1.0, 2.0, 5.0];
        let out = spmd(4, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            barrier(&c, my, 6.0, 4).unwrap()
        });
        let waits: Vec<f64> = out.iter().map(|r| r.synch.as_ref().unwrap().0).collect();
        assert_eq!(waits, vec![5.0, 4.0, 3.0, 0.0]);
        for r in &out {
            let (_, completion, ranks) = r.synch.as_ref().unwrap();
            assert_eq!(*completion, 0.0);
            assert!(ranks.is_full());
            assert_eq!(r.info.latest.rank, 3);
        }
    }

    #[test]
    fn test_broadcast_only_early_receivers_wait() {
        let begins = [2.0, 0.0, 1.0, 3.0];
        let out = spmd(4, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            let sent = if c.rank() == 0 { 8 } else { 0 };
            one_to_n(&c, my, 4.0, 0, &call(CollectiveOp::OneToN, Some(0), sent, 8), 4).unwrap()
        });
        assert_eq!(out[1].synch.as_ref().unwrap().0, 2.0);
        assert_eq!(out[2].synch.as_ref().unwrap().0, 1.0);
        assert!(out[3].synch.is_none());
        let (wait, _, ranks) = out[0].synch.as_ref().unwrap();
        assert_eq!(*wait, 0.0);
        assert_eq!(ranks.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_zero_byte_broadcast_is_skipped() {
        let out = spmd(2, |c| {
            let my = TimeRank::new(c.rank() as f64, c.rank());
            one_to_n(&c, my, 3.0, 1, &call(CollectiveOp::OneToN, Some(1), 0, 0), 2).unwrap()
        });
        assert!(out.iter().all(|r| r.synch.is_none()));
    }

    #[test]
    fn test_reduce_root_waits_for_latest_sender() {
        let begins = [0.0, 4.0, 1.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            n_to_one(&c, my, 5.0, 0, &call(CollectiveOp::NToOne, Some(0), 8, 8), 3).unwrap()
        });
        assert_eq!(out[0].synch.as_ref().unwrap().0, 4.0);
        assert_eq!(out[1].synch.as_ref().unwrap().0, 0.0);
        assert!(out[2].synch.is_none());
    }

    #[test]
    fn test_allreduce_full_overlap_synchronizes_everyone() {
        let begins = [0.0, 2.0, 1.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            n_to_n(&c, my, 3.0, &call(CollectiveOp::NToN, None, 8, 8), 3).unwrap()
        });
        let waits: Vec<f64> = out.iter().map(|r| r.synch.as_ref().unwrap().0).collect();
        assert_eq!(waits, vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_scan_waits_for_prefix_latest() {
        let begins = [3.0, 1.0, 2.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            scan(&c, my, &call(CollectiveOp::Scan, None, 8, 8), 3).unwrap()
        });
        assert!(out[0].synch.is_none());
        assert_eq!(out[1].synch.as_ref().unwrap().0, 2.0);
        assert_eq!(out[2].synch.as_ref().unwrap().0, 1.0);
    }

    #[test]
    fn test_zero_payload_all_to_all_is_skipped() {
        let begins = [0.0, 2.0, 1.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            n_to_n(&c, my, 3.0, &call(CollectiveOp::NToN, None, 0, 0), 3).unwrap()
        });
        assert!(out.iter().all(|r| r.synch.is_none()));
    }

    #[test]
    fn test_scan_ignores_ranks_without_send_payload() {
        // Rank 0 contributes nothing, so rank 1 has no late prefix to wait for
        let begins = [3.0, 1.0, 2.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            let sent = if c.rank() == 0 { 0 } else { 8 };
            scan(&c, my, &call(CollectiveOp::Scan, None, sent, 8), 3).unwrap()
        });
        assert!(out.iter().all(|r| r.synch.is_none()));
        assert_eq!(out[2].info.latest.rank, 2);
    }

    #[test]
    fn test_zero_payload_scan_is_skipped() {
        let begins = [3.0, 1.0, 2.0];
        let out = spmd(3, |c| {
            let my = TimeRank::new(begins[c.rank()], c.rank());
            scan(&c, my, &call(CollectiveOp::Scan, None, 0, 0), 3).unwrap()
        });
        assert!(out.iter().all(|r| r.synch.is_none()));
    }
}
