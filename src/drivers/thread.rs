//! Thread fork, join and barrier replay among the locations of one process

use fnv::FnvHashMap;

use super::p2p::region_begin;
use crate::comm::TimeRank;
use crate::context::{CollectiveInfo, Detection, ReplayContext, WaitKind, WaitUpdate};
use crate::defs::RegionRole;
use crate::error::{ReplayError, Result};
use crate::replay::{ReplayScope, Stage};
use crate::synchpoint::SynchpointInfo;
use crate::trace::{Event, EventId, EventKind};

#[derive(Debug, Clone, Copy)]
struct Arrival {
    time: f64,
    fork: Option<f64>,
}

#[derive(Debug, Default)]
pub struct ThreadDriver {
    /// Timestamp of the master's pending fork
    fork_time: Option<f64>,
    /// Fork or join idle time per parallel region enter or leave
    fork_join: FnvHashMap<EventId, f64>,
    barriers: FnvHashMap<EventId, CollectiveInfo>,
}

impl ThreadDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(
        &mut self,
        scope: &ReplayScope<'_>,
        stage: Stage,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
    ) -> Result<()> {
        let role = match event.kind() {
            EventKind::Fork { team_size } => {
                if stage == Stage::Main {
                    if *team_size != scope.team.size() {
                        return Err(ReplayError::MalformedGroup(format!(
                            "fork of {} threads in a process with {} thread locations",
                            team_size,
                            scope.team.size()
                        )));
                    }
                    self.fork_time = Some(event.time());
                }
                return Ok(());
            }
            EventKind::Enter { callpath } | EventKind::Leave { callpath } => scope.defs.role_of(*callpath)?,
            _ => return Ok(()),
        };

        match (stage, role, event.is_enter()) {
            (Stage::Main, RegionRole::Parallel, true) => self.fork(scope, event, ctx),
            (Stage::Main, RegionRole::Parallel, false) => self.join(scope, event, ctx),
            (Stage::Main, RegionRole::ThreadBarrier, false) => self.barrier(scope, event, ctx),
            (Stage::ForwardSynchpoints, RegionRole::Parallel, _) => {
                ctx.fork_join = self.fork_join.get(&event.id()).copied();
                Ok(())
            }
            (Stage::BackwardDelay, RegionRole::ThreadBarrier, false) => {
                ctx.collinfo = self.barriers.get(&event.id()).copied();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn fork(&mut self, scope: &ReplayScope<'_>, event: &Event<'_>, ctx: &mut ReplayContext) -> Result<()> {
        let own = event.time();
        let arrivals = scope.team_exchange(
            ctx,
            Arrival {
                time: own,
                fork: self.fork_time.take(),
            },
        )?;
        let fork = arrivals.iter().find_map(|a| a.fork).ok_or_else(|| {
            ReplayError::malformed(scope.trace.location(), "parallel region entered without a fork")
        })?;
        let earliest = arrivals.iter().map(|a| a.time).fold(f64::MAX, f64::min);

        let fork_time = (own - fork).max(0.0);
        ctx.detection = Some(Detection {
            kind: WaitKind::ThreadFork,
            info: SynchpointInfo::new(0.0, own - earliest, fork_time),
            ranks: None,
        });
        ctx.fork_join = Some(fork_time);
        self.fork_join.insert(event.id(), fork_time);
        Ok(())
    }

    fn join(&mut self, scope: &ReplayScope<'_>, event: &Event<'_>, ctx: &mut ReplayContext) -> Result<()> {
        let own = event.time();
        let leaves = scope.team_exchange(ctx, own)?;
        let latest = leaves.iter().copied().fold(f64::MIN, f64::max);

        let join_time = (latest - own).max(0.0);
        ctx.detection = Some(Detection {
            kind: WaitKind::ThreadFork,
            info: SynchpointInfo::new(0.0, 0.0, join_time),
            ranks: None,
        });
        ctx.fork_join = Some(join_time);
        self.fork_join.insert(event.id(), join_time);
        Ok(())
    }

    fn barrier(&mut self, scope: &ReplayScope<'_>, event: &Event<'_>, ctx: &mut ReplayContext) -> Result<()> {
        let begin = region_begin(scope, event, ctx);
        let end = event.time();
        let thread = scope.thread();
        let timings = scope.team_exchange(ctx, (TimeRank::new(begin, thread), TimeRank::new(end, thread)))?;

        let latest = timings.iter().map(|t| t.0).fold(TimeRank::lowest(), TimeRank::maxloc);
        let earliest_end = timings.iter().map(|t| t.1).fold(TimeRank::highest(), TimeRank::minloc);
        let info = CollectiveInfo {
            latest,
            earliest_end,
            ..CollectiveInfo::new(TimeRank::new(begin, thread))
        };

        // Recorded without wait first; the wait is assigned once all arrivals
        // are known.
        ctx.detection = Some(Detection {
            kind: WaitKind::ThreadBarrier,
            info: SynchpointInfo::new(0.0, end - earliest_end.time, end - begin),
            ranks: None,
        });
        ctx.wait_update = Some(WaitUpdate {
            wait_time: (latest.time - begin).clamp(0.0, (end - begin).max(0.0)),
        });
        ctx.collinfo = Some(info);
        self.barriers.insert(event.id(), info);
        Ok(())
    }
}
