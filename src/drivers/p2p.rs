//! Point-to-point replay
//!
//! Forward passes reissue every recorded send as a non-blocking message to
//! the recorded receiver; backward passes reverse the direction, so the
//! receiver talks first and the sender learns what happened at the other end.
//!
//! | pass | message            | detected at   |
//! |------|--------------------|---------------|
//! | main | send timing        | late sender   |
//! | bws  | recv timing + flag | late receiver, sender-side synchpoint |
//! | fws  | late-receiver flag | receiver-side synchpoint              |

use crate::comm::Channel;
use crate::context::{Detection, ReplayContext, WaitKind};
use crate::error::Result;
use crate::rankset::RankSet;
use crate::replay::{ReplayScope, Stage};
use crate::synchpoint::{SynchpointDetector, SynchpointInfo};
use crate::trace::{Event, EventKind};

#[derive(Debug, Clone, Copy)]
struct SendTiming {
    enter: f64,
}

#[derive(Debug, Clone, Copy)]
struct RecvTiming {
    late_sender: bool,
    enter: f64,
    leave: f64,
}

#[derive(Debug, Clone, Copy)]
struct LateReceiverFlag {
    late_receiver: bool,
    leave: f64,
}

/// Begin time of the operation `event` belongs to
///
/// Forward passes read it from the live call stack, backward passes from
/// the precomputed region links.
pub(crate) fn region_begin(scope: &ReplayScope<'_>, event: &Event<'_>, ctx: &ReplayContext) -> f64 {
    if ctx.callstack.is_updating() {
        if let Some(top) = ctx.callstack.top() {
            return scope.trace.event(top).time();
        }
    }
    event.enter_time()
}

#[derive(Debug, Default)]
pub struct P2pDriver;

impl P2pDriver {
    pub fn new() -> Self {
        P2pDriver
    }

    pub fn on_event(
        &mut self,
        scope: &ReplayScope<'_>,
        stage: Stage,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
        detector: &SynchpointDetector,
    ) -> Result<()> {
        match (stage, event.kind()) {
            (Stage::Main, EventKind::Send { comm, dest, tag, .. }) => {
                let handle = scope.bind(*comm)?;
                let timing = SendTiming {
                    enter: region_begin(scope, event, ctx),
                };
                let request = handle.isend(*dest, Channel::P2p, *tag, timing)?;
                ctx.pending.push(request);
            }
            (Stage::Main, EventKind::Recv { comm, source, tag, .. }) => {
                let handle = scope.bind(*comm)?;
                let sent: SendTiming = handle.recv(*source, Channel::P2p, *tag)?;
                let enter = region_begin(scope, event, ctx);
                let total = event.leave_time() - enter;
                let wait = (sent.enter - enter).min(total);
                if wait > 0.0 {
                    ctx.detection = Some(Detection {
                        kind: WaitKind::LateSender,
                        info: SynchpointInfo::new(wait, 0.0, total),
                        ranks: Some(RankSet::singleton(scope.world.size(), handle.global(*source)?)),
                    });
                }
            }
            (Stage::BackwardWaitStates, EventKind::Recv { comm, source, tag, .. }) => {
                let handle = scope.bind(*comm)?;
                let timing = RecvTiming {
                    late_sender: detector.is_waitstate(event.id()),
                    enter: event.enter_time(),
                    leave: event.leave_time(),
                };
                let request = handle.isend(*source, Channel::P2p, *tag, timing)?;
                ctx.pending.push(request);
            }
            (
                Stage::BackwardWaitStates,
                EventKind::Send {
                    comm,
                    dest,
                    tag,
                    synchronous,
                    ..
                },
            ) => {
                let handle = scope.bind(*comm)?;
                let remote: RecvTiming = handle.recv(*dest, Channel::P2p, *tag)?;
                let enter = event.enter_time();
                let leave = event.leave_time();
                let ranks = Some(RankSet::singleton(scope.world.size(), handle.global(*dest)?));
                if remote.late_sender {
                    // The receiver waited for us: this send is the cause.
                    ctx.detection = Some(Detection {
                        kind: WaitKind::LateSender,
                        info: SynchpointInfo::new(0.0, leave - remote.leave, leave - enter),
                        ranks,
                    });
                } else if *synchronous && remote.enter > enter {
                    ctx.detection = Some(Detection {
                        kind: WaitKind::LateReceiver,
                        info: SynchpointInfo::new(remote.enter - enter, leave - remote.leave, leave - enter),
                        ranks,
                    });
                }
            }
            (Stage::ForwardSynchpoints, EventKind::Send { comm, dest, tag, .. }) => {
                let handle = scope.bind(*comm)?;
                let flag = LateReceiverFlag {
                    late_receiver: detector.is_waitstate(event.id()),
                    leave: event.leave_time(),
                };
                let request = handle.isend(*dest, Channel::P2p, *tag, flag)?;
                ctx.pending.push(request);
            }
            (Stage::ForwardSynchpoints, EventKind::Recv { comm, source, tag, .. }) => {
                let handle = scope.bind(*comm)?;
                let flag: LateReceiverFlag = handle.recv(*source, Channel::P2p, *tag)?;
                if flag.late_receiver && !detector.is_synchpoint(event.id()) {
                    let enter = region_begin(scope, event, ctx);
                    let leave = event.leave_time();
                    ctx.detection = Some(Detection {
                        kind: WaitKind::LateReceiver,
                        info: SynchpointInfo::new(0.0, leave - flag.leave, leave - enter),
                        ranks: Some(RankSet::singleton(scope.world.size(), handle.global(*source)?)),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// End of a pass: synchronize all processes, then cancel whatever was
    /// never received
    pub fn finish(&mut self, scope: &ReplayScope<'_>, ctx: &mut ReplayContext) -> Result<usize> {
        let world = scope.bind_comm(scope.world)?;
        scope.health_check(&world, ctx)?;
        world.barrier()?;
        Ok(ctx.pending.cancel_all())
    }
}
