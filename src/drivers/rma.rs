//! One-sided window replay
//!
//! Windows are backed by a [`SharedWindow`] created by the window's local
//! rank 0 and handed to all members at window creation. Origins update the
//! target's buffer directly inside an access epoch; post/start and
//! complete/wait exchange real tokens on [`Channel::Window`] so that epoch
//! ordering is enforced by the transport.
//!
//! Passive-target lock requests are logged at the target and evaluated once
//! the window is freed, when every request and release is known.

use std::sync::Arc;

use fnv::FnvHashMap;

use super::p2p::region_begin;
use crate::comm::window::LockRecord;
use crate::comm::{Channel, CommHandle, SharedWindow, TimeRank};
use crate::context::{ReplayContext, RmaTiming};
use crate::defs::WindowId;
use crate::error::{ReplayError, Result};
use crate::replay::{ReplayScope, Stage};
use crate::trace::{Event, EventId, EventKind, RmaGroupOp, RmaSync};

#[derive(Debug, Clone, Copy)]
struct Token;

/// A lock this participant requested, waiting for evaluation at free time
#[derive(Debug, Clone, Copy)]
struct OwnLock {
    event: EventId,
    target: usize,
    slot: usize,
    /// Duration of the lock call itself
    duration: f64,
}

#[derive(Debug, Default)]
pub struct RmaDriver {
    windows: FnvHashMap<WindowId, Arc<SharedWindow>>,
    locks: FnvHashMap<WindowId, Vec<OwnLock>>,
    open: FnvHashMap<(WindowId, usize), usize>,
    lock_waits: Vec<(EventId, f64)>,
}

impl RmaDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock contention per lock event, available once its window was freed
    pub fn lock_waits(&self) -> &[(EventId, f64)] {
        &self.lock_waits
    }

    fn window(&self, id: WindowId) -> Result<&Arc<SharedWindow>> {
        self.windows.get(&id).ok_or(ReplayError::UnknownWindow(id))
    }

    pub fn on_event(
        &mut self,
        scope: &ReplayScope<'_>,
        stage: Stage,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
    ) -> Result<()> {
        if stage != Stage::Main {
            return Ok(());
        }
        match event.kind() {
            EventKind::RmaCollective { window, op } => self.collective(scope, event, ctx, *window, *op),
            EventKind::RmaGroup { window, op, group } => self.group(scope, event, ctx, *window, *op, group),
            EventKind::RmaPut { window, target, .. } | EventKind::RmaGet { window, target, .. } => {
                let handle = self.handle(scope, *window)?;
                let me = handle.rank();
                let op = TimeRank::new(event.leave_time(), me);
                self.window(*window)?.accumulate(*target, |buf| {
                    buf.access.insert(me);
                    buf.last_rma_op = TimeRank::maxloc(buf.last_rma_op, op);
                })
            }
            EventKind::RmaLock {
                window,
                target,
                exclusive,
            } => {
                let me = self.handle(scope, *window)?.rank();
                let record = LockRecord {
                    origin: me,
                    exclusive: *exclusive,
                    requested: region_begin(scope, event, ctx),
                    released: None,
                };
                let slot = self.window(*window)?.accumulate(*target, |buf| {
                    buf.locks.push(record);
                    buf.locks.len() - 1
                })?;
                self.open.insert((*window, *target), slot);
                self.locks.entry(*window).or_default().push(OwnLock {
                    event: event.id(),
                    target: *target,
                    slot,
                    duration: event.leave_time() - record.requested,
                });
                Ok(())
            }
            EventKind::RmaUnlock { window, target } => {
                let slot = self.open.remove(&(*window, *target)).ok_or_else(|| {
                    ReplayError::malformed(scope.trace.location(), "unlock without a matching lock")
                })?;
                let released = event.leave_time();
                self.window(*window)?.accumulate(*target, |buf| {
                    if let Some(record) = buf.locks.get_mut(slot) {
                        record.released = Some(released);
                    }
                })
            }
            _ => Ok(()),
        }
    }

    fn handle<'a>(&self, scope: &ReplayScope<'a>, window: WindowId) -> Result<CommHandle<'a>> {
        scope.bind(scope.defs.window(window)?.comm)
    }

    fn collective(
        &mut self,
        scope: &ReplayScope<'_>,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
        window: WindowId,
        op: RmaSync,
    ) -> Result<()> {
        let handle = self.handle(scope, window)?;
        scope.health_check(&handle, ctx)?;
        let me = handle.rank();

        if op == RmaSync::Create {
            let shared = (me == 0).then(|| Arc::new(SharedWindow::new(handle.size())));
            let shared = handle.bcast(0, shared)?;
            self.windows.insert(window, shared);
        }

        let begin = region_begin(scope, event, ctx);
        let end = event.leave_time();
        let latest = handle.allreduce(TimeRank::new(begin, me), TimeRank::maxloc)?;

        // Every epoch access happened before the reduction above completed.
        let shared = Arc::clone(self.window(window)?);
        let buffer = shared.get(me)?;
        let completion = if buffer.last_rma_op.time > begin {
            end - buffer.last_rma_op.time
        } else {
            0.0
        };
        ctx.rma = Some(RmaTiming {
            wait_time: (latest.time - begin).max(0.0),
            completion_time: completion.max(0.0),
            accesses: buffer.access.len(),
        });

        match op {
            RmaSync::Create | RmaSync::Fence => {
                shared.reset(me)?;
                handle.barrier()?;
            }
            RmaSync::Free => {
                self.evaluate_locks(window, &shared)?;
                handle.barrier()?;
                self.windows.remove(&window);
            }
        }
        Ok(())
    }

    fn group(
        &mut self,
        scope: &ReplayScope<'_>,
        event: &Event<'_>,
        ctx: &mut ReplayContext,
        window: WindowId,
        op: RmaGroupOp,
        group: &[usize],
    ) -> Result<()> {
        let handle = self.handle(scope, window)?;
        let me = handle.rank();
        let shared = Arc::clone(self.window(window)?);
        let tag = window.index() as u32;
        let begin = region_begin(scope, event, ctx);

        match op {
            RmaGroupOp::Post => {
                shared.accumulate(me, |buf| {
                    buf.reset();
                    buf.local_post = TimeRank::new(begin, me);
                })?;
                for &origin in group {
                    ctx.pending.push(handle.isend(origin, Channel::Window, tag, Token)?);
                }
            }
            RmaGroupOp::Start => {
                let mut latest_post = TimeRank::lowest();
                for &target in group {
                    handle.recv::<Token>(target, Channel::Window, tag)?;
                    latest_post = TimeRank::maxloc(latest_post, shared.get(target)?.local_post);
                }
                ctx.rma = Some(RmaTiming {
                    wait_time: (latest_post.time - begin).max(0.0),
                    ..Default::default()
                });
            }
            RmaGroupOp::Complete => {
                let complete = TimeRank::new(begin, me);
                for &target in group {
                    shared.accumulate(target, |buf| {
                        buf.last_complete = TimeRank::maxloc(buf.last_complete, complete);
                    })?;
                    ctx.pending.push(handle.isend(target, Channel::Window, tag, Token)?);
                }
            }
            RmaGroupOp::Wait => {
                for &origin in group {
                    handle.recv::<Token>(origin, Channel::Window, tag)?;
                }
                let buffer = shared.get(me)?;
                let end = event.leave_time();
                let completion = if buffer.last_rma_op.time > begin {
                    end - buffer.last_rma_op.time
                } else {
                    0.0
                };
                ctx.rma = Some(RmaTiming {
                    wait_time: (buffer.last_complete.time - begin).max(0.0),
                    completion_time: completion.max(0.0),
                    accesses: buffer.access.len(),
                });
            }
        }
        Ok(())
    }

    /// Time each of our lock requests spent behind a conflicting earlier
    /// holder, bounded by the duration of the lock call
    fn evaluate_locks(&mut self, window: WindowId, shared: &SharedWindow) -> Result<()> {
        for own in self.locks.remove(&window).unwrap_or_default() {
            let log = shared.get(own.target)?.locks;
            let Some(mine) = log.get(own.slot).copied() else {
                continue;
            };
            let blocked_until = log
                .iter()
                .enumerate()
                .filter(|&(i, r)| i != own.slot && r.requested <= mine.requested)
                .filter(|(_, r)| r.exclusive || mine.exclusive)
                .filter_map(|(_, r)| r.released)
                .fold(mine.requested, f64::max);
            let wait = (blocked_until - mine.requested).clamp(0.0, own.duration.max(0.0));
            self.lock_waits.push((own.event, wait));
        }
        Ok(())
    }
}
