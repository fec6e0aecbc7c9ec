//! Per-location replay driver
//!
//! One [`Analyzer`] owns all state of one traced location: the call stack,
//! the synchpoint detector, the timemap cache, every paradigm driver and the
//! delay bookkeeping. [`Analyzer::run`] walks the trace once per pass and
//! dispatches each event to the handlers the [`Registry`] lists for it.

use std::collections::BTreeMap;

use crate::callstack::Callstack;
use crate::context::{ReplayContext, WaitKind};
use crate::delay::{DelayState, Oracle};
use crate::drivers::{CollectiveDriver, P2pDriver, RmaDriver, ThreadDriver};
use crate::error::Result;
use crate::synchpoint::{SynchpointDetector, SynchpointInfo};
use crate::timemap::TimemapCache;
use crate::trace::{Event, EventId, EventKind};

use super::registry::{EventClass, HandlerId, Registry};
use super::{AnalysisCallback, Direction, EventView, FinishView, ParticipantOutput, ReplayScope, Stage};

pub struct Analyzer<'a, C> {
    scope: ReplayScope<'a>,
    registry: &'a Registry,
    ctx: ReplayContext,
    p2p: P2pDriver,
    collective: CollectiveDriver,
    rma: RmaDriver,
    thread: ThreadDriver,
    detector: SynchpointDetector,
    kinds: BTreeMap<EventId, WaitKind>,
    cache: TimemapCache,
    delay: DelayState,
    callback: C,
}

impl<'a, C: AnalysisCallback> Analyzer<'a, C> {
    pub fn new(scope: ReplayScope<'a>, registry: &'a Registry, callback: C) -> Self {
        Analyzer {
            ctx: ReplayContext::new(scope.config.pending_pool_capacity),
            p2p: P2pDriver::new(),
            collective: CollectiveDriver::new(),
            rma: RmaDriver::new(),
            thread: ThreadDriver::new(),
            detector: SynchpointDetector::new(scope.process(), scope.world.size()),
            kinds: BTreeMap::new(),
            cache: TimemapCache::new(),
            delay: DelayState::new(),
            scope,
            registry,
            callback,
        }
    }

    pub fn detector(&self) -> &SynchpointDetector {
        &self.detector
    }

    pub fn delay(&self) -> &DelayState {
        &self.delay
    }

    /// Run every pass of the plan, then hand the accumulated state to the
    /// callback
    pub fn run(&mut self) -> Result<()> {
        let registry: &'a Registry = self.registry;
        for &stage in registry.plan().stages() {
            self.run_pass(stage)?;
        }

        let view = FinishView {
            defs: self.scope.defs,
            location: self.scope.location,
            trace: self.scope.trace,
            detector: &self.detector,
            kinds: &self.kinds,
            delay: &self.delay,
            lock_waits: self.rma.lock_waits(),
        };
        let result = self.callback.finish(&view);
        self.absorb(result)
    }

    pub fn into_output(self) -> ParticipantOutput<C> {
        let wait_states = self.detector.iter().filter(|(_, i)| i.wait_time > 0.0).count();
        ParticipantOutput {
            location: self.scope.location,
            synchpoints: self.detector.len(),
            wait_states,
            errors: self.ctx.errors,
            callback: self.callback,
        }
    }

    fn run_pass(&mut self, stage: Stage) -> Result<()> {
        let _span = tracing::debug_span!(
            "pass",
            %stage,
            process = self.scope.process(),
            thread = self.scope.thread()
        )
        .entered();

        self.prepare(stage);
        let trace = self.scope.trace;
        match stage.direction() {
            Direction::Forward => {
                for event in trace.forward() {
                    self.process(stage, event)?;
                }
            }
            Direction::Backward => {
                for event in trace.backward() {
                    self.process(stage, event)?;
                }
            }
        }
        self.close(stage)
    }

    fn prepare(&mut self, stage: Stage) {
        self.ctx.callstack = Callstack::new();
        self.ctx.callstack.set_update(stage.direction() == Direction::Forward);
        self.ctx.reset();
    }

    fn close(&mut self, stage: Stage) -> Result<()> {
        if stage == Stage::ForwardSynchpoints {
            self.cache.finish();
        }
        self.scope.team_exchange(&self.ctx, ())?;
        if self.scope.endpoint.is_some() {
            let cancelled = self.p2p.finish(&self.scope, &mut self.ctx)?;
            if cancelled > 0 {
                tracing::debug!(%stage, cancelled, "pass closed with unmatched sends");
            }
        }
        self.scope.team.barrier()?;
        tracing::debug!(%stage, synchpoints = self.detector.len(), "pass finished");
        Ok(())
    }

    fn process(&mut self, stage: Stage, event: Event<'a>) -> Result<()> {
        let registry: &'a Registry = self.registry;
        let class = EventClass::of(&event, self.scope.defs)?;
        let mut detected = None;

        for &handler in registry.handlers(stage, class) {
            match handler {
                HandlerId::ReplayControl => {
                    self.ctx.pending.drain();
                }
                HandlerId::P2p => self
                    .p2p
                    .on_event(&self.scope, stage, &event, &mut self.ctx, &self.detector)?,
                HandlerId::Collective => self.collective.on_event(&self.scope, stage, &event, &mut self.ctx)?,
                HandlerId::OneSided => self.rma.on_event(&self.scope, stage, &event, &mut self.ctx)?,
                HandlerId::Thread => self.thread.on_event(&self.scope, stage, &event, &mut self.ctx)?,
                HandlerId::Detector => detected = self.record(event.id())?,
                HandlerId::Timemap => self.update_timemap(&event)?,
                HandlerId::Delay => {
                    let oracle = Oracle {
                        detector: &self.detector,
                        cache: &self.cache,
                        trace: self.scope.trace,
                    };
                    self.delay
                        .on_event(&self.scope, stage, &event, &mut self.ctx, &oracle)?;
                }
                HandlerId::Callbacks => self.notify(stage, event, detected)?,
            }
        }

        self.ctx.callstack.update(&event, self.scope.defs)?;
        self.ctx.reset();
        Ok(())
    }

    /// Store what the drivers detected at `event`
    fn record(&mut self, event: EventId) -> Result<Option<(WaitKind, SynchpointInfo)>> {
        let mut kind = None;
        if let Some(detection) = &self.ctx.detection {
            match &detection.ranks {
                Some(ranks) => self.detector.record(event, detection.info, ranks.clone())?,
                None => self.detector.record_thread(event, detection.info)?,
            }
            self.kinds.insert(event, detection.kind);
            kind = Some(detection.kind);
        }
        if let Some(update) = self.ctx.wait_update {
            self.detector.update_wait_time(event, update.wait_time)?;
        }
        Ok(kind.and_then(|k| self.detector.info(event).map(|info| (k, info))))
    }

    /// Credit elapsed time to call-tree nodes and flush at synchpoints
    ///
    /// A region's own time is credited at its leave, after the flush of a
    /// synchpoint at that leave, so it lands in the following interval.
    fn update_timemap(&mut self, event: &Event<'_>) -> Result<()> {
        let id = event.id();
        let synch = self.detector.is_synchpoint(id);
        match event.kind() {
            EventKind::Enter { callpath } => {
                let parent = self.scope.defs.parent(*callpath)?;
                self.cache.on_enter(event.time(), parent);
                if let Some(fork) = self.ctx.fork_join {
                    if !self.scope.location.is_master() {
                        self.cache.clear_running();
                    }
                    if let Some(parent) = parent {
                        self.cache.debit(parent, fork);
                    }
                    if synch {
                        self.cache.flush(id);
                    }
                    self.cache.reassign(*callpath, None, fork);
                } else if synch {
                    self.cache.flush(id);
                }
            }
            EventKind::Leave { callpath } => {
                if let Some(join) = self.ctx.fork_join {
                    self.cache.reassign(*callpath, self.scope.defs.parent(*callpath)?, join);
                }
                if synch {
                    self.cache.flush(id);
                }
                self.cache.on_leave(event.time(), *callpath);
            }
            _ => {
                if synch {
                    self.cache.flush(id);
                }
            }
        }
        Ok(())
    }

    fn notify(&mut self, stage: Stage, event: Event<'a>, detected: Option<(WaitKind, SynchpointInfo)>) -> Result<()> {
        let id = event.id();
        let delay = match stage {
            Stage::BackwardDelay => self
                .delay
                .outcomes()
                .last()
                .filter(|(at, _)| *at == id)
                .map(|(_, outcome)| outcome),
            _ => None,
        };
        let profile = match stage {
            Stage::BackwardDelay | Stage::ForwardPropagation => self.delay.profile(id),
            _ => None,
        };
        let view = EventView {
            event,
            defs: self.scope.defs,
            location: self.scope.location,
            ctx: &self.ctx,
            detected,
            delay,
            profile,
        };
        let result = self.callback.on_event(stage, &view);
        self.absorb(result)
    }

    /// Keep recoverable callback errors on the context; pass fatal ones up
    fn absorb(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if !e.is_fatal() => {
                self.ctx.record_error(e.to_string());
                Ok(())
            }
            other => other,
        }
    }
}
