//! Task-aware call stack
//!
//! Each location keeps one stack per task. A task switch suspends the
//! current stack and resumes (or starts) another, and the time a task spends
//! switched out is accumulated so patterns can subtract it from the
//! durations of the task's open regions.
//!
//! Updates only happen in forward passes; replay control disables them for
//! backward passes, which use the precomputed enter/leave links instead.

use fnv::FnvHashMap;

use crate::defs::{CallpathId, Definitions, RegionRole};
use crate::error::{ReplayError, Result};
use crate::trace::{Event, EventId, EventKind, IMPLICIT_TASK};

#[derive(Debug)]
pub struct Callstack {
    current: u64,
    stacks: FnvHashMap<u64, Vec<EventId>>,
    /// Out-of-task time per open frame, parallel to `stacks`
    out_of_task: FnvHashMap<u64, Vec<f64>>,
    total_out_of_task: FnvHashMap<u64, f64>,
    start_time: FnvHashMap<u64, f64>,
    switch_out: FnvHashMap<u64, f64>,
    stub_nodes: FnvHashMap<u64, CallpathId>,
    origin: Option<CallpathId>,
    update: bool,
}

impl Default for Callstack {
    fn default() -> Self {
        Self::new()
    }
}

impl Callstack {
    pub fn new() -> Self {
        Callstack {
            current: IMPLICIT_TASK,
            stacks: FnvHashMap::default(),
            out_of_task: FnvHashMap::default(),
            total_out_of_task: FnvHashMap::default(),
            start_time: FnvHashMap::default(),
            switch_out: FnvHashMap::default(),
            stub_nodes: FnvHashMap::default(),
            origin: None,
            update: true,
        }
    }

    pub fn set_update(&mut self, update: bool) {
        self.update = update;
    }

    pub fn is_updating(&self) -> bool {
        self.update
    }

    /// Task currently executing on this location
    pub fn current_task(&self) -> u64 {
        self.current
    }

    pub fn update(&mut self, event: &Event<'_>, defs: &Definitions) -> Result<()> {
        if !self.update {
            return Ok(());
        }
        match event.kind() {
            EventKind::Enter { callpath } => {
                if defs.role_of(*callpath)? == RegionRole::Parallel {
                    self.reset_task_clock(self.current, event.time());
                }
                self.push(event.id());
            }
            EventKind::Leave { .. } => self.pop(),
            EventKind::TaskSwitch { task } => self.switch_to(event, *task, defs)?,
            EventKind::TaskComplete { task } => {
                self.current = IMPLICIT_TASK;
                self.stacks.remove(task);
                self.out_of_task.remove(task);
                self.total_out_of_task.remove(task);
                self.start_time.remove(task);
                self.switch_out.remove(task);
            }
            _ => {}
        }
        Ok(())
    }

    fn switch_to(&mut self, event: &Event<'_>, task: u64, defs: &Definitions) -> Result<()> {
        if task != IMPLICIT_TASK && !self.start_time.contains_key(&task) {
            // First switch into this task: find the call-tree stub the task
            // body hangs off.
            let mut next = event.next();
            while let Some(candidate) = next {
                if let EventKind::Enter { callpath } = candidate.kind() {
                    if defs.role_of(*callpath)? != RegionRole::Artificial {
                        break;
                    }
                }
                next = candidate.next();
            }
            let body = next.ok_or_else(|| ReplayError::MalformedTrace {
                location: event.trace().location(),
                reason: format!("task {} is never entered", task),
            })?;
            let region = defs.callpath(body.cnode())?.region;

            if self.current == IMPLICIT_TASK {
                if let Some(prev) = event.prev() {
                    if !matches!(prev.kind(), EventKind::TaskComplete { .. }) {
                        self.origin = Some(prev.cnode());
                    }
                }
            }
            if let Some(stub) = self
                .origin
                .and_then(|origin| defs.child_with_region(origin, region))
            {
                self.stub_nodes.insert(task, stub);
            }
        }

        self.switch_out.insert(self.current, event.time());
        self.current = task;

        let resumed = self.stacks.get(&task).is_some_and(|s| !s.is_empty());
        if resumed {
            let away = event.time() - self.switch_out.get(&task).copied().unwrap_or(event.time());
            if let Some(frames) = self.out_of_task.get_mut(&task) {
                for frame in frames.iter_mut() {
                    *frame += away;
                }
            }
            *self.total_out_of_task.entry(task).or_insert(0.0) += away;
        } else {
            self.reset_task_clock(task, event.time());
        }
        Ok(())
    }

    fn reset_task_clock(&mut self, task: u64, time: f64) {
        self.start_time.insert(task, time);
        self.total_out_of_task.insert(task, 0.0);
        self.switch_out.insert(task, 0.0);
    }

    fn push(&mut self, event: EventId) {
        self.stacks.entry(self.current).or_default().push(event);
        self.out_of_task.entry(self.current).or_default().push(0.0);
    }

    fn pop(&mut self) {
        if let Some(stack) = self.stacks.get_mut(&self.current) {
            stack.pop();
        }
        if let Some(frames) = self.out_of_task.get_mut(&self.current) {
            frames.pop();
        }
    }

    /// Innermost open enter event of the current task
    pub fn top(&self) -> Option<EventId> {
        self.stacks.get(&self.current).and_then(|s| s.last().copied())
    }

    pub fn depth(&self) -> usize {
        self.stacks.get(&self.current).map_or(0, Vec::len)
    }

    /// Call-tree stub node under which the current task was created
    pub fn stub_node(&self) -> Option<CallpathId> {
        self.stub_nodes.get(&self.current).copied()
    }

    /// Time the innermost open region spent switched out
    pub fn current_time_offset(&self) -> f64 {
        self.out_of_task
            .get(&self.current)
            .and_then(|f| f.last().copied())
            .unwrap_or(0.0)
    }

    /// Time the current task spent switched out since it started
    pub fn total_time_offset(&self) -> f64 {
        self.total_out_of_task
            .get(&self.current)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn start_time(&self) -> f64 {
        self.start_time.get(&self.current).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{Callpath, Location, LocationId, Region, RegionId};
    use crate::trace::{EventRecord, LocalTrace};

    fn defs() -> Definitions {
        let region = |name: &str, role| Region {
            name: name.into(),
            role,
        };
        Definitions {
            regions: vec![
                region("main", RegionRole::Function),
                region("task_body", RegionRole::Task),
                region("stub", RegionRole::Artificial),
            ],
            callpaths: vec![
                Callpath {
                    region: RegionId(0),
                    parent: None,
                },
                Callpath {
                    region: RegionId(1),
                    parent: Some(CallpathId(0)),
                },
                Callpath {
                    region: RegionId(2),
                    parent: Some(CallpathId(0)),
                },
            ],
            locations: vec![Location {
                process: 0,
                thread: 0,
            }],
            ..Default::default()
        }
    }

    fn ev(t: f64, kind: EventKind) -> EventRecord {
        EventRecord::new(t, kind)
    }

    #[test]
    fn test_task_switch_tracks_out_of_task_time() {
        let defs = defs();
        let events = vec![
            ev(0.0, EventKind::Enter { callpath: CallpathId(0) }),
            ev(1.0, EventKind::TaskSwitch { task: 7 }),
            ev(1.5, EventKind::Enter { callpath: CallpathId(2) }),
            ev(1.6, EventKind::Leave { callpath: CallpathId(2) }),
            ev(2.0, EventKind::Enter { callpath: CallpathId(1) }),
            ev(3.0, EventKind::TaskSwitch { task: IMPLICIT_TASK }),
            ev(5.0, EventKind::TaskSwitch { task: 7 }),
            ev(6.0, EventKind::Leave { callpath: CallpathId(1) }),
            ev(6.5, EventKind::TaskComplete { task: 7 }),
            ev(8.0, EventKind::Leave { callpath: CallpathId(0) }),
        ];
        let trace = LocalTrace::new(LocationId(0), events, &defs).unwrap();
        let mut stack = Callstack::new();

        for e in trace.forward().take(5) {
            stack.update(&e, &defs).unwrap();
        }
        assert_eq!(stack.current_task(), 7);
        assert_eq!(stack.stub_node(), Some(CallpathId(1)));
        assert_eq!(stack.top(), Some(EventId(4)));
        assert_eq!(stack.start_time(), 1.0);

        stack.update(&trace.event(EventId(5)), &defs).unwrap();
        assert_eq!(stack.current_task(), IMPLICIT_TASK);
        assert_eq!(stack.top(), Some(EventId(0)));

        stack.update(&trace.event(EventId(6)), &defs).unwrap();
        assert_eq!(stack.current_time_offset(), 2.0);
        assert_eq!(stack.total_time_offset(), 2.0);

        for e in trace.forward().skip(7) {
            stack.update(&e, &defs).unwrap();
        }
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_disabled_updates_are_ignored() {
        let defs = defs();
        let events = vec![
            ev(0.0, EventKind::Enter { callpath: CallpathId(0) }),
            ev(1.0, EventKind::Leave { callpath: CallpathId(0) }),
        ];
        let trace = LocalTrace::new(LocationId(0), events, &defs).unwrap();
        let mut stack = Callstack::new();
        stack.set_update(false);
        stack.update(&trace.event(EventId(0)), &defs).unwrap();
        assert_eq!(stack.top(), None);
    }
}
