//! Time-map arithmetic of the delay analysis

use crate::defs::CallpathId;
use crate::error::{ReplayError, Result};
use crate::synchpoint::{Peer, SynchpointDetector, SynchpointInfo};
use crate::timemap::{TimeMap, TimeMapSum, TimemapCache};
use crate::trace::{EventId, LocalTrace};

/// Entries of `left` that exceed `right`, with their positive excess
pub fn diff(left: &TimeMap, right: &TimeMap) -> TimeMapSum {
    let mut out = TimeMapSum::default();
    for (&cnode, &time) in left {
        let d = time - right.get(&cnode).copied().unwrap_or(0.0);
        if d > 0.0 {
            out.add(cnode, d);
        }
    }
    out
}

/// Wait time per call-tree node over a set of synchpoint records
pub fn wait_map(points: &[(EventId, SynchpointInfo)], trace: &LocalTrace) -> TimeMapSum {
    let mut out = TimeMapSum::default();
    for &(event, info) in points {
        if info.wait_time > 0.0 {
            out.add(trace.event(event).cnode(), info.wait_time);
        }
    }
    out
}

/// Remove wait time from a runtime map, and the part of the interval's
/// opening synchpoint that precedes its completion
pub fn prune(runtimes: &TimeMap, waits: &TimeMap, from: Option<(CallpathId, SynchpointInfo)>) -> TimeMapSum {
    let mut out = diff(runtimes, waits);
    if let Some((cnode, info)) = from {
        if let Some(time) = out.map.get_mut(&cnode) {
            let inside = info.total_time - info.completion_time;
            let before = *time;
            *time = (before - inside).max(0.0);
            out.sum -= inside.min(before);
        }
    }
    out
}

pub fn add_scaled(from: &TimeMapSum, scale: f64, to: &mut TimeMapSum) {
    for (&cnode, &time) in &from.map {
        to.add(cnode, scale * time);
    }
}

/// Share of `budget` per unit of residual time; zero without any residual
/// or propagating wait
pub fn scale(budget: f64, residual: f64, propagating: f64) -> f64 {
    let denom = residual + propagating;
    if denom > 0.0 {
        budget / denom
    } else {
        0.0
    }
}

/// Pruned runtime of an interval plus the wait time inside it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalTimes {
    pub map: TimeMap,
    pub prop_wait: f64,
}

/// Read-only access to what the earlier passes recorded for one location
#[derive(Clone, Copy)]
pub struct Oracle<'a> {
    pub detector: &'a SynchpointDetector,
    pub cache: &'a TimemapCache,
    pub trace: &'a LocalTrace,
}

impl<'a> Oracle<'a> {
    /// Previous synchpoint shared with `peer`, or the trace start if none
    pub fn previous(&self, event: EventId, peer: Peer) -> Result<Option<EventId>> {
        match self.detector.find_previous(event, peer) {
            Ok(prev) => Ok(Some(prev)),
            Err(ReplayError::NoPreviousSynchpoint { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Runtime in `(from, to]` minus the wait states recorded there
    pub fn interval(&self, from: Option<EventId>, to: EventId) -> Result<IntervalTimes> {
        let points = self.detector.between(from, Some(to))?;
        let waits = wait_map(&points, self.trace);
        let opening = match from {
            Some(event) => {
                let info = self
                    .detector
                    .info(event)
                    .ok_or(ReplayError::NotASynchpoint(event))?;
                Some((self.trace.event(event).cnode(), info))
            }
            None => None,
        };
        let runtimes = self.cache.runtimes(from, Some(to))?;
        Ok(IntervalTimes {
            map: prune(&runtimes, &waits.map, opening).map,
            prop_wait: waits.sum,
        })
    }

    /// Own wait states in `(from, to)`
    pub fn wait_states(&self, from: Option<EventId>, to: EventId) -> Result<Vec<(EventId, f64)>> {
        Ok(self
            .detector
            .between(from, Some(to))?
            .into_iter()
            .filter(|&(event, info)| event != to && info.wait_time > 0.0)
            .map(|(event, info)| (event, info.wait_time))
            .collect())
    }
}
