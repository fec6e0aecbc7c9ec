//! Per-call-tree-node execution time between synchronization points
//!
//! The [`TimemapCache`] is filled during the forward synchpoint pass. It
//! keeps a running `callpath -> time` map; each synchpoint flushes that map
//! into an append-only log and remembers where the log ended. Any interval
//! between two flushed synchpoints is then a contiguous slice of the log.
//!
//! ```text
//! log:    [a b][c][d e f][g]
//! index:  sp0=2 sp1=3 sp2=6 sp3=7
//! runtimes(sp0, sp2) = sum(log[2..6])
//! ```

use std::collections::BTreeMap;

use crate::defs::CallpathId;
use crate::error::{ReplayError, Result};
use crate::trace::EventId;

/// Accumulated time per call-tree node
pub type TimeMap = BTreeMap<CallpathId, f64>;

/// A time map together with the sum of its entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeMapSum {
    pub map: TimeMap,
    pub sum: f64,
}

impl TimeMapSum {
    pub fn from_map(map: TimeMap) -> Self {
        let sum = map.values().sum();
        TimeMapSum { map, sum }
    }

    pub fn add(&mut self, cnode: CallpathId, time: f64) {
        *self.map.entry(cnode).or_insert(0.0) += time;
        self.sum += time;
    }

    /// Merge by entry-wise addition
    pub fn merge(&mut self, other: &TimeMapSum) {
        for (&cnode, &time) in &other.map {
            *self.map.entry(cnode).or_insert(0.0) += time;
        }
        self.sum += other.sum;
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Entry-wise sum of two time maps
pub fn merge(a: &TimeMap, b: &TimeMap) -> TimeMap {
    let mut out = a.clone();
    for (&cnode, &time) in b {
        *out.entry(cnode).or_insert(0.0) += time;
    }
    out
}

#[derive(Debug, Default)]
pub struct TimemapCache {
    running: TimeMap,
    log: Vec<(CallpathId, f64)>,
    /// Flushed synchpoints and the log length right after their flush,
    /// in increasing event order
    index: Vec<(EventId, usize)>,
    last_stamp: Option<f64>,
}

impl TimemapCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn credit(&mut self, cnode: CallpathId, time: f64) {
        *self.running.entry(cnode).or_insert(0.0) += time;
    }

    fn elapsed(&mut self, time: f64) -> f64 {
        let since = self.last_stamp.map_or(0.0, |last| time - last);
        self.last_stamp = Some(time);
        since
    }

    /// Region enter: the time since the last stamp belongs to the caller
    pub fn on_enter(&mut self, time: f64, parent: Option<CallpathId>) {
        let since = self.elapsed(time);
        if let Some(parent) = parent {
            self.credit(parent, since);
        }
    }

    /// Region leave: the time since the last stamp belongs to the region
    pub fn on_leave(&mut self, time: f64, cnode: CallpathId) {
        let since = self.elapsed(time);
        self.credit(cnode, since);
    }

    /// Move fork or join idle time from the caller to the parallel region
    pub fn reassign(&mut self, region: CallpathId, parent: Option<CallpathId>, time: f64) {
        if let Some(parent) = parent {
            self.credit(parent, -time);
        }
        self.credit(region, time);
    }

    /// Forget time accumulated so far in the running map
    pub fn clear_running(&mut self) {
        self.running.clear();
    }

    /// Deduct time from the running map without flushing
    pub fn debit(&mut self, cnode: CallpathId, time: f64) {
        self.credit(cnode, -time);
    }

    /// Flush the running map at synchpoint `event`
    pub fn flush(&mut self, event: EventId) {
        if self.index.last().is_some_and(|&(last, _)| last >= event) {
            tracing::debug!(?event, "synchpoint flushed out of order, ignored");
            return;
        }
        self.log.extend(std::mem::take(&mut self.running));
        self.index.push((event, self.log.len()));
    }

    /// Flush whatever remains after the last synchpoint
    pub fn finish(&mut self) {
        self.log.extend(std::mem::take(&mut self.running));
    }

    pub fn is_flushed(&self, event: EventId) -> bool {
        self.position(event).is_ok()
    }

    fn position(&self, event: EventId) -> Result<usize> {
        self.index
            .binary_search_by_key(&event, |&(e, _)| e)
            .map(|i| self.index[i].1)
            .map_err(|_| ReplayError::UnflushedBoundary(event))
    }

    /// Time per call-tree node in `(from, to]`; `None` means the start or the
    /// end of the log
    pub fn runtimes(&self, from: Option<EventId>, to: Option<EventId>) -> Result<TimeMap> {
        let start = from.map_or(Ok(0), |e| self.position(e))?;
        let end = to.map_or(Ok(self.log.len()), |e| self.position(e))?;
        let mut out = TimeMap::new();
        if start < end {
            for &(cnode, time) in &self.log[start..end] {
                *out.entry(cnode).or_insert(0.0) += time;
            }
        }
        Ok(out)
    }
}
