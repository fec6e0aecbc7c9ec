//! Synchronization-point detector
//!
//! The paradigm drivers decide *whether* an event synchronizes participants;
//! this module records the outcome and answers the causality queries of the
//! delay analysis:
//!
//! - the most recent earlier synchpoint shared with a given peer
//! - the most recent earlier synchpoint shared with every member of a group
//! - all synchpoints inside an interval
//!
//! Records are keyed by [`EventId`], and event ids grow with time, so
//! "backward in time" is just a reverse range over the ordered maps.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde::Serialize;

use crate::defs::Communicator;
use crate::error::{ReplayError, Result};
use crate::rankset::RankSet;
use crate::trace::EventId;

/// Timing of one synchronization point
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SynchpointInfo {
    pub wait_time: f64,
    pub completion_time: f64,
    pub total_time: f64,
}

impl SynchpointInfo {
    /// Build a record with all durations floored at zero and
    /// `wait_time <= total_time`
    pub fn new(wait_time: f64, completion_time: f64, total_time: f64) -> Self {
        let total_time = total_time.max(0.0);
        SynchpointInfo {
            wait_time: wait_time.max(0.0).min(total_time),
            completion_time: completion_time.max(0.0),
            total_time,
        }
    }
}

/// Whose previous synchronization to look for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// A process rank, via the recorded synchronizing-rank sets
    Rank(usize),
    /// The local thread team, via the location's own thread synchpoints
    Team,
}

#[derive(Debug)]
pub struct SynchpointDetector {
    rank: usize,
    size: usize,
    points: BTreeMap<EventId, SynchpointInfo>,
    ranks: BTreeMap<EventId, RankSet>,
    thread_points: BTreeSet<EventId>,
    updated: BTreeSet<EventId>,
}

impl SynchpointDetector {
    /// Detector for process `rank` of a job with `size` processes
    pub fn new(rank: usize, size: usize) -> Self {
        SynchpointDetector {
            rank,
            size,
            points: BTreeMap::new(),
            ranks: BTreeMap::new(),
            thread_points: BTreeSet::new(),
            updated: BTreeSet::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn insert(&mut self, event: EventId, info: SynchpointInfo) -> Result<()> {
        if self.points.contains_key(&event) {
            return Err(ReplayError::DuplicateSynchpoint(event));
        }
        self.points.insert(event, info);
        Ok(())
    }

    /// Record a process-level synchpoint and the ranks that met there
    pub fn record(&mut self, event: EventId, info: SynchpointInfo, ranks: RankSet) -> Result<()> {
        self.insert(event, info)?;
        self.ranks.insert(event, ranks);
        Ok(())
    }

    /// Record a synchpoint among the threads of this process
    pub fn record_thread(&mut self, event: EventId, info: SynchpointInfo) -> Result<()> {
        self.insert(event, info)?;
        self.thread_points.insert(event);
        Ok(())
    }

    /// Set the wait time of an already recorded synchpoint; allowed once
    pub fn update_wait_time(&mut self, event: EventId, wait_time: f64) -> Result<()> {
        let info = self
            .points
            .get_mut(&event)
            .ok_or(ReplayError::NotASynchpoint(event))?;
        if !self.updated.insert(event) {
            return Err(ReplayError::DuplicateSynchpoint(event));
        }
        *info = SynchpointInfo::new(wait_time, info.completion_time, info.total_time);
        Ok(())
    }

    pub fn is_synchpoint(&self, event: EventId) -> bool {
        self.points.contains_key(&event)
    }

    pub fn is_waitstate(&self, event: EventId) -> bool {
        self.points.get(&event).is_some_and(|i| i.wait_time > 0.0)
    }

    pub fn is_thread_synchpoint(&self, event: EventId) -> bool {
        self.thread_points.contains(&event)
    }

    pub fn info(&self, event: EventId) -> Option<SynchpointInfo> {
        self.points.get(&event).copied()
    }

    pub fn ranks(&self, event: EventId) -> Option<&RankSet> {
        self.ranks.get(&event)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All records in event order
    pub fn iter(&self) -> impl Iterator<Item = (EventId, &SynchpointInfo)> + '_ {
        self.points.iter().map(|(&e, i)| (e, i))
    }

    /// Most recent synchpoint strictly before `event` shared with `peer`
    pub fn find_previous(&self, event: EventId, peer: Peer) -> Result<EventId> {
        let found = match peer {
            Peer::Rank(rank) => self
                .ranks
                .range(..event)
                .rev()
                .find(|(_, set)| set.contains(rank))
                .map(|(&e, _)| e),
            Peer::Team => self.thread_points.range(..event).next_back().copied(),
        };
        found.ok_or(ReplayError::NoPreviousSynchpoint {
            event,
            rank: match peer {
                Peer::Rank(rank) => rank,
                Peer::Team => self.rank,
            },
        })
    }

    /// Walk back from `from` until every other member of `group` has been
    /// met.
    ///
    /// Returns the event where the walk stopped (the latest synchpoint shared
    /// with all remaining members) and, for members met on the way at a
    /// later point, their individual last common synchpoint keyed by
    /// communicator-local rank.
    pub fn find_previous_group(
        &self,
        from: EventId,
        group: &Communicator,
    ) -> Result<(EventId, BTreeMap<usize, EventId>)> {
        let mut remaining = if group.is_world() && group.size() == self.size {
            RankSet::full(self.size)
        } else {
            RankSet::from_ranks(self.size, group.ranks.iter().copied())
        };
        remaining.erase(self.rank);
        let first_missing = remaining.iter().next();

        let mut individual = BTreeMap::new();
        let mut stop = None;
        for (&event, set) in self.ranks.range(..from).rev() {
            if remaining.is_empty() {
                break;
            }
            stop = Some(event);
            if set.is_superset(&remaining) {
                remaining.clear();
                break;
            }
            let met = remaining.intersection(set);
            for rank in met.iter() {
                if let Some(local) = group.local_rank(rank) {
                    individual.insert(local, event);
                }
            }
            remaining.difference_with(&met);
        }

        match stop {
            Some(event) if remaining.is_empty() => Ok((event, individual)),
            _ => Err(ReplayError::NoPreviousSynchpoint {
                event: from,
                rank: remaining.iter().next().or(first_missing).unwrap_or(self.rank),
            }),
        }
    }

    /// Records strictly after `from` up to and including `to`; `None` means
    /// the start or the end of the record
    pub fn between(&self, from: Option<EventId>, to: Option<EventId>) -> Result<Vec<(EventId, SynchpointInfo)>> {
        for bound in [from, to].into_iter().flatten() {
            if !self.is_synchpoint(bound) {
                return Err(ReplayError::NotASynchpoint(bound));
            }
        }
        let lower = from.map_or(Bound::Unbounded, Bound::Excluded);
        let upper = to.map_or(Bound::Unbounded, Bound::Included);
        if let (Some(a), Some(b)) = (from, to) {
            if a >= b {
                return Ok(Vec::new());
            }
        }
        Ok(self
            .points
            .range((lower, upper))
            .map(|(&e, &i)| (e, i))
            .collect())
    }
}
