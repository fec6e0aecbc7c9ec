//! Shared buffers backing one-sided window analysis
//!
//! Every member of a window's communicator owns one [`WindowBuffer`]; remote
//! members read and update it directly. Callers only touch a remote buffer
//! inside an epoch opened by the matching fence, post/start or lock event.

use std::sync::{Mutex, MutexGuard};

use super::TimeRank;
use crate::error::{ReplayError, Result};
use crate::rankset::RankSet;

/// Lock request recorded at the target during a passive-target epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockRecord {
    pub origin: usize,
    pub exclusive: bool,
    /// Enter time of the origin's lock call
    pub requested: f64,
    /// Leave time of the origin's unlock call, once released
    pub released: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct WindowBuffer {
    /// Enter time of this member's latest post
    pub local_post: TimeRank,
    /// Latest complete-enter of any origin in the current exposure epoch
    pub last_complete: TimeRank,
    /// Latest one-sided operation issued towards this member
    pub last_rma_op: TimeRank,
    /// Origins that accessed this member since the last reset
    pub access: RankSet,
    pub locks: Vec<LockRecord>,
}

impl WindowBuffer {
    fn new(size: usize) -> Self {
        WindowBuffer {
            local_post: TimeRank::lowest(),
            last_complete: TimeRank::lowest(),
            last_rma_op: TimeRank::lowest(),
            access: RankSet::new(size),
            locks: Vec::new(),
        }
    }

    /// Clear per-epoch state; the lock log survives until the window is freed
    pub fn reset(&mut self) {
        let size = self.access.capacity();
        self.local_post = TimeRank::lowest();
        self.last_complete = TimeRank::lowest();
        self.last_rma_op = TimeRank::lowest();
        self.access = RankSet::new(size);
    }
}

#[derive(Debug)]
pub struct SharedWindow {
    buffers: Vec<Mutex<WindowBuffer>>,
}

impl SharedWindow {
    /// Allocate one buffer per member of a window of `size` ranks
    pub fn new(size: usize) -> Self {
        SharedWindow {
            buffers: (0..size).map(|_| Mutex::new(WindowBuffer::new(size))).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.buffers.len()
    }

    fn buffer(&self, member: usize) -> Result<MutexGuard<'_, WindowBuffer>> {
        self.buffers
            .get(member)
            .ok_or_else(|| {
                ReplayError::MalformedGroup(format!(
                    "window member {} outside window of size {}",
                    member,
                    self.buffers.len()
                ))
            })?
            .lock()
            .map_err(|_| ReplayError::Transport("window buffer lock poisoned".to_string()))
    }

    /// Snapshot of a member's buffer
    pub fn get(&self, member: usize) -> Result<WindowBuffer> {
        Ok(self.buffer(member)?.clone())
    }

    /// Apply `f` to a member's buffer as one atomic remote access
    pub fn accumulate<R>(&self, member: usize, f: impl FnOnce(&mut WindowBuffer) -> R) -> Result<R> {
        let mut buffer = self.buffer(member)?;
        Ok(f(&mut buffer))
    }

    pub fn reset(&self, member: usize) -> Result<()> {
        self.buffer(member)?.reset();
        Ok(())
    }
}
