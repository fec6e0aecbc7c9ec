//! Shared-memory coordination for the thread locations of one process
//!
//! Thread participants of the same process share a [`Team`]. It offers the
//! barrier-scoped primitives the thread paradigm needs: a barrier, a
//! barrier-scoped all-gather and a critical section over a typed scratch
//! area. All waits observe the job's [`AbortLatch`].

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::AbortLatch;
use crate::error::{ReplayError, Result};

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

pub struct Team {
    size: usize,
    latch: Arc<AbortLatch>,
    poll: Duration,
    state: Mutex<BarrierState>,
    released: Condvar,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
    scratch: Mutex<Option<Box<dyn Any + Send>>>,
}

fn poisoned<T>(_: T) -> ReplayError {
    ReplayError::Transport("thread team lock poisoned".to_string())
}

impl Team {
    pub fn new(size: usize, latch: Arc<AbortLatch>, poll: Duration) -> Self {
        Team {
            size,
            latch,
            poll,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
            slots: Mutex::new((0..size).map(|_| None).collect()),
            scratch: Mutex::new(None),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn barrier(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            let (guard, _) = self
                .released
                .wait_timeout(state, self.poll)
                .map_err(poisoned)?;
            state = guard;
            if state.generation == generation {
                self.latch.check()?;
            }
        }
        Ok(())
    }

    /// Every thread contributes `value`; all receive the values in thread order
    pub fn allgather<T: Clone + Send + 'static>(&self, thread: usize, value: T) -> Result<Vec<T>> {
        {
            let mut slots = self.slots.lock().map_err(poisoned)?;
            let slot = slots.get_mut(thread).ok_or_else(|| {
                ReplayError::MalformedGroup(format!("thread {} outside team of {}", thread, self.size))
            })?;
            *slot = Some(Box::new(value));
        }
        self.barrier()?;
        let gathered = {
            let slots = self.slots.lock().map_err(poisoned)?;
            slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .and_then(|b| b.downcast_ref::<T>())
                        .cloned()
                        .ok_or_else(|| ReplayError::Transport("team slot holds no value".to_string()))
                })
                .collect::<Result<Vec<T>>>()
        };
        // Nobody may overwrite a slot before everyone has read it.
        self.barrier()?;
        gathered
    }

    /// Run `f` under the team's critical section on scratch state of type `S`.
    ///
    /// Scratch of a different type is replaced by `S::default()`.
    pub fn critical<S, R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R>
    where
        S: Default + Send + 'static,
    {
        let mut guard: MutexGuard<'_, Option<Box<dyn Any + Send>>> =
            self.scratch.lock().map_err(poisoned)?;
        if !guard.as_ref().is_some_and(|b| b.is::<S>()) {
            *guard = Some(Box::new(S::default()));
        }
        let scratch = guard
            .as_mut()
            .and_then(|b| b.downcast_mut::<S>())
            .ok_or_else(|| ReplayError::Transport("team scratch type confusion".to_string()))?;
        Ok(f(scratch))
    }
}
