//! Communicator-bound messaging and collectives
//!
//! All collectives are linear: contributions travel to the root in local
//! rank order and are folded there, so floating point reductions are
//! deterministic regardless of scheduling. Each collective message carries an
//! op name; a participant that issues a different collective than its peers
//! gets a [`ReplayError::CollectiveMismatch`] instead of a silent deadlock.

use std::any::Any;

use super::{downcast, Channel, Endpoint, MsgKey, Request};
use crate::defs::Communicator;
use crate::error::{ReplayError, Result};

#[derive(Clone, Copy)]
pub struct CommHandle<'a> {
    ep: &'a Endpoint,
    comm: &'a Communicator,
    local: usize,
}

impl<'a> CommHandle<'a> {
    pub(super) fn new(ep: &'a Endpoint, comm: &'a Communicator) -> Result<Self> {
        let local = comm.local_rank(ep.rank()).ok_or_else(|| {
            ReplayError::MalformedGroup(format!(
                "rank {} is not a member of communicator {:?}",
                ep.rank(),
                comm.id
            ))
        })?;
        Ok(CommHandle { ep, comm, local })
    }

    pub fn communicator(&self) -> &'a Communicator {
        self.comm
    }

    pub fn endpoint(&self) -> &'a Endpoint {
        self.ep
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// Own rank within the communicator
    pub fn rank(&self) -> usize {
        self.local
    }

    /// Global rank of local rank `local`
    pub fn global(&self, local: usize) -> Result<usize> {
        self.comm.global_rank(local)
    }

    fn key(&self, channel: Channel, tag: u32) -> MsgKey {
        MsgKey {
            comm: self.comm.id,
            channel,
            tag,
        }
    }

    /// Non-blocking send to local rank `dest`
    pub fn isend<T: Send + 'static>(&self, dest: usize, channel: Channel, tag: u32, value: T) -> Result<Request> {
        self.ep.isend(self.global(dest)?, self.key(channel, tag), value)
    }

    /// Blocking receive from local rank `source`
    pub fn recv<T: 'static>(&self, source: usize, channel: Channel, tag: u32) -> Result<T> {
        self.ep.recv(self.global(source)?, self.key(channel, tag))
    }

    fn coll_send<T: Send + 'static>(&self, dest: usize, op: &'static str, value: T) -> Result<()> {
        let payload: Box<dyn Any + Send> = Box::new(value);
        self.ep
            .post(self.global(dest)?, self.key(Channel::Collective, 0), op, payload)
            .map(|_| ())
    }

    fn coll_recv<T: 'static>(&self, source: usize, op: &'static str) -> Result<T> {
        let envelope = self.ep.take(self.global(source)?, self.key(Channel::Collective, 0))?;
        if envelope.op != op {
            return Err(ReplayError::CollectiveMismatch {
                rank: self.ep.rank(),
                expected: op,
                found: envelope.op,
            });
        }
        downcast(envelope.payload)
    }

    fn check_root(&self, root: usize) -> Result<()> {
        if root >= self.size() {
            return Err(ReplayError::MalformedGroup(format!(
                "root {} outside communicator {:?} of size {}",
                root,
                self.comm.id,
                self.size()
            )));
        }
        Ok(())
    }

    /// Gather one value per rank at `root`, in local rank order
    pub fn gather<T: Send + 'static>(&self, root: usize, value: T) -> Result<Option<Vec<T>>> {
        self.check_root(root)?;
        if self.local != root {
            self.coll_send(root, "gather", value)?;
            return Ok(None);
        }
        let mut own = Some(value);
        let mut out = Vec::with_capacity(self.size());
        for src in 0..self.size() {
            if src == root {
                if let Some(v) = own.take() {
                    out.push(v);
                }
            } else {
                out.push(self.coll_recv(src, "gather")?);
            }
        }
        Ok(Some(out))
    }

    /// Broadcast the root's value; only the root needs to pass `Some`
    pub fn bcast<T: Clone + Send + 'static>(&self, root: usize, value: Option<T>) -> Result<T> {
        self.check_root(root)?;
        if self.local == root {
            let value = value.ok_or_else(|| {
                ReplayError::Transport("broadcast root has no value to send".to_string())
            })?;
            for dest in (0..self.size()).filter(|&d| d != root) {
                self.coll_send(dest, "bcast", value.clone())?;
            }
            Ok(value)
        } else {
            self.coll_recv(root, "bcast")
        }
    }

    /// Hand `values[i]` to local rank `i`; only the root needs to pass `Some`
    pub fn scatter<T: Send + 'static>(&self, root: usize, values: Option<Vec<T>>) -> Result<T> {
        self.check_root(root)?;
        if self.local != root {
            return self.coll_recv(root, "scatter");
        }
        let values = values
            .filter(|v| v.len() == self.size())
            .ok_or_else(|| ReplayError::Transport("scatter root needs one value per rank".to_string()))?;
        let mut own = None;
        for (dest, v) in values.into_iter().enumerate() {
            if dest == root {
                own = Some(v);
            } else {
                self.coll_send(dest, "scatter", v)?;
            }
        }
        own.ok_or_else(|| ReplayError::Transport("scatter lost the root's value".to_string()))
    }

    /// Fold all values at `root` with `op`, in local rank order
    pub fn reduce<T, F>(&self, root: usize, value: T, op: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: Fn(T, T) -> T,
    {
        Ok(self
            .gather(root, value)?
            .and_then(|values| values.into_iter().reduce(op)))
    }

    pub fn allreduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let reduced = self.reduce(0, value, op)?;
        self.bcast(0, reduced)
    }

    pub fn allgather<T: Clone + Send + 'static>(&self, value: T) -> Result<Vec<T>> {
        let gathered = self.gather(0, value)?;
        self.bcast(0, gathered)
    }

    /// Inclusive prefix reduction
    pub fn scan<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: Fn(T, T) -> T,
    {
        let prefix = if self.local == 0 {
            value
        } else {
            let before: T = self.coll_recv(self.local - 1, "scan")?;
            op(before, value)
        };
        if self.local + 1 < self.size() {
            self.coll_send(self.local + 1, "scan", prefix.clone())?;
        }
        Ok(prefix)
    }

    pub fn barrier(&self) -> Result<()> {
        self.allreduce((), |_, _| ())
    }
}
