//! Read-only definitions repository
//!
//! Regions, call-tree nodes, communicators, windows and locations are stored
//! in flat arenas and addressed by typed integer ids. Call-tree nodes refer to
//! their parent by id, so the tree has no back pointers and no ownership
//! cycles.

use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Region (code block) id
    RegionId
);
define_id!(
    /// Call-tree node id
    CallpathId
);
define_id!(
    /// Communicator id
    CommId
);
define_id!(
    /// One-sided window id
    WindowId
);
define_id!(
    /// Traced location (process or thread) id
    LocationId
);

impl CommId {
    /// Id reserved for the process-level communicator spanning all ranks
    pub const WORLD: CommId = CommId(u32::MAX);
}

/// Semantic role of a region, as far as the replay engine cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionRole {
    #[default]
    Function,
    /// Program-start synchronization (all ranks meet at its leave)
    Init,
    /// Program-end synchronization
    Finalize,
    /// Thread-parallel region entered by every team member
    Parallel,
    /// Thread team barrier
    ThreadBarrier,
    /// Task body executed under cooperative scheduling
    Task,
    /// Instrumentation artifact without user-visible meaning
    Artificial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(default)]
    pub role: RegionRole,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callpath {
    pub region: RegionId,
    #[serde(default)]
    pub parent: Option<CallpathId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Paradigm {
    #[default]
    Process,
    Thread,
}

/// Communicator with its local-to-global rank mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Communicator {
    #[serde(skip, default = "unassigned_comm")]
    pub id: CommId,
    /// Global (process) rank of every local rank, in local rank order
    pub ranks: Vec<usize>,
    #[serde(default)]
    pub paradigm: Paradigm,
}

fn unassigned_comm() -> CommId {
    CommId(0)
}

impl Communicator {
    /// Process-level communicator covering ranks `0..size`
    pub fn world(size: usize) -> Self {
        Communicator {
            id: CommId::WORLD,
            ranks: (0..size).collect(),
            paradigm: Paradigm::Process,
        }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_world(&self) -> bool {
        self.id == CommId::WORLD
    }

    pub fn global_rank(&self, local: usize) -> Result<usize> {
        self.ranks.get(local).copied().ok_or_else(|| {
            ReplayError::MalformedGroup(format!(
                "local rank {} outside communicator {:?} of size {}",
                local,
                self.id,
                self.size()
            ))
        })
    }

    pub fn local_rank(&self, global: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Window {
    pub comm: CommId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Process rank
    pub process: usize,
    /// Thread number within the process, 0 is the master
    #[serde(default)]
    pub thread: usize,
}

impl Location {
    pub fn is_master(&self) -> bool {
        self.thread == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Definitions {
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default)]
    pub callpaths: Vec<Callpath>,
    #[serde(default)]
    pub communicators: Vec<Communicator>,
    #[serde(default)]
    pub windows: Vec<Window>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Definitions {
    pub fn region(&self, id: RegionId) -> Result<&Region> {
        self.regions
            .get(id.index())
            .ok_or_else(|| ReplayError::MalformedGroup(format!("unknown region id {:?}", id)))
    }

    pub fn callpath(&self, id: CallpathId) -> Result<&Callpath> {
        self.callpaths
            .get(id.index())
            .ok_or(ReplayError::UnknownCallpath(id))
    }

    /// Role of the region a call-tree node belongs to
    pub fn role_of(&self, id: CallpathId) -> Result<RegionRole> {
        let callpath = self.callpath(id)?;
        Ok(self.region(callpath.region)?.role)
    }

    pub fn parent(&self, id: CallpathId) -> Result<Option<CallpathId>> {
        Ok(self.callpath(id)?.parent)
    }

    /// Child of `parent` that enters `region`, if the call tree has one
    pub fn child_with_region(&self, parent: CallpathId, region: RegionId) -> Option<CallpathId> {
        self.callpaths
            .iter()
            .position(|cp| cp.parent == Some(parent) && cp.region == region)
            .map(|i| CallpathId(i as u32))
    }

    pub fn communicator(&self, id: CommId) -> Result<&Communicator> {
        self.communicators
            .get(id.index())
            .ok_or(ReplayError::UnknownCommunicator(id))
    }

    pub fn window(&self, id: WindowId) -> Result<&Window> {
        self.windows
            .get(id.index())
            .ok_or(ReplayError::UnknownWindow(id))
    }

    pub fn location(&self, id: LocationId) -> Result<&Location> {
        self.locations
            .get(id.index())
            .ok_or(ReplayError::UnknownLocation(id))
    }

    /// Process-level communicator over every rank
    pub fn world(&self) -> Communicator {
        Communicator::world(self.num_processes())
    }

    /// Number of processes (ranks of the world communicator)
    pub fn num_processes(&self) -> usize {
        self.locations
            .iter()
            .map(|l| l.process + 1)
            .max()
            .unwrap_or(0)
    }

    /// Number of thread locations of `process`
    pub fn threads_of(&self, process: usize) -> usize {
        self.locations
            .iter()
            .filter(|l| l.process == process)
            .count()
    }

    /// Assign arena ids and check every cross reference.
    ///
    /// Must run once after deserialization, before any lookup.
    pub fn resolve(&mut self) -> Result<()> {
        for (i, comm) in self.communicators.iter_mut().enumerate() {
            comm.id = CommId(i as u32);
        }

        let procs = self.num_processes();
        for (i, cp) in self.callpaths.iter().enumerate() {
            self.region(cp.region)?;
            if let Some(parent) = cp.parent {
                // Parents precede children, which rules out cycles.
                if parent.index() >= i {
                    return Err(ReplayError::MalformedGroup(format!(
                        "callpath {} has parent {:?} defined after it",
                        i, parent
                    )));
                }
            }
        }
        for comm in &self.communicators {
            let mut seen = vec![false; procs];
            for &rank in &comm.ranks {
                if rank >= procs || seen[rank] {
                    return Err(ReplayError::MalformedGroup(format!(
                        "communicator {:?} lists invalid or duplicate rank {}",
                        comm.id, rank
                    )));
                }
                seen[rank] = true;
            }
        }
        for win in &self.windows {
            if win.comm != CommId::WORLD {
                self.communicator(win.comm)?;
            }
        }
        for process in 0..procs {
            let threads = self.threads_of(process);
            let complete = (0..threads).all(|t| {
                self.locations
                    .iter()
                    .any(|l| l.process == process && l.thread == t)
            });
            if threads == 0 || !complete {
                return Err(ReplayError::MalformedGroup(format!(
                    "process {} has non-contiguous thread locations",
                    process
                )));
            }
        }
        Ok(())
    }
}
