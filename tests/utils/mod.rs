// Shared scenario builders for the integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;

use waitcause::context::{CollectiveInfo, WaitKind};
use waitcause::defs::{Callpath, CallpathId, CommId, Definitions, Location, LocationId, Region, RegionId, RegionRole, Window, WindowId};
use waitcause::replay::{AnalysisCallback, EventView, FinishView, Stage, TraceBundle, TraceInput};
use waitcause::synchpoint::SynchpointInfo;
use waitcause::trace::{CollectiveOp, EventId, EventKind, EventRecord, RmaGroupOp, RmaSync};

pub const MAIN: CallpathId = CallpathId(0);
pub const WORK: CallpathId = CallpathId(1);
pub const SEND: CallpathId = CallpathId(2);
pub const RECV: CallpathId = CallpathId(3);
pub const BARRIER: CallpathId = CallpathId(4);
pub const BCAST: CallpathId = CallpathId(5);
pub const INIT: CallpathId = CallpathId(6);
pub const FINALIZE: CallpathId = CallpathId(7);
pub const PARALLEL: CallpathId = CallpathId(8);
pub const THREAD_BARRIER: CallpathId = CallpathId(9);
pub const WIN_SYNC: CallpathId = CallpathId(10);
pub const LOCK: CallpathId = CallpathId(11);

pub const WINDOW: WindowId = WindowId(0);

fn definitions(locations: Vec<Location>) -> Definitions {
    let regions = [
        ("main", RegionRole::Function),
        ("work", RegionRole::Function),
        ("MPI_Send", RegionRole::Function),
        ("MPI_Recv", RegionRole::Function),
        ("MPI_Barrier", RegionRole::Function),
        ("MPI_Bcast", RegionRole::Function),
        ("MPI_Init", RegionRole::Init),
        ("MPI_Finalize", RegionRole::Finalize),
        ("!$omp parallel", RegionRole::Parallel),
        ("!$omp barrier", RegionRole::ThreadBarrier),
        ("MPI_Win_fence", RegionRole::Function),
        ("MPI_Win_lock", RegionRole::Function),
    ];
    let mut callpaths = vec![Callpath {
        region: RegionId(0),
        parent: None,
    }];
    for i in 1..regions.len() {
        let parent = if i as u32 == THREAD_BARRIER.0 { PARALLEL } else { MAIN };
        callpaths.push(Callpath {
            region: RegionId(i as u32),
            parent: Some(parent),
        });
    }
    Definitions {
        regions: regions
            .iter()
            .map(|(name, role)| Region {
                name: name.to_string(),
                role: *role,
            })
            .collect(),
        callpaths,
        windows: vec![Window { comm: CommId::WORLD }],
        locations,
        ..Default::default()
    }
}

/// Event streams for a small job, every location wrapped in `main`
pub struct Scenario {
    pub defs: Definitions,
    events: Vec<Vec<EventRecord>>,
}

impl Scenario {
    fn with_locations(locations: Vec<Location>) -> Self {
        let events = locations
            .iter()
            .map(|_| vec![EventRecord::new(0.0, EventKind::Enter { callpath: MAIN })])
            .collect();
        Scenario {
            defs: definitions(locations),
            events,
        }
    }

    /// `n` single-threaded processes; location `i` is process `i`
    pub fn processes(n: usize) -> Self {
        Self::with_locations((0..n).map(|p| Location { process: p, thread: 0 }).collect())
    }

    /// One process with `n` threads; location `i` is thread `i`
    pub fn threads(n: usize) -> Self {
        Self::with_locations((0..n).map(|t| Location { process: 0, thread: t }).collect())
    }

    pub fn push(&mut self, loc: usize, time: f64, kind: EventKind) -> &mut Self {
        self.events[loc].push(EventRecord::new(time, kind));
        self
    }

    pub fn enter(&mut self, loc: usize, callpath: CallpathId, time: f64) -> &mut Self {
        self.push(loc, time, EventKind::Enter { callpath })
    }

    pub fn leave(&mut self, loc: usize, callpath: CallpathId, time: f64) -> &mut Self {
        self.push(loc, time, EventKind::Leave { callpath })
    }

    pub fn region(&mut self, loc: usize, callpath: CallpathId, enter: f64, leave: f64) -> &mut Self {
        self.enter(loc, callpath, enter).leave(loc, callpath, leave)
    }

    fn send_impl(&mut self, loc: usize, dest: usize, tag: u32, enter: f64, leave: f64, synchronous: bool) -> &mut Self {
        self.enter(loc, SEND, enter)
            .push(
                loc,
                enter,
                EventKind::Send {
                    comm: CommId::WORLD,
                    dest,
                    tag,
                    bytes: 64,
                    synchronous,
                },
            )
            .leave(loc, SEND, leave)
    }

    pub fn send(&mut self, loc: usize, dest: usize, tag: u32, enter: f64, leave: f64) -> &mut Self {
        self.send_impl(loc, dest, tag, enter, leave, false)
    }

    pub fn ssend(&mut self, loc: usize, dest: usize, tag: u32, enter: f64, leave: f64) -> &mut Self {
        self.send_impl(loc, dest, tag, enter, leave, true)
    }

    pub fn recv(&mut self, loc: usize, source: usize, tag: u32, enter: f64, leave: f64) -> &mut Self {
        self.enter(loc, RECV, enter)
            .push(
                loc,
                leave,
                EventKind::Recv {
                    comm: CommId::WORLD,
                    source,
                    tag,
                    bytes: 64,
                },
            )
            .leave(loc, RECV, leave)
    }

    fn collective(
        &mut self,
        loc: usize,
        callpath: CallpathId,
        op: CollectiveOp,
        root: Option<usize>,
        bytes: (u64, u64),
        enter: f64,
        leave: f64,
    ) -> &mut Self {
        self.enter(loc, callpath, enter)
            .push(loc, enter, EventKind::CollBegin)
            .push(
                loc,
                leave,
                EventKind::CollEnd {
                    comm: CommId::WORLD,
                    op,
                    root,
                    bytes_sent: bytes.0,
                    bytes_received: bytes.1,
                },
            )
            .leave(loc, callpath, leave)
    }

    pub fn barrier(&mut self, loc: usize, enter: f64, leave: f64) -> &mut Self {
        self.collective(loc, BARRIER, CollectiveOp::Barrier, None, (0, 0), enter, leave)
    }

    pub fn bcast(&mut self, loc: usize, root: usize, enter: f64, leave: f64) -> &mut Self {
        let bytes = if loc == root { (64, 0) } else { (0, 64) };
        self.collective(loc, BCAST, CollectiveOp::OneToN, Some(root), bytes, enter, leave)
    }

    pub fn fence(&mut self, loc: usize, op: RmaSync, enter: f64, leave: f64) -> &mut Self {
        self.enter(loc, WIN_SYNC, enter)
            .push(loc, leave, EventKind::RmaCollective { window: WINDOW, op })
            .leave(loc, WIN_SYNC, leave)
    }

    pub fn rma_group(&mut self, loc: usize, op: RmaGroupOp, group: Vec<usize>, enter: f64, leave: f64) -> &mut Self {
        self.enter(loc, WIN_SYNC, enter)
            .push(loc, leave, EventKind::RmaGroup { window: WINDOW, op, group })
            .leave(loc, WIN_SYNC, leave)
    }

    pub fn bundle(mut self, end: f64) -> TraceBundle {
        for events in &mut self.events {
            events.push(EventRecord::new(end, EventKind::Leave { callpath: MAIN }));
        }
        TraceBundle {
            definitions: self.defs,
            traces: self
                .events
                .into_iter()
                .enumerate()
                .map(|(i, events)| TraceInput {
                    location: LocationId(i as u32),
                    events,
                })
                .collect(),
        }
    }
}

/// What one location saw during the replay
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub detected: Vec<(Stage, EventId, WaitKind, SynchpointInfo)>,
    pub collinfo: BTreeMap<(Stage, EventId), CollectiveInfo>,
    pub rma_wait: f64,
    /// Synchronizing process ranks per synchpoint, read at the end
    pub ranks: BTreeMap<EventId, Vec<usize>>,
    pub lock_waits: Vec<f64>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait time of every wait state of `kind`
    pub fn waits(&self, kind: WaitKind) -> Vec<f64> {
        self.detected
            .iter()
            .filter(|(_, _, k, info)| *k == kind && info.wait_time > 0.0)
            .map(|(_, _, _, info)| info.wait_time)
            .collect()
    }

    pub fn synchpoints(&self, kind: WaitKind) -> Vec<SynchpointInfo> {
        self.detected
            .iter()
            .filter(|(_, _, k, _)| *k == kind)
            .map(|(_, _, _, info)| *info)
            .collect()
    }
}

impl AnalysisCallback for Recorder {
    fn on_event(&mut self, stage: Stage, view: &EventView<'_>) -> waitcause::Result<()> {
        if let Some((kind, info)) = view.detected {
            self.detected.push((stage, view.event.id(), kind, info));
        }
        if let Some(info) = view.ctx.collinfo {
            self.collinfo.insert((stage, view.event.id()), info);
        }
        if let Some(rma) = view.ctx.rma {
            self.rma_wait += rma.wait_time;
        }
        Ok(())
    }

    fn finish(&mut self, view: &FinishView<'_>) -> waitcause::Result<()> {
        for (event, _) in view.detector.iter() {
            if let Some(ranks) = view.detector.ranks(event) {
                self.ranks.insert(event, ranks.iter().collect());
            }
        }
        self.lock_waits = view.lock_waits.iter().map(|&(_, w)| w).collect();
        Ok(())
    }
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
