//! Whole-job driver: one analysis thread per traced location
//!
//! Master threads own the process-level [`Endpoint`]; all thread locations
//! of a process share one [`Team`]. The first participant that fails with a
//! fatal error raises the job's [`AbortLatch`], which wakes every blocked
//! peer so the job winds down instead of hanging.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::comm::{AbortLatch, Endpoint, Team};
use crate::config::AnalysisConfig;
use crate::defs::{Communicator, Definitions, Location, LocationId};
use crate::error::{ReplayError, Result};
use crate::trace::{EventRecord, LocalTrace};

use super::{AnalysisCallback, Analyzer, NoCallback, Registry, ReplayScope};

/// Recorded events of one location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInput {
    pub location: LocationId,
    pub events: Vec<EventRecord>,
}

/// On-disk form of a complete job: global definitions plus one trace per
/// location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceBundle {
    pub definitions: Definitions,
    #[serde(default)]
    pub traces: Vec<TraceInput>,
}

impl TraceBundle {
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// What one location produced
#[derive(Debug, Clone)]
pub struct ParticipantOutput<C> {
    pub location: Location,
    pub synchpoints: usize,
    pub wait_states: usize,
    /// Callback errors that were recorded but never caused a stop
    pub errors: Vec<String>,
    pub callback: C,
}

/// Raises the latch if the analysis thread unwinds
struct RaiseOnPanic<'a>(&'a AbortLatch);

impl Drop for RaiseOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.raise("analysis thread panicked");
        }
    }
}

pub struct Job {
    defs: Definitions,
    world: Communicator,
    config: AnalysisConfig,
    registry: Registry,
    /// Sorted by process, then thread
    traces: Vec<(Location, LocalTrace)>,
}

impl Job {
    pub fn new(bundle: TraceBundle, config: AnalysisConfig) -> Result<Self> {
        config.validate().map_err(ReplayError::Config)?;
        let TraceBundle {
            mut definitions,
            traces: inputs,
        } = bundle;
        definitions.resolve()?;

        let mut seen = BTreeSet::new();
        let mut traces = Vec::with_capacity(inputs.len());
        for input in inputs {
            let location = *definitions.location(input.location)?;
            if !seen.insert((location.process, location.thread)) {
                return Err(ReplayError::malformed(
                    input.location,
                    format!("second trace for process {} thread {}", location.process, location.thread),
                ));
            }
            let trace = LocalTrace::new(input.location, input.events, &definitions)?;
            traces.push((location, trace));
        }
        traces.sort_by_key(|(l, _)| (l.process, l.thread));

        let processes = definitions.num_processes();
        for process in 0..processes {
            let threads = definitions.threads_of(process);
            for thread in 0..threads {
                if !seen.contains(&(process, thread)) {
                    return Err(ReplayError::MalformedGroup(format!(
                        "process {} has {} thread locations but no trace for thread {}",
                        process, threads, thread
                    )));
                }
            }
            if threads == 0 {
                return Err(ReplayError::MalformedGroup(format!("process {} has no locations", process)));
            }
        }
        if seen.len() != definitions.locations.len() {
            return Err(ReplayError::MalformedGroup(format!(
                "{} locations defined, {} traced",
                definitions.locations.len(),
                seen.len()
            )));
        }

        Ok(Job {
            world: definitions.world(),
            registry: Registry::new(&config),
            defs: definitions,
            config,
            traces,
        })
    }

    pub fn definitions(&self) -> &Definitions {
        &self.defs
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn num_processes(&self) -> usize {
        self.world.size()
    }

    pub fn num_locations(&self) -> usize {
        self.traces.len()
    }

    /// Replay without any downstream analysis
    pub fn run(&self) -> Result<Vec<ParticipantOutput<NoCallback>>> {
        self.run_with(|_| NoCallback)
    }

    /// Replay with one callback per location, created by `make`
    ///
    /// Returns per-location outputs in process then thread order. If any
    /// participant fails, the first error that was not induced by another
    /// participant's abort is returned.
    pub fn run_with<C, F>(&self, make: F) -> Result<Vec<ParticipantOutput<C>>>
    where
        C: AnalysisCallback,
        F: Fn(Location) -> C + Sync,
    {
        info!(
            processes = self.world.size(),
            locations = self.traces.len(),
            plan = ?self.registry.plan(),
            "replay started"
        );
        let latch = Arc::new(AbortLatch::default());
        let poll = self.config.poll_interval();
        let mut endpoints: Vec<Option<Endpoint>> = Endpoint::connect(self.world.size(), Arc::clone(&latch), poll)
            .into_iter()
            .map(Some)
            .collect();
        let teams: Vec<Team> = (0..self.world.size())
            .map(|p| Team::new(self.defs.threads_of(p), Arc::clone(&latch), poll))
            .collect();

        let make = &make;
        let abort: &AbortLatch = &latch;
        let results: Vec<Result<ParticipantOutput<C>>> = std::thread::scope(|s| {
            let handles: Vec<_> = self
                .traces
                .iter()
                .map(|(location, trace)| {
                    let endpoint = if location.is_master() {
                        endpoints.get_mut(location.process).and_then(Option::take)
                    } else {
                        None
                    };
                    let team = &teams[location.process];
                    let location = *location;
                    s.spawn(move || {
                        let _guard = RaiseOnPanic(abort);
                        let scope = ReplayScope {
                            defs: &self.defs,
                            world: &self.world,
                            config: &self.config,
                            trace,
                            location,
                            endpoint: endpoint.as_ref(),
                            team,
                        };
                        let mut analyzer = Analyzer::new(scope, &self.registry, make(location));
                        match analyzer.run() {
                            Ok(()) => Ok(analyzer.into_output()),
                            Err(e) => {
                                if !e.is_secondary() {
                                    warn!(process = location.process, thread = location.thread, error = %e, "participant failed");
                                }
                                abort.raise(&format!("process {} thread {}: {}", location.process, location.thread, e));
                                Err(e)
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(ReplayError::Transport("analysis thread panicked".to_string())))
                })
                .collect()
        });

        let mut outputs = Vec::with_capacity(results.len());
        let mut primary = None;
        let mut secondary = None;
        for result in results {
            match result {
                Ok(output) => outputs.push(output),
                Err(e) if e.is_secondary() => {
                    secondary.get_or_insert(e);
                }
                Err(e) => {
                    primary.get_or_insert(e);
                }
            }
        }
        if let Some(e) = primary.or(secondary) {
            return Err(e);
        }
        debug!(outputs = outputs.len(), "replay finished");
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{Callpath, CallpathId, Region, RegionId, RegionRole};
    use crate::trace::EventKind;

    fn defs(locations: Vec<Location>) -> Definitions {
        Definitions {
            regions: vec![Region {
                name: "main".to_string(),
                role: RegionRole::Function,
            }],
            callpaths: vec![Callpath {
                region: RegionId(0),
                parent: None,
            }],
            locations,
            ..Default::default()
        }
    }

    fn trivial_trace(location: u32) -> TraceInput {
        TraceInput {
            location: LocationId(location),
            events: vec![
                EventRecord::new(0.0, EventKind::Enter { callpath: CallpathId(0) }),
                EventRecord::new(1.0, EventKind::Leave { callpath: CallpathId(0) }),
            ],
        }
    }

    #[test]
    fn test_missing_trace_is_rejected() {
        let bundle = TraceBundle {
            definitions: defs(vec![
                Location { process: 0, thread: 0 },
                Location { process: 1, thread: 0 },
            ]),
            traces: vec![trivial_trace(0)],
        };
        let err = Job::new(bundle, AnalysisConfig::default()).err();
        assert!(matches!(err, Some(ReplayError::MalformedGroup(_))));
    }

    #[test]
    fn test_duplicate_trace_is_rejected() {
        let bundle = TraceBundle {
            definitions: defs(vec![Location { process: 0, thread: 0 }]),
            traces: vec![trivial_trace(0), trivial_trace(0)],
        };
        assert!(Job::new(bundle, AnalysisConfig::default()).is_err());
    }

    #[test]
    fn test_trivial_job_runs_every_pass() {
        let bundle = TraceBundle {
            definitions: defs(vec![
                Location { process: 0, thread: 0 },
                Location { process: 1, thread: 0 },
            ]),
            traces: vec![trivial_trace(1), trivial_trace(0)],
        };
        let job = Job::new(bundle, AnalysisConfig::full()).unwrap();
        assert_eq!(job.num_processes(), 2);
        let outputs = job.run().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].location.process, 0);
        assert!(outputs.iter().all(|o| o.synchpoints == 0 && o.errors.is_empty()));
    }

    #[test]
    fn test_bundle_json_round_trip() {
        let bundle = TraceBundle {
            definitions: defs(vec![Location { process: 0, thread: 0 }]),
            traces: vec![trivial_trace(0)],
        };
        let json = serde_json::to_string(&bundle).unwrap();
        let back = TraceBundle::from_json(&json).unwrap();
        assert_eq!(back.traces[0].events, bundle.traces[0].events);
    }
}
