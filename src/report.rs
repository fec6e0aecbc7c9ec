//! Severity profile and job report
//!
//! [`SeverityProfile`] is the default downstream analysis: it sums wait
//! time, delay cost and one-sided contention per call-tree node of one
//! location. [`JobReport`] merges the profiles of all locations and renders
//! them as a text table or as JSON.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::defs::{CallpathId, Definitions};
use crate::error::Result;
use crate::replay::{AnalysisCallback, EventView, FinishView, Job, ParticipantOutput, PassPlan, Stage};

/// Severity of one call-tree node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Severity {
    /// Synchpoints recorded at this node, waiting or not
    pub synchpoints: usize,
    /// Wait time per wait-state kind
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub wait: BTreeMap<String, f64>,
    /// Delay cost charged here, keyed `<waiter kind>.<cost category>`
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub delay: BTreeMap<String, f64>,
    /// Part of the wait time explained by upstream wait states
    pub indirect_wait: f64,
    /// Long-term cost downstream waiters pushed onto wait states here
    pub propagated_cost: f64,
    pub rma_wait: f64,
    pub lock_contention: f64,
}

impl Severity {
    pub fn merge(&mut self, other: &Severity) {
        self.synchpoints += other.synchpoints;
        for (k, v) in &other.wait {
            *self.wait.entry(k.clone()).or_insert(0.0) += v;
        }
        for (k, v) in &other.delay {
            *self.delay.entry(k.clone()).or_insert(0.0) += v;
        }
        self.indirect_wait += other.indirect_wait;
        self.propagated_cost += other.propagated_cost;
        self.rma_wait += other.rma_wait;
        self.lock_contention += other.lock_contention;
    }

    pub fn total_wait(&self) -> f64 {
        self.wait.values().sum()
    }

    pub fn total_delay(&self) -> f64 {
        self.delay.values().sum()
    }
}

/// Per-location severity callback
#[derive(Debug, Clone, Default)]
pub struct SeverityProfile {
    nodes: BTreeMap<CallpathId, Severity>,
}

impl SeverityProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &BTreeMap<CallpathId, Severity> {
        &self.nodes
    }

    fn node(&mut self, cnode: CallpathId) -> &mut Severity {
        self.nodes.entry(cnode).or_default()
    }
}

impl AnalysisCallback for SeverityProfile {
    fn on_event(&mut self, _stage: Stage, view: &EventView<'_>) -> Result<()> {
        let cnode = view.event.cnode();
        if let Some((kind, info)) = view.detected {
            let node = self.node(cnode);
            node.synchpoints += 1;
            if info.wait_time > 0.0 {
                *node.wait.entry(kind.name().to_string()).or_insert(0.0) += info.wait_time;
            }
        }
        if let Some(rma) = view.ctx.rma {
            self.node(cnode).rma_wait += rma.wait_time.max(0.0);
        }
        if let Some(outcome) = view.delay {
            let waiter = outcome.kind.map_or("unknown", |k| k.name());
            for (category, cost) in &outcome.costs {
                let key = format!("{}.{}", waiter, category.name());
                for (&at, &time) in &cost.map {
                    *self.node(at).delay.entry(key.clone()).or_insert(0.0) += time;
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, view: &FinishView<'_>) -> Result<()> {
        for (&event, profile) in view.delay.profiles() {
            let node = self.node(view.trace.event(event).cnode());
            node.indirect_wait += profile.indirect;
            node.propagated_cost += profile.propagated;
        }
        for &(event, wait) in view.lock_waits {
            self.node(view.trace.event(event).cnode()).lock_contention += wait;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallpathReport {
    pub callpath: CallpathId,
    /// Region names from the call-tree root, joined by `/`
    pub path: String,
    #[serde(flatten)]
    pub severity: Severity,
}

/// Merged result of a whole job
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub processes: usize,
    pub locations: usize,
    pub plan: PassPlan,
    pub synchpoints: usize,
    pub wait_states: usize,
    pub totals: Severity,
    pub callpaths: Vec<CallpathReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Region names along the call-tree path of `cnode`
pub fn callpath_name(defs: &Definitions, cnode: CallpathId) -> Result<String> {
    let mut names = Vec::new();
    let mut next = Some(cnode);
    while let Some(id) = next {
        let callpath = defs.callpath(id)?;
        names.push(defs.region(callpath.region)?.name.as_str());
        next = callpath.parent;
    }
    names.reverse();
    Ok(names.join("/"))
}

impl JobReport {
    pub fn build(job: &Job, outputs: &[ParticipantOutput<SeverityProfile>]) -> Result<Self> {
        let mut merged: BTreeMap<CallpathId, Severity> = BTreeMap::new();
        let mut errors = Vec::new();
        let (mut synchpoints, mut wait_states) = (0, 0);
        for output in outputs {
            synchpoints += output.synchpoints;
            wait_states += output.wait_states;
            for message in &output.errors {
                errors.push(format!(
                    "process {} thread {}: {}",
                    output.location.process, output.location.thread, message
                ));
            }
            for (&cnode, severity) in output.callback.nodes() {
                merged.entry(cnode).or_default().merge(severity);
            }
        }

        let mut totals = Severity::default();
        let mut callpaths = Vec::with_capacity(merged.len());
        for (callpath, severity) in merged {
            totals.merge(&severity);
            callpaths.push(CallpathReport {
                callpath,
                path: callpath_name(job.definitions(), callpath)?,
                severity,
            });
        }

        Ok(JobReport {
            processes: job.num_processes(),
            locations: job.num_locations(),
            plan: job.config().pass_plan(),
            synchpoints,
            wait_states,
            totals,
            callpaths,
            errors,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} processes, {} locations, {} synchpoints, {} wait states ({:?} replay)",
            self.processes, self.locations, self.synchpoints, self.wait_states, self.plan
        );
        if self.callpaths.is_empty() {
            let _ = writeln!(out, "No synchronization found.");
            return out;
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "       wait       delay    indirect  propagated    rma/lock callpath");
        let _ = writeln!(out, "----------- ----------- ----------- ----------- ----------- ----------------");
        let mut rows: Vec<&CallpathReport> = self.callpaths.iter().collect();
        rows.sort_by(|a, b| {
            let ka = a.severity.total_wait() + a.severity.total_delay();
            let kb = b.severity.total_wait() + b.severity.total_delay();
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        for row in rows {
            let s = &row.severity;
            let _ = writeln!(
                out,
                "{:>11.6} {:>11.6} {:>11.6} {:>11.6} {:>11.6} {}",
                s.total_wait(),
                s.total_delay(),
                s.indirect_wait,
                s.propagated_cost,
                s.rma_wait + s.lock_contention,
                row.path
            );
        }
        let t = &self.totals;
        let _ = writeln!(out, "----------- ----------- ----------- ----------- ----------- ----------------");
        let _ = writeln!(
            out,
            "{:>11.6} {:>11.6} {:>11.6} {:>11.6} {:>11.6} total",
            t.total_wait(),
            t.total_delay(),
            t.indirect_wait,
            t.propagated_cost,
            t.rma_wait + t.lock_contention
        );

        if !t.wait.is_empty() {
            let _ = writeln!(out, "\nWait time by kind:");
            for (kind, time) in &t.wait {
                let _ = writeln!(out, "  {:<16} {:.6}", kind, time);
            }
        }
        if !t.delay.is_empty() {
            let _ = writeln!(out, "\nDelay cost by category:");
            for (category, time) in &t.delay {
                let _ = writeln!(out, "  {:<36} {:.6}", category, time);
            }
        }
        for error in &self.errors {
            let _ = writeln!(out, "error: {}", error);
        }
        out
    }
}
