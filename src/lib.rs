//! waitcause - replay-based wait-state and delay analysis for parallel traces
//!
//! The engine replays the per-location event traces of a parallel program
//! against each other. Every recorded message and collective is re-enacted
//! between analysis participants, so each participant learns the timing of
//! its peers at exactly the points where they synchronized. From that it
//! detects wait states (late sender, late receiver, collective and thread
//! waits) and, in further passes, attributes each wait state to the
//! call-tree nodes of its cause.
//!
//! ```no_run
//! use waitcause::config::AnalysisConfig;
//! use waitcause::replay::{Job, TraceBundle};
//! use waitcause::report::{JobReport, SeverityProfile};
//!
//! # fn main() -> waitcause::Result<()> {
//! let bundle = TraceBundle::load(std::path::Path::new("job.json"))?;
//! let job = Job::new(bundle, AnalysisConfig::default())?;
//! let outputs = job.run_with(|_| SeverityProfile::new())?;
//! println!("{}", JobReport::build(&job, &outputs)?.render_text());
//! # Ok(())
//! # }
//! ```

pub mod callstack;
pub mod cli;
pub mod comm;
pub mod config;
pub mod context;
pub mod defs;
pub mod delay;
pub mod drivers;
pub mod error;
pub mod rankset;
pub mod replay;
pub mod report;
pub mod synchpoint;
pub mod timemap;
pub mod trace;

pub use error::{ReplayError, Result};
pub use rankset::RankSet;
pub use synchpoint::{SynchpointDetector, SynchpointInfo};
