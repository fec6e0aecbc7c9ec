//! Paradigm drivers
//!
//! Each driver replays one communication paradigm and reports what it found
//! through the [`ReplayContext`](crate::context::ReplayContext): a synchpoint
//! classification, collective timing or one-sided epoch timing. Drivers never
//! touch the synchpoint detector directly.

pub mod collective;
pub mod p2p;
pub mod rma;
pub mod thread;

pub use collective::CollectiveDriver;
pub use p2p::P2pDriver;
pub use rma::RmaDriver;
pub use thread::ThreadDriver;
