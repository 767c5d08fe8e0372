//! Section timers
//!
//! [`state`] holds the pure countdown and merge rules; [`sync`] drives them
//! against the server on tokio tasks.

pub mod state;
pub mod sync;

pub use state::{merge_timer, MergedTimer, Reconciliation, SectionTimer, TickOutcome};
pub use sync::{StartOutcome, TimerEvent, TimerSynchronizer};
