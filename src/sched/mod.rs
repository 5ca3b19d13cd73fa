//! Thread scheduler implementations.
//!
//! Provides the plugin contract and the round-robin and priority policies.

pub mod prio;
pub mod rr;
pub mod trait_def;

pub use prio::{PriorityLevel, PriorityScheduler};
pub use rr::RoundRobinScheduler;
pub use trait_def::{priority, SchedStats, Scheduler, SchedulerId};
