//! Thread scheduler implementations.
//!
//! Provides the thread registry and the round-robin scheduler that decides
//! which registered thread runs next.

pub mod registry;
pub mod rr;
pub mod trait_def;

pub use registry::{Registry, Slot};
pub use rr::RoundRobinScheduler;
pub use trait_def::{Pick, Scheduler};

/// Default scheduler type.
pub type DefaultScheduler = RoundRobinScheduler;
