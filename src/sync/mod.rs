//! Synchronization primitives for green threads.

pub mod mutex;

pub use mutex::{Mutex, MutexGuard};
