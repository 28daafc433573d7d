//! Crate-level test suite.
//!
//! Every test runs on its own OS thread and therefore starts from a fresh
//! runtime.

mod helpers;
mod integration;
