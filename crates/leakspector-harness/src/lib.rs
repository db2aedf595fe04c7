//! Scenario-driven testing harness for the leakspector allocation-
//! information engine.
//!
//! Runs [`fixtures::FixtureCase`] scripts — small sequences of allocator
//! operations — against a real, OS-backed [`leakspector_core::Engine`] and
//! scores the result. Used both as a library (the `#[test]` in
//! [`runner`] exercises the builtin set) and via the `harness` binary for
//! ad-hoc fixture files.

#![forbid(unsafe_code)]

pub mod fixtures;
pub mod report;
pub mod runner;

pub use fixtures::{FixtureCase, FixtureSet};
pub use report::{CaseOutcome, ScenarioReport};
pub use runner::TestRunner;
