//! Shared test utilities for sail integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a client to an in-memory remote and a temp cache dir
//! - `MetaBuilder` for creating meta configs programmatically

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
