//! Shared test utilities for studyflow integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a tracker to an in-memory backend and push hub
//! - Builders for entity records and events

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
