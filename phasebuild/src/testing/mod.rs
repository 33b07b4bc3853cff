//! Testing utilities for phasebuild pipelines.
//!
//! This module provides:
//! - Mock stages with shared counters
//! - Mock devices and deploy strategies
//! - A collecting event sink

mod mocks;

pub use crate::events::CollectingEventSink;
pub use mocks::{MockCounters, MockDeployStrategy, MockDevice, MockStage, RunOrder};
