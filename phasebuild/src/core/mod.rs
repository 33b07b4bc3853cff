//! Core domain model types for phasebuild.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Phases, phase modifiers and the typed phase mask
//! - Diagnostics and their severities
//! - Device identity

mod device;
mod diagnostic;
mod phase;

pub use device::{Device, DeviceInfo, DeviceKind, LocalDevice};
pub use diagnostic::{Diagnostic, Location, Severity};
pub use phase::{
    Phase, PhaseMask, PhaseSpec, PipelinePhase, Whence, AFTER_FLAG, BEFORE_FLAG, FAILED_FLAG,
    FINISHED_FLAG,
};
