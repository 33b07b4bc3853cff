//! # Phasebuild
//!
//! A phase-ordered build pipeline.
//!
//! Stages attach to a [`pipeline::Pipeline`] at a phase such as configure,
//! build or install. Build, clean and rebuild requests are queued and run
//! one at a time, walking the registry in phase order:
//!
//! - **Stage registry**: stages sorted by phase, modifier and priority
//! - **Task queue**: requests that a running build already satisfied resolve
//!   without queueing
//! - **Diagnostics**: compiler output is matched against registered regexes
//! - **Chaining**: a stage may absorb the work of the stages after it
//! - **Deploy**: strategies are probed concurrently and the lowest priority
//!   wins
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phasebuild::prelude::*;
//!
//! let pipeline = PipelineBuilder::new(PipelineConfig::new("debug", "/src/app")).build()?;
//! pipeline.load().await?;
//!
//! pipeline.attach(Phase::Configure, 0, CommandStage::shell("meson", "meson setup ."));
//! pipeline.attach(Phase::Build, 0, CommandStage::shell("ninja", "ninja"));
//!
//! pipeline.build_async(Phase::Build, None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod build_log;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod deploy;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod runtime;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::build_log::{BuildLog, LogStream};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::core::{
        Device, DeviceInfo, Diagnostic, LocalDevice, Phase, PhaseMask, PhaseSpec,
        PipelinePhase, Severity,
    };
    pub use crate::deploy::{DeployStrategy, LocalDeployStrategy, ProgressCallback};
    pub use crate::diagnostics::{DiagnosticExtractor, ErrorFormatFlags};
    pub use crate::errors::{BuildError, BuildResult};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::pipeline::{
        Pipeline, PipelineAddin, PipelineBuilder, StageId, TaskHandle, TaskKind,
    };
    pub use crate::runtime::{HostRuntime, RunCommand, RunContext, Runtime, Toolchain};
    pub use crate::stages::{CommandStage, FnStage, Stage, StageContext, StageHandle};
}
