//! Pipeline notifications.
//!
//! The pipeline reports what it does through an [`EventSink`]. Each
//! notification is a [`PipelineEvent`], wrapped in a JSON envelope carrying
//! the pipeline id and a timestamp.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::{Diagnostic, Phase};
use crate::pipeline::StageId;

/// A notification emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A diagnostic was extracted from build output.
    Diagnostic {
        /// The diagnostic.
        diagnostic: Diagnostic,
    },
    /// A task started walking the registry.
    Started {
        /// The phase the task targets; `None` for a rebuild that only reaps.
        phase: Option<Phase>,
    },
    /// The current task resolved.
    Finished {
        /// Whether the task failed.
        failed: bool,
    },
    /// A stage was attached.
    StageAdded {
        /// Registry id.
        id: StageId,
        /// Index in the sorted registry.
        position: usize,
        /// Stage name.
        name: String,
    },
    /// A stage was detached.
    StageRemoved {
        /// Registry id.
        id: StageId,
        /// Index it occupied.
        position: usize,
        /// Stage name.
        name: String,
    },
    /// The pipeline finished loading.
    Loaded,
    /// The pipeline unloaded its addins.
    Unloaded,
    /// The status text changed.
    MessageChanged {
        /// New status text.
        message: Option<String>,
    },
    /// A deploy started.
    DeployStarted {
        /// Strategy in use.
        strategy: String,
    },
    /// A deploy finished.
    DeployFinished {
        /// Strategy in use.
        strategy: String,
        /// Whether the deploy failed.
        failed: bool,
    },
    /// Deploy progress changed.
    Progress {
        /// Fraction between 0 and 1.
        fraction: f64,
    },
}

impl PipelineEvent {
    /// Dotted event type passed to sinks.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Diagnostic { .. } => "pipeline.diagnostic",
            Self::Started { .. } => "pipeline.started",
            Self::Finished { .. } => "pipeline.finished",
            Self::StageAdded { .. } => "pipeline.stage_added",
            Self::StageRemoved { .. } => "pipeline.stage_removed",
            Self::Loaded => "pipeline.loaded",
            Self::Unloaded => "pipeline.unloaded",
            Self::MessageChanged { .. } => "pipeline.message",
            Self::DeployStarted { .. } => "deploy.started",
            Self::DeployFinished { .. } => "deploy.finished",
            Self::Progress { .. } => "deploy.progress",
        }
    }

    /// Wraps the event with the pipeline id and a timestamp.
    #[must_use]
    pub fn envelope(&self, pipeline_id: &str) -> serde_json::Value {
        serde_json::json!({
            "pipeline_id": pipeline_id,
            "timestamp": Utc::now().to_rfc3339(),
            "event": self,
        })
    }

    /// Recovers an event from an envelope.
    #[must_use]
    pub fn from_envelope(value: &serde_json::Value) -> Option<Self> {
        value
            .get("event")
            .and_then(|event| serde_json::from_value(event.clone()).ok())
    }
}
