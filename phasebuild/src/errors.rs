//! Error types for the phasebuild pipeline.
//!
//! Every failure reaches the caller through the result of a queued task.
//! The error is `Clone` so a shared precondition failure (for example an
//! output directory that cannot be created) can fail every queued task
//! with the same value.

use std::sync::Arc;
use thiserror::Error;

use crate::core::Phase;

/// Result alias used throughout the crate.
pub type BuildResult<T> = Result<T, BuildError>;

/// The main error type for pipeline operations.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// A strategy or device cannot serve this pipeline.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The pipeline failed to initialize.
    #[error("The pipeline is in a failed state and cannot be used")]
    Broken,

    /// The configuration is not ready yet.
    #[error("The pipeline has not yet been loaded")]
    NotLoaded,

    /// A low-phase build was requested after a failure.
    #[error("Failed to build {phase}; the pipeline must be rebuilt")]
    NeedsRebuild {
        /// The phase that was requested.
        phase: Phase,
    },

    /// The operation was cancelled.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A stage reported a failure.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed {
        /// Name of the failing stage.
        stage: String,
        /// Failure description.
        message: String,
    },

    /// A raw phase value did not decode into a single base phase.
    #[error("Invalid phase flags: {0:#x}")]
    InvalidPhase(u32),

    /// A stage is already building.
    #[error("A build is already in progress")]
    Pending,

    /// A regular expression could not be compiled.
    #[error("Invalid error format: {0}")]
    InvalidErrorFormat(#[from] regex::Error),

    /// Configuration could not be read or parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl BuildError {
    /// Creates a stage failure error.
    #[must_use]
    pub fn stage_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Returns true if this error came from cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns true if this error is excluded from deploy negotiation.
    #[must_use]
    pub const fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// Returns true if retrying the same request later may succeed.
    ///
    /// `NotLoaded` clears once the configuration becomes ready. A
    /// `NeedsRebuild` request succeeds only after an explicit rebuild.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotLoaded | Self::Pending)
    }
}
