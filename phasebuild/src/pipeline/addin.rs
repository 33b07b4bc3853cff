//! Extensions that attach stages when a pipeline loads.

use async_trait::async_trait;
use std::fmt::Debug;

use super::Pipeline;
use crate::errors::BuildResult;

/// Contributes stages to a pipeline.
///
/// Stages an addin attaches during [`PipelineAddin::load`] should be passed
/// to [`Pipeline::track`] so the pipeline detaches them when it unloads.
#[async_trait]
pub trait PipelineAddin: Send + Sync + Debug {
    /// Addin name, for logging.
    fn name(&self) -> &str;

    /// Runs for every addin before any of them loads.
    fn prepare(&self, _pipeline: &Pipeline) {}

    /// Attaches the addin's stages.
    async fn load(&self, pipeline: &Pipeline) -> BuildResult<()>;

    /// Releases anything not covered by tracked stages.
    fn unload(&self, _pipeline: &Pipeline) {}
}
