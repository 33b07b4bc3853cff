//! Context handed to stage operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::StageHandle;
use crate::build_log::LogStream;
use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, BuildResult};
use crate::pipeline::{Pipeline, WeakPipeline};
use crate::runtime::{RunCommand, RunContext};

/// What a stage sees while it builds, queries or cleans.
#[derive(Clone)]
pub struct StageContext {
    handle: Arc<StageHandle>,
    pipeline: WeakPipeline,
    targets: Option<Vec<String>>,
    cancel: Arc<CancellationToken>,
    builddir: PathBuf,
    srcdir: PathBuf,
}

impl StageContext {
    pub(crate) fn new(
        handle: Arc<StageHandle>,
        pipeline: WeakPipeline,
        targets: Option<Vec<String>>,
        cancel: Arc<CancellationToken>,
        builddir: PathBuf,
        srcdir: PathBuf,
    ) -> Self {
        Self {
            handle,
            pipeline,
            targets,
            cancel,
            builddir,
            srcdir,
        }
    }

    /// A context with no pipeline behind it, for exercising stages directly.
    #[must_use]
    pub fn detached(
        handle: Arc<StageHandle>,
        builddir: impl Into<PathBuf>,
        srcdir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            handle,
            WeakPipeline::default(),
            None,
            Arc::new(CancellationToken::new()),
            builddir.into(),
            srcdir.into(),
        )
    }

    /// The handle of the stage being run.
    #[must_use]
    pub const fn handle(&self) -> &Arc<StageHandle> {
        &self.handle
    }

    /// Build targets requested by the caller, if any.
    #[must_use]
    pub fn targets(&self) -> Option<&[String]> {
        self.targets.as_deref()
    }

    /// Token cancelled when the task or the pipeline is cancelled.
    #[must_use]
    pub const fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns whether the task was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`BuildError::Cancelled`] if the task was cancelled.
    pub fn check_cancelled(&self) -> BuildResult<()> {
        if self.cancel.is_cancelled() {
            Err(BuildError::cancelled(
                self.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }

    /// Build directory.
    #[must_use]
    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    /// Source directory.
    #[must_use]
    pub fn srcdir(&self) -> &Path {
        &self.srcdir
    }

    /// The owning pipeline, if it is still alive.
    #[must_use]
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.pipeline.upgrade()
    }

    /// Writes a line to the stage log.
    pub fn log(&self, stream: LogStream, line: &str) {
        self.handle.log(stream, line);
    }

    /// Writes a line to the stage's stdout log.
    pub fn log_stdout(&self, line: &str) {
        self.log(LogStream::Stdout, line);
    }

    /// Writes a line to the stage's stderr log.
    pub fn log_stderr(&self, line: &str) {
        self.log(LogStream::Stderr, line);
    }

    /// Whether the stage is up to date.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.handle.completed()
    }

    /// Marks the stage up to date or stale.
    pub fn set_completed(&self, completed: bool) {
        self.handle.set_completed(completed);
    }

    /// Holds the stage's build until [`StageContext::unpause`].
    pub fn pause(&self) {
        self.handle.pause();
    }

    /// Releases a [`StageContext::pause`].
    pub fn unpause(&self) {
        self.handle.unpause();
    }

    /// Updates the stage status and the pipeline message.
    pub fn set_message(&self, message: Option<&str>) {
        self.handle.set_status(message.map(str::to_string));
        if let Some(pipeline) = self.pipeline() {
            pipeline.set_message(message);
        }
    }

    /// Applies the pipeline's build environment to a command.
    #[must_use]
    pub fn prepare_command(&self, command: RunCommand) -> RunCommand {
        let ctx = match self.pipeline() {
            Some(pipeline) => pipeline.create_run_context(),
            None => {
                let mut ctx = RunContext::new();
                ctx.set_cwd(&self.builddir);
                ctx.setenv("BUILDDIR", self.builddir.to_string_lossy());
                ctx.setenv("SRCDIR", self.srcdir.to_string_lossy());
                ctx
            }
        };
        ctx.apply(command)
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.handle.name())
            .field("targets", &self.targets)
            .field("builddir", &self.builddir)
            .field("srcdir", &self.srcdir)
            .finish_non_exhaustive()
    }
}
