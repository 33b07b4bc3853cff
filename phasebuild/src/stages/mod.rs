//! Stage trait and implementations.
//!
//! A stage is one unit of build work attached to a phase. The pipeline wraps
//! every attached stage in a [`StageHandle`] that carries its flags, and
//! passes a [`StageContext`] to every operation.

mod command;
mod context;
mod handle;

pub use command::CommandStage;
pub use context::StageContext;
pub use handle::{StageHandle, StageLogObserver};

use async_trait::async_trait;
use std::fmt::Debug;

use crate::errors::BuildResult;
use crate::pipeline::DirectoryReaper;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// Performs the stage's work.
    async fn build(&self, ctx: &StageContext) -> BuildResult<()>;

    /// Removes what [`Stage::build`] produced.
    ///
    /// The default marks the stage incomplete. Overrides decide for
    /// themselves; the pipeline does not reset the flag after a clean.
    async fn clean(&self, ctx: &StageContext) -> BuildResult<()> {
        ctx.set_completed(false);
        Ok(())
    }

    /// Whether [`Stage::query`] must run before every build.
    ///
    /// Stages that answer true are always considered when deciding whether
    /// a requested phase still has work to do.
    fn has_query(&self) -> bool {
        false
    }

    /// Decides whether the stage is up to date.
    ///
    /// Runs before every build. Implementations mark the stage incomplete
    /// with [`StageContext::set_completed`] and may hold the build with
    /// [`StageContext::pause`] while they look.
    async fn query(&self, _ctx: &StageContext) -> BuildResult<()> {
        Ok(())
    }

    /// Whether this stage's build also performs `next`'s work.
    fn can_chain(&self, _next: &StageHandle) -> bool {
        false
    }

    /// Adds paths a rebuild must delete.
    fn reap(&self, _reaper: &mut DirectoryReaper) {}

    /// Initial transient flag.
    fn is_transient(&self) -> bool {
        false
    }

    /// Initial stdout-diagnostics flag.
    fn checks_stdout(&self) -> bool {
        false
    }
}

/// A stage backed by a synchronous closure.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> BuildResult<()> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> BuildResult<()> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> BuildResult<()> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> BuildResult<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, ctx: &StageContext) -> BuildResult<()> {
        (self.func)(ctx)
    }
}
