//! Task execution: the flush loop and the phase walk.

use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::chain::try_chain;
use super::reaper::{can_remove_builddir, DirectoryReaper};
use super::task::{Task, TaskHandle, TaskKind};
use super::{Pipeline, PipelineEntry, PipelineState};
use crate::cancellation::CancellationToken;
use crate::core::{Phase, PhaseMask};
use crate::errors::{BuildError, BuildResult};
use crate::events::PipelineEvent;
use crate::stages::{StageContext, StageHandle};

/// Clears a stage's run flags even if its build unwinds.
struct RunGuard<'a>(&'a StageHandle);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.set_active(false);
        self.0.end_run();
    }
}

impl Pipeline {
    /// Builds every stage up to and including `phase`.
    ///
    /// Resolves immediately when a running build has already passed `phase`.
    pub fn build_async(&self, phase: Phase, cancel: Option<Arc<CancellationToken>>) -> TaskHandle {
        self.queue_build(phase, None, cancel)
    }

    /// Like [`Pipeline::build_async`], limited to `targets`.
    pub fn build_targets_async(
        &self,
        phase: Phase,
        targets: Vec<String>,
        cancel: Option<Arc<CancellationToken>>,
    ) -> TaskHandle {
        self.queue_build(phase, Some(targets), cancel)
    }

    fn queue_build(
        &self,
        phase: Phase,
        targets: Option<Vec<String>>,
        cancel: Option<Arc<CancellationToken>>,
    ) -> TaskHandle {
        if let Err(err) = self.check_ready() {
            return TaskHandle::ready(TaskKind::Build, Some(phase), Err(err));
        }

        let cancel = self.task_token(cancel);
        let handle = {
            let mut state = self.inner.state.lock();
            if Self::already_passed(&state, phase) {
                trace!(%phase, "Running build already passed the requested phase");
                return TaskHandle::ready(TaskKind::Build, Some(phase), Ok(()));
            }

            let (mut task, handle) = Task::new(TaskKind::Build, Some(phase), cancel);
            task.targets = targets;
            state.queue.push_back(task);
            handle
        };

        self.queue_flush();
        handle
    }

    /// Only a running build may satisfy a request; a clean may not.
    fn already_passed(state: &PipelineState, phase: Phase) -> bool {
        if !state.busy || state.in_clean {
            return false;
        }
        match state.position {
            None => false,
            Some(position) => state
                .registry
                .get(position)
                .map_or(true, |entry| entry.spec.phase > phase),
        }
    }

    /// Deletes build output, resets every stage, then builds up to `phase`.
    ///
    /// With no phase the task resolves once the output is gone.
    pub fn rebuild_async(
        &self,
        phase: Option<Phase>,
        targets: Option<Vec<String>>,
        cancel: Option<Arc<CancellationToken>>,
    ) -> TaskHandle {
        if let Err(err) = self.check_ready() {
            return TaskHandle::ready(TaskKind::Rebuild, phase, Err(err));
        }

        let (mut task, handle) = Task::new(TaskKind::Rebuild, phase, self.task_token(cancel));
        task.targets = targets;
        self.inner.state.lock().queue.push_back(task);
        self.queue_flush();
        handle
    }

    /// Cleans every stage at or above the lowest phase in `phases`, last
    /// stage first.
    pub fn clean_async(
        &self,
        phases: impl Into<PhaseMask>,
        cancel: Option<Arc<CancellationToken>>,
    ) -> TaskHandle {
        let min = phases.into().lowest();
        if let Err(err) = self.check_ready() {
            return TaskHandle::ready(TaskKind::Clean, min, Err(err));
        }
        let Some(min) = min else {
            return TaskHandle::ready(TaskKind::Clean, None, Ok(()));
        };

        let cancel = self.task_token(cancel);
        let handle = {
            let mut state = self.inner.state.lock();
            let stages: Vec<Arc<StageHandle>> = state
                .registry
                .entries()
                .iter()
                .filter(|entry| entry.spec.phase >= min)
                .map(|entry| entry.handle.clone())
                .collect();
            if stages.is_empty() {
                return TaskHandle::ready(TaskKind::Clean, Some(min), Ok(()));
            }

            let (mut task, handle) = Task::new(TaskKind::Clean, Some(min), cancel);
            task.clean_stages = stages;
            state.queue.push_back(task);
            handle
        };

        self.queue_flush();
        handle
    }

    /// Schedules a flush on the async runtime. Repeated calls coalesce.
    pub(crate) fn queue_flush(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.flush_scheduled {
                return;
            }
            state.flush_scheduled = true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pipeline = self.clone();
                runtime.spawn(async move { pipeline.flush().await });
            }
            Err(_) => {
                warn!("No async runtime; queued pipeline tasks will wait");
                self.inner.state.lock().flush_scheduled = false;
            }
        }
    }

    async fn flush(self) {
        {
            let mut state = self.inner.state.lock();
            state.flush_scheduled = false;
            if state.busy {
                trace!("Pipeline already busy, deferring flush");
                return;
            }
            if state.queue.is_empty() {
                trace!("No tasks to process");
                return;
            }
        }

        if let Err(err) = tokio::fs::create_dir_all(&self.inner.builddir).await {
            let err = BuildError::from(err);
            warn!(builddir = %self.inner.builddir.display(), error = %err, "Failed to create build directory");
            let failed: Vec<Task> = {
                let mut state = self.inner.state.lock();
                if state.busy {
                    return;
                }
                state.queue.drain(..).collect()
            };
            for mut task in failed {
                task.complete(Err(err.clone()));
            }
            return;
        }

        let task = {
            let mut state = self.inner.state.lock();
            if state.busy {
                return;
            }
            let Some(task) = state.queue.pop_front() else {
                return;
            };
            state.busy = true;
            task
        };

        self.dispatch(task).await;
    }

    async fn dispatch(&self, mut task: Task) {
        let needs_rebuild = {
            let mut state = self.inner.state.lock();
            let blocked = state.failed
                && task.kind == TaskKind::Build
                && task.phase.is_some_and(|phase| phase <= Phase::Configure);
            if !blocked {
                state.failed = false;
                state.position = None;
                state.reached_end = false;
                state.in_clean = task.kind == TaskKind::Clean;
                state.current_stage = None;
                state.message = None;
            }
            blocked
        };

        if needs_rebuild {
            let phase = task.phase.unwrap_or(Phase::Configure);
            debug!(%phase, "Refusing to build a failed pipeline without a rebuild");
            task.complete(Err(BuildError::NeedsRebuild { phase }));
            self.finish_task();
            return;
        }

        self.log_entries(&task);
        self.emit(PipelineEvent::Started { phase: task.phase });

        let result = AssertUnwindSafe(self.run_task(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                self.inner.state.lock().failed = true;
                Err(BuildError::stage_failed("pipeline", "stage panicked"))
            });

        if let Err(err) = &result {
            debug!(task = %task.id, kind = ?task.kind, error = %err, "Pipeline task failed");
        }
        task.complete(result);
        self.finish_task();
    }

    fn log_entries(&self, task: &Task) {
        let state = self.inner.state.lock();
        let errors_on_stdout = state
            .registry
            .entries()
            .iter()
            .any(|entry| entry.handle.check_stdout());
        self.inner.errors_on_stdout.store(errors_on_stdout, Ordering::SeqCst);

        debug!(
            task = %task.id,
            kind = ?task.kind,
            phase = ?task.phase,
            "Executing pipeline task with {} pipeline entries",
            state.registry.len()
        );
        for (index, entry) in state.registry.entries().iter().enumerate() {
            debug!(
                " pipeline[{:02}]: {:>12}: {} [{}]",
                index,
                entry.spec.phase.nick(),
                entry.handle.name(),
                if entry.handle.completed() { "completed" } else { "pending" }
            );
        }
    }

    async fn run_task(&self, task: &Task) -> BuildResult<()> {
        match task.kind {
            TaskKind::Build => self.tick_build(task).await,
            TaskKind::Clean => self.tick_clean(task).await,
            TaskKind::Rebuild => self.tick_rebuild(task).await,
        }
    }

    fn stage_context(&self, handle: &Arc<StageHandle>, task: &Task) -> StageContext {
        StageContext::new(
            handle.clone(),
            self.downgrade(),
            task.targets.clone(),
            task.cancel.clone(),
            self.inner.builddir.clone(),
            self.inner.srcdir.clone(),
        )
    }

    async fn tick_build(&self, task: &Task) -> BuildResult<()> {
        let Some(phase) = task.phase else {
            return Ok(());
        };

        loop {
            self.set_message(None);
            self.inner.extractor.lock().reset_directories();

            if task.cancel.is_cancelled() {
                return Err(BuildError::cancelled(
                    task.cancel.reason().unwrap_or_else(|| "build cancelled".to_string()),
                ));
            }

            let next = {
                let mut state = self.inner.state.lock();
                state.current_stage = None;
                if !Self::request_phase_locked(&mut state, phase) {
                    trace!(%phase, "Nothing left to do for requested phase");
                    // A walk that ran something counts as finished.
                    state.reached_end = state.position.is_some();
                    return Ok(());
                }
                Self::advance(&mut state)
            };
            let Some(handle) = next else {
                return Ok(());
            };

            let ctx = self.stage_context(&handle, task);
            let result = Self::build_with_query(&handle, &ctx).await;

            handle.set_completed(result.is_ok());
            handle.clear_bindings();

            if let Err(err) = result {
                debug!(stage = %handle.name(), error = %err, "Stage failed");
                self.inner.state.lock().failed = true;
                return Err(err);
            }
        }
    }

    /// Moves the walk to the next requested, enabled stage.
    ///
    /// Queued builds for lower phases resolve as in-mask entries are
    /// reached. Returns `None` once the walk passes the last entry.
    fn advance(state: &mut PipelineState) -> Option<Arc<StageHandle>> {
        let start = state.position.map_or(0, |position| position + 1);
        let mask = state.requested_mask;

        for index in start..state.registry.len() {
            let Some(entry) = state.registry.get(index).cloned() else {
                break;
            };
            if !mask.contains(entry.spec.phase) {
                continue;
            }

            complete_queued_before(&mut state.queue, entry.spec.phase);

            if entry.handle.disabled() {
                continue;
            }

            let last = try_chain(state.registry.entries(), &entry.handle, index + 1, mask);
            if let Some(last) = last {
                trace!(stage = %entry.handle.name(), through = last, "Chained stages");
            }
            state.position = Some(last.unwrap_or(index));
            state.current_stage = Some(entry.handle.clone());
            return Some(entry.handle);
        }

        state.reached_end = true;
        None
    }

    /// Queries the stage, waits while it is paused, then builds it unless
    /// the query left it completed.
    async fn build_with_query(handle: &Arc<StageHandle>, ctx: &StageContext) -> BuildResult<()> {
        if !handle.begin_run() {
            return Err(BuildError::Pending);
        }
        let _guard = RunGuard(handle);

        handle.pause();
        let queried = handle.stage().query(ctx).await;
        handle.unpause();
        queried?;

        tokio::select! {
            () = handle.wait_unpaused() => {}
            () = ctx.cancel_token().cancelled() => {
                return ctx.check_cancelled();
            }
        }

        if handle.completed() {
            trace!(stage = %handle.name(), "Stage up to date");
            return Ok(());
        }

        handle.set_active(true);
        handle.stage().build(ctx).await
    }

    async fn tick_clean(&self, task: &Task) -> BuildResult<()> {
        let mut stages = task.clean_stages.clone();

        while let Some(handle) = stages.pop() {
            if task.cancel.is_cancelled() {
                return Err(BuildError::cancelled(
                    task.cancel.reason().unwrap_or_else(|| "clean cancelled".to_string()),
                ));
            }

            self.inner.state.lock().current_stage = Some(handle.clone());
            let ctx = self.stage_context(&handle, task);
            if let Err(err) = handle.stage().clean(&ctx).await {
                warn!(stage = %handle.name(), error = %err, "Failed to clean stage");
                self.inner.state.lock().failed = true;
                return Err(err);
            }
        }

        Ok(())
    }

    async fn tick_rebuild(&self, task: &Task) -> BuildResult<()> {
        let mut reaper = DirectoryReaper::new();

        if can_remove_builddir(&self.inner.builddir, &self.inner.cache_dir, &self.inner.srcdir) {
            reaper.add_directory(&self.inner.builddir, Duration::ZERO);
        } else {
            debug!(
                builddir = %self.inner.builddir.display(),
                "Build directory is not in a cache directory, will not delete it"
            );
        }

        for handle in self.stages() {
            handle.stage().reap(&mut reaper);
            handle.set_completed(false);
        }

        self.log_message("Removing build directories");
        let weak = self.downgrade();
        reaper
            .execute(task.cancel.clone(), move |path| {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.log_message(&format!("Removing {}", path.display()));
                }
            })
            .await
            .inspect_err(|_| self.inner.state.lock().failed = true)?;

        self.tick_build(task).await
    }

    /// Resets per-task state, drops transient stages and moves on to the
    /// next queued task, or unloads if the configuration went away.
    fn finish_task(&self) {
        let (failed, released) = {
            let mut state = self.inner.state.lock();
            if state.reached_end {
                state.position = Some(state.registry.len());
            }
            state.reached_end = false;
            state.current_stage = None;
            state.busy = false;
            state.requested_mask = PhaseMask::EMPTY;
            state.in_clean = false;
            state.message = None;

            let released = Self::release_transients(&mut state);
            (state.failed, released)
        };

        for (position, entry) in &released {
            self.teardown(*position, entry);
        }

        self.emit(PipelineEvent::MessageChanged { message: None });
        self.emit(PipelineEvent::Finished { failed });

        let ready = self.inner.config.read().ready;
        if ready {
            self.queue_flush();
        } else {
            self.unload();
        }
    }

    /// Removes transient stages from the back, so every reported position
    /// is still valid for the entries in front of it.
    fn release_transients(state: &mut PipelineState) -> Vec<(usize, PipelineEntry)> {
        let transient: Vec<_> = state
            .registry
            .entries()
            .iter()
            .rev()
            .filter(|entry| entry.handle.transient())
            .map(|entry| entry.id)
            .collect();

        transient
            .into_iter()
            .filter_map(|id| Self::remove_locked(state, id))
            .collect()
    }
}

/// Resolves queued builds whose phase lies below `phase`.
fn complete_queued_before(queue: &mut VecDeque<Task>, phase: Phase) {
    queue.retain_mut(|task| {
        let done = task.kind == TaskKind::Build && task.phase.is_some_and(|p| p < phase);
        if done {
            task.complete(Ok(()));
        }
        !done
    });
}
