//! The build pipeline.
//!
//! This module provides:
//! - The stage registry, kept sorted by phase, modifier and priority
//! - The task queue and the phase walk that runs stages
//! - Stage chaining and the rebuild reaper
//! - Pipeline lifecycle, addins and deploy routing

mod addin;
mod builder;
mod chain;
mod reaper;
mod registry;
mod runner;
mod task;

#[cfg(test)]
mod integration_tests;

pub use addin::PipelineAddin;
pub use builder::PipelineBuilder;
pub use reaper::{can_remove_builddir, DirectoryReaper};
pub use registry::{PipelineEntry, StageId};
pub use task::{TaskHandle, TaskKind};

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::build_log::{BuildLog, LogStream};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::{
    Device, DeviceInfo, Diagnostic, Phase, PhaseMask, PhaseSpec, PipelinePhase,
};
use crate::deploy::{DeployNegotiator, DeployStrategy, ProgressCallback};
use crate::diagnostics::{DiagnosticExtractor, ErrorFormatFlags};
use crate::errors::{BuildError, BuildResult};
use crate::events::{EventSink, PipelineEvent};
use crate::runtime::{find_in_path, RunCommand, RunContext, Runtime, Toolchain};
use crate::stages::{CommandStage, Stage, StageHandle, StageLogObserver};
use registry::StageRegistry;
use task::Task;

/// Scheduler state. Only touched with the state lock held, never across an await.
#[derive(Debug, Default)]
struct PipelineState {
    registry: StageRegistry,
    queue: VecDeque<Task>,
    busy: bool,
    failed: bool,
    in_clean: bool,
    /// Index of the last stage the current walk started; `None` before the first.
    position: Option<usize>,
    /// Set when the walk passed the last entry; applied when the task finishes.
    reached_end: bool,
    requested_mask: PhaseMask,
    current_stage: Option<Arc<StageHandle>>,
    message: Option<String>,
    flush_scheduled: bool,
}

struct PipelineInner {
    id: String,
    config: RwLock<PipelineConfig>,
    builddir: PathBuf,
    srcdir: PathBuf,
    cache_dir: PathBuf,
    state: Mutex<PipelineState>,
    extractor: Mutex<DiagnosticExtractor>,
    errors_on_stdout: AtomicBool,
    pty_buffer: Mutex<Vec<u8>>,
    log: BuildLog,
    events: Arc<dyn EventSink>,
    cancel: Mutex<Arc<CancellationToken>>,
    runtime: Arc<dyn Runtime>,
    toolchain: RwLock<Arc<dyn Toolchain>>,
    default_toolchain: Arc<dyn Toolchain>,
    device: Arc<dyn Device>,
    device_info: RwLock<Option<DeviceInfo>>,
    addins: Vec<Arc<dyn PipelineAddin>>,
    deploy: DeployNegotiator,
    broken: AtomicBool,
    loaded: AtomicBool,
    tracked: Mutex<Vec<StageId>>,
}

/// A phase-ordered build pipeline.
///
/// Cloning is cheap; clones share the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

/// A non-owning reference to a [`Pipeline`].
#[derive(Clone, Default)]
pub struct WeakPipeline(Weak<PipelineInner>);

impl WeakPipeline {
    /// Returns the pipeline if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Pipeline> {
        self.0.upgrade().map(|inner| Pipeline { inner })
    }
}

impl fmt::Debug for WeakPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakPipeline")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

impl Pipeline {
    /// Configuration id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// A non-owning reference to this pipeline.
    #[must_use]
    pub fn downgrade(&self) -> WeakPipeline {
        WeakPipeline(Arc::downgrade(&self.inner))
    }

    /// Snapshot of the configuration.
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        self.inner.config.read().clone()
    }

    /// Build directory.
    #[must_use]
    pub fn builddir(&self) -> &Path {
        &self.inner.builddir
    }

    /// Source directory.
    #[must_use]
    pub fn srcdir(&self) -> &Path {
        &self.inner.srcdir
    }

    /// Cache root used to decide whether the build directory may be wiped.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// Joins `parts` onto the build directory.
    #[must_use]
    pub fn build_builddir_path(&self, parts: &[&str]) -> PathBuf {
        parts.iter().fold(self.inner.builddir.clone(), |path, part| path.join(part))
    }

    /// Joins `parts` onto the source directory.
    #[must_use]
    pub fn build_srcdir_path(&self, parts: &[&str]) -> PathBuf {
        parts.iter().fold(self.inner.srcdir.clone(), |path, part| path.join(part))
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let envelope = event.envelope(&self.inner.id);
        self.inner.events.try_emit(event.event_type(), Some(envelope));
    }

    // Registry

    /// Attaches `stage` at `spec` and returns its id.
    pub fn attach(&self, spec: impl Into<PhaseSpec>, priority: i32, stage: impl Stage + 'static) -> StageId {
        self.attach_boxed(spec.into(), priority, Box::new(stage))
    }

    /// Attaches a boxed stage.
    pub fn attach_boxed(&self, spec: PhaseSpec, priority: i32, stage: Box<dyn Stage>) -> StageId {
        let (handle, position) = {
            let mut state = self.inner.state.lock();
            let id = state.registry.next_id();
            let handle = Arc::new(StageHandle::new(id, spec, priority, stage));
            handle.set_observer(Some(self.stage_observer()));

            let position = state.registry.insert(PipelineEntry {
                id,
                spec,
                priority,
                handle: handle.clone(),
            });
            if let Some(current) = state.position {
                if position <= current {
                    state.position = Some(current + 1);
                }
            }
            (handle, position)
        };

        trace!(stage = %handle.name(), %spec, priority, position, "Attached stage");
        self.emit(PipelineEvent::StageAdded {
            id: handle.id(),
            position,
            name: handle.name().to_string(),
        });
        handle.id()
    }

    /// Attaches a stage from raw phase flags.
    ///
    /// Returns `None`, after logging a warning, when the flags do not name
    /// exactly one phase with at most one modifier.
    pub fn attach_flags(&self, flags: u32, priority: i32, stage: Box<dyn Stage>) -> Option<StageId> {
        match PhaseSpec::from_bits(flags) {
            Ok(spec) => Some(self.attach_boxed(spec, priority, stage)),
            Err(err) => {
                warn!(stage = %stage.name(), error = %err, "Refusing to attach stage");
                None
            }
        }
    }

    /// Removes a stage. Unknown ids are ignored.
    pub fn detach(&self, id: StageId) {
        let removed = {
            let mut state = self.inner.state.lock();
            Self::remove_locked(&mut state, id)
        };
        if let Some((position, entry)) = removed {
            self.teardown(position, &entry);
        }
    }

    fn remove_locked(state: &mut PipelineState, id: StageId) -> Option<(usize, PipelineEntry)> {
        let (position, entry) = state.registry.remove(id)?;
        if let Some(current) = state.position {
            if position <= current {
                state.position = current.checked_sub(1);
            }
        }
        Some((position, entry))
    }

    fn teardown(&self, position: usize, entry: &PipelineEntry) {
        entry.handle.set_observer(None);
        entry.handle.clear_bindings();
        trace!(stage = %entry.handle.name(), position, "Detached stage");
        self.emit(PipelineEvent::StageRemoved {
            id: entry.id,
            position,
            name: entry.handle.name().to_string(),
        });
    }

    /// Marks every stage in `mask` incomplete.
    pub fn invalidate_phase(&self, mask: impl Into<PhaseMask>) {
        self.inner.state.lock().registry.invalidate(mask.into());
    }

    /// Adds `phase` and everything below it to the requested mask.
    ///
    /// Returns true if a requested stage is incomplete or must be queried.
    pub fn request_phase(&self, phase: Phase) -> bool {
        Self::request_phase_locked(&mut self.inner.state.lock(), phase)
    }

    fn request_phase_locked(state: &mut PipelineState, phase: Phase) -> bool {
        state.requested_mask |= PhaseMask::through(phase);
        let mask = state.requested_mask;

        state.registry.entries().iter().any(|entry| {
            mask.contains(entry.spec.phase)
                && (!entry.handle.completed() || entry.handle.stage().has_query())
        })
    }

    /// Detaches this stage when the pipeline unloads.
    pub fn track(&self, id: StageId) {
        self.inner.tracked.lock().push(id);
    }

    /// Snapshot of the attached stages in execution order.
    #[must_use]
    pub fn stages(&self) -> Vec<Arc<StageHandle>> {
        self.inner
            .state
            .lock()
            .registry
            .entries()
            .iter()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn get_stage_by_id(&self, id: StageId) -> Option<Arc<StageHandle>> {
        let state = self.inner.state.lock();
        let position = state.registry.position_of(id)?;
        state.registry.get(position).map(|e| e.handle.clone())
    }

    /// Calls `f` for every stage, in order.
    pub fn foreach_stage<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<StageHandle>),
    {
        for stage in self.stages() {
            f(&stage);
        }
    }

    // Logging and diagnostics

    fn stage_observer(&self) -> StageLogObserver {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |handle: &StageHandle, stream: LogStream, line: &str| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.on_stage_log(handle, stream, line);
            }
        })
    }

    fn on_stage_log(&self, handle: &StageHandle, stream: LogStream, line: &str) {
        trace!(stage = %handle.name(), %stream, "{}", line);
        self.inner.log.observe(stream, line);

        if stream == LogStream::Stderr || self.inner.errors_on_stdout.load(Ordering::SeqCst) {
            let diagnostics = self.inner.extractor.lock().extract(line);
            self.emit_diagnostics(diagnostics);
        }
    }

    fn emit_diagnostics(&self, diagnostics: Vec<Diagnostic>) {
        for diagnostic in diagnostics {
            self.emit(PipelineEvent::Diagnostic { diagnostic });
        }
    }

    /// Writes a pipeline message to the build log.
    pub(crate) fn log_message(&self, line: &str) {
        info!(pipeline = %self.inner.id, "{}", line);
        self.inner.log.observe(LogStream::Stdout, line);
    }

    /// The build log all stage output flows through.
    #[must_use]
    pub fn log(&self) -> &BuildLog {
        &self.inner.log
    }

    /// Registers a build log observer.
    pub fn add_log_observer<F>(&self, observer: F) -> u32
    where
        F: Fn(LogStream, &str) + Send + Sync + 'static,
    {
        self.inner.log.add_observer(observer)
    }

    /// Removes a build log observer.
    pub fn remove_log_observer(&self, id: u32) -> bool {
        self.inner.log.remove_observer(id)
    }

    /// Registers a regex used to extract diagnostics.
    pub fn add_error_format(&self, pattern: &str, flags: ErrorFormatFlags) -> BuildResult<u32> {
        self.inner
            .extractor
            .lock()
            .add_error_format(pattern, flags)
            .inspect_err(|err| warn!(pattern, error = %err, "Rejected error format"))
    }

    /// Removes an error format. Returns false if the id was unknown.
    pub fn remove_error_format(&self, id: u32) -> bool {
        self.inner.extractor.lock().remove_error_format(id)
    }

    /// Scans raw terminal output for diagnostics.
    ///
    /// Partial trailing lines are held back until their newline arrives.
    pub fn feed_pty(&self, data: &[u8]) {
        let complete: Vec<u8> = {
            let mut buffer = self.inner.pty_buffer.lock();
            buffer.extend_from_slice(data);
            match buffer.iter().rposition(|&b| b == b'\n') {
                Some(end) => buffer.drain(..=end).collect(),
                None => return,
            }
        };

        let diagnostics = self.inner.extractor.lock().extract_bytes(&complete);
        self.emit_diagnostics(diagnostics);
    }

    // State queries

    /// What the pipeline is doing.
    #[must_use]
    pub fn get_phase(&self) -> PipelinePhase {
        Self::phase_locked(&self.inner.state.lock())
    }

    fn phase_locked(state: &PipelineState) -> PipelinePhase {
        match state.position {
            None => PipelinePhase::None,
            Some(_) if state.failed => PipelinePhase::Failed,
            Some(position) => state
                .registry
                .get(position)
                .map_or(PipelinePhase::Finished, |e| PipelinePhase::Active(e.spec.phase)),
        }
    }

    /// Highest phase requested by the running task.
    #[must_use]
    pub fn get_requested_phase(&self) -> Option<Phase> {
        self.inner.state.lock().requested_mask.highest()
    }

    /// Human-readable status.
    #[must_use]
    pub fn get_message(&self) -> String {
        let state = self.inner.state.lock();

        if state.busy {
            if let Some(message) = state.message.as_deref().filter(|m| !m.is_empty()) {
                return message.to_string();
            }
        }
        if state.in_clean {
            return "Cleaning".to_string();
        }
        if state.failed {
            return "Failed".to_string();
        }
        if !state.busy {
            return "Ready".to_string();
        }
        if let Some(stage) = &state.current_stage {
            if !stage.name().is_empty() {
                return stage.name().to_string();
            }
        }

        Self::phase_locked(&state).message().to_string()
    }

    /// Sets the status text shown while busy.
    ///
    /// Tool prefixes such as `flatpak-builder: ` are stripped.
    pub fn set_message(&self, message: Option<&str>) {
        let message = message.map(|m| {
            m.strip_prefix("flatpak-builder: ")
                .or_else(|| m.strip_prefix("jhbuild:"))
                .unwrap_or(m)
                .to_string()
        });

        self.inner.state.lock().message.clone_from(&message);
        self.emit(PipelineEvent::MessageChanged { message });
    }

    /// Whether every configure stage has completed.
    ///
    /// False while broken, and false when no stage sits above configure.
    #[must_use]
    pub fn has_configured(&self) -> bool {
        if self.is_broken() {
            return false;
        }

        let state = self.inner.state.lock();
        for entry in state.registry.entries() {
            match entry.spec.phase.cmp(&Phase::Configure) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    if !entry.handle.completed() {
                        return false;
                    }
                }
                std::cmp::Ordering::Greater => return true,
            }
        }
        false
    }

    /// Whether any stage exports artifacts.
    #[must_use]
    pub fn get_can_export(&self) -> bool {
        !self.is_broken()
            && self
                .inner
                .state
                .lock()
                .registry
                .entries()
                .iter()
                .any(|e| e.spec.phase == Phase::Export)
    }

    /// Whether the pipeline has loaded and can accept work.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.loaded.load(Ordering::SeqCst) && !self.is_broken()
    }

    /// Whether a task is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.state.lock().busy
    }

    /// Whether the pipeline failed to initialize.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }

    // Environment

    /// The runtime stages build inside.
    #[must_use]
    pub fn runtime(&self) -> Arc<dyn Runtime> {
        self.inner.runtime.clone()
    }

    /// The toolchain in use.
    #[must_use]
    pub fn ref_toolchain(&self) -> Arc<dyn Toolchain> {
        self.inner.toolchain.read().clone()
    }

    /// The build target device.
    #[must_use]
    pub fn device(&self) -> Arc<dyn Device> {
        self.inner.device.clone()
    }

    /// Device identity, once loaded.
    #[must_use]
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.inner.device_info.read().clone()
    }

    /// Triplet of the device being built for.
    #[must_use]
    pub fn host_triplet(&self) -> String {
        self.device_info()
            .map_or_else(|| self.ref_toolchain().host_triplet(), |info| info.triplet())
    }

    /// Whether the device is the machine running the pipeline.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.device_info()
            .map_or(true, |info| info.triplet() == DeviceInfo::host().triplet())
    }

    /// Architecture of the device, or of the runtime before loading.
    #[must_use]
    pub fn arch(&self) -> String {
        self.device_info()
            .map_or_else(|| self.inner.runtime.arch(), |info| info.arch)
    }

    /// Looks for `program` in the runtime and the configured extra paths.
    #[must_use]
    pub fn contains_program_in_path(&self, program: &str) -> bool {
        if self.inner.runtime.contains_program_in_path(program) {
            return true;
        }

        let config = self.inner.config.read();
        let extra = std::env::join_paths(config.prepend_path.iter().chain(&config.append_path));
        extra.is_ok_and(|path| find_in_path(program, Some(&path)).is_some())
    }

    /// Fills `ctx` with the build environment.
    pub fn prepare_run_context(&self, ctx: &mut RunContext) {
        self.inner.runtime.prepare_to_build(ctx);
        self.ref_toolchain().prepare_run_context(ctx);

        ctx.set_cwd(&self.inner.builddir);
        ctx.setenv("BUILDDIR", self.inner.builddir.to_string_lossy());
        ctx.setenv("SRCDIR", self.inner.srcdir.to_string_lossy());

        let config = self.inner.config.read();
        for (key, value) in &config.environment {
            ctx.setenv(key.clone(), value.clone());
        }
        for dir in &config.prepend_path {
            ctx.prepend_path(dir.clone());
        }
        for dir in &config.append_path {
            ctx.append_path(dir.clone());
        }
    }

    /// A fresh context prepared with [`Pipeline::prepare_run_context`].
    #[must_use]
    pub fn create_run_context(&self) -> RunContext {
        let mut ctx = RunContext::new();
        self.prepare_run_context(&mut ctx);
        ctx
    }

    /// A build context further adjusted by the selected deploy strategy.
    #[must_use]
    pub fn create_deploy_run_context(&self) -> RunContext {
        let mut ctx = self.create_run_context();
        self.get_deploy_strategy().prepare_run_context(self, &mut ctx);
        ctx
    }

    fn check_toolchain(&self, info: &DeviceInfo) {
        let toolchain = self.ref_toolchain();
        if !toolchain.supports_arch(&info.arch) {
            warn!(
                toolchain = %toolchain.id(),
                arch = %info.arch,
                "Toolchain does not support the device, using the default toolchain"
            );
            *self.inner.toolchain.write() = self.inner.default_toolchain.clone();
        }
    }

    // Lifecycle

    /// Loads the pipeline: device info, command stages, addins and deploy
    /// negotiation. Loading an already loaded pipeline does nothing.
    pub async fn load(&self) -> BuildResult<()> {
        if self.is_broken() {
            return Err(BuildError::Broken);
        }
        if self.inner.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        if !self.inner.config.read().ready {
            return Err(BuildError::NotLoaded);
        }

        let cancel = self.cancel_token();
        let info = match self.inner.device.get_info(&cancel).await {
            Ok(info) => info,
            Err(err) => {
                warn!(device = %self.inner.device.id(), error = %err, "Failed to load device information");
                if !err.is_cancelled() {
                    self.mark_broken();
                }
                return Err(err);
            }
        };
        self.check_toolchain(&info);
        debug!(triplet = %info.triplet(), "Loaded device information");
        *self.inner.device_info.write() = Some(info);

        self.register_command_stages();

        for addin in &self.inner.addins {
            addin.prepare(self);
        }
        for addin in &self.inner.addins {
            let begin = Instant::now();
            if let Err(err) = addin.load(self).await {
                warn!(addin = %addin.name(), error = %err, "Pipeline addin failed to load");
                self.mark_broken();
                return Err(err);
            }
            debug!(
                addin = %addin.name(),
                "{} loaded in {:.3} seconds",
                addin.name(),
                begin.elapsed().as_secs_f64()
            );
            tokio::task::yield_now().await;
        }

        self.inner.loaded.store(true, Ordering::SeqCst);

        let generation = self.inner.deploy.begin();
        let pipeline = self.clone();
        tokio::spawn(async move {
            let cancel = pipeline.cancel_token();
            pipeline.inner.deploy.negotiate(generation, &pipeline, &cancel).await;
        });

        info!(pipeline = %self.inner.id, "Pipeline ready");
        self.emit(PipelineEvent::Loaded);
        self.queue_flush();
        Ok(())
    }

    fn register_command_stages(&self) {
        let config = self.config();
        let mut ids = Vec::new();

        for (index, command) in config.build_commands.iter().enumerate() {
            let cwd = config
                .build_commands_dir
                .clone()
                .unwrap_or_else(|| self.inner.builddir.clone());
            let stage = CommandStage::new(
                format!("Build ({command})"),
                RunCommand::shell(command.clone()).cwd(cwd),
            )
            .with_always_run(true);
            ids.push(self.attach(PhaseSpec::after(Phase::Build), command_priority(index), stage));
        }

        for (index, command) in config.post_install_commands.iter().enumerate() {
            let stage = CommandStage::new(
                format!("Post-install ({command})"),
                RunCommand::shell(command.clone()).cwd(self.inner.builddir.clone()),
            )
            .with_always_run(true);
            ids.push(self.attach(PhaseSpec::after(Phase::Install), command_priority(index), stage));
        }

        self.inner.tracked.lock().extend(ids);
    }

    /// Unloads addins, detaches tracked stages and falls back to local deploy.
    pub fn unload(&self) {
        if !self.inner.loaded.swap(false, Ordering::SeqCst) {
            return;
        }

        for addin in self.inner.addins.iter().rev() {
            addin.unload(self);
        }
        let tracked = std::mem::take(&mut *self.inner.tracked.lock());
        for id in tracked {
            self.detach(id);
        }
        self.inner.deploy.reset();

        info!(pipeline = %self.inner.id, "Pipeline unloaded");
        self.emit(PipelineEvent::Unloaded);
    }

    /// Updates configuration readiness.
    ///
    /// Becoming ready loads the pipeline in the background. Becoming
    /// unready unloads it, deferred until the running task finishes.
    pub fn set_config_ready(&self, ready: bool) {
        self.inner.config.write().ready = ready;

        if ready {
            if self.inner.loaded.load(Ordering::SeqCst) {
                return;
            }
            let pipeline = self.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(err) = pipeline.load().await {
                            warn!(error = %err, "Pipeline failed to load");
                        }
                    });
                }
                Err(_) => warn!("No async runtime; call Pipeline::load to finish loading"),
            }
        } else if !self.is_busy() {
            self.unload();
        }
    }

    /// Puts the pipeline in the broken state and fails every queued task.
    pub fn mark_broken(&self) {
        self.inner.broken.store(true, Ordering::SeqCst);
        let queued: Vec<Task> = self.inner.state.lock().queue.drain(..).collect();
        for mut task in queued {
            task.complete(Err(BuildError::Broken));
        }
    }

    /// Cancels all in-flight work.
    ///
    /// The shared token is replaced first, so work requested afterwards is
    /// not affected.
    pub fn cancel(&self) {
        let old = std::mem::replace(
            &mut *self.inner.cancel.lock(),
            Arc::new(CancellationToken::new()),
        );
        debug!(pipeline = %self.inner.id, "Cancelling pipeline operations");
        old.cancel("Pipeline operations were cancelled");
    }

    /// The token shared by work started from now on.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        self.inner.cancel.lock().clone()
    }

    /// A token cancelled by either `cancel` or the pipeline.
    fn task_token(&self, cancel: Option<Arc<CancellationToken>>) -> Arc<CancellationToken> {
        let shared = self.cancel_token();
        match cancel {
            Some(cancel) => CancellationToken::chained(&[&cancel, &shared]),
            None => CancellationToken::chained(&[&shared]),
        }
    }

    pub(crate) fn check_ready(&self) -> BuildResult<()> {
        if self.is_broken() {
            Err(BuildError::Broken)
        } else if !self.inner.loaded.load(Ordering::SeqCst) {
            Err(BuildError::NotLoaded)
        } else {
            Ok(())
        }
    }

    // Deploy

    /// The best deploy strategy found so far.
    #[must_use]
    pub fn get_deploy_strategy(&self) -> Arc<dyn DeployStrategy> {
        self.inner.deploy.best()
    }

    /// Resolves once deploy negotiation has finished.
    pub async fn wait_deploy_negotiation(&self) {
        self.inner.deploy.wait_settled().await;
    }

    /// Deploys through the best strategy.
    pub async fn deploy_async(
        &self,
        progress: Option<ProgressCallback>,
        cancel: Option<Arc<CancellationToken>>,
    ) -> BuildResult<()> {
        self.check_ready()?;

        let strategy = self.get_deploy_strategy();
        let name = strategy.name().to_string();
        let cancel = self.task_token(cancel);
        self.emit(PipelineEvent::DeployStarted {
            strategy: name.clone(),
        });

        let weak = self.downgrade();
        let callback: ProgressCallback = Arc::new(move |fraction| {
            if let Some(progress) = &progress {
                progress(fraction);
            }
            if let Some(pipeline) = weak.upgrade() {
                pipeline.emit(PipelineEvent::Progress { fraction });
            }
        });

        let result = strategy.deploy(self, &callback, &cancel).await;
        if let Err(err) = &result {
            warn!(strategy = %name, error = %err, "Deploy failed");
        }
        self.emit(PipelineEvent::DeployFinished {
            strategy: name,
            failed: result.is_err(),
        });
        result
    }
}

fn command_priority(index: usize) -> i32 {
    i32::try_from(index).unwrap_or(i32::MAX)
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pipeline")
            .field("id", &self.inner.id)
            .field("builddir", &self.inner.builddir)
            .field("runtime", &self.inner.runtime.id())
            .field("stages", &state.registry.len())
            .field("queued", &state.queue.len())
            .field("busy", &state.busy)
            .finish_non_exhaustive()
    }
}
