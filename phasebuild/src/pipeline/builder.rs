//! Assembles a [`Pipeline`] from a configuration and its collaborators.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::{Pipeline, PipelineInner, PipelineState};
use crate::build_log::BuildLog;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::{Device, LocalDevice};
use crate::deploy::{DeployNegotiator, DeployStrategy};
use crate::diagnostics::{DiagnosticExtractor, ErrorFormatFlags};
use crate::errors::BuildResult;
use crate::events::{EventSink, NoOpEventSink};
use crate::runtime::{DefaultToolchain, HostRuntime, Runtime, Toolchain};

use super::PipelineAddin;

/// Builder for [`Pipeline`].
///
/// Everything except the configuration has a host default: the local
/// device, the host runtime, the default toolchain and a sink that drops
/// events.
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    device: Option<Arc<dyn Device>>,
    runtime: Option<Arc<dyn Runtime>>,
    toolchain: Option<Arc<dyn Toolchain>>,
    addins: Vec<Arc<dyn PipelineAddin>>,
    strategies: Vec<Arc<dyn DeployStrategy>>,
    events: Option<Arc<dyn EventSink>>,
    error_formats: Vec<(String, ErrorFormatFlags)>,
}

impl PipelineBuilder {
    /// Creates a builder for `config`.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Sets the device to build for.
    #[must_use]
    pub fn device(mut self, device: Arc<dyn Device>) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the runtime stages build inside.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn Runtime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the toolchain.
    #[must_use]
    pub fn toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Adds an addin. Addins load in the order they were added.
    #[must_use]
    pub fn addin(mut self, addin: Arc<dyn PipelineAddin>) -> Self {
        self.addins.push(addin);
        self
    }

    /// Adds a deploy strategy to negotiate over.
    #[must_use]
    pub fn deploy_strategy(mut self, strategy: Arc<dyn DeployStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registers an error format up front.
    #[must_use]
    pub fn error_format(mut self, pattern: impl Into<String>, flags: ErrorFormatFlags) -> Self {
        self.error_formats.push((pattern.into(), flags));
        self
    }

    /// Builds the pipeline.
    ///
    /// The pipeline still has to be loaded with [`Pipeline::load`] before
    /// it accepts work.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidErrorFormat`](crate::errors::BuildError::InvalidErrorFormat)
    /// if a registered error format does not compile.
    pub fn build(self) -> BuildResult<Pipeline> {
        let builddir = self.config.resolved_builddir();
        let cache_dir = self.config.resolved_cache_dir();
        let srcdir = self.config.srcdir.clone();

        let mut extractor = DiagnosticExtractor::new(&builddir, &srcdir);
        for (pattern, flags) in &self.error_formats {
            extractor.add_error_format(pattern, *flags)?;
        }

        let default_toolchain: Arc<dyn Toolchain> = Arc::new(DefaultToolchain);
        let toolchain = self.toolchain.unwrap_or_else(|| default_toolchain.clone());

        let inner = PipelineInner {
            id: self.config.id.clone(),
            builddir,
            srcdir,
            cache_dir,
            state: Mutex::new(PipelineState::default()),
            extractor: Mutex::new(extractor),
            errors_on_stdout: AtomicBool::new(false),
            pty_buffer: Mutex::new(Vec::new()),
            log: BuildLog::new(),
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEventSink)),
            cancel: Mutex::new(Arc::new(CancellationToken::new())),
            runtime: self.runtime.unwrap_or_else(|| Arc::new(HostRuntime)),
            toolchain: RwLock::new(toolchain),
            default_toolchain,
            device: self.device.unwrap_or_else(|| Arc::new(LocalDevice)),
            device_info: RwLock::new(None),
            addins: self.addins,
            deploy: DeployNegotiator::new(self.strategies),
            broken: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            tracked: Mutex::new(Vec::new()),
            config: RwLock::new(self.config),
        };

        Ok(Pipeline {
            inner: Arc::new(inner),
        })
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("addins", &self.addins.len())
            .field("strategies", &self.strategies.len())
            .field("error_formats", &self.error_formats.len())
            .finish_non_exhaustive()
    }
}
