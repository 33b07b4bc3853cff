//! Mock stages, devices and deploy strategies for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::build_log::LogStream;
use crate::cancellation::CancellationToken;
use crate::core::{Device, DeviceInfo};
use crate::deploy::{DeployStrategy, ProgressCallback};
use crate::errors::{BuildError, BuildResult};
use crate::pipeline::{DirectoryReaper, Pipeline};
use crate::stages::{Stage, StageContext, StageHandle};

/// Shared record of stage names, in the order they ran.
pub type RunOrder = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default)]
struct MockShared {
    builds: AtomicUsize,
    cleans: AtomicUsize,
    queries: AtomicUsize,
    failure: Mutex<Option<String>>,
    targets: Mutex<Option<Vec<String>>>,
}

/// Observes a [`MockStage`] after the pipeline has taken ownership of it.
#[derive(Debug, Clone)]
pub struct MockCounters {
    shared: Arc<MockShared>,
}

impl MockCounters {
    /// Number of builds.
    #[must_use]
    pub fn builds(&self) -> usize {
        self.shared.builds.load(Ordering::SeqCst)
    }

    /// Number of cleans.
    #[must_use]
    pub fn cleans(&self) -> usize {
        self.shared.cleans.load(Ordering::SeqCst)
    }

    /// Number of queries.
    #[must_use]
    pub fn queries(&self) -> usize {
        self.shared.queries.load(Ordering::SeqCst)
    }

    /// Makes later builds fail with `message`, or succeed again with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.shared.failure.lock() = message.map(str::to_string);
    }

    /// Targets passed to the last build.
    #[must_use]
    pub fn last_targets(&self) -> Option<Vec<String>> {
        self.shared.targets.lock().clone()
    }
}

/// A configurable stage that counts what the pipeline asks of it.
#[derive(Debug)]
pub struct MockStage {
    name: String,
    shared: Arc<MockShared>,
    chains: Vec<String>,
    transient: bool,
    check_stdout: bool,
    always_run: bool,
    panics: bool,
    delay: Duration,
    output: Vec<(LogStream, String)>,
    reap: Vec<PathBuf>,
    order: Option<RunOrder>,
}

impl MockStage {
    /// Creates a stage that succeeds immediately.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::default(),
            chains: Vec::new(),
            transient: false,
            check_stdout: false,
            always_run: false,
            panics: false,
            delay: Duration::ZERO,
            output: Vec::new(),
            reap: Vec::new(),
            order: None,
        }
    }

    /// A handle sharing this stage's counters.
    #[must_use]
    pub fn counters(&self) -> MockCounters {
        MockCounters {
            shared: self.shared.clone(),
        }
    }

    /// Fails every build with `message`.
    #[must_use]
    pub fn failing(self, message: &str) -> Self {
        *self.shared.failure.lock() = Some(message.to_string());
        self
    }

    /// Chains with stages carrying one of `names`.
    #[must_use]
    pub fn chains_with<'a, I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.chains.extend(names.into_iter().map(str::to_string));
        self
    }

    /// Starts out transient.
    #[must_use]
    pub const fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Starts out with stdout diagnostics enabled.
    #[must_use]
    pub const fn with_check_stdout(mut self) -> Self {
        self.check_stdout = true;
        self
    }

    /// Marks itself incomplete on every query.
    #[must_use]
    pub const fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Panics while building.
    #[must_use]
    pub const fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Sleeps for `delay` while building. Cancellation cuts the sleep short.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Logs `line` on `stream` while building.
    #[must_use]
    pub fn with_output(mut self, stream: LogStream, line: impl Into<String>) -> Self {
        self.output.push((stream, line.into()));
        self
    }

    /// Asks rebuilds to delete `path`.
    #[must_use]
    pub fn with_reap(mut self, path: impl Into<PathBuf>) -> Self {
        self.reap.push(path.into());
        self
    }

    /// Appends the stage name to `order` on every build and clean.
    #[must_use]
    pub fn record_into(mut self, order: &RunOrder) -> Self {
        self.order = Some(order.clone());
        self
    }

    fn record(&self) {
        if let Some(order) = &self.order {
            order.lock().push(self.name.clone());
        }
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, ctx: &StageContext) -> BuildResult<()> {
        self.shared.builds.fetch_add(1, Ordering::SeqCst);
        *self.shared.targets.lock() = ctx.targets().map(<[String]>::to_vec);
        self.record();

        assert!(!self.panics, "mock stage {} panicked", self.name);

        for (stream, line) in &self.output {
            ctx.log(*stream, line);
        }

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = ctx.cancel_token().cancelled() => {}
            }
        }
        ctx.check_cancelled()?;

        match self.shared.failure.lock().clone() {
            Some(message) => Err(BuildError::stage_failed(&self.name, message)),
            None => Ok(()),
        }
    }

    async fn clean(&self, ctx: &StageContext) -> BuildResult<()> {
        self.shared.cleans.fetch_add(1, Ordering::SeqCst);
        self.record();
        ctx.set_completed(false);
        Ok(())
    }

    fn has_query(&self) -> bool {
        self.always_run
    }

    async fn query(&self, ctx: &StageContext) -> BuildResult<()> {
        self.shared.queries.fetch_add(1, Ordering::SeqCst);
        if self.always_run {
            ctx.set_completed(false);
        }
        Ok(())
    }

    fn can_chain(&self, next: &StageHandle) -> bool {
        self.chains.iter().any(|name| name == next.name())
    }

    fn reap(&self, reaper: &mut DirectoryReaper) {
        for path in &self.reap {
            reaper.add_file(path.clone(), Duration::ZERO);
        }
    }

    fn is_transient(&self) -> bool {
        self.transient
    }

    fn checks_stdout(&self) -> bool {
        self.check_stdout
    }
}

/// A device with a fixed answer.
#[derive(Debug, Clone)]
pub struct MockDevice {
    id: String,
    info: Result<DeviceInfo, BuildError>,
}

impl MockDevice {
    /// Creates a device answering with `info`.
    #[must_use]
    pub fn new(id: impl Into<String>, info: Result<DeviceInfo, BuildError>) -> Self {
        Self { id: id.into(), info }
    }
}

#[async_trait]
impl Device for MockDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_info(&self, _cancel: &CancellationToken) -> BuildResult<DeviceInfo> {
        self.info.clone()
    }
}

/// A deploy strategy with a fixed negotiation answer.
#[derive(Debug)]
pub struct MockDeployStrategy {
    name: String,
    priority: Result<i32, BuildError>,
    deploys: AtomicUsize,
}

impl MockDeployStrategy {
    /// Creates a strategy whose `load` returns `priority`.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: Result<i32, BuildError>) -> Self {
        Self {
            name: name.into(),
            priority,
            deploys: AtomicUsize::new(0),
        }
    }

    /// Number of deploys.
    #[must_use]
    pub fn deploys(&self) -> usize {
        self.deploys.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeployStrategy for MockDeployStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, _pipeline: &Pipeline, _cancel: &Arc<CancellationToken>) -> BuildResult<i32> {
        self.priority.clone()
    }

    async fn deploy(
        &self,
        _pipeline: &Pipeline,
        progress: &ProgressCallback,
        _cancel: &Arc<CancellationToken>,
    ) -> BuildResult<()> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        progress(1.0);
        Ok(())
    }
}
