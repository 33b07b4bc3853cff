//! Deploy strategies and the negotiation that picks one.
//!
//! Every registered strategy is asked concurrently whether it can serve the
//! pipeline and at what priority. Lower priorities win. A local strategy is
//! seeded at [`i32::MAX`] so a deploy target always exists.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::core::Phase;
use crate::errors::BuildResult;
use crate::pipeline::Pipeline;
use crate::runtime::RunContext;

/// Receives deploy progress as a fraction between 0 and 1.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Places build output on the pipeline's device.
#[async_trait]
pub trait DeployStrategy: Send + Sync + Debug {
    /// Strategy name.
    fn name(&self) -> &str;

    /// Returns the priority at which this strategy can serve `pipeline`.
    ///
    /// Fails with [`BuildError::NotSupported`](crate::errors::BuildError::NotSupported)
    /// when the strategy does not apply.
    async fn load(&self, pipeline: &Pipeline, cancel: &Arc<CancellationToken>) -> BuildResult<i32>;

    /// Deploys the current build.
    async fn deploy(
        &self,
        pipeline: &Pipeline,
        progress: &ProgressCallback,
        cancel: &Arc<CancellationToken>,
    ) -> BuildResult<()>;

    /// Adjusts the environment of commands run for this strategy.
    fn prepare_run_context(&self, _pipeline: &Pipeline, _ctx: &mut RunContext) {}
}

/// Deploys by installing into the build prefix on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalDeployStrategy;

#[async_trait]
impl DeployStrategy for LocalDeployStrategy {
    fn name(&self) -> &str {
        "local"
    }

    async fn load(&self, _pipeline: &Pipeline, _cancel: &Arc<CancellationToken>) -> BuildResult<i32> {
        Ok(i32::MAX)
    }

    async fn deploy(
        &self,
        pipeline: &Pipeline,
        progress: &ProgressCallback,
        cancel: &Arc<CancellationToken>,
    ) -> BuildResult<()> {
        progress(0.0);
        pipeline.build_async(Phase::Install, Some(cancel.clone())).await?;
        progress(1.0);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    strategy: Arc<dyn DeployStrategy>,
    priority: i32,
}

/// Tracks the best deploy strategy for a pipeline.
#[derive(Debug)]
pub struct DeployNegotiator {
    local: Arc<dyn DeployStrategy>,
    strategies: Vec<Arc<dyn DeployStrategy>>,
    best: RwLock<Candidate>,
    generation: AtomicU64,
    settled: watch::Sender<bool>,
}

impl DeployNegotiator {
    /// Creates a negotiator over `strategies`, seeded with the local strategy.
    #[must_use]
    pub fn new(strategies: Vec<Arc<dyn DeployStrategy>>) -> Self {
        let local: Arc<dyn DeployStrategy> = Arc::new(LocalDeployStrategy);
        let (settled, _) = watch::channel(true);
        Self {
            best: RwLock::new(Candidate {
                strategy: local.clone(),
                priority: i32::MAX,
            }),
            local,
            strategies,
            generation: AtomicU64::new(0),
            settled,
        }
    }

    /// The current best strategy.
    #[must_use]
    pub fn best(&self) -> Arc<dyn DeployStrategy> {
        self.best.read().strategy.clone()
    }

    /// Priority of the current best strategy.
    #[must_use]
    pub fn best_priority(&self) -> i32 {
        self.best.read().priority
    }

    /// Number of registered strategies, excluding the local one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Returns true if only the local strategy is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Falls back to the local strategy and drops pending results.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.best.write() = Candidate {
            strategy: self.local.clone(),
            priority: i32::MAX,
        };
        self.settled.send_replace(true);
    }

    /// Marks a negotiation as pending and returns its generation.
    pub(crate) fn begin(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.settled.send_replace(false);
        generation
    }

    /// Probes every strategy and keeps the best answer.
    pub(crate) async fn negotiate(
        &self,
        generation: u64,
        pipeline: &Pipeline,
        cancel: &Arc<CancellationToken>,
    ) {
        let mut probes: FuturesUnordered<_> = self
            .strategies
            .iter()
            .map(|strategy| async move { (strategy, strategy.load(pipeline, cancel).await) })
            .collect();

        while let Some((strategy, result)) = probes.next().await {
            match result {
                Ok(priority) => self.offer(generation, strategy, priority),
                Err(err) if err.is_not_supported() => {
                    debug!(strategy = %strategy.name(), "Deploy strategy not supported");
                }
                Err(err) => {
                    warn!(strategy = %strategy.name(), error = %err, "Deploy strategy failed to load");
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) == generation {
            info!(strategy = %self.best().name(), "Deploy strategy selected");
            self.settled.send_replace(true);
        }
    }

    fn offer(&self, generation: u64, strategy: &Arc<dyn DeployStrategy>, priority: i32) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let mut best = self.best.write();
        if priority < best.priority {
            debug!(strategy = %strategy.name(), priority, "Deploy strategy preferred");
            *best = Candidate {
                strategy: strategy.clone(),
                priority,
            };
        }
    }

    /// Resolves once no negotiation is pending.
    pub async fn wait_settled(&self) {
        let mut rx = self.settled.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|settled| *settled).await;
    }
}
