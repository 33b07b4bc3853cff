//! Registry-owned state wrapped around a [`Stage`].

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::trace;

use super::Stage;
use crate::build_log::LogStream;
use crate::core::{Phase, PhaseSpec};
use crate::pipeline::StageId;

/// Receives every line a stage logs.
pub type StageLogObserver = Arc<dyn Fn(&StageHandle, LogStream, &str) + Send + Sync>;

/// A stage plus the flags the pipeline tracks for it.
///
/// Handles are created by [`Pipeline::attach`](crate::pipeline::Pipeline::attach)
/// and only the registry stores them long-term.
pub struct StageHandle {
    id: StageId,
    spec: PhaseSpec,
    priority: i32,
    stage: Box<dyn Stage>,
    completed: AtomicBool,
    disabled: AtomicBool,
    transient: AtomicBool,
    check_stdout: AtomicBool,
    active: AtomicBool,
    running: AtomicBool,
    status: RwLock<Option<String>>,
    observer: RwLock<Option<StageLogObserver>>,
    bindings: Mutex<Vec<Weak<StageHandle>>>,
    n_pause: AtomicU32,
    unpaused: Notify,
}

impl StageHandle {
    pub(crate) fn new(id: StageId, spec: PhaseSpec, priority: i32, stage: Box<dyn Stage>) -> Self {
        let transient = stage.is_transient();
        let check_stdout = stage.checks_stdout();
        Self {
            id,
            spec,
            priority,
            stage,
            completed: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            transient: AtomicBool::new(transient),
            check_stdout: AtomicBool::new(check_stdout),
            active: AtomicBool::new(false),
            running: AtomicBool::new(false),
            status: RwLock::new(None),
            observer: RwLock::new(None),
            bindings: Mutex::new(Vec::new()),
            n_pause: AtomicU32::new(0),
            unpaused: Notify::new(),
        }
    }

    /// Registry id.
    #[must_use]
    pub const fn id(&self) -> StageId {
        self.id
    }

    /// Phase and modifier the stage was attached with.
    #[must_use]
    pub const fn spec(&self) -> PhaseSpec {
        self.spec
    }

    /// Base phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.spec.phase
    }

    /// Priority within the phase.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// The wrapped stage.
    #[must_use]
    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Whether the stage's work is up to date.
    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Sets the completed flag and mirrors it onto chained stages.
    pub fn set_completed(&self, completed: bool) {
        self.completed.store(completed, Ordering::SeqCst);

        let bound: Vec<Arc<Self>> = self
            .bindings
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for other in bound {
            other.set_completed(completed);
        }
    }

    /// Whether the pipeline skips this stage.
    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Enables or disables the stage.
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Whether the stage is removed after the task that ran it.
    #[must_use]
    pub fn transient(&self) -> bool {
        self.transient.load(Ordering::SeqCst)
    }

    /// Marks the stage transient.
    pub fn set_transient(&self, transient: bool) {
        self.transient.store(transient, Ordering::SeqCst);
    }

    /// Whether stdout is scanned for diagnostics.
    #[must_use]
    pub fn check_stdout(&self) -> bool {
        self.check_stdout.load(Ordering::SeqCst)
    }

    /// Enables diagnostics extraction from stdout.
    pub fn set_check_stdout(&self, check_stdout: bool) {
        self.check_stdout.store(check_stdout, Ordering::SeqCst);
    }

    /// Whether the stage's build is executing right now.
    #[must_use]
    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Claims the stage for one build. Returns false if already claimed.
    pub(crate) fn begin_run(&self) -> bool {
        !self.running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Human-readable status text.
    #[must_use]
    pub fn status(&self) -> Option<String> {
        self.status.read().clone()
    }

    /// Sets the status text.
    pub fn set_status(&self, status: Option<String>) {
        *self.status.write() = status;
    }

    /// Writes a line to the stage log.
    pub fn log(&self, stream: LogStream, line: &str) {
        let observer = self.observer.read().clone();
        match observer {
            Some(observer) => observer(self, stream, line),
            None => trace!(stage = %self.name(), %stream, "{}", line),
        }
    }

    pub(crate) fn set_observer(&self, observer: Option<StageLogObserver>) {
        *self.observer.write() = observer;
    }

    /// Mirrors this stage's completed flag onto `other` until cleared.
    pub(crate) fn bind_completed(&self, other: &Arc<Self>) {
        self.bindings.lock().push(Arc::downgrade(other));
    }

    pub(crate) fn clear_bindings(&self) {
        self.bindings.lock().clear();
    }

    /// Holds the stage's build until a matching [`StageHandle::unpause`].
    pub fn pause(&self) {
        self.n_pause.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one [`StageHandle::pause`].
    pub fn unpause(&self) {
        let previous = self
            .n_pause
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.unpaused.notify_waiters();
        }
    }

    /// Whether the stage is paused.
    #[must_use]
    pub fn paused(&self) -> bool {
        self.n_pause.load(Ordering::SeqCst) > 0
    }

    pub(crate) async fn wait_unpaused(&self) {
        loop {
            let notified = self.unpaused.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.paused() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandle")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("priority", &self.priority)
            .field("name", &self.name())
            .field("completed", &self.completed())
            .field("disabled", &self.disabled())
            .field("transient", &self.transient())
            .finish_non_exhaustive()
    }
}
