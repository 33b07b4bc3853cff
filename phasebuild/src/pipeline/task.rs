//! Queued work and the handles callers await.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::core::Phase;
use crate::errors::{BuildError, BuildResult};
use crate::stages::StageHandle;

/// What a task does when it reaches the front of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Run stages up to a phase.
    Build,
    /// Run stage clean hooks in reverse order.
    Clean,
    /// Delete build output, reset every stage, then optionally build.
    Rebuild,
}

/// A queued request.
#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) id: Uuid,
    pub(crate) kind: TaskKind,
    pub(crate) phase: Option<Phase>,
    pub(crate) targets: Option<Vec<String>>,
    pub(crate) cancel: Arc<CancellationToken>,
    /// Snapshot taken at request time, in registry order.
    pub(crate) clean_stages: Vec<Arc<StageHandle>>,
    responder: Option<oneshot::Sender<BuildResult<()>>>,
}

impl Task {
    pub(crate) fn new(
        kind: TaskKind,
        phase: Option<Phase>,
        cancel: Arc<CancellationToken>,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::now_v7();
        let task = Self {
            id,
            kind,
            phase,
            targets: None,
            cancel,
            clean_stages: Vec::new(),
            responder: Some(tx),
        };
        let handle = TaskHandle {
            id,
            kind,
            phase,
            rx: Receiver::Pending(rx),
        };
        (task, handle)
    }

    /// Resolves the task. Later calls do nothing.
    pub(crate) fn complete(&mut self, result: BuildResult<()>) {
        if let Some(tx) = self.responder.take() {
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        }
    }

    pub(crate) const fn is_completed(&self) -> bool {
        self.responder.is_none()
    }
}

#[derive(Debug)]
enum Receiver {
    Pending(oneshot::Receiver<BuildResult<()>>),
    Ready(Option<BuildResult<()>>),
}

/// Resolves when the pipeline finishes a request.
///
/// Dropping the handle does not cancel the request.
#[derive(Debug)]
#[must_use = "a task handle does nothing unless awaited"]
pub struct TaskHandle {
    id: Uuid,
    kind: TaskKind,
    phase: Option<Phase>,
    rx: Receiver,
}

impl TaskHandle {
    /// A handle that resolves without queueing anything.
    pub(crate) fn ready(kind: TaskKind, phase: Option<Phase>, result: BuildResult<()>) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            phase,
            rx: Receiver::Ready(Some(result)),
        }
    }

    /// Task id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Task kind.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Requested phase, if any.
    #[must_use]
    pub const fn phase(&self) -> Option<Phase> {
        self.phase
    }
}

impl Future for TaskHandle {
    type Output = BuildResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.rx {
            Receiver::Pending(rx) => Pin::new(rx).poll(cx).map(|result| {
                result.unwrap_or_else(|_| Err(BuildError::cancelled("the pipeline was dropped")))
            }),
            Receiver::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(BuildError::cancelled("task handle polled after completion"))),
            ),
        }
    }
}
