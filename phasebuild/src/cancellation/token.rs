//! Cancellation token for cooperative cancellation.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

/// Identifies a callback registered with [`CancellationToken::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent - only the first cancellation reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    /// Whether cancellation has been requested.
    cancelled: AtomicBool,
    /// The reason for cancellation (first one wins).
    reason: RwLock<Option<String>>,
    /// Callbacks to invoke on cancellation.
    callbacks: RwLock<Vec<(CallbackId, CancelCallback)>>,
    next_callback: AtomicU64,
    /// Registrations this token holds on its parents, dropped with it.
    parents: Mutex<Vec<(Weak<Self>, CallbackId)>>,
    /// Wakes tasks parked in [`CancellationToken::cancelled`].
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled as soon as any parent is.
    ///
    /// Parents only hold a weak reference to the child. Dropping the child
    /// removes its callbacks from every parent, so a long-lived parent does
    /// not accumulate one entry per child.
    #[must_use]
    pub fn chained(parents: &[&Arc<Self>]) -> Arc<Self> {
        let child = Arc::new(Self::new());

        for parent in parents {
            let weak_child: Weak<Self> = Arc::downgrade(&child);
            let weak_parent: Weak<Self> = Arc::downgrade(parent);
            let registered = parent.on_cancel(move || {
                if let Some(child) = weak_child.upgrade() {
                    let reason = weak_parent
                        .upgrade()
                        .and_then(|p| p.reason())
                        .unwrap_or_else(|| "parent cancelled".to_string());
                    child.cancel(reason);
                }
            });
            if let Some(id) = registered {
                child.parents.lock().push((Arc::downgrade(parent), id));
            }
        }

        child
    }

    /// Requests cancellation with a reason.
    ///
    /// This is idempotent - only the first reason is kept.
    /// Callbacks are invoked immediately. Panics in callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        // Only set if not already cancelled (first reason wins)
        if self.cancelled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            *self.reason.write() = Some(reason.into());

            let callbacks = std::mem::take(&mut *self.callbacks.write());
            for (_, callback) in &callbacks {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!("Cancellation callback panicked: {:?}", e);
                }
            }

            self.notify.notify_waiters();
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately and `None`
    /// is returned. Otherwise the returned id can be passed to
    /// [`CancellationToken::remove_callback`].
    pub fn on_cancel<F>(&self, callback: F) -> Option<CallbackId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback();
            })) {
                warn!("Cancellation callback panicked: {:?}", e);
            }
            None
        } else {
            let id = CallbackId(self.next_callback.fetch_add(1, Ordering::SeqCst));
            self.callbacks.write().push((id, Box::new(callback)));
            Some(id)
        }
    }

    /// Unregisters a callback. Returns false if it already ran or was removed.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    /// Number of callbacks waiting for cancellation.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for CancellationToken {
    fn drop(&mut self) {
        for (parent, id) in self.parents.get_mut().drain(..) {
            if let Some(parent) = parent.upgrade() {
                parent.remove_callback(id);
            }
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("callbacks", &self.callback_count())
            .finish()
    }
}
