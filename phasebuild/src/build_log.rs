//! Fan-out of stage output to registered observers.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives every line written to a build log.
pub type LogObserver = Arc<dyn Fn(LogStream, &str) + Send + Sync>;

/// Distributes log lines to observers.
#[derive(Default)]
pub struct BuildLog {
    observers: RwLock<Vec<(u32, LogObserver)>>,
    next_id: AtomicU32,
}

impl BuildLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and returns its id.
    pub fn add_observer<F>(&self, observer: F) -> u32
    where
        F: Fn(LogStream, &str) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.observers.write().push((id, Arc::new(observer)));
        id
    }

    /// Removes an observer. Returns false if the id was unknown.
    pub fn remove_observer(&self, id: u32) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Sends a line to every observer.
    pub fn observe(&self, stream: LogStream, line: &str) {
        // Clone the list so observers may register or remove observers.
        let observers: Vec<LogObserver> =
            self.observers.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            observer(stream, line);
        }
    }

    /// Number of registered observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildLog")
            .field("observers", &self.observer_count())
            .finish()
    }
}
