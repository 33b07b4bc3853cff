//! Deferred deletion of build output.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::errors::{BuildError, BuildResult};

#[derive(Debug, Clone)]
enum Target {
    /// Everything below the directory; the directory itself stays.
    Directory(PathBuf),
    File(PathBuf),
}

/// Collects paths to delete, then deletes them off the async runtime.
///
/// Only entries last modified at least `min_age` ago are removed. Symlinks
/// are removed without following them.
#[derive(Debug, Clone, Default)]
pub struct DirectoryReaper {
    targets: Vec<(Target, Duration)>,
}

impl DirectoryReaper {
    /// Creates an empty reaper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the contents of `dir`.
    pub fn add_directory(&mut self, dir: impl Into<PathBuf>, min_age: Duration) {
        self.targets.push((Target::Directory(dir.into()), min_age));
    }

    /// Queues a single file.
    pub fn add_file(&mut self, file: impl Into<PathBuf>, min_age: Duration) {
        self.targets.push((Target::File(file.into()), min_age));
    }

    /// Number of queued paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Deletes everything queued. `on_remove` sees each deleted path.
    pub async fn execute<F>(self, cancel: Arc<CancellationToken>, on_remove: F) -> BuildResult<()>
    where
        F: Fn(&Path) + Send + Sync + 'static,
    {
        let handle = tokio::task::spawn_blocking(move || self.execute_blocking(&cancel, &on_remove));
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(BuildError::cancelled(format!("reaper task failed: {err}"))),
        }
    }

    fn execute_blocking(&self, cancel: &CancellationToken, on_remove: &dyn Fn(&Path)) -> BuildResult<()> {
        let now = SystemTime::now();

        for (target, min_age) in &self.targets {
            check_cancelled(cancel)?;
            let result = match target {
                Target::Directory(dir) => remove_children(dir, *min_age, now, cancel, on_remove),
                Target::File(file) => remove_entry(file, *min_age, now, on_remove),
            };
            match result {
                Err(BuildError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
                other => other?,
            }
        }

        Ok(())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> BuildResult<()> {
    if cancel.is_cancelled() {
        Err(BuildError::cancelled(
            cancel.reason().unwrap_or_else(|| "reaper cancelled".to_string()),
        ))
    } else {
        Ok(())
    }
}

fn old_enough(metadata: &fs::Metadata, min_age: Duration, now: SystemTime) -> bool {
    if min_age.is_zero() {
        return true;
    }
    metadata
        .modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age >= min_age)
}

fn remove_children(
    dir: &Path,
    min_age: Duration,
    now: SystemTime,
    cancel: &CancellationToken,
    on_remove: &dyn Fn(&Path),
) -> BuildResult<()> {
    for child in fs::read_dir(dir)? {
        check_cancelled(cancel)?;
        let path = child?.path();
        match remove_entry(&path, min_age, now, on_remove) {
            Err(BuildError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {}
            other => other?,
        }
    }
    Ok(())
}

fn remove_entry(
    path: &Path,
    min_age: Duration,
    now: SystemTime,
    on_remove: &dyn Fn(&Path),
) -> BuildResult<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !old_enough(&metadata, min_age, now) {
        debug!(path = %path.display(), "Skipping recently modified path");
        return Ok(());
    }

    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    on_remove(path);
    Ok(())
}

/// Decides whether a rebuild may wipe `builddir`.
///
/// Directories under the cache root are always fair game. Otherwise only
/// the conventional in-tree `_build` directory qualifies, and only when it
/// is a real directory rather than a symlink.
#[must_use]
pub fn can_remove_builddir(builddir: &Path, cache_dir: &Path, srcdir: &Path) -> bool {
    if builddir.components().any(|c| c == Component::ParentDir) {
        warn!(builddir = %builddir.display(), "Refusing to reap a path with parent components");
        return false;
    }

    if builddir.starts_with(cache_dir) {
        return true;
    }

    builddir == srcdir.join("_build")
        && fs::symlink_metadata(builddir).is_ok_and(|m| m.file_type().is_dir())
}
