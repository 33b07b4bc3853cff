//! Pipeline configuration.
//!
//! Configurations are plain serde structs and load from TOML or JSON:
//!
//! ```toml
//! id = "debug"
//! srcdir = "/home/me/project"
//! build_commands = ["make -j8"]
//! post_install_commands = ["./scripts/post-install.sh"]
//!
//! [environment]
//! CFLAGS = "-O0 -g"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{BuildError, BuildResult};

/// Everything a pipeline needs to know about the configuration it builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Configuration id; names the default build directory.
    #[serde(default = "default_id")]
    pub id: String,
    /// Project source directory.
    #[serde(default = "default_srcdir")]
    pub srcdir: PathBuf,
    /// Explicit build directory. Relative paths resolve against `srcdir`.
    #[serde(default)]
    pub builddir: Option<PathBuf>,
    /// Cache root holding generated build directories.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Shell commands run after the build phase.
    #[serde(default)]
    pub build_commands: Vec<String>,
    /// Working directory for `build_commands`; the build directory if unset.
    #[serde(default)]
    pub build_commands_dir: Option<PathBuf>,
    /// Shell commands run after the install phase.
    #[serde(default)]
    pub post_install_commands: Vec<String>,
    /// Extra environment for every command.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Directories searched before `PATH`.
    #[serde(default)]
    pub prepend_path: Vec<PathBuf>,
    /// Directories searched after `PATH`.
    #[serde(default)]
    pub append_path: Vec<PathBuf>,
    /// Whether the configuration is complete enough to build.
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_id() -> String {
    "default".to_string()
}

fn default_srcdir() -> PathBuf {
    PathBuf::from(".")
}

const fn default_ready() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            srcdir: default_srcdir(),
            builddir: None,
            cache_dir: None,
            build_commands: Vec::new(),
            build_commands_dir: None,
            post_install_commands: Vec::new(),
            environment: BTreeMap::new(),
            prepend_path: Vec::new(),
            append_path: Vec::new(),
            ready: default_ready(),
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration for the project at `srcdir`.
    #[must_use]
    pub fn new(id: impl Into<String>, srcdir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            srcdir: srcdir.into(),
            ..Self::default()
        }
    }

    /// Sets the build directory.
    #[must_use]
    pub fn with_builddir(mut self, builddir: impl Into<PathBuf>) -> Self {
        self.builddir = Some(builddir.into());
        self
    }

    /// Sets the cache directory.
    #[must_use]
    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Adds a build command.
    #[must_use]
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_commands.push(command.into());
        self
    }

    /// Adds a post-install command.
    #[must_use]
    pub fn with_post_install_command(mut self, command: impl Into<String>) -> Self {
        self.post_install_commands.push(command.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Marks the configuration ready or not.
    #[must_use]
    pub const fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// Parses TOML.
    pub fn from_toml_str(text: &str) -> BuildResult<Self> {
        toml::from_str(text).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// Parses JSON.
    pub fn from_json_str(text: &str) -> BuildResult<Self> {
        serde_json::from_str(text).map_err(|e| BuildError::Config(e.to_string()))
    }

    /// Loads a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> BuildResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// The cache root, defaulting to the user cache directory.
    #[must_use]
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir().map_or_else(
                || self.srcdir.join(".cache").join("phasebuild"),
                |dir| dir.join("phasebuild"),
            )
        })
    }

    /// The build directory, defaulting to `<cache>/builds/<id>`.
    #[must_use]
    pub fn resolved_builddir(&self) -> PathBuf {
        match &self.builddir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.srcdir.join(dir),
            None => self.resolved_cache_dir().join("builds").join(&self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_toml_defaults() {
        let config = PipelineConfig::from_toml_str("srcdir = \"/src\"").unwrap();
        assert_eq!(config.id, "default");
        assert!(config.ready);
        assert!(config.build_commands.is_empty());
    }

    #[test]
    fn test_toml_full() {
        let config = PipelineConfig::from_toml_str(
            r#"
            id = "debug"
            srcdir = "/src"
            builddir = "_build"
            build_commands = ["make"]
            post_install_commands = ["true"]
            ready = false

            [environment]
            CFLAGS = "-O0"
            "#,
        )
        .unwrap();

        assert_eq!(config.id, "debug");
        assert_eq!(config.resolved_builddir(), PathBuf::from("/src/_build"));
        assert_eq!(config.environment.get("CFLAGS").map(String::as_str), Some("-O0"));
        assert!(!config.ready);
    }

    #[test]
    fn test_default_builddir_lives_in_cache() {
        let config = PipelineConfig::new("release", "/src").with_cache_dir("/cache");
        assert_eq!(
            config.resolved_builddir(),
            PathBuf::from("/cache/builds/release")
        );
    }

    #[test]
    fn test_json_and_errors() {
        let config = PipelineConfig::from_json_str(r#"{"id": "j", "srcdir": "/s"}"#).unwrap();
        assert_eq!(config.id, "j");
        assert!(matches!(
            PipelineConfig::from_toml_str("ready = 3"),
            Err(BuildError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.toml");
        std::fs::write(&path, "id = \"file\"\nsrcdir = \"/s\"\n").unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap().id, "file");
    }
}
