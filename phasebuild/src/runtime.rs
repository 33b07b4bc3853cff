//! Runtimes, toolchains and the environment subprocesses run in.
//!
//! A [`Runtime`] is the environment the project builds inside (the host,
//! a container, an SDK). A [`Toolchain`] is the compiler set used for a
//! target architecture. Both contribute to a [`RunContext`], which turns a
//! [`RunCommand`] into a spawnable process.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::errors::{BuildError, BuildResult};

/// A program invocation before any environment is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory, if the command needs a specific one.
    pub cwd: Option<PathBuf>,
    /// Variables set for this command only.
    pub env: BTreeMap<String, String>,
}

impl RunCommand {
    /// Creates a command for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            ..Self::default()
        }
    }

    /// Creates a command from a full argument vector.
    #[must_use]
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Creates `sh -c <script>`.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_argv(["/bin/sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The program name, if any.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Builds a process with piped stdout and stderr.
    pub fn to_command(&self) -> BuildResult<tokio::process::Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| BuildError::Config("empty command line".to_string()))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        Ok(command)
    }
}

/// Accumulated environment for commands a pipeline spawns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    prepend_path: Vec<PathBuf>,
    append_path: Vec<PathBuf>,
}

impl RunContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default working directory.
    pub fn set_cwd(&mut self, cwd: impl Into<PathBuf>) {
        self.cwd = Some(cwd.into());
    }

    /// The default working directory.
    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Sets a variable.
    pub fn setenv(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Reads a variable set on this context.
    #[must_use]
    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Adds a directory searched before `PATH`.
    pub fn prepend_path(&mut self, dir: impl Into<PathBuf>) {
        self.prepend_path.push(dir.into());
    }

    /// Adds a directory searched after `PATH`.
    pub fn append_path(&mut self, dir: impl Into<PathBuf>) {
        self.append_path.push(dir.into());
    }

    /// The search path this context produces on top of `base`.
    #[must_use]
    pub fn search_path(&self, base: Option<&str>) -> Option<OsString> {
        let base = self.getenv("PATH").or(base);
        if self.prepend_path.is_empty() && self.append_path.is_empty() {
            return base.map(OsString::from);
        }

        let dirs = self
            .prepend_path
            .iter()
            .cloned()
            .chain(base.into_iter().flat_map(|b| std::env::split_paths(b).collect::<Vec<_>>()))
            .chain(self.append_path.iter().cloned());
        std::env::join_paths(dirs).ok()
    }

    /// Applies the context to a command. Values set on the command win.
    #[must_use]
    pub fn apply(&self, mut command: RunCommand) -> RunCommand {
        if command.cwd.is_none() {
            command.cwd.clone_from(&self.cwd);
        }

        for (key, value) in &self.env {
            command.env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let inherited = std::env::var("PATH").ok();
        if !command.env.contains_key("PATH") {
            if let Some(path) = self.search_path(inherited.as_deref()) {
                command
                    .env
                    .insert("PATH".to_string(), path.to_string_lossy().into_owned());
            }
        }

        command
    }
}

/// The environment a project is built inside.
#[cfg_attr(test, mockall::automock)]
pub trait Runtime: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> String;

    /// Architecture the runtime produces binaries for.
    fn arch(&self) -> String;

    /// Returns true if `program` can be found inside the runtime.
    fn contains_program_in_path(&self, program: &str) -> bool;

    /// Adjusts a context before a build command runs.
    fn prepare_to_build(&self, ctx: &mut RunContext);
}

/// Builds directly on the host.
#[derive(Debug, Clone, Default)]
pub struct HostRuntime;

impl Runtime for HostRuntime {
    fn id(&self) -> String {
        "host".to_string()
    }

    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    fn contains_program_in_path(&self, program: &str) -> bool {
        find_in_path(program, std::env::var_os("PATH").as_deref()).is_some()
    }

    fn prepare_to_build(&self, _ctx: &mut RunContext) {}
}

/// Compilers and tools targeting one architecture.
pub trait Toolchain: Send + Sync + Debug {
    /// Stable identifier.
    fn id(&self) -> &str;

    /// Triplet of the machine the toolchain produces code for.
    fn host_triplet(&self) -> String;

    /// Returns true if the toolchain targets `arch`.
    fn supports_arch(&self, arch: &str) -> bool {
        self.host_triplet().split('-').next() == Some(arch)
    }

    /// Adds toolchain variables (`CC`, `CXX`, ...) to a context.
    fn prepare_run_context(&self, _ctx: &mut RunContext) {}
}

/// The host compilers.
#[derive(Debug, Clone, Default)]
pub struct DefaultToolchain;

impl Toolchain for DefaultToolchain {
    fn id(&self) -> &str {
        "default"
    }

    fn host_triplet(&self) -> String {
        crate::core::DeviceInfo::host().triplet()
    }
}

/// Searches `path` for an executable file named `program`.
#[must_use]
pub fn find_in_path(program: &str, path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        return candidate.is_file().then_some(candidate);
    }

    std::env::split_paths(path?)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
