//! A stage that runs a subprocess.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use super::{Stage, StageContext, StageHandle};
use crate::build_log::LogStream;
use crate::errors::{BuildError, BuildResult};
use crate::runtime::RunCommand;

/// Runs a command as its build and, optionally, another as its clean.
///
/// Output is forwarded line by line to the stage log, where the pipeline
/// scans it for diagnostics.
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: String,
    build_command: RunCommand,
    clean_command: Option<RunCommand>,
    ignore_exit_status: bool,
    always_run: bool,
    check_stdout: bool,
}

impl CommandStage {
    /// Creates a stage running `build_command`.
    #[must_use]
    pub fn new(name: impl Into<String>, build_command: RunCommand) -> Self {
        Self {
            name: name.into(),
            build_command,
            clean_command: None,
            ignore_exit_status: false,
            always_run: false,
            check_stdout: false,
        }
    }

    /// Creates a stage running a shell script.
    #[must_use]
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, RunCommand::shell(script))
    }

    /// Sets the command run on clean.
    #[must_use]
    pub fn with_clean_command(mut self, command: RunCommand) -> Self {
        self.clean_command = Some(command);
        self
    }

    /// Treats a non-zero exit as success.
    #[must_use]
    pub const fn with_ignore_exit_status(mut self, ignore: bool) -> Self {
        self.ignore_exit_status = ignore;
        self
    }

    /// Reruns the command on every build, even when completed.
    #[must_use]
    pub const fn with_always_run(mut self, always_run: bool) -> Self {
        self.always_run = always_run;
        self
    }

    /// Scans stdout as well as stderr for diagnostics.
    #[must_use]
    pub const fn with_check_stdout(mut self, check_stdout: bool) -> Self {
        self.check_stdout = check_stdout;
        self
    }

    /// The build command.
    #[must_use]
    pub const fn build_command(&self) -> &RunCommand {
        &self.build_command
    }

    async fn run(&self, ctx: &StageContext, command: &RunCommand) -> BuildResult<()> {
        ctx.check_cancelled()?;

        let command = ctx.prepare_command(command.clone());
        debug!(stage = %self.name, argv = ?command.argv, "Spawning build command");

        let mut child = command.to_command()?.spawn()?;
        let stdout = child.stdout.take().map(|s| forward_lines(ctx.handle(), LogStream::Stdout, s));
        let stderr = child.stderr.take().map(|s| forward_lines(ctx.handle(), LogStream::Stderr, s));

        let status = tokio::select! {
            status = child.wait() => status?,
            () = ctx.cancel_token().cancelled() => {
                let _ = child.kill().await;
                return Err(BuildError::cancelled(format!("{} was cancelled", self.name)));
            }
        };

        // Drain both pipes so every line reaches the log before we return.
        for task in [stdout, stderr].into_iter().flatten() {
            let _ = task.await;
        }

        if status.success() || self.ignore_exit_status {
            Ok(())
        } else {
            Err(BuildError::stage_failed(
                &self.name,
                format!("command exited with {status}"),
            ))
        }
    }
}

fn forward_lines<R>(
    handle: &Arc<StageHandle>,
    stream: LogStream,
    reader: R,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let handle = handle.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Compiler output is not always UTF-8.
                    let line = String::from_utf8_lossy(&buf);
                    handle.log(stream, line.trim_end_matches(['\n', '\r']));
                }
                Err(err) => {
                    debug!(stage = %handle.name(), %stream, error = %err, "Stopped reading output");
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, ctx: &StageContext) -> BuildResult<()> {
        self.run(ctx, &self.build_command).await
    }

    async fn clean(&self, ctx: &StageContext) -> BuildResult<()> {
        if let Some(command) = &self.clean_command {
            self.run(ctx, command).await?;
        }
        ctx.set_completed(false);
        Ok(())
    }

    fn has_query(&self) -> bool {
        self.always_run
    }

    async fn query(&self, ctx: &StageContext) -> BuildResult<()> {
        if self.always_run {
            ctx.set_completed(false);
        }
        Ok(())
    }

    fn checks_stdout(&self) -> bool {
        self.check_stdout
    }
}
