//! Side-effect boundary for tools.
//!
//! Tools never touch the host directly; they go through a [`Runtime`].
//! Errors surface as the tool's textual result, so runtime failures reach
//! the model instead of aborting the turn.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory; defaults to the runtime's `cwd`.
    pub cwd: Option<PathBuf>,
    /// Deadline for the command, enforced by the runtime.
    pub timeout: Option<Duration>,
    /// Aborts the command when cancelled.
    pub cancel: Option<CancellationToken>,
}

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Default working directory for commands and relative paths.
    fn cwd(&self) -> &Path;

    async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecOutput>;

    async fn read_file(&self, path: &str) -> Result<String>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;
}

/// Default runtime: `sh -c` on the local host, file IO under `cwd`.
pub struct LocalRuntime {
    cwd: PathBuf,
}

impl LocalRuntime {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }

    /// A runtime rooted at the process working directory.
    pub fn current_dir() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let requested = Path::new(path);
        if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.cwd.join(requested)
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn cwd(&self) -> &Path {
        &self.cwd
    }

    async fn exec(&self, command: &str, opts: ExecOptions) -> Result<ExecOutput> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(opts.cwd.as_deref().unwrap_or(&self.cwd))
            // Signal to programs that we are a non-interactive, dumb
            // terminal; suppresses ANSI sequences and progress bars in
            // well-behaved CLI tools.
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn command '{command}'"))?;

        let cancel = opts.cancel.unwrap_or_default();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = match opts.timeout {
            Some(timeout) => tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("command cancelled"),
                result = tokio::time::timeout(timeout, &mut wait) => match result {
                    Ok(output) => output,
                    Err(_) => bail!("command timed out after {}s", timeout.as_secs()),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => bail!("command cancelled"),
                output = &mut wait => output,
            },
        }
        .with_context(|| format!("failed to run command '{command}'"))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let path = self.resolve(path);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let path = self.resolve(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
