//! Child spawn strategies.
//!
//! The supervisor only sees byte streams, so tests can substitute in-memory
//! pipes for a real process.

use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::ChildCommand;

pub type ChildStdinWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type ChildOutputReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// I/O handles of a freshly spawned child.
pub struct SpawnedChild {
    pub stdin: ChildStdinWriter,
    pub stdout: ChildOutputReader,
    /// Diagnostics only, never parsed as protocol data.
    pub stderr: Option<ChildOutputReader>,
    /// OS process, when there is one. Dropping it kills the child.
    pub process: Option<Child>,
}

impl SpawnedChild {
    /// Wrap a process spawned with piped stdin/stdout (stderr optional).
    pub fn from_process(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::pin(s) as ChildOutputReader);

        Ok(Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr,
            process: Some(child),
        })
    }

    /// Wrap a pair of pipes with no process behind them.
    pub fn from_pipes(
        stdin: impl AsyncWrite + Send + 'static,
        stdout: impl AsyncRead + Send + 'static,
    ) -> Self {
        Self {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: None,
            process: None,
        }
    }

    pub fn with_stderr(mut self, stderr: impl AsyncRead + Send + 'static) -> Self {
        self.stderr = Some(Box::pin(stderr));
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }
}

/// Extension point for different child spawn strategies.
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedChild, SpawnError>;
}

/// Spawns the configured command with piped stdio.
pub struct CommandSpawner {
    command: ChildCommand,
}

impl CommandSpawner {
    pub fn new(command: ChildCommand) -> Self {
        Self { command }
    }
}

impl ChildSpawner for CommandSpawner {
    fn spawn(&self) -> Result<SpawnedChild, SpawnError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.command.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        SpawnedChild::from_process(child)
    }
}
