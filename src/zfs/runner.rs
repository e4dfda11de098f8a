//! Process runner seam.
//!
//! `CommandRunner` covers both one-shot command execution and long-lived
//! piped subprocesses (the send/receive sides of a transfer pipeline).
//! `SystemRunner` executes for real; tests inject a scripted fake.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::warn;

use crate::error::{Result, ZmigrateError};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Handle to a running piped subprocess.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for exit, draining stderr into the result.
    async fn wait(&mut self) -> Result<CommandOutput>;

    /// Terminate the whole process group; SIGTERM with a SIGKILL fallback.
    async fn terminate(&mut self);
}

/// A spawned transfer-side process with its piped ends.
pub struct TransferProcess {
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub handle: Box<dyn ProcessHandle>,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing stdout/stderr/exit code.
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Spawn with piped stdio for streaming. `want_stdin` selects whether
    /// the child reads the stream (receive) or produces it (send).
    async fn spawn(&self, argv: &[String], want_stdin: bool) -> Result<TransferProcess>;
}

/// Runs commands on the host.
#[derive(Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ZmigrateError::Validation("empty command line".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        // Children get their own process group so cancellation can take
        // down the entire pipeline, not just the direct child.
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let output = Self::command(argv)?
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }

    async fn spawn(&self, argv: &[String], want_stdin: bool) -> Result<TransferProcess> {
        let mut cmd = Self::command(argv)?;
        cmd.stderr(Stdio::piped());
        if want_stdin {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::null());
        } else {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().map(|id| id as i32).unwrap_or(-1);

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);

        Ok(TransferProcess {
            stdout,
            stdin,
            handle: Box::new(SystemProcess { child, pid }),
        })
    }
}

struct SystemProcess {
    child: Child,
    pid: i32,
}

#[async_trait]
impl ProcessHandle for SystemProcess {
    async fn wait(&mut self) -> Result<CommandOutput> {
        let mut stderr = String::new();
        if let Some(mut pipe) = self.child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        let status = self.child.wait().await?;
        Ok(CommandOutput {
            stdout: String::new(),
            stderr,
            code: status.code().unwrap_or(-1),
        })
    }

    async fn terminate(&mut self) {
        #[cfg(unix)]
        if self.pid > 0 {
            unsafe {
                libc::killpg(self.pid, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(pid = self.pid, "Process group ignored SIGTERM, killing");
                #[cfg(unix)]
                if self.pid > 0 {
                    unsafe {
                        libc::killpg(self.pid, libc::SIGKILL);
                    }
                }
                let _ = self.child.kill().await;
            }
        }
    }
}
