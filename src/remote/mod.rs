// src/remote/mod.rs

//! Remote execution over ssh.
//!
//! Everything the scheduler does on a host (probing capacity, checking
//! liveness, launching workers) is a shell command sent through a
//! [`RemoteShell`]. Production uses [`SshShell`]; tests plug in a scripted
//! fake that never touches the network.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub mod dispatch;
pub mod liveness;
pub mod probe;

pub use dispatch::Dispatcher;
pub use liveness::{LivenessCheck, LivenessVerifier};
pub use probe::{Host, HostProbe};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Captured result of a remote command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stdout with NUL bytes dropped.
    pub fn stdout_trimmed(&self) -> String {
        self.stdout.replace('\0', "").trim().to_string()
    }
}

/// Transport-level failure. Never fatal: callers map it to a safe default.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to start remote command on {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote command on {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// Runs shell commands on named hosts.
pub trait RemoteShell: Send + Sync + Debug {
    /// Run `command` on `host` and wait for it, at most `timeout`.
    fn run<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RemoteOutput, RemoteError>>;

    /// Start `command` on `host` without waiting for it to finish.
    ///
    /// Success only means the local transport process started.
    fn launch<'a>(&'a self, host: &'a str, command: &'a str)
    -> BoxFuture<'a, Result<(), RemoteError>>;
}

/// `RemoteShell` backed by the local `ssh` binary.
///
/// Authentication is left to the environment (keys, agent, ssh config);
/// `BatchMode` makes a missing key fail fast instead of prompting.
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
    options: Vec<String>,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
        }
    }
}

impl SshShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different transport binary. The binary is invoked as
    /// `<program> <options..> <host> <command>`.
    pub fn with_program(program: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    fn command(&self, host: &str, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.options).arg(host).arg(command);
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl RemoteShell for SshShell {
    fn run<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RemoteOutput, RemoteError>> {
        Box::pin(async move {
            let mut cmd = self.command(host, command);
            cmd.stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            debug!(host = %host, cmd = %command, "running remote command");

            let output = match tokio::time::timeout(timeout, cmd.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(source)) => {
                    return Err(RemoteError::Spawn {
                        host: host.to_string(),
                        source,
                    });
                }
                Err(_) => {
                    return Err(RemoteError::Timeout {
                        host: host.to_string(),
                        timeout,
                    });
                }
            };

            Ok(RemoteOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn launch<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let mut cmd = self.command(host, command);
            cmd.stdout(Stdio::null()).stderr(Stdio::piped());

            let child = cmd.spawn().map_err(|source| RemoteError::Spawn {
                host: host.to_string(),
                source,
            })?;

            // Reap the transport process in the background so it never
            // lingers as a zombie; its outcome is only logged.
            let host = host.to_string();
            tokio::spawn(async move {
                match child.wait_with_output().await {
                    Ok(out) if out.status.success() => {
                        debug!(host = %host, "launcher exited cleanly");
                    }
                    Ok(out) => {
                        let stderr = String::from_utf8_lossy(&out.stderr);
                        warn!(
                            host = %host,
                            code = ?out.status.code(),
                            stderr = %truncate(stderr.trim(), 200),
                            "launcher exited with failure"
                        );
                    }
                    Err(err) => {
                        warn!(host = %host, error = %err, "failed to wait for launcher");
                    }
                }
            });

            Ok(())
        })
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shorten `s` to at most `max` characters for log output.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}
