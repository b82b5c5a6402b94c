//! Remote command channel.
//!
//! Runs a command (optionally fed a script on stdin) on a remote machine and
//! returns its output and exit status. The production implementation shells
//! out to the OpenSSH client; password authentication goes through `sshpass`.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status OpenSSH reports when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// OpenSSH's message when the remote end dropped an established session.
const CLOSED_BY_REMOTE: &str = "closed by remote host";

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by a remote command channel.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The local client program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The channel could not be opened.
    #[error("connection to {target} failed: {message}")]
    ConnectionFailed { target: String, message: String },

    /// The command did not finish in time.
    #[error("command on {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// Local I/O while talking to the client program.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Machine and account a command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// How the channel authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    Key(PathBuf),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(..)"),
            Credential::Key(path) => f.debug_tuple("Key").field(path).finish(),
        }
    }
}

/// A command to run, with an optional script piped to its stdin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub stdin: Option<String>,
}

impl CommandRequest {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }

    /// Run `bash -s` with `script` on stdin.
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            command: "bash -s".to_string(),
            stdin: Some(script.into()),
        }
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, absent when the remote side was terminated by a signal
    /// or closed the session before reporting one.
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Remote command channel.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a channel to `target`, run `request`, and collect its output.
    ///
    /// Errors mean the channel could not be used; a remote command that ran
    /// and failed is reported through [`CommandOutput::exit_status`].
    async fn run(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        request: &CommandRequest,
    ) -> RemoteResult<CommandOutput>;
}

/// [`RemoteShell`] backed by the OpenSSH client.
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    ssh_binary: String,
    sshpass_binary: String,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
}

impl Default for OpenSshShell {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }
}

impl OpenSshShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(mut self, ssh: impl Into<String>, sshpass: impl Into<String>) -> Self {
        self.ssh_binary = ssh.into();
        self.sshpass_binary = sshpass.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound the whole command, not just the connection. The local client is
    /// killed when the bound is hit.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Arguments passed to `ssh` for one command.
    pub fn ssh_args(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        command: &str,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        match credential {
            Credential::Password(_) => {
                args.extend(
                    [
                        "-o",
                        "PreferredAuthentications=password,keyboard-interactive",
                        "-o",
                        "PubkeyAuthentication=no",
                        "-o",
                        "NumberOfPasswordPrompts=1",
                    ]
                    .map(String::from),
                );
            }
            Credential::Key(path) => {
                args.extend(
                    ["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-i"].map(String::from),
                );
                args.push(path.to_string_lossy().to_string());
            }
        }

        args.push(format!("{}@{}", target.user, target.host));
        args.push(command.to_string());
        args
    }

    fn build_command(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        request: &CommandRequest,
    ) -> (String, Command) {
        let args = self.ssh_args(target, credential, &request.command);
        let (program, mut cmd) = match credential {
            Credential::Password(password) => {
                let mut cmd = Command::new(&self.sshpass_binary);
                cmd.arg("-e").arg(&self.ssh_binary).env("SSHPASS", password);
                (self.sshpass_binary.clone(), cmd)
            }
            Credential::Key(_) => (self.ssh_binary.clone(), Command::new(&self.ssh_binary)),
        };

        cmd.args(&args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        (program, cmd)
    }

    async fn execute(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        request: &CommandRequest,
    ) -> RemoteResult<CommandOutput> {
        let (program, mut cmd) = self.build_command(target, credential, request);
        debug!("Running on {}: {}", target, request.command);

        let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let Some(script) = &request.stdin
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_status: output.status.code(),
        };

        if result.exit_status == Some(SSH_CONNECTION_FAILURE) {
            if result.stderr.contains(CLOSED_BY_REMOTE) {
                debug!("Session on {} closed by the remote side", target);
                return Ok(CommandOutput {
                    exit_status: None,
                    ..result
                });
            }
            return Err(RemoteError::ConnectionFailed {
                target: target.to_string(),
                message: result.stderr.trim().to_string(),
            });
        }

        Ok(result)
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn run(
        &self,
        target: &RemoteTarget,
        credential: &Credential,
        request: &CommandRequest,
    ) -> RemoteResult<CommandOutput> {
        match self.command_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.execute(target, credential, request))
                .await
                .map_err(|_| RemoteError::Timeout {
                    target: target.to_string(),
                    timeout,
                })?,
            None => self.execute(target, credential, request).await,
        }
    }
}

/// Write an executable shell script standing in for a client program.
#[cfg(test)]
pub(crate) fn write_stub_client(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
