//! Remote process launcher.
//!
//! One launcher exists per client session. It starts the notebook process on
//! an allocated machine, checks whether it is still alive, kills it, and can
//! be restored from persisted state after a restart.
//!
//! The launcher keeps a single [`ProcessRecord`]. Its process fields are set
//! together on a successful launch or restore and cleared together on a
//! confirmed kill or a failed liveness check.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::Endpoint;
use crate::remote::{CommandRequest, Credential, RemoteShell, RemoteTarget};

/// Errors that abort a launch before any attempt is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// An environment variable name cannot be exported by the shell.
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvKey(String),

    /// The control port of the machine is not a port number.
    #[error("invalid control port: {0:?}")]
    InvalidControlPort(String),
}

/// Which processes a kill targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillScope {
    /// Only the recorded process id.
    #[default]
    Process,
    /// Every process of the session's remote account.
    Account,
}

/// Launcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Command started on the machine; `--port <port>` is appended.
    pub launch_command: String,
    /// Private key used for every operational command.
    pub key_path: PathBuf,
    /// Placeholder password for the warm-up connection that provisions the account.
    pub warmup_password: String,
    /// Environment variable carrying the control URL.
    pub control_url_env: String,
    /// Log file in the remote home directory.
    pub log_file: String,
    /// Script sourced (with `run=true`) before the launch, if any.
    pub setup_script: Option<String>,
    /// Lowest port picked for the process.
    pub port_min: u16,
    /// Highest port picked for the process.
    pub port_max: u16,
    /// Launch attempts, each with a fresh port.
    pub max_attempts: u32,
    pub kill_scope: KillScope,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            launch_command: "jupyterhub-singleuser".to_string(),
            key_path: PathBuf::from("~/.ssh/id_rsa"),
            warmup_password: "password".to_string(),
            control_url_env: "JUPYTERHUB_API_URL".to_string(),
            log_file: ".jupyter.log".to_string(),
            setup_script: Some("initialSetup.sh".to_string()),
            port_min: 2000,
            port_max: 65535,
            max_attempts: 3,
            kill_scope: KillScope::Process,
        }
    }
}

/// Source of ports for launch attempts.
pub trait PortSelector: Send + Sync {
    fn next_port(&self) -> u16;
}

/// Uniformly random ports from an inclusive range.
#[derive(Debug, Clone)]
pub struct RandomPorts {
    min: u16,
    max: u16,
}

impl RandomPorts {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }
}

impl PortSelector for RandomPorts {
    fn next_port(&self) -> u16 {
        rand::rng().random_range(self.min..=self.max)
    }
}

/// A process known to be running on a remote machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveProcess {
    pub pid: u32,
    /// Port the process listens on.
    pub port: u16,
    pub remote_ip: String,
    /// Control (SSH) port of the machine.
    pub remote_control_port: u16,
}

/// The launcher's view of its remote process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    /// Remote account the process runs as.
    pub principal: String,
    pub active: Option<ActiveProcess>,
}

impl ProcessRecord {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            active: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.pid)
    }

    pub fn port(&self) -> Option<u16> {
        self.active.as_ref().map(|a| a.port)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
    }
}

/// Whether `key` is a valid shell variable name.
fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the bash script that starts the process on `port` and prints its pid.
pub fn launch_script(
    config: &LauncherConfig,
    environment: &BTreeMap<String, String>,
    port: u16,
) -> Result<String, LaunchError> {
    if let Some(key) = environment.keys().find(|k| !is_valid_env_key(k)) {
        return Err(LaunchError::InvalidEnvKey(key.clone()));
    }

    let log = shell_quote(&config.log_file);
    let mut lines = vec!["#!/bin/bash".to_string()];
    lines.extend(
        environment
            .iter()
            .map(|(key, value)| format!("export {}={}", key, shell_quote(value))),
    );
    lines.push("unset XDG_RUNTIME_DIR".to_string());
    lines.push(format!("touch {}", log));
    lines.push(format!("chmod 600 {}", log));
    if let Some(setup) = &config.setup_script {
        lines.push(format!("run=true source {} >> {}", shell_quote(setup), log));
    }
    lines.push(format!(
        "{} --port {} < /dev/null >> {} 2>&1 & pid=$!",
        config.launch_command, port, log
    ));
    lines.push("echo $pid".to_string());
    Ok(lines.join("\n"))
}

/// Launches and controls one session's remote process.
pub struct ProcessLauncher {
    shell: Arc<dyn RemoteShell>,
    ports: Arc<dyn PortSelector>,
    config: LauncherConfig,
    record: ProcessRecord,
}

impl std::fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("config", &self.config)
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl ProcessLauncher {
    pub fn new(
        principal: impl Into<String>,
        shell: Arc<dyn RemoteShell>,
        config: LauncherConfig,
    ) -> Self {
        let ports = Arc::new(RandomPorts::new(config.port_min, config.port_max));
        Self {
            shell,
            ports,
            config,
            record: ProcessRecord::new(principal),
        }
    }

    /// Replace the port source.
    pub fn with_port_selector(mut self, ports: Arc<dyn PortSelector>) -> Self {
        self.ports = ports;
        self
    }

    pub fn record(&self) -> &ProcessRecord {
        &self.record
    }

    pub fn principal(&self) -> &str {
        &self.record.principal
    }

    fn target(&self, host: &str, port: u16) -> RemoteTarget {
        RemoteTarget::new(host, port, self.record.principal.clone())
    }

    fn key(&self) -> Credential {
        Credential::Key(self.config.key_path.clone())
    }

    /// Log in once with the placeholder password so the machine provisions
    /// the account. Every outcome is ignored.
    async fn warm_up(&self, target: &RemoteTarget) {
        info!("Warm-up connection to {}", target);
        let credential = Credential::Password(self.config.warmup_password.clone());
        match self
            .shell
            .run(target, &credential, &CommandRequest::command("echo warmup"))
            .await
        {
            Ok(output) => debug!(
                "Warm-up on {} finished with status {:?}",
                target, output.exit_status
            ),
            Err(e) => info!(
                "Warm-up on {} failed (expected for a new account): {}",
                target, e
            ),
        }
    }

    /// Start the process on `host_ip`, returning `(port, pid)`.
    ///
    /// Retries with a fresh port up to the configured number of attempts.
    /// Returns `None` when every attempt failed; the record stays empty.
    pub async fn launch(
        &mut self,
        environment: &HashMap<String, String>,
        control_url: &str,
        host_ip: &str,
        host_control_port: &str,
    ) -> Option<(u16, u32)> {
        if let Some(active) = &self.record.active {
            warn!(
                "Launch refused for {}: process {} already recorded on {}",
                self.record.principal, active.pid, active.remote_ip
            );
            return None;
        }

        let control_port = match host_control_port.trim().parse::<u16>() {
            Ok(port) if port > 0 => port,
            _ => {
                warn!(
                    "Launch aborted: {}",
                    LaunchError::InvalidControlPort(host_control_port.to_string())
                );
                return None;
            }
        };

        let mut env: BTreeMap<String, String> = environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert(self.config.control_url_env.clone(), control_url.to_string());

        // Reject bad input before touching the machine; it would fail every attempt.
        if let Err(e) = launch_script(&self.config, &env, self.config.port_min) {
            warn!("Launch aborted: {}", e);
            return None;
        }

        let target = self.target(host_ip, control_port);
        self.warm_up(&target).await;

        let key = self.key();
        for attempt in 1..=self.config.max_attempts {
            let port = self.ports.next_port();
            info!("Attempt {}: launching on {} port {}", attempt, target, port);

            let script = match launch_script(&self.config, &env, port) {
                Ok(script) => script,
                Err(e) => {
                    warn!("Launch aborted: {}", e);
                    return None;
                }
            };

            let output = match self
                .shell
                .run(&target, &key, &CommandRequest::script(script))
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    info!("Attempt {}: channel error: {}. Retrying...", attempt, e);
                    continue;
                }
            };

            if !output.success() {
                let stderr = output.stderr.trim();
                info!(
                    "Attempt {}: launch on port {} exited with {:?}: {}. Retrying...",
                    attempt,
                    port,
                    output.exit_status,
                    if stderr.is_empty() { "no output" } else { stderr }
                );
                continue;
            }

            match output.stdout.trim().parse::<u32>() {
                Ok(pid) if pid > 0 => {
                    self.record.active = Some(ActiveProcess {
                        pid,
                        port,
                        remote_ip: host_ip.to_string(),
                        remote_control_port: control_port,
                    });
                    info!(
                        "Process launched on {} port {} with pid {}",
                        target, port, pid
                    );
                    return Some((port, pid));
                }
                _ => info!(
                    "Attempt {}: unexpected output {:?}. Retrying with a new port...",
                    attempt,
                    output.stdout.trim()
                ),
            }
        }

        error!(
            "All {} launch attempts on {} failed",
            self.config.max_attempts,
            target
        );
        None
    }

    /// Whether the recorded process still runs. A negative answer (including
    /// an unreachable machine) clears the record.
    pub async fn check_alive(&mut self) -> bool {
        let Some(active) = self.record.active.clone() else {
            debug!("No process recorded for {}", self.record.principal);
            return false;
        };

        let target = self.target(&active.remote_ip, active.remote_control_port);
        let request = CommandRequest::command(format!("kill -s 0 {} < /dev/null", active.pid));
        let alive = match self.shell.run(&target, &self.key(), &request).await {
            Ok(output) => {
                info!(
                    "Process {} on {} is {} (exit status {:?})",
                    active.pid,
                    target,
                    if output.success() { "alive" } else { "dead" },
                    output.exit_status
                );
                output.success()
            }
            Err(e) => {
                info!("Liveness check for {} on {} failed: {}", active.pid, target, e);
                false
            }
        };

        if !alive {
            self.record.active = None;
        }
        alive
    }

    /// Forcefully terminate the recorded process. The record is cleared only
    /// when the kill is confirmed.
    pub async fn kill(&mut self) -> bool {
        let Some(active) = self.record.active.clone() else {
            debug!("Nothing to kill for {}", self.record.principal);
            return false;
        };

        let target = self.target(&active.remote_ip, active.remote_control_port);
        let command = match self.config.kill_scope {
            KillScope::Process => format!("kill -s KILL {} < /dev/null", active.pid),
            KillScope::Account => format!("pkill -9 -u {} < /dev/null", self.record.principal),
        };

        match self
            .shell
            .run(&target, &self.key(), &CommandRequest::command(command))
            .await
        {
            Ok(output) => {
                // Killing every process of the account also takes down the
                // session running pkill, which then reports no exit status.
                let confirmed = output.success()
                    || (self.config.kill_scope == KillScope::Account
                        && output.exit_status.is_none());
                if confirmed {
                    info!("Killed process {} on {}", active.pid, target);
                    self.record.active = None;
                } else {
                    info!(
                        "Kill of {} on {} not confirmed (exit status {:?}): {}",
                        active.pid,
                        target,
                        output.exit_status,
                        output.stderr.trim()
                    );
                }
                confirmed
            }
            Err(e) => {
                info!("Kill of {} on {} failed: {}", active.pid, target, e);
                false
            }
        }
    }

    /// Drop the record without touching the machine.
    pub fn forget(&mut self) {
        if let Some(active) = self.record.active.take() {
            warn!(
                "Forgetting process {} on {} without a confirmed kill",
                active.pid, active.remote_ip
            );
        }
    }

    /// Restore the record from persisted values after a restart.
    ///
    /// `hostname` is the machine's `ip:control_port`. Every value must be
    /// present and non-zero; otherwise the record is left untouched.
    pub fn restore(&mut self, pid: Option<u32>, hostname: Option<&str>, port: Option<u16>) -> bool {
        let (Some(pid), Some(hostname), Some(port)) = (
            pid.filter(|p| *p > 0),
            hostname.filter(|h| !h.is_empty()),
            port.filter(|p| *p > 0),
        ) else {
            info!("Unable to restore state: pid, hostname and port must all be set");
            return false;
        };

        let endpoint = match hostname.parse::<Endpoint>() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                info!("Unable to restore state: {}", e);
                return false;
            }
        };

        self.record.active = Some(ActiveProcess {
            pid,
            port,
            remote_ip: endpoint.host,
            remote_control_port: endpoint.port,
        });
        info!(
            "Restored process state: pid={}, port={}, machine={}",
            pid, port, hostname
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{CommandOutput, RemoteError, RemoteResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Call = (RemoteTarget, Credential, CommandRequest);

    /// Shell answering key-authenticated calls from a queue; password calls fail.
    #[derive(Default)]
    struct QueueShell {
        replies: Mutex<VecDeque<RemoteResult<CommandOutput>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl QueueShell {
        fn push(&self, reply: RemoteResult<CommandOutput>) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn exit(&self, status: Option<i32>, stdout: &str) {
            self.push(Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_status: status,
            }));
        }

        fn key_calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, c, _)| matches!(c, Credential::Key(_)))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl RemoteShell for QueueShell {
        async fn run(
            &self,
            target: &RemoteTarget,
            credential: &Credential,
            request: &CommandRequest,
        ) -> RemoteResult<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((target.clone(), credential.clone(), request.clone()));
            if let Credential::Password(_) = credential {
                return Err(RemoteError::ConnectionFailed {
                    target: target.to_string(),
                    message: "Permission denied".to_string(),
                });
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    struct FixedPorts(Mutex<VecDeque<u16>>);

    impl PortSelector for FixedPorts {
        fn next_port(&self) -> u16 {
            self.0.lock().unwrap().pop_front().unwrap_or(9999)
        }
    }

    fn launcher(shell: Arc<QueueShell>) -> ProcessLauncher {
        ProcessLauncher::new("sha_u42", shell, LauncherConfig::default()).with_port_selector(
            Arc::new(FixedPorts(Mutex::new(VecDeque::from([3001, 3002, 3003])))),
        )
    }

    #[test]
    fn test_launch_script_contents() {
        let mut env = BTreeMap::new();
        env.insert("JUPYTERHUB_USER".to_string(), "o'brien".to_string());
        let script = launch_script(&LauncherConfig::default(), &env, 4242).unwrap();

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains(r"export JUPYTERHUB_USER='o'\''brien'"));
        assert!(script.contains("chmod 600 '.jupyter.log'"));
        assert!(script.contains("run=true source 'initialSetup.sh' >> '.jupyter.log'"));
        assert!(script.contains(
            "jupyterhub-singleuser --port 4242 < /dev/null >> '.jupyter.log' 2>&1 & pid=$!"
        ));
        assert!(script.ends_with("echo $pid"));
    }

    #[test]
    fn test_launch_script_rejects_bad_keys() {
        for key in ["", "1ABC", "A-B", "A B", "X;rm"] {
            let env = BTreeMap::from([(key.to_string(), "v".to_string())]);
            assert_eq!(
                launch_script(&LauncherConfig::default(), &env, 1),
                Err(LaunchError::InvalidEnvKey(key.to_string()))
            );
        }
    }

    #[test]
    fn test_random_ports_in_range() {
        let ports = RandomPorts::new(2000, 2010);
        for _ in 0..200 {
            let port = ports.next_port();
            assert!((2000..=2010).contains(&port));
        }
        let swapped = RandomPorts::new(10, 5);
        assert!((5..=10).contains(&swapped.next_port()));
    }

    #[tokio::test]
    async fn test_launch_succeeds_on_third_attempt() {
        let shell = Arc::new(QueueShell::default());
        shell.exit(Some(1), "");
        shell.exit(Some(127), "");
        shell.exit(Some(0), "4821\n");
        let mut launcher = launcher(shell.clone());

        let env = HashMap::from([("JUPYTERHUB_USER".to_string(), "alice".to_string())]);
        let result = launcher
            .launch(&env, "http://hub:8081/hub/api", "10.0.0.1", "22")
            .await;

        assert_eq!(result, Some((3003, 4821)));
        assert_eq!(
            launcher.record().active,
            Some(ActiveProcess {
                pid: 4821,
                port: 3003,
                remote_ip: "10.0.0.1".to_string(),
                remote_control_port: 22,
            })
        );

        let calls = shell.key_calls();
        assert_eq!(calls.len(), 3);
        let script = calls[2].2.stdin.as_deref().unwrap();
        assert!(script.contains("--port 3003"));
        assert!(script.contains("export JUPYTERHUB_API_URL='http://hub:8081/hub/api'"));
        assert_eq!(calls[0].0, RemoteTarget::new("10.0.0.1", 22, "sha_u42"));
    }

    #[tokio::test]
    async fn test_launch_exhausts_attempts() {
        let shell = Arc::new(QueueShell::default());
        shell.push(Err(RemoteError::Timeout {
            target: "x".to_string(),
            timeout: std::time::Duration::from_secs(10),
        }));
        shell.exit(Some(0), "not a pid");
        shell.exit(Some(0), "0");
        let mut launcher = launcher(shell.clone());

        let result = launcher
            .launch(&HashMap::new(), "http://hub", "10.0.0.1", "22")
            .await;

        assert_eq!(result, None);
        assert!(launcher.record().is_empty());
        assert_eq!(shell.key_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_launch_validates_input_before_connecting() {
        let shell = Arc::new(QueueShell::default());
        let mut launcher = launcher(shell.clone());

        let bad_env = HashMap::from([("BAD-KEY".to_string(), "v".to_string())]);
        assert_eq!(launcher.launch(&bad_env, "u", "10.0.0.1", "22").await, None);
        assert_eq!(launcher.launch(&HashMap::new(), "u", "10.0.0.1", "ssh").await, None);
        assert!(shell.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_alive_without_pid() {
        let shell = Arc::new(QueueShell::default());
        let mut launcher = launcher(shell.clone());
        assert!(!launcher.check_alive().await);
        assert!(!launcher.kill().await);
        assert!(shell.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_alive_targets_restored_endpoint() {
        let shell = Arc::new(QueueShell::default());
        shell.exit(Some(0), "");
        let mut launcher = launcher(shell.clone());

        assert!(launcher.restore(Some(77), Some("192.168.5.9:2022"), Some(8888)));
        assert!(launcher.check_alive().await);

        let calls = shell.key_calls();
        assert_eq!(calls[0].0, RemoteTarget::new("192.168.5.9", 2022, "sha_u42"));
        assert_eq!(calls[0].2.command, "kill -s 0 77 < /dev/null");
    }

    #[tokio::test]
    async fn test_failed_liveness_clears_record() {
        let shell = Arc::new(QueueShell::default());
        shell.exit(Some(1), "");
        let mut launcher = launcher(shell.clone());
        launcher.restore(Some(77), Some("10.0.0.1:22"), Some(8888));

        assert!(!launcher.check_alive().await);
        assert!(launcher.record().is_empty());
    }

    #[tokio::test]
    async fn test_kill_clears_only_on_success() {
        let shell = Arc::new(QueueShell::default());
        shell.exit(Some(1), "");
        shell.exit(Some(0), "");
        let mut launcher = launcher(shell.clone());
        launcher.restore(Some(77), Some("10.0.0.1:22"), Some(8888));

        assert!(!launcher.kill().await);
        assert_eq!(launcher.record().pid(), Some(77));
        assert!(launcher.kill().await);
        assert!(launcher.record().is_empty());
        assert_eq!(shell.key_calls()[1].2.command, "kill -s KILL 77 < /dev/null");
    }

    #[tokio::test]
    async fn test_account_kill_accepts_missing_status() {
        let shell = Arc::new(QueueShell::default());
        shell.exit(None, "");
        let config = LauncherConfig {
            kill_scope: KillScope::Account,
            ..Default::default()
        };
        let mut launcher = ProcessLauncher::new("sha_u42", shell.clone(), config);
        launcher.restore(Some(77), Some("10.0.0.1:22"), Some(8888));

        assert!(launcher.kill().await);
        assert_eq!(shell.key_calls()[0].2.command, "pkill -9 -u sha_u42 < /dev/null");
    }

    #[tokio::test]
    async fn test_account_kill_confirmed_when_ssh_session_is_dropped() {
        use crate::remote::{OpenSshShell, write_stub_client};

        let dir = tempfile::TempDir::new().unwrap();
        let ssh = write_stub_client(
            dir.path(),
            "ssh",
            "echo 'Connection to 10.0.0.1 closed by remote host.' >&2\nexit 255",
        );
        let shell = OpenSshShell::new().with_binaries(ssh.to_string_lossy(), "sshpass");
        let config = LauncherConfig {
            kill_scope: KillScope::Account,
            ..Default::default()
        };
        let mut launcher = ProcessLauncher::new("sha_u42", Arc::new(shell), config);
        launcher.restore(Some(77), Some("10.0.0.1:22"), Some(8888));

        assert!(launcher.kill().await);
        assert!(launcher.record().is_empty());
    }

    #[test]
    fn test_restore_requires_all_values() {
        let shell = Arc::new(QueueShell::default());
        let mut launcher = launcher(shell);

        assert!(!launcher.restore(None, Some("10.0.0.1:22"), Some(8888)));
        assert!(!launcher.restore(Some(0), Some("10.0.0.1:22"), Some(8888)));
        assert!(!launcher.restore(Some(5), None, Some(8888)));
        assert!(!launcher.restore(Some(5), Some("10.0.0.1:22"), Some(0)));
        assert!(!launcher.restore(Some(5), Some("10.0.0.1"), Some(8888)));
        assert!(launcher.record().is_empty());

        assert!(launcher.restore(Some(5), Some("10.0.0.1:22"), Some(8888)));
        // A failed restore leaves the existing record alone.
        assert!(!launcher.restore(Some(6), Some("garbage"), Some(1)));
        assert_eq!(launcher.record().pid(), Some(5));
    }
}
