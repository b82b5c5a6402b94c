//! Session lifecycle.
//!
//! A [`Spawner`] belongs to one client session and strings together the
//! identity classifier, the shared allocation engine and the session's
//! process launcher in the order the host calls them:
//! `options` → `start` → `poll`* → `stop`, with `load_state` after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::allocation::{AllocationEngine, AllocationError};
use crate::identity::{IdentityPolicy, PRIVILEGE_TRUSTED};
use crate::launcher::{LauncherConfig, PortSelector, ProcessLauncher};
use crate::registry::{Endpoint, HostType};
use crate::remote::RemoteShell;
use crate::state::SpawnState;

/// Result type for lifecycle operations.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Errors returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// The account may not make this request.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// No capacity or the launch failed; the request may be retried.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request does not match the session's state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SpawnError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpawnError::Unavailable(_))
    }
}

impl From<AllocationError> for SpawnError {
    fn from(err: AllocationError) -> Self {
        if err.is_policy_violation() {
            SpawnError::NotPermitted(err.to_string())
        } else {
            SpawnError::Unavailable(err.to_string())
        }
    }
}

/// Client choice from the offered machine types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Index into the list returned by [`Spawner::options`].
    pub machine_index: usize,
    pub shared: bool,
}

/// Result of [`Spawner::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Running,
    Exited,
}

/// Lifecycle of one client session.
#[derive(Debug)]
pub struct Spawner {
    owner_id: String,
    account: String,
    privilege: u8,
    engine: Arc<AllocationEngine>,
    launcher: ProcessLauncher,
    offers: Option<Vec<HostType>>,
    state: SpawnState,
}

impl Spawner {
    /// Create the spawner for session `owner_id` of `account`.
    pub fn new(
        owner_id: impl Into<String>,
        account: impl Into<String>,
        policy: &IdentityPolicy,
        engine: Arc<AllocationEngine>,
        shell: Arc<dyn RemoteShell>,
        config: LauncherConfig,
    ) -> Self {
        let account = account.into();
        let privilege = policy.privilege_of(&account);
        let principal = policy.technical_id_of(&account);
        debug!(
            "Session for {} runs as {} (privilege {})",
            account, principal, privilege
        );

        Self {
            owner_id: owner_id.into(),
            account,
            privilege,
            engine,
            launcher: ProcessLauncher::new(principal, shell, config),
            offers: None,
            state: SpawnState::default(),
        }
    }

    /// Replace the launcher's port source.
    pub fn with_port_selector(mut self, ports: Arc<dyn PortSelector>) -> Self {
        self.launcher = self.launcher.with_port_selector(ports);
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn privilege(&self) -> u8 {
        self.privilege
    }

    /// Remote account the session's process runs as.
    pub fn principal(&self) -> &str {
        self.launcher.principal()
    }

    fn is_privileged(&self) -> bool {
        self.privilege >= PRIVILEGE_TRUSTED
    }

    /// Machine types this account may choose from, as client-facing listings.
    ///
    /// The offer list is remembered; [`Self::start`] indexes into it.
    pub fn options(&mut self) -> Vec<Map<String, Value>> {
        let offers = self.engine.list_available(self.privilege);
        let listings = offers.iter().map(HostType::listing).collect();
        self.offers = Some(offers);
        listings
    }

    /// Allocate a machine and launch the session's process on it.
    ///
    /// Returns the machine address and the port the process listens on.
    pub async fn start(
        &mut self,
        request: StartRequest,
        environment: &HashMap<String, String>,
        control_url: &str,
    ) -> SpawnResult<(String, u16)> {
        if let Some(pid) = self.launcher.record().pid() {
            return Err(SpawnError::InvalidRequest(format!(
                "process {} is already running, stop it first",
                pid
            )));
        }

        let offers = self.offers.as_ref().ok_or_else(|| {
            SpawnError::InvalidRequest("no machine types were offered to this session".to_string())
        })?;
        let host_type = offers.get(request.machine_index).cloned().ok_or_else(|| {
            SpawnError::InvalidRequest(format!(
                "machine index {} is out of range ({} offered)",
                request.machine_index,
                offers.len()
            ))
        })?;

        if !request.shared && !self.is_privileged() {
            return Err(SpawnError::NotPermitted(
                "exclusive access requires a privileged account".to_string(),
            ));
        }
        if host_type.privileged_access_required && !self.is_privileged() {
            return Err(SpawnError::NotPermitted(format!(
                "machine type {} requires a privileged account",
                host_type.codename
            )));
        }

        let hostname = self
            .engine
            .acquire(&host_type, &self.owner_id, request.shared)
            .await?;
        info!(
            "Reserved {} ({}) for {}, shared: {}",
            hostname, host_type.codename, self.owner_id, request.shared
        );

        let endpoint = match hostname.parse::<Endpoint>() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.engine.release(&self.owner_id).await;
                return Err(SpawnError::Unavailable(e.to_string()));
            }
        };

        let Some((port, pid)) = self
            .launcher
            .launch(
                environment,
                control_url,
                &endpoint.host,
                &endpoint.port.to_string(),
            )
            .await
        else {
            self.engine.release(&self.owner_id).await;
            return Err(SpawnError::Unavailable(format!(
                "could not start a process on {}",
                hostname
            )));
        };

        self.state = SpawnState {
            pid: Some(pid),
            hostname: Some(hostname),
            notebook_port: Some(port),
            shared: Some(request.shared),
            codename: Some(host_type.codename),
        };
        Ok((endpoint.host, port))
    }

    /// Whether the session's process is still running.
    ///
    /// An exited process keeps its allocation until [`Self::stop`].
    pub async fn poll(&mut self) -> PollStatus {
        if self.launcher.record().pid().is_none() {
            self.state.clear();
            return PollStatus::Exited;
        }

        if self.launcher.check_alive().await {
            PollStatus::Running
        } else {
            PollStatus::Exited
        }
    }

    /// Kill the process, release the machine and clear the state. Safe to repeat.
    pub async fn stop(&mut self) {
        if self.launcher.record().pid().is_some() && !self.launcher.kill().await {
            self.launcher.forget();
        }
        info!("Releasing the machine of {}", self.owner_id);
        self.engine.release(&self.owner_id).await;
        self.state.clear();
    }

    /// Restore the session from a stored blob after a restart.
    ///
    /// Returns `false` (and leaves the session empty) when the blob does not
    /// describe a usable launch.
    pub async fn load_state(&mut self, blob: &Value) -> bool {
        let Some(state) = SpawnState::load(blob, self.engine.registry()) else {
            self.launcher.forget();
            self.state.clear();
            return false;
        };

        let hostname = state.hostname.clone().unwrap_or_default();
        if !self
            .launcher
            .restore(state.pid, Some(hostname.as_str()), state.notebook_port)
        {
            self.launcher.forget();
            self.state.clear();
            return false;
        }

        // Best effort: another session may have taken the machine meanwhile.
        if let Some(host_type) = self.engine.registry().type_of(&hostname).cloned() {
            let shared = state
                .shared
                .unwrap_or(host_type.shared_access_enabled);
            match self.engine.allocation_of(&self.owner_id).await {
                Some(existing) if existing.hostname == hostname => {
                    debug!("{} already holds {}", self.owner_id, hostname)
                }
                Some(existing) => warn!(
                    "{} holds {} but its state names {}",
                    self.owner_id, existing.hostname, hostname
                ),
                None => {
                    if !self
                        .engine
                        .reserve(&host_type, &hostname, &self.owner_id, shared)
                        .await
                    {
                        warn!(
                            "Could not re-adopt {} for {} after restart",
                            hostname, self.owner_id
                        );
                    }
                }
            }
        }

        self.state = state;
        true
    }

    /// Current state blob.
    pub fn state(&self) -> Value {
        self.state.to_blob()
    }
}
