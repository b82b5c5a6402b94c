//! Configuration file handling.
//!
//! One TOML file holds every section, including the host registry as
//! `[[hosts]]` tables. Values can be overridden through environment variables
//! named `<PREFIX>__<SECTION>__<KEY>`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityPolicy;
use crate::launcher::LauncherConfig;
use crate::registry::{HostRegistry, HostType, REGISTRY_VERSION, RegistryDocument};
use crate::remote::OpenSshShell;

pub const APP_NAME: &str = "hostpool";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Version of the `[[hosts]]` registry layout.
    pub registry_version: u32,
    pub logging: LoggingConfig,
    pub allocation: AllocationConfig,
    pub remote: RemoteConfig,
    pub launcher: LauncherConfig,
    pub identity: IdentityPolicy,
    /// Machine types, in preference order.
    pub hosts: Vec<HostType>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry_version: REGISTRY_VERSION,
            logging: LoggingConfig::default(),
            allocation: AllocationConfig::default(),
            remote: RemoteConfig::default(),
            launcher: LauncherConfig::default(),
            identity: IdentityPolicy::default(),
            hosts: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Validated host registry.
    pub fn registry(&self) -> Result<HostRegistry> {
        HostRegistry::from_document(RegistryDocument {
            version: self.registry_version,
            hosts: self.hosts.clone(),
        })
        .context("validating host registry")
    }

    /// Remote channel configured from the `[remote]` section.
    pub fn shell(&self) -> OpenSshShell {
        OpenSshShell::new()
            .with_binaries(&self.remote.ssh_binary, &self.remote.sshpass_binary)
            .with_connect_timeout(Duration::from_secs(self.remote.connect_timeout_secs))
            .with_command_timeout(self.remote.command_timeout_secs.map(Duration::from_secs))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Bound on a single online probe, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_binary: String,
    pub sshpass_binary: String,
    pub connect_timeout_secs: u64,
    /// Bound on a whole remote command. Unbounded when unset.
    pub command_timeout_secs: Option<u64>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            connect_timeout_secs: 10,
            command_timeout_secs: None,
        }
    }
}

/// Load `path` (if it exists) with environment overrides under `env_prefix`.
pub fn load_config(path: &Path, env_prefix: &str) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(env_prefix).separator("__"))
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .with_context(|| format!("parsing config from {}", path.display()))?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }
    if let Some(text) = config.launcher.key_path.to_str() {
        config.launcher.key_path = expand_str_path(text)?;
    }

    Ok(config)
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push_str("\n#\n");
    buffer.push_str("# Machine types are declared as [[hosts]] tables:\n");
    buffer.push_str("#\n");
    buffer.push_str("# [[hosts]]\n");
    buffer.push_str("# codename = \"a100\"\n");
    buffer.push_str("# display_name = \"NVIDIA A100 node\"\n");
    buffer.push_str("# hostnames = [\"10.0.0.11:22\", \"10.0.0.12:22\"]\n");
    buffer.push_str("# shared_access_enabled = true\n");
    buffer.push_str("# privileged_access_required = false\n");
    buffer.push_str("# gpus = [\"NVIDIA A100 80GB\"]\n");
    buffer.push('\n');
    buffer
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

/// Environment variable prefix derived from the application name.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
