//! Host registry: the catalog of machine types and their endpoints.
//!
//! A [`HostType`] describes a pool of interchangeable machines. Each field has an
//! explicit [`Visibility`] that decides whether it appears in client-facing
//! listings; machine addresses are never shown to clients.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Registry document version understood by this build.
pub const REGISTRY_VERSION: u32 = 1;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors raised while building or validating the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry document has an unsupported version.
    #[error("unsupported registry version {found} (expected {REGISTRY_VERSION})")]
    UnsupportedVersion { found: u32 },

    /// A host type is missing its codename.
    #[error("host type #{index} has an empty codename")]
    EmptyCodename { index: usize },

    /// Two host types share a codename.
    #[error("duplicate host type codename: {0}")]
    DuplicateCodename(String),

    /// A host type lists no machines.
    #[error("host type {0} has no hostnames")]
    NoHostnames(String),

    /// A hostname appears under more than one host type.
    #[error("hostname {hostname} is listed under both {first} and {second}")]
    DuplicateHostname {
        hostname: String,
        first: String,
        second: String,
    },

    /// A hostname is not a valid endpoint.
    #[error("invalid endpoint '{0}': expected host:port")]
    InvalidEndpoint(String),
}

/// A machine control address, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidEndpoint(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Whether a field may be shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// One storage device of a host type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Storage kind (e.g., "SSD", "NVMe").
    pub kind: String,
    /// Size in gigabytes.
    pub size_gb: u32,
}

/// A named pool of interchangeable machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostType {
    /// Stable identifier of the machine type.
    pub codename: String,
    /// Human readable name shown in listings.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Control endpoints (`ip:port`) of the physical machines, in preference order.
    pub hostnames: Vec<String>,
    /// Whether several clients may share one machine.
    #[serde(default)]
    pub shared_access_enabled: bool,
    /// Whether only privileged accounts may use this type.
    #[serde(default)]
    pub privileged_access_required: bool,
    #[serde(default)]
    pub cpu_model: Option<String>,
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    #[serde(default)]
    pub ram_gb: Option<u32>,
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default)]
    pub storage: Vec<StorageSpec>,
}

impl HostType {
    /// Per-field visibility for client listings.
    pub const FIELD_VISIBILITY: &'static [(&'static str, Visibility)] = &[
        ("codename", Visibility::Public),
        ("display_name", Visibility::Public),
        ("hostnames", Visibility::Private),
        ("shared_access_enabled", Visibility::Public),
        ("privileged_access_required", Visibility::Public),
        ("cpu_model", Visibility::Public),
        ("cpu_cores", Visibility::Public),
        ("ram_gb", Visibility::Public),
        ("gpus", Visibility::Public),
        ("storage", Visibility::Public),
    ];

    /// Minimal host type with the given endpoints.
    pub fn new(codename: impl Into<String>, hostnames: Vec<String>) -> Self {
        Self {
            codename: codename.into(),
            display_name: None,
            hostnames,
            shared_access_enabled: false,
            privileged_access_required: false,
            cpu_model: None,
            cpu_cores: None,
            ram_gb: None,
            gpus: Vec::new(),
            storage: Vec::new(),
        }
    }

    pub fn shared(mut self, enabled: bool) -> Self {
        self.shared_access_enabled = enabled;
        self
    }

    pub fn privileged(mut self, required: bool) -> Self {
        self.privileged_access_required = required;
        self
    }

    /// Whether `hostname` belongs to this pool.
    pub fn contains(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h == hostname)
    }

    /// Client-facing view containing only public fields.
    ///
    /// Fields without an entry in [`Self::FIELD_VISIBILITY`] are treated as private.
    pub fn listing(&self) -> Map<String, Value> {
        let Ok(Value::Object(fields)) = serde_json::to_value(self) else {
            return Map::new();
        };

        fields
            .into_iter()
            .filter(|(name, _)| {
                Self::FIELD_VISIBILITY
                    .iter()
                    .any(|(field, vis)| field == name && *vis == Visibility::Public)
            })
            .collect()
    }
}

/// Serialized registry document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub hosts: Vec<HostType>,
}

fn default_version() -> u32 {
    REGISTRY_VERSION
}

/// Validated, immutable catalog of host types in declaration order.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<HostType>,
}

impl HostRegistry {
    /// Build a registry, validating codenames and endpoints.
    pub fn new(hosts: Vec<HostType>) -> RegistryResult<Self> {
        let mut codenames = HashSet::new();
        let mut owners: Vec<(&str, &str)> = Vec::new();

        for (index, host) in hosts.iter().enumerate() {
            if host.codename.trim().is_empty() {
                return Err(RegistryError::EmptyCodename { index });
            }
            if !codenames.insert(host.codename.as_str()) {
                return Err(RegistryError::DuplicateCodename(host.codename.clone()));
            }
            if host.hostnames.is_empty() {
                return Err(RegistryError::NoHostnames(host.codename.clone()));
            }
            for hostname in &host.hostnames {
                hostname.parse::<Endpoint>()?;
                if let Some((_, first)) = owners.iter().find(|(h, _)| h == hostname) {
                    return Err(RegistryError::DuplicateHostname {
                        hostname: hostname.clone(),
                        first: first.to_string(),
                        second: host.codename.clone(),
                    });
                }
                owners.push((hostname.as_str(), host.codename.as_str()));
            }
        }

        Ok(Self { hosts })
    }

    /// Build a registry from a versioned document.
    pub fn from_document(doc: RegistryDocument) -> RegistryResult<Self> {
        if doc.version != REGISTRY_VERSION {
            return Err(RegistryError::UnsupportedVersion { found: doc.version });
        }
        Self::new(doc.hosts)
    }

    pub fn hosts(&self) -> &[HostType] {
        &self.hosts
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, codename: &str) -> Option<&HostType> {
        self.hosts.iter().find(|h| h.codename == codename)
    }

    /// Host type owning `hostname`, if any.
    pub fn type_of(&self, hostname: &str) -> Option<&HostType> {
        self.hosts.iter().find(|h| h.contains(hostname))
    }
}
