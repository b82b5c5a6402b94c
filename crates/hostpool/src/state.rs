//! Persisted session state.
//!
//! The host process stores a small JSON blob per session and hands it back
//! after a restart. Missing or unknown values mean "no prior launch".

use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::HostRegistry;

/// What a session needs to find its process again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Machine endpoint, `ip:control_port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notebook_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<bool>,
    /// Host type of the machine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codename: Option<String>,
}

impl SpawnState {
    /// Whether pid, hostname and port are all set.
    pub fn is_complete(&self) -> bool {
        self.pid.is_some_and(|p| p > 0)
            && self.hostname.as_deref().is_some_and(|h| !h.is_empty())
            && self.notebook_port.is_some_and(|p| p > 0)
    }

    /// Parse and validate a stored blob.
    ///
    /// Returns `None` when the blob is malformed, incomplete, or names a
    /// machine the registry does not know. The codename is taken from the
    /// registry, not from the blob.
    pub fn load(blob: &Value, registry: &HostRegistry) -> Option<Self> {
        if blob.is_null() || blob.as_object().is_some_and(|o| o.is_empty()) {
            return None;
        }

        let mut state: SpawnState = match serde_json::from_value(blob.clone()) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring malformed session state: {}", e);
                return None;
            }
        };

        if !state.is_complete() {
            info!("Session state incomplete, treating as no prior launch");
            return None;
        }

        let hostname = state.hostname.as_deref().unwrap_or_default();
        let Some(host_type) = registry.type_of(hostname) else {
            warn!(
                "Session state names unknown machine {}, clearing it",
                hostname
            );
            return None;
        };

        if let Some(codename) = &state.codename
            && codename != &host_type.codename
        {
            warn!(
                "Stored type {} for {} does not match registry type {}",
                codename, hostname, host_type.codename
            );
        }
        state.codename = Some(host_type.codename.clone());
        Some(state)
    }

    /// JSON object with the set fields only.
    pub fn to_blob(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HostType;
    use serde_json::json;

    fn registry() -> HostRegistry {
        HostRegistry::new(vec![HostType::new(
            "a100",
            vec!["10.0.0.1:22".to_string()],
        )])
        .unwrap()
    }

    #[test]
    fn test_load_complete_state() {
        let blob = json!({"pid": 4821, "hostname": "10.0.0.1:22", "notebook_port": 3003});
        let state = SpawnState::load(&blob, &registry()).unwrap();
        assert_eq!(state.pid, Some(4821));
        assert_eq!(state.notebook_port, Some(3003));
        assert_eq!(state.codename.as_deref(), Some("a100"));
    }

    #[test]
    fn test_load_missing_fields_is_no_prior_launch() {
        let registry = registry();
        assert!(SpawnState::load(&json!({}), &registry).is_none());
        assert!(SpawnState::load(&Value::Null, &registry).is_none());
        assert!(SpawnState::load(&json!({"pid": 1, "hostname": "10.0.0.1:22"}), &registry).is_none());
        assert!(
            SpawnState::load(
                &json!({"pid": 0, "hostname": "10.0.0.1:22", "notebook_port": 80}),
                &registry
            )
            .is_none()
        );
        assert!(SpawnState::load(&json!({"pid": "abc"}), &registry).is_none());
    }

    #[test]
    fn test_load_unknown_host_is_cleared() {
        let blob = json!({"pid": 5, "hostname": "10.9.9.9:22", "notebook_port": 3003});
        assert!(SpawnState::load(&blob, &registry()).is_none());
    }

    #[test]
    fn test_codename_follows_registry() {
        let blob = json!({
            "pid": 5, "hostname": "10.0.0.1:22", "notebook_port": 3003, "codename": "stale"
        });
        let state = SpawnState::load(&blob, &registry()).unwrap();
        assert_eq!(state.codename.as_deref(), Some("a100"));
    }

    #[test]
    fn test_blob_omits_empty_fields() {
        let mut state = SpawnState {
            pid: Some(7),
            hostname: Some("10.0.0.1:22".to_string()),
            ..Default::default()
        };
        assert_eq!(state.to_blob(), json!({"pid": 7, "hostname": "10.0.0.1:22"}));

        state.clear();
        assert_eq!(state.to_blob(), json!({}));
    }
}
