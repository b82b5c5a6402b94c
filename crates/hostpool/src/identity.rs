//! Account classification.
//!
//! Maps a raw account name to a privilege level and to the technical account
//! name used on the remote machines. Both functions are pure.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum length of a technical id (Linux username limit).
pub const TECHNICAL_ID_MAX_LEN: usize = 32;

/// Privilege level of a regular account.
pub const PRIVILEGE_NONE: u8 = 0;

/// Privilege level of a trusted account.
pub const PRIVILEGE_TRUSTED: u8 = 1;

/// A domain suffix and the namespace prefix it selects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRule {
    /// Account suffix, e.g. `@stud.ubbcluj.ro`.
    pub suffix: String,
    /// Prefix of the technical id for matching accounts.
    pub prefix: String,
}

impl NamespaceRule {
    pub fn new(suffix: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            prefix: prefix.into(),
        }
    }
}

/// Classification policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityPolicy {
    /// Accounts ending with this suffix are trusted.
    pub trusted_domain: String,
    /// Accounts starting with this prefix are trusted.
    pub admin_prefix: String,
    /// Namespace rules; the longest matching suffix wins.
    pub namespaces: Vec<NamespaceRule>,
    /// Prefix used when no rule matches.
    pub default_prefix: String,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            trusted_domain: "@ubbcluj.ro".to_string(),
            admin_prefix: "admin".to_string(),
            namespaces: vec![
                NamespaceRule::new("@ubbcluj.ro", "sha_t"),
                NamespaceRule::new("@stud.ubbcluj.ro", "sha_s"),
            ],
            default_prefix: "sha_u".to_string(),
        }
    }
}

impl IdentityPolicy {
    /// Privilege level of `account`: 1 for the trusted domain or admin prefix, else 0.
    pub fn privilege_of(&self, account: &str) -> u8 {
        let account = account.to_lowercase();
        let trusted_domain = !self.trusted_domain.is_empty()
            && account.ends_with(&self.trusted_domain.to_lowercase());
        let admin = !self.admin_prefix.is_empty()
            && account.starts_with(&self.admin_prefix.to_lowercase());

        if trusted_domain || admin {
            PRIVILEGE_TRUSTED
        } else {
            PRIVILEGE_NONE
        }
    }

    /// Namespace prefix for `account`.
    pub fn namespace_of(&self, account: &str) -> &str {
        let account = account.to_lowercase();
        self.namespaces
            .iter()
            .filter(|rule| account.ends_with(&rule.suffix.to_lowercase()))
            .max_by_key(|rule| rule.suffix.len())
            .map(|rule| rule.prefix.as_str())
            .unwrap_or(&self.default_prefix)
    }

    /// Technical account name: namespace prefix plus a truncated SHA-256 of the account.
    ///
    /// Distinct accounts may collide once truncated; no uniqueness check is made.
    pub fn technical_id_of(&self, account: &str) -> String {
        let namespace = self.namespace_of(account);
        let mut end = namespace.len().min(TECHNICAL_ID_MAX_LEN);
        while !namespace.is_char_boundary(end) {
            end -= 1;
        }
        let prefix = &namespace[..end];
        let digest = hex::encode(Sha256::digest(account.as_bytes()));
        let budget = TECHNICAL_ID_MAX_LEN.saturating_sub(prefix.len());
        format!("{}{}", prefix, &digest[..budget.min(digest.len())])
    }
}

/// [`IdentityPolicy::privilege_of`] under the default policy.
pub fn privilege_of(account: &str) -> u8 {
    IdentityPolicy::default().privilege_of(account)
}

/// [`IdentityPolicy::technical_id_of`] under the default policy.
pub fn technical_id_of(account: &str) -> String {
    IdentityPolicy::default().technical_id_of(account)
}
