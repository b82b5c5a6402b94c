//! Allocation engine.
//!
//! Tracks which client holds which machine and enforces the exclusive/shared
//! policy. All allocation state lives behind a single mutex owned by the
//! engine; network probes run outside of it.
//!
//! Prefer [`AllocationEngine::acquire`], which selects and reserves a machine
//! in one critical section. [`AllocationEngine::find`] followed by
//! [`AllocationEngine::reserve`] is also available, but the reservation may
//! fail if another session got there first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::identity::PRIVILEGE_TRUSTED;
use crate::registry::{Endpoint, HostRegistry, HostType};

/// Default bound on a single online probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result type for allocation operations.
pub type AllocationResult<T> = Result<T, AllocationError>;

/// Reasons an acquisition can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// Shared access was requested on a type that does not allow it.
    #[error("machine type {0} does not support shared access")]
    SharedNotSupported(String),

    /// The owner already holds a machine.
    #[error("{owner_id} already holds machine {hostname}")]
    AlreadyAllocated { owner_id: String, hostname: String },

    /// No online machine satisfies the request.
    #[error("no available machine of type {0}")]
    NoCapacity(String),
}

impl AllocationError {
    /// Whether the request itself violates policy (as opposed to a capacity shortage).
    pub fn is_policy_violation(&self) -> bool {
        !matches!(self, AllocationError::NoCapacity(_))
    }
}

/// Online check for a machine endpoint.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// Whether `hostname` (`ip:port`) accepts connections. Never fails.
    async fn is_online(&self, hostname: &str) -> bool;
}

/// Probe that opens (and immediately closes) a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

#[async_trait]
impl EndpointProbe for TcpProbe {
    async fn is_online(&self, hostname: &str) -> bool {
        let Ok(endpoint) = hostname.parse::<Endpoint>() else {
            debug!("Probe skipped, invalid endpoint {}", hostname);
            return false;
        };

        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", hostname, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", hostname, self.timeout);
                false
            }
        }
    }
}

/// A machine held by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub owner_id: String,
    pub hostname: String,
    pub shared: bool,
    /// Codename of the host type the machine belongs to.
    pub codename: String,
}

/// Allocation table and its hostname index. Always mutated together.
#[derive(Debug, Default)]
struct AllocationTable {
    allocations: HashMap<String, Allocation>,
    by_host: HashMap<String, Vec<String>>,
}

impl AllocationTable {
    fn occupants(&self, hostname: &str) -> &[String] {
        self.by_host.get(hostname).map(Vec::as_slice).unwrap_or(&[])
    }

    fn has_exclusive(&self, hostname: &str) -> bool {
        self.occupants(hostname).iter().any(|owner| {
            self.allocations
                .get(owner)
                .is_some_and(|allocation| !allocation.shared)
        })
    }

    /// Whether `hostname` could take a new allocation of the requested mode.
    fn accepts(&self, hostname: &str, want_shared: bool) -> bool {
        if want_shared {
            !self.has_exclusive(hostname)
        } else {
            self.occupants(hostname).is_empty()
        }
    }

    /// Full reservation check. Returns the reason on rejection.
    fn check_reservable(
        &self,
        host_type: &HostType,
        hostname: &str,
        owner_id: &str,
        want_shared: bool,
    ) -> Result<(), String> {
        if want_shared && !host_type.shared_access_enabled {
            return Err(format!(
                "machine type {} does not support shared access",
                host_type.codename
            ));
        }
        if !host_type.contains(hostname) {
            return Err(format!(
                "{} is not a machine of type {}",
                hostname, host_type.codename
            ));
        }
        if let Some(existing) = self.allocations.get(owner_id) {
            return Err(format!("{} already holds {}", owner_id, existing.hostname));
        }
        if !want_shared && !self.occupants(hostname).is_empty() {
            return Err(format!("{} is already allocated", hostname));
        }
        if want_shared && self.has_exclusive(hostname) {
            return Err(format!("{} has an exclusive allocation", hostname));
        }
        Ok(())
    }

    /// Pick a machine among `online` hostnames.
    ///
    /// Exclusive: first free machine in declaration order. Shared: first free
    /// machine, otherwise the least loaded one without an exclusive holder
    /// (first seen wins ties).
    fn select(
        &self,
        host_type: &HostType,
        want_shared: bool,
        online: &HashSet<String>,
    ) -> Option<String> {
        if want_shared && !host_type.shared_access_enabled {
            return None;
        }

        if !want_shared {
            return host_type
                .hostnames
                .iter()
                .find(|h| online.contains(*h) && self.occupants(h).is_empty())
                .cloned();
        }

        let mut best: Option<(&String, usize)> = None;
        for hostname in &host_type.hostnames {
            if !online.contains(hostname) {
                debug!("{} is offline, skipping", hostname);
                continue;
            }
            if self.has_exclusive(hostname) {
                debug!("{} has an exclusive allocation, skipping", hostname);
                continue;
            }
            let count = self.occupants(hostname).len();
            if count == 0 {
                return Some(hostname.clone());
            }
            match best {
                Some((_, fewest)) if fewest <= count => {}
                _ => best = Some((hostname, count)),
            }
        }
        best.map(|(hostname, _)| hostname.clone())
    }

    fn insert(&mut self, allocation: Allocation) {
        self.by_host
            .entry(allocation.hostname.clone())
            .or_default()
            .push(allocation.owner_id.clone());
        self.allocations
            .insert(allocation.owner_id.clone(), allocation);
    }

    fn remove(&mut self, owner_id: &str) -> Option<Allocation> {
        let allocation = self.allocations.remove(owner_id)?;
        if let Some(owners) = self.by_host.get_mut(&allocation.hostname) {
            owners.retain(|o| o != owner_id);
            if owners.is_empty() {
                self.by_host.remove(&allocation.hostname);
            }
        }
        Some(allocation)
    }
}

/// Process-wide allocation state, shared by all client sessions.
pub struct AllocationEngine {
    registry: Arc<HostRegistry>,
    probe: Arc<dyn EndpointProbe>,
    table: Mutex<AllocationTable>,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("host_types", &self.registry.hosts().len())
            .finish_non_exhaustive()
    }
}

impl AllocationEngine {
    /// Create an engine probing machines over TCP.
    pub fn new(registry: Arc<HostRegistry>, probe_timeout: Duration) -> Self {
        Self::with_probe(registry, Arc::new(TcpProbe::new(probe_timeout)))
    }

    /// Create an engine with a custom online probe.
    pub fn with_probe(registry: Arc<HostRegistry>, probe: Arc<dyn EndpointProbe>) -> Self {
        Self {
            registry,
            probe,
            table: Mutex::new(AllocationTable::default()),
        }
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Whether `endpoint` accepts connections right now.
    pub async fn probe_online(&self, endpoint: &str) -> bool {
        self.probe.is_online(endpoint).await
    }

    /// Probe `candidates` concurrently, returning the online ones.
    async fn online_among(&self, candidates: Vec<String>) -> HashSet<String> {
        let results = join_all(candidates.iter().map(|h| self.probe.is_online(h))).await;
        candidates
            .into_iter()
            .zip(results)
            .filter_map(|(hostname, online)| {
                if !online {
                    info!("Machine {} is offline, skipping", hostname);
                }
                online.then_some(hostname)
            })
            .collect()
    }

    /// Hostnames worth probing for a request, based on current state.
    async fn candidates(&self, host_type: &HostType, want_shared: bool) -> Vec<String> {
        let table = self.table.lock().await;
        host_type
            .hostnames
            .iter()
            .filter(|h| table.accepts(h, want_shared))
            .cloned()
            .collect()
    }

    /// Find a machine of `host_type` for the requested mode without reserving it.
    pub async fn find(&self, host_type: &HostType, want_shared: bool) -> Option<String> {
        if want_shared && !host_type.shared_access_enabled {
            info!(
                "Shared access requested but machine type {} does not support it",
                host_type.codename
            );
            return None;
        }

        let candidates = self.candidates(host_type, want_shared).await;
        let online = self.online_among(candidates).await;

        let table = self.table.lock().await;
        let found = table.select(host_type, want_shared, &online);
        match &found {
            Some(hostname) => debug!(
                "Found {} for type {} (shared: {})",
                hostname, host_type.codename, want_shared
            ),
            None => info!(
                "No eligible machine of type {} (shared: {})",
                host_type.codename, want_shared
            ),
        }
        found
    }

    /// Reserve `hostname` for `owner_id`, re-checking eligibility against current state.
    ///
    /// Returns `false` without side effects when the reservation is not allowed.
    pub async fn reserve(
        &self,
        host_type: &HostType,
        hostname: &str,
        owner_id: &str,
        want_shared: bool,
    ) -> bool {
        let mut table = self.table.lock().await;
        if let Err(reason) = table.check_reservable(host_type, hostname, owner_id, want_shared) {
            info!("Cannot reserve {} for {}: {}", hostname, owner_id, reason);
            return false;
        }

        table.insert(Allocation {
            owner_id: owner_id.to_string(),
            hostname: hostname.to_string(),
            shared: want_shared,
            codename: host_type.codename.clone(),
        });
        info!(
            "Allocated {} (type {}) to {} (shared: {}), occupants: {:?}",
            hostname,
            host_type.codename,
            owner_id,
            want_shared,
            table.occupants(hostname)
        );
        true
    }

    /// Select and reserve a machine in a single critical section.
    pub async fn acquire(
        &self,
        host_type: &HostType,
        owner_id: &str,
        want_shared: bool,
    ) -> AllocationResult<String> {
        if want_shared && !host_type.shared_access_enabled {
            return Err(AllocationError::SharedNotSupported(
                host_type.codename.clone(),
            ));
        }
        if let Some(existing) = self.allocation_of(owner_id).await {
            return Err(AllocationError::AlreadyAllocated {
                owner_id: owner_id.to_string(),
                hostname: existing.hostname,
            });
        }

        let candidates = self.candidates(host_type, want_shared).await;
        let online = self.online_among(candidates).await;

        let mut table = self.table.lock().await;
        if let Some(existing) = table.allocations.get(owner_id) {
            return Err(AllocationError::AlreadyAllocated {
                owner_id: owner_id.to_string(),
                hostname: existing.hostname.clone(),
            });
        }

        let Some(hostname) = table.select(host_type, want_shared, &online) else {
            info!(
                "No eligible machine of type {} for {} (shared: {})",
                host_type.codename, owner_id, want_shared
            );
            return Err(AllocationError::NoCapacity(host_type.codename.clone()));
        };

        table.insert(Allocation {
            owner_id: owner_id.to_string(),
            hostname: hostname.clone(),
            shared: want_shared,
            codename: host_type.codename.clone(),
        });
        info!(
            "Allocated {} (type {}) to {} (shared: {}), occupants: {:?}",
            hostname,
            host_type.codename,
            owner_id,
            want_shared,
            table.occupants(&hostname)
        );
        Ok(hostname)
    }

    /// Release the allocation held by `owner_id`. Unknown owners are ignored.
    pub async fn release(&self, owner_id: &str) -> Option<Allocation> {
        let mut table = self.table.lock().await;
        match table.remove(owner_id) {
            Some(allocation) => {
                info!(
                    "Released {} (type {}) held by {}, remaining: {:?}",
                    allocation.hostname,
                    allocation.codename,
                    owner_id,
                    table.occupants(&allocation.hostname)
                );
                Some(allocation)
            }
            None => {
                debug!("Release for {} ignored, no allocation", owner_id);
                None
            }
        }
    }

    /// Host types visible at `privilege_level`, in registry order.
    pub fn list_available(&self, privilege_level: u8) -> Vec<HostType> {
        self.registry
            .hosts()
            .iter()
            .filter(|h| !h.privileged_access_required || privilege_level >= PRIVILEGE_TRUSTED)
            .cloned()
            .collect()
    }

    /// Current allocation of `owner_id`, if any.
    pub async fn allocation_of(&self, owner_id: &str) -> Option<Allocation> {
        self.table.lock().await.allocations.get(owner_id).cloned()
    }

    /// Owners currently placed on `hostname`, in allocation order.
    pub async fn occupants(&self, hostname: &str) -> Vec<String> {
        self.table.lock().await.occupants(hostname).to_vec()
    }

    /// Hostname index snapshot, sorted by hostname.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let table = self.table.lock().await;
        let snapshot: BTreeMap<String, Vec<String>> = table
            .by_host
            .iter()
            .map(|(host, owners)| (host.clone(), owners.clone()))
            .collect();

        if snapshot.values().map(Vec::len).sum::<usize>() != table.allocations.len() {
            warn!("Allocation index out of sync with allocation table");
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Probe answering from a fixed offline set.
    #[derive(Default)]
    struct StaticProbe {
        offline: std::sync::Mutex<HashSet<String>>,
    }

    impl StaticProbe {
        fn set_offline(&self, hostname: &str) {
            self.offline.lock().unwrap().insert(hostname.to_string());
        }
    }

    #[async_trait]
    impl EndpointProbe for StaticProbe {
        async fn is_online(&self, hostname: &str) -> bool {
            !self.offline.lock().unwrap().contains(hostname)
        }
    }

    fn pool(codename: &str, hosts: &[&str]) -> HostType {
        HostType::new(codename, hosts.iter().map(|h| h.to_string()).collect())
    }

    fn engine_with(types: Vec<HostType>) -> (AllocationEngine, Arc<StaticProbe>) {
        let registry = Arc::new(HostRegistry::new(types).unwrap());
        let probe = Arc::new(StaticProbe::default());
        (AllocationEngine::with_probe(registry, probe.clone()), probe)
    }

    #[tokio::test]
    async fn test_exclusive_find_skips_taken_and_offline() {
        let a = pool("a", &["h1:22", "h2:22", "h3:22"]);
        let (engine, probe) = engine_with(vec![a.clone()]);
        probe.set_offline("h2:22");

        assert_eq!(engine.find(&a, false).await.as_deref(), Some("h1:22"));
        assert!(engine.reserve(&a, "h1:22", "u1", false).await);
        assert_eq!(engine.find(&a, false).await.as_deref(), Some("h3:22"));
        assert!(engine.reserve(&a, "h3:22", "u2", false).await);
        assert_eq!(engine.find(&a, false).await, None);

        engine.release("u1").await;
        assert_eq!(engine.find(&a, false).await.as_deref(), Some("h1:22"));
    }

    #[tokio::test]
    async fn test_shared_requires_shared_type() {
        let a = pool("a", &["h1:22"]);
        let (engine, _) = engine_with(vec![a.clone()]);

        assert_eq!(engine.find(&a, true).await, None);
        assert!(!engine.reserve(&a, "h1:22", "u1", true).await);
        assert_eq!(
            engine.acquire(&a, "u1", true).await,
            Err(AllocationError::SharedNotSupported("a".to_string()))
        );
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_prefers_empty_then_least_loaded() {
        let a = pool("a", &["h1:22", "h2:22", "h3:22"]).shared(true);
        let (engine, _) = engine_with(vec![a.clone()]);

        assert!(engine.reserve(&a, "h1:22", "u1", true).await);
        assert!(engine.reserve(&a, "h1:22", "u2", true).await);
        assert!(engine.reserve(&a, "h2:22", "u3", true).await);
        // h3 is empty and wins immediately.
        assert_eq!(engine.find(&a, true).await.as_deref(), Some("h3:22"));

        assert!(engine.reserve(&a, "h3:22", "u4", true).await);
        assert!(engine.reserve(&a, "h3:22", "u5", true).await);
        // h1: 2, h2: 1, h3: 2
        assert_eq!(engine.find(&a, true).await.as_deref(), Some("h2:22"));

        assert!(engine.reserve(&a, "h2:22", "u6", true).await);
        // All tied at 2: first seen wins.
        assert_eq!(engine.find(&a, true).await.as_deref(), Some("h1:22"));
    }

    #[tokio::test]
    async fn test_exclusive_holder_blocks_shared() {
        let a = pool("a", &["h1:22", "h2:22"]).shared(true);
        let (engine, probe) = engine_with(vec![a.clone()]);

        assert!(engine.reserve(&a, "h1:22", "boss", false).await);
        assert!(!engine.reserve(&a, "h1:22", "u1", true).await);
        assert!(!engine.reserve(&a, "h1:22", "u2", false).await);
        assert_eq!(engine.find(&a, true).await.as_deref(), Some("h2:22"));

        probe.set_offline("h2:22");
        assert_eq!(engine.find(&a, true).await, None);
        assert_eq!(engine.find(&a, false).await, None);

        engine.release("boss").await;
        assert_eq!(engine.find(&a, true).await.as_deref(), Some("h1:22"));
    }

    #[tokio::test]
    async fn test_shared_occupant_blocks_exclusive() {
        let a = pool("a", &["h1:22"]).shared(true);
        let (engine, _) = engine_with(vec![a.clone()]);

        assert!(engine.reserve(&a, "h1:22", "u1", true).await);
        assert!(!engine.reserve(&a, "h1:22", "u2", false).await);
        assert!(engine.reserve(&a, "h1:22", "u2", true).await);
        assert_eq!(engine.occupants("h1:22").await, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_reserve_rejects_foreign_host_and_second_allocation() {
        let a = pool("a", &["h1:22", "h2:22"]);
        let b = pool("b", &["h3:22"]);
        let (engine, _) = engine_with(vec![a.clone(), b.clone()]);

        assert!(!engine.reserve(&a, "h3:22", "u1", false).await);
        assert!(engine.reserve(&a, "h1:22", "u1", false).await);
        assert!(!engine.reserve(&a, "h2:22", "u1", false).await);
        assert!(!engine.reserve(&b, "h3:22", "u1", false).await);
        assert_eq!(engine.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_reports_capacity_and_double_allocation() {
        let a = pool("a", &["h1:22"]);
        let (engine, _) = engine_with(vec![a.clone()]);

        assert_eq!(engine.acquire(&a, "u1", false).await.unwrap(), "h1:22");
        assert_eq!(
            engine.acquire(&a, "u1", false).await,
            Err(AllocationError::AlreadyAllocated {
                owner_id: "u1".to_string(),
                hostname: "h1:22".to_string(),
            })
        );
        let err = engine.acquire(&a, "u2", false).await.unwrap_err();
        assert_eq!(err, AllocationError::NoCapacity("a".to_string()));
        assert!(!err.is_policy_violation());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let a = pool("a", &["h1:22"]).shared(true);
        let (engine, _) = engine_with(vec![a.clone()]);

        assert!(engine.reserve(&a, "h1:22", "u1", true).await);
        assert!(engine.reserve(&a, "h1:22", "u2", true).await);

        assert!(engine.release("u1").await.is_some());
        let after_first = engine.snapshot().await;
        assert!(engine.release("u1").await.is_none());
        assert!(engine.release("ghost").await.is_none());
        assert_eq!(engine.snapshot().await, after_first);
        assert_eq!(engine.allocation_of("u2").await.unwrap().hostname, "h1:22");

        engine.release("u2").await;
        assert!(engine.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_available_by_privilege() {
        let a = pool("a", &["h1:22"]);
        let b = pool("b", &["h2:22"]).privileged(true);
        let c = pool("c", &["h3:22"]);
        let (engine, _) = engine_with(vec![a, b, c]);

        let names = |types: Vec<HostType>| -> Vec<String> {
            types.into_iter().map(|t| t.codename).collect()
        };
        assert_eq!(names(engine.list_available(0)), vec!["a", "c"]);
        assert_eq!(names(engine.list_available(1)), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe::new(Duration::from_secs(2));

        assert!(probe.is_online(&addr.to_string()).await);

        drop(listener);
        assert!(!probe.is_online(&addr.to_string()).await);
        assert!(!probe.is_online("not-an-endpoint").await);
    }
}
