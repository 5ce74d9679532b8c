//! Identity-keyed routing table built from labeled Services
//!
//! Every backend is a Kubernetes Service carrying numbered identity labels
//! (`username-0`, `username-1`, ... for the database proxies, `domain-0`, ...
//! for the web proxy). The table maps each identity to the service that
//! claims it. Lookups are the hot path (one per new connection or request);
//! mutations arrive rarely from the watch. A single lock covers both the
//! per-service records and the identity index, so a reader never sees a
//! service half-applied.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Label marking a Service as managed by the orchestrator
pub const MANAGED_BY_LABEL: &str = "managedBy";
/// Value of [`MANAGED_BY_LABEL`] on services we route to
pub const MANAGED_BY_VALUE: &str = "kubestrator";
/// Label carrying the backend type (`web`, `mysql`, `postgresql`, `memory`)
pub const TYPE_LABEL: &str = "type";
/// Label opting a service into scale-to-zero
pub const SCALE_TO_ZERO_LABEL: &str = "scaleToZeroEnabled";

/// Which numbered label family carries identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// `username-N`, matched case-sensitively
    Username,
    /// `domain-N`, normalised to lowercase
    Domain,
}

impl IdentityKind {
    pub fn label_prefix(&self) -> &'static str {
        match self {
            IdentityKind::Username => "username",
            IdentityKind::Domain => "domain",
        }
    }

    /// Normalise an identity the way lookups will present it
    pub fn normalize(&self, identity: &str) -> String {
        match self {
            IdentityKind::Username => identity.to_string(),
            IdentityKind::Domain => identity.trim_end_matches('.').to_ascii_lowercase(),
        }
    }
}

/// Namespace-qualified service name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One backend target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub port: u16,
    pub identities: Vec<String>,
    pub scale_to_zero: bool,
}

impl ServiceInfo {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.name)
    }

    /// Cluster-local DNS name of the service
    pub fn cluster_host(&self, cluster_domain: &str) -> String {
        format!("{}.{}.svc.{}", self.name, self.namespace, cluster_domain)
    }

    /// Build from a service's labels, collecting `<prefix>-<N>` values in index order
    pub fn from_labels(
        namespace: &str,
        name: &str,
        port: u16,
        labels: &BTreeMap<String, String>,
        kind: IdentityKind,
    ) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            port,
            identities: identities_from_labels(labels, kind),
            scale_to_zero: labels
                .get(SCALE_TO_ZERO_LABEL)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Extract identities from numbered labels, ordered by their index
pub fn identities_from_labels(labels: &BTreeMap<String, String>, kind: IdentityKind) -> Vec<String> {
    let prefix = kind.label_prefix();
    let mut numbered: Vec<(u32, String)> = labels
        .iter()
        .filter_map(|(key, value)| {
            let index = key.strip_prefix(prefix)?.strip_prefix('-')?;
            let index: u32 = index.parse().ok()?;
            let value = kind.normalize(value.trim());
            if value.is_empty() {
                return None;
            }
            Some((index, value))
        })
        .collect();

    numbered.sort_by_key(|(index, _)| *index);

    let mut identities: Vec<String> = Vec::with_capacity(numbered.len());
    for (_, value) in numbered {
        if !identities.contains(&value) {
            identities.push(value);
        }
    }
    identities
}

/// A change observed on the service watch
#[derive(Debug, Clone)]
pub enum RouteEvent {
    Add(ServiceInfo),
    Update(ServiceInfo),
    /// Deletion is keyed only by name; labels on the deleted object are not trusted
    Delete(ServiceKey),
}

struct ServiceEntry {
    info: Arc<ServiceInfo>,
    /// Order in which this record was applied; later wins identity collisions
    generation: u64,
}

#[derive(Default)]
struct Tables {
    services: HashMap<ServiceKey, ServiceEntry>,
    identities: HashMap<String, Arc<ServiceInfo>>,
    next_generation: u64,
}

impl Tables {
    fn upsert(&mut self, info: ServiceInfo) -> bool {
        let key = info.key();

        if let Some(existing) = self.services.get(&key) {
            if *existing.info == info {
                return false;
            }
        }

        self.remove(&key);

        self.next_generation += 1;
        let info = Arc::new(info);
        for identity in &info.identities {
            if let Some(previous) = self.identities.insert(identity.clone(), Arc::clone(&info)) {
                if previous.key() != key {
                    debug!(identity, previous = %previous.key(), service = %key, "Identity claimed by newer service");
                }
            }
        }
        self.services.insert(
            key,
            ServiceEntry {
                info,
                generation: self.next_generation,
            },
        );
        true
    }

    fn remove(&mut self, key: &ServiceKey) -> Option<Arc<ServiceInfo>> {
        let removed = self.services.remove(key)?;

        for identity in &removed.info.identities {
            let owned = self
                .identities
                .get(identity)
                .map(|owner| owner.key() == *key)
                .unwrap_or(false);
            if !owned {
                continue;
            }

            self.identities.remove(identity);

            // Hand the identity to the most recently applied remaining claimant
            let fallback = self
                .services
                .values()
                .filter(|entry| entry.info.identities.iter().any(|i| i == identity))
                .max_by_key(|entry| entry.generation)
                .map(|entry| Arc::clone(&entry.info));
            if let Some(fallback) = fallback {
                self.identities.insert(identity.clone(), fallback);
            }
        }

        Some(removed.info)
    }
}

/// Shared routing table
#[derive(Default)]
pub struct RoutingTable {
    inner: RwLock<Tables>,
}

impl RoutingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolve an identity to its backend
    pub fn lookup(&self, identity: &str) -> Option<Arc<ServiceInfo>> {
        self.inner.read().identities.get(identity).cloned()
    }

    /// Last-applied record for a service
    pub fn get(&self, key: &ServiceKey) -> Option<Arc<ServiceInfo>> {
        self.inner.read().services.get(key).map(|e| Arc::clone(&e.info))
    }

    pub fn len(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn identity_count(&self) -> usize {
        self.inner.read().identities.len()
    }

    /// All services, sorted by key
    pub fn services(&self) -> Vec<Arc<ServiceInfo>> {
        let mut services: Vec<_> = self
            .inner
            .read()
            .services
            .values()
            .map(|e| Arc::clone(&e.info))
            .collect();
        services.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        services
    }

    /// Identity index as (identity, service key) pairs, sorted by identity
    pub fn routes(&self) -> Vec<(String, ServiceKey)> {
        let mut routes: Vec<_> = self
            .inner
            .read()
            .identities
            .iter()
            .map(|(identity, info)| (identity.clone(), info.key()))
            .collect();
        routes.sort();
        routes
    }

    /// Register a service. Adding a service that already exists replaces it.
    pub fn add(&self, info: ServiceInfo) -> bool {
        let key = info.key();
        let identities = info.identities.len();
        let changed = self.inner.write().upsert(info);
        if changed {
            info!(service = %key, identities, "Service route registered");
        }
        changed
    }

    /// Full replace: previous identities of the service are dropped first
    pub fn update(&self, info: ServiceInfo) -> bool {
        let key = info.key();
        let identities = info.identities.len();
        let changed = self.inner.write().upsert(info);
        if changed {
            info!(service = %key, identities, "Service route updated");
        }
        changed
    }

    /// Remove a service and every identity it last claimed
    pub fn delete(&self, key: &ServiceKey) -> Option<Arc<ServiceInfo>> {
        let removed = self.inner.write().remove(key);
        match &removed {
            Some(info) => info!(service = %key, identities = info.identities.len(), "Service route removed"),
            None => debug!(service = %key, "Delete for unknown service ignored"),
        }
        removed
    }

    pub fn apply(&self, event: RouteEvent) -> bool {
        match event {
            RouteEvent::Add(info) => self.add(info),
            RouteEvent::Update(info) => self.update(info),
            RouteEvent::Delete(key) => self.delete(&key).is_some(),
        }
    }

    /// Atomically make the table mirror `services` (used after a relist)
    pub fn replace_all(&self, services: Vec<ServiceInfo>) {
        let mut tables = self.inner.write();

        let keep: std::collections::HashSet<ServiceKey> = services.iter().map(|s| s.key()).collect();
        let stale: Vec<ServiceKey> = tables
            .services
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();

        for key in &stale {
            tables.remove(key);
        }
        let mut changed = 0usize;
        for info in services {
            if tables.upsert(info) {
                changed += 1;
            }
        }

        info!(
            services = tables.services.len(),
            identities = tables.identities.len(),
            removed = stale.len(),
            changed,
            "Routing table resynchronised"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, identities: &[&str]) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            namespace: "tenant".to_string(),
            port: 6379,
            identities: identities.iter().map(|s| s.to_string()).collect(),
            scale_to_zero: false,
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identities_from_numbered_labels() {
        let labels = labels(&[
            ("managedBy", "kubestrator"),
            ("type", "memory"),
            ("username-1", "bob"),
            ("username-0", "alice"),
            ("username-10", "zed"),
            ("username-x", "ignored"),
            ("usernames-2", "ignored"),
        ]);

        let ids = identities_from_labels(&labels, IdentityKind::Username);
        assert_eq!(ids, vec!["alice", "bob", "zed"]);
    }

    #[test]
    fn test_domain_identities_are_lowercased() {
        let labels = labels(&[("domain-0", "App.Example.COM"), ("domain-1", "app.example.com")]);
        let ids = identities_from_labels(&labels, IdentityKind::Domain);
        assert_eq!(ids, vec!["app.example.com"]);
    }

    #[test]
    fn test_from_labels_reads_scale_to_zero() {
        let labels = labels(&[("domain-0", "a.example.com"), ("scaleToZeroEnabled", "true")]);
        let info = ServiceInfo::from_labels("ns", "web", 80, &labels, IdentityKind::Domain);
        assert!(info.scale_to_zero);
        assert_eq!(info.cluster_host("cluster.local"), "web.ns.svc.cluster.local");
    }

    #[test]
    fn test_add_and_lookup() {
        let table = RoutingTable::new();
        assert!(table.add(svc("cache-a", &["alice", "bob"])));

        assert_eq!(table.lookup("alice").unwrap().name, "cache-a");
        assert_eq!(table.lookup("bob").unwrap().name, "cache-a");
        assert!(table.lookup("carol").is_none());
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let table = RoutingTable::new();
        assert!(table.add(svc("cache-a", &["alice"])));
        assert!(!table.add(svc("cache-a", &["alice"])));
        assert_eq!(table.len(), 1);
        assert_eq!(table.identity_count(), 1);
    }

    #[test]
    fn test_update_replaces_identities() {
        let table = RoutingTable::new();
        table.add(svc("cache-a", &["alice", "bob"]));
        table.update(svc("cache-a", &["bob", "carol"]));

        assert!(table.lookup("alice").is_none());
        assert_eq!(table.lookup("bob").unwrap().name, "cache-a");
        assert_eq!(table.lookup("carol").unwrap().name, "cache-a");
    }

    #[test]
    fn test_delete_uses_last_known_record() {
        let table = RoutingTable::new();
        table.add(svc("cache-a", &["alice", "bob"]));

        let removed = table.delete(&ServiceKey::new("tenant", "cache-a")).unwrap();
        assert_eq!(removed.identities.len(), 2);
        assert!(table.lookup("alice").is_none());
        assert!(table.lookup("bob").is_none());
        assert!(table.is_empty());
        assert_eq!(table.identity_count(), 0);
    }

    #[test]
    fn test_collision_last_writer_wins_and_falls_back() {
        let table = RoutingTable::new();
        table.add(svc("cache-a", &["shared"]));
        table.add(svc("cache-b", &["shared"]));
        assert_eq!(table.lookup("shared").unwrap().name, "cache-b");

        // Deleting the older claimant must not disturb the current owner
        table.delete(&ServiceKey::new("tenant", "cache-a"));
        assert_eq!(table.lookup("shared").unwrap().name, "cache-b");

        table.add(svc("cache-a", &["shared"]));
        assert_eq!(table.lookup("shared").unwrap().name, "cache-a");

        // Owner drops the identity; the remaining claimant takes over
        table.update(svc("cache-a", &["other"]));
        assert_eq!(table.lookup("shared").unwrap().name, "cache-b");
    }

    #[test]
    fn test_event_sequence_converges_to_final_state() {
        let events = vec![
            RouteEvent::Add(svc("a", &["u1", "u2"])),
            RouteEvent::Add(svc("b", &["u3"])),
            RouteEvent::Update(svc("a", &["u2", "u4"])),
            RouteEvent::Add(svc("c", &["u5"])),
            RouteEvent::Delete(ServiceKey::new("tenant", "b")),
            RouteEvent::Add(svc("a", &["u2", "u4"])),
            RouteEvent::Update(svc("c", &["u6"])),
            RouteEvent::Delete(ServiceKey::new("tenant", "missing")),
        ];

        let replayed = RoutingTable::new();
        for event in events {
            replayed.apply(event);
        }

        let final_only = RoutingTable::new();
        final_only.add(svc("a", &["u2", "u4"]));
        final_only.add(svc("c", &["u6"]));

        assert_eq!(replayed.routes(), final_only.routes());
        assert_eq!(replayed.services(), final_only.services());
    }

    #[test]
    fn test_replace_all_removes_stale_services() {
        let table = RoutingTable::new();
        table.add(svc("a", &["u1"]));
        table.add(svc("b", &["u2"]));

        table.replace_all(vec![svc("b", &["u2", "u3"]), svc("c", &["u4"])]);

        assert!(table.lookup("u1").is_none());
        assert_eq!(table.lookup("u3").unwrap().name, "b");
        assert_eq!(table.lookup("u4").unwrap().name, "c");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_readers_never_observe_partial_updates() {
        let table = RoutingTable::new();
        table.add(svc("flip", &["even-0", "even-1"]));

        let writer_table = Arc::clone(&table);
        let writer = std::thread::spawn(move || {
            for i in 0..2_000 {
                let ids: &[&str] = if i % 2 == 0 {
                    &["odd-0", "odd-1"]
                } else {
                    &["even-0", "even-1"]
                };
                writer_table.update(svc("flip", ids));
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        for identity in ["even-0", "even-1", "odd-0", "odd-1"] {
                            if let Some(info) = table.lookup(identity) {
                                assert!(info.identities.iter().any(|i| i == identity));
                                assert_eq!(info.identities.len(), 2);
                                let family = &identity[..identity.len() - 2];
                                assert!(info.identities.iter().all(|i| i.starts_with(family)));
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
