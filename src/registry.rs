//! Mapping between federated map hostnames and local source ids.

use std::{collections::HashMap, sync::Arc};

use anyhow::{ensure, Result};
use iroh_metrics::inc;
use parking_lot::RwLock;
use tracing::debug;

use crate::{metrics::Metrics, node::SourceId};

/// Hostname reported for nodes owned by the map serving a dump.
pub const LOCAL_SOURCE: &str = "local";

/// Thread-safe bidirectional registry of source maps.
///
/// Lookups share a read lock. Assigning an id to an unseen hostname takes the write lock for
/// the whole check-and-insert, so concurrent first sightings of a hostname agree on its id.
/// Entries are never removed.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    by_host: HashMap<String, SourceId>,
    by_id: HashMap<SourceId, String>,
}

impl Inner {
    fn insert(&mut self, hostname: String, id: SourceId) {
        self.by_id.insert(id, hostname.clone());
        self.by_host.insert(hostname, id);
    }

    fn next_id(&self) -> SourceId {
        let mut next = self.by_host.len() as u32 + 1;
        while self.by_id.contains_key(&SourceId::from(next)) {
            next += 1;
        }
        SourceId::from(next)
    }
}

impl SourceRegistry {
    /// Create an empty registry, knowing only the local source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from previously persisted entries.
    pub fn load(entries: impl IntoIterator<Item = (String, SourceId)>) -> Result<Self> {
        let mut inner = Inner::default();
        for (hostname, id) in entries {
            ensure!(!id.is_local(), "source {hostname:?} persisted with the local id");
            ensure!(
                hostname != LOCAL_SOURCE,
                "persisted source uses the reserved name {LOCAL_SOURCE:?}"
            );
            if let Some(existing) = inner.by_id.get(&id) {
                anyhow::bail!("source id {id} assigned to both {existing:?} and {hostname:?}");
            }
            inner.insert(hostname, id);
        }
        debug!("loaded {} source maps", inner.by_host.len());
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Get the id for `hostname`, assigning the next unused id if it was never seen.
    ///
    /// Never returns [`SourceId::LOCAL`]. Fails for the reserved [`LOCAL_SOURCE`] name and for
    /// empty hostnames.
    pub fn resolve(&self, hostname: &str) -> Result<SourceId> {
        ensure!(!hostname.is_empty(), "empty source hostname");
        ensure!(
            hostname != LOCAL_SOURCE,
            "{LOCAL_SOURCE:?} cannot be resolved to a remote source"
        );
        if let Some(id) = self.host_to_id(hostname) {
            return Ok(id);
        }

        let mut inner = self.inner.write();
        // Another writer may have inserted the hostname since we dropped the read lock.
        if let Some(id) = inner.by_host.get(hostname) {
            return Ok(*id);
        }
        let id = inner.next_id();
        inner.insert(hostname.to_string(), id);
        drop(inner);

        inc!(Metrics, sources_discovered);
        debug!(%id, "discovered new source map {hostname:?}");
        Ok(id)
    }

    /// Look up the id of a known hostname without assigning one.
    pub fn host_to_id(&self, hostname: &str) -> Option<SourceId> {
        if hostname == LOCAL_SOURCE {
            return Some(SourceId::LOCAL);
        }
        self.inner.read().by_host.get(hostname).copied()
    }

    /// Look up the hostname of an id. [`SourceId::LOCAL`] maps to [`LOCAL_SOURCE`].
    pub fn id_to_host(&self, id: SourceId) -> Option<String> {
        if id.is_local() {
            return Some(LOCAL_SOURCE.to_string());
        }
        self.inner.read().by_id.get(&id).cloned()
    }

    /// Number of known remote sources.
    pub fn len(&self) -> usize {
        self.inner.read().by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use testresult::TestResult;

    use super::*;

    #[test]
    fn resolve_assigns_distinct_ids() -> TestResult {
        let registry = SourceRegistry::new();
        let a = registry.resolve("a.example")?;
        let b = registry.resolve("b.example")?;
        assert_ne!(a, b);
        assert_eq!(a, SourceId::from(1));
        assert_eq!(b, SourceId::from(2));
        assert_eq!(registry.resolve("a.example")?, a);
        assert_eq!(registry.id_to_host(a).as_deref(), Some("a.example"));
        assert_eq!(registry.id_to_host(b).as_deref(), Some("b.example"));
        assert_eq!(registry.len(), 2);
        Ok(())
    }

    #[test]
    fn local_is_reserved() {
        let registry = SourceRegistry::new();
        assert!(registry.resolve(LOCAL_SOURCE).is_err());
        assert!(registry.resolve("").is_err());
        assert_eq!(
            registry.id_to_host(SourceId::LOCAL).as_deref(),
            Some(LOCAL_SOURCE)
        );
        assert_eq!(registry.host_to_id(LOCAL_SOURCE), Some(SourceId::LOCAL));
        assert_eq!(registry.id_to_host(SourceId::from(7)), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn load_skips_used_ids() -> TestResult {
        let registry = SourceRegistry::load([
            ("a.example".to_string(), SourceId::from(1)),
            ("c.example".to_string(), SourceId::from(3)),
        ])?;
        let b = registry.resolve("b.example")?;
        assert_eq!(b, SourceId::from(4));
        assert_eq!(registry.resolve("c.example")?, SourceId::from(3));

        assert!(SourceRegistry::load([("x".to_string(), SourceId::LOCAL)]).is_err());
        assert!(SourceRegistry::load([
            ("x".to_string(), SourceId::from(1)),
            ("y".to_string(), SourceId::from(1)),
        ])
        .is_err());
        Ok(())
    }

    #[test]
    fn concurrent_first_sightings_agree() {
        let registry = SourceRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let shared = registry.resolve("shared.example").unwrap();
                    let own = registry.resolve(&format!("host-{i}.example")).unwrap();
                    (shared, own)
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let shared: HashSet<_> = results.iter().map(|(s, _)| *s).collect();
        assert_eq!(shared.len(), 1);
        let mut all: HashSet<_> = results.iter().map(|(_, o)| *o).collect();
        all.extend(shared);
        assert_eq!(all.len(), 17);
        assert!(!all.contains(&SourceId::LOCAL));
        assert_eq!(registry.len(), 17);
    }
}
