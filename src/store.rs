//! Persistent store for nodes, source maps and pending verifications.

use std::{collections::BTreeSet, path::Path, sync::Arc};

use anyhow::{ensure, Context, Result};
use redb::{
    backends::InMemoryBackend, Database, ReadableTable, ReadableTableMetadata, WriteTransaction,
};
use tracing::{debug, info};

use crate::node::{Node, NodeAddr, SourceId};

use self::tables::{
    decode_node, decode_ticket, encode_node, encode_ticket, get_node, get_ticket, node_key,
    source_of_key, source_range, NodeKey, NODES_TABLE, SOURCES_TABLE, TICKETS_TABLE,
};
pub use self::tables::Ticket;

mod tables;

/// Outcome of an attempt to confirm a pending ticket.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    /// The ticket was removed and its node added as a local node.
    Confirmed(Node),
    /// No live ticket with that token exists.
    Unknown,
    /// The ticket exists but the requester may not confirm it. It stays pending.
    Rejected,
    /// A local node with the ticket's address exists. The ticket was removed and the existing
    /// node left as it is.
    Taken,
}

/// Node counts by ownership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub local: usize,
    pub cached: usize,
}

/// The directory database.
///
/// Every operation runs in its own redb transaction. redb serializes write transactions, so
/// check-then-write sequences inside one method cannot interleave with other writers.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open or create a persistent store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading node database from {}", path.to_string_lossy());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create database directory at {}",
                    path.to_string_lossy()
                )
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open node database")?;
        Self::open(db)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        info!("using in-memory node database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(NODES_TABLE)?;
            let _table = write_tx.open_table(SOURCES_TABLE)?;
            let _table = write_tx.open_table(TICKETS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Get a node by address, preferring the local node over cached ones.
    pub fn get_node(&self, addr: &NodeAddr) -> Result<Option<Node>> {
        let tx = self.db.begin_read()?;
        let nodes = tx.open_table(NODES_TABLE)?;
        if let Some(node) = get_node(&nodes, &node_key(SourceId::LOCAL, addr))? {
            return Ok(Some(node));
        }
        let sources = tx.open_table(SOURCES_TABLE)?;
        for entry in sources.iter()? {
            let (_, id) = entry?;
            let key = node_key(SourceId::from(id.value()), addr);
            if let Some(node) = get_node(&nodes, &key)? {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Add a local node. Returns false if a local node with that address exists.
    pub fn add_node(&self, node: &Node) -> Result<bool> {
        ensure!(node.source_id.is_local(), "only local nodes can be added");
        let tx = self.db.begin_write()?;
        {
            let mut nodes = tx.open_table(NODES_TABLE)?;
            let key = node_key(SourceId::LOCAL, &node.addr);
            if nodes.get(&key)?.is_some() {
                return Ok(false);
            }
            nodes.insert(&key, encode_node(node)?.as_slice())?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Replace an existing local node. Returns false if there is none.
    pub fn update_node(&self, node: &Node) -> Result<bool> {
        ensure!(node.source_id.is_local(), "only local nodes can be updated");
        let tx = self.db.begin_write()?;
        {
            let mut nodes = tx.open_table(NODES_TABLE)?;
            let key = node_key(SourceId::LOCAL, &node.addr);
            if nodes.get(&key)?.is_none() {
                return Ok(false);
            }
            nodes.insert(&key, encode_node(node)?.as_slice())?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// All persisted source maps.
    pub fn sources(&self) -> Result<Vec<(String, SourceId)>> {
        let tx = self.db.begin_read()?;
        let sources = tx.open_table(SOURCES_TABLE)?;
        let mut out = Vec::new();
        for entry in sources.iter()? {
            let (hostname, id) = entry?;
            out.push((hostname.value().to_string(), SourceId::from(id.value())));
        }
        Ok(out)
    }

    /// Replace the cached nodes of the given sources with `nodes`.
    ///
    /// The source mappings are persisted in the same transaction, so a stored node never
    /// references an unknown source. Every node must belong to one of `sources`.
    pub fn cache_nodes(&self, sources: &[(String, SourceId)], nodes: &[Node]) -> Result<usize> {
        let ids: BTreeSet<SourceId> = sources.iter().map(|(_, id)| *id).collect();
        ensure!(!ids.contains(&SourceId::LOCAL), "cannot cache into the local source");
        for node in nodes {
            ensure!(
                ids.contains(&node.source_id),
                "node {} references source {} outside of the batch",
                node.addr,
                node.source_id
            );
        }

        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(SOURCES_TABLE)?;
            for (hostname, id) in sources {
                table.insert(hostname.as_str(), u32::from(*id))?;
            }
        }
        for id in &ids {
            remove_source_nodes(&tx, *id)?;
        }
        {
            let mut table = tx.open_table(NODES_TABLE)?;
            for node in nodes {
                let key = node_key(node.source_id, &node.addr);
                table.insert(&key, encode_node(node)?.as_slice())?;
            }
        }
        tx.commit()?;
        debug!(sources = ids.len(), "cached {} nodes", nodes.len());
        Ok(nodes.len())
    }

    /// Remove cached nodes last fetched before `before`. Local nodes are kept.
    pub fn evict_cached(&self, before: i64) -> Result<usize> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut table = tx.open_table(NODES_TABLE)?;
            let mut stale: Vec<NodeKey> = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let key = *key.value();
                if source_of_key(&key).is_local() {
                    continue;
                }
                if decode_node(value.value())?.last_seen < before {
                    stale.push(key);
                }
            }
            for key in &stale {
                table.remove(key)?;
            }
            stale.len()
        };
        tx.commit()?;
        Ok(removed)
    }

    /// Every stored node, local and cached.
    pub fn dump_nodes(&self) -> Result<Vec<Node>> {
        self.dump_filtered(|_| true)
    }

    /// Every node modified or retrieved strictly after the unix timestamp `since`.
    pub fn dump_since(&self, since: i64) -> Result<Vec<Node>> {
        self.dump_filtered(|node| node.retrieved > since)
    }

    fn dump_filtered(&self, filter: impl Fn(&Node) -> bool) -> Result<Vec<Node>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(NODES_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let node = decode_node(value.value())?;
            if filter(&node) {
                out.push(node);
            }
        }
        Ok(out)
    }

    /// Count local and cached nodes.
    pub fn count_nodes(&self) -> Result<NodeCounts> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(NODES_TABLE)?;
        let total = table.len()? as usize;
        let (lo, hi) = source_range(SourceId::LOCAL);
        let local = table.range::<&NodeKey>(&lo..=&hi)?.count();
        Ok(NodeCounts {
            local,
            cached: total - local,
        })
    }

    /// Record a pending ticket. Returns false, without writing, if the token is taken.
    pub fn queue_ticket(&self, token: u64, ticket: &Ticket) -> Result<bool> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(TICKETS_TABLE)?;
            if table.get(token)?.is_some() {
                return Ok(false);
            }
            table.insert(token, encode_ticket(ticket)?.as_slice())?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Get a pending ticket, expired or not.
    pub fn get_ticket(&self, token: u64) -> Result<Option<Ticket>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TICKETS_TABLE)?;
        get_ticket(&table, token)
    }

    /// Mark the confirmation email of a ticket as delivered.
    ///
    /// Returns false if the ticket is gone.
    pub fn mark_delivered(&self, token: u64) -> Result<bool> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(TICKETS_TABLE)?;
            let Some(mut ticket) = get_ticket(&table, token)? else {
                return Ok(false);
            };
            ticket.delivered = true;
            table.insert(token, encode_ticket(&ticket)?.as_slice())?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Consume a ticket and promote its node to a local node.
    ///
    /// Expired tickets count as absent and are removed. If `authorize` rejects the node, the
    /// ticket is left untouched. A ticket whose address was taken by another local node in the
    /// meantime is removed without touching that node. Runs in a single write transaction, so a
    /// ticket is confirmed at most once.
    pub fn confirm_ticket(
        &self,
        token: u64,
        now: i64,
        authorize: impl FnOnce(&Node) -> bool,
    ) -> Result<ConfirmOutcome> {
        let tx = self.db.begin_write()?;
        let outcome = {
            let mut tickets = tx.open_table(TICKETS_TABLE)?;
            let Some(ticket) = get_ticket(&tickets, token)? else {
                return Ok(ConfirmOutcome::Unknown);
            };
            if ticket.is_expired(now) {
                tickets.remove(token)?;
                ConfirmOutcome::Unknown
            } else if !authorize(&ticket.node) {
                return Ok(ConfirmOutcome::Rejected);
            } else {
                tickets.remove(token)?;
                let mut node = ticket.node;
                let mut nodes = tx.open_table(NODES_TABLE)?;
                let key = node_key(SourceId::LOCAL, &node.addr);
                if nodes.get(&key)?.is_some() {
                    ConfirmOutcome::Taken
                } else {
                    node.source_id = SourceId::LOCAL;
                    node.retrieved = now;
                    node.last_seen = now;
                    nodes.insert(&key, encode_node(&node)?.as_slice())?;
                    ConfirmOutcome::Confirmed(node)
                }
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Remove every ticket expired at `now`.
    pub fn sweep_tickets(&self, now: i64) -> Result<usize> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut table = tx.open_table(TICKETS_TABLE)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (token, value) = entry?;
                if decode_ticket(value.value())?.is_expired(now) {
                    expired.push(token.value());
                }
            }
            for token in &expired {
                table.remove(*token)?;
            }
            expired.len()
        };
        tx.commit()?;
        Ok(removed)
    }

    /// Live tickets whose confirmation email was not delivered yet.
    pub fn undelivered_tickets(&self, now: i64) -> Result<Vec<(u64, Ticket)>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(TICKETS_TABLE)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (token, value) = entry?;
            let ticket = decode_ticket(value.value())?;
            if !ticket.delivered && !ticket.is_expired(now) {
                out.push((token.value(), ticket));
            }
        }
        Ok(out)
    }
}

fn remove_source_nodes(tx: &WriteTransaction, source: SourceId) -> Result<()> {
    let mut table = tx.open_table(NODES_TABLE)?;
    let (lo, hi) = source_range(source);
    let keys = table
        .range::<&NodeKey>(&lo..=&hi)?
        .map(|entry| entry.map(|(key, _)| *key.value()))
        .collect::<Result<Vec<NodeKey>, _>>()?;
    for key in &keys {
        table.remove(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::node::tests::test_node;

    fn cached(addr: &str, source: u32, retrieved: i64) -> Node {
        let mut node = test_node(addr);
        node.owner_email = String::new();
        node.source_id = SourceId::from(source);
        node.retrieved = retrieved;
        node.last_seen = retrieved;
        node
    }

    #[test]
    fn add_and_update_local_nodes() -> TestResult {
        let store = Store::in_memory()?;
        let node = test_node("10.0.0.1");
        assert!(store.add_node(&node)?);
        assert!(!store.add_node(&node)?);

        let mut changed = node.clone();
        changed.owner_name = "bob".to_string();
        assert!(store.update_node(&changed)?);
        assert_eq!(store.get_node(&node.addr)?, Some(changed));

        assert!(!store.update_node(&test_node("10.0.0.2"))?);
        assert_eq!(store.get_node(&"10.0.0.2".parse()?)?, None);
        Ok(())
    }

    #[test]
    fn cache_replaces_per_source() -> TestResult {
        let store = Store::in_memory()?;
        store.add_node(&test_node("10.0.0.1"))?;
        let sources = vec![
            ("a.example".to_string(), SourceId::from(1)),
            ("b.example".to_string(), SourceId::from(2)),
        ];
        store.cache_nodes(
            &sources,
            &[cached("10.0.1.1", 1, 10), cached("10.0.2.1", 2, 10)],
        )?;
        assert_eq!(store.count_nodes()?, NodeCounts { local: 1, cached: 2 });

        // a second fetch of source 1 drops its old nodes but leaves source 2 alone
        store.cache_nodes(&sources[..1], &[cached("10.0.1.2", 1, 20)])?;
        let addrs: BTreeSet<String> = store
            .dump_nodes()?
            .iter()
            .map(|n| n.addr.to_string())
            .collect();
        assert_eq!(
            addrs,
            ["10.0.0.1", "10.0.1.2", "10.0.2.1"]
                .into_iter()
                .map(String::from)
                .collect()
        );
        assert_eq!(store.sources()?.len(), 2);

        // cached nodes are found by address, local ones take precedence
        assert_eq!(
            store.get_node(&"10.0.2.1".parse()?)?.map(|n| n.source_id),
            Some(SourceId::from(2))
        );
        store.cache_nodes(&sources[1..], &[cached("10.0.0.1", 2, 30)])?;
        assert_eq!(
            store.get_node(&"10.0.0.1".parse()?)?.map(|n| n.source_id),
            Some(SourceId::LOCAL)
        );
        Ok(())
    }

    #[test]
    fn cache_rejects_unknown_sources() -> TestResult {
        let store = Store::in_memory()?;
        let sources = vec![("a.example".to_string(), SourceId::from(1))];
        assert!(store
            .cache_nodes(&sources, &[cached("10.0.1.1", 2, 10)])
            .is_err());
        assert!(store
            .cache_nodes(
                &[("local".to_string(), SourceId::LOCAL)],
                &[cached("10.0.1.1", 0, 10)]
            )
            .is_err());
        assert!(store.dump_nodes()?.is_empty());
        assert!(store.sources()?.is_empty());
        Ok(())
    }

    #[test]
    fn dump_since_is_strict() -> TestResult {
        let store = Store::in_memory()?;
        let sources = vec![("a.example".to_string(), SourceId::from(1))];
        store.cache_nodes(
            &sources,
            &[
                cached("10.0.1.1", 1, 100),
                cached("10.0.1.2", 1, 200),
                cached("10.0.1.3", 1, 300),
            ],
        )?;
        assert_eq!(store.dump_since(200)?.len(), 1);
        assert_eq!(store.dump_since(99)?.len(), 3);
        assert_eq!(store.dump_since(i64::MIN)?.len(), 3);
        assert!(store.dump_since(i64::MAX)?.is_empty());

        assert_eq!(store.evict_cached(200)?, 1);
        assert_eq!(store.dump_nodes()?.len(), 2);
        Ok(())
    }

    #[test]
    fn tickets() -> TestResult {
        let store = Store::in_memory()?;
        let ticket = Ticket {
            node: test_node("10.0.0.1"),
            delivered: false,
            expires: 100,
        };
        assert!(store.queue_ticket(7, &ticket)?);
        assert!(!store.queue_ticket(7, &ticket)?);
        assert_eq!(store.undelivered_tickets(50)?.len(), 1);
        assert!(store.undelivered_tickets(100)?.is_empty());

        assert!(store.mark_delivered(7)?);
        assert!(!store.mark_delivered(8)?);
        assert!(store.undelivered_tickets(50)?.is_empty());

        assert_eq!(
            store.confirm_ticket(7, 50, |_| false)?,
            ConfirmOutcome::Rejected
        );
        assert!(store.get_ticket(7)?.is_some());
        let ConfirmOutcome::Confirmed(node) = store.confirm_ticket(7, 50, |_| true)? else {
            panic!("ticket not confirmed");
        };
        assert_eq!(node.retrieved, 50);
        assert_eq!(store.get_node(&node.addr)?, Some(node));
        assert_eq!(
            store.confirm_ticket(7, 50, |_| true)?,
            ConfirmOutcome::Unknown
        );

        store.queue_ticket(8, &ticket)?;
        store.queue_ticket(9, &Ticket { expires: 300, ..ticket.clone() })?;
        assert_eq!(store.sweep_tickets(100)?, 1);
        assert!(store.get_ticket(8)?.is_none());
        assert_eq!(
            store.confirm_ticket(9, 300, |_| true)?,
            ConfirmOutcome::Unknown
        );
        assert!(store.get_ticket(9)?.is_none());
        Ok(())
    }
}
