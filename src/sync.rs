//! Pulling node dumps from child maps.
//!
//! Every child map is asked for its full dump. Its own nodes, reported under
//! [`LOCAL_SOURCE`], are attributed to the address they were fetched from, and every group is
//! tagged with the local id of its source.

use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use iroh_metrics::{inc, inc_by};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use url::Url;

use crate::{
    dump::{DumpResponse, SourceGroups},
    error::InvalidInput,
    metrics::Metrics,
    node::{Node, NodeAddr, SourceId},
    registry::{SourceRegistry, LOCAL_SOURCE},
    store::Store,
};

/// Path of the dump endpoint on a child map.
pub const DUMP_PATH: &str = "api/all";

/// Why fetching a child map failed.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid child map address {0:?}")]
    Address(String),
    #[error("request failed")]
    Request(#[source] reqwest::Error),
    #[error("remote answered with status {0}")]
    Status(http::StatusCode),
    #[error("malformed dump")]
    Decode(#[source] serde_json::Error),
    #[error("remote error: {0}")]
    Remote(serde_json::Value),
    #[error("dump contains no data")]
    MissingData,
    #[error("invalid node {addr} from {source_map:?}: {reason}")]
    InvalidNode {
        source_map: String,
        addr: NodeAddr,
        reason: InvalidInput,
    },
    #[error("failed to register source")]
    Registry(#[source] anyhow::Error),
}

/// Nodes retrieved from one child map, tagged with local source ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    /// The child map address that was fetched.
    pub address: String,
    /// Every source present in the dump, with its local id.
    pub sources: Vec<(String, SourceId)>,
    pub nodes: Vec<Node>,
    /// Set when the fetch failed. A child map with no nodes yields an empty batch that is not
    /// failed.
    pub failed: bool,
}

impl SyncBatch {
    fn empty(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Default::default()
        }
    }

    fn failure(address: &str) -> Self {
        Self {
            failed: true,
            ..Self::empty(address)
        }
    }
}

/// Fetches and localizes the dumps of child maps.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    client: reqwest::Client,
    registry: SourceRegistry,
    own_hostname: Option<String>,
}

impl SyncEngine {
    /// Create an engine whose requests give up after `timeout`.
    ///
    /// Groups reported under `own_hostname` are skipped, they describe this map itself.
    pub fn new(
        registry: SourceRegistry,
        timeout: Duration,
        own_hostname: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            registry,
            own_hostname,
        })
    }

    /// Fetch the dump of the child map at `address`.
    ///
    /// Failures are logged and yield an empty batch.
    pub async fn sync_from(&self, address: &str) -> SyncBatch {
        inc!(Metrics, sync_runs);
        match self.try_sync_from(address).await {
            Ok(batch) => {
                debug!(
                    %address,
                    sources = batch.sources.len(),
                    "fetched {} nodes",
                    batch.nodes.len()
                );
                batch
            }
            Err(err) => {
                inc!(Metrics, sync_failures);
                warn!(%address, "caching child map failed: {:#}", anyhow::Error::from(err));
                SyncBatch::failure(address)
            }
        }
    }

    /// Fetch the dump of the child map at `address`, returning any failure.
    pub async fn try_sync_from(&self, address: &str) -> Result<SyncBatch, SyncError> {
        let groups = self.fetch(address).await?;
        self.localize(address, groups)
    }

    /// Fetch every child map concurrently. A failing child map yields an empty batch and does
    /// not affect the others.
    pub async fn sync_all(&self, child_maps: &[String]) -> Vec<SyncBatch> {
        let mut tasks = JoinSet::new();
        for address in child_maps {
            let engine = self.clone();
            let address = address.clone();
            let span = tracing::debug_span!("sync", %address);
            tasks.spawn(async move { engine.sync_from(&address).await }.instrument(span));
        }
        let mut batches = Vec::with_capacity(child_maps.len());
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(batch) => batches.push(batch),
                Err(err) => warn!(?err, "sync task panicked"),
            }
        }
        batches
    }

    async fn fetch(&self, address: &str) -> Result<SourceGroups, SyncError> {
        let url = dump_url(address)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SyncError::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status(status));
        }
        let body = response.bytes().await.map_err(SyncError::Request)?;
        let dump: DumpResponse = serde_json::from_slice(&body).map_err(SyncError::Decode)?;
        if let Some(err) = dump.error.filter(|e| !e.is_null()) {
            return Err(SyncError::Remote(err));
        }
        dump.data.ok_or(SyncError::MissingData)
    }

    /// Attribute the groups of a decoded dump to local source ids.
    ///
    /// The [`LOCAL_SOURCE`] group is owned by `address`. Every node is validated before any
    /// source is registered, so a rejected dump leaves the registry untouched.
    pub fn localize(&self, address: &str, groups: SourceGroups) -> Result<SyncBatch, SyncError> {
        let address = source_name(address);
        let now = Node::now_unix();

        let mut pending: BTreeMap<String, Vec<Node>> = BTreeMap::new();
        for (owner, group) in groups.0 {
            let hostname = if owner == LOCAL_SOURCE {
                address.to_string()
            } else {
                owner
            };
            if self.own_hostname.as_deref() == Some(hostname.as_str()) {
                debug!(%address, "skipping {} of our own nodes", group.len());
                continue;
            }
            let nodes = pending.entry(hostname.clone()).or_default();
            for wire in group {
                let node = wire.into_cached(SourceId::LOCAL, now);
                node.validate().map_err(|reason| SyncError::InvalidNode {
                    source_map: hostname.clone(),
                    addr: node.addr,
                    reason,
                })?;
                nodes.push(node);
            }
        }

        let mut batch = SyncBatch::empty(address);
        for (hostname, mut nodes) in pending {
            let id = self
                .registry
                .resolve(&hostname)
                .map_err(SyncError::Registry)?;
            for node in &mut nodes {
                node.source_id = id;
            }
            batch.sources.push((hostname, id));
            batch.nodes.extend(nodes);
        }
        Ok(batch)
    }
}

/// The name a child map address is registered under.
pub fn source_name(address: &str) -> &str {
    address.trim().trim_end_matches('/')
}

/// The dump URL of a child map. Addresses without a scheme are reached over plain http.
pub fn dump_url(address: &str) -> Result<Url, SyncError> {
    let base = source_name(address);
    let base = if base.contains("://") {
        format!("{base}/")
    } else {
        format!("http://{base}/")
    };
    Url::parse(&base)
        .and_then(|url| url.join(DUMP_PATH))
        .map_err(|_| SyncError::Address(address.to_string()))
}

/// Outcome of one sync round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub fetched: usize,
    pub failed: usize,
    pub cached: usize,
    pub evicted: usize,
}

/// Fetch every child map once and store the results.
///
/// Cached nodes retrieved longer than `max_cache_age` ago are evicted afterwards.
pub async fn sync_round(
    engine: &SyncEngine,
    store: &Store,
    child_maps: &[String],
    max_cache_age: Option<Duration>,
) -> RoundReport {
    let mut report = RoundReport::default();
    for batch in engine.sync_all(child_maps).await {
        if batch.failed {
            report.failed += 1;
            continue;
        }
        report.fetched += 1;
        match store.cache_nodes(&batch.sources, &batch.nodes) {
            Ok(count) => {
                inc_by!(Metrics, sync_nodes_cached, count as u64);
                report.cached += count;
            }
            Err(err) => error!(address = %batch.address, ?err, "failed to cache nodes"),
        }
    }
    if let Some(max_age) = max_cache_age {
        let before = Node::now_unix().saturating_sub(max_age.as_secs() as i64);
        match store.evict_cached(before) {
            Ok(evicted) => report.evicted = evicted,
            Err(err) => error!(?err, "failed to evict stale cached nodes"),
        }
    }
    report
}

/// Spawn a task running [`sync_round`] every `interval` until `cancel` fires.
pub fn spawn_sync_loop(
    engine: SyncEngine,
    store: Store,
    child_maps: Vec<String>,
    interval: Duration,
    max_cache_age: Option<Duration>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        if child_maps.is_empty() {
            debug!("no child maps configured");
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = sync_round(&engine, &store, &child_maps, max_cache_age).await;
            info!(
                fetched = report.fetched,
                failed = report.failed,
                evicted = report.evicted,
                "cached {} nodes from child maps",
                report.cached
            );
        }
    })
}
