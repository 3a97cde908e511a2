//! Full and differential node dumps, and their wire format.
//!
//! A dump groups nodes by the hostname of the map owning them. Nodes owned by the serving map
//! are grouped under `"local"`:
//!
//! ```json
//! { "data": { "local": [ ... ], "other.example": [ ... ] }, "error": null }
//! ```

use std::{collections::BTreeMap, fmt, net::IpAddr};

use anyhow::{anyhow, Context};
use serde::{
    de::{self, MapAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    error::{InvalidInput, Result},
    node::{Node, PgpFingerprint, SourceId},
    registry::SourceRegistry,
    store::Store,
};

/// A node as exported to other maps and API clients.
///
/// The owner email is never filled in by exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNode {
    pub address: IpAddr,
    pub latitude: f64,
    pub longitude: f64,
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner_email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp: Option<PgpFingerprint>,
    #[serde(default)]
    pub status: u32,
    /// Unix timestamp of the last modification or retrieval.
    #[serde(default)]
    pub retrieved: i64,
}

impl WireNode {
    /// Export a node, dropping the owner email.
    pub fn export(node: &Node) -> Self {
        Self {
            address: node.addr.to_ip(),
            latitude: node.latitude,
            longitude: node.longitude,
            owner: node.owner_name.clone(),
            owner_email: String::new(),
            contact: node.contact.clone(),
            details: node.details.clone(),
            pgp: node.pgp.clone(),
            status: node.status,
            retrieved: node.retrieved,
        }
    }

    /// Convert a received node into a cached node owned by `source_id`, fetched at `now`.
    ///
    /// The reported modification time is kept. Nodes that report none are stamped with `now`.
    /// Any email sent along is dropped.
    pub fn into_cached(self, source_id: SourceId, now: i64) -> Node {
        let retrieved = match self.retrieved {
            0 => now,
            reported => reported,
        };
        Node {
            addr: self.address.into(),
            latitude: self.latitude,
            longitude: self.longitude,
            owner_name: self.owner,
            owner_email: String::new(),
            contact: self.contact,
            details: self.details,
            pgp: self.pgp,
            status: self.status,
            source_id,
            retrieved,
            last_seen: now,
        }
    }
}

/// Nodes grouped by the hostname of their owning map.
///
/// Deserializing rejects duplicate hostnames, so at most one group is
/// [`LOCAL_SOURCE`](crate::registry::LOCAL_SOURCE).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SourceGroups(pub BTreeMap<String, Vec<WireNode>>);

impl SourceGroups {
    /// Total number of nodes across all groups.
    pub fn node_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

impl<'de> Deserialize<'de> for SourceGroups {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        struct GroupsVisitor;

        impl<'de> Visitor<'de> for GroupsVisitor {
            type Value = SourceGroups;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of source hostnames to node lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut groups = BTreeMap::new();
                while let Some((hostname, nodes)) = map.next_entry::<String, Vec<WireNode>>()? {
                    if groups.contains_key(&hostname) {
                        return Err(de::Error::custom(format!(
                            "duplicate source {hostname:?}"
                        )));
                    }
                    groups.insert(hostname, nodes);
                }
                Ok(SourceGroups(groups))
            }
        }

        de.deserialize_map(GroupsVisitor)
    }
}

/// The response envelope of the dump endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpResponse {
    #[serde(default)]
    pub data: Option<SourceGroups>,
    /// Any non-null value marks a failed dump.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// A GeoJSON FeatureCollection of nodes.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        Self {
            kind: "FeatureCollection",
            features: nodes.into_iter().map(Feature::from_node).collect(),
        }
    }
}

/// A GeoJSON Feature describing one node.
#[derive(Debug, Clone, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    pub id: String,
    pub geometry: Point,
    pub properties: FeatureProperties,
}

impl Feature {
    pub fn from_node(node: &Node) -> Self {
        Self {
            kind: "Feature",
            id: node.addr.to_string(),
            geometry: Point {
                kind: "Point",
                coordinates: [node.longitude, node.latitude],
            },
            properties: FeatureProperties {
                owner: node.owner_name.clone(),
                contact: node.contact.clone(),
                details: node.details.clone(),
                pgp: node.pgp.clone(),
                status: node.status,
                source_id: node.source_id,
                retrieved: node.retrieved,
            },
        }
    }
}

/// GeoJSON point geometry, `[longitude, latitude]`.
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    #[serde(rename = "type")]
    kind: &'static str,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureProperties {
    pub owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgp: Option<PgpFingerprint>,
    pub status: u32,
    pub source_id: SourceId,
    pub retrieved: i64,
}

/// Parse the `since` parameter of a differential dump.
pub fn parse_since(s: &str) -> Result<OffsetDateTime, InvalidInput> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).map_err(|_| InvalidInput::Time)
}

/// Answers dump queries against the store.
#[derive(Debug, Clone)]
pub struct DumpService {
    store: Store,
    registry: SourceRegistry,
}

impl DumpService {
    pub fn new(store: Store, registry: SourceRegistry) -> Self {
        Self { store, registry }
    }

    /// Every stored node, local and cached.
    pub fn dump_all(&self) -> Result<Vec<Node>> {
        Ok(self.store.dump_nodes().context("failed to dump nodes")?)
    }

    /// Every node modified or retrieved strictly after `since`.
    pub fn dump_since(&self, since: OffsetDateTime) -> Result<Vec<Node>> {
        let nodes = self
            .store
            .dump_since(since.unix_timestamp())
            .with_context(|| format!("failed to dump nodes changed since {since}"))?;
        Ok(nodes)
    }

    /// Group nodes by the hostname of their source, for export.
    pub fn group_by_source(&self, nodes: &[Node]) -> Result<SourceGroups> {
        let mut hostnames: BTreeMap<SourceId, String> = BTreeMap::new();
        let mut groups: BTreeMap<String, Vec<WireNode>> = BTreeMap::new();
        for node in nodes {
            let hostname = match hostnames.get(&node.source_id) {
                Some(hostname) => hostname.clone(),
                None => {
                    let hostname = self.registry.id_to_host(node.source_id).ok_or_else(|| {
                        anyhow!(
                            "node {} references unknown source {}",
                            node.addr,
                            node.source_id
                        )
                    })?;
                    hostnames.insert(node.source_id, hostname.clone());
                    hostname
                }
            };
            groups
                .entry(hostname)
                .or_default()
                .push(WireNode::export(node));
        }
        Ok(SourceGroups(groups))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use testresult::TestResult;

    use super::*;
    use crate::node::tests::test_node;

    fn service() -> anyhow::Result<DumpService> {
        let store = Store::in_memory()?;
        let registry = SourceRegistry::new();
        let a = registry.resolve("a.example")?;
        let b = registry.resolve("b.example")?;
        store.add_node(&test_node("10.0.0.1"))?;
        let mut cached = Vec::new();
        for (i, (source, retrieved)) in [(a, 100), (a, 200), (b, 300)].into_iter().enumerate() {
            let mut node = test_node(&format!("10.0.1.{i}"));
            node.owner_email = String::new();
            node.source_id = source;
            node.retrieved = retrieved;
            cached.push(node);
        }
        store.cache_nodes(
            &[("a.example".to_string(), a), ("b.example".to_string(), b)],
            &cached,
        )?;
        Ok(DumpService::new(store, registry))
    }

    #[test]
    fn dump_since_is_subset_of_dump_all() -> TestResult {
        let service = service()?;
        let all = service.dump_all()?;
        assert_eq!(all.len(), 4);

        let t = OffsetDateTime::from_unix_timestamp(200)?;
        let since = service.dump_since(t)?;
        let expected: Vec<_> = all.iter().filter(|n| n.retrieved > 200).cloned().collect();
        assert_eq!(since, expected);

        let far_future = parse_since("9999-12-31T23:59:59Z")?;
        assert!(service.dump_since(far_future)?.is_empty());
        let far_past = parse_since("0001-01-01T00:00:00Z")?;
        assert_eq!(service.dump_since(far_past)?, all);
        Ok(())
    }

    #[test]
    fn parse_since_rejects_garbage() {
        assert_eq!(parse_since("yesterday"), Err(InvalidInput::Time));
        assert_eq!(parse_since("2014-01-01"), Err(InvalidInput::Time));
        assert!(parse_since("2014-01-01T10:00:00+02:00").is_ok());
    }

    #[test]
    fn group_by_source_partitions() -> TestResult {
        let service = service()?;
        let all = service.dump_all()?;
        let groups = service.group_by_source(&all)?;
        assert_eq!(groups.node_count(), all.len());
        let keys: HashSet<&str> = groups.0.keys().map(String::as_str).collect();
        assert_eq!(keys, HashSet::from(["local", "a.example", "b.example"]));
        assert_eq!(groups.0["local"].len(), 1);
        assert_eq!(groups.0["a.example"].len(), 2);
        assert_eq!(groups.0["b.example"].len(), 1);
        // emails are never exported
        assert!(groups.0["local"][0].owner_email.is_empty());
        Ok(())
    }

    #[test]
    fn group_by_source_fails_for_unknown_ids() {
        let service = DumpService::new(Store::in_memory().unwrap(), SourceRegistry::new());
        let mut node = test_node("10.0.0.1");
        node.source_id = SourceId::from(9);
        assert!(service.group_by_source(&[node]).unwrap_err().is_internal());
    }

    #[test]
    fn wire_format() -> TestResult {
        let json = r#"{
            "data": {
                "local": [{"address": "10.0.0.1", "latitude": 1.5, "longitude": 2.5,
                           "owner": "alice", "pgp": "DEADBEEF", "status": 3}],
                "b.example": []
            },
            "error": null
        }"#;
        let res: DumpResponse = serde_json::from_str(json)?;
        assert!(res.error.is_none());
        let groups = res.data.unwrap();
        let node = &groups.0["local"][0];
        assert_eq!(node.owner, "alice");
        assert_eq!(node.pgp.as_ref().map(|p| p.to_hex()).as_deref(), Some("DEADBEEF"));
        assert_eq!(node.retrieved, 0);

        let out = serde_json::to_value(WireNode::export(&test_node("10.0.0.1")))?;
        assert_eq!(out["address"], "10.0.0.1");
        assert!(out.get("owner_email").is_none());
        Ok(())
    }

    #[test]
    fn wire_format_rejects_duplicate_and_malformed_groups() {
        let dup = r#"{"data": {"local": [], "local": []}, "error": null}"#;
        assert!(serde_json::from_str::<DumpResponse>(dup).is_err());

        let partial = r#"{"data": {
            "a.example": [{"address": "10.0.0.1", "latitude": 1, "longitude": 2, "owner": "a"}],
            "b.example": [{"address": "not an ip", "latitude": 1, "longitude": 2, "owner": "b"}]
        }}"#;
        assert!(serde_json::from_str::<DumpResponse>(partial).is_err());
    }

    #[test]
    fn geojson() -> TestResult {
        let node = test_node("10.0.0.1");
        let collection = FeatureCollection::from_nodes([&node]);
        let json = serde_json::to_value(&collection)?;
        assert_eq!(json["type"], "FeatureCollection");
        let feature = &json["features"][0];
        assert_eq!(feature["type"], "Feature");
        assert_eq!(feature["id"], "10.0.0.1");
        assert_eq!(feature["geometry"]["coordinates"][0], node.longitude);
        assert_eq!(feature["geometry"]["coordinates"][1], node.latitude);
        assert_eq!(feature["properties"]["owner"], "alice");
        assert!(feature["properties"].get("owner_email").is_none());
        Ok(())
    }

    #[test]
    fn cached_nodes_keep_reported_modification_time() {
        let mut wire = WireNode::export(&test_node("10.0.0.1"));
        wire.owner_email = "leaked@example.org".to_string();
        let node = wire.clone().into_cached(SourceId::from(2), 1_500_000_000);
        assert_eq!(node.retrieved, 1_400_000_000);
        assert_eq!(node.last_seen, 1_500_000_000);
        assert_eq!(node.source_id, SourceId::from(2));
        assert!(node.owner_email.is_empty());

        wire.retrieved = 0;
        let node = wire.into_cached(SourceId::from(2), 1_500_000_000);
        assert_eq!(node.retrieved, 1_500_000_000);
    }
}
