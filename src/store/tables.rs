use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeAddr, SourceId};

/// Source id (big endian) followed by the 16 byte node address.
pub type NodeKey = [u8; 20];

pub const NODES_TABLE: TableDefinition<&NodeKey, &[u8]> = TableDefinition::new("nodes-1");
pub const SOURCES_TABLE: TableDefinition<&str, u32> = TableDefinition::new("cached-maps-1");
pub const TICKETS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("verify-queue-1");

/// A registration waiting for its email confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// The node to add once confirmed.
    pub node: Node,
    /// Whether the confirmation email was delivered.
    pub delivered: bool,
    /// Unix timestamp after which the ticket can no longer be confirmed.
    pub expires: i64,
}

impl Ticket {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires <= now
    }
}

pub fn node_key(source: SourceId, addr: &NodeAddr) -> NodeKey {
    let mut key = [0u8; 20];
    key[..4].copy_from_slice(&source.to_be_bytes());
    key[4..].copy_from_slice(addr.as_bytes());
    key
}

/// Inclusive key range covering every node of `source`.
pub fn source_range(source: SourceId) -> (NodeKey, NodeKey) {
    let mut lo = [0u8; 20];
    lo[..4].copy_from_slice(&source.to_be_bytes());
    let mut hi = [0xffu8; 20];
    hi[..4].copy_from_slice(&source.to_be_bytes());
    (lo, hi)
}

pub fn source_of_key(key: &NodeKey) -> SourceId {
    let mut id = [0u8; 4];
    id.copy_from_slice(&key[..4]);
    SourceId::from(u32::from_be_bytes(id))
}

pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    postcard::to_stdvec(node).context("failed to encode node")
}

pub fn decode_node(bytes: &[u8]) -> Result<Node> {
    postcard::from_bytes(bytes).context("failed to decode stored node")
}

pub fn encode_ticket(ticket: &Ticket) -> Result<Vec<u8>> {
    postcard::to_stdvec(ticket).context("failed to encode ticket")
}

pub fn decode_ticket(bytes: &[u8]) -> Result<Ticket> {
    postcard::from_bytes(bytes).context("failed to decode stored ticket")
}

pub fn get_node(
    table: &impl ReadableTable<&'static NodeKey, &'static [u8]>,
    key: &NodeKey,
) -> Result<Option<Node>> {
    let Some(row) = table.get(key)? else {
        return Ok(None);
    };
    let node = decode_node(row.value())?;
    Ok(Some(node))
}

pub fn get_ticket(
    table: &impl ReadableTable<u64, &'static [u8]>,
    token: u64,
) -> Result<Option<Ticket>> {
    let Some(row) = table.get(token)? else {
        return Ok(None);
    };
    let ticket = decode_ticket(row.value())?;
    Ok(Some(ticket))
}
