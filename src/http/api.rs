//! Handlers of the `/api` routes.

use std::net::SocketAddr;

use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection},
        ConnectInfo, Query, State,
    },
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use iroh_metrics::inc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::{AppResult, Envelope};
use crate::{
    dump::{parse_since, Feature, FeatureCollection},
    error::{Error, InvalidInput},
    metrics::Metrics,
    node::{Node, NodeAddr, PgpFingerprint, SourceId},
    state::AppState,
    sync::source_name,
    verify::Token,
};

/// Where `GET /api/` points to.
pub const API_DOCS: &str = "https://github.com/ProjectMeshnet/nodeatlas/blob/master/API.md";

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope::ok(data)).into_response()
}

/// Set when the query string contains the key, with or without a value.
type Flag = Option<String>;

pub async fn root() -> Redirect {
    Redirect::to(API_DOCS)
}

#[derive(Debug, Serialize)]
pub struct StatusInfo {
    pub name: String,
    pub local_nodes: usize,
    pub cached_nodes: usize,
    pub cached_maps: usize,
}

pub async fn status(State(state): State<AppState>) -> AppResult<Response> {
    let counts = state.store.count_nodes()?;
    Ok(ok(StatusInfo {
        name: state.settings.name.clone(),
        local_nodes: counts.local,
        cached_nodes: counts.cached,
        cached_maps: state.settings.child_maps.len(),
    }))
}

pub async fn echo(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> Response {
    ok(addr.ip().to_canonical())
}

#[derive(Debug, Deserialize)]
pub struct NodeQuery {
    address: String,
    geojson: Flag,
}

pub async fn get_node(
    State(state): State<AppState>,
    query: Result<Query<NodeQuery>, QueryRejection>,
) -> AppResult<Response> {
    let Query(query) = query?;
    let addr: NodeAddr = query.address.parse().map_err(Error::from)?;
    let node = state
        .store
        .get_node(&addr)
        .map_err(|err| err.context(format!("failed to look up node {addr}")))?
        .ok_or(Error::NotFound)?;
    if query.geojson.is_some() {
        return Ok(ok(Feature::from_node(&node)));
    }
    let mut groups = state.dump.group_by_source(std::slice::from_ref(&node))?;
    let wire = groups
        .0
        .pop_first()
        .and_then(|(_, mut nodes)| nodes.pop())
        .ok_or_else(|| anyhow::anyhow!("node {addr} vanished while exporting"))?;
    Ok(ok(wire))
}

/// Fields of a registration or update form.
#[derive(Debug, Deserialize)]
pub struct NodeForm {
    address: String,
    latitude: f64,
    longitude: f64,
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    contact: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    pgp: String,
    #[serde(default)]
    status: u32,
}

impl NodeForm {
    fn into_node(self) -> Result<Node, InvalidInput> {
        let now = Node::now_unix();
        let node = Node {
            addr: self.address.parse()?,
            latitude: self.latitude,
            longitude: self.longitude,
            owner_name: self.name.trim().to_string(),
            owner_email: self.email.trim().to_string(),
            contact: non_empty(self.contact),
            details: non_empty(self.details),
            pgp: PgpFingerprint::parse_optional(&self.pgp)?,
            status: self.status,
            source_id: SourceId::LOCAL,
            retrieved: now,
            last_seen: now,
        };
        node.validate()?;
        Ok(node)
    }
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    form: Result<Form<NodeForm>, FormRejection>,
) -> AppResult<Response> {
    if state.settings.read_only {
        return Err(Error::ReadOnly.into());
    }
    let Form(form) = form?;
    let node = form.into_node().map_err(Error::from)?;
    node.validate_registrant().map_err(Error::from)?;
    let addr = node.addr;
    let existing = state
        .store
        .get_node(&addr)
        .map_err(|err| err.context(format!("failed to look up node {addr}")))?;
    if existing.is_some_and(|n| n.source_id.is_local()) {
        return Err(Error::from(InvalidInput::AddressTaken).into());
    }

    let requester = state.requester(remote.ip());
    if state.settings.verification_disabled || requester.is_admin {
        if !state
            .store
            .add_node(&node)
            .map_err(|err| err.context(format!("failed to add node {addr}")))?
        {
            return Err(Error::from(InvalidInput::AddressTaken).into());
        }
        inc!(Metrics, nodes_registered);
        info!(%addr, %remote, "node registered");
        return Ok(ok("node registered"));
    }

    let enqueued = state.verification.enqueue_default(node).await?;
    debug!(%addr, %remote, delivered = enqueued.delivered, "registration queued");
    match enqueued.delivered {
        true => Ok(ok("verification email sent")),
        false => Ok(ok("verification email will be resent")),
    }
}

pub async fn update(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    form: Result<Form<NodeForm>, FormRejection>,
) -> AppResult<Response> {
    if state.settings.read_only {
        return Err(Error::ReadOnly.into());
    }
    let Form(form) = form?;
    let mut node = form.into_node().map_err(Error::from)?;
    let addr = node.addr;
    if !state.requester(remote.ip()).may_act_for(&addr) {
        return Err(Error::IdentityMismatch.into());
    }
    let existing = state
        .store
        .get_node(&addr)
        .map_err(|err| err.context(format!("failed to look up node {addr}")))?
        .filter(|n| n.source_id.is_local())
        .ok_or(Error::NotFound)?;
    node.owner_email = existing.owner_email;
    let updated = state
        .store
        .update_node(&node)
        .map_err(|err| err.context(format!("failed to update node {addr}")))?;
    if !updated {
        return Err(Error::NotFound.into());
    }
    inc!(Metrics, nodes_updated);
    info!(%addr, %remote, "node updated");
    Ok(ok("node updated"))
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    id: u64,
}

pub async fn verify(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> AppResult<Response> {
    let Ok(Query(query)) = query else {
        info!(%remote, "attempted to verify malformed id");
        return Err(Error::UnknownToken.into());
    };
    let token = Token::from(query.id);
    match state.verification.confirm(token, &state.requester(remote.ip())) {
        Ok(node) => {
            debug!(addr = %node.addr, %remote, "registration confirmed");
            Ok(ok("successful"))
        }
        Err(Error::UnknownToken) => {
            info!(%remote, %token, "attempted to verify invalid id");
            Err(Error::UnknownToken.into())
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct AllQuery {
    since: Option<String>,
    geojson: Flag,
}

pub async fn all(
    State(state): State<AppState>,
    query: Result<Query<AllQuery>, QueryRejection>,
) -> AppResult<Response> {
    let Query(query) = query?;
    let nodes = match query.since.as_deref() {
        Some(since) => {
            let since = parse_since(since).map_err(Error::from)?;
            state.dump.dump_since(since)?
        }
        None => state.dump.dump_all()?,
    };
    if query.geojson.is_some() {
        return Ok(ok(FeatureCollection::from_nodes(&nodes)));
    }
    Ok(ok(state.dump.group_by_source(&nodes)?))
}

#[derive(Debug, Serialize)]
pub struct ChildMapInfo {
    pub name: String,
    pub hostname: String,
    /// Local id of the map, once its nodes were cached.
    pub id: Option<SourceId>,
}

pub async fn child_maps(State(state): State<AppState>) -> Response {
    let maps: Vec<_> = state
        .settings
        .child_maps
        .iter()
        .map(|map| ChildMapInfo {
            name: map.name.clone(),
            hostname: map.hostname.clone(),
            id: state.registry.host_to_id(source_name(&map.hostname)),
        })
        .collect();
    ok(maps)
}
