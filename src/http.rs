//! HTTP API of the directory

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Instant,
};

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Request},
    handler::Handler,
    http::Method,
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use iroh_metrics::{inc, inc_by};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, span, warn, Level};

mod api;
mod error;
mod rate_limiting;

pub use self::{
    api::API_DOCS,
    error::{AppError, AppResult, Envelope},
};
use crate::{metrics::Metrics, state::AppState};

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 0.0.0.0 if unset)
    pub bind_addr: Option<IpAddr>,
}

/// The HTTP server serving the API
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
}

impl HttpServer {
    /// Spawn the server
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer> {
        let app = create_app(state);

        let mut tasks = JoinSet::new();

        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind http server to {bind_addr}"))?
            .into_std()?;
        let http_addr = listener.local_addr()?;
        let fut = axum_server::from_tcp(listener)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        info!("HTTP server listening on {http_addr}");
        tasks.spawn(fut);

        Ok(HttpServer { tasks, http_addr })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tasks.abort_all();
        self.run_until_done().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        // allow `GET` and `POST` when accessing the resource
        .allow_methods([Method::GET, Method::POST])
        // allow requests from any origin
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let conn_info = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .expect("connectinfo extension to be present");
        let span = span!(
        Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = %conn_info.0,
            );
        span
    });

    // configure rate limiting middleware
    let rate_limit = rate_limiting::create();

    // configure routes
    //
    // only registrations get a rate limit
    let router = Router::new()
        .route("/api", get(api::root))
        .route("/api/", get(api::root))
        .route("/api/status", get(api::status))
        .route("/api/echo", get(api::echo))
        .route(
            "/api/node",
            get(api::get_node).post(api::register.layer(rate_limit)),
        )
        .route("/api/update", post(api::update))
        .route("/api/verify", get(api::verify))
        .route("/api/all", get(api::all))
        .route("/api/child_maps", get(api::child_maps))
        .route("/healthcheck", get(|| async { "OK" }))
        .with_state(state);

    // configure app
    router
        .layer(cors)
        .layer(trace)
        .route_layer(middleware::from_fn(metrics_middleware))
}

/// Record request metrics.
// TODO: track the duration as a histogram, labelled by route.
async fn metrics_middleware(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    inc_by!(Metrics, http_requests_duration_ms, latency as u64);
    inc!(Metrics, http_requests);
    if status.is_success() {
        inc!(Metrics, http_requests_success);
    } else {
        inc!(Metrics, http_requests_error);
    }
    response
}
