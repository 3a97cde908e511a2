//! The main server which combines the HTTP API with the background sync and verification tasks.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use iroh_metrics::metrics::start_metrics_server;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    http::HttpServer,
    mail::Mailer,
    state::AppState,
    store::Store,
    sync::{spawn_sync_loop, SyncEngine},
    verify::spawn_maintenance_loop,
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config, mailer: Arc<dyn Mailer>) -> Result<()> {
    let path = Config::store_path()?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create data dir at {dir:?}"))?;
    }
    let store = Store::persistent(&path)?;
    let server = Server::spawn(config, store, mailer).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The directory server.
pub struct Server {
    state: AppState,
    http_server: Option<HttpServer>,
    sync: SyncEngine,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    metrics_task: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * A HTTP server task, if `config.http` is not empty
    /// * A task caching the child maps, if any are configured
    /// * A task expiring registrations and resending verification emails, unless
    ///   verification is disabled
    pub async fn spawn(config: Config, store: Store, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let state = AppState::new(&config, store, mailer)?;
        info!(
            name = %config.name,
            sources = state.registry.len(),
            read_only = config.read_only,
            "starting node directory"
        );

        let metrics_addr = config.metrics_addr();
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                start_metrics_server(addr).await?;
            }
            Ok(())
        });

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let sync = SyncEngine::new(
            state.registry.clone(),
            config.sync.timeout,
            config.hostname.clone(),
        )?;
        tasks.push(spawn_sync_loop(
            sync.clone(),
            state.store.clone(),
            config.child_map_addresses(),
            config.sync.interval,
            config.sync.max_cache_age,
            cancel.child_token(),
        ));

        if !config.verification.disabled {
            tasks.push(spawn_maintenance_loop(
                state.verification.clone(),
                config.verification.maintenance_interval,
                cancel.child_token(),
            ));
        }

        let http_server = match config.http {
            Some(http) => Some(HttpServer::spawn(http, state.clone()).await?),
            None => None,
        };

        Ok(Self {
            state,
            http_server,
            sync,
            cancel,
            tasks,
            metrics_task,
        })
    }

    /// The shared state of the running server.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The engine fetching child maps.
    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    /// Get the bound address of the HTTP server, if one is running.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().map(|s| s.http_addr())
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(?err, "background task panicked");
            }
        }
        if let Some(http_server) = self.http_server {
            http_server.shutdown().await?;
        }
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails.
    pub async fn run_until_error(self) -> Result<()> {
        if let Some(http_server) = self.http_server {
            http_server.run_until_done().await?;
        }
        self.cancel.cancel();
        self.metrics_task.abort();
        Ok(())
    }

    /// Spawn a server suitable for testing.
    ///
    /// It serves HTTP on localhost, keeps its store in memory and hands verification emails to
    /// `mailer`. `configure` may adjust the config before the server starts.
    ///
    /// It returns the server handle and the [`Url`](url::Url) of the HTTP server.
    #[cfg(test)]
    pub async fn spawn_for_tests(
        mailer: Arc<dyn Mailer>,
        configure: impl FnOnce(&mut Config),
    ) -> Result<(Self, url::Url)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::{config::MetricsConfig, http::HttpConfig};

        let mut config = Config::default();
        config.http = Some(HttpConfig {
            port: 0,
            bind_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        });
        config.metrics = Some(MetricsConfig::disabled());
        configure(&mut config);

        let store = Store::in_memory()?;
        let server = Self::spawn(config, store, mailer).await?;
        let http_addr = server.http_addr().context("http is set")?;
        let http_url = format!("http://{http_addr}/").parse()?;
        Ok((server, http_url))
    }
}
