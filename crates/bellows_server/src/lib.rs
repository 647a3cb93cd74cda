//! Bellows control plane.
//!
//! Receives jobs materialized from code-forge events and dispatches them to
//! a fleet of remote workers over long-lived WebSocket connections. Owns the
//! worker registry, the scheduler, the per-connection protocol state
//! machine, the log fan-out to viewers, and the webhook relay tunnel for
//! self-hosted instances.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod hub;
pub mod intake;
pub mod log_fanout;
pub mod metrics;
pub mod relay;
pub mod routes;
pub mod session;
pub mod state;
pub mod status;

pub use config::ServerConfig;
pub use state::AppState;

use anyhow::{Context, Result};
use bellows_storage::{LogStore, Storage};
use status::{NoopStatusPoster, StatusPoster};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// A running server: its state, its bound address, and the shutdown handle.
pub struct Server {
    pub state: AppState,
    pub local_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    listener: Option<tokio::net::TcpListener>,
}

impl Server {
    /// Open storage, bind the listener, and start the dispatcher loops.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_poster(config, Arc::new(NoopStatusPoster)).await
    }

    pub async fn bind_with_poster(
        config: ServerConfig,
        poster: Arc<dyn StatusPoster>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data directory: {}", config.data_dir.display())
        })?;
        let storage = Storage::open(&config.database_path).await?;
        let logs = Arc::new(LogStore::new(config.data_dir.clone())?);

        let bind_addr = config.bind_addr;
        let state = AppState::new(config, storage, logs, poster);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let dispatcher = state.dispatcher.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { dispatcher.run(rx).await });
        }
        {
            let dispatcher = state.dispatcher.clone();
            let rx = shutdown_rx;
            tokio::spawn(async move { dispatcher.run_sweeper(rx).await });
        }

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        Ok(Self {
            state,
            local_addr,
            shutdown_tx,
            listener: Some(listener),
        })
    }

    /// Serve until the shutdown handle fires.
    pub async fn run(mut self) -> Result<()> {
        let listener = self.listener.take().expect("server already running");
        let app = routes::router(self.state.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
            .context("Server error")?;
        Ok(())
    }

    /// Flip the shutdown signal: both dispatcher loops exit at their next
    /// select and the HTTP listener drains.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}
