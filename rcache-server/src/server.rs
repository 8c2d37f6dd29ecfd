//! TCP replication server.

use crate::config::Config;
use crate::error::ServerError;
use crate::handler::{RequestHandler, ServerContext};
use crate::session::Session;
use crate::stats::run_stats_server;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Replication master: accepts satellite connections and serves cache
/// entries through per-connection [`Session`]s.
pub struct ReplicationServer {
    config: Config,
    handler: Arc<RequestHandler>,
    context: Arc<ServerContext>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl ReplicationServer {
    /// Binds the listener and prepares the server to run.
    pub async fn bind(config: Config, mut context: ServerContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.network.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        if context.replication.advertised_host.is_none() {
            context.replication.advertised_host = Some(local_addr.ip());
        }
        context.local_host = context
            .replication
            .advertised_host
            .unwrap_or_else(|| local_addr.ip());

        let (shutdown_tx, _) = broadcast::channel(1);
        let context = Arc::new(context);
        Ok(Self {
            config,
            handler: Arc::new(RequestHandler::new(context.clone())),
            context,
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        })
    }

    /// The bound listener address; useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| ServerError::Config("server already running".to_string()))?;

        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Replication server listening on {}", self.local_addr);

        if self.config.metrics.enabled {
            let addr = self.config.metrics.bind_addr;
            let stats = self.context.stats.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                if let Err(e) = run_stats_server(addr, stats, shutdown).await {
                    tracing::error!("Stats server error: {}", e);
                }
            });
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let persistent = self.context.replication.persistent_connections;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.network.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let handler = self.handler.clone();
                            let network = self.config.network.clone();
                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let session = Session::new(addr);
                                tracing::info!(session = %session.id, "Client connected: {}", addr);

                                let result = session
                                    .run(stream, handler, &network, persistent, &mut conn_shutdown)
                                    .await;

                                match result {
                                    Ok(()) => {}
                                    Err(ServerError::ShuttingDown) => {}
                                    Err(e) => {
                                        tracing::debug!(session = %session.id, "Connection {} error: {}", addr, e);
                                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                    }
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!(session = %session.id, "Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Replication server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Returns the shared server context.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }
}
