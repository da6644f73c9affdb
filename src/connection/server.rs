//! Chat Relay Server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::handler::{ConnectionHandler, ConnectionOutcome};
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::config::Config;
use crate::metrics::RelayMetrics;
use crate::Result;

/// Accepts connections and runs one handler task per connection
pub struct ChatServer {
    config: Arc<Config>,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    active_connections: Arc<AtomicUsize>,
    next_connection_id: AtomicU64,
    handlers: Mutex<JoinSet<()>>,
    shutdown_flag: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ChatServer {
    /// Bind the listener on the configured host and port
    pub async fn bind(config: Arc<Config>, metrics: Arc<RelayMetrics>) -> Result<Self> {
        let address = config.server.address();

        info!("Binding TCP listener to {}", address);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to listen on {}", address))?;
        let local_addr = listener.local_addr()?;
        info!("Server started on {}", local_addr);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new()),
            metrics,
            active_connections: Arc::new(AtomicUsize::new(0)),
            next_connection_id: AtomicU64::new(1),
            handlers: Mutex::new(JoinSet::new()),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Accept connections until shutdown is initiated.
    ///
    /// A failed accept is logged and the loop keeps going.
    pub async fn start(&self) -> Result<()> {
        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            self.spawn_handler(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    async fn spawn_handler(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let connection_id = ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let handler = ConnectionHandler::new(
            connection_id,
            addr,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            self.config.server.idle_timeout,
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        let active_connections = Arc::clone(&self.active_connections);
        let metrics = Arc::clone(&self.metrics);

        let mut handlers = self.handlers.lock().await;

        // Reap finished handlers so the set does not grow with every connection
        while let Some(result) = handlers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("Connection handler panicked: {}", e);
                }
            }
        }

        handlers.spawn(async move {
            let start_time = Instant::now();
            active_connections.fetch_add(1, Ordering::Relaxed);
            metrics.connection_opened();

            match handler.run(stream, shutdown_rx).await {
                Ok(ConnectionOutcome::Departed { name, reason }) => {
                    debug!("Connection {} ('{}') ended: {}", connection_id, name, reason);
                }
                Ok(outcome) => {
                    debug!("Connection {} ended without registering: {:?}", connection_id, outcome);
                }
                Err(e) => {
                    error!("Error handling connection {}: {}", connection_id, e);
                }
            }

            metrics.connection_closed();
            active_connections.fetch_sub(1, Ordering::Relaxed);
            info!("Client disconnected: {} after {:?}", addr, start_time.elapsed());
        });
    }

    /// Close every registered connection and clear the registry.
    ///
    /// The accept loop keeps running; use [`initiate_shutdown`](Self::initiate_shutdown)
    /// to stop it.
    pub async fn stop(&self) -> Result<()> {
        let closed = self.registry.close_all().await;
        self.metrics.set_registered_users(0);
        info!("Server stopped, closed {} connections", closed);
        Ok(())
    }

    /// Number of connections currently held by a handler task
    pub fn get_active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get connection statistics
    pub async fn get_connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.get_active_connections(),
            registered_users: self.registry.len().await,
            total_connections_served: self.next_connection_id.load(Ordering::Relaxed).saturating_sub(1),
        }
    }

    /// Stop accepting and signal every handler to run its cleanup
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of chat server");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No listeners for shutdown signal: {}", e);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait for handler tasks to finish, aborting any left after the
    /// configured shutdown timeout
    pub async fn wait_for_connections_to_close(&self) -> Result<()> {
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let mut handlers = std::mem::take(&mut *self.handlers.lock().await);
        let start_time = Instant::now();

        info!(
            "Waiting for {} connection handlers to finish (timeout: {:?})",
            handlers.len(),
            shutdown_timeout
        );

        let drained = timeout(shutdown_timeout, async {
            while let Some(result) = handlers.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Connection handler panicked: {}", e);
                    }
                }
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All connections closed gracefully in {:?}", start_time.elapsed()),
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} handlers still running",
                    start_time.elapsed(),
                    handlers.len()
                );
                handlers.abort_all();
                while handlers.join_next().await.is_some() {}
            }
        }

        Ok(())
    }

    /// Gracefully shut down the server
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_connections_to_close().await?;
        self.stop().await
    }
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub registered_users: usize,
    pub total_connections_served: u64,
}
