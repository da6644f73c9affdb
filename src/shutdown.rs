//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT and drives the chat server through an orderly
//! stop: no new connections, every handler runs its departure cleanup, and
//! whatever is left after the drain timeout is closed.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};
use crate::connection::ChatServer;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Upper bound on the connection drain
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Wait for a shutdown signal (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Perform graceful shutdown of the chat server
    pub async fn shutdown_server(&self, server: &ChatServer) -> Result<()> {
        let start_time = Instant::now();
        info!(
            "Shutting down chat server with {} active connections (timeout: {:?})",
            server.get_active_connections(),
            self.timeout
        );

        server.initiate_shutdown();

        if tokio::time::timeout(self.timeout, server.wait_for_connections_to_close())
            .await
            .is_err()
        {
            warn!("Connection drain did not finish within {:?}", self.timeout);
        }

        // Anything still registered is closed outright
        server.stop().await?;

        info!("Chat server shut down in {:?}", start_time.elapsed());

        Ok(())
    }
}
