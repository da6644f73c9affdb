//! Connection Handler
//!
//! Drives one accepted connection through its lifecycle: handshake,
//! registration, the idle-bounded read loop, and the departure cleanup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::registry::{BroadcastReport, CloseNotice, ConnectionId, ConnectionRegistry};
use crate::metrics::RelayMetrics;
use crate::protocol::{codec, DisconnectReason, SERVER_SENDER};
use crate::Result;

/// How a handled connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The peer went away or the server shut down before a handshake arrived
    Abandoned,
    /// The first frame was not a handshake
    Rejected,
    /// A registered connection left the chat
    Departed { name: String, reason: DisconnectReason },
}

enum ReadEvent {
    Line(std::io::Result<Option<String>>),
    IdleTimeout,
    Closed,
    Shutdown,
}

/// Serves one accepted connection
pub struct ConnectionHandler {
    id: ConnectionId,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    idle_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            id,
            addr,
            registry,
            metrics,
            idle_timeout,
        }
    }

    /// Run the connection to completion.
    ///
    /// Errors only if the registry refuses the connection; every socket
    /// failure is folded into the returned outcome.
    #[instrument(skip(self, stream, shutdown_rx), fields(connection_id = %self.id, addr = %self.addr))]
    pub async fn run<S>(self, stream: S, mut shutdown_rx: broadcast::Receiver<()>) -> Result<ConnectionOutcome>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();

        let first = tokio::select! {
            result = codec::read_frame(&mut reader, &mut buf) => result,
            _ = shutdown_rx.recv() => {
                debug!("Shutdown before handshake");
                return Ok(ConnectionOutcome::Abandoned);
            }
        };

        let line = match first {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Connection closed before handshake");
                return Ok(ConnectionOutcome::Abandoned);
            }
            Err(e) => {
                debug!("Error reading handshake: {}", e);
                return Ok(ConnectionOutcome::Abandoned);
            }
        };

        let name = match codec::parse_handshake(&line) {
            Some(name) => name,
            None => {
                warn!("Invalid handshake from {}", self.addr);
                self.metrics.handshake_failed();
                if let Err(e) = write_half.write_all(&codec::encode_handshake_error()).await {
                    debug!("Failed to send handshake error: {}", e);
                }
                let _ = write_half.shutdown().await;
                return Ok(ConnectionOutcome::Rejected);
            }
        };

        let mut close_notice = self
            .registry
            .register(self.id, &name, Some(self.addr), Box::new(write_half))
            .await?;
        self.metrics.set_registered_users(self.registry.len().await);

        let report = self.registry.broadcast_roster().await;
        self.record(&report);
        let report = self
            .registry
            .broadcast(SERVER_SENDER, &format!("{} has joined the chat.", name))
            .await;
        self.record(&report);
        info!("Client {} joined as '{}'", self.addr, name);

        let reason = self
            .read_loop(&mut reader, &mut buf, &name, &mut close_notice, &mut shutdown_rx)
            .await;

        self.depart(&name, &reason).await;
        Ok(ConnectionOutcome::Departed { name, reason })
    }

    /// Relay lines until the connection ends
    async fn read_loop<R>(
        &self,
        reader: &mut BufReader<ReadHalf<R>>,
        buf: &mut Vec<u8>,
        name: &str,
        close_notice: &mut CloseNotice,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> DisconnectReason
    where
        R: AsyncRead + AsyncWrite + Send + Unpin,
    {
        loop {
            // The deadline is renewed for every line, so only idle peers time out
            let event = tokio::select! {
                result = timeout(self.idle_timeout, codec::read_frame(reader, buf)) => match result {
                    Ok(read) => ReadEvent::Line(read),
                    Err(_) => ReadEvent::IdleTimeout,
                },
                _ = close_notice.closed() => ReadEvent::Closed,
                _ = shutdown_rx.recv() => ReadEvent::Shutdown,
            };

            match event {
                ReadEvent::Line(Ok(None)) => return DisconnectReason::Eof,
                ReadEvent::Line(Err(e)) => {
                    warn!("Error reading from {}: {}", self.addr, e);
                    return DisconnectReason::ReadError(e.to_string());
                }
                ReadEvent::Line(Ok(Some(line))) => {
                    self.metrics.message_relayed();
                    let report = self.registry.broadcast(name, line.trim()).await;
                    self.record(&report);
                }
                ReadEvent::IdleTimeout => {
                    info!("Client {} timed out", self.addr);
                    self.metrics.idle_timeout();
                    return DisconnectReason::IdleTimeout;
                }
                ReadEvent::Closed => return DisconnectReason::Closed,
                ReadEvent::Shutdown => return DisconnectReason::Shutdown,
            }
        }
    }

    /// Unregister, announce the departure, then refresh the roster
    async fn depart(&self, name: &str, reason: &DisconnectReason) {
        let name = self
            .registry
            .unregister(self.id)
            .await
            .unwrap_or_else(|| name.to_string());
        self.metrics.set_registered_users(self.registry.len().await);

        let report = self
            .registry
            .broadcast(SERVER_SENDER, &format!("{} has left the chat.", name))
            .await;
        self.record(&report);
        let report = self.registry.broadcast_roster().await;
        self.record(&report);

        info!("Client {} ('{}') disconnected: {}", self.addr, name, reason);
    }

    fn record(&self, report: &BroadcastReport) {
        self.metrics.record_fan_out(report.delivered, report.evicted.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncBufReadExt, DuplexStream, Lines, ReadBuf};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RelayMetrics>,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            let (shutdown_tx, _) = broadcast::channel(1);
            Self {
                registry: Arc::new(ConnectionRegistry::new()),
                metrics: Arc::new(RelayMetrics::new().unwrap()),
                shutdown_tx,
            }
        }

        fn spawn(
            &self,
            id: u64,
            idle_timeout: Duration,
        ) -> (
            tokio::task::JoinHandle<Result<ConnectionOutcome>>,
            tokio::io::WriteHalf<DuplexStream>,
            Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        ) {
            let (server_side, client_side) = tokio::io::duplex(4096);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let task = tokio::spawn(self.handler(id, idle_timeout).run(server_side, shutdown_rx));
            let (read, write) = tokio::io::split(client_side);
            (task, write, BufReader::new(read).lines())
        }

        fn handler(&self, id: u64, idle_timeout: Duration) -> ConnectionHandler {
            ConnectionHandler::new(
                ConnectionId::new(id),
                "127.0.0.1:40000".parse().unwrap(),
                self.registry.clone(),
                self.metrics.clone(),
                idle_timeout,
            )
        }
    }

    /// Reads from a duplex pipe; writes are discarded until `broken` is set,
    /// after which every write fails
    struct FlakyStream {
        inbound: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inbound).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.broken.load(Ordering::SeqCst) {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away")))
            } else {
                Poll::Ready(Ok(buf.len()))
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn next(lines: &mut Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_rejected() {
        let harness = Harness::new();
        let (task, mut write, mut lines) = harness.spawn(1, Duration::from_secs(60));

        write.write_all(b"hello\n").await.unwrap();

        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("Invalid handshake. Expected USERNAME:<yourname>")
        );
        assert_eq!(next(&mut lines).await, None);
        assert_eq!(task.await.unwrap().unwrap(), ConnectionOutcome::Rejected);
        assert!(harness.registry.is_empty().await);
        assert_eq!(harness.metrics.handshake_failures(), 1);
    }

    #[tokio::test]
    async fn test_empty_name_registers_as_guest() {
        let harness = Harness::new();
        let (task, mut write, mut lines) = harness.spawn(1, Duration::from_secs(60));

        write.write_all(b"USERNAME:\n").await.unwrap();

        assert_eq!(next(&mut lines).await.as_deref(), Some("USERS:Guest"));
        assert_eq!(
            next(&mut lines).await.as_deref(),
            Some("[SERVER] Guest has joined the chat.")
        );
        assert_eq!(harness.registry.names().await, vec!["Guest".to_string()]);

        write.shutdown().await.unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ConnectionOutcome::Departed {
                name: "Guest".to_string(),
                reason: DisconnectReason::Eof,
            }
        );
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_eof_before_handshake_is_abandoned() {
        let harness = Harness::new();
        let (task, mut write, _lines) = harness.spawn(1, Duration::from_secs(60));

        write.shutdown().await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), ConnectionOutcome::Abandoned);
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_lines_are_trimmed_and_echoed() {
        let harness = Harness::new();
        let (_task, mut write, mut lines) = harness.spawn(1, Duration::from_secs(60));

        write.write_all(b"USERNAME:Alice\n").await.unwrap();
        next(&mut lines).await;
        next(&mut lines).await;

        write.write_all(b"  hello there \r\n").await.unwrap();
        assert_eq!(next(&mut lines).await.as_deref(), Some("[Alice] hello there"));
        assert_eq!(harness.metrics.messages_relayed(), 1);
    }

    #[tokio::test]
    async fn test_idle_connection_times_out_and_is_announced() {
        let harness = Harness::new();
        let (idle_task, mut idle_write, mut idle_lines) = harness.spawn(1, Duration::from_millis(500));
        idle_write.write_all(b"USERNAME:Idle\n").await.unwrap();
        next(&mut idle_lines).await;
        next(&mut idle_lines).await;

        let (_busy_task, mut busy_write, mut busy_lines) = harness.spawn(2, Duration::from_secs(60));
        busy_write.write_all(b"USERNAME:Busy\n").await.unwrap();
        next(&mut busy_lines).await;
        assert_eq!(
            next(&mut busy_lines).await.as_deref(),
            Some("[SERVER] Busy has joined the chat.")
        );

        let outcome = idle_task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ConnectionOutcome::Departed {
                name: "Idle".to_string(),
                reason: DisconnectReason::IdleTimeout,
            }
        );
        assert_eq!(harness.metrics.idle_timeouts(), 1);

        let mut seen = Vec::new();
        while let Some(line) = next(&mut busy_lines).await {
            let done = line == "USERS:Busy";
            seen.push(line);
            if done {
                break;
            }
        }
        assert!(seen.contains(&"[SERVER] Idle has left the chat.".to_string()));
        assert_eq!(harness.registry.names().await, vec!["Busy".to_string()]);
    }

    #[tokio::test]
    async fn test_steady_traffic_resets_idle_deadline() {
        let harness = Harness::new();
        let (task, mut write, mut lines) = harness.spawn(1, Duration::from_millis(300));
        write.write_all(b"USERNAME:Chatty\n").await.unwrap();
        next(&mut lines).await;
        next(&mut lines).await;

        // total elapsed time exceeds the idle timeout, each gap does not
        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            write.write_all(format!("msg {}\n", i).as_bytes()).await.unwrap();
            assert_eq!(next(&mut lines).await, Some(format!("[Chatty] msg {}", i)));
        }

        assert!(!task.is_finished());
        assert!(harness.registry.contains(ConnectionId::new(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_signal_runs_cleanup() {
        let harness = Harness::new();
        let (task, mut write, mut lines) = harness.spawn(1, Duration::from_secs(60));
        write.write_all(b"USERNAME:Alice\n").await.unwrap();
        next(&mut lines).await;
        next(&mut lines).await;

        harness.shutdown_tx.send(()).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ConnectionOutcome::Departed {
                name: "Alice".to_string(),
                reason: DisconnectReason::Shutdown,
            }
        );
        assert!(harness.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_relayed_lossily() {
        let harness = Harness::new();
        let (task, mut write, mut lines) = harness.spawn(1, Duration::from_secs(60));
        write.write_all(b"USERNAME:Alice\n").await.unwrap();
        next(&mut lines).await;
        next(&mut lines).await;

        write.write_all(b"caf\xe9 ok\n").await.unwrap();
        assert_eq!(next(&mut lines).await.as_deref(), Some("[Alice] caf\u{FFFD} ok"));

        write.write_all(b"still here\n").await.unwrap();
        assert_eq!(next(&mut lines).await.as_deref(), Some("[Alice] still here"));
        assert!(!task.is_finished());
        assert!(harness.registry.contains(ConnectionId::new(1)).await);
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_dropped_at_eof() {
        let harness = Harness::new();
        let (_bob_task, mut bob_write, mut bob_lines) = harness.spawn(1, Duration::from_secs(60));
        bob_write.write_all(b"USERNAME:Bob\n").await.unwrap();
        next(&mut bob_lines).await;
        next(&mut bob_lines).await;

        let (alice_task, mut alice_write, _alice_lines) = harness.spawn(2, Duration::from_secs(60));
        alice_write.write_all(b"USERNAME:Alice\n").await.unwrap();
        next(&mut bob_lines).await;
        assert_eq!(
            next(&mut bob_lines).await.as_deref(),
            Some("[SERVER] Alice has joined the chat.")
        );

        alice_write.write_all(b"no newline").await.unwrap();
        alice_write.shutdown().await.unwrap();

        assert_eq!(
            alice_task.await.unwrap().unwrap(),
            ConnectionOutcome::Departed {
                name: "Alice".to_string(),
                reason: DisconnectReason::Eof,
            }
        );
        assert_eq!(
            next(&mut bob_lines).await.as_deref(),
            Some("[SERVER] Alice has left the chat.")
        );
        assert_eq!(next(&mut bob_lines).await.as_deref(), Some("USERS:Bob"));
        assert_eq!(harness.metrics.messages_relayed(), 0);
    }

    #[tokio::test]
    async fn test_evicted_peer_departs_and_is_announced() {
        let harness = Harness::new();
        let (_watcher_task, mut watcher_write, mut watcher_lines) =
            harness.spawn(1, Duration::from_secs(60));
        watcher_write.write_all(b"USERNAME:Watcher\n").await.unwrap();
        next(&mut watcher_lines).await;
        next(&mut watcher_lines).await;

        let (inbound, mut feed) = tokio::io::duplex(1024);
        let broken = Arc::new(AtomicBool::new(false));
        let stream = FlakyStream {
            inbound,
            broken: broken.clone(),
        };
        let victim_task = tokio::spawn(
            harness
                .handler(2, Duration::from_secs(60))
                .run(stream, harness.shutdown_tx.subscribe()),
        );
        feed.write_all(b"USERNAME:Victim\n").await.unwrap();
        next(&mut watcher_lines).await;
        assert_eq!(
            next(&mut watcher_lines).await.as_deref(),
            Some("[SERVER] Victim has joined the chat.")
        );

        broken.store(true, Ordering::SeqCst);
        watcher_write.write_all(b"hello\n").await.unwrap();

        assert_eq!(next(&mut watcher_lines).await.as_deref(), Some("[Watcher] hello"));
        assert_eq!(
            next(&mut watcher_lines).await.as_deref(),
            Some("[SERVER] Victim has left the chat.")
        );
        assert_eq!(next(&mut watcher_lines).await.as_deref(), Some("USERS:Watcher"));

        assert_eq!(
            victim_task.await.unwrap().unwrap(),
            ConnectionOutcome::Departed {
                name: "Victim".to_string(),
                reason: DisconnectReason::Closed,
            }
        );
        assert_eq!(harness.metrics.peers_evicted(), 1);
        assert_eq!(harness.registry.names().await, vec!["Watcher".to_string()]);
        drop(feed);
    }
}
