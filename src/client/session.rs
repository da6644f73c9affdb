//! Client Session
//!
//! One connection to the relay. Outbound text goes through [`ClientSession::send`];
//! inbound frames are read on a separate task and handed to a [`ChatPresenter`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::presenter::ChatPresenter;
use crate::protocol::{codec, ServerFrame};
use crate::Result;

/// A live connection to the relay
pub struct ClientSession {
    username: String,
    server_addr: SocketAddr,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    // Flips to `false` when the read loop ends
    link_rx: watch::Receiver<bool>,
    roster: Arc<RwLock<Vec<String>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Dial the relay, send the handshake and start the read loop
    pub async fn connect<P>(host: &str, port: u16, username: &str, presenter: P) -> Result<Self>
    where
        P: ChatPresenter,
    {
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("failed to connect to server at {}:{}", host, port))?;
        let server_addr = stream.peer_addr()?;
        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(&codec::encode_handshake(username))
            .await
            .context("failed to send username")?;
        info!("Connected to {} as '{}'", server_addr, username);

        let connected = Arc::new(AtomicBool::new(true));
        let (link_tx, link_rx) = watch::channel(true);
        let roster = Arc::new(RwLock::new(Vec::new()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            presenter,
            Arc::clone(&roster),
            Arc::clone(&connected),
            link_tx,
        ));

        Ok(Self {
            username: username.to_string(),
            server_addr,
            writer: Mutex::new(Some(writer)),
            connected,
            link_rx,
            roster,
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Names from the most recent roster frame
    pub async fn roster(&self) -> Vec<String> {
        self.roster.read().await.clone()
    }

    /// Send one line of text.
    ///
    /// Blank text and a closed session are ignored. Write failures are
    /// logged and dropped: the read loop notices a dead connection on its
    /// own and reports it through the presenter.
    pub async fn send(&self, text: &str) {
        if text.trim().is_empty() || !self.is_connected() {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.write_all(&codec::encode_outbound(text)).await {
                debug!("Dropping outbound message: {}", e);
            }
        }
    }

    /// Close the connection and cancel the read loop
    pub async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of connection failed: {}", e);
            }
        }

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        Ok(())
    }

    /// Wait until the connection is lost or the session is closed
    pub async fn wait(&self) {
        let mut link_rx = self.link_rx.clone();
        // An error means the read loop is gone, which is just as final
        let _ = link_rx.wait_for(|up| !*up).await;
    }
}

async fn read_loop<P>(
    reader: OwnedReadHalf,
    presenter: P,
    roster: Arc<RwLock<Vec<String>>>,
    connected: Arc<AtomicBool>,
    link_tx: watch::Sender<bool>,
) where
    P: ChatPresenter,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let reason = loop {
        match codec::read_frame(&mut reader, &mut buf).await {
            Ok(Some(line)) => match codec::parse_server_frame(&line) {
                Some(ServerFrame::Roster(names)) => {
                    *roster.write().await = names.clone();
                    presenter.roster_updated(&names);
                }
                Some(ServerFrame::Chat { sender, text }) => {
                    presenter.chat_received(&sender, &text, SystemTime::now());
                }
                None => debug!("Ignoring unrecognised frame: {:?}", line),
            },
            Ok(None) => break "Server closed the connection.".to_string(),
            Err(e) => break format!("Disconnected: {}", e),
        }
    };

    connected.store(false, Ordering::Relaxed);
    info!("{}", reason);
    presenter.connection_lost(&reason);
    link_tx.send_replace(false);
}
