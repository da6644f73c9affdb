//! Presentation Surface

use std::io::Write;
use std::time::SystemTime;

use tokio::sync::mpsc;

/// Receives everything the session's read loop parses from the relay
pub trait ChatPresenter: Send + Sync + 'static {
    /// The full roster replaced the previous one
    fn roster_updated(&self, names: &[String]);

    fn chat_received(&self, sender: &str, text: &str, received_at: SystemTime);

    /// The connection is gone; no further calls follow
    fn connection_lost(&self, reason: &str);
}

/// Inbound activity as a value, for consumers that prefer a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    RosterUpdated(Vec<String>),
    ChatReceived {
        sender: String,
        text: String,
        received_at: SystemTime,
    },
    ConnectionLost(String),
}

impl ChatPresenter for mpsc::UnboundedSender<ClientEvent> {
    fn roster_updated(&self, names: &[String]) {
        let _ = self.send(ClientEvent::RosterUpdated(names.to_vec()));
    }

    fn chat_received(&self, sender: &str, text: &str, received_at: SystemTime) {
        let _ = self.send(ClientEvent::ChatReceived {
            sender: sender.to_string(),
            text: text.to_string(),
            received_at,
        });
    }

    fn connection_lost(&self, reason: &str) {
        let _ = self.send(ClientEvent::ConnectionLost(reason.to_string()));
    }
}

/// Plain line output on stdout
#[derive(Debug, Default)]
pub struct TerminalPresenter;

impl TerminalPresenter {
    fn print(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}

/// `HH:MM:SS` in UTC
pub fn format_clock(time: SystemTime) -> String {
    let stamp = humantime::format_rfc3339_seconds(time).to_string();
    stamp.get(11..19).unwrap_or(&stamp).to_string()
}

impl ChatPresenter for TerminalPresenter {
    fn roster_updated(&self, names: &[String]) {
        self.print(&format!("* Online: {}", names.join(", ")));
    }

    fn chat_received(&self, sender: &str, text: &str, received_at: SystemTime) {
        self.print(&format!("{} [{}] {}", format_clock(received_at), sender, text));
    }

    fn connection_lost(&self, reason: &str) {
        self.print(&format!("* {}", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_format_clock() {
        let time = UNIX_EPOCH + Duration::from_secs(13 * 3600 + 5 * 60 + 9);
        assert_eq!(format_clock(time), "13:05:09");
    }

    #[test]
    fn test_channel_presenter_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.roster_updated(&["Alice".to_string()]);
        tx.connection_lost("gone");

        assert_eq!(rx.try_recv().unwrap(), ClientEvent::RosterUpdated(vec!["Alice".to_string()]));
        assert_eq!(rx.try_recv().unwrap(), ClientEvent::ConnectionLost("gone".to_string()));
    }
}
