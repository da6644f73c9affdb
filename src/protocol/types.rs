//! Chat Protocol Types

/// Frames the relay sends to its clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Full list of currently registered display names
    Roster(Vec<String>),
    /// A line relayed from `sender` (a display name or `SERVER`)
    Chat { sender: String, text: String },
}

/// Why a registered connection left the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side of the connection
    Eof,
    /// Nothing was read within the idle timeout
    IdleTimeout,
    /// Reading from the socket failed
    ReadError(String),
    /// The registry dropped the connection after a failed write or `stop`
    Closed,
    /// The server is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Eof => write!(f, "connection closed by peer"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
            DisconnectReason::Closed => write!(f, "closed by server"),
            DisconnectReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}
