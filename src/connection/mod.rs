//! Connection Management Module
//! 
//! The connection registry and broadcast engine, the per-connection handler,
//! and the server that accepts connections and spawns handlers.

pub mod handler;
pub mod registry;
pub mod server;

pub use handler::{ConnectionHandler, ConnectionOutcome};
pub use registry::{BroadcastReport, CloseNotice, ConnectionId, ConnectionRegistry, PeerWriter};
pub use server::{ChatServer, ConnectionStats};
