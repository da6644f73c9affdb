//! Chatr Library
//!
//! A line-oriented TCP chat relay: the server associates every connection
//! with a display name and fans each received line out to all connected
//! peers, along with the live roster of names. The client session speaks the
//! same newline-delimited protocol from the other side.

pub mod client;
pub mod config;
pub mod connection;
pub mod metrics;
pub mod protocol;
pub mod shutdown;

pub use client::{ChatPresenter, ClientEvent, ClientSession};
pub use config::Config;
pub use connection::{ChatServer, ConnectionRegistry};
pub use metrics::RelayMetrics;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the chat relay
pub type Result<T> = anyhow::Result<T>;
