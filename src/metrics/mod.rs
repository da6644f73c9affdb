//! Metrics Module
//! 
//! Prometheus instrumentation for the relay and its scrape endpoint.

pub mod collector;
pub mod server;

pub use collector::RelayMetrics;
pub use server::MetricsServer;
