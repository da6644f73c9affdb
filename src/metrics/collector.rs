//! Metrics Collector

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::debug;

use crate::Result;

/// Counters and gauges describing relay activity
pub struct RelayMetrics {
    registry: Registry,

    connections_total: IntCounter,
    active_connections: IntGauge,
    registered_users: IntGauge,
    messages_relayed_total: IntCounter,
    frames_delivered_total: IntCounter,
    peers_evicted_total: IntCounter,
    handshake_failures_total: IntCounter,
    idle_timeouts_total: IntCounter,
}

impl RelayMetrics {
    /// Create a new collector with its own Prometheus registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "chatr_connections_total",
            "Total number of accepted TCP connections",
        )?;
        let active_connections = IntGauge::new(
            "chatr_active_connections",
            "Connections currently held by a handler",
        )?;
        let registered_users = IntGauge::new(
            "chatr_registered_users",
            "Connections that completed the handshake and are still registered",
        )?;
        let messages_relayed_total = IntCounter::new(
            "chatr_messages_relayed_total",
            "Chat lines received from clients and broadcast",
        )?;
        let frames_delivered_total = IntCounter::new(
            "chatr_frames_delivered_total",
            "Frames successfully written to a peer",
        )?;
        let peers_evicted_total = IntCounter::new(
            "chatr_peers_evicted_total",
            "Peers removed after a failed write",
        )?;
        let handshake_failures_total = IntCounter::new(
            "chatr_handshake_failures_total",
            "Connections rejected for a malformed handshake",
        )?;
        let idle_timeouts_total = IntCounter::new(
            "chatr_idle_timeouts_total",
            "Connections dropped by the idle read timeout",
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(registered_users.clone()))?;
        registry.register(Box::new(messages_relayed_total.clone()))?;
        registry.register(Box::new(frames_delivered_total.clone()))?;
        registry.register(Box::new(peers_evicted_total.clone()))?;
        registry.register(Box::new(handshake_failures_total.clone()))?;
        registry.register(Box::new(idle_timeouts_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            active_connections,
            registered_users,
            messages_relayed_total,
            frames_delivered_total,
            peers_evicted_total,
            handshake_failures_total,
            idle_timeouts_total,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Mirror the registry size after a join or leave
    pub fn set_registered_users(&self, count: usize) {
        self.registered_users.set(count as i64);
    }

    pub fn message_relayed(&self) {
        self.messages_relayed_total.inc();
    }

    /// Record the outcome of one fan-out pass
    pub fn record_fan_out(&self, delivered: usize, evicted: usize) {
        self.frames_delivered_total.inc_by(delivered as u64);
        if evicted > 0 {
            debug!(evicted, "Fan-out evicted peers");
            self.peers_evicted_total.inc_by(evicted as u64);
        }
    }

    pub fn handshake_failed(&self) {
        self.handshake_failures_total.inc();
    }

    pub fn idle_timeout(&self) {
        self.idle_timeouts_total.inc();
    }

    pub fn total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    pub fn messages_relayed(&self) -> u64 {
        self.messages_relayed_total.get()
    }

    pub fn peers_evicted(&self) -> u64 {
        self.peers_evicted_total.get()
    }

    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures_total.get()
    }

    pub fn idle_timeouts(&self) -> u64 {
        self.idle_timeouts_total.get()
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
