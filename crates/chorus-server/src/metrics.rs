//! Metrics collection and export for Chorus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Presence and routing figures come from the hub's
//! event bus rather than from the socket handlers.

use chorus_core::{Hub, MessageRouted, PresenceEvent, PresenceState};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chorus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chorus_connections_active";
    pub const USERS_ONLINE: &str = "chorus_users_online";
    pub const PRESENCE_TRANSITIONS_TOTAL: &str = "chorus_presence_transitions_total";
    pub const FRAMES_TOTAL: &str = "chorus_frames_total";
    pub const FRAMES_BYTES: &str = "chorus_frames_bytes";
    pub const MESSAGES_ROUTED_TOTAL: &str = "chorus_messages_routed_total";
    pub const MESSAGE_BYTES: &str = "chorus_message_bytes";
    pub const DELIVERIES_TOTAL: &str = "chorus_deliveries_total";
    pub const DELIVERIES_FAILED_TOTAL: &str = "chorus_deliveries_failed_total";
    pub const LATENCY_SECONDS: &str = "chorus_latency_seconds";
    pub const ERRORS_TOTAL: &str = "chorus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one live connection");
    metrics::describe_counter!(
        names::PRESENCE_TRANSITIONS_TOTAL,
        "Online/offline transitions"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::MESSAGES_ROUTED_TOTAL,
        "Group messages sequenced and fanned out"
    );
    metrics::describe_histogram!(names::MESSAGE_BYTES, "Routed message content size");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Messages handed to subscriber connections"
    );
    metrics::describe_counter!(
        names::DELIVERIES_FAILED_TOTAL,
        "Deliveries rejected by a closed or full connection"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Feed presence and routing events of `hub` into the recorder.
pub fn observe_hub(hub: &Hub) {
    hub.events().subscribe(|event: &PresenceEvent| {
        record_presence(event.state);
        Ok(())
    });
    hub.events().subscribe(|event: &MessageRouted| {
        record_routed(event);
        Ok(())
    });
}

fn record_presence(state: PresenceState) {
    let label = match state {
        PresenceState::Online => {
            gauge!(names::USERS_ONLINE).increment(1.0);
            "online"
        }
        PresenceState::Offline => {
            gauge!(names::USERS_ONLINE).decrement(1.0);
            "offline"
        }
    };
    counter!(names::PRESENCE_TRANSITIONS_TOTAL, "state" => label).increment(1);
}

fn record_routed(event: &MessageRouted) {
    counter!(names::MESSAGES_ROUTED_TOTAL).increment(1);
    histogram!(names::MESSAGE_BYTES).record(event.size as f64);
    counter!(names::DELIVERIES_TOTAL).increment(event.delivered as u64);
    if event.failed > 0 {
        counter!(names::DELIVERIES_FAILED_TOTAL).increment(event.failed as u64);
    }
}

/// Record a frame crossing the socket.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record inbound processing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{ChannelSink, MemoryStore, StaticAuthorizer};
    use std::sync::Arc;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; must not panic.
        let _guard = ConnectionMetricsGuard::new();
    }

    #[tokio::test]
    async fn test_observe_hub_registers_handlers() {
        let hub = Hub::new(
            Arc::new(StaticAuthorizer::new().with_group("lobby", ["alice"])),
            Arc::new(MemoryStore::new()),
            Arc::new(ChannelSink::new(8)),
        );
        observe_hub(&hub);
        assert_eq!(hub.events().subscriber_count::<PresenceEvent>(), 1);
        assert_eq!(hub.events().subscriber_count::<MessageRouted>(), 1);

        hub.on_connect("conn-1".into(), "alice".into()).await.unwrap();
        hub.on_client_message(&"conn-1".into(), &"lobby".into(), "hi")
            .await
            .unwrap();
    }
}
