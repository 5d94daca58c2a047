//! Shared fixtures for the Chorus benchmarks.

use chorus_core::{
    ConnectionId, Delivery, DeliveryError, DeliverySink, GroupId, Hub, HubConfig, MemoryStore,
    StaticAuthorizer,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Group every fixture connection joins.
pub const BENCH_GROUP: &str = "bench";

/// User that sends in fixtures. Not subscribed to [`BENCH_GROUP`].
pub const BENCH_SENDER: &str = "sender";

/// Sink that accepts and drops every delivery.
#[derive(Debug, Default)]
pub struct CountingSink {
    delivered: AtomicU64,
}

impl CountingSink {
    /// Deliveries accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl DeliverySink for CountingSink {
    fn deliver(&self, _connection: &ConnectionId, _delivery: &Delivery) -> Result<(), DeliveryError> {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A hub with `subscribers` connections joined to [`BENCH_GROUP`] and one
/// sender connection `sender-conn`.
///
/// # Panics
///
/// Panics if the fixture cannot be set up.
pub async fn hub_with_subscribers(subscribers: usize) -> (Arc<Hub>, Arc<CountingSink>) {
    let members = (0..subscribers)
        .map(|i| format!("user-{i}"))
        .chain(std::iter::once(BENCH_SENDER.to_string()));
    let auth = StaticAuthorizer::new().with_group(BENCH_GROUP, members);
    let sink = Arc::new(CountingSink::default());
    let config = HubConfig {
        auto_join: false,
        ..HubConfig::default()
    };
    let hub = Arc::new(Hub::with_config(
        Arc::new(auth),
        Arc::new(MemoryStore::new()),
        sink.clone(),
        config,
    ));

    let group = GroupId::from(BENCH_GROUP);
    for i in 0..subscribers {
        let conn = ConnectionId::new(format!("conn-{i}"));
        hub.on_connect(conn.clone(), format!("user-{i}").into())
            .await
            .expect("connect");
        hub.on_join(&conn, &group).await.expect("join");
    }
    hub.on_connect("sender-conn".into(), BENCH_SENDER.into())
        .await
        .expect("connect sender");

    (hub, sink)
}
