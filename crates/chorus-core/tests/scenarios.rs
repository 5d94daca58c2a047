//! End-to-end behaviour of the messaging core, driven through the `Hub`.

use chorus_core::{
    ChannelSink, ConnectionId, Delivery, Error, GroupId, Hub, HubConfig, MemoryStore,
    PresenceEvent, PresenceState, StaticAuthorizer, UserId,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Receiver;

struct Harness {
    hub: Arc<Hub>,
    sink: Arc<ChannelSink>,
    presence: Arc<Mutex<Vec<PresenceEvent>>>,
}

impl Harness {
    fn new() -> Self {
        let auth = StaticAuthorizer::new().with_group("G1", ["A", "B"]);
        let sink = Arc::new(ChannelSink::new(128));
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

        let presence = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&presence);
        hub.events().subscribe(move |event: &PresenceEvent| {
            seen.lock().unwrap().push(event.clone());
            Ok(())
        });

        Self {
            hub,
            sink,
            presence,
        }
    }

    async fn connect(&self, conn: &str, user: &str) -> Receiver<Delivery> {
        let rx = self.sink.register(conn.into());
        self.hub.on_connect(conn.into(), user.into()).await.unwrap();
        rx
    }

    fn disconnect(&self, conn: &str) {
        self.hub.on_disconnect(&conn.into());
        self.sink.unregister(&conn.into());
    }

    fn presence_events(&self) -> Vec<(String, PresenceState)> {
        self.presence
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.user_id.to_string(), e.state))
            .collect()
    }
}

fn next_message(rx: &mut Receiver<Delivery>) -> (u64, String) {
    match rx.try_recv() {
        Ok(Delivery::Message(message)) => (message.sequence, message.content.clone()),
        other => panic!("expected a message, got {:?}", other),
    }
}

#[tokio::test]
async fn hello_world_scenario() {
    let h = Harness::new();
    let g1 = GroupId::from("G1");

    let mut rx1 = h.connect("conn1", "A").await;
    h.hub.on_join(&"conn1".into(), &g1).await.unwrap();
    let mut rx2 = h.connect("conn2", "B").await;
    h.hub.on_join(&"conn2".into(), &g1).await.unwrap();

    h.hub.on_client_message(&"conn1".into(), &g1, "hello").await.unwrap();
    assert_eq!(next_message(&mut rx1), (1, "hello".to_string()));
    assert_eq!(next_message(&mut rx2), (1, "hello".to_string()));

    h.disconnect("conn2");

    let receipt = h.hub.on_client_message(&"conn1".into(), &g1, "world").await.unwrap();
    assert_eq!(receipt.sequence, 2);
    assert_eq!(receipt.delivered, 1);
    assert_eq!(next_message(&mut rx1), (2, "world".to_string()));
    assert!(rx2.try_recv().is_err());

    let subscribers = h.hub.membership().subscribers_of(&g1);
    assert_eq!(subscribers, HashSet::from([ConnectionId::from("conn1")]));
}

#[tokio::test]
async fn non_member_send_is_rejected() {
    let h = Harness::new();
    let g1 = GroupId::from("G1");
    h.connect("conn1", "A").await;
    h.hub.on_client_message(&"conn1".into(), &g1, "first").await.unwrap();

    h.connect("conn3", "C").await;
    let err = h
        .hub
        .on_client_message(&"conn3".into(), &g1, "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized { .. }));

    let err = h
        .hub
        .router()
        .send(&g1, &UserId::from("C"), "hi")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAuthorized { .. }));

    assert_eq!(h.hub.membership().last_sequence(&g1), 1);

    let err = h.hub.on_join(&"conn3".into(), &g1).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized { .. }));
    assert!(!h.hub.membership().is_subscribed(&g1, &"conn3".into()));
}

#[tokio::test]
async fn two_connections_one_offline_event() {
    let h = Harness::new();
    let user = UserId::from("A");
    h.connect("conn1", "A").await;
    h.connect("conn2", "A").await;
    assert_eq!(h.presence_events(), vec![("A".to_string(), PresenceState::Online)]);

    h.disconnect("conn1");
    assert!(h.hub.registry().is_online(&user));
    assert_eq!(h.presence_events().len(), 1);

    h.disconnect("conn2");
    assert!(!h.hub.registry().is_online(&user));
    assert_eq!(
        h.presence_events(),
        vec![
            ("A".to_string(), PresenceState::Online),
            ("A".to_string(), PresenceState::Offline),
        ]
    );
}

#[tokio::test]
async fn disconnect_twice_is_a_noop() {
    let h = Harness::new();
    h.connect("conn1", "A").await;

    assert!(h.hub.on_disconnect(&"conn1".into()).is_some());
    assert!(h.hub.on_disconnect(&"conn1".into()).is_none());
    assert!(h.hub.on_disconnect(&"conn1".into()).is_none());
    assert_eq!(h.presence_events().len(), 2);
}

#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let h = Harness::new();
    h.connect("conn1", "A").await;

    let err = h
        .hub
        .on_connect("conn1".into(), "B".into())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateConnection(_)));
    assert!(!h.hub.registry().is_online(&"B".into()));
}

#[tokio::test]
async fn online_matches_live_connections_through_a_sequence() {
    let h = Harness::new();
    let user = UserId::from("A");
    let steps: &[(bool, &str)] = &[
        (true, "c1"),
        (true, "c2"),
        (false, "c1"),
        (false, "c1"),
        (true, "c3"),
        (false, "c2"),
        (false, "c3"),
        (true, "c1"),
        (false, "c1"),
    ];

    let mut live = HashSet::new();
    let mut transitions = 0;
    for (connect, conn) in steps {
        let was_online = !live.is_empty();
        if *connect {
            h.connect(conn, "A").await;
            live.insert(*conn);
        } else {
            h.disconnect(conn);
            live.remove(conn);
        }
        if was_online != !live.is_empty() {
            transitions += 1;
        }
        assert_eq!(h.hub.registry().is_online(&user), !live.is_empty());
        assert_eq!(h.hub.registry().connections_for(&user).len(), live.len());
    }
    assert_eq!(h.presence_events().len(), transitions);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_and_disconnects_leave_no_dangling_subscribers() {
    let h = Arc::new(Harness::new());
    let g1 = GroupId::from("G1");

    let mut receivers = Vec::new();
    for i in 0..20 {
        let conn = format!("b-{i}");
        receivers.push(h.connect(&conn, "B").await);
        h.hub.on_join(&conn.as_str().into(), &g1).await.unwrap();
    }
    h.connect("sender", "A").await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let h = Arc::clone(&h);
        let g1 = g1.clone();
        tasks.push(tokio::spawn(async move {
            let mut seqs = Vec::new();
            for i in 0..25 {
                let receipt = h
                    .hub
                    .on_client_message(&"sender".into(), &g1, format!("m{i}"))
                    .await
                    .unwrap();
                seqs.push(receipt.sequence);
            }
            seqs
        }));
    }
    let closer = {
        let h = Arc::clone(&h);
        tokio::spawn(async move {
            for i in 0..20 {
                h.disconnect(&format!("b-{i}"));
                tokio::task::yield_now().await;
            }
        })
    };

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    closer.await.unwrap();

    all.sort_unstable();
    assert_eq!(all, (1..=100).collect::<Vec<_>>());
    assert!(h.hub.membership().subscribers_of(&g1).is_empty());
    assert!(!h.hub.registry().is_online(&"B".into()));

    // Whatever each connection did receive arrived in sequence order.
    for mut rx in receivers {
        let mut last = 0;
        while let Ok(delivery) = rx.try_recv() {
            if let Delivery::Message(message) = delivery {
                assert!(message.sequence > last);
                last = message.sequence;
            }
        }
    }
}

#[tokio::test]
async fn reused_connection_id_does_not_inherit_subscriptions() {
    let h = Harness::new();
    let g1 = GroupId::from("G1");

    h.connect("conn1", "A").await;
    h.hub.on_join(&"conn1".into(), &g1).await.unwrap();
    h.connect("conn2", "B").await;
    h.hub.on_join(&"conn2".into(), &g1).await.unwrap();
    h.disconnect("conn1");
    assert_eq!(
        h.hub.membership().subscribers_of(&g1),
        HashSet::from([ConnectionId::from("conn2")])
    );

    // C is not a member of G1.
    let mut rx = h.connect("conn1", "C").await;
    h.hub.on_client_message(&"conn2".into(), &g1, "members only").await.unwrap();
    assert!(rx.try_recv().is_err());
    assert!(!h.hub.membership().is_subscribed(&g1, &"conn1".into()));
}

#[tokio::test]
async fn panicking_presence_handler_leaves_state_intact() {
    let h = Harness::new();
    let g1 = GroupId::from("G1");
    h.hub.events().subscribe(|_event: &PresenceEvent| -> Result<(), chorus_core::HandlerError> {
        panic!("presence handler crashed")
    });
    let late = Arc::new(Mutex::new(0usize));
    {
        let late = Arc::clone(&late);
        h.hub.events().subscribe(move |_event: &PresenceEvent| {
            *late.lock().unwrap() += 1;
            Ok(())
        });
    }

    h.connect("conn1", "A").await;
    h.hub.on_join(&"conn1".into(), &g1).await.unwrap();
    let mut rx2 = h.connect("conn2", "B").await;
    h.hub.on_join(&"conn2".into(), &g1).await.unwrap();

    assert!(h.hub.registry().is_online(&"A".into()));
    assert_eq!(
        h.hub.registry().connections_for(&"A".into()),
        HashSet::from([ConnectionId::from("conn1")])
    );

    h.disconnect("conn1");
    assert!(!h.hub.registry().is_online(&"A".into()));
    assert!(h.hub.registry().connections_for(&"A".into()).is_empty());
    assert_eq!(
        h.hub.membership().subscribers_of(&g1),
        HashSet::from([ConnectionId::from("conn2")])
    );

    // The same user can come back and the transitions keep flowing.
    h.connect("conn3", "A").await;
    assert!(h.hub.registry().is_online(&"A".into()));
    assert_eq!(
        h.presence_events(),
        vec![
            ("A".to_string(), PresenceState::Online),
            ("B".to_string(), PresenceState::Online),
            ("A".to_string(), PresenceState::Offline),
            ("A".to_string(), PresenceState::Online),
        ]
    );
    assert_eq!(*late.lock().unwrap(), 4);

    let receipt = h.hub.on_client_message(&"conn2".into(), &g1, "still routing").await.unwrap();
    assert_eq!(receipt.delivered, 1);
    assert_eq!(next_message(&mut rx2), (1, "still routing".to_string()));
}
