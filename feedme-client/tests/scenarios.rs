//! End-to-end scenarios driven against `feedme_test_support::MockTransport`,
//! covering the reconciliation, timeout, and ordering properties the unit
//! tests in each module exercise only in isolation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use feedme_client::protocol::{
    Action, ActionResponse, Delta, DeltaOp, FeedOpenResponse, HandshakeResponse, SuccessMarker,
    WireMessage,
};
use feedme_client::{Client, ClientConfig, ClientEvent, FeedArgs, FeedEvent, FeedmeError};
use feedme_test_support::{MockServer, MockTransport};
use serde_json::json;

fn new_client(config: ClientConfig) -> (Client, MockServer) {
    let (transport, server) = MockTransport::pair();
    let client = Client::new(Box::new(transport), config);
    (client, server)
}

async fn connect_and_handshake(client: &Client, server: &mut MockServer) {
    let mut events = client.subscribe();
    client.connect().unwrap();
    assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connecting));
    server.accept_connect();
    let handshake = server.recv_sent().await.unwrap();
    assert!(matches!(handshake, WireMessage::Handshake(_)));
    server.deliver(&WireMessage::HandshakeResponse(HandshakeResponse {
        success: true,
        version: Some("1.0".into()),
    }));
    assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connect));
}

#[tokio::test]
async fn happy_path_connect_open_feed_and_call_action() {
    let (client, mut server) = new_client(ClientConfig::default());
    connect_and_handshake(&client, &mut server).await;

    let feed = client.feed("races", FeedArgs::new());
    feed.desire_open().unwrap();
    let (feed_name, feed_args) = match server.recv_sent().await.unwrap() {
        WireMessage::FeedOpen(open) => (open.feed_name, open.feed_args),
        other => panic!("expected FeedOpen, got {other:?}"),
    };
    assert!(matches!(feed.next_event().await.unwrap(), FeedEvent::Opening));
    server.deliver(&WireMessage::FeedOpenResponse(FeedOpenResponse::Success {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        success: SuccessMarker,
        feed_data: json!({"count": 0}),
    }));
    match feed.next_event().await.unwrap() {
        FeedEvent::Open(data) => assert_eq!(data, json!({"count": 0})),
        other => panic!("expected Open, got {other:?}"),
    }

    let action_fut = client.action("bump", json!({"by": 1}));
    let callback_id = match server.recv_sent().await.unwrap() {
        WireMessage::Action(Action { callback_id, .. }) => callback_id,
        other => panic!("expected Action, got {other:?}"),
    };
    server.deliver(&WireMessage::ActionResponse(ActionResponse::Success {
        callback_id,
        success: SuccessMarker,
        action_data: json!({"ok": true}),
    }));
    assert_eq!(action_fut.await.unwrap(), json!({"ok": true}));
}

#[tokio::test(start_paused = true)]
async fn action_timeout_then_late_success_is_ignored() {
    let config = ClientConfig::builder().action_timeout_ms(20).build().unwrap();
    let (client, mut server) = new_client(config);
    connect_and_handshake(&client, &mut server).await;

    let action_fut = client.action("slow", json!({}));
    let callback_id = match server.recv_sent().await.unwrap() {
        WireMessage::Action(Action { callback_id, .. }) => callback_id,
        other => panic!("expected Action, got {other:?}"),
    };

    tokio::time::advance(Duration::from_millis(25)).await;
    assert!(matches!(action_fut.await, Err(FeedmeError::Timeout)));

    // A late response for the now-timed-out callback id must not resurface
    // or otherwise disturb the client.
    server.deliver(&WireMessage::ActionResponse(ActionResponse::Success {
        callback_id,
        success: SuccessMarker,
        action_data: json!(1),
    }));

    // The client keeps working normally afterward.
    let second = client.action("fast", json!({}));
    let second_id = match server.recv_sent().await.unwrap() {
        WireMessage::Action(Action { callback_id, .. }) => callback_id,
        other => panic!("expected Action, got {other:?}"),
    };
    server.deliver(&WireMessage::ActionResponse(ActionResponse::Success {
        callback_id: second_id,
        success: SuccessMarker,
        action_data: json!("done"),
    }));
    assert_eq!(second.await.unwrap(), json!("done"));
}

#[tokio::test]
async fn delta_hash_mismatch_terminates_the_feed_and_sends_feed_close() {
    let config = ClientConfig::builder().reopen_max_attempts(0).build().unwrap();
    let (client, mut server) = new_client(config);
    connect_and_handshake(&client, &mut server).await;

    let feed = client.feed("leaderboard", FeedArgs::new());
    feed.desire_open().unwrap();
    let (feed_name, feed_args) = match server.recv_sent().await.unwrap() {
        WireMessage::FeedOpen(open) => (open.feed_name, open.feed_args),
        other => panic!("expected FeedOpen, got {other:?}"),
    };
    feed.next_event().await.unwrap(); // Opening
    server.deliver(&WireMessage::FeedOpenResponse(FeedOpenResponse::Success {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        success: SuccessMarker,
        feed_data: json!({"count": 0}),
    }));
    feed.next_event().await.unwrap(); // Open

    let mut events = client.subscribe();
    server.deliver(&WireMessage::ActionRevelation(feedme_client::protocol::ActionRevelation {
        action_name: "bump".into(),
        action_data: json!({}),
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        feed_deltas: vec![Delta {
            operation: DeltaOp::Set,
            path: vec!["count".into()],
            value: Some(json!(1)),
        }],
        feed_md5: Some("0".repeat(32)),
    }));

    // Both the client-level and feed-level failure events are required
    // (protocol §8 scenario 3): a bad hash is a bad server message AND the
    // feed it was about closes.
    match events.recv().await.unwrap() {
        ClientEvent::BadServerMessage(FeedmeError::InvalidHash(_)) => {}
        other => panic!("expected BadServerMessage(InvalidHash), got {other:?}"),
    }
    match feed.next_event().await.unwrap() {
        FeedEvent::Close(Some(FeedmeError::BadActionRevelation(_))) => {}
        other => panic!("expected Close(BadActionRevelation), got {other:?}"),
    }
    // reopenMaxAttempts = 0: no reopen, but the failure still sends FeedClose.
    assert!(matches!(server.recv_sent().await.unwrap(), WireMessage::FeedClose(_)));
}

#[tokio::test]
async fn reopen_limit_holds_the_feed_closed_after_r_terminations() {
    let config = ClientConfig::builder()
        .reopen_max_attempts(1)
        .reopen_trailing_ms(0)
        .build()
        .unwrap();
    let (client, mut server) = new_client(config);
    connect_and_handshake(&client, &mut server).await;

    let feed = client.feed("leaderboard", FeedArgs::new());
    feed.desire_open().unwrap();
    let (feed_name, feed_args) = match server.recv_sent().await.unwrap() {
        WireMessage::FeedOpen(open) => (open.feed_name, open.feed_args),
        other => panic!("expected FeedOpen, got {other:?}"),
    };
    feed.next_event().await.unwrap(); // Opening
    server.deliver(&WireMessage::FeedOpenResponse(FeedOpenResponse::Success {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        success: SuccessMarker,
        feed_data: json!({}),
    }));
    feed.next_event().await.unwrap(); // Open

    // First termination: one reopen is still permitted, so the client
    // reopens the feed automatically.
    server.deliver(&WireMessage::FeedTermination(feedme_client::protocol::FeedTermination {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        error_code: "GONE".into(),
        error_data: json!(null),
    }));
    match feed.next_event().await.unwrap() {
        FeedEvent::Close(Some(FeedmeError::Terminated { .. })) => {}
        other => panic!("expected Close(Terminated), got {other:?}"),
    }
    assert!(matches!(server.recv_sent().await.unwrap(), WireMessage::FeedOpen(_)));
    assert!(matches!(feed.next_event().await.unwrap(), FeedEvent::Opening));
    server.deliver(&WireMessage::FeedOpenResponse(FeedOpenResponse::Success {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        success: SuccessMarker,
        feed_data: json!({}),
    }));
    feed.next_event().await.unwrap(); // Open

    // Second termination: the throttle (R=1, lifetime-scoped) is now
    // exhausted, so no further FeedOpen is sent.
    server.deliver(&WireMessage::FeedTermination(feedme_client::protocol::FeedTermination {
        feed_name: feed_name.clone(),
        feed_args: feed_args.clone(),
        error_code: "GONE".into(),
        error_data: json!(null),
    }));
    match feed.next_event().await.unwrap() {
        FeedEvent::Close(Some(FeedmeError::Terminated { .. })) => {}
        other => panic!("expected Close(Terminated), got {other:?}"),
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(50), server.recv_sent())
            .await
            .is_err(),
        "no reopen should be attempted once the throttle is exhausted"
    );
}

#[tokio::test]
async fn disconnect_settles_actions_before_closing_feeds_before_the_client_event() {
    let config = ClientConfig::builder().reconnect(false).build().unwrap();
    let (client, mut server) = new_client(config);
    connect_and_handshake(&client, &mut server).await;

    let feed = client.feed("leaderboard", FeedArgs::new());
    feed.desire_open().unwrap();
    let (feed_name, feed_args) = match server.recv_sent().await.unwrap() {
        WireMessage::FeedOpen(open) => (open.feed_name, open.feed_args),
        other => panic!("expected FeedOpen, got {other:?}"),
    };
    feed.next_event().await.unwrap(); // Opening
    server.deliver(&WireMessage::FeedOpenResponse(FeedOpenResponse::Success {
        feed_name,
        feed_args,
        success: SuccessMarker,
        feed_data: json!({}),
    }));
    feed.next_event().await.unwrap(); // Open

    let action_fut = client.action("bump", json!({}));
    server.recv_sent().await.unwrap(); // Action frame, never answered.

    let mut events = client.subscribe();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    server.disconnect(None);

    let (action_result, feed_event, client_event) = tokio::join!(
        async {
            let r = action_fut.await;
            order.lock().unwrap().push("action");
            r
        },
        async {
            let e = feed.next_event().await;
            order.lock().unwrap().push("feed");
            e
        },
        async {
            let e = events.recv().await;
            order.lock().unwrap().push("client");
            e
        },
    );

    assert!(matches!(action_result, Err(FeedmeError::Disconnected)));
    assert!(matches!(feed_event, Some(FeedEvent::Close(Some(FeedmeError::Disconnected)))));
    assert!(matches!(client_event, Ok(ClientEvent::Disconnect(_))));
    assert_eq!(*order.lock().unwrap(), vec!["action", "feed", "client"]);
}

#[tokio::test(start_paused = true)]
async fn handshake_rejection_disconnects_without_scheduling_a_retry() {
    let (client, mut server) = new_client(ClientConfig::default());
    let mut events = client.subscribe();
    client.connect().unwrap();
    assert!(matches!(events.recv().await.unwrap(), ClientEvent::Connecting));
    server.accept_connect();
    server.recv_sent().await.unwrap(); // Handshake

    server.deliver(&WireMessage::HandshakeResponse(HandshakeResponse {
        success: false,
        version: None,
    }));
    match events.recv().await.unwrap() {
        ClientEvent::Disconnect(Some(FeedmeError::HandshakeRejected)) => {}
        other => panic!("expected Disconnect(HandshakeRejected), got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(120)).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(10), events.recv())
            .await
            .is_err(),
        "no reconnect attempt should ever be observed after a rejected handshake"
    );
}
