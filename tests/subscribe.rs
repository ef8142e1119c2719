mod common;

use common::*;
use serde_json::json;

use riptide::protocol::event;
use riptide::{ChannelConfig, ChannelState, Payload, PostgresFilter, SubscribeStatus};

#[tokio::test]
async fn basic_subscribe_reaches_joined() {
    let (client, _server, mut session) = connected(|c| c).await;

    let channel = client.channel("t1", ChannelConfig::default());
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    assert_eq!(join.topic, "t1");
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.join_ref, join.reference, "join push ref is the join ref");
    assert_eq!(channel.state(), ChannelState::Joining);

    session.send_frame(&ok_reply(&join, json!({"postgres_changes": []})));

    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);
    assert_eq!(channel.state(), ChannelState::Joined);
}

#[tokio::test]
async fn join_payload_carries_channel_config() {
    let (client, _server, mut session) = connected(|c| c).await;

    let channel = client.channel(
        "t1",
        ChannelConfig::default().broadcast(true, true).private(),
    );
    let (callback, _statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    let config = &join.payload.json().expect("json payload")["config"];
    assert_eq!(config["broadcast"], json!({"self": true, "ack": true}));
    assert_eq!(config["private"], json!(true));
    assert_eq!(config["presence"]["enabled"], json!(false));
    assert_eq!(config["postgres_changes"], json!([]));
}

#[tokio::test]
async fn second_subscribe_is_a_no_op() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, _join) = join_channel(&client, &mut session, "t1").await;

    let (callback, _statuses) = status_recorder();
    channel.subscribe(callback);

    assert!(
        session.recv_frame(SHORT).await.is_none(),
        "no second join frame"
    );
    assert_eq!(channel.state(), ChannelState::Joined);
}

#[tokio::test]
async fn join_error_reply_errors_the_channel() {
    let (client, _server, mut session) = connected(|c| c).await;

    let channel = client.channel("t1", ChannelConfig::default());
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    session.send_frame(&error_reply(&join, json!({"reason": "unauthorized"})));

    assert_eq!(
        next_status(&mut statuses).await,
        SubscribeStatus::ChannelError
    );
    assert_eq!(channel.state(), ChannelState::Errored);
}

#[tokio::test]
async fn postgres_ids_are_stamped_and_dispatched() {
    let (client, _server, mut session) = connected(|c| c).await;

    let changes = Recorder::new();
    let sink = changes.clone();
    let channel = client.channel("t1", ChannelConfig::default());
    channel.on_postgres_changes(
        PostgresFilter::new("INSERT", "public")
            .table("users")
            .filter("id=eq.1"),
        move |change| sink.push(change.clone()),
    );
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    let filters = &join.payload.json().expect("json")["config"]["postgres_changes"];
    assert_eq!(
        filters,
        &json!([{"event": "INSERT", "schema": "public", "table": "users", "filter": "id=eq.1"}])
    );

    session.send_frame(&ok_reply(
        &join,
        json!({"postgres_changes": [{
            "event": "INSERT", "schema": "public", "table": "users",
            "filter": "id=eq.1", "id": "srv-1",
        }]}),
    ));
    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);

    session.send_frame(&riptide::Frame::new(
        None,
        None,
        "t1",
        event::POSTGRES_CHANGES,
        Payload::Json(json!({
            "ids": ["srv-1"],
            "data": {
                "type": "INSERT",
                "schema": "public",
                "table": "users",
                "commit_timestamp": "2020-01-01 00:00:00",
                "columns": [{"name": "id", "type": "int4"}],
                "record": {"id": "1"},
            },
        })),
    ));

    // Drain until the callback ran; dispatch happens on the ingress task.
    tokio::time::timeout(WAIT, async {
        while changes.len() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("change dispatched");

    let change = &changes.items()[0];
    assert_eq!(change.event_type, "INSERT");
    assert_eq!(change.schema, "public");
    assert_eq!(change.table, "users");
    assert_eq!(change.new.get("id"), Some(&json!(1.0)));
    assert!(change.old.is_empty());
}

#[tokio::test]
async fn postgres_event_with_unknown_id_is_not_dispatched() {
    let (client, _server, mut session) = connected(|c| c).await;

    let changes: Recorder<riptide::PostgresChange> = Recorder::new();
    let sink = changes.clone();
    let channel = client.channel("t1", ChannelConfig::default());
    channel.on_postgres_changes(
        PostgresFilter::new("*", "public"),
        move |change| sink.push(change.clone()),
    );
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    session.send_frame(&ok_reply(
        &join,
        json!({"postgres_changes": [{"event": "*", "schema": "public", "id": 11}]}),
    ));
    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);

    session.send_frame(&riptide::Frame::new(
        None,
        None,
        "t1",
        event::POSTGRES_CHANGES,
        Payload::Json(json!({
            "ids": [99],
            "data": {"type": "INSERT", "schema": "public", "table": "t",
                     "commit_timestamp": "", "columns": [], "record": {}},
        })),
    ));

    tokio::time::sleep(SHORT).await;
    assert_eq!(changes.len(), 0);
}

#[tokio::test]
async fn postgres_handshake_mismatch_fails_the_subscription() {
    let (client, _server, mut session) = connected(|c| c).await;

    let channel = client.channel("t1", ChannelConfig::default());
    channel.on_postgres_changes(
        PostgresFilter::new("INSERT", "public").table("users"),
        |_| {},
    );
    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);

    let join = session.recv_frame(WAIT).await.expect("join frame");
    // Server answers with a different filter at index 0.
    session.send_frame(&ok_reply(
        &join,
        json!({"postgres_changes": [{
            "event": "UPDATE", "schema": "public", "table": "users", "id": 7,
        }]}),
    ));

    let mut saw_error = false;
    for _ in 0..3 {
        let (status, error) = tokio::time::timeout(WAIT, statuses.recv())
            .await
            .expect("status")
            .expect("open");
        if status == SubscribeStatus::ChannelError {
            assert!(error.expect("error attached").contains("mismatch"));
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "subscription must fail with CHANNEL_ERROR");
    assert_eq!(channel.state(), ChannelState::Errored);

    let leave = session.recv_frame(WAIT).await.expect("leave frame");
    assert_eq!(leave.event, "phx_leave");
}

#[tokio::test]
async fn broadcast_events_dispatch_by_filter() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, _join) = join_channel(&client, &mut session, "t1").await;

    let hits = Recorder::new();
    let sink = hits.clone();
    channel.on_broadcast("ping", move |event, payload| {
        sink.push((event.to_string(), payload.clone()));
    });
    let misses = Recorder::new();
    let sink = misses.clone();
    channel.on_broadcast("other", move |event, payload| {
        sink.push((event.to_string(), payload.clone()));
    });

    session.send_frame(&riptide::Frame::new(
        None,
        None,
        "t1",
        event::BROADCAST,
        Payload::Json(json!({"event": "ping", "payload": {"n": 1}})),
    ));

    tokio::time::timeout(WAIT, async {
        while hits.len() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("broadcast dispatched");

    assert_eq!(hits.items()[0], ("ping".to_string(), json!({"n": 1})));
    assert_eq!(misses.len(), 0, "filtered binding must not fire");
}

#[tokio::test]
async fn bad_frame_is_dropped_and_socket_survives() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, _join) = join_channel(&client, &mut session, "t1").await;

    session.send_raw(riptide::WireMessage::Text("this is not a frame".into()));
    session.send_raw(riptide::WireMessage::Binary(vec![9, 9, 9]));
    tokio::time::sleep(SHORT).await;

    assert!(client.is_connected(), "socket stays open after bad frames");
    assert_eq!(channel.state(), ChannelState::Joined);
}

#[tokio::test]
async fn on_message_hook_violation_stops_dispatch() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, _join) = join_channel(&client, &mut session, "t1").await;

    // A hook that swallows payloads violates the contract.
    channel.on_message(|_event, _payload, _ref| None);

    let hits: Recorder<()> = Recorder::new();
    let sink = hits.clone();
    channel.on_broadcast("ping", move |_, _| sink.push(()));

    session.send_frame(&riptide::Frame::new(
        None,
        None,
        "t1",
        event::BROADCAST,
        Payload::Json(json!({"event": "ping", "payload": {"n": 1}})),
    ));
    tokio::time::sleep(SHORT).await;
    assert_eq!(hits.len(), 0, "BadHook aborts dispatch");
}

#[tokio::test]
async fn second_channel_on_topic_leaves_the_first() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (first, _join) = join_channel(&client, &mut session, "t1").await;

    let second = client.channel("t1", ChannelConfig::default());
    let (callback, _statuses) = status_recorder();
    second.subscribe(callback);

    let mut saw_leave = false;
    let mut saw_join = false;
    for _ in 0..3 {
        let Some(frame) = session.recv_frame(WAIT).await else {
            break;
        };
        match frame.event.as_str() {
            "phx_leave" => saw_leave = true,
            "phx_join" => saw_join = true,
            _ => {}
        }
        if saw_leave && saw_join {
            break;
        }
    }
    assert!(saw_join, "second channel joins");
    assert!(saw_leave, "first channel is told to leave");
    drop(first);
}
