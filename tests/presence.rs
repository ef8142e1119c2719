mod common;

use common::*;
use serde_json::{json, Value};

use riptide::protocol::event;
use riptide::{ChannelConfig, Frame, Payload, SubscribeStatus};

fn presence_frame(topic: &str, presence_event: &str, payload: Value) -> Frame {
    Frame::new(None, None, topic, presence_event, Payload::Json(payload))
}

#[tokio::test]
async fn pending_diff_replays_after_first_state() {
    let (client, _server, mut session) = connected(|c| c).await;

    let log: Recorder<String> = Recorder::new();
    let channel = client.channel("t1", ChannelConfig::default());
    let join_log = log.clone();
    channel.on_presence_join(move |key, _current, joined| {
        join_log.push(format!("join:{key}:{}", joined.len()));
    });
    let leave_log = log.clone();
    channel.on_presence_leave(move |key, remaining, left| {
        leave_log.push(format!(
            "leave:{key}:remaining={}:left={}",
            remaining.len(),
            left.len()
        ));
    });
    let sync_log = log.clone();
    channel.on_presence_sync(move |_state| {
        sync_log.push("sync".to_string());
    });

    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);
    let join = session.recv_frame(WAIT).await.expect("join frame");
    assert_eq!(
        join.payload.json().unwrap()["config"]["presence"]["enabled"],
        json!(true),
        "presence bindings enable presence in the join config"
    );
    session.send_frame(&ok_reply(&join, json!({"postgres_changes": []})));
    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);

    // A diff before any snapshot must wait.
    session.send_frame(&presence_frame(
        "t1",
        event::PRESENCE_DIFF,
        json!({"joins": {}, "leaves": {"u2": {"metas": [{"phx_ref": "r"}]}}}),
    ));
    tokio::time::sleep(SHORT).await;
    assert!(log.items().is_empty(), "diff queued until the snapshot");

    session.send_frame(&presence_frame(
        "t1",
        event::PRESENCE_STATE,
        json!({
            "u1": {"metas": [{"phx_ref": "a"}]},
            "u2": {"metas": [{"phx_ref": "r"}]},
        }),
    ));

    tokio::time::timeout(WAIT, async {
        while !log.items().iter().any(|entry| entry == "sync") {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("sync fired");

    let entries = log.items();
    assert!(entries.contains(&"join:u1:1".to_string()));
    assert!(entries.contains(&"join:u2:1".to_string()));
    assert!(
        entries.contains(&"leave:u2:remaining=0:left=1".to_string()),
        "queued leave replays after the snapshot: {entries:?}"
    );
    let sync_position = entries.iter().position(|e| e == "sync").unwrap();
    let leave_position = entries
        .iter()
        .position(|e| e.starts_with("leave"))
        .unwrap();
    assert!(
        leave_position < sync_position,
        "join/leave fire before sync"
    );

    let state = channel.presence_state();
    assert_eq!(state.len(), 1);
    assert_eq!(state["u1"][0].presence_ref, "a");
}

#[tokio::test]
async fn applied_diff_updates_state_and_fires_sync() {
    let (client, _server, mut session) = connected(|c| c).await;

    let syncs: Recorder<usize> = Recorder::new();
    let channel = client.channel("t1", ChannelConfig::default());
    let sink = syncs.clone();
    channel.on_presence_sync(move |state| sink.push(state.len()));

    let (callback, mut statuses) = status_recorder();
    channel.subscribe(callback);
    let join = session.recv_frame(WAIT).await.expect("join");
    session.send_frame(&ok_reply(&join, json!({"postgres_changes": []})));
    assert_eq!(next_status(&mut statuses).await, SubscribeStatus::Subscribed);

    session.send_frame(&presence_frame(
        "t1",
        event::PRESENCE_STATE,
        json!({"u1": {"metas": [{"phx_ref": "a"}]}}),
    ));
    session.send_frame(&presence_frame(
        "t1",
        event::PRESENCE_DIFF,
        json!({"joins": {"u2": {"metas": [{"phx_ref": "b", "mood": "sunny"}]}}, "leaves": {}}),
    ));

    tokio::time::timeout(WAIT, async {
        while syncs.len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("two syncs");

    let state = channel.presence_state();
    assert_eq!(state.len(), 2);
    assert_eq!(state["u2"][0].payload.get("mood"), Some(&json!("sunny")));
}

#[tokio::test]
async fn track_and_untrack_push_presence_events() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, _join) = join_channel(&client, &mut session, "t1").await;

    let tracking = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.track(json!({"user": "u1"})).await })
    };
    let frame = session.recv_frame(WAIT).await.expect("track push");
    assert_eq!(frame.event, "presence");
    assert_eq!(
        frame.payload.json().unwrap(),
        &json!({"type": "presence", "event": "track", "payload": {"user": "u1"}})
    );
    session.send_frame(&ok_reply(&frame, json!({})));
    assert_eq!(
        tracking.await.expect("task").expect("status"),
        riptide::SendStatus::Ok
    );

    let untracking = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.untrack().await })
    };
    let frame = session.recv_frame(WAIT).await.expect("untrack push");
    assert_eq!(
        frame.payload.json().unwrap()["event"],
        json!("untrack")
    );
    session.send_frame(&ok_reply(&frame, json!({})));
    assert_eq!(
        untracking.await.expect("task").expect("status"),
        riptide::SendStatus::Ok
    );
}

#[tokio::test]
async fn presence_binding_after_join_resubscribes_with_presence_enabled() {
    let (client, _server, mut session) = connected(|c| c).await;
    let (channel, first_join) = join_channel(&client, &mut session, "t1").await;
    assert_eq!(
        first_join.payload.json().unwrap()["config"]["presence"]["enabled"],
        json!(false)
    );

    channel.on_presence_sync(|_state| {});

    let leave = session.recv_frame(WAIT).await.expect("leave frame");
    assert_eq!(leave.event, "phx_leave");
    session.send_frame(&ok_reply(&leave, json!({})));

    let second_join = session
        .recv_frame(WAIT)
        .await
        .expect("fresh join after reconfiguration");
    assert_eq!(second_join.event, "phx_join");
    assert_eq!(
        second_join.payload.json().unwrap()["config"]["presence"]["enabled"],
        json!(true)
    );
    session.send_frame(&ok_reply(&second_join, json!({"postgres_changes": []})));

    tokio::time::timeout(WAIT, async {
        while !channel.is_joined() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("joined again with presence enabled");
}
