mod common;

use std::time::Duration;

use common::*;
use serde_json::json;

use riptide::protocol::event;
use riptide::{Frame, HeartbeatStatus, Payload};

const HEARTBEAT: Duration = Duration::from_millis(5000);

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_closes_the_socket() {
    let (client, mut server) = paired_client(|c| c.heartbeat_interval(HEARTBEAT));
    let beats = Recorder::new();
    let sink = beats.clone();
    client.on_heartbeat(move |status| sink.push(status));

    client.connect().await.expect("connect");
    let mut session = server.accept().await;

    tokio::time::sleep(Duration::from_millis(5100)).await;
    let heartbeat = session.recv_frame(WAIT).await.expect("first heartbeat");
    assert_eq!(heartbeat.topic, "phoenix");
    assert_eq!(heartbeat.event, "heartbeat");
    assert!(heartbeat.reference.is_some());

    // No reply; the next tick must give up on the connection.
    tokio::time::sleep(Duration::from_millis(5000)).await;
    assert_eq!(
        session.client_close(),
        Some((1000, "heartbeat timeout".to_string())),
        "socket closed with code 1000 and the heartbeat reason"
    );

    let statuses = beats.items();
    assert!(statuses.contains(&HeartbeatStatus::Sent));
    assert!(statuses.contains(&HeartbeatStatus::Timeout));
    assert!(!statuses.contains(&HeartbeatStatus::Ok));
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeat_keeps_the_socket_alive() {
    let (client, mut server) = paired_client(|c| c.heartbeat_interval(HEARTBEAT));
    let beats = Recorder::new();
    let sink = beats.clone();
    client.on_heartbeat(move |status| sink.push(status));

    client.connect().await.expect("connect");
    let mut session = server.accept().await;

    tokio::time::sleep(Duration::from_millis(5100)).await;
    let heartbeat = session.recv_frame(WAIT).await.expect("first heartbeat");

    session.send_frame(&Frame::new(
        None,
        heartbeat.reference.clone(),
        "phoenix",
        event::REPLY,
        Payload::Json(json!({"status": "ok", "response": {}})),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::sleep(Duration::from_millis(5000)).await;
    let second = session.recv_frame(WAIT).await.expect("second heartbeat");
    assert_eq!(second.event, "heartbeat");
    assert_ne!(second.reference, heartbeat.reference);
    assert!(session.client_close().is_none(), "socket stays open");

    let statuses = beats.items();
    assert!(statuses.contains(&HeartbeatStatus::Ok));
    assert!(!statuses.contains(&HeartbeatStatus::Timeout));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_leads_to_reconnect() {
    let (client, mut server) = paired_client(|c| c.heartbeat_interval(HEARTBEAT));
    client.connect().await.expect("connect");
    let session = server.accept().await;

    // Two unanswered ticks close the socket; the reconnect backoff then
    // establishes a fresh one.
    tokio::time::sleep(Duration::from_millis(10200)).await;
    assert!(session.client_close().is_some());

    let replacement = server.accept().await;
    assert_eq!(server.connect_count(), 2);
    drop(replacement);
    let _ = client;
}
