mod common;

use common::*;
use serde_json::{json, Value};

use agent_relay::downstream::DownstreamFrame;
use tokio::sync::mpsc::UnboundedReceiver;

fn drain_states(receiver: &mut UnboundedReceiver<DownstreamFrame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = receiver.try_recv() {
        if let DownstreamFrame::State(frame) = frame {
            frames.push(frame_value(&frame));
        }
    }
    frames
}

#[tokio::test]
async fn buffered_session_switch_replays_in_order() {
    // The subscriber stays connected while the gate holds three mutations,
    // then sees exactly three frames, in arrival order, once the gate opens.
    let app = TestApp::new();
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    drain_states(&mut receiver); // snapshot

    app.hub.enable_buffering("s2");
    app.ingest(&message_updated("s2", "msg_1", 100));
    app.ingest(&message_updated("s2", "msg_2", 200));
    app.ingest(&message_updated("s2", "msg_3", 300));
    assert!(drain_states(&mut receiver).is_empty(), "gate must hold frames");

    app.hub.disable_buffering("s2");
    let replayed = drain_states(&mut receiver);
    assert_eq!(replayed.len(), 3);

    let counts: Vec<usize> = replayed
        .iter()
        .map(|frame| frame["state"]["messages"].as_array().expect("messages").len())
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);

    // Live delivery resumes after the flush.
    app.ingest(&message_updated("s2", "msg_4", 400));
    let live = drain_states(&mut receiver);
    assert_eq!(live.len(), 1);
    assert_eq!(
        live[0]["state"]["messages"].as_array().expect("messages").len(),
        4
    );
}

#[tokio::test]
async fn enable_is_idempotent() {
    let app = TestApp::new();
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    drain_states(&mut receiver);

    app.hub.enable_buffering("s2");
    app.hub.enable_buffering("s2");
    app.ingest(&message_updated("s2", "msg_1", 100));

    app.hub.disable_buffering("s2");
    let replayed = drain_states(&mut receiver);
    assert_eq!(replayed.len(), 1, "no duplicates from double enable");
}

#[tokio::test]
async fn disable_with_empty_buffer_is_a_noop() {
    let app = TestApp::new();
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    drain_states(&mut receiver);

    app.hub.disable_buffering("s2");
    app.hub.disable_buffering("never-buffered");
    assert!(drain_states(&mut receiver).is_empty());
}

#[tokio::test]
async fn gate_is_a_passthrough_when_never_enabled() {
    let app = TestApp::new();
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    drain_states(&mut receiver);

    app.ingest(&message_updated("s2", "msg_1", 100));
    assert_eq!(drain_states(&mut receiver).len(), 1);
}

#[tokio::test]
async fn buffered_frames_flush_exactly_once() {
    let app = TestApp::new();
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    drain_states(&mut receiver);

    app.hub.enable_buffering("s2");
    app.ingest(&message_updated("s2", "msg_1", 100));
    app.hub.disable_buffering("s2");
    assert_eq!(drain_states(&mut receiver).len(), 1);

    // A second disable must not replay the already-flushed frame.
    app.hub.disable_buffering("s2");
    assert!(drain_states(&mut receiver).is_empty());
}

#[tokio::test]
async fn gate_only_holds_its_own_session() {
    let app = TestApp::new();
    let (_, mut gated) = app.hub.subscribe("s2").await;
    let (_, mut open) = app.hub.subscribe("s3").await;
    drain_states(&mut gated);
    drain_states(&mut open);

    app.hub.enable_buffering("s2");
    app.ingest(&message_updated("s2", "msg_1", 100));
    app.ingest(&message_updated("s3", "msg_2", 100));

    assert!(drain_states(&mut gated).is_empty());
    assert_eq!(drain_states(&mut open).len(), 1);

    app.hub.disable_buffering("s2");
    assert_eq!(drain_states(&mut gated).len(), 1);
}

#[tokio::test]
async fn subscriber_connecting_mid_buffer_gets_snapshot_then_replay() {
    let app = TestApp::new();
    app.hub.enable_buffering("s2");
    app.ingest(&message_updated("s2", "msg_1", 100));

    // The new subscription's snapshot reflects the merged state even while
    // frames are held back — the store never lags the gate.
    let (_, mut receiver) = app.hub.subscribe("s2").await;
    let frames = drain_states(&mut receiver);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["state"]["messages"][0]["info"]["id"], json!("msg_1"));

    app.hub.disable_buffering("s2");
    let replayed = drain_states(&mut receiver);
    assert_eq!(replayed.len(), 1);
}
