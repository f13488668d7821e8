//! Integration tests for the WebSocket room
//!
//! A loopback tokio-tungstenite server plays the room: it acknowledges the
//! join, records what the client sends and closes the room on demand.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::{ScriptedInput, TEST_FORMAT};
use speaksea_session::audio::{
    AudioInput, CaptureSender, CaptureStream, DeviceArbiter, DeviceOwner,
};
use speaksea_session::credentials::ConnectionDetails;
use speaksea_session::error::{AudioError, SessionError};
use speaksea_session::room::{RealtimeRoom, RoomEvent, WsRoom};

/// What the server saw from the client
#[derive(Debug)]
enum Seen {
    Text(Value),
    Binary(Vec<u8>),
}

enum JoinReply {
    Joined,
    Reject(&'static str),
}

/// Accept one connection. Frames received after the join are forwarded on
/// `seen`; firing `close_room` sends `room.closed`.
async fn room_server(
    join_reply: JoinReply,
) -> (String, mpsc::UnboundedReceiver<Seen>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let (close_room, close_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let join: Value = serde_json::from_str(&text).unwrap();
                let _ = seen_tx.send(Seen::Text(join));
            }
            other => panic!("expected join, got {:?}", other),
        }

        let reply = match join_reply {
            JoinReply::Joined => json!({"type": "room.joined", "room_name": "exam_room_1"}),
            JoinReply::Reject(message) => {
                json!({"type": "error", "error": {"code": "forbidden", "message": message}})
            }
        };
        ws.send(Message::Text(reply.to_string())).await.unwrap();

        let mut close_rx = close_rx;
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = seen_tx.send(Seen::Text(serde_json::from_str(&text).unwrap()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = seen_tx.send(Seen::Binary(bytes));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
                _ = &mut close_rx => {
                    let closed = json!({"type": "room.closed", "reason": "agent left"});
                    let _ = ws.send(Message::Text(closed.to_string())).await;
                    let _ = ws.close(None).await;
                    break;
                }
            }
        }
    });

    (format!("ws://{}", addr), seen, close_room)
}

/// Input whose device takes a while to report its format, like a cold cpal
/// stream.
struct SlowInput {
    delay: Duration,
    inner: Arc<ScriptedInput>,
}

impl AudioInput for SlowInput {
    fn open(&self, sink: CaptureSender) -> Result<Box<dyn CaptureStream>, AudioError> {
        std::thread::sleep(self.delay);
        self.inner.open(sink)
    }
}

fn details(server_address: String) -> ConnectionDetails {
    ConnectionDetails {
        server_address,
        participant_token: "participant-token".to_string(),
        room_name: "exam_room_1".to_string(),
        participant_name: "candidate".to_string(),
        expiry: Utc::now() + chrono::Duration::minutes(15),
    }
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(Duration::from_secs(2), seen.recv())
        .await
        .expect("timed out waiting for client frame")
        .expect("server stopped")
}

fn text_type(seen: &Seen) -> Option<&str> {
    match seen {
        Seen::Text(value) => value["type"].as_str(),
        Seen::Binary(_) => None,
    }
}

#[tokio::test]
async fn pre_connect_audio_is_published_after_join() {
    let (address, mut seen, _close_room) = room_server(JoinReply::Joined).await;
    let devices = DeviceArbiter::new();
    let room = WsRoom::new(ScriptedInput::new(), devices.clone(), 10.0);

    // Capture starts before the connection exists
    room.set_microphone_enabled(true, true).await.unwrap();
    assert_eq!(devices.holder(), Some(DeviceOwner::RoomMicrophone));

    room.connect(&details(address)).await.unwrap();
    assert!(room.is_connected().await);

    let join = next_seen(&mut seen).await;
    assert_eq!(text_type(&join), Some("participant.join"));

    let publish = next_seen(&mut seen).await;
    match &publish {
        Seen::Text(value) => {
            assert_eq!(value["type"], "track.publish");
            assert_eq!(value["track"]["sample_rate"], TEST_FORMAT.sample_rate);
            assert_eq!(value["track"]["channels"], TEST_FORMAT.channels);
        }
        other => panic!("expected track.publish, got {:?}", other),
    }

    match next_seen(&mut seen).await {
        Seen::Binary(bytes) => {
            // Eight PCM16 samples from the scripted input
            assert_eq!(bytes.len(), 16);
            assert_eq!(&bytes[2..4], &512i16.to_le_bytes());
        }
        other => panic!("expected buffered audio, got {:?}", other),
    }

    room.set_microphone_enabled(false, false).await.unwrap();
    assert!(devices.holder().is_none());
    room.disconnect().await;
}

#[tokio::test]
async fn server_close_is_reported_as_disconnected() {
    let (address, mut seen, close_room) = room_server(JoinReply::Joined).await;
    let room = WsRoom::new(ScriptedInput::new(), DeviceArbiter::new(), 10.0);
    let mut events = room.subscribe();

    room.connect(&details(address)).await.unwrap();
    next_seen(&mut seen).await;
    close_room.send(()).unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        RoomEvent::Disconnected {
            reason: "agent left".to_string()
        }
    );
}

#[tokio::test]
async fn local_disconnect_sends_leave_without_reporting_loss() {
    let (address, mut seen, _close_room) = room_server(JoinReply::Joined).await;
    let room = WsRoom::new(ScriptedInput::new(), DeviceArbiter::new(), 10.0);
    let mut events = room.subscribe();

    room.connect(&details(address)).await.unwrap();
    next_seen(&mut seen).await;

    room.disconnect().await;
    assert!(!room.is_connected().await);

    let leave = next_seen(&mut seen).await;
    assert_eq!(text_type(&leave), Some("participant.leave"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn join_rejection_fails_connect() {
    let (address, _seen, _close_room) = room_server(JoinReply::Reject("token revoked")).await;
    let room = WsRoom::new(ScriptedInput::new(), DeviceArbiter::new(), 10.0);

    let err = room.connect(&details(address)).await.unwrap_err();
    match err {
        SessionError::ConnectionFailed(message) => assert_eq!(message, "token revoked"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!room.is_connected().await);
}

#[tokio::test]
async fn microphone_is_exclusive_with_turn_recording() {
    let devices = DeviceArbiter::new();
    let _turn = devices.acquire(DeviceOwner::TurnRecording).unwrap();
    let room = WsRoom::new(ScriptedInput::new(), devices.clone(), 10.0);

    let err = room.set_microphone_enabled(true, true).await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceBusy(_)));
}

#[tokio::test]
async fn live_microphone_keeps_the_device_until_disabled() {
    let (address, mut seen, _close_room) = room_server(JoinReply::Joined).await;
    let devices = DeviceArbiter::new();
    let room = WsRoom::new(ScriptedInput::new(), devices.clone(), 10.0);

    room.set_microphone_enabled(true, true).await.unwrap();
    room.connect(&details(address)).await.unwrap();
    next_seen(&mut seen).await;
    next_seen(&mut seen).await;

    // The published track still owns the device after the buffer flushed
    assert_eq!(devices.holder(), Some(DeviceOwner::RoomMicrophone));
    assert!(devices.acquire(DeviceOwner::TurnRecording).is_err());

    room.set_microphone_enabled(false, false).await.unwrap();
    assert!(devices.acquire(DeviceOwner::TurnRecording).is_ok());
    room.disconnect().await;
}

#[tokio::test]
async fn opening_the_microphone_does_not_stall_the_runtime() {
    let input = ScriptedInput::new();
    let room = Arc::new(WsRoom::new(
        Arc::new(SlowInput {
            delay: Duration::from_millis(300),
            inner: input.clone(),
        }),
        DeviceArbiter::new(),
        10.0,
    ));

    let enabling = tokio::spawn({
        let room = room.clone();
        async move { room.set_microphone_enabled(true, true).await }
    });

    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(!enabling.is_finished());

    enabling.await.unwrap().unwrap();
    assert_eq!(input.opened.load(std::sync::atomic::Ordering::SeqCst), 1);

    room.set_microphone_enabled(false, false).await.unwrap();
    room.set_microphone_enabled(true, true).await.unwrap();
    assert_eq!(input.opened.load(std::sync::atomic::Ordering::SeqCst), 2);
    room.set_microphone_enabled(false, false).await.unwrap();
}
