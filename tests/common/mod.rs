//! Test doubles shared by the integration tests.
//!
//! Each fake records what was asked of it and can be held at a `Gate` so a
//! test decides exactly when an asynchronous operation resolves.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};

use speaksea_session::audio::{
    AudioFormat, AudioInput, AudioOutput, CaptureEvent, CaptureSender, CaptureStream,
};
use speaksea_session::credentials::{ConnectionDetails, CredentialSource};
use speaksea_session::error::{
    AudioError, CredentialError, PlaybackError, SessionError, TransportError,
};
use speaksea_session::room::{RealtimeRoom, RoomEvent, ROOM_EVENT_CAPACITY};
use speaksea_session::settings::ExamSettings;
use speaksea_session::transport::{TurnReply, TurnRequest, TurnTransport};

/// Settings with no greeting and a short "session ended" window.
pub fn test_settings() -> ExamSettings {
    ExamSettings {
        greeting: None,
        session_ended_display_ms: 50,
        ..ExamSettings::default()
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Holds async operations until released.
#[derive(Clone)]
pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    pub fn open() -> Self {
        Self(Arc::new(watch::channel(true).0))
    }

    pub fn closed() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn close(&self) {
        self.0.send_replace(false);
    }

    pub fn release(&self) {
        self.0.send_replace(true);
    }

    pub async fn pass(&self) {
        let mut open = self.0.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Room
// ============================================================================

#[derive(Default)]
pub struct RoomStats {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub connected: AtomicBool,
    pub microphone_on: AtomicBool,
}

pub struct FakeRoom {
    events: broadcast::Sender<RoomEvent>,
    pub connect_gate: Gate,
    pub microphone_gate: Gate,
    pub disconnect_gate: Gate,
    pub stats: Arc<RoomStats>,
    connect_error: Mutex<Option<SessionError>>,
    microphone_error: Mutex<Option<SessionError>>,
}

impl FakeRoom {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: broadcast::channel(ROOM_EVENT_CAPACITY).0,
            connect_gate: Gate::open(),
            microphone_gate: Gate::open(),
            disconnect_gate: Gate::open(),
            stats: Arc::new(RoomStats::default()),
            connect_error: Mutex::new(None),
            microphone_error: Mutex::new(None),
        })
    }

    pub fn fail_next_connect(&self, error: SessionError) {
        *self.connect_error.lock().unwrap() = Some(error);
    }

    pub fn fail_next_microphone(&self, error: SessionError) {
        *self.microphone_error.lock().unwrap() = Some(error);
    }

    /// Deliver a notification as the transport would.
    pub fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::SeqCst)
    }

    pub fn microphone_on(&self) -> bool {
        self.stats.microphone_on.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeRoom for FakeRoom {
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    async fn connect(&self, _details: &ConnectionDetails) -> Result<(), SessionError> {
        self.connect_gate.pass().await;
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.connect_error.lock().unwrap().take() {
            return Err(error);
        }
        self.stats.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_gate.pass().await;
        self.stats.disconnects.fetch_add(1, Ordering::SeqCst);
        self.stats.connected.store(false, Ordering::SeqCst);
    }

    async fn set_microphone_enabled(
        &self,
        enabled: bool,
        _pre_connect_buffer: bool,
    ) -> Result<(), SessionError> {
        if enabled {
            self.microphone_gate.pass().await;
            if let Some(error) = self.microphone_error.lock().unwrap().take() {
                return Err(error);
            }
        }
        self.stats.microphone_on.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Credentials
// ============================================================================

#[derive(Default)]
pub struct SourceStats {
    pub fetches: AtomicUsize,
    pub failing: AtomicBool,
}

/// Issues fresh details on every fetch, or fails while `failing` is set.
#[derive(Clone, Default)]
pub struct FakeCredentialSource {
    pub stats: Arc<SourceStats>,
}

#[async_trait]
impl CredentialSource for FakeCredentialSource {
    async fn fetch(&self) -> Result<ConnectionDetails, CredentialError> {
        let n = self.stats.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stats.failing.load(Ordering::SeqCst) {
            return Err(CredentialError::Api {
                status: 503,
                message: "token service unavailable".to_string(),
            });
        }
        Ok(ConnectionDetails {
            server_address: "wss://rtc.example.org".to_string(),
            participant_token: format!("token-{}", n),
            room_name: "exam_room_1".to_string(),
            participant_name: "candidate".to_string(),
            expiry: Utc::now() + chrono::Duration::minutes(15),
        })
    }
}

// ============================================================================
// Audio
// ============================================================================

pub const TEST_FORMAT: AudioFormat = AudioFormat {
    sample_rate: 16_000,
    channels: 1,
};

/// Pushes a fixed block of samples as soon as a stream is opened.
#[derive(Default)]
pub struct ScriptedInput {
    pub unavailable: AtomicBool,
    pub opened: AtomicUsize,
}

impl ScriptedInput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

struct ScriptedStream;

impl CaptureStream for ScriptedStream {
    fn format(&self) -> AudioFormat {
        TEST_FORMAT
    }

    fn stop(self: Box<Self>) {}
}

impl AudioInput for ScriptedInput {
    fn open(&self, sink: CaptureSender) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AudioError::NoInputDevice);
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = sink.send(CaptureEvent::Samples(vec![0, 512, -512, 1024, -1024, 0, 256, -256]));
        Ok(Box::new(ScriptedStream))
    }
}

/// Records every payload handed to it for playback.
#[derive(Default)]
pub struct RecordingOutput {
    pub played: Mutex<Vec<Vec<u8>>>,
    pub failing: AtomicBool,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError> {
        self.played.lock().unwrap().push(encoded);
        if self.failing.load(Ordering::SeqCst) {
            return Err(PlaybackError::Output("speaker unplugged".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Answers submissions from a script, optionally held at a gate.
pub struct ScriptedTransport {
    pub gate: Gate,
    replies: Mutex<VecDeque<Result<TurnReply, TransportError>>>,
    pub requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<TurnReply, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            gate: Gate::open(),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, reply: Result<TurnReply, TransportError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<TurnRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TurnTransport for ScriptedTransport {
    async fn submit(&self, request: TurnRequest) -> Result<TurnReply, TransportError> {
        self.requests.lock().unwrap().push(request);
        self.gate.pass().await;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted reply".to_string())))
    }
}

pub fn reply(step: u32, transcript: &str, response: &str) -> Result<TurnReply, TransportError> {
    Ok(TurnReply {
        transcribed_text: transcript.to_string(),
        ai_response: response.to_string(),
        audio_response: None,
        conversation_step: step,
    })
}

pub fn reply_with_audio(step: u32, audio: &[u8]) -> Result<TurnReply, TransportError> {
    Ok(TurnReply {
        transcribed_text: "I saw a girl helping her grandmother".to_string(),
        ai_response: "What would you have done?".to_string(),
        audio_response: Some(audio.to_vec()),
        conversation_step: step,
    })
}
