//! WebSocket room client
//!
//! Manages the connection lifecycle and microphone publishing for one room.
//!
//! # Connection Flow
//!
//! 1. `set_microphone_enabled(true, true)` - capture starts immediately and is
//!    held in a `PreConnectBuffer`
//! 2. `connect()` - WebSocket handshake with bearer token, `participant.join`
//! 3. On join the microphone track is announced and buffered audio is flushed
//!    in capture order, then audio streams live
//! 4. `disconnect()` - send `participant.leave` and a close frame
//!
//! Server-initiated closes and transport errors are reported as
//! `RoomEvent::Disconnected`. No reconnect is attempted; the session
//! controller decides what happens next.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
};

use super::protocol::{pcm16_frame, ClientMessage, ServerMessage};
use super::{RealtimeRoom, RoomEvent, ROOM_EVENT_CAPACITY};
use crate::audio::{
    AudioFormat, AudioInput, CaptureEvent, CaptureReceiver, CaptureStream, DeviceArbiter,
    DeviceLease, DeviceOwner, PreConnectBuffer,
};
use crate::credentials::ConnectionDetails;
use crate::error::SessionError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the server to acknowledge `participant.join`
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type FrameSender = mpsc::UnboundedSender<Message>;

pub struct WsRoom {
    input: Arc<dyn AudioInput>,
    devices: DeviceArbiter,
    buffer_secs: f32,
    events: broadcast::Sender<RoomEvent>,
    /// Outgoing frame queue of the live connection, `None` while disconnected
    uplink: watch::Sender<Option<FrameSender>>,
    link: Mutex<Option<Link>>,
    microphone: Mutex<Option<Microphone>>,
}

impl WsRoom {
    pub fn new(input: Arc<dyn AudioInput>, devices: DeviceArbiter, buffer_secs: f32) -> Self {
        let (events, _) = broadcast::channel(ROOM_EVENT_CAPACITY);
        let (uplink, _) = watch::channel(None);
        Self {
            input,
            devices,
            buffer_secs,
            events,
            uplink,
            link: Mutex::new(None),
            microphone: Mutex::new(None),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }
}

/// An open connection
struct Link {
    frames: FrameSender,
    /// Set before a local close so the receiver doesn't report a lost connection
    closing: Arc<AtomicBool>,
    receiver_task: JoinHandle<()>,
}

impl Link {
    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.receiver_task.abort();
        if let Ok(json) = serde_json::to_string(&ClientMessage::Leave) {
            let _ = self.frames.send(Message::Text(json));
        }
        let _ = self.frames.send(Message::Close(None));
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.receiver_task.abort();
    }
}

/// Active microphone capture
struct Microphone {
    stream: Box<dyn CaptureStream>,
    forwarder: JoinHandle<()>,
    _lease: DeviceLease,
}

impl Microphone {
    /// Stopping joins the capture thread, so it runs on the blocking pool.
    async fn stop(self) {
        let Microphone {
            stream,
            forwarder,
            _lease: lease,
        } = self;
        forwarder.abort();
        if let Err(e) = tokio::task::spawn_blocking(move || stream.stop()).await {
            log::error!("Room: capture stop task failed: {}", e);
        }
        drop(lease);
    }
}

#[async_trait]
impl RealtimeRoom for WsRoom {
    fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    async fn connect(&self, details: &ConnectionDetails) -> Result<(), SessionError> {
        let mut link = self.link.lock().await;
        if let Some(previous) = link.take() {
            log::warn!("Room: connect while already connected, closing previous link");
            previous.close();
        }

        let mut request = details
            .server_address
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", details.participant_token))
                .map_err(|e| SessionError::ConnectionFailed(format!("Invalid token: {}", e)))?,
        );

        log::info!(
            "Room: connecting to {} (room {})",
            details.server_address,
            details.room_name
        );

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| SessionError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&ClientMessage::join(
            &details.room_name,
            &details.participant_name,
        ))
        .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        write
            .send(Message::Text(join))
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        timeout(JOIN_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Joined { room_name, .. }) => {
                            log::info!("Room: joined {}", room_name);
                            return Ok(());
                        }
                        Ok(ServerMessage::Error { error }) => {
                            return Err(SessionError::ConnectionFailed(error.message));
                        }
                        Ok(ServerMessage::Closed { reason }) => {
                            return Err(SessionError::ConnectionFailed(
                                reason.unwrap_or_else(|| "Room closed during join".to_string()),
                            ));
                        }
                        Ok(_) => log::debug!("Room: ignoring message while joining"),
                        Err(e) => log::warn!("Room: failed to parse message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        return Err(SessionError::ConnectionFailed(
                            "Connection closed before join".to_string(),
                        ));
                    }
                    Err(e) => return Err(SessionError::ConnectionFailed(e.to_string())),
                    _ => {}
                }
            }
            Err(SessionError::ConnectionFailed("Stream ended".to_string()))
        })
        .await
        .map_err(|_| SessionError::ConnectionFailed("Join timeout".to_string()))??;

        let (frames, mut outgoing) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    log::warn!("Room: send failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = write.close().await;
            log::debug!("Room writer task exiting");
        });

        let closing = Arc::new(AtomicBool::new(false));
        let receiver_task = tokio::spawn(receive_loop(read, self.events.clone(), closing.clone()));

        self.uplink.send_replace(Some(frames.clone()));
        *link = Some(Link {
            frames,
            closing,
            receiver_task,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.uplink.send_replace(None);
        match self.link.lock().await.take() {
            Some(link) => {
                log::info!("Room: disconnecting");
                link.close();
            }
            None => log::debug!("Room: disconnect with no active connection"),
        }
    }

    async fn set_microphone_enabled(
        &self,
        enabled: bool,
        pre_connect_buffer: bool,
    ) -> Result<(), SessionError> {
        let mut microphone = self.microphone.lock().await;

        if !enabled {
            if let Some(mic) = microphone.take() {
                mic.stop().await;
                log::info!("Room: microphone disabled");
            }
            return Ok(());
        }

        if microphone.is_some() {
            return Ok(());
        }

        let lease = self.devices.acquire(DeviceOwner::RoomMicrophone)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Opening waits for the device thread to report its format
        let input = self.input.clone();
        let stream = tokio::task::spawn_blocking(move || input.open(tx))
            .await
            .map_err(|e| SessionError::DeviceUnavailable(format!("capture task failed: {}", e)))??;
        let format = stream.format();

        let buffer = pre_connect_buffer
            .then(|| PreConnectBuffer::new(self.buffer_secs, format.sample_rate, format.channels));
        let forwarder = tokio::spawn(forward_capture(
            rx,
            self.uplink.subscribe(),
            buffer,
            format,
            self.events.clone(),
        ));

        log::info!(
            "Room: microphone enabled ({} Hz, {} ch, pre-connect buffering {})",
            format.sample_rate,
            format.channels,
            if pre_connect_buffer { "on" } else { "off" }
        );

        *microphone = Some(Microphone {
            stream,
            forwarder,
            _lease: lease,
        });
        Ok(())
    }
}

/// Read server frames until the connection ends, then report why.
async fn receive_loop<S>(mut read: S, events: broadcast::Sender<RoomEvent>, closing: Arc<AtomicBool>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Closed { reason }) => {
                    break reason.unwrap_or_else(|| "Room closed".to_string());
                }
                Ok(ServerMessage::Error { error }) => {
                    log::warn!("Room: server error: {}", error.message);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Room: failed to parse message: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "Closed by server".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "Stream ended".to_string(),
        }
    };

    if closing.load(Ordering::SeqCst) {
        log::debug!("Room receiver exiting after local close");
        return;
    }
    log::warn!("Room: connection lost: {}", reason);
    let _ = events.send(RoomEvent::Disconnected { reason });
}

/// Move captured audio to the connection, buffering while it is down.
async fn forward_capture(
    mut capture: CaptureReceiver,
    mut uplink: watch::Receiver<Option<FrameSender>>,
    mut buffer: Option<PreConnectBuffer>,
    format: AudioFormat,
    events: broadcast::Sender<RoomEvent>,
) {
    // Only updated from the watch branch so buffered audio is flushed before
    // any live frame goes out.
    let mut current = uplink.borrow_and_update().clone();
    if let Some(frames) = current.as_ref() {
        announce_and_flush(frames, &mut buffer, format);
    }

    let mut dropped = 0u64;
    loop {
        tokio::select! {
            event = capture.recv() => match event {
                Some(CaptureEvent::Samples(samples)) => match current.as_ref() {
                    Some(frames) => {
                        let _ = frames.send(Message::Binary(pcm16_frame(&samples)));
                    }
                    None => match buffer.as_mut() {
                        Some(buffer) => {
                            buffer.push(samples);
                        }
                        None => dropped += 1,
                    },
                },
                Some(CaptureEvent::Fault(message)) => {
                    log::warn!("Room: capture device fault: {}", message);
                    let _ = events.send(RoomEvent::MediaDevicesError { message });
                }
                None => break,
            },
            changed = uplink.changed() => {
                if changed.is_err() {
                    break;
                }
                current = uplink.borrow_and_update().clone();
                if let Some(frames) = current.as_ref() {
                    if dropped > 0 {
                        log::debug!("Room: {} chunks dropped before connect", dropped);
                        dropped = 0;
                    }
                    announce_and_flush(frames, &mut buffer, format);
                }
            }
        }
    }
    log::debug!("Room capture forwarder exiting");
}

fn announce_and_flush(frames: &FrameSender, buffer: &mut Option<PreConnectBuffer>, format: AudioFormat) {
    match serde_json::to_string(&ClientMessage::publish_microphone(
        format.sample_rate,
        format.channels,
    )) {
        Ok(json) => {
            let _ = frames.send(Message::Text(json));
        }
        Err(e) => log::error!("Room: failed to encode track.publish: {}", e),
    }

    let Some(buffer) = buffer.as_mut() else {
        return;
    };
    let evicted = buffer.evicted_chunks();
    let chunks = buffer.drain_all();
    if !chunks.is_empty() {
        log::info!(
            "Room: flushing {} pre-connect chunks ({} evicted)",
            chunks.len(),
            evicted
        );
    }
    for chunk in chunks {
        let _ = frames.send(Message::Binary(pcm16_frame(&chunk.samples)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: AudioFormat = AudioFormat {
        sample_rate: 16000,
        channels: 1,
    };

    #[tokio::test]
    async fn buffered_audio_is_flushed_in_order_before_live_audio() {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (uplink_tx, uplink_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(4);
        let forwarder = tokio::spawn(forward_capture(
            capture_rx,
            uplink_rx,
            Some(PreConnectBuffer::new(10.0, 16000, 1)),
            FORMAT,
            events,
        ));

        capture_tx.send(CaptureEvent::Samples(vec![1, 1])).unwrap();
        capture_tx.send(CaptureEvent::Samples(vec![2, 2])).unwrap();
        tokio::task::yield_now().await;

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        uplink_tx.send_replace(Some(frames_tx));
        capture_tx.send(CaptureEvent::Samples(vec![3, 3])).unwrap();

        let first = frames_rx.recv().await.unwrap();
        assert!(matches!(first, Message::Text(ref t) if t.contains("track.publish")));
        let mut audio = Vec::new();
        for _ in 0..3 {
            match frames_rx.recv().await.unwrap() {
                Message::Binary(bytes) => audio.push(bytes[0]),
                other => panic!("Expected audio frame, got {:?}", other),
            }
        }
        assert_eq!(audio, vec![1, 2, 3]);
        forwarder.abort();
    }

    #[tokio::test]
    async fn pre_connect_audio_is_dropped_without_buffering() {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (uplink_tx, uplink_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(4);
        let forwarder = tokio::spawn(forward_capture(capture_rx, uplink_rx, None, FORMAT, events));

        capture_tx.send(CaptureEvent::Samples(vec![1, 1])).unwrap();
        tokio::task::yield_now().await;

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
        uplink_tx.send_replace(Some(frames_tx));
        tokio::task::yield_now().await;
        capture_tx.send(CaptureEvent::Samples(vec![9, 9])).unwrap();

        assert!(matches!(frames_rx.recv().await.unwrap(), Message::Text(_)));
        match frames_rx.recv().await.unwrap() {
            Message::Binary(bytes) => assert_eq!(bytes[0], 9),
            other => panic!("Expected audio frame, got {:?}", other),
        }
        forwarder.abort();
    }

    #[tokio::test]
    async fn capture_fault_is_reported_as_media_device_error() {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (_uplink_tx, uplink_rx) = watch::channel(None);
        let (events, mut events_rx) = broadcast::channel(4);
        let forwarder = tokio::spawn(forward_capture(capture_rx, uplink_rx, None, FORMAT, events));

        capture_tx
            .send(CaptureEvent::Fault("device unplugged".to_string()))
            .unwrap();

        assert_eq!(
            events_rx.recv().await.unwrap(),
            RoomEvent::MediaDevicesError {
                message: "device unplugged".to_string()
            }
        );
        drop(capture_tx);
        forwarder.await.unwrap();
    }
}
