//! Microphone capture.
//!
//! `AudioInput` opens a capture stream that pushes PCM16 sample chunks into a
//! channel. `CpalInput` is the hardware implementation; the stream lives on a
//! dedicated thread because `cpal::Stream` is not `Send`.
//!
//! `TurnRecorder` wraps an input with the device arbiter and assembles one
//! recording span into a single WAV blob.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use hound::{WavSpec, WavWriter};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::device::{DeviceArbiter, DeviceLease, DeviceOwner};
use crate::error::AudioError;

/// Events delivered by a capture stream.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Samples(Vec<i16>),
    /// The device reported a runtime failure (unplugged, revoked, ...).
    Fault(String),
}

pub type CaptureSender = mpsc::UnboundedSender<CaptureEvent>;
pub type CaptureReceiver = mpsc::UnboundedReceiver<CaptureEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Source of microphone audio.
pub trait AudioInput: Send + Sync + 'static {
    /// Begin capturing into `sink`. Fails if the hardware cannot be opened.
    fn open(&self, sink: CaptureSender) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// A running capture. No events are sent after `stop` returns.
pub trait CaptureStream: Send {
    fn format(&self) -> AudioFormat;
    fn stop(self: Box<Self>);
}

/// Captures from the default input device.
#[derive(Debug, Default)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioInput for CpalInput {
    fn open(&self, sink: CaptureSender) -> Result<Box<dyn CaptureStream>, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<AudioFormat, AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("speaksea-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sink) {
                    Ok((stream, format)) => {
                        let _ = ready_tx.send(Ok(format));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until stop() or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let format = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamCreationFailed("capture thread exited".to_string()))??;

        Ok(Box::new(CpalStream {
            format,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

struct CpalStream {
    format: AudioFormat,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalStream {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn stop(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl CpalStream {
    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_input_stream(sink: CaptureSender) -> Result<(cpal::Stream, AudioFormat), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let format = AudioFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, sink)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, sink)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, sink)?,
        _ => return Err(AudioError::NoSupportedConfig),
    };

    stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;

    Ok((stream, format))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sink: CaptureSender,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let fault_sink = sink.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio stream error: {}", err);
        let _ = fault_sink.send(CaptureEvent::Fault(err.to_string()));
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                // Receiver gone means the capture is being torn down
                let _ = sink.send(CaptureEvent::Samples(samples));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Convert any sample type to i16 for WAV writing.
fn sample_to_i16<T>(sample: T) -> i16
where
    f32: cpal::FromSample<T>,
{
    let f32_sample = <f32 as cpal::FromSample<T>>::from_sample_(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// One finalized recording span.
#[derive(Debug, Clone)]
pub struct AudioBlob {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub duration_ms: u64,
}

/// Chunks accumulated between start and stop of a single recording.
#[derive(Debug)]
pub struct PendingRecording {
    format: AudioFormat,
    chunks: Vec<Vec<i16>>,
    faults: Vec<String>,
}

impl PendingRecording {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            chunks: Vec::new(),
            faults: Vec::new(),
        }
    }

    pub fn absorb(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Samples(samples) => self.chunks.push(samples),
            CaptureEvent::Fault(message) => self.faults.push(message),
        }
    }

    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn faults(&self) -> &[String] {
        &self.faults
    }

    /// Encode the buffered chunks as a 16-bit WAV, consuming the buffer.
    pub fn into_blob(self) -> Result<AudioBlob, AudioError> {
        let spec = WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let total = self.sample_count();
        let mut cursor = Cursor::new(Vec::with_capacity(44 + total * 2));
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            for sample in self.chunks.into_iter().flatten() {
                writer
                    .write_sample(sample)
                    .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| AudioError::EncodeFailed(e.to_string()))?;
        }

        let frames = total as u64 / self.format.channels.max(1) as u64;
        Ok(AudioBlob {
            bytes: cursor.into_inner(),
            mime_type: "audio/wav",
            duration_ms: frames * 1000 / self.format.sample_rate.max(1) as u64,
        })
    }
}

/// Opens recordings on behalf of the turn pipeline.
#[derive(Clone)]
pub struct TurnRecorder {
    input: Arc<dyn AudioInput>,
    devices: DeviceArbiter,
}

impl TurnRecorder {
    pub fn new(input: Arc<dyn AudioInput>, devices: DeviceArbiter) -> Self {
        Self { input, devices }
    }

    /// Acquire the capture device and start buffering chunks.
    pub fn start(&self) -> Result<RecordingHandle, AudioError> {
        let lease = self.devices.acquire(DeviceOwner::TurnRecording)?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Lease drops with the error if the hardware refuses to open
        let stream = self.input.open(tx)?;
        let id = Uuid::new_v4();
        log::info!("Recording {} started", id);
        Ok(RecordingHandle {
            id,
            started_at: Instant::now(),
            stream,
            rx,
            _lease: lease,
        })
    }
}

/// Handle to an active recording span.
pub struct RecordingHandle {
    id: Uuid,
    started_at: Instant,
    stream: Box<dyn CaptureStream>,
    rx: CaptureReceiver,
    _lease: DeviceLease,
}

impl RecordingHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stop capture, release the device and assemble the recording.
    pub fn finish(self) -> Result<AudioBlob, AudioError> {
        let RecordingHandle {
            id,
            started_at,
            stream,
            mut rx,
            _lease,
        } = self;

        let mut pending = PendingRecording::new(stream.format());
        stream.stop();
        drop(_lease);

        while let Ok(event) = rx.try_recv() {
            pending.absorb(event);
        }
        for fault in pending.faults() {
            log::warn!("Recording {}: device fault during capture: {}", id, fault);
        }

        log::info!(
            "Recording {} stopped after {:?}, {} samples",
            id,
            started_at.elapsed(),
            pending.sample_count()
        );
        pending.into_blob()
    }
}
