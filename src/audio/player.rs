//! Reply playback.
//!
//! Replies arrive as encoded audio (MP3 from the conversation pipeline). They
//! are decoded with symphonia and played on the default output device via
//! rodio. Playback is fire-and-forget from the pipeline's point of view.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::conv::FromSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::task::JoinHandle;

use crate::error::PlaybackError;

/// Sink for decoded-and-played reply audio.
#[async_trait]
pub trait AudioOutput: Send + Sync + 'static {
    /// Play an encoded audio payload to completion.
    async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError>;
}

/// Hands reply audio to an output without blocking the caller.
#[derive(Clone)]
pub struct TurnPlayer {
    output: Arc<dyn AudioOutput>,
}

impl TurnPlayer {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self { output }
    }

    /// Start playback in the background. Failures are logged, never raised.
    pub fn play(&self, encoded: Vec<u8>) -> JoinHandle<Result<(), PlaybackError>> {
        let output = self.output.clone();
        tokio::spawn(async move {
            let bytes = encoded.len();
            let result = output.play(encoded).await;
            match &result {
                Ok(()) => log::debug!("Reply playback finished ({} bytes)", bytes),
                Err(e) => log::warn!("Reply playback failed: {}", e),
            }
            result
        })
    }
}

/// Default output device.
#[derive(Debug, Default)]
pub struct SpeakerOutput;

impl SpeakerOutput {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioOutput for SpeakerOutput {
    async fn play(&self, encoded: Vec<u8>) -> Result<(), PlaybackError> {
        tokio::task::spawn_blocking(move || {
            let (pcm, sample_rate) = decode_mono(encoded)?;
            play_pcm(pcm, sample_rate)
        })
        .await
        .map_err(|e| PlaybackError::Output(format!("playback task failed: {}", e)))?
    }
}

fn play_pcm(pcm: Vec<f32>, sample_rate: u32) -> Result<(), PlaybackError> {
    let stream_handle = rodio::OutputStreamBuilder::open_default_stream()
        .map_err(|e| PlaybackError::Output(e.to_string()))?;
    let sink = rodio::Sink::connect_new(stream_handle.mixer());
    sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, pcm));
    sink.sleep_until_end();
    Ok(())
}

fn conv<T>(samples: &mut Vec<f32>, data: std::borrow::Cow<symphonia::core::audio::AudioBuffer<T>>)
where
    T: symphonia::core::sample::Sample,
    f32: FromSample<T>,
{
    samples.extend(data.chan(0).iter().map(|v| f32::from_sample(*v)))
}

/// Decode the first audio track to mono f32 samples.
pub fn decode_mono(encoded: Vec<u8>) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(encoded)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| PlaybackError::Decode("no supported audio track".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PlaybackError::Decode(format!("unsupported codec: {}", e)))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut pcm = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(PlaybackError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_rate == 0 {
                    sample_rate = decoded.spec().rate;
                }
                match decoded {
                    AudioBufferRef::F32(buf) => pcm.extend_from_slice(buf.chan(0)),
                    AudioBufferRef::U8(data) => conv(&mut pcm, data),
                    AudioBufferRef::U16(data) => conv(&mut pcm, data),
                    AudioBufferRef::U24(data) => conv(&mut pcm, data),
                    AudioBufferRef::U32(data) => conv(&mut pcm, data),
                    AudioBufferRef::S8(data) => conv(&mut pcm, data),
                    AudioBufferRef::S16(data) => conv(&mut pcm, data),
                    AudioBufferRef::S24(data) => conv(&mut pcm, data),
                    AudioBufferRef::S32(data) => conv(&mut pcm, data),
                    AudioBufferRef::F64(data) => conv(&mut pcm, data),
                }
            }
            // Corrupt frame, skip it
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(PlaybackError::Decode(e.to_string())),
        }
    }

    if pcm.is_empty() || sample_rate == 0 {
        return Err(PlaybackError::Decode("reply contained no audio".to_string()));
    }
    Ok((pcm, sample_rate))
}
