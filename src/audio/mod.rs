//! Audio capture and playback for exam sessions
//!
//! Capture uses CPAL behind the `AudioInput` trait and is arbitrated between
//! the room's pre-connect buffering and turn recording. Replies are decoded
//! with symphonia and played through rodio.

pub mod buffer;
pub mod device;
pub mod player;
pub mod recorder;

pub use buffer::{AudioChunk, PreConnectBuffer};
pub use device::{DeviceArbiter, DeviceLease, DeviceOwner};
pub use player::{AudioOutput, SpeakerOutput, TurnPlayer};
pub use recorder::{
    AudioBlob, AudioFormat, AudioInput, CaptureEvent, CaptureReceiver, CaptureSender,
    CaptureStream, CpalInput, PendingRecording, RecordingHandle, TurnRecorder,
};
