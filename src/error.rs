//! Error types shared across the session controller and turn pipeline.
//!
//! Component errors (`AudioError`, `TransportError`, ...) stay close to the
//! adapter that produces them. `SessionError` and `TurnError` are what the
//! presentation layer sees.

use thiserror::Error;

/// Failures while obtaining connection credentials.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("Network error fetching connection details: {0}")]
    Network(String),
    #[error("Connection details endpoint error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Failed to parse connection details: {0}")]
    Parse(String),
    #[error("Connection details expired at {0}")]
    Expired(String),
}

/// Errors that can occur while capturing audio.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio capture device is held by {holder}")]
    DeviceBusy { holder: String },
    #[error("Failed to encode recording: {0}")]
    EncodeFailed(String),
}

/// Reply playback failures. Always non-fatal.
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("Failed to decode reply audio: {0}")]
    Decode(String),
    #[error("Audio output failed: {0}")]
    Output(String),
}

/// Errors from submitting a turn to the conversation pipeline.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Conversation API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("Malformed conversation response: {0}")]
    MalformedResponse(String),
}

impl TransportError {
    /// True for failures where the response body could not be trusted.
    pub fn is_malformed(&self) -> bool {
        matches!(self, TransportError::MalformedResponse(_))
    }
}

/// Session-level errors surfaced by `SessionController`.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Connection details unavailable: {0}")]
    CredentialUnavailable(#[from] CredentialError),
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Microphone busy: {0}")]
    DeviceBusy(String),
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("Session controller has shut down")]
    ControllerClosed,
}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::DeviceBusy { .. } => SessionError::DeviceBusy(err.to_string()),
            other => SessionError::DeviceUnavailable(other.to_string()),
        }
    }
}

/// Rejections and failures of the turn pipeline operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Microphone busy: {0}")]
    DeviceBusy(String),
    #[error("A recording is already in progress")]
    RecordingActive,
    #[error("Previous turn is still being processed")]
    Processing,
    #[error("Conversation is complete")]
    Completed,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Session has ended")]
    SessionClosed,
}

impl From<AudioError> for TurnError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::DeviceBusy { .. } => TurnError::DeviceBusy(err.to_string()),
            other => TurnError::DeviceUnavailable(other.to_string()),
        }
    }
}
