//! Real-time room wire protocol
//!
//! Control traffic is JSON text frames tagged by `type`. Microphone audio is
//! sent as binary frames of little-endian PCM16 at the format announced in
//! `track.publish`.
//!
//! # Handshake
//!
//! 1. Open the WebSocket with `Authorization: Bearer <participant token>`
//! 2. Send `participant.join`
//! 3. Receive `room.joined` (or `error`)
//! 4. Announce the microphone track with `track.publish`, then stream audio

use serde::{Deserialize, Serialize};

/// Audio track announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Always "audio" for the candidate microphone
    pub kind: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Error information from the room server
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Messages (sent TO the room server)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "participant.join")]
    Join {
        room_name: String,
        participant_name: String,
    },

    #[serde(rename = "track.publish")]
    TrackPublish { track: TrackInfo },

    #[serde(rename = "track.unpublish")]
    TrackUnpublish,

    #[serde(rename = "participant.leave")]
    Leave,
}

impl ClientMessage {
    pub fn join(room_name: &str, participant_name: &str) -> Self {
        Self::Join {
            room_name: room_name.to_string(),
            participant_name: participant_name.to_string(),
        }
    }

    /// Announce a PCM16 microphone track
    pub fn publish_microphone(sample_rate: u32, channels: u16) -> Self {
        Self::TrackPublish {
            track: TrackInfo {
                kind: "audio".to_string(),
                encoding: "pcm16".to_string(),
                sample_rate,
                channels,
            },
        }
    }
}

// ============================================================================
// Server Messages (received FROM the room server)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "room.joined")]
    Joined {
        room_name: String,
        #[serde(default)]
        participant_sid: Option<String>,
    },

    /// The server ended the room (agent left, room deleted, token revoked)
    #[serde(rename = "room.closed")]
    Closed {
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Catch-all so new server message types don't break parsing
    #[serde(other)]
    Unknown,
}

/// Serialize samples as a little-endian PCM16 binary frame
pub fn pcm16_frame(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}
