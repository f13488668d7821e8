//! Turn transport
//!
//! One turn is one POST to the conversation pipeline: the candidate's audio,
//! the conversation so far and the current step go up; the transcript, the
//! examiner's reply (text and optional audio) and the new step come back.

mod http;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub use http::HttpTurnTransport;

/// Speaker label used in the wire history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRole {
    #[serde(rename = "ai")]
    Ai,
    #[serde(rename = "student")]
    Student,
}

/// One entry of `conversation_history`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: WireRole,
    pub content: String,
    /// RFC 3339
    pub timestamp: String,
}

/// A turn ready to submit.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Encoded recording (WAV)
    pub audio: Vec<u8>,
    pub history: Vec<HistoryEntry>,
    /// Step count before this turn
    pub conversation_step: u32,
}

impl TurnRequest {
    pub fn to_wire(&self) -> ConversationRequest {
        ConversationRequest {
            audio_data: STANDARD.encode(&self.audio),
            conversation_history: self.history.clone(),
            conversation_step: self.conversation_step,
        }
    }
}

/// Decoded pipeline reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub transcribed_text: String,
    pub ai_response: String,
    pub audio_response: Option<Vec<u8>>,
    pub conversation_step: u32,
}

/// Request body
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRequest {
    /// Base64 without a data-URI prefix
    pub audio_data: String,
    pub conversation_history: Vec<HistoryEntry>,
    pub conversation_step: u32,
}

/// Response body. Unknown fields (e.g. `is_complete`) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationResponse {
    pub transcribed_text: String,
    pub ai_response: String,
    #[serde(default)]
    pub audio_response: Option<String>,
    pub conversation_step: u32,
}

impl ConversationResponse {
    pub fn into_reply(self) -> Result<TurnReply, TransportError> {
        let audio_response = match self.audio_response {
            Some(encoded) if !encoded.is_empty() => Some(
                STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| TransportError::MalformedResponse(format!("audio_response: {}", e)))?,
            ),
            _ => None,
        };
        Ok(TurnReply {
            transcribed_text: self.transcribed_text,
            ai_response: self.ai_response,
            audio_response,
            conversation_step: self.conversation_step,
        })
    }
}

/// Sends one turn to the conversation pipeline.
#[async_trait]
pub trait TurnTransport: Send + Sync + 'static {
    async fn submit(&self, request: TurnRequest) -> Result<TurnReply, TransportError>;
}
