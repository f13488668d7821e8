//! HTTP client for the conversation pipeline endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{ConversationResponse, TurnReply, TurnRequest, TurnTransport};
use crate::error::TransportError;

/// Error body shape used by the pipeline (`{"detail": "..."}`)
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    detail: String,
}

/// Posts turns as JSON to a configured endpoint.
pub struct HttpTurnTransport {
    client: Client,
    endpoint: String,
}

impl HttpTurnTransport {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build with its own client. Requests time out after `timeout`.
    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::new(client, endpoint))
    }
}

#[async_trait]
impl TurnTransport for HttpTurnTransport {
    async fn submit(&self, request: TurnRequest) -> Result<TurnReply, TransportError> {
        let body = request.to_wire();

        log::info!(
            "Submitting turn: {} audio bytes, {} history entries, step {}",
            request.audio.len(),
            body.conversation_history.len(),
            body.conversation_step
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
            let parsed: ConversationResponse = serde_json::from_str(&text)
                .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
            let reply = parsed.into_reply()?;

            log::info!(
                "Turn accepted: step {}, transcript {} chars, reply {} chars, audio {}",
                reply.conversation_step,
                reply.transcribed_text.len(),
                reply.ai_response.len(),
                reply
                    .audio_response
                    .as_ref()
                    .map(|a| format!("{} bytes", a.len()))
                    .unwrap_or_else(|| "none".to_string())
            );
            Ok(reply)
        } else {
            let error_text = response.text().await.unwrap_or_default();

            let body = match serde_json::from_str::<ApiErrorResponse>(&error_text) {
                Ok(error_response) => error_response.detail,
                Err(_) => error_text,
            };

            log::error!("Conversation API error ({}): {}", status.as_u16(), body);

            Err(TransportError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}
