//! Connection-details endpoint client.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::{ConnectionDetails, CredentialSource};
use crate::error::CredentialError;

/// Participant tokens issued by the endpoint live this long.
const TOKEN_TTL_MINUTES: i64 = 15;

/// Body returned by the connection-details route.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionDetailsResponse {
    server_url: String,
    room_name: String,
    participant_name: String,
    participant_token: String,
}

/// Fetches connection details with a GET against a configured endpoint.
pub struct HttpCredentialSource {
    client: Client,
    endpoint: String,
}

impl HttpCredentialSource {
    pub fn new(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> Result<ConnectionDetails, CredentialError> {
        log::debug!("Credentials: requesting {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| CredentialError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            log::error!(
                "Connection details endpoint error ({}): {}",
                status.as_u16(),
                message
            );
            return Err(CredentialError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ConnectionDetailsResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Parse(e.to_string()))?;

        if body.participant_token.is_empty() || body.server_url.is_empty() {
            return Err(CredentialError::Parse(
                "missing serverUrl or participantToken".to_string(),
            ));
        }

        Ok(ConnectionDetails {
            server_address: body.server_url,
            participant_token: body.participant_token,
            room_name: body.room_name,
            participant_name: body.participant_name,
            expiry: Utc::now() + Duration::minutes(TOKEN_TTL_MINUTES),
        })
    }
}
