//! Real-time connection credentials.
//!
//! A credential source issues `ConnectionDetails` (server address plus a
//! short-lived participant token). `CachedCredentials` sits in front of it and
//! implements the get-or-refresh / force-refresh contract the session
//! controller relies on.

mod cache;
mod client;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CredentialError;

pub use cache::CachedCredentials;
pub use client::HttpCredentialSource;

/// Details younger than this margin before expiry are treated as expired.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Connection details for one real-time session. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub server_address: String,
    pub participant_token: String,
    pub room_name: String,
    pub participant_name: String,
    pub expiry: DateTime<Utc>,
}

impl ConnectionDetails {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Something that can mint fresh connection details.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<ConnectionDetails, CredentialError>;
}

/// Contract consumed by the session controller.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    /// Reuse the cached details when present and unexpired, otherwise refresh.
    async fn existing_or_refresh(&self) -> Result<Arc<ConnectionDetails>, CredentialError>;

    /// Always fetch new details, replacing whatever was cached.
    async fn refresh(&self) -> Result<Arc<ConnectionDetails>, CredentialError>;
}
