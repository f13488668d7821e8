//! Caching layer so a restart does not mint a new token every time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ConnectionDetails, CredentialProvider, CredentialSource};
use crate::error::CredentialError;

/// Caches the most recent `ConnectionDetails` issued by a source.
///
/// The cached value is replaced wholesale on refresh, never mutated. Fetches
/// are serialized by the mutex so concurrent callers share one request.
pub struct CachedCredentials<S> {
    source: S,
    cached: Mutex<Option<Arc<ConnectionDetails>>>,
}

impl<S: CredentialSource> CachedCredentials<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    async fn fetch_into(
        &self,
        slot: &mut Option<Arc<ConnectionDetails>>,
    ) -> Result<Arc<ConnectionDetails>, CredentialError> {
        let details = self.source.fetch().await?;
        if details.is_expired() {
            return Err(CredentialError::Expired(details.expiry.to_rfc3339()));
        }
        log::info!(
            "Credentials: issued for {} (room {}, expires {})",
            details.server_address,
            details.room_name,
            details.expiry
        );
        let details = Arc::new(details);
        *slot = Some(details.clone());
        Ok(details)
    }
}

#[async_trait]
impl<S: CredentialSource> CredentialProvider for CachedCredentials<S> {
    async fn existing_or_refresh(&self) -> Result<Arc<ConnectionDetails>, CredentialError> {
        let mut guard = self.cached.lock().await;
        if let Some(details) = guard.as_ref().filter(|d| !d.is_expired()) {
            log::debug!("Credentials: reusing cached details");
            return Ok(details.clone());
        }
        self.fetch_into(&mut guard).await
    }

    async fn refresh(&self) -> Result<Arc<ConnectionDetails>, CredentialError> {
        let mut guard = self.cached.lock().await;
        self.fetch_into(&mut guard).await
    }
}
