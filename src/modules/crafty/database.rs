use crate::{database::Database, utils::token_hint};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};
use tracing::debug;

pub const CACHE_FILE_NAME: &str = ".crafty_token_cache.json";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl CachedToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// When a proactive refresh should happen, `buffer` ahead of expiry.
    pub fn refresh_at(&self, buffer: Duration) -> DateTime<Utc> {
        self.expires_at - buffer
    }

    pub fn expires_soon(&self, buffer: Duration) -> bool {
        Utc::now() >= self.refresh_at(buffer)
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("token", &token_hint(&self.token))
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

pub type TokenCache = Database<CachedToken>;

impl Database<CachedToken> {
    /// `~/.crafty_token_cache.json`, or the working directory if no home is known.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CACHE_FILE_NAME)
    }

    /// The cached token, provided it is well-formed and not yet expired.
    pub async fn load_valid(&self) -> Option<CachedToken> {
        let cached = self.load().await?;

        if cached.expires_at <= cached.issued_at {
            debug!(
                "[{}] Ignoring cached token - expiry precedes issue time",
                cached.correlation_id
            );
            return None;
        }

        if cached.is_expired() {
            debug!(
                "[{}] Ignoring cached token - expired at {}",
                cached.correlation_id, cached.expires_at
            );
            return None;
        }

        debug!(
            "[{}] Loaded cached token from {}, expires {}",
            cached.correlation_id,
            self.path().display(),
            cached.expires_at
        );
        Some(cached)
    }
}
