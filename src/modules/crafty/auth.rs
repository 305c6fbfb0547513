use super::database::{CachedToken, TokenCache};
use crate::{
    default_struct,
    utils::{correlation_id, redact_username, token_hint},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, warn};

pub const LOGIN_ENDPOINT: &str = "/api/v2/auth/login";

/// How the bot authenticates against Crafty. Fixed for the process lifetime.
#[derive(Clone)]
pub enum Credential {
    StaticToken(String),
    Password { username: String, password: String },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaticToken(token) => f
                .debug_tuple("StaticToken")
                .field(&token_hint(token))
                .finish(),
            Self::Password { username, password } => f
                .debug_struct("Password")
                .field("username", &redact_username(username))
                .field("password_length", &password.len())
                .finish(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("login rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("login connection error: {0}")]
    Connection(String),
    #[error("unexpected login response: {0}")]
    InvalidResponse(String),
    #[error("authentication failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<AuthError> },
}

default_struct! {
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32 = 3,
    pub initial_delay: Duration = Duration::from_secs(1),
    pub max_delay: Duration = Duration::from_secs(60),
}
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt + 1`, with up to
    /// `initial_delay` of jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = fastrand::u64(0..=self.initial_delay.as_millis() as u64);
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

default_struct! {
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub refresh_buffer: ChronoDuration = ChronoDuration::hours(4),
    /// Lifetime assumed when the login response carries no expiry.
    pub default_lifetime: ChronoDuration = ChronoDuration::hours(24),
    /// Delay before trying again after a background refresh gave up.
    pub refresh_retry: ChronoDuration = ChronoDuration::minutes(5),
    pub retry: RetryPolicy = RetryPolicy::default(),
}
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    status: String,
    data: Option<LoginData>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct LoginData {
    token: Option<String>,
    expires: Option<Value>,
}

type LoginFlight = Shared<BoxFuture<'static, Result<CachedToken, AuthError>>>;

enum AuthState {
    Unauthenticated,
    Authenticating(LoginFlight),
    Authenticated(CachedToken),
    /// Background refresh in flight; `current` is still served until it expires.
    Refreshing {
        current: CachedToken,
        flight: LoginFlight,
    },
    Failed(AuthError),
}

struct ScheduledRefresh {
    at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Inner {
    credential: Credential,
    login_url: String,
    client: Client,
    cache: TokenCache,
    settings: AuthSettings,
    state: Mutex<AuthState>,
    refresh: Mutex<Option<ScheduledRefresh>>,
}

/// Hands out Crafty API tokens.
///
/// In password mode the first caller restores the cached token or logs in;
/// concurrent callers share that single login. A one-shot timer re-logs in
/// `refresh_buffer` before expiry and is re-armed after every login.
/// A failed refresh keeps serving the current token and retries after
/// `refresh_retry`. Exhausted retries with no unexpired token left leave
/// the manager failed for the rest of the process.
#[derive(Clone)]
pub struct AuthManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("credential", &self.inner.credential)
            .field("login_url", &self.inner.login_url)
            .finish()
    }
}

impl AuthManager {
    pub fn new(
        credential: Credential,
        base_url: &str,
        client: Client,
        cache: TokenCache,
        settings: AuthSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                credential,
                login_url: format!("{}{}", base_url.trim_end_matches('/'), LOGIN_ENDPOINT),
                client,
                cache,
                settings,
                state: Mutex::new(AuthState::Unauthenticated),
                refresh: Mutex::new(None),
            }),
        }
    }

    /// Whether a rejected token can be replaced by logging in again.
    pub fn can_refresh(&self) -> bool {
        matches!(self.inner.credential, Credential::Password { .. })
    }

    pub async fn get_valid_token(&self) -> Result<String, AuthError> {
        if let Credential::StaticToken(token) = &self.inner.credential {
            return Ok(token.clone());
        }

        let flight = {
            let mut state = self.inner.state.lock().await;
            match &*state {
                AuthState::Authenticated(token) if !token.is_expired() => {
                    return Ok(token.token.clone());
                }
                AuthState::Failed(e) => return Err(e.clone()),
                AuthState::Refreshing { current, .. } if !current.is_expired() => {
                    return Ok(current.token.clone());
                }
                AuthState::Refreshing { flight, .. } => flight.clone(),
                AuthState::Authenticating(flight) => flight.clone(),
                AuthState::Unauthenticated => match self.inner.restore_cached().await {
                    Some(cached) => {
                        let token = cached.token.clone();
                        *state = AuthState::Authenticated(cached);
                        return Ok(token);
                    }
                    None => self.inner.begin_login(&mut state),
                },
                AuthState::Authenticated(token) => {
                    debug!("[{}] Token expired, logging in again", token.correlation_id);
                    self.inner.begin_login(&mut state)
                }
            }
        };

        flight.await.map(|t| t.token)
    }

    /// Drops `rejected` after the API refused it and starts a new login.
    /// Does nothing if the token has already been replaced.
    pub async fn invalidate(&self, rejected: &str) {
        if !self.can_refresh() {
            return;
        }

        let mut state = self.inner.state.lock().await;
        match &*state {
            AuthState::Authenticated(token) if token.token == rejected => {
                warn!(
                    "[{}] Token rejected by Crafty, forcing a new login",
                    token.correlation_id
                );
                if let Err(e) = self.inner.cache.clear().await {
                    warn!("Failed to clear token cache: {}", e);
                }
                self.inner.cancel_refresh().await;
                self.inner.begin_login(&mut state);
            }
            AuthState::Refreshing { current, flight } if current.token == rejected => {
                warn!(
                    "[{}] Token rejected by Crafty during refresh, waiting for the new one",
                    current.correlation_id
                );
                let flight = flight.clone();
                if let Err(e) = self.inner.cache.clear().await {
                    warn!("Failed to clear token cache: {}", e);
                }
                *state = AuthState::Authenticating(flight);
            }
            _ => debug!("Rejected token already replaced, not logging in again"),
        }
    }

    pub async fn refresh_scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.inner.refresh.lock().await.as_ref().map(|r| r.at)
    }

    pub async fn shutdown(&self) {
        self.inner.cancel_refresh().await;
        debug!("AuthManager shut down");
    }
}

impl Inner {
    async fn restore_cached(self: &Arc<Self>) -> Option<CachedToken> {
        let cached = self.cache.load_valid().await?;
        if cached.expires_soon(self.settings.refresh_buffer) {
            debug!(
                "[{}] Cached token expires soon ({}), logging in instead",
                cached.correlation_id, cached.expires_at
            );
            return None;
        }

        info!(
            "[{}] Using cached token, expires {}",
            cached.correlation_id, cached.expires_at
        );
        self.schedule_refresh(&cached).await;
        Some(cached)
    }

    /// Spawns the login so it finishes even if every waiter goes away.
    fn spawn_login(self: &Arc<Self>) -> LoginFlight {
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.login_and_store().await });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(AuthError::Connection(format!("login task ended: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    fn begin_login(self: &Arc<Self>, state: &mut AuthState) -> LoginFlight {
        let flight = self.spawn_login();
        *state = AuthState::Authenticating(flight.clone());
        flight
    }

    /// Starts the timer-driven login. Callers keep getting the current
    /// token while it runs.
    async fn begin_refresh(self: &Arc<Self>) -> LoginFlight {
        let mut state = self.state.lock().await;
        match &*state {
            AuthState::Authenticating(flight) | AuthState::Refreshing { flight, .. } => {
                flight.clone()
            }
            AuthState::Failed(e) => future::ready(Err(e.clone())).boxed().shared(),
            AuthState::Authenticated(token) if !token.is_expired() => {
                let current = token.clone();
                let flight = self.spawn_login();
                *state = AuthState::Refreshing {
                    current,
                    flight: flight.clone(),
                };
                flight
            }
            _ => self.begin_login(&mut state),
        }
    }

    async fn login_and_store(self: Arc<Self>) -> Result<CachedToken, AuthError> {
        let result = self.login_with_retry().await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(token) => {
                if let Err(e) = self.cache.save(token).await {
                    warn!(
                        "[{}] Failed to cache token at {}: {}",
                        token.correlation_id,
                        self.cache.path().display(),
                        e
                    );
                }
                *state = AuthState::Authenticated(token.clone());
                self.schedule_refresh(token).await;
            }
            Err(e) => match std::mem::replace(&mut *state, AuthState::Failed(e.clone())) {
                AuthState::Refreshing { current, .. } if !current.is_expired() => {
                    warn!(
                        "[{}] Background refresh failed, keeping current token until {}: {}",
                        current.correlation_id, current.expires_at, e
                    );
                    self.schedule_retry(&current).await;
                    *state = AuthState::Authenticated(current);
                }
                _ => {
                    error!("Authentication failed, giving up: {}", e);
                    self.cancel_refresh().await;
                }
            },
        }
        result
    }

    async fn login_with_retry(&self) -> Result<CachedToken, AuthError> {
        let policy = &self.settings.retry;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.login().await {
                Ok(token) => return Ok(token),
                Err(e) if attempt + 1 >= attempts => {
                    error!("Login failed after {} attempts: {}", attempts, e);
                    return Err(AuthError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Login attempt {} failed: {}. Retrying in {:.1}s",
                        attempt + 1,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn login(&self) -> Result<CachedToken, AuthError> {
        let Credential::Password { username, password } = &self.credential else {
            return Err(AuthError::InvalidResponse(
                "static token mode cannot log in".into(),
            ));
        };

        let correlation_id = correlation_id();
        let user = redact_username(username);
        info!(
            "[{}] Starting authentication attempt - user: {}, url: {}",
            correlation_id, user, self.login_url
        );
        debug!(
            "[{}] Authentication context - password_length: {}",
            correlation_id,
            password.len()
        );

        let response = self
            .client
            .post(&self.login_url)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| {
                error!(
                    "[{}] Authentication connection error - user: {}, error: {}",
                    correlation_id, user, e
                );
                AuthError::Connection(e.to_string())
            })?;

        let http_status = response.status();
        let body = response.json::<LoginResponse>().await.ok();

        match body {
            Some(LoginResponse {
                status,
                data: Some(data),
                ..
            }) if http_status.is_success() && status == "ok" => {
                let token = data.token.filter(|t| !t.is_empty()).ok_or_else(|| {
                    AuthError::InvalidResponse("token not found in login response".into())
                })?;

                let issued_at = Utc::now();
                let expires_at = data
                    .expires
                    .as_ref()
                    .and_then(parse_expiration)
                    .filter(|expires| *expires > issued_at)
                    .unwrap_or(issued_at + self.settings.default_lifetime);

                info!(
                    "[{}] Authentication successful - user: {}, expires: {}",
                    correlation_id, user, expires_at
                );
                debug!("[{}] Token {}", correlation_id, token_hint(&token));

                Ok(CachedToken {
                    token,
                    issued_at,
                    expires_at,
                    correlation_id,
                })
            }
            body => {
                let message = body
                    .and_then(|b| b.error)
                    .unwrap_or_else(|| format!("HTTP {}", http_status));
                error!(
                    "[{}] Authentication failed - user: {}, status: {}, error: {}",
                    correlation_id, user, http_status, message
                );
                Err(AuthError::Rejected {
                    status: http_status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn schedule_refresh(self: &Arc<Self>, token: &CachedToken) {
        let now = Utc::now();
        let mut at = token.refresh_at(self.settings.refresh_buffer);
        if at <= now {
            at = now + (token.expires_at - now) / 2;
        }
        self.arm_refresh(at, &token.correlation_id).await;
    }

    /// Re-arms after a failed refresh, well before `token` runs out.
    async fn schedule_retry(self: &Arc<Self>, token: &CachedToken) {
        let now = Utc::now();
        let at = (now + self.settings.refresh_retry).min(now + (token.expires_at - now) / 2);
        self.arm_refresh(at, &token.correlation_id).await;
    }

    async fn arm_refresh(self: &Arc<Self>, at: DateTime<Utc>, correlation_id: &str) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach from the slot so the re-arm after this login does not abort us.
            inner.refresh.lock().await.take();
            info!("Performing background token refresh");
            match inner.begin_refresh().await.await {
                Ok(token) => info!(
                    "[{}] Background token refresh completed",
                    token.correlation_id
                ),
                Err(e) => warn!("Background token refresh failed: {}", e),
            }
        });

        debug!(
            "[{}] Scheduling token refresh in {:.1} seconds",
            correlation_id,
            delay.as_secs_f64()
        );

        let mut refresh = self.refresh.lock().await;
        if let Some(previous) = refresh.replace(ScheduledRefresh { at, handle }) {
            previous.handle.abort();
        }
    }

    async fn cancel_refresh(&self) {
        if let Some(previous) = self.refresh.lock().await.take() {
            previous.handle.abort();
            debug!("Cancelled scheduled token refresh");
        }
    }
}

/// Crafty reports expiry either as an RFC 3339 string or as unix seconds.
fn parse_expiration(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| warn!("Failed to parse token expiration {:?}: {}", s, e))
            .ok(),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::Null => None,
        other => {
            warn!("Unexpected expiration format: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::crafty::database::CACHE_FILE_NAME;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    fn fast_settings() -> AuthSettings {
        AuthSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..AuthSettings::default()
        }
    }

    fn password() -> Credential {
        Credential::Password {
            username: "steve_admin".into(),
            password: "hunter22".into(),
        }
    }

    fn manager(url: &str, dir: &TempDir, settings: AuthSettings) -> AuthManager {
        AuthManager::new(
            password(),
            url,
            Client::new(),
            TokenCache::new(dir.path().join(CACHE_FILE_NAME)),
            settings,
        )
    }

    fn cached(token: &str, valid_for: ChronoDuration) -> CachedToken {
        let now = Utc::now();
        CachedToken {
            token: token.into(),
            issued_at: now - ChronoDuration::minutes(10),
            expires_at: now + valid_for,
            correlation_id: "cachedid".into(),
        }
    }

    fn login_body(token: &str) -> String {
        json!({
            "status": "ok",
            "data": { "token": token, "user_id": 1 }
        })
        .to_string()
    }

    #[tokio::test]
    async fn static_token_bypasses_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .expect(0)
            .create_async()
            .await;
        let dir = tempdir().unwrap();

        let auth = AuthManager::new(
            Credential::StaticToken("static-api-key".into()),
            &server.url(),
            Client::new(),
            TokenCache::new(dir.path().join(CACHE_FILE_NAME)),
            AuthSettings::default(),
        );

        assert_eq!(auth.get_valid_token().await.unwrap(), "static-api-key");
        assert!(!auth.can_refresh());
        assert_eq!(auth.refresh_scheduled_at().await, None);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn cached_token_is_used_and_refresh_is_scheduled() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .expect(0)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, AuthSettings::default());

        let token = cached("from-cache", ChronoDuration::hours(5));
        auth.inner.cache.save(&token).await.unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "from-cache");
        assert_eq!(auth.get_valid_token().await.unwrap(), "from-cache");
        assert_eq!(
            auth.refresh_scheduled_at().await,
            Some(token.expires_at - ChronoDuration::hours(4))
        );
        login.assert_async().await;
        auth.shutdown().await;
    }

    #[tokio::test]
    async fn expired_cache_triggers_one_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .match_body(Matcher::Json(json!({
                "username": "steve_admin",
                "password": "hunter22"
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(login_body("fresh-token"))
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, fast_settings());

        let mut stale = cached("stale", ChronoDuration::hours(1));
        stale.issued_at = Utc::now() - ChronoDuration::hours(3);
        stale.expires_at = Utc::now() - ChronoDuration::minutes(1);
        auth.inner.cache.save(&stale).await.unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "fresh-token");
        assert_eq!(auth.get_valid_token().await.unwrap(), "fresh-token");
        login.assert_async().await;

        let stored = auth.inner.cache.load_valid().await.unwrap();
        assert_eq!(stored.token, "fresh-token");
        assert!(stored.expires_at > stored.issued_at);
        auth.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_login() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(200)
            .with_body(login_body("shared-token"))
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, fast_settings());

        let calls = (0..8).map(|_| {
            let auth = auth.clone();
            async move { auth.get_valid_token().await }
        });
        let results = futures::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap(), "shared-token");
        }
        login.assert_async().await;
        auth.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_fail_every_waiter() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(500)
            .with_body(json!({"status": "error", "error": "database locked"}).to_string())
            .expect(3)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, fast_settings());

        let calls = (0..4).map(|_| {
            let auth = auth.clone();
            async move { auth.get_valid_token().await }
        });
        for result in futures::future::join_all(calls).await {
            match result {
                Err(AuthError::Exhausted { attempts, last }) => {
                    assert_eq!(attempts, 3);
                    assert!(last.to_string().contains("database locked"));
                }
                other => panic!("expected exhausted retries, got {:?}", other),
            }
        }

        assert!(auth.get_valid_token().await.is_err());
        login.assert_async().await;
    }

    #[tokio::test]
    async fn response_without_token_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(200)
            .with_body(json!({"status": "ok", "data": {}}).to_string())
            .expect(3)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, fast_settings());

        match auth.get_valid_token().await {
            Err(AuthError::Exhausted { last, .. }) => {
                assert!(matches!(*last, AuthError::InvalidResponse(_)));
            }
            other => panic!("expected invalid response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn timer_refreshes_before_expiry() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(200)
            .with_body(login_body("refreshed"))
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let settings = AuthSettings {
            refresh_buffer: ChronoDuration::hours(1) - ChronoDuration::milliseconds(150),
            ..fast_settings()
        };
        let auth = manager(&server.url(), &dir, settings);
        auth.inner
            .cache
            .save(&cached("about-to-refresh", ChronoDuration::hours(1)))
            .await
            .unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "about-to-refresh");
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(auth.get_valid_token().await.unwrap(), "refreshed");
        login.assert_async().await;
        auth.shutdown().await;
    }

    #[tokio::test]
    async fn failed_refresh_keeps_serving_current_token() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let settings = AuthSettings {
            refresh_buffer: ChronoDuration::hours(1) - ChronoDuration::milliseconds(100),
            ..fast_settings()
        };
        let auth = manager(&server.url(), &dir, settings);
        auth.inner
            .cache
            .save(&cached("still-valid", ChronoDuration::hours(1)))
            .await
            .unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "still-valid");
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(auth.get_valid_token().await.unwrap(), "still-valid");
        login.assert_async().await;
        let retry = auth.refresh_scheduled_at().await.unwrap();
        assert!(retry > Utc::now() + ChronoDuration::minutes(4));
        auth.shutdown().await;
    }

    #[tokio::test]
    async fn failed_refresh_after_expiry_is_terminal() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let settings = AuthSettings {
            refresh_buffer: ChronoDuration::milliseconds(200),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(150),
                max_delay: Duration::from_millis(300),
            },
            ..AuthSettings::default()
        };
        let auth = manager(&server.url(), &dir, settings);
        auth.inner
            .cache
            .save(&cached("short-lived", ChronoDuration::milliseconds(400)))
            .await
            .unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "short-lived");
        // The token runs out while the retries are still backing off.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(matches!(
            auth.get_valid_token().await,
            Err(AuthError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(auth.refresh_scheduled_at().await, None);
        login.assert_async().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_scheduled_refresh() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .expect(0)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let settings = AuthSettings {
            refresh_buffer: ChronoDuration::hours(1) - ChronoDuration::milliseconds(100),
            ..fast_settings()
        };
        let auth = manager(&server.url(), &dir, settings);
        auth.inner
            .cache
            .save(&cached("kept", ChronoDuration::hours(1)))
            .await
            .unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "kept");
        assert!(auth.refresh_scheduled_at().await.is_some());

        auth.shutdown().await;
        assert_eq!(auth.refresh_scheduled_at().await, None);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(auth.get_valid_token().await.unwrap(), "kept");
        login.assert_async().await;
    }

    #[tokio::test]
    async fn invalidate_replaces_only_the_rejected_token() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", LOGIN_ENDPOINT)
            .with_status(200)
            .with_body(login_body("replacement"))
            .expect(1)
            .create_async()
            .await;
        let dir = tempdir().unwrap();
        let auth = manager(&server.url(), &dir, fast_settings());
        auth.inner
            .cache
            .save(&cached("revoked", ChronoDuration::hours(8)))
            .await
            .unwrap();

        assert_eq!(auth.get_valid_token().await.unwrap(), "revoked");
        auth.invalidate("revoked").await;
        assert_eq!(auth.get_valid_token().await.unwrap(), "replacement");

        // A late report about the old token must not cause another login.
        auth.invalidate("revoked").await;
        assert_eq!(auth.get_valid_token().await.unwrap(), "replacement");
        login.assert_async().await;
        auth.shutdown().await;
    }

    #[test]
    fn expiration_formats() {
        let rfc = parse_expiration(&json!("2030-01-02T03:04:05Z")).unwrap();
        assert_eq!(rfc.to_rfc3339(), "2030-01-02T03:04:05+00:00");

        let unix = parse_expiration(&json!(1_900_000_000)).unwrap();
        assert_eq!(unix.timestamp(), 1_900_000_000);

        assert!(parse_expiration(&json!("next tuesday")).is_none());
        assert!(parse_expiration(&Value::Null).is_none());
        assert!(parse_expiration(&json!([1, 2])).is_none());
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(0) >= Duration::from_secs(1));
        assert!(policy.delay_for(0) <= Duration::from_secs(2));
        assert!(policy.delay_for(2) >= Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
    }

    #[test]
    fn credential_debug_hides_secrets() {
        let printed = format!("{:?}", password());
        assert!(!printed.contains("hunter22"));
        assert!(!printed.contains("steve_admin"));
    }
}
