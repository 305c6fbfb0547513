use super::{auth::AuthError, auth::AuthManager, stats::ServerStats};
use crate::{default_struct, utils::correlation_id};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const REDACTED: &str = "REDACTED";

default_struct! {
/// One deadline per request: `connect` for the TCP/TLS handshake, the rest
/// of the budget for sending and reading.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub connect: Duration = Duration::from_secs(5),
    pub read: Duration = Duration::from_secs(25),
}
}

impl Timeouts {
    pub fn total(&self) -> Duration {
        self.connect + self.read
    }
}

pub fn build_http_client(
    timeouts: &Timeouts,
    accept_invalid_certs: bool,
) -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.total())
        .pool_max_idle_per_host(10)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Network(String),
    #[error("Crafty API rejected the request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl ApiError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }

    /// Short text suitable for showing to the Discord user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(reason) => format!("❌ {}", reason),
            Self::Auth(_) => {
                "❌ Could not authenticate with Crafty Controller. Check the bot's credentials."
                    .into()
            }
            Self::Timeout(_) => "⚠️ Crafty API timed-out.".into(),
            Self::Network(_) => "⚠️ Could not reach Crafty Controller.".into(),
            Self::Rejected { status, .. } if is_auth_rejection(*status) => {
                "❌ Crafty Controller rejected the bot's credentials.".into()
            }
            Self::Rejected { message, .. } => format!("❌ Crafty Controller error: {}", message),
        }
    }
}

fn is_auth_rejection(status: u16) -> bool {
    status == StatusCode::UNAUTHORIZED.as_u16() || status == StatusCode::FORBIDDEN.as_u16()
}

pub enum RequestBody {
    /// Console input, sent as `text/plain`.
    Command(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Start,
    Stop,
    Restart,
    Kill,
    Backup,
}

impl ServerAction {
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Start => "start_server",
            Self::Stop => "stop_server",
            Self::Restart => "restart_server",
            Self::Kill => "kill_server",
            Self::Backup => "backup_server",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "Server Start",
            Self::Stop => "Server Stop",
            Self::Restart => "Server Restart",
            Self::Kill => "Server Kill",
            Self::Backup => "Server Backup",
        }
    }
}

/// Case-insensitively replaces the value of every `authorization` header.
pub fn redact_authorization<I, K, V>(headers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    headers
        .into_iter()
        .map(|(name, value)| {
            let name = name.as_ref().to_string();
            let value = if name.eq_ignore_ascii_case("authorization") {
                REDACTED.to_string()
            } else {
                value.as_ref().to_string()
            };
            (name, value)
        })
        .collect()
}

pub fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    redact_authorization(
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("<binary>"))),
    )
}

fn validate_command(command: &str) -> Result<(), ApiError> {
    if command.trim().is_empty() {
        return Err(ApiError::Validation("Command cannot be empty".into()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CraftyClient {
    client: Client,
    api_base: String,
    auth: AuthManager,
}

impl CraftyClient {
    pub fn new(base_url: &str, client: Client, auth: AuthManager) -> Self {
        Self {
            client,
            api_base: format!("{}/api/v2", base_url.trim_end_matches('/')),
            auth,
        }
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// Sends an authenticated request and returns the `data` member of the reply.
    ///
    /// An auth rejection in password mode invalidates the token and retries
    /// once with a fresh one; the second rejection is returned as is.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
    ) -> Result<Value, ApiError> {
        if let Some(RequestBody::Command(command)) = &body {
            validate_command(command)?;
        }

        let correlation_id = correlation_id();
        let token = self.auth.get_valid_token().await?;

        match self
            .send(&method, path, body.as_ref(), &token, &correlation_id)
            .await
        {
            Err(ApiError::Rejected { status, .. })
                if is_auth_rejection(status) && self.auth.can_refresh() =>
            {
                warn!(
                    "[{}] Crafty rejected the token (HTTP {}), retrying once with a new one",
                    correlation_id, status
                );
                self.auth.invalidate(&token).await;
                let token = self.auth.get_valid_token().await?;
                self.send(&method, path, body.as_ref(), &token, &correlation_id)
                    .await
            }
            result => result,
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: Option<&RequestBody>,
        token: &str,
        correlation_id: &str,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.api_base, path);
        let builder = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(token);
        let builder = match body {
            Some(RequestBody::Command(command)) => builder
                .header(CONTENT_TYPE, "text/plain")
                .body(command.clone()),
            None => builder,
        };
        let request = builder
            .build()
            .map_err(|e| ApiError::Validation(e.to_string()))?;

        debug!("[{}] Making {} request to {}", correlation_id, method, url);
        debug!(
            "[{}] Headers: {:?}",
            correlation_id,
            redact_headers(request.headers())
        );

        let start = Instant::now();
        let response = self.client.execute(request).await.map_err(|e| {
            error!("[{}] Request to {} failed: {}", correlation_id, url, e);
            ApiError::from_transport(e)
        })?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(ApiError::from_transport)?;
        info!(
            "[{}] Request to {} took {:.2} seconds (HTTP {})",
            correlation_id,
            url,
            start.elapsed().as_secs_f64(),
            status.as_u16()
        );

        let reply: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        if status.is_success() && reply.get("status").and_then(Value::as_str) == Some("ok") {
            return Ok(reply.get("data").cloned().unwrap_or(Value::Null));
        }

        let message = reply
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status));
        warn!(
            "[{}] Crafty API error on {} {}: {} ({})",
            correlation_id, method, path, message, status
        );
        Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn server_action(
        &self,
        server_id: &str,
        action: ServerAction,
    ) -> Result<Value, ApiError> {
        self.request(
            Method::POST,
            &format!("/servers/{}/action/{}", server_id, action.endpoint()),
            None,
        )
        .await
    }

    pub async fn server_stats(&self, server_id: &str) -> Result<ServerStats, ApiError> {
        debug!("Requesting stats for server {}", server_id);
        let data = self
            .request(Method::GET, &format!("/servers/{}/stats", server_id), None)
            .await?;
        Ok(ServerStats::from_value(server_id, &data))
    }

    pub async fn send_command(&self, server_id: &str, command: &str) -> Result<(), ApiError> {
        self.request(
            Method::POST,
            &format!("/servers/{}/stdin", server_id),
            Some(RequestBody::Command(command.to_string())),
        )
        .await?;
        Ok(())
    }
}
