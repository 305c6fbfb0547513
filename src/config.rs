use crate::modules::crafty::{auth::Credential, database::TokenCache};
use chrono::Duration;
use reqwest::Url;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

const MIN_DISCORD_TOKEN_LEN: usize = 50;
const DEFAULT_TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("set CRAFTY_TOKEN, or both CRAFTY_USERNAME and CRAFTY_PASSWORD")]
    MissingCredentials,
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

/// Startup configuration, read once from the environment.
pub struct Config {
    pub discord_token: String,
    pub crafty_url: String,
    pub server_id: String,
    pub guild_id: Option<u64>,
    pub credential: Credential,
    pub token_cache: PathBuf,
    pub token_lifetime: Duration,
    pub accept_invalid_certs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let discord_token = require("DISCORD_TOKEN")?;
        if discord_token.len() < MIN_DISCORD_TOKEN_LEN {
            return Err(invalid("DISCORD_TOKEN", "token is too short"));
        }

        let crafty_url = require("CRAFTY_URL")?;
        let parsed =
            Url::parse(&crafty_url).map_err(|e| invalid("CRAFTY_URL", e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("CRAFTY_URL", "must start with http:// or https://"));
        }
        let crafty_url = crafty_url.trim_end_matches('/').to_string();

        let server_id = Uuid::parse_str(&require("SERVER_ID")?)
            .map_err(|_| invalid("SERVER_ID", "must be a UUID"))?
            .hyphenated()
            .to_string();

        let guild_id = match get("GUILD_ID") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(id) if id > 0 => Some(id),
                _ => return Err(invalid("GUILD_ID", "must be a positive integer")),
            },
            None => None,
        };

        let credential = match (
            get("CRAFTY_TOKEN"),
            get("CRAFTY_USERNAME"),
            get("CRAFTY_PASSWORD"),
        ) {
            (Some(token), username, password) => {
                if username.is_some() || password.is_some() {
                    warn!("Both CRAFTY_TOKEN and username/password are set, using the token");
                }
                Credential::StaticToken(token)
            }
            (None, Some(username), Some(password)) => Credential::Password { username, password },
            _ => return Err(ConfigError::MissingCredentials),
        };

        let token_cache = get("CRAFTY_TOKEN_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(TokenCache::default_path);

        let token_lifetime = match get("CRAFTY_TOKEN_LIFETIME_HOURS") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(hours) if hours > 0 => Duration::hours(hours),
                _ => {
                    return Err(invalid(
                        "CRAFTY_TOKEN_LIFETIME_HOURS",
                        "must be a positive number of hours",
                    ))
                }
            },
            None => Duration::hours(DEFAULT_TOKEN_LIFETIME_HOURS),
        };

        let accept_invalid_certs = get("CRAFTY_ACCEPT_INVALID_CERTS")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Ok(Self {
            discord_token,
            crafty_url,
            server_id,
            guild_id,
            credential,
            token_cache,
            token_lifetime,
            accept_invalid_certs,
        })
    }

    pub fn auth_mode(&self) -> &'static str {
        match self.credential {
            Credential::StaticToken(_) => "static token",
            Credential::Password { .. } => "username/password",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SERVER_ID: &str = "0B7F2C9E-3A41-4F7B-9C2D-8E5A6B1C4D3F";

    fn base() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DISCORD_TOKEN", "d".repeat(60)),
            ("CRAFTY_URL", "https://crafty.example.com:8443/".to_string()),
            ("SERVER_ID", SERVER_ID.to_string()),
            ("CRAFTY_USERNAME", "steve".to_string()),
            ("CRAFTY_PASSWORD", "diamonds".to_string()),
            ("CRAFTY_TOKEN_CACHE", "/tmp/crafty-cache.json".to_string()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn password_mode_defaults() {
        let config = load(&base()).unwrap();
        assert_eq!(config.crafty_url, "https://crafty.example.com:8443");
        assert_eq!(config.server_id, SERVER_ID.to_lowercase());
        assert_eq!(config.guild_id, None);
        assert_eq!(config.auth_mode(), "username/password");
        assert_eq!(config.token_lifetime, Duration::hours(24));
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn static_token_takes_precedence() {
        let mut vars = base();
        vars.insert("CRAFTY_TOKEN", "static-token".to_string());
        let config = load(&vars).unwrap();
        assert!(matches!(config.credential, Credential::StaticToken(ref t) if t == "static-token"));
    }

    #[test]
    fn credentials_are_required() {
        let mut vars = base();
        vars.remove("CRAFTY_PASSWORD");
        assert!(matches!(load(&vars), Err(ConfigError::MissingCredentials)));

        vars.insert("CRAFTY_PASSWORD", "   ".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn rejects_malformed_values() {
        let cases = [
            ("SERVER_ID", "not-a-uuid"),
            ("CRAFTY_URL", "ftp://crafty.local"),
            ("CRAFTY_URL", "crafty.local"),
            ("GUILD_ID", "0"),
            ("GUILD_ID", "abc"),
            ("DISCORD_TOKEN", "short"),
            ("CRAFTY_TOKEN_LIFETIME_HOURS", "-3"),
        ];
        for (key, value) in cases {
            let mut vars = base();
            vars.insert(key, value.to_string());
            match load(&vars) {
                Err(ConfigError::Invalid { name, .. }) => assert_eq!(name, key),
                _ => panic!("{}={} should be rejected", key, value),
            }
        }
    }

    #[test]
    fn missing_required_variable_is_named() {
        let mut vars = base();
        vars.remove("SERVER_ID");
        assert!(matches!(load(&vars), Err(ConfigError::Missing("SERVER_ID"))));
    }

    #[test]
    fn optional_tunables() {
        let mut vars = base();
        vars.insert("GUILD_ID", "123456789012345678".to_string());
        vars.insert("CRAFTY_TOKEN_LIFETIME_HOURS", "6".to_string());
        vars.insert("CRAFTY_ACCEPT_INVALID_CERTS", "TRUE".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(config.guild_id, Some(123456789012345678));
        assert_eq!(config.token_lifetime, Duration::hours(6));
        assert!(config.accept_invalid_certs);
    }
}
