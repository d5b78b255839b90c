//! Environment-backed runtime configuration for `ternchat-smoke`.

use std::{env, error::Error, fmt};

use chat_core::ChatInitConfig;

const DEFAULT_BASE_URL: &str = "https://api.example.com";
const DEFAULT_WATCH_SECS: u64 = 10;

/// Runtime configuration used by the smoke binary.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Remote conversation API base URL.
    pub base_url: String,
    /// Bearer token; without it the binary only prints wiring hints.
    pub auth_token: Option<String>,
    /// Optional conversation to open after the auth check.
    pub conversation_id: Option<String>,
    /// Optional media URL fetched through the proxy cache.
    pub media_url: Option<String>,
    /// Optional runtime tuning forwarded to `ChatCommand::Init`.
    pub init_config: Option<ChatInitConfig>,
    /// How long the binary stays subscribed to runtime events.
    pub watch_secs: u64,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = optional_trimmed_env("TERNCHAT_API_BASE_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let auth_token = optional_trimmed_env("TERNCHAT_API_TOKEN", &mut lookup);
        let conversation_id = optional_trimmed_env("TERNCHAT_CONVERSATION_ID", &mut lookup);
        let media_url = optional_trimmed_env("TERNCHAT_MEDIA_URL", &mut lookup);

        let poll_interval_ms = parse_optional_u64("TERNCHAT_POLL_INTERVAL_MS", &mut lookup)?;
        let page_limit = parse_optional_u16("TERNCHAT_PAGE_LIMIT", &mut lookup)?;
        let pagination_limit_cap =
            parse_optional_u16("TERNCHAT_PAGINATION_LIMIT_CAP", &mut lookup)?;

        let init_config = if poll_interval_ms.is_none()
            && page_limit.is_none()
            && pagination_limit_cap.is_none()
        {
            None
        } else {
            Some(ChatInitConfig {
                poll_interval_ms,
                page_limit,
                pagination_limit_cap,
            })
        };

        let watch_secs = parse_optional_u64("TERNCHAT_WATCH_SECS", &mut lookup)?
            .unwrap_or(DEFAULT_WATCH_SECS);
        if watch_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TERNCHAT_WATCH_SECS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            base_url,
            auth_token,
            conversation_id,
            media_url,
            init_config,
            watch_secs,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.auth_token, None);
        assert_eq!(cfg.conversation_id, None);
        assert!(cfg.init_config.is_none());
        assert_eq!(cfg.watch_secs, DEFAULT_WATCH_SECS);
    }

    #[test]
    fn parses_runtime_tuning_when_present() {
        let cfg = config_from_pairs(&[
            ("TERNCHAT_API_BASE_URL", "https://api.other.example"),
            ("TERNCHAT_API_TOKEN", "tok-123"),
            ("TERNCHAT_POLL_INTERVAL_MS", "2000"),
            ("TERNCHAT_PAGE_LIMIT", "25"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.base_url, "https://api.other.example");
        assert_eq!(cfg.auth_token.as_deref(), Some("tok-123"));
        let init = cfg.init_config.expect("init config should be present");
        assert_eq!(init.poll_interval_ms, Some(2_000));
        assert_eq!(init.page_limit, Some(25));
        assert_eq!(init.pagination_limit_cap, None);
    }

    #[test]
    fn trims_and_drops_blank_values() {
        let cfg = config_from_pairs(&[("TERNCHAT_API_TOKEN", "   ")])
            .expect("blank token should parse as absent");
        assert_eq!(cfg.auth_token, None);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("TERNCHAT_POLL_INTERVAL_MS", "fast")])
            .expect_err("invalid interval should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TERNCHAT_POLL_INTERVAL_MS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_watch_window() {
        let err = config_from_pairs(&[("TERNCHAT_WATCH_SECS", "0")])
            .expect_err("zero watch window should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TERNCHAT_WATCH_SECS",
                ..
            }
        ));
    }
}
