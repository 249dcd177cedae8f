//! Environment-backed tuning for the retry scheduler and presence tracker.

use std::{env, time::Duration};

use thiserror::Error;

use crate::{
    presence::PresenceConfig,
    retry::{
        DEFAULT_INITIAL_DELAY_MS, DEFAULT_JITTER_MAX_MS, DEFAULT_MAX_ATTEMPTS,
        DEFAULT_MAX_DELAY_MS, RetryPolicy,
    },
};

const DEFAULT_HEARTBEAT_MS: u64 = 15_000;
const DEFAULT_STALE_AFTER_MS: u64 = 45_000;

/// Runtime configuration shared by one client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResilienceConfig {
    /// Defaults applied to submitted tasks that do not override them.
    pub retry: RetryPolicy,
    /// Heartbeat cadence and observer staleness window.
    pub presence: PresenceConfig,
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed or was out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ResilienceConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let max_attempts = parse_u64_with_default(
            "RESILIENCE_RETRY_MAX_ATTEMPTS",
            u64::from(DEFAULT_MAX_ATTEMPTS),
            &mut lookup,
        )?;
        let initial_delay_ms = parse_u64_with_default(
            "RESILIENCE_RETRY_INITIAL_DELAY_MS",
            DEFAULT_INITIAL_DELAY_MS,
            &mut lookup,
        )?;
        let max_delay_ms = parse_u64_with_default(
            "RESILIENCE_RETRY_MAX_DELAY_MS",
            DEFAULT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let jitter_max_ms = parse_u64_with_default(
            "RESILIENCE_RETRY_JITTER_MAX_MS",
            DEFAULT_JITTER_MAX_MS,
            &mut lookup,
        )?;
        let heartbeat_ms = parse_u64_with_default(
            "RESILIENCE_PRESENCE_HEARTBEAT_MS",
            DEFAULT_HEARTBEAT_MS,
            &mut lookup,
        )?;
        let stale_after_ms = parse_u64_with_default(
            "RESILIENCE_PRESENCE_STALE_AFTER_MS",
            DEFAULT_STALE_AFTER_MS,
            &mut lookup,
        )?;

        let max_attempts = u32::try_from(max_attempts)
            .ok()
            .filter(|value| *value >= 1)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "RESILIENCE_RETRY_MAX_ATTEMPTS",
                value: max_attempts.to_string(),
                reason: "must be between 1 and 4294967295".to_owned(),
            })?;
        if max_delay_ms < initial_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "RESILIENCE_RETRY_MAX_DELAY_MS",
                value: max_delay_ms.to_string(),
                reason: format!("must be at least the initial delay ({initial_delay_ms}ms)"),
            });
        }
        if heartbeat_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RESILIENCE_PRESENCE_HEARTBEAT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if stale_after_ms <= heartbeat_ms {
            return Err(ConfigError::InvalidValue {
                key: "RESILIENCE_PRESENCE_STALE_AFTER_MS",
                value: stale_after_ms.to_string(),
                reason: format!("must exceed the heartbeat interval ({heartbeat_ms}ms)"),
            });
        }

        Ok(Self {
            retry: RetryPolicy::new(max_attempts, initial_delay_ms, max_delay_ms)
                .with_jitter_max_ms(jitter_max_ms),
            presence: PresenceConfig {
                heartbeat_interval: Duration::from_millis(heartbeat_ms),
                stale_after: Duration::from_millis(stale_after_ms),
            },
        })
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
