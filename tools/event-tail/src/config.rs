use std::env;
use std::time::Duration;

const DEFAULT_STREAM_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 14;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Tool configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub nats_url: String,
    /// Postgres ledger; the in-memory ledger is used when unset
    pub database_url: Option<String>,
    pub subject: String,
    pub durable_name: String,
    pub stream_name: String,
    pub stream_max_age: Duration,
    pub max_in_flight: usize,
    pub dlq_max_attempts: u64,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bus_type = match var("BUS_TYPE").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("nats") => BusType::Nats,
            Some("inmemory") => BusType::InMemory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "BUS_TYPE",
                    value: other.to_string(),
                    reason: "must be 'nats' or 'inmemory'",
                })
            }
        };

        let nats_url = var("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());
        let database_url = var("DATABASE_URL");

        let subject = var("EVENT_SUBJECT").ok_or(ConfigError::Missing("EVENT_SUBJECT"))?;
        let root = subject.split('.').next().unwrap_or_default();
        if root == "*" || root == ">" {
            return Err(ConfigError::Invalid {
                key: "EVENT_SUBJECT",
                value: subject,
                reason: "first token must not be a wildcard",
            });
        }

        let durable_name = var("DURABLE_NAME").ok_or(ConfigError::Missing("DURABLE_NAME"))?;

        let stream_name = var("STREAM_NAME").unwrap_or_else(|| default_stream_name(&subject));

        let stream_max_age = Duration::from_secs(parse(
            "STREAM_MAX_AGE_SECS",
            var("STREAM_MAX_AGE_SECS"),
            DEFAULT_STREAM_MAX_AGE_SECS,
        )?);
        let max_in_flight = parse("MAX_IN_FLIGHT", var("MAX_IN_FLIGHT"), 16)?;
        let dlq_max_attempts = parse("DLQ_MAX_ATTEMPTS", var("DLQ_MAX_ATTEMPTS"), 5)?;

        let log_format = match var("LOG_FORMAT").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "must be 'text' or 'json'",
                })
            }
        };

        Ok(Config {
            bus_type,
            nats_url,
            database_url,
            subject,
            durable_name,
            stream_name,
            stream_max_age,
            max_in_flight,
            dlq_max_attempts,
            log_format,
        })
    }

    /// Subject patterns the provisioned stream covers
    ///
    /// `user.created` -> `user.>`, so sibling event types share one stream.
    pub fn stream_subjects(&self) -> Vec<String> {
        match self.subject.split_once('.') {
            Some((root, _)) => vec![format!("{root}.>")],
            None => vec![self.subject.clone()],
        }
    }
}

/// `user.created` -> `USER_EVENTS`
fn default_stream_name(subject: &str) -> String {
    let root: String = subject
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{root}_EVENTS")
}

fn parse<T: std::str::FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw,
            reason: "not a valid number",
        }),
    }
}
