use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tokio::time::Duration;

use crate::{
    auth::AccessTokens,
    orchestrator::DEFAULT_COST,
    replicate::{
        DEFAULT_API_BASE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_TIMEOUT_SECS, ErrorClassifier,
        FileOutputMode, ReplicateConfig,
    },
    retry::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS, RetryPolicy},
};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_LOG_LEVEL: &str = "info";
const APP_DIR_NAME: &str = "kontext-studio";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("REPLICATE_API_TOKEN is not configured")]
    MissingApiToken,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub replicate: ReplicateConfig,
    pub retry: RetryPolicy,
    pub cost: Option<String>,
    pub data_dir: PathBuf,
    pub static_dir: PathBuf,
    pub store: StoreKind,
    pub access_tokens: AccessTokens,
    pub classifier: ErrorClassifier,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as
    /// unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_token = get("REPLICATE_API_TOKEN").ok_or(ConfigError::MissingApiToken)?;
        let file_output = match get("REPLICATE_FILE_OUTPUT") {
            Some(value) => value.parse::<FileOutputMode>().map_err(|_| ConfigError::InvalidValue {
                key: "REPLICATE_FILE_OUTPUT",
                value,
            })?,
            None => FileOutputMode::default(),
        };

        let store = match get("STORE").as_deref() {
            None | Some("file") => StoreKind::File,
            Some("memory") => StoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "STORE",
                    value: other.to_string(),
                });
            }
        };

        let classifier = {
            let defaults = ErrorClassifier::default();
            match (get("SENSITIVE_PATTERNS"), get("INTERRUPTED_PATTERNS")) {
                (None, None) => defaults,
                (sensitive, interrupted) => ErrorClassifier::new(
                    split_list(sensitive.as_deref().unwrap_or("flagged as sensitive")),
                    split_list(interrupted.as_deref().unwrap_or("Prediction interrupted")),
                ),
            }
        };

        let data_dir = get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            let mut base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
            base.push(APP_DIR_NAME);
            base
        });

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            replicate: ReplicateConfig {
                api_token,
                api_base: get("REPLICATE_API_BASE")
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
                file_output,
                poll_interval: Duration::from_millis(parse_or(
                    "REPLICATE_POLL_INTERVAL_MS",
                    get("REPLICATE_POLL_INTERVAL_MS"),
                    DEFAULT_POLL_INTERVAL_MS,
                )?),
                poll_timeout: Duration::from_secs(parse_or(
                    "REPLICATE_POLL_TIMEOUT_SECS",
                    get("REPLICATE_POLL_TIMEOUT_SECS"),
                    DEFAULT_POLL_TIMEOUT_SECS,
                )?),
            },
            retry: RetryPolicy {
                max_attempts: parse_or(
                    "GENERATION_MAX_ATTEMPTS",
                    get("GENERATION_MAX_ATTEMPTS"),
                    DEFAULT_MAX_ATTEMPTS,
                )?
                .max(1),
                base_delay: Duration::from_millis(parse_or(
                    "GENERATION_RETRY_DELAY_MS",
                    get("GENERATION_RETRY_DELAY_MS"),
                    DEFAULT_RETRY_DELAY_MS,
                )?),
            },
            cost: match lookup("GENERATION_COST") {
                Some(value) if value.trim().is_empty() => None,
                Some(value) => Some(value.trim().to_string()),
                None => Some(DEFAULT_COST.to_string()),
            },
            data_dir,
            static_dir: get("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public")),
            store,
            access_tokens: AccessTokens::parse(&get("ACCESS_TOKENS").unwrap_or_default()),
            classifier,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
