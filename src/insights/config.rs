// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

pub const ENDPOINT_KEY: &str = "endpoint";
pub const TOKEN_KEY: &str = "token";
pub const INSECURE_SKIP_VERIFY_KEY: &str = "insecure-skip-verify";
pub const GZIP_KEY: &str = "gzip";
pub const GZIP_LEVEL_KEY: &str = "gzip-level";
pub const VERIFY_CONNECTION_KEY: &str = "verify-connection";
pub const BATCH_SIZE_KEY: &str = "batch-size";
pub const BATCH_INTERVAL_KEY: &str = "batch-interval";

const SUPPORTED_KEYS: &[&str] = &[
    ENDPOINT_KEY,
    TOKEN_KEY,
    INSECURE_SKIP_VERIFY_KEY,
    GZIP_KEY,
    GZIP_LEVEL_KEY,
    VERIFY_CONNECTION_KEY,
    BATCH_SIZE_KEY,
    BATCH_INTERVAL_KEY,
];

pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";
pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_MAXIMUM: usize = 10 * DEFAULT_BATCH_SIZE;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4 * DEFAULT_BATCH_SIZE;
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_GZIP_LEVEL: u32 = 9;
const DEFAULT_GZIP_LEVEL: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown log opt {0:?}")]
    UnknownOption(String),

    #[error("log opt {0:?} is required")]
    MissingOption(&'static str),

    #[error("invalid value for {key:?}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Process-wide delivery defaults, resolved once at startup from CLI flags
/// and environment, then shared read-only across sessions.
#[derive(Debug, Clone)]
pub struct WorkerDefaults {
    /// Capacity of each worker's input queue.
    pub channel_capacity: usize,
    /// Envelopes retained across failed sends before the oldest are dropped.
    pub buffer_maximum: usize,
    /// Per-request delivery timeout.
    pub send_timeout: Duration,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            buffer_maximum: DEFAULT_BUFFER_MAXIMUM,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Resolved telemetry configuration for one session. Built once at session
/// construction and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct InsightsConfig {
    pub endpoint: String,
    pub instrumentation_key: String,
    pub insecure_skip_verify: bool,
    pub gzip: bool,
    pub gzip_level: u32,
    pub verify_connection: bool,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub channel_capacity: usize,
    pub buffer_maximum: usize,
    pub send_timeout: Duration,
}

impl InsightsConfig {
    /// Validates the daemon-supplied option map against the supported keys
    /// and resolves it into an immutable config. Unknown keys and malformed
    /// values are hard errors; the instrumentation key is mandatory.
    pub fn resolve(
        options: &BTreeMap<String, String>,
        defaults: &WorkerDefaults,
    ) -> Result<Self, ConfigError> {
        validate_options(options)?;

        let instrumentation_key = match options.get(TOKEN_KEY) {
            Some(token) if !token.is_empty() => token.clone(),
            _ => return Err(ConfigError::MissingOption(TOKEN_KEY)),
        };

        let endpoint = parse_endpoint(get_option(options, ENDPOINT_KEY).unwrap_or(DEFAULT_ENDPOINT))?;
        let insecure_skip_verify = parse_bool(options, INSECURE_SKIP_VERIFY_KEY, false)?;
        let gzip = parse_bool(options, GZIP_KEY, false)?;
        let gzip_level = parse_gzip_level(options)?;
        let verify_connection = parse_bool(options, VERIFY_CONNECTION_KEY, true)?;
        let batch_size = parse_batch_size(options)?;
        let batch_interval = parse_batch_interval(options)?;

        Ok(Self {
            endpoint,
            instrumentation_key,
            insecure_skip_verify,
            gzip,
            gzip_level,
            verify_connection,
            batch_size,
            batch_interval,
            channel_capacity: defaults.channel_capacity,
            buffer_maximum: defaults.buffer_maximum,
            send_timeout: defaults.send_timeout,
        })
    }
}

fn validate_options(options: &BTreeMap<String, String>) -> Result<(), ConfigError> {
    for key in options.keys() {
        if !SUPPORTED_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::UnknownOption(key.clone()));
        }
    }
    Ok(())
}

fn get_option<'a>(options: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    options.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_endpoint(raw: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: ENDPOINT_KEY,
        reason,
    };

    let parsed = url::Url::parse(raw)
        .map_err(|e| invalid(format!("{}: {}", raw, e)))?;

    // The track endpoint is scheme://host[:port]/path with nothing extra.
    if !matches!(parsed.scheme(), "http" | "https")
        || parsed.host_str().is_none()
        || parsed.path().is_empty()
        || parsed.path() == "/"
        || parsed.query().is_some()
        || parsed.fragment().is_some()
    {
        return Err(invalid(format!(
            "expected scheme://dns_name_or_ip:port/path, received: {}",
            raw
        )));
    }

    Ok(parsed.to_string())
}

fn parse_bool(
    options: &BTreeMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get_option(options, key) {
        None => Ok(default),
        Some(val) => match val.to_lowercase().as_str() {
            "0" | "false" => Ok(false),
            "1" | "true" => Ok(true),
            _ => Err(ConfigError::InvalidValue {
                key,
                reason: format!("unable to parse bool value: {}", val),
            }),
        },
    }
}

fn parse_gzip_level(options: &BTreeMap<String, String>) -> Result<u32, ConfigError> {
    match get_option(options, GZIP_LEVEL_KEY) {
        None => Ok(DEFAULT_GZIP_LEVEL),
        Some(val) => {
            let level: u32 = val.parse().map_err(|e| ConfigError::InvalidValue {
                key: GZIP_LEVEL_KEY,
                reason: format!("{}: {}", val, e),
            })?;
            if level > MAX_GZIP_LEVEL {
                return Err(ConfigError::InvalidValue {
                    key: GZIP_LEVEL_KEY,
                    reason: format!("supported levels are 0 through {}", MAX_GZIP_LEVEL),
                });
            }
            Ok(level)
        }
    }
}

fn parse_batch_size(options: &BTreeMap<String, String>) -> Result<usize, ConfigError> {
    match get_option(options, BATCH_SIZE_KEY) {
        None => Ok(DEFAULT_BATCH_SIZE),
        Some(val) => {
            let size: usize = val.parse().map_err(|e| ConfigError::InvalidValue {
                key: BATCH_SIZE_KEY,
                reason: format!("{}: {}", val, e),
            })?;
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: BATCH_SIZE_KEY,
                    reason: "batch size must be at least 1".to_string(),
                });
            }
            Ok(size)
        }
    }
}

fn parse_batch_interval(options: &BTreeMap<String, String>) -> Result<Duration, ConfigError> {
    match get_option(options, BATCH_INTERVAL_KEY) {
        None => Ok(DEFAULT_BATCH_INTERVAL),
        Some(val) => {
            let interval = humantime::parse_duration(val).map_err(|e| ConfigError::InvalidValue {
                key: BATCH_INTERVAL_KEY,
                reason: format!("{}: {}", val, e),
            })?;
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: BATCH_INTERVAL_KEY,
                    reason: "batch interval must be non-zero".to_string(),
                });
            }
            Ok(interval)
        }
    }
}
