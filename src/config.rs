use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_API_URL, DEFAULT_CHECK_INTERVAL_SECS, DEFAULT_FORUM_URL, DEFAULT_USER_AGENT,
};
use crate::monitor::CheckWindow;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
    #[error("failed to read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    ParseThreads {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Forum API
    pub api_url: String,
    pub forum_url: String,
    pub passport_uid: String,
    pub passport_cid: String,
    pub user_agent: String,
    pub request_timeout: Duration,

    // Crawling
    pub rate_limit_per_minute: u32,
    pub max_workers: usize,

    // Monitoring
    pub threads_file: PathBuf,
    pub check_all_interval: Duration,
    pub inter_check_delay: Duration,
    pub shutdown_grace: Duration,
    pub default_check_interval: u64,
    pub notify_preview_chars: usize,

    // Database
    pub database_path: PathBuf,

    // Web Server
    pub web_host: String,
    pub web_port: u16,

    // Notifications
    pub console_notification_enabled: bool,
    pub bark: Option<BarkConfig>,
}

/// Bark push notification settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarkConfig {
    pub server_url: String,
    pub device_key: String,
    pub group: String,
    pub sound: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bark = if parse_env_bool("BARK_ENABLED", false)? {
            Some(BarkConfig {
                server_url: required_env("BARK_SERVER_URL")?,
                device_key: required_env("BARK_DEVICE_KEY")?,
                group: env_or_default("BARK_GROUP", "NGA"),
                sound: env_or_default("BARK_SOUND", "default"),
            })
        } else {
            None
        };

        Ok(Self {
            // Forum API
            api_url: env_or_default("NGA_API_URL", DEFAULT_API_URL),
            forum_url: env_or_default("NGA_FORUM_URL", DEFAULT_FORUM_URL),
            passport_uid: required_env("NGA_PASSPORT_UID")?,
            passport_cid: required_env("NGA_PASSPORT_CID")?,
            user_agent: env_or_default("USER_AGENT", DEFAULT_USER_AGENT),
            request_timeout: Duration::from_secs(parse_env_u64("REQUEST_TIMEOUT_SECS", 30)?),

            // Crawling
            rate_limit_per_minute: parse_env_u32("RATE_LIMIT_PER_MINUTE", 30)?,
            max_workers: parse_env_usize("MAX_WORKERS", 5)?,

            // Monitoring
            threads_file: PathBuf::from(env_or_default("THREADS_FILE", "./config/threads.toml")),
            check_all_interval: Duration::from_secs(parse_env_u64("CHECK_ALL_INTERVAL_SECS", 30)?),
            inter_check_delay: Duration::from_millis(parse_env_u64("INTER_CHECK_DELAY_MS", 1000)?),
            shutdown_grace: Duration::from_secs(parse_env_u64("SHUTDOWN_GRACE_SECS", 10)?),
            default_check_interval: parse_env_u64(
                "DEFAULT_CHECK_INTERVAL_SECS",
                DEFAULT_CHECK_INTERVAL_SECS,
            )?,
            notify_preview_chars: parse_env_usize("NOTIFY_PREVIEW_CHARS", 100)?,

            // Database
            database_path: PathBuf::from(env_or_default(
                "DATABASE_PATH",
                "./data/nga_data.sqlite",
            )),

            // Web Server
            web_host: env_or_default("WEB_HOST", "127.0.0.1"),
            web_port: parse_env_u16("WEB_PORT", 8000)?,

            // Notifications
            console_notification_enabled: parse_env_bool("CONSOLE_NOTIFICATION_ENABLED", true)?,
            bark,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::InvalidValue {
                name: "RATE_LIMIT_PER_MINUTE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.passport_uid.is_empty() || self.passport_cid.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "NGA_PASSPORT_UID/NGA_PASSPORT_CID".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if self.check_all_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "CHECK_ALL_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_check_interval == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DEFAULT_CHECK_INTERVAL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        for (name, value) in [("NGA_API_URL", &self.api_url), ("NGA_FORUM_URL", &self.forum_url)] {
            if let Err(e) = url::Url::parse(value) {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: format!("not a valid URL: {e}"),
                });
            }
        }
        if let Some(bark) = &self.bark {
            if let Err(e) = url::Url::parse(&bark.server_url) {
                return Err(ConfigError::InvalidValue {
                    name: "BARK_SERVER_URL".to_string(),
                    message: format!("not a valid URL: {e}"),
                });
            }
        }
        Ok(())
    }

    /// Configuration with harmless defaults, for tests.
    #[doc(hidden)]
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            forum_url: DEFAULT_FORUM_URL.to_string(),
            passport_uid: "test-uid".to_string(),
            passport_cid: "test-cid".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(5),
            rate_limit_per_minute: 60_000,
            max_workers: 4,
            threads_file: PathBuf::from("./config/threads.toml"),
            check_all_interval: Duration::from_secs(30),
            inter_check_delay: Duration::ZERO,
            shutdown_grace: Duration::from_secs(1),
            default_check_interval: DEFAULT_CHECK_INTERVAL_SECS,
            notify_preview_chars: 100,
            database_path: PathBuf::from("./data/test.sqlite"),
            web_host: "127.0.0.1".to_string(),
            web_port: 8000,
            console_notification_enabled: false,
            bark: None,
        }
    }
}

/// One `[[threads]]` entry of the subscriptions file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ThreadEntry {
    pub tid: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub author_filter: Option<Vec<i64>>,
    #[serde(default)]
    pub author_notification: Option<Vec<i64>>,
    #[serde(default)]
    pub check_interval: Option<u64>,
    #[serde(default)]
    pub check_schedule: Vec<CheckWindow>,
}

const fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ThreadsFile {
    #[serde(default)]
    threads: Vec<ThreadEntry>,
}

/// Load monitored thread entries from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or
/// contains an entry with an invalid tid or schedule.
pub fn load_thread_entries(path: &Path) -> Result<Vec<ThreadEntry>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    parse_thread_entries(&content).map_err(|e| match e {
        ConfigError::ParseThreads { source, .. } => ConfigError::ParseThreads {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Parse the contents of a subscriptions file.
///
/// # Errors
///
/// Returns an error on invalid TOML or invalid entries.
pub fn parse_thread_entries(content: &str) -> Result<Vec<ThreadEntry>, ConfigError> {
    let file: ThreadsFile = toml::from_str(content).map_err(|source| ConfigError::ParseThreads {
        path: PathBuf::new(),
        source,
    })?;

    for entry in &file.threads {
        if entry.tid <= 0 {
            return Err(ConfigError::InvalidValue {
                name: "threads.tid".to_string(),
                message: format!("must be positive, got {}", entry.tid),
            });
        }
        for window in &entry.check_schedule {
            window
                .validate()
                .map_err(|message| ConfigError::InvalidValue {
                    name: format!("threads[{}].check_schedule", entry.tid),
                    message,
                })?;
        }
    }

    Ok(file.threads)
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = std::num::ParseIntError>,
{
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    parse_env(name, default)
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    parse_env(name, default)
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    parse_env(name, default)
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    parse_env(name, default)
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}
