use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::{ChatId, UserId};

use crate::watcher::manager::{DEFAULT_ADDRESS_PATTERN, WatcherSettings};
use crate::watcher::{FeedMode, TransportSettings};

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Invalid regex pattern.
    InvalidRegex { pattern: String, source: regex::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidRegex { pattern, source } => {
                write!(f, "invalid regex pattern '{}': {}", pattern, source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidRegex { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    owner_ids: Vec<u64>,
    telegram_bot_token: String,
    /// Chat that receives activity notifications (defaults to the first owner's DM)
    notify_chat_id: Option<i64>,
    #[serde(default = "default_rpc_url")]
    rpc_url: String,
    #[serde(default = "default_ws_url")]
    ws_url: String,
    #[serde(default = "default_commitment")]
    commitment: String,
    /// "poll" or "push"
    #[serde(default = "default_feed_mode")]
    feed_mode: String,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_fetch_limit")]
    fetch_limit: usize,
    #[serde(default = "default_poll_failure_threshold")]
    poll_failure_threshold: u32,
    #[serde(default = "default_reconnect_base_ms")]
    reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    reconnect_max_delay_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    ping_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default = "default_true")]
    backfill_on_reconnect: bool,
    #[serde(default = "default_seen_capacity")]
    seen_capacity: usize,
    /// Transaction link prefix; the signature is appended.
    #[serde(default = "default_explorer_tx_url")]
    explorer_tx_url: String,
    /// Override for the wallet address format check.
    address_pattern: Option<String>,
    #[serde(default)]
    dry_run: bool,
    log_chat_id: Option<i64>,
    /// Directory for state files (logs, database). Defaults to current directory.
    data_dir: Option<String>,
}

fn default_rpc_url() -> String {
    "https://api.mainnet-beta.solana.com".to_string()
}

fn default_ws_url() -> String {
    "wss://api.mainnet-beta.solana.com".to_string()
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_feed_mode() -> String {
    "poll".to_string()
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_fetch_limit() -> usize {
    10
}

fn default_poll_failure_threshold() -> u32 {
    3
}

fn default_reconnect_base_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_seen_capacity() -> usize {
    4096
}

fn default_explorer_tx_url() -> String {
    "https://solscan.io/tx/".to_string()
}

pub struct Config {
    /// Owner IDs - only these users may issue commands.
    pub owner_ids: Vec<UserId>,
    /// Path to the config file.
    pub config_path: PathBuf,
    pub telegram_bot_token: String,
    pub notify_chat_id: ChatId,
    pub rpc_url: String,
    pub ws_url: String,
    pub commitment: String,
    pub feed_mode: FeedMode,
    pub poll_interval: Duration,
    pub fetch_limit: usize,
    pub poll_failure_threshold: u32,
    pub reconnect_base: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub request_timeout: Duration,
    pub backfill_on_reconnect: bool,
    pub seen_capacity: usize,
    pub explorer_tx_url: String,
    pub address_pattern: Regex,
    pub dry_run: bool,
    pub log_chat_id: Option<ChatId>,
    /// Directory for state files (logs, database).
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Validate required fields
        if file.owner_ids.is_empty() {
            return Err(ConfigError::Validation("owner_ids must contain at least one owner ID".into()));
        }
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }

        let feed_mode = match file.feed_mode.as_str() {
            "poll" | "polling" => FeedMode::Polling,
            "push" => FeedMode::Push,
            other => {
                return Err(ConfigError::Validation(format!(
                    "feed_mode must be \"poll\" or \"push\", got \"{other}\""
                )));
            }
        };
        if !(1..=1000).contains(&file.fetch_limit) {
            return Err(ConfigError::Validation("fetch_limit must be between 1 and 1000".into()));
        }
        if file.max_reconnect_attempts == 0 {
            return Err(ConfigError::Validation("max_reconnect_attempts must be at least 1".into()));
        }
        if file.poll_interval_secs == 0 || file.ping_interval_secs == 0 || file.request_timeout_secs == 0 {
            return Err(ConfigError::Validation("intervals and timeouts must be non-zero".into()));
        }
        if file.reconnect_base_ms == 0 {
            return Err(ConfigError::Validation("reconnect_base_ms must be non-zero".into()));
        }

        let pattern = file.address_pattern.unwrap_or_else(|| DEFAULT_ADDRESS_PATTERN.to_string());
        let address_pattern = Regex::new(&pattern)
            .map_err(|e| ConfigError::InvalidRegex { pattern: pattern.clone(), source: e })?;

        let owner_ids: Vec<UserId> = file.owner_ids.into_iter().map(UserId).collect();
        // Private chat id with a user equals their user id
        let notify_chat_id = ChatId(file.notify_chat_id.unwrap_or(owner_ids[0].0 as i64));

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            owner_ids,
            config_path,
            telegram_bot_token: file.telegram_bot_token,
            notify_chat_id,
            rpc_url: file.rpc_url,
            ws_url: file.ws_url,
            commitment: file.commitment,
            feed_mode,
            poll_interval: Duration::from_secs(file.poll_interval_secs),
            fetch_limit: file.fetch_limit,
            poll_failure_threshold: file.poll_failure_threshold.max(1),
            reconnect_base: Duration::from_millis(file.reconnect_base_ms),
            reconnect_max_delay: Duration::from_secs(file.reconnect_max_delay_secs),
            max_reconnect_attempts: file.max_reconnect_attempts,
            ping_interval: Duration::from_secs(file.ping_interval_secs),
            request_timeout: Duration::from_secs(file.request_timeout_secs),
            backfill_on_reconnect: file.backfill_on_reconnect,
            seen_capacity: file.seen_capacity.max(1),
            explorer_tx_url: file.explorer_tx_url,
            address_pattern,
            dry_run: file.dry_run,
            log_chat_id: file.log_chat_id.map(ChatId),
            data_dir,
        })
    }

    pub fn is_owner(&self, user_id: UserId) -> bool {
        self.owner_ids.contains(&user_id)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("walletwatch.db")
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            transport: TransportSettings {
                poll_interval: self.poll_interval,
                fetch_limit: self.fetch_limit,
                poll_failure_threshold: self.poll_failure_threshold,
                reconnect_base: self.reconnect_base,
                reconnect_max_delay: self.reconnect_max_delay,
                max_reconnect_attempts: self.max_reconnect_attempts,
                ping_interval: self.ping_interval,
                request_timeout: self.request_timeout,
            },
            backfill_on_reconnect: self.backfill_on_reconnect,
            seen_capacity: self.seen_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn assert_err<T>(result: Result<T, ConfigError>) -> ConfigError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[test]
    fn test_valid_config_defaults() {
        let file = write_config(r#"{
            "owner_ids": [123456],
            "telegram_bot_token": "123456789:ABCdefGHIjklMNOpqrsTUVwxyz"
        }"#);
        let config = Config::load(file.path()).expect("should load valid config");
        assert_eq!(config.owner_ids, vec![UserId(123456)]);
        assert_eq!(config.notify_chat_id, ChatId(123456));
        assert_eq!(config.feed_mode, FeedMode::Polling);
        assert_eq!(config.commitment, "confirmed");
        assert!(config.backfill_on_reconnect);
        assert!(config.address_pattern.is_match("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"));

        let settings = config.watcher_settings();
        assert_eq!(settings.transport.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.transport.fetch_limit, 10);
        assert_eq!(settings.transport.reconnect_base, Duration::from_millis(1000));
        assert_eq!(settings.transport.reconnect_max_delay, Duration::from_secs(60));
        assert_eq!(settings.transport.max_reconnect_attempts, 5);
        assert_eq!(settings.seen_capacity, 4096);
    }

    #[test]
    fn test_push_mode_and_overrides() {
        let file = write_config(r#"{
            "owner_ids": [1, 2],
            "telegram_bot_token": "123456789:ABCdef",
            "notify_chat_id": -100200300,
            "feed_mode": "push",
            "ws_url": "wss://example.invalid",
            "max_reconnect_attempts": 2,
            "backfill_on_reconnect": false,
            "address_pattern": "^\\w+$",
            "data_dir": "/tmp/walletwatch"
        }"#);
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.feed_mode, FeedMode::Push);
        assert_eq!(config.notify_chat_id, ChatId(-100200300));
        assert_eq!(config.ws_url, "wss://example.invalid");
        assert!(config.address_pattern.is_match("A"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/walletwatch/walletwatch.db"));

        let settings = config.watcher_settings();
        assert_eq!(settings.transport.max_reconnect_attempts, 2);
        assert!(!settings.backfill_on_reconnect);
    }

    #[test]
    fn test_empty_owner_ids() {
        let file = write_config(r#"{
            "owner_ids": [],
            "telegram_bot_token": "123456789:ABCdef"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("owner_ids"));
    }

    #[test]
    fn test_invalid_token_format() {
        for token in ["", "invalid_token_no_colon", "notanumber:ABCdef", "123456789:"] {
            let file = write_config(&format!(
                r#"{{"owner_ids": [123], "telegram_bot_token": "{token}"}}"#
            ));
            let err = assert_err(Config::load(file.path()));
            assert!(matches!(err, ConfigError::Validation(_)), "token {token:?}");
        }
    }

    #[test]
    fn test_unknown_feed_mode() {
        let file = write_config(r#"{
            "owner_ids": [123],
            "telegram_bot_token": "123456789:ABCdef",
            "feed_mode": "carrier-pigeon"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("feed_mode"));
    }

    #[test]
    fn test_fetch_limit_bounds() {
        let file = write_config(r#"{
            "owner_ids": [123],
            "telegram_bot_token": "123456789:ABCdef",
            "fetch_limit": 0
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(err.to_string().contains("fetch_limit"));
    }

    #[test]
    fn test_zero_reconnect_attempts() {
        let file = write_config(r#"{
            "owner_ids": [123],
            "telegram_bot_token": "123456789:ABCdef",
            "max_reconnect_attempts": 0
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_invalid_regex_pattern() {
        let file = write_config(r#"{
            "owner_ids": [123],
            "telegram_bot_token": "123456789:ABCdef",
            "address_pattern": "[invalid(regex"
        }"#);
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::InvalidRegex { .. }));
    }

    #[test]
    fn test_file_not_found() {
        let err = assert_err(Config::load("/nonexistent/path/config.json"));
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let file = write_config("{ invalid json }");
        let err = assert_err(Config::load(file.path()));
        assert!(matches!(err, ConfigError::ParseJson { .. }));
    }
}
