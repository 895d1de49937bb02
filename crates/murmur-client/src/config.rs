//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the engine runs with zero configuration
//! against a local server.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use murmur_net::TransportConfig;
use murmur_shared::constants::{
    DEFAULT_HISTORY_DEBOUNCE_MS, DEFAULT_PAGE_SIZE, DEFAULT_PREFETCH_THRESHOLD,
    DEFAULT_REQUEST_TIMEOUT_SECS, MAX_FILE_SIZE,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket endpoint.
    /// Env: `MURMUR_SERVER_URL`
    /// Default: `ws://127.0.0.1:8080/ws`
    pub server_url: String,

    /// Id of the signed-in user, used as the author of outgoing messages.
    /// Env: `MURMUR_USER_ID`
    pub user_id: i64,

    /// Messages per history page.
    /// Env: `MURMUR_PAGE_SIZE`
    pub page_size: u32,

    /// Minimum time after the initial load before "load more" may fire.
    /// Env: `MURMUR_HISTORY_DEBOUNCE_MS`
    pub history_debounce: Duration,

    /// "Load more" fires when the first visible index is at most this.
    /// Env: `MURMUR_PREFETCH_THRESHOLD`
    pub prefetch_threshold: usize,

    /// Env: `MURMUR_REQUEST_TIMEOUT_SECS`
    pub request_timeout: Duration,

    /// Uploads larger than this are rejected (50 MiB).
    /// Env: `MURMUR_MAX_FILE_SIZE`
    pub max_file_size: u64,

    /// SQLite file for decrypted downloads. `None` uses the platform cache
    /// directory.
    /// Env: `MURMUR_CACHE_PATH`
    pub cache_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            user_id: 0,
            page_size: DEFAULT_PAGE_SIZE,
            history_debounce: Duration::from_millis(DEFAULT_HISTORY_DEBOUNCE_MS),
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_file_size: MAX_FILE_SIZE,
            cache_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("MURMUR_SERVER_URL") {
            config.server_url = url;
        }
        if let Some(id) = parse_var(&lookup, "MURMUR_USER_ID") {
            config.user_id = id;
        }
        if let Some(size) = parse_var::<u32>(&lookup, "MURMUR_PAGE_SIZE") {
            if size > 0 {
                config.page_size = size;
            } else {
                tracing::warn!("MURMUR_PAGE_SIZE must be positive, using default");
            }
        }
        if let Some(ms) = parse_var(&lookup, "MURMUR_HISTORY_DEBOUNCE_MS") {
            config.history_debounce = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "MURMUR_PREFETCH_THRESHOLD") {
            config.prefetch_threshold = n;
        }
        if let Some(secs) = parse_var(&lookup, "MURMUR_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var(&lookup, "MURMUR_MAX_FILE_SIZE") {
            config.max_file_size = max;
        }
        if let Some(path) = lookup("MURMUR_CACHE_PATH") {
            config.cache_path = Some(PathBuf::from(path));
        }

        config
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: self.request_timeout,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(value = %raw, "Invalid {key}, using default");
            None
        }
    }
}
