use crate::exec::ExecConfig;
use crate::socket::{ReconnectPolicy, SocketConfig};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:3000";
pub const DEFAULT_CONTROL_URL: &str = "ws://127.0.0.1:8080/fs/{lab_id}";
pub const DEFAULT_EXEC_URL: &str = "ws://127.0.0.1:8082/pty/{lab_id}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{var} has invalid value {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid channel url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Arena client configuration.
///
/// Built from defaults, then an optional TOML file, then `ARENA_*`
/// environment variables. CLI flags are applied last by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
    /// Base URL of the provisioning API.
    pub api_base: String,
    /// Control channel template; `{lab_id}` and `{language}` are expanded.
    pub control_url: String,
    /// Execution channel template.
    pub exec_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub test_timeout_ms: u64,
    pub meta_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_attempts: u32,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            control_url: DEFAULT_CONTROL_URL.to_string(),
            exec_url: DEFAULT_EXEC_URL.to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 8_000,
            test_timeout_ms: 60_000,
            meta_timeout_ms: 8_000,
            heartbeat_interval_ms: 25_000,
            reconnect_base_ms: 300,
            reconnect_max_ms: 10_000,
            reconnect_attempts: 10,
        }
    }
}

impl LabConfig {
    /// Load configuration from environment variables on top of defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(base) = env_string("ARENA_API_BASE") {
            self.api_base = base;
        }
        if let Some(url) = env_string("ARENA_CONTROL_URL") {
            self.control_url = url;
        }
        if let Some(url) = env_string("ARENA_EXEC_URL") {
            self.exec_url = url;
        }
        env_number("ARENA_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        env_number("ARENA_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        env_number("ARENA_TEST_TIMEOUT_MS", &mut self.test_timeout_ms)?;
        env_number("ARENA_META_TIMEOUT_MS", &mut self.meta_timeout_ms)?;
        env_number("ARENA_HEARTBEAT_MS", &mut self.heartbeat_interval_ms)?;
        env_number("ARENA_RECONNECT_BASE_MS", &mut self.reconnect_base_ms)?;
        env_number("ARENA_RECONNECT_MAX_MS", &mut self.reconnect_max_ms)?;
        env_number("ARENA_RECONNECT_ATTEMPTS", &mut self.reconnect_attempts)?;
        Ok(())
    }

    pub fn channel_urls(&self) -> ChannelUrls {
        ChannelUrls::new(&self.control_url, &self.exec_url)
    }

    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.reconnect_base_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.reconnect_attempts,
            },
        }
    }

    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            test_timeout: Duration::from_millis(self.test_timeout_ms),
        }
    }

    pub fn meta_timeout(&self) -> Duration {
        Duration::from_millis(self.meta_timeout_ms)
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_number<T: std::str::FromStr>(var: &'static str, slot: &mut T) -> Result<(), ConfigError> {
    if let Some(raw) = env_string(var) {
        *slot = raw
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw })?;
    }
    Ok(())
}

/// Pure builders for the two per-lab channel URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUrls {
    control: String,
    execution: String,
}

impl ChannelUrls {
    pub fn new(control: impl Into<String>, execution: impl Into<String>) -> Self {
        Self {
            control: control.into(),
            execution: execution.into(),
        }
    }

    pub fn control_url(&self, lab_id: &str, language: &str) -> Result<String, ConfigError> {
        expand(&self.control, lab_id, language)
    }

    pub fn execution_url(&self, lab_id: &str, language: &str) -> Result<String, ConfigError> {
        expand(&self.execution, lab_id, language)
    }
}

fn expand(template: &str, lab_id: &str, language: &str) -> Result<String, ConfigError> {
    let expanded = template
        .replace("{lab_id}", lab_id)
        .replace("{language}", language);
    let parsed = Url::parse(&expanded).map_err(|err| ConfigError::InvalidUrl {
        url: expanded.clone(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed.to_string()),
        other => Err(ConfigError::InvalidUrl {
            url: expanded.clone(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "ARENA_API_BASE",
        "ARENA_CONTROL_URL",
        "ARENA_EXEC_URL",
        "ARENA_REQUEST_TIMEOUT_MS",
        "ARENA_RECONNECT_ATTEMPTS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = LabConfig::default();
        let socket = config.socket_config();
        assert_eq!(socket.connect_timeout, Duration::from_secs(10));
        assert_eq!(socket.request_timeout, Duration::from_secs(8));
        assert_eq!(config.exec_config().test_timeout, Duration::from_secs(60));
        assert_eq!(config.meta_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn env_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("ARENA_API_BASE", "https://labs.example.com");
            env::set_var("ARENA_REQUEST_TIMEOUT_MS", "1500");
        }
        let config = LabConfig::from_env().unwrap();
        assert_eq!(config.api_base, "https://labs.example.com");
        assert_eq!(config.request_timeout_ms, 1500);
        assert_eq!(config.exec_url, DEFAULT_EXEC_URL);
        clear_env();
    }

    #[test]
    fn invalid_env_number_is_reported() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("ARENA_RECONNECT_ATTEMPTS", "many");
        }
        let err = LabConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "ARENA_RECONNECT_ATTEMPTS", .. }));
        clear_env();
    }

    #[test]
    fn toml_file_fills_unset_fields_with_defaults() {
        let config = LabConfig::from_toml_str(
            "api_base = \"http://10.0.0.5:3000\"\nmeta_timeout_ms = 2000\n",
        )
        .unwrap();
        assert_eq!(config.api_base, "http://10.0.0.5:3000");
        assert_eq!(config.meta_timeout_ms, 2000);
        assert_eq!(config.heartbeat_interval_ms, 25_000);
        assert!(LabConfig::from_toml_str("unknown_key = 1").is_err());
    }

    #[test]
    fn channel_urls_expand_placeholders() {
        let urls = ChannelUrls::new(
            "wss://labs.example.com/fs/{lab_id}?lang={language}",
            "wss://labs.example.com/pty/{lab_id}",
        );
        assert_eq!(
            urls.control_url("lab-42", "react").unwrap(),
            "wss://labs.example.com/fs/lab-42?lang=react"
        );
        assert_eq!(
            urls.execution_url("lab-42", "react").unwrap(),
            "wss://labs.example.com/pty/lab-42"
        );
    }

    #[test]
    fn channel_urls_reject_http_schemes() {
        let urls = ChannelUrls::new("http://labs.example.com/{lab_id}", DEFAULT_EXEC_URL);
        assert!(matches!(
            urls.control_url("x", "js"),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }
}
