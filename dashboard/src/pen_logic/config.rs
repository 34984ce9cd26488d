use anyhow::{Context, Result, bail};
use clap::Parser;
use lib_common::ingestors::ReconnectPolicy;
use lib_common::retrieve::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "pen_dashboard.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Pen dashboard live data client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PEN_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PEN_API_BASE_URL", help = "Base URL of the pen REST API.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "PEN_WS_BASE_URL", help = "Base URL of the pen WebSocket channels.")]
    pub ws_base_url: Option<String>,

    #[clap(long, env = "PEN_ACCESS_TOKEN", help = "Bearer token. Takes precedence over username/password.")]
    pub access_token: Option<String>,

    #[clap(long, env = "PEN_USERNAME", help = "Username used to sign in when no token is given.")]
    pub username: Option<String>,

    #[clap(long, env = "PEN_PASSWORD", help = "Password used to sign in when no token is given.")]
    pub password: Option<String>,

    #[clap(long, env = "PEN_ID", help = "Pen to follow (pen_detail only).")]
    pub pen_id: Option<String>,

    #[clap(long, env = "PEN_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PEN_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PEN_REQUEST_TIMEOUT_MS", help = "Timeout in milliseconds for each HTTP attempt.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "PEN_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for stream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "PEN_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for stream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            api_base_url: other.api_base_url.or(self.api_base_url),
            ws_base_url: other.ws_base_url.or(self.ws_base_url),
            access_token: other.access_token.or(self.access_token),
            username: other.username.or(self.username),
            password: other.password.or(self.password),
            pen_id: other.pen_id.or(self.pen_id),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
        }
    }

    fn defaults() -> Config {
        Config {
            api_base_url: Some("http://localhost:8000".to_string()),
            ws_base_url: Some("ws://localhost:8000".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            request_timeout_ms: Some(10_000),
            reconnect_base_delay_ms: Some(1_000),
            reconnect_max_delay_ms: Some(30_000),
            ..Default::default()
        }
    }
}

/// Reads a JSON config file. Missing or unreadable files yield `None`.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            path.display()
        );
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and the command line (which includes
/// environment variables), later layers winning.
pub fn layer_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

/// Loads `.env`, parses the command line and layers the result.
pub fn load_config() -> Config {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    layer_config(Config::parse())
}

/// Fully resolved settings.
#[derive(Clone)]
pub struct Settings {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub access_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pen_id: Option<String>,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_base_url", &self.api_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("pen_id", &self.pen_id)
            .field("log_dir", &self.log_dir)
            .field("log_level", &self.log_level)
            .field("retry", &self.retry)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn positive_millis(name: &str, value: Option<u64>, default: u64) -> Result<Duration> {
    match value.unwrap_or(default) {
        0 => bail!("{} must be at least 1 ms", name),
        ms => Ok(Duration::from_millis(ms)),
    }
}

impl Settings {
    pub fn resolve(config: Config) -> Result<Settings> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let api_base_url = config.api_base_url.unwrap_or_default();
        Url::parse(&api_base_url).with_context(|| format!("invalid API base URL '{}'", api_base_url))?;
        let ws_base_url = config.ws_base_url.unwrap_or_default();
        Url::parse(&ws_base_url).with_context(|| format!("invalid WebSocket base URL '{}'", ws_base_url))?;

        let retry = RetryPolicy {
            timeout: positive_millis("requestTimeoutMs", config.request_timeout_ms, 10_000)?,
            ..RetryPolicy::default()
        };
        let reconnect = ReconnectPolicy {
            base_delay: positive_millis("reconnectBaseDelayMs", config.reconnect_base_delay_ms, 1_000)?,
            max_delay: positive_millis("reconnectMaxDelayMs", config.reconnect_max_delay_ms, 30_000)?,
        };

        Ok(Settings {
            api_base_url,
            ws_base_url,
            access_token: non_empty(config.access_token),
            username: non_empty(config.username),
            password: config.password,
            pen_id: non_empty(config.pen_id),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            retry,
            reconnect,
        })
    }
}
