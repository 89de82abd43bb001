use crate::auth::Credentials;
use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HALF_CLOSE_GRACE_SECS: u64 = 5;
pub const DEFAULT_HEADER_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
    /// Log file written next to stdout. Truncated when the logger starts.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn merge(self, higher: LoggingConfig) -> LoggingConfig {
        LoggingConfig {
            level: higher.level.or(self.level),
            format: higher.format.or(self.format),
            file: higher.file.or(self.file),
        }
    }
}

/// Raw, unvalidated settings as they come from a config file, the
/// environment or the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, deserialize_with = "string_or_number")]
    pub proxy_port: Option<String>,
    #[serde(default)]
    pub proxy_target: Option<String>,
    #[serde(default)]
    pub proxy_user: Option<String>,
    #[serde(default)]
    pub proxy_password: Option<String>,
    #[serde(default)]
    pub listen_host: Option<String>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub upstream_timeout_secs: Option<u64>,
    #[serde(default)]
    pub half_close_grace_secs: Option<u64>,
    #[serde(default)]
    pub header_read_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_header_size: Option<usize>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| file_error(e.to_string()))
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let content = serde_json::to_string_pretty(self).map_err(|e| file_error(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| file_error(e.to_string()))
    }

    pub fn sample() -> Self {
        Self {
            proxy_port: Some("8080".to_string()),
            proxy_target: Some("http://backend.example.com:3000".to_string()),
            proxy_user: Some("alice".to_string()),
            proxy_password: Some("change-me".to_string()),
            listen_host: Some(DEFAULT_LISTEN_HOST.to_string()),
            connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
            upstream_timeout_secs: Some(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            half_close_grace_secs: Some(DEFAULT_HALF_CLOSE_GRACE_SECS),
            header_read_timeout_secs: Some(DEFAULT_HEADER_READ_TIMEOUT_SECS),
            max_header_size: Some(DEFAULT_MAX_HEADER_SIZE),
            logging: Some(LoggingConfig {
                level: Some(LogLevel::Info),
                format: Some(LogFormat::Text),
                file: Some(PathBuf::from("output.log")),
            }),
        }
    }

    /// Layers `higher` on top of `self`; any value set in `higher` wins.
    pub fn merge(self, higher: Settings) -> Settings {
        let logging = match (self.logging, higher.logging) {
            (Some(low), Some(high)) => Some(low.merge(high)),
            (low, high) => high.or(low),
        };
        Settings {
            proxy_port: higher.proxy_port.or(self.proxy_port),
            proxy_target: higher.proxy_target.or(self.proxy_target),
            proxy_user: higher.proxy_user.or(self.proxy_user),
            proxy_password: higher.proxy_password.or(self.proxy_password),
            listen_host: higher.listen_host.or(self.listen_host),
            connect_timeout_secs: higher.connect_timeout_secs.or(self.connect_timeout_secs),
            upstream_timeout_secs: higher.upstream_timeout_secs.or(self.upstream_timeout_secs),
            half_close_grace_secs: higher.half_close_grace_secs.or(self.half_close_grace_secs),
            header_read_timeout_secs: higher
                .header_read_timeout_secs
                .or(self.header_read_timeout_secs),
            max_header_size: higher.max_header_size.or(self.max_header_size),
            logging,
        }
    }
}

/// Validated proxy configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub target_url: Url,
    pub credential: Option<Credentials>,
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,
    pub half_close_grace: Duration,
    /// Limit on how long a client may take to send a complete request head.
    pub header_read_timeout: Duration,
    pub max_header_size: usize,
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    pub fn new(listen_port: u16, target_url: Url) -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_port,
            target_url,
            credential: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            half_close_grace: Duration::from_secs(DEFAULT_HALF_CLOSE_GRACE_SECS),
            header_read_timeout: Duration::from_secs(DEFAULT_HEADER_READ_TIMEOUT_SECS),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_credential(mut self, credential: Credentials) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_half_close_grace(mut self, grace: Duration) -> Self {
        self.half_close_grace = grace;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.credential.is_some()
    }

    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let port = non_empty(settings.proxy_port);
        let target = non_empty(settings.proxy_target);

        let mut missing = Vec::new();
        if port.is_none() {
            missing.push("proxyPort");
        }
        if target.is_none() {
            missing.push("proxyTarget");
        }
        let (Some(port), Some(target)) = (port, target) else {
            return Err(ConfigError::MissingValues(missing));
        };

        let listen_port = parse_port(&port)?;
        let target_url = parse_target(&target)?;

        let credential = match (non_empty(settings.proxy_user), non_empty(settings.proxy_password)) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)?),
            (Some(_), None) => return Err(ConfigError::PasswordMissing),
            (None, Some(_)) => {
                log::warn!("proxyPassword is set without proxyUser; authentication stays disabled");
                None
            }
            (None, None) => None,
        };

        let max_header_size = settings.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE);
        if max_header_size < 1024 {
            return Err(ConfigError::InvalidValue {
                key: "max_header_size",
                reason: format!("{} bytes is too small, use at least 1024", max_header_size),
            });
        }

        let connect_timeout_secs = positive_secs(
            "connect_timeout_secs",
            settings.connect_timeout_secs,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?;
        let upstream_timeout_secs = positive_secs(
            "upstream_timeout_secs",
            settings.upstream_timeout_secs,
            DEFAULT_UPSTREAM_TIMEOUT_SECS,
        )?;
        let half_close_grace_secs = positive_secs(
            "half_close_grace_secs",
            settings.half_close_grace_secs,
            DEFAULT_HALF_CLOSE_GRACE_SECS,
        )?;
        let header_read_timeout_secs = positive_secs(
            "header_read_timeout_secs",
            settings.header_read_timeout_secs,
            DEFAULT_HEADER_READ_TIMEOUT_SECS,
        )?;

        Ok(Self {
            listen_host: non_empty(settings.listen_host)
                .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
            listen_port,
            target_url,
            credential,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            upstream_timeout: Duration::from_secs(upstream_timeout_secs),
            half_close_grace: Duration::from_secs(half_close_grace_secs),
            header_read_timeout: Duration::from_secs(header_read_timeout_secs),
            max_header_size,
            logging: settings.logging.unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn positive_secs(key: &'static str, value: Option<u64>, default: u64) -> Result<u64, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::InvalidValue {
            key,
            reason: "must be at least 1 second".to_string(),
        }),
        secs => Ok(secs),
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}

fn parse_target(value: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTarget {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(value.trim()).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(url)
}
