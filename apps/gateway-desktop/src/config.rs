//! Layered configuration: defaults, then the TOML file, then `GATEWAY_*`
//! environment variables, then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use openagents_gateway_client::{ConnectionConfig, SchemeFallback, normalize_gateway_url};
use openagents_gateway_client::proto::ClientInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "gateway-desktop.toml";
pub const DATABASE_FILE_NAME: &str = "mirror.db";
pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:18789";
pub const SECRET_SERVICE: &str = "openagents.gateway-desktop";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid gateway url `{0}`")]
    InvalidGatewayUrl(String),
    #[error("invalid {key}: {message}")]
    InvalidNumber { key: &'static str, message: String },
    #[error("invalid {key}: must be greater than zero")]
    ZeroTimeout { key: &'static str },
    #[error("invalid scheme fallback policy: {0}")]
    InvalidSchemeFallback(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DesktopConfig {
    pub gateway_url: String,
    /// Plain token from config or environment. The keyring is preferred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub scheme_fallback: String,
    /// Write the corrected URL back after a successful scheme fallback.
    pub accept_scheme_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            token: None,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            stream_timeout_ms: 60_000,
            scheme_fallback: "bidirectional".to_string(),
            accept_scheme_fallback: false,
            data_dir: None,
            log_level: None,
        }
    }
}

/// Values given on the command line; `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub gateway_url: Option<String>,
    pub token: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub scheme_fallback: Option<String>,
    pub accept_scheme_fallback: bool,
}

impl DesktopConfig {
    /// Load every layer. A missing file is not an error.
    pub fn load(
        explicit_path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
        overrides: &ConfigOverrides,
    ) -> Result<(Self, PathBuf), ConfigError> {
        let path = explicit_path.map_or_else(
            || default_data_dir().join(CONFIG_FILE_NAME),
            Path::to_path_buf,
        );
        let mut config = match fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text, &path)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound && explicit_path.is_none() => {
                Self::default()
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        config.apply_env(env)?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok((config, path))
    }

    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: error.to_string(),
        })
    }

    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = env("GATEWAY_URL") {
            self.gateway_url = url;
        }
        if let Some(token) = env("GATEWAY_TOKEN").filter(|token| !token.trim().is_empty()) {
            self.token = Some(token);
        }
        if let Some(value) = env("GATEWAY_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_millis("GATEWAY_REQUEST_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = env("GATEWAY_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_millis("GATEWAY_CONNECT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = env("GATEWAY_STREAM_TIMEOUT_MS") {
            self.stream_timeout_ms = parse_millis("GATEWAY_STREAM_TIMEOUT_MS", &value)?;
        }
        if let Some(policy) = env("GATEWAY_SCHEME_FALLBACK") {
            self.scheme_fallback = policy;
        }
        if let Some(dir) = env("GATEWAY_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(url) = &overrides.gateway_url {
            self.gateway_url.clone_from(url);
        }
        if let Some(token) = &overrides.token {
            self.token = Some(token.clone());
        }
        if let Some(dir) = &overrides.data_dir {
            self.data_dir = Some(dir.clone());
        }
        if let Some(policy) = &overrides.scheme_fallback {
            self.scheme_fallback.clone_from(policy);
        }
        if overrides.accept_scheme_fallback {
            self.accept_scheme_fallback = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        normalize_gateway_url(&self.gateway_url)
            .map_err(|_| ConfigError::InvalidGatewayUrl(self.gateway_url.clone()))?;
        self.scheme_fallback()?;
        for (key, value) in [
            ("request_timeout_ms", self.request_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("stream_timeout_ms", self.stream_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout { key });
            }
        }
        Ok(())
    }

    pub fn scheme_fallback(&self) -> Result<SchemeFallback, ConfigError> {
        self.scheme_fallback
            .parse()
            .map_err(ConfigError::InvalidSchemeFallback)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE_NAME)
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        Ok(ConnectionConfig {
            client: ClientInfo::desktop("openagents-gateway-desktop", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            stream_timeout: Duration::from_millis(self.stream_timeout_ms),
            scheme_fallback: self.scheme_fallback()?,
            ..ConnectionConfig::default()
        })
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|error| ConfigError::InvalidNumber {
            key,
            message: error.to_string(),
        })
}

#[must_use]
pub fn default_data_dir() -> PathBuf {
    if let Some(mut dir) = dirs::data_local_dir() {
        dir.push("openagents");
        dir.push("gateway-desktop");
        return dir;
    }
    if let Some(mut dir) = dirs::home_dir() {
        dir.push(".openagents");
        dir.push("gateway-desktop");
        return dir;
    }
    PathBuf::from(".openagents-gateway-desktop")
}

/// Replace `gateway_url` in the config file. Other lines, comments included,
/// are left as written.
pub fn persist_gateway_url(path: &Path, url: &str) -> Result<(), ConfigError> {
    let current = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parse_error = |error: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    };
    current.parse::<toml::Table>().map_err(parse_error)?;
    let text = with_gateway_url(&current, url);
    text.parse::<toml::Table>().map_err(parse_error)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, text).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Rewrite the top-level `gateway_url` line, or add one ahead of the first
/// table header.
fn with_gateway_url(text: &str, url: &str) -> String {
    let assignment = format!("gateway_url = {}", toml::Value::String(url.to_string()));
    let mut lines: Vec<&str> = text.lines().collect();
    let header = lines
        .iter()
        .position(|line| line.trim_start().starts_with('['))
        .unwrap_or(lines.len());
    let existing = lines[..header].iter().position(|line| {
        line.trim_start()
            .strip_prefix("gateway_url")
            .is_some_and(|rest| rest.trim_start().starts_with('='))
    });
    match existing {
        Some(index) => lines[index] = &assignment,
        None => lines.insert(header, &assignment),
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
