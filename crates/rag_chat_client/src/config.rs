//! Client config load/save for `~/.rag-chat/config.yaml`.
//! Two sections: `server.*` (where the backend lives) and `chat.*` (client behaviour).

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const DEFAULT_CONNECT_WAIT_MS: u64 = 1000;

/// Server section (host, port, ws_path).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_path: Option<String>,
}

/// Chat section (greeting, connect_wait_ms).
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChatSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub chat: ChatSection,
}

impl Config {
    /// Backend address with defaults filled in.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self
                .server
                .host
                .clone()
                .unwrap_or_else(|| DEFAULT_HOST.into()),
            port: self.server.port.unwrap_or(DEFAULT_PORT),
            ws_path: self
                .server
                .ws_path
                .clone()
                .unwrap_or_else(|| DEFAULT_WS_PATH.into()),
        }
    }

    pub fn connect_wait_ms(&self) -> u64 {
        self.chat.connect_wait_ms.unwrap_or(DEFAULT_CONNECT_WAIT_MS)
    }
}

/// Fixed backend address. Both transports are derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Config::default().endpoint()
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ws_path: DEFAULT_WS_PATH.into(),
        }
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let path = self.ws_path.trim_start_matches('/');
        format!("ws://{}:{}/{}", self.host, self.port, path)
    }

    pub fn query_url(&self) -> String {
        format!("{}/query", self.http_base())
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.http_base())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.http_base())
    }
}

/// Returns the default config file path: `~/.rag-chat/config.yaml` (platform-specific).
pub fn default_config_path() -> Option<PathBuf> {
    let home = home_dir()?;
    Some(home.join(".rag-chat").join("config.yaml"))
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Load from the default location, falling back to defaults when no file exists there.
pub fn load_default() -> Result<Config, ConfigError> {
    let path = default_config_path().ok_or(ConfigError::NoHomeDir)?;
    if !path.exists() {
        return Ok(Config::default());
    }
    load(&path)
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let io_err = |e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    std::fs::write(path, contents).map_err(io_err)
}

/// Config load/save error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unable to determine home directory (set --config or RAG_CHAT_CONFIG)")]
    NoHomeDir,
}
