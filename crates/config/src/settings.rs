// Adapter settings
// Loaded from ~/.config/sasjs/config.toml, or an explicit path

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_APP_LOC: &str = "/Public/app";
pub const DEFAULT_CONTEXT_NAME: &str = "SAS Job Execution compute context";

/// Server flavor. Each exposes a different execution API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerType {
    #[default]
    #[serde(rename = "SASVIYA", alias = "sasviya")]
    SasViya,
    #[serde(rename = "SAS9", alias = "sas9")]
    Sas9,
    #[serde(rename = "SASJS", alias = "sasjs")]
    Sasjs,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Options the execution core recognises. Anything else in the file is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    // Server
    #[serde(alias = "serverUrl")]
    pub server_url: String,

    #[serde(alias = "serverType")]
    pub server_type: ServerType,

    /// Folder that relative job paths resolve under
    #[serde(alias = "appLoc")]
    pub app_loc: String,

    #[serde(alias = "contextName")]
    pub context_name: String,

    /// Viya only: Some(true) = compute API, Some(false) = job execution API,
    /// None = the web (/SASJobExecution) approach
    #[serde(alias = "useComputeApi", skip_serializing_if = "Option::is_none")]
    pub use_compute_api: Option<bool>,

    // Job paths
    #[serde(alias = "pathSASViya")]
    pub path_sas_viya: String,

    #[serde(alias = "pathSAS9")]
    pub path_sas9: String,

    #[serde(alias = "pathSASJS")]
    pub path_sasjs: String,

    // Diagnostics
    pub debug: bool,

    /// Log every request and response
    pub verbose: bool,

    #[serde(alias = "requestHistoryLimit")]
    pub request_history_limit: usize,

    // Polling
    #[serde(alias = "pollInterval")]
    pub poll_interval_ms: u64,

    #[serde(alias = "maxPollCount")]
    pub max_poll_count: u32,

    #[serde(alias = "maxErrorCount")]
    pub max_error_count: u32,

    // Transport
    /// Retries for 503/504 and failed connections, per call
    #[serde(alias = "serverErrorRetries")]
    pub server_error_retries: u32,

    /// Accept self-signed / untrusted certificates
    #[serde(alias = "allowInsecureRequests")]
    pub allow_insecure_requests: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            server_type: ServerType::SasViya,
            app_loc: DEFAULT_APP_LOC.to_string(),
            context_name: DEFAULT_CONTEXT_NAME.to_string(),
            use_compute_api: None,
            path_sas_viya: "/SASJobExecution".to_string(),
            path_sas9: "/SASStoredProcess/do".to_string(),
            path_sasjs: "/SASjsApi/stp/execute".to_string(),
            debug: false,
            verbose: false,
            request_history_limit: 20,
            poll_interval_ms: 300,
            max_poll_count: 1000,
            max_error_count: 5,
            server_error_retries: 5,
            allow_insecure_requests: false,
        }
    }
}

impl AdapterConfig {
    pub fn new(server_url: impl Into<String>, server_type: ServerType) -> Self {
        Self {
            server_url: server_url.into(),
            server_type,
            ..Self::default()
        }
    }

    /// Job execution path for the configured server flavor.
    pub fn jobs_path(&self) -> &str {
        match self.server_type {
            ServerType::SasViya => &self.path_sas_viya,
            ServerType::Sas9 => &self.path_sas9,
            ServerType::Sasjs => &self.path_sasjs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Server URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|c| c.join("sasjs").join("config.toml"))
    }

    /// Load from the default location. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoConfigDir)?;
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Write to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
