//! File configuration.
//!
//! The `snare` binary reads a JSON file with the sections below. Every field
//! has a default, so an empty object `{}` is a valid configuration.
//!
//! ```json
//! {
//!   "proxy": { "host": "127.0.0.1", "port": 9080,
//!              "ca_cert": "ca.crt", "ca_key": "ca.key" },
//!   "scope": { "exclude": [{ "prefix": "telemetry.example.com" }] },
//!   "intercept": { "request": true, "timeout_secs": 300, "on_timeout": "forward" },
//!   "janitor": { "period_secs": 300, "max_age_secs": 600 },
//!   "history": { "resolve_ip": true, "event_capacity": 1024 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::InterceptAction;
use crate::scope::{Scope, ScopeConfig, ScopeError};

/// Default proxy listen port.
pub const DEFAULT_PROXY_PORT: u16 = 9080;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`SnareConfig`].
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A scope rule is invalid.
    #[error(transparent)]
    Scope(#[from] ScopeError),

    /// A value is out of range.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Listener and CA settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    pub host: String,
    pub port: u16,
    /// PEM certificate of the CA used to sign per-host certificates.
    pub ca_cert: Option<PathBuf>,
    /// PEM private key of that CA.
    pub ca_key: Option<PathBuf>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PROXY_PORT,
            ca_cert: None,
            ca_key: None,
        }
    }
}

/// Interactive interception settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSection {
    /// Start with request interception enabled.
    pub request: bool,
    /// Start with response interception enabled.
    pub response: bool,
    /// How long to wait for a decision.
    pub timeout_secs: u64,
    /// What to do when no decision arrives in time.
    pub on_timeout: InterceptAction,
    /// How long a decision submission may wait for the slot.
    pub decision_send_timeout_secs: u64,
}

impl Default for InterceptSection {
    fn default() -> Self {
        Self {
            request: false,
            response: false,
            timeout_secs: 300,
            on_timeout: InterceptAction::Forward,
            decision_send_timeout_secs: 2,
        }
    }
}

/// Stale pending-transaction cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorSection {
    pub period_secs: u64,
    pub max_age_secs: u64,
}

impl Default for JanitorSection {
    fn default() -> Self {
        Self {
            period_secs: 300,
            max_age_secs: 600,
        }
    }
}

/// History recording settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Resolve host IPs for history rows.
    pub resolve_ip: bool,
    /// Capacity of the observer event channel.
    pub event_capacity: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            resolve_ip: true,
            event_capacity: 1024,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnareConfig {
    pub proxy: ProxySection,
    pub scope: ScopeConfig,
    pub intercept: InterceptSection,
    pub janitor: JanitorSection,
    pub history: HistorySection,
}

impl SnareConfig {
    /// Default config file location for this user.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "snare", "Snare").map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Loads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Checks value ranges and compiles the scope once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intercept.timeout_secs == 0 {
            return Err(ConfigError::Invalid("intercept.timeout_secs must be > 0".into()));
        }
        if self.janitor.period_secs == 0 {
            return Err(ConfigError::Invalid("janitor.period_secs must be > 0".into()));
        }
        if self.history.event_capacity == 0 {
            return Err(ConfigError::Invalid("history.event_capacity must be > 0".into()));
        }
        if self.proxy.ca_cert.is_some() != self.proxy.ca_key.is_some() {
            return Err(ConfigError::Invalid(
                "proxy.ca_cert and proxy.ca_key must be set together".into(),
            ));
        }
        Scope::compile(&self.scope)?;
        Ok(())
    }

    /// Returns the compiled scope.
    pub fn compiled_scope(&self) -> Result<Scope, ConfigError> {
        Ok(Scope::compile(&self.scope)?)
    }

    /// Returns `host:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}
