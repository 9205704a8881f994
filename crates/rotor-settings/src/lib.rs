//! Layered TOML configuration for rotor.
//!
//! Provides structured configuration types for the proxy and the backend
//! pool, loading from:
//! - Global config: `~/.config/rotor/rotor.toml`
//! - Project config: `<workspace>/.rotor/rotor.toml`
//!
//! Project values take precedence for every field that is explicitly set.
//!
//! # Example
//!
//! ```no_run
//! use rotor_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new(".")).unwrap();
//! println!("{:?}", config.pool.size);
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default proxy listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
/// Default number of backend circuits.
pub const DEFAULT_POOL_SIZE: usize = 5;
/// Default SOCKS port of the first circuit.
pub const DEFAULT_BASE_SOCKS_PORT: u16 = 9050;
/// Default control port of the first circuit.
pub const DEFAULT_BASE_CONTROL_PORT: u16 = 9051;
/// Default reserved path for the rotation endpoint.
pub const DEFAULT_CONTROL_PATH: &str = "/rotate";

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TOML `[proxy]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Listen address for client applications (e.g. `"127.0.0.1:8080"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<SocketAddr>,

    /// Client socket idle timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Reserved request path that triggers a rotation instead of being proxied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_path: Option<String>,
}

/// TOML `[pool]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Number of backend circuits to launch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,

    /// SOCKS port of the first circuit; circuit `i` uses `base + 2*i`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_socks_port: Option<u16>,

    /// Control port of the first circuit; circuit `i` uses `base + 2*i`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_control_port: Option<u16>,

    /// Backend executable. A bare name is looked up on `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_path: Option<String>,

    /// Root of the per-circuit working directories. `~/` is expanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// How long a looked-up identity stays fresh, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_cache_ttl_secs: Option<u64>,

    /// Upper bound on circuits starting at the same time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_starts: Option<usize>,

    /// Rotate automatically every N seconds (0 disables).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rotate_secs: Option<u64>,

    /// Address-echo endpoint returning `{"ip": "..."}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_url: Option<String>,

    /// Geolocation endpoint returning `{"countryCode": "..."}`; `{ip}` is substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_url: Option<String>,

    /// Kill leftover backend processes before starting and after stopping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_strays: Option<bool>,
}

/// Top-level rotor configuration, corresponding to `rotor.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotorConfig {
    /// Proxy listener configuration.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Backend pool configuration.
    #[serde(default)]
    pub pool: PoolSettings,
}

impl RotorConfig {
    /// A config with every field set to its built-in default.
    ///
    /// Used by `rotor config init` so the written file documents every knob.
    pub fn starter() -> Self {
        Self {
            proxy: ProxySettings {
                bind_addr: DEFAULT_BIND_ADDR.parse().ok(),
                idle_timeout_secs: Some(30),
                control_path: Some(DEFAULT_CONTROL_PATH.to_string()),
            },
            pool: PoolSettings {
                size: Some(DEFAULT_POOL_SIZE),
                base_socks_port: Some(DEFAULT_BASE_SOCKS_PORT),
                base_control_port: Some(DEFAULT_BASE_CONTROL_PORT),
                backend_path: Some("tor".to_string()),
                data_dir: None,
                identity_cache_ttl_secs: Some(60),
                max_parallel_starts: Some(15),
                auto_rotate_secs: Some(0),
                identity_url: None,
                geo_url: None,
                kill_strays: Some(true),
            },
        }
    }

    /// Parse a `RotorConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains values of the wrong type for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load a `RotorConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// Every field is a scalar: `other` wins when explicitly set (`Some`).
    #[must_use]
    pub fn merge(mut self, other: RotorConfig) -> RotorConfig {
        let p = other.proxy;
        override_if_set(&mut self.proxy.bind_addr, p.bind_addr);
        override_if_set(&mut self.proxy.idle_timeout_secs, p.idle_timeout_secs);
        override_if_set(&mut self.proxy.control_path, p.control_path);

        let q = other.pool;
        override_if_set(&mut self.pool.size, q.size);
        override_if_set(&mut self.pool.base_socks_port, q.base_socks_port);
        override_if_set(&mut self.pool.base_control_port, q.base_control_port);
        override_if_set(&mut self.pool.backend_path, q.backend_path);
        override_if_set(&mut self.pool.data_dir, q.data_dir);
        override_if_set(&mut self.pool.identity_cache_ttl_secs, q.identity_cache_ttl_secs);
        override_if_set(&mut self.pool.max_parallel_starts, q.max_parallel_starts);
        override_if_set(&mut self.pool.auto_rotate_secs, q.auto_rotate_secs);
        override_if_set(&mut self.pool.identity_url, q.identity_url);
        override_if_set(&mut self.pool.geo_url, q.geo_url);
        override_if_set(&mut self.pool.kill_strays, q.kill_strays);
        self
    }
}

fn override_if_set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Expand a leading `~/` (or a bare `~`) to the user's home directory.
///
/// Paths without the prefix, or when no home directory is known, are
/// returned unchanged.
pub fn expand_home(s: &str) -> PathBuf {
    let home = dirs::home_dir();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(h) = home {
            return h.join(rest);
        }
    } else if s == "~" {
        if let Some(h) = home {
            return h;
        }
    }
    PathBuf::from(s)
}
