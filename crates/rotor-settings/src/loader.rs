//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/rotor/rotor.toml`
//! 2. Project: `<workspace>/.rotor/rotor.toml`
//!
//! Project values take precedence for every field they set.

use crate::{RotorConfig, SettingsError};
use std::path::{Path, PathBuf};

/// Loads and merges `RotorConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Reads the global config, then the project config, and merges them.
    /// Missing files are silently skipped. Parse errors emit a warning and
    /// the file is treated as if absent.
    ///
    /// # Errors
    /// `SettingsError::Io` if a config file exists but cannot be read.
    pub fn load(workspace: &Path) -> Result<RotorConfig, SettingsError> {
        let global = match Self::global_config_path() {
            Some(path) => Self::load_optional(&path)?,
            None => RotorConfig::default(),
        };
        let project = Self::load_optional(&Self::project_config_path(workspace))?;
        Ok(global.merge(project))
    }

    /// Absolute path to the global config file, if a config directory exists.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("rotor").join("rotor.toml"))
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".rotor").join("rotor.toml")
    }

    fn load_optional(path: &Path) -> Result<RotorConfig, SettingsError> {
        if !path.exists() {
            return Ok(RotorConfig::default());
        }
        match RotorConfig::load(path) {
            Ok(config) => Ok(config),
            Err(SettingsError::ParseError(err)) => {
                // A malformed config shouldn't block startup.
                tracing::warn!(path = %path.display(), error = %err, "ignoring malformed config");
                Ok(RotorConfig::default())
            }
            Err(err) => Err(err),
        }
    }
}
