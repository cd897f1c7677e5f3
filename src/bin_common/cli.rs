//! CLI utilities for binaries
//!
//! Handles configuration loading and environment variables
//! for all binary executables.

use std::path::PathBuf;
use tracing::info;
use wsengine::{ClientConfig, Result};

/// Type of configuration to load
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// Client configuration (config/client.yaml)
    Client,
    /// Custom path
    Custom(String),
}

impl ConfigType {
    /// Get the default path for this config type
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Client => "config/client.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    /// Get the environment variable name for this config type
    pub fn env_var_name(&self) -> &str {
        match self {
            ConfigType::Client => "WSENGINE_CONFIG_PATH",
            ConfigType::Custom(_) => "WSENGINE_CONFIG_PATH",
        }
    }
}

/// Load configuration path from environment or use default
///
/// # Examples
/// ```
/// use wsengine_demo::bin_common::{load_config_from_env, ConfigType};
///
/// let path = load_config_from_env(ConfigType::Client);
/// ```
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    std::env::var(config_type.env_var_name())
        .unwrap_or_else(|_| config_type.default_path().to_string())
        .into()
}

/// Load the client configuration, falling back to defaults when the file is absent
///
/// Environment overrides apply either way.
pub fn load_client_config(config_type: ConfigType) -> Result<ClientConfig> {
    let path = load_config_from_env(config_type);
    if path.exists() {
        return ClientConfig::load(&path);
    }

    info!("No config at {}, using defaults", path.display());
    let mut config = ClientConfig::default();
    config.session.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}
