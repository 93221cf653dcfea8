//! Control Plane Configuration
//!
//! Loads the daemon configuration file: system name, privileged helper
//! settings and the per-engine server list.

pub mod server;

pub use server::*;

use crate::error::Result;
use crate::pbin::{HelperDescriptor, DEFAULT_FORWARD_TIMEOUT, HELPER_NAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Privileged helper settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Helper executable name, looked up on PATH
    #[serde(default = "default_helper_name")]
    pub name: String,

    /// Explicit helper path, bypassing the PATH lookup
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_helper_name() -> String {
    HELPER_NAME.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_FORWARD_TIMEOUT.as_secs()
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            name: default_helper_name(),
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HelperConfig {
    pub fn descriptor(&self) -> HelperDescriptor {
        let descriptor = HelperDescriptor::named(&self.name);
        match &self.path {
            Some(path) => descriptor.with_program(path.clone()),
            None => descriptor,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// System (group) name passed to every engine
    #[serde(default = "default_system_name")]
    pub name: String,

    #[serde(default)]
    pub helper: HelperConfig,

    /// Prometheus endpoint bind address
    #[serde(default)]
    pub metrics_addr: Option<String>,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

fn default_system_name() -> String {
    "storctl".to_string()
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: default_system_name(),
            helper: HelperConfig::default(),
            metrics_addr: None,
            servers: Vec::new(),
        }
    }
}

impl Configuration {
    /// Parse a YAML document and validate the server list
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Configuration = serde_yaml::from_str(yaml)?;
        validate_servers(&config.servers)?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&yaml)?;
        info!(
            "Loaded configuration from {} ({} servers)",
            path.display(),
            config.servers.len()
        );
        Ok(config)
    }
}
