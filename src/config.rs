//! Configuration
//!
//! Two layers of YAML configuration:
//! - the dock config, naming each backend and the drivers that serve it
//! - one driver config per backend, carrying the common `pool` block plus a
//!   backend-specific block parsed by the driver itself

use crate::domain::model::{PoolExtras, StorageType};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Loading
// =============================================================================

/// Read and parse a YAML file into `T`
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Loading config file {}", path.display());

    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&raw).map_err(|e| {
        Error::Configuration(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Resolve a driver config path, falling back to the driver default
pub fn resolve_path(configured: Option<&Path>, default: &str) -> PathBuf {
    match configured {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from(default),
    }
}

// =============================================================================
// Pool Properties
// =============================================================================

/// Per-pool block of a driver config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolProperties {
    pub storage_type: StorageType,
    #[serde(default)]
    pub availability_zone: String,
    #[serde(default)]
    pub multi_attach: bool,
    #[serde(default)]
    pub extras: PoolExtras,
}

/// The `pool:` map shared by every driver config
pub type PoolTable = BTreeMap<String, PoolProperties>;

// =============================================================================
// Dock Configuration
// =============================================================================

/// One configured backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackendProperties {
    pub storage_type: StorageType,
    pub driver_name: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub replication_driver_name: Option<String>,
    #[serde(default)]
    pub metrics_driver_name: Option<String>,
}

impl BackendProperties {
    /// Properties of the built-in sample backend
    pub fn sample() -> Self {
        Self {
            storage_type: StorageType::Block,
            driver_name: "sample".to_string(),
            config_path: None,
            replication_driver_name: Some("sample".to_string()),
            metrics_driver_name: Some("sample".to_string()),
        }
    }
}

/// Top-level dock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DockConfig {
    /// Deadline applied to each external command and vendor request
    pub operation_timeout_secs: u64,
    /// Interval between driver setup attempts
    pub setup_retry_interval_secs: u64,
    /// Stop retrying driver setup after this long
    pub setup_max_wait_secs: u64,
    /// Backends by name
    pub backends: BTreeMap<String, BackendProperties>,
}

impl Default for DockConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert("sample".to_string(), BackendProperties::sample());

        Self {
            operation_timeout_secs: 30,
            setup_retry_interval_secs: 10,
            setup_max_wait_secs: 600,
            backends,
        }
    }
}

impl DockConfig {
    /// Load the dock config, booting with the sample backend when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "Dock config {} not found, starting with the sample backend",
                path.display()
            );
            return Ok(Self::default());
        }

        let config: DockConfig = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_secs == 0 {
            return Err(Error::Configuration(
                "operation_timeout_secs must be positive".into(),
            ));
        }
        for (name, props) in &self.backends {
            if props.driver_name.is_empty() {
                return Err(Error::Configuration(format!(
                    "backend {} has no driver_name",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn setup_retry_interval(&self) -> Duration {
        Duration::from_secs(self.setup_retry_interval_secs)
    }

    pub fn setup_max_wait(&self) -> Duration {
        Duration::from_secs(self.setup_max_wait_secs)
    }
}
