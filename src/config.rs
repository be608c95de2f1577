//! Harvester configuration.
//!
//! Loaded from a JSON file. [`HarvesterConfig::write_template`] writes a starter file to edit.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HarvestError, HarvestResult};
use crate::monitor::DEFAULT_IN_USE_DEFERRAL_FACTOR;
use crate::types::MonitoredPath;

/// Connection parameters for the shared state/row store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_port() -> u16 {
    5432
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            name: "harvester".to_string(),
            user: "harvester".to_string(),
            password: String::new(),
        }
    }
}

fn default_sleep_time_secs() -> u64 {
    10
}

fn default_commit_every_rows() -> u64 {
    10_000
}

fn default_in_use_deferral_factor() -> i32 {
    DEFAULT_IN_USE_DEFERRAL_FACTOR
}

/// Top-level configuration of one harvester process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvesterConfig {
    /// Identity of this machine; only monitored paths owned by it are polled.
    pub machine_id: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Pause between harvest cycles.
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,
    /// Samples per sink commit during an import.
    #[serde(default = "default_commit_every_rows")]
    pub commit_every_rows: u64,
    /// How long an open handle may postpone stability, in multiples of a path's threshold.
    #[serde(default = "default_in_use_deferral_factor")]
    pub in_use_deferral_factor: i32,
    #[serde(default)]
    pub monitored_paths: Vec<MonitoredPath>,
}

impl HarvesterConfig {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            database: DatabaseConfig::default(),
            sleep_time_secs: default_sleep_time_secs(),
            commit_every_rows: default_commit_every_rows(),
            in_use_deferral_factor: default_in_use_deferral_factor(),
            monitored_paths: Vec::new(),
        }
    }

    pub fn with_monitored_path(mut self, path: MonitoredPath) -> Self {
        self.monitored_paths.push(path);
        self
    }

    pub fn from_json_str(json: &str) -> HarvestResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> HarvestResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading harvester config");
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    /// Write an example configuration to `path`.
    pub fn write_template(path: impl AsRef<Path>) -> HarvestResult<()> {
        let template = Self::new("harvester-01").with_monitored_path(
            MonitoredPath::new(1, "harvester-01", "/data/cycler-output").with_stable_time_secs(60),
        );
        fs::write(path, serde_json::to_string_pretty(&template)?)?;
        Ok(())
    }

    pub fn validate(&self) -> HarvestResult<()> {
        let fail = |message: String| Err(HarvestError::Configuration { message });
        if self.machine_id.trim().is_empty() {
            return fail("machine_id must not be empty".to_string());
        }
        if self.commit_every_rows == 0 {
            return fail("commit_every_rows must be at least 1".to_string());
        }
        if self.in_use_deferral_factor < 0 {
            return fail("in_use_deferral_factor must not be negative".to_string());
        }
        let mut ids = BTreeSet::new();
        for p in &self.monitored_paths {
            if !ids.insert(p.id) {
                return fail(format!("duplicate monitored path id {}", p.id));
            }
            if p.stable_time_secs == 0 {
                return fail(format!("monitored path {} has a zero stability threshold", p.id));
            }
        }
        Ok(())
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    /// Monitored paths owned by this machine, in configuration order.
    pub fn own_paths(&self) -> impl Iterator<Item = &MonitoredPath> {
        self.monitored_paths
            .iter()
            .filter(|p| p.harvester == self.machine_id)
    }
}
