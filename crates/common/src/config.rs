// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two configuration documents (spec.md §6 "Config documents"),
//! grounded in the teacher's atomic JSON-file load/save idiom
//! (`credential/persist.rs`) but read-only here — FRAICAP never rewrites
//! its own config at runtime.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FraicapError, Result};
use crate::types::Device;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UseAgents {
    pub os1_lidar: bool,
    pub os1_imu: bool,
    pub gps: bool,
    pub camera: bool,
    pub imu: bool,
    pub atmega: bool,
    pub inet: bool,
    pub data_copy: bool,
}

impl UseAgents {
    pub fn get(&self, device: Device) -> bool {
        match device {
            Device::Os1Lidar => self.os1_lidar,
            Device::Os1Imu => self.os1_imu,
            Device::Gps => self.gps,
            Device::Camera => self.camera,
            Device::Imu => self.imu,
            Device::Atmega => self.atmega,
            Device::Inet => self.inet,
            Device::DataCopy => self.data_copy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub output_path: String,
    pub splitting_distance: f64,
    pub splitting_time: f64,
    pub pause_speed: f64,
    pub resume_speed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub db_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string, e.g. "info" or
    /// "fraicap_manager=debug,fraicap_agent=info".
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_owned()
}

/// The coordinator's configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub use_agents: UseAgents,
    pub capture: CaptureConfig,
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Fallback system id used if the catalog has none recorded yet.
    #[serde(default = "default_sys_id")]
    pub default_sys_id: String,
    /// Maximum time to wait for all enabled agents to drain on shutdown,
    /// in milliseconds (spec.md §5 "waits ≤1 s for them to drain").
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

fn default_sys_id() -> String {
    "NNN".to_owned()
}

fn default_shutdown_drain_ms() -> u64 {
    1000
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FraicapError::Config(format!("reading {}: {e}", path.display())))?;
        let mut cfg: Self = serde_json::from_str(&contents)?;
        cfg.validate();
        Ok(cfg)
    }

    /// `original_source/manager.py`: os1_imu without os1_lidar is invalid —
    /// force-enable os1_lidar and warn rather than reject outright.
    fn validate(&mut self) {
        if self.use_agents.os1_imu && !self.use_agents.os1_lidar {
            tracing::warn!(
                "use_agents.os1_imu is enabled without os1_lidar; enabling os1_lidar too"
            );
            self.use_agents.os1_lidar = true;
        }
    }
}

/// Per-agent section of the agents configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub local_port: u16,
    pub manager_port: u16,
    pub hw_connection_retries: u32,
    #[serde(default)]
    pub output_file_name: Option<String>,
    /// Device-specific keys (com_port, baudrate, simulate, ping_hosts, ...),
    /// left untyped here and parsed by the owning device driver.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The agents configuration document: `agent_<name>` sections keyed by
/// device name (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(flatten)]
    pub agents: HashMap<String, AgentConfig>,
}

impl AgentsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FraicapError::Config(format!("reading {}: {e}", path.display())))?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn get(&self, device: Device) -> Option<&AgentConfig> {
        self.agents.get(&format!("agent_{}", device.name()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn manager_config_forces_lidar_when_imu_enabled_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "use_agents": {
                    "os1_lidar": false, "os1_imu": true, "gps": true, "camera": false,
                    "imu": false, "atmega": true, "inet": false, "data_copy": true
                },
                "capture": {
                    "output_path": "/data", "splitting_distance": 500.0,
                    "splitting_time": 60.0, "pause_speed": 0.5, "resume_speed": 1.5
                },
                "sqlite": { "db_file": "/data/catalog.db" }
            })
            .to_string(),
        )
        .unwrap();

        let cfg = ManagerConfig::load(&path).unwrap();
        assert!(cfg.use_agents.os1_lidar);
        assert_eq!(cfg.default_sys_id, "NNN");
    }

    #[test]
    fn agents_config_reads_device_specific_extras() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "agent_gps": {
                    "local_port": 9101, "manager_port": 9100,
                    "hw_connection_retries": 5, "output_file_name": "gps.csv",
                    "com_port": "/dev/ttyGPS0", "baudrate": 9600, "simulate": false
                }
            })
            .to_string(),
        )
        .unwrap();

        let cfg = AgentsConfig::load(&path).unwrap();
        let gps = cfg.get(Device::Gps).unwrap();
        assert_eq!(gps.local_port, 9101);
        assert_eq!(gps.extra.get("com_port").unwrap(), "/dev/ttyGPS0");
    }
}
