//! Cluster config parser.
//!
//! The config file is TOML: a `[cluster]` table with the partition-size
//! parameters, a `[[machines]]` roster, and optional tuning tables for the
//! repartition policy, telemetry collection, and config distribution.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{MachineId, MachineInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub machines: Vec<MachineEntry>,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub distribution: DistributionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub number_of_threads: usize,
    pub machines_in_partition: usize,
    /// Machines used by the first partition. Defaults to `machines_in_partition`.
    pub init_nodes: Option<usize>,
    /// Upper bound on threads any single machine may host.
    pub max_threads_per_machine: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEntry {
    pub id: MachineId,
    pub address: std::net::IpAddr,
    #[serde(default = "default_capacity")]
    pub capacity: f64,
}

/// Hysteresis knobs for the repartition policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Minimum reduction in max deviation before any migration is considered.
    pub min_improvement: f64,
    /// Extra improvement required per unit of migrated cost weight.
    pub migration_cost: f64,
    /// Iterations that must pass after a commit before the next one.
    pub cooldown_iterations: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            min_improvement: 0.05,
            migration_cost: 0.1,
            cooldown_iterations: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Bounded wait for samples in each collection window.
    pub sample_timeout_ms: u64,
    /// Consecutive silent windows before a machine is presumed lost.
    pub max_missed_reports: u32,
}

impl TelemetrySettings {
    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            sample_timeout_ms: 1000,
            max_missed_reports: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionSettings {
    /// Consecutive failed deliveries before a machine is presumed lost.
    pub max_delivery_failures: u32,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self {
            max_delivery_failures: 3,
        }
    }
}

fn default_capacity() -> f64 {
    1.0
}

impl ClusterConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate config text. `path` is only used in error messages.
    pub fn parse(content: &str, path: &Path) -> CoreResult<Self> {
        let config: ClusterConfig = toml::from_str(content).map_err(|e| {
            let line = e
                .span()
                .map(|span| line_of(content, span.start))
                .unwrap_or(0);
            CoreError::parse(path, line, e.message())
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Machines used by the first partition.
    pub fn init_nodes(&self) -> usize {
        self.cluster
            .init_nodes
            .unwrap_or(self.cluster.machines_in_partition)
    }

    /// The roster as [`MachineInfo`] records, in file order.
    pub fn roster(&self) -> Vec<MachineInfo> {
        self.machines
            .iter()
            .map(|m| MachineInfo::new(m.id, m.address).with_capacity(m.capacity))
            .collect()
    }

    fn validate(&self) -> CoreResult<()> {
        let cluster = &self.cluster;
        if cluster.number_of_threads == 0 {
            return Err(CoreError::Config("number_of_threads must be > 0".into()));
        }
        if cluster.machines_in_partition == 0 {
            return Err(CoreError::Config("machines_in_partition must be > 0".into()));
        }
        if self.init_nodes() == 0 {
            return Err(CoreError::Config("init_nodes must be > 0".into()));
        }
        if cluster.max_threads_per_machine == Some(0) {
            return Err(CoreError::Config("max_threads_per_machine must be > 0".into()));
        }

        let mut ids = HashSet::new();
        let mut addresses = HashSet::new();
        for machine in &self.machines {
            if !ids.insert(machine.id) {
                return Err(CoreError::Config(format!(
                    "duplicate machine id {}",
                    machine.id
                )));
            }
            if !addresses.insert(machine.address) {
                return Err(CoreError::Config(format!(
                    "duplicate machine address {}",
                    machine.address
                )));
            }
            if !machine.capacity.is_finite() || machine.capacity <= 0.0 {
                return Err(CoreError::Config(format!(
                    "machine {} has invalid capacity {}",
                    machine.id, machine.capacity
                )));
            }
        }

        let required = self.init_nodes().min(cluster.machines_in_partition);
        if self.machines.len() < required {
            return Err(CoreError::Config(format!(
                "roster has {} machines but {} are required",
                self.machines.len(),
                required
            )));
        }

        if self.policy.min_improvement < 0.0 || self.policy.migration_cost < 0.0 {
            return Err(CoreError::Config("policy thresholds must be >= 0".into()));
        }
        if self.telemetry.sample_timeout_ms == 0 {
            return Err(CoreError::Config("sample_timeout_ms must be > 0".into()));
        }
        if self.telemetry.max_missed_reports == 0 {
            return Err(CoreError::Config("max_missed_reports must be > 0".into()));
        }
        if self.distribution.max_delivery_failures == 0 {
            return Err(CoreError::Config("max_delivery_failures must be > 0".into()));
        }
        Ok(())
    }
}

/// 1-based line number of a byte offset.
pub(crate) fn line_of(content: &str, offset: usize) -> usize {
    content[..offset.min(content.len())]
        .bytes()
        .filter(|b| *b == b'\n')
        .count()
        + 1
}
