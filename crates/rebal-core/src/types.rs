//! Shared types used across rebal crates.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Identifier of a worker thread. The population is fixed for a run.
pub type ThreadId = u32;

/// Identifier of a physical machine in the roster.
pub type MachineId = u32;

/// Per-thread figures (utilization or cost weight), ordered by thread id.
pub type ThreadWeights = BTreeMap<ThreadId, f64>;

/// A worker thread and its static work estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    /// Static work units from the estimate file (0 until loaded).
    pub work_estimate: f64,
}

impl ThreadInfo {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            work_estimate: 0.0,
        }
    }
}

/// A machine known to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: MachineId,
    pub address: IpAddr,
    /// Relative CPU capacity used to derive target shares.
    pub capacity: f64,
}

impl MachineInfo {
    pub fn new(id: MachineId, address: IpAddr) -> Self {
        Self {
            id,
            address,
            capacity: 1.0,
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }
}

/// One CPU reading reported by a worker machine.
///
/// `cpu_util` and `cpu_idle` are busy and idle ticks over the machine's
/// sampling window. Different machines use different tick baselines, so
/// only the ratio between the two is comparable across the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub cpu_util: f64,
    pub cpu_idle: f64,
    pub address: IpAddr,
}

impl UtilizationSample {
    pub fn new(cpu_util: f64, cpu_idle: f64, address: IpAddr) -> Self {
        Self {
            cpu_util,
            cpu_idle,
            address,
        }
    }
}
