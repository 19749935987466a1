//! Membership view: tracks the machine roster and participation.
//!
//! The roster starts from the cluster config and changes only through
//! [`MembershipView::on_membership_change`], either because the environment
//! reported a machine joining or leaving, or because a machine was presumed
//! lost after repeated missed reports or failed deliveries.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rebal_core::{ClusterConfig, CoreResult, MachineId, MachineInfo};

/// A roster change reported by the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipChange {
    Joined(MachineInfo),
    Left { id: MachineId },
}

/// In-memory view of a roster member.
#[derive(Debug, Clone)]
struct Member {
    info: MachineInfo,
    /// Consecutive collection windows without a sample.
    missed_reports: u32,
    /// Consecutive failed config deliveries.
    delivery_failures: u32,
}

impl Member {
    fn new(info: MachineInfo) -> Self {
        Self {
            info,
            missed_reports: 0,
            delivery_failures: 0,
        }
    }
}

/// The coordinator-owned roster and participation policy.
pub struct MembershipView {
    config: ClusterConfig,
    /// Live roster keyed by machine id (stable ordering).
    machines: BTreeMap<MachineId, Member>,
    /// Machines removed after being presumed lost.
    lost: BTreeMap<MachineId, MachineInfo>,
    /// Desired participant count before the `machines_in_partition` bound.
    target_count: usize,
    repartition_due: bool,
}

impl MembershipView {
    /// Build a view from an already parsed config.
    pub fn new(config: ClusterConfig) -> Self {
        let machines = config
            .roster()
            .into_iter()
            .map(|m| (m.id, Member::new(m)))
            .collect();
        let target_count = config.init_nodes();
        Self {
            config,
            machines,
            lost: BTreeMap::new(),
            target_count,
            repartition_due: false,
        }
    }

    /// Parse the cluster config at `path` and build a view over its roster.
    pub fn load_config(path: &Path) -> CoreResult<Self> {
        let config = ClusterConfig::from_file(path)?;
        info!(
            path = %path.display(),
            machines = config.machines.len(),
            machines_in_partition = config.cluster.machines_in_partition,
            init_nodes = config.init_nodes(),
            "cluster config loaded"
        );
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Override the initial participant count (constructor hint).
    pub fn set_target_count(&mut self, count: usize) {
        self.target_count = count;
    }

    pub fn target_count(&self) -> usize {
        self.target_count
    }

    /// Machines currently in the roster.
    pub fn known_count(&self) -> usize {
        self.machines.len()
    }

    pub fn get(&self, id: MachineId) -> Option<&MachineInfo> {
        self.machines.get(&id).map(|m| &m.info)
    }

    pub fn contains(&self, id: MachineId) -> bool {
        self.machines.contains_key(&id)
    }

    /// Roster in machine-id order.
    pub fn machines(&self) -> Vec<MachineInfo> {
        self.machines.values().map(|m| m.info.clone()).collect()
    }

    /// Machines removed after being presumed lost.
    pub fn lost_machines(&self) -> Vec<MachineId> {
        self.lost.keys().copied().collect()
    }

    /// Resolve a reporting address to a roster machine.
    pub fn resolve(&self, address: IpAddr) -> Option<MachineId> {
        self.machines
            .values()
            .find(|m| m.info.address == address)
            .map(|m| m.info.id)
    }

    /// Choose the machines that host the partition: the lowest ids, bounded
    /// by `machines_in_partition` and the current target count.
    pub fn select_participating_machines(&self) -> Vec<MachineInfo> {
        let bound = self
            .target_count
            .min(self.config.cluster.machines_in_partition);
        self.machines
            .values()
            .take(bound)
            .map(|m| m.info.clone())
            .collect()
    }

    /// Apply a roster change and flag that a repartition evaluation is due.
    ///
    /// Returns the new number of machines available to the partition.
    pub fn on_membership_change(&mut self, change: MembershipChange) -> usize {
        match change {
            MembershipChange::Joined(info) => {
                let id = info.id;
                if let Some(conflict) = self
                    .machines
                    .values()
                    .find(|m| m.info.address == info.address && m.info.id != id)
                {
                    warn!(
                        machine_id = id,
                        address = %info.address,
                        existing = conflict.info.id,
                        "join rejected: address already in roster"
                    );
                    return self.available_count();
                }
                self.lost.remove(&id);
                self.machines.insert(id, Member::new(info));
                info!(machine_id = id, "machine joined");
            }
            MembershipChange::Left { id } => {
                if self.machines.remove(&id).is_none() {
                    debug!(machine_id = id, "leave for unknown machine ignored");
                    return self.available_count();
                }
                info!(machine_id = id, "machine left");
            }
        }

        self.target_count = self.machines.len();
        self.repartition_due = true;
        self.available_count()
    }

    /// Remove a machine that stopped responding.
    pub fn presume_lost(&mut self, id: MachineId) -> usize {
        if let Some(member) = self.machines.get(&id) {
            warn!(
                machine_id = id,
                missed_reports = member.missed_reports,
                delivery_failures = member.delivery_failures,
                "machine presumed lost"
            );
            self.lost.insert(id, member.info.clone());
        }
        self.on_membership_change(MembershipChange::Left { id })
    }

    /// Machines available to the next partition.
    pub fn available_count(&self) -> usize {
        self.machines
            .len()
            .min(self.config.cluster.machines_in_partition)
    }

    /// Returns and clears the repartition flag.
    pub fn take_repartition_due(&mut self) -> bool {
        std::mem::take(&mut self.repartition_due)
    }

    pub fn repartition_due(&self) -> bool {
        self.repartition_due
    }

    /// A machine reported within the collection window.
    pub fn record_report(&mut self, id: MachineId) {
        if let Some(member) = self.machines.get_mut(&id) {
            member.missed_reports = 0;
        }
    }

    /// A participating machine stayed silent for a whole window.
    ///
    /// Returns `true` once the miss count reaches the escalation threshold.
    pub fn record_missed_report(&mut self, id: MachineId) -> bool {
        let threshold = self.config.telemetry.max_missed_reports;
        match self.machines.get_mut(&id) {
            Some(member) => {
                member.missed_reports += 1;
                member.missed_reports >= threshold
            }
            None => false,
        }
    }

    pub fn record_delivery_success(&mut self, id: MachineId) {
        if let Some(member) = self.machines.get_mut(&id) {
            member.delivery_failures = 0;
        }
    }

    /// A config delivery failed. Returns `true` once the threshold is reached.
    pub fn record_delivery_failure(&mut self, id: MachineId) -> bool {
        let threshold = self.config.distribution.max_delivery_failures;
        match self.machines.get_mut(&id) {
            Some(member) => {
                member.delivery_failures += 1;
                member.delivery_failures >= threshold
            }
            None => false,
        }
    }
}
