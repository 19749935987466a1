//! Session boundary: the outbound config message and delivery capability.
//!
//! A session is an opaque connection to one worker machine. The controller
//! only ever asks it to deliver a config message; transport, retries inside
//! a delivery, and acknowledgement are the session's business.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rebal_core::{MachineId, MachineInfo, ThreadId};
use rebal_placement::Partition;

/// Future returned by [`Session::deliver`].
pub type DeliveryFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A live connection to one worker machine.
///
/// Sessions must treat messages idempotently: a message whose generation is
/// older than one already applied is discarded.
pub trait Session: Send + Sync {
    fn deliver(&self, config: Arc<ClusterConfigMessage>) -> DeliveryFuture;
}

/// Opens sessions for machines that do not have one yet (including
/// machines that joined after startup).
pub type SessionConnector = Arc<dyn Fn(&MachineInfo) -> Arc<dyn Session> + Send + Sync>;

/// A participating machine as announced to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineAddress {
    pub id: MachineId,
    pub address: IpAddr,
}

/// The committed placement, as sent to every participating machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfigMessage {
    pub generation: u64,
    pub machines: Vec<MachineAddress>,
    pub assignments: BTreeMap<ThreadId, MachineId>,
}

impl ClusterConfigMessage {
    /// Snapshot a committed partition.
    pub fn from_partition(partition: &Partition) -> Self {
        Self {
            generation: partition.generation(),
            machines: partition
                .machines()
                .iter()
                .map(|m| MachineAddress {
                    id: m.id,
                    address: m.address,
                })
                .collect(),
            assignments: partition.assignment().clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Threads assigned to `machine`.
    pub fn threads_for(&self, machine: MachineId) -> Vec<ThreadId> {
        self.assignments
            .iter()
            .filter(|(_, m)| **m == machine)
            .map(|(t, _)| *t)
            .collect()
    }
}
