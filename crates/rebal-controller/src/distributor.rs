//! Config distributor: fans a committed partition out to sessions.
//!
//! One delivery task is spawned per participating machine. The coordinator
//! never waits on them; outcomes come back over a channel and are folded
//! into membership at the start of the next iteration.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use rebal_core::MachineId;
use rebal_placement::Partition;

use crate::session::{ClusterConfigMessage, Session, SessionConnector};

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub machine_id: MachineId,
    pub generation: u64,
    /// `None` on success, otherwise the failure message.
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ConfigDistributor {
    sessions: HashMap<MachineId, Arc<dyn Session>>,
    connector: Option<SessionConnector>,
    in_flight: JoinSet<()>,
    outcomes_tx: mpsc::UnboundedSender<DeliveryOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<DeliveryOutcome>,
}

impl ConfigDistributor {
    pub fn new() -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            sessions: HashMap::new(),
            connector: None,
            in_flight: JoinSet::new(),
            outcomes_tx,
            outcomes_rx,
        }
    }

    /// Use `connector` to open sessions for machines without one.
    pub fn with_connector(mut self, connector: SessionConnector) -> Self {
        self.set_connector(connector);
        self
    }

    /// Install `connector`, keeping sessions registered so far.
    pub fn set_connector(&mut self, connector: SessionConnector) {
        self.connector = Some(connector);
    }

    pub fn register_session(&mut self, machine_id: MachineId, session: Arc<dyn Session>) {
        self.sessions.insert(machine_id, session);
    }

    pub fn remove_session(&mut self, machine_id: MachineId) {
        self.sessions.remove(&machine_id);
    }

    pub fn has_session(&self, machine_id: MachineId) -> bool {
        self.sessions.contains_key(&machine_id)
    }

    /// Send `partition` to each of its machines. Must be called from within
    /// a tokio runtime. Returns the number of deliveries handed off.
    pub fn distribute(&mut self, partition: &Partition) -> usize {
        let message = Arc::new(ClusterConfigMessage::from_partition(partition));
        let generation = message.generation;
        let mut dispatched = 0;

        for machine in partition.machines() {
            let existing = self.sessions.get(&machine.id).cloned();
            let session = match existing {
                Some(s) => s,
                None => match &self.connector {
                    Some(connect) => {
                        let s = connect(machine);
                        self.sessions.insert(machine.id, Arc::clone(&s));
                        debug!(machine_id = machine.id, "session opened");
                        s
                    }
                    None => {
                        warn!(machine_id = machine.id, generation, "no session for machine");
                        let _ = self.outcomes_tx.send(DeliveryOutcome {
                            machine_id: machine.id,
                            generation,
                            error: Some("no session".to_string()),
                        });
                        continue;
                    }
                },
            };

            let outcomes = self.outcomes_tx.clone();
            let machine_id = machine.id;
            let delivery = session.deliver(Arc::clone(&message));
            self.in_flight.spawn(async move {
                let error = match delivery.await {
                    Ok(()) => None,
                    Err(e) => Some(e.to_string()),
                };
                let _ = outcomes.send(DeliveryOutcome {
                    machine_id,
                    generation,
                    error,
                });
            });
            dispatched += 1;
        }

        info!(
            generation,
            machines = partition.machines().len(),
            dispatched,
            "config distributed"
        );
        dispatched
    }

    /// Outcomes that completed since the last call.
    pub fn take_outcomes(&mut self) -> Vec<DeliveryOutcome> {
        // Reap finished tasks so the set does not grow without bound.
        while self.in_flight.try_join_next().is_some() {}

        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Wait for every in-flight delivery (used at shutdown).
    pub async fn drain(&mut self) {
        while self.in_flight.join_next().await.is_some() {}
    }
}

impl Default for ConfigDistributor {
    fn default() -> Self {
        Self::new()
    }
}
