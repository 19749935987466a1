//! Partition: a complete thread → machine assignment for one generation.
//!
//! The thread → machine map is the only stored state. The machine → threads
//! index and per-machine loads are derived on demand so the two directions
//! can never drift apart.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use rebal_core::{MachineId, MachineInfo, ThreadId, ThreadWeights};

use crate::error::{PlacementError, PlacementResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    generation: u64,
    /// Participating machines in id order.
    machines: Vec<MachineInfo>,
    assignment: BTreeMap<ThreadId, MachineId>,
}

impl Partition {
    /// Build a partition, rejecting assignments to non-participating machines.
    pub fn new(
        generation: u64,
        mut machines: Vec<MachineInfo>,
        assignment: BTreeMap<ThreadId, MachineId>,
    ) -> PlacementResult<Self> {
        machines.sort_by_key(|m| m.id);
        machines.dedup_by_key(|m| m.id);
        let ids: BTreeSet<MachineId> = machines.iter().map(|m| m.id).collect();
        if let Some((thread, machine)) = assignment.iter().find(|(_, m)| !ids.contains(m)) {
            return Err(PlacementError::UnknownMachine {
                thread: *thread,
                machine: *machine,
            });
        }
        Ok(Self {
            generation,
            machines,
            assignment,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Restamp with the generation it is committed under.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn machines(&self) -> &[MachineInfo] {
        &self.machines
    }

    pub fn machine_ids(&self) -> BTreeSet<MachineId> {
        self.machines.iter().map(|m| m.id).collect()
    }

    pub fn assignment(&self) -> &BTreeMap<ThreadId, MachineId> {
        &self.assignment
    }

    pub fn machine_of(&self, thread: ThreadId) -> Option<MachineId> {
        self.assignment.get(&thread).copied()
    }

    pub fn thread_count(&self) -> usize {
        self.assignment.len()
    }

    /// Machine → threads index. Every participant appears, even when empty.
    pub fn threads_by_machine(&self) -> BTreeMap<MachineId, Vec<ThreadId>> {
        let mut index: BTreeMap<MachineId, Vec<ThreadId>> =
            self.machines.iter().map(|m| (m.id, Vec::new())).collect();
        for (thread, machine) in &self.assignment {
            index.entry(*machine).or_default().push(*thread);
        }
        index
    }

    /// Aggregate cost weight per participating machine.
    pub fn machine_loads(&self, weights: &ThreadWeights) -> BTreeMap<MachineId, f64> {
        let mut loads: BTreeMap<MachineId, f64> =
            self.machines.iter().map(|m| (m.id, 0.0)).collect();
        for (thread, machine) in &self.assignment {
            *loads.entry(*machine).or_default() += weights.get(thread).copied().unwrap_or(0.0);
        }
        loads
    }

    /// Largest `|load − share × total|` over the union of this partition's
    /// machines and `shares`. Machines missing from `shares` have target 0.
    pub fn max_deviation(&self, weights: &ThreadWeights, shares: &BTreeMap<MachineId, f64>) -> f64 {
        let loads = self.machine_loads(weights);
        let total: f64 = self
            .assignment
            .keys()
            .map(|t| weights.get(t).copied().unwrap_or(0.0))
            .sum();
        let machines: BTreeSet<MachineId> = loads.keys().chain(shares.keys()).copied().collect();
        machines
            .into_iter()
            .map(|m| {
                let load = loads.get(&m).copied().unwrap_or(0.0);
                let target = shares.get(&m).copied().unwrap_or(0.0) * total;
                (load - target).abs()
            })
            .fold(0.0, f64::max)
    }

    /// Every thread in `threads` is assigned exactly once and nothing else is.
    pub fn covers(&self, threads: &[ThreadId]) -> bool {
        let expected: BTreeSet<ThreadId> = threads.iter().copied().collect();
        expected.len() == threads.len()
            && self.assignment.len() == expected.len()
            && expected.iter().all(|t| self.assignment.contains_key(t))
    }

    /// Whether every assigned machine is in `participants`.
    pub fn uses_only(&self, participants: &BTreeSet<MachineId>) -> bool {
        self.assignment.values().all(|m| participants.contains(m))
    }
}

/// Target share per machine, proportional to declared capacity.
pub fn target_shares(machines: &[MachineInfo]) -> Vec<f64> {
    let total: f64 = machines.iter().map(|m| m.capacity.max(0.0)).sum();
    if total <= 0.0 {
        let n = machines.len().max(1) as f64;
        return vec![1.0 / n; machines.len()];
    }
    machines.iter().map(|m| m.capacity.max(0.0) / total).collect()
}

/// Number of threads whose machine differs between `a` and `b`, or the sum
/// of their cost weights when `weights` is given.
///
/// Threads present in only one partition count as moved.
pub fn partition_distance(a: &Partition, b: &Partition, weights: Option<&ThreadWeights>) -> f64 {
    let threads: BTreeSet<ThreadId> = a
        .assignment
        .keys()
        .chain(b.assignment.keys())
        .copied()
        .collect();
    threads
        .into_iter()
        .filter(|t| a.machine_of(*t) != b.machine_of(*t))
        .map(|t| match weights {
            Some(w) => w.get(&t).copied().unwrap_or(0.0),
            None => 1.0,
        })
        .sum()
}
