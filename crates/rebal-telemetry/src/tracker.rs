//! Utilization tracker: ingests CPU samples and derives per-thread load.
//!
//! Samples accumulate in a per-iteration window. Computing per-thread
//! utilization closes the window: each reporting machine's mean normalized
//! load replaces its previous reading, machines that stayed silent keep
//! their previous reading, and the per-thread map is rebuilt from scratch.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use rebal_core::{MachineId, ThreadId, ThreadWeights, UtilizationSample, WorkEstimates};
use rebal_membership::MembershipView;

/// Normalize a raw reading to `0.0..=1.0` (idle to saturated).
///
/// Non-finite or negative inputs are treated as zero.
pub fn normalize(cpu_util: f64, cpu_idle: f64) -> f64 {
    let util = sanitize(cpu_util);
    let idle = sanitize(cpu_idle);
    if util <= 0.0 {
        return 0.0;
    }
    // util / (util + idle) without forming the sum, which can overflow.
    (1.0 / (1.0 + idle / util)).clamp(0.0, 1.0)
}

fn sanitize(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 { v } else { 0.0 }
}

/// Running sum of normalized readings for one machine in one window.
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    sum: f64,
    count: u32,
}

impl Window {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / f64::from(self.count)
        }
    }
}

#[derive(Debug, Default)]
pub struct UtilizationTracker {
    /// Samples received in the current window.
    pending: BTreeMap<MachineId, Window>,
    /// Last completed load per machine.
    machine_load: BTreeMap<MachineId, f64>,
    /// Samples from addresses outside the roster.
    dropped_samples: u64,
}

impl UtilizationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw reading. Samples from unknown machines are dropped.
    ///
    /// Returns the machine the sample was attributed to.
    pub fn add_sample(
        &mut self,
        sample: &UtilizationSample,
        membership: &MembershipView,
    ) -> Option<MachineId> {
        let Some(machine_id) = membership.resolve(sample.address) else {
            self.dropped_samples += 1;
            warn!(
                address = %sample.address,
                dropped = self.dropped_samples,
                "sample from unknown machine dropped"
            );
            return None;
        };

        let normalized = normalize(sample.cpu_util, sample.cpu_idle);
        let window = self.pending.entry(machine_id).or_default();
        window.sum += normalized;
        window.count += 1;
        debug!(
            machine_id,
            cpu_util = sample.cpu_util,
            cpu_idle = sample.cpu_idle,
            normalized,
            "sample recorded"
        );
        Some(machine_id)
    }

    /// Machines that reported in the current window.
    pub fn reported_machines(&self) -> BTreeSet<MachineId> {
        self.pending.keys().copied().collect()
    }

    pub fn has_reported(&self, machine: MachineId) -> bool {
        self.pending.contains_key(&machine)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Last completed load of a machine, if it ever reported.
    pub fn machine_load(&self, machine: MachineId) -> Option<f64> {
        self.machine_load.get(&machine).copied()
    }

    /// Discard everything known about a machine (it left the roster).
    pub fn forget_machine(&mut self, machine: MachineId) {
        self.pending.remove(&machine);
        self.machine_load.remove(&machine);
    }

    /// Close the window and split each machine's load over its threads.
    ///
    /// `assignment` is the current thread → machine mapping. Each machine's
    /// load is divided in proportion to the static estimates of the threads
    /// it hosts (evenly when they are all zero). Threads on machines that
    /// have never reported are absent from the result.
    pub fn compute_per_thread_utilization(
        &mut self,
        assignment: &BTreeMap<ThreadId, MachineId>,
        estimates: &WorkEstimates,
    ) -> ThreadWeights {
        for (machine, window) in std::mem::take(&mut self.pending) {
            self.machine_load.insert(machine, window.mean());
        }

        let mut by_machine: BTreeMap<MachineId, Vec<ThreadId>> = BTreeMap::new();
        for (thread, machine) in assignment {
            by_machine.entry(*machine).or_default().push(*thread);
        }

        let mut per_thread = ThreadWeights::new();
        for (machine, threads) in by_machine {
            let Some(load) = self.machine_load.get(&machine).copied() else {
                continue;
            };
            let static_total: f64 = threads
                .iter()
                .map(|t| estimates.get(*t).unwrap_or(0.0))
                .sum();
            for thread in threads.iter().copied() {
                let share = if static_total > 0.0 {
                    estimates.get(thread).unwrap_or(0.0) / static_total
                } else {
                    1.0 / threads.len() as f64
                };
                per_thread.insert(thread, (load * share).clamp(0.0, 1.0));
            }
        }
        per_thread
    }
}
