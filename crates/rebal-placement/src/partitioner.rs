//! Partitioner: greedy longest-processing-time assignment.
//!
//! Threads are taken heaviest first (ties by thread id) and each goes to the
//! machine currently furthest below its target share (ties by machine id).
//! Not globally optimal, but deterministic and `O(n log n + n·m)`.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use rebal_core::{MachineId, MachineInfo, ThreadId, ThreadWeights};

use crate::error::{PlacementError, PlacementResult};
use crate::partition::Partition;

/// Deficits closer than this are treated as equal.
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default)]
pub struct Partitioner {
    /// Upper bound on threads per machine; `None` means unbounded.
    max_threads_per_machine: Option<usize>,
}

/// Running state of one target machine during assignment.
struct Bin {
    id: MachineId,
    target: f64,
    load: f64,
    threads: usize,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_threads_per_machine(mut self, max: Option<usize>) -> Self {
        self.max_threads_per_machine = max;
        self
    }

    /// Assign every thread in `weights` to one of `machines`.
    ///
    /// `shares` holds one target fraction per machine, in the same order as
    /// `machines`; they are normalized to sum to one. The returned partition
    /// carries generation 0 until it is committed.
    pub fn compute_candidate_partition(
        &self,
        weights: &ThreadWeights,
        machines: &[MachineInfo],
        shares: &[f64],
    ) -> PlacementResult<Partition> {
        if machines.is_empty() {
            return Err(PlacementError::NoMachines);
        }
        if shares.len() != machines.len() {
            return Err(PlacementError::ShareMismatch {
                machines: machines.len(),
                shares: shares.len(),
            });
        }
        let share_total: f64 = shares.iter().sum();
        if shares.iter().any(|s| !s.is_finite() || *s < 0.0) || share_total <= 0.0 {
            return Err(PlacementError::InvalidShares);
        }
        if let Some(max) = self.max_threads_per_machine {
            let capacity = max.saturating_mul(machines.len());
            if weights.len() > capacity {
                warn!(
                    threads = weights.len(),
                    capacity, "insufficient placement capacity"
                );
                return Err(PlacementError::Capacity {
                    threads: weights.len(),
                    capacity,
                });
            }
        }

        let total: f64 = weights.values().sum();
        let mut bins: Vec<Bin> = machines
            .iter()
            .zip(shares)
            .map(|(m, s)| Bin {
                id: m.id,
                target: s / share_total * total,
                load: 0.0,
                threads: 0,
            })
            .collect();
        bins.sort_by_key(|b| b.id);

        let mut order: Vec<(ThreadId, f64)> = weights.iter().map(|(t, w)| (*t, *w)).collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut assignment = BTreeMap::new();
        for (thread, weight) in order {
            let bin = self.pick_bin(&mut bins).ok_or(PlacementError::Capacity {
                threads: weights.len(),
                capacity: assignment.len(),
            })?;
            bin.load += weight;
            bin.threads += 1;
            assignment.insert(thread, bin.id);
        }

        for bin in &bins {
            debug!(
                machine_id = bin.id,
                threads = bin.threads,
                load = bin.load,
                target = bin.target,
                "candidate machine load"
            );
        }

        Partition::new(0, machines.to_vec(), assignment)
    }

    /// The non-full machine with the largest deficit, lowest id on ties.
    fn pick_bin<'a>(&self, bins: &'a mut [Bin]) -> Option<&'a mut Bin> {
        let mut best: Option<usize> = None;
        for (idx, bin) in bins.iter().enumerate() {
            if self.max_threads_per_machine.is_some_and(|max| bin.threads >= max) {
                continue;
            }
            let deficit = bin.target - bin.load;
            match best {
                // Bins are in id order, so a strictly larger deficit is needed to win.
                Some(b) if deficit <= bins[b].target - bins[b].load + TIE_EPSILON => {}
                _ => best = Some(idx),
            }
        }
        best.map(move |idx| &mut bins[idx])
    }
}
