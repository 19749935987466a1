//! Work estimator: fuses static work estimates with live utilization.
//!
//! Before any telemetry arrives the partitioner only has the static work
//! units from the estimate file. Once a thread has been observed its live
//! utilization is used instead, and the ratio between live and static
//! figures of observed threads rescales the estimates of threads that are
//! still unobserved, so both kinds of weight share one unit.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::debug;

use rebal_core::{CoreResult, ThreadId, ThreadWeights, WorkEstimates};

/// Weights never drop below this, so idle threads still spread out.
pub const MIN_WEIGHT: f64 = 1e-6;

pub struct WorkEstimator {
    estimates: WorkEstimates,
    /// Last live utilization of every thread observed this run.
    live: ThreadWeights,
    observed: BTreeSet<ThreadId>,
    /// Live-to-static ratio from the last computation.
    ratio: Option<f64>,
}

impl WorkEstimator {
    pub fn new(estimates: WorkEstimates) -> Self {
        Self {
            estimates,
            live: ThreadWeights::new(),
            observed: BTreeSet::new(),
            ratio: None,
        }
    }

    /// Load static estimates for `population` from disk.
    pub fn load_work_estimate_file(path: &Path, population: &[ThreadId]) -> CoreResult<Self> {
        WorkEstimates::from_file(path, population).map(Self::new)
    }

    pub fn estimates(&self) -> &WorkEstimates {
        &self.estimates
    }

    pub fn is_observed(&self, thread: ThreadId) -> bool {
        self.observed.contains(&thread)
    }

    pub fn ratio(&self) -> Option<f64> {
        self.ratio
    }

    /// Static-only weights, as fractions of the total estimate.
    pub fn static_weights(&self) -> ThreadWeights {
        let total = self.estimates.total();
        let n = self.estimates.len().max(1) as f64;
        self.estimates
            .iter()
            .map(|(id, work)| {
                let w = if total > 0.0 { work / total } else { 1.0 / n };
                (id, w.max(MIN_WEIGHT))
            })
            .collect()
    }

    /// Fold this iteration's utilization in and produce per-thread cost weights.
    pub fn compute_work_to_utilization_ratio(&mut self, utilization: &ThreadWeights) -> ThreadWeights {
        for (thread, util) in utilization {
            if self.estimates.get(*thread).is_none() {
                continue;
            }
            self.live.insert(*thread, *util);
            self.observed.insert(*thread);
        }

        if self.observed.is_empty() {
            self.ratio = None;
            return self.static_weights();
        }

        let live_total: f64 = self.observed.iter().map(|t| self.live[t]).sum();
        let static_total: f64 = self
            .observed
            .iter()
            .map(|t| self.estimates.get(*t).unwrap_or(0.0))
            .sum();
        self.ratio = (static_total > 0.0).then(|| live_total / static_total);
        let mean_live = live_total / self.observed.len() as f64;

        let weights: ThreadWeights = self
            .estimates
            .iter()
            .map(|(id, work)| {
                let w = match (self.live.get(&id), self.ratio) {
                    (Some(live), _) => *live,
                    (None, Some(ratio)) => work * ratio,
                    (None, None) => mean_live,
                };
                (id, w.max(MIN_WEIGHT))
            })
            .collect();

        debug!(
            observed = self.observed.len(),
            threads = weights.len(),
            ratio = ?self.ratio,
            "cost weights computed"
        );
        weights
    }
}
