//! Repartition policy: hysteresis against migration cost.
//!
//! A candidate replaces the current partition only when the reduction in
//! maximum deviation from target shares pays for the threads it moves:
//!
//! ```text
//! improvement = deviation(current) − deviation(candidate)
//! threshold   = min_improvement + migration_cost × weighted_distance
//! commit iff    distance > 0 and improvement > threshold
//!               and cooldown_iterations have passed since the last commit
//! ```

use std::collections::BTreeMap;

use tracing::debug;

use rebal_core::{MachineId, PolicySettings, ThreadWeights};

use crate::partition::{Partition, partition_distance, target_shares};

/// Numbers behind a commit decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Threads whose machine would change.
    pub moved_threads: usize,
    /// Sum of cost weights of the moved threads.
    pub weighted_distance: f64,
    pub current_deviation: f64,
    pub candidate_deviation: f64,
    pub improvement: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The candidate is identical to the current partition.
    Unchanged,
    /// A commit happened too recently.
    Cooldown,
    /// The improvement does not pay for the migration.
    BelowThreshold,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Commit(Evaluation),
    Reject(Evaluation, RejectReason),
}

impl Decision {
    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit(_))
    }

    pub fn evaluation(&self) -> &Evaluation {
        match self {
            Decision::Commit(e) | Decision::Reject(e, _) => e,
        }
    }
}

pub struct RepartitionPolicy {
    settings: PolicySettings,
    /// Iteration of the last commit.
    last_commit: Option<u64>,
}

impl RepartitionPolicy {
    pub fn new(settings: PolicySettings) -> Self {
        Self {
            settings,
            last_commit: None,
        }
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    /// Measure `candidate` against `current` under the given cost weights.
    ///
    /// Deviations are taken against the candidate's machines and their
    /// capacity shares, so a current partition that still uses a departed
    /// machine is penalized for it.
    pub fn evaluate(
        &self,
        current: &Partition,
        candidate: &Partition,
        weights: &ThreadWeights,
    ) -> Evaluation {
        let shares: BTreeMap<MachineId, f64> = candidate
            .machines()
            .iter()
            .map(|m| m.id)
            .zip(target_shares(candidate.machines()))
            .collect();

        let current_deviation = current.max_deviation(weights, &shares);
        let candidate_deviation = candidate.max_deviation(weights, &shares);
        let weighted_distance = partition_distance(current, candidate, Some(weights));
        let moved_threads = partition_distance(current, candidate, None) as usize;

        Evaluation {
            moved_threads,
            weighted_distance,
            current_deviation,
            candidate_deviation,
            improvement: current_deviation - candidate_deviation,
            threshold: self.settings.min_improvement
                + self.settings.migration_cost * weighted_distance,
        }
    }

    /// Decide whether `candidate` should replace `current` at `iteration`.
    pub fn should_commit(
        &self,
        current: &Partition,
        candidate: &Partition,
        weights: &ThreadWeights,
        iteration: u64,
    ) -> Decision {
        let eval = self.evaluate(current, candidate, weights);

        let decision = if eval.moved_threads == 0 {
            Decision::Reject(eval, RejectReason::Unchanged)
        } else if self.in_cooldown(iteration) {
            Decision::Reject(eval, RejectReason::Cooldown)
        } else if eval.improvement > eval.threshold {
            Decision::Commit(eval)
        } else {
            Decision::Reject(eval, RejectReason::BelowThreshold)
        };

        debug!(
            iteration,
            commit = decision.is_commit(),
            moved = decision.evaluation().moved_threads,
            improvement = decision.evaluation().improvement,
            threshold = decision.evaluation().threshold,
            "repartition evaluated"
        );
        decision
    }

    /// Note that a partition was committed at `iteration`.
    pub fn record_commit(&mut self, iteration: u64) {
        self.last_commit = Some(iteration);
    }

    fn in_cooldown(&self, iteration: u64) -> bool {
        match self.last_commit {
            Some(last) => iteration.saturating_sub(last) < self.settings.cooldown_iterations,
            None => false,
        }
    }
}
