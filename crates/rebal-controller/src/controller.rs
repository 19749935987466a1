//! Reconfiguration controller: the top-level control loop.
//!
//! One coordinator owns the roster, telemetry state, the current partition
//! and the generation counter. Samples, start signals and membership changes
//! from the outside arrive on a single channel and are applied one at a
//! time in arrival order. Shutdown is cooperative: it is honoured while
//! waiting and at iteration boundaries, never in the middle of
//! partitioning → distributing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rebal_core::{
    MachineId, ThreadId, ThreadInfo, ThreadWeights, UtilizationSample, WorkEstimates,
};
use rebal_membership::{MembershipChange, MembershipView};
use rebal_placement::{
    Decision, Partition, Partitioner, RejectReason, RepartitionPolicy, target_shares,
};
use rebal_telemetry::{UtilizationTracker, WorkEstimator};

use crate::distributor::ConfigDistributor;
use crate::error::{ControllerError, ControllerResult};
use crate::session::{Session, SessionConnector};

/// Files read during INIT.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub config_path: PathBuf,
    /// Static work estimates. Without one every thread weighs the same.
    pub estimates_path: Option<PathBuf>,
}

/// Inbound events, applied by the coordinator in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    Start,
    Sample(UtilizationSample),
    Membership(MembershipChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPhase {
    CollectingSamples,
    Estimating,
    Partitioning,
    Deciding,
    Distributing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Init,
    AwaitingStart,
    Iterating(IterationPhase),
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Completed iterations.
    pub iterations: u64,
    pub commits: u64,
    pub rejections: u64,
    /// Samples from machines outside the roster.
    pub dropped_samples: u64,
    /// Participant windows that closed without a sample.
    pub stale_reports: u64,
    /// Repartition attempts that failed for lack of machines or capacity.
    pub capacity_errors: u64,
    pub delivery_failures: u64,
    pub machines_lost: u64,
}

/// Cloneable handle used by the session layer to feed the controller.
#[derive(Clone)]
pub struct ControllerHandle {
    events: mpsc::UnboundedSender<ControlEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ControllerHandle {
    /// Release the controller from AWAITING_START.
    pub fn start(&self) {
        let _ = self.events.send(ControlEvent::Start);
    }

    pub fn submit_sample(&self, sample: UtilizationSample) {
        let _ = self.events.send(ControlEvent::Sample(sample));
    }

    pub fn membership_change(&self, change: MembershipChange) {
        let _ = self.events.send(ControlEvent::Membership(change));
    }

    pub fn send(&self, event: ControlEvent) {
        let _ = self.events.send(event);
    }

    /// Request termination at the next wait or iteration boundary.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Everything built during INIT.
struct Engine {
    membership: MembershipView,
    estimator: WorkEstimator,
    policy: RepartitionPolicy,
    partitioner: Partitioner,
    sample_timeout: std::time::Duration,
}

/// How a collection window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Complete,
    TimedOut,
    MembershipChanged,
    Shutdown,
}

pub struct ReconfigurationController {
    threads: Vec<ThreadInfo>,
    initial_node_count: usize,
    settings: ControllerSettings,
    state: ControllerState,
    waiting_to_start: bool,
    generation: u64,
    iteration: u64,
    current: Option<Partition>,
    weights: ThreadWeights,
    tracker: UtilizationTracker,
    distributor: ConfigDistributor,
    stats: ControllerStats,
    handle: ControllerHandle,
    events: mpsc::UnboundedReceiver<ControlEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ReconfigurationController {
    /// Build a controller over a fixed thread population.
    ///
    /// `initial_node_count` caps the machines used by the first partition;
    /// `0` defers to the config's `init_nodes`.
    pub fn new(threads: Vec<ThreadId>, initial_node_count: usize, settings: ControllerSettings) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            threads: threads.into_iter().map(ThreadInfo::new).collect(),
            initial_node_count,
            settings,
            state: ControllerState::Init,
            waiting_to_start: true,
            generation: 0,
            iteration: 0,
            current: None,
            weights: ThreadWeights::new(),
            tracker: UtilizationTracker::new(),
            distributor: ConfigDistributor::new(),
            stats: ControllerStats::default(),
            handle: ControllerHandle {
                events: events_tx,
                shutdown: Arc::new(shutdown_tx),
            },
            events,
            shutdown,
        }
    }

    /// Open sessions on demand through `connector`.
    pub fn with_session_connector(mut self, connector: SessionConnector) -> Self {
        self.distributor.set_connector(connector);
        self
    }

    pub fn register_session(&mut self, machine_id: MachineId, session: Arc<dyn Session>) {
        self.distributor.register_session(machine_id, session);
    }

    /// Seed the generation counter and skip AWAITING_START.
    pub fn set_initial_iteration(&mut self, iteration: u64) {
        self.generation = iteration;
        self.iteration = iteration;
        self.waiting_to_start = false;
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn current_partition(&self) -> Option<&Partition> {
        self.current.as_ref()
    }

    /// Cost weights used by the most recent partitioning step.
    pub fn weights(&self) -> &ThreadWeights {
        &self.weights
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Run the state machine until shutdown.
    ///
    /// Returns `0` on clean shutdown and `1` when INIT fails.
    pub async fn run(&mut self) -> i32 {
        match self.try_run().await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "controller initialization failed");
                self.set_state(ControllerState::Terminated);
                1
            }
        }
    }

    /// Like [`run`](Self::run) but surfaces the INIT error.
    pub async fn try_run(&mut self) -> ControllerResult<()> {
        self.set_state(ControllerState::Init);
        let mut engine = self.init()?;

        if self.waiting_to_start {
            self.set_state(ControllerState::AwaitingStart);
            if !self.await_start(&mut engine).await {
                self.terminate().await;
                return Ok(());
            }
        }

        info!(
            generation = self.generation,
            iteration = self.iteration,
            "controller started"
        );
        if let Some(current) = &self.current {
            self.distributor.distribute(current);
        }

        while !self.shutdown_requested() {
            self.iterate(&mut engine).await;
        }

        self.terminate().await;
        Ok(())
    }

    fn set_state(&mut self, state: ControllerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "controller state");
            self.state = state;
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn terminate(&mut self) {
        self.distributor.drain().await;
        self.fold_delivery_outcomes(None);
        self.set_state(ControllerState::Terminated);
        info!(
            generation = self.generation,
            iterations = self.stats.iterations,
            commits = self.stats.commits,
            "controller terminated"
        );
    }

    // ── INIT ───────────────────────────────────────────────────

    fn init(&mut self) -> ControllerResult<Engine> {
        let population: Vec<ThreadId> = self.threads.iter().map(|t| t.id).collect();
        let unique: BTreeSet<ThreadId> = population.iter().copied().collect();
        if population.is_empty() || unique.len() != population.len() {
            return Err(ControllerError::Config(
                "thread list must be non-empty and free of duplicates".into(),
            ));
        }

        let mut membership = MembershipView::load_config(&self.settings.config_path)?;
        let config = membership.config().clone();
        if config.cluster.number_of_threads != population.len() {
            return Err(ControllerError::Config(format!(
                "config declares {} threads but {} were supplied",
                config.cluster.number_of_threads,
                population.len()
            )));
        }
        if self.initial_node_count > 0 {
            if self.initial_node_count > membership.known_count() {
                return Err(ControllerError::Config(format!(
                    "roster has {} machines but {} initial nodes were requested",
                    membership.known_count(),
                    self.initial_node_count
                )));
            }
            membership.set_target_count(self.initial_node_count);
        }

        let estimator = match &self.settings.estimates_path {
            Some(path) => WorkEstimator::load_work_estimate_file(path, &population)?,
            None => WorkEstimator::new(WorkEstimates::uniform(&population, 1.0)),
        };
        for thread in &mut self.threads {
            thread.work_estimate = estimator.estimates().get(thread.id).unwrap_or(0.0);
        }

        let partitioner =
            Partitioner::new().with_max_threads_per_machine(config.cluster.max_threads_per_machine);
        let participants = membership.select_participating_machines();
        let weights = estimator.static_weights();
        let initial = partitioner
            .compute_candidate_partition(&weights, &participants, &target_shares(&participants))?
            .with_generation(self.generation);

        info!(
            threads = population.len(),
            machines = participants.len(),
            generation = self.generation,
            "initial partition built"
        );
        self.weights = weights;
        self.current = Some(initial);

        Ok(Engine {
            membership,
            estimator,
            policy: RepartitionPolicy::new(config.policy.clone()),
            partitioner,
            sample_timeout: config.telemetry.sample_timeout(),
        })
    }

    // ── AWAITING_START ─────────────────────────────────────────

    /// Block until the start signal. Returns `false` on shutdown.
    async fn await_start(&mut self, engine: &mut Engine) -> bool {
        info!("waiting for start signal");
        loop {
            if self.shutdown_requested() {
                return false;
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ControlEvent::Start) => {
                        self.waiting_to_start = false;
                        return true;
                    }
                    Some(event) => {
                        self.apply_event(engine, event);
                    }
                    None => return false,
                },
                _ = self.shutdown.changed() => {}
            }
        }
    }

    // ── ITERATING ──────────────────────────────────────────────

    async fn iterate(&mut self, engine: &mut Engine) {
        self.fold_delivery_outcomes(Some(&mut *engine));

        self.set_state(ControllerState::Iterating(IterationPhase::CollectingSamples));
        let collection = self.collect_samples(engine).await;
        match collection {
            Collection::Shutdown => return,
            Collection::Complete | Collection::TimedOut => self.account_reports(engine),
            // Out-of-band: the window is cut short, nobody is penalized for it.
            Collection::MembershipChanged => {}
        }

        self.set_state(ControllerState::Iterating(IterationPhase::Estimating));
        let assignment = match &self.current {
            Some(p) => p.assignment().clone(),
            None => BTreeMap::new(),
        };
        let utilization = self
            .tracker
            .compute_per_thread_utilization(&assignment, engine.estimator.estimates());
        self.weights = engine.estimator.compute_work_to_utilization_ratio(&utilization);

        self.repartition(engine);

        self.iteration += 1;
        self.stats.iterations += 1;
    }

    /// Collect samples until every participant has reported, the window
    /// times out, membership changes, or shutdown is requested.
    async fn collect_samples(&mut self, engine: &mut Engine) -> Collection {
        let deadline = Instant::now() + engine.sample_timeout;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            if self.shutdown_requested() {
                return Collection::Shutdown;
            }
            if self.all_participants_reported(&engine.membership) {
                return Collection::Complete;
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => {
                        if self.apply_event(engine, event) {
                            return Collection::MembershipChanged;
                        }
                    }
                    None => return Collection::Shutdown,
                },
                _ = &mut sleep => return Collection::TimedOut,
                _ = self.shutdown.changed() => {}
            }
        }
    }

    /// Departed or lost participants are not waited for. With nobody left
    /// to wait for, the window runs to its timeout.
    fn all_participants_reported(&self, membership: &MembershipView) -> bool {
        let Some(current) = &self.current else {
            return false;
        };
        let mut live = current
            .machines()
            .iter()
            .filter(|m| membership.contains(m.id))
            .peekable();
        live.peek().is_some() && live.all(|m| self.tracker.has_reported(m.id))
    }

    /// Apply one inbound event. Returns `true` if membership changed.
    fn apply_event(&mut self, engine: &mut Engine, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Start => {
                debug!("start signal ignored: already running");
                false
            }
            ControlEvent::Sample(sample) => {
                self.tracker.add_sample(&sample, &engine.membership);
                self.stats.dropped_samples = self.tracker.dropped_samples();
                false
            }
            ControlEvent::Membership(change) => {
                let before = engine.membership.machines();
                if let MembershipChange::Left { id } = &change {
                    self.tracker.forget_machine(*id);
                    self.distributor.remove_session(*id);
                }
                let available = engine.membership.on_membership_change(change);
                let changed = engine.membership.machines() != before;
                info!(
                    before = before.len(),
                    after = engine.membership.known_count(),
                    available,
                    changed,
                    "membership changed"
                );
                changed
            }
        }
    }

    /// Update miss counters for the closed window and escalate lost machines.
    fn account_reports(&mut self, engine: &mut Engine) {
        let participants: Vec<MachineId> = match &self.current {
            Some(p) => p.machines().iter().map(|m| m.id).collect(),
            None => return,
        };
        for id in participants {
            if !engine.membership.contains(id) {
                continue;
            }
            if self.tracker.has_reported(id) {
                engine.membership.record_report(id);
                continue;
            }
            self.stats.stale_reports += 1;
            warn!(machine_id = id, iteration = self.iteration, "no telemetry this window");
            if engine.membership.record_missed_report(id) {
                self.lose_machine(engine, id);
            }
        }
    }

    fn fold_delivery_outcomes(&mut self, mut engine: Option<&mut Engine>) {
        for outcome in self.distributor.take_outcomes() {
            let Some(engine) = engine.as_deref_mut() else {
                if !outcome.is_success() {
                    self.stats.delivery_failures += 1;
                }
                continue;
            };
            if outcome.is_success() {
                engine.membership.record_delivery_success(outcome.machine_id);
                continue;
            }
            self.stats.delivery_failures += 1;
            warn!(
                machine_id = outcome.machine_id,
                generation = outcome.generation,
                error = outcome.error.as_deref().unwrap_or_default(),
                "config delivery failed"
            );
            if engine.membership.record_delivery_failure(outcome.machine_id) {
                self.lose_machine(engine, outcome.machine_id);
            }
        }
    }

    fn lose_machine(&mut self, engine: &mut Engine, id: MachineId) {
        engine.membership.presume_lost(id);
        self.tracker.forget_machine(id);
        self.distributor.remove_session(id);
        self.stats.machines_lost += 1;
    }

    /// PARTITIONING → DECIDING → DISTRIBUTING. Runs to completion once started.
    fn repartition(&mut self, engine: &mut Engine) {
        self.set_state(ControllerState::Iterating(IterationPhase::Partitioning));
        let participants = engine.membership.select_participating_machines();
        let shares = target_shares(&participants);
        let candidate = match engine.partitioner.compute_candidate_partition(
            &self.weights,
            &participants,
            &shares,
        ) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.stats.capacity_errors += 1;
                warn!(
                    error = %e,
                    iteration = self.iteration,
                    generation = self.generation,
                    "repartition failed, keeping current partition"
                );
                return;
            }
        };

        self.set_state(ControllerState::Iterating(IterationPhase::Deciding));
        let participant_ids: BTreeSet<MachineId> = participants.iter().map(|m| m.id).collect();
        // Roster events that leave the participant set intact still go
        // through the policy.
        engine.membership.take_repartition_due();
        let commit = match &self.current {
            None => true,
            Some(current)
                if current.machine_ids() != participant_ids
                    || !current.uses_only(&participant_ids) =>
            {
                info!(
                    iteration = self.iteration,
                    machines = participant_ids.len(),
                    "participants changed, forcing repartition"
                );
                true
            }
            Some(current) => {
                let decision =
                    engine
                        .policy
                        .should_commit(current, &candidate, &self.weights, self.iteration);
                match decision {
                    Decision::Commit(_) => true,
                    Decision::Reject(eval, reason) => {
                        self.stats.rejections += 1;
                        match reason {
                            RejectReason::Unchanged => {
                                debug!(iteration = self.iteration, "candidate unchanged")
                            }
                            _ => info!(
                                iteration = self.iteration,
                                ?reason,
                                improvement = eval.improvement,
                                threshold = eval.threshold,
                                "repartition rejected"
                            ),
                        }
                        false
                    }
                }
            }
        };
        if !commit {
            return;
        }

        self.generation += 1;
        let committed = candidate.with_generation(self.generation);
        engine.policy.record_commit(self.iteration);
        self.stats.commits += 1;
        info!(
            generation = self.generation,
            iteration = self.iteration,
            machines = committed.machines().len(),
            "partition committed"
        );

        self.set_state(ControllerState::Iterating(IterationPhase::Distributing));
        self.distributor.distribute(&committed);
        self.current = Some(committed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn config_file(threads: usize, machines: usize, extra: &str) -> tempfile::NamedTempFile {
        let mut text = format!(
            "[cluster]\nnumber_of_threads = {threads}\nmachines_in_partition = {machines}\n\n\
             [telemetry]\nsample_timeout_ms = 20\n{extra}\n"
        );
        for id in 0..machines {
            text.push_str(&format!("\n[[machines]]\nid = {id}\naddress = \"10.0.0.{}\"\n", id + 1));
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    fn settings(config: &tempfile::NamedTempFile) -> ControllerSettings {
        ControllerSettings {
            config_path: config.path().to_path_buf(),
            estimates_path: None,
        }
    }

    #[tokio::test]
    async fn duplicate_threads_fail_init() {
        let config = config_file(3, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1, 1], 0, settings(&config));
        assert_eq!(controller.run().await, 1);
        assert_eq!(controller.state(), ControllerState::Terminated);
        assert!(controller.current_partition().is_none());
    }

    #[tokio::test]
    async fn thread_count_must_match_config() {
        let config = config_file(4, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1, 2], 0, settings(&config));
        let err = controller.try_run().await.unwrap_err();
        assert!(matches!(err, ControllerError::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn initial_node_hint_larger_than_roster_fails() {
        let config = config_file(2, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1], 5, settings(&config));
        assert_eq!(controller.run().await, 1);
    }

    #[tokio::test]
    async fn missing_config_fails_init() {
        let mut controller = ReconfigurationController::new(
            vec![0],
            0,
            ControllerSettings {
                config_path: "/nonexistent/cluster.toml".into(),
                estimates_path: None,
            },
        );
        let err = controller.try_run().await.unwrap_err();
        assert!(matches!(err, ControllerError::Core(_)), "{err}");
    }

    #[tokio::test]
    async fn shutdown_while_awaiting_start() {
        let config = config_file(4, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1, 2, 3], 0, settings(&config));
        let handle = controller.handle();
        handle.shutdown();

        assert_eq!(controller.run().await, 0);
        assert_eq!(controller.state(), ControllerState::Terminated);
        assert_eq!(controller.generation(), 0);
        assert_eq!(controller.stats().iterations, 0);
        let initial = controller.current_partition().unwrap();
        assert!(initial.covers(&[0, 1, 2, 3]));
    }

    #[tokio::test]
    async fn hint_limits_initial_participants() {
        let config = config_file(4, 3, "");
        let mut controller = ReconfigurationController::new(vec![0, 1, 2, 3], 1, settings(&config));
        controller.handle().shutdown();
        assert_eq!(controller.run().await, 0);
        let initial = controller.current_partition().unwrap();
        assert_eq!(initial.machine_ids().into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test]
    async fn initial_iteration_seeds_generation() {
        let config = config_file(2, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1], 0, settings(&config));
        controller.set_initial_iteration(41);
        let handle = controller.handle();

        let task = tokio::spawn(async move {
            let code = controller.run().await;
            (code, controller)
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown();
        let (code, controller) = task.await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(controller.generation(), 41);
        assert!(controller.iteration() > 41);
        assert_eq!(controller.stats().commits, 0);
    }

    #[tokio::test]
    async fn handle_outlives_controller() {
        let config = config_file(2, 2, "");
        let controller = ReconfigurationController::new(vec![0, 1], 0, settings(&config));
        let handle = controller.handle();
        drop(controller);
        handle.start();
        handle.shutdown();
    }

    #[tokio::test]
    async fn connector_keeps_registered_sessions() {
        use crate::session::{ClusterConfigMessage, DeliveryFuture};

        struct Noop;
        impl Session for Noop {
            fn deliver(&self, _config: Arc<ClusterConfigMessage>) -> DeliveryFuture {
                Box::pin(async { Ok(()) })
            }
        }

        let config = config_file(2, 2, "");
        let mut controller = ReconfigurationController::new(vec![0, 1], 0, settings(&config));
        controller.register_session(0, Arc::new(Noop));
        let controller = controller
            .with_session_connector(Arc::new(|_: &rebal_core::MachineInfo| {
                Arc::new(Noop) as Arc<dyn Session>
            }));
        assert!(controller.distributor.has_session(0));
        assert!(!controller.distributor.has_session(1));
    }
}
