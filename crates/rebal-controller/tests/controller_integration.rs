//! End-to-end tests for the reconfiguration controller.
//!
//! Each test writes a cluster config (and optionally a work-estimate file) to
//! a temp dir, runs the controller on a background task, drives it through a
//! [`ControllerHandle`], and observes committed partitions through a
//! recording session.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rebal_controller::{
    ClusterConfigMessage, ControllerHandle, ControllerSettings, ControllerState, DeliveryFuture,
    ReconfigurationController, Session, SessionConnector,
};
use rebal_core::{MachineId, MachineInfo, ThreadId, UtilizationSample};
use rebal_membership::MembershipChange;
use tempfile::TempDir;

// ── Recording session ──────────────────────────────────────────

#[derive(Debug, Clone)]
struct Delivery {
    machine_id: MachineId,
    message: Arc<ClusterConfigMessage>,
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<Delivery>>>);

impl Log {
    fn snapshot(&self) -> Vec<Delivery> {
        self.0.lock().unwrap().clone()
    }

    fn generations(&self) -> BTreeSet<u64> {
        self.snapshot().iter().map(|d| d.message.generation).collect()
    }

    /// First message with `generation` delivered to any machine.
    fn message(&self, generation: u64) -> Option<Arc<ClusterConfigMessage>> {
        self.snapshot()
            .into_iter()
            .find(|d| d.message.generation == generation)
            .map(|d| d.message)
    }

    fn recipients(&self, generation: u64) -> BTreeSet<MachineId> {
        self.snapshot()
            .iter()
            .filter(|d| d.message.generation == generation)
            .map(|d| d.machine_id)
            .collect()
    }
}

struct RecordingSession {
    machine_id: MachineId,
    log: Log,
    fail: bool,
}

impl Session for RecordingSession {
    fn deliver(&self, config: Arc<ClusterConfigMessage>) -> DeliveryFuture {
        let fail = self.fail;
        if !fail {
            self.log.0.lock().unwrap().push(Delivery {
                machine_id: self.machine_id,
                message: config,
            });
        }
        Box::pin(async move {
            if fail {
                anyhow::bail!("connection reset");
            }
            Ok(())
        })
    }
}

fn connector(log: &Log, failing: &[MachineId]) -> SessionConnector {
    let log = log.clone();
    let failing: BTreeSet<MachineId> = failing.iter().copied().collect();
    Arc::new(move |m: &MachineInfo| {
        Arc::new(RecordingSession {
            machine_id: m.id,
            log: log.clone(),
            fail: failing.contains(&m.id),
        }) as Arc<dyn Session>
    })
}

// ── Fixtures ───────────────────────────────────────────────────

struct Cluster {
    threads: usize,
    machines: usize,
    in_partition: usize,
    init_nodes: Option<usize>,
    max_threads_per_machine: Option<usize>,
    sample_timeout_ms: u64,
    max_missed_reports: u32,
    max_delivery_failures: u32,
}

impl Cluster {
    fn new(threads: usize, machines: usize) -> Self {
        Self {
            threads,
            machines,
            in_partition: machines,
            init_nodes: None,
            max_threads_per_machine: None,
            sample_timeout_ms: 40,
            max_missed_reports: 1000,
            max_delivery_failures: 1000,
        }
    }

    fn write(&self, dir: &TempDir) -> PathBuf {
        let mut text = format!(
            "[cluster]\n\
             number_of_threads = {}\n\
             machines_in_partition = {}\n\n\
             [telemetry]\n\
             sample_timeout_ms = {}\n\
             max_missed_reports = {}\n\n\
             [distribution]\n\
             max_delivery_failures = {}\n",
            self.threads,
            self.in_partition,
            self.sample_timeout_ms,
            self.max_missed_reports,
            self.max_delivery_failures,
        );
        let mut cluster_extra = String::new();
        if let Some(init_nodes) = self.init_nodes {
            cluster_extra.push_str(&format!("init_nodes = {init_nodes}\n"));
        }
        if let Some(max) = self.max_threads_per_machine {
            cluster_extra.push_str(&format!("max_threads_per_machine = {max}\n"));
        }
        if !cluster_extra.is_empty() {
            text = text.replacen(
                "\n\n[telemetry]",
                &format!("\n{cluster_extra}\n[telemetry]"),
                1,
            );
        }
        for id in 0..self.machines {
            text.push_str(&format!(
                "\n[[machines]]\nid = {id}\naddress = \"{}\"\n",
                addr(id as MachineId)
            ));
        }
        let path = dir.path().join("cluster.toml");
        std::fs::write(&path, text).unwrap();
        path
    }
}

fn addr(id: MachineId) -> IpAddr {
    format!("10.0.0.{}", id + 1).parse().unwrap()
}

fn estimates(dir: &TempDir, lines: &str) -> PathBuf {
    let path = dir.path().join("work.txt");
    std::fs::write(&path, lines).unwrap();
    path
}

fn population(n: usize) -> Vec<ThreadId> {
    (0..n as ThreadId).collect()
}

fn sample(machine: MachineId, load: f64) -> UtilizationSample {
    UtilizationSample::new(load * 100.0, (1.0 - load) * 100.0, addr(machine))
}

type Running = tokio::task::JoinHandle<(i32, ReconfigurationController)>;

fn spawn(mut controller: ReconfigurationController) -> (ControllerHandle, Running) {
    let handle = controller.handle();
    let task = tokio::spawn(async move {
        let code = controller.run().await;
        (code, controller)
    });
    (handle, task)
}

async fn stop(handle: &ControllerHandle, task: Running) -> (i32, ReconfigurationController) {
    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not shut down")
        .unwrap()
}

/// Poll `cond` until it holds or five seconds pass.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Keep feeding samples until aborted.
fn feed(handle: &ControllerHandle, loads: Vec<(MachineId, f64)>) -> tokio::task::JoinHandle<()> {
    let handle = handle.clone();
    tokio::spawn(async move {
        loop {
            for (machine, load) in &loads {
                handle.submit_sample(sample(*machine, *load));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

fn threads_on(message: &ClusterConfigMessage) -> BTreeMap<MachineId, Vec<ThreadId>> {
    message
        .machines
        .iter()
        .map(|m| (m.id, message.threads_for(m.id)))
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn initial_partition_pairs_heavy_with_light() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: Some(estimates(&dir, "0 0.9\n1 0.1\n2 0.5\n3 0.5\n")),
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 2).await);

    let initial = log.message(0).unwrap();
    let placed = threads_on(&initial);
    assert_eq!(placed[&0], vec![0, 1]);
    assert_eq!(placed[&1], vec![2, 3]);

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(controller.state(), ControllerState::Terminated);
}

#[tokio::test]
async fn nothing_is_distributed_before_start() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.submit_sample(sample(0, 0.9));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(log.snapshot().is_empty());

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(controller.stats().iterations, 0);
    assert_eq!(controller.generation(), 0);
}

#[tokio::test]
async fn unknown_thread_in_estimates_fails_before_start() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: Some(estimates(&dir, "0 1\n1 1\n2 1\n3 1\n9 1\n")),
    };
    let log = Log::default();
    let mut controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));

    let code = tokio::time::timeout(Duration::from_secs(5), controller.run())
        .await
        .expect("init failure must not wait for start");
    assert_ne!(code, 0);
    assert_eq!(controller.state(), ControllerState::Terminated);
    assert!(controller.current_partition().is_none());
    assert!(log.snapshot().is_empty());
}

#[tokio::test]
async fn imbalance_triggers_commit() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 2).await);
    // Uniform estimates put threads {0, 2} on machine 0 and {1, 3} on machine 1.
    let initial = log.message(0).unwrap();
    assert_eq!(threads_on(&initial)[&0], vec![0, 2]);

    let feeder = feed(&handle, vec![(0, 0.9), (1, 0.1)]);
    assert!(eventually(|| log.recipients(1).len() == 2).await);
    feeder.abort();

    let committed = log.message(1).unwrap();
    let placed = threads_on(&committed);
    assert_eq!(placed[&0].len(), 2);
    assert_eq!(placed[&1].len(), 2);
    assert_ne!(placed[&0], vec![0, 2]);
    let all: Vec<ThreadId> = committed.assignments.keys().copied().collect();
    assert_eq!(all, population(4));

    let (_, controller) = stop(&handle, task).await;
    assert!(controller.generation() >= 1);
    assert!(controller.stats().commits >= 1);
}

#[tokio::test]
async fn balanced_load_keeps_generation() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: Some(estimates(&dir, "0 0.9\n1 0.1\n2 0.5\n3 0.5\n")),
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    let feeder = feed(&handle, vec![(0, 0.5), (1, 0.5)]);
    tokio::time::sleep(Duration::from_millis(300)).await;
    feeder.abort();

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(log.generations(), BTreeSet::from([0]));
    assert_eq!(controller.generation(), 0);
    assert_eq!(controller.stats().commits, 0);
    assert!(controller.stats().iterations > 0);
    assert_eq!(controller.stats().rejections, controller.stats().iterations);
}

#[tokio::test]
async fn departed_machine_threads_are_reassigned() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(6, 3).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(6), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 3).await);
    assert!(!log.message(0).unwrap().threads_for(2).is_empty());

    handle.membership_change(MembershipChange::Left { id: 2 });
    assert!(eventually(|| log.recipients(1).len() == 2).await);

    let committed = log.message(1).unwrap();
    let machines: Vec<MachineId> = committed.machines.iter().map(|m| m.id).collect();
    assert_eq!(machines, vec![0, 1]);
    assert!(committed.assignments.values().all(|m| *m != 2));
    assert_eq!(committed.assignments.len(), 6);
    assert_eq!(log.recipients(1), BTreeSet::from([0, 1]));

    let (code, _) = stop(&handle, task).await;
    assert_eq!(code, 0);
}

#[tokio::test]
async fn joined_machine_receives_config() {
    let dir = TempDir::new().unwrap();
    let mut cluster = Cluster::new(6, 2);
    cluster.in_partition = 3;
    cluster.init_nodes = Some(2);
    let settings = ControllerSettings {
        config_path: cluster.write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(6), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 2).await);

    handle.membership_change(MembershipChange::Joined(MachineInfo::new(2, addr(2))));
    assert!(eventually(|| log.recipients(1).len() == 3).await);

    let committed = log.message(1).unwrap();
    assert_eq!(threads_on(&committed)[&2].len(), 2);

    stop(&handle, task).await;
}

#[tokio::test]
async fn silent_machine_is_presumed_lost() {
    let dir = TempDir::new().unwrap();
    let mut cluster = Cluster::new(4, 2);
    cluster.max_missed_reports = 2;
    let settings = ControllerSettings {
        config_path: cluster.write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    let feeder = feed(&handle, vec![(0, 0.5)]);
    assert!(eventually(|| log.recipients(1) == BTreeSet::from([0])).await);
    feeder.abort();

    let committed = log.message(1).unwrap();
    assert_eq!(threads_on(&committed)[&0], population(4));

    let (_, controller) = stop(&handle, task).await;
    assert_eq!(controller.stats().machines_lost, 1);
    assert!(controller.stats().stale_reports >= 2);
}

#[tokio::test]
async fn failed_deliveries_escalate() {
    let dir = TempDir::new().unwrap();
    let mut cluster = Cluster::new(4, 2);
    cluster.max_delivery_failures = 1;
    let settings = ControllerSettings {
        config_path: cluster.write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[1]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| !log.recipients(1).is_empty()).await);

    let committed = log.message(1).unwrap();
    let machines: Vec<MachineId> = committed.machines.iter().map(|m| m.id).collect();
    assert_eq!(machines, vec![0]);

    let (_, controller) = stop(&handle, task).await;
    assert!(controller.stats().delivery_failures >= 1);
    assert_eq!(controller.stats().machines_lost, 1);
}

#[tokio::test]
async fn initial_iteration_skips_start_and_numbers_generations() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let mut controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    controller.set_initial_iteration(10);
    let (handle, task) = spawn(controller);

    // No start signal.
    assert!(eventually(|| log.recipients(10).len() == 2).await);

    handle.membership_change(MembershipChange::Left { id: 1 });
    assert!(eventually(|| !log.recipients(11).is_empty()).await);

    let (_, controller) = stop(&handle, task).await;
    assert_eq!(controller.generation(), 11);
    assert_eq!(controller.current_partition().unwrap().generation(), 11);
}

#[tokio::test]
async fn samples_from_unknown_machines_are_dropped() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(2, 2).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(2), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    handle.submit_sample(sample(7, 0.5));
    handle.submit_sample(sample(8, 0.5));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (_, controller) = stop(&handle, task).await;
    assert_eq!(controller.stats().dropped_samples, 2);
}

#[tokio::test]
async fn non_participant_departure_keeps_hysteresis() {
    let dir = TempDir::new().unwrap();
    let mut cluster = Cluster::new(4, 3);
    cluster.in_partition = 2;
    let settings = ControllerSettings {
        config_path: cluster.write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0) == BTreeSet::from([0, 1])).await);

    // A mild skew: rebalancing would gain 0.05 against a 0.10 threshold.
    let feeder = feed(&handle, vec![(0, 0.55), (1, 0.45)]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(log.generations(), BTreeSet::from([0]));

    // Machine 2 is in the roster but hosts nothing.
    handle.membership_change(MembershipChange::Left { id: 2 });
    tokio::time::sleep(Duration::from_millis(250)).await;
    feeder.abort();

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(log.generations(), BTreeSet::from([0]));
    assert_eq!(controller.generation(), 0);
    assert_eq!(controller.stats().commits, 0);
    assert!(controller.stats().rejections > 0);
    let current = controller.current_partition().unwrap();
    assert_eq!(current.machine_ids(), BTreeSet::from([0, 1]));
}

#[tokio::test]
async fn capacity_shortfall_keeps_prior_partition() {
    let dir = TempDir::new().unwrap();
    let mut cluster = Cluster::new(4, 2);
    cluster.max_threads_per_machine = Some(2);
    let settings = ControllerSettings {
        config_path: cluster.write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 2).await);

    // Four threads no longer fit on one machine capped at two.
    handle.membership_change(MembershipChange::Left { id: 1 });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(log.generations(), BTreeSet::from([0]));
    assert_eq!(controller.generation(), 0);
    assert!(controller.stats().capacity_errors >= 1);
    assert_eq!(controller.stats().commits, 0);

    let kept = controller.current_partition().unwrap();
    assert_eq!(kept.generation(), 0);
    assert_eq!(kept.machine_ids(), BTreeSet::from([0, 1]));
    assert!(kept.covers(&population(4)));
}

#[tokio::test]
async fn empty_roster_keeps_prior_partition() {
    let dir = TempDir::new().unwrap();
    let settings = ControllerSettings {
        config_path: Cluster::new(4, 2).write(&dir),
        estimates_path: None,
    };
    let log = Log::default();
    let controller = ReconfigurationController::new(population(4), 0, settings)
        .with_session_connector(connector(&log, &[]));
    let (handle, task) = spawn(controller);

    handle.start();
    assert!(eventually(|| log.recipients(0).len() == 2).await);

    handle.membership_change(MembershipChange::Left { id: 0 });
    handle.membership_change(MembershipChange::Left { id: 1 });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (code, controller) = stop(&handle, task).await;
    assert_eq!(code, 0);
    assert_eq!(log.generations(), BTreeSet::from([0]));
    assert_eq!(controller.generation(), 0);
    assert!(controller.stats().capacity_errors >= 1);
    assert_eq!(controller.current_partition().unwrap().machine_ids(), BTreeSet::from([0, 1]));
}
