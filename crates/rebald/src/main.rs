//! rebald: the rebal controller daemon.
//!
//! Runs one [`ReconfigurationController`] for a fixed thread population:
//! - cluster config and work estimates from files
//! - telemetry, start and membership events as JSON lines on stdin
//! - committed partitions written per machine under `--out-dir`
//!
//! # Usage
//!
//! ```text
//! rebald --config cluster.toml --estimates work.txt --out-dir /var/lib/rebal
//! ```

mod feed;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rebal_controller::{ControllerSettings, ReconfigurationController};
use rebal_core::{ClusterConfig, ThreadId};

use crate::session::FileSession;

const DEFAULT_LOG_FILTER: &str = "info,rebald=debug,rebal=debug";

#[derive(Parser)]
#[command(name = "rebald", about = "rebal load-balancing controller daemon")]
struct Cli {
    /// Cluster config (TOML).
    #[arg(long)]
    config: PathBuf,

    /// Static work-estimate file. Threads weigh the same without one.
    #[arg(long)]
    estimates: Option<PathBuf>,

    /// Number of threads to balance (ids 0..N). Defaults to the config's
    /// `number_of_threads`.
    #[arg(long)]
    threads: Option<usize>,

    /// Machines used by the first partition; 0 defers to the config.
    #[arg(long, default_value = "0")]
    init_nodes: usize,

    /// Resume from this generation without waiting for a start event.
    #[arg(long)]
    initial_iteration: Option<u64>,

    /// Directory for per-machine config files.
    #[arg(long, default_value = "rebal-out")]
    out_dir: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

/// Thread ids `0..count`.
fn thread_population(count: usize) -> anyhow::Result<Vec<ThreadId>> {
    let count = ThreadId::try_from(count)
        .with_context(|| format!("{count} threads exceed the thread id range"))?;
    Ok((0..count).collect())
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "rebald failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    info!(config = %cli.config.display(), "rebald starting");

    let thread_count = match cli.threads {
        Some(n) => n,
        None => ClusterConfig::from_file(&cli.config)?.cluster.number_of_threads,
    };
    let threads = thread_population(thread_count)?;

    tokio::fs::create_dir_all(&cli.out_dir).await?;
    info!(path = %cli.out_dir.display(), "output directory ready");

    let settings = ControllerSettings {
        config_path: cli.config,
        estimates_path: cli.estimates,
    };
    let mut controller = ReconfigurationController::new(threads, cli.init_nodes, settings)
        .with_session_connector(FileSession::connector(cli.out_dir));
    if let Some(iteration) = cli.initial_iteration {
        controller.set_initial_iteration(iteration);
    }

    // ── Inbound events ─────────────────────────────────────────

    let handle = controller.handle();
    feed::spawn_stdin_reader(handle.clone())?;

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                signal_handle.shutdown();
            }
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    // ── Control loop ───────────────────────────────────────────

    let code = controller.run().await;
    let stats = controller.stats();
    info!(
        code,
        generation = controller.generation(),
        iterations = stats.iterations,
        commits = stats.commits,
        machines_lost = stats.machines_lost,
        "rebald stopped"
    );
    Ok(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn population_counts_from_zero() {
        assert_eq!(thread_population(3).unwrap(), vec![0, 1, 2]);
        assert!(thread_population(0).unwrap().is_empty());
    }

    #[test]
    fn oversized_population_is_rejected() {
        let too_many = usize::try_from(u64::from(ThreadId::MAX) + 1).unwrap();
        let err = thread_population(too_many).unwrap_err();
        assert!(err.to_string().contains("thread id range"), "{err}");
    }
}
