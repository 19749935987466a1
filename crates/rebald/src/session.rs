//! File-backed sessions.
//!
//! Each machine's latest config is written as JSON to
//! `<out-dir>/machine-<id>.json`. A delivery older than the generation
//! already on disk is acknowledged without touching the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::debug;

use rebal_controller::{ClusterConfigMessage, DeliveryFuture, Session, SessionConnector};
use rebal_core::{MachineId, MachineInfo};

pub struct FileSession {
    inner: Arc<Inner>,
}

struct Inner {
    machine_id: MachineId,
    path: PathBuf,
    /// Generation currently on disk.
    written: Mutex<Option<u64>>,
}

impl FileSession {
    pub fn new(out_dir: &Path, machine_id: MachineId) -> Self {
        Self {
            inner: Arc::new(Inner {
                machine_id,
                path: out_dir.join(format!("machine-{machine_id}.json")),
                written: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// A connector that opens one file session per machine under `out_dir`.
    pub fn connector(out_dir: PathBuf) -> SessionConnector {
        Arc::new(move |machine: &MachineInfo| {
            Arc::new(FileSession::new(&out_dir, machine.id)) as Arc<dyn Session>
        })
    }
}

impl Session for FileSession {
    fn deliver(&self, config: Arc<ClusterConfigMessage>) -> DeliveryFuture {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let mut written = inner.written.lock().await;
            if written.is_some_and(|g| g > config.generation) {
                debug!(
                    machine_id = inner.machine_id,
                    generation = config.generation,
                    "stale config ignored"
                );
                return Ok(());
            }

            let json = serde_json::to_vec_pretty(config.as_ref())?;
            let tmp = inner.path.with_extension("json.tmp");
            tokio::fs::write(&tmp, &json)
                .await
                .with_context(|| format!("writing {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &inner.path)
                .await
                .with_context(|| format!("renaming {}", tmp.display()))?;

            *written = Some(config.generation);
            debug!(
                machine_id = inner.machine_id,
                generation = config.generation,
                path = %inner.path.display(),
                "config written"
            );
            Ok(())
        })
    }
}
