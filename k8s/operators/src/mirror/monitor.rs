//! A supervisor owning at most one health-monitor task per mirrored rados
//! namespace. Each task has its own shutdown channel; cancellation is
//! idempotent and the task returns within one poll interval.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ceph_port::CephClient;
use chrono::Utc;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crd::{radosnamespace::MirrorHealthStatus, CephBlockPoolRadosNamespace};

/// Identifies one monitored rados namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorKey {
    pub namespace: String,
    pub pool: String,
    pub rados_namespace: String,
}

impl std::fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace, self.pool, self.rados_namespace
        )
    }
}

struct MonitorHandle {
    shutdown: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// The keyed set of running monitors. One instance is shared by the
/// rados-namespace reconciler; starts and stops are serialised per object by
/// the controller, the internal mutex only guards the map itself.
#[derive(Default)]
pub struct MonitorSet {
    tasks: Mutex<HashMap<MonitorKey, MonitorHandle>>,
}

impl MonitorSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn a monitor for the key unless one is already running. The task
    /// factory receives the shutdown receiver the supervisor will signal.
    /// Returns false when a monitor already holds the key.
    pub fn start<F, Fut>(&self, key: &MonitorKey, task: F) -> bool
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(key) {
            return false;
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = MonitorHandle {
            shutdown: shutdown_tx,
            task: tokio::spawn(task(shutdown_rx)),
        };
        tasks.insert(key.clone(), handle);
        debug!(key = %key, "started mirror status monitor");
        true
    }

    /// Cancel the monitor of the key, if any. Calling this twice is a no-op.
    pub fn stop(&self, key: &MonitorKey) {
        let handle = self.tasks.lock().remove(key);
        if let Some(handle) = handle {
            // the task either receives the signal or has already returned
            let _ = handle.shutdown.try_send(());
            debug!(key = %key, "stopped mirror status monitor");
        }
    }

    /// Cancel every monitor; used on operator shutdown.
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock();
        for (key, handle) in tasks.drain() {
            let _ = handle.shutdown.try_send(());
            debug!(key = %key, "stopped mirror status monitor");
        }
    }

    /// True when a monitor holds the key.
    pub fn contains(&self, key: &MonitorKey) -> bool {
        self.tasks.lock().contains_key(key)
    }

    /// Number of running monitors.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Drop finished tasks from the map. Handles that already returned keep
    /// their key reserved until stopped or swept.
    pub fn sweep(&self) {
        self.tasks.lock().retain(|_, handle| !handle.task.is_finished());
    }
}

/// One health monitor: polls the mirror status of its namespace and writes
/// the summary into the CR status, until shut down.
pub struct MirrorMonitor {
    client: Client,
    ceph: Arc<dyn CephClient>,
    key: MonitorKey,
    cr_name: String,
}

impl MirrorMonitor {
    pub fn new(
        client: Client,
        ceph: Arc<dyn CephClient>,
        key: MonitorKey,
        cr_name: &str,
    ) -> Self {
        Self {
            client,
            ceph,
            key,
            cr_name: cr_name.to_string(),
        }
    }

    /// The monitor loop. Respects its shutdown channel and returns within one
    /// poll interval of cancellation.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let period: Duration = utils::MIRROR_STATUS_CHECK_PERIOD
            .parse::<humantime::Duration>()
            .expect("a valid mirror check period")
            .into();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(key = %self.key, "mirror status monitor shutting down");
                    return;
                }
                _ = tokio::time::sleep(period) => {
                    if let Err(error) = self.check().await {
                        warn!(key = %self.key, %error, "mirror status check failed");
                    }
                }
            }
        }
    }

    /// One status check. Nothing is written for a CR already being deleted.
    async fn check(&self) -> crate::error::Result<()> {
        let api: Api<CephBlockPoolRadosNamespace> =
            Api::namespaced(self.client.clone(), &self.key.namespace);

        let cr = match api.get(&self.cr_name).await {
            Ok(cr) => cr,
            Err(error) if crate::k8sutil::is_not_found(&error) => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        if cr.metadata.deletion_timestamp.is_some() {
            debug!(key = %self.key, "namespace is being deleted, skipping status write");
            return Ok(());
        }

        let summary = self
            .ceph
            .get_mirror_status(&self.key.pool, &self.key.rados_namespace)
            .await?;

        let mirror = MirrorHealthStatus {
            summary,
            last_checked: Some(Utc::now().to_rfc3339()),
        };
        let patch = json!({ "status": { "mirror": mirror } });
        api.patch_status(
            &cr.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(rn: &str) -> MonitorKey {
        MonitorKey {
            namespace: "test".into(),
            pool: "replicapool".into(),
            rados_namespace: rn.into(),
        }
    }

    #[tokio::test]
    async fn at_most_one_monitor_per_key() {
        let set = MonitorSet::new();
        let spawned = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let spawned = spawned.clone();
            set.start(&key("ns-a"), move |mut shutdown| async move {
                spawned.fetch_add(1, Ordering::SeqCst);
                let _ = shutdown.recv().await;
            });
        }

        assert_eq!(set.len(), 1);
        tokio::task::yield_now().await;
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        set.stop(&key("ns-a"));
    }

    #[tokio::test]
    async fn stop_cancels_and_is_idempotent() {
        let set = MonitorSet::new();
        let (done_tx, mut done_rx) = mpsc::channel(1);

        set.start(&key("ns-a"), move |mut shutdown| async move {
            let _ = shutdown.recv().await;
            let _ = done_tx.send(()).await;
        });
        assert!(set.contains(&key("ns-a")));

        set.stop(&key("ns-a"));
        assert!(!set.contains(&key("ns-a")));
        // the task observed the shutdown signal
        done_rx.recv().await.expect("task should shut down");

        // a second stop on the same key is a no-op
        set.stop(&key("ns-a"));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let set = MonitorSet::new();
        set.start(&key("ns-a"), |mut shutdown| async move {
            let _ = shutdown.recv().await;
        });
        set.start(&key("ns-b"), |mut shutdown| async move {
            let _ = shutdown.recv().await;
        });
        assert_eq!(set.len(), 2);

        set.stop(&key("ns-a"));
        assert!(!set.contains(&key("ns-a")));
        assert!(set.contains(&key("ns-b")));
        set.stop(&key("ns-b"));
    }

    #[tokio::test]
    async fn sweep_drops_finished_tasks() {
        let set = MonitorSet::new();
        set.start(&key("ns-a"), |_shutdown| async move {});
        tokio::task::yield_now().await;
        set.sweep();
        assert!(set.is_empty());
    }
}
