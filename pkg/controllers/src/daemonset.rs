use std::collections::BTreeSet;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use pkg_constants::state::{INTENT_TREE, TEARDOWN_RETRY_MS};
use pkg_labels::applicator::{Applicator, Labeled, Type};
use pkg_labels::selector::{Operator, Selector};
use pkg_store::ds_store::DsStore;
use pkg_store::pod_store::PodStore;
use pkg_types::daemonset::DaemonSet;
use pkg_types::manifest::Manifest;

use crate::error::ControllerError;

/// Well-known pod label naming the daemon set that scheduled the pod.
/// The pod-label index under this key is the source of truth for the
/// scheduled set.
pub const DS_ID_LABEL: &str = "daemon_set_id";

/// Reconciler for one daemon set: drives the invariant
/// *scheduled set == nodes matching the selector* as the record mutates,
/// node labels change, and the record is eventually deleted.
///
/// The caller feeds record updates, the deletion signal, and node-change
/// edges through the channels passed to [`watch_desires`]; the store
/// plumbing for the first two is available via [`watch_record_changes`].
///
/// [`watch_desires`]: DaemonSetReconciler::watch_desires
/// [`watch_record_changes`]: DaemonSetReconciler::watch_record_changes
pub struct DaemonSetReconciler {
    id: String,
    record: StdRwLock<DaemonSet>,
    ds_store: Arc<dyn DsStore>,
    pod_store: Arc<dyn PodStore>,
    applicator: Arc<dyn Applicator>,
}

/// Channels produced by [`DaemonSetReconciler::watch_record_changes`],
/// ready to plug into [`DaemonSetReconciler::watch_desires`].
pub struct RecordWatch {
    pub updated: mpsc::Receiver<DaemonSet>,
    pub deleted: mpsc::Receiver<()>,
    pub errors: mpsc::Receiver<ControllerError>,
}

impl DaemonSetReconciler {
    pub fn new(
        record: DaemonSet,
        ds_store: Arc<dyn DsStore>,
        pod_store: Arc<dyn PodStore>,
        applicator: Arc<dyn Applicator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            record: StdRwLock::new(record),
            ds_store,
            pod_store,
            applicator,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The record as last installed. Selector and disabled-flag reads in
    /// the loop go through this same copy, so a caller sees exactly what
    /// the next tick will act on.
    pub fn record(&self) -> DaemonSet {
        self.record.read().unwrap().clone()
    }

    /// The scheduled set, read from the pod-label index rather than any
    /// local bookkeeping. Each entry's id is `"<node>/<pod_id>"`.
    pub async fn current_pods(&self) -> Result<Vec<Labeled>, ControllerError> {
        let selector =
            Selector::everything().add(DS_ID_LABEL, Operator::Equals, &[self.id.as_str()]);
        Ok(self
            .applicator
            .get_matches(&selector, Type::Pod, false)
            .await?)
    }

    /// Spawn the reconcile loop. Returns the diagnostic error stream; the
    /// stream closing is the loop's exit acknowledgement.
    ///
    /// `quit` exits without touching cluster state. A signal on `deleted`
    /// enters terminal tear-down: desired becomes empty and the loop keeps
    /// retrying until every pod it scheduled is gone, then exits.
    pub fn watch_desires(
        self: &Arc<Self>,
        mut quit: watch::Receiver<()>,
        mut updated: mpsc::Receiver<DaemonSet>,
        mut deleted: mpsc::Receiver<()>,
        mut nodes_changed: mpsc::Receiver<()>,
    ) -> mpsc::Receiver<ControllerError> {
        let (err_tx, err_rx) = mpsc::channel(16);
        let ds = Arc::clone(self);
        tokio::spawn(async move {
            let mut tearing_down = false;
            info!("Daemon set {}: reconciler started", ds.id);
            loop {
                if let Err(e) = ds.tick(tearing_down, &err_tx).await {
                    warn!("Daemon set {}: tick aborted: {}", ds.id, e);
                    let _ = err_tx.send(e).await;
                }

                if tearing_down {
                    match ds.current_pods().await {
                        Ok(pods) if pods.is_empty() => {
                            info!("Daemon set {}: torn down, exiting", ds.id);
                            return;
                        }
                        Ok(pods) => debug!(
                            "Daemon set {}: tear-down pending, {} pods left",
                            ds.id,
                            pods.len()
                        ),
                        Err(e) => {
                            let _ = err_tx.send(e).await;
                        }
                    }
                }

                tokio::select! {
                    _ = quit.changed() => {
                        info!("Daemon set {}: quit, leaving cluster state untouched", ds.id);
                        return;
                    }
                    Some(record) = updated.recv() => {
                        if let Err(e) = ds.install(record) {
                            warn!("Daemon set {}: {}", ds.id, e);
                            let _ = err_tx.send(e).await;
                        }
                    }
                    Some(_) = deleted.recv() => {
                        info!("Daemon set {}: deleted from store, tearing down", ds.id);
                        tearing_down = true;
                    }
                    Some(_) = nodes_changed.recv() => {
                        debug!("Daemon set {}: node labels changed", ds.id);
                    }
                    _ = tokio::time::sleep(Duration::from_millis(TEARDOWN_RETRY_MS)), if tearing_down => {}
                }
            }
        });
        err_rx
    }

    /// Watch the daemon-set store and route this record's changes into
    /// typed channels: post-images on `updated`, a unit signal on
    /// `deleted`. Creations are already handled, the reconciler was
    /// constructed from one.
    pub fn watch_record_changes(self: &Arc<Self>, quit: watch::Receiver<()>) -> RecordWatch {
        let (updated_tx, updated) = mpsc::channel(8);
        let (deleted_tx, deleted) = mpsc::channel(8);
        let (err_tx, errors) = mpsc::channel(16);
        let mut changes = self.ds_store.watch(quit);
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Some(watched) = changes.recv().await {
                if let Some(err) = watched.err {
                    let _ = err_tx
                        .send(ControllerError::WatchStream(err.to_string()))
                        .await;
                }
                for changed in watched.updated {
                    if changed.id == id && updated_tx.send(changed).await.is_err() {
                        return;
                    }
                }
                for changed in watched.deleted {
                    if changed.id == id && deleted_tx.send(()).await.is_err() {
                        return;
                    }
                }
            }
        });
        RecordWatch {
            updated,
            deleted,
            errors,
        }
    }

    /// Validate and atomically install a record post-image. A refused
    /// update leaves the previous record in effect.
    fn install(&self, record: DaemonSet) -> Result<(), ControllerError> {
        if record.id != self.id {
            return Err(ControllerError::InvariantViolation(format!(
                "update carries id {} but this reconciler owns {}",
                record.id, self.id
            )));
        }
        if let Err(e) = record.validate() {
            return Err(ControllerError::InvariantViolation(e.to_string()));
        }
        debug!("Daemon set {}: installed updated record", self.id);
        *self.record.write().unwrap() = record;
        Ok(())
    }

    /// One reconcile pass. Returns `Err` only when reading desired or
    /// current state failed, which aborts the pass to avoid acting on
    /// partial data; per-node write failures are reported on `errors` and
    /// skipped so the next event retries them.
    async fn tick(
        &self,
        tearing_down: bool,
        errors: &mpsc::Sender<ControllerError>,
    ) -> Result<(), ControllerError> {
        let (selector, disabled, pod_id, manifest) = {
            let record = self.record.read().unwrap();
            (
                record.node_selector.clone(),
                record.disabled,
                record.pod_id.clone(),
                record.manifest.clone(),
            )
        };

        if disabled && !tearing_down {
            // Desired is frozen at current while disabled: no scheduling
            // and no unscheduling until re-enabled.
            debug!("Daemon set {}: disabled, skipping reconcile", self.id);
            return Ok(());
        }

        let desired: BTreeSet<String> = if tearing_down {
            BTreeSet::new()
        } else {
            self.applicator
                .get_matches(&selector, Type::Node, false)
                .await?
                .into_iter()
                .map(|labeled| labeled.id)
                .collect()
        };

        let current_nodes: BTreeSet<String> = self
            .current_pods()
            .await?
            .into_iter()
            .filter_map(|labeled| labeled.id.split('/').next().map(str::to_string))
            .collect();

        for node in desired.difference(&current_nodes) {
            if let Err(e) = self.schedule(node, &pod_id, &manifest).await {
                warn!(
                    "Daemon set {}: failed to schedule {} on node {}: {}",
                    self.id, pod_id, node, e
                );
                let _ = errors.send(e).await;
            }
        }
        for node in current_nodes.difference(&desired) {
            if let Err(e) = self.unschedule(node, &pod_id).await {
                warn!(
                    "Daemon set {}: failed to unschedule {} from node {}: {}",
                    self.id, pod_id, node, e
                );
                let _ = errors.send(e).await;
            }
        }
        Ok(())
    }

    async fn schedule(
        &self,
        node: &str,
        pod_id: &str,
        manifest: &Manifest,
    ) -> Result<(), ControllerError> {
        // Intent first, label second. The label write is the commit point
        // that adds the pod to the scheduled set.
        self.pod_store.set_pod(INTENT_TREE, node, manifest).await?;
        let pod = format!("{}/{}", node, pod_id);
        self.applicator
            .set_label(Type::Pod, &pod, DS_ID_LABEL, &self.id)
            .await?;
        info!("Daemon set {}: scheduled {} on node {}", self.id, pod_id, node);
        Ok(())
    }

    async fn unschedule(&self, node: &str, pod_id: &str) -> Result<(), ControllerError> {
        // Mirror image of schedule. The label removal is the commit point
        // for deletion.
        self.pod_store.delete_pod(INTENT_TREE, node, pod_id).await?;
        let pod = format!("{}/{}", node, pod_id);
        self.applicator
            .remove_label(Type::Pod, &pod, DS_ID_LABEL)
            .await?;
        info!(
            "Daemon set {}: unscheduled {} from node {}",
            self.id, pod_id, node
        );
        Ok(())
    }
}
