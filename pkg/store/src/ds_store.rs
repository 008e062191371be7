use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use pkg_constants::state::DAEMON_SET_PREFIX;
use pkg_labels::selector::Selector;
use pkg_state::client::StateStore;
use pkg_state::error::StoreError;
use pkg_state::watch::drain_burst;
use pkg_types::daemonset::{DaemonSet, RecordError};
use pkg_types::manifest::Manifest;

#[derive(Debug, Clone, Error)]
pub enum DsStoreError {
    #[error("no daemon set with id {0}")]
    NotFound(String),

    #[error(transparent)]
    Invalid(#[from] RecordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutation applied under [`DsStore::mutate_ds`]. Receives the current
/// record and returns the full replacement.
pub type Mutator = Box<dyn FnOnce(DaemonSet) -> Result<DaemonSet, DsStoreError> + Send>;

/// One batch from the daemon-set watch stream. The stream coalesces:
/// consumers may see the same update twice or miss intermediate states,
/// only the latest record matters. `err` carries watch-side failures
/// without ending the stream.
#[derive(Debug, Clone, Default)]
pub struct WatchedDaemonSets {
    pub created: Vec<DaemonSet>,
    pub updated: Vec<DaemonSet>,
    pub deleted: Vec<DaemonSet>,
    pub err: Option<DsStoreError>,
}

impl WatchedDaemonSets {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
            && self.err.is_none()
    }
}

/// CRUD over daemon-set records plus a single global watch stream.
#[async_trait]
pub trait DsStore: Send + Sync {
    /// Persist a new record under a fresh store-assigned id.
    async fn create(
        &self,
        manifest: Manifest,
        min_health: u64,
        cluster_name: String,
        node_selector: Selector,
        pod_id: String,
    ) -> Result<DaemonSet, DsStoreError>;

    async fn get(&self, id: &str) -> Result<DaemonSet, DsStoreError>;

    async fn list(&self) -> Result<Vec<DaemonSet>, DsStoreError>;

    async fn delete(&self, id: &str) -> Result<(), DsStoreError>;

    /// Read-modify-write with last-write-wins semantics. Returns the
    /// post-image. The id is immutable; a mutator that changes it fails
    /// the whole mutation.
    async fn mutate_ds(&self, id: &str, mutator: Mutator) -> Result<DaemonSet, DsStoreError>;

    /// Watch the whole daemon-set tree. The first batch reports current
    /// contents as `created`; later batches are debounced diffs. The
    /// stream ends when `quit` fires or the receiver is dropped.
    fn watch(&self, quit: watch::Receiver<()>) -> mpsc::Receiver<WatchedDaemonSets>;
}

/// Daemon-set store over the coordination store, one JSON record per key
/// under `/daemon_sets/`.
#[derive(Clone)]
pub struct KvDsStore {
    store: StateStore,
}

impl KvDsStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn record_key(id: &str) -> String {
        format!("{}{}", DAEMON_SET_PREFIX, id)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<DaemonSet, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::decode(key, e))
    }

    async fn put_record(&self, ds: &DaemonSet) -> Result<(), DsStoreError> {
        ds.validate()?;
        let key = Self::record_key(&ds.id);
        let bytes = serde_json::to_vec(ds).map_err(|e| StoreError::decode(&key, e))?;
        self.store.put(&key, &bytes).await?;
        Ok(())
    }

    /// Decode the full tree into an id-indexed snapshot, keeping the raw
    /// bytes so the watch can detect updates without field comparisons.
    async fn snapshot(&self) -> Result<BTreeMap<String, (Vec<u8>, DaemonSet)>, DsStoreError> {
        let mut snapshot = BTreeMap::new();
        for (key, bytes) in self.store.list_prefix(DAEMON_SET_PREFIX).await? {
            let ds = Self::decode(&key, &bytes)?;
            snapshot.insert(ds.id.clone(), (bytes, ds));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl DsStore for KvDsStore {
    async fn create(
        &self,
        manifest: Manifest,
        min_health: u64,
        cluster_name: String,
        node_selector: Selector,
        pod_id: String,
    ) -> Result<DaemonSet, DsStoreError> {
        let ds = DaemonSet {
            id: Uuid::new_v4().to_string(),
            pod_id,
            node_selector,
            min_health,
            cluster_name,
            disabled: false,
            manifest,
        };
        self.put_record(&ds).await?;
        info!("Created daemon set {} for pod {}", ds.id, ds.pod_id);
        Ok(ds)
    }

    async fn get(&self, id: &str) -> Result<DaemonSet, DsStoreError> {
        let key = Self::record_key(id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Err(DsStoreError::NotFound(id.to_string()));
        };
        Ok(Self::decode(&key, &bytes)?)
    }

    async fn list(&self) -> Result<Vec<DaemonSet>, DsStoreError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.into_values().map(|(_, ds)| ds).collect())
    }

    async fn delete(&self, id: &str) -> Result<(), DsStoreError> {
        self.store.delete(&Self::record_key(id)).await?;
        info!("Deleted daemon set {}", id);
        Ok(())
    }

    async fn mutate_ds(&self, id: &str, mutator: Mutator) -> Result<DaemonSet, DsStoreError> {
        let current = self.get(id).await?;
        let mutated = mutator(current)?;
        if mutated.id != id {
            return Err(RecordError::IdChanged {
                previous: id.to_string(),
                mutated: mutated.id,
            }
            .into());
        }
        self.put_record(&mutated).await?;
        Ok(mutated)
    }

    fn watch(&self, quit: watch::Receiver<()>) -> mpsc::Receiver<WatchedDaemonSets> {
        let (tx, rx) = mpsc::channel(8);
        let ds_store = self.clone();
        let mut events = self
            .store
            .event_log
            .watch_prefix(DAEMON_SET_PREFIX.to_string(), quit);
        tokio::spawn(async move {
            let mut previous: BTreeMap<String, (Vec<u8>, DaemonSet)> = BTreeMap::new();
            let mut first = true;
            loop {
                let batch = match ds_store.snapshot().await {
                    Ok(snapshot) => {
                        let batch = diff_snapshots(&previous, &snapshot);
                        previous = snapshot;
                        batch
                    }
                    Err(e) => {
                        warn!("Daemon set watch scan failed: {}", e);
                        WatchedDaemonSets {
                            err: Some(e),
                            ..Default::default()
                        }
                    }
                };
                // Always deliver the initial batch, even when the tree is
                // empty, so consumers know the watch is live.
                if (first || !batch.is_empty()) && tx.send(batch).await.is_err() {
                    return;
                }
                first = false;
                if events.recv().await.is_none() {
                    return;
                }
                drain_burst(&mut events).await;
            }
        });
        rx
    }
}

fn diff_snapshots(
    previous: &BTreeMap<String, (Vec<u8>, DaemonSet)>,
    current: &BTreeMap<String, (Vec<u8>, DaemonSet)>,
) -> WatchedDaemonSets {
    let mut batch = WatchedDaemonSets::default();
    for (id, (bytes, ds)) in current {
        match previous.get(id) {
            None => batch.created.push(ds.clone()),
            Some((old_bytes, _)) if old_bytes != bytes => batch.updated.push(ds.clone()),
            Some(_) => {}
        }
    }
    for (id, (_, ds)) in previous {
        if !current.contains_key(id) {
            batch.deleted.push(ds.clone());
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_labels::selector::Operator;

    async fn fixture() -> KvDsStore {
        let store = StateStore::in_memory().await.expect("open store");
        KvDsStore::new(store)
    }

    fn selector() -> Selector {
        Selector::everything().add("nodeQuality", Operator::Equals, &["good"])
    }

    async fn create(ds_store: &KvDsStore) -> DaemonSet {
        ds_store
            .create(
                Manifest::new("testPod"),
                0,
                "some_name".to_string(),
                selector(),
                "testPod".to_string(),
            )
            .await
            .expect("create daemon set")
    }

    #[tokio::test]
    async fn create_assigns_id_and_persists() {
        let ds_store = fixture().await;
        let ds = create(&ds_store).await;
        assert!(!ds.id.is_empty());
        assert!(!ds.disabled);

        let fetched = ds_store.get(&ds.id).await.expect("get");
        assert_eq!(fetched, ds);
        assert_eq!(ds_store.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_mismatched_manifest() {
        let ds_store = fixture().await;
        let result = ds_store
            .create(
                Manifest::new("otherPod"),
                0,
                "some_name".to_string(),
                selector(),
                "testPod".to_string(),
            )
            .await;
        assert!(matches!(result, Err(DsStoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn mutate_returns_post_image() {
        let ds_store = fixture().await;
        let ds = create(&ds_store).await;

        let mutated = ds_store
            .mutate_ds(
                &ds.id,
                Box::new(|mut ds| {
                    ds.disabled = true;
                    Ok(ds)
                }),
            )
            .await
            .expect("mutate");
        assert!(mutated.disabled);
        assert!(ds_store.get(&ds.id).await.expect("get").disabled);
    }

    #[tokio::test]
    async fn mutate_rejects_id_change() {
        let ds_store = fixture().await;
        let ds = create(&ds_store).await;

        let result = ds_store
            .mutate_ds(
                &ds.id,
                Box::new(|mut ds| {
                    ds.id = "something-else".to_string();
                    Ok(ds)
                }),
            )
            .await;
        assert!(matches!(
            result,
            Err(DsStoreError::Invalid(RecordError::IdChanged { .. }))
        ));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let ds_store = fixture().await;
        assert!(matches!(
            ds_store.get("missing").await,
            Err(DsStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn watch_reports_created_updated_deleted() {
        let ds_store = fixture().await;
        let ds = create(&ds_store).await;

        let (_quit_tx, quit_rx) = watch::channel(());
        let mut changes = ds_store.watch(quit_rx);

        let initial = changes.recv().await.expect("initial batch");
        assert_eq!(initial.created.len(), 1);
        assert_eq!(initial.created[0].id, ds.id);

        ds_store
            .mutate_ds(
                &ds.id,
                Box::new(|mut ds| {
                    ds.disabled = true;
                    Ok(ds)
                }),
            )
            .await
            .expect("mutate");
        let batch = changes.recv().await.expect("update batch");
        assert_eq!(batch.updated.len(), 1);
        assert!(batch.updated[0].disabled);

        ds_store.delete(&ds.id).await.expect("delete");
        let batch = changes.recv().await.expect("delete batch");
        assert_eq!(batch.deleted.len(), 1);
        assert_eq!(batch.deleted[0].id, ds.id);
    }
}
