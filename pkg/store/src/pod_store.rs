use async_trait::async_trait;

use pkg_state::client::StateStore;
use pkg_state::error::StoreError;
use pkg_types::manifest::Manifest;

/// One intent entry: the path it is stored under and the manifest that
/// should run there.
#[derive(Debug, Clone, PartialEq)]
pub struct PodResult {
    pub path: String,
    pub manifest: Manifest,
}

/// Writes and deletes intent entries keyed by `(node, pod_id)`.
/// A separate node agent consumes the tree; the paths are its interface.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Declare that `manifest` should run on `node`. Re-writing an
    /// identical entry is a no-op.
    async fn set_pod(&self, tree: &str, node: &str, manifest: &Manifest) -> Result<(), StoreError>;

    /// Withdraw the declaration. Deleting an absent entry is a no-op.
    async fn delete_pod(&self, tree: &str, node: &str, pod_id: &str) -> Result<(), StoreError>;

    /// Every entry under `tree`, in path order.
    async fn all_pods(&self, tree: &str) -> Result<Vec<PodResult>, StoreError>;
}

/// Pod store over the coordination store, keyed `"<tree>/<node>/<pod_id>"`
/// with the manifest bytes as the value.
#[derive(Clone)]
pub struct KvPodStore {
    store: StateStore,
}

impl KvPodStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn pod_key(tree: &str, node: &str, pod_id: &str) -> String {
        format!("{}/{}/{}", tree, node, pod_id)
    }
}

#[async_trait]
impl PodStore for KvPodStore {
    async fn set_pod(&self, tree: &str, node: &str, manifest: &Manifest) -> Result<(), StoreError> {
        let key = Self::pod_key(tree, node, manifest.id());
        let bytes = manifest
            .to_bytes()
            .map_err(|e| StoreError::decode(&key, e))?;
        self.store.put(&key, &bytes).await
    }

    async fn delete_pod(&self, tree: &str, node: &str, pod_id: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::pod_key(tree, node, pod_id)).await
    }

    async fn all_pods(&self, tree: &str) -> Result<Vec<PodResult>, StoreError> {
        let mut pods = Vec::new();
        for (path, bytes) in self.store.list_prefix(&format!("{}/", tree)).await? {
            let manifest =
                Manifest::from_bytes(&bytes).map_err(|e| StoreError::decode(&path, e))?;
            pods.push(PodResult { path, manifest });
        }
        Ok(pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_constants::state::INTENT_TREE;

    async fn fixture() -> KvPodStore {
        let store = StateStore::in_memory().await.expect("open store");
        KvPodStore::new(store)
    }

    #[tokio::test]
    async fn set_renders_the_intent_path() {
        let pod_store = fixture().await;
        let manifest = Manifest::new("testPod");

        pod_store
            .set_pod(INTENT_TREE, "node2", &manifest)
            .await
            .expect("set");

        let pods = pod_store.all_pods(INTENT_TREE).await.expect("all");
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].path, "intent/node2/testPod");
        assert_eq!(pods[0].manifest.id(), "testPod");
    }

    #[tokio::test]
    async fn rewrite_is_idempotent() {
        let pod_store = fixture().await;
        let manifest = Manifest::new("testPod");

        pod_store
            .set_pod(INTENT_TREE, "node2", &manifest)
            .await
            .expect("set");
        pod_store
            .set_pod(INTENT_TREE, "node2", &manifest)
            .await
            .expect("set again");

        assert_eq!(pod_store.all_pods(INTENT_TREE).await.expect("all").len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_and_tolerates_absent() {
        let pod_store = fixture().await;
        let manifest = Manifest::new("testPod");

        pod_store
            .set_pod(INTENT_TREE, "node2", &manifest)
            .await
            .expect("set");
        pod_store
            .delete_pod(INTENT_TREE, "node2", "testPod")
            .await
            .expect("delete");
        assert!(pod_store.all_pods(INTENT_TREE).await.expect("all").is_empty());

        pod_store
            .delete_pod(INTENT_TREE, "node2", "testPod")
            .await
            .expect("delete absent entry");
    }
}
