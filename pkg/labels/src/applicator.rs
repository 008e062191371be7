use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use pkg_constants::state::LABEL_PREFIX;
use pkg_state::client::StateStore;
use pkg_state::error::StoreError;
use pkg_state::watch::drain_burst;

use crate::selector::{Selector, SelectorError};

/// The kinds of entities that carry labels. Each type has its own label
/// tree in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Node,
    Pod,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Node => write!(f, "NODE"),
            Type::Pod => write!(f, "POD"),
        }
    }
}

/// Map a user-facing type name (as typed on a command line or stored in a
/// record) to the enum. Case-insensitive.
pub fn as_type(name: &str) -> Result<Type, LabelError> {
    match name.to_ascii_uppercase().as_str() {
        "NODE" => Ok(Type::Node),
        "POD" => Ok(Type::Pod),
        _ => Err(LabelError::UnknownType(name.to_string())),
    }
}

/// An entity id together with its current label map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labeled {
    pub label_type: Type,
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

impl Labeled {
    /// Render the label map as comma-joined `key=value` pairs, the form
    /// the CLI prints.
    pub fn labels_display(&self) -> String {
        let rendered: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        rendered.join(",")
    }
}

#[derive(Debug, Clone, Error)]
pub enum LabelError {
    #[error("unrecognized label type {0:?}, expected one of NODE, POD")]
    UnknownType(String),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The label index consumed by reconcilers and the label CLI: point get,
/// selector match, set, remove, and a watch stream keyed by selector.
#[async_trait]
pub trait Applicator: Send + Sync {
    /// Labels currently attached to one entity. An entity that was never
    /// labeled yields an empty map, not an error.
    async fn get_labels(&self, label_type: Type, id: &str) -> Result<Labeled, LabelError>;

    /// All entities of `label_type` whose labels satisfy `selector`,
    /// ordered by id. Must reflect writes made through this applicator
    /// causally before the call; `use_cache` permits a stale read.
    async fn get_matches(
        &self,
        selector: &Selector,
        label_type: Type,
        use_cache: bool,
    ) -> Result<Vec<Labeled>, LabelError>;

    /// Attach (or overwrite) one label on one entity.
    async fn set_label(
        &self,
        label_type: Type,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), LabelError>;

    /// Remove one label key. Removing an absent key is a no-op.
    async fn remove_label(&self, label_type: Type, id: &str, key: &str) -> Result<(), LabelError>;

    /// Stream debounced snapshots of the entities matching `selector`.
    /// An initial snapshot is delivered immediately; the stream ends when
    /// `quit` fires or the receiver is dropped.
    fn watch_matches(
        &self,
        selector: Selector,
        label_type: Type,
        quit: watch::Receiver<()>,
    ) -> mpsc::Receiver<Vec<Labeled>>;
}

/// Applicator over the coordination store. Label maps persist as JSON at
/// `/labels/<TYPE>/<id>`; matching is a prefix scan filtered by the
/// selector.
#[derive(Clone)]
pub struct StoreApplicator {
    store: StateStore,
}

impl StoreApplicator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn entity_key(label_type: Type, id: &str) -> String {
        format!("{}{}/{}", LABEL_PREFIX, label_type, id)
    }

    fn type_prefix(label_type: Type) -> String {
        format!("{}{}/", LABEL_PREFIX, label_type)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<BTreeMap<String, String>, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::decode(key, e))
    }
}

#[async_trait]
impl Applicator for StoreApplicator {
    async fn get_labels(&self, label_type: Type, id: &str) -> Result<Labeled, LabelError> {
        let key = Self::entity_key(label_type, id);
        let labels = match self.store.get(&key).await? {
            Some(bytes) => Self::decode(&key, &bytes)?,
            None => BTreeMap::new(),
        };
        Ok(Labeled {
            label_type,
            id: id.to_string(),
            labels,
        })
    }

    async fn get_matches(
        &self,
        selector: &Selector,
        label_type: Type,
        _use_cache: bool,
    ) -> Result<Vec<Labeled>, LabelError> {
        // Reads go straight to the store, so the cached variant is the
        // fresh one; the flag stays on the interface for callers that can
        // tolerate staleness against other implementations.
        let prefix = Self::type_prefix(label_type);
        let mut matches = Vec::new();
        for (key, bytes) in self.store.list_prefix(&prefix).await? {
            let labels = Self::decode(&key, &bytes)?;
            if selector.matches(&labels) {
                let id = key[prefix.len()..].to_string();
                matches.push(Labeled {
                    label_type,
                    id,
                    labels,
                });
            }
        }
        Ok(matches)
    }

    async fn set_label(
        &self,
        label_type: Type,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), LabelError> {
        let entity_key = Self::entity_key(label_type, id);
        let mut labels = match self.store.get(&entity_key).await? {
            Some(bytes) => Self::decode(&entity_key, &bytes)?,
            None => BTreeMap::new(),
        };
        labels.insert(key.to_string(), value.to_string());
        let bytes = serde_json::to_vec(&labels)
            .map_err(|e| StoreError::decode(&entity_key, e))?;
        self.store.put(&entity_key, &bytes).await?;
        debug!("Set label {}/{}: {}={}", label_type, id, key, value);
        Ok(())
    }

    async fn remove_label(&self, label_type: Type, id: &str, key: &str) -> Result<(), LabelError> {
        let entity_key = Self::entity_key(label_type, id);
        let Some(bytes) = self.store.get(&entity_key).await? else {
            return Ok(());
        };
        let mut labels = Self::decode(&entity_key, &bytes)?;
        if labels.remove(key).is_none() {
            return Ok(());
        }
        if labels.is_empty() {
            self.store.delete(&entity_key).await?;
        } else {
            let bytes = serde_json::to_vec(&labels)
                .map_err(|e| StoreError::decode(&entity_key, e))?;
            self.store.put(&entity_key, &bytes).await?;
        }
        debug!("Removed label {}/{}: {}", label_type, id, key);
        Ok(())
    }

    fn watch_matches(
        &self,
        selector: Selector,
        label_type: Type,
        quit: watch::Receiver<()>,
    ) -> mpsc::Receiver<Vec<Labeled>> {
        let (tx, rx) = mpsc::channel(8);
        let applicator = self.clone();
        let mut events = self
            .store
            .event_log
            .watch_prefix(Self::type_prefix(label_type), quit);
        tokio::spawn(async move {
            loop {
                match applicator.get_matches(&selector, label_type, false).await {
                    Ok(matches) => {
                        if tx.send(matches).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Label watch scan failed: {}", e),
                }
                // Block until something under this type's tree changes,
                // then wait out the burst so one scan covers it.
                if events.recv().await.is_none() {
                    return;
                }
                drain_burst(&mut events).await;
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Operator;

    async fn fixture() -> StoreApplicator {
        let store = StateStore::in_memory().await.expect("open store");
        StoreApplicator::new(store)
    }

    #[test]
    fn as_type_roundtrip() {
        assert_eq!(as_type("NODE").expect("parse"), Type::Node);
        assert_eq!(as_type("pod").expect("parse"), Type::Pod);
        assert_eq!(as_type(&Type::Node.to_string()).expect("parse"), Type::Node);
        assert!(as_type("replica_set").is_err());
    }

    #[tokio::test]
    async fn set_get_remove() {
        let applicator = fixture().await;

        applicator
            .set_label(Type::Node, "node1", "nodeQuality", "good")
            .await
            .expect("set");
        applicator
            .set_label(Type::Node, "node1", "az", "us-east")
            .await
            .expect("set");

        let labeled = applicator
            .get_labels(Type::Node, "node1")
            .await
            .expect("get");
        assert_eq!(labeled.labels.len(), 2);
        assert_eq!(labeled.labels["nodeQuality"], "good");
        assert_eq!(labeled.labels_display(), "az=us-east,nodeQuality=good");

        applicator
            .remove_label(Type::Node, "node1", "az")
            .await
            .expect("remove");
        let labeled = applicator
            .get_labels(Type::Node, "node1")
            .await
            .expect("get");
        assert_eq!(labeled.labels.len(), 1);

        // Removing an absent key, or from an unlabeled entity, is a no-op.
        applicator
            .remove_label(Type::Node, "node1", "az")
            .await
            .expect("remove absent key");
        applicator
            .remove_label(Type::Node, "ghost", "az")
            .await
            .expect("remove from unlabeled entity");
    }

    #[tokio::test]
    async fn unlabeled_entity_has_empty_map() {
        let applicator = fixture().await;
        let labeled = applicator
            .get_labels(Type::Pod, "node1/testPod")
            .await
            .expect("get");
        assert!(labeled.labels.is_empty());
    }

    #[tokio::test]
    async fn matches_filter_by_selector_and_type() {
        let applicator = fixture().await;
        applicator
            .set_label(Type::Node, "node1", "nodeQuality", "bad")
            .await
            .expect("set");
        applicator
            .set_label(Type::Node, "node2", "nodeQuality", "good")
            .await
            .expect("set");
        applicator
            .set_label(Type::Pod, "node2/testPod", "nodeQuality", "good")
            .await
            .expect("set");

        let selector = Selector::everything().add("nodeQuality", Operator::Equals, &["good"]);
        let matches = applicator
            .get_matches(&selector, Type::Node, false)
            .await
            .expect("matches");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, "node2");

        let everything = applicator
            .get_matches(&Selector::everything(), Type::Node, false)
            .await
            .expect("matches");
        assert_eq!(everything.len(), 2);
    }

    #[tokio::test]
    async fn watch_matches_emits_snapshots() {
        let applicator = fixture().await;
        let (_quit_tx, quit_rx) = watch::channel(());
        let selector = Selector::everything().add("nodeQuality", Operator::Equals, &["good"]);
        let mut snapshots = applicator.watch_matches(selector, Type::Node, quit_rx);

        let initial = snapshots.recv().await.expect("initial snapshot");
        assert!(initial.is_empty());

        applicator
            .set_label(Type::Node, "node2", "nodeQuality", "good")
            .await
            .expect("set");

        let updated = snapshots.recv().await.expect("updated snapshot");
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, "node2");
    }
}
