use serde::{Deserialize, Serialize};
use thiserror::Error;

use pkg_labels::selector::Selector;

use crate::manifest::Manifest;

/// A daemon-set record failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("manifest id {manifest_id:?} does not match pod id {pod_id:?}")]
    ManifestIdMismatch { manifest_id: String, pod_id: String },

    #[error("daemon set id is immutable (was {previous:?}, got {mutated:?})")]
    IdChanged { previous: String, mutated: String },
}

// --- DaemonSet record ---

/// The declarative daemon-set record the reconciler drives the cluster
/// toward: run `manifest` on every node matching `node_selector`.
///
/// `id` is assigned by the store at creation and never changes. Of the
/// remaining fields only `node_selector` and `disabled` alter scheduling
/// behavior at runtime; `min_health` is advisory and read by higher-level
/// rollout policy, not by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSet {
    pub id: String,
    pub pod_id: String,
    pub node_selector: Selector,
    #[serde(default)]
    pub min_health: u64,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub disabled: bool,
    pub manifest: Manifest,
}

impl DaemonSet {
    /// Check the record's internal invariants.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.manifest.id() != self.pod_id {
            return Err(RecordError::ManifestIdMismatch {
                manifest_id: self.manifest.id().to_string(),
                pod_id: self.pod_id.clone(),
            });
        }
        Ok(())
    }
}
