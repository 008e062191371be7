//! Coordination-store layout and watch timing constants.

/// Key prefix for persisted label maps. One entry per labeled entity,
/// keyed `/labels/<TYPE>/<id>`.
pub const LABEL_PREFIX: &str = "/labels/";

/// Key prefix for daemon-set records, keyed `/daemon_sets/<id>`.
pub const DAEMON_SET_PREFIX: &str = "/daemon_sets/";

/// Tree holding intent entries, keyed `intent/<node>/<pod_id>`.
/// The node agent keys off this path, so it is compatibility-critical.
pub const INTENT_TREE: &str = "intent";

/// How long a watch stream waits after the first event of a burst
/// before re-scanning, in milliseconds.
pub const WATCH_DEBOUNCE_MS: u64 = 50;

/// Retry interval while a deleted daemon set drains its pods, in milliseconds.
pub const TEARDOWN_RETRY_MS: u64 = 250;
