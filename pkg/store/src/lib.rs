//! Persistence for daemon-set records and for the intent tree the node
//! agent consumes.

pub mod ds_store;
pub mod pod_store;
