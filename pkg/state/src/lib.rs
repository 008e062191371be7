//! Coordination store shared by the label applicator, the daemon-set store,
//! and the intent store. A thin async KV API over SlateDB plus an event log
//! that watch streams subscribe to.

pub mod client;
pub mod error;
pub mod watch;
