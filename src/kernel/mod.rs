//! Kernel ownership: typed HTTP client, process lifecycle, session snapshots,
//! and the source templates injected into the kernel namespace.

pub mod client;
pub mod inject;
pub mod manager;
pub mod snapshot;

pub use client::{ExecOutcome, KernelClient, RestoreReport, VariableInfo};
pub use manager::{IsolationTier, KernelManager, RestartHook};
pub use snapshot::{session_id_for, SessionSnapshotter, SnapshotManifest};
