//! Engram infrastructure watcher
//!
//! Monitors configured directories for file changes, auto-commits the
//! working tree, analyzes batches for infrastructure-significant changes
//! (compose services, leaked credentials, new stack directories), writes
//! a structured changelog ledger, and feeds each batch back into the
//! session queue. A separate drop-zone watcher turns newly arrived
//! transcript files into checkpoints.

pub mod compose;
pub mod credentials;
pub mod detector;
pub mod ignore;
pub mod watcher;

pub use compose::{parse_compose, ComposeService};
pub use credentials::{scan_content, scan_diff_lines, CredentialAlert};
pub use detector::{analyze_changes, BatchAnalysis};
pub use watcher::{CheckpointSink, InfraWatcher, TranscriptCheckpoint, WatcherStats};
