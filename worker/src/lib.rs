//! Engram session worker
//!
//! The single consumer of the session queue. Drains entries in FIFO
//! order, rate-limited, and runs each session through the model-mediated
//! pipeline: summarize, triage, archive, extract entities, compress the
//! master context (guarded by the integrity checker), then periodic
//! pattern/nudge/anomaly analyses. Idle time triggers the daily backup
//! and retention sweep.

pub mod processor;
pub mod queue;

pub use processor::{Worker, WorkerDeps, WorkerStatus};
pub use queue::{QueueEntry, SessionQueue};
