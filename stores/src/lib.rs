//! Engram durable stores
//!
//! Everything that persists outside the vector archive:
//! - Session records on cold storage (`sessions/{id}.json`)
//! - The master-context document (local file + optional external KB)
//! - Compressed, deduplicated conversation transcripts
//! - TTL'd nudge and anomaly advisories
//! - Backup creation/restore with optional object-store mirroring
//! - The outbound alert channel

pub mod advisories;
pub mod alerts;
pub mod backup;
pub mod context;
pub mod sessions;
pub mod transcripts;

pub use advisories::{
    AdvisoryStats, AnomalyStore, NudgeStore, StoredAnomaly, StoredNudge, MAX_ACTIVE_ANOMALIES,
    MAX_ACTIVE_NUDGES,
};
pub use alerts::{mask_value, AlertChannel};
pub use backup::{BackupListing, BackupManager, BackupSummary};
pub use context::{ContextStore, ContextStoreError};
pub use sessions::{
    generate_session_id, session_filename, ProcessedMarker, SessionRecord, SessionStore,
    Significance,
};
pub use transcripts::{truncate_for_model, TranscriptInfo, TranscriptStore, TranscriptWrite};
