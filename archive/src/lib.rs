//! Engram vector archive
//!
//! Semantic storage tier: eight named collections of `(id, text,
//! metadata)` documents with nearest-neighbor search. The backend is any
//! [`VectorStore`]; production uses the Chroma-compatible HTTP backend,
//! tests and standalone deployments the in-memory one.
//!
//! The [`Archive`] wrapper layers the domain rules on top: metadata
//! cleaning, pre-write snapshots, recent-session ordering, relevance
//! thresholds, health reporting, and retention pruning.

pub mod archive;
pub mod chroma;
pub mod error;
pub mod memory;
pub mod retention;
pub mod store;
pub mod types;

pub use archive::{Archive, COLLECTION_NAMES};
pub use chroma::ChromaHttpStore;
pub use error::ArchiveError;
pub use memory::MemoryStore;
pub use retention::{run_retention, PruneReport};
pub use store::VectorStore;
pub use types::{clean_metadata, relevance, DocumentPage, SearchHit, StoredDocument};
