//! Engram HTTP surface
//!
//! JSON-over-HTTP ingest and admin API in front of the memory pipeline,
//! plus the composition root that wires the collaborators together. The
//! tool-protocol bridge is a thin client of this surface.

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod ops;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
