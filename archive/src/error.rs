//! Typed archive failures.

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("vector store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vector store returned HTTP {0}")]
    Status(u16),

    #[error("vector store response undecodable: {0}")]
    Decode(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}
