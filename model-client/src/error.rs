//! Typed model-call failures.

/// Failure modes of an outbound model call. The worker maps these into
/// pipeline outcomes instead of catching broad error bases.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The circuit breaker is open; no call was attempted and no failure
    /// was recorded.
    #[error("model circuit breaker open")]
    CircuitOpen,

    #[error("model API key not configured")]
    NotConfigured,

    #[error("model transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model returned HTTP {0}")]
    Status(u16),

    #[error("model response undecodable: {0}")]
    Decode(String),

    /// The model produced no usable structured output, even after the
    /// escalation retry.
    #[error("model returned no usable result for {task}")]
    Unusable { task: &'static str },
}

impl ModelError {
    /// Whether this failure already went through the breaker bookkeeping.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ModelError::CircuitOpen)
    }
}
