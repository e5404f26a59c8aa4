//! Error taxonomy for the guiding core.
//!
//! Failure modes that the orchestrator can recover from inline (an invalid
//! sample, a refused split) are tallied as counters on `AsmFittingStatistics`
//! rather than raised here; a `GuideError` is reserved for what actually
//! propagates through a `Result` to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuideError {
    /// All components' responsibility mass a_k fell below epsilon, or the
    /// log-likelihood went non-finite. The caller rolls the mixture back to
    /// its pre-batch snapshot.
    #[error("numeric degeneracy during EM: {reason}")]
    NumericDegeneracy { reason: &'static str },

    /// Post-update validity check failed. Fatal: the region is unusable
    /// until re-initialised by the external Field.
    #[error("mixture or statistics failed validation after update: {reason}")]
    CorruptedState { reason: &'static str },

    /// Deserialised state failed its sanity bounds. Fatal for that file.
    #[error("deserialized state failed sanity bounds: {reason}")]
    SerializationMismatch { reason: String },

    /// I/O failure while reading/writing the binary wire formats.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GuideError>;
