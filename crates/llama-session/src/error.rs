//! Error taxonomy for generation sessions.

use llama_engine::{DecodeStatus, LlamaError};
use llama_sampling::SamplingError;
use llama_tokenizer::TokenizerError;

/// Fatal configuration problems. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("context capacity {capacity} is smaller than the kept prefix of {keep} tokens")]
    CapacityBelowKeep { capacity: usize, keep: usize },

    #[error("no valid context shift: {resident} resident + {pending} pending > {capacity} after {iterations} shift(s)")]
    NoValidShift {
        resident: usize,
        pending: usize,
        capacity: usize,
        iterations: usize,
    },

    #[error("a prompt is required on the first turn")]
    MissingPrompt,

    #[error("malformed state blob: {0}")]
    MalformedState(String),

    #[error("unsupported state version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("incompatible session file: {0}")]
    SessionFile(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine rejected a batch. The turn was abandoned; the session can
    /// be driven again.
    #[error("decode failed ({status}) at position {position}")]
    Decode {
        status: DecodeStatus,
        position: usize,
    },

    #[error(transparent)]
    Engine(#[from] LlamaError),

    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the caller may simply invoke the session again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::Decode { .. })
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
