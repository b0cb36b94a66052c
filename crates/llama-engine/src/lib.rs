//! # llama-engine
//!
//! The "narrow waist" of the llama.rs session stack. Defines the contracts a
//! generation session drives: advancing the resident set, manipulating the KV
//! cache, evaluating out-of-band embeddings and loading weights. Backends
//! (CPU reference, Metal, FFI) implement these traits; the session layer never
//! sees tensors.
//!
//! ## Design Notes
//!
//! ### Exclusive Ownership
//! Unlike a shared server engine, a context here belongs to exactly one
//! conversation. All cache mutations (advance, drop, shift, clear) therefore
//! take `&mut self` and are issued as one serialized call sequence. Independent
//! conversations run in parallel by owning independent contexts.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

pub mod weights;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use weights::{load_weights, load_weights_async, LoadError, LoraAdapter, ModelParams, WeightLoader};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Identifier of a sequence inside an engine context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqId(pub i32);

impl SeqId {
    /// The sequence every single-conversation context uses.
    pub const ZERO: SeqId = SeqId(0);
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error("Engine state rejected: {0}")]
    State(String),
}

/// Status reported by a single [`LlamaEngine::advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStatus {
    Ok,
    /// No free KV slot for the batch (the context is full or fragmented).
    NoKvSlot,
    /// The batch itself was rejected (empty, too large, bad positions).
    InvalidBatch,
    /// The backend aborted the computation.
    Aborted,
    /// Any other backend failure.
    ComputeFailed,
}

impl DecodeStatus {
    pub fn is_ok(self) -> bool {
        self == DecodeStatus::Ok
    }
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeStatus::Ok => write!(f, "ok"),
            DecodeStatus::NoKvSlot => write!(f, "no kv slot"),
            DecodeStatus::InvalidBatch => write!(f, "invalid batch"),
            DecodeStatus::Aborted => write!(f, "aborted"),
            DecodeStatus::ComputeFailed => write!(f, "compute failed"),
        }
    }
}

/// Result of advancing the resident set by one batch.
///
/// `new_position` is the only ground truth for how far the resident set moved.
/// Callers must not infer it from `status`: a failed call may still have made
/// part of the batch resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceOutcome {
    pub status: DecodeStatus,
    /// Number of tokens submitted in the batch.
    pub batch_size: usize,
    /// Position after the call (first free position of the sequence).
    pub new_position: usize,
}

impl AdvanceOutcome {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Fixed marker tokens of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Beginning-of-sequence sentinel, if the vocabulary has one.
    pub bos: Option<TokenId>,
    /// End-of-sequence marker.
    pub eos: TokenId,
    /// Token standing in for a line break.
    pub newline: TokenId,
    /// Whether this model family requires the BOS sentinel to stay resident.
    pub add_bos: bool,
}

/// KV cache manipulation contract.
///
/// Positions are absolute token positions within a sequence. Ranges are
/// half-open; `to = None` means "to the end of the sequence".
pub trait KvCacheOps {
    /// Remove cells of `seq` whose position lies in `[from, to)`.
    fn drop_range(&mut self, seq: SeqId, from: usize, to: Option<usize>) -> bool;

    /// Add `delta` to the position of every cell of `seq` in `[from, to)`.
    fn shift_positions(&mut self, seq: SeqId, from: usize, to: Option<usize>, delta: isize);

    /// Remove every cell of every sequence.
    fn clear_all(&mut self);

    /// Number of occupied cells.
    fn resident_cells(&self) -> usize;

    /// Apply deferred work queued by drops and shifts (e.g. RoPE re-rotation).
    fn refresh_after_drop(&mut self);
}

/// The core engine trait a session drives.
pub trait LlamaEngine: KvCacheOps + Send {
    /// Maximum number of resident positions.
    fn context_size(&self) -> usize;

    /// Maximum number of tokens accepted by one [`advance`](Self::advance) call.
    fn batch_size(&self) -> usize;

    /// Marker tokens of the loaded model.
    fn special_tokens(&self) -> SpecialTokens;

    /// Make `tokens` resident in `seq` starting at position `start`.
    fn advance(&mut self, tokens: &[TokenId], seq: SeqId, start: usize) -> AdvanceOutcome;

    /// Logits for the last position of the most recent successful advance.
    fn last_logits(&self) -> Result<&[f32]>;

    /// Opaque snapshot of the cache contents, if the backend supports it.
    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }

    /// Restore a blob produced by [`save_state`](Self::save_state).
    ///
    /// Returns `Ok(false)` when the backend cannot restore state at all.
    fn restore_state(&mut self, _blob: &[u8]) -> Result<bool> {
        Ok(false)
    }
}

/// Opaque reference to a computed non-text embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingHandle {
    pub id: u64,
    /// Number of resident positions the embedding occupies once evaluated.
    pub n_positions: usize,
}

/// Producer of out-of-band embeddings (e.g. a CLIP projector for images).
pub trait EmbeddingProvider: Send {
    /// Compute an embedding from raw image bytes.
    fn create_from_image(&mut self, image: &[u8]) -> Result<EmbeddingHandle>;

    /// Append `handle` to the resident set of `seq` at `*position`.
    ///
    /// Advances `*position` past the embedding on success.
    fn evaluate(
        &mut self,
        engine: &mut dyn LlamaEngine,
        handle: &EmbeddingHandle,
        seq: SeqId,
        position: &mut usize,
    ) -> Result<()>;
}
