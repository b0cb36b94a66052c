//! Per-turn and per-conversation configuration.
//!
//! Both structs deserialize from JSON with every field optional.

use llama_sampling::SamplingParams;
use serde::{Deserialize, Serialize};

/// Parameters of a single inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    /// Tokens kept at the front of the context on a shift.
    /// `None` (or a value past the input length) keeps the whole input.
    #[serde(default)]
    pub tokens_keep: Option<usize>,

    /// Generation budget per turn. `None` is unbounded.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<usize>,

    /// Stop strings. The first one is also forced as input after an end marker.
    #[serde(default)]
    pub antiprompts: Vec<String>,

    /// Window of recent tokens the penalties look at. `None` = context size.
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: Option<usize>,

    /// Manual sampler configuration, used when no pipeline is attached.
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Upper bound on tokens discarded by a single context shift.
    #[serde(default)]
    pub shift_discard_limit: Option<usize>,
}

fn default_max_tokens() -> Option<usize> {
    None
}
fn default_repeat_last_n() -> Option<usize> {
    Some(64)
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            tokens_keep: None,
            max_tokens: default_max_tokens(),
            antiprompts: Vec::new(),
            repeat_last_n: default_repeat_last_n(),
            sampling: SamplingParams::default(),
            shift_discard_limit: None,
        }
    }
}

/// Settings fixed for the lifetime of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Prepend the BOS sentinel when tokenizing the first prompt.
    #[serde(default = "default_add_bos")]
    pub add_bos_to_prompt: bool,

    /// Capacity of the recent-token window. `None` = context size.
    #[serde(default)]
    pub recent_window: Option<usize>,

    /// Placeholder marking where an image embedding goes.
    #[serde(default = "default_image_marker")]
    pub image_marker: String,

    /// Hard cap on consecutive shifts before giving up.
    #[serde(default = "default_max_shift_iterations")]
    pub max_shift_iterations: usize,
}

fn default_add_bos() -> bool {
    true
}
fn default_image_marker() -> String {
    "<image>".to_string()
}
fn default_max_shift_iterations() -> usize {
    64
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            add_bos_to_prompt: default_add_bos(),
            recent_window: None,
            image_marker: default_image_marker(),
            max_shift_iterations: default_max_shift_iterations(),
        }
    }
}
