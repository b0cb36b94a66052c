//! Versioned snapshot of [`SessionState`].
//!
//! The blob is JSON. Unknown fields are ignored so newer writers stay
//! readable, but every known field is required: a partial blob is rejected
//! instead of being filled with defaults.

use std::path::PathBuf;

use llama_engine::TokenId;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::state::{RecentWindow, SessionState};

pub const STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorState {
    pub version: u32,
    pub input_tokens: Vec<TokenId>,
    pub consumed: usize,
    pub resident: usize,
    pub recent_tokens: Vec<TokenId>,
    pub recent_capacity: usize,
    pub cached_prefix_length: usize,
    pub pending: Vec<TokenId>,
    pub session_tokens: Vec<TokenId>,
    pub session_consumed: usize,
    #[serde(deserialize_with = "required")]
    pub mirostat_mu: Option<f32>,
    #[serde(deserialize_with = "required")]
    pub rng_state: Option<u64>,
    #[serde(deserialize_with = "required")]
    pub session_path: Option<PathBuf>,
    pub is_prompt_run: bool,
}

/// Makes an `Option` field mandatory (it may still be `null`).
fn required<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer)
}

impl ExecutorState {
    pub fn snapshot(state: &SessionState) -> Self {
        Self {
            version: STATE_VERSION,
            input_tokens: state.input_tokens.clone(),
            consumed: state.consumed,
            resident: state.resident,
            recent_tokens: state.recent.to_vec(),
            recent_capacity: state.recent.capacity(),
            cached_prefix_length: state.cached_prefix_length,
            pending: state.pending.clone(),
            session_tokens: state.session_tokens.clone(),
            session_consumed: state.session_consumed,
            mirostat_mu: state.mirostat_mu,
            rng_state: state.rng_state,
            session_path: state.session_path.clone(),
            is_prompt_run: state.is_prompt_run,
        }
    }

    /// Validate and rebuild the session state.
    pub fn restore(self) -> Result<SessionState, ConfigError> {
        if self.version != STATE_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                expected: STATE_VERSION,
            });
        }
        let malformed = |what: &str| Err(ConfigError::MalformedState(what.to_string()));
        if self.consumed > self.input_tokens.len() {
            return malformed("consumed exceeds input length");
        }
        if self.recent_tokens.len() > self.recent_capacity {
            return malformed("recent window exceeds its capacity");
        }
        if self.session_consumed > self.session_tokens.len() {
            return malformed("session consumed exceeds session tokens");
        }
        if self.cached_prefix_length > self.session_tokens.len().min(self.input_tokens.len()) {
            return malformed("cached prefix longer than its sequences");
        }
        let n = self.cached_prefix_length;
        if self.session_tokens[..n] != self.input_tokens[..n] {
            return malformed("cached prefix differs from the input");
        }

        Ok(SessionState {
            input_tokens: self.input_tokens,
            consumed: self.consumed,
            resident: self.resident,
            recent: RecentWindow::with_tokens(self.recent_capacity, self.recent_tokens),
            cached_prefix_length: self.cached_prefix_length,
            pending: self.pending,
            session_tokens: self.session_tokens,
            session_consumed: self.session_consumed,
            mirostat_mu: self.mirostat_mu,
            rng_state: self.rng_state,
            session_path: self.session_path,
            is_prompt_run: self.is_prompt_run,
        })
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec(self).map_err(|e| ConfigError::MalformedState(e.to_string()))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(blob).map_err(|e| ConfigError::MalformedState(e.to_string()))
    }
}

/// Serialize a session state to a blob.
pub fn snapshot(state: &SessionState) -> Result<Vec<u8>, ConfigError> {
    ExecutorState::snapshot(state).to_blob()
}

/// Rebuild a session state from a blob produced by [`snapshot`].
pub fn restore(blob: &[u8]) -> Result<SessionState, ConfigError> {
    ExecutorState::from_blob(blob)?.restore()
}
