//! # llama-session
//!
//! Stateful interactive generation over a fixed-size context window.
//!
//! This crate owns what the engine does not:
//! - **Session state**: token history, consumed/resident counters, the recent-token window
//! - **Context shift**: evicting the middle of the resident set when it overflows
//! - **Prefix reuse**: skipping work already recorded in a session cache file
//! - **Embedding splicing**: placing image embeddings between text segments
//! - **Generation loop**: [`InteractiveExecutor`], one turn per `infer` call
//! - **Persistence**: versioned snapshots that resume a conversation exactly
//!
//! The engine, tokenizer and sampler are reached only through the
//! `llama-engine`, `llama-tokenizer` and `llama-sampling` contracts.
//!
//! ```no_run
//! # use llama_session::*;
//! # fn demo<E: llama_engine::LlamaEngine, T: llama_tokenizer::Tokenizer>(engine: E, tokenizer: T) -> Result<()> {
//! let mut chat = InteractiveExecutor::new(engine, tokenizer, ExecutorConfig::default());
//! let params = InferenceParams {
//!     antiprompts: vec!["User:".into()],
//!     max_tokens: Some(256),
//!     ..Default::default()
//! };
//! let turn = chat.infer(Some("Transcript of a chat.\nUser: hi\nBot:"), &params)?;
//! println!("{}", turn.text);
//! chat.infer(Some("tell me more"), &params)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod persist;
pub mod prefix;
pub mod session_file;
pub mod splice;
pub mod state;

pub use config::{ExecutorConfig, InferenceParams};
pub use context::{keep_length, ContextWindow};
pub use error::{ConfigError, Result, SessionError};
pub use executor::{InteractiveExecutor, StopReason, Turn, END_OF_TEXT};
pub use persist::{restore, snapshot, ExecutorState, STATE_VERSION};
pub use prefix::matched_length;
pub use session_file::SessionFile;
pub use splice::{splice, InsertionRecord, Splice};
pub use state::{LoopState, Phase, RecentWindow, SessionState};
