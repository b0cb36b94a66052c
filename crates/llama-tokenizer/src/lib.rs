//! # llama-tokenizer
//!
//! Deterministic tokenization for llama.rs sessions.
//!
//! This crate provides:
//! - A `Tokenizer` trait with explicit `add_bos` / `special` switches
//! - A reference whitespace tokenizer with reserved BOS/EOS/newline ids for testing
//! - Streaming decoding via [`DecodingState`]
//! - [`tokens_end_with_any`], the stop-string test used by interactive turns

use std::collections::HashMap;
use std::sync::RwLock;

use llama_engine::TokenId;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Core tokenizer trait. Implementations can be swapped without changing app code.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token IDs.
    ///
    /// `add_bos` prepends the BOS sentinel when the vocabulary has one.
    /// `special` allows control-token spellings (e.g. `</s>`) to map to their
    /// special ids instead of being treated as plain text.
    fn encode(&self, text: &str, add_bos: bool, special: bool) -> TokenizerResult<Vec<TokenId>>;

    /// Decode a complete sequence of tokens into text.
    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String>;

    /// Decode a single token, accumulating into `state`.
    /// For streaming decoding, this allows emitting printable text immediately.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String>;

    /// Get vocabulary size.
    fn vocab_size(&self) -> usize;
}

/// Streaming decoding state.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    emitted_any: bool,
    after_newline: bool,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.emitted_any = false;
        self.after_newline = false;
    }
}

/// Whether the detokenized `tokens` end with any non-empty string in `stops`.
pub fn tokens_end_with_any(
    tokenizer: &dyn Tokenizer,
    tokens: &[TokenId],
    stops: &[String],
) -> TokenizerResult<bool> {
    if tokens.is_empty() || stops.iter().all(|s| s.is_empty()) {
        return Ok(false);
    }
    let text = tokenizer.decode(tokens)?;
    Ok(stops.iter().any(|s| !s.is_empty() && text.ends_with(s.as_str())))
}

/// BOS id of the reference tokenizer.
pub const WS_BOS: TokenId = 0;
/// EOS id of the reference tokenizer.
pub const WS_EOS: TokenId = 1;
/// Newline id of the reference tokenizer.
pub const WS_NEWLINE: TokenId = 2;

const BOS_TEXT: &str = "<s>";
const EOS_TEXT: &str = "</s>";

/// Reference whitespace tokenizer.
///
/// - Splits each line on whitespace; every `\n` becomes the newline token
/// - Ids 0..=2 are reserved for BOS, EOS and newline
/// - Unknown words get fresh ids on first sight (deterministic per instance)
/// - Used by tests in place of a real vocabulary
pub struct WhitespaceTokenizer {
    state: RwLock<VocabState>,
}

#[derive(Debug)]
struct VocabState {
    vocab: HashMap<TokenId, String>,
    reverse_vocab: HashMap<String, TokenId>,
    next_id: TokenId,
}

impl Default for VocabState {
    fn default() -> Self {
        Self {
            vocab: HashMap::new(),
            reverse_vocab: HashMap::new(),
            next_id: WS_NEWLINE + 1,
        }
    }
}

impl VocabState {
    fn intern(&mut self, word: &str) -> TokenId {
        if let Some(id) = self.reverse_vocab.get(word) {
            return *id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.reverse_vocab.insert(word.to_string(), id);
        self.vocab.insert(id, word.to_string());
        id
    }
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(VocabState::default()),
        }
    }

    /// Text of a token; special tokens render as the empty string, newline as `\n`.
    fn piece(&self, token: TokenId) -> TokenizerResult<String> {
        match token {
            WS_BOS | WS_EOS => Ok(String::new()),
            WS_NEWLINE => Ok("\n".to_string()),
            _ => {
                let state = self.state.read().map_err(|_| {
                    TokenizerError::DecodingError("tokenizer lock poisoned".to_string())
                })?;
                state
                    .vocab
                    .get(&token)
                    .cloned()
                    .ok_or(TokenizerError::InvalidToken(token))
            }
        }
    }
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str, add_bos: bool, special: bool) -> TokenizerResult<Vec<TokenId>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| TokenizerError::EncodingError("tokenizer lock poisoned".to_string()))?;

        let mut ids = Vec::new();
        if add_bos {
            ids.push(WS_BOS);
        }

        for (i, line) in text.split('\n').enumerate() {
            if i > 0 {
                ids.push(WS_NEWLINE);
            }
            for word in line.split_whitespace() {
                let id = match word {
                    BOS_TEXT if special => WS_BOS,
                    EOS_TEXT if special => WS_EOS,
                    _ => state.intern(word),
                };
                ids.push(id);
            }
        }

        Ok(ids)
    }

    fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut state = DecodingState::new();
        for &id in tokens {
            self.decode_token(id, &mut state)?;
        }
        Ok(state.buffer)
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> TokenizerResult<String> {
        let piece = self.piece(token)?;
        let emitted = if piece.is_empty() {
            piece
        } else if piece == "\n" {
            state.after_newline = true;
            piece
        } else if state.emitted_any && !state.after_newline {
            state.emitted_any = true;
            format!(" {}", piece)
        } else {
            state.emitted_any = true;
            state.after_newline = false;
            piece
        };
        state.buffer.push_str(&emitted);
        Ok(emitted)
    }

    fn vocab_size(&self) -> usize {
        let interned = self.state.read().map(|s| s.vocab.len()).unwrap_or(0);
        interned + 3
    }
}
