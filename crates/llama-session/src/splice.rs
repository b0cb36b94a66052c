//! Embedding splicer: splits text around a placeholder so an out-of-band
//! embedding can be evaluated between the two token segments.
//!
//! Only the first marker is honoured; later markers stay in the text.

use llama_engine::{EmbeddingHandle, TokenId};
use llama_tokenizer::{Tokenizer, TokenizerResult};

/// A computed embedding waiting to be made resident after `position`
/// tokens of its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionRecord {
    pub position: usize,
    pub handle: EmbeddingHandle,
}

/// Tokenized text plus the offset where the marker was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub tokens: Vec<TokenId>,
    pub insertion: Option<usize>,
}

impl Splice {
    /// Pair every handle with the insertion offset, shifted by `base`
    /// (the length of the input the tokens are appended to).
    pub fn records(&self, base: usize, handles: Vec<EmbeddingHandle>) -> Vec<InsertionRecord> {
        match self.insertion {
            Some(position) => handles
                .into_iter()
                .map(|handle| InsertionRecord {
                    position: base + position,
                    handle,
                })
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Tokenize `text`, splitting on the first `marker`.
///
/// The pre-segment may carry BOS; the post-segment never does.
pub fn splice(
    tokenizer: &dyn Tokenizer,
    text: &str,
    marker: &str,
    add_bos: bool,
) -> TokenizerResult<Splice> {
    let Some(at) = (!marker.is_empty()).then(|| text.find(marker)).flatten() else {
        return Ok(Splice {
            tokens: tokenizer.encode(text, add_bos, true)?,
            insertion: None,
        });
    };

    let mut tokens = tokenizer.encode(&text[..at], add_bos, true)?;
    let position = tokens.len();
    tokens.extend(tokenizer.encode(&text[at + marker.len()..], false, true)?);
    Ok(Splice {
        tokens,
        insertion: Some(position),
    })
}
