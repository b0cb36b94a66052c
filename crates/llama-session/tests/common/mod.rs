//! Shared mocks for llama-session integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use llama_engine::*;
use llama_kv::KvCells;
use llama_sampling::{SamplingParams, SamplingPipeline, SamplingResult};
use llama_session::InferenceParams;
use llama_tokenizer::{Tokenizer, WhitespaceTokenizer, WS_BOS, WS_EOS, WS_NEWLINE};

pub const VOCAB: usize = 256;
/// Token written into the cache for each embedding position.
pub const IMAGE_TOKEN: TokenId = 200;

/// Install a test subscriber once; `RUST_LOG=debug` shows the loop trace.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A bigram "model" over a real cell table.
///
/// After every successful advance the logits favour `next[last token]`
/// (or `fallback`), so greedy sampling follows the table exactly.
pub struct ScriptedEngine {
    pub cells: KvCells,
    pub batch: usize,
    pub next: HashMap<TokenId, TokenId>,
    pub fallback: TokenId,
    pub logits: Vec<f32>,
    /// Every batch handed to `advance`, with its start position.
    pub advances: Vec<(usize, Vec<TokenId>)>,
    /// Scripted failures: status plus how many tokens still become resident.
    pub failures: VecDeque<(DecodeStatus, usize)>,
    /// Whether `save_state` / `restore_state` are supported.
    pub snapshots: bool,
    /// When non-empty, every advance yields equal logits over these tokens
    /// instead of following `next`.
    pub spread: Vec<TokenId>,
}

impl ScriptedEngine {
    pub fn new(ctx: usize, batch: usize) -> Self {
        Self {
            cells: KvCells::new(ctx),
            batch,
            next: HashMap::new(),
            fallback: WS_NEWLINE,
            logits: Vec::new(),
            advances: Vec::new(),
            failures: VecDeque::new(),
            snapshots: false,
            spread: Vec::new(),
        }
    }

    /// Chain `words` so each one predicts the following one.
    pub fn chain(&mut self, words: &[TokenId]) {
        for pair in words.windows(2) {
            self.next.insert(pair[0], pair[1]);
        }
    }

    fn predict(&mut self, last: TokenId) {
        if !self.spread.is_empty() {
            let mut logits = vec![-100.0; VOCAB];
            for &t in &self.spread {
                logits[t as usize] = 0.0;
            }
            self.logits = logits;
            return;
        }
        let target = self.next.get(&last).copied().unwrap_or(self.fallback);
        let mut logits = vec![0.0; VOCAB];
        logits[target as usize] = 10.0;
        self.logits = logits;
    }
}

impl KvCacheOps for ScriptedEngine {
    fn drop_range(&mut self, seq: SeqId, from: usize, to: Option<usize>) -> bool {
        self.cells.drop_range(seq, from, to)
    }

    fn shift_positions(&mut self, seq: SeqId, from: usize, to: Option<usize>, delta: isize) {
        self.cells.shift_positions(seq, from, to, delta)
    }

    fn clear_all(&mut self) {
        self.cells.clear_all()
    }

    fn resident_cells(&self) -> usize {
        self.cells.resident_cells()
    }

    fn refresh_after_drop(&mut self) {
        self.cells.refresh_after_drop()
    }
}

impl LlamaEngine for ScriptedEngine {
    fn context_size(&self) -> usize {
        self.cells.capacity()
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: Some(WS_BOS),
            eos: WS_EOS,
            newline: WS_NEWLINE,
            add_bos: true,
        }
    }

    fn advance(&mut self, tokens: &[TokenId], seq: SeqId, start: usize) -> AdvanceOutcome {
        self.advances.push((start, tokens.to_vec()));

        if let Some((status, made)) = self.failures.pop_front() {
            let made = made.min(tokens.len());
            let _ = self.cells.occupy(seq, start, &tokens[..made]);
            return AdvanceOutcome {
                status,
                batch_size: tokens.len(),
                new_position: start + made,
            };
        }

        match self.cells.occupy(seq, start, tokens) {
            Ok(()) => {
                if let Some(&last) = tokens.last() {
                    self.predict(last);
                }
                AdvanceOutcome {
                    status: DecodeStatus::Ok,
                    batch_size: tokens.len(),
                    new_position: start + tokens.len(),
                }
            }
            Err(_) => AdvanceOutcome {
                status: DecodeStatus::NoKvSlot,
                batch_size: tokens.len(),
                new_position: start,
            },
        }
    }

    fn last_logits(&self) -> Result<&[f32]> {
        if self.logits.is_empty() {
            return Err(LlamaError::Inference("no logits yet".into()));
        }
        Ok(&self.logits)
    }

    fn save_state(&self) -> Option<Vec<u8>> {
        if !self.snapshots {
            return None;
        }
        let bytes = self
            .cells
            .tokens(SeqId::ZERO)
            .iter()
            .flat_map(|t| t.to_le_bytes())
            .collect();
        Some(bytes)
    }

    fn restore_state(&mut self, blob: &[u8]) -> Result<bool> {
        if !self.snapshots {
            return Ok(false);
        }
        let tokens: Vec<TokenId> = blob
            .chunks_exact(4)
            .map(|c| TokenId::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.cells.clear();
        self.cells
            .occupy(SeqId::ZERO, 0, &tokens)
            .map_err(|e| LlamaError::State(e.to_string()))?;
        if let Some(&last) = tokens.last() {
            self.predict(last);
        }
        Ok(true)
    }
}

/// Embedding provider that fills `n_positions` cells with [`IMAGE_TOKEN`].
pub struct FakeProjector {
    pub n_positions: usize,
    pub evaluated: Arc<Mutex<Vec<(u64, usize)>>>,
}

impl EmbeddingProvider for FakeProjector {
    fn create_from_image(&mut self, image: &[u8]) -> Result<EmbeddingHandle> {
        if image.is_empty() {
            return Err(LlamaError::Embedding("empty image".into()));
        }
        Ok(EmbeddingHandle {
            id: image.len() as u64,
            n_positions: self.n_positions,
        })
    }

    fn evaluate(
        &mut self,
        engine: &mut dyn LlamaEngine,
        handle: &EmbeddingHandle,
        seq: SeqId,
        position: &mut usize,
    ) -> Result<()> {
        let fill = vec![IMAGE_TOKEN; handle.n_positions];
        let outcome = engine.advance(&fill, seq, *position);
        if !outcome.is_ok() {
            return Err(LlamaError::Embedding(outcome.status.to_string()));
        }
        if let Ok(mut log) = self.evaluated.lock() {
            log.push((handle.id, *position));
        }
        *position = outcome.new_position;
        Ok(())
    }
}

/// Greedy pipeline that records every accepted token.
pub struct RecordingPipeline {
    pub accepted: Arc<Mutex<Vec<TokenId>>>,
}

impl SamplingPipeline for RecordingPipeline {
    fn sample(&mut self, logits: &[f32], _recent: &[TokenId]) -> SamplingResult<TokenId> {
        let best = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i as TokenId)
            .unwrap();
        Ok(best)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.lock().unwrap().push(token);
    }
}

/// Greedy parameters with a finite budget.
pub fn greedy(max_tokens: usize, antiprompts: &[&str]) -> InferenceParams {
    InferenceParams {
        max_tokens: Some(max_tokens),
        antiprompts: antiprompts.iter().map(|s| s.to_string()).collect(),
        sampling: SamplingParams {
            temperature: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Intern `text` and return its ids (no BOS).
pub fn ids(tok: &WhitespaceTokenizer, text: &str) -> Vec<TokenId> {
    tok.encode(text, false, true).unwrap()
}

pub fn id(tok: &WhitespaceTokenizer, word: &str) -> TokenId {
    ids(tok, word)[0]
}
