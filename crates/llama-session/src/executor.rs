//! Interactive executor: the generation loop of one conversation.
//!
//! Each call to [`InteractiveExecutor::infer`] is one turn. The first turn
//! feeds the prompt; later turns append user text (or nothing, to continue)
//! and generate until a stop string, the end marker or the turn budget.
//!
//! A step either makes the pending batch resident and samples the next
//! token, or moves the next batch of input into `pending`. Context shifts
//! happen right before the engine is called, so the resident set never
//! exceeds the engine's capacity.

use std::path::{Path, PathBuf};

use llama_engine::{EmbeddingHandle, EmbeddingProvider, LlamaEngine, SeqId, TokenId};
use llama_sampling::{apply_penalties, sample_distribution, SamplingPipeline, SeededRng};
use llama_tokenizer::{tokens_end_with_any, DecodingState, Tokenizer};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{ExecutorConfig, InferenceParams};
use crate::context::{keep_length, ContextWindow};
use crate::error::{ConfigError, Result, SessionError};
use crate::persist;
use crate::prefix::matched_length;
use crate::session_file::SessionFile;
use crate::splice::{splice, InsertionRecord};
use crate::state::{LoopState, Phase, SessionState};

/// Emitted when the end marker terminates a turn.
pub const END_OF_TEXT: &str = " [end of text]\n";

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A stop string matched; the session waits for user input.
    StopString,
    /// The end marker was produced.
    EndOfText,
    /// The turn's token budget ran out.
    Budget,
}

/// Output of one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub text: String,
    /// Sampled tokens, after end-marker substitution.
    pub tokens: Vec<TokenId>,
    pub stop: StopReason,
}

impl Turn {
    pub fn phase(&self) -> Phase {
        match self.stop {
            StopReason::EndOfText => Phase::Terminated,
            StopReason::StopString | StopReason::Budget => Phase::WaitingForInput,
        }
    }
}

/// Embeddings bound to an offset of the pending batch.
#[derive(Debug)]
struct Staged {
    offset: usize,
    handles: Vec<EmbeddingHandle>,
}

pub struct InteractiveExecutor<E, T> {
    id: Uuid,
    engine: E,
    tokenizer: T,
    config: ExecutorConfig,
    state: SessionState,
    pipeline: Option<Box<dyn SamplingPipeline>>,
    embeddings: Option<Box<dyn EmbeddingProvider>>,
    images: Vec<Vec<u8>>,
    insertions: Vec<InsertionRecord>,
    staged: Option<Staged>,
    decoder: DecodingState,
}

impl<E: LlamaEngine, T: Tokenizer> InteractiveExecutor<E, T> {
    pub fn new(engine: E, tokenizer: T, config: ExecutorConfig) -> Self {
        let window = config
            .recent_window
            .unwrap_or_else(|| engine.context_size());
        Self {
            id: Uuid::new_v4(),
            engine,
            tokenizer,
            config,
            state: SessionState::new(window),
            pipeline: None,
            embeddings: None,
            images: Vec::new(),
            insertions: Vec::new(),
            staged: None,
            decoder: DecodingState::new(),
        }
    }

    /// Sample with `pipeline` instead of the penalty-then-sample path.
    pub fn with_pipeline(mut self, pipeline: Box<dyn SamplingPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Route input through the embedding splicer.
    pub fn with_embeddings(mut self, provider: Box<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }

    /// Queue an image for the next input containing the image marker.
    pub fn add_image(&mut self, image: Vec<u8>) {
        self.images.push(image);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Attach a session cache file.
    ///
    /// An existing file is loaded and its engine snapshot restored; the
    /// tokens are matched against the prompt on the first turn. A missing
    /// file is created on the first sampling step.
    pub fn with_session_cache(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        if path.exists() {
            let file = SessionFile::load(&path)?;
            info!(path = %path.display(), tokens = file.tokens.len(), "loading session cache");
            let restored =
                !file.engine_state.is_empty() && self.engine.restore_state(&file.engine_state)?;
            if restored {
                self.state.session_tokens = file.tokens;
            } else {
                warn!(path = %path.display(), "engine could not restore the cached state, prefix reuse disabled");
                self.state.session_tokens.clear();
            }
        } else {
            warn!(path = %path.display(), "session cache does not exist, will create");
        }
        self.state.session_consumed = 0;
        self.state.session_path = Some(path);
        Ok(())
    }

    /// Run one turn and collect its output.
    pub fn infer(&mut self, text: Option<&str>, params: &InferenceParams) -> Result<Turn> {
        self.infer_with(text, params, |_| {})
    }

    /// Run one turn, handing each decoded piece to `on_piece` as it is produced.
    ///
    /// `text` is required on the first turn; afterwards `None` continues
    /// generation without new input. A [`SessionError::Decode`] abandons the
    /// turn but leaves the session resumable with another call.
    pub fn infer_with(
        &mut self,
        text: Option<&str>,
        params: &InferenceParams,
        mut on_piece: impl FnMut(&str),
    ) -> Result<Turn> {
        let span = info_span!("infer", conversation = %self.id);
        let _guard = span.enter();

        let mut lp = LoopState::new(params.max_tokens);
        self.preprocess(text, &mut lp)?;
        self.decoder.clear();

        let eos = self.engine.special_tokens().eos;
        let mut out_text = String::new();
        let mut out_tokens = Vec::new();
        let mut stop = None;

        while (lp.budget_left() && !lp.waiting_for_input) || self.state.is_prompt_run {
            debug!(phase = ?self.phase(&lp), resident = self.state.resident, "step");

            if let Some(token) = self.step(params, &mut lp)? {
                let piece = self.tokenizer.decode_token(token, &mut self.decoder)?;
                on_piece(&piece);
                out_text.push_str(&piece);
                out_tokens.push(token);
            }

            if self.state.input_consumed() {
                let recent = self.state.recent.to_vec();
                if tokens_end_with_any(&self.tokenizer, &recent, &params.antiprompts)? {
                    lp.waiting_for_input = true;
                    stop = Some(StopReason::StopString);
                }
                if self.state.resident > 0 && lp.waiting_for_input {
                    break;
                }
            }

            if self.state.pending.last() == Some(&eos) {
                on_piece(END_OF_TEXT);
                out_text.push_str(END_OF_TEXT);
                stop = Some(StopReason::EndOfText);
                break;
            }

            if lp.budget_exhausted() {
                if let Some(max) = params.max_tokens {
                    lp.remaining = Some(max as isize);
                    lp.waiting_for_input = true;
                    stop.get_or_insert(StopReason::Budget);
                }
            }
        }

        let stop = stop.unwrap_or(StopReason::Budget);
        debug!(?stop, generated = out_tokens.len(), "turn finished");
        Ok(Turn {
            text: out_text,
            tokens: out_tokens,
            stop,
        })
    }

    fn phase(&self, lp: &LoopState) -> Phase {
        if self.state.is_prompt_run || !self.state.input_consumed() {
            Phase::PromptConsumption
        } else if lp.waiting_for_input {
            Phase::WaitingForInput
        } else {
            Phase::Generating
        }
    }

    fn preprocess(&mut self, text: Option<&str>, lp: &mut LoopState) -> Result<()> {
        if self.state.is_prompt_run {
            let text = text.ok_or(ConfigError::MissingPrompt)?;
            self.insertions.clear();
            self.staged = None;
            let tokens = self.tokenize_input(text, self.config.add_bos_to_prompt, 0)?;
            self.state.input_tokens = tokens;
            self.state.consumed = 0;
            self.reuse_session_prefix();
        } else if let Some(text) = text {
            let mut line = text.to_string();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            let base = self.state.input_tokens.len();
            let tokens = self.tokenize_input(&line, false, base)?;
            lp.charge(tokens.len());
            self.state.input_tokens.extend(tokens);
        }
        Ok(())
    }

    /// Tokenize user input, splicing around the image marker when an
    /// embedding provider is attached.
    fn tokenize_input(&mut self, text: &str, add_bos: bool, base: usize) -> Result<Vec<TokenId>> {
        let marker = self.config.image_marker.as_str();
        let Some(provider) = self.embeddings.as_mut().filter(|_| text.contains(marker)) else {
            return Ok(self.tokenizer.encode(text, add_bos, true)?);
        };

        let spliced = splice(&self.tokenizer, text, marker, add_bos)?;
        let handles = self
            .images
            .drain(..)
            .map(|image| provider.create_from_image(&image))
            .collect::<llama_engine::Result<Vec<_>>>()?;
        debug!(images = handles.len(), position = ?spliced.insertion, "spliced image marker");
        self.insertions.extend(spliced.records(base, handles));
        Ok(spliced.tokens)
    }

    /// Skip the part of the prompt already resident from a restored session cache.
    fn reuse_session_prefix(&mut self) {
        if self.state.session_tokens.is_empty() {
            return;
        }
        let prompt = &self.state.input_tokens;
        let matched = matched_length(&self.state.session_tokens, prompt);
        if matched + 1 >= prompt.len() {
            info!(matched, "session cache has exact match for prompt");
        } else if matched < prompt.len() / 2 {
            warn!(
                matched,
                prompt = prompt.len(),
                "session cache has low similarity to prompt"
            );
        } else {
            info!(matched, prompt = prompt.len(), "session cache matches prompt prefix");
        }

        for &token in &prompt[..matched] {
            self.state.recent.push(token);
        }
        self.engine.drop_range(SeqId::ZERO, matched, None);
        self.state.session_tokens.truncate(matched);
        self.state.session_consumed = matched;
        self.state.cached_prefix_length = matched;
        self.state.consumed = matched;
        self.state.resident = matched;
        self.insertions.retain(|r| r.position >= matched);
    }

    /// One loop step. Returns the sampled token, if this step sampled.
    fn step(&mut self, params: &InferenceParams, lp: &mut LoopState) -> Result<Option<TokenId>> {
        if !self.state.pending.is_empty() || self.staged.is_some() {
            self.state.is_prompt_run = false;

            let keep = keep_length(
                params.tokens_keep,
                self.state.input_tokens.len(),
                self.engine.special_tokens().add_bos,
            );
            let window = ContextWindow {
                capacity: self.engine.context_size(),
                discard_limit: params.shift_discard_limit,
                max_iterations: self.config.max_shift_iterations,
            };
            let incoming = self.state.pending.len()
                + self
                    .staged
                    .as_ref()
                    .map_or(0, |s| s.handles.iter().map(|h| h.n_positions).sum::<usize>());
            window.make_room(&mut self.engine, &mut self.state, keep, incoming)?;

            self.advance_pending(lp)?;
        }
        self.state.pending.clear();

        if self.state.input_consumed() && !lp.waiting_for_input {
            if lp.needs_save {
                lp.needs_save = false;
                self.save_session_file()?;
            }

            let sampled = self.sample(params)?;
            self.state.recent.push(sampled);

            let specials = self.engine.special_tokens();
            let token = if sampled == specials.eos {
                if let Some(first) = params.antiprompts.first() {
                    let forced = self.tokenizer.encode(first, false, false)?;
                    debug!(tokens = forced.len(), "end marker sampled, forcing first stop string");
                    self.state.input_tokens.extend(forced);
                }
                specials.newline
            } else {
                sampled
            };

            self.state.pending.push(token);
            lp.charge(1);
            return Ok(Some(token));
        }

        self.fill_batch();
        Ok(None)
    }

    /// Move the next batch of input into `pending`.
    fn fill_batch(&mut self) {
        let batch = self.engine.batch_size().max(1);
        while !self.state.input_consumed() {
            if self.stage_at_cursor() {
                return;
            }
            let token = self.state.input_tokens[self.state.consumed];
            self.state.pending.push(token);
            self.state.recent.push(token);
            self.state.consumed += 1;
            if self.state.pending.len() >= batch {
                break;
            }
        }
        self.stage_at_cursor();
    }

    /// Bind embeddings recorded at the input cursor to the current batch.
    /// Returns true when the batch must end here (it already has embeddings).
    fn stage_at_cursor(&mut self) -> bool {
        let cursor = self.state.consumed;
        if !self.insertions.iter().any(|r| r.position == cursor) {
            return false;
        }
        if self.staged.is_some() {
            return true;
        }
        let (hit, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.insertions)
            .into_iter()
            .partition(|r| r.position == cursor);
        self.insertions = rest;
        self.staged = Some(Staged {
            offset: self.state.pending.len(),
            handles: hit.into_iter().map(|r| r.handle).collect(),
        });
        false
    }

    /// Make `pending` resident, evaluating staged embeddings at their offset.
    fn advance_pending(&mut self, lp: &mut LoopState) -> Result<()> {
        if let Some(offset) = self.staged.as_ref().map(|s| s.offset) {
            self.advance_front(offset, lp)?;
            if let Some(staged) = self.staged.take() {
                self.evaluate_embeddings(staged.handles)?;
            }
        }
        let n = self.state.pending.len();
        self.advance_front(n, lp)
    }

    /// Make the first `n` pending tokens resident and drop them from `pending`.
    ///
    /// On failure only the tokens the engine reports as resident are dropped;
    /// the rest stay pending for the next attempt.
    fn advance_front(&mut self, n: usize, lp: &mut LoopState) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let start = self.state.resident;
        let outcome = self
            .engine
            .advance(&self.state.pending[..n], SeqId::ZERO, start);
        let made = outcome.new_position.saturating_sub(start).min(n);
        self.state.resident = outcome.new_position;

        let advanced: Vec<TokenId> = self.state.pending.drain(..made).collect();
        if let Some(staged) = self.staged.as_mut() {
            staged.offset -= made.min(staged.offset);
        }
        if self.state.session_path.is_some() && !advanced.is_empty() {
            self.state.session_tokens.extend(&advanced);
            self.state.session_consumed = self.state.session_tokens.len();
            lp.needs_save = true;
        }

        if !outcome.is_ok() {
            warn!(
                status = %outcome.status,
                position = outcome.new_position,
                kept = self.state.pending.len(),
                "decode failed, turn abandoned"
            );
            return Err(SessionError::Decode {
                status: outcome.status,
                position: outcome.new_position,
            });
        }
        Ok(())
    }

    fn evaluate_embeddings(&mut self, handles: Vec<EmbeddingHandle>) -> Result<()> {
        let Some(provider) = self.embeddings.as_mut() else {
            return Ok(());
        };
        for handle in &handles {
            let mut position = self.state.resident;
            provider.evaluate(&mut self.engine, handle, SeqId::ZERO, &mut position)?;
            debug!(id = handle.id, from = self.state.resident, to = position, "embedding evaluated");
            self.state.resident = position;
        }
        Ok(())
    }

    fn sample(&mut self, params: &InferenceParams) -> Result<TokenId> {
        let logits = self.engine.last_logits()?;

        if let Some(pipeline) = self.pipeline.as_mut() {
            let id = pipeline.sample(logits, &self.state.recent.to_vec())?;
            pipeline.accept(id);
            return Ok(id);
        }

        let repeat_last_n = params
            .repeat_last_n
            .unwrap_or_else(|| self.engine.context_size());
        let candidates = apply_penalties(
            logits,
            &self.state.recent.last_n(repeat_last_n),
            repeat_last_n,
            &params.sampling.penalties,
            self.engine.special_tokens().newline,
        )?;
        let mut rng = SeededRng::new(self.state.rng_state.unwrap_or(params.sampling.seed));
        let (id, mu) =
            sample_distribution(candidates, self.state.mirostat_mu, &params.sampling, &mut rng)?;
        self.state.mirostat_mu = mu;
        self.state.rng_state = Some(rng.state());
        Ok(id)
    }

    fn save_session_file(&self) -> Result<()> {
        let Some(path) = self.state.session_path.as_deref() else {
            return Ok(());
        };
        let file = SessionFile {
            tokens: self.state.session_tokens.clone(),
            engine_state: self.engine.save_state().unwrap_or_default(),
        };
        file.save(path)?;
        debug!(path = %path.display(), tokens = file.tokens.len(), "session cache written");
        Ok(())
    }

    /// Serialize the session state.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(persist::snapshot(&self.state)?)
    }

    /// Replace the session state with a snapshot.
    ///
    /// Only the session's bookkeeping is restored; the engine cache must be
    /// restored separately (or re-fed) to match `resident`.
    pub fn restore(&mut self, blob: &[u8]) -> Result<()> {
        self.state = persist::restore(blob)?;
        self.insertions.clear();
        self.staged = None;
        self.decoder.clear();
        Ok(())
    }

    pub fn save_state(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.snapshot()?)?;
        info!(path = %path.display(), conversation = %self.id, "executor state saved");
        Ok(())
    }

    pub fn load_state_file(&mut self, path: &Path) -> Result<()> {
        let blob = std::fs::read(path)?;
        self.restore(&blob)
    }
}
