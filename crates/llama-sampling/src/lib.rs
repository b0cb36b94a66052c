//! # llama-sampling
//!
//! Sampling and decoding strategies for llama.rs sessions.
//!
//! Two interchangeable forms of the same capability:
//! - **Pipeline**: an object implementing [`SamplingPipeline`] (`sample` + `accept`),
//!   e.g. [`Sampler`] with temperature / top-k / top-p / repetition penalty
//! - **Manual**: [`apply_penalties`] builds a candidate distribution, then
//!   [`sample_distribution`] picks a token and threads the mirostat `mu`
//!
//! Both use a deterministic seeded RNG for reproducible generation.

use std::collections::{HashMap, HashSet};

use llama_engine::TokenId;
use serde::{Deserialize, Serialize};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingError {
    InvalidLogits,
    InvalidTemperature,
    NoValidTokens,
}

impl std::fmt::Display for SamplingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplingError::InvalidLogits => write!(f, "Invalid logits array"),
            SamplingError::InvalidTemperature => write!(f, "Temperature must be > 0"),
            SamplingError::NoValidTokens => write!(f, "No valid tokens after filtering"),
        }
    }
}

impl std::error::Error for SamplingError {}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Current generator state. `SeededRng::new(rng.state())` continues the
    /// same sequence.
    pub fn state(&self) -> u64 {
        self.state
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// The pipeline form of the sampler capability.
pub trait SamplingPipeline: Send {
    /// Pick the next token from the logits of the last position.
    fn sample(&mut self, logits: &[f32], recent: &[TokenId]) -> SamplingResult<TokenId>;

    /// Record the token that was actually chosen.
    fn accept(&mut self, token: TokenId);
}

/// Default pipeline: repetition penalty, temperature, top-k, top-p.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for softmax scaling. > 1.0 = more random, < 1.0 = more deterministic.
    pub temperature: f32,

    /// Top-k: only sample from top k logits.
    pub top_k: Option<usize>,

    /// Top-p (nucleus sampling): sample from smallest set of tokens with cumulative prob >= p.
    pub top_p: Option<f32>,

    /// Repetition penalty: penalize tokens that appear in history.
    pub repetition_penalty: Option<f32>,

    /// RNG state for reproducible sampling. Mutated on each call.
    rng: SeededRng,

    /// Tokens passed to `accept`, most recent last.
    accepted: Vec<TokenId>,
}

impl Sampler {
    /// Create a sampler with default settings.
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: None,
            rng: SeededRng::new(42),
            accepted: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = Some(penalty);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SeededRng::new(seed);
        self
    }

    /// Tokens accepted so far.
    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }

    fn sample_inner(&mut self, logits: &[f32], history: &[TokenId]) -> SamplingResult<TokenId> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        if self.temperature <= 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        let mut work_logits = logits.to_vec();

        // Divide positive logits, multiply negative ones: either way the
        // repeated token becomes less likely.
        if let Some(penalty) = self.repetition_penalty {
            let unique: HashSet<TokenId> = history.iter().copied().collect();
            for token_id in unique {
                if let Some(logit) = usize::try_from(token_id)
                    .ok()
                    .and_then(|i| work_logits.get_mut(i))
                {
                    if *logit > 0.0 {
                        *logit /= penalty;
                    } else {
                        *logit *= penalty;
                    }
                }
            }
        }

        if (self.temperature - 1.0).abs() > 1e-6 {
            for logit in &mut work_logits {
                *logit /= self.temperature;
            }
        }

        if let Some(k) = self.top_k {
            apply_top_k(&mut work_logits, k);
        }

        let probs = softmax(&work_logits);

        // Near-greedy: just argmax
        if self.temperature < 1e-3 {
            return Ok(argmax(&probs) as TokenId);
        }

        let probs = if let Some(p) = self.top_p {
            apply_top_p(&probs, p)
        } else {
            probs
        };

        draw(&probs, &mut self.rng).map(|i| i as TokenId)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingPipeline for Sampler {
    fn sample(&mut self, logits: &[f32], recent: &[TokenId]) -> SamplingResult<TokenId> {
        self.sample_inner(logits, recent)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }
}

fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }

    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let threshold = sorted[k - 1];
    for logit in logits.iter_mut() {
        if *logit < threshold {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
    let mut sorted: Vec<f32> = probs.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0;
    let mut cutoff_prob = sorted[0];
    for &prob in &sorted {
        cumsum += prob;
        cutoff_prob = prob;
        if cumsum >= p {
            break;
        }
    }

    let mut result: Vec<f32> = probs
        .iter()
        .map(|&pr| if pr >= cutoff_prob { pr } else { 0.0 })
        .collect();

    let sum: f32 = result.iter().sum();
    if sum > 0.0 {
        for p in &mut result {
            *p /= sum;
        }
    }

    result
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

fn argmax(probs: &[f32]) -> usize {
    probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Draw an index from an (approximately) normalized distribution.
fn draw(probs: &[f32], rng: &mut SeededRng) -> SamplingResult<usize> {
    let r = rng.next_f32();
    let mut cumsum = 0.0;

    for (i, &prob) in probs.iter().enumerate() {
        cumsum += prob;
        if r < cumsum {
            return Ok(i);
        }
    }

    // Rounding left r past the total: last token with nonzero probability
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .ok_or(SamplingError::NoValidTokens)
}

// ---------------------------------------------------------------------------
// Manual form
// ---------------------------------------------------------------------------

/// A candidate token with its (possibly penalized) logit and probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Penalties applied before sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyParams {
    /// Repetition penalty over the recent window (1.0 = disabled).
    pub repeat_penalty: f32,
    /// Subtracted once per occurrence in the recent window.
    pub frequency_penalty: f32,
    /// Subtracted once if the token occurs in the recent window at all.
    pub presence_penalty: f32,
    /// Whether the newline token is subject to penalties.
    pub penalize_nl: bool,
    /// Additive per-token bias applied before penalties.
    pub logit_bias: HashMap<TokenId, f32>,
}

impl Default for PenaltyParams {
    fn default() -> Self {
        Self {
            repeat_penalty: 1.1,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalize_nl: true,
            logit_bias: HashMap::new(),
        }
    }
}

/// Adaptive-temperature mode of the manual sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mirostat {
    #[default]
    Disabled,
    V1,
    V2,
}

/// Configuration of the manual sampling path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Temperature; `<= 0` selects greedy decoding.
    pub temperature: f32,
    /// 0 disables top-k.
    pub top_k: usize,
    /// 1.0 disables top-p.
    pub top_p: f32,
    /// 0.0 disables min-p.
    pub min_p: f32,
    pub mirostat: Mirostat,
    /// Target surprise.
    pub mirostat_tau: f32,
    /// Learning rate of `mu`.
    pub mirostat_eta: f32,
    pub penalties: PenaltyParams,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            penalties: PenaltyParams::default(),
            seed: 42,
        }
    }
}

/// Build the penalized candidate distribution for the last position.
///
/// Only the last `repeat_last_n` tokens of `recent` count towards penalties.
pub fn apply_penalties(
    logits: &[f32],
    recent: &[TokenId],
    repeat_last_n: usize,
    params: &PenaltyParams,
    newline: TokenId,
) -> SamplingResult<Vec<TokenData>> {
    if logits.is_empty() {
        return Err(SamplingError::InvalidLogits);
    }

    let mut candidates: Vec<TokenData> = logits
        .iter()
        .enumerate()
        .map(|(i, &logit)| TokenData {
            id: i as TokenId,
            logit,
            p: 0.0,
        })
        .collect();

    for (&id, &bias) in &params.logit_bias {
        if let Some(c) = usize::try_from(id).ok().and_then(|i| candidates.get_mut(i)) {
            c.logit += bias;
        }
    }

    let nl_index = usize::try_from(newline).ok().filter(|&i| i < candidates.len());
    let nl_logit = nl_index.map(|i| candidates[i].logit);

    let window = &recent[recent.len().saturating_sub(repeat_last_n)..];
    let mut counts: HashMap<TokenId, usize> = HashMap::new();
    for &token in window {
        *counts.entry(token).or_insert(0) += 1;
    }

    for (&token, &count) in &counts {
        let Some(c) = usize::try_from(token).ok().and_then(|i| candidates.get_mut(i)) else {
            continue;
        };
        if c.logit <= 0.0 {
            c.logit *= params.repeat_penalty;
        } else {
            c.logit /= params.repeat_penalty;
        }
        c.logit -= count as f32 * params.frequency_penalty + params.presence_penalty;
    }

    if !params.penalize_nl {
        if let (Some(i), Some(logit)) = (nl_index, nl_logit) {
            candidates[i].logit = logit;
        }
    }

    Ok(candidates)
}

/// Sort descending by logit and fill in normalized probabilities.
fn softmax_candidates(candidates: &mut [TokenData]) {
    candidates.sort_by(|a, b| {
        b.logit
            .partial_cmp(&a.logit)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let max_logit = candidates[0].logit;
    let mut sum = 0.0;
    for c in candidates.iter_mut() {
        c.p = (c.logit - max_logit).exp();
        sum += c.p;
    }
    for c in candidates.iter_mut() {
        c.p /= sum;
    }
}

fn draw_candidate(candidates: &[TokenData], rng: &mut SeededRng) -> SamplingResult<usize> {
    let probs: Vec<f32> = candidates.iter().map(|c| c.p).collect();
    draw(&probs, rng)
}

/// Pick a token from `candidates`, returning it together with the updated `mu`.
///
/// `mu` is only read and updated by the mirostat modes; it starts at
/// `2 * tau` when `None`. With mirostat disabled it is returned unchanged.
pub fn sample_distribution(
    mut candidates: Vec<TokenData>,
    mu: Option<f32>,
    params: &SamplingParams,
    rng: &mut SeededRng,
) -> SamplingResult<(TokenId, Option<f32>)> {
    if candidates.is_empty() {
        return Err(SamplingError::InvalidLogits);
    }

    if params.temperature <= 0.0 {
        let best = candidates
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(std::cmp::Ordering::Equal))
            .map(|c| c.id)
            .ok_or(SamplingError::NoValidTokens)?;
        return Ok((best, mu));
    }

    for c in &mut candidates {
        c.logit /= params.temperature;
    }

    match params.mirostat {
        Mirostat::Disabled => {
            softmax_candidates(&mut candidates);
            if params.top_k > 0 && params.top_k < candidates.len() {
                candidates.truncate(params.top_k);
            }
            if params.top_p < 1.0 {
                let mut cumsum = 0.0;
                let mut keep = candidates.len();
                for (i, c) in candidates.iter().enumerate() {
                    cumsum += c.p;
                    if cumsum >= params.top_p {
                        keep = i + 1;
                        break;
                    }
                }
                candidates.truncate(keep.max(1));
            }
            if params.min_p > 0.0 {
                let floor = candidates[0].p * params.min_p;
                let keep = candidates.iter().take_while(|c| c.p >= floor).count();
                candidates.truncate(keep.max(1));
            }
            softmax_candidates(&mut candidates);
            let idx = draw_candidate(&candidates, rng)?;
            Ok((candidates[idx].id, mu))
        }
        Mirostat::V1 => {
            let mut mu = mu.unwrap_or(2.0 * params.mirostat_tau);
            let n_vocab = candidates.len() as f32;
            softmax_candidates(&mut candidates);

            // Estimate the Zipf exponent from the head of the distribution.
            let m = 100.min(candidates.len());
            let mut sum_ti_bi = 0.0f32;
            let mut sum_ti_sq = 0.0f32;
            for i in 0..m.saturating_sub(1) {
                let t_i = ((i as f32 + 2.0) / (i as f32 + 1.0)).ln();
                let b_i = (candidates[i].p / candidates[i + 1].p).ln();
                sum_ti_bi += t_i * b_i;
                sum_ti_sq += t_i * t_i;
            }
            let k = if sum_ti_sq > 0.0 {
                let s_hat = sum_ti_bi / sum_ti_sq;
                let epsilon_hat = s_hat - 1.0;
                let k = ((epsilon_hat * 2f32.powf(mu)) / (1.0 - n_vocab.powf(-epsilon_hat)))
                    .powf(1.0 / s_hat);
                if k.is_finite() {
                    k.max(1.0) as usize
                } else {
                    1
                }
            } else {
                1
            };

            candidates.truncate(k.clamp(1, candidates.len()));
            softmax_candidates(&mut candidates);
            let idx = draw_candidate(&candidates, rng)?;
            let observed = -candidates[idx].p.log2();
            mu -= params.mirostat_eta * (observed - params.mirostat_tau);
            Ok((candidates[idx].id, Some(mu)))
        }
        Mirostat::V2 => {
            let mut mu = mu.unwrap_or(2.0 * params.mirostat_tau);
            softmax_candidates(&mut candidates);

            let keep = candidates.iter().take_while(|c| -c.p.log2() <= mu).count();
            candidates.truncate(keep.max(1));
            softmax_candidates(&mut candidates);

            let idx = draw_candidate(&candidates, rng)?;
            let observed = -candidates[idx].p.log2();
            mu -= params.mirostat_eta * (observed - params.mirostat_tau);
            Ok((candidates[idx].id, Some(mu)))
        }
    }
}
