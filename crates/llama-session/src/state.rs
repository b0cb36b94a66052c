//! Plain session data: token history, counters and loop control.

use std::collections::VecDeque;
use std::path::PathBuf;

use llama_engine::TokenId;

/// Fixed-capacity ring of the most recent tokens.
///
/// Pushing into a full window evicts the oldest token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentWindow {
    capacity: usize,
    tokens: VecDeque<TokenId>,
}

impl RecentWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tokens: VecDeque::with_capacity(capacity),
        }
    }

    /// Rebuild a window from saved contents. Only the newest `capacity`
    /// tokens are kept.
    pub fn with_tokens(capacity: usize, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        let mut window = Self::new(capacity);
        for token in tokens {
            window.push(token);
        }
        window
    }

    pub fn push(&mut self, token: TokenId) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Contents, oldest first.
    pub fn to_vec(&self) -> Vec<TokenId> {
        self.tokens.iter().copied().collect()
    }

    /// The newest `n` tokens, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<TokenId> {
        let skip = self.tokens.len().saturating_sub(n);
        self.tokens.iter().skip(skip).copied().collect()
    }
}

/// Everything a conversation needs to resume exactly where it stopped.
///
/// # Invariants
/// - `consumed <= input_tokens.len()`
/// - `resident <= context capacity` whenever the engine is called
/// - `cached_prefix_length <= min(session_tokens.len(), input_tokens.len())`
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Full tokenized prompt plus every continuation.
    pub input_tokens: Vec<TokenId>,
    /// Prefix of `input_tokens` already moved to `pending`.
    pub consumed: usize,
    /// Positions resident in the engine's cache.
    pub resident: usize,
    /// Recent tokens for penalties and stop strings.
    pub recent: RecentWindow,
    /// Length of a restored session cache confirmed to match the prompt.
    pub cached_prefix_length: usize,
    /// Tokens waiting to be made resident (input batch or sampled token).
    pub pending: Vec<TokenId>,
    /// Tokens mirrored into the session cache file.
    pub session_tokens: Vec<TokenId>,
    pub session_consumed: usize,
    /// Mirostat accumulator carried between sampling steps.
    pub mirostat_mu: Option<f32>,
    /// Sampler RNG position. `None` until the first random draw.
    pub rng_state: Option<u64>,
    pub session_path: Option<PathBuf>,
    /// True until the first prompt has been fed.
    pub is_prompt_run: bool,
}

impl SessionState {
    pub fn new(window_capacity: usize) -> Self {
        Self {
            input_tokens: Vec::new(),
            consumed: 0,
            resident: 0,
            recent: RecentWindow::new(window_capacity),
            cached_prefix_length: 0,
            pending: Vec::new(),
            session_tokens: Vec::new(),
            session_consumed: 0,
            mirostat_mu: None,
            rng_state: None,
            session_path: None,
            is_prompt_run: true,
        }
    }

    /// Whether every input token has been moved to `pending`.
    pub fn input_consumed(&self) -> bool {
        self.consumed >= self.input_tokens.len()
    }
}

/// Where the generation loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PromptConsumption,
    Generating,
    WaitingForInput,
    Terminated,
}

/// Control state of one inference call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    /// Tokens left in this turn's budget. `None` is unbounded.
    /// Can go negative when user input is charged against it.
    pub remaining: Option<isize>,
    pub waiting_for_input: bool,
    /// The session cache gained tokens since it was last written.
    pub needs_save: bool,
}

impl LoopState {
    pub fn new(max_tokens: Option<usize>) -> Self {
        Self {
            remaining: max_tokens.map(|n| n as isize),
            waiting_for_input: false,
            needs_save: false,
        }
    }

    pub fn budget_left(&self) -> bool {
        self.remaining.map_or(true, |n| n != 0)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.remaining.map_or(false, |n| n <= 0)
    }

    pub fn charge(&mut self, tokens: usize) {
        if let Some(n) = self.remaining.as_mut() {
            *n -= tokens as isize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest() {
        let mut window = RecentWindow::new(3);
        for t in 1..=5 {
            window.push(t);
        }
        assert_eq!(window.to_vec(), vec![3, 4, 5]);
        assert_eq!(window.len(), 3);
        assert_eq!(window.last_n(2), vec![4, 5]);
        assert_eq!(window.last_n(10), vec![3, 4, 5]);
    }

    #[test]
    fn window_rebuild_keeps_newest() {
        let window = RecentWindow::with_tokens(2, [7, 8, 9]);
        assert_eq!(window.to_vec(), vec![8, 9]);
        assert_eq!(window.capacity(), 2);
    }

    #[test]
    fn zero_capacity_window_stays_empty() {
        let mut window = RecentWindow::new(0);
        window.push(1);
        assert!(window.is_empty());
    }

    #[test]
    fn fresh_state_is_prompt_run() {
        let state = SessionState::new(16);
        assert!(state.is_prompt_run);
        assert!(state.input_consumed());
        assert_eq!(state.recent.capacity(), 16);
    }

    #[test]
    fn loop_budget() {
        let mut unbounded = LoopState::new(None);
        unbounded.charge(100);
        assert!(unbounded.budget_left());
        assert!(!unbounded.budget_exhausted());

        let mut bounded = LoopState::new(Some(3));
        bounded.charge(5);
        assert_eq!(bounded.remaining, Some(-2));
        assert!(bounded.budget_left());
        assert!(bounded.budget_exhausted());
        bounded.remaining = Some(0);
        assert!(!bounded.budget_left());
    }
}
