//! Context window controller.
//!
//! Keeps `resident + pending <= capacity` by discarding the half of the
//! resident set that follows the kept prefix and sliding the tail down.
//! Discarding after the prefix (instead of from position zero) preserves a
//! fixed preamble such as a system prompt.

use llama_engine::{KvCacheOps, SeqId};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::state::SessionState;

/// Resolve how many leading tokens survive a shift.
///
/// An explicit keep count within the input is honoured (plus one for a BOS
/// sentinel that must stay resident); anything else keeps the whole input.
pub fn keep_length(tokens_keep: Option<usize>, input_len: usize, keep_bos: bool) -> usize {
    match tokens_keep {
        Some(n) if n <= input_len => n + usize::from(keep_bos),
        _ => input_len,
    }
}

/// Overflow policy for one engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    pub capacity: usize,
    /// Upper bound on tokens discarded per shift.
    pub discard_limit: Option<usize>,
    /// Shifts attempted before the configuration is declared degenerate.
    pub max_iterations: usize,
}

impl ContextWindow {
    /// Shift until the pending batch fits. Returns the number of discarded tokens.
    ///
    /// A no-op when nothing overflows. After any shift the session cache path
    /// is cleared, since the cache no longer mirrors resident positions.
    pub fn shift_if_needed(
        &self,
        cache: &mut dyn KvCacheOps,
        state: &mut SessionState,
        keep: usize,
    ) -> Result<usize, ConfigError> {
        let pending = state.pending.len();
        self.make_room(cache, state, keep, pending)
    }

    /// Like [`shift_if_needed`](Self::shift_if_needed) for `pending` incoming
    /// positions, which may include out-of-band embeddings.
    pub fn make_room(
        &self,
        cache: &mut dyn KvCacheOps,
        state: &mut SessionState,
        keep: usize,
        pending: usize,
    ) -> Result<usize, ConfigError> {
        if state.resident + pending <= self.capacity {
            return Ok(0);
        }
        if keep > self.capacity {
            return Err(ConfigError::CapacityBelowKeep {
                capacity: self.capacity,
                keep,
            });
        }

        let mut iterations = 0;
        let mut total = 0;
        while state.resident + pending > self.capacity {
            let n_left = state.resident.saturating_sub(keep);
            let mut discard = n_left / 2;
            if let Some(limit) = self.discard_limit {
                discard = discard.min(limit);
            }
            if discard == 0 || iterations >= self.max_iterations {
                return Err(ConfigError::NoValidShift {
                    resident: state.resident,
                    pending,
                    capacity: self.capacity,
                    iterations,
                });
            }

            let past = state.resident;
            cache.drop_range(SeqId::ZERO, keep, Some(keep + discard));
            cache.shift_positions(SeqId::ZERO, keep + discard, Some(past), -(discard as isize));
            cache.refresh_after_drop();

            state.resident -= discard;
            total += discard;
            iterations += 1;
            debug!(keep, discard, resident = state.resident, "context shift");
        }

        if let Some(path) = state.session_path.take() {
            info!(path = %path.display(), "context shifted, session cache no longer saved");
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingCache {
        calls: Vec<String>,
    }

    impl KvCacheOps for RecordingCache {
        fn drop_range(&mut self, seq: SeqId, from: usize, to: Option<usize>) -> bool {
            self.calls.push(format!("drop {} {}..{:?}", seq, from, to));
            true
        }
        fn shift_positions(&mut self, seq: SeqId, from: usize, to: Option<usize>, delta: isize) {
            self.calls
                .push(format!("shift {} {}..{:?} by {}", seq, from, to, delta));
        }
        fn clear_all(&mut self) {
            self.calls.push("clear".into());
        }
        fn resident_cells(&self) -> usize {
            0
        }
        fn refresh_after_drop(&mut self) {
            self.calls.push("refresh".into());
        }
    }

    fn window(capacity: usize) -> ContextWindow {
        ContextWindow {
            capacity,
            discard_limit: None,
            max_iterations: 64,
        }
    }

    fn state(resident: usize, pending: usize) -> SessionState {
        let mut s = SessionState::new(8);
        s.resident = resident;
        s.pending = vec![9; pending];
        s
    }

    #[test]
    fn keep_length_rules() {
        assert_eq!(keep_length(None, 5, true), 5);
        assert_eq!(keep_length(Some(9), 5, true), 5);
        assert_eq!(keep_length(Some(2), 5, true), 3);
        assert_eq!(keep_length(Some(2), 5, false), 2);
        assert_eq!(keep_length(Some(0), 5, false), 0);
    }

    #[test]
    fn no_overflow_is_noop() {
        let mut cache = RecordingCache::default();
        let mut s = state(5, 3);
        s.session_path = Some(PathBuf::from("cache.bin"));
        let before = s.clone();

        assert_eq!(window(8).shift_if_needed(&mut cache, &mut s, 2).unwrap(), 0);
        assert_eq!(s, before);
        assert!(cache.calls.is_empty());
    }

    #[test]
    fn overflow_shifts_until_batch_fits() {
        let mut cache = RecordingCache::default();
        let mut s = state(8, 3);
        s.session_path = Some(PathBuf::from("cache.bin"));

        let discarded = window(8).shift_if_needed(&mut cache, &mut s, 4).unwrap();
        assert_eq!(discarded, 3);
        assert_eq!(s.resident, 5);
        assert!(s.session_path.is_none());
        assert_eq!(
            cache.calls,
            vec![
                "drop seq:0 4..Some(6)",
                "shift seq:0 6..Some(8) by -2",
                "refresh",
                "drop seq:0 4..Some(5)",
                "shift seq:0 5..Some(6) by -1",
                "refresh",
            ]
        );
    }

    #[test]
    fn default_keep_is_the_input_length() {
        let mut cache = RecordingCache::default();
        let mut s = state(8, 3);
        s.input_tokens = vec![0, 5, 6, 7];

        let keep = keep_length(None, s.input_tokens.len(), true);
        assert_eq!(keep, 4);
        window(8).shift_if_needed(&mut cache, &mut s, keep).unwrap();

        let first_discard = (8 - keep) / 2;
        let cut = keep + first_discard;
        assert_eq!(cache.calls[0], format!("drop seq:0 {keep}..Some({cut})"));
        assert_eq!(cache.calls[1], format!("shift seq:0 {cut}..Some(8) by -{first_discard}"));
        assert!(s.resident + s.pending.len() <= 8);
    }

    #[test]
    fn default_keep_covering_everything_is_fatal() {
        let mut cache = RecordingCache::default();
        let mut s = state(8, 3);
        s.input_tokens = (0..8).collect();

        let keep = keep_length(None, s.input_tokens.len(), true);
        assert_eq!(keep, s.resident);
        let err = window(8).shift_if_needed(&mut cache, &mut s, keep).unwrap_err();
        assert!(matches!(err, ConfigError::NoValidShift { resident: 8, pending: 3, .. }));
        assert!(cache.calls.is_empty());
    }

    #[test]
    fn discard_limit_bounds_each_shift() {
        let mut cache = RecordingCache::default();
        let mut s = state(16, 1);
        let ctx = ContextWindow {
            discard_limit: Some(2),
            ..window(16)
        };
        assert_eq!(ctx.shift_if_needed(&mut cache, &mut s, 0).unwrap(), 2);
        assert_eq!(s.resident, 14);
    }

    #[test]
    fn keep_beyond_capacity_is_fatal() {
        let mut cache = RecordingCache::default();
        let mut s = state(8, 1);
        let err = window(8).shift_if_needed(&mut cache, &mut s, 9).unwrap_err();
        assert_eq!(err, ConfigError::CapacityBelowKeep { capacity: 8, keep: 9 });
    }

    #[test]
    fn no_progress_is_fatal() {
        let mut cache = RecordingCache::default();
        let mut s = state(8, 1);
        let err = window(8).shift_if_needed(&mut cache, &mut s, 8).unwrap_err();
        assert!(matches!(err, ConfigError::NoValidShift { iterations: 0, .. }));
        assert!(cache.calls.is_empty());
    }

    #[test]
    fn iteration_cap_is_fatal() {
        let mut cache = RecordingCache::default();
        let mut s = state(64, 60);
        let ctx = ContextWindow {
            discard_limit: Some(1),
            max_iterations: 3,
            ..window(64)
        };
        let err = ctx.shift_if_needed(&mut cache, &mut s, 0).unwrap_err();
        assert!(matches!(err, ConfigError::NoValidShift { iterations: 3, .. }));
    }
}
