//! Property tests for the context window, prefix matcher and snapshots.

use std::path::PathBuf;

use llama_engine::{KvCacheOps, SeqId, TokenId};
use llama_kv::KvCells;
use llama_session::*;
use proptest::prelude::*;

fn resident_cells(n: usize, capacity: usize) -> (KvCells, Vec<TokenId>) {
    let mut cells = KvCells::new(capacity);
    let tokens: Vec<TokenId> = (0..n as TokenId).map(|t| t + 100).collect();
    cells.occupy(SeqId::ZERO, 0, &tokens).unwrap();
    (cells, tokens)
}

proptest! {
    #![proptest_config(ProptestConfig { max_global_rejects: 65536, ..ProptestConfig::default() })]

    #[test]
    fn shift_fits_batch_and_keeps_prefix(
        capacity in 2usize..48,
        resident_frac in 0.0f64..=1.0,
        pending in 1usize..48,
        keep in 0usize..48,
    ) {
        let resident = ((capacity as f64) * resident_frac) as usize;
        let (mut cells, original) = resident_cells(resident, capacity);
        let mut state = SessionState::new(capacity);
        state.resident = resident;
        state.pending = vec![1; pending];

        let window = ContextWindow { capacity, discard_limit: None, max_iterations: 64 };
        match window.shift_if_needed(&mut cells, &mut state, keep) {
            Ok(discarded) => {
                prop_assert!(state.resident + pending <= capacity);
                prop_assert_eq!(state.resident + discarded, resident);
                prop_assert_eq!(cells.resident_cells(), state.resident);
                let kept = keep.min(state.resident);
                prop_assert_eq!(&cells.tokens(SeqId::ZERO)[..kept], &original[..kept]);
            }
            Err(ConfigError::CapacityBelowKeep { .. }) => prop_assert!(keep > capacity),
            Err(ConfigError::NoValidShift { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    #[test]
    fn shift_without_overflow_changes_nothing(
        capacity in 1usize..64,
        resident in 0usize..64,
        pending in 0usize..64,
        keep in 0usize..64,
    ) {
        prop_assume!(resident + pending <= capacity);
        let (mut cells, original) = resident_cells(resident, capacity);
        let mut state = SessionState::new(capacity);
        state.resident = resident;
        state.pending = vec![1; pending];
        state.session_path = Some(PathBuf::from("chat.session"));
        let before = state.clone();

        let window = ContextWindow { capacity, discard_limit: None, max_iterations: 64 };
        prop_assert_eq!(window.shift_if_needed(&mut cells, &mut state, keep), Ok(0));
        prop_assert_eq!(state, before);
        prop_assert_eq!(cells.tokens(SeqId::ZERO), original);
    }

    #[test]
    fn match_is_bounded(
        saved in prop::collection::vec(0i32..4, 0..16),
        fresh in prop::collection::vec(0i32..4, 0..16),
    ) {
        let m = matched_length(&saved, &fresh);
        prop_assert!(saved[..m] == fresh[..m]);
        if !saved.is_empty() && !fresh.is_empty() {
            prop_assert!(m < saved.len().min(fresh.len()));
        } else {
            prop_assert_eq!(m, 0);
        }
    }

    #[test]
    fn longer_saved_prefix_never_matches_less(
        saved in prop::collection::vec(0i32..3, 1..16),
        fresh in prop::collection::vec(0i32..3, 1..16),
        cut in 0usize..16,
    ) {
        let cut = cut.min(saved.len());
        prop_assert!(matched_length(&saved[..cut], &fresh) <= matched_length(&saved, &fresh));
    }

    #[test]
    fn snapshot_roundtrip(
        input in prop::collection::vec(0i32..1000, 0..32),
        consumed_frac in 0.0f64..=1.0,
        resident in 0usize..64,
        recent in prop::collection::vec(0i32..1000, 0..16),
        window in 1usize..16,
        pending in prop::collection::vec(0i32..1000, 0..4),
        session in prop::collection::vec(0i32..1000, 0..32),
        mu in prop::option::of(-100.0f32..100.0),
        rng_state in prop::option::of(any::<u64>()),
        path in prop::option::of("[a-z]{1,8}"),
        prompt_run in any::<bool>(),
    ) {
        let mut state = SessionState::new(window);
        state.consumed = ((input.len() as f64) * consumed_frac) as usize;
        let cached = input.len().min(session.len()) / 2;
        let mut session_tokens = input[..cached].to_vec();
        session_tokens.extend(&session[cached..]);
        state.cached_prefix_length = cached;
        state.session_consumed = session_tokens.len();
        state.input_tokens = input;
        state.resident = resident;
        for t in recent {
            state.recent.push(t);
        }
        state.pending = pending;
        state.session_tokens = session_tokens;
        state.mirostat_mu = mu;
        state.rng_state = rng_state;
        state.session_path = path.map(PathBuf::from);
        state.is_prompt_run = prompt_run;

        let restored = restore(&snapshot(&state).unwrap()).unwrap();
        prop_assert_eq!(restored, state);
    }
}
