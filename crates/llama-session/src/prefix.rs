//! Prefix reuse between a saved session cache and fresh input.

use llama_engine::TokenId;

/// Length of the common prefix of `saved` and `fresh`, capped at
/// `min(|saved|, |fresh|) - 1`.
///
/// At least one overlapping token is always left unmatched so the engine
/// performs a real decode and produces fresh logits.
pub fn matched_length(saved: &[TokenId], fresh: &[TokenId]) -> usize {
    let common = saved
        .iter()
        .zip(fresh)
        .take_while(|(a, b)| a == b)
        .count();
    let bound = saved.len().min(fresh.len()).saturating_sub(1);
    common.min(bound)
}
