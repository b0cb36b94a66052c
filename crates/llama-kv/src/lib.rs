//! # llama-kv
//!
//! Cell-level KV cache bookkeeping for llama.rs backends.
//!
//! Supports:
//! - **Occupy**: Claims one cell per token at consecutive positions of a sequence
//! - **Remove**: Frees cells of a sequence in a position range (`seq_rm`)
//! - **Shift**: Moves positions of a range by a signed delta (`seq_add`), recording the
//!   pending rotation so the backend can re-apply RoPE on refresh
//! - **Accounting**: Used-cell count, per-sequence max position and token readback
//!
//! Tensor storage is the backend's business; this crate only decides which cell
//! holds which (sequence, position) pair. [`KvCells`] implements
//! [`llama_engine::KvCacheOps`] so a backend can delegate the cache contract to it.

use std::fmt;

use llama_engine::{KvCacheOps, SeqId, TokenId};

/// One occupied cache cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCell {
    /// Absolute position within its sequence.
    pub pos: usize,
    pub seq: SeqId,
    pub token: TokenId,
    /// Accumulated position delta not yet applied to the stored keys.
    pub delta: isize,
}

impl fmt::Display for KvCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} pos:{} tok:{}]", self.seq, self.pos, self.token)
    }
}

/// Error type for KV cell operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Position {pos} already occupied in {seq}")]
    Occupied { seq: SeqId, pos: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// Fixed-capacity table of KV cells.
///
/// # Invariants
/// - `used() <= capacity()` at all times
/// - No two cells share the same (sequence, position) pair
#[derive(Debug, Clone)]
pub struct KvCells {
    cells: Vec<Option<KvCell>>,
    /// Set by `seq_add`, cleared by `take_shift`.
    has_shift: bool,
}

impl KvCells {
    /// Create an empty table.
    ///
    /// # Panics
    /// If `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "KvCells requires capacity > 0");
        Self {
            cells: vec![None; capacity],
            has_shift: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of occupied cells.
    pub fn used(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Claim cells for `tokens` at positions `start..start + tokens.len()` of `seq`.
    ///
    /// Validates everything before writing, so a failed call leaves the table
    /// unchanged.
    ///
    /// # Errors
    /// - `CapacityExceeded`: Not enough free cells
    /// - `Occupied`: A target position already holds a cell of `seq`
    pub fn occupy(&mut self, seq: SeqId, start: usize, tokens: &[TokenId]) -> KVResult<()> {
        let free = self.capacity() - self.used();
        if tokens.len() > free {
            return Err(KVError::CapacityExceeded {
                seq_len: self.used() + tokens.len(),
                max: self.capacity(),
            });
        }

        let end = start + tokens.len();
        if let Some(cell) = self
            .cells
            .iter()
            .flatten()
            .find(|c| c.seq == seq && c.pos >= start && c.pos < end)
        {
            return Err(KVError::Occupied { seq, pos: cell.pos });
        }

        let mut pending = tokens.iter().enumerate();
        for slot in self.cells.iter_mut().filter(|s| s.is_none()) {
            let Some((i, &token)) = pending.next() else {
                break;
            };
            *slot = Some(KvCell {
                pos: start + i,
                seq,
                token,
                delta: 0,
            });
        }

        Ok(())
    }

    /// Free cells of `seq` with position in `[from, to)`. Returns the number freed.
    pub fn seq_rm(&mut self, seq: SeqId, from: usize, to: Option<usize>) -> usize {
        let to = to.unwrap_or(usize::MAX);
        let mut removed = 0;
        for slot in &mut self.cells {
            if matches!(slot, Some(c) if c.seq == seq && c.pos >= from && c.pos < to) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Add `delta` to positions of `seq` in `[from, to)`.
    ///
    /// Cells pushed below position zero are freed.
    pub fn seq_add(&mut self, seq: SeqId, from: usize, to: Option<usize>, delta: isize) {
        if delta == 0 {
            return;
        }
        let to = to.unwrap_or(usize::MAX);
        for slot in &mut self.cells {
            let Some(cell) = slot else { continue };
            if cell.seq != seq || cell.pos < from || cell.pos >= to {
                continue;
            }
            let moved = cell.pos as isize + delta;
            if moved < 0 {
                *slot = None;
            } else {
                cell.pos = moved as usize;
                cell.delta += delta;
                self.has_shift = true;
            }
        }
    }

    /// Consume pending shifts. Returns whether any were pending.
    pub fn take_shift(&mut self) -> bool {
        if !self.has_shift {
            return false;
        }
        for cell in self.cells.iter_mut().flatten() {
            cell.delta = 0;
        }
        self.has_shift = false;
        true
    }

    /// Whether a shift is waiting to be applied.
    pub fn has_shift(&self) -> bool {
        self.has_shift
    }

    /// Highest occupied position of `seq`.
    pub fn max_pos(&self, seq: SeqId) -> Option<usize> {
        self.cells
            .iter()
            .flatten()
            .filter(|c| c.seq == seq)
            .map(|c| c.pos)
            .max()
    }

    /// Tokens of `seq` ordered by position.
    pub fn tokens(&self, seq: SeqId) -> Vec<TokenId> {
        let mut cells: Vec<&KvCell> = self.cells.iter().flatten().filter(|c| c.seq == seq).collect();
        cells.sort_by_key(|c| c.pos);
        cells.into_iter().map(|c| c.token).collect()
    }

    /// Free every cell.
    pub fn clear(&mut self) {
        for slot in &mut self.cells {
            *slot = None;
        }
        self.has_shift = false;
    }
}

impl KvCacheOps for KvCells {
    fn drop_range(&mut self, seq: SeqId, from: usize, to: Option<usize>) -> bool {
        self.seq_rm(seq, from, to);
        true
    }

    fn shift_positions(&mut self, seq: SeqId, from: usize, to: Option<usize>, delta: isize) {
        self.seq_add(seq, from, to, delta);
    }

    fn clear_all(&mut self) {
        self.clear();
    }

    fn resident_cells(&self) -> usize {
        self.used()
    }

    fn refresh_after_drop(&mut self) {
        self.take_shift();
    }
}
