//! Staged copy pipeline for key/value tiles
//!
//! A ring of four rotating slots overlaps fetching the next key or value
//! tile with compute on previously fetched tiles: two slots are being
//! consumed by the score and accumulation stages while two are in flight.
//! Each slot walks the acquire -> issue -> commit -> wait -> release state
//! machine. On a device with asynchronous copies the issue/commit/wait
//! triple maps onto the hardware pipeline; on this target the fetch is a
//! synchronous prefetch (with widening cast) performed at issue time, and
//! the state machine is kept so the kernel's ordering contract is identical.
//!
//! Rows past the end of the current chunk issue no transfer: the validity
//! predicate simply leaves stale data in those rows, and the accumulation
//! stage never reads them.

use crate::layout::KvCacheView;
use crate::vector::{Element, LaneVec};

/// Slots in the ring: two consumed, two in flight
pub const NUM_SLOTS: usize = 4;

/// Rows (sequence positions) staged per tile
pub const TILE_ROWS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Acquired,
    Issued,
    Committed,
    Ready,
}

#[derive(Debug, Clone)]
struct TileSlot<const D: usize> {
    rows: Vec<LaneVec<D>>,
    base_pos: usize,
    valid_rows: usize,
    state: SlotState,
}

/// Handle to an acquired slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotToken(usize);

/// Quad-buffered tile ring
#[derive(Debug, Clone)]
pub struct TileRing<const D: usize> {
    slots: [TileSlot<D>; NUM_SLOTS],
    next: usize,
}

impl<const D: usize> TileRing<D> {
    /// Ring with all slots free and zeroed row storage
    #[must_use]
    pub fn new() -> Self {
        let slot = TileSlot {
            rows: vec![LaneVec::zero(); TILE_ROWS],
            base_pos: 0,
            valid_rows: 0,
            state: SlotState::Free,
        };
        Self {
            slots: [slot.clone(), slot.clone(), slot.clone(), slot],
            next: 0,
        }
    }

    /// Acquire the next slot in rotation. The caller must have released it
    /// on the previous lap; the ring never skips slots.
    pub fn acquire(&mut self) -> SlotToken {
        let idx = self.next;
        debug_assert_eq!(
            self.slots[idx].state,
            SlotState::Free,
            "acquired slot still in use"
        );
        self.slots[idx].state = SlotState::Acquired;
        self.next = (self.next + 1) % NUM_SLOTS;
        SlotToken(idx)
    }

    /// Issue the fetch of rows `[start_pos, start_pos + TILE_ROWS)` of
    /// `head` from the cache. Rows at or beyond `valid_end` are skipped by
    /// the validity predicate and keep whatever stale data the slot held.
    pub fn issue_fetch<T: Element>(
        &mut self,
        token: SlotToken,
        cache: &KvCacheView<'_, T>,
        head: usize,
        start_pos: usize,
        valid_end: usize,
    ) {
        let slot = &mut self.slots[token.0];
        debug_assert_eq!(slot.state, SlotState::Acquired, "issue before acquire");

        slot.base_pos = start_pos;
        slot.valid_rows = valid_end.saturating_sub(start_pos).min(TILE_ROWS);
        for r in 0..slot.valid_rows {
            let offset = cache.row_offset(start_pos + r, head);
            slot.rows[r] = LaneVec::load_cast(cache.data(), offset);
        }
        slot.state = SlotState::Issued;
    }

    /// Commit the issued fetch, handing it to the (logical) copy engine
    pub fn commit(&mut self, token: SlotToken) {
        let slot = &mut self.slots[token.0];
        debug_assert_eq!(slot.state, SlotState::Issued, "commit before issue");
        slot.state = SlotState::Committed;
    }

    /// Block until the committed fetch has landed
    pub fn wait(&mut self, token: SlotToken) {
        let slot = &mut self.slots[token.0];
        debug_assert_eq!(slot.state, SlotState::Committed, "wait before commit");
        slot.state = SlotState::Ready;
    }

    /// Staged rows of a ready slot. Only the first [`Self::valid_rows`]
    /// entries hold fetched data.
    #[must_use]
    pub fn rows(&self, token: SlotToken) -> &[LaneVec<D>] {
        debug_assert_eq!(self.slots[token.0].state, SlotState::Ready);
        &self.slots[token.0].rows
    }

    /// Mutable staged rows; the score stage rotates key rows in place
    pub fn rows_mut(&mut self, token: SlotToken) -> &mut [LaneVec<D>] {
        debug_assert_eq!(self.slots[token.0].state, SlotState::Ready);
        &mut self.slots[token.0].rows
    }

    /// First sequence position staged in the slot
    #[must_use]
    pub fn base_pos(&self, token: SlotToken) -> usize {
        self.slots[token.0].base_pos
    }

    /// Number of rows the validity predicate allowed through
    #[must_use]
    pub fn valid_rows(&self, token: SlotToken) -> usize {
        self.slots[token.0].valid_rows
    }

    /// Return a consumed slot to the free pool
    pub fn release(&mut self, token: SlotToken) {
        let slot = &mut self.slots[token.0];
        debug_assert_eq!(slot.state, SlotState::Ready, "release before wait");
        slot.state = SlotState::Free;
    }
}

impl<const D: usize> Default for TileRing<D> {
    fn default() -> Self {
        Self::new()
    }
}
