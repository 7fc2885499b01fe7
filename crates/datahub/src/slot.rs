// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One ring cell's state record.
//!
//! A slot's *state* record (this module) and its *payload bytes* live in
//! two separate flat arrays in the segment (the "slot-state array" and
//! the "slot-data array" of the on-disk layout), not combined into one
//! per-slot struct the way a simpler ring buffer might do it — the state
//! record is small and hot (every acquire/release touches it), while the
//! payload can be large and is touched only by the two endpoints actually
//! moving bytes.
//!
//! Ordering discipline mirrors a seqlock-style commit: the producer
//! writes the checksum and payload, then publishes `state = COMMITTED`
//! with `Release`; a consumer that observes COMMITTED with `Acquire` is
//! guaranteed to see that payload.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Public states a caller can observe. `Abandoned` is deliberately not a
/// variant here — callers see an abandoned slot as simply not matching
/// their expected sequence (see `ReadAttempt::WrongSequence`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Writing,
    Committed,
    Draining,
    Consuming,
}

/// Internal state tag, including `Abandoned` which recovery uses to mark
/// a zombie-writer slot that is not safe to roll `write_index` back over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum RawState {
    Free = 0,
    Writing = 1,
    Committed = 2,
    Draining = 3,
    Consuming = 4,
    Abandoned = 5,
}

impl RawState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Writing,
            2 => Self::Committed,
            3 => Self::Draining,
            4 => Self::Consuming,
            5 => Self::Abandoned,
            other => unreachable!("corrupt slot state tag: {other}"),
        }
    }

    fn to_public(self) -> Option<SlotState> {
        match self {
            Self::Free => Some(SlotState::Free),
            Self::Writing => Some(SlotState::Writing),
            Self::Committed => Some(SlotState::Committed),
            Self::Draining => Some(SlotState::Draining),
            Self::Consuming => Some(SlotState::Consuming),
            Self::Abandoned => None,
        }
    }
}

/// Cache-line aligned so adjacent slots' hot fields don't false-share.
#[repr(C, align(64))]
pub struct Slot {
    state: AtomicU32,
    _pad0: u32,
    slot_id: AtomicU64,
    reader_count: AtomicU32,
    /// Bit `i` set means consumer liveness row `i` currently holds this
    /// slot. Always maintained (not only under `SyncReader`) so recovery
    /// has one uniform algorithm across policies rather than a
    /// policy-conditional one.
    reader_bitset: AtomicU32,
    checksum: AtomicU64,
    /// Monotonic-ns timestamp the slot entered DRAINING; 0 when not
    /// draining. Used to enforce the drain timeout.
    drain_started_ns: AtomicU64,
    /// PID of the producer that last acquired (WRITING) this slot.
    owner_pid: AtomicU64,
}

const _: () = assert!(std::mem::align_of::<Slot>() == 64);

impl Slot {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(RawState::Free as u32),
            _pad0: 0,
            slot_id: AtomicU64::new(0),
            reader_count: AtomicU32::new(0),
            reader_bitset: AtomicU32::new(0),
            checksum: AtomicU64::new(0),
            drain_started_ns: AtomicU64::new(0),
            owner_pid: AtomicU64::new(0),
        }
    }

    /// Public-facing state. Returns `None` for the internal `Abandoned` tag.
    #[must_use]
    pub fn state(&self) -> Option<SlotState> {
        RawState::from_u32(self.state.load(Ordering::Acquire)).to_public()
    }

    fn raw_state(&self) -> RawState {
        RawState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn owner_pid(&self) -> u64 {
        self.owner_pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn checksum(&self) -> u64 {
        self.checksum.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn drain_started_ns(&self) -> u64 {
        self.drain_started_ns.load(Ordering::Acquire)
    }

    /// CAS the slot from `Free` into `Writing`, owned by `pid`, at
    /// sequence `slot_id`.
    pub(crate) fn try_begin_write(&self, slot_id: u64, pid: u64) -> bool {
        if self
            .state
            .compare_exchange(
                RawState::Free as u32,
                RawState::Writing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.slot_id.store(slot_id, Ordering::Relaxed);
        self.reader_count.store(0, Ordering::Relaxed);
        self.reader_bitset.store(0, Ordering::Relaxed);
        self.owner_pid.store(pid, Ordering::Release);
        true
    }

    /// LatestOnly-only: force a slot that is currently `Committed` into
    /// `Writing` to wrap over it. If the slot is held by a reader
    /// (`Consuming`), the caller should route through `begin_drain` instead.
    pub(crate) fn try_begin_write_over_committed(&self, slot_id: u64, pid: u64) -> bool {
        if self
            .state
            .compare_exchange(
                RawState::Committed as u32,
                RawState::Writing as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.slot_id.store(slot_id, Ordering::Relaxed);
        self.reader_count.store(0, Ordering::Relaxed);
        self.reader_bitset.store(0, Ordering::Relaxed);
        self.owner_pid.store(pid, Ordering::Release);
        true
    }

    /// LatestOnly-only: a wrap target is `Consuming`; enter `Draining`
    /// instead of clobbering the active reader.
    pub(crate) fn begin_drain(&self, now_ns: u64) -> bool {
        if self
            .state
            .compare_exchange(
                RawState::Consuming as u32,
                RawState::Draining as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.drain_started_ns.store(now_ns, Ordering::Release);
        true
    }

    /// Drain timeout elapsed: restore to `Committed`, abandoning the wrap.
    pub(crate) fn restore_from_drain(&self) -> bool {
        self.drain_started_ns.store(0, Ordering::Release);
        self.state
            .compare_exchange(
                RawState::Draining as u32,
                RawState::Committed as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Publish payload as visible: `Writing` -> `Committed`, with the
    /// checksum stored first so any observer of `Committed` also sees it.
    pub(crate) fn commit(&self, checksum: u64) {
        self.checksum.store(checksum, Ordering::Relaxed);
        self.state.store(RawState::Committed as u32, Ordering::Release);
    }

    /// Consumer acquire: `Committed`/`Consuming` (matching `expected_slot_id`)
    /// admits another reader; `Draining`/`Writing` is `NotReady`; anything
    /// else (including a stale or abandoned sequence) is `WrongSequence`.
    pub(crate) fn try_begin_read(&self, expected_slot_id: u64, consumer_row: usize) -> ReadAttempt {
        match self.raw_state() {
            RawState::Committed | RawState::Consuming => {
                if self.slot_id.load(Ordering::Acquire) != expected_slot_id {
                    return ReadAttempt::WrongSequence;
                }
            }
            RawState::Draining | RawState::Writing => return ReadAttempt::NotReady,
            RawState::Free | RawState::Abandoned => return ReadAttempt::WrongSequence,
        }
        // Either transition Committed -> Consuming, or join an existing
        // Consuming slot (multiple concurrent readers of the same slot_id
        // are expected under LatestOnly/SyncReader).
        let _ = self.state.compare_exchange(
            RawState::Committed as u32,
            RawState::Consuming as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self.slot_id.load(Ordering::Acquire) != expected_slot_id {
            return ReadAttempt::WrongSequence;
        }
        self.reader_count.fetch_add(1, Ordering::AcqRel);
        self.reader_bitset
            .fetch_or(1u32 << consumer_row, Ordering::AcqRel);
        ReadAttempt::Ok
    }

    /// Consumer release. Returns `true` if this was the last reader
    /// (reader_count reached zero).
    ///
    /// `may_free` governs only the `Consuming -> Free` transition: under
    /// `SyncReader`, a slot's local `reader_count` reaching zero does not
    /// mean every live named consumer has read it yet, so the caller
    /// passes `false` while this row is not the slowest live consumer —
    /// the slot then stays `Consuming` with `reader_count == 0`, still
    /// holding its committed payload, until the caller that is the live
    /// minimum finally releases it. `Draining -> Free` is never gated:
    /// draining only happens under `LatestOnly`, which always passes
    /// `true`.
    pub(crate) fn release_read(&self, consumer_row: usize, may_free: bool) -> bool {
        self.reader_bitset
            .fetch_and(!(1u32 << consumer_row), Ordering::AcqRel);
        let previous = self.reader_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "reader_count underflow");
        let last = previous == 1;
        if last {
            match self.raw_state() {
                RawState::Draining => {
                    self.drain_started_ns.store(0, Ordering::Release);
                    self.state.store(RawState::Free as u32, Ordering::Release);
                }
                RawState::Consuming if may_free => {
                    self.state.store(RawState::Free as u32, Ordering::Release);
                }
                _ => {}
            }
        }
        last
    }

    /// Whether liveness row `consumer_row` is currently holding this slot.
    #[must_use]
    pub fn is_held_by_row(&self, consumer_row: usize) -> bool {
        self.reader_bitset.load(Ordering::Acquire) & (1u32 << consumer_row) != 0
    }

    /// Recovery: forcibly clear `consumer_row`'s hold on this slot (the
    /// owning consumer is dead). No-op if the row doesn't hold it. See
    /// `release_read` for `may_free`.
    pub(crate) fn force_release_row(&self, consumer_row: usize, may_free: bool) {
        if !self.is_held_by_row(consumer_row) {
            return;
        }
        self.release_read(consumer_row, may_free);
    }

    /// Recovery: revert a zombie-owned `Writing` slot to `Free`.
    pub(crate) fn revert_zombie_write(&self, zombie_pid: u64) -> bool {
        if self.owner_pid.load(Ordering::Acquire) != zombie_pid {
            return false;
        }
        self.state
            .compare_exchange(
                RawState::Writing as u32,
                RawState::Free as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Recovery: mark a zombie-owned `Writing` slot `Abandoned` instead of
    /// `Free` (used when its sequence is not the ring's most recent, so
    /// `write_index` cannot be safely rolled back over it).
    pub(crate) fn abandon_zombie_write(&self, zombie_pid: u64) -> bool {
        if self.owner_pid.load(Ordering::Acquire) != zombie_pid {
            return false;
        }
        self.state
            .compare_exchange(
                RawState::Writing as u32,
                RawState::Abandoned as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Repair-mode integrity fix: force back to `Free`, dropping data.
    pub(crate) fn force_free(&self) {
        self.reader_count.store(0, Ordering::Relaxed);
        self.reader_bitset.store(0, Ordering::Relaxed);
        self.drain_started_ns.store(0, Ordering::Relaxed);
        self.state.store(RawState::Free as u32, Ordering::Release);
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadAttempt {
    Ok,
    NotReady,
    WrongSequence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<Slot>(), 64);
        assert_eq!(std::mem::size_of::<Slot>() % 64, 0);
    }

    #[test]
    fn write_commit_read_release_cycle() {
        let slot = Slot::new();
        assert_eq!(slot.state(), Some(SlotState::Free));
        assert!(slot.try_begin_write(0, 111));
        assert_eq!(slot.state(), Some(SlotState::Writing));
        slot.commit(0xdead_beef);
        assert_eq!(slot.state(), Some(SlotState::Committed));
        assert_eq!(slot.checksum(), 0xdead_beef);

        assert_eq!(slot.try_begin_read(0, 2), ReadAttempt::Ok);
        assert_eq!(slot.state(), Some(SlotState::Consuming));
        assert_eq!(slot.reader_count(), 1);
        assert!(slot.is_held_by_row(2));

        assert!(slot.release_read(2, true));
        assert_eq!(slot.state(), Some(SlotState::Free));
        assert!(!slot.is_held_by_row(2));
    }

    #[test]
    fn reading_wrong_sequence_is_rejected() {
        let slot = Slot::new();
        slot.try_begin_write(5, 1);
        slot.commit(1);
        assert_eq!(slot.try_begin_read(4, 0), ReadAttempt::WrongSequence);
        assert_eq!(slot.try_begin_read(5, 0), ReadAttempt::Ok);
    }

    #[test]
    fn draining_then_restore() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1);
        slot.commit(0);
        assert_eq!(slot.try_begin_read(0, 0), ReadAttempt::Ok);
        // Producer wants to wrap but a reader holds it.
        assert!(!slot.try_begin_write_over_committed(2, 99));
        assert!(slot.begin_drain(1000));
        assert_eq!(slot.state(), Some(SlotState::Draining));
        assert_eq!(slot.try_begin_read(0, 1), ReadAttempt::NotReady);

        // Drain timeout fires before the reader releases.
        assert!(slot.restore_from_drain());
        assert_eq!(slot.state(), Some(SlotState::Committed));

        // Reader finally releases the restored slot.
        assert!(slot.release_read(0, true));
        assert_eq!(slot.state(), Some(SlotState::Free));
    }

    #[test]
    fn draining_last_release_goes_to_free_not_committed() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1);
        slot.commit(0);
        slot.try_begin_read(0, 0);
        slot.begin_drain(1000);
        assert!(slot.release_read(0, true));
        assert_eq!(slot.state(), Some(SlotState::Free));
    }

    #[test]
    fn consuming_release_with_may_free_false_stays_consuming() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1);
        slot.commit(0);
        assert_eq!(slot.try_begin_read(0, 0), ReadAttempt::Ok);
        assert!(slot.release_read(0, false), "still the last reader to leave");
        assert_eq!(
            slot.state(),
            Some(SlotState::Consuming),
            "a slow SyncReader consumer must still be able to catch up and read this slot"
        );
        assert_eq!(slot.reader_count(), 0);
        // The lagging consumer now arrives and can still read the preserved slot.
        assert_eq!(slot.try_begin_read(0, 1), ReadAttempt::Ok);
        assert!(slot.release_read(1, true));
        assert_eq!(slot.state(), Some(SlotState::Free));
    }

    #[test]
    fn multiple_concurrent_readers_share_a_committed_slot() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1);
        slot.commit(0);
        assert_eq!(slot.try_begin_read(0, 0), ReadAttempt::Ok);
        assert_eq!(slot.try_begin_read(0, 1), ReadAttempt::Ok);
        assert_eq!(slot.reader_count(), 2);
        assert!(!slot.release_read(0, true));
        assert_eq!(slot.state(), Some(SlotState::Consuming));
        assert!(slot.release_read(1, true));
        assert_eq!(slot.state(), Some(SlotState::Free));
    }

    #[test]
    fn zombie_write_revert_only_matches_owner() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1234);
        assert!(!slot.revert_zombie_write(9999));
        assert_eq!(slot.state(), Some(SlotState::Writing));
        assert!(slot.revert_zombie_write(1234));
        assert_eq!(slot.state(), Some(SlotState::Free));
    }

    #[test]
    fn abandoned_slot_is_opaque_to_public_state() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1234);
        assert!(slot.abandon_zombie_write(1234));
        assert_eq!(slot.state(), None);
        assert_eq!(slot.try_begin_read(0, 0), ReadAttempt::WrongSequence);
    }

    #[test]
    fn force_release_row_decrements_and_frees() {
        let slot = Slot::new();
        slot.try_begin_write(0, 1);
        slot.commit(0);
        slot.try_begin_read(0, 3);
        slot.force_release_row(3, true);
        assert_eq!(slot.state(), Some(SlotState::Free));
        assert_eq!(slot.reader_count(), 0);
    }
}
