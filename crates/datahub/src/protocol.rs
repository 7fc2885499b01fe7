// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer and consumer handles: the move-only acquire/commit/abort and
//! acquire/release protocol built on top of [`crate::segment::Segment`]
//! and [`crate::slot::Slot`].
//!
//! Each process attaches its own independent mapping of the same named
//! segment — there is exactly one `Producer` per segment (single-writer),
//! and up to [`crate::header::MAX_CONSUMERS`] concurrent `Consumer`s,
//! policy permitting. A blocked `acquire` spins with capped exponential
//! backoff rather than waiting on a condition variable; shared memory has
//! no cross-process condvar, and the short-hold nature of a slot
//! acquisition makes a wait primitive more machinery than the common case
//! needs.

use crate::checksum::checksum_of;
use crate::clock::monotonic_now_ns;
use crate::config::{ChecksumPolicy, SegmentConfig};
use crate::error::{DataHubError, Result};
use crate::header::MAX_CONSUMERS;
use crate::policy::{check_consumer_admission, DeliveryPolicy, RingFullAction};
use crate::recovery::is_alive;
use crate::segment::{CreateIdentity, Segment};
use crate::slot::SlotState;
use std::slice;
use std::time::{Duration, Instant};

const BACKOFF_START: Duration = Duration::from_micros(1);
const BACKOFF_MAX: Duration = Duration::from_millis(1);

/// The single producer attached to a segment.
pub struct Producer {
    segment: Segment,
    pid: u64,
    policy: DeliveryPolicy,
    drain_timeout: Duration,
}

impl Producer {
    /// Create a brand-new segment and become its producer.
    pub fn create(
        name: &str,
        config: &SegmentConfig,
        identity: CreateIdentity<'_>,
        shared_secret: [u8; 32],
        slot_schema_hash: u64,
        flex_zone_schema_hash: u64,
    ) -> Result<Self> {
        let segment = Segment::create(
            name,
            config.capacity,
            config.payload_bytes,
            config.flex_zone_bytes,
            config.policy.to_raw(),
            shared_secret,
            slot_schema_hash,
            flex_zone_schema_hash,
            identity,
        )?;
        let pid = std::process::id() as u64;
        segment.header().producer_liveness.heartbeat(pid, monotonic_now_ns());
        Ok(Self {
            segment,
            pid,
            policy: config.policy,
            drain_timeout: config.drain_timeout,
        })
    }

    /// Attach as producer to an existing segment, e.g. after recovery has
    /// confirmed the prior producer is dead. Sequencing resumes from
    /// whatever `write_index` the header already holds; there is no
    /// separate producer-local cursor to re-seed.
    pub fn write_attach(
        name: &str,
        shared_secret: &[u8; 32],
        slot_schema_hash: u64,
        flex_zone_schema_hash: u64,
        drain_timeout: Duration,
    ) -> Result<Self> {
        let segment = Segment::attach(name, shared_secret, slot_schema_hash, flex_zone_schema_hash)?;
        let policy = DeliveryPolicy::from_raw(segment.header().policy_raw())?;
        let pid = std::process::id() as u64;
        segment.header().producer_liveness.heartbeat(pid, monotonic_now_ns());
        Ok(Self {
            segment,
            pid,
            policy,
            drain_timeout,
        })
    }

    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid
    }

    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn heartbeat(&self) {
        self.segment.header().producer_liveness.heartbeat(self.pid, monotonic_now_ns());
    }

    /// The ring-full barrier's comparison point, or `None` if the policy
    /// disables the barrier entirely (`LatestOnly`). `read_index` already
    /// tracks the frontier under `SingleReader` and the live minimum across
    /// named consumers under `SyncReader` — each consumer only advances it
    /// on releasing the slot that currently sits at that frontier, so a
    /// consumer that falls behind holds it back for everyone, and a dead
    /// one is dropped from the computation the moment recovery reclaims it.
    fn ring_full_barrier_threshold(&self) -> Option<u64> {
        match self.policy {
            DeliveryPolicy::LatestOnly => None,
            DeliveryPolicy::SingleReader | DeliveryPolicy::SyncReader => {
                Some(self.segment.header().read_index())
            }
        }
    }

    /// Non-blocking acquire. `Ok(None)` means the ring-full barrier is
    /// holding (`SingleReader`/`SyncReader`) or the wrap target is draining
    /// (`LatestOnly`); the caller should retry.
    pub fn try_acquire(&mut self) -> Result<Option<WriteGuard<'_>>> {
        let pid = self.pid;
        if !self.segment.header().write_lock.try_lock(pid) {
            self.segment.header().write_lock.reclaim_if_dead(is_alive);
            if !self.segment.header().write_lock.try_lock(pid) {
                return Ok(None);
            }
        }

        let capacity = u64::from(self.segment.layout().capacity);
        let next = self.segment.header().write_index();

        if let Some(threshold) = self.ring_full_barrier_threshold() {
            if next.saturating_sub(threshold) >= capacity {
                self.segment.header().write_lock.unlock(pid);
                return Ok(None);
            }
        }

        let idx = (next % capacity) as u32;
        let slot = self.segment.slot(idx);

        let began = if slot.try_begin_write(next, pid) {
            true
        } else {
            match self.policy.ring_full_action() {
                RingFullAction::WrapOldest => {
                    if slot.try_begin_write_over_committed(next, pid) {
                        true
                    } else {
                        slot.begin_drain(monotonic_now_ns());
                        false
                    }
                }
                RingFullAction::Block => false,
            }
        };

        // Only a successful write advances `write_index`; the slot that
        // just entered DRAINING keeps its old `slot_id` and is retried at
        // this same `next` once the drain resolves (either the reader
        // releases, or the drain timeout restores it to COMMITTED).
        if began {
            self.segment.header().publish_write_index(next + 1);
        }
        self.segment.header().write_lock.unlock(pid);

        if began {
            Ok(Some(WriteGuard {
                producer: self,
                index: idx,
                slot_id: next,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Blocking acquire, bounded by `timeout`. Under `LatestOnly`, also
    /// reclaims a wrap target stuck in `DRAINING` past `drain_timeout`.
    pub fn acquire(&mut self, timeout: Duration) -> Result<WriteGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;
        loop {
            match self.try_acquire()? {
                Some(guard) => return Ok(guard),
                None => {
                    if self.policy == DeliveryPolicy::LatestOnly {
                        self.reclaim_expired_drain();
                    }
                    if Instant::now() >= deadline {
                        if self.policy == DeliveryPolicy::LatestOnly {
                            self.segment.header().metrics.inc_timeout_drain();
                            return Err(DataHubError::Timeout);
                        }
                        self.segment.header().metrics.inc_timeout_ring_full();
                        return Err(DataHubError::RingFull);
                    }
                    std::thread::sleep(backoff.min(BACKOFF_MAX));
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    fn reclaim_expired_drain(&self) {
        let capacity = u64::from(self.segment.layout().capacity);
        let next = self.segment.header().write_index();
        let idx = (next % capacity) as u32;
        let slot = self.segment.slot(idx);
        if slot.state() == Some(SlotState::Draining) {
            let elapsed = monotonic_now_ns().saturating_sub(slot.drain_started_ns());
            if elapsed > self.drain_timeout.as_nanos() as u64 {
                slot.restore_from_drain();
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.segment.header().producer_liveness.clear();
    }
}

/// A move-only, exclusively-held write handle on one slot. Dropping
/// without `commit`/`abort` reverts the slot to `FREE` (panic safety).
pub struct WriteGuard<'a> {
    producer: &'a mut Producer,
    index: u32,
    slot_id: u64,
    released: bool,
}

impl<'a> WriteGuard<'a> {
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.producer.segment.payload_capacity()
    }

    /// Mutable payload buffer, `capacity()` bytes. Only the first `len`
    /// bytes passed to `commit` are considered valid.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let ptr = self.producer.segment.slot_payload(self.index);
        let len = self.producer.segment.payload_capacity();
        // SAFETY: this slot is `WRITING`, owned exclusively by this
        // producer (single-writer discipline); no other process may touch
        // the payload region until `commit`/`abort` releases it.
        unsafe { slice::from_raw_parts_mut(ptr, len) }
    }

    /// Publish the first `len` bytes of the payload as the slot's content.
    pub fn commit(mut self, len: usize) -> Result<()> {
        let capacity = self.producer.segment.payload_capacity();
        if len > capacity {
            return Err(DataHubError::PayloadTooLarge { size: len, capacity });
        }
        let ptr = self.producer.segment.slot_payload(self.index);
        // SAFETY: see `payload_mut`; `len <= capacity` checked above.
        let bytes = unsafe { slice::from_raw_parts(ptr, len) };
        let checksum = checksum_of(bytes);
        self.producer.segment.slot(self.index).commit(checksum);
        self.producer.segment.header().metrics.inc_writes();
        self.released = true;
        Ok(())
    }

    /// Abandon the write; the slot returns to `FREE` without publishing.
    pub fn abort(mut self) {
        self.producer.segment.slot(self.index).revert_zombie_write(self.producer.pid);
        self.released = true;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.producer.segment.slot(self.index).revert_zombie_write(self.producer.pid);
        }
    }
}

/// An attached consumer. Dropped cleanly, it releases its liveness row
/// immediately rather than waiting for the heartbeat timeout.
pub struct Consumer {
    segment: Segment,
    pid: u64,
    row: usize,
    policy: DeliveryPolicy,
    /// Private forward cursor. Only meaningful (and only advanced) under
    /// `SyncReader`; `LatestOnly`/`SingleReader` recompute their candidate
    /// slot fresh from the shared header on every acquire instead.
    next_seq: u64,
    checksum_policy: ChecksumPolicy,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn attach(
        name: &str,
        shared_secret: &[u8; 32],
        slot_schema_hash: u64,
        flex_zone_schema_hash: u64,
        consumer_uid: &[u8],
        consumer_name: &[u8],
        checksum_policy: ChecksumPolicy,
    ) -> Result<Self> {
        let segment = Segment::attach(name, shared_secret, slot_schema_hash, flex_zone_schema_hash)?;
        let policy = DeliveryPolicy::from_raw(segment.header().policy_raw())?;

        let liveness = &segment.header().consumer_liveness;
        let live_count = liveness.iter().filter(|row| row.is_claimed()).count();
        let existing_pid = liveness.iter().find(|row| row.is_claimed()).map(|row| row.pid());
        check_consumer_admission(policy, live_count, MAX_CONSUMERS, existing_pid)?;

        let pid = std::process::id() as u64;
        let now = monotonic_now_ns();
        let row = liveness
            .iter()
            .position(|row| row.try_claim(pid, consumer_uid, consumer_name, now))
            .ok_or(DataHubError::PolicyViolation(
                crate::policy::PolicyViolation::ConsumerTableFull,
            ))?;

        // SingleReader has exactly one logical consumer stream, so a fresh
        // attach resumes the full backlog from the persisted low-water
        // mark. SyncReader/LatestOnly are broadcast-style: a late joiner
        // starts at the live tail rather than replaying history.
        let next_seq = if policy == DeliveryPolicy::SingleReader {
            segment.header().read_index()
        } else {
            segment.header().write_index()
        };
        segment.header().consumer_liveness[row].set_pending_slot_id(next_seq);

        Ok(Self {
            segment,
            pid,
            row,
            policy,
            next_seq,
            checksum_policy,
        })
    }

    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid
    }

    #[must_use]
    pub fn row(&self) -> usize {
        self.row
    }

    #[must_use]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn heartbeat(&self) {
        self.segment.header().consumer_liveness[self.row].heartbeat(monotonic_now_ns());
    }

    /// Whether releasing `slot_id` from this row may transition the slot
    /// to `FREE`. Under `LatestOnly`/`SingleReader` this is always true
    /// (no other named consumer can hold it back). Under `SyncReader`,
    /// freeing is gated on the live minimum `pending_slot_id` across every
    /// claimed consumer row: a slot must not be reclaimed ahead of the
    /// slowest still-live consumer, even if every consumer that actually
    /// attempted this slot has already released it.
    fn may_free_after_release(&self, slot_id: u64) -> bool {
        if self.policy != DeliveryPolicy::SyncReader {
            return true;
        }
        self.segment
            .header()
            .min_live_pending_slot_id()
            .map_or(true, |min_pending| min_pending > slot_id)
    }

    /// The next slot this consumer should try, by policy. `LatestOnly` and
    /// `SingleReader` have no private state to get out of sync — they just
    /// read the shared frontier fresh every call. `None` means nothing has
    /// ever been published (`LatestOnly` only, before the first commit).
    fn candidate_slot_id(&self) -> Option<u64> {
        match self.policy {
            DeliveryPolicy::LatestOnly => {
                let write_index = self.segment.header().write_index();
                if write_index == 0 {
                    None
                } else {
                    Some(write_index - 1)
                }
            }
            DeliveryPolicy::SingleReader => Some(self.segment.header().read_index()),
            DeliveryPolicy::SyncReader => Some(self.next_seq),
        }
    }

    /// Non-blocking acquire. `Ok(None)` means nothing new is ready yet.
    pub fn try_acquire(&mut self) -> Result<Option<ReadGuard<'_>>> {
        let Some(candidate) = self.candidate_slot_id() else {
            return Ok(None);
        };
        let capacity = u64::from(self.segment.layout().capacity);
        let idx = (candidate % capacity) as u32;
        let row = self.row;

        match self.segment.slot(idx).try_begin_read(candidate, row) {
            crate::slot::ReadAttempt::Ok => {
                if self.policy == DeliveryPolicy::SyncReader {
                    self.segment.header().consumer_liveness[row].set_pending_slot_id(candidate);
                }
                let reader_count = self.segment.slot(idx).reader_count();
                self.segment.header().metrics.observe_reader_count(reader_count);
                Ok(Some(ReadGuard {
                    consumer: self,
                    index: idx,
                    slot_id: candidate,
                    released: false,
                }))
            }
            crate::slot::ReadAttempt::NotReady | crate::slot::ReadAttempt::WrongSequence => Ok(None),
        }
    }

    /// Blocking acquire, bounded by `timeout`.
    pub fn acquire(&mut self, timeout: Duration) -> Result<ReadGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;
        loop {
            match self.try_acquire()? {
                Some(guard) => return Ok(guard),
                None => {
                    if Instant::now() >= deadline {
                        return Err(DataHubError::Timeout);
                    }
                    std::thread::sleep(backoff.min(BACKOFF_MAX));
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.segment.header().consumer_liveness[self.row].release();
    }
}

/// A move-only, shared-or-exclusive read handle on one slot (shared with
/// other concurrent readers of the same `slot_id` under `LatestOnly`/
/// `SyncReader`). Dropping without `release` still frees the hold.
pub struct ReadGuard<'a> {
    consumer: &'a mut Consumer,
    index: u32,
    slot_id: u64,
    released: bool,
}

impl<'a> ReadGuard<'a> {
    #[must_use]
    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        let ptr = self.consumer.segment.slot_payload(self.index);
        let len = self.consumer.segment.payload_capacity();
        // SAFETY: this slot is `COMMITTED`/`CONSUMING`, never mutated
        // again by the producer until every reader (including this one)
        // releases it.
        unsafe { slice::from_raw_parts(ptr, len) }
    }

    /// Release the slot. Returns `Err(ChecksumError)` if the payload's
    /// checksum doesn't match what the producer committed and
    /// `checksum_policy` is `Enforced`; the slot is freed either way.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        let expected = self.consumer.segment.slot(self.index).checksum();
        let actual = checksum_of(self.payload());

        if self.consumer.policy == DeliveryPolicy::SyncReader {
            self.consumer.next_seq = self.slot_id + 1;
            self.consumer.segment.header().consumer_liveness[self.consumer.row]
                .set_pending_slot_id(self.consumer.next_seq);
        }
        // Computed after publishing this row's own advanced pending_slot_id
        // above, so the live minimum already reflects this release.
        let may_free = self.consumer.may_free_after_release(self.slot_id);
        self.consumer.segment.slot(self.index).release_read(self.consumer.row, may_free);

        let header = self.consumer.segment.header();
        if self.consumer.policy == DeliveryPolicy::SyncReader {
            // `read_index` tracks the minimum live pending slot, not any one
            // reader's frontier — a slow named consumer must hold this back
            // rather than be silently skipped past.
            if let Some(min_pending) = header.min_live_pending_slot_id() {
                header.advance_read_index_to(min_pending);
            }
        } else if self.slot_id == header.read_index() {
            // Only the frontier slot actually moves `read_index`; a faster
            // reader releasing ahead of a slower one leaves it alone so it
            // can't skip the slow reader past data it hasn't seen yet.
            header.advance_read_index_to(self.slot_id + 1);
        }
        header.metrics.inc_reads();

        if actual != expected {
            log::warn!("checksum mismatch on slot_id {}", self.slot_id);
            header.metrics.inc_checksum_errors();
            if self.consumer.checksum_policy == ChecksumPolicy::Enforced {
                return Err(DataHubError::ChecksumError { slot_id: self.slot_id });
            }
        }
        Ok(())
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            let may_free = self.consumer.may_free_after_release(self.slot_id);
            self.consumer.segment.slot(self.index).release_read(self.consumer.row, may_free);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/datahub_proto_{tag}_{ts}")
    }

    fn identity() -> CreateIdentity<'static> {
        CreateIdentity {
            hub_uid: b"hub-1",
            hub_name: b"Lab Hub",
            producer_uid: b"prod-1",
            producer_name: b"Producer One",
        }
    }

    #[test]
    fn single_reader_produce_consume_round_trip() {
        let name = unique_name("roundtrip");
        let config = SegmentConfig::new(4, 64, DeliveryPolicy::SingleReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [1u8; 32], 10, 20).unwrap();

        let mut guard = producer.try_acquire().unwrap().expect("free slot");
        guard.payload_mut()[..5].copy_from_slice(b"hello");
        guard.commit(5).unwrap();

        let mut consumer = Consumer::attach(
            &name,
            &[1u8; 32],
            10,
            20,
            b"consumer-uid",
            b"consumer-a",
            ChecksumPolicy::Enforced,
        )
        .unwrap();

        let read = consumer.try_acquire().unwrap().expect("data ready");
        assert_eq!(&read.payload()[..5], b"hello");
        read.release().unwrap();

        drop(consumer);
        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn single_reader_blocks_when_ring_is_full() {
        let name = unique_name("full");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SingleReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [2u8; 32], 1, 1).unwrap();

        for _ in 0..2 {
            let guard = producer.try_acquire().unwrap().expect("free slot");
            guard.commit(0).unwrap();
        }
        // Ring full: no consumer has released anything yet.
        assert!(producer.try_acquire().unwrap().is_none());
        let result = producer.acquire(Duration::from_millis(20));
        assert!(matches!(result, Err(DataHubError::RingFull)));

        Segment::unlink(&name).ok();
    }

    #[test]
    fn single_reader_unblocks_after_consumer_releases() {
        let name = unique_name("unblock");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SingleReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [3u8; 32], 1, 1).unwrap();
        for _ in 0..2 {
            producer.try_acquire().unwrap().unwrap().commit(0).unwrap();
        }

        let mut consumer = Consumer::attach(
            &name,
            &[3u8; 32],
            1,
            1,
            b"c",
            b"c",
            ChecksumPolicy::Enforced,
        )
        .unwrap();
        consumer.try_acquire().unwrap().unwrap().release().unwrap();

        let guard = producer.acquire(Duration::from_millis(200)).expect("slot freed");
        guard.commit(0).unwrap();

        drop(consumer);
        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn latest_only_wraps_instead_of_blocking() {
        let name = unique_name("latest");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::LatestOnly);
        let mut producer =
            Producer::create(&name, &config, identity(), [4u8; 32], 1, 1).unwrap();

        for i in 0..5u8 {
            let mut guard = producer.try_acquire().unwrap().expect("never blocks");
            guard.payload_mut()[0] = i;
            guard.commit(1).unwrap();
        }
        assert_eq!(producer.segment().header().write_index(), 5);

        Segment::unlink(&name).ok();
    }

    #[test]
    fn checksum_mismatch_is_reported_and_slot_still_frees() {
        let name = unique_name("checksum");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SingleReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [5u8; 32], 1, 1).unwrap();
        let guard = producer.try_acquire().unwrap().unwrap();
        guard.commit(0).unwrap();

        // Corrupt the payload after commit without updating the checksum.
        // SAFETY: test-only tampering to exercise the mismatch path; no
        // other process touches this slot's payload at this time.
        unsafe {
            *producer.segment().slot_payload(0) = 0xff;
        }

        let mut consumer = Consumer::attach(
            &name,
            &[5u8; 32],
            1,
            1,
            b"c",
            b"c",
            ChecksumPolicy::Enforced,
        )
        .unwrap();
        let read = consumer.try_acquire().unwrap().unwrap();
        let result = read.release();
        assert!(matches!(result, Err(DataHubError::ChecksumError { .. })));
        // The slot must still be freed despite the checksum failure.
        assert_eq!(producer.segment().slot(0).state(), Some(SlotState::Free));

        drop(consumer);
        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn second_consumer_rejected_under_single_reader() {
        let name = unique_name("second");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SingleReader);
        let producer = Producer::create(&name, &config, identity(), [6u8; 32], 1, 1).unwrap();
        let _c1 = Consumer::attach(&name, &[6u8; 32], 1, 1, b"a", b"a", ChecksumPolicy::Enforced).unwrap();
        let c2 = Consumer::attach(&name, &[6u8; 32], 1, 1, b"b", b"b", ChecksumPolicy::Enforced);
        assert!(c2.is_err());

        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn dropping_an_unreleased_write_guard_reverts_to_free() {
        let name = unique_name("abort_drop");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SingleReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [7u8; 32], 1, 1).unwrap();
        {
            let _guard = producer.try_acquire().unwrap().unwrap();
            // Dropped without commit/abort.
        }
        assert_eq!(producer.segment().slot(0).state(), Some(SlotState::Free));
        Segment::unlink(&name).ok();
    }

    #[test]
    fn latest_only_retries_the_same_slot_id_after_a_drain_resolves() {
        let name = unique_name("drain");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::LatestOnly);
        let mut producer =
            Producer::create(&name, &config, identity(), [12u8; 32], 1, 1).unwrap();

        // slot_id 0 at idx0, slot_id 1 at idx1.
        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();
        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();

        let mut consumer =
            Consumer::attach(&name, &[12u8; 32], 1, 1, b"c", b"c", ChecksumPolicy::Enforced)
                .unwrap();
        let held = consumer.try_acquire().unwrap().expect("latest slot_id is ready");
        assert_eq!(held.slot_id(), 1);

        // Wraps slot_id 2 over the now-idle idx0 (slot_id 0, nobody reading it).
        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();
        assert_eq!(producer.segment().header().write_index(), 3);

        // The next wrap target is idx1, which `held` is still reading: the
        // producer must enter DRAINING rather than stomp it, and must not
        // advance `write_index` on that attempt.
        assert!(producer.try_acquire().unwrap().is_none());
        assert_eq!(producer.segment().header().write_index(), 3);

        held.release().unwrap();

        // Drain resolved; the producer retries the same slot_id it was
        // stuck on rather than skipping ahead.
        let guard = producer.try_acquire().unwrap().expect("drain resolved");
        assert_eq!(guard.slot_id(), 3);
        guard.commit(0).unwrap();

        drop(consumer);
        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn sync_reader_barrier_waits_for_every_named_consumer_on_the_frontier_slot() {
        let name = unique_name("sync_barrier");
        let config = SegmentConfig::new(2, 16, DeliveryPolicy::SyncReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [13u8; 32], 1, 1).unwrap();

        let mut c1 =
            Consumer::attach(&name, &[13u8; 32], 1, 1, b"c1", b"c1", ChecksumPolicy::Enforced)
                .unwrap();
        let mut c2 =
            Consumer::attach(&name, &[13u8; 32], 1, 1, b"c2", b"c2", ChecksumPolicy::Enforced)
                .unwrap();

        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();
        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();

        // Ring full: neither consumer has read the frontier slot yet.
        assert!(producer.try_acquire().unwrap().is_none());

        let g1 = c1.try_acquire().unwrap().expect("slot_id 0 ready for c1");
        let g2 = c2.try_acquire().unwrap().expect("slot_id 0 ready for c2");
        g1.release().unwrap();

        // c1 alone releasing the frontier isn't enough; c2 still holds it.
        assert!(producer.try_acquire().unwrap().is_none());

        g2.release().unwrap();

        // Both named consumers have now released slot_id 0; the barrier lifts.
        let guard = producer.acquire(Duration::from_millis(200)).expect("frontier freed");
        assert_eq!(guard.slot_id(), 2);
        guard.commit(0).unwrap();

        drop(c1);
        drop(c2);
        drop(producer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn sync_reader_lagging_consumer_is_never_skipped_past() {
        let name = unique_name("sync_lag");
        let config = SegmentConfig::new(4, 16, DeliveryPolicy::SyncReader);
        let mut producer =
            Producer::create(&name, &config, identity(), [14u8; 32], 1, 1).unwrap();

        let mut fast =
            Consumer::attach(&name, &[14u8; 32], 1, 1, b"fast", b"fast", ChecksumPolicy::Enforced)
                .unwrap();
        let mut slow =
            Consumer::attach(&name, &[14u8; 32], 1, 1, b"slow", b"slow", ChecksumPolicy::Enforced)
                .unwrap();

        producer.try_acquire().unwrap().unwrap().commit(0).unwrap();

        // The fast consumer reads and releases slot_id 0 immediately; the
        // slow consumer never even attempts it yet.
        let g = fast.try_acquire().unwrap().expect("slot_id 0 ready for fast");
        g.release().unwrap();

        // The slot must not have been freed out from under the slow
        // consumer, and `read_index` must not have advanced past it.
        assert_eq!(producer.segment().slot(0).state(), Some(SlotState::Consuming));
        assert_eq!(producer.segment().header().read_index(), 0);

        // The slow consumer can still catch up and read the preserved data.
        let g = slow.try_acquire().unwrap().expect("slot_id 0 still readable by the slow consumer");
        assert_eq!(g.slot_id(), 0);
        g.release().unwrap();

        // Only now, with both named consumers past it, does the slot free
        // and the frontier advance.
        assert_eq!(producer.segment().slot(0).state(), Some(SlotState::Free));
        assert_eq!(producer.segment().header().read_index(), 1);

        drop(fast);
        drop(slow);
        drop(producer);
        Segment::unlink(&name).ok();
    }
}
