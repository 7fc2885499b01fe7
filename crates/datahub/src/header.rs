// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The segment header: a fixed 4 KiB region at offset 0 carrying magic,
//! version, layout hash, identity, liveness tables, and ring cursors.
//!
//! Offsets below match the illustrative on-disk layout table; the hashed
//! `layout_hash` (see [`crate::layout`]) is the authoritative contract
//! attach checks against, but keeping the concrete struct's field order in
//! sync with the documented offsets makes the header straightforward to
//! read with an external tool (the diagnostic CLI maps these same offsets
//! raw, without linking this crate).

use crate::spinlock::SharedSpinLock;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "DHUB" as big-endian bytes, read back as this constant on any host.
pub const MAGIC: u32 = 0x4448_5542;
pub const VERSION: u32 = 1;

pub const HUB_UID_LEN: usize = 40;
pub const HUB_NAME_LEN: usize = 64;
pub const PRODUCER_UID_LEN: usize = 40;
pub const PRODUCER_NAME_LEN: usize = 64;
pub const CONSUMER_UID_LEN: usize = 32;
pub const CONSUMER_NAME_LEN: usize = 64;

/// Bounded consumer liveness table size. A fixed array, not a heap
/// collection, since this header must live in shared memory where nothing
/// with a private heap allocation is visible across processes.
pub const MAX_CONSUMERS: usize = 8;

/// Total header size, fixed by the on-disk layout table.
pub const HEADER_SIZE: usize = 0x1000;

/// Sentinel PID meaning "unclaimed" for a liveness row, and "free" for the
/// write-lock.
pub const NO_PID: u64 = 0;

/// `hub_uid`, `hub_name`, `producer_uid`, `producer_name`: written once at
/// create, never mutated afterward (P6). Write-attach by a different
/// writer process must not touch this block.
#[repr(C)]
pub struct IdentityBlock {
    pub hub_uid: [u8; HUB_UID_LEN],
    pub hub_name: [u8; HUB_NAME_LEN],
    pub producer_uid: [u8; PRODUCER_UID_LEN],
    pub producer_name: [u8; PRODUCER_NAME_LEN],
}

impl IdentityBlock {
    pub fn write(&mut self, hub_uid: &[u8], hub_name: &[u8], producer_uid: &[u8], producer_name: &[u8]) {
        copy_truncated(&mut self.hub_uid, hub_uid);
        copy_truncated(&mut self.hub_name, hub_name);
        copy_truncated(&mut self.producer_uid, producer_uid);
        copy_truncated(&mut self.producer_name, producer_name);
    }

    #[must_use]
    pub fn hub_uid(&self) -> &[u8] {
        trim_trailing_zeros(&self.hub_uid)
    }

    #[must_use]
    pub fn hub_name(&self) -> &[u8] {
        trim_trailing_zeros(&self.hub_name)
    }

    #[must_use]
    pub fn producer_uid(&self) -> &[u8] {
        trim_trailing_zeros(&self.producer_uid)
    }

    #[must_use]
    pub fn producer_name(&self) -> &[u8] {
        trim_trailing_zeros(&self.producer_name)
    }
}

fn copy_truncated(dst: &mut [u8], src: &[u8]) {
    dst.fill(0);
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn trim_trailing_zeros(buf: &[u8]) -> &[u8] {
    let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &buf[..end]
}

/// Producer liveness: PID, an incrementing heartbeat id, and the
/// monotonic-ns timestamp of the last heartbeat. Used only for liveness,
/// never for sequencing.
#[repr(C)]
pub struct ProducerLiveness {
    pid: AtomicU64,
    heartbeat_id: AtomicU64,
    heartbeat_ns: AtomicU64,
    _reserved: u64,
}

impl ProducerLiveness {
    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn heartbeat_id(&self) -> u64 {
        self.heartbeat_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn heartbeat_ns(&self) -> u64 {
        self.heartbeat_ns.load(Ordering::Acquire)
    }

    /// Claim (or re-publish) producer ownership and bump the heartbeat.
    pub fn heartbeat(&self, pid: u64, now_ns: u64) {
        self.heartbeat_id.fetch_add(1, Ordering::AcqRel);
        self.heartbeat_ns.store(now_ns, Ordering::Release);
        self.pid.store(pid, Ordering::Release);
    }

    pub fn clear(&self) {
        self.pid.store(NO_PID, Ordering::Release);
    }
}

/// Atomic diagnostic counters, incremented by whichever call already
/// touched the relevant code path (no extra synchronization beyond
/// `Relaxed`; these are observational, never load-bearing for a
/// correctness invariant).
#[repr(C)]
#[derive(Debug, Default)]
pub struct SegmentMetrics {
    writes_total: AtomicU64,
    reads_total: AtomicU64,
    timeouts_ring_full: AtomicU64,
    timeouts_drain: AtomicU64,
    reader_peak: AtomicU64,
    checksum_errors: AtomicU64,
}

impl SegmentMetrics {
    pub fn inc_writes(&self) {
        self.writes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_reads(&self) {
        self.reads_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeout_ring_full(&self) {
        self.timeouts_ring_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeout_drain(&self) {
        self.timeouts_drain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checksum_errors(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_reader_count(&self, count: u32) {
        self.reader_peak.fetch_max(u64::from(count), Ordering::Relaxed);
    }

    #[must_use]
    pub fn writes_total(&self) -> u64 {
        self.writes_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reads_total(&self) -> u64 {
        self.reads_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timeouts_ring_full(&self) -> u64 {
        self.timeouts_ring_full.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn timeouts_drain(&self) -> u64 {
        self.timeouts_drain.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reader_peak(&self) -> u64 {
        self.reader_peak.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors.load(Ordering::Relaxed)
    }
}

const _: () = assert!(std::mem::size_of::<SegmentMetrics>() == 48);

/// One row of the consumer liveness table. `pid` is the CAS claim signal:
/// `consumer_uid`/`consumer_name` live in an `UnsafeCell` (mirroring how a
/// slot's payload is interior-mutable under single-writer discipline,
/// [`crate::slot`]) because they are written after the row is already
/// shared. They are written first — the CAS winner has exclusive access
/// until it publishes `pid` — then `pid` is published with
/// `Ordering::Release`. Readers load `pid` with `Ordering::Acquire` before
/// reading the name fields, so a row observed with a non-zero PID always
/// has fully-populated identity bytes (P7).
#[repr(C)]
pub struct ConsumerLivenessRow {
    pid: AtomicU64,
    heartbeat_ns: AtomicU64,
    consumer_uid: UnsafeCell<[u8; CONSUMER_UID_LEN]>,
    consumer_name: UnsafeCell<[u8; CONSUMER_NAME_LEN]>,
    pending_slot_id: AtomicU64,
    _reserved: u64,
}

// SAFETY: the `UnsafeCell` fields are only ever mutated by whichever
// process currently owns the row (holds the PID claim via CAS), and only
// ever read by others after observing that claim with Acquire ordering on
// `pid`. The struct lives in shared memory across processes by design.
unsafe impl Sync for ConsumerLivenessRow {}

impl ConsumerLivenessRow {
    #[must_use]
    pub fn pid(&self) -> u64 {
        self.pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.pid() != NO_PID
    }

    #[must_use]
    pub fn heartbeat_ns(&self) -> u64 {
        self.heartbeat_ns.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn consumer_uid(&self) -> &[u8] {
        // SAFETY: caller only reaches here after observing a claimed PID
        // (Acquire), which happens-after the claimer's writes below.
        trim_trailing_zeros(unsafe { &*self.consumer_uid.get() })
    }

    #[must_use]
    pub fn consumer_name(&self) -> &[u8] {
        // SAFETY: see `consumer_uid`.
        trim_trailing_zeros(unsafe { &*self.consumer_name.get() })
    }

    #[must_use]
    pub fn pending_slot_id(&self) -> u64 {
        self.pending_slot_id.load(Ordering::Acquire)
    }

    pub fn set_pending_slot_id(&self, slot_id: u64) {
        self.pending_slot_id.store(slot_id, Ordering::Release);
    }

    /// Attempt to claim this row for `pid`. Fails if already claimed.
    pub fn try_claim(&self, pid: u64, consumer_uid: &[u8], consumer_name: &[u8], now_ns: u64) -> bool {
        if self
            .pid
            .compare_exchange(NO_PID, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: we just won the CAS claiming this row; no other claimer
        // can touch these cells until we release (zero) the PID again.
        unsafe {
            copy_truncated(&mut *self.consumer_uid.get(), consumer_uid);
            copy_truncated(&mut *self.consumer_name.get(), consumer_name);
        }
        self.heartbeat_ns.store(now_ns, Ordering::Release);
        self.pending_slot_id.store(0, Ordering::Release);
        true
    }

    pub fn heartbeat(&self, now_ns: u64) {
        self.heartbeat_ns.store(now_ns, Ordering::Release);
    }

    /// Release this row: zero identity before clearing the PID, mirroring
    /// create order so a half-released row is never mistaken for claimed.
    pub fn release(&self) {
        // SAFETY: caller is the row's current owner (checked by the caller
        // against its own PID before calling release), so no concurrent
        // writer can be touching these cells.
        unsafe {
            (*self.consumer_uid.get()).fill(0);
            (*self.consumer_name.get()).fill(0);
        }
        self.pending_slot_id.store(0, Ordering::Release);
        self.heartbeat_ns.store(0, Ordering::Release);
        self.pid.store(NO_PID, Ordering::Release);
    }
}

/// The full segment header, laid out to match the documented on-disk table.
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU32,
    version: AtomicU32,
    layout_hash: AtomicU64,
    shared_secret: [u8; 32],
    flex_zone_schema_hash: AtomicU64,
    slot_schema_hash: AtomicU64,
    pub identity: IdentityBlock,
    pub producer_liveness: ProducerLiveness,
    /// Guards the producer's acquire bookkeeping: computing `next`,
    /// checking the ring-full barrier, transitioning the target slot, and
    /// advancing `write_index`. Not held across the caller's fill/commit —
    /// only across that brief window, so a write-attach failover racing
    /// the dying producer can never pick the same `next`.
    pub write_lock: SharedSpinLock,
    pub consumer_liveness: [ConsumerLivenessRow; MAX_CONSUMERS],
    write_index: AtomicU64,
    read_index: AtomicU64,
    policy: AtomicU32,
    capacity: AtomicU32,
    payload_bytes: AtomicU32,
    flex_zone_bytes: AtomicU32,
    slot_stride: AtomicU32,
    _pad_to_8: u32,
    flex_zone_offset: AtomicU64,
    flex_zone_size: AtomicU64,
    pub flex_zone_lock: SharedSpinLock,
    flex_zone_checksum: AtomicU64,
    pub metrics: SegmentMetrics,
    _reserved: [u8; HEADER_SIZE
        - (4 + 4 + 8 + 32 + 8 + 8)
        - 208
        - 32
        - 16
        - (MAX_CONSUMERS * 128)
        - (8 + 8)
        - (4 + 4 + 4 + 4)
        - (4 + 4)
        - (8 + 8)
        - 16
        - 8
        - 48],
}

const _: () = assert!(std::mem::size_of::<IdentityBlock>() == 208);
const _: () = assert!(std::mem::size_of::<ProducerLiveness>() == 32);
const _: () = assert!(std::mem::size_of::<ConsumerLivenessRow>() == 128);
const _: () = assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);

impl SegmentHeader {
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn layout_hash(&self) -> u64 {
        self.layout_hash.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    #[must_use]
    pub fn flex_zone_schema_hash(&self) -> u64 {
        self.flex_zone_schema_hash.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn slot_schema_hash(&self) -> u64 {
        self.slot_schema_hash.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn read_index(&self) -> u64 {
        self.read_index.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn policy_raw(&self) -> u32 {
        self.policy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn payload_bytes(&self) -> u32 {
        self.payload_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn flex_zone_bytes(&self) -> u32 {
        self.flex_zone_bytes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn slot_stride(&self) -> u32 {
        self.slot_stride.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn flex_zone_offset(&self) -> u64 {
        self.flex_zone_offset.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn flex_zone_size(&self) -> u64 {
        self.flex_zone_size.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn flex_zone_checksum(&self) -> u64 {
        self.flex_zone_checksum.load(Ordering::Acquire)
    }

    pub fn set_flex_zone_checksum(&self, checksum: u64) {
        self.flex_zone_checksum.store(checksum, Ordering::Release);
    }

    /// Minimum `pending_slot_id` across every currently-claimed consumer
    /// row, i.e. the oldest slot any live consumer still has yet to read.
    /// `None` if no row is claimed. Under `SyncReader`, this — not any
    /// individual consumer's progress — is what the ring-full barrier and
    /// slot reclamation must gate on, so a slow consumer throttles the
    /// producer instead of being silently skipped past.
    #[must_use]
    pub fn min_live_pending_slot_id(&self) -> Option<u64> {
        self.consumer_liveness
            .iter()
            .filter(|row| row.is_claimed())
            .map(ConsumerLivenessRow::pending_slot_id)
            .min()
    }

    /// Advance `write_index` to `next`. Only the producer may call this,
    /// and only while holding the producer write-lock.
    pub fn publish_write_index(&self, next: u64) {
        self.write_index.store(next, Ordering::Release);
    }

    /// CAS `read_index` forward, used so out-of-order consumer releases
    /// under `SyncReader` cannot regress the frontier.
    pub fn advance_read_index_to(&self, new_value: u64) {
        let mut current = self.read_index.load(Ordering::Acquire);
        while new_value > current {
            match self.read_index.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Initialize a freshly-zeroed header in place. Called exactly once,
    /// by the creator, before the segment is published under its name.
    ///
    /// # Safety
    /// `header` must point at a zeroed, `HEADER_SIZE`-byte-or-larger region
    /// with no concurrent readers yet (true by construction: the creator
    /// calls this before any other process can have opened the segment by
    /// name).
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn init(
        header: *mut Self,
        layout_hash: u64,
        shared_secret: [u8; 32],
        flex_zone_schema_hash: u64,
        slot_schema_hash: u64,
        policy_raw: u32,
        capacity: u32,
        payload_bytes: u32,
        flex_zone_bytes: u32,
        slot_stride: u32,
        flex_zone_offset: u64,
        flex_zone_size: u64,
    ) {
        let h = &mut *header;
        h.magic.store(MAGIC, Ordering::Release);
        h.version.store(VERSION, Ordering::Release);
        h.layout_hash.store(layout_hash, Ordering::Release);
        h.shared_secret = shared_secret;
        h.flex_zone_schema_hash
            .store(flex_zone_schema_hash, Ordering::Release);
        h.slot_schema_hash.store(slot_schema_hash, Ordering::Release);
        h.write_index.store(0, Ordering::Release);
        h.read_index.store(0, Ordering::Release);
        h.policy.store(policy_raw, Ordering::Release);
        h.capacity.store(capacity, Ordering::Release);
        h.payload_bytes.store(payload_bytes, Ordering::Release);
        h.flex_zone_bytes.store(flex_zone_bytes, Ordering::Release);
        h.slot_stride.store(slot_stride, Ordering::Release);
        h.flex_zone_offset.store(flex_zone_offset, Ordering::Release);
        h.flex_zone_size.store(flex_zone_size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_exactly_4kib() {
        assert_eq!(std::mem::size_of::<SegmentHeader>(), 0x1000);
    }

    #[test]
    fn identity_block_write_and_read_round_trips_and_truncates() {
        let mut block = IdentityBlock {
            hub_uid: [0; HUB_UID_LEN],
            hub_name: [0; HUB_NAME_LEN],
            producer_uid: [0; PRODUCER_UID_LEN],
            producer_name: [0; PRODUCER_NAME_LEN],
        };
        block.write(b"hub-1", b"Lab Hub", b"prod-1", &[b'x'; 100]);
        assert_eq!(block.hub_uid(), b"hub-1");
        assert_eq!(block.hub_name(), b"Lab Hub");
        assert_eq!(block.producer_uid(), b"prod-1");
        assert_eq!(block.producer_name().len(), PRODUCER_NAME_LEN);
    }

    #[test]
    fn consumer_row_claim_requires_identity_before_pid_is_observable_claimed() {
        let row = ConsumerLivenessRow {
            pid: AtomicU64::new(0),
            heartbeat_ns: AtomicU64::new(0),
            consumer_uid: UnsafeCell::new([0; CONSUMER_UID_LEN]),
            consumer_name: UnsafeCell::new([0; CONSUMER_NAME_LEN]),
            pending_slot_id: AtomicU64::new(0),
            _reserved: 0,
        };
        assert!(!row.is_claimed());
        assert!(row.try_claim(42, b"c-uid", b"consumer-a", 1000));
        assert!(row.is_claimed());
        assert_eq!(row.pid(), 42);
        assert_eq!(row.consumer_uid(), b"c-uid");
        assert_eq!(row.consumer_name(), b"consumer-a");
        assert!(!row.try_claim(99, b"other", b"other", 2000), "already claimed");
        row.release();
        assert!(!row.is_claimed());
        assert!(row.consumer_uid().is_empty());
        assert!(row.consumer_name().is_empty());
    }

    #[test]
    fn producer_liveness_heartbeat_advances_id_and_ns() {
        let liveness = ProducerLiveness {
            pid: AtomicU64::new(0),
            heartbeat_id: AtomicU64::new(0),
            heartbeat_ns: AtomicU64::new(0),
            _reserved: 0,
        };
        liveness.heartbeat(7, 12345);
        assert_eq!(liveness.pid(), 7);
        assert_eq!(liveness.heartbeat_id(), 1);
        assert_eq!(liveness.heartbeat_ns(), 12345);
        liveness.heartbeat(7, 54321);
        assert_eq!(liveness.heartbeat_id(), 2);
        liveness.clear();
        assert_eq!(liveness.pid(), NO_PID);
    }

    #[test]
    fn advance_read_index_to_never_regresses() {
        let header = unsafe {
            let layout = std::alloc::Layout::new::<SegmentHeader>();
            let ptr = std::alloc::alloc_zeroed(layout) as *mut SegmentHeader;
            SegmentHeader::init(ptr, 0, [0; 32], 0, 0, 0, 4, 64, 0, 0, 0, 0);
            ptr
        };
        let header = unsafe { &*header };
        header.advance_read_index_to(5);
        assert_eq!(header.read_index(), 5);
        header.advance_read_index_to(3);
        assert_eq!(header.read_index(), 5, "must not regress");
        unsafe {
            std::alloc::dealloc(
                header as *const SegmentHeader as *mut u8,
                std::alloc::Layout::new::<SegmentHeader>(),
            );
        }
    }
}
