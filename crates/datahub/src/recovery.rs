// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Zombie detection, CAS-guarded recovery, integrity validation, and a
//! read-only diagnostics snapshot.
//!
//! Every step here is built on the same CAS-guarded primitives
//! [`crate::slot::Slot`] and [`crate::spinlock::SharedSpinLock`] already
//! expose, so `recover` is safe to call redundantly from more than one
//! process at once (a watchdog in every attached process, say): whichever
//! caller's CAS lands first does the reclaim, the rest observe it already
//! done and no-op.

use crate::checksum::checksum_of;
use crate::clock::monotonic_now_ns;
use crate::header::{MAX_CONSUMERS, MAGIC, VERSION};
use crate::layout::SegmentLayout;
use crate::policy::DeliveryPolicy;
use crate::segment::Segment;
use crate::slot::SlotState;
use std::slice;
use std::time::Duration;

/// How long [`validate_integrity`] will wait on `flex_zone_lock` before
/// giving up on that one check. A contended lock during a diagnostic pass
/// is a liveness hiccup, not evidence of corruption, so it is simply
/// skipped rather than treated as a fault.
const FLEX_ZONE_VALIDATE_TIMEOUT: Duration = Duration::from_millis(20);

/// Whether a process with this PID currently exists. `kill(pid, 0)` sends
/// no signal, only checks existence/permission.
#[must_use]
pub fn is_alive(pid: u64) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 is the documented existence probe; no signal is
    // actually delivered.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0
}

/// What a single `recover` pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub producer_reclaimed: bool,
    pub writes_reverted: u32,
    pub writes_abandoned: u32,
    pub consumer_rows_reclaimed: u32,
    pub flex_zone_lock_reclaimed: bool,
    pub write_lock_reclaimed: bool,
}

impl RecoveryReport {
    #[must_use]
    pub fn did_anything(&self) -> bool {
        self.producer_reclaimed
            || self.writes_reverted > 0
            || self.writes_abandoned > 0
            || self.consumer_rows_reclaimed > 0
            || self.flex_zone_lock_reclaimed
            || self.write_lock_reclaimed
    }
}

/// Scan a segment for a dead producer or dead consumers past their
/// heartbeat timeout and reclaim what they held. Idempotent and safe to
/// call from multiple processes concurrently.
pub fn recover(
    segment: &Segment,
    writer_heartbeat_timeout: Duration,
    consumer_heartbeat_timeout: Duration,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let header = segment.header();
    let now = monotonic_now_ns();

    let producer_pid = header.producer_liveness.pid();
    if producer_pid != 0 && !is_alive(producer_pid) {
        let stale = now.saturating_sub(header.producer_liveness.heartbeat_ns())
            > writer_heartbeat_timeout.as_nanos() as u64;
        if stale {
            let write_index = header.write_index();
            let tip_slot_id = write_index.saturating_sub(1);
            for idx in 0..header.capacity() {
                let slot = segment.slot(idx);
                if slot.state() != Some(SlotState::Writing) || slot.owner_pid() != producer_pid {
                    continue;
                }
                if slot.slot_id() == tip_slot_id {
                    if slot.revert_zombie_write(producer_pid) {
                        report.writes_reverted += 1;
                    }
                } else if slot.abandon_zombie_write(producer_pid) {
                    report.writes_abandoned += 1;
                }
            }
            header.producer_liveness.clear();
            report.producer_reclaimed = true;
        }
    }

    if header.write_lock.reclaim_if_dead(is_alive) {
        report.write_lock_reclaimed = true;
    }

    let policy = DeliveryPolicy::from_raw(header.policy_raw()).ok();

    // Release each dead, stale row's claim *before* reclaiming the slots it
    // held, so the live-minimum computed below already excludes it — a
    // zombie consumer's last pending slot_id must not go on holding
    // `read_index` (and so the producer's ring-full barrier) back forever
    // under SyncReader.
    let mut reclaimed_rows = Vec::new();
    for row_idx in 0..MAX_CONSUMERS {
        let row = &header.consumer_liveness[row_idx];
        let pid = row.pid();
        if pid == 0 || is_alive(pid) {
            continue;
        }
        let stale =
            now.saturating_sub(row.heartbeat_ns()) > consumer_heartbeat_timeout.as_nanos() as u64;
        if !stale {
            continue;
        }
        row.release();
        reclaimed_rows.push(row_idx);
        report.consumer_rows_reclaimed += 1;
    }

    if !reclaimed_rows.is_empty() {
        // No claimed rows left: nothing to recompute a minimum over. Leave
        // `read_index` at its persisted low-water mark so a future consumer
        // still resumes the backlog instead of silently skipping it.
        let min_pending = header.min_live_pending_slot_id();
        for &row_idx in &reclaimed_rows {
            for idx in 0..header.capacity() {
                let slot = segment.slot(idx);
                let may_free = policy != Some(DeliveryPolicy::SyncReader)
                    || min_pending.map_or(true, |min| min > slot.slot_id());
                slot.force_release_row(row_idx, may_free);
            }
        }
        if let Some(min_pending) = min_pending {
            header.advance_read_index_to(min_pending);
        }
    }

    if header.flex_zone_lock.reclaim_if_dead(is_alive) {
        report.flex_zone_lock_reclaimed = true;
    }

    report
}

/// Invariant violations [`validate_integrity`] can find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFault {
    /// A slot reports readers held but its state is neither `CONSUMING` nor `DRAINING`.
    ReaderCountWithoutHolder { slot_index: u32 },
    /// A slot is `CONSUMING`/`DRAINING` (or `CONSUMING` under a policy that
    /// admits a zero-reader hold, see below) but its reader_count is zero.
    HolderWithoutReaderCount { slot_index: u32 },
    /// `write_index` is behind a slot's own `slot_id` plus one, which can
    /// only mean `write_index` regressed or was corrupted.
    WriteIndexBehindSlot { slot_index: u32, slot_id: u64 },
    /// The header's magic number doesn't match this build's constant.
    MagicMismatch { found: u32 },
    /// The header's version doesn't match this build's constant.
    VersionMismatch { found: u32 },
    /// The header's stored `layout_hash` doesn't match what recomputing it
    /// from `capacity`/`payload_bytes`/`flex_zone_bytes` yields. Never
    /// repairable: a mismatch here means the mapping isn't trustworthy as
    /// this segment's layout at all, so no per-slot fix applies.
    LayoutHashMismatch { expected: u64, found: u64 },
    /// The flex zone's stored checksum doesn't match its current bytes.
    FlexZoneChecksumMismatch,
    /// A `COMMITTED` slot's stored checksum doesn't match its payload.
    SlotChecksumMismatch { slot_index: u32, slot_id: u64 },
}

/// Report of an integrity pass; `repaired` lists faults that `repair: true`
/// fixed by forcing the offending slot back to `FREE`.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub faults: Vec<IntegrityFault>,
    pub repaired: Vec<IntegrityFault>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

/// Walk the header and every slot looking for state that should be
/// structurally impossible under the protocol's own invariants: magic,
/// version, layout hash, the flex zone's checksum (under its own lock),
/// and the payload checksum of every `COMMITTED` slot. With `repair:
/// true`, each per-slot fault found is corrected by forcing that slot to
/// `FREE` (data loss for that slot, but a usable segment); header-level
/// faults (magic/version/layout-hash/flex-zone-checksum mismatch) are
/// never repaired this way — they mean the mapping isn't trustworthy as
/// this segment at all, not that one slot is wrong.
#[must_use]
pub fn validate_integrity(segment: &Segment, repair: bool) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let header = segment.header();

    if header.magic() != MAGIC {
        report.faults.push(IntegrityFault::MagicMismatch { found: header.magic() });
    }
    if header.version() != VERSION {
        report
            .faults
            .push(IntegrityFault::VersionMismatch { found: header.version() });
    }
    match SegmentLayout::compute(header.capacity(), header.payload_bytes(), header.flex_zone_bytes()) {
        Ok(layout) if layout.layout_hash() == header.layout_hash() => {}
        Ok(layout) => report.faults.push(IntegrityFault::LayoutHashMismatch {
            expected: header.layout_hash(),
            found: layout.layout_hash(),
        }),
        Err(_) => report.faults.push(IntegrityFault::LayoutHashMismatch {
            expected: header.layout_hash(),
            found: 0,
        }),
    }
    if segment.validate_flex_zone(std::process::id() as u64, FLEX_ZONE_VALIDATE_TIMEOUT) == Some(false) {
        report.faults.push(IntegrityFault::FlexZoneChecksumMismatch);
    }

    let policy = DeliveryPolicy::from_raw(header.policy_raw()).ok();

    for idx in 0..header.capacity() {
        let slot = segment.slot(idx);
        let state = slot.state();
        let holder_state = matches!(state, Some(SlotState::Consuming) | Some(SlotState::Draining));
        // Under SyncReader a CONSUMING slot may legitimately sit at
        // reader_count == 0 while it waits for the slowest named consumer
        // to catch up (see `protocol::ReadGuard::release`); flagging that
        // as corruption would make the fix for the underlying race look
        // like a fault.
        let reader_count_required = match state {
            Some(SlotState::Draining) => true,
            Some(SlotState::Consuming) => policy != Some(DeliveryPolicy::SyncReader),
            _ => false,
        };

        if slot.reader_count() > 0 && !holder_state {
            report
                .faults
                .push(IntegrityFault::ReaderCountWithoutHolder { slot_index: idx });
        } else if reader_count_required && slot.reader_count() == 0 {
            report
                .faults
                .push(IntegrityFault::HolderWithoutReaderCount { slot_index: idx });
        }

        if state == Some(SlotState::Committed) && slot.slot_id() + 1 > header.write_index() {
            report.faults.push(IntegrityFault::WriteIndexBehindSlot {
                slot_index: idx,
                slot_id: slot.slot_id(),
            });
        }

        if state == Some(SlotState::Committed) {
            // SAFETY: COMMITTED means the producer has finished writing
            // this slot and will not touch its payload again until a
            // reader acquires and releases it.
            let bytes =
                unsafe { slice::from_raw_parts(segment.slot_payload(idx), segment.payload_capacity()) };
            if checksum_of(bytes) != slot.checksum() {
                report.faults.push(IntegrityFault::SlotChecksumMismatch {
                    slot_index: idx,
                    slot_id: slot.slot_id(),
                });
            }
        }
    }

    if repair {
        for fault in &report.faults {
            let slot_index = match fault {
                IntegrityFault::ReaderCountWithoutHolder { slot_index }
                | IntegrityFault::HolderWithoutReaderCount { slot_index }
                | IntegrityFault::WriteIndexBehindSlot { slot_index, .. }
                | IntegrityFault::SlotChecksumMismatch { slot_index, .. } => *slot_index,
                IntegrityFault::MagicMismatch { .. }
                | IntegrityFault::VersionMismatch { .. }
                | IntegrityFault::LayoutHashMismatch { .. }
                | IntegrityFault::FlexZoneChecksumMismatch => continue,
            };
            segment.slot(slot_index).force_free();
            report.repaired.push(*fault);
        }
    }

    report
}

/// Point-in-time snapshot of one slot, for diagnostics only.
#[derive(Debug, Clone, Copy)]
pub struct SlotSnapshot {
    pub index: u32,
    pub state: Option<SlotState>,
    pub slot_id: u64,
    pub reader_count: u32,
    pub owner_pid: u64,
}

/// Point-in-time snapshot of the producer's liveness row.
#[derive(Debug, Clone, Copy)]
pub struct ProducerSnapshot {
    pub pid: u64,
    pub heartbeat_ns: u64,
    pub alive: bool,
}

/// Point-in-time snapshot of one consumer liveness row.
#[derive(Debug, Clone)]
pub struct ConsumerSnapshot {
    pub row: usize,
    pub pid: u64,
    pub consumer_uid: Vec<u8>,
    pub consumer_name: Vec<u8>,
    pub pending_slot_id: u64,
    pub alive: bool,
}

/// Point-in-time snapshot of the header's running counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub writes_total: u64,
    pub reads_total: u64,
    pub timeouts_ring_full: u64,
    pub timeouts_drain: u64,
    pub reader_peak: u64,
    pub checksum_errors: u64,
}

/// Full point-in-time snapshot of a segment's observable state.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub write_index: u64,
    pub read_index: u64,
    pub producer: ProducerSnapshot,
    pub consumers: Vec<ConsumerSnapshot>,
    pub slots: Vec<SlotSnapshot>,
    pub metrics: MetricsSnapshot,
}

/// Take a read-only snapshot of `segment`, for `datahub-diag` and for
/// application-level monitoring. Never mutates anything.
#[must_use]
pub fn snapshot(segment: &Segment) -> SegmentSnapshot {
    let header = segment.header();

    let producer = ProducerSnapshot {
        pid: header.producer_liveness.pid(),
        heartbeat_ns: header.producer_liveness.heartbeat_ns(),
        alive: is_alive(header.producer_liveness.pid()),
    };

    let mut consumers = Vec::new();
    for (row, liveness) in header.consumer_liveness.iter().enumerate() {
        if !liveness.is_claimed() {
            continue;
        }
        consumers.push(ConsumerSnapshot {
            row,
            pid: liveness.pid(),
            consumer_uid: liveness.consumer_uid().to_vec(),
            consumer_name: liveness.consumer_name().to_vec(),
            pending_slot_id: liveness.pending_slot_id(),
            alive: is_alive(liveness.pid()),
        });
    }

    let mut slots = Vec::with_capacity(header.capacity() as usize);
    for idx in 0..header.capacity() {
        let slot = segment.slot(idx);
        slots.push(SlotSnapshot {
            index: idx,
            state: slot.state(),
            slot_id: slot.slot_id(),
            reader_count: slot.reader_count(),
            owner_pid: slot.owner_pid(),
        });
    }

    let metrics = MetricsSnapshot {
        writes_total: header.metrics.writes_total(),
        reads_total: header.metrics.reads_total(),
        timeouts_ring_full: header.metrics.timeouts_ring_full(),
        timeouts_drain: header.metrics.timeouts_drain(),
        reader_peak: header.metrics.reader_peak(),
        checksum_errors: header.metrics.checksum_errors(),
    };

    SegmentSnapshot {
        write_index: header.write_index(),
        read_index: header.read_index(),
        producer,
        consumers,
        slots,
        metrics,
    }
}
