// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pure byte-offset arithmetic for the four regions of a segment: the
//! fixed 4 KiB header, the slot-state array, the slot-data array, and the
//! optional flex zone.
//!
//! `SegmentLayout` takes no locks and touches no memory — it is computed
//! independently by both the creator and every attacher from the same
//! inputs (`capacity`, `payload_bytes`, `flex_zone_bytes`) and must agree
//! bit-for-bit, which is exactly what `layout_hash` exists to verify: an
//! attacher recomputes the layout from its own build's constants and
//! compares hashes with the header before touching anything else.

use crate::error::{DataHubError, Result};
use crate::header::HEADER_SIZE;
use crate::slot::Slot;

/// mmap/ftruncate granularity; the mapped region is always rounded up to a
/// whole number of pages.
const PAGE_SIZE: u64 = 4096;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

/// Resolved byte layout of a segment for a given (capacity, payload_bytes,
/// flex_zone_bytes) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub capacity: u32,
    pub payload_bytes: u32,
    pub flex_zone_bytes: u32,
    /// Per-slot payload stride (`payload_bytes` rounded up to 8 bytes).
    pub slot_stride: u32,
    pub slot_state_offset: u64,
    pub slot_state_size: u64,
    pub slot_data_offset: u64,
    pub slot_data_size: u64,
    pub flex_zone_offset: u64,
    pub flex_zone_size: u64,
    /// Total mapped length, rounded up to a page boundary.
    pub total_size: u64,
}

impl SegmentLayout {
    /// Compute the layout, validating `capacity`/`payload_bytes` are
    /// usable before any arithmetic runs.
    pub fn compute(capacity: u32, payload_bytes: u32, flex_zone_bytes: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(DataHubError::InvalidCapacity(capacity));
        }
        if payload_bytes == 0 {
            return Err(DataHubError::PayloadTooLarge {
                size: 0,
                capacity: 0,
            });
        }

        let slot_state_offset = HEADER_SIZE as u64;
        let slot_record_size = std::mem::size_of::<Slot>() as u64;
        let slot_state_size = slot_record_size * u64::from(capacity);

        let slot_stride = align_up(u64::from(payload_bytes), 8);
        let slot_data_offset = align_up(slot_state_offset + slot_state_size, 8);
        let slot_data_size = slot_stride * u64::from(capacity);

        let flex_zone_offset = align_up(slot_data_offset + slot_data_size, 8);
        let flex_zone_size = u64::from(flex_zone_bytes);

        let total_size = align_up(flex_zone_offset + flex_zone_size, PAGE_SIZE);

        Ok(Self {
            capacity,
            payload_bytes,
            flex_zone_bytes,
            slot_stride: u32::try_from(slot_stride).expect("slot stride fits in u32"),
            slot_state_offset,
            slot_state_size,
            slot_data_offset,
            slot_data_size,
            flex_zone_offset,
            flex_zone_size,
            total_size,
        })
    }

    /// Byte offset of slot `index`'s state record within the mapping.
    #[must_use]
    pub fn slot_state_byte_offset(&self, index: u32) -> u64 {
        debug_assert!(index < self.capacity);
        self.slot_state_offset + u64::from(index) * std::mem::size_of::<Slot>() as u64
    }

    /// Byte offset of slot `index`'s payload region within the mapping.
    #[must_use]
    pub fn slot_data_byte_offset(&self, index: u32) -> u64 {
        debug_assert!(index < self.capacity);
        self.slot_data_offset + u64::from(index) * u64::from(self.slot_stride)
    }

    /// 64-bit fingerprint of every value that must agree bit-for-bit
    /// between the creator and every attacher. FNV-1a: simple, fast,
    /// good enough for a compatibility check rather than a security one.
    #[must_use]
    pub fn layout_hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = FNV_OFFSET;
        for word in [
            HEADER_SIZE as u64,
            std::mem::size_of::<Slot>() as u64,
            u64::from(self.capacity),
            u64::from(self.payload_bytes),
            u64::from(self.flex_zone_bytes),
            u64::from(self.slot_stride),
        ] {
            for byte in word.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}
