// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segment creation parameters and the small set of timeouts a caller can
//! vary per call.
//!
//! Everything here is either baked into the segment's on-disk layout at
//! create time (`capacity`, `payload_bytes`, `flex_zone_bytes`, `policy`,
//! `checksum_policy`) or is a pure local value the calling process is free
//! to change between calls (the heartbeat/drain timeouts). None of it is
//! shared, reloadable, or contended, so unlike a dynamic runtime registry
//! this is a plain `Copy` struct with a `Default` impl.

use crate::policy::DeliveryPolicy;
use std::time::Duration;

/// Default number of ring slots when a caller doesn't specify one.
pub const DEFAULT_CAPACITY: u32 = 64;

/// Default payload region size per slot, in bytes.
pub const DEFAULT_PAYLOAD_BYTES: u32 = 4096;

/// Default flex-zone size, in bytes. Zero means "no flex zone."
pub const DEFAULT_FLEX_ZONE_BYTES: u32 = 0;

/// Default bound on how long a LatestOnly wrap may sit in DRAINING before
/// the wrap is abandoned and the slot restored to COMMITTED.
///
/// Chosen shorter than `DEFAULT_ACQUIRE_TIMEOUT` so a stuck drain resolves
/// (as a visible tail, not a writer stall) before the caller's own acquire
/// timeout would have fired.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Default acquire timeout used by callers that don't specify one.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default bound on producer liveness before a producer is declared zombie.
pub const DEFAULT_WRITER_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on consumer liveness before a consumer row is reclaimed.
pub const DEFAULT_CONSUMER_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a mismatched per-slot checksum is a hard error or advisory-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumPolicy {
    /// A checksum mismatch on release returns `ChecksumError`.
    #[default]
    Enforced,
    /// A checksum mismatch is logged but the release still succeeds as if
    /// the payload were intact.
    Advisory,
}

/// Parameters fixed at segment creation.
#[derive(Debug, Clone, Copy)]
pub struct SegmentConfig {
    pub capacity: u32,
    pub payload_bytes: u32,
    pub flex_zone_bytes: u32,
    pub policy: DeliveryPolicy,
    pub checksum_policy: ChecksumPolicy,
    pub drain_timeout: Duration,
    pub writer_heartbeat_timeout: Duration,
    pub consumer_heartbeat_timeout: Duration,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            payload_bytes: DEFAULT_PAYLOAD_BYTES,
            flex_zone_bytes: DEFAULT_FLEX_ZONE_BYTES,
            policy: DeliveryPolicy::SingleReader,
            checksum_policy: ChecksumPolicy::Enforced,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            writer_heartbeat_timeout: DEFAULT_WRITER_HEARTBEAT_TIMEOUT,
            consumer_heartbeat_timeout: DEFAULT_CONSUMER_HEARTBEAT_TIMEOUT,
        }
    }
}

impl SegmentConfig {
    #[must_use]
    pub fn new(capacity: u32, payload_bytes: u32, policy: DeliveryPolicy) -> Self {
        Self {
            capacity,
            payload_bytes,
            policy,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_flex_zone(mut self, flex_zone_bytes: u32) -> Self {
        self.flex_zone_bytes = flex_zone_bytes;
        self
    }

    #[must_use]
    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_single_reader_enforced() {
        let cfg = SegmentConfig::default();
        assert_eq!(cfg.policy, DeliveryPolicy::SingleReader);
        assert_eq!(cfg.checksum_policy, ChecksumPolicy::Enforced);
        assert_eq!(cfg.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn builder_overrides_apply() {
        let cfg = SegmentConfig::new(8, 128, DeliveryPolicy::LatestOnly)
            .with_flex_zone(256)
            .with_checksum_policy(ChecksumPolicy::Advisory)
            .with_drain_timeout(Duration::from_millis(10));
        assert_eq!(cfg.capacity, 8);
        assert_eq!(cfg.payload_bytes, 128);
        assert_eq!(cfg.flex_zone_bytes, 256);
        assert_eq!(cfg.checksum_policy, ChecksumPolicy::Advisory);
        assert_eq!(cfg.drain_timeout, Duration::from_millis(10));
    }
}
