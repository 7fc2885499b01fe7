// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery policy and the producer/consumer-admission rules it implies.
//!
//! # Policies
//!
//! - `LatestOnly`: producers never block on a full ring; the oldest
//!   committed slot is wrapped over (draining first if a reader holds it).
//! - `SingleReader`: exactly one consumer may be registered at a time; a
//!   full ring blocks the producer until the reader catches up.
//! - `SyncReader`: any number of consumers, each tracked by an independent
//!   cursor; a full ring blocks the producer until the slowest reader
//!   catches up.

use std::fmt;

/// Delivery policy selected at segment creation; baked into the header and
/// immutable for the lifetime of the segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Producers overwrite the oldest slot rather than block.
    LatestOnly,
    /// A single consumer; producers block when the ring is full.
    #[default]
    SingleReader,
    /// Multiple independent consumers; producers block when the ring is
    /// full (i.e. the slowest reader has not yet released the oldest slot).
    SyncReader,
}

impl fmt::Display for DeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LatestOnly => "latest-only",
            Self::SingleReader => "single-reader",
            Self::SyncReader => "sync-reader",
        };
        f.write_str(name)
    }
}

impl DeliveryPolicy {
    /// Encode for storage in the header's `policy` field.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::LatestOnly => 0,
            Self::SingleReader => 1,
            Self::SyncReader => 2,
        }
    }

    /// Decode from the header's `policy` field.
    pub fn from_raw(raw: u32) -> Result<Self, PolicyViolation> {
        match raw {
            0 => Ok(Self::LatestOnly),
            1 => Ok(Self::SingleReader),
            2 => Ok(Self::SyncReader),
            other => Err(PolicyViolation::UnknownPolicyTag(other)),
        }
    }

    /// Whether more than one consumer may be registered under this policy.
    #[must_use]
    pub fn allows_multiple_consumers(self) -> bool {
        !matches!(self, Self::SingleReader)
    }

    /// What a producer does when every slot is occupied.
    #[must_use]
    pub fn ring_full_action(self) -> RingFullAction {
        match self {
            Self::LatestOnly => RingFullAction::WrapOldest,
            Self::SingleReader | Self::SyncReader => RingFullAction::Block,
        }
    }
}

/// What a producer should do when it cannot find a `FREE` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingFullAction {
    /// Block (subject to the caller's acquire timeout) until a slot frees.
    Block,
    /// Wrap the oldest committed slot, draining it first if a reader holds it.
    WrapOldest,
}

/// Policy rules violated at consumer-registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// `SingleReader` segment already has a live consumer registered.
    SingleReaderLimitExceeded { existing_pid: u64 },
    /// Consumer liveness table (fixed at `MAX_CONSUMERS` rows) is full.
    ConsumerTableFull,
    /// Header carries a `policy` tag this build doesn't recognize.
    UnknownPolicyTag(u32),
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleReaderLimitExceeded { existing_pid } => write!(
                f,
                "segment is single-reader and already has a consumer registered (pid {existing_pid})"
            ),
            Self::ConsumerTableFull => write!(f, "consumer liveness table is full"),
            Self::UnknownPolicyTag(tag) => write!(f, "unrecognized policy tag {tag}"),
        }
    }
}

impl std::error::Error for PolicyViolation {}

/// Check whether a new consumer may register, given the current count of
/// live (claimed) consumer rows and, for `SingleReader`, the existing
/// holder's pid (for a clearer error message).
pub fn check_consumer_admission(
    policy: DeliveryPolicy,
    live_consumer_count: usize,
    max_consumers: usize,
    existing_pid: Option<u64>,
) -> Result<(), PolicyViolation> {
    if live_consumer_count >= max_consumers {
        return Err(PolicyViolation::ConsumerTableFull);
    }
    if !policy.allows_multiple_consumers() && live_consumer_count > 0 {
        return Err(PolicyViolation::SingleReaderLimitExceeded {
            existing_pid: existing_pid.unwrap_or(0),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_single_reader() {
        assert_eq!(DeliveryPolicy::default(), DeliveryPolicy::SingleReader);
    }

    #[test]
    fn raw_round_trips() {
        for policy in [
            DeliveryPolicy::LatestOnly,
            DeliveryPolicy::SingleReader,
            DeliveryPolicy::SyncReader,
        ] {
            assert_eq!(DeliveryPolicy::from_raw(policy.to_raw()).unwrap(), policy);
        }
    }

    #[test]
    fn unknown_raw_tag_is_rejected() {
        assert_eq!(
            DeliveryPolicy::from_raw(99),
            Err(PolicyViolation::UnknownPolicyTag(99))
        );
    }

    #[test]
    fn latest_only_wraps_instead_of_blocking() {
        assert_eq!(
            DeliveryPolicy::LatestOnly.ring_full_action(),
            RingFullAction::WrapOldest
        );
    }

    #[test]
    fn single_reader_and_sync_reader_block_on_full_ring() {
        assert_eq!(
            DeliveryPolicy::SingleReader.ring_full_action(),
            RingFullAction::Block
        );
        assert_eq!(
            DeliveryPolicy::SyncReader.ring_full_action(),
            RingFullAction::Block
        );
    }

    #[test]
    fn single_reader_rejects_a_second_consumer() {
        let result = check_consumer_admission(DeliveryPolicy::SingleReader, 1, 8, Some(4242));
        assert_eq!(
            result,
            Err(PolicyViolation::SingleReaderLimitExceeded { existing_pid: 4242 })
        );
    }

    #[test]
    fn sync_reader_allows_many_consumers_up_to_table_limit() {
        assert!(check_consumer_admission(DeliveryPolicy::SyncReader, 7, 8, None).is_ok());
        assert_eq!(
            check_consumer_admission(DeliveryPolicy::SyncReader, 8, 8, None),
            Err(PolicyViolation::ConsumerTableFull)
        );
    }

    #[test]
    fn latest_only_allows_multiple_consumers() {
        assert!(check_consumer_admission(DeliveryPolicy::LatestOnly, 3, 8, None).is_ok());
    }

    #[test]
    fn display_names_are_lowercase_hyphenated() {
        assert_eq!(DeliveryPolicy::LatestOnly.to_string(), "latest-only");
        assert_eq!(DeliveryPolicy::SingleReader.to_string(), "single-reader");
        assert_eq!(DeliveryPolicy::SyncReader.to_string(), "sync-reader");
    }
}
