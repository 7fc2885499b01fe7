// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error kinds surfaced at the core boundary.
//!
//! A closed, small enum the caller is expected to match on (`Timeout` vs.
//! `NotReady` vs. `ChecksumError` drive different retry behavior), so this
//! is a poor fit for a type-erased `anyhow::Error` and doesn't need
//! `thiserror`'s derive machinery given how few variants there are.

use std::fmt;
use std::io;

/// Errors returned across the core's public boundary.
#[derive(Debug)]
pub enum DataHubError {
    /// Attacher's computed layout hash does not match the header's.
    LayoutMismatch { expected: u64, found: u64 },
    /// Attacher's slot or flex-zone schema hash does not match the header's.
    SchemaMismatch,
    /// Attacher's shared secret does not match the header's, byte for byte.
    SecretMismatch,
    /// Header magic does not match; this is not a DataHub segment.
    MagicMismatch { expected: u32, found: u32 },
    /// Header format version is not one this build understands.
    VersionMismatch { expected: u32, found: u32 },
    /// A blocking operation's timeout elapsed before it could complete.
    Timeout,
    /// Producer's ring-full barrier held for the whole acquire timeout; no
    /// consumer released a slot in time.
    RingFull,
    /// Slot exists but is transiently unusable (DRAINING or WRITING).
    NotReady,
    /// Per-slot checksum did not match on release; segment remains usable.
    ChecksumError { slot_id: u64 },
    /// Header corruption, or the producer is definitively dead and
    /// unrecoverable; caller should stop using the segment.
    ZombieSegment,
    /// Segment name failed validation (empty, too long, embedded separator).
    InvalidName(String),
    /// Requested capacity is zero or otherwise invalid.
    InvalidCapacity(u32),
    /// Payload exceeds the segment's configured `payload_bytes`.
    PayloadTooLarge { size: usize, capacity: usize },
    /// Segment of the given name does not exist.
    NotFound(String),
    /// Consumer registration violated the segment's delivery policy.
    PolicyViolation(crate::policy::PolicyViolation),
    /// Underlying system call failed.
    Os(io::Error),
}

pub type Result<T> = std::result::Result<T, DataHubError>;

impl fmt::Display for DataHubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LayoutMismatch { expected, found } => write!(
                f,
                "segment layout hash mismatch: expected {expected:#018x}, found {found:#018x}"
            ),
            Self::SchemaMismatch => write!(f, "slot or flex-zone schema hash mismatch"),
            Self::SecretMismatch => write!(f, "shared secret mismatch"),
            Self::MagicMismatch { expected, found } => write!(
                f,
                "segment magic mismatch: expected {expected:#010x}, found {found:#010x}"
            ),
            Self::VersionMismatch { expected, found } => {
                write!(f, "segment version mismatch: expected {expected}, found {found}")
            }
            Self::Timeout => write!(f, "operation timed out"),
            Self::RingFull => write!(f, "ring is full; no consumer released a slot in time"),
            Self::NotReady => write!(f, "slot not ready (draining or being written)"),
            Self::ChecksumError { slot_id } => {
                write!(f, "checksum mismatch on slot_id {slot_id}")
            }
            Self::ZombieSegment => write!(f, "segment is corrupt or its producer is unrecoverable"),
            Self::InvalidName(name) => write!(f, "invalid segment name: {name:?}"),
            Self::InvalidCapacity(cap) => write!(f, "invalid capacity: {cap}"),
            Self::PayloadTooLarge { size, capacity } => write!(
                f,
                "payload of {size} bytes exceeds slot capacity of {capacity} bytes"
            ),
            Self::NotFound(name) => write!(f, "segment not found: {name:?}"),
            Self::PolicyViolation(violation) => write!(f, "{violation}"),
            Self::Os(err) => write!(f, "OS failure: {err}"),
        }
    }
}

impl std::error::Error for DataHubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(err) => Some(err),
            Self::PolicyViolation(violation) => Some(violation),
            _ => None,
        }
    }
}

impl From<io::Error> for DataHubError {
    fn from(err: io::Error) -> Self {
        Self::Os(err)
    }
}

impl From<crate::policy::PolicyViolation> for DataHubError {
    fn from(violation: crate::policy::PolicyViolation) -> Self {
        Self::PolicyViolation(violation)
    }
}
