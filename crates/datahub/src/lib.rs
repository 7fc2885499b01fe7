// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DataHub - shared-memory pub-sub data engine
//!
//! A single producer process publishes fixed-stride samples into a named
//! POSIX shared-memory ring; any number of other processes attach as
//! consumers and read them without copying through a socket or a broker.
//! The broker (external to this crate) only ever handles discovery and
//! liveness notifications — the data path is pure shared memory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datahub::config::SegmentConfig;
//! use datahub::policy::DeliveryPolicy;
//! use datahub::protocol::Producer;
//! use datahub::segment::CreateIdentity;
//! use std::time::Duration;
//!
//! # fn main() -> datahub::error::Result<()> {
//! let config = SegmentConfig::new(1024, 256, DeliveryPolicy::SingleReader);
//! let identity = CreateIdentity {
//!     hub_uid: b"demo",
//!     hub_name: b"demo",
//!     producer_uid: b"writer-1",
//!     producer_name: b"writer-1",
//! };
//! let mut producer = Producer::create("/demo_channel", &config, identity, [0u8; 32], 1, 1)?;
//!
//! let mut guard = producer.acquire(Duration::from_millis(100))?;
//! guard.payload_mut()[..5].copy_from_slice(b"hello");
//! guard.commit(5)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                      Producer / Consumer API                       |
//! |   Producer::create/attach | Consumer::attach | acquire/commit/release|
//! +---------------------------------------------------------------------+
//! |                     Ring Protocol (protocol.rs)                     |
//! |   WriteGuard / ReadGuard | delivery policy | backoff-based blocking |
//! +---------------------------------------------------------------------+
//! |            Segment Layout (layout.rs, header.rs, slot.rs)           |
//! |   fixed-stride slots | CAS state machine | liveness tables          |
//! +---------------------------------------------------------------------+
//! |                     POSIX Shared Memory (segment.rs)                |
//! |   shm_open/mmap | independent per-process attach                    |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`protocol::Producer`] | Creates or attaches to a segment, publishes samples |
//! | [`protocol::Consumer`] | Attaches to a segment, reads samples under a delivery policy |
//! | [`policy::DeliveryPolicy`] | `LatestOnly`, `SingleReader`, `SyncReader` ring-full/cursor behavior |
//! | [`config::SegmentConfig`] | Capacity, payload size, policy, timeouts chosen at create time |
//! | [`recovery::recover`] | Reclaims slots and liveness rows owned by a dead process |
//! | [`broker::BrokerAdapter`] | Control-plane boundary (discovery, notifications); never on the data path |
//!
//! ## Features
//!
//! - **Zero-copy** reads and writes directly against the mapped segment
//! - **Lock-free** per-slot state machine (CAS transitions, no mutex)
//! - **Self-healing**: a watchdog thread in any attached process can call
//!   [`recovery::recover`] to reclaim a crashed producer's or consumer's
//!   state without coordinaton
//! - **Policy-driven** ring-full behavior: block, wrap-the-oldest-slot, or
//!   broadcast-drop-to-latest
//!
//! ## Modules Overview
//!
//! - [`protocol`] - `Producer`/`Consumer`, `WriteGuard`/`ReadGuard` (start here)
//! - [`config`] - Segment creation configuration
//! - [`policy`] - Delivery policy and its admission/ring-full rules
//! - [`segment`] - POSIX shared-memory mapping, create/attach/unlink
//! - [`layout`] - Fixed-stride byte layout computation
//! - [`header`] - Segment header: identity, liveness tables, read/write index
//! - [`slot`] - Per-slot CAS state machine
//! - [`spinlock`] - Shared, crash-safe spinlock used for the flex zone
//! - [`clock`] - Monotonic clock helper
//! - [`recovery`] - Zombie detection, reclaim, integrity validation, diagnostics snapshot
//! - [`transaction`] - Closure-scoped acquire/commit and acquire/release helpers
//! - [`broker`] - Control-plane adapter trait and fire-and-forget dispatch
//! - [`error`] - `DataHubError` and `Result`

pub mod broker;
mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod header;
pub mod layout;
pub mod policy;
pub mod protocol;
pub mod recovery;
pub mod segment;
pub mod slot;
pub mod spinlock;
pub mod transaction;

pub use broker::{BrokerAdapter, NullBrokerAdapter};
pub use config::SegmentConfig;
pub use error::{DataHubError, Result};
pub use policy::DeliveryPolicy;
pub use protocol::{Consumer, Producer, ReadGuard, WriteGuard};
pub use segment::{CreateIdentity, Segment};

/// `DataHub` version string.
pub const VERSION: &str = "0.1.0";
