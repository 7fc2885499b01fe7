// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Closure-scoped acquire/commit and acquire/release helpers built on top
//! of [`crate::protocol::WriteGuard`]/[`crate::protocol::ReadGuard`].
//!
//! Beyond what the guards already give you for free (auto-abort/
//! auto-release on an early return or panic, via their `Drop` impls),
//! this is the one place that:
//!
//! - fires a heartbeat on entry, so a transaction whose closure runs long
//!   doesn't look like a zombie to a watchdog calling
//!   [`crate::recovery::recover`] partway through;
//! - refreshes the flex-zone checksum after a producer transaction
//!   commits, so readers of [`crate::segment::Segment::validate_flex_zone`]
//!   see a checksum that actually matches whatever the producer wrote
//!   through the flex zone during the same transaction;
//! - offers a typed, trivially-copyable view over the payload
//!   ([`produce_value`]/[`consume_value`]) for callers who'd rather hand
//!   over a `T: Copy` than poke at a raw byte slice.

use crate::error::{DataHubError, Result};
use crate::protocol::{Consumer, Producer};
use std::time::Duration;

/// Timeout for the flex-zone spinlock taken by [`produce_with`] to
/// refresh the checksum after a commit. Short: the lock is only ever
/// held for a checksum recompute, never across a caller's closure.
const FLEX_ZONE_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Acquire a slot, let `fill` populate the payload and return how many
/// bytes it wrote, then commit. On any error from `fill` or `acquire`,
/// nothing is published.
///
/// Fires a heartbeat before acquiring, and refreshes the flex zone's
/// checksum after a successful commit (a no-op if the segment has no
/// flex zone, or if the caller never touched it).
pub fn produce_with<F>(producer: &mut Producer, timeout: Duration, fill: F) -> Result<()>
where
    F: FnOnce(&mut [u8]) -> usize,
{
    producer.heartbeat();
    let mut guard = producer.acquire(timeout)?;
    let len = fill(guard.payload_mut());
    guard.commit(len)?;
    producer
        .segment()
        .refresh_flex_zone_checksum(producer.pid(), FLEX_ZONE_LOCK_TIMEOUT);
    Ok(())
}

/// Acquire the next slot, let `read` inspect the payload and compute a
/// result, then release. `checksum_policy` on the consumer still governs
/// whether a checksum mismatch surfaces as an error from this call.
///
/// Fires a heartbeat before acquiring, so a closure that runs long is
/// never mistaken for a stalled or crashed consumer.
pub fn consume_with<F, R>(consumer: &mut Consumer, timeout: Duration, read: F) -> Result<R>
where
    F: FnOnce(&[u8]) -> R,
{
    consumer.heartbeat();
    let guard = consumer.acquire(timeout)?;
    let result = read(guard.payload());
    guard.release()?;
    Ok(result)
}

/// Publish `value` as the whole payload of one slot. `T` must be `Copy`,
/// ruling out types with non-value semantics (heap pointers, atomics)
/// that wouldn't survive being read back by another process.
///
/// # Errors
///
/// [`DataHubError::PayloadTooLarge`] if `size_of::<T>()` exceeds the
/// segment's configured payload capacity; otherwise whatever
/// [`produce_with`] returns.
pub fn produce_value<T: Copy>(producer: &mut Producer, timeout: Duration, value: T) -> Result<()> {
    let size = std::mem::size_of::<T>();
    let capacity = producer.segment().payload_capacity();
    if size > capacity {
        return Err(DataHubError::PayloadTooLarge { size, capacity });
    }
    produce_with(producer, timeout, |buf| {
        // SAFETY: `size` was just checked against `buf.len() == capacity`,
        // and `T: Copy` guarantees a byte-for-byte copy is a valid `T`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (&value as *const T).cast::<u8>(),
                buf.as_mut_ptr(),
                size,
            );
        }
        size
    })
}

/// Read one slot's payload back as a `T`. `T` must be `Copy`, and the
/// slot must hold at least `size_of::<T>()` bytes (the normal case: the
/// producer published with [`produce_value::<T>`]).
///
/// # Errors
///
/// [`DataHubError::PayloadTooLarge`] if `size_of::<T>()` exceeds the
/// segment's configured payload capacity; otherwise whatever
/// [`consume_with`] returns.
pub fn consume_value<T: Copy>(consumer: &mut Consumer, timeout: Duration) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let capacity = consumer.segment().payload_capacity();
    if size > capacity {
        return Err(DataHubError::PayloadTooLarge { size, capacity });
    }
    consume_with(consumer, timeout, |buf| {
        // SAFETY: `size` was checked against the segment's payload
        // capacity, and `buf` always has at least that many bytes.
        unsafe { buf.as_ptr().cast::<T>().read_unaligned() }
    })
}
