// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-process exclusive lock with owner-PID reclaim.
//!
//! A 16-byte record living directly in the mapped segment: an atomic owner
//! PID (0 = free) and an atomic generation counter bumped on every
//! successful acquire. No name, no variable-length field — the ABI is
//! fixed-size so it can sit inline in the header.
//!
//! Reclaiming a dead owner always goes through a CAS, never a plain store:
//! a plain store could clobber a concurrent process's handover (PID A dies
//! holding the lock; PID B reclaims it at the same instant PID C's
//! `try_lock` CAS succeeds against the dead owner value — only one of B's
//! reclaim and C's acquire may win, and CAS makes that race honest).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cross-process spinlock. `#[repr(C)]` and fixed-size so it can be placed
/// directly inside a shared-memory header.
#[repr(C)]
pub struct SharedSpinLock {
    owner_pid: AtomicU64,
    generation: AtomicU64,
}

/// Spin backoff cap before falling back to a short sleep between attempts.
const SPIN_ITERS: u32 = 100;
const BACKOFF_START: Duration = Duration::from_micros(1);
const BACKOFF_MAX: Duration = Duration::from_millis(1);

impl SharedSpinLock {
    /// Zeroed (unlocked, generation 0) lock, suitable for placement in a
    /// freshly-zeroed shared-memory region.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner_pid: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Current owner PID, or 0 if free. Advisory; the caller should not act
    /// on this without re-validating via CAS.
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner_pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self, pid: u64) -> bool {
        debug_assert_ne!(pid, 0, "PID 0 is reserved for 'free'");
        let acquired = self
            .owner_pid
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        acquired
    }

    /// Spin with exponential backoff (capped) until acquired or `timeout`
    /// elapses. Returns `false` on timeout.
    pub fn lock(&self, pid: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_START;
        loop {
            for _ in 0..SPIN_ITERS {
                if self.try_lock(pid) {
                    return true;
                }
                std::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(backoff.min(BACKOFF_MAX));
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Release the lock. The caller must be the current owner; unlocking
    /// while not the owner is a logic bug, reported via `debug_assert` in
    /// debug builds and ignored (not silently "fixed") in release so a
    /// buggy caller doesn't corrupt an unrelated holder's critical section
    /// any more than it already has.
    pub fn unlock(&self, pid: u64) {
        let current = self.owner_pid.load(Ordering::Acquire);
        debug_assert_eq!(current, pid, "unlock() called by non-owner");
        if current == pid {
            self.owner_pid.store(0, Ordering::Release);
        }
    }

    /// If the lock is held and the OS reports its owner is not alive, CAS
    /// the owner back to 0. Returns whether a reclaim happened.
    pub fn reclaim_if_dead(&self, is_alive: impl Fn(u64) -> bool) -> bool {
        let owner = self.owner_pid.load(Ordering::Acquire);
        if owner == 0 || is_alive(owner) {
            return false;
        }
        self.owner_pid
            .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for SharedSpinLock {
    fn default() -> Self {
        Self::new()
    }
}
