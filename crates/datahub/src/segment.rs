// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment lifecycle: create, attach, unlink.
//!
//! `Segment` owns the `mmap`'d region and nothing else — it has no notion
//! of producer/consumer role. [`crate::protocol`] builds the acquire/
//! commit/release handles on top of the raw slot/header accessors here.
//!
//! # Naming convention
//!
//! Segment names must start with `/` and contain no other `/`, matching
//! POSIX shared-memory object naming.

use crate::checksum::checksum_of;
use crate::error::{DataHubError, Result};
use crate::header::{SegmentHeader, MAGIC, VERSION};
use crate::layout::SegmentLayout;
use crate::slot::Slot;
use std::ffi::CString;
use std::io;
use std::ptr;
use std::slice;
use std::time::Duration;

/// Identity fields written once at create time (P6): never touched again.
pub struct CreateIdentity<'a> {
    pub hub_uid: &'a [u8],
    pub hub_name: &'a [u8],
    pub producer_uid: &'a [u8],
    pub producer_name: &'a [u8],
}

/// A mapped segment. Automatically unmapped on drop; never unlinked
/// implicitly (the creator decides when to call [`Segment::unlink`]).
pub struct Segment {
    ptr: *mut u8,
    size: usize,
    name: String,
    layout: SegmentLayout,
}

// SAFETY: the mapping is backed by shared memory designed for concurrent
// cross-process access; every field reachable through it synchronizes via
// atomics or the explicit `flex_zone_lock`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new segment, replacing any existing one of the same name.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &str,
        capacity: u32,
        payload_bytes: u32,
        flex_zone_bytes: u32,
        policy_raw: u32,
        shared_secret: [u8; 32],
        slot_schema_hash: u64,
        flex_zone_schema_hash: u64,
        identity: CreateIdentity<'_>,
    ) -> Result<Self> {
        Self::validate_name(name)?;
        let layout = SegmentLayout::compute(capacity, payload_bytes, flex_zone_bytes)?;
        let c_name = CString::new(name).map_err(|_| DataHubError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is NUL-terminated; shm_unlink's result is ignored
        // deliberately (a prior segment under this name may not exist).
        // shm_open with O_CREAT|O_EXCL either creates a fresh object or
        // fails, so there is no race with a concurrent creator.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid, freshly created descriptor; total_size is
        // bounded by SegmentLayout's own u32-derived arithmetic.
        if unsafe { libc::ftruncate(fd, layout.total_size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(DataHubError::Os(err));
        }

        // SAFETY: fd is valid and sized exactly layout.total_size above.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.total_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        // SAFETY: ptr/layout.total_size describe exactly the mapping above;
        // no other process can have opened this brand-new segment yet.
        unsafe {
            ptr::write_bytes(ptr.cast::<u8>(), 0, layout.total_size as usize);
            let header_ptr = ptr.cast::<SegmentHeader>();
            SegmentHeader::init(
                header_ptr,
                layout.layout_hash(),
                shared_secret,
                flex_zone_schema_hash,
                slot_schema_hash,
                policy_raw,
                capacity,
                payload_bytes,
                flex_zone_bytes,
                layout.slot_stride,
                layout.flex_zone_offset,
                layout.flex_zone_size,
            );
            (*header_ptr).identity.write(
                identity.hub_uid,
                identity.hub_name,
                identity.producer_uid,
                identity.producer_name,
            );
        }

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            size: layout.total_size as usize,
            name: name.to_string(),
            layout,
        })
    }

    /// Attach to an existing segment, validating magic, version, secret,
    /// schema hashes, and the recomputed layout hash before trusting it.
    pub fn attach(
        name: &str,
        shared_secret: &[u8; 32],
        slot_schema_hash: u64,
        flex_zone_schema_hash: u64,
    ) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| DataHubError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is NUL-terminated.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(DataHubError::NotFound(name.to_string()));
            }
            return Err(DataHubError::Os(err));
        }

        let mapped_size = {
            // SAFETY: fstat's out parameter is a valid, zeroed libc::stat.
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(DataHubError::Os(err));
            }
            st.st_size as usize
        };
        if mapped_size < crate::header::HEADER_SIZE {
            unsafe { libc::close(fd) };
            return Err(DataHubError::ZombieSegment);
        }

        // SAFETY: fd is valid and mapped_size comes from fstat on that fd.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(DataHubError::Os(io::Error::last_os_error()));
        }

        let result = (|| {
            // SAFETY: ptr is a valid mapping of at least HEADER_SIZE bytes.
            let header = unsafe { &*ptr.cast::<SegmentHeader>() };
            if header.magic() != MAGIC {
                return Err(DataHubError::MagicMismatch {
                    expected: MAGIC,
                    found: header.magic(),
                });
            }
            if header.version() != VERSION {
                return Err(DataHubError::VersionMismatch {
                    expected: VERSION,
                    found: header.version(),
                });
            }
            if header.shared_secret() != shared_secret {
                return Err(DataHubError::SecretMismatch);
            }
            if header.slot_schema_hash() != slot_schema_hash
                || header.flex_zone_schema_hash() != flex_zone_schema_hash
            {
                return Err(DataHubError::SchemaMismatch);
            }
            let layout =
                SegmentLayout::compute(header.capacity(), header.payload_bytes(), header.flex_zone_bytes())?;
            if layout.layout_hash() != header.layout_hash() {
                return Err(DataHubError::LayoutMismatch {
                    expected: header.layout_hash(),
                    found: layout.layout_hash(),
                });
            }
            if layout.total_size as usize != mapped_size {
                return Err(DataHubError::LayoutMismatch {
                    expected: header.layout_hash(),
                    found: layout.layout_hash(),
                });
            }
            Ok(layout)
        })();

        let layout = match result {
            Ok(layout) => layout,
            Err(err) => {
                // SAFETY: ptr/mapped_size describe the mapping made above.
                unsafe { libc::munmap(ptr, mapped_size) };
                return Err(err);
            }
        };

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            size: mapped_size,
            name: name.to_string(),
            layout,
        })
    }

    /// Unlink (delete) a segment by name. Idempotent: a missing segment is
    /// not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| DataHubError::InvalidName(name.to_string()))?;
        // SAFETY: c_name is NUL-terminated; shm_unlink only touches the
        // shared-memory filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(DataHubError::Os(err));
            }
        }
        Ok(())
    }

    /// Whether a segment of this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is NUL-terminated; O_RDONLY performs no mutation.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(DataHubError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(DataHubError::InvalidName(format!(
                "segment name must not contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(DataHubError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least HEADER_SIZE bytes by construction
        // (create() sizes it, attach() rejects anything smaller).
        unsafe { &*self.ptr.cast::<SegmentHeader>() }
    }

    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn slot(&self, index: u32) -> &Slot {
        debug_assert!(index < self.layout.capacity);
        let offset = self.layout.slot_state_byte_offset(index);
        // SAFETY: offset + size_of::<Slot>() is within the mapping per the
        // non-overlapping region invariant `SegmentLayout` upholds.
        unsafe { &*self.ptr.add(offset as usize).cast::<Slot>() }
    }

    /// Raw pointer to slot `index`'s payload bytes, `payload_capacity()`
    /// bytes long. Mutating through this pointer is only sound while the
    /// caller holds that slot in `Writing` state (single-writer discipline
    /// enforced by [`crate::protocol`], not by this accessor).
    #[must_use]
    pub fn slot_payload(&self, index: u32) -> *mut u8 {
        debug_assert!(index < self.layout.capacity);
        let offset = self.layout.slot_data_byte_offset(index);
        // SAFETY: see `slot` above; the data region follows the same
        // non-overlap invariant.
        unsafe { self.ptr.add(offset as usize) }
    }

    #[must_use]
    pub fn payload_capacity(&self) -> usize {
        self.layout.payload_bytes as usize
    }

    /// Raw pointer to the flex zone, or `None` if `flex_zone_bytes` is 0.
    /// Callers must hold `header().flex_zone_lock` before writing.
    #[must_use]
    pub fn flex_zone_ptr(&self) -> Option<*mut u8> {
        if self.layout.flex_zone_size == 0 {
            return None;
        }
        // SAFETY: flex_zone_offset + flex_zone_size is within the mapping.
        Some(unsafe { self.ptr.add(self.layout.flex_zone_offset as usize) })
    }

    #[must_use]
    pub fn flex_zone_len(&self) -> usize {
        self.layout.flex_zone_size as usize
    }

    /// Copy the flex zone out as `T`, under `flex_zone_lock`. `None` if
    /// there is no flex zone, `T` is larger than it, or the lock could
    /// not be taken within `timeout`.
    pub fn read_flex_zone<T: Copy>(&self, pid: u64, timeout: Duration) -> Option<T> {
        let ptr = self.flex_zone_ptr()?;
        if std::mem::size_of::<T>() > self.flex_zone_len() {
            return None;
        }
        if !self.header().flex_zone_lock.lock(pid, timeout) {
            return None;
        }
        // SAFETY: held `flex_zone_lock` for the whole read; size checked
        // against the zone above.
        let value = unsafe { ptr.cast::<T>().read_unaligned() };
        self.header().flex_zone_lock.unlock(pid);
        Some(value)
    }

    /// Write `value` into the flex zone and refresh its checksum, all
    /// under `flex_zone_lock`. `false` (without writing) if there is no
    /// flex zone, `T` is larger than it, or the lock could not be taken
    /// within `timeout`.
    pub fn write_flex_zone<T: Copy>(&self, value: &T, pid: u64, timeout: Duration) -> bool {
        let Some(ptr) = self.flex_zone_ptr() else {
            return false;
        };
        if std::mem::size_of::<T>() > self.flex_zone_len() {
            return false;
        }
        if !self.header().flex_zone_lock.lock(pid, timeout) {
            return false;
        }
        // SAFETY: held `flex_zone_lock` for the whole write; size checked
        // against the zone above.
        unsafe {
            ptr.cast::<T>().write_unaligned(*value);
        }
        let checksum = self.flex_zone_checksum_locked(ptr);
        self.header().set_flex_zone_checksum(checksum);
        self.header().flex_zone_lock.unlock(pid);
        true
    }

    /// Recompute the flex zone's checksum from its current bytes and
    /// store it, under `flex_zone_lock`. Used by the transaction facade
    /// after a commit to keep the checksum current even when the flex
    /// zone was touched outside `write_flex_zone`. `false` if there is no
    /// flex zone or the lock could not be taken within `timeout`.
    pub fn refresh_flex_zone_checksum(&self, pid: u64, timeout: Duration) -> bool {
        let Some(ptr) = self.flex_zone_ptr() else {
            return false;
        };
        if !self.header().flex_zone_lock.lock(pid, timeout) {
            return false;
        }
        let checksum = self.flex_zone_checksum_locked(ptr);
        self.header().set_flex_zone_checksum(checksum);
        self.header().flex_zone_lock.unlock(pid);
        true
    }

    /// Recompute the flex zone's checksum under its lock and compare it
    /// against the stored value. `None` if there is no flex zone or the
    /// lock could not be taken within `timeout`.
    pub fn validate_flex_zone(&self, pid: u64, timeout: Duration) -> Option<bool> {
        let ptr = self.flex_zone_ptr()?;
        if !self.header().flex_zone_lock.lock(pid, timeout) {
            return None;
        }
        let actual = self.flex_zone_checksum_locked(ptr);
        self.header().flex_zone_lock.unlock(pid);
        Some(actual == self.header().flex_zone_checksum())
    }

    /// Checksum of the full flex-zone region. Caller must already hold
    /// `flex_zone_lock`.
    fn flex_zone_checksum_locked(&self, ptr: *mut u8) -> u64 {
        // SAFETY: caller holds `flex_zone_lock` across this read, and
        // `ptr`/`flex_zone_len()` describe exactly the flex-zone region.
        let bytes = unsafe { slice::from_raw_parts(ptr, self.flex_zone_len()) };
        checksum_of(bytes)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size describe exactly the mapping made in
        // create()/attach(); Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CONSUMER_UID_LEN;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/datahub_test_{tag}_{ts}")
    }

    fn create_test_segment(name: &str) -> Segment {
        Segment::create(
            name,
            4,
            64,
            16,
            0,
            [7u8; 32],
            1111,
            2222,
            CreateIdentity {
                hub_uid: b"hub-1",
                hub_name: b"Lab Hub",
                producer_uid: b"prod-1",
                producer_name: b"Producer One",
            },
        )
        .expect("create")
    }

    #[test]
    fn validate_name_rules() {
        assert!(Segment::validate_name("/foo").is_ok());
        assert!(Segment::validate_name("foo").is_err());
        assert!(Segment::validate_name("/foo/bar").is_err());
    }

    #[test]
    fn create_sets_header_and_identity() {
        let name = unique_name("create");
        let seg = create_test_segment(&name);
        let header = seg.header();
        assert_eq!(header.magic(), MAGIC);
        assert_eq!(header.version(), VERSION);
        assert_eq!(header.capacity(), 4);
        assert_eq!(header.identity.hub_uid(), b"hub-1");
        assert_eq!(header.identity.producer_name(), b"Producer One");
        Segment::unlink(&name).ok();
    }

    #[test]
    fn create_and_attach_round_trip_slot_payload() {
        let name = unique_name("roundtrip");
        let writer = create_test_segment(&name);

        // SAFETY: test writes to a slot it owns exclusively, within bounds.
        unsafe {
            let payload = writer.slot_payload(0);
            *payload = 0xab;
            *payload.add(1) = 0xcd;
        }
        writer.slot(0).commit(42);

        let reader = Segment::attach(&name, &[7u8; 32], 1111, 2222).expect("attach");
        assert_eq!(reader.slot(0).checksum(), 42);
        // SAFETY: reading back bytes the writer above just wrote.
        unsafe {
            let payload = reader.slot_payload(0);
            assert_eq!(*payload, 0xab);
            assert_eq!(*payload.add(1), 0xcd);
        }

        drop(reader);
        drop(writer);
        Segment::unlink(&name).ok();
    }

    #[test]
    fn attach_rejects_wrong_secret() {
        let name = unique_name("badsecret");
        let _writer = create_test_segment(&name);
        let result = Segment::attach(&name, &[0u8; 32], 1111, 2222);
        assert!(matches!(result, Err(DataHubError::SecretMismatch)));
        Segment::unlink(&name).ok();
    }

    #[test]
    fn attach_rejects_wrong_schema_hash() {
        let name = unique_name("badschema");
        let _writer = create_test_segment(&name);
        let result = Segment::attach(&name, &[7u8; 32], 9999, 2222);
        assert!(matches!(result, Err(DataHubError::SchemaMismatch)));
        Segment::unlink(&name).ok();
    }

    #[test]
    fn attach_nonexistent_is_not_found() {
        let result = Segment::attach("/datahub_never_existed_xyz", &[0u8; 32], 0, 0);
        assert!(matches!(result, Err(DataHubError::NotFound(_))));
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name("unlink");
        let _seg = create_test_segment(&name);
        assert!(Segment::unlink(&name).is_ok());
        assert!(Segment::unlink(&name).is_ok());
    }

    #[test]
    fn exists_reflects_segment_lifetime() {
        let name = unique_name("exists");
        assert!(!Segment::exists(&name));
        let seg = create_test_segment(&name);
        assert!(Segment::exists(&name));
        drop(seg);
        Segment::unlink(&name).ok();
        assert!(!Segment::exists(&name));
    }

    #[test]
    fn flex_zone_write_read_round_trips_and_checksum_validates() {
        #[derive(Clone, Copy)]
        struct Calibration {
            gain: f64,
            offset: f64,
        }

        let name = unique_name("flexzone");
        let seg = create_test_segment(&name);
        let value = Calibration { gain: 1.5, offset: -3.0 };
        assert!(seg.write_flex_zone(&value, 1, Duration::from_millis(50)));
        assert_ne!(seg.header().flex_zone_checksum(), 0);

        let read_back: Calibration = seg.read_flex_zone(1, Duration::from_millis(50)).expect("flex zone present");
        assert_eq!(read_back.gain, 1.5);
        assert_eq!(read_back.offset, -3.0);
        assert_eq!(seg.validate_flex_zone(1, Duration::from_millis(50)), Some(true));

        Segment::unlink(&name).ok();
    }

    #[test]
    fn flex_zone_checksum_catches_a_corrupted_byte() {
        let name = unique_name("flexzonecorrupt");
        let seg = create_test_segment(&name);
        assert!(seg.write_flex_zone(&42u32, 1, Duration::from_millis(50)));

        // SAFETY: test corrupts a byte no live writer is touching.
        unsafe {
            let ptr = seg.flex_zone_ptr().expect("flex zone present");
            *ptr.add(8) ^= 0xff;
        }
        assert_eq!(seg.validate_flex_zone(1, Duration::from_millis(50)), Some(false));

        Segment::unlink(&name).ok();
    }

    #[test]
    fn flex_zone_rejects_a_value_too_large_for_the_zone() {
        let name = unique_name("flexzonetoolarge");
        let seg = create_test_segment(&name);
        let oversized = [0u8; 4096];
        assert!(!seg.write_flex_zone(&oversized, 1, Duration::from_millis(50)));
        Segment::unlink(&name).ok();
    }

    #[test]
    fn consumer_row_claim_survives_across_the_mapping() {
        let name = unique_name("consumer");
        let seg = create_test_segment(&name);
        let row = &seg.header().consumer_liveness[0];
        assert!(row.try_claim(999, &[1u8; CONSUMER_UID_LEN], b"c", 10));
        assert!(seg.header().consumer_liveness[0].is_claimed());
        Segment::unlink(&name).ok();
    }
}
