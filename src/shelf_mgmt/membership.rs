//! Versioned slot table in persistent shared memory.
//!
//! The table is a fixed array of cache-line-padded 16-bit words behind a
//! cache-aligned header. Each word packs a valid bit (bit 15) and a 15-bit
//! version counter:
//!
//! - `(valid=1, v)` — the slot is occupied by logical version `v`.
//! - `(valid=0, v)` — the slot is free; `v` is the last version observed.
//! - Version 0 means the slot has never been used.
//!
//! Acquisition is two-phase: `get_free_slot` CAS-increments the version
//! while the slot is free (publishing the new version), then
//! `mark_slot_used` CAS-arms the valid bit against exactly the value the
//! first phase returned. A crash between the phases leaves the slot free
//! with a burned version; an interloper that also ran `get_free_slot`
//! observes a higher version, so at most one contender can arm the bit.
//!
//! The same structure backs both pool membership (which shelves exist) and
//! heap ownership (which process is a shelf-heap's in-line allocator).

use crate::config::CACHE_LINE_SIZE;
use crate::error::{Error, Result};
use crate::fam;
use std::ptr::NonNull;

const MEMBERSHIP_MAGIC: u64 = 0x6e76_6d65_6d62_6572; // "nvmember"

const VALID_BIT: u16 = 1 << 15;
const VERSION_MASK: u16 = VALID_BIT - 1;

#[repr(C)]
struct MembershipHeader {
    magic: u64,
    /// Total bytes of header plus items.
    size: u64,
    item_count: u64,
}

const fn header_size() -> usize {
    // Rounded up to a cache line.
    (std::mem::size_of::<MembershipHeader>() + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Bytes a table with `item_count` slots occupies (header + padded items).
pub const fn layout_size(item_count: usize) -> usize {
    header_size() + item_count * CACHE_LINE_SIZE
}

/// Whether a slot word has its valid bit armed.
pub fn test_valid(value: u16) -> bool {
    value & VALID_BIT != 0
}

/// The version number of a slot word.
pub fn version_of(value: u16) -> u16 {
    value & VERSION_MASK
}

fn inc_version(value: u16) -> u16 {
    (value & VALID_BIT) | (version_of(value).wrapping_add(1) & VERSION_MASK)
}

/// An opened slot table over a mapped persistent region.
pub struct Membership {
    addr: NonNull<u8>,
    size: usize,
    item_count: usize,
}

// SAFETY: all slot mutation goes through word-sized atomics on the mapped
// region; the handle itself carries no mutable state.
unsafe impl Send for Membership {}
unsafe impl Sync for Membership {}

impl Membership {
    /// Format a new table with `item_count` free slots at `addr`.
    ///
    /// The magic number is written last, so a half-created table never
    /// verifies.
    ///
    /// # Safety
    ///
    /// `addr` must be cache-line aligned and point at `avail_size` bytes of
    /// writable mapped memory with no concurrent accessors.
    pub unsafe fn create(addr: NonNull<u8>, avail_size: usize, item_count: usize) -> Result<()> {
        debug_assert_eq!(addr.as_ptr() as usize % CACHE_LINE_SIZE, 0);
        assert!(item_count > 0);

        let total = layout_size(item_count);
        if avail_size < total {
            return Err(Error::MembershipCreateFailed(format!(
                "need {} bytes, have {}",
                total, avail_size
            )));
        }

        // SAFETY: range checked against avail_size above.
        unsafe {
            fam::memset_persist(addr.as_ptr(), 0, total);
            let header = addr.as_ptr() as *mut MembershipHeader;
            (*header).item_count = item_count as u64;
            (*header).size = total as u64;
            fam::persist(addr.as_ptr(), header_size());
            fam::u64_write(addr.as_ptr(), MEMBERSHIP_MAGIC);
            fam::persist(addr.as_ptr(), header_size());
        }
        Ok(())
    }

    /// Zero out a previously created table.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Membership::create`]; the table must not be
    /// open anywhere.
    pub unsafe fn destroy(addr: NonNull<u8>) -> Result<()> {
        // SAFETY: caller guarantees a valid region.
        if !unsafe { Self::verify(addr) } {
            return Err(Error::MembershipDestroyFailed);
        }
        // SAFETY: size read from the header we just verified.
        unsafe {
            let size = (*(addr.as_ptr() as *const MembershipHeader)).size as usize;
            fam::memset_persist(addr.as_ptr(), 0, size);
        }
        Ok(())
    }

    /// Whether a valid table lives at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must point at least 8 readable mapped bytes.
    pub unsafe fn verify(addr: NonNull<u8>) -> bool {
        // SAFETY: caller guarantees a readable word.
        unsafe { fam::u64_read(addr.as_ptr()) == MEMBERSHIP_MAGIC }
    }

    /// Open an existing table.
    ///
    /// # Safety
    ///
    /// `addr` must be cache-line aligned and point at `avail_size` bytes of
    /// mapped shared memory that stays mapped for the handle's lifetime.
    pub unsafe fn open(addr: NonNull<u8>, avail_size: usize) -> Result<Self> {
        // SAFETY: caller guarantees a readable region.
        if !unsafe { Self::verify(addr) } {
            return Err(Error::MembershipOpenFailed(
                "magic number mismatch".to_string(),
            ));
        }
        // SAFETY: header verified above.
        let (size, item_count) = unsafe {
            let header = &*(addr.as_ptr() as *const MembershipHeader);
            (header.size as usize, header.item_count as usize)
        };
        if size > avail_size {
            return Err(Error::MembershipOpenFailed(format!(
                "table of {} bytes does not fit in {}",
                size, avail_size
            )));
        }
        Ok(Self {
            addr,
            size,
            item_count,
        })
    }

    /// Total bytes the table occupies.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.item_count
    }

    fn slot_addr(&self, index: usize) -> *mut u8 {
        assert!(index < self.item_count, "slot index out of bounds");
        // SAFETY: bounds asserted; items start after the padded header.
        unsafe { self.addr.as_ptr().add(header_size() + index * CACHE_LINE_SIZE) }
    }

    /// Current raw word of a slot.
    pub fn slot(&self, index: usize) -> u16 {
        // SAFETY: slot_addr is aligned and inside the mapping.
        unsafe { fam::u16_read(self.slot_addr(index)) }
    }

    /// Whether a slot is currently valid.
    pub fn test_valid_bit(&self, index: usize) -> bool {
        test_valid(self.slot(index))
    }

    /// Current version number of a slot.
    pub fn version(&self, index: usize) -> u16 {
        version_of(self.slot(index))
    }

    /// Phase one of acquisition: if the slot is free, CAS-increment its
    /// version and return the new word. `None` if the slot is in use or the
    /// CAS lost a race.
    pub fn get_free_slot(&self, index: usize) -> Option<u16> {
        let addr = self.slot_addr(index);
        // SAFETY: slot_addr is aligned and inside the mapping.
        let old = unsafe { fam::u16_read(addr) };
        if test_valid(old) {
            return None;
        }
        let new = inc_version(old);
        // SAFETY: as above.
        if unsafe { fam::u16_cas(addr, old, new) } == old {
            fam::persist(addr, 2);
            debug_assert!(!test_valid(new));
            Some(new)
        } else {
            None
        }
    }

    /// Phase two of acquisition: arm the valid bit against exactly the word
    /// returned by [`Membership::get_free_slot`]. Fails iff another
    /// contender changed the slot in between.
    pub fn mark_slot_used(&self, index: usize, expected: u16) -> bool {
        debug_assert!(!test_valid(expected));
        let addr = self.slot_addr(index);
        let new = expected | VALID_BIT;
        // SAFETY: slot_addr is aligned and inside the mapping.
        if unsafe { fam::u16_cas(addr, expected, new) } == expected {
            fam::persist(addr, 2);
            true
        } else {
            false
        }
    }

    /// If the slot is valid, return its current word without changing it.
    pub fn get_used_slot(&self, index: usize) -> Option<u16> {
        let value = self.slot(index);
        test_valid(value).then_some(value)
    }

    /// Release a valid slot: CAS-increment the version and clear the valid
    /// bit. Returns the word before release (whose version names the
    /// committed artifact the caller may now retire).
    pub fn mark_slot_free(&self, index: usize) -> Option<u16> {
        let addr = self.slot_addr(index);
        // SAFETY: slot_addr is aligned and inside the mapping.
        let old = unsafe { fam::u16_read(addr) };
        if !test_valid(old) {
            return None;
        }
        let new = inc_version(old) & !VALID_BIT;
        // SAFETY: as above.
        if unsafe { fam::u16_cas(addr, old, new) } == old {
            fam::persist(addr, 2);
            Some(old)
        } else {
            None
        }
    }

    /// First free slot in `start..=end` (indices taken modulo the count;
    /// `end < start` wraps around). Purely advisory: the slot may be taken
    /// by the time the caller acts on it.
    pub fn find_first_free_slot(&self, start: usize, end: usize) -> Option<usize> {
        self.scan(start, end, false)
    }

    /// First used slot in `start..=end`, same wrap semantics.
    pub fn find_first_used_slot(&self, start: usize, end: usize) -> Option<usize> {
        self.scan(start, end, true)
    }

    fn scan(&self, start: usize, end: usize, want_valid: bool) -> Option<usize> {
        let start = start % self.item_count;
        let end = end % self.item_count;
        let check = |i: usize| self.test_valid_bit(i) == want_valid;
        if end < start {
            (start..self.item_count).chain(0..=end).find(|&i| check(i))
        } else {
            (start..=end).find(|&i| check(i))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[repr(align(64))]
    struct Region(#[allow(dead_code)] [u8; 64 * 1024]);

    fn region() -> (Box<Region>, NonNull<u8>) {
        let mut buf = Box::new(Region([0; 64 * 1024]));
        let ptr = NonNull::new(buf.0.as_mut_ptr()).unwrap();
        (buf, ptr)
    }

    #[test]
    fn test_create_verify_open() {
        let (_buf, addr) = region();
        unsafe {
            assert!(!Membership::verify(addr));
            Membership::create(addr, 64 * 1024, 100).unwrap();
            assert!(Membership::verify(addr));
            let table = Membership::open(addr, 64 * 1024).unwrap();
            assert_eq!(table.count(), 100);
            assert_eq!(table.size(), layout_size(100));
            Membership::destroy(addr).unwrap();
            assert!(!Membership::verify(addr));
        }
    }

    #[test]
    fn test_create_requires_space() {
        let (_buf, addr) = region();
        let err = unsafe { Membership::create(addr, 128, 100) };
        assert!(matches!(err, Err(Error::MembershipCreateFailed(_))));
    }

    #[test]
    fn test_acquire_release_cycle_bumps_version_twice() {
        let (_buf, addr) = region();
        let table = unsafe {
            Membership::create(addr, 64 * 1024, 16).unwrap();
            Membership::open(addr, 64 * 1024).unwrap()
        };

        assert_eq!(table.version(3), 0);
        let value = table.get_free_slot(3).expect("slot is free");
        assert_eq!(version_of(value), 1);
        assert!(table.mark_slot_used(3, value));
        assert!(table.test_valid_bit(3));
        assert!(table.get_used_slot(3).is_some());

        let before = table.mark_slot_free(3).expect("slot was used");
        assert_eq!(version_of(before), 1);
        assert!(!table.test_valid_bit(3));
        assert_eq!(table.version(3), 2);
    }

    #[test]
    fn test_double_acquire_fails_second_phase() {
        let (_buf, addr) = region();
        let table = unsafe {
            Membership::create(addr, 64 * 1024, 4).unwrap();
            Membership::open(addr, 64 * 1024).unwrap()
        };

        let first = table.get_free_slot(0).unwrap();
        // A contender runs phase one before we arm the bit; our stale value
        // must now lose.
        let second = table.get_free_slot(0).unwrap();
        assert!(!table.mark_slot_used(0, first));
        assert!(table.mark_slot_used(0, second));
        // Used slot rejects further phase-one attempts.
        assert!(table.get_free_slot(0).is_none());
    }

    #[test]
    fn test_version_marches_across_cycles() {
        let (_buf, addr) = region();
        let table = unsafe {
            Membership::create(addr, 64 * 1024, 2).unwrap();
            Membership::open(addr, 64 * 1024).unwrap()
        };
        for i in 0..50u16 {
            let v = table.get_free_slot(1).unwrap();
            assert_eq!(version_of(v), 2 * i + 1);
            assert!(table.mark_slot_used(1, v));
            assert!(table.mark_slot_free(1).is_some());
        }
        assert_eq!(table.version(1), 100);
        assert!(!table.test_valid_bit(1));
    }

    #[test]
    fn test_scans_with_wrap() {
        let (_buf, addr) = region();
        let table = unsafe {
            Membership::create(addr, 64 * 1024, 8).unwrap();
            Membership::open(addr, 64 * 1024).unwrap()
        };
        let v = table.get_free_slot(5).unwrap();
        assert!(table.mark_slot_used(5, v));

        assert_eq!(table.find_first_used_slot(0, 7), Some(5));
        assert_eq!(table.find_first_free_slot(5, 7), Some(6));
        // end < start wraps through 0.
        assert_eq!(table.find_first_used_slot(6, 4), Some(5));
        assert_eq!(table.find_first_used_slot(6, 3), None);
    }

    #[test]
    fn test_contended_acquire_has_one_winner() {
        let (_buf, addr) = region();
        unsafe { Membership::create(addr, 64 * 1024, 1).unwrap() };
        let table = Arc::new(unsafe { Membership::open(addr, 64 * 1024).unwrap() });
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if let Some(v) = table.get_free_slot(0) {
                        if table.mark_slot_used(0, v) {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert!(table.test_valid_bit(0));
    }
}
