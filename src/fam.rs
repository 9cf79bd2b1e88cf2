//! Atomic and persistence primitives for fabric-attached memory.
//!
//! Everything the crate persists lives inside `mmap`'d shared files, so
//! cross-process synchronization reduces to word-sized atomics executed
//! directly on mapped addresses. This module is the single place that turns
//! raw mapped addresses into atomic references, plus the small persist
//! primitive that flushes dirtied cache lines before the next step of a
//! crash-consistent state machine.
//!
//! On real persistent memory the flush is a cache-line writeback; on a
//! page-cache-backed filesystem (tmpfs in tests) it degrades to an ordering
//! fence, which is exactly the durability the backing store can offer.

use crate::config::CACHE_LINE_SIZE;
use std::sync::atomic::{fence, AtomicU16, AtomicU64, Ordering};

/// Atomically load a u64 from a mapped address.
///
/// # Safety
///
/// `addr` must be valid, 8-byte aligned, and inside a live shared mapping.
#[inline]
pub unsafe fn u64_read(addr: *const u8) -> u64 {
    debug_assert_eq!(addr as usize % 8, 0);
    // SAFETY: caller guarantees a valid aligned mapped address.
    unsafe { &*(addr as *const AtomicU64) }.load(Ordering::Acquire)
}

/// Atomically store a u64 to a mapped address.
///
/// # Safety
///
/// Same requirements as [`u64_read`].
#[inline]
pub unsafe fn u64_write(addr: *mut u8, value: u64) {
    debug_assert_eq!(addr as usize % 8, 0);
    // SAFETY: caller guarantees a valid aligned mapped address.
    unsafe { &*(addr as *const AtomicU64) }.store(value, Ordering::Release);
}

/// 64-bit compare-and-store on a mapped address.
///
/// Returns the value observed before the operation; the swap took effect
/// iff the return value equals `expected`.
///
/// # Safety
///
/// Same requirements as [`u64_read`].
#[inline]
pub unsafe fn u64_cas(addr: *mut u8, expected: u64, desired: u64) -> u64 {
    debug_assert_eq!(addr as usize % 8, 0);
    // SAFETY: caller guarantees a valid aligned mapped address.
    match unsafe { &*(addr as *const AtomicU64) }.compare_exchange(
        expected,
        desired,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(old) => old,
        Err(old) => old,
    }
}

/// Atomically load a u16 from a mapped address.
///
/// # Safety
///
/// `addr` must be valid, 2-byte aligned, and inside a live shared mapping.
#[inline]
pub unsafe fn u16_read(addr: *const u8) -> u16 {
    debug_assert_eq!(addr as usize % 2, 0);
    // SAFETY: caller guarantees a valid aligned mapped address.
    unsafe { &*(addr as *const AtomicU16) }.load(Ordering::Acquire)
}

/// 16-bit compare-and-store on a mapped address.
///
/// Returns the value observed before the operation.
///
/// # Safety
///
/// Same requirements as [`u16_read`].
#[inline]
pub unsafe fn u16_cas(addr: *mut u8, expected: u16, desired: u16) -> u16 {
    debug_assert_eq!(addr as usize % 2, 0);
    // SAFETY: caller guarantees a valid aligned mapped address.
    match unsafe { &*(addr as *const AtomicU16) }.compare_exchange(
        expected,
        desired,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(old) => old,
        Err(old) => old,
    }
}

/// Flush the cache lines covering `[addr, addr + len)` and fence.
///
/// Must be called after every mutation that the crash-consistency state
/// machines rely on, before the mutation's successor step is taken.
#[inline]
pub fn persist(addr: *const u8, len: usize) {
    #[cfg(target_arch = "x86_64")]
    {
        let start = addr as usize & !(CACHE_LINE_SIZE - 1);
        let end = addr as usize + len;
        let mut line = start;
        while line < end {
            // SAFETY: clflush is valid for any mapped address; alignment is
            // handled by the hardware.
            unsafe { core::arch::x86_64::_mm_clflush(line as *const u8) };
            line += CACHE_LINE_SIZE;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (addr, len);
    }
    fence(Ordering::SeqCst);
}

/// Zero `len` bytes at `addr` and persist them.
///
/// # Safety
///
/// `addr..addr+len` must be valid writable mapped memory with no concurrent
/// accessors.
#[inline]
pub unsafe fn memset_persist(addr: *mut u8, value: u8, len: usize) {
    // SAFETY: caller guarantees exclusive access to the range.
    unsafe { std::ptr::write_bytes(addr, value, len) };
    persist(addr, len);
}

/// A spinlock living in shared (fabric-attached) memory.
///
/// One cache line per lock so contending processes do not false-share.
/// Not resilient to crashes: a holder that dies leaves the lock taken. It is
/// therefore held only across coarse, short create/destroy sections.
#[repr(C, align(64))]
pub struct FamSpinLock {
    word: AtomicU64,
}

impl FamSpinLock {
    /// Initialize the lock to the released state.
    pub fn init(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) {
        loop {
            if self
                .word
                .compare_exchange_weak(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            while self.word.load(Ordering::Relaxed) != 0 {
                std::hint::spin_loop();
            }
        }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.word.store(0, Ordering::Release);
    }
}
