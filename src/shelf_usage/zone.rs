//! Buddy-style zone allocator over one shelf.
//!
//! A zone serves power-of-two chunks from `min_object_size` up to the zone
//! size. Level `l` holds chunks of `min_object_size << l`; each level has a
//! persistent freelist stack, and an allocation bitmap carries one bit per
//! chunk per level so offline tooling can account for every byte. Shelf
//! layout:
//!
//! ```text
//!   zone header + per-level freelist heads   [power-of-two chunk, allocated]
//!   merge bitmap                             [power-of-two chunk, allocated]
//!   allocation bitmap                        [power-of-two chunk, allocated]
//!   chunks ...
//! ```
//!
//! The header, merge-bitmap, and allocation-bitmap chunks are themselves
//! marked in the allocation bitmap, so their ranges are never handed out.
//!
//! `grow` doubles the provisioned region (up to the shelf size) under a
//! persistent latch; the backing file is full-size from the start, so
//! growing never touches the filesystem. `start_merge` is offline
//! maintenance: level by level it swaps the freelist aside, marks the free
//! chunks in the merge bitmap, coalesces buddy pairs, and drains the result
//! back, recording its progress in a persistent status word so [`Zone::recover`]
//! can resume after a crash.
//!
//! The returned offsets carry their level in the reserve byte (bits 40..48);
//! strip it before dereferencing.

use crate::config::{ZONE_MAX_SIZE, ZONE_MIN_OBJECT_SIZE};
use crate::error::{Error, Result};
use crate::fam;
use crate::global_ptr::{Offset, OFFSET_BITS};
use crate::shelf_usage::stack::Stack;
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::AtomicU64;
use tracing::{trace, warn};

const ZONE_MAGIC: u64 = 0x6661_6d7a_6f6e_6531; // "famzone1"

/// Merge state machine, persisted in the zone header.
mod merge_status {
    pub const IDLE: u64 = 0;
    pub const SWAP_COMPLETED: u64 = 1;
    pub const BITMAP_COMPLETED: u64 = 2;
    pub const FREELIST_COMPLETED: u64 = 3;
}

#[repr(C)]
struct ZoneHeader {
    magic: u64,
    min_object_size: u64,
    max_zone_size: u64,
    max_zone_level: u64,
    current_zone_level: u64,
    merge_bitmap_start: u64,
    bitmap_start: u64,
    grow_in_progress: u64,
    merge_in_progress: u64,
    merge_status: u64,
    current_merge_level: u64,
    owner_heartbeat: u64,
    safe_copy: Stack,
    post_merge_level: Stack,
    post_merge_next_level: Stack,
    // Trailed by (max_zone_level + 1) freelist stacks.
}

/// Pack a size level into the reserve byte of an offset.
pub fn pack_level(offset: Offset, level: u64) -> Offset {
    debug_assert!(level < 256);
    (level << OFFSET_BITS) | offset
}

/// Strip the reserve byte, leaving the plain byte offset.
pub fn strip_level(offset: Offset) -> Offset {
    offset & ((1 << OFFSET_BITS) - 1)
}

/// The size level packed in an offset's reserve byte.
pub fn level_of_offset(offset: Offset) -> u64 {
    offset >> OFFSET_BITS
}

fn level_of_size(size: u64, min_object_size: u64) -> u64 {
    debug_assert!(size.is_power_of_two() && size >= min_object_size);
    (size / min_object_size).trailing_zeros() as u64
}

fn size_of_level(level: u64, min_object_size: u64) -> u64 {
    min_object_size << level
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// A zone allocator handle over a mapped shelf.
///
/// The handle is stateless: every parameter lives in the persistent header,
/// so any number of processes can operate the same zone concurrently.
pub struct Zone {
    base: NonNull<u8>,
}

// SAFETY: all persistent mutation goes through atomics and latched critical
// sections in the mapped region.
unsafe impl Send for Zone {}
unsafe impl Sync for Zone {}

impl Zone {
    /// Format a zone at `base` and return a handle to it.
    ///
    /// `initial_zone_size` is raised to the smallest power of two that
    /// leaves usable space after the reserved chunks; `max_zone_size` is
    /// the hard ceiling `grow` may reach. The magic number is written last,
    /// so a half-formatted zone never opens.
    ///
    /// # Safety
    ///
    /// `base` must be cache-line aligned, point at `max_zone_size` bytes of
    /// zero-initialized mapped shared memory, and stay mapped for the
    /// handle's lifetime. No other process may touch the region until the
    /// format completes (the pool's transient-file protocol guarantees
    /// this).
    pub unsafe fn create(
        base: NonNull<u8>,
        initial_zone_size: u64,
        min_object_size: u64,
        max_zone_size: u64,
    ) -> Result<Self> {
        if min_object_size < ZONE_MIN_OBJECT_SIZE || !min_object_size.is_power_of_two() {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "min object size {} must be a power of two >= {}",
                min_object_size, ZONE_MIN_OBJECT_SIZE
            )));
        }
        if max_zone_size > ZONE_MAX_SIZE || !max_zone_size.is_power_of_two() {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "max zone size {} must be a power of two <= {}",
                max_zone_size, ZONE_MAX_SIZE
            )));
        }
        if max_zone_size <= min_object_size {
            return Err(Error::ShelfFileInvalidFormat(
                "max zone size must exceed the min object size".to_string(),
            ));
        }

        let zone = Self { base };
        let max_level = level_of_size(max_zone_size, min_object_size);
        let header = zone.header();

        // Header fields are CAS-initialized from zero so that two racing
        // formatters either agree or the latecomer fails loudly.
        let init = |addr: *mut u8, value: u64| -> Result<()> {
            // SAFETY: header field inside the mapped region.
            let old = unsafe { fam::u64_cas(addr, 0, value) };
            if old != 0 && old != value {
                return Err(Error::ShelfFileInvalidFormat(format!(
                    "zone header field already initialized to {} (wanted {})",
                    old, value
                )));
            }
            Ok(())
        };
        // SAFETY: all field addresses below are inside the mapped header.
        unsafe {
            init(addr_of_mut!((*header).min_object_size) as *mut u8, min_object_size)?;
            init(addr_of_mut!((*header).max_zone_size) as *mut u8, max_zone_size)?;
            init(addr_of_mut!((*header).max_zone_level) as *mut u8, max_level)?;
        }

        let header_bytes =
            std::mem::size_of::<ZoneHeader>() as u64 + (max_level + 1) * 8;
        let header_chunk_size = header_bytes.next_power_of_two().max(min_object_size);
        let bitmap_size = ((1u64 << (max_level + 1)) / 8).max(8);
        let merge_size = ((1u64 << max_level) / 8).max(8);

        let merge_start;
        let bitmap_start;
        let reserved_end;
        let mut chunk;
        let mut adv;

        if header_chunk_size + merge_size + bitmap_size <= min_object_size {
            // Everything fits inside the first minimum-size chunk.
            merge_start = header_chunk_size;
            bitmap_start = header_chunk_size + merge_size;
            reserved_end = min_object_size;
            chunk = min_object_size;
            adv = min_object_size;
            unsafe {
                init(addr_of_mut!((*header).merge_bitmap_start) as *mut u8, merge_start)?;
                init(addr_of_mut!((*header).bitmap_start) as *mut u8, bitmap_start)?;
            }
            zone.set_bitmap_bit(0, 0);
        } else {
            // Header, merge bitmap, and allocation bitmap land in separate
            // chunks; the gaps between them (all power-of-two sized and
            // aligned by construction) go straight to the freelists.
            chunk = header_chunk_size;
            adv = header_chunk_size;
            while chunk < merge_size {
                // SAFETY: free_list returns a stack in the mapped header.
                unsafe {
                    zone.free_list(level_of_size(chunk, min_object_size))
                        .push(base.as_ptr(), adv)
                };
                adv += chunk;
                chunk <<= 1;
            }
            merge_start = adv;
            chunk <<= 1;
            adv = chunk;
            while chunk < bitmap_size {
                unsafe {
                    zone.free_list(level_of_size(chunk, min_object_size))
                        .push(base.as_ptr(), adv)
                };
                adv += chunk;
                chunk <<= 1;
            }
            bitmap_start = adv;
            chunk <<= 1;
            adv = chunk;
            reserved_end = chunk;

            unsafe {
                init(addr_of_mut!((*header).merge_bitmap_start) as *mut u8, merge_start)?;
                init(addr_of_mut!((*header).bitmap_start) as *mut u8, bitmap_start)?;
            }
            zone.set_bitmap_bit(level_of_size(header_chunk_size, min_object_size), 0);
            zone.set_bitmap_bit(
                level_of_size(merge_size.max(min_object_size), min_object_size),
                merge_start,
            );
            zone.set_bitmap_bit(
                level_of_size(bitmap_size.max(min_object_size), min_object_size),
                bitmap_start,
            );
        }

        let initial = initial_zone_size
            .next_power_of_two()
            .max(reserved_end * 2);
        if initial > max_zone_size {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "zone of {} bytes cannot hold its own metadata ({} reserved)",
                max_zone_size, reserved_end
            )));
        }
        unsafe {
            init(
                addr_of_mut!((*header).current_zone_level) as *mut u8,
                level_of_size(initial, min_object_size),
            )?;
        }

        // Buddy decomposition of [reserved_end, initial): one free chunk of
        // each size, doubling up.
        if chunk < reserved_end {
            chunk = reserved_end;
            adv = reserved_end;
        }
        while chunk < initial {
            unsafe {
                zone.free_list(level_of_size(chunk, min_object_size))
                    .push(base.as_ptr(), adv)
            };
            adv += chunk;
            chunk <<= 1;
        }

        // SAFETY: magic word at offset 0 of the mapped region.
        unsafe { fam::u64_write(addr_of_mut!((*header).magic) as *mut u8, ZONE_MAGIC) };
        fam::persist(base.as_ptr(), header_chunk_size as usize);
        Ok(zone)
    }

    /// Open an already formatted zone.
    ///
    /// # Safety
    ///
    /// `base` must be cache-line aligned and point at a mapping of the whole
    /// zone shelf that outlives the handle.
    pub unsafe fn open(base: NonNull<u8>) -> Result<Self> {
        let zone = Self { base };
        // SAFETY: magic word at offset 0 of the mapped region.
        let magic = unsafe { fam::u64_read(addr_of!((*zone.header()).magic) as *const u8) };
        if magic != ZONE_MAGIC {
            return Err(Error::ShelfFileInvalidFormat(format!(
                "zone magic mismatch: {:#x}",
                magic
            )));
        }
        Ok(zone)
    }

    /// Scrub the magic number so the zone no longer opens.
    pub fn invalidate(&self) {
        // SAFETY: magic word at offset 0 of the mapped region.
        unsafe { fam::u64_write(addr_of_mut!((*self.header()).magic) as *mut u8, 0) };
        fam::persist(self.base.as_ptr(), 8);
    }

    fn header(&self) -> *mut ZoneHeader {
        self.base.as_ptr() as *mut ZoneHeader
    }

    fn read_field(&self, addr: *const u64) -> u64 {
        // SAFETY: callers pass header field addresses inside the mapping.
        unsafe { fam::u64_read(addr as *const u8) }
    }

    /// The configured minimum object size.
    pub fn min_object_size(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).min_object_size) })
    }

    /// The configured maximum zone size.
    pub fn max_zone_size(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).max_zone_size) })
    }

    fn max_zone_level(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).max_zone_level) })
    }

    /// The currently provisioned level (zone size = `min << level`).
    pub fn current_zone_level(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).current_zone_level) })
    }

    fn bitmap_start(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).bitmap_start) })
    }

    fn merge_bitmap_start(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).merge_bitmap_start) })
    }

    fn merge_status(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).merge_status) })
    }

    /// Owner heartbeat, microseconds since the Unix epoch.
    pub fn heartbeat(&self) -> u64 {
        self.read_field(unsafe { addr_of!((*self.header()).owner_heartbeat) })
    }

    /// Refresh the owner heartbeat to now.
    pub fn touch_heartbeat(&self) {
        let addr = unsafe { addr_of_mut!((*self.header()).owner_heartbeat) as *mut u8 };
        // SAFETY: header field inside the mapping.
        unsafe { fam::u64_write(addr, now_micros()) };
        fam::persist(addr, 8);
    }

    /// Whether the heartbeat is older than `timeout_us`.
    pub fn heartbeat_stale(&self, timeout_us: u64) -> bool {
        now_micros().saturating_sub(self.heartbeat()) > timeout_us
    }

    /// The freelist stack of `level`.
    ///
    /// # Safety
    ///
    /// `level` must not exceed the zone's max level.
    unsafe fn free_list(&self, level: u64) -> &Stack {
        // SAFETY: the stacks trail the fixed header inside the mapping.
        unsafe {
            let addr = self
                .base
                .as_ptr()
                .add(std::mem::size_of::<ZoneHeader>() + level as usize * std::mem::size_of::<Stack>());
            &*(addr as *const Stack)
        }
    }

    fn safe_copy(&self) -> &Stack {
        // SAFETY: embedded in the mapped header.
        unsafe { &(*self.header()).safe_copy }
    }

    fn post_merge_level(&self) -> &Stack {
        // SAFETY: embedded in the mapped header.
        unsafe { &(*self.header()).post_merge_level }
    }

    fn post_merge_next_level(&self) -> &Stack {
        // SAFETY: embedded in the mapped header.
        unsafe { &(*self.header()).post_merge_next_level }
    }

    /// Allocate `size` bytes, returning an offset with the level packed in
    /// the reserve byte. `None` when the zone cannot serve the request even
    /// after growing to its maximum.
    pub fn alloc(&self, size: u64) -> Option<Offset> {
        let min = self.min_object_size();
        let chunk_size = size.max(min).next_power_of_two();
        if chunk_size > self.max_zone_size() {
            return None;
        }
        let target = level_of_size(chunk_size, min);
        let base = self.base.as_ptr();

        loop {
            let current = self.current_zone_level();
            for level in target..=current {
                // SAFETY: level bounded by current_zone_level <= max.
                let offset = unsafe { self.free_list(level).pop(base) };
                if offset == 0 {
                    continue;
                }
                // Split the chunk down to the target level, returning the
                // right halves to their freelists.
                let mut level = level;
                let mut cur_size = size_of_level(level, min);
                while level > target {
                    let half = cur_size >> 1;
                    // SAFETY: level-1 < level <= max.
                    unsafe { self.free_list(level - 1).push(base, offset + half) };
                    level -= 1;
                    cur_size = half;
                }
                // SAFETY: the chunk is exclusively ours until freed.
                unsafe { fam::memset_persist(base.add(offset as usize), 0, chunk_size as usize) };
                self.set_bitmap_bit(target, offset);
                return Some(pack_level(offset, target));
            }

            // Every reachable freelist is empty.
            if self.is_grow_in_progress() {
                std::thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            if self.current_zone_level() < self.max_zone_level() {
                if self.grow() {
                    continue;
                }
            }
            return None;
        }
    }

    /// Free a chunk previously returned by [`Zone::alloc`] (level byte
    /// still packed).
    pub fn free(&self, offset_with_level: Offset) {
        if offset_with_level == 0 {
            return;
        }
        let offset = strip_level(offset_with_level);
        let level = level_of_offset(offset_with_level);
        self.clear_bitmap_bit(level, offset);
        // SAFETY: a level handed out by alloc is within bounds.
        unsafe { self.free_list(level).push(self.base.as_ptr(), offset) };
    }

    /// Whether an offset (with or without level byte) is inside the zone.
    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        let stripped = strip_level(offset);
        stripped > 0 && stripped < self.max_zone_size()
    }

    /// Translate an offset (level byte tolerated) to a local address.
    ///
    /// # Safety
    ///
    /// The offset must be inside the zone and the mapping live.
    pub unsafe fn offset_to_ptr(&self, offset: Offset) -> *mut u8 {
        // SAFETY: per the contract above.
        unsafe { self.base.as_ptr().add(strip_level(offset) as usize) }
    }

    fn is_grow_in_progress(&self) -> bool {
        self.read_field(unsafe { addr_of!((*self.header()).grow_in_progress) }) != 0
    }

    /// Double the provisioned region. Returns `true` if the caller should
    /// retry allocating (we grew, or someone else holds the latch), `false`
    /// when the zone is already at its maximum.
    pub fn grow(&self) -> bool {
        let header = self.header();
        let latch = unsafe { addr_of_mut!((*header).grow_in_progress) as *mut u8 };
        // SAFETY: header field inside the mapping.
        if unsafe { fam::u64_cas(latch, 0, 1) } != 0 {
            // A concurrent grow is in flight; let it finish and retry.
            return true;
        }

        let current = self.current_zone_level();
        if current >= self.max_zone_level() {
            unsafe { fam::u64_cas(latch, 1, 0) };
            return false;
        }

        let chunk_size = size_of_level(current, self.min_object_size());
        let level_addr = unsafe { addr_of_mut!((*header).current_zone_level) as *mut u8 };
        // SAFETY: we hold the grow latch; nobody else advances the level.
        let observed = unsafe { fam::u64_cas(level_addr, current, current + 1) };
        debug_assert_eq!(observed, current);
        fam::persist(level_addr, 8);
        trace!(from = current, to = current + 1, "zone grow");

        // The new top half is one chunk of the old zone size.
        // SAFETY: current < max level.
        unsafe { self.free_list(current).push(self.base.as_ptr(), chunk_size) };

        unsafe { fam::u64_cas(latch, 1, 0) };
        true
    }

    fn bitmap_word(&self, bitmap_offset: u64, global_bit: u64) -> (*mut u8, u64) {
        let word_addr = bitmap_offset + (global_bit / 64) * 8;
        // SAFETY: the bitmap region is inside the mapping.
        let addr = unsafe { self.base.as_ptr().add(word_addr as usize) };
        (addr, global_bit % 64)
    }

    fn alloc_bitmap_bit(&self, level: u64, offset: Offset) -> (*mut u8, u64) {
        let max_level = self.max_zone_level();
        debug_assert!(level <= max_level);
        // Levels are stored smallest-chunk first: level l starts after the
        // bits of all finer levels.
        let level_start = (1u64 << (max_level + 1)) - (1u64 << (max_level - level + 1));
        let chunk_index = offset / size_of_level(level, self.min_object_size());
        self.bitmap_word(self.bitmap_start(), level_start + chunk_index)
    }

    fn set_bitmap_bit(&self, level: u64, offset: Offset) {
        let (addr, bit) = self.alloc_bitmap_bit(level, offset);
        self.modify_bit(addr, bit, true);
    }

    fn clear_bitmap_bit(&self, level: u64, offset: Offset) {
        let (addr, bit) = self.alloc_bitmap_bit(level, offset);
        self.modify_bit(addr, bit, false);
    }

    /// Whether the allocation bitmap records `offset` allocated at `level`.
    pub fn test_bitmap_bit(&self, level: u64, offset: Offset) -> bool {
        let (addr, bit) = self.alloc_bitmap_bit(level, offset);
        // SAFETY: bitmap word inside the mapping.
        unsafe { fam::u64_read(addr) & (1 << bit) != 0 }
    }

    fn modify_bit(&self, addr: *mut u8, bit: u64, set: bool) {
        let mask = 1u64 << bit;
        loop {
            // SAFETY: callers pass bitmap words inside the mapping.
            let old = unsafe { fam::u64_read(addr) };
            if set {
                debug_assert_eq!(old & mask, 0, "chunk already allocated");
            } else {
                debug_assert_ne!(old & mask, 0, "chunk already free");
            }
            let new = if set { old | mask } else { old & !mask };
            if unsafe { fam::u64_cas(addr, old, new) } == old {
                fam::persist(addr, 8);
                return;
            }
        }
    }

    fn set_merge_status(&self, from: u64, to: u64) {
        let addr = unsafe { addr_of_mut!((*self.header()).merge_status) as *mut u8 };
        // SAFETY: header field; the merge latch serializes writers.
        let observed = unsafe { fam::u64_cas(addr, from, to) };
        debug_assert_eq!(observed, from, "merge status machine out of order");
        fam::persist(addr, 8);
    }

    fn write_field(&self, addr: *mut u64, value: u64) {
        // SAFETY: callers pass header fields inside the mapping.
        unsafe { fam::u64_write(addr as *mut u8, value) };
        fam::persist(addr as *const u8, 8);
    }

    /// Coalesce buddies on every level below the current one.
    ///
    /// Offline maintenance: concurrent allocation at the level being merged
    /// is starved (its freelist is swapped aside), and only one merge may
    /// run zone-wide. Returns [`Error::ZoneBusy`] if another merge holds the
    /// latch.
    pub fn start_merge(&self) -> Result<()> {
        let current = self.current_zone_level();
        for level in 0..current {
            self.merge_level(level)?;
        }
        Ok(())
    }

    fn merge_level(&self, level: u64) -> Result<()> {
        debug_assert!(level < self.max_zone_level());
        let header = self.header();
        let latch = unsafe { addr_of_mut!((*header).merge_in_progress) as *mut u8 };
        // SAFETY: header field inside the mapping.
        if unsafe { fam::u64_cas(latch, 0, 1) } != 0 {
            return Err(Error::ZoneBusy);
        }
        debug_assert_eq!(self.merge_status(), merge_status::IDLE);
        self.write_field(
            unsafe { addr_of_mut!((*header).current_merge_level) },
            level,
        );
        trace!(level, "zone merge");

        self.merge_swap(level);
        self.merge_mark_bitmap(level);
        self.merge_rebuild(level);
        self.merge_drain(level);
        self.merge_finish();
        Ok(())
    }

    /// Swap freelist[level] onto the safe-copy stack in one CAS each.
    fn merge_swap(&self, level: u64) {
        // SAFETY: level < max by merge_level's contract.
        let freelist = unsafe { self.free_list(level) };
        let mut level_head = freelist.head();
        loop {
            let safe_head = self.safe_copy().head();
            if self.safe_copy().cas_head(safe_head, level_head).is_err() {
                continue;
            }
            match freelist.cas_head(level_head, 0) {
                Ok(_) => break,
                // A concurrent free pushed meanwhile; chase the new head.
                Err(observed) => level_head = observed,
            }
        }
        self.set_merge_status(merge_status::IDLE, merge_status::SWAP_COMPLETED);
    }

    /// Mark every chunk of the safe copy in the merge bitmap.
    fn merge_mark_bitmap(&self, level: u64) {
        let chunk_size = size_of_level(level, self.min_object_size());
        let merge_start = self.merge_bitmap_start();
        let base = self.base.as_ptr();
        let mut offset = self.safe_copy().head();
        while offset != 0 {
            // SAFETY: chain links live in the chunks themselves.
            let next = unsafe { fam::u64_read(base.add(offset as usize)) };
            let (addr, bit) = self.bitmap_word(merge_start, offset / chunk_size);
            self.modify_bit(addr, bit, true);
            offset = next;
        }
        self.set_merge_status(merge_status::SWAP_COMPLETED, merge_status::BITMAP_COMPLETED);
    }

    /// Walk the merge bitmap in buddy pairs, pushing merged chunks for the
    /// next level and loners back for this one.
    fn merge_rebuild(&self, level: u64) {
        let chunk_size = size_of_level(level, self.min_object_size());
        let bits = 1u64 << (self.max_zone_level() - level);
        let words = bits.div_ceil(64).max(1);
        let merge_start = self.merge_bitmap_start();
        let base = self.base.as_ptr();

        for word in 0..words {
            // SAFETY: merge bitmap words inside the mapping.
            let addr = unsafe { base.add((merge_start + word * 8) as usize) };
            let data = unsafe { fam::u64_read(addr) };
            if data == 0 {
                continue;
            }
            let mut bit = 0;
            while bit < 64 {
                let first = word * 64 + bit;
                match (data >> bit) & 0b11 {
                    0b11 => {
                        // Both buddies free: the pair becomes one chunk of
                        // the next level.
                        // SAFETY: pushes stay inside the mapped region.
                        unsafe { self.post_merge_next_level().push(base, first * chunk_size) };
                    }
                    0b01 => unsafe {
                        self.post_merge_level().push(base, first * chunk_size);
                    },
                    0b10 => unsafe {
                        self.post_merge_level().push(base, (first + 1) * chunk_size);
                    },
                    _ => {}
                }
                bit += 2;
            }
        }
        self.set_merge_status(
            merge_status::BITMAP_COMPLETED,
            merge_status::FREELIST_COMPLETED,
        );
    }

    /// Drain the post-merge stacks back into the real freelists. Popping is
    /// consuming, so resuming a half-done drain never duplicates a chunk.
    fn merge_drain(&self, level: u64) {
        let base = self.base.as_ptr();
        loop {
            // SAFETY: stacks and chunks live inside the mapping.
            let offset = unsafe { self.post_merge_next_level().pop(base) };
            if offset == 0 {
                break;
            }
            unsafe { self.free_list(level + 1).push(base, offset) };
        }
        loop {
            let offset = unsafe { self.post_merge_level().pop(base) };
            if offset == 0 {
                break;
            }
            unsafe { self.free_list(level).push(base, offset) };
        }
    }

    fn merge_finish(&self) {
        let header = self.header();
        let merge_size = ((1u64 << self.max_zone_level()) / 8).max(8);
        // Zeroing the merge bitmap before the status reset keeps the
        // invariant: status IDLE implies a clean merge bitmap.
        // SAFETY: merge bitmap region inside the mapping.
        unsafe {
            fam::memset_persist(
                self.base.as_ptr().add(self.merge_bitmap_start() as usize),
                0,
                merge_size as usize,
            );
        }
        self.safe_copy().set_head(0);
        self.write_field(unsafe { addr_of_mut!((*header).current_merge_level) }, 0);
        self.set_merge_status(merge_status::FREELIST_COMPLETED, merge_status::IDLE);
        // SAFETY: header field inside the mapping.
        unsafe { fam::u64_cas(addr_of_mut!((*header).merge_in_progress) as *mut u8, 1, 0) };
    }

    /// Resume or roll back maintenance interrupted by a crash.
    ///
    /// Inspects the grow and merge latches and the merge status word and
    /// continues from the last completed step. At worst one grown chunk may
    /// be orphaned until an offline scan reconciles the bitmap.
    pub fn recover(&self) {
        let header = self.header();

        if self.is_grow_in_progress() {
            warn!("zone: clearing stale grow latch; one chunk may be orphaned");
            self.write_field(unsafe { addr_of_mut!((*header).grow_in_progress) }, 0);
        }

        let merging =
            self.read_field(unsafe { addr_of!((*header).merge_in_progress) }) != 0;
        if !merging {
            return;
        }
        let level = self.read_field(unsafe { addr_of!((*header).current_merge_level) });
        let base = self.base.as_ptr();
        match self.merge_status() {
            merge_status::SWAP_COMPLETED => {
                // The safe-copy chain is still intact: undo the swap by
                // draining it straight back, discarding any partial marks.
                trace!(level, "zone recover: undoing interrupted merge swap");
                let merge_size = ((1u64 << self.max_zone_level()) / 8).max(8);
                // SAFETY: merge bitmap region inside the mapping.
                unsafe {
                    fam::memset_persist(
                        base.add(self.merge_bitmap_start() as usize),
                        0,
                        merge_size as usize,
                    );
                }
                loop {
                    // SAFETY: stacks and chunks inside the mapping.
                    let offset = unsafe { self.safe_copy().pop(base) };
                    if offset == 0 {
                        break;
                    }
                    unsafe { self.free_list(level).push(base, offset) };
                }
                self.write_field(unsafe { addr_of_mut!((*header).merge_status) }, merge_status::IDLE);
                self.write_field(unsafe { addr_of_mut!((*header).current_merge_level) }, 0);
            }
            merge_status::BITMAP_COMPLETED => {
                // The merge bitmap is complete and authoritative; the safe
                // copy and partial post stacks are rebuilt from it.
                trace!(level, "zone recover: resuming merge from complete bitmap");
                self.safe_copy().set_head(0);
                self.post_merge_level().set_head(0);
                self.post_merge_next_level().set_head(0);
                self.merge_rebuild(level);
                self.merge_drain(level);
                self.merge_finish();
                return;
            }
            merge_status::FREELIST_COMPLETED => {
                trace!(level, "zone recover: resuming merge drain");
                self.merge_drain(level);
                self.merge_finish();
                return;
            }
            _ => {
                // Latch taken but nothing recorded: the merge had not
                // reached its first commit point.
                self.write_field(unsafe { addr_of_mut!((*header).current_merge_level) }, 0);
            }
        }
        self.write_field(unsafe { addr_of_mut!((*header).merge_in_progress) }, 0);
    }
}

// Keep the merge-phase stacks at known offsets; the recovery logic depends
// on the header layout staying put.
const _: () = {
    assert!(std::mem::size_of::<ZoneHeader>() % 8 == 0);
    assert!(std::mem::size_of::<Stack>() == 8);
    assert!(std::mem::size_of::<AtomicU64>() == 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE_SIZE: usize = 64 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; ZONE_SIZE]);

    fn new_zone(arena: &mut Box<Arena>, initial: u64) -> Zone {
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        unsafe { Zone::create(base, initial, 64, ZONE_SIZE as u64).unwrap() }
    }

    #[test]
    fn test_create_and_reopen() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        assert_eq!(zone.min_object_size(), 64);
        assert_eq!(zone.max_zone_size(), ZONE_SIZE as u64);

        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        let reopened = unsafe { Zone::open(base).unwrap() };
        assert_eq!(reopened.current_zone_level(), zone.current_zone_level());

        zone.invalidate();
        assert!(unsafe { Zone::open(base) }.is_err());
    }

    #[test]
    fn test_create_rejects_bad_parameters() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        assert!(unsafe { Zone::create(base, 4096, 32, ZONE_SIZE as u64) }.is_err());
        assert!(unsafe { Zone::create(base, 4096, 96, ZONE_SIZE as u64) }.is_err());
        assert!(unsafe { Zone::create(base, 4096, 64, 48 * 1024) }.is_err());
    }

    #[test]
    fn test_alloc_alignment_and_level() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);

        let small = zone.alloc(1).unwrap();
        assert_eq!(level_of_offset(small), 0);
        assert_eq!(strip_level(small) % 64, 0);
        assert!(zone.test_bitmap_bit(0, strip_level(small)));

        let big = zone.alloc(200).unwrap();
        assert_eq!(level_of_offset(big), 2);
        assert_eq!(strip_level(big) % 256, 0);

        zone.free(small);
        assert!(!zone.test_bitmap_bit(0, strip_level(small)));
        zone.free(big);
    }

    #[test]
    fn test_alloc_zeroes_the_chunk() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        let a = zone.alloc(64).unwrap();
        unsafe {
            let p = zone.offset_to_ptr(a);
            std::ptr::write_bytes(p, 0xff, 64);
        }
        zone.free(a);
        let b = zone.alloc(64).unwrap();
        assert_eq!(strip_level(b), strip_level(a));
        unsafe {
            let p = zone.offset_to_ptr(b);
            assert!(std::slice::from_raw_parts(p, 64).iter().all(|&x| x == 0));
        }
    }

    #[test]
    fn test_grow_extends_the_zone() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        let start_level = zone.current_zone_level();

        // Exhaust and keep allocating: the zone must grow to serve.
        let mut held = Vec::new();
        for _ in 0..((ZONE_SIZE as u64 / 4096) * 2) {
            match zone.alloc(4096) {
                Some(p) => held.push(p),
                None => break,
            }
        }
        assert!(zone.current_zone_level() > start_level);
        // The hard ceiling holds.
        assert_eq!(zone.current_zone_level(), zone.max_zone_level());
        assert!(zone.alloc(4096).is_none());
        for p in held {
            zone.free(p);
        }
    }

    #[test]
    fn test_alloc_too_large_fails_fast() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        assert!(zone.alloc(ZONE_SIZE as u64 * 2).is_none());
    }

    #[test]
    fn test_merge_coalesces_buddies() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);

        // Splitting a level-1 chunk leaves its right half on freelist 0;
        // freeing the left half puts both buddies there.
        let a = zone.alloc(64).unwrap();
        let a_off = strip_level(a);
        zone.free(a);

        zone.start_merge().unwrap();
        assert_eq!(zone.merge_status(), merge_status::IDLE);

        // The pair must now be allocatable as one level-1 chunk at the
        // buddy-aligned offset.
        let merged = zone.alloc(128).unwrap();
        assert_eq!(strip_level(merged) & !(128 - 1), strip_level(merged));
        assert_eq!(strip_level(merged), a_off & !(128 - 1));
        zone.free(merged);
    }

    #[test]
    fn test_merge_preserves_free_capacity() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);

        // Fragment: allocate every 64-byte chunk, free all of them.
        let mut chunks = Vec::new();
        let before_level = zone.current_zone_level();
        loop {
            if zone.current_zone_level() != before_level {
                // Stop before grow kicks in; we want a fixed budget.
                break;
            }
            match zone.alloc(64) {
                Some(p) => chunks.push(p),
                None => break,
            }
        }
        let total = chunks.len();
        assert!(total > 8);
        for p in chunks {
            zone.free(p);
        }

        zone.start_merge().unwrap();

        // Everything freed must still be allocatable.
        let mut reallocated = 0;
        while zone.alloc(64).is_some() {
            reallocated += 1;
            if reallocated > total * 2 {
                break;
            }
        }
        assert!(reallocated >= total, "merge lost chunks: {} < {}", reallocated, total);
    }

    #[test]
    fn test_recover_clears_stale_grow_latch() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        // Simulate a crash mid-grow.
        let header = zone.header();
        unsafe {
            fam::u64_write(addr_of_mut!((*header).grow_in_progress) as *mut u8, 1)
        };
        zone.recover();
        assert!(!zone.is_grow_in_progress());
        assert!(zone.alloc(64).is_some());
    }

    #[test]
    fn test_recover_undoes_interrupted_swap() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        let a = zone.alloc(64).unwrap();
        zone.free(a);

        // Crash right after the swap phase: latch held, freelist 0 moved to
        // the safe copy.
        zone.merge_swap(0);
        let header = zone.header();
        unsafe {
            fam::u64_write(addr_of_mut!((*header).merge_in_progress) as *mut u8, 1);
            fam::u64_write(addr_of_mut!((*header).current_merge_level) as *mut u8, 0);
        }

        zone.recover();
        assert_eq!(zone.merge_status(), merge_status::IDLE);
        // The freed chunk is allocatable again (the undo drain may have
        // reordered the freelist).
        let b = zone.alloc(64).unwrap();
        let c = zone.alloc(64).unwrap();
        assert!(
            strip_level(b) == strip_level(a) || strip_level(c) == strip_level(a),
            "freed chunk lost by recovery"
        );
    }

    #[test]
    fn test_heartbeat() {
        let mut arena = Box::new(Arena([0; ZONE_SIZE]));
        let zone = new_zone(&mut arena, 4096);
        assert!(zone.heartbeat_stale(0));
        zone.touch_heartbeat();
        assert!(!zone.heartbeat_stale(1_000_000));
    }
}
