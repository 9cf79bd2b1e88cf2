//! Lock-free persistent LIFO over shelf offsets.
//!
//! The stack is a single 64-bit head word living in shared persistent
//! memory; nodes are the client's own blocks, linked through their first
//! eight bytes. Offset 0 terminates the list (shelf offset 0 always holds a
//! header, so no node can live there).
//!
//! There is no separate node pool, which is what makes the plain 64-bit CAS
//! safe against ABA: a popped block belongs exclusively to its allocator's
//! caller until freed, so it cannot be re-pushed while another pop still
//! holds a stale reference to it.

use crate::fam;
use crate::global_ptr::Offset;
use std::sync::atomic::{AtomicU64, Ordering};

/// A persistent stack head. Embedded by value inside persistent headers.
#[repr(C)]
pub struct Stack {
    head: AtomicU64,
}

impl Stack {
    /// Push the node at `node` (a nonzero offset from `base`).
    ///
    /// The node's link word is persisted before the head is published, so a
    /// crash can lose at most the push itself, never corrupt the chain.
    ///
    /// # Safety
    ///
    /// `base` must be the live mapping this stack's offsets are relative to,
    /// and `node` a valid, caller-owned block within it.
    pub unsafe fn push(&self, base: *mut u8, node: Offset) {
        debug_assert_ne!(node, 0);
        // SAFETY: caller guarantees node is a valid offset into the mapping.
        let node_addr = unsafe { base.add(node as usize) };
        loop {
            let old = self.head.load(Ordering::Acquire);
            // SAFETY: node link word is 8-aligned block storage.
            unsafe { fam::u64_write(node_addr, old) };
            fam::persist(node_addr, 8);
            if self
                .head
                .compare_exchange_weak(old, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                fam::persist(&self.head as *const AtomicU64 as *const u8, 8);
                return;
            }
        }
    }

    /// Pop the most recently pushed node, or 0 when empty.
    ///
    /// # Safety
    ///
    /// `base` must be the live mapping this stack's offsets are relative to.
    pub unsafe fn pop(&self, base: *mut u8) -> Offset {
        loop {
            let old = self.head.load(Ordering::Acquire);
            if old == 0 {
                return 0;
            }
            // SAFETY: a nonzero head is a valid node offset by the push
            // contract.
            let next = unsafe { fam::u64_read(base.add(old as usize)) };
            if self
                .head
                .compare_exchange_weak(old, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                fam::persist(&self.head as *const AtomicU64 as *const u8, 8);
                return old;
            }
        }
    }

    /// Current head offset (0 when empty). Advisory.
    pub fn head(&self) -> Offset {
        self.head.load(Ordering::Acquire)
    }

    /// Overwrite the head. Used only by offline maintenance that holds the
    /// owning structure's latch.
    pub fn set_head(&self, value: Offset) {
        self.head.store(value, Ordering::Release);
        fam::persist(&self.head as *const AtomicU64 as *const u8, 8);
    }

    /// CAS the head directly. Used by the zone merge to swap a whole list
    /// out in one step.
    pub fn cas_head(&self, expected: Offset, desired: Offset) -> std::result::Result<u64, u64> {
        let r = self
            .head
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire);
        fam::persist(&self.head as *const AtomicU64 as *const u8, 8);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[repr(align(64))]
    struct Arena([u8; 8192]);

    fn stack_at_zero(arena: &mut Arena) -> &Stack {
        // SAFETY: offset 0 of the arena is 8-aligned zeroed storage.
        unsafe { &*(arena.0.as_ptr() as *const Stack) }
    }

    #[test]
    fn test_lifo_order() {
        let mut arena = Box::new(Arena([0; 8192]));
        let base = arena.0.as_mut_ptr();
        let stack = stack_at_zero(&mut arena);

        unsafe {
            assert_eq!(stack.pop(base), 0);
            stack.push(base, 64);
            stack.push(base, 128);
            stack.push(base, 192);
            assert_eq!(stack.pop(base), 192);
            assert_eq!(stack.pop(base), 128);
            assert_eq!(stack.pop(base), 64);
            assert_eq!(stack.pop(base), 0);
        }
    }

    #[test]
    fn test_concurrent_push_pop_conserves_nodes() {
        struct Shared(Box<Arena>);
        // SAFETY: the stack protocol serializes node ownership.
        unsafe impl Send for Shared {}
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared(Box::new(Arena([0; 8192]))));
        let base_addr = shared.0 .0.as_ptr() as usize;

        // Seed 32 nodes.
        {
            let stack = unsafe { &*(base_addr as *const Stack) };
            for i in 1..=32u64 {
                unsafe { stack.push(base_addr as *mut u8, i * 64) };
            }
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let base = shared.0 .0.as_ptr() as *mut u8;
                    let stack = unsafe { &*(base as *const Stack) };
                    for _ in 0..500 {
                        let node = unsafe { stack.pop(base) };
                        if node != 0 {
                            unsafe { stack.push(base, node) };
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Every node is back on the stack exactly once.
        let base = base_addr as *mut u8;
        let stack = unsafe { &*(base as *const Stack) };
        let mut seen = std::collections::BTreeSet::new();
        loop {
            let node = unsafe { stack.pop(base) };
            if node == 0 {
                break;
            }
            assert!(seen.insert(node), "node {} popped twice", node);
        }
        assert_eq!(seen.len(), 32);
    }
}
