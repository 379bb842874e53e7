// SPDX-License-Identifier: Apache-2.0
// Copyright NSaaS Authors

//! Descriptor rings living inside the shared mapping.
//!
//! A ring is a bounded queue of fixed-size [`Pod`] entries with free-running
//! 32-bit head/tail counters, masked on slot access. Producers claim a range
//! of slots with a CAS on the producer head, write the entries, then publish
//! by advancing the producer tail; consumers mirror the scheme on their own
//! counter pair. The CAS claim makes the primitive safe for multiple
//! producers or consumers, which the free-buffer pool needs (both endpoints
//! allocate and free), while the data and control rings use it in their
//! single-producer/single-consumer roles.
//!
//! Bulk operations are all-or-nothing: they move exactly `n` entries or
//! none, reported by the return count. Callers treat anything less than `n`
//! as failure.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

/// Ring bookkeeping, placed at the start of each ring region.
///
/// Producer and consumer counter pairs sit on separate cache lines so the
/// two endpoints do not false-share.
#[repr(C, align(64))]
pub struct RingHdr {
    capacity: u32,
    mask: u32,
    _pad0: [u8; 56],
    prod_head: AtomicU32,
    prod_tail: AtomicU32,
    _pad1: [u8; 56],
    cons_head: AtomicU32,
    cons_tail: AtomicU32,
    _pad2: [u8; 56],
}

const _: () = assert!(size_of::<RingHdr>() == 192);

/// Bytes occupied by a ring of `capacity` entries of type `T`, header
/// included.
#[must_use]
pub const fn ring_bytes<T>(capacity: u32) -> usize {
    size_of::<RingHdr>() + capacity as usize * size_of::<T>()
}

/// A view of one ring inside a shared mapping.
///
/// The view borrows the mapping that contains the ring; it holds no state of
/// its own beyond the base pointer, so it is cheap to re-create per
/// operation.
pub struct Ring<'a, T: Pod> {
    hdr: &'a RingHdr,
    slots: NonNull<T>,
    _region: PhantomData<&'a [T]>,
}

impl<T: Pod> Clone for Ring<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Pod> Copy for Ring<'_, T> {}

// SAFETY: all mutation goes through the header atomics or through slot
// writes that the counter protocol orders; the ring is shared between
// processes by design.
unsafe impl<T: Pod> Send for Ring<'_, T> {}
// SAFETY: see above.
unsafe impl<T: Pod> Sync for Ring<'_, T> {}

impl<'a, T: Pod> Ring<'a, T> {
    /// Attach to an already-initialized ring at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a ring region of at least
    /// [`ring_bytes`]`::<T>(capacity)` bytes, 64-byte aligned, previously
    /// initialized with [`Ring::init`], and valid for `'a`.
    pub unsafe fn attach(base: NonNull<u8>) -> Ring<'a, T> {
        let hdr = unsafe { base.cast::<RingHdr>().as_ref() };
        let slots = unsafe { base.add(size_of::<RingHdr>()).cast::<T>() };
        Ring {
            hdr,
            slots,
            _region: PhantomData,
        }
    }

    /// Initialize the ring region at `base` and attach to it.
    ///
    /// `capacity` must be a power of two; the full capacity is usable.
    ///
    /// # Safety
    ///
    /// Same region requirements as [`Ring::attach`], plus exclusive access
    /// for the duration of the call.
    pub unsafe fn init(base: NonNull<u8>, capacity: u32) -> Ring<'a, T> {
        debug_assert!(capacity.is_power_of_two());
        let hdr = unsafe { base.cast::<RingHdr>().as_mut() };
        hdr.capacity = capacity;
        hdr.mask = capacity - 1;
        hdr.prod_head = AtomicU32::new(0);
        hdr.prod_tail = AtomicU32::new(0);
        hdr.cons_head = AtomicU32::new(0);
        hdr.cons_tail = AtomicU32::new(0);
        unsafe { Self::attach(base) }
    }

    /// Number of entries the ring can hold.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.hdr.capacity
    }

    /// Entries currently queued (racy snapshot).
    #[must_use]
    pub fn len(&self) -> u32 {
        let prod = self.hdr.prod_tail.load(Ordering::Acquire);
        let cons = self.hdr.cons_tail.load(Ordering::Acquire);
        prod.wrapping_sub(cons)
    }

    /// True when no entries are queued (racy snapshot).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue all of `items`, or nothing.
    ///
    /// Returns `items.len()` on success, `0` when the ring lacks room.
    #[allow(clippy::cast_possible_truncation)] // ring capacities are u32
    pub fn enqueue_bulk(&self, items: &[T]) -> usize {
        let n = items.len() as u32;
        if n == 0 {
            return 0;
        }
        let hdr = self.hdr;
        let mut head;
        loop {
            head = hdr.prod_head.load(Ordering::Relaxed);
            let cons_tail = hdr.cons_tail.load(Ordering::Acquire);
            let free = hdr.capacity.wrapping_sub(head.wrapping_sub(cons_tail));
            if free < n {
                return 0;
            }
            let claim = hdr.prod_head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            if claim.is_ok() {
                break;
            }
        }
        for (i, item) in items.iter().enumerate() {
            let slot = (head.wrapping_add(i as u32) & hdr.mask) as usize;
            // SAFETY: slot < capacity by the mask, and the claimed range
            // [head, head + n) is ours alone until we publish.
            unsafe { self.slots.as_ptr().add(slot).write(*item) };
        }
        // Earlier claimants publish first so consumers never observe a gap.
        while hdr.prod_tail.load(Ordering::Relaxed) != head {
            core::hint::spin_loop();
        }
        hdr.prod_tail.store(head.wrapping_add(n), Ordering::Release);
        items.len()
    }

    /// Dequeue exactly `out.len()` entries, or nothing.
    ///
    /// Returns `out.len()` on success, `0` when too few entries are queued.
    #[allow(clippy::cast_possible_truncation)] // ring capacities are u32
    pub fn dequeue_bulk(&self, out: &mut [T]) -> usize {
        let n = out.len() as u32;
        if n == 0 {
            return 0;
        }
        let hdr = self.hdr;
        let mut head;
        loop {
            head = hdr.cons_head.load(Ordering::Relaxed);
            let prod_tail = hdr.prod_tail.load(Ordering::Acquire);
            let avail = prod_tail.wrapping_sub(head);
            if avail < n {
                return 0;
            }
            let claim = hdr.cons_head.compare_exchange_weak(
                head,
                head.wrapping_add(n),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
            if claim.is_ok() {
                break;
            }
        }
        for (i, out_slot) in out.iter_mut().enumerate() {
            let slot = (head.wrapping_add(i as u32) & hdr.mask) as usize;
            // SAFETY: slot < capacity by the mask, and the producer
            // published [.., head + n) before we acquired its tail.
            *out_slot = unsafe { self.slots.as_ptr().add(slot).read() };
        }
        while hdr.cons_tail.load(Ordering::Relaxed) != head {
            core::hint::spin_loop();
        }
        hdr.cons_tail.store(head.wrapping_add(n), Ordering::Release);
        out.len()
    }
}
