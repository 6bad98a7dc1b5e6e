//! The Small-Object Bucket Pool services every allocation whose
//! rounded size is at most one page.  A single process-wide mutex
//! guards the bucket list, every bucket's bitmap, and the Metadata
//! Arena that backs their descriptors.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::arena::Arena;
use crate::bucket::BucketRecord;
use crate::page_source::{self, PageSource};
use crate::size_class;

struct SmallPoolState {
    arena: Arena,
    bucket_head: Option<u32>,
}

impl SmallPoolState {
    fn new(page_source: &'static dyn PageSource) -> Self {
        Self {
            arena: Arena::new(page_source),
            bucket_head: None,
        }
    }

    /// Linear walk of the bucket list, stopping at the first bucket
    /// whose class matches and whose bitmap is not fully set.
    fn find_non_full_bucket(&self, class: u16) -> Option<u32> {
        let mut cur = self.bucket_head;
        while let Some(idx) = cur {
            let rec = self.arena.record(idx);
            if rec.class == class && !rec.is_full() {
                return Some(idx);
            }
            cur = rec.next;
        }
        None
    }

    /// Links a freshly initialised bucket record at the head of the
    /// bucket list and returns its index.
    fn install_bucket(&mut self, class: u16, region: usize) -> u32 {
        let record = BucketRecord::new(class, region, self.bucket_head);
        let idx = self.arena.push(record);
        self.bucket_head = Some(idx);
        idx
    }

    /// Finds the bucket whose region contains `address`, if any.
    fn locate(&self, address: usize, page_size: usize) -> Option<u32> {
        let mut cur = self.bucket_head;
        while let Some(idx) = cur {
            let rec = self.arena.record(idx);
            if address >= rec.region && address < rec.region + page_size {
                return Some(idx);
            }
            cur = rec.next;
        }
        None
    }
}

lazy_static::lazy_static! {
    static ref SMALL_POOL: Mutex<SmallPoolState> =
        Mutex::new(SmallPoolState::new(page_source::default_page_source()));
}

/// Rounds `size` up to a size class, finds (or creates) a bucket with
/// a free slot, and returns a fresh small allocation.
///
/// # Panics
///
/// Panics if `size` exceeds the page size; callers must route larger
/// requests to the Large-Object Direct Mapper instead.
#[ensures(ret.as_ptr() as usize % size_class::class_for_size(size).unwrap() == 0,
          "a slot's address is aligned to its size class")]
pub(crate) fn alloc(size: usize) -> NonNull<c_void> {
    let class = size_class::class_for_size(size).expect("size must fit within a page") as u16;

    loop {
        {
            let mut state = SMALL_POOL.lock().unwrap();
            if let Some(idx) = state.find_non_full_bucket(class) {
                let slot = {
                    let rec = state.arena.record(idx);
                    rec.first_clear_bit()
                        .expect("a non-full bucket always has a clear bit")
                };
                let rec = state.arena.record_mut(idx);
                rec.set_bit(slot);
                let addr = rec.region + slot * class as usize;
                return NonNull::new(addr as *mut c_void).expect("slot address is never null");
            }
        }

        // No bucket of this class has room. Acquire a fresh page
        // without holding the lock, then take the lock only to
        // install the resulting bucket.
        create_bucket(class);
    }
}

/// Acquires one page from the Page Source and installs it as a new
/// bucket of `class`.  The page acquisition itself happens outside
/// the small-pool mutex; only the bookkeeping update is serialised.
fn create_bucket(class: u16) {
    let region = page_source::acquire(1);

    let mut state = SMALL_POOL.lock().unwrap();
    state.install_bucket(class, region.as_ptr() as usize);
}

/// Attempts to free `address` as a small allocation.  Returns `false`
/// if no bucket's region contains `address` (the caller should then
/// treat it as a large allocation).
///
/// # Panics
///
/// Panics (double-free) if the address is found but its slot bit is
/// already clear.
pub(crate) fn try_free(address: usize) -> bool {
    let page_size = page_source::page_size();
    let mut state = SMALL_POOL.lock().unwrap();

    match state.locate(address, page_size) {
        Some(idx) => {
            let class = state.arena.record(idx).class as usize;
            let region = state.arena.record(idx).region;
            let slot = (address - region) / class;

            let rec = state.arena.record_mut(idx);
            if !rec.test_bit(slot) {
                panic!("double free: address {:#x} is already released", address);
            }
            rec.clear_bit(slot);
            true
        }
        None => false,
    }
}

/// Returns the size class of `address` if it is currently a live
/// small allocation, without freeing it.
pub(crate) fn class_of(address: usize) -> Option<u16> {
    let page_size = page_source::page_size();
    let state = SMALL_POOL.lock().unwrap();
    state
        .locate(address, page_size)
        .map(|idx| state.arena.record(idx).class)
}

/// Implements the same-domain fast path of `small_realloc`: if the
/// new size rounds to the same class as the old one, `address` is
/// returned unchanged; otherwise a new slot is allocated, the
/// overlapping prefix is copied, and the old slot is freed.
pub(crate) fn realloc_same_domain(address: NonNull<c_void>, new_size: usize) -> NonNull<c_void> {
    let addr = address.as_ptr() as usize;
    let old_class = class_of(addr).expect("address must be a live small allocation") as usize;
    let new_class = size_class::class_for_size(new_size).expect("new_size must fit within a page");

    if new_class == old_class {
        return address;
    }

    let new_addr = alloc(new_size);
    let copy_len = old_class.min(new_class);
    unsafe {
        std::ptr::copy_nonoverlapping(
            address.as_ptr() as *const u8,
            new_addr.as_ptr() as *mut u8,
            copy_len,
        );
    }

    let freed = try_free(addr);
    assert!(freed, "address classified as small must still be small");

    new_addr
}

/// Returns `(class, region, live_slots, total_slots)` for every live
/// bucket, for the diagnostic dump surface.
pub(crate) fn describe_buckets() -> Vec<(u16, usize, usize, usize)> {
    let state = SMALL_POOL.lock().unwrap();
    let mut out = Vec::new();
    let mut cur = state.bucket_head;
    while let Some(idx) = cur {
        let rec = state.arena.record(idx);
        let total = size_class::slots_per_class(rec.class as usize);
        let live = (0..total).filter(|&i| rec.test_bit(i)).count();
        out.push((rec.class, rec.region, live, total));
        cur = rec.next;
    }
    out
}

#[cfg(any(test, feature = "check_contracts"))]
pub(crate) fn every_bucket_bitmap_is_zero() -> bool {
    let state = SMALL_POOL.lock().unwrap();
    let mut cur = state.bucket_head;
    while let Some(idx) = cur {
        let rec = state.arena.record(idx);
        if !rec.is_empty() {
            return false;
        }
        cur = rec.next;
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_slot_reused_after_free() {
        let p = alloc(10);
        try_free(p.as_ptr() as usize);
        let q = alloc(10);
        assert_eq!(p, q);
    }

    #[test]
    fn bucket_fills_then_grows() {
        // class 128 has 32 slots per page.
        let mut allocations = Vec::new();
        let first = alloc(100);
        allocations.push(first);
        for _ in 1..32 {
            allocations.push(alloc(100));
        }

        assert_eq!(allocations[1].as_ptr() as usize, first.as_ptr() as usize + 128);

        // 33rd allocation of the same class must land in a new bucket.
        let overflow = alloc(100);
        let first_page = first.as_ptr() as usize & !(page_source::page_size() - 1);
        let overflow_page = overflow.as_ptr() as usize & !(page_source::page_size() - 1);
        assert_ne!(first_page, overflow_page);

        for a in allocations {
            try_free(a.as_ptr() as usize);
        }
        try_free(overflow.as_ptr() as usize);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let p = alloc(10);
        try_free(p.as_ptr() as usize);
        try_free(p.as_ptr() as usize);
    }

    #[test]
    fn realloc_same_class_is_a_no_op() {
        let p = alloc(10); // class 12
        let q = realloc_same_domain(p, 11); // still class 12
        assert_eq!(p, q);
        try_free(q.as_ptr() as usize);
    }

    #[test]
    fn realloc_growing_copies_prefix() {
        let p = alloc(5); // class 8
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), p.as_ptr() as *mut u8, 5);
        }
        let q = realloc_same_domain(p, 64); // class 64
        let copied = unsafe { std::slice::from_raw_parts(q.as_ptr() as *const u8, 5) };
        assert_eq!(copied, b"hello");
        try_free(q.as_ptr() as usize);
    }
}
