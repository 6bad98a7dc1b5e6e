//! Dispatch routes each incoming call to the Small-Object Bucket
//! Pool or the Large-Object Direct Mapper, based on the requested
//! size and — for `free`/`realloc` — on classification of the
//! incoming address.
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::{large, page_source, small_pool};

/// Routes an allocation of `size` bytes to the small or large path.
pub(crate) fn alloc(size: usize) -> NonNull<c_void> {
    if size <= page_source::page_size() {
        small_pool::alloc(size)
    } else {
        large::alloc(size)
    }
}

/// Classifies `address` by asking the Small-Object Bucket Pool
/// whether any bucket's region contains it, then routes the free.
///
/// # Panics
///
/// Panics if `address` is neither a live small allocation nor
/// recognised by the large path's header (an invalid address is
/// fatal per the allocator's error-handling design).
pub(crate) fn free(address: NonNull<c_void>) {
    let addr = address.as_ptr() as usize;
    if small_pool::try_free(addr) {
        return;
    }

    large::free(address);
}

/// Routes a reallocation.  Classifies the old address; if both sides
/// are small and land in the same size class, the address is
/// returned unchanged.  Otherwise the new region is allocated, the
/// overlapping bytes are copied *before* the old region is released
/// (the source's copy-out-of-just-unmapped-memory defect this
/// specification rules out), and the old region is freed.
pub(crate) fn realloc(address: NonNull<c_void>, new_size: usize) -> NonNull<c_void> {
    let addr = address.as_ptr() as usize;
    let page_size = page_source::page_size();

    if let Some(_old_class) = small_pool::class_of(addr) {
        if new_size <= page_size {
            return small_pool::realloc_same_domain(address, new_size);
        }

        // Small -> large: copy the old slot's full class size, the
        // only "logical size" a small allocation has, then free it.
        let old_class = small_pool::class_of(addr).expect("still small") as usize;
        let new_addr = large::alloc(new_size);
        unsafe {
            std::ptr::copy_nonoverlapping(
                address.as_ptr() as *const u8,
                new_addr.as_ptr() as *mut u8,
                old_class.min(new_size),
            );
        }
        let freed = small_pool::try_free(addr);
        assert!(freed, "address classified as small must still be small");
        return new_addr;
    }

    // Old side is large.
    let old_len = large::logical_len(address);
    let old_usable = old_len - large::HEADER_SIZE;

    let new_addr = if new_size <= page_size {
        small_pool::alloc(new_size)
    } else {
        large::alloc(new_size)
    };

    let copy_len = old_usable.min(new_size);
    unsafe {
        std::ptr::copy_nonoverlapping(
            address.as_ptr() as *const u8,
            new_addr.as_ptr() as *mut u8,
            copy_len,
        );
    }

    // Release only after the copy: copying out of a region already
    // released back to the Page Source is undefined behaviour.
    large::free(address);

    new_addr
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_boundary_request_round_trips() {
        let page_size = page_source::page_size();
        let p = alloc(page_size);
        free(p);
    }

    #[test]
    fn just_over_page_goes_large_and_takes_two_pages() {
        let page_size = page_source::page_size();
        let p = alloc(page_size + 1);
        assert_eq!(large::logical_len(p), 2 * page_size);
        free(p);
    }

    #[test]
    fn realloc_small_to_large_preserves_prefix() {
        let p = alloc(16);
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), p.as_ptr() as *mut u8, 5);
        }
        let q = realloc(p, 64);
        let copied = unsafe { std::slice::from_raw_parts(q.as_ptr() as *const u8, 5) };
        assert_eq!(copied, b"hello");

        let page_size = page_source::page_size();
        let r = realloc(q, page_size * 2);
        let copied = unsafe { std::slice::from_raw_parts(r.as_ptr() as *const u8, 5) };
        assert_eq!(copied, b"hello");
        free(r);
    }

    #[test]
    fn realloc_large_to_small_preserves_prefix() {
        let page_size = page_source::page_size();
        let p = alloc(page_size * 2);
        unsafe {
            std::ptr::copy_nonoverlapping(b"world".as_ptr(), p.as_ptr() as *mut u8, 5);
        }
        let q = realloc(p, 20);
        let copied = unsafe { std::slice::from_raw_parts(q.as_ptr() as *const u8, 5) };
        assert_eq!(copied, b"world");
        free(q);
    }
}
