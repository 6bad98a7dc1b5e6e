//! Slotter is a general-purpose dynamic memory allocator that sits
//! directly on top of anonymous virtual memory: the classical triad
//! `allocate`/`deallocate`/`reallocate`, backed by a bitmap-indexed
//! pool of fixed-size-slot buckets for anything that fits in a page,
//! and direct page mappings for anything that doesn't.
//!
//! The crate exposes two surfaces over one implementation: a safe
//! Rust API (this module) and a set of `slotter_`-prefixed
//! `extern "C"` entry points, so the library can be linked into C
//! callers as a drop-in `malloc`/`free`/`realloc` replacement.
mod arena;
mod bucket;
mod dispatch;
mod large;
mod page_source;
mod size_class;
mod small_pool;

pub mod diagnostics;

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

pub use page_source::page_size;

/// Allocates `n_bytes` and returns the address of the first byte.
///
/// `n_bytes` may be zero: the allocator still hands back a distinct,
/// non-null, free-able address (a real slot in the smallest size
/// class), rather than a special sentinel that would need its own
/// handling everywhere else.
#[ensures(ret.as_ptr() as usize % std::mem::align_of::<usize>() == 0,
          "every returned address is aligned to the largest integer type")]
pub fn allocate(n_bytes: usize) -> NonNull<c_void> {
    dispatch::alloc(n_bytes)
}

/// Releases `address`, previously returned by `allocate` or
/// `reallocate` from this allocator and not yet released. `None` is a
/// no-op, matching `free(NULL)`.
///
/// # Panics
///
/// Panics if `address` was not returned by this allocator, or was
/// already released: both are fatal per the allocator's error model,
/// there being no recoverable path past a corrupted heap.
pub fn deallocate(address: Option<NonNull<c_void>>) {
    if let Some(address) = address {
        dispatch::free(address);
    }
}

/// Resizes the allocation at `address` to `n_bytes`, preserving the
/// leading `min(old_logical_size, n_bytes)` bytes, and returns the
/// (possibly different) new address.
///
/// - `address` of `None` is equivalent to `allocate(n_bytes)`.
/// - `n_bytes` of `0` releases `address` and returns a fresh
///   zero-size sentinel, via the same policy as `allocate(0)`.
pub fn reallocate(address: Option<NonNull<c_void>>, n_bytes: usize) -> NonNull<c_void> {
    let address = match address {
        None => return allocate(n_bytes),
        Some(address) => address,
    };

    if n_bytes == 0 {
        dispatch::free(address);
        return allocate(0);
    }

    dispatch::realloc(address, n_bytes)
}

/// Converts a possibly-null C pointer into the `Option<NonNull<_>>`
/// the safe API expects.
///
/// # Safety
///
/// `ptr` must be NULL or a valid `*mut c_void`.
unsafe fn from_raw(ptr: *mut c_void) -> Option<NonNull<c_void>> {
    NonNull::new(ptr)
}

#[inline]
fn to_raw(ptr: NonNull<c_void>) -> *mut c_void {
    ptr.as_ptr()
}

/// C entry point for `allocate`.
///
/// # Safety
///
/// Always safe to call; `n_bytes` is a plain size.
#[no_mangle]
pub unsafe extern "C" fn slotter_allocate(n_bytes: usize) -> *mut c_void {
    to_raw(allocate(n_bytes))
}

/// C entry point for `deallocate`. A NULL `address` is a no-op.
///
/// # Safety
///
/// `address` must be NULL or a value previously returned by
/// `slotter_allocate` or `slotter_reallocate`, not yet released.
#[no_mangle]
pub unsafe extern "C" fn slotter_deallocate(address: *mut c_void) {
    deallocate(from_raw(address));
}

/// C entry point for `reallocate`.
///
/// # Safety
///
/// `address` must be NULL or a value previously returned by
/// `slotter_allocate` or `slotter_reallocate`, not yet released.
#[no_mangle]
pub unsafe extern "C" fn slotter_reallocate(address: *mut c_void, n_bytes: usize) -> *mut c_void {
    to_raw(reallocate(from_raw(address), n_bytes))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_size_allocation_is_distinct_and_freeable() {
        let p = allocate(0);
        let q = allocate(0);
        assert_ne!(p, q);
        deallocate(Some(p));
        deallocate(Some(q));
    }

    #[test]
    fn deallocate_of_null_is_a_no_op() {
        deallocate(None);
    }

    #[test]
    fn reallocate_of_null_address_allocates() {
        let p = reallocate(None, 32);
        deallocate(Some(p));
    }

    #[test]
    fn reallocate_to_zero_frees_and_returns_sentinel() {
        let p = allocate(32);
        let sentinel = reallocate(Some(p), 0);
        // `p`'s slot is free again; the sentinel is a fresh, distinct
        // allocation we still owe a `deallocate`.
        deallocate(Some(sentinel));
    }

    #[test]
    fn sub_minimum_request_lands_in_the_smallest_class() {
        let p = allocate(1);
        unsafe {
            std::ptr::write_bytes(p.as_ptr() as *mut u8, 0xAB, 1);
        }
        deallocate(Some(p));
    }

    #[test]
    fn page_boundary_request_round_trips() {
        let p = allocate(page_size());
        deallocate(Some(p));
    }

    #[test]
    fn just_over_page_request_goes_large() {
        let p = allocate(page_size() + 1);
        deallocate(Some(p));
    }

    #[test]
    fn write_read_round_trip_survives_realloc() {
        let p = allocate(16);
        unsafe {
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), p.as_ptr() as *mut u8, 5);
        }
        let q = reallocate(Some(p), 64);
        let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr() as *const u8, 5) };
        assert_eq!(bytes, b"hello");
        deallocate(Some(q));
    }

    #[test]
    fn c_abi_round_trip() {
        unsafe {
            let p = slotter_allocate(100);
            assert!(!p.is_null());
            let p = slotter_reallocate(p, 4096 * 2);
            assert!(!p.is_null());
            slotter_deallocate(p);
            slotter_deallocate(std::ptr::null_mut());
        }
    }

    #[test]
    fn concurrent_allocate_deallocate_leaves_buckets_empty() {
        use std::sync::Arc;
        use std::sync::Barrier;
        use std::thread;

        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..ROUNDS {
                        let size = 1 + (t * 37 + i * 11) % 4096;
                        let p = allocate(size);
                        unsafe {
                            std::ptr::write_bytes(p.as_ptr() as *mut u8, t as u8, 1);
                        }
                        deallocate(Some(p));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker thread must not panic");
        }

        assert!(crate::small_pool::every_bucket_bitmap_is_zero());
    }
}
