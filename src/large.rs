//! The Large-Object Direct Mapper services every allocation whose
//! rounded size exceeds one page.  It holds no state of its own and
//! needs no mutex: every large allocation is a standalone mapping,
//! and the only shared resource it touches is the (stateless,
//! reentrant) Page Source.
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::page_source;

/// Every large allocation is prefixed by one header word recording
/// the mapping's total length in bytes, including the header itself.
pub(crate) const HEADER_SIZE: usize = size_of::<usize>();

/// Rounds `size + HEADER_SIZE` up to a whole number of pages,
/// acquires them, and returns the address immediately past the
/// header.  The returned memory is zero-filled (fresh pages always
/// are) and is not further initialised.
pub(crate) fn alloc(size: usize) -> NonNull<c_void> {
    let page_size = page_source::page_size();
    let total = size
        .checked_add(HEADER_SIZE)
        .unwrap_or_else(|| panic!("allocation size {} overflows with header", size));
    let pages = (total + page_size - 1) / page_size;

    let region = page_source::acquire(pages);
    let length = pages * page_size;

    unsafe {
        (region.as_ptr() as *mut usize).write(length);
    }

    let data = unsafe { (region.as_ptr() as *mut u8).add(HEADER_SIZE) };
    NonNull::new(data as *mut c_void).expect("large allocation address is never null")
}

/// Reads the header word at `address - HEADER_SIZE`: the mapping's
/// total length in bytes, including the header.
pub(crate) fn logical_len(address: NonNull<c_void>) -> usize {
    let header = unsafe { (address.as_ptr() as *const u8).sub(HEADER_SIZE) as *const usize };
    unsafe { *header }
}

/// Releases the mapping backing `address` (a prior return value of
/// `alloc`) back to the Page Source.
pub(crate) fn free(address: NonNull<c_void>) {
    let length = logical_len(address);
    let page_size = page_source::page_size();
    let header = unsafe { (address.as_ptr() as *mut u8).sub(HEADER_SIZE) };

    assert_eq!(length % page_size, 0, "large allocation length must be page-aligned");
    page_source::release(
        NonNull::new(header as *mut c_void).expect("header address is never null"),
        length / page_size,
    );
}
