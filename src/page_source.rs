//! The Page Source is the only way the allocator acquires or
//! surrenders address space.  It is a thin adapter over the
//! operating system's anonymous mapping primitive: every region it
//! hands out is a fresh, page-aligned, privately mapped, read-write
//! range of whole pages.
//!
//! The Page Source is stateless and reentrant: callers may invoke it
//! without holding the core mutex, which is why bucket and arena
//! growth are structured to call `acquire` first and only take the
//! mutex afterwards to install the resulting region.
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

/// A `PageSource` acquires and releases whole, page-aligned regions
/// of address space.  Tests substitute a bookkeeping implementation
/// that records every outstanding range instead of touching the real
/// OS mapping (see `RecordingPageSource`, below).
#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait PageSource: std::fmt::Debug + Sync {
    /// Returns the mapping granularity.  Constant for the process
    /// lifetime.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Reserves and backs `n_pages` fresh pages.  Fatal (via panic)
    /// on upstream failure: the specification has no recoverable
    /// path past an exhausted address space.
    #[requires(n_pages > 0)]
    #[ensures(ret.as_ptr() as usize % self.page_size() == 0, "region is page-aligned")]
    fn acquire(&self, n_pages: usize) -> NonNull<c_void>;

    /// Releases `n_pages` pages starting at `base`, previously
    /// obtained from a single call to `acquire`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(n_pages > 0)]
    fn release(&self, base: NonNull<c_void>, n_pages: usize);
}

#[derive(Debug)]
struct OsPageSource;

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            panic!("unable to determine page size from sysconf");
        }
        ret as usize
    };
}

#[contract_trait]
impl PageSource for OsPageSource {
    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }

    fn acquire(&self, n_pages: usize) -> NonNull<c_void> {
        let len = n_pages * self.page_size();

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            panic!(
                "page source exhausted: mmap({} pages) failed with errno={}",
                n_pages,
                std::io::Error::last_os_error()
            );
        }

        NonNull::new(ptr as *mut c_void).expect("mmap returned a non-null pointer on success")
    }

    fn release(&self, base: NonNull<c_void>, n_pages: usize) {
        let len = n_pages * self.page_size();

        let ret = unsafe { libc::munmap(base.as_ptr(), len) };
        if ret != 0 {
            panic!(
                "page source failed to release {} pages at {:p}: errno={}",
                n_pages,
                base.as_ptr(),
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Returns the default, OS-backed page source.
pub fn default_page_source() -> &'static dyn PageSource {
    lazy_static::lazy_static! {
        static ref DEFAULT: OsPageSource = OsPageSource;
    };

    &*DEFAULT
}

/// Convenience wrapper over the default page source's `page_size`.
#[inline]
pub fn page_size() -> usize {
    default_page_source().page_size()
}

/// Convenience wrapper over the default page source's `acquire`.
#[inline]
pub fn acquire(n_pages: usize) -> NonNull<c_void> {
    default_page_source().acquire(n_pages)
}

/// Convenience wrapper over the default page source's `release`.
#[inline]
pub fn release(base: NonNull<c_void>, n_pages: usize) {
    default_page_source().release(base, n_pages)
}

/// A `PageSource` that wraps another one and records every range it
/// has handed out but not yet taken back, so tests can assert
/// invariant 1 ("no slot aliasing") directly: two outstanding ranges
/// must never overlap, and a `release` must exactly match a prior
/// `acquire`.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct RecordingPageSource {
    inner: &'static dyn PageSource,
    outstanding: std::sync::Mutex<std::collections::BTreeMap<usize, usize>>,
}

#[cfg(test)]
#[contract_trait]
impl PageSource for RecordingPageSource {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn acquire(&self, n_pages: usize) -> NonNull<c_void> {
        let region = self.inner.acquire(n_pages);
        let begin = region.as_ptr() as usize;
        let len = n_pages * self.page_size();

        let mut outstanding = self.outstanding.lock().unwrap();
        if let Some((&prev_begin, &prev_len)) = outstanding.range(..=begin).next_back() {
            assert!(
                prev_begin + prev_len <= begin,
                "page source handed out overlapping ranges: [{:#x}, {:#x}) and [{:#x}, {:#x})",
                prev_begin,
                prev_begin + prev_len,
                begin,
                begin + len
            );
        }
        if let Some((&next_begin, _)) = outstanding.range(begin..).next() {
            assert!(
                begin + len <= next_begin,
                "page source handed out overlapping ranges: [{:#x}, {:#x}) and [{:#x}, ...)",
                begin,
                begin + len,
                next_begin
            );
        }
        outstanding.insert(begin, len);
        region
    }

    fn release(&self, base: NonNull<c_void>, n_pages: usize) {
        let begin = base.as_ptr() as usize;
        let len = n_pages * self.page_size();

        let mut outstanding = self.outstanding.lock().unwrap();
        match outstanding.remove(&begin) {
            Some(recorded_len) => assert_eq!(
                recorded_len, len,
                "released length does not match the matching acquire"
            ),
            None => panic!(
                "release of {:#x} does not match any outstanding acquire",
                begin
            ),
        }
        drop(outstanding);

        self.inner.release(base, n_pages);
    }
}

#[cfg(test)]
impl RecordingPageSource {
    pub(crate) fn new() -> Self {
        Self {
            inner: default_page_source(),
            outstanding: std::sync::Mutex::new(std::collections::BTreeMap::new()),
        }
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    // The size-class table and bucket math in this crate assume 4K
    // pages, the common case on the platforms we develop on.
    assert_eq!(page_size(), 4096);
}

#[test]
fn smoke_test_acquire_release() {
    let base = acquire(3);
    assert_eq!(base.as_ptr() as usize % page_size(), 0);

    unsafe {
        std::ptr::write_bytes(base.as_ptr() as *mut u8, 0, 3 * page_size());
    }

    release(base, 3);
}

#[test]
fn recording_page_source_catches_disjoint_sequential_ranges() {
    let source = RecordingPageSource::new();
    let a = source.acquire(2);
    let b = source.acquire(1);
    source.release(a, 2);
    source.release(b, 1);
}

#[test]
#[should_panic(expected = "does not match any outstanding acquire")]
fn recording_page_source_catches_unmatched_release() {
    let source = RecordingPageSource::new();
    let a = source.acquire(1);
    source.release(a, 1);
    source.release(a, 1);
}
