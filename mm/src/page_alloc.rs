//! Page-granular allocation for task stacks.
//!
//! Blocks are whole pages, page-aligned and zeroed. The page count is part of
//! the free call, so no per-block bookkeeping is needed.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;

use hypos_abi::task::PAGE_SIZE;
use hypos_lib::align_up_usize;
use hypos_lib::klog_warn;

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE)
}

/// Round `len` up to a whole number of pages.
#[inline]
pub const fn page_align(len: usize) -> usize {
    align_up_usize(len, PAGE_SIZE)
}

fn pages_layout(nr_pages: usize) -> Option<Layout> {
    let size = nr_pages.checked_mul(PAGE_SIZE)?;
    Layout::from_size_align(size, PAGE_SIZE).ok()
}

/// Allocate `nr_pages` zeroed, page-aligned pages. Null on failure.
pub fn alloc_pages(nr_pages: usize) -> *mut u8 {
    if nr_pages == 0 {
        return core::ptr::null_mut();
    }
    let Some(layout) = pages_layout(nr_pages) else {
        return core::ptr::null_mut();
    };
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        klog_warn!("page_alloc: allocation of {} pages failed", nr_pages);
    }
    ptr
}

/// Free pages returned by [`alloc_pages`]. Null is ignored.
///
/// # Safety
/// `ptr`/`nr_pages` must match a previous `alloc_pages` call exactly.
pub unsafe fn free_pages(ptr: *mut u8, nr_pages: usize) {
    if ptr.is_null() || nr_pages == 0 {
        return;
    }
    let Some(layout) = pages_layout(nr_pages) else {
        return;
    };
    // SAFETY: caller passes the original allocation.
    unsafe { dealloc(ptr, layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_math() {
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(page_align(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn alloc_is_page_aligned_and_zeroed() {
        let ptr = alloc_pages(2);
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % PAGE_SIZE, 0);
        let bytes = unsafe { core::slice::from_raw_parts(ptr, 2 * PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { free_pages(ptr, 2) };
    }

    #[test]
    fn zero_pages_is_null() {
        assert!(alloc_pages(0).is_null());
        unsafe { free_pages(core::ptr::null_mut(), 1) };
    }
}
