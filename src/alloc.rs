use crate::init::get_default_heap;
use crate::internal::*;
use crate::page::{_malloc_generic, _page_free_collect, _page_retire, _page_unfull, bin};
use crate::types::*;

use core::ptr::{copy_nonoverlapping, null_mut, write_bytes};
use core::sync::atomic::Ordering;

/* -----------------------------------------------------------
   Allocation
----------------------------------------------------------- */

// Allocate from the heap; pops directly off the bin's first page when a
// block is immediately available, otherwise takes the generic path.
pub unsafe fn heap_malloc(heap: *mut Heap, size: usize) -> *mut u8 {
    debug_assert!(!heap.is_null());
    if size <= SMALL_SIZE_MAX {
        let page = (*heap).pages[bin(size)].first;
        if !page.is_null() && page_immediate_available(page) {
            let block = (*page).free;
            (*page).free = block_next(page, block);
            (*page).used += 1;
            return block as *mut u8;
        }
    }
    _malloc_generic(heap, size)
}

pub unsafe fn malloc(size: usize) -> *mut u8 {
    heap_malloc(get_default_heap(), size)
}

pub unsafe fn heap_zalloc(heap: *mut Heap, size: usize) -> *mut u8 {
    let p = heap_malloc(heap, size);
    if !p.is_null() {
        write_bytes(p, 0, size);
    }
    p
}

pub unsafe fn zalloc(size: usize) -> *mut u8 {
    heap_zalloc(get_default_heap(), size)
}

pub unsafe fn calloc(count: usize, size: usize) -> *mut u8 {
    let mut total = 0;
    if mul_overflow(count, size, &mut total) {
        return null_mut();
    }
    zalloc(total)
}

// Allocate `size` bytes aligned to `alignment` (a power of two). Blocks are
// naturally word aligned; larger alignments over-allocate and return an
// interior pointer, marking the page so `free` re-derives the block base.
pub unsafe fn malloc_aligned(size: usize, alignment: usize) -> *mut u8 {
    debug_assert!(alignment > 0 && alignment.is_power_of_two());
    if alignment <= INTPTR_SIZE {
        return malloc(size);
    }
    let oversize = size + alignment - 1;
    let p = malloc(oversize);
    if p.is_null() {
        return null_mut();
    }
    let adjust = (alignment - (p as usize % alignment)) % alignment;
    let aligned = p.add(adjust);
    if adjust != 0 {
        (*ptr_page(aligned)).flags.has_aligned = true;
    }
    debug_assert!(aligned as usize % alignment == 0);
    aligned
}

/* -----------------------------------------------------------
   Free
----------------------------------------------------------- */

// Re-derive the block base from an interior pointer in an aligned page.
unsafe fn page_ptr_unalign(segment: *const Segment, page: *const Page, p: *mut u8) -> *mut Block {
    let start = _page_area_start(segment, page);
    let diff = p as usize - start as usize;
    let adjust = diff % (*page).block_size;
    p.sub(adjust) as *mut Block
}

#[inline]
unsafe fn _page_area_start(segment: *const Segment, page: *const Page) -> *mut u8 {
    crate::segment::_segment_page_start(segment, page, (*page).block_size, null_mut())
}

// Free a block owned by the current thread.
pub(crate) unsafe fn _free_block_local(page: *mut Page, block: *mut Block) {
    debug_assert!((*page).used > 0);
    block_set_next(page, block, (*page).local_free);
    (*page).local_free = block;
    (*page).used -= 1;
    if page_all_free(page) {
        _page_retire(page);
    } else if (*page).flags.in_full {
        _page_unfull(page);
    }
}

// Free a block owned by another thread. Normally the block is pushed onto
// the page's `thread_free` list; pages with `UseDelayedFree` route it to the
// owning heap's `thread_delayed_free` list instead so the owner notices a
// full page regained space. The `DelayedFreeing` state pins the page while
// the heap pointer is read and the push completes.
unsafe fn _free_block_mt(page: *mut Page, block: *mut Block) {
    let mut use_delayed;
    loop {
        let tf = (*page).thread_free.value.load(Ordering::Acquire);
        use_delayed = tf_delayed(tf) == Delayed::UseDelayedFree;
        let tfx = if use_delayed {
            tf_make(tf_block(tf), Delayed::DelayedFreeing)
        } else {
            // `NeverDelayedFree` lands here as well: the list is swept later
            // by whoever owns the page by then
            block_set_next(page, block, tf_block(tf));
            tf_make(block, tf_delayed(tf))
        };
        if (*page)
            .thread_free
            .value
            .compare_exchange_weak(tf, tfx, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
    if use_delayed {
        let heap = page_heap(page);
        debug_assert!(!heap.is_null());
        if !heap.is_null() {
            // prepend onto the heap's delayed free list, encoded under its keys
            loop {
                let dfree = (*heap).thread_delayed_free.load(Ordering::Acquire);
                block_set_nextx(&(*heap).keys, block, dfree);
                if (*heap)
                    .thread_delayed_free
                    .compare_exchange_weak(dfree, block, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
        // release the page again
        loop {
            let tf = (*page).thread_free.value.load(Ordering::Acquire);
            debug_assert!(tf_delayed(tf) == Delayed::DelayedFreeing);
            let tfx = tf_make(tf_block(tf), Delayed::NoDelayedFree);
            if (*page)
                .thread_free
                .value
                .compare_exchange_weak(tf, tfx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

// Free a block taken off the heap's delayed free list (owner thread only).
pub(crate) unsafe fn _free_delayed_block(block: *mut Block) {
    let page = ptr_page(block as *const u8);
    debug_assert!(!page.is_null());
    _page_free_collect(page, false);
    _free_block_local(page, block);
}

pub unsafe fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let segment = ptr_segment(p);
    if segment.is_null() {
        return;
    }
    debug_assert!(crate::init::ptr_cookie(segment as *const u8) == (*segment).cookie);
    let page = segment_page_of(segment, p);
    let local = (*segment).thread_id.load(Ordering::Relaxed) == thread_id();
    if local && !(*page).flags.has_aligned {
        // fast path: local free of a regular block
        _free_block_local(page, p as *mut Block);
    } else {
        let block = if (*page).flags.has_aligned {
            page_ptr_unalign(segment, page, p)
        } else {
            p as *mut Block
        };
        if local {
            _free_block_local(page, block);
        } else {
            _free_block_mt(page, block);
        }
    }
}

/* -----------------------------------------------------------
   Usable size and realloc
----------------------------------------------------------- */

pub unsafe fn usable_size(p: *const u8) -> usize {
    if p.is_null() {
        return 0;
    }
    let segment = ptr_segment(p);
    let page = segment_page_of(segment, p);
    if !(*page).flags.has_aligned {
        (*page).block_size
    } else {
        let block = page_ptr_unalign(segment, page, p as *mut u8);
        (*page).block_size - (p as usize - block as usize)
    }
}

pub unsafe fn heap_realloc(heap: *mut Heap, p: *mut u8, newsize: usize) -> *mut u8 {
    if p.is_null() {
        return heap_malloc(heap, newsize);
    }
    let size = usable_size(p);
    // reallocation within the block (and not shrinking by half or more)
    // keeps the block
    if newsize <= size && newsize >= size / 2 {
        return p;
    }
    let newp = heap_malloc(heap, newsize);
    if newp.is_null() {
        return null_mut(); // the original block stays valid
    }
    copy_nonoverlapping(p, newp, if newsize < size { newsize } else { size });
    free(p);
    newp
}

pub unsafe fn realloc(p: *mut u8, newsize: usize) -> *mut u8 {
    heap_realloc(get_default_heap(), p, newsize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_roundtrip_across_bins() {
        unsafe {
            for &size in &[1usize, 8, 16, 24, 100, 1024, SMALL_SIZE_MAX, 9 * 1024, 100 * 1024] {
                let p = malloc(size);
                assert!(!p.is_null(), "malloc({}) failed", size);
                assert!(usable_size(p) >= size);
                write_bytes(p, 0xa5, size);
                free(p);
            }
        }
    }

    #[test]
    fn zalloc_zeroes() {
        unsafe {
            let p = zalloc(512);
            assert!(!p.is_null());
            for i in 0..512 {
                assert_eq!(*p.add(i), 0);
            }
            free(p);
        }
    }

    #[test]
    fn calloc_checks_overflow() {
        unsafe {
            assert!(calloc(usize::max_value() / 2, 16).is_null());
            let p = calloc(16, 16);
            assert!(!p.is_null());
            free(p);
        }
    }

    #[test]
    fn aligned_allocation() {
        unsafe {
            for &align in &[16usize, 64, 256, 4096] {
                let p = malloc_aligned(200, align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                write_bytes(p, 0x5a, 200);
                free(p);
            }
        }
    }

    #[test]
    fn realloc_grows_and_keeps_contents() {
        unsafe {
            let p = malloc(64);
            assert!(!p.is_null());
            for i in 0..64 {
                *p.add(i) = i as u8;
            }
            let q = realloc(p, 4096);
            assert!(!q.is_null());
            for i in 0..64 {
                assert_eq!(*q.add(i), i as u8);
            }
            // shrinking within half the size keeps the block
            let r = realloc(q, usable_size(q) / 2 + 8);
            assert_eq!(r, q);
            free(r);
        }
    }

    #[test]
    fn huge_allocation_roundtrip() {
        unsafe {
            let size = LARGE_SIZE_MAX + 4096;
            let p = malloc(size);
            assert!(!p.is_null());
            p.write(1);
            p.add(size - 1).write(2);
            assert!(usable_size(p) >= size);
            free(p);
        }
    }

    #[test]
    fn free_of_null_is_noop() {
        unsafe {
            free(null_mut());
        }
    }

    #[test]
    fn full_page_transitions() {
        unsafe {
            // fill more than one page of a single size class, then free all
            let size = 2048usize;
            let count = 2 * (SMALL_PAGE_SIZE / size) + 3;
            let mut ptrs = std::vec::Vec::new();
            for _ in 0..count {
                let p = malloc(size);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            for p in ptrs {
                free(p);
            }
        }
    }
}
