use crate::heap::{_deferred_free, _heap_delayed_free, heap_try_reclaim_abandoned};
use crate::init::{get_default_heap, thread_init};
use crate::internal::*;
use crate::random::heap_random_next;
use crate::segment::{_segment_page_alloc, _segment_page_free};
use crate::stats::*;
use crate::types::*;

use core::hint::spin_loop;
use core::ptr::null_mut;
use core::sync::atomic::Ordering;
use log::error;

/* -----------------------------------------------------------
  Size class bins, spaced exponentially in 16.7% increments:
  8-byte steps up to 64 bytes, then 4 steps per power of two.
  The last two entries are sentinels for the huge and full
  queues so `page_queue_of` stays a plain array index.
----------------------------------------------------------- */

#[rustfmt::skip]
pub(crate) const BIN_WSIZES: [usize; BIN_FULL + 1] = [
    1,
    1, 2, 3, 4, 5, 6, 7, 8,
    10, 12, 14, 16, 20, 24, 28, 32,
    40, 48, 56, 64, 80, 96, 112, 128,
    160, 192, 224, 256, 320, 384, 448, 512,
    640, 768, 896, 1024, 1280, 1536, 1792, 2048,
    2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192,
    10240, 12288, 14336, 16384, 20480, 24576, 28672, 32768,
    40960, 49152, 57344, 65536, 81920, 98304, 114688,
    LARGE_WSIZE_MAX + 1, // huge queue
    LARGE_WSIZE_MAX + 2, // full queue
];

const fn make_empty_queues() -> [PageQueue; BIN_FULL + 1] {
    let mut queues = [PageQueue { first: null_mut(), last: null_mut(), block_size: 0 }; BIN_FULL + 1];
    let mut i = 0;
    while i <= BIN_FULL {
        queues[i].block_size = BIN_WSIZES[i] * INTPTR_SIZE;
        i += 1;
    }
    queues
}

pub(crate) const PAGE_QUEUES_EMPTY: [PageQueue; BIN_FULL + 1] = make_empty_queues();

// Return the bin for a given byte size
pub(crate) fn bin(size: usize) -> usize {
    let mut wsize = wsize_from_size(size);
    if wsize <= 1 {
        1
    } else if wsize <= 8 {
        wsize
    } else if wsize > LARGE_WSIZE_MAX {
        BIN_HUGE
    } else {
        wsize -= 1;
        // find the highest bit and use the next 2 bits as the sub-step
        let b = INTPTR_BITS - 1 - wsize.leading_zeros() as usize;
        ((b << 2) + ((wsize >> (b - 2)) & 3)) - 3
    }
}

#[cfg(test)]
pub(crate) fn bin_size(bin_idx: usize) -> usize {
    BIN_WSIZES[bin_idx] * INTPTR_SIZE
}

#[inline]
pub(crate) unsafe fn page_queue(heap: *mut Heap, size: usize) -> *mut PageQueue {
    &mut (*heap).pages[bin(size)]
}

#[inline]
pub(crate) unsafe fn page_queue_of(page: *const Page) -> *mut PageQueue {
    let heap = page_heap(page);
    debug_assert!(!heap.is_null());
    let idx = if (*page).flags.in_full { BIN_FULL } else { bin((*page).block_size) };
    &mut (*heap).pages[idx]
}

/* -----------------------------------------------------------
  Page queues
----------------------------------------------------------- */

pub(crate) unsafe fn page_queue_push(heap: *mut Heap, pq: *mut PageQueue, page: *mut Page) {
    debug_assert!((*page).next.is_null() && (*page).prev.is_null());
    page_set_heap(page, heap);
    (*page).next = (*pq).first;
    (*page).prev = null_mut();
    if !(*pq).first.is_null() {
        (*(*pq).first).prev = page;
    } else {
        (*pq).last = page;
    }
    (*pq).first = page;
    (*heap).page_count += 1;
}

pub(crate) unsafe fn page_queue_remove(pq: *mut PageQueue, page: *mut Page) {
    let heap = page_heap(page);
    debug_assert!(!heap.is_null());
    if !(*page).prev.is_null() {
        (*(*page).prev).next = (*page).next;
    }
    if !(*page).next.is_null() {
        (*(*page).next).prev = (*page).prev;
    }
    if page == (*pq).first {
        (*pq).first = (*page).next;
    }
    if page == (*pq).last {
        (*pq).last = (*page).prev;
    }
    (*page).next = null_mut();
    (*page).prev = null_mut();
    (*heap).page_count -= 1;
}

// Splice all pages of `from_q` onto the tail of `to_q`, re-homing each page
// to `to_heap`. Every spliced page gets its delayed channel re-armed: the
// pre-splice sweep left the pages `NeverDelayedFree`, and that state is
// sticky, so without the override a page absorbed non-full could never
// regain delayed routing when it later fills up. Returns the number of
// pages moved; the caller adjusts the heap page counts.
pub(crate) unsafe fn _page_queue_append(
    to_heap: *mut Heap,
    to_q: *mut PageQueue,
    from_q: *mut PageQueue,
) -> usize {
    let mut count = 0;
    let mut page = (*from_q).first;
    while !page.is_null() {
        page_set_heap(page, to_heap);
        if (*page).flags.in_full {
            _page_use_delayed_free(page, Delayed::UseDelayedFree, true);
        } else {
            _page_use_delayed_free(page, Delayed::NoDelayedFree, true);
        }
        count += 1;
        page = (*page).next;
    }
    if count == 0 {
        return 0;
    }
    if (*to_q).last.is_null() {
        debug_assert!((*to_q).first.is_null());
        (*to_q).first = (*from_q).first;
        (*to_q).last = (*from_q).last;
    } else {
        (*(*to_q).last).next = (*from_q).first;
        (*(*from_q).first).prev = (*to_q).last;
        (*to_q).last = (*from_q).last;
    }
    (*from_q).first = null_mut();
    (*from_q).last = null_mut();
    count
}

/* -----------------------------------------------------------
  The delayed flag of the `thread_free` list
----------------------------------------------------------- */

// Switch the delayed-free state of a page, waiting out a producer that is
// mid-push (`DelayedFreeing`). `NeverDelayedFree` is sticky unless
// `override_never` is set.
pub(crate) unsafe fn _page_use_delayed_free(page: *mut Page, delay: Delayed, override_never: bool) {
    debug_assert!(delay != Delayed::DelayedFreeing);
    loop {
        let tf = (*page).thread_free.value.load(Ordering::Acquire);
        let old = tf_delayed(tf);
        if old == Delayed::DelayedFreeing {
            spin_loop(); // a remote push is in flight, wait for it to land
            continue;
        }
        if old == delay || (old == Delayed::NeverDelayedFree && !override_never) {
            break;
        }
        let tfx = tf_make(tf_block(tf), delay);
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

/* -----------------------------------------------------------
  Collecting the free lists of a page
----------------------------------------------------------- */

// Take the blocks on the `thread_free` list (keeping the state bits) and
// append them to `local_free`, adjusting `used`.
unsafe fn page_thread_free_collect(page: *mut Page) {
    let mut head;
    loop {
        let tf = (*page).thread_free.value.load(Ordering::Acquire);
        head = tf_block(tf);
        if head.is_null() {
            return;
        }
        let tfx = tf_make(null_mut(), tf_delayed(tf));
        if (*page)
            .thread_free
            .value
            .compare_exchange_weak(tf, tfx, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
    // find the tail and count
    let mut count = 1;
    let mut tail = head;
    loop {
        let next = block_next(page, tail);
        if next.is_null() {
            break;
        }
        tail = next;
        count += 1;
    }
    block_set_next(page, tail, (*page).local_free);
    (*page).local_free = head;
    debug_assert!((*page).used >= count);
    (*page).used -= count;
}

pub(crate) unsafe fn _page_free_collect(page: *mut Page, force: bool) {
    debug_assert!(!page.is_null());
    page_thread_free_collect(page);
    if !(*page).local_free.is_null() {
        if (*page).free.is_null() {
            // usual case
            (*page).free = (*page).local_free;
            (*page).local_free = null_mut();
        } else if force {
            // append to the end of the free list
            let mut tail = (*page).free;
            loop {
                let next = block_next(page, tail);
                if next.is_null() {
                    break;
                }
                tail = next;
            }
            block_set_next(page, tail, (*page).local_free);
            (*page).local_free = null_mut();
        }
    }
    debug_assert!(!force || (*page).local_free.is_null());
}

/* -----------------------------------------------------------
  Page initialization and fresh allocation
----------------------------------------------------------- */

// Initialize a freshly provided segment page and build its free list
// (encoded under the page cookie).
unsafe fn page_init(heap: *mut Heap, page: *mut Page, block_size: usize) {
    debug_assert!(block_size > 0);
    let segment = page_segment(page);
    let mut psize = 0;
    let start = crate::segment::_segment_page_start(segment, page, block_size, &mut psize);
    let capacity = psize / block_size;
    debug_assert!(capacity >= 1 && capacity <= u16::max_value() as usize);

    (*page).block_size = block_size;
    (*page).capacity = capacity as u16;
    (*page).reserved = capacity as u16;
    (*page).cookie = heap_random_next(heap) | 1;
    (*page).flags = PageFlags::default();
    (*page).used = 0;
    (*page).local_free = null_mut();
    (*page).thread_free.value.store(0, Ordering::Relaxed);
    (*page).free = null_mut();
    // link up all blocks, last to first
    let mut i = capacity;
    while i > 0 {
        i -= 1;
        let block = start.add(i * block_size) as *mut Block;
        block_set_next(page, block, (*page).free);
        (*page).free = block;
    }

    let stats = &mut (*(*heap).tld).stats;
    _stat_increase(&mut stats.pages, 1);
    _stat_increase(&mut stats.page_committed, (capacity * block_size) as i64);
}

// Allocate a fresh page for the queue and link it at the front.
unsafe fn page_fresh_alloc(heap: *mut Heap, pq: *mut PageQueue, block_size: usize) -> *mut Page {
    let tld = (*heap).tld;
    let page = _segment_page_alloc(block_size, &mut (*tld).segments, &mut (*tld).os);
    if page.is_null() {
        return null_mut();
    }
    page_init(heap, page, block_size);
    page_queue_push(heap, pq, page);
    page
}

/* -----------------------------------------------------------
  Moving pages in and out of the full queue
----------------------------------------------------------- */

unsafe fn page_to_full(page: *mut Page, pq: *mut PageQueue) {
    debug_assert!(!(*page).flags.in_full);
    let heap = page_heap(page);
    // route remote frees through the heap so we notice the page has space again
    _page_use_delayed_free(page, Delayed::UseDelayedFree, false);
    page_queue_remove(pq, page);
    (*page).flags.in_full = true;
    page_queue_push(heap, &mut (*heap).pages[BIN_FULL], page);
}

pub(crate) unsafe fn _page_unfull(page: *mut Page) {
    if !(*page).flags.in_full {
        return;
    }
    let heap = page_heap(page);
    let full_q = &mut (*heap).pages[BIN_FULL] as *mut PageQueue;
    page_queue_remove(full_q, page);
    (*page).flags.in_full = false;
    let pq = page_queue(heap, (*page).block_size);
    page_queue_push(heap, pq, page);
    _page_use_delayed_free(page, Delayed::NoDelayedFree, false);
}

/* -----------------------------------------------------------
  Page free and retire
----------------------------------------------------------- */

// Unlink the (fully free) page and return it to its segment.
pub(crate) unsafe fn _page_free(page: *mut Page, pq: *mut PageQueue, force: bool) {
    debug_assert!(page_all_free(page));
    let heap = page_heap(page);
    let tld = (*heap).tld;
    page_queue_remove(pq, page);
    page_set_heap(page, null_mut());
    _segment_page_free(page, force, &mut (*tld).segments);
}

// A local free emptied the page entirely; release it unless its neighbours
// are almost full (then we expect re-use of this size class soon).
pub(crate) unsafe fn _page_retire(page: *mut Page) {
    debug_assert!(page_all_free(page));
    (*page).flags.has_aligned = false;
    if (*page).block_size <= LARGE_SIZE_MAX
        && page_mostly_used((*page).prev)
        && page_mostly_used((*page).next)
    {
        return; // don't retire after all
    }
    _page_free(page, page_queue_of(page), false);
}

/* -----------------------------------------------------------
  The generic allocation path
----------------------------------------------------------- */

// Find a page with immediately available blocks in the queue for `size`,
// moving exhausted pages to the full queue along the way.
unsafe fn find_free_page(heap: *mut Heap, size: usize) -> *mut Page {
    let pq = page_queue(heap, size);
    let mut page = (*pq).first;
    let mut count = 0i64;
    while !page.is_null() {
        let next = (*page).next; // the page may move to the full queue
        count += 1;
        _page_free_collect(page, false);
        if page_immediate_available(page) {
            break;
        }
        page_to_full(page, pq);
        page = next;
    }
    _stat_counter_increase(&mut (*(*heap).tld).stats.searches, count);
    if page.is_null() {
        page = page_fresh_alloc(heap, pq, (*pq).block_size);
    }
    page
}

// Huge blocks get a fresh page in an exact-size segment, queued in the huge bin.
unsafe fn huge_page_alloc(heap: *mut Heap, size: usize) -> *mut Page {
    let block_size = wsize_from_size(size) * INTPTR_SIZE;
    let pq = &mut (*heap).pages[BIN_HUGE] as *mut PageQueue;
    let page = page_fresh_alloc(heap, pq, block_size);
    if !page.is_null() {
        _stat_increase(&mut (*(*heap).tld).stats.huge, block_size as i64);
    }
    page
}

// The slow path of `malloc`: initialize the thread if needed, run pending
// work (deferred frees, the delayed list, opportunistic reclamation of
// abandoned heaps), then find or allocate a page with a free block.
pub(crate) unsafe fn _malloc_generic(heap_in: *mut Heap, size: usize) -> *mut u8 {
    let mut heap = heap_in;
    if !heap_is_initialized(heap) {
        thread_init();
        heap = get_default_heap();
        if !heap_is_initialized(heap) {
            return null_mut(); // failed to allocate the thread local heap
        }
    }

    // call potential deferred free routines
    _deferred_free(heap, false);

    // free delayed frees from other threads
    _heap_delayed_free(heap);

    // absorb heaps abandoned by terminated threads
    if !(*heap).no_reclaim {
        heap_try_reclaim_abandoned(heap, false);
    }

    let page = if size > LARGE_SIZE_MAX {
        huge_page_alloc(heap, size)
    } else {
        find_free_page(heap, size)
    };
    if page.is_null() {
        error!("out of memory allocating {} bytes", size);
        return null_mut();
    }
    debug_assert!(page_immediate_available(page));
    debug_assert!((*page).block_size >= size);
    _stat_increase(&mut (*(*heap).tld).stats.malloc, (*page).block_size as i64);

    let block = (*page).free;
    (*page).free = block_next(page, block);
    (*page).used += 1;
    block as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_of_bin_size_is_identity() {
        for b in 1..=60 {
            assert_eq!(bin(bin_size(b)), b, "bin {}", b);
        }
    }

    #[test]
    fn bin_is_monotone_and_covering() {
        let mut last = 0;
        for size in (8..=LARGE_SIZE_MAX).step_by(8) {
            let b = bin(size);
            assert!(b >= last || b == last, "bin not monotone at {}", size);
            assert!(bin_size(b) >= size, "bin {} too small for {}", b, size);
            last = b;
        }
    }

    #[test]
    fn bin_boundaries() {
        assert_eq!(bin(0), 1);
        assert_eq!(bin(1), 1);
        assert_eq!(bin(8), 1);
        assert_eq!(bin(9), 2);
        assert_eq!(bin(64), 8);
        assert_eq!(bin(LARGE_SIZE_MAX), 60);
        assert_eq!(bin(LARGE_SIZE_MAX + 1), BIN_HUGE);
    }

    #[test]
    fn empty_queues_carry_bin_sizes() {
        assert_eq!(PAGE_QUEUES_EMPTY[1].block_size, INTPTR_SIZE);
        assert_eq!(PAGE_QUEUES_EMPTY[60].block_size, LARGE_SIZE_MAX);
        assert!(PAGE_QUEUES_EMPTY[BIN_FULL].block_size > LARGE_SIZE_MAX);
    }
}
