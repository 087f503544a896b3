use crate::init::ptr_cookie;
use crate::internal::*;
use crate::options::*;
use crate::os::*;
use crate::stats::*;
use crate::types::*;

use core::mem::size_of;
use core::ptr::{null_mut, write_bytes};
use core::sync::atomic::Ordering;
use log::trace;

const PAGE_HUGE_ALIGN: usize = 256 * 1024;

/* -----------------------------------------------------------
  Segment allocation
  We allocate pages inside big OS allocated "segments"
  (4mb on 64-bit). This is to avoid splitting VMA's on Linux
  and reduce fragmentation on other OS's. Each thread
  owns its own segments.

  Currently we have:
  - small pages (64kb), 64 in one segment
  - large pages (4mb), 1 in one segment
  - huge blocks > LARGE_SIZE_MAX (512kb) get a segment of the
    exact (aligned) size

  When a thread ends its heap may still hold live blocks; the
  heap as a whole is then abandoned and another thread adopts
  its pages and segments, much like work-stealing.
----------------------------------------------------------- */

pub(crate) unsafe fn segment_is_valid(segment: *const Segment) -> bool {
    debug_assert!(!segment.is_null());
    debug_assert!(ptr_cookie(segment as *const u8) == (*segment).cookie);
    debug_assert!((*segment).used <= (*segment).capacity);
    #[cfg(debug_assertions)]
    {
        let mut nfree = 0;
        for i in 0..(*segment).capacity {
            if !(*segment).pages[i].segment_in_use {
                nfree += 1;
            }
        }
        debug_assert!(nfree + (*segment).used == (*segment).capacity);
    }
    true
}

/* -----------------------------------------------------------
  Queue of segments containing free pages
----------------------------------------------------------- */

unsafe fn segment_queue_contains(queue: *const SegmentQueue, segment: *mut Segment) -> bool {
    debug_assert!(!segment.is_null());
    let mut list = (*queue).first;
    while !list.is_null() {
        if list == segment {
            break;
        }
        debug_assert!((*list).next.is_null() || (*(*list).next).prev == list);
        debug_assert!((*list).prev.is_null() || (*(*list).prev).next == list);
        list = (*list).next;
    }
    list == segment
}

// quick test to see if a segment is in the free pages queue
unsafe fn segment_is_in_free_queue(segment: *mut Segment, tld: *mut SegmentsTld) -> bool {
    let in_queue = !(*segment).next.is_null()
        || !(*segment).prev.is_null()
        || (*tld).small_free.first == segment;
    if in_queue {
        debug_assert!((*segment).page_kind == PageKind::Small); // only small segments are queued
        debug_assert!(segment_queue_contains(&(*tld).small_free, segment));
    }
    in_queue
}

unsafe fn segment_queue_is_empty(queue: *const SegmentQueue) -> bool {
    (*queue).first.is_null()
}

unsafe fn segment_queue_remove(queue: *mut SegmentQueue, segment: *mut Segment) {
    debug_assert!(segment_queue_contains(queue, segment));
    if !(*segment).prev.is_null() {
        (*(*segment).prev).next = (*segment).next;
    }
    if !(*segment).next.is_null() {
        (*(*segment).next).prev = (*segment).prev;
    }
    if segment == (*queue).first {
        (*queue).first = (*segment).next;
    }
    if segment == (*queue).last {
        (*queue).last = (*segment).prev;
    }
    (*segment).next = null_mut();
    (*segment).prev = null_mut();
}

unsafe fn segment_enqueue(queue: *mut SegmentQueue, segment: *mut Segment) {
    debug_assert!(!segment_queue_contains(queue, segment));
    (*segment).next = null_mut();
    (*segment).prev = (*queue).last;
    if !(*queue).last.is_null() {
        debug_assert!((*(*queue).last).next.is_null());
        (*(*queue).last).next = segment;
        (*queue).last = segment;
    } else {
        (*queue).first = segment;
        (*queue).last = segment;
    }
}

unsafe fn segment_queue_insert_before(
    queue: *mut SegmentQueue,
    elem: *mut Segment,
    segment: *mut Segment,
) {
    debug_assert!(elem.is_null() || segment_queue_contains(queue, elem));
    debug_assert!(!segment.is_null() && !segment_queue_contains(queue, segment));

    (*segment).prev = if elem.is_null() { (*queue).last } else { (*elem).prev };
    if !(*segment).prev.is_null() {
        (*(*segment).prev).next = segment;
    } else {
        (*queue).first = segment;
    }
    (*segment).next = elem;
    if !(*segment).next.is_null() {
        (*(*segment).next).prev = segment;
    } else {
        (*queue).last = segment;
    }
}

// Start of the page available memory; can be used on uninitialized pages (only `segment_idx` must be set)
pub(crate) unsafe fn _segment_page_start(
    segment: *const Segment,
    page: *const Page,
    block_size: usize,
    page_size: *mut usize,
) -> *mut u8 {
    let mut psize = if (*segment).page_kind == PageKind::Huge {
        (*segment).segment_size
    } else {
        1 << (*segment).page_shift
    };
    let mut p = (segment as usize + (*page).segment_idx as usize * (1 << (*segment).page_shift))
        as *mut u8;

    if (*page).segment_idx == 0 {
        // the first page starts after the segment info
        p = p.add((*segment).segment_info_size);
        psize -= (*segment).segment_info_size;
        // for small objects, ensure the page start is aligned with the block size
        if block_size > 0 && (*segment).page_kind == PageKind::Small {
            let adjust = block_size - (p as usize % block_size);
            if adjust < block_size {
                p = p.add(adjust);
                psize -= adjust;
            }
            debug_assert!(p as usize % block_size == 0);
        }
    }

    if !page_size.is_null() {
        *page_size = psize;
    }
    debug_assert!(ptr_page(p) == page as *mut Page);
    debug_assert!(ptr_segment(p) == segment as *mut Segment);
    p
}

unsafe fn segment_calculate_size(required: usize, info_size: *mut usize) -> usize {
    let minsize = size_of::<Segment>() + 16 /* padding */;
    let isize_ = align_up(minsize, if 16 > MAX_ALIGN_SIZE { 16 } else { MAX_ALIGN_SIZE });
    if !info_size.is_null() {
        *info_size = isize_;
    }
    if required == 0 {
        SEGMENT_SIZE
    } else {
        align_up(required + isize_, PAGE_HUGE_ALIGN)
    }
}

/* -----------------------------------------------------------
Segment caches
We keep a small segment cache per thread to avoid repeated
allocation and free in the OS if a program allocates memory
and then frees all again repeatedly.
----------------------------------------------------------- */

unsafe fn segments_track_size(segment_size: i64, tld: *mut SegmentsTld) {
    if segment_size >= 0 {
        _stat_increase(&mut (*(*tld).stats).segments, 1);
        (*tld).current_size += segment_size as usize;
    } else {
        _stat_decrease(&mut (*(*tld).stats).segments, 1);
        (*tld).current_size -= (-segment_size) as usize;
    }
    if (*tld).current_size > (*tld).peak_size {
        (*tld).peak_size = (*tld).current_size;
    }
}

unsafe fn segment_os_free(segment: *mut Segment, segment_size: usize, tld: *mut SegmentsTld) {
    segments_track_size(-(segment_size as i64), tld);
    os_free(segment as *mut u8, segment_size, (*tld).stats);
}

// The segment cache is limited to be at most 1/8 of the peak size
// in use (and no more than 32)
const SEGMENT_CACHE_MAX: usize = 32;
const SEGMENT_CACHE_FRACTION: usize = 8;

// Pop a cached segment of exactly `SEGMENT_SIZE` (the only size we cache);
// `reverse` pops from the cold end for eviction.
unsafe fn segment_cache_findx(tld: *mut SegmentsTld, reverse: bool) -> *mut Segment {
    let segment = if reverse { (*tld).cache.last } else { (*tld).cache.first };
    if segment.is_null() {
        return null_mut();
    }
    debug_assert!((*segment).segment_size == SEGMENT_SIZE);
    (*tld).cache_count -= 1;
    (*tld).cache_size -= (*segment).segment_size;
    segment_queue_remove(&mut (*tld).cache, segment);
    segment
}

unsafe fn segment_cache_find(tld: *mut SegmentsTld) -> *mut Segment {
    segment_cache_findx(tld, false)
}

unsafe fn segment_cache_evict(tld: *mut SegmentsTld) -> *mut Segment {
    segment_cache_findx(tld, true)
}

unsafe fn segment_cache_full(tld: *mut SegmentsTld) -> bool {
    if (*tld).cache_count < SEGMENT_CACHE_MAX
        && (*tld).cache_size * SEGMENT_CACHE_FRACTION < (*tld).peak_size
    {
        return false;
    }
    // take the opportunity to reduce the segment cache if it is too large (now)
    while (*tld).cache_size * SEGMENT_CACHE_FRACTION >= (*tld).peak_size + 1 {
        let segment = segment_cache_evict(tld);
        debug_assert!(!segment.is_null());
        if segment.is_null() {
            break;
        }
        segment_os_free(segment, (*segment).segment_size, tld);
    }
    true
}

unsafe fn segment_cache_insert(segment: *mut Segment, tld: *mut SegmentsTld) -> bool {
    debug_assert!((*segment).next.is_null() && (*segment).prev.is_null());
    debug_assert!(!segment_is_in_free_queue(segment, tld));
    debug_assert!(!segment_queue_contains(&(*tld).cache, segment));
    if (*segment).segment_size != SEGMENT_SIZE {
        return false; // only segments of the canonical size are cached
    }
    if segment_cache_full(tld) {
        return false;
    }
    if option_is_enabled(OptionKey::CacheReset) && !option_is_enabled(OptionKey::PageReset) {
        os_reset(
            (segment as *mut u8).add((*segment).segment_info_size),
            (*segment).segment_size - (*segment).segment_info_size,
            (*tld).stats,
        );
    }
    segment_queue_insert_before(&mut (*tld).cache, (*tld).cache.first, segment);
    (*tld).cache_count += 1;
    (*tld).cache_size += (*segment).segment_size;
    true
}

// called by ending threads and `Force` collects to free cached segments
pub(crate) unsafe fn _segment_thread_collect(tld: *mut SegmentsTld) {
    loop {
        let segment = segment_cache_find(tld);
        if segment.is_null() {
            break;
        }
        segment_os_free(segment, (*segment).segment_size, tld);
    }
    debug_assert!((*tld).cache_count == 0 && (*tld).cache_size == 0);
    debug_assert!(segment_queue_is_empty(&(*tld).cache));
}

/* -----------------------------------------------------------
   Segment allocation
----------------------------------------------------------- */

// Allocate a segment from the OS aligned to `SEGMENT_SIZE`.
unsafe fn segment_alloc(
    required: usize,
    page_kind: PageKind,
    page_shift: usize,
    tld: *mut SegmentsTld,
    os_tld: *mut OsTld,
) -> *mut Segment {
    // calculate needed sizes first
    let capacity;
    if page_kind == PageKind::Huge {
        debug_assert!(page_shift == SEGMENT_SHIFT && required > 0);
        capacity = 1;
    } else {
        debug_assert!(required == 0);
        let page_size = 1usize << page_shift;
        capacity = SEGMENT_SIZE / page_size;
        debug_assert!(SEGMENT_SIZE % page_size == 0);
        debug_assert!(capacity >= 1 && capacity <= SMALL_PAGES_PER_SEGMENT);
    }
    let mut info_size = 0;
    let segment_size = segment_calculate_size(required, &mut info_size);
    debug_assert!(segment_size >= required + info_size || required == 0);

    // try to get a segment from our cache, otherwise allocate from the OS
    let mut segment = null_mut();
    if segment_size == SEGMENT_SIZE {
        segment = segment_cache_find(tld);
    }
    if segment.is_null() {
        segment = os_alloc_aligned(segment_size, SEGMENT_SIZE, os_tld) as *mut Segment;
        if segment.is_null() {
            return null_mut();
        }
        segments_track_size(segment_size as i64, tld);
    }
    // cached segments keep their size accounted while cached, nothing to track

    debug_assert!(segment as usize % SEGMENT_SIZE == 0);

    write_bytes(segment as *mut u8, 0, info_size);
    (*segment).page_kind = page_kind;
    (*segment).capacity = capacity;
    (*segment).page_shift = page_shift;
    (*segment).segment_size = segment_size;
    (*segment).segment_info_size = info_size;
    (*segment).thread_id.store(thread_id(), Ordering::Relaxed);
    (*segment).cookie = ptr_cookie(segment as *const u8);
    for i in 0..capacity {
        (*segment).pages[i].segment_idx = i as u8;
    }
    _stat_increase(&mut (*(*tld).stats).page_committed, (*segment).segment_info_size as i64);
    trace!("alloc segment at {:p} (kind {:?})", segment, page_kind);
    segment
}

unsafe fn segment_free(segment: *mut Segment, force: bool, tld: *mut SegmentsTld) {
    debug_assert!(!segment.is_null());
    if segment_is_in_free_queue(segment, tld) {
        debug_assert!((*segment).page_kind == PageKind::Small);
        segment_queue_remove(&mut (*tld).small_free, segment);
    }
    debug_assert!((*segment).next.is_null());
    debug_assert!((*segment).prev.is_null());
    _stat_decrease(&mut (*(*tld).stats).page_committed, (*segment).segment_info_size as i64);
    (*segment).thread_id.store(0, Ordering::Relaxed);

    trace!("free segment at {:p}", segment);
    if !force && segment_cache_insert(segment, tld) {
        // it is put in our cache
    } else {
        // otherwise return it to the OS
        segment_os_free(segment, (*segment).segment_size, tld);
    }
}

/* -----------------------------------------------------------
  Free page management inside a segment
----------------------------------------------------------- */

unsafe fn segment_has_free(segment: *const Segment) -> bool {
    (*segment).used < (*segment).capacity
}

unsafe fn segment_find_free(segment: *mut Segment) -> *mut Page {
    debug_assert!(segment_has_free(segment));
    debug_assert!(segment_is_valid(segment));
    for i in 0..(*segment).capacity {
        let page = &mut (*segment).pages[i] as *mut Page;
        if !(*page).segment_in_use {
            return page;
        }
    }
    debug_assert!(false);
    null_mut()
}

/* -----------------------------------------------------------
   Free
----------------------------------------------------------- */

unsafe fn segment_page_clear(segment: *mut Segment, page: *mut Page, stats: *mut Stats) {
    debug_assert!((*page).segment_in_use);
    debug_assert!(page_all_free(page));
    let inuse = (*page).capacity as usize * (*page).block_size;
    _stat_decrease(&mut (*stats).page_committed, inuse as i64);
    _stat_decrease(&mut (*stats).pages, 1);
    if (*page).block_size > LARGE_SIZE_MAX {
        _stat_decrease(&mut (*stats).huge, (*page).block_size as i64);
    }

    // reset the page memory to reduce memory pressure?
    if !(*page).is_reset && option_is_enabled(OptionKey::PageReset) {
        let mut psize = 0;
        let start = _segment_page_start(segment, page, 0, &mut psize);
        (*page).is_reset = true;
        if inuse > 0 {
            os_reset(start, inuse, stats);
        }
    }

    // zero the page data, but keep the index and reset flag
    let idx = (*page).segment_idx;
    let is_reset = (*page).is_reset;
    write_bytes(page as *mut u8, 0, size_of::<Page>());
    (*page).segment_idx = idx;
    (*page).segment_in_use = false;
    (*page).is_reset = is_reset;
    (*segment).used -= 1;
}

pub(crate) unsafe fn _segment_page_free(page: *mut Page, force: bool, tld: *mut SegmentsTld) {
    debug_assert!(!page.is_null());
    let segment = page_segment(page);
    debug_assert!(segment_is_valid(segment));

    // mark it as free now
    let was_full = !segment_has_free(segment);
    segment_page_clear(segment, page, (*tld).stats);

    if (*segment).used == 0 {
        // no more used pages; remove from the free list and free the segment
        segment_free(segment, force, tld);
    } else if was_full && (*segment).page_kind == PageKind::Small {
        // move back to the small pages free list
        segment_enqueue(&mut (*tld).small_free, segment);
    }
}

/* -----------------------------------------------------------
   Reclamation support
----------------------------------------------------------- */

// Transfer the segment bookkeeping of an abandoned thread descriptor to the
// reclaiming thread: re-tag and splice the free-page queue, and move the size
// accounting. Fully used segments are not reachable from here; the heap
// reclaimer re-tags those while walking the reclaimed heap's pages.
pub(crate) unsafe fn _segments_absorb(
    thread_id: usize,
    to: *mut SegmentsTld,
    from: *mut SegmentsTld,
) {
    loop {
        let segment = (*from).small_free.first;
        if segment.is_null() {
            break;
        }
        segment_queue_remove(&mut (*from).small_free, segment);
        (*segment).thread_id.store(thread_id, Ordering::Relaxed);
        segment_enqueue(&mut (*to).small_free, segment);
    }
    // the exiting thread already collected its cache
    debug_assert!((*from).cache_count == 0 && segment_queue_is_empty(&(*from).cache));
    (*to).current_size += (*from).current_size;
    if (*to).current_size > (*to).peak_size {
        (*to).peak_size = (*to).current_size;
    }
    (*from).current_size = 0;
}

/* -----------------------------------------------------------
   Page allocation
----------------------------------------------------------- */

// Allocate a small page inside a segment.
// Requires that the segment has free pages
unsafe fn segment_small_page_alloc_in(segment: *mut Segment, tld: *mut SegmentsTld) -> *mut Page {
    debug_assert!(segment_has_free(segment));
    let page = segment_find_free(segment);
    (*page).segment_in_use = true;
    (*segment).used += 1;
    debug_assert!((*segment).used <= (*segment).capacity);
    if (*segment).used == (*segment).capacity {
        // if no more free pages, remove from the queue
        debug_assert!(!segment_has_free(segment));
        segment_queue_remove(&mut (*tld).small_free, segment);
    }
    page
}

unsafe fn segment_small_page_alloc(tld: *mut SegmentsTld, os_tld: *mut OsTld) -> *mut Page {
    if segment_queue_is_empty(&(*tld).small_free) {
        let segment = segment_alloc(0, PageKind::Small, SMALL_PAGE_SHIFT, tld, os_tld);
        if segment.is_null() {
            return null_mut();
        }
        segment_enqueue(&mut (*tld).small_free, segment);
    }
    debug_assert!(!(*tld).small_free.first.is_null());
    segment_small_page_alloc_in((*tld).small_free.first, tld)
}

unsafe fn segment_large_page_alloc(tld: *mut SegmentsTld, os_tld: *mut OsTld) -> *mut Page {
    let segment = segment_alloc(0, PageKind::Large, LARGE_PAGE_SHIFT, tld, os_tld);
    if segment.is_null() {
        return null_mut();
    }
    (*segment).used = 1;
    let page = &mut (*segment).pages[0] as *mut Page;
    (*page).segment_in_use = true;
    page
}

unsafe fn segment_huge_page_alloc(
    size: usize,
    tld: *mut SegmentsTld,
    os_tld: *mut OsTld,
) -> *mut Page {
    let segment = segment_alloc(size, PageKind::Huge, SEGMENT_SHIFT, tld, os_tld);
    if segment.is_null() {
        return null_mut();
    }
    debug_assert!((*segment).segment_size - (*segment).segment_info_size >= size);
    (*segment).used = 1;
    let page = &mut (*segment).pages[0] as *mut Page;
    (*page).segment_in_use = true;
    page
}

/* -----------------------------------------------------------
   Page allocation and free
----------------------------------------------------------- */

pub(crate) unsafe fn _segment_page_alloc(
    block_size: usize,
    tld: *mut SegmentsTld,
    os_tld: *mut OsTld,
) -> *mut Page {
    let page = if block_size < SMALL_PAGE_SIZE / 8 {
        // smaller blocks than 8kb (assuming SMALL_PAGE_SIZE == 64kb)
        segment_small_page_alloc(tld, os_tld)
    } else if block_size < LARGE_SIZE_MAX - size_of::<Segment>() {
        segment_large_page_alloc(tld, os_tld)
    } else {
        segment_huge_page_alloc(block_size, tld, os_tld)
    };
    debug_assert!(page.is_null() || segment_is_valid(page_segment(page)));
    page
}
