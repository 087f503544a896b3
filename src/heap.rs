use crate::alloc::{_free_delayed_block, free, heap_malloc};
use crate::init::{
    get_default_heap, heap_set_default_direct, is_main_thread, main_stats, thread_data_free,
    thread_init,
};
use crate::internal::*;
use crate::os::_mem_collect;
use crate::page::{
    _page_free, _page_free_collect, _page_queue_append, _page_unfull, _page_use_delayed_free,
};
use crate::random::{heap_random_next, random_split};
use crate::segment::{_segment_thread_collect, _segments_absorb};
use crate::stats::{_stat_decrease, _stat_increase};
use crate::types::*;

use core::mem::size_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::trace;

/* -----------------------------------------------------------
  Walking the pages of a heap.

  The visitor is a trait with a small closed set of
  implementations so the iterator stays monomorphic. The
  iterator reads `next` before calling the visitor, so a
  visitor may unlink (free, un-full) the page it is given.
----------------------------------------------------------- */

pub(crate) trait PageVisitor {
    unsafe fn visit(&mut self, heap: *mut Heap, pq: *mut PageQueue, page: *mut Page) -> bool;
}

pub(crate) unsafe fn heap_visit_pages<V: PageVisitor>(heap: *mut Heap, visitor: &mut V) -> bool {
    if (*heap).page_count == 0 {
        return true;
    }
    #[cfg(debug_assertions)]
    let total = (*heap).page_count;
    let mut count = 0;
    for i in 0..=BIN_FULL {
        let pq = &mut (*heap).pages[i] as *mut PageQueue;
        let mut page = (*pq).first;
        while !page.is_null() {
            let next = (*page).next; // save next in case the page is removed from the queue
            debug_assert!(page_heap(page) == heap);
            count += 1;
            if !visitor.visit(heap, pq, page) {
                return false;
            }
            page = next;
        }
    }
    let _ = count;
    #[cfg(debug_assertions)]
    debug_assert!(count == total);
    true
}

struct CountPages {
    count: usize,
}

impl PageVisitor for CountPages {
    unsafe fn visit(&mut self, _heap: *mut Heap, _pq: *mut PageQueue, _page: *mut Page) -> bool {
        self.count += 1;
        true
    }
}

pub(crate) unsafe fn heap_is_valid(heap: *mut Heap) -> bool {
    debug_assert!(!heap.is_null());
    let mut counter = CountPages { count: 0 };
    heap_visit_pages(heap, &mut counter); // asserts the owner of every page
    debug_assert!(counter.count == (*heap).page_count);
    true
}

/* -----------------------------------------------------------
  The collect operation
----------------------------------------------------------- */

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Collect {
    Normal = 0,
    Force = 1,
    Abandon = 2,
}

struct PageCollect {
    collect: Collect,
}

impl PageVisitor for PageCollect {
    unsafe fn visit(&mut self, _heap: *mut Heap, pq: *mut PageQueue, page: *mut Page) -> bool {
        _page_free_collect(page, self.collect >= Collect::Force);
        if page_all_free(page) {
            // the page became fully free, return it to the segment
            _page_free(page, pq, self.collect >= Collect::Force);
        } else if self.collect != Collect::Abandon
            && (*page).flags.in_full
            && page_immediate_available(page)
        {
            // a full page regained free blocks (e.g. swept after an absorb)
            _page_unfull(page);
        }
        true
    }
}

struct PageNeverDelayed;

impl PageVisitor for PageNeverDelayed {
    unsafe fn visit(&mut self, _heap: *mut Heap, _pq: *mut PageQueue, page: *mut Page) -> bool {
        _page_use_delayed_free(page, Delayed::NeverDelayedFree, false);
        true
    }
}

// Run the deferred-free hook, drain the delayed-free channel, then sweep all
// pages; `Force` also gives the cached segments (and on the main thread the
// OS pool) back.
pub(crate) unsafe fn heap_collect_ex(heap: *mut Heap, collect: Collect) {
    if heap.is_null() || !heap_is_initialized(heap) {
        return;
    }
    _deferred_free(heap, collect >= Collect::Force);

    // absorb heaps abandoned by terminated threads (not when abandoning ourselves)
    if collect != Collect::Abandon && !(*heap).no_reclaim {
        heap_try_reclaim_abandoned(heap, collect == Collect::Force);
    }

    // when abandoning, no new blocks may be routed to our delayed list once
    // we drained it
    if collect == Collect::Abandon {
        heap_visit_pages(heap, &mut PageNeverDelayed);
    }

    // free delayed blocks queued by other threads
    _heap_delayed_free(heap);

    // collect all pages owned by this thread
    heap_visit_pages(heap, &mut PageCollect { collect });
    debug_assert!(heap_is_valid(heap));

    // collect segment caches
    if collect >= Collect::Force {
        _segment_thread_collect(&mut (*(*heap).tld).segments);
    }

    // collect regions on program-exit (or an explicit force collect)
    if collect >= Collect::Force && is_main_thread() {
        _mem_collect(&mut (*(*heap).tld).os);
    }
}

pub unsafe fn heap_collect(heap: *mut Heap, force: bool) {
    heap_collect_ex(heap, if force { Collect::Force } else { Collect::Normal });
}

pub unsafe fn collect(force: bool) {
    heap_collect(get_default_heap(), force);
}

pub(crate) unsafe fn heap_collect_abandon(heap: *mut Heap) {
    heap_collect_ex(heap, Collect::Abandon);
}

/* -----------------------------------------------------------
  The deferred free hook
----------------------------------------------------------- */

pub type DeferredFreeFun = unsafe fn(force: bool, heartbeat: u64, arg: *mut ());

static DEFERRED_FREE: AtomicUsize = AtomicUsize::new(0);
static DEFERRED_ARG: AtomicPtr<()> = AtomicPtr::new(null_mut());

// Register a hook that is called before collects and on the generic
// allocation path, so clients can return outstanding blocks in time.
pub fn register_deferred_free(hook: Option<DeferredFreeFun>, arg: *mut ()) {
    DEFERRED_FREE.store(hook.map_or(0, |f| f as usize), Ordering::Release);
    DEFERRED_ARG.store(arg, Ordering::Release);
}

pub(crate) unsafe fn _deferred_free(heap: *mut Heap, force: bool) {
    (*(*heap).tld).heartbeat += 1;
    let hook = DEFERRED_FREE.load(Ordering::Acquire);
    if hook != 0 {
        let hook: DeferredFreeFun = core::mem::transmute(hook);
        hook(force, (*(*heap).tld).heartbeat, DEFERRED_ARG.load(Ordering::Acquire));
    }
}

/* -----------------------------------------------------------
  The delayed-free channel (owner side)
----------------------------------------------------------- */

// Take all delayed blocks at once and hand each back to its page.
pub(crate) unsafe fn _heap_delayed_free(heap: *mut Heap) {
    let mut block = (*heap).thread_delayed_free.swap(null_mut(), Ordering::AcqRel);
    while !block.is_null() {
        let next = block_nextx(&(*heap).keys, block);
        _free_delayed_block(block);
        block = next;
    }
}

/* -----------------------------------------------------------
  Heap creation and the default heap
----------------------------------------------------------- */

pub unsafe fn heap_get_default() -> *mut Heap {
    thread_init();
    get_default_heap()
}

pub unsafe fn heap_get_backing() -> *mut Heap {
    (*(*heap_get_default()).tld).heap_backing
}

// Create a fresh heap for the current thread. The new heap refuses
// abandoned memory so that it stays eligible for `heap_destroy`.
pub unsafe fn heap_new() -> *mut Heap {
    let heap = heap_malloc(get_default_heap(), size_of::<Heap>()) as *mut Heap;
    if heap.is_null() {
        return null_mut();
    }
    // the allocation above initialized the thread if needed
    let parent = get_default_heap();
    debug_assert!(heap_is_initialized(parent));
    core::ptr::write(heap, crate::init::empty_heap());
    (*heap).tld = (*parent).tld;
    (*heap).thread_id = thread_id();
    random_split(parent, heap);
    (*heap).cookie = heap_random_next(heap) | 1;
    (*heap).keys = [heap_random_next(heap), heap_random_next(heap)];
    (*heap).no_reclaim = true;
    // link into the thread's heap list
    (*heap).next = (*(*heap).tld).heaps;
    (*(*heap).tld).heaps = heap;
    trace!("new heap {:p} on thread {:#x}", heap, (*heap).thread_id);
    heap
}

// Swap the calling thread's default heap, returning the previous one.
pub unsafe fn heap_set_default(heap: *mut Heap) -> *mut Heap {
    let old = heap_get_default();
    if heap.is_null() || !heap_is_initialized(heap) {
        return old;
    }
    debug_assert!((*heap).thread_id == thread_id());
    heap_set_default_direct(heap);
    old
}

/* -----------------------------------------------------------
  Delete and destroy
----------------------------------------------------------- */

unsafe fn heap_reset_pages(heap: *mut Heap) {
    for i in 0..=BIN_FULL {
        (*heap).pages[i].first = null_mut();
        (*heap).pages[i].last = null_mut();
    }
    (*heap).thread_delayed_free.store(null_mut(), Ordering::Release);
    (*heap).page_count = 0;
}

// Release the heap object itself (never the backing heap: it lives in the
// thread descriptor and is released on thread exit).
unsafe fn heap_free(heap: *mut Heap) {
    if heap_is_backing(heap) {
        return;
    }
    if get_default_heap() == heap {
        heap_set_default_direct((*(*heap).tld).heap_backing);
    }
    // unlink from the thread's heap list
    let tld = (*heap).tld;
    if (*tld).heaps == heap {
        (*tld).heaps = (*heap).next;
    } else {
        let mut curr = (*tld).heaps;
        while !curr.is_null() && (*curr).next != heap {
            curr = (*curr).next;
        }
        debug_assert!(!curr.is_null());
        if !curr.is_null() {
            (*curr).next = (*heap).next;
        }
    }
    free(heap as *mut u8);
}

struct PageDestroy;

impl PageVisitor for PageDestroy {
    unsafe fn visit(&mut self, heap: *mut Heap, _pq: *mut PageQueue, page: *mut Page) -> bool {
        // pretend the page is all free and hand its space back to the segment
        (*page).used = 0;
        (*page).free = null_mut();
        (*page).local_free = null_mut();
        (*page).thread_free.value.store(0, Ordering::Relaxed);
        page_set_heap(page, null_mut());
        crate::segment::_segment_page_free(page, false, &mut (*(*heap).tld).segments);
        true
    }
}

// Forcibly release all pages of the heap without regard for live blocks.
pub(crate) unsafe fn heap_destroy_pages(heap: *mut Heap) {
    heap_visit_pages(heap, &mut PageDestroy);
    heap_reset_pages(heap);
}

// Safe delete: live pages move to the backing heap, so outstanding blocks
// stay valid; the backing heap itself only collects.
pub unsafe fn heap_delete(heap: *mut Heap) {
    if heap.is_null() || !heap_is_initialized(heap) {
        return;
    }
    if !heap_is_backing(heap) {
        // transfer still used pages to the backing heap
        heap_absorb((*(*heap).tld).heap_backing, heap);
        debug_assert!((*heap).page_count == 0);
    } else {
        // the backing heap just collects what it can
        heap_collect_abandon(heap);
    }
    heap_free(heap);
}

// Bulk destroy: only heaps that never reclaim abandoned memory may be
// destroyed, since reclaimed pages can hold blocks of other threads.
pub unsafe fn heap_destroy(heap: *mut Heap) {
    if heap.is_null() || !heap_is_initialized(heap) {
        return;
    }
    if !(*heap).no_reclaim {
        // this heap may contain reclaimed pages, downgrade to a safe delete
        heap_delete(heap);
        return;
    }
    trace!("destroy heap {:p} with {} pages", heap, (*heap).page_count);
    heap_destroy_pages(heap);
    heap_free(heap);
}

/* -----------------------------------------------------------
  Absorbing another heap
----------------------------------------------------------- */

// Merge all pages and the delayed-free list of `from` into `to`.
//
// First every `from` page is switched to `NeverDelayedFree`, which spins
// out producers that are mid-push; after that no new block can land on
// `from`'s delayed list. Pages are then spliced (re-homing their owner and
// re-arming the delayed channel under the new owner), and finally the
// delayed list is stolen wholesale and re-encoded under `to`'s keys. A
// remote free racing the splice lands either in the stolen chain or,
// through the re-homed page pointer, on `to` directly; a later drain on
// `to` sweeps both sources.
pub(crate) unsafe fn heap_absorb(to: *mut Heap, from: *mut Heap) {
    debug_assert!(!to.is_null() && !from.is_null() && to != from);

    // 0. stop the delayed channel of `from`
    heap_visit_pages(from, &mut PageNeverDelayed);

    // 1. transfer all pages by appending the queues
    for i in 0..=BIN_FULL {
        let pcount = _page_queue_append(to, &mut (*to).pages[i], &mut (*from).pages[i]);
        (*to).page_count += pcount;
        (*from).page_count -= pcount;
    }
    debug_assert!((*from).page_count == 0);

    // 2. steal the outstanding delayed frees and re-encode them
    let stolen = (*from).thread_delayed_free.swap(null_mut(), Ordering::AcqRel);
    if !stolen.is_null() {
        let mut tail = stolen;
        loop {
            let next = block_nextx(&(*from).keys, tail);
            block_set_nextx(&(*to).keys, tail, next);
            if next.is_null() {
                break;
            }
            tail = next;
        }
        // prepend the whole chain onto `to`, tolerating concurrent pushes
        loop {
            let head = (*to).thread_delayed_free.load(Ordering::Acquire);
            block_set_nextx(&(*to).keys, tail, head);
            if (*to)
                .thread_delayed_free
                .compare_exchange_weak(head, stolen, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    // 3. `from`'s queues were emptied by the splice
    debug_assert!(heap_is_valid(to));
}

/* -----------------------------------------------------------
  Abandonment and reclamation.

  A single process-wide lock-free stack holds the heaps of
  terminated threads that still have live blocks.
----------------------------------------------------------- */

static ABANDONED: AtomicPtr<Heap> = AtomicPtr::new(null_mut());

// Publish the backing heap of an exiting thread. After the push the heap is
// read-only for this thread.
pub(crate) unsafe fn heap_abandon(heap: *mut Heap) {
    debug_assert!((*heap).page_count > 0);
    debug_assert!(heap_is_backing(heap));
    trace!("abandon heap {:p} with {} pages", heap, (*heap).page_count);
    _stat_increase(&mut (*main_stats()).heaps_abandoned, 1);
    loop {
        let head = ABANDONED.load(Ordering::Relaxed);
        (*heap).abandoned_next = head;
        if ABANDONED
            .compare_exchange_weak(head, heap, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

unsafe fn abandoned_prepend_list(list: *mut Heap) {
    // find the tail; O(n) but the stack is expected to be short
    let mut tail = list;
    while !(*tail).abandoned_next.is_null() {
        tail = (*tail).abandoned_next;
    }
    loop {
        let head = ABANDONED.load(Ordering::Relaxed);
        (*tail).abandoned_next = head;
        if ABANDONED
            .compare_exchange_weak(head, list, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

struct SegmentRetag {
    thread_id: usize,
}

impl PageVisitor for SegmentRetag {
    unsafe fn visit(&mut self, _heap: *mut Heap, _pq: *mut PageQueue, page: *mut Page) -> bool {
        (*page_segment(page)).thread_id.store(self.thread_id, Ordering::Relaxed);
        true
    }
}

// Take over one abandoned heap: its segments are re-tagged to this thread,
// its pages and delayed frees merge into `heap`, the segment bookkeeping
// moves descriptor-to-descriptor, and the shell is released.
unsafe fn heap_reclaim(heap: *mut Heap, from: *mut Heap) {
    trace!("reclaim heap {:p} with {} pages into {:p}", from, (*from).page_count, heap);
    heap_visit_pages(from, &mut SegmentRetag { thread_id: (*heap).thread_id });
    (*from).thread_id = (*heap).thread_id;
    heap_absorb(heap, from);
    _segments_absorb(
        (*heap).thread_id,
        &mut (*(*heap).tld).segments,
        &mut (*(*from).tld).segments,
    );
    _stat_decrease(&mut (*main_stats()).heaps_abandoned, 1);
    thread_data_free(from);
}

// Claim abandoned heaps and absorb them; with `all == false` only one heap
// is taken and the remainder is pushed back.
pub(crate) unsafe fn heap_try_reclaim_abandoned(heap: *mut Heap, all: bool) -> bool {
    if heap.is_null() || !heap_is_initialized(heap) || (*heap).no_reclaim {
        return false;
    }
    // cheap shortcut: the stack is almost always empty (optimization only,
    // the exchange below is what counts)
    if ABANDONED.load(Ordering::Relaxed).is_null() {
        return false;
    }
    // claim the whole stack; nobody can observe a half-consumed state so
    // there is no A-B-A to defend against
    let list = ABANDONED.swap(null_mut(), Ordering::AcqRel);
    if list.is_null() {
        return false;
    }
    if !all {
        // keep only the head, the remainder goes back
        let rest = (*list).abandoned_next;
        (*list).abandoned_next = null_mut();
        if !rest.is_null() {
            abandoned_prepend_list(rest);
        }
    }
    let mut r = list;
    while !r.is_null() {
        let next = (*r).abandoned_next;
        (*r).abandoned_next = null_mut();
        heap_reclaim(heap, r);
        r = next;
    }
    true
}

/* -----------------------------------------------------------
  Ownership predicates
----------------------------------------------------------- */

// Resolve the segment of `p`, guarding against corruption via the cookie.
unsafe fn checked_segment_of(p: *const u8) -> *mut Segment {
    let segment = ptr_segment(p);
    if segment.is_null() {
        return null_mut();
    }
    if crate::init::ptr_cookie(segment as *const u8) != (*segment).cookie {
        return null_mut(); // not one of ours (or corrupted): report not owned
    }
    segment
}

// Does `p` point into a page of `heap`?
pub unsafe fn heap_contains_block(heap: *mut Heap, p: *const u8) -> bool {
    if heap.is_null() || !heap_is_initialized(heap) {
        return false;
    }
    let segment = checked_segment_of(p);
    if segment.is_null() {
        return false;
    }
    let page = segment_page_of(segment, p);
    if !(*page).segment_in_use {
        return false;
    }
    page_heap(page) == heap
}

struct CheckOwned {
    p: *const u8,
    owned: bool,
}

impl PageVisitor for CheckOwned {
    unsafe fn visit(&mut self, _heap: *mut Heap, _pq: *mut PageQueue, page: *mut Page) -> bool {
        let segment = page_segment(page);
        let mut psize = 0;
        let start = page_start(segment, page, &mut psize);
        let end = start.add((*page).capacity as usize * (*page).block_size);
        if (self.p as usize) < start as usize || (self.p as usize) >= end as usize {
            return true; // keep looking
        }
        let offset = self.p as usize - start as usize;
        if offset % (*page).block_size != 0 {
            self.owned = false; // interior pointer, not a block base
            return false;
        }
        // the block is owned unless it sits on a free list; blocks still on
        // `thread_free` count as allocated until the owner collects them
        self.owned = true;
        let mut list = (*page).free;
        for _ in 0..2 {
            while !list.is_null() {
                if list as usize == self.p as usize {
                    self.owned = false;
                    return false;
                }
                list = block_next(page, list);
            }
            list = (*page).local_free;
        }
        false // found the page, stop the walk
    }
}

// Is `p` the base of a currently allocated block of `heap`? Only pointers
// aligned to machine-word granularity are ever reported owned.
pub unsafe fn heap_check_owned(heap: *mut Heap, p: *const u8) -> bool {
    if heap.is_null() || !heap_is_initialized(heap) {
        return false;
    }
    if p as usize & (INTPTR_SIZE - 1) != 0 {
        return false;
    }
    if checked_segment_of(p).is_null() {
        return false;
    }
    let mut visitor = CheckOwned { p, owned: false };
    heap_visit_pages(heap, &mut visitor);
    visitor.owned
}

pub unsafe fn check_owned(p: *const u8) -> bool {
    heap_check_owned(get_default_heap(), p)
}

/* -----------------------------------------------------------
  Visiting heap areas and blocks
----------------------------------------------------------- */

// An area covers the block region of one page.
#[repr(C)]
pub struct HeapArea {
    pub blocks: *mut u8,   // start of the area containing heap blocks
    pub reserved: usize,   // bytes reserved for this area
    pub committed: usize,  // current committed bytes of this area
    pub used: usize,       // number of allocated blocks
    pub block_size: usize, // size in bytes of each block
}

// Visitor for areas and blocks; called with a null `block` once per area,
// and once per in-use block when `visit_blocks` was requested.
pub type BlockVisitFun =
    unsafe fn(heap: *mut Heap, area: &HeapArea, block: *mut u8, block_size: usize, arg: *mut ()) -> bool;

const MAX_BLOCKS: usize = SMALL_PAGE_SIZE / INTPTR_SIZE;

unsafe fn page_visit_blocks(
    heap: *mut Heap,
    page: *mut Page,
    area: &HeapArea,
    visitor: BlockVisitFun,
    arg: *mut (),
) -> bool {
    let start = area.blocks;
    let bsize = (*page).block_size;
    if (*page).capacity == 1 {
        // short-circuit for single-block pages (large and huge blocks)
        debug_assert!((*page).used <= 1);
        if (*page).used == 1 && !visitor(heap, area, start, bsize, arg) {
            return false;
        }
        return true;
    }
    if (*page).used == 0 {
        return true;
    }
    // build a bit-per-block map of the free blocks
    let capacity = (*page).capacity as usize;
    debug_assert!(capacity <= MAX_BLOCKS);
    let mut free_map = [0usize; MAX_BLOCKS / INTPTR_BITS];
    let mut list = (*page).free;
    for _ in 0..2 {
        while !list.is_null() {
            let idx = (list as usize - start as usize) / bsize;
            debug_assert!(idx < capacity);
            free_map[idx / INTPTR_BITS] |= 1 << (idx % INTPTR_BITS);
            list = block_next(page, list);
        }
        list = (*page).local_free;
    }
    // walk the allocated blocks, skipping fully free words
    let mut i = 0;
    while i < capacity {
        if i % INTPTR_BITS == 0
            && i + INTPTR_BITS <= capacity
            && free_map[i / INTPTR_BITS] == usize::max_value()
        {
            i += INTPTR_BITS;
            continue;
        }
        if free_map[i / INTPTR_BITS] & (1 << (i % INTPTR_BITS)) == 0 {
            let block = start.add(i * bsize);
            if !visitor(heap, area, block, bsize, arg) {
                return false;
            }
        }
        i += 1;
    }
    true
}

struct VisitAreas {
    visit_blocks: bool,
    visitor: BlockVisitFun,
    arg: *mut (),
}

impl PageVisitor for VisitAreas {
    unsafe fn visit(&mut self, heap: *mut Heap, _pq: *mut PageQueue, page: *mut Page) -> bool {
        let segment = page_segment(page);
        let mut psize = 0;
        let start = page_start(segment, page, &mut psize);
        let area = HeapArea {
            blocks: start,
            reserved: (*page).reserved as usize * (*page).block_size,
            committed: (*page).capacity as usize * (*page).block_size,
            used: (*page).used,
            block_size: (*page).block_size,
        };
        if !(self.visitor)(heap, &area, null_mut(), (*page).block_size, self.arg) {
            return false;
        }
        if self.visit_blocks {
            page_visit_blocks(heap, page, &area, self.visitor, self.arg)
        } else {
            true
        }
    }
}

// Walk all areas of the heap (one per page), optionally visiting every
// in-use block. The walk stops early when the visitor returns false.
pub unsafe fn heap_visit_blocks(
    heap: *mut Heap,
    visit_blocks: bool,
    visitor: BlockVisitFun,
    arg: *mut (),
) -> bool {
    if heap.is_null() || !heap_is_initialized(heap) {
        return true;
    }
    let mut v = VisitAreas { visit_blocks, visitor, arg };
    heap_visit_pages(heap, &mut v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{free, heap_malloc, malloc};
    use crate::internal::ptr_page;
    use crate::page::_page_use_delayed_free;

    // keep the page that holds heap structs alive so page retirement does
    // not skew page-count arithmetic below
    unsafe fn pin_heap_sized_block() -> *mut u8 {
        heap_malloc(heap_get_backing(), size_of::<Heap>())
    }

    #[test]
    fn absorb_is_additive() {
        unsafe {
            let pin = pin_heap_sized_block();
            let backing = heap_get_backing();
            let c = heap_new();
            assert!(!c.is_null());
            let mut ptrs = std::vec::Vec::new();
            for _ in 0..10 {
                ptrs.push(heap_malloc(c, 32));
            }
            for _ in 0..3 {
                ptrs.push(heap_malloc(c, 4096));
            }
            assert!(ptrs.iter().all(|p| !p.is_null()));
            assert!(heap_is_valid(c));
            let c_pages = (*c).page_count;
            assert!(c_pages >= 2);
            let before = (*backing).page_count;
            heap_delete(c);
            assert_eq!((*backing).page_count, before + c_pages);
            assert!(heap_is_valid(backing));
            for p in &ptrs {
                assert!(heap_check_owned(backing, *p));
            }
            for p in ptrs {
                free(p);
            }
            free(pin);
        }
    }

    #[test]
    fn delayed_frees_survive_delete() {
        unsafe {
            let pin = pin_heap_sized_block();
            let backing = heap_get_backing();
            let c = heap_new();
            let blocks = [
                heap_malloc(c, 64) as usize,
                heap_malloc(c, 64) as usize,
                heap_malloc(c, 64) as usize,
            ];
            assert!(blocks.iter().all(|&p| p != 0));
            // route remote frees of these pages through the heap's delayed list
            for &p in &blocks {
                _page_use_delayed_free(ptr_page(p as *const u8), Delayed::UseDelayedFree, false);
            }
            std::thread::spawn(move || unsafe {
                for &p in &blocks {
                    free(p as *mut u8);
                }
            })
            .join()
            .unwrap();
            assert!(!(*c).thread_delayed_free.load(Ordering::Acquire).is_null());

            heap_delete(c);
            // the stolen chain moved to the backing heap, re-encoded
            assert!(!(*backing).thread_delayed_free.load(Ordering::Acquire).is_null());
            heap_collect(backing, false);
            assert!((*backing).thread_delayed_free.load(Ordering::Acquire).is_null());
            // all three blocks are back on their page's free list
            for &p in &blocks {
                assert!(!heap_check_owned(backing, p as *const u8));
            }
            free(pin);
        }
    }

    #[test]
    fn absorb_rearms_delayed_channel() {
        unsafe {
            let backing = heap_get_backing();
            let c = heap_new();
            let p = heap_malloc(c, 96);
            assert!(!p.is_null());
            heap_delete(c);
            // the pre-splice sweep set the page never-delayed; the splice
            // must have re-armed it or the page could never signal again
            // once it fills up
            let page = ptr_page(p as *const u8);
            let tf = (*page).thread_free.value.load(Ordering::Acquire);
            assert_eq!(tf_delayed(tf), Delayed::NoDelayedFree);
            assert!(heap_check_owned(backing, p));
            free(p);
        }
    }

    #[test]
    fn destroy_releases_segment_space() {
        unsafe {
            let backing = heap_get_backing();
            let tld = (*backing).tld;
            let c = heap_new();
            assert!((*c).no_reclaim);
            // a large block gets its own segment, so its release is observable
            let p = heap_malloc(c, 16 * 1024);
            assert!(!p.is_null());
            p.write_bytes(0xcd, 48);
            let cache_before = (*tld).segments.cache_count;
            let size_before = (*tld).segments.current_size;
            heap_destroy(c);
            assert!(
                (*tld).segments.cache_count > cache_before
                    || (*tld).segments.current_size < size_before
            );
            // the allocator keeps working and may reuse the space
            let q = malloc(16 * 1024);
            assert!(!q.is_null());
            free(q);
        }
    }

    #[test]
    fn set_default_round_trips() {
        unsafe {
            let c = heap_new();
            let old = heap_set_default(c);
            assert_eq!(heap_get_default(), c);
            let prev = heap_set_default(old);
            assert_eq!(prev, c);
            assert_eq!(heap_get_default(), old);
            heap_delete(c);
        }
    }

    #[test]
    fn delete_of_default_falls_back_to_backing() {
        unsafe {
            let c = heap_new();
            heap_set_default(c);
            let p = heap_malloc(c, 128);
            heap_delete(c);
            assert_eq!(heap_get_default(), heap_get_backing());
            assert!(heap_check_owned(heap_get_backing(), p));
            free(p);
        }
    }

    #[test]
    fn ownership_predicates() {
        unsafe {
            let backing = heap_get_backing();
            let c = heap_new();
            let p = heap_malloc(c, 40);
            let q = heap_malloc(c, 40);
            assert!(heap_contains_block(c, p));
            assert!(heap_check_owned(c, p));
            assert!(!heap_contains_block(backing, p));
            assert!(!heap_check_owned(backing, p));
            // interior and unaligned pointers are never owned
            assert!(!heap_check_owned(c, p.add(1)));
            assert!(heap_contains_block(c, p.add(1)));
            // a freed block is contained but no longer owned
            free(q);
            assert!(heap_contains_block(c, q));
            assert!(!heap_check_owned(c, q));
            heap_delete(c);
            free(p);
        }
    }

    unsafe fn counting_visitor(
        _heap: *mut Heap,
        _area: &HeapArea,
        block: *mut u8,
        _block_size: usize,
        arg: *mut (),
    ) -> bool {
        let counts = &mut *(arg as *mut (usize, usize, usize));
        if block.is_null() {
            counts.0 += 1; // area
        } else {
            counts.1 += 1; // block
            counts.2 = block as usize;
        }
        true
    }

    #[test]
    fn single_block_page_visits_exactly_one_block() {
        unsafe {
            let c = heap_new();
            // a huge block lives alone in its page
            let p = heap_malloc(c, LARGE_SIZE_MAX + 1024);
            assert!(!p.is_null());
            let mut counts = (0usize, 0usize, 0usize);
            assert!(heap_visit_blocks(
                c,
                true,
                counting_visitor,
                &mut counts as *mut _ as *mut ()
            ));
            assert_eq!(counts.0, (*c).page_count);
            assert_eq!(counts.1, 1);
            assert_eq!(counts.2, p as usize);
            heap_destroy(c);
        }
    }

    #[test]
    fn multi_block_page_visits_live_blocks_only() {
        unsafe {
            let c = heap_new();
            let a = heap_malloc(c, 256);
            let b = heap_malloc(c, 256);
            let d = heap_malloc(c, 256);
            free(b);
            let mut counts = (0usize, 0usize, 0usize);
            assert!(heap_visit_blocks(
                c,
                true,
                counting_visitor,
                &mut counts as *mut _ as *mut ()
            ));
            assert_eq!(counts.1, 2);
            free(a);
            free(d);
            heap_delete(c);
        }
    }

    #[test]
    fn uninitialized_heap_ops_are_noops() {
        unsafe {
            let mut blank = crate::init::empty_heap();
            let h = &mut blank as *mut Heap;
            heap_collect(h, true);
            heap_delete(h);
            heap_destroy(h);
            assert!(!heap_check_owned(h, null_mut()));
            assert!(!heap_contains_block(h, null_mut()));
            assert!(heap_visit_blocks(h, true, counting_visitor, null_mut()));
            assert!(!heap_try_reclaim_abandoned(h, true));
        }
    }

    #[test]
    fn deferred_free_hook_runs_on_collect() {
        use core::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn hook(_force: bool, _heartbeat: u64, arg: *mut ()) {
            (*(arg as *const AtomicUsize)).fetch_add(1, Ordering::Relaxed);
        }
        unsafe {
            register_deferred_free(Some(hook), &CALLS as *const _ as *mut ());
            let before = CALLS.load(Ordering::Relaxed);
            collect(false);
            assert!(CALLS.load(Ordering::Relaxed) > before);
            register_deferred_free(None, null_mut());
        }
    }
}
