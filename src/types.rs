use core::{
    mem::size_of,
    sync::atomic::{AtomicI64, AtomicPtr, AtomicUsize},
};

#[cfg(target_pointer_width = "64")]
pub const INTPTR_SHIFT: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const INTPTR_SHIFT: usize = 2;

pub const INTPTR_SIZE: usize = 1 << INTPTR_SHIFT;
pub const INTPTR_BITS: usize = INTPTR_SIZE * 8;

// ------------------------------------------------------
// Main internal data-structures
// ------------------------------------------------------

// Main tuning parameters for segment and page sizes
// Sizes for 64-bit, divide by two for 32-bit
pub const SMALL_PAGE_SHIFT: usize = 13 + INTPTR_SHIFT; // 64kb
pub const LARGE_PAGE_SHIFT: usize = 6 + SMALL_PAGE_SHIFT; // 4mb
pub const SEGMENT_SHIFT: usize = LARGE_PAGE_SHIFT; // 4mb

// Derived constants
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;
pub const SEGMENT_MASK: usize = SEGMENT_SIZE - 1;

pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

pub const SMALL_PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / SMALL_PAGE_SIZE;
pub const LARGE_PAGES_PER_SEGMENT: usize = SEGMENT_SIZE / LARGE_PAGE_SIZE;

pub const LARGE_SIZE_MAX: usize = LARGE_PAGE_SIZE / 8; // 512kb on 64-bit
pub const LARGE_WSIZE_MAX: usize = LARGE_SIZE_MAX >> INTPTR_SHIFT;

pub const SMALL_WSIZE_MAX: usize = 128;
pub const SMALL_SIZE_MAX: usize = SMALL_WSIZE_MAX * size_of::<*mut ()>();

// Maximum number of size classes. (spaced exponentially in 16.7% increments)
pub const BIN_HUGE: usize = 64;

pub const BIN_FULL: usize = BIN_HUGE + 1;

// Minimal alignment necessary. On most platforms 16 bytes are needed
// due to SSE registers for example. This must be at least `INTPTR_SIZE`
pub const MAX_ALIGN_SIZE: usize = 16;

// A block lives inside a page and carries the encoded link to the next
// free block while it sits on a free list.
#[repr(C)]
pub struct Block {
    pub(crate) next: usize,
}

// State of a page's `thread_free` list, kept in the bottom 2 bits of the
// list head. `UseDelayedFree` routes remote frees to the owning heap's
// `thread_delayed_free` list instead (set while the page is in the full
// queue), with `DelayedFreeing` marking such a push in flight.
// `NeverDelayedFree` switches the delayed channel off for good while a
// heap is being dismantled.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Delayed {
    NoDelayedFree = 0,
    UseDelayedFree = 1,
    DelayedFreeing = 2,
    NeverDelayedFree = 3,
}

#[derive(Clone, Copy, Default)]
pub struct PageFlags {
    pub(crate) in_full: bool,
    pub(crate) has_aligned: bool,
}

// Thread free list.
// We use the bottom 2 bits of the head word for the `Delayed` state.
#[repr(transparent)]
pub struct ThreadFree {
    pub(crate) value: AtomicUsize,
}

impl ThreadFree {
    pub(crate) const fn new() -> ThreadFree {
        ThreadFree { value: AtomicUsize::new(0) }
    }
}

#[inline]
pub(crate) fn tf_block(tf: usize) -> *mut Block {
    (tf & !3) as *mut Block
}

#[inline]
pub(crate) fn tf_delayed(tf: usize) -> Delayed {
    match tf & 3 {
        0 => Delayed::NoDelayedFree,
        1 => Delayed::UseDelayedFree,
        2 => Delayed::DelayedFreeing,
        _ => Delayed::NeverDelayedFree,
    }
}

#[inline]
pub(crate) fn tf_make(block: *mut Block, delayed: Delayed) -> usize {
    debug_assert!(block as usize & 3 == 0);
    block as usize | delayed as usize
}

#[repr(C)]
pub struct Page {
    // "owned" by the segment
    pub(crate) segment_idx: u8, // index in the segment `pages` array, `page == &segment.pages[page.segment_idx]`
    pub(crate) segment_in_use: bool, // `true` if the segment allocated this page
    pub(crate) is_reset: bool,  // `true` if the page memory was reset

    // layout like this to optimize access in `malloc` and `free`
    pub(crate) flags: PageFlags,
    pub(crate) capacity: u16, // number of blocks committed
    pub(crate) reserved: u16, // number of blocks reserved in memory

    pub(crate) free: *mut Block, // list of available free blocks (`malloc` allocates from this list)
    pub(crate) cookie: usize,    // random cookie to encode the free lists
    pub(crate) used: usize, // number of blocks in use (including blocks in `thread_free`)

    pub(crate) local_free: *mut Block, // list of deferred free blocks by this thread (migrates to `free`)
    pub(crate) thread_free: ThreadFree, // list of deferred free blocks freed by other threads

    // less accessed info
    pub(crate) block_size: usize,     // size available in each block (always `>0`)
    pub(crate) heap: AtomicPtr<Heap>, // the owning heap; read atomically by remote frees
    pub(crate) next: *mut Page, // next page owned by this thread with the same `block_size`
    pub(crate) prev: *mut Page, // previous page owned by this thread with the same `block_size`
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageKind {
    Small, // small blocks go into 64kb pages inside a segment
    Large, // larger blocks go into a single page spanning a whole segment
    Huge,  // huge blocks (>512kb) get a single page in a segment of the exact size (but still 4mb aligned)
}

// Segments are large allocated memory blocks (4mb on 64 bit) from
// the OS. Inside segments we allocate fixed size _pages_ that
// contain blocks.
#[repr(C)]
pub struct Segment {
    pub(crate) next: *mut Segment,
    pub(crate) prev: *mut Segment,
    pub(crate) used: usize,     // count of pages in use (`used <= capacity`)
    pub(crate) capacity: usize, // count of available pages (`#free + used`)
    pub(crate) segment_size: usize, // for huge pages this may be different from `SEGMENT_SIZE`
    pub(crate) segment_info_size: usize, // space used from the first page for segment meta-data and padding
    pub(crate) cookie: usize, // verify addresses: `ptr_cookie(segment) == segment.cookie`

    // layout like this to optimize access in `free`
    pub(crate) page_shift: usize, // `1 << page_shift` == the page size (unless the first page, then `-segment_info_size`)
    pub(crate) thread_id: AtomicUsize, // unique id of the thread owning this segment; re-tagged when an abandoned heap is reclaimed
    pub(crate) page_kind: PageKind, // kind of pages: small, large, or huge
    pub(crate) pages: [Page; SMALL_PAGES_PER_SEGMENT], // `capacity` of them in use
}

// Pages of a certain block size are held in a queue.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PageQueue {
    pub(crate) first: *mut Page,
    pub(crate) last: *mut Page,
    pub(crate) block_size: usize,
}

// A heap owns a set of pages.
#[repr(C)]
pub struct Heap {
    pub(crate) tld: *mut Tld,
    pub(crate) pages: [PageQueue; BIN_FULL + 1], // queue of pages for each size class (or "bin")
    pub(crate) thread_delayed_free: AtomicPtr<Block>, // blocks queued by remote threads, links encoded under `keys`
    pub(crate) thread_id: usize, // thread this heap belongs to
    pub(crate) cookie: usize,
    pub(crate) keys: [usize; 2], // two random keys used to encode the `thread_delayed_free` links
    pub(crate) random: usize,    // random number used for secure allocation
    pub(crate) page_count: usize, // total number of pages in the `pages` queues
    pub(crate) no_reclaim: bool, // `true` if this heap should not reclaim abandoned heaps
    pub(crate) abandoned_next: *mut Heap, // link while this heap sits on the abandoned stack
    pub(crate) next: *mut Heap,  // list of all heaps of this thread, rooted in `tld.heaps`
}

// ------------------------------------------------------
// Statistics
// ------------------------------------------------------

#[repr(C)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    pub const fn new() -> StatCount {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }
}

#[repr(C)]
pub struct StatCounter {
    pub total: AtomicI64,
    pub count: AtomicI64,
}

impl StatCounter {
    pub const fn new() -> StatCounter {
        StatCounter { total: AtomicI64::new(0), count: AtomicI64::new(0) }
    }
}

#[repr(C)]
pub struct Stats {
    pub segments: StatCount,
    pub pages: StatCount,
    pub committed: StatCount,
    pub reset: StatCount,
    pub page_committed: StatCount,
    pub heaps_abandoned: StatCount,
    pub threads: StatCount,
    pub huge: StatCount,
    pub malloc: StatCount,
    pub mmap_calls: StatCounter,
    pub searches: StatCounter,
}

impl Stats {
    pub const fn new() -> Stats {
        Stats {
            segments: StatCount::new(),
            pages: StatCount::new(),
            committed: StatCount::new(),
            reset: StatCount::new(),
            page_committed: StatCount::new(),
            heaps_abandoned: StatCount::new(),
            threads: StatCount::new(),
            huge: StatCount::new(),
            malloc: StatCount::new(),
            mmap_calls: StatCounter::new(),
            searches: StatCounter::new(),
        }
    }
}

// ------------------------------------------------------
// Thread Local data
// ------------------------------------------------------

// Queue of segments
#[repr(C)]
pub struct SegmentQueue {
    pub(crate) first: *mut Segment,
    pub(crate) last: *mut Segment,
}

impl SegmentQueue {
    pub(crate) const fn new() -> SegmentQueue {
        SegmentQueue { first: core::ptr::null_mut(), last: core::ptr::null_mut() }
    }
}

// Segments thread local data
#[repr(C)]
pub struct SegmentsTld {
    pub(crate) small_free: SegmentQueue, // queue of segments with free small pages
    pub(crate) current_size: usize,      // current size of all segments
    pub(crate) peak_size: usize,         // peak size of all segments
    pub(crate) cache_count: usize,       // number of segments in the cache
    pub(crate) cache_size: usize,        // total size of all segments in the cache
    pub(crate) cache: SegmentQueue,      // cache of segments to avoid repeated mmap calls
    pub(crate) stats: *mut Stats,        // points to tld stats
}

impl SegmentsTld {
    pub(crate) const fn new() -> SegmentsTld {
        SegmentsTld {
            small_free: SegmentQueue::new(),
            current_size: 0,
            peak_size: 0,
            cache_count: 0,
            cache_size: 0,
            cache: SegmentQueue::new(),
            stats: core::ptr::null_mut(),
        }
    }
}

// OS thread local data
#[repr(C)]
pub struct OsTld {
    pub(crate) pool: *mut u8,         // pool of segments to reduce mmap calls
    pub(crate) pool_available: usize, // bytes available in the pool
    pub(crate) stats: *mut Stats,     // points to tld stats
}

impl OsTld {
    pub(crate) const fn new() -> OsTld {
        OsTld { pool: core::ptr::null_mut(), pool_available: 0, stats: core::ptr::null_mut() }
    }
}

// Thread local data
#[repr(C)]
pub struct Tld {
    pub(crate) heartbeat: u64,          // monotonic heartbeat count
    pub(crate) heap_backing: *mut Heap, // backing heap of this thread (cannot be deleted)
    pub(crate) heaps: *mut Heap,        // list of heaps of this thread
    pub(crate) segments: SegmentsTld,   // segment tld
    pub(crate) os: OsTld,               // os tld
    pub(crate) stats: Stats,            // statistics
}

impl Tld {
    pub(crate) const fn new() -> Tld {
        Tld {
            heartbeat: 0,
            heap_backing: core::ptr::null_mut(),
            heaps: core::ptr::null_mut(),
            segments: SegmentsTld::new(),
            os: OsTld::new(),
            stats: Stats::new(),
        }
    }
}
