use crate::types::*;

use core::hint::spin_loop;
use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

// Overflow detecting multiply
const MUL_NO_OVERFLOW: usize = 1 << (4 * size_of::<usize>()); // sqrt(SIZE_MAX)
#[inline]
pub(crate) fn mul_overflow(size: usize, count: usize, total: &mut usize) -> bool {
    *total = size.wrapping_mul(count);
    (size >= MUL_NO_OVERFLOW || count >= MUL_NO_OVERFLOW)
        && size > 0
        && (usize::max_value() / size) < count
}

// Align a byte size to a size in _machine words_,
// i.e. byte size == `wsize*sizeof(void*)`.
#[inline]
pub(crate) fn wsize_from_size(size: usize) -> usize {
    debug_assert!(size <= usize::max_value() - size_of::<usize>());
    (size + size_of::<usize>() - 1) / size_of::<usize>()
}

#[inline]
pub(crate) unsafe fn heap_is_initialized(heap: *const Heap) -> bool {
    debug_assert!(!heap.is_null());
    !(*heap).tld.is_null()
}

#[inline]
pub(crate) unsafe fn heap_is_backing(heap: *const Heap) -> bool {
    (*(*heap).tld).heap_backing as *const Heap == heap
}

// Segment that contains the pointer
#[inline]
pub(crate) fn ptr_segment(p: *const u8) -> *mut Segment {
    (p as usize & !SEGMENT_MASK) as *mut Segment
}

// Segment belonging to a page (the page meta-data lives in the segment header)
#[inline]
pub(crate) unsafe fn page_segment(page: *const Page) -> *mut Segment {
    let segment = ptr_segment(page as *const u8);
    debug_assert!(
        segment.is_null() || page == &(*segment).pages[(*page).segment_idx as usize] as *const Page
    );
    segment
}

// Get the page containing the pointer
#[inline]
pub(crate) unsafe fn segment_page_of(segment: *const Segment, p: *const u8) -> *mut Page {
    let diff = p as usize - segment as usize;
    debug_assert!(diff < SEGMENT_SIZE || (*segment).page_kind == PageKind::Huge);
    let mut idx = diff >> (*segment).page_shift;
    if idx >= (*segment).capacity {
        // huge segments span more than one page-shift worth of memory
        idx = 0;
    }
    debug_assert!((*segment).page_kind == PageKind::Small || idx == 0);
    &(*segment).pages[idx] as *const Page as *mut Page
}

// Quick page start for initialized pages
#[inline]
pub(crate) unsafe fn page_start(
    segment: *const Segment,
    page: *const Page,
    page_size: *mut usize,
) -> *mut u8 {
    crate::segment::_segment_page_start(segment, page, (*page).block_size, page_size)
}

// Get the page containing the pointer
#[inline]
pub(crate) unsafe fn ptr_page(p: *const u8) -> *mut Page {
    segment_page_of(ptr_segment(p), p)
}

#[inline]
pub(crate) unsafe fn page_heap(page: *const Page) -> *mut Heap {
    (*page).heap.load(Ordering::Acquire)
}

#[inline]
pub(crate) unsafe fn page_set_heap(page: *mut Page, heap: *mut Heap) {
    (*page).heap.store(heap, Ordering::Release);
}

// are all blocks in a page freed?
#[inline]
pub(crate) unsafe fn page_all_free(page: *const Page) -> bool {
    debug_assert!(!page.is_null());
    (*page).used == 0
}

// are there immediately available blocks
#[inline]
pub(crate) unsafe fn page_immediate_available(page: *const Page) -> bool {
    debug_assert!(!page.is_null());
    !(*page).free.is_null()
}

// is more than 7/8th of a page in use?
#[inline]
pub(crate) unsafe fn page_mostly_used(page: *const Page) -> bool {
    if page.is_null() {
        return true;
    }
    let frac = (*page).reserved as usize / 8;
    (*page).reserved as usize - (*page).used < frac
}

// -------------------------------------------------------------------
// Encoding/Decoding of free list next pointers.
// Page-local lists are encoded under the page cookie; the per-heap
// `thread_delayed_free` list under the heap's two keys so that a stray
// write into a single block cannot produce a walkable pointer.
// -------------------------------------------------------------------

#[inline]
pub(crate) unsafe fn block_next(page: *const Page, block: *const Block) -> *mut Block {
    ((*block).next ^ (*page).cookie) as *mut Block
}

#[inline]
pub(crate) unsafe fn block_set_next(page: *const Page, block: *mut Block, next: *mut Block) {
    (*block).next = next as usize ^ (*page).cookie;
}

#[inline]
pub(crate) unsafe fn block_nextx(keys: &[usize; 2], block: *const Block) -> *mut Block {
    ((*block).next.wrapping_sub(keys[0]) ^ keys[1]) as *mut Block
}

#[inline]
pub(crate) unsafe fn block_set_nextx(keys: &[usize; 2], block: *mut Block, next: *mut Block) {
    (*block).next = (next as usize ^ keys[1]).wrapping_add(keys[0]);
}

// -------------------------------------------------------------------
// Thread id. Called in the fast path of `free` so it must stay cheap:
// one TLS read in the common case. The id is drawn from a process-wide
// monotonic counter and is never reused. OS thread ids (`pthread_self`,
// `GetCurrentThreadId`) get recycled once a thread exits, and abandoned
// segments keep their dead owner's id until a reclaimer re-tags them;
// a recycled id could alias that and make `free` take the local path
// on a page it does not own. Id 0 stays reserved for unowned segments.
// -------------------------------------------------------------------

static THREAD_ID_NEXT: AtomicUsize = AtomicUsize::new(1);

const TID_KEY_UNINIT: usize = 0;
const TID_KEY_CREATING: usize = 1;
const TID_KEY_READY: usize = 2;

static TID_KEY_STATE: AtomicUsize = AtomicUsize::new(TID_KEY_UNINIT);

#[cfg(not(windows))]
static mut TID_KEY: libc::pthread_key_t = 0;

#[cfg(windows)]
static mut TID_KEY: winapi::shared::minwindef::DWORD = 0;

#[cfg(not(windows))]
unsafe fn tid_slot_create() {
    libc::pthread_key_create(core::ptr::addr_of_mut!(TID_KEY), None);
}

#[cfg(not(windows))]
unsafe fn tid_slot_get() -> usize {
    libc::pthread_getspecific(TID_KEY) as usize
}

#[cfg(not(windows))]
unsafe fn tid_slot_set(id: usize) {
    libc::pthread_setspecific(TID_KEY, id as *mut libc::c_void);
}

#[cfg(windows)]
unsafe fn tid_slot_create() {
    TID_KEY = winapi::um::fibersapi::FlsAlloc(None);
}

#[cfg(windows)]
unsafe fn tid_slot_get() -> usize {
    winapi::um::fibersapi::FlsGetValue(TID_KEY) as usize
}

#[cfg(windows)]
unsafe fn tid_slot_set(id: usize) {
    winapi::um::fibersapi::FlsSetValue(TID_KEY, id as *mut winapi::ctypes::c_void);
}

fn tid_slot_ready() {
    if TID_KEY_STATE.load(Ordering::Acquire) == TID_KEY_READY {
        return;
    }
    if TID_KEY_STATE
        .compare_exchange(TID_KEY_UNINIT, TID_KEY_CREATING, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        unsafe { tid_slot_create() };
        TID_KEY_STATE.store(TID_KEY_READY, Ordering::Release);
        return;
    }
    while TID_KEY_STATE.load(Ordering::Acquire) != TID_KEY_READY {
        spin_loop();
    }
}

#[inline]
pub(crate) fn thread_id() -> usize {
    tid_slot_ready();
    unsafe {
        let id = tid_slot_get();
        if id != 0 {
            return id;
        }
        let id = THREAD_ID_NEXT.fetch_add(1, Ordering::Relaxed);
        tid_slot_set(id);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_overflow_detects() {
        let mut total = 0;
        assert!(!mul_overflow(8, 100, &mut total));
        assert_eq!(total, 800);
        assert!(mul_overflow(usize::max_value() / 2, 4, &mut total));
    }

    #[test]
    fn wsize_rounds_up() {
        assert_eq!(wsize_from_size(0), 0);
        assert_eq!(wsize_from_size(1), 1);
        assert_eq!(wsize_from_size(8), 1);
        assert_eq!(wsize_from_size(9), 2);
    }

    #[test]
    fn thread_ids_are_stable_and_never_reused() {
        let a = thread_id();
        assert_eq!(a, thread_id());
        assert_ne!(a, 0);
        // sequentially spawned threads often get the same OS thread id
        // back; the allocator id must still differ
        let b = std::thread::spawn(thread_id).join().unwrap();
        let c = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn keyed_codec_round_trips() {
        let keys = [0x9e3779b97f4a7c15usize, 0xbf58476d1ce4e5b9usize];
        let mut storage = Block { next: 0 };
        let sentinel = 0x7fff_beef_usize as *mut Block;
        unsafe {
            block_set_nextx(&keys, &mut storage, sentinel);
            assert_ne!(storage.next, sentinel as usize);
            assert_eq!(block_nextx(&keys, &storage), sentinel);
            block_set_nextx(&keys, &mut storage, core::ptr::null_mut());
            assert!(block_nextx(&keys, &storage).is_null());
        }
    }
}
