use crate::heap::{collect, heap_abandon, heap_collect_abandon, heap_delete, heap_destroy_pages};
use crate::internal::*;
use crate::options::*;
use crate::os::{os_alloc, os_free, os_init, _mem_collect};
use crate::page::PAGE_QUEUES_EMPTY;
use crate::random::{heap_random_next, random_init, random_shuffle};
use crate::stats::*;
use crate::types::*;

use core::hint::spin_loop;
use core::mem::size_of;
use core::ptr::{addr_of_mut, null_mut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use log::{debug, error};

// --------------------------------------------------------
// Statically allocate an empty heap as the initial
// thread local value for the default heap,
// and statically allocate the backing heap for the main
// thread so it can function without doing any allocation
// itself (as accessing a thread local for the first time
// may lead to allocation itself on some platforms)
// --------------------------------------------------------

pub(crate) const fn empty_heap() -> Heap {
    Heap {
        tld: null_mut(),
        pages: PAGE_QUEUES_EMPTY,
        thread_delayed_free: AtomicPtr::new(null_mut()),
        thread_id: 0,
        cookie: 0,
        keys: [0, 0],
        random: 0,
        page_count: 0,
        no_reclaim: false,
        abandoned_next: null_mut(),
        next: null_mut(),
    }
}

// the sentinel every thread starts out with; it is never mutated and every
// operation no-ops on it (its `tld` stays null)
static mut HEAP_EMPTY: Heap = empty_heap();

static mut HEAP_MAIN: Heap = empty_heap();

static mut TLD_MAIN: Tld = Tld::new();

static PROCESS_INIT_STARTED: AtomicBool = AtomicBool::new(false);
static PROCESS_IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub(crate) unsafe fn heap_main() -> *mut Heap {
    addr_of_mut!(HEAP_MAIN)
}

pub(crate) unsafe fn main_stats() -> *mut Stats {
    addr_of_mut!(TLD_MAIN.stats)
}

pub(crate) unsafe fn ptr_cookie(p: *const u8) -> usize {
    p as usize ^ HEAP_MAIN.cookie
}

pub(crate) fn is_main_thread() -> bool {
    unsafe { HEAP_MAIN.thread_id == 0 || HEAP_MAIN.thread_id == thread_id() }
}

// --------------------------------------------------------
// The default-heap slot. We keep it in an OS thread local
// (a pthread key / fiber local) whose destructor doubles as
// the `thread_done` trigger, so any memory still owned by
// an exiting thread is abandoned and re-owned by another
// thread.
// --------------------------------------------------------

#[cfg(not(windows))]
static mut DEFAULT_HEAP_KEY: libc::pthread_key_t = 0;

#[cfg(windows)]
static mut DEFAULT_HEAP_KEY: winapi::shared::minwindef::DWORD = 0;

pub(crate) unsafe fn get_default_heap() -> *mut Heap {
    if !PROCESS_IS_INITIALIZED.load(Ordering::Acquire) {
        return addr_of_mut!(HEAP_EMPTY);
    }
    #[cfg(not(windows))]
    let p = libc::pthread_getspecific(DEFAULT_HEAP_KEY) as *mut Heap;
    #[cfg(windows)]
    let p = winapi::um::fibersapi::FlsGetValue(DEFAULT_HEAP_KEY) as *mut Heap;
    if p.is_null() {
        addr_of_mut!(HEAP_EMPTY)
    } else {
        p
    }
}

pub(crate) unsafe fn heap_set_default_direct(heap: *mut Heap) {
    debug_assert!(PROCESS_IS_INITIALIZED.load(Ordering::Acquire));
    #[cfg(not(windows))]
    libc::pthread_setspecific(DEFAULT_HEAP_KEY, heap as *mut libc::c_void);
    #[cfg(windows)]
    winapi::um::fibersapi::FlsSetValue(DEFAULT_HEAP_KEY, heap as *mut winapi::ctypes::c_void);
}

// The key destructor runs when a thread exits with a non-null slot value;
// the slot itself is already cleared by then, so the heap comes in as the
// callback argument.
#[cfg(not(windows))]
unsafe extern "C" fn thread_done_callback(value: *mut libc::c_void) {
    if !value.is_null() {
        thread_done(value as *mut Heap);
    }
}

#[cfg(windows)]
unsafe extern "system" fn thread_done_callback(value: winapi::um::winnt::PVOID) {
    if !value.is_null() {
        thread_done(value as *mut Heap);
    }
}

/* -----------------------------------------------------------
  Initialization and freeing of the thread local heaps
----------------------------------------------------------- */

// The backing heap and the thread descriptor share one OS allocation;
// `heap` must come first so an abandoned heap pointer doubles as the
// allocation base when the reclaimer releases it.
#[repr(C)]
struct ThreadData {
    heap: Heap,
    tld: Tld,
}

pub(crate) unsafe fn thread_data_free(heap: *mut Heap) {
    debug_assert!(heap != heap_main());
    os_free(heap as *mut u8, size_of::<ThreadData>(), main_stats());
}

// Initialize the thread local default heap, called from `thread_init`
unsafe fn heap_init() -> bool {
    if heap_is_initialized(get_default_heap()) {
        return true;
    }
    if is_main_thread() {
        // the main heap is statically allocated
        heap_set_default_direct(heap_main());
        debug_assert!((*(*heap_main()).tld).heap_backing == heap_main());
    } else {
        // use `os_alloc` to allocate directly from the OS
        let td = os_alloc(size_of::<ThreadData>(), main_stats()) as *mut ThreadData;
        if td.is_null() {
            error!("failed to allocate thread local heap memory");
            return false;
        }
        let tld = &mut (*td).tld as *mut Tld;
        let heap = &mut (*td).heap as *mut Heap;
        core::ptr::write(heap, empty_heap());
        core::ptr::write(tld, Tld::new());
        (*heap).thread_id = thread_id();
        (*heap).random = random_init((*heap).thread_id);
        (*heap).cookie = (heap as usize ^ heap_random_next(heap)) | 1;
        (*heap).keys = [heap_random_next(heap), heap_random_next(heap)];
        (*heap).tld = tld;
        (*tld).heap_backing = heap;
        (*tld).heaps = heap;
        (*tld).segments.stats = &mut (*tld).stats;
        (*tld).os.stats = &mut (*tld).stats;
        heap_set_default_direct(heap);
    }
    false
}

// Free the thread local heaps (called from `thread_done`). Returns `true`
// if it already ran for this thread.
unsafe fn heap_done(default_heap: *mut Heap) -> bool {
    if !heap_is_initialized(default_heap) {
        return true;
    }
    // switch to the backing heap
    let heap = (*(*default_heap).tld).heap_backing;
    if !heap_is_initialized(heap) {
        return false;
    }

    // delete all non-backing heaps of this thread; their pages (and any
    // outstanding delayed frees) move into the backing heap
    let mut curr = (*(*heap).tld).heaps;
    while !curr.is_null() {
        let next = (*curr).next;
        if curr != heap {
            heap_delete(curr);
        }
        curr = next;
    }
    debug_assert!((*(*heap).tld).heaps == heap && (*heap).next.is_null());

    if heap != heap_main() {
        // collect what we can; what stays live is handed to other threads
        heap_collect_abandon(heap);
        _mem_collect(&mut (*(*heap).tld).os);
        // merge stats; past this point the heap is not written by us again
        _stats_done(&mut (*(*heap).tld).stats, main_stats());
        if (*heap).page_count == 0 {
            thread_data_free(heap);
        } else {
            heap_abandon(heap);
        }
    } else {
        heap_destroy_pages(heap);
        debug_assert!((*(*heap).tld).heap_backing == heap_main());
    }
    false
}

// This is called from `malloc_generic`
pub(crate) unsafe fn thread_init() {
    // ensure our process has started already
    process_init();

    // initialize the thread local default heap
    if heap_init() {
        return; // returns true if already initialized
    }

    // don't further initialize for the main thread
    if is_main_thread() {
        return;
    }

    _stat_increase(&mut (*(*get_default_heap()).tld).stats.threads, 1);
    debug!("thread init: {:#x}", thread_id());
}

pub(crate) unsafe fn thread_done(default_heap: *mut Heap) {
    // stats
    if !is_main_thread() && heap_is_initialized(default_heap) {
        _stat_decrease(&mut (*(*default_heap).tld).stats.threads, 1);
    }

    // abandon the thread local heap
    if heap_done(default_heap) {
        return; // already ran
    }

    if !is_main_thread() {
        debug!("thread done: {:#x}", thread_id());
    }
}

// --------------------------------------------------------
// Run functions on process init/done
// --------------------------------------------------------

pub(crate) unsafe fn process_init() {
    // ensure we are called once; late-comers wait until the winner finishes
    if PROCESS_IS_INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    if PROCESS_INIT_STARTED.swap(true, Ordering::AcqRel) {
        while !PROCESS_IS_INITIALIZED.load(Ordering::Acquire) {
            spin_loop();
        }
        return;
    }

    os_init();

    HEAP_MAIN.thread_id = thread_id();
    let random = random_init(HEAP_MAIN.thread_id) ^ heap_main() as usize;
    HEAP_MAIN.cookie = heap_main() as usize ^ random;
    HEAP_MAIN.random = random_shuffle(random);
    HEAP_MAIN.keys = [heap_random_next(heap_main()), heap_random_next(heap_main())];
    TLD_MAIN.heap_backing = heap_main();
    TLD_MAIN.heaps = heap_main();
    TLD_MAIN.segments.stats = main_stats();
    TLD_MAIN.os.stats = main_stats();
    HEAP_MAIN.tld = addr_of_mut!(TLD_MAIN);

    // set up the thread local key whose destructor triggers `thread_done`
    #[cfg(not(windows))]
    libc::pthread_key_create(addr_of_mut!(DEFAULT_HEAP_KEY), Some(thread_done_callback));
    #[cfg(windows)]
    {
        DEFAULT_HEAP_KEY = winapi::um::fibersapi::FlsAlloc(Some(thread_done_callback));
    }

    #[cfg(not(windows))]
    libc::atexit(process_done);

    debug!("process init: {:#x}", HEAP_MAIN.thread_id);
    PROCESS_IS_INITIALIZED.store(true, Ordering::Release);
}

extern "C" fn process_done() {
    // only shutdown if we were initialized
    static PROCESS_DONE: AtomicBool = AtomicBool::new(false);
    if !PROCESS_IS_INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    // ensure we are called once
    if PROCESS_DONE.swap(true, Ordering::AcqRel) {
        return;
    }

    unsafe {
        collect(true);
        if option_is_enabled(OptionKey::ShowStats) || option_is_enabled(OptionKey::Verbose) {
            _stats_print(main_stats());
        }
        debug!("process done: {:#x}", HEAP_MAIN.thread_id);
    }
}
