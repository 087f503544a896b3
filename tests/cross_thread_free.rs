// A block freed on another thread stays "owned" until the owning thread
// collects, after which it is back on its page's free list.

use halloc::*;
use std::thread;

#[test]
fn cross_thread_free_lands_on_next_collect() {
    let _ = env_logger::try_init();
    unsafe {
        let heap = heap_get_default();
        let p = malloc(64);
        // a second block keeps the page alive across the collect below
        let keeper = malloc(64);
        assert!(!p.is_null() && !keeper.is_null());
        p.write_bytes(0x11, 64);

        let addr = p as usize;
        thread::spawn(move || unsafe {
            free(addr as *mut u8);
        })
        .join()
        .unwrap();

        // the remote free is still queued; the block counts as allocated
        assert!(heap_check_owned(heap, p));

        heap_collect(heap, false);

        // after the collect the block is on a free list again
        assert!(heap_contains_block(heap, p));
        assert!(!heap_check_owned(heap, p));
        assert!(heap_check_owned(heap, keeper));
        free(keeper);
    }
}
