// Threads that exit with live blocks abandon their heap; a later collect on
// another thread reclaims one abandoned heap at a time.

use halloc::*;
use std::thread;

unsafe fn exit_with_live_blocks() -> (usize, usize) {
    thread::spawn(|| unsafe {
        let a = malloc(128);
        let b = malloc(128);
        assert!(!a.is_null() && !b.is_null());
        a.write_bytes(0xaa, 128);
        b.write_bytes(0xbb, 128);
        (a as usize, b as usize)
    })
    .join()
    .unwrap()
}

#[test]
fn reclaim_one_abandoned_heap_per_collect() {
    let _ = env_logger::try_init();
    unsafe {
        // claim the process main heap for this thread before spawning
        let warmup = malloc(16);
        assert!(!warmup.is_null());
        let backing = heap_get_backing();

        let (a1, b1) = exit_with_live_blocks();
        let (a2, b2) = exit_with_live_blocks();

        // a normal collect absorbs exactly one heap: the most recently
        // abandoned one
        heap_collect(backing, false);
        assert!(heap_check_owned(backing, a2 as *const u8));
        assert!(heap_check_owned(backing, b2 as *const u8));
        assert!(!heap_check_owned(backing, a1 as *const u8));
        assert!(!heap_check_owned(backing, b1 as *const u8));

        // the next collect picks up the remaining one
        heap_collect(backing, false);
        assert!(heap_check_owned(backing, a1 as *const u8));
        assert!(heap_check_owned(backing, b1 as *const u8));

        // the reclaimed blocks are intact and can be freed locally now
        assert_eq!(*(a1 as *const u8), 0xaa);
        assert_eq!(*(b2 as *const u8), 0xbb);
        for p in [a1, b1, a2, b2].iter() {
            free(*p as *mut u8);
        }
        free(warmup);
    }
}
