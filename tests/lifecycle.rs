// Lone-thread heap lifecycle: child heaps hand their live pages to the
// backing heap on delete, and `no_reclaim` heaps may be destroyed wholesale.

use halloc::*;

#[test]
fn lone_thread_lifecycle() {
    let _ = env_logger::try_init();
    unsafe {
        // initialize this thread's heap first
        let warmup = malloc(16);
        assert!(!warmup.is_null());

        let backing = heap_get_backing();
        let c = heap_new();
        assert!(!c.is_null());

        let a = heap_malloc(c, 32);
        let b = heap_malloc(c, 32);
        let keep = heap_malloc(c, 32);
        assert!(!a.is_null() && !b.is_null() && !keep.is_null());
        keep.write_bytes(0x42, 32);
        free(a);
        free(b);

        heap_delete(c);

        // the remaining block now lives in the backing heap and is intact
        assert!(heap_contains_block(backing, keep));
        assert!(heap_check_owned(backing, keep));
        for i in 0..32 {
            assert_eq!(*keep.add(i), 0x42);
        }
        free(keep);
        free(warmup);
    }
}

#[test]
fn destroy_skips_live_blocks() {
    let _ = env_logger::try_init();
    unsafe {
        let warmup = malloc(16);
        assert!(!warmup.is_null());

        let d = heap_new();
        assert!(!d.is_null());
        let p = heap_malloc(d, 48);
        assert!(!p.is_null());
        p.write_bytes(0x7e, 48);

        // bulk destroy never walks the user's data; the block is simply gone
        heap_destroy(d);

        // subsequent allocations may reuse the storage
        let q = malloc(48);
        assert!(!q.is_null());
        free(q);
        free(warmup);
    }
}

#[test]
fn delete_of_empty_child_is_cheap() {
    unsafe {
        let warmup = malloc(16);
        let c = heap_new();
        assert!(!c.is_null());
        heap_delete(c);
        free(warmup);
    }
}
