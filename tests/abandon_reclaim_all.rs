// A forced collect absorbs every abandoned heap at once.

use halloc::*;
use std::thread;

#[test]
fn force_collect_reclaims_all_abandoned_heaps() {
    let _ = env_logger::try_init();
    unsafe {
        let warmup = malloc(16);
        assert!(!warmup.is_null());
        let backing = heap_get_backing();

        let mut blocks = Vec::new();
        for round in 0..3u8 {
            let ptrs = thread::spawn(move || unsafe {
                let a = malloc(128);
                let b = malloc(128);
                assert!(!a.is_null() && !b.is_null());
                a.write_bytes(round + 1, 128);
                b.write_bytes(round + 1, 128);
                (a as usize, b as usize)
            })
            .join()
            .unwrap();
            blocks.push((round + 1, ptrs.0));
            blocks.push((round + 1, ptrs.1));
        }

        collect(true);

        for &(tag, p) in &blocks {
            assert!(heap_check_owned(backing, p as *const u8));
            assert_eq!(*(p as *const u8), tag);
        }

        // nothing left to reclaim; a further collect changes nothing
        heap_collect(backing, false);
        for &(_, p) in &blocks {
            assert!(heap_check_owned(backing, p as *const u8));
            free(p as *mut u8);
        }
        free(warmup);
    }
}
