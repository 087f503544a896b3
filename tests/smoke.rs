// Allocator smoke tests: many sizes, many threads, remote frees, and the
// `GlobalAlloc` front.

use halloc::*;
use std::sync::mpsc;
use std::thread;

#[test]
fn many_sizes_many_threads() {
    let _ = env_logger::try_init();
    unsafe {
        let warmup = malloc(8);
        assert!(!warmup.is_null());
        free(warmup);
    }
    let mut handles = Vec::new();
    for t in 0..4usize {
        handles.push(thread::spawn(move || unsafe {
            let mut ptrs: Vec<(usize, usize)> = Vec::new();
            for i in 0..200usize {
                let size = 8 + (i * 37 + t * 13) % 2000;
                let p = malloc(size);
                assert!(!p.is_null());
                p.write_bytes((i % 251) as u8, size);
                assert!(usable_size(p) >= size);
                ptrs.push((p as usize, size));
                if i % 3 == 0 {
                    if let Some((q, _)) = ptrs.pop() {
                        free(q as *mut u8);
                    }
                }
            }
            for (p, size) in ptrs {
                // spot-check the fill pattern survived
                let b = p as *mut u8;
                assert_eq!(*b, *b.add(size - 1));
                free(b);
            }
            collect(true);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn producer_consumer_remote_frees() {
    let _ = env_logger::try_init();
    unsafe {
        let warmup = malloc(8);
        assert!(!warmup.is_null());
        free(warmup);
    }
    let (tx, rx) = mpsc::channel::<usize>();
    let producer = thread::spawn(move || unsafe {
        for i in 0..100usize {
            let p = malloc(64 + (i % 7) * 32);
            assert!(!p.is_null());
            tx.send(p as usize).unwrap();
        }
    });
    let consumer = thread::spawn(move || unsafe {
        for p in rx {
            free(p as *mut u8);
        }
    });
    producer.join().unwrap();
    consumer.join().unwrap();
    unsafe {
        collect(true);
    }
}

#[test]
fn global_alloc_front() {
    use std::alloc::{GlobalAlloc, Layout};
    unsafe {
        let a = Halloc;
        let layout = Layout::from_size_align(300, 64).unwrap();
        let p = a.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        p.write_bytes(0x3c, 300);

        let grown = a.realloc(p, layout, 1000);
        assert!(!grown.is_null());
        assert_eq!(grown as usize % 64, 0);
        for i in 0..300 {
            assert_eq!(*grown.add(i), 0x3c);
        }
        a.dealloc(grown, Layout::from_size_align(1000, 64).unwrap());

        let zeroed = a.alloc_zeroed(Layout::new::<[u64; 32]>());
        assert!(!zeroed.is_null());
        for i in 0..256 {
            assert_eq!(*zeroed.add(i), 0);
        }
        a.dealloc(zeroed, Layout::new::<[u64; 32]>());
    }
}
