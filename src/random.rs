use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::Heap;

// Process-wide counter so that two threads starting with the same thread id
// representation still derive distinct heap state.
static RANDOM_SALT: AtomicUsize = AtomicUsize::new(0x9e37);

// xorshift* step; the multiplier spreads the low entropy of addresses and
// thread ids over the whole word.
#[inline]
pub(crate) fn random_shuffle(mut x: usize) -> usize {
    if x == 0 {
        x = 0x9e37_79b9_7f4a_7c15u64 as usize;
    }
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    x.wrapping_mul(0x2545_f491_4f6c_dd1du64 as usize)
}

// Seed fresh PRNG state from the thread id, a process-wide salt and a bit of
// address entropy (ASLR).
pub(crate) fn random_init(seed: usize) -> usize {
    let salt = RANDOM_SALT.fetch_add(0x9e3779b9, Ordering::Relaxed);
    let here = &RANDOM_SALT as *const _ as usize;
    let mut x = seed ^ salt ^ here;
    // shuffle a few rounds so consecutive seeds do not yield related states
    for _ in 0..6 {
        x = random_shuffle(x);
    }
    x
}

// Draw the next value from a heap's PRNG state.
pub(crate) unsafe fn heap_random_next(heap: *mut Heap) -> usize {
    let x = random_shuffle((*heap).random);
    (*heap).random = x;
    x
}

// Derive independent state for a child heap by splitting the parent's
// stream: the child continues from a decorrelated draw so parent and child
// produce unrelated cookies and keys.
pub(crate) unsafe fn random_split(parent: *mut Heap, child: *mut Heap) {
    let x = heap_random_next(parent);
    (*child).random = random_shuffle(x ^ 0x9e37_79b9_7f4a_7c15u64 as usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_never_sticks_at_zero() {
        assert_ne!(random_shuffle(0), 0);
        let mut x = random_init(1);
        for _ in 0..100 {
            x = random_shuffle(x);
            assert_ne!(x, 0);
        }
    }

    #[test]
    fn init_produces_distinct_states() {
        let a = random_init(42);
        let b = random_init(42);
        assert_ne!(a, b);
    }
}
