#[cfg(not(windows))]
use errno::errno;
#[cfg(not(windows))]
use libc::{madvise, mmap, munmap, MADV_DONTNEED, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
#[cfg(windows)]
use winapi::um::{
    errhandlingapi::GetLastError,
    memoryapi::{VirtualAlloc, VirtualFree},
    sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE},
};

use core::ptr::null_mut;
use log::warn;

use crate::stats::*;
use crate::types::*;

// page size (initialized properly in `os_init`)
static mut OS_PAGE_SIZE: usize = 4096;

// minimal allocation granularity
static mut OS_ALLOC_GRANULARITY: usize = 4096;

// the pool maps a handful of segments at once to reduce map calls
#[cfg(not(windows))]
const OS_POOL_SEGMENTS: usize = 4;

pub(crate) fn align_up(size: usize, align: usize) -> usize {
    let mut x = (size / align) * align;
    if x < size {
        x += align;
    }
    if x < size {
        return 0;
    }
    x
}

#[cfg(not(windows))]
fn align_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    align_up(ptr as usize, align) as *mut u8
}

// OS (small) page size
pub(crate) unsafe fn os_page_size() -> usize {
    OS_PAGE_SIZE
}

#[cfg(not(windows))]
pub(crate) unsafe fn os_init() {
    let ps = libc::sysconf(libc::_SC_PAGESIZE);
    if ps > 0 {
        OS_PAGE_SIZE = ps as usize;
        OS_ALLOC_GRANULARITY = ps as usize;
    }
}

#[cfg(windows)]
pub(crate) unsafe fn os_init() {
    let mut si: SYSTEM_INFO = core::mem::zeroed();
    GetSystemInfo(&mut si);
    if si.dwPageSize > 0 {
        OS_PAGE_SIZE = si.dwPageSize as usize;
    }
    if si.dwAllocationGranularity > 0 {
        OS_ALLOC_GRANULARITY = si.dwAllocationGranularity as usize;
    }
}

// ------------------------------------------------------------------
// Raw allocation from the OS
// ------------------------------------------------------------------

#[cfg(not(windows))]
unsafe fn os_mmap(size: usize, stats: *mut Stats) -> *mut u8 {
    let p = mmap(null_mut(), size, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANON, -1, 0);
    if p == MAP_FAILED {
        warn!("mmap of {} bytes failed: {}", size, errno());
        return null_mut();
    }
    _stat_counter_increase(&mut (*stats).mmap_calls, size as i64);
    _stat_increase(&mut (*stats).committed, size as i64);
    p as *mut u8
}

#[cfg(not(windows))]
unsafe fn os_munmap(p: *mut u8, size: usize, stats: *mut Stats) {
    if munmap(p as *mut libc::c_void, size) != 0 {
        warn!("munmap of {} bytes at {:p} failed: {}", size, p, errno());
        return;
    }
    _stat_decrease(&mut (*stats).committed, size as i64);
}

#[cfg(windows)]
unsafe fn os_mmap(size: usize, stats: *mut Stats) -> *mut u8 {
    let p = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
    if p.is_null() {
        warn!("VirtualAlloc of {} bytes failed: error {}", size, GetLastError());
        return null_mut();
    }
    _stat_counter_increase(&mut (*stats).mmap_calls, size as i64);
    _stat_increase(&mut (*stats).committed, size as i64);
    p as *mut u8
}

#[cfg(windows)]
unsafe fn os_munmap(p: *mut u8, size: usize, stats: *mut Stats) {
    if VirtualFree(p as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree at {:p} failed: error {}", p, GetLastError());
        return;
    }
    _stat_decrease(&mut (*stats).committed, size as i64);
}

// Allocate metadata (like the per-thread `ThreadData`) directly from the OS.
pub(crate) unsafe fn os_alloc(size: usize, stats: *mut Stats) -> *mut u8 {
    let size = align_up(size, os_page_size());
    os_mmap(size, stats)
}

pub(crate) unsafe fn os_free(p: *mut u8, size: usize, stats: *mut Stats) {
    let size = align_up(size, os_page_size());
    os_munmap(p, size, stats);
}

// ------------------------------------------------------------------
// Aligned allocation (used for segments, which must be aligned to
// `SEGMENT_SIZE` so pointer masking can find the enclosing segment)
// ------------------------------------------------------------------

#[cfg(not(windows))]
unsafe fn os_alloc_aligned_direct(size: usize, alignment: usize, stats: *mut Stats) -> *mut u8 {
    debug_assert!(alignment >= os_page_size());
    let total = size + alignment;
    let p = os_mmap(total, stats);
    if p.is_null() {
        return null_mut();
    }
    // trim the unaligned head and the tail
    let aligned = align_up_ptr(p, alignment);
    let pre = aligned as usize - p as usize;
    if pre > 0 {
        os_munmap(p, pre, stats);
    }
    let post = total - pre - size;
    if post > 0 {
        os_munmap(aligned.add(size), post, stats);
    }
    aligned
}

#[cfg(windows)]
unsafe fn os_alloc_aligned_direct(size: usize, alignment: usize, stats: *mut Stats) -> *mut u8 {
    // over-allocate to learn an aligned address, then re-allocate exactly there
    for _ in 0..3 {
        let probe = VirtualAlloc(null_mut(), size + alignment, MEM_RESERVE, PAGE_READWRITE);
        if probe.is_null() {
            break;
        }
        let aligned = align_up(probe as usize, alignment) as *mut _;
        VirtualFree(probe, 0, MEM_RELEASE);
        let p = VirtualAlloc(aligned, size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
        if p == aligned {
            _stat_counter_increase(&mut (*stats).mmap_calls, size as i64);
            _stat_increase(&mut (*stats).committed, size as i64);
            return p as *mut u8;
        }
        if !p.is_null() {
            VirtualFree(p, 0, MEM_RELEASE);
        }
    }
    warn!("failed to allocate {} bytes aligned to {}", size, alignment);
    null_mut()
}

// Allocate `size` bytes aligned to `alignment`. Segment-sized requests are
// carved from the thread's pool when possible.
pub(crate) unsafe fn os_alloc_aligned(size: usize, alignment: usize, tld: *mut OsTld) -> *mut u8 {
    let size = align_up(size, os_page_size());
    #[cfg(not(windows))]
    {
        if size == SEGMENT_SIZE && alignment == SEGMENT_SIZE {
            return pool_alloc(tld);
        }
    }
    os_alloc_aligned_direct(size, alignment, (*tld).stats)
}

#[cfg(not(windows))]
unsafe fn pool_alloc(tld: *mut OsTld) -> *mut u8 {
    if (*tld).pool_available == 0 {
        let p = os_alloc_aligned_direct(OS_POOL_SEGMENTS * SEGMENT_SIZE, SEGMENT_SIZE, (*tld).stats);
        if p.is_null() {
            // fall back to a single segment
            return os_alloc_aligned_direct(SEGMENT_SIZE, SEGMENT_SIZE, (*tld).stats);
        }
        (*tld).pool = p;
        (*tld).pool_available = OS_POOL_SEGMENTS * SEGMENT_SIZE;
    }
    let p = (*tld).pool;
    (*tld).pool = p.add(SEGMENT_SIZE);
    (*tld).pool_available -= SEGMENT_SIZE;
    p
}

// Release the unused remainder of the pool back to the OS.
pub(crate) unsafe fn _mem_collect(tld: *mut OsTld) {
    #[cfg(not(windows))]
    {
        if (*tld).pool_available > 0 {
            os_munmap((*tld).pool, (*tld).pool_available, (*tld).stats);
        }
    }
    (*tld).pool = null_mut();
    (*tld).pool_available = 0;
}

// Tell the OS the memory range is not needed soon (keeping it mapped).
pub(crate) unsafe fn os_reset(p: *mut u8, size: usize, stats: *mut Stats) {
    _stat_increase(&mut (*stats).reset, size as i64);
    #[cfg(not(windows))]
    {
        if madvise(p as *mut libc::c_void, size, MADV_DONTNEED) != 0 {
            warn!("madvise at {:p} failed: {}", p, errno());
        }
    }
    #[cfg(windows)]
    {
        VirtualAlloc(p as *mut _, size, MEM_RESET, PAGE_READWRITE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_basics() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }

    #[test]
    fn aligned_alloc_is_aligned() {
        unsafe {
            os_init();
            let mut stats = Stats::new();
            let p = os_alloc_aligned_direct(SEGMENT_SIZE, SEGMENT_SIZE, &mut stats);
            assert!(!p.is_null());
            assert_eq!(p as usize & SEGMENT_MASK, 0);
            // touch both ends
            p.write(1);
            p.add(SEGMENT_SIZE - 1).write(1);
            os_munmap(p, SEGMENT_SIZE, &mut stats);
        }
    }
}
