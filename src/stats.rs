use crate::types::*;
use core::sync::atomic::Ordering;
use log::info;

pub(crate) unsafe fn _stat_increase(stat: *mut StatCount, amount: i64) {
    _stat_update(stat, amount);
}

pub(crate) unsafe fn _stat_decrease(stat: *mut StatCount, amount: i64) {
    _stat_update(stat, -amount);
}

pub(crate) unsafe fn _stat_update(stat: *mut StatCount, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = (*stat).current.fetch_add(amount, Ordering::Relaxed) + amount;
    (*stat).peak.fetch_max(current, Ordering::Relaxed);
    if amount > 0 {
        (*stat).allocated.fetch_add(amount, Ordering::Relaxed);
    } else {
        (*stat).freed.fetch_add(-amount, Ordering::Relaxed);
    }
}

pub(crate) unsafe fn _stat_counter_increase(stat: *mut StatCounter, amount: i64) {
    (*stat).total.fetch_add(amount, Ordering::Relaxed);
    (*stat).count.fetch_add(1, Ordering::Relaxed);
}

unsafe fn stat_count_merge(to: *mut StatCount, from: *const StatCount) {
    (*to).allocated.fetch_add((*from).allocated.load(Ordering::Relaxed), Ordering::Relaxed);
    (*to).freed.fetch_add((*from).freed.load(Ordering::Relaxed), Ordering::Relaxed);
    let current = (*to).current.fetch_add((*from).current.load(Ordering::Relaxed), Ordering::Relaxed)
        + (*from).current.load(Ordering::Relaxed);
    (*to).peak.fetch_max(current, Ordering::Relaxed);
}

unsafe fn stat_counter_merge(to: *mut StatCounter, from: *const StatCounter) {
    (*to).total.fetch_add((*from).total.load(Ordering::Relaxed), Ordering::Relaxed);
    (*to).count.fetch_add((*from).count.load(Ordering::Relaxed), Ordering::Relaxed);
}

// Merge the statistics of an ending thread into the main statistics.
pub(crate) unsafe fn _stats_done(stats: *mut Stats, main_stats: *mut Stats) {
    if stats == main_stats {
        return;
    }
    stat_count_merge(&mut (*main_stats).segments, &(*stats).segments);
    stat_count_merge(&mut (*main_stats).pages, &(*stats).pages);
    stat_count_merge(&mut (*main_stats).committed, &(*stats).committed);
    stat_count_merge(&mut (*main_stats).reset, &(*stats).reset);
    stat_count_merge(&mut (*main_stats).page_committed, &(*stats).page_committed);
    stat_count_merge(&mut (*main_stats).heaps_abandoned, &(*stats).heaps_abandoned);
    stat_count_merge(&mut (*main_stats).threads, &(*stats).threads);
    stat_count_merge(&mut (*main_stats).huge, &(*stats).huge);
    stat_count_merge(&mut (*main_stats).malloc, &(*stats).malloc);
    stat_counter_merge(&mut (*main_stats).mmap_calls, &(*stats).mmap_calls);
    stat_counter_merge(&mut (*main_stats).searches, &(*stats).searches);
}

unsafe fn stat_count_print(name: &str, stat: *const StatCount) {
    info!(
        "{:>16}: allocated {:>10}, freed {:>10}, peak {:>10}, current {:>10}",
        name,
        (*stat).allocated.load(Ordering::Relaxed),
        (*stat).freed.load(Ordering::Relaxed),
        (*stat).peak.load(Ordering::Relaxed),
        (*stat).current.load(Ordering::Relaxed)
    );
}

pub(crate) unsafe fn _stats_print(stats: *const Stats) {
    stat_count_print("segments", &(*stats).segments);
    stat_count_print("pages", &(*stats).pages);
    stat_count_print("committed", &(*stats).committed);
    stat_count_print("reset", &(*stats).reset);
    stat_count_print("page committed", &(*stats).page_committed);
    stat_count_print("abandoned heaps", &(*stats).heaps_abandoned);
    stat_count_print("threads", &(*stats).threads);
    stat_count_print("huge", &(*stats).huge);
    stat_count_print("malloc", &(*stats).malloc);
    info!(
        "{:>16}: total {:>10}, count {:>10}",
        "mmap calls",
        (*stats).mmap_calls.total.load(Ordering::Relaxed),
        (*stats).mmap_calls.count.load(Ordering::Relaxed)
    );
    info!(
        "{:>16}: total {:>10}, count {:>10}",
        "searches",
        (*stats).searches.total.load(Ordering::Relaxed),
        (*stats).searches.count.load(Ordering::Relaxed)
    );
}
