//! Shavit–Lotan lock-free priority queue.
//!
//! A skip-list set whose nodes carry an extra `deleted` flag. `pop_min`
//! scans the bottom level from the head and claims the first live node by
//! flipping its flag, then physically removes it through the ordinary
//! skip-list removal. Linearizable.

use crossbeam_epoch::Guard;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::skip_list::SkipList;

pub struct ShavitLotanQueue {
    inner: SkipList<AtomicBool>,
}

impl Default for ShavitLotanQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ShavitLotanQueue {
    pub fn new() -> Self {
        Self {
            inner: SkipList::new(),
        }
    }

    pub fn contains(&self, key: i64, guard: &Guard) -> bool {
        self.inner.contains(key, guard)
    }

    pub fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool {
        self.inner
            .insert_with(seed, key, AtomicBool::new(false), guard)
    }

    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        self.inner.remove(key, guard)
    }

    /// Claims and returns the smallest live key, or `None` when the queue is
    /// observed empty.
    ///
    /// The scan skips nodes already claimed or already marked for removal;
    /// losing a claim race moves on to the next candidate, and a fully
    /// consumed scan restarts from the head until the queue drains.
    pub fn pop_min(&self, guard: &Guard) -> Option<i64> {
        let tail = self.inner.tail_ptr();
        loop {
            let mut curr = self.inner.head.next[0]
                .load(Ordering::Acquire, guard)
                .with_tag(0);
            if curr.as_raw() == tail {
                return None;
            }
            while curr.as_raw() != tail {
                let node = unsafe { curr.deref() };
                let live = !node.aux.load(Ordering::Acquire)
                    && node.next[0].load(Ordering::Acquire, guard).tag() == 0;
                if live
                    && node
                        .aux
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    let key = node.key;
                    self.inner.remove(key, guard);
                    return Some(key);
                }
                curr = node.next[0].load(Ordering::Acquire, guard).with_tag(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn pops_in_priority_order() {
        let queue = ShavitLotanQueue::new();
        let seed = &mut 0xfeed_faceu64;
        let guard = &epoch::pin();

        for key in [50i64, 10, 30, 20, 40] {
            assert!(queue.add(seed, key, guard));
        }
        for expected in [10i64, 20, 30, 40] {
            assert_eq!(queue.pop_min(guard), Some(expected));
        }
        assert!(queue.contains(50, guard));
        assert!(!queue.contains(10, guard));
        assert_eq!(queue.pop_min(guard), Some(50));
        assert_eq!(queue.pop_min(guard), None);
    }

    #[test]
    fn remove_skips_popped_keys() {
        let queue = ShavitLotanQueue::new();
        let seed = &mut 7u64;
        let guard = &epoch::pin();

        assert!(queue.add(seed, 1, guard));
        assert!(queue.add(seed, 2, guard));
        assert_eq!(queue.pop_min(guard), Some(1));
        assert!(!queue.remove(1, guard));
        assert!(queue.remove(2, guard));
        assert_eq!(queue.pop_min(guard), None);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let queue = ShavitLotanQueue::new();
        const PER_THREAD: i64 = 500;
        crossbeam_utils::thread::scope(|s| {
            for t in 0..4i64 {
                let queue = &queue;
                s.spawn(move |_| {
                    let seed = &mut (0xabcd + t as u64);
                    for i in 0..PER_THREAD {
                        assert!(queue.add(seed, t * PER_THREAD + i + 1, &epoch::pin()));
                    }
                });
            }
        })
        .unwrap();

        let mut popped = std::collections::HashSet::new();
        crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let queue = &queue;
                    s.spawn(move |_| {
                        let mut keys = Vec::new();
                        for _ in 0..PER_THREAD {
                            if let Some(key) = queue.pop_min(&epoch::pin()) {
                                keys.push(key);
                            }
                        }
                        keys
                    })
                })
                .collect();
            for handle in handles {
                for key in handle.join().unwrap() {
                    assert!(popped.insert(key), "key {key} popped twice");
                }
            }
        })
        .unwrap();

        assert_eq!(popped.len(), 4 * PER_THREAD as usize);
    }
}
