//! Spray-list relaxed priority queue.
//!
//! A skip-list set whose `pop_min` replaces the head scan with a short
//! random walk ("spray") tuned to the expected thread count, so concurrent
//! poppers land on different small keys instead of fighting over the true
//! minimum. A chain of padding nodes in front of the head absorbs the first
//! hops of the spray and spreads the contention.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::rng::fast_rand;
use crate::skip_list::{Node, SkipList, HEIGHT};

const PADDING: u8 = 0;
const ACTIVE: u8 = 1;
const DELETED: u8 = 2;
/// Claim used by the (disabled) background cleaner between logical and
/// physical removal.
#[allow(dead_code)]
const REMOVING: u8 = 3;

#[derive(Debug, Clone, Copy)]
struct SprayConfig {
    start_height: usize,
    max_jump: u64,
    descend_amount: usize,
    padding_amount: u64,
}

impl SprayConfig {
    /// Paper parameters for an expected population of `threads` poppers.
    fn for_threads(threads: u64) -> Self {
        let threads = threads.max(1);
        let log = 63 - threads.leading_zeros() as u64;
        let log_arg = threads.max(2);
        let log_of_log_arg = 63 - log_arg.leading_zeros() as u64;
        Self {
            start_height: ((log + 1) as usize).min(HEIGHT - 1),
            max_jump: log + 1,
            descend_amount: 1,
            padding_amount: threads * log_of_log_arg / 2,
        }
    }
}

pub struct SprayList {
    config: SprayConfig,
    padding_head: Atomic<Node<AtomicU8>>,
    inner: SkipList<AtomicU8>,
}

impl SprayList {
    /// Builds a queue tuned for `threads` concurrent poppers.
    ///
    /// The padding chain is wired once here and never mutated: every padding
    /// node points at its successor padding node (ending at the real head)
    /// on all levels.
    pub fn new(threads: u64) -> Self {
        let config = SprayConfig::for_threads(threads);
        let inner = SkipList::<AtomicU8>::new();
        let padding_head = Atomic::null();
        padding_head.store(
            Shared::from(&*inner.head as *const Node<AtomicU8>),
            Ordering::Relaxed,
        );
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for _ in 1..config.padding_amount {
            let prev = padding_head.load(Ordering::Relaxed, guard);
            let node = Node::new(i64::MIN, HEIGHT - 1, AtomicU8::new(PADDING));
            for level in 0..HEIGHT {
                node.next[level].store(prev, Ordering::Relaxed);
            }
            padding_head.store(Owned::new(node), Ordering::Relaxed);
        }
        Self {
            config,
            padding_head,
            inner,
        }
    }

    pub fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool {
        self.inner
            .insert_with(seed, key, AtomicU8::new(ACTIVE), guard)
    }

    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        self.inner.remove(key, guard)
    }

    /// Random descent from the padding head: at each visited height take a
    /// bounded random number of forward hops, then drop down.
    fn spray<'g>(&'g self, seed: &mut u64, guard: &'g Guard) -> Shared<'g, Node<AtomicU8>> {
        let mut cur = self.padding_head.load(Ordering::Acquire, guard);
        let mut height = self.config.start_height as isize;
        while height >= 0 {
            let mut jump = fast_rand(seed) % (self.config.max_jump + 1);
            while jump > 0 {
                let next = unsafe { cur.deref() }.next[height as usize]
                    .load(Ordering::Acquire, guard)
                    .with_tag(0);
                if next.is_null() {
                    break;
                }
                cur = next;
                jump -= 1;
            }
            height -= self.config.descend_amount as isize;
        }
        cur
    }

    /// Sprays to a landing node, then walks the bottom level claiming the
    /// first node still `Active`. Returns `None` once the walk runs off the
    /// tail without claiming anything.
    pub fn pop_min(&self, seed: &mut u64, guard: &Guard) -> Option<i64> {
        let tail = self.inner.tail_ptr();
        let mut cur = self.spray(seed, guard);
        while cur.as_raw() != tail {
            let node = unsafe { cur.deref() };
            let state = node.aux.load(Ordering::Acquire);
            if state == ACTIVE
                && node
                    .aux
                    .compare_exchange(ACTIVE, DELETED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                let key = node.key;
                self.inner.remove(key, guard);
                return Some(key);
            }
            cur = node.next[0].load(Ordering::Acquire, guard).with_tag(0);
        }
        None
    }
}

impl Drop for SprayList {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let head = &*self.inner.head as *const Node<AtomicU8>;
            let mut curr = self.padding_head.load(Ordering::Relaxed, guard);
            while curr.as_raw() != head {
                let next = curr.deref().next[0].load(Ordering::Relaxed, guard);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn config_follows_paper_formulas() {
        let config = SprayConfig::for_threads(8);
        assert_eq!(config.start_height, 4);
        assert_eq!(config.max_jump, 4);
        assert_eq!(config.descend_amount, 1);
        assert_eq!(config.padding_amount, 12);

        // One popper keeps the log argument clamped at 2.
        let solo = SprayConfig::for_threads(1);
        assert_eq!(solo.start_height, 1);
        assert_eq!(solo.padding_amount, 0);
    }

    #[test]
    fn pop_returns_small_keys_single_threaded() {
        let queue = SprayList::new(1);
        let seed = &mut 0xc0ffeeu64;
        let guard = &epoch::pin();

        for key in [5i64, 1, 9, 3, 7] {
            assert!(queue.add(seed, key, guard));
        }
        let mut popped = Vec::new();
        while popped.len() < 5 {
            if let Some(key) = queue.pop_min(seed, guard) {
                popped.push(key);
            }
        }
        popped.sort_unstable();
        assert_eq!(popped, vec![1, 3, 5, 7, 9]);
        assert_eq!(queue.pop_min(seed, guard), None);
    }

    #[test]
    fn remove_and_duplicate_semantics() {
        let queue = SprayList::new(2);
        let seed = &mut 0x1badu64;
        let guard = &epoch::pin();

        assert!(queue.add(seed, 4, guard));
        assert!(!queue.add(seed, 4, guard));
        assert!(queue.remove(4, guard));
        assert!(!queue.remove(4, guard));
        assert_eq!(queue.pop_min(seed, guard), None);
    }

    #[test]
    fn four_threads_pop_everything_once() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 1000;
        let queue = SprayList::new(THREADS as u64);

        crossbeam_utils::thread::scope(|s| {
            for t in 0..THREADS {
                let queue = &queue;
                s.spawn(move |_| {
                    let seed = &mut (0x5eed_0000 + t as u64);
                    for i in 0..PER_THREAD {
                        assert!(queue.add(seed, t * PER_THREAD + i + 1, &epoch::pin()));
                    }
                });
            }
        })
        .unwrap();

        let mut popped = std::collections::HashSet::new();
        crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let queue = &queue;
                    s.spawn(move |_| {
                        let seed = &mut (0xdead_0000 + t as u64);
                        let mut keys = Vec::new();
                        // A spray can overshoot every surviving key, so a
                        // `None` here only means "missed"; retry until this
                        // thread has claimed its share of the supply.
                        while keys.len() < PER_THREAD as usize {
                            if let Some(key) = queue.pop_min(seed, &epoch::pin()) {
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

        assert_eq!(popped.len(), (THREADS * PER_THREAD) as usize);
        let guard = &epoch::pin();
        assert_eq!(queue.pop_min(&mut 3u64, guard), None);
    }
}
