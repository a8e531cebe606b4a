//! Shalev–Shavit split-ordered hash set.
//!
//! One sorted lock-free list holds every node, ordered by bit-reversed
//! keys; real keys get their low bit set so each bucket's dummy node sorts
//! just before the bucket's members. A fixed pointer table gives O(1) entry
//! into the list, and missing dummies are created lazily by recursing to
//! the bucket's parent (clear the lowest set bit of the reversed index).
//! The table never grows; the load factor is only observed.

use crossbeam_epoch::{Atomic, Guard, Owned};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::list;

fn regular_key(key: i64) -> u64 {
    (key as u64).reverse_bits() | 1
}

fn dummy_key(bucket: u64) -> u64 {
    bucket.reverse_bits()
}

/// Parent bucket: drop the lowest set bit of the bit-reversed index.
fn parent_bucket(bucket: u64) -> u64 {
    let reversed = bucket.reverse_bits();
    (reversed & reversed.wrapping_sub(1)).reverse_bits()
}

pub struct SplitOrderedSet {
    max_load: u64,
    count: AtomicU64,
    table: Box<[Atomic<list::Node>]>,
}

impl SplitOrderedSet {
    pub fn with_size(size: usize, max_load: u64) -> Self {
        assert!(size > 0);
        let table: Box<[Atomic<list::Node>]> = (0..size).map(|_| Atomic::null()).collect();
        // Bucket 0 anchors the whole list and exists from the start.
        table[0].store(Owned::new(list::Node::new(dummy_key(0))), Ordering::Relaxed);
        Self {
            max_load,
            count: AtomicU64::new(0),
            table,
        }
    }

    fn bucket(&self, key: i64) -> u64 {
        key as u64 % self.table.len() as u64
    }

    /// Makes sure `table[bucket]` points at a linked dummy node, recursing
    /// through the parent chain first. Losing the dummy-insert race just
    /// adopts the winner's node.
    fn initialise_bucket(&self, bucket: u64, guard: &Guard) {
        let parent = parent_bucket(bucket);
        if self.table[parent as usize]
            .load(Ordering::Acquire, guard)
            .is_null()
        {
            self.initialise_bucket(parent, guard);
        }
        let dummy = Owned::new(list::Node::new(dummy_key(bucket)));
        let published = match list::add(&self.table[parent as usize], dummy, guard) {
            Ok(published) => published,
            Err((dummy, existing)) => {
                drop(dummy);
                existing
            }
        };
        self.table[bucket as usize].store(published, Ordering::Release);
    }

    fn bucket_head(&self, key: i64, guard: &Guard) -> &Atomic<list::Node> {
        let bucket = self.bucket(key);
        if self.table[bucket as usize]
            .load(Ordering::Acquire, guard)
            .is_null()
        {
            self.initialise_bucket(bucket, guard);
        }
        &self.table[bucket as usize]
    }

    pub fn contains(&self, key: i64, guard: &Guard) -> bool {
        debug_assert!(key != 0);
        list::contains(self.bucket_head(key, guard), regular_key(key), guard)
    }

    pub fn add(&self, key: i64, guard: &Guard) -> bool {
        debug_assert!(key != 0);
        let node = Owned::new(list::Node::new(regular_key(key)));
        let head = self.bucket_head(key, guard);
        match list::add(head, node, guard) {
            Ok(_) => {
                let size = self.table.len() as u64;
                if self.count.fetch_add(1, Ordering::Relaxed) / size > self.max_load {
                    // TODO: grow the table once a resize protocol lands; the
                    // load factor is only observed for now.
                }
                true
            }
            Err((node, _)) => {
                drop(node);
                false
            }
        }
    }

    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        debug_assert!(key != 0);
        if !list::remove(self.bucket_head(key, guard), regular_key(key), guard) {
            return false;
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }
}

impl crate::concurrent_set::ConcurrentSet for SplitOrderedSet {
    fn new() -> Self {
        Self::with_size(1 << 10, 4)
    }

    #[inline(always)]
    fn contains(&self, key: i64, guard: &Guard) -> bool {
        self.contains(key, guard)
    }

    #[inline(always)]
    fn add(&self, _seed: &mut u64, key: i64, guard: &Guard) -> bool {
        self.add(key, guard)
    }

    #[inline(always)]
    fn remove(&self, key: i64, guard: &Guard) -> bool {
        self.remove(key, guard)
    }
}

impl Drop for SplitOrderedSet {
    fn drop(&mut self) {
        // Every node, dummies included, is reachable from the bucket-0 chain.
        unsafe { list::drop_chain(&self.table[0]) };
    }
}
