//! Michael–Harris hash set: a fixed array of lock-free sorted-list buckets.
//!
//! The table never resizes; a bucket is picked by the key's unsigned value
//! modulo the array length and all the heavy lifting happens in the shared
//! list primitive.

use crossbeam_epoch::{Atomic, Guard, Owned};

use crate::list;

pub struct MichaelHashSet {
    buckets: Box<[Atomic<list::Node>]>,
}

impl MichaelHashSet {
    pub fn with_size(size: usize) -> Self {
        assert!(size > 0);
        let buckets = (0..size).map(|_| Atomic::null()).collect();
        Self { buckets }
    }

    fn bucket(&self, key: i64) -> &Atomic<list::Node> {
        let index = (key as u64 % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    pub fn contains(&self, key: i64, guard: &Guard) -> bool {
        list::contains(self.bucket(key), key as u64, guard)
    }

    pub fn add(&self, key: i64, guard: &Guard) -> bool {
        let node = Owned::new(list::Node::new(key as u64));
        match list::add(self.bucket(key), node, guard) {
            Ok(_) => true,
            Err((node, _)) => {
                // Key already present; the allocation was never linked.
                drop(node);
                false
            }
        }
    }

    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        list::remove(self.bucket(key), key as u64, guard)
    }
}

impl crate::concurrent_set::ConcurrentSet for MichaelHashSet {
    fn new() -> Self {
        Self::with_size(1 << 10)
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

impl Drop for MichaelHashSet {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            unsafe { list::drop_chain(bucket) };
        }
    }
}
