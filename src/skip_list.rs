//! Fixed-height lock-free skip list over `i64` keys.
//!
//! The tower height is a build-time constant; every node carries a full
//! `next` array and a `toplevel` bounding the levels actually linked. The
//! low bit of a `next` pointer marks the logical deletion of the node that
//! owns the pointer. The node payload is generic so the priority-queue
//! variants can graft their per-node state onto the same spine.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

use crate::rng::random_level;

pub(crate) const HEIGHT: usize = 20;

pub(crate) struct Node<A> {
    pub(crate) key: i64,
    pub(crate) toplevel: usize,
    pub(crate) aux: A,
    pub(crate) next: [Atomic<Node<A>>; HEIGHT],
}

impl<A> Node<A> {
    pub(crate) fn new(key: i64, toplevel: usize, aux: A) -> Self {
        Self {
            key,
            toplevel,
            aux,
            next: std::array::from_fn(|_| Atomic::null()),
        }
    }
}

/// Fixed-height skip list; `SkipList<()>` is the plain concurrent set.
///
/// The head and tail sentinels hold the reserved `i64::MIN`/`i64::MAX` keys
/// and are heap-pinned so nodes may keep raw references to them across moves
/// of the owning struct.
pub struct SkipList<A = ()> {
    pub(crate) head: Box<Node<A>>,
    pub(crate) tail: Box<Node<A>>,
}

unsafe impl<A: Send> Send for SkipList<A> {}
unsafe impl<A: Send + Sync> Sync for SkipList<A> {}

impl<A: Default> Default for SkipList<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Default> SkipList<A> {
    pub fn new() -> Self {
        let head = Box::new(Node::new(i64::MIN, HEIGHT - 1, A::default()));
        let tail = Box::new(Node::new(i64::MAX, HEIGHT - 1, A::default()));
        let tail_ptr = Shared::from(&*tail as *const Node<A>);
        for level in 0..HEIGHT {
            head.next[level].store(tail_ptr, Ordering::Relaxed);
        }
        Self { head, tail }
    }
}

impl<A> SkipList<A> {
    pub(crate) fn tail_ptr(&self) -> *const Node<A> {
        &*self.tail as *const _
    }

    /// Wait-free membership probe: descend following unmarked references and
    /// report whether the resting node holds `key` and is itself unmarked.
    pub fn contains(&self, key: i64, guard: &Guard) -> bool {
        let mut node = &*self.head;
        for level in (0..HEIGHT).rev() {
            let mut next = node.next[level].load(Ordering::Acquire, guard).with_tag(0);
            while unsafe { next.deref() }.key <= key {
                node = unsafe { next.deref() };
                next = node.next[level].load(Ordering::Acquire, guard).with_tag(0);
            }
            if node.key == key {
                return node.next[0].load(Ordering::Acquire, guard).tag() == 0;
            }
        }
        false
    }

    /// Positions `preds`/`succs` around `key` at every level, physically
    /// splicing out any marked node met on the way. A failed splice CAS
    /// restarts the whole search from the head.
    pub(crate) fn find<'g>(
        &'g self,
        key: i64,
        preds: &mut [Shared<'g, Node<A>>; HEIGHT],
        succs: &mut [Shared<'g, Node<A>>; HEIGHT],
        guard: &'g Guard,
    ) -> bool {
        'retry: loop {
            let mut pred = Shared::from(&*self.head as *const Node<A>);
            for level in (0..HEIGHT).rev() {
                let mut curr = unsafe { pred.deref() }.next[level]
                    .load(Ordering::Acquire, guard)
                    .with_tag(0);
                loop {
                    let mut succ = unsafe { curr.deref() }.next[level].load(Ordering::Acquire, guard);
                    while succ.tag() != 0 {
                        // curr is logically deleted here: unlink it from this level.
                        if unsafe { pred.deref() }.next[level]
                            .compare_exchange(
                                curr,
                                succ.with_tag(0),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_err()
                        {
                            continue 'retry;
                        }
                        curr = unsafe { pred.deref() }.next[level]
                            .load(Ordering::Acquire, guard)
                            .with_tag(0);
                        succ = unsafe { curr.deref() }.next[level].load(Ordering::Acquire, guard);
                    }
                    if unsafe { curr.deref() }.key < key {
                        pred = curr;
                        curr = succ.with_tag(0);
                    } else {
                        break;
                    }
                }
                preds[level] = pred;
                succs[level] = curr;
            }
            return unsafe { succs[0].deref() }.key == key;
        }
    }

    /// Inserts a node carrying `aux`; the tower height is drawn from `seed`.
    ///
    /// Upper levels are stitched after the level-0 publication; stitching is
    /// abandoned once the node is observed marked or displaced, so a racing
    /// removal can retire it without waiting for the full tower.
    pub(crate) fn insert_with<'g>(
        &'g self,
        seed: &mut u64,
        key: i64,
        aux: A,
        guard: &'g Guard,
    ) -> bool {
        debug_assert!(key != i64::MIN && key != i64::MAX);
        let toplevel = random_level(seed, HEIGHT);
        let preds = &mut [Shared::null(); HEIGHT];
        let succs = &mut [Shared::null(); HEIGHT];
        let mut aux = Some(aux);
        let mut node: Option<Owned<Node<A>>> = None;

        let published = loop {
            if self.find(key, preds, succs, guard) {
                // Present already; a pending allocation was never linked.
                drop(node);
                return false;
            }
            let new_node = node
                .take()
                .unwrap_or_else(|| Owned::new(Node::new(key, toplevel, aux.take().unwrap())));
            for level in 0..=toplevel {
                new_node.next[level].store(succs[level], Ordering::Relaxed);
            }
            match unsafe { preds[0].deref() }.next[0].compare_exchange(
                succs[0],
                new_node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(published) => break published,
                Err(e) => node = Some(e.new),
            }
        };

        let node_ref = unsafe { published.deref() };
        for level in 1..=toplevel {
            loop {
                let forward = node_ref.next[level].load(Ordering::Acquire, guard);
                if forward.tag() != 0 || node_ref.next[0].load(Ordering::Acquire, guard).tag() != 0
                {
                    // A remover claimed the node; leave the tower partial.
                    return true;
                }
                if forward != succs[level]
                    && node_ref.next[level]
                        .compare_exchange(
                            forward,
                            succs[level],
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_err()
                {
                    continue;
                }
                if unsafe { preds[level].deref() }.next[level]
                    .compare_exchange(
                        succs[level],
                        published,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_ok()
                {
                    if node_ref.next[0].load(Ordering::Acquire, guard).tag() != 0 {
                        // The link raced with a removal whose unlink pass may
                        // have already run; splice the fresh link back out.
                        self.find(key, preds, succs, guard);
                        return true;
                    }
                    break;
                }
                self.find(key, preds, succs, guard);
                if succs[0] != published {
                    return true;
                }
            }
        }
        true
    }

    /// Marks the victim bottom-up-to-1 then claims level 0; the winning
    /// marker unlinks the whole tower via `find` and retires the node.
    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        let preds = &mut [Shared::null(); HEIGHT];
        let succs = &mut [Shared::null(); HEIGHT];
        if !self.find(key, preds, succs, guard) {
            return false;
        }
        let node = succs[0];
        let node_ref = unsafe { node.deref() };
        for level in (1..=node_ref.toplevel).rev() {
            node_ref.next[level].fetch_or(1, Ordering::AcqRel, guard);
        }
        let prev = node_ref.next[0].fetch_or(1, Ordering::AcqRel, guard);
        if prev.tag() != 0 {
            return false;
        }
        self.find(key, preds, succs, guard);
        unsafe { guard.defer_destroy(node) };
        true
    }
}

impl SkipList<()> {
    pub fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool {
        self.insert_with(seed, key, (), guard)
    }
}

impl crate::concurrent_set::ConcurrentSet for SkipList {
    fn new() -> Self {
        Self::new()
    }

    #[inline(always)]
    fn contains(&self, key: i64, guard: &Guard) -> bool {
        self.contains(key, guard)
    }

    #[inline(always)]
    fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool {
        self.add(seed, key, guard)
    }

    #[inline(always)]
    fn remove(&self, key: i64, guard: &Guard) -> bool {
        self.remove(key, guard)
    }
}

impl<A> Drop for SkipList<A> {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let tail = self.tail_ptr();
            let mut curr = self.head.next[0].load(Ordering::Relaxed, guard).with_tag(0);
            while curr.as_raw() != tail {
                let next = curr.deref().next[0].load(Ordering::Relaxed, guard).with_tag(0);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent_set;
    use crossbeam_epoch as epoch;

    #[test]
    fn add_remove_contains() {
        let set = SkipList::<()>::new();
        let seed = &mut 0x1234_5678_9abc_def0u64;
        let guard = &epoch::pin();

        assert!(set.add(seed, 10, guard));
        assert!(!set.add(seed, 10, guard));
        assert!(set.contains(10, guard));
        assert!(set.remove(10, guard));
        assert!(!set.remove(10, guard));
        assert!(!set.contains(10, guard));
    }

    #[test]
    fn bottom_level_stays_sorted() {
        let set = SkipList::<()>::new();
        let seed = &mut 42u64;
        let guard = &epoch::pin();
        for key in [7i64, 3, 11, 1, 9, 5, 2, 8] {
            assert!(set.add(seed, key, guard));
        }
        assert!(set.remove(9, guard));
        assert!(set.remove(1, guard));

        let mut keys = Vec::new();
        let mut curr = set.head.next[0].load(Ordering::Acquire, guard).with_tag(0);
        while curr.as_raw() != set.tail_ptr() {
            let node = unsafe { curr.deref() };
            if node.next[0].load(Ordering::Acquire, guard).tag() == 0 {
                keys.push(node.key);
            }
            curr = node.next[0].load(Ordering::Acquire, guard).with_tag(0);
        }
        assert_eq!(keys, vec![2, 3, 5, 7, 8, 11]);
    }

    #[test]
    fn two_threads_interleaved_ranges() {
        let set = SkipList::<()>::new();
        crossbeam_utils::thread::scope(|s| {
            for parity in 0..2i64 {
                let set = &set;
                s.spawn(move |_| {
                    let seed = &mut (0x9e37_79b9 + parity as u64);
                    for key in (1..=1000i64).filter(|k| k % 2 == parity) {
                        assert!(set.add(seed, key, &epoch::pin()));
                    }
                });
            }
        })
        .unwrap();

        let guard = &epoch::pin();
        for key in 1..=1000 {
            assert!(set.contains(key, guard));
        }
        assert!(!set.contains(0, guard));
        assert!(!set.contains(1001, guard));
    }

    #[test]
    fn smoke_skip_list() {
        concurrent_set::tests::smoke::<SkipList>();
    }
}
