//! Lindén–Jonsson relaxed priority queue.
//!
//! A fixed-height skip list whose `pop_min` claims nodes by setting the
//! delete bit on the predecessor's bottom pointer with a fetch-or, leaving
//! claimed nodes linked. Once a pop walks further than `boundoffset` nodes
//! past the head it swings `head.next[0]` over the consumed prefix in one
//! CAS and repairs the upper head pointers with `restructure`. Quiescently
//! consistent rather than linearizable.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::rng::random_level;

const HEIGHT: usize = 20;

const INSERT_PENDING: u8 = 0;
const INSERTED: u8 = 1;

struct Node {
    key: i64,
    toplevel: usize,
    insert_state: AtomicU8,
    next: [Atomic<Node>; HEIGHT],
}

impl Node {
    fn new(key: i64, toplevel: usize, insert_state: u8) -> Self {
        Self {
            key,
            toplevel,
            insert_state: AtomicU8::new(insert_state),
            next: std::array::from_fn(|_| Atomic::null()),
        }
    }
}

pub struct LindenJonssonQueue {
    boundoffset: u32,
    head: Box<Node>,
    tail: Box<Node>,
}

unsafe impl Send for LindenJonssonQueue {}
unsafe impl Sync for LindenJonssonQueue {}

impl LindenJonssonQueue {
    pub fn new(boundoffset: u32) -> Self {
        let head = Box::new(Node::new(i64::MIN, HEIGHT - 1, INSERTED));
        let tail = Box::new(Node::new(i64::MAX, HEIGHT - 1, INSERTED));
        let tail_ptr = Shared::from(&*tail as *const Node);
        for level in 0..HEIGHT {
            head.next[level].store(tail_ptr, Ordering::Relaxed);
        }
        Self {
            boundoffset,
            head,
            tail,
        }
    }

    fn head_ptr(&self) -> Shared<'_, Node> {
        Shared::from(&*self.head as *const Node)
    }

    /// Like the plain skip-list search but without physical splicing: claimed
    /// nodes (marked bottom pointer) are skipped, and the deepest node whose
    /// own link was observed claimed at the bottom level is reported so the
    /// insert can tell a mid-deletion predecessor from a stable one.
    fn locate_preds<'g>(
        &'g self,
        key: i64,
        preds: &mut [Shared<'g, Node>; HEIGHT],
        succs: &mut [Shared<'g, Node>; HEIGHT],
        guard: &'g Guard,
    ) -> Shared<'g, Node> {
        let mut del = Shared::null();
        let mut cur = self.head_ptr();
        for level in (0..HEIGHT).rev() {
            let mut raw = unsafe { cur.deref() }.next[level].load(Ordering::Acquire, guard);
            let mut deleted = raw.tag() != 0;
            let mut next = raw.with_tag(0);
            loop {
                let next_node = unsafe { next.deref() };
                let next_claimed =
                    next_node.next[0].load(Ordering::Acquire, guard).tag() != 0;
                if !(next_node.key < key || next_claimed || (level == 0 && deleted)) {
                    break;
                }
                if level == 0 && deleted {
                    del = next;
                }
                cur = next;
                raw = next_node.next[level].load(Ordering::Acquire, guard);
                deleted = raw.tag() != 0;
                next = raw.with_tag(0);
            }
            preds[level] = cur;
            succs[level] = next;
        }
        del
    }

    /// Inserts `key`. Upper levels are best-effort routing: linking stops as
    /// soon as the new node or its successor is observed claimed, or the
    /// successor is the deletion-in-progress node seen during the search.
    pub fn add(&self, seed: &mut u64, key: i64, guard: &Guard) -> bool {
        debug_assert!(key != i64::MIN && key != i64::MAX);
        let toplevel = random_level(seed, HEIGHT);
        let preds = &mut [Shared::null(); HEIGHT];
        let succs = &mut [Shared::null(); HEIGHT];
        let mut node: Option<Owned<Node>> = None;

        let published = 'publish: loop {
            let mut del = self.locate_preds(key, preds, succs, guard);
            let pred0 = unsafe { preds[0].deref() }.next[0].load(Ordering::Acquire, guard);
            if unsafe { succs[0].deref() }.key == key && pred0.tag() == 0 && pred0 == succs[0] {
                drop(node);
                return false;
            }

            let new_node = node
                .take()
                .unwrap_or_else(|| Owned::new(Node::new(key, toplevel, INSERT_PENDING)));
            for level in 0..=toplevel {
                new_node.next[level].store(succs[level], Ordering::Relaxed);
            }
            let published = match unsafe { preds[0].deref() }.next[0].compare_exchange(
                succs[0],
                new_node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(published) => published,
                Err(e) => {
                    node = Some(e.new);
                    continue;
                }
            };
            let node_ref = unsafe { published.deref() };

            for level in 1..=toplevel {
                if node_ref.next[0].load(Ordering::Acquire, guard).tag() != 0
                    || unsafe { succs[level].deref() }.next[0]
                        .load(Ordering::Acquire, guard)
                        .tag()
                        != 0
                    || succs[level] == del
                {
                    break 'publish published;
                }
                node_ref.next[level].store(succs[level], Ordering::Release);
                if unsafe { preds[level].deref() }.next[level]
                    .compare_exchange(
                        succs[level],
                        published,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    )
                    .is_err()
                {
                    del = self.locate_preds(key, preds, succs, guard);
                    if succs[0] != published {
                        break 'publish published;
                    }
                }
            }
            break published;
        };

        unsafe { published.deref() }
            .insert_state
            .store(INSERTED, Ordering::Release);
        true
    }

    /// Advances each upper head pointer past its leading run of claimed
    /// nodes, one CAS per level, top down. Opportunistic: any pop may run it.
    fn restructure(&self, guard: &Guard) {
        let mut pred = self.head_ptr();
        let mut level = HEIGHT - 1;
        while level > 0 {
            let observed = self.head.next[level].load(Ordering::Acquire, guard);
            let mut cur = unsafe { pred.deref() }.next[level].load(Ordering::Acquire, guard);
            if unsafe { observed.deref() }.next[0]
                .load(Ordering::Acquire, guard)
                .tag()
                == 0
            {
                level -= 1;
                continue;
            }
            while unsafe { cur.deref() }.next[0].load(Ordering::Acquire, guard).tag() != 0 {
                pred = cur;
                cur = unsafe { pred.deref() }.next[level].load(Ordering::Acquire, guard);
            }
            if self.head.next[level]
                .compare_exchange(observed, cur, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                level -= 1;
            }
        }
    }

    /// Claims the node after the consumed prefix with a fetch-or walk. When
    /// the walk has consumed more than `boundoffset` nodes, the whole prefix
    /// is cut off in one CAS on `head.next[0]`, the upper head pointers are
    /// repaired, and the detached nodes are retired.
    pub fn pop_min(&self, guard: &Guard) -> Option<i64> {
        let tail = &*self.tail as *const Node;
        let mut offset = 0u32;
        let mut newhead = Shared::<Node>::null();
        let mut cur = self.head_ptr();
        let obs_head = self.head.next[0].load(Ordering::Acquire, guard);

        loop {
            offset += 1;
            let cur_node = unsafe { cur.deref() };
            let next = cur_node.next[0].load(Ordering::Acquire, guard);
            if next.with_tag(0).as_raw() == tail {
                return None;
            }
            if newhead.is_null() && cur_node.insert_state.load(Ordering::Acquire) == INSERT_PENDING
            {
                newhead = cur;
            }
            let next = if next.tag() != 0 {
                next
            } else {
                cur_node.next[0].fetch_or(1, Ordering::AcqRel, guard)
            };
            cur = next.with_tag(0);
            if next.tag() == 0 {
                break;
            }
        }

        let key = unsafe { cur.deref() }.key;
        if newhead.is_null() {
            newhead = cur;
        }
        if offset <= self.boundoffset {
            return Some(key);
        }
        if self.head.next[0].load(Ordering::Acquire, guard) != obs_head {
            return Some(key);
        }
        if self.head.next[0]
            .compare_exchange(
                obs_head,
                newhead.with_tag(1),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
        {
            self.restructure(guard);
            // The prefix strictly before the new head is now unreachable
            // from every level.
            let mut garbage = obs_head.with_tag(0);
            while garbage.as_raw() != newhead.as_raw() {
                let next = unsafe { garbage.deref() }.next[0]
                    .load(Ordering::Relaxed, guard)
                    .with_tag(0);
                unsafe { guard.defer_destroy(garbage) };
                garbage = next;
            }
        }
        Some(key)
    }
}

impl Drop for LindenJonssonQueue {
    fn drop(&mut self) {
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let tail = &*self.tail as *const Node;
            let mut curr = self.head.next[0].load(Ordering::Relaxed, guard).with_tag(0);
            while curr.as_raw() != tail {
                let next = curr.deref().next[0].load(Ordering::Relaxed, guard).with_tag(0);
                drop(curr.into_owned());
                curr = next;
            }
        }
    }
}
