//! Lock-free external binary search tree with edge flagging and tagging.
//!
//! All live keys sit in leaves; routing nodes carry a duplicated key used
//! only to steer the descent. A removal flags the edge to its leaf, then
//! splices the doomed parent out by swinging the deepest untagged ancestor
//! edge; the tag bit freezes the sibling edge so no insert can slip a child
//! under the parent while it is being unlinked. Any thread that trips over
//! a flagged or tagged edge helps finish the removal before retrying.

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::{AtomicBool, Ordering};

bitflags! {
    /// Status bits carried in the low bits of a child edge. The flag marks
    /// the edge to a logically removed leaf; the tag marks an edge into a
    /// subtree whose parent is being unlinked.
    struct Marks: usize {
        const FLAG = 0b01;
        const TAG = 0b10;
    }
}

impl Marks {
    fn flag(self) -> bool {
        self.contains(Marks::FLAG)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Leaf,
    Routing,
    Special,
}

struct Node {
    key: i64,
    state: NodeState,
    retired: AtomicBool,
    left: Atomic<Node>,
    right: Atomic<Node>,
}

impl Node {
    fn new(key: i64, state: NodeState) -> Self {
        Self {
            key,
            state,
            retired: AtomicBool::new(false),
            left: Atomic::null(),
            right: Atomic::null(),
        }
    }

    /// First claim wins; a node reaches the reclamation collaborator once.
    fn mark_retired(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    fn child(&self, key: i64) -> &Atomic<Node> {
        if key < self.key {
            &self.left
        } else {
            &self.right
        }
    }
}

/// Path snapshot naming the CAS targets for a removal: `ancestor` is the
/// deepest node whose outgoing edge to `successor` was seen untagged,
/// `parent` is the direct parent of the terminal `leaf`.
struct SeekRecord<'g> {
    ancestor: Shared<'g, Node>,
    successor: Shared<'g, Node>,
    parent: Shared<'g, Node>,
    leaf: Shared<'g, Node>,
}

enum RemoveMode {
    Injection,
    Cleanup,
}

pub struct NMTree {
    r: Atomic<Node>,
}

impl Default for NMTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NMTree {
    /// The empty tree carries a fixed sentinel prefix (root, pseudo-root and
    /// two dummy leaves) so every seek ends with a well-defined parent/leaf
    /// pair.
    pub fn new() -> Self {
        let s = Node::new(i64::MAX - 1, NodeState::Special);
        s.left.store(
            Owned::new(Node::new(i64::MAX - 2, NodeState::Special)),
            Ordering::Relaxed,
        );
        s.right.store(
            Owned::new(Node::new(i64::MAX - 1, NodeState::Special)),
            Ordering::Relaxed,
        );
        let r = Node::new(i64::MAX, NodeState::Special);
        r.left.store(Owned::new(s), Ordering::Relaxed);
        NMTree {
            r: Atomic::new(r),
        }
    }

    fn seek<'g>(&'g self, key: i64, guard: &'g Guard) -> SeekRecord<'g> {
        let r = self.r.load(Ordering::Acquire, guard);
        let s = unsafe { r.deref() }.left.load(Ordering::Acquire, guard).with_tag(0);
        let leaf_edge = unsafe { s.deref() }.left.load(Ordering::Acquire, guard);
        let leaf = leaf_edge.with_tag(0);

        let mut record = SeekRecord {
            ancestor: r,
            successor: s,
            parent: s,
            leaf,
        };
        let mut parent_edge = leaf_edge;
        let mut current_edge = unsafe { leaf.deref() }
            .child(key)
            .load(Ordering::Acquire, guard);
        let mut current = current_edge.with_tag(0);

        while !current.is_null() {
            if !Marks::from_bits_truncate(parent_edge.tag()).contains(Marks::TAG) {
                record.ancestor = record.parent;
                record.successor = record.leaf;
            }
            record.parent = record.leaf;
            record.leaf = current;
            parent_edge = current_edge;
            current_edge = unsafe { current.deref() }
                .child(key)
                .load(Ordering::Acquire, guard);
            current = current_edge.with_tag(0);
        }
        record
    }

    /// Splices out the parent of the flagged leaf by swinging the ancestor's
    /// untagged edge straight to the leaf's sibling. Returns whether this
    /// call performed the splice; the winner retires the unlinked pair.
    fn cleanup(&self, key: i64, record: &SeekRecord<'_>, guard: &Guard) -> bool {
        let ancestor = unsafe { record.ancestor.deref() };
        let successor_addr = ancestor.child(key);
        let parent = unsafe { record.parent.deref() };
        debug_assert!(parent.state != NodeState::Leaf);

        let (child_addr, mut sibling_addr) = if key < parent.key {
            (&parent.left, &parent.right)
        } else {
            (&parent.right, &parent.left)
        };
        let child = child_addr.load(Ordering::Acquire, guard);
        if !Marks::from_bits_truncate(child.tag()).flag() {
            // The actual flagged edge is the sibling's; swap roles.
            sibling_addr = child_addr;
        }

        // Freeze the sibling edge so nothing is inserted below the doomed
        // parent, then carry the sibling's flag over to the new edge.
        sibling_addr.fetch_or(Marks::TAG.bits(), Ordering::AcqRel, guard);
        let sibling = sibling_addr.load(Ordering::Acquire, guard);
        let flag = Marks::from_bits_truncate(sibling.tag()).flag();
        let new_edge = sibling.with_tag(if flag { Marks::FLAG.bits() } else { 0 });

        let unlinked = successor_addr
            .compare_exchange(
                record.successor.with_tag(0),
                new_edge,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok();
        if unlinked {
            if unsafe { record.leaf.deref() }.mark_retired() {
                unsafe { guard.defer_destroy(record.leaf) };
            }
            if parent.mark_retired() {
                unsafe { guard.defer_destroy(record.parent) };
            }
        }
        unlinked
    }

    pub fn contains(&self, key: i64, guard: &Guard) -> bool {
        let record = self.seek(key, guard);
        unsafe { record.leaf.deref() }.key == key
    }

    pub fn add(&self, key: i64, guard: &Guard) -> bool {
        debug_assert!(key < i64::MAX - 2);
        loop {
            let record = self.seek(key, guard);
            let leaf = record.leaf;
            let leaf_key = unsafe { leaf.deref() }.key;
            if leaf_key == key {
                return false;
            }

            let parent = unsafe { record.parent.deref() };
            let child_addr = parent.child(key);

            // A fresh leaf plus a routing node over it and the resident
            // leaf, ordered by key; the routing key is the larger of the two.
            let new_leaf = Owned::new(Node::new(key, NodeState::Leaf)).into_shared(guard);
            let routing = Node::new(key.max(leaf_key), NodeState::Routing);
            if key < leaf_key {
                routing.left.store(new_leaf, Ordering::Relaxed);
                routing.right.store(leaf, Ordering::Relaxed);
            } else {
                routing.left.store(leaf, Ordering::Relaxed);
                routing.right.store(new_leaf, Ordering::Relaxed);
            }

            match child_addr.compare_exchange(
                leaf.with_tag(0),
                Owned::new(routing),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => {
                    // Neither node was published; release them and help any
                    // removal that got in the way.
                    drop(e.new);
                    unsafe { drop(new_leaf.into_owned()) };
                    if e.current.with_tag(0) == leaf && e.current.tag() != 0 {
                        self.cleanup(key, &record, guard);
                    }
                }
            }
        }
    }

    pub fn remove(&self, key: i64, guard: &Guard) -> bool {
        let mut mode = RemoveMode::Injection;
        let mut target = Shared::null();
        loop {
            let record = self.seek(key, guard);
            match mode {
                RemoveMode::Injection => {
                    let leaf = record.leaf;
                    if unsafe { leaf.deref() }.key != key {
                        return false;
                    }
                    let parent = unsafe { record.parent.deref() };
                    match parent.child(key).compare_exchange(
                        leaf.with_tag(0),
                        leaf.with_tag(Marks::FLAG.bits()),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        guard,
                    ) {
                        Ok(_) => {
                            mode = RemoveMode::Cleanup;
                            target = leaf;
                            if self.cleanup(key, &record, guard) {
                                return true;
                            }
                        }
                        Err(e) => {
                            if e.current.with_tag(0) == leaf && e.current.tag() != 0 {
                                self.cleanup(key, &record, guard);
                            }
                        }
                    }
                }
                RemoveMode::Cleanup => {
                    if record.leaf != target {
                        // A helper finished the splice for us.
                        return true;
                    }
                    if self.cleanup(key, &record, guard) {
                        return true;
                    }
                }
            }
        }
    }
}

impl crate::concurrent_set::ConcurrentSet for NMTree {
    fn new() -> Self {
        Self::new()
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

impl Drop for NMTree {
    fn drop(&mut self) {
        unsafe fn drop_subtree(node: Shared<'_, Node>) {
            if node.is_null() {
                return;
            }
            let guard = crossbeam_epoch::unprotected();
            let node_ref = node.deref();
            drop_subtree(node_ref.left.load(Ordering::Relaxed, guard).with_tag(0));
            drop_subtree(node_ref.right.load(Ordering::Relaxed, guard).with_tag(0));
            drop(node.into_owned());
        }
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            drop_subtree(self.r.load(Ordering::Relaxed, guard).with_tag(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent_set;
    use crossbeam_epoch as epoch;

    /// In-order walk over the live leaves, skipping the sentinel prefix.
    fn leaf_keys(tree: &NMTree) -> Vec<i64> {
        fn walk(node: Shared<'_, Node>, out: &mut Vec<i64>, guard: &Guard) {
            if node.is_null() {
                return;
            }
            let node_ref = unsafe { node.deref() };
            let left = node_ref.left.load(Ordering::Acquire, guard).with_tag(0);
            let right = node_ref.right.load(Ordering::Acquire, guard).with_tag(0);
            if left.is_null() && right.is_null() {
                if node_ref.state == NodeState::Leaf {
                    out.push(node_ref.key);
                }
                return;
            }
            walk(left, out, guard);
            walk(right, out, guard);
        }
        let guard = &epoch::pin();
        let mut out = Vec::new();
        walk(tree.r.load(Ordering::Acquire, guard), &mut out, guard);
        out
    }

    #[test]
    fn seek_scenario_end_to_end() {
        let tree = NMTree::new();
        let guard = &epoch::pin();

        for key in [5i64, 3, 8, 1, 4] {
            assert!(tree.add(key, guard));
        }
        assert!(tree.contains(4, guard));
        assert!(!tree.contains(7, guard));
        assert!(tree.remove(3, guard));
        assert!(!tree.contains(3, guard));
        assert_eq!(leaf_keys(&tree), vec![1, 4, 5, 8]);
    }

    #[test]
    fn idempotent_add_remove() {
        let tree = NMTree::new();
        let guard = &epoch::pin();

        assert!(tree.add(42, guard));
        assert!(!tree.add(42, guard));
        assert!(tree.remove(42, guard));
        assert!(!tree.remove(42, guard));
        assert!(!tree.contains(42, guard));
        assert!(tree.add(42, guard));
        assert!(tree.contains(42, guard));
    }

    #[test]
    fn removing_either_child_keeps_sibling() {
        let tree = NMTree::new();
        let guard = &epoch::pin();

        assert!(tree.add(10, guard));
        assert!(tree.add(20, guard));
        assert!(tree.remove(10, guard));
        assert!(tree.contains(20, guard));
        assert!(tree.add(5, guard));
        assert!(tree.remove(20, guard));
        assert_eq!(leaf_keys(&tree), vec![5]);
    }

    #[test]
    fn in_order_leaves_stay_sorted_under_churn() {
        let tree = NMTree::new();
        let guard = &epoch::pin();
        for key in [13i64, 7, 21, 3, 9, 17, 25, 1, 5, 11, 15] {
            assert!(tree.add(key, guard));
        }
        for key in [7i64, 25, 1, 13] {
            assert!(tree.remove(key, guard));
        }
        let keys = leaf_keys(&tree);
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
        assert_eq!(keys, vec![3, 5, 9, 11, 15, 17, 21]);
    }

    #[test]
    fn smoke_nm_tree() {
        concurrent_set::tests::smoke::<NMTree>();
    }
}
