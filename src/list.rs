//! Sorted lock-free singly-linked list with Michael-style logical deletion.
//!
//! Shared backbone of the two hash tables: each bucket (or the whole
//! split-order table) is one of these lists. Keys are compared as unsigned
//! so the bit-reversed split-order keys sort correctly. The low bit of a
//! node's own `next` field is the logical-delete mark of that node.

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

pub(crate) struct Node {
    pub(crate) key: u64,
    pub(crate) next: Atomic<Node>,
}

impl Node {
    pub(crate) fn new(key: u64) -> Self {
        Self {
            key,
            next: Atomic::null(),
        }
    }
}

/// Snapshot of the search position: `prev` is the slot that held `curr`,
/// `next` is `curr`'s successor at observation time.
pub(crate) struct View<'g> {
    pub(crate) prev: &'g Atomic<Node>,
    pub(crate) curr: Shared<'g, Node>,
    pub(crate) next: Shared<'g, Node>,
}

/// Walks `head` for `key`, splicing out marked nodes along the way.
///
/// Returns whether the key is present and the view positioned at the first
/// unmarked node with key >= `key` (or the null end of the list).
pub(crate) fn find<'g>(head: &'g Atomic<Node>, key: u64, guard: &'g Guard) -> (bool, View<'g>) {
    'retry: loop {
        let mut view = View {
            prev: head,
            curr: head.load(Ordering::Acquire, guard),
            next: Shared::null(),
        };

        loop {
            let curr_node = match unsafe { view.curr.as_ref() } {
                None => return (false, view),
                Some(node) => node,
            };
            view.next = curr_node.next.load(Ordering::Acquire, guard);

            // The slot we came through must still hold curr, otherwise the
            // snapshot is stale and the whole search restarts.
            if view.prev.load(Ordering::Acquire, guard) != view.curr {
                continue 'retry;
            }

            if view.next.tag() == 0 {
                if curr_node.key >= key {
                    return (curr_node.key == key, view);
                }
                view.prev = &curr_node.next;
            } else {
                // curr is logically deleted: splice it out or restart.
                let next = view.next.with_tag(0);
                match view
                    .prev
                    .compare_exchange(view.curr, next, Ordering::AcqRel, Ordering::Acquire, guard)
                {
                    Ok(_) => unsafe { guard.defer_destroy(view.curr) },
                    Err(_) => continue 'retry,
                }
            }
            view.curr = view.next.with_tag(0);
        }
    }
}

/// Links `node` into the sorted position for its key.
///
/// On success returns the published pointer. If the key is already present,
/// hands the allocation back together with the resident node so the caller
/// can release or adopt it.
pub(crate) fn add<'g>(
    head: &'g Atomic<Node>,
    mut node: Owned<Node>,
    guard: &'g Guard,
) -> Result<Shared<'g, Node>, (Owned<Node>, Shared<'g, Node>)> {
    let key = node.key;
    loop {
        let (found, view) = find(head, key, guard);
        if found {
            return Err((node, view.curr));
        }
        node.next.store(view.curr, Ordering::Relaxed);
        match view
            .prev
            .compare_exchange(view.curr, node, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            Ok(new) => return Ok(new),
            Err(e) => node = e.new,
        }
    }
}

/// Marks the resident node for `key` and attempts one physical splice.
///
/// The splice may be finished by a helping `find`; the logical mark alone
/// decides the return value.
pub(crate) fn remove(head: &Atomic<Node>, key: u64, guard: &Guard) -> bool {
    loop {
        let (found, view) = find(head, key, guard);
        if !found {
            return false;
        }
        let curr_node = unsafe { view.curr.deref() };
        let next = curr_node.next.fetch_or(1, Ordering::AcqRel, guard);
        if next.tag() != 0 {
            // Lost the mark race; the key may be gone or reinserted.
            continue;
        }
        if view
            .prev
            .compare_exchange(view.curr, next, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            unsafe { guard.defer_destroy(view.curr) };
        } else {
            let _ = find(head, key, guard);
        }
        return true;
    }
}

pub(crate) fn contains(head: &Atomic<Node>, key: u64, guard: &Guard) -> bool {
    find(head, key, guard).0
}

/// Frees every node of a chain. Caller must guarantee no concurrent access.
pub(crate) unsafe fn drop_chain(head: &Atomic<Node>) {
    let guard = crossbeam_epoch::unprotected();
    let mut curr = head.load(Ordering::Relaxed, guard).with_tag(0);
    while let Some(node) = curr.as_ref() {
        let next = node.next.load(Ordering::Relaxed, guard).with_tag(0);
        drop(curr.into_owned());
        curr = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn add_remove_roundtrip() {
        let head = Atomic::null();
        let guard = &epoch::pin();

        assert!(add(&head, Owned::new(Node::new(5)), guard).is_ok());
        assert!(add(&head, Owned::new(Node::new(3)), guard).is_ok());
        assert!(add(&head, Owned::new(Node::new(7)), guard).is_ok());
        assert!(contains(&head, 3, guard));
        assert!(!contains(&head, 4, guard));

        // Duplicate insert surrenders the allocation.
        assert!(add(&head, Owned::new(Node::new(5)), guard).is_err());

        assert!(remove(&head, 5, guard));
        assert!(!remove(&head, 5, guard));
        assert!(!contains(&head, 5, guard));
        assert!(contains(&head, 7, guard));

        unsafe { drop_chain(&head) };
    }

    #[test]
    fn stays_sorted_unsigned() {
        let head = Atomic::null();
        let guard = &epoch::pin();
        for key in [9u64, 1, u64::MAX - 1, 4, 200] {
            assert!(add(&head, Owned::new(Node::new(key)), guard).is_ok());
        }
        let mut prev = None;
        let mut curr = head.load(std::sync::atomic::Ordering::Acquire, guard);
        while let Some(node) = unsafe { curr.as_ref() } {
            if let Some(prev) = prev {
                assert!(prev < node.key);
            }
            prev = Some(node.key);
            curr = node.next.load(std::sync::atomic::Ordering::Acquire, guard);
        }
        unsafe { drop_chain(&head) };
    }
}
