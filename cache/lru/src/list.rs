//! Recency list backing the cache's eviction order.
//!
//! A doubly linked list of keys stored in a slab arena. Slab indices are
//! stable for the lifetime of a node, so entries can hold their node index
//! and be promoted or unlinked in O(1) without searching.

use bytes::Bytes;
use slab::Slab;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: Bytes,
    prev: usize,
    next: usize,
}

/// Doubly linked key list: least recent at the front, most recent at the back.
#[derive(Debug)]
pub(crate) struct LruList {
    nodes: Slab<Node>,
    head: usize,
    tail: usize,
}

impl LruList {
    pub fn new() -> Self {
        LruList {
            nodes: Slab::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a key at the most-recent end. Returns the node's stable index.
    pub fn push_back(&mut self, key: Bytes) -> usize {
        let idx = self.nodes.insert(Node {
            key,
            prev: self.tail,
            next: NIL,
        });

        if self.tail != NIL {
            self.nodes[self.tail].next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        idx
    }

    /// Unlink and drop the node at `idx`.
    pub fn remove(&mut self, idx: usize) -> Bytes {
        let node = self.nodes.remove(idx);

        if node.prev != NIL {
            self.nodes[node.prev].next = node.next;
        } else {
            self.head = node.next;
        }
        if node.next != NIL {
            self.nodes[node.next].prev = node.prev;
        } else {
            self.tail = node.prev;
        }

        node.key
    }

    /// Splice the node at `idx` to the most-recent end. The node keeps its
    /// index.
    pub fn move_to_back(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }

        let (prev, next) = {
            let node = &self.nodes[idx];
            (node.prev, node.next)
        };

        // Unlink. `next` is never NIL here because idx is not the tail.
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        self.nodes[next].prev = prev;

        // Relink at the tail.
        self.nodes[idx].prev = self.tail;
        self.nodes[idx].next = NIL;
        self.nodes[self.tail].next = idx;
        self.tail = idx;
    }

    /// The least recently used key.
    pub fn front(&self) -> Option<&Bytes> {
        if self.head == NIL {
            None
        } else {
            Some(&self.nodes[self.head].key)
        }
    }

    /// The most recently used key.
    pub fn back(&self) -> Option<&Bytes> {
        if self.tail == NIL {
            None
        } else {
            Some(&self.nodes[self.tail].key)
        }
    }

    /// Iterate keys from least recent to most recent.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            next: self.head,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

pub(crate) struct Iter<'a> {
    list: &'a LruList,
    next: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Bytes;

    fn next(&mut self) -> Option<&'a Bytes> {
        if self.next == NIL {
            return None;
        }
        let node = &self.list.nodes[self.next];
        self.next = node.next;
        Some(&node.key)
    }
}
