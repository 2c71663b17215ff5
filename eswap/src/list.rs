//! Bit-packed intrusive doubly-linked lists keyed by small integers
//! (spec §4.1). All bookkeeping the core performs — free extents, the
//! per-group LRU of objects, the per-extent reverse map, the per-group
//! extent list — is a view over one backing node array; this module is
//! that view's operations.

use log::warn;

use crate::node::Node;

/// Resolves a node index into the backing `Node`. Implementors own the
/// array; this trait is the "node-table view object" the Design Notes
/// call for, so list operations never see raw pointers.
pub trait NodeTable {
    fn node(&self, idx: u32) -> Option<&Node>;
    fn len(&self) -> u32;
}

/// Intrusive-list operations over a `NodeTable`. Stateless: every method
/// takes the table plus the indices it touches.
pub struct IntrusiveList;

impl IntrusiveList {
    /// An empty list head has `prev == next == hidx`.
    pub fn init<T: NodeTable>(table: &T, idx: u32) {
        let Some(n) = Self::resolve(table, idx, "init") else { return };
        n.set_prev_next(idx, idx);
        n.set_mcgid(0);
        n.clear_priv();
    }

    fn resolve<'a, T: NodeTable>(table: &'a T, idx: u32, op: &str) -> Option<&'a Node> {
        match table.node(idx) {
            Some(n) => Some(n),
            None => {
                warn!("intrusive list: out-of-range index {idx} in {op} (table len {})", table.len());
                None
            }
        }
    }

    pub fn lock<T: NodeTable>(table: &T, idx: u32) {
        if let Some(n) = Self::resolve(table, idx, "lock") {
            n.lock();
        }
    }

    pub fn unlock<T: NodeTable>(table: &T, idx: u32) {
        if let Some(n) = Self::resolve(table, idx, "unlock") {
            n.unlock();
        }
    }

    pub fn set_priv<T: NodeTable>(table: &T, idx: u32) -> bool {
        Self::resolve(table, idx, "set_priv").map(Node::set_priv).unwrap_or(false)
    }

    pub fn clear_priv<T: NodeTable>(table: &T, idx: u32) {
        if let Some(n) = Self::resolve(table, idx, "clear_priv") {
            n.clear_priv();
        }
    }

    pub fn get_mcgid<T: NodeTable>(table: &T, idx: u32) -> u32 {
        Self::resolve(table, idx, "get_mcgid").map(Node::mcgid).unwrap_or(0)
    }

    pub fn set_mcgid<T: NodeTable>(table: &T, idx: u32, id: u32) {
        if let Some(n) = Self::resolve(table, idx, "set_mcgid") {
            n.set_mcgid(id);
        }
    }

    /// Insert `idx` right after the head `hidx` (most-recently-used end).
    pub fn add<T: NodeTable>(table: &T, idx: u32, hidx: u32) {
        let (Some(head), Some(node)) = (Self::resolve(table, hidx, "add"), Self::resolve(table, idx, "add")) else {
            return;
        };
        head.lock();
        let head_next = head.get().next;
        node.lock();
        node.set_prev_next(hidx, head_next);
        node.unlock();
        if head_next == hidx {
            head.set_prev(idx);
        } else if let Some(next_node) = table.node(head_next) {
            next_node.lock();
            next_node.set_prev(idx);
            next_node.unlock();
        }
        head.set_next(idx);
        head.unlock();
    }

    /// Insert `idx` right before the head `hidx` (coldest/tail end).
    pub fn add_tail<T: NodeTable>(table: &T, idx: u32, hidx: u32) {
        let (Some(head), Some(node)) = (Self::resolve(table, hidx, "add_tail"), Self::resolve(table, idx, "add_tail")) else {
            return;
        };
        head.lock();
        let head_prev = head.get().prev;
        node.lock();
        node.set_prev_next(head_prev, hidx);
        node.unlock();
        if head_prev == hidx {
            head.set_next(idx);
        } else if let Some(prev_node) = table.node(head_prev) {
            prev_node.lock();
            prev_node.set_next(idx);
            prev_node.unlock();
        }
        head.set_prev(idx);
        head.unlock();
    }

    /// Detach `idx` from the list headed by `hidx`. A no-op if `idx` is
    /// not currently linked into any list (self-loop).
    pub fn del<T: NodeTable>(table: &T, idx: u32, hidx: u32) {
        let (Some(head), Some(node)) = (Self::resolve(table, hidx, "del"), Self::resolve(table, idx, "del")) else {
            return;
        };
        head.lock();
        node.lock();
        let f = node.get();
        if f.prev == idx && f.next == idx {
            // Not linked into this (or any) list.
            node.unlock();
            head.unlock();
            return;
        }
        let (p, n) = (f.prev, f.next);
        node.set_prev_next(idx, idx);
        node.unlock();

        if p != hidx {
            if let Some(prev_node) = table.node(p) {
                prev_node.lock();
                prev_node.set_next(n);
                prev_node.unlock();
            }
        } else {
            head.set_next(n);
        }

        if n != hidx {
            if let Some(next_node) = table.node(n) {
                next_node.lock();
                next_node.set_prev(p);
                next_node.unlock();
            }
        } else {
            head.set_prev(p);
        }
        head.unlock();
    }

    /// True iff the list headed by `hidx` has no entries.
    pub fn is_empty<T: NodeTable>(table: &T, hidx: u32) -> bool {
        match Self::resolve(table, hidx, "is_empty") {
            Some(head) => {
                let f = head.get();
                f.next == hidx
            }
            None => true,
        }
    }

    /// Walk the list headed by `hidx` from the tail (head.prev) backwards,
    /// i.e. in coldest-first order, under the head lock, collecting up to
    /// `max` indices.
    pub fn coldest<T: NodeTable>(table: &T, hidx: u32, max: usize, out: &mut Vec<u32>) {
        let Some(head) = Self::resolve(table, hidx, "coldest") else { return };
        head.lock();
        let mut cur = head.get().prev;
        while cur != hidx && out.len() < max {
            out.push(cur);
            cur = match table.node(cur) {
                Some(n) => n.get().prev,
                None => break,
            };
        }
        head.unlock();
    }

    /// Any single entry of the list headed by `hidx`, or `None` if empty.
    pub fn any<T: NodeTable>(table: &T, hidx: u32) -> Option<u32> {
        let head = Self::resolve(table, hidx, "any")?;
        head.lock();
        let next = head.get().next;
        head.unlock();
        if next == hidx {
            None
        } else {
            Some(next)
        }
    }
}
