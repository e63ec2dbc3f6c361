//! Sorted, doubly-linked idle-connection timer list (§4.1).
//!
//! The source represents this list with raw intrusive `prev`/`next`
//! pointers. Here it is a slab: timers live in a `Vec<Node>` addressed by
//! index, `prev`/`next` are `Option<usize>`, and a deleted slot is reused
//! (never reference-counted — the list is the sole owner of a timer, and a
//! connection slot holds only a non-owning `TimerId`).
//!
//! All operations are called from the event-loop thread only; there is no
//! internal locking.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque handle to a timer record. Indexes into `TimerList`'s slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

impl TimerId {
    #[cfg(test)]
    pub fn for_test(idx: usize) -> Self {
        Self(idx)
    }
}

struct Node {
    expire: u64,
    /// Which connection slot this timer watches.
    user: usize,
    prev: Option<usize>,
    next: Option<usize>,
    /// `true` once the node has been unlinked; slab slots are recycled via
    /// `free_list` rather than shifting the vector.
    live: bool,
}

/// Ascending-by-`expire` doubly-linked list of connection deadlines.
pub struct TimerList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn alloc(&mut self, expire: u64, user: usize) -> usize {
        let node = Node {
            expire,
            user,
            prev: None,
            next: None,
            live: true,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Insert a new timer for `user` expiring at `expire` (seconds since
    /// epoch). Ties with existing equal-`expire` timers break by insertion
    /// order: the new timer lands after them.
    pub fn add(&mut self, expire: u64, user: usize) -> TimerId {
        let idx = self.alloc(expire, user);

        let Some(head) = self.head else {
            self.head = Some(idx);
            self.tail = Some(idx);
            return TimerId(idx);
        };

        if expire < self.nodes[head].expire {
            self.nodes[idx].next = Some(head);
            self.nodes[head].prev = Some(idx);
            self.head = Some(idx);
            return TimerId(idx);
        }

        self.insert_after(idx, head);
        TimerId(idx)
    }

    /// Walk forward from `start` (inclusive of considering `start.next`)
    /// looking for the first node whose `expire` exceeds the new node's,
    /// and splice the new node in before it. Falls off the end onto `tail`.
    fn insert_after(&mut self, idx: usize, start: usize) {
        let expire = self.nodes[idx].expire;
        let mut prev = start;
        let mut cursor = self.nodes[start].next;

        while let Some(cur) = cursor {
            if expire < self.nodes[cur].expire {
                self.nodes[prev].next = Some(idx);
                self.nodes[idx].prev = Some(prev);
                self.nodes[idx].next = Some(cur);
                self.nodes[cur].prev = Some(idx);
                return;
            }
            prev = cur;
            cursor = self.nodes[cur].next;
        }

        // Ran off the tail.
        self.nodes[prev].next = Some(idx);
        self.nodes[idx].prev = Some(prev);
        self.tail = Some(idx);
    }

    /// Re-date `id`'s position after its `expire` field was bumped forward.
    ///
    /// Precondition: the caller has already increased `id`'s deadline.
    /// `adjust` only ever moves a node toward the tail — it is not a
    /// general-purpose re-sort. Debug builds assert the precondition.
    pub fn adjust(&mut self, id: TimerId, new_expire: u64) {
        let idx = id.0;
        debug_assert!(
            new_expire >= self.nodes[idx].expire,
            "adjust_timer only moves a node forward"
        );
        self.nodes[idx].expire = new_expire;

        let Some(next) = self.nodes[idx].next else {
            return; // already the tail
        };
        if new_expire < self.nodes[next].expire {
            return; // still in the right place
        }

        // Detach idx.
        let prev = self.nodes[idx].prev;
        match prev {
            Some(p) => self.nodes[p].next = Some(next),
            None => self.head = Some(next),
        }
        self.nodes[next].prev = prev;
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;

        // Re-insert starting the search from `next`, not head: the new
        // expire is monotonically >= old, so it can only move toward tail.
        self.insert_after(idx, next);
    }

    /// Unlink and free `id`. No-op if it was already deleted.
    pub fn del(&mut self, id: TimerId) {
        let idx = id.0;
        if !self.nodes[idx].live {
            return;
        }
        self.nodes[idx].live = false;

        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
        self.free.push(idx);
    }

    /// Sweep every timer whose `expire <= now`, invoking `on_expire` with
    /// the owning connection slot for each. Stops at the first live timer
    /// that hasn't expired yet. `expire == now` counts as expired.
    pub fn tick(&mut self, mut on_expire: impl FnMut(usize)) {
        let now = now_secs();
        while let Some(idx) = self.head {
            if self.nodes[idx].expire > now {
                break;
            }
            let user = self.nodes[idx].user;
            let id = TimerId(idx);
            on_expire(user);
            self.del(id);
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        match (self.head, self.tail) {
            (None, None) => return,
            (Some(_), Some(_)) => {}
            _ => panic!("head/tail nullity mismatch"),
        }
        let head = self.head.unwrap();
        assert!(self.nodes[head].prev.is_none());
        let tail = self.tail.unwrap();
        assert!(self.nodes[tail].next.is_none());

        let mut cursor = self.head;
        let mut last_expire = None;
        while let Some(idx) = cursor {
            if let Some(p) = self.nodes[idx].prev {
                assert_eq!(self.nodes[p].next, Some(idx));
            }
            if let Some(n) = self.nodes[idx].next {
                assert_eq!(self.nodes[n].prev, Some(idx));
            }
            if let Some(last) = last_expire {
                assert!(last <= self.nodes[idx].expire, "list out of order");
            }
            last_expire = Some(self.nodes[idx].expire);
            cursor = self.nodes[idx].next;
        }
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
