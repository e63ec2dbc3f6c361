//! Per-connection state: the dense slot array the reactor and workers share.
//!
//! The source pairs each socket with a `client_data` struct (address, fd,
//! owning timer) addressed by fd into a fixed-size array. `ConnTable` is
//! that array, sized by `-x`/`max_fd`; a slot's `fd == -1` marks it free so
//! fd reuse (the kernel hands out the lowest free fd) never collides with a
//! stale slot.

use std::net::SocketAddr;
use std::sync::{Condvar, Mutex};

use crate::config::TriggerMode;
use crate::http::HttpConn;
use crate::timer::TimerId;

/// One-shot readiness handoff between the epoll thread and whichever worker
/// picks up a dispatched job. Mirrors the source's `improv`/`timer_flag`
/// spin pair, but blocks instead of busy-waiting (§9 open question).
#[derive(Default)]
pub struct Handoff {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Mark the handoff satisfied and wake the one waiter, if any.
    pub fn signal(&self) {
        let mut ready = self.state.lock().unwrap();
        *ready = true;
        self.condvar.notify_one();
    }

    /// Block until `signal` is called, then reset for reuse.
    pub fn wait(&self) {
        let mut ready = self.state.lock().unwrap();
        while !*ready {
            ready = self.condvar.wait(ready).unwrap();
        }
        *ready = false;
    }
}

/// A single connection slot. `None` when unoccupied.
///
/// `handoff` is an `Arc` so the epoll thread can clone it out from under
/// the table lock and wait on it without holding that lock — the worker
/// thread that signals it needs the same lock to look the slot back up.
pub struct Slot {
    pub fd: i32,
    pub peer: SocketAddr,
    pub trigger: TriggerMode,
    pub timer: Option<TimerId>,
    pub http: HttpConn,
    pub handoff: std::sync::Arc<Handoff>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            fd: -1,
            peer: "0.0.0.0:0".parse().unwrap(),
            trigger: TriggerMode::Level,
            timer: None,
            http: HttpConn::new(),
            handoff: std::sync::Arc::new(Handoff::new()),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.fd >= 0
    }
}

/// Fixed-size table of connection slots, indexed by fd.
///
/// Sizing by `max_fd` rather than growing dynamically matches the source's
/// fixed `client_data users[MAX_FD]` array. `active` tracks the live
/// connection count directly (the source's `m_user_count`) rather than
/// being derived from `fd`'s numeric value, since §4.5's overflow check
/// gates on the number of connections in use, not on fd numbering.
pub struct ConnTable {
    slots: Vec<Slot>,
    active: usize,
}

impl ConnTable {
    pub fn new(max_fd: usize) -> Self {
        let mut slots = Vec::with_capacity(max_fd);
        slots.resize_with(max_fd, Slot::vacant);
        Self { slots, active: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots, matching the source's `m_user_count`.
    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn get(&self, fd: i32) -> Option<&Slot> {
        self.slots
            .get(fd as usize)
            .filter(|slot| slot.is_occupied())
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut Slot> {
        self.slots
            .get_mut(fd as usize)
            .filter(|slot| slot.is_occupied())
    }

    /// Occupy the slot at `fd`. The caller is responsible for having
    /// verified `fd < capacity()` and `active_count() < capacity()` (the
    /// accept loop's §4.5 over-capacity check); the slot at `fd` must be
    /// vacant.
    pub fn insert(&mut self, fd: i32, peer: SocketAddr, trigger: TriggerMode) {
        let slot = &mut self.slots[fd as usize];
        debug_assert!(!slot.is_occupied(), "insert on an already-occupied slot");
        slot.fd = fd;
        slot.peer = peer;
        slot.trigger = trigger;
        slot.timer = None;
        slot.http = HttpConn::new();
        slot.handoff = std::sync::Arc::new(Handoff::new());
        self.active += 1;
    }

    /// Vacate the slot at `fd`, returning its timer handle (if any) so the
    /// caller can remove it from the timer list. Idempotent: closing an
    /// already-vacant slot is a no-op and returns `None`, guarding against
    /// the double-close the source's comments call out around `cb_func`.
    pub fn remove(&mut self, fd: i32) -> Option<TimerId> {
        let slot = self.slots.get_mut(fd as usize)?;
        if !slot.is_occupied() {
            return None;
        }
        let timer = slot.timer.take();
        slot.fd = -1;
        self.active -= 1;
        timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    #[test]
    fn fresh_table_has_no_occupied_slots() {
        let table = ConnTable::new(16);
        assert!(table.get(3).is_none());
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut table = ConnTable::new(16);
        table.insert(3, addr(), TriggerMode::Edge);
        let slot = table.get(3).unwrap();
        assert_eq!(slot.fd, 3);
        assert_eq!(slot.peer, addr());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = ConnTable::new(16);
        table.insert(3, addr(), TriggerMode::Level);
        assert!(table.remove(3).is_none()); // no timer attached yet
        assert!(table.get(3).is_none());
        assert!(table.remove(3).is_none()); // second close: no panic
    }

    #[test]
    fn remove_returns_attached_timer() {
        let mut table = ConnTable::new(16);
        table.insert(3, addr(), TriggerMode::Level);
        table.get_mut(3).unwrap().timer = Some(TimerId::for_test(7));
        let timer = table.remove(3);
        assert!(timer.is_some());
    }

    #[test]
    fn handoff_wakes_a_blocked_waiter() {
        use std::sync::Arc;
        use std::thread;

        let handoff = Arc::new(Handoff::new());
        let waiter = handoff.clone();
        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(std::time::Duration::from_millis(20));
        handoff.signal();
        handle.join().unwrap();
    }
}
