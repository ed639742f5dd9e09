//! Bounded channel data. Operation semantics (`push`/`pop` modes, `select`,
//! cross-thread delivery) live in `lumen-runtime::channel`; this module only
//! owns the shared state, grounded on the teacher's `ChannelData` (identity
//! comparison, `Send`/`Sync` story) but reshaped from an unbounded
//! `may::sync::mpmc` pair into the bounded three-FIFO structure the spec
//! requires: a value queue plus pending-reader and pending-writer queues so
//! `push`/`pop` can park a fiber instead of busy-waiting.

use crate::heap::GcRef;
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// A fiber parked on a full/empty channel, identified by its `GcRef` so the
/// scheduler can look it up and resume it once the channel state changes.
/// `sched_id` is the fiber's own scheduling counter at the moment it parked,
/// captured here (rather than re-read later) so delivery can tell a still-
/// waiting fiber from one a `cancel`/reschedule has since moved on from.
#[derive(Clone, Copy, Debug)]
pub struct Waiter {
    pub fiber: GcRef,
    pub sched_id: u64,
}

pub struct ChannelData {
    pub capacity: usize,
    pub queue: VecDeque<Value>,
    pub pending_readers: VecDeque<Waiter>,
    pub pending_writers: VecDeque<Waiter>,
    pub closed: bool,
    /// `Some` for a channel reachable from more than one OS thread. Holds
    /// the items crossing it in their marshalled byte form (a `Value`
    /// referencing this VM's heap is meaningless to a reader on another
    /// thread), guarded by the mutex across every state mutation so two
    /// threads pushing/popping the same channel don't interleave.
    pub cross_thread: Option<Mutex<VecDeque<Vec<u8>>>>,
    pub send_count: u64,
    pub receive_count: u64,
}

impl ChannelData {
    pub fn new(capacity: usize) -> Self {
        ChannelData {
            capacity,
            queue: VecDeque::new(),
            pending_readers: VecDeque::new(),
            pending_writers: VecDeque::new(),
            closed: false,
            cross_thread: None,
            send_count: 0,
            receive_count: 0,
        }
    }

    pub fn make_threaded(&mut self) {
        self.cross_thread = Some(Mutex::new(VecDeque::new()));
    }

    /// Number of items currently buffered, in whichever queue (plain or
    /// marshalled) this channel actually uses.
    pub fn len(&self) -> usize {
        match &self.cross_thread {
            Some(m) => m.lock().expect("channel mutex poisoned").len(),
            None => self.queue.len(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn trace(&self, out: &mut Vec<Value>) {
        out.extend(self.queue.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_invariant_holds_after_construction() {
        let c = ChannelData::new(4);
        assert!(!c.is_full());
        assert_eq!(c.capacity, 4);
    }
}
