//! Bounded channel operations: push/pop in blocking, select, and
//! non-blocking modes, plus multi-way `select`/`rselect`.
//!
//! Grounded on the teacher's `channel.rs` (MPMC channels backed by
//! `may::sync::mpmc`, a global registry, per-channel atomic stats). Lumen's
//! channels live as ordinary heap objects (`HeapObj::Channel`) rather than
//! in a separate ID-keyed registry, since the VM's own heap already gives
//! every channel a stable, GC-visible address; `lumen_core::stats`
//! (`OPEN_CHANNELS`) carries the ambient-stats role the teacher's
//! `ChannelStats` plays. There is no OS thread scheduler to cooperatively
//! block on here (spec's non-goal rules out multi-threaded execution of a
//! single VM) — "blocking" instead means enqueuing the current fiber as a
//! pending waiter and handing an `[:give|:take|:close chan ...]` envelope
//! to the event loop's ready queue for the scheduler to deliver once the
//! channel state changes, in place of a stackful coroutine yield.
//!
//! A waiter is resolved by handing it straight off: `channel_push` pops the
//! first still-live entry from `pending_readers` (skipping any whose
//! `sched_id` no longer matches the fiber's current one — it moved on via
//! some other resume and this wakeup is stale) and schedules it to resume
//! with a `[:take chan value]` envelope; `channel_pop` does the symmetric
//! thing against `pending_writers` with `[:give chan]`. `channel_close`
//! drains both queues and wakes every live waiter with `[:close chan]`.

use lumen_core::heap::HeapObj;
use lumen_core::value::Value;
use lumen_core::{ChannelData, GcRef, LumenError};
use std::rc::Rc;

use crate::eventloop::EventLoop;
use crate::marshal::{marshal, unmarshal, AbstractHooks};
use crate::vm::Vm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushMode {
    Blocking = 0,
    Select = 1,
    NonBlocking = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopMode {
    Blocking = 0,
    Select = 1,
    NonBlocking = 2,
}

impl PushMode {
    pub fn from_u8(b: u8) -> PushMode {
        match b {
            1 => PushMode::Select,
            2 => PushMode::NonBlocking,
            _ => PushMode::Blocking,
        }
    }
}

impl PopMode {
    pub fn from_u8(b: u8) -> PopMode {
        match b {
            1 => PopMode::Select,
            2 => PopMode::NonBlocking,
            _ => PopMode::Blocking,
        }
    }
}

/// What a `push`/`pop` attempt resolved to, before the VM decides whether to
/// suspend the calling fiber.
pub enum PushOutcome {
    /// Value enqueued (or handed directly to a waiting reader).
    Sent,
    /// Channel full and `mode` forbids suspension.
    QueueFull,
    /// Caller must suspend; a wakeup has been enqueued on `events`.
    WouldBlock,
    Closed,
}

pub enum PopOutcome {
    Received(Value),
    QueueEmpty,
    WouldBlock,
    Closed,
}

/// A single `select`/`rselect` clause: a channel to read from, or a
/// `(channel, value)` pair to write.
pub enum SelectClause {
    Read(GcRef),
    Write(GcRef, Value),
}

/// Tagged result envelope (`[:give|:take|:close, channel, value?]`).
pub enum SelectEnvelope {
    Give(GcRef),
    Take(GcRef, Value),
    Close(GcRef),
    WouldBlock,
}

impl Vm {
    pub fn open_channel(&mut self, capacity: usize, threaded: bool) -> GcRef {
        let mut data = ChannelData::new(capacity);
        if threaded {
            data.make_threaded();
        }
        let r = self.heap.alloc(HeapObj::Channel(data), 64 + capacity * 8);
        lumen_core::stats::record_channel_opened();
        r
    }

    fn with_channel<T>(&self, chan: GcRef, f: impl FnOnce(&ChannelData) -> T) -> Result<T, LumenError> {
        match self.heap.get(chan) {
            HeapObj::Channel(c) => Ok(f(c)),
            _ => Err(LumenError::TypeMismatch { expected: "channel", found: "other" }),
        }
    }

    fn give_envelope(&mut self, chan: GcRef) -> Value {
        let tag = self.intern("give");
        Value::Tuple(Rc::from(vec![Value::Keyword(tag), Value::Channel(chan)]))
    }

    fn take_envelope(&mut self, chan: GcRef, value: Value) -> Value {
        let tag = self.intern("take");
        Value::Tuple(Rc::from(vec![Value::Keyword(tag), Value::Channel(chan), value]))
    }

    fn close_envelope(&mut self, chan: GcRef) -> Value {
        let tag = self.intern("close");
        Value::Tuple(Rc::from(vec![Value::Keyword(tag), Value::Channel(chan)]))
    }

    /// Pop the first pending reader whose `sched_id` still matches its
    /// live fiber (dropping any stale ones in front of it), if any.
    fn next_live_reader(&mut self, chan: GcRef) -> Result<Option<lumen_core::channel::Waiter>, LumenError> {
        loop {
            let candidate = { channel_mut(self, chan)?.pending_readers.pop_front() };
            match candidate {
                None => return Ok(None),
                Some(w) => {
                    if self.fiber_sched_id(w.fiber) == Some(w.sched_id) {
                        return Ok(Some(w));
                    }
                    // stale: fiber moved on since it parked, drop and keep looking
                }
            }
        }
    }

    fn next_live_writer(&mut self, chan: GcRef) -> Result<Option<lumen_core::channel::Waiter>, LumenError> {
        loop {
            let candidate = { channel_mut(self, chan)?.pending_writers.pop_front() };
            match candidate {
                None => return Ok(None),
                Some(w) => {
                    if self.fiber_sched_id(w.fiber) == Some(w.sched_id) {
                        return Ok(Some(w));
                    }
                }
            }
        }
    }

    pub fn channel_push(
        &mut self,
        fiber_ref: GcRef,
        chan: GcRef,
        value: Value,
        mode: PushMode,
        events: &mut EventLoop,
    ) -> Result<PushOutcome, LumenError> {
        let closed = self.with_channel(chan, |c| c.closed)?;
        if closed {
            return Ok(PushOutcome::Closed);
        }
        let threaded = self.with_channel(chan, |c| c.cross_thread.is_some())?;

        // Rule 1: a still-live pending reader gets the value directly,
        // regardless of capacity.
        if let Some(w) = self.next_live_reader(chan)? {
            let delivered = if threaded {
                let packed = marshal(self, &value, AbstractHooks::default())?;
                unmarshal(self, &packed, AbstractHooks::default())?
            } else {
                value
            };
            {
                let data = channel_mut(self, chan)?;
                data.send_count += 1;
                data.receive_count += 1;
            }
            let envelope = self.take_envelope(chan, delivered);
            events.schedule_soon(w.fiber, envelope, w.sched_id);
            return Ok(PushOutcome::Sent);
        }

        if threaded {
            let packed = marshal(self, &value, AbstractHooks::default())?;
            let (capacity, len) = {
                let data = channel_mut(self, chan)?;
                let mutex = data.cross_thread.as_ref().expect("threaded channel");
                (data.capacity, mutex.lock().expect("channel mutex poisoned").len())
            };
            if len < capacity {
                let data = channel_mut(self, chan)?;
                data.cross_thread.as_ref().expect("threaded channel").lock().expect("channel mutex poisoned").push_back(packed);
                data.send_count += 1;
                return Ok(PushOutcome::Sent);
            }
            return match mode {
                PushMode::NonBlocking => Ok(PushOutcome::QueueFull),
                PushMode::Blocking | PushMode::Select => {
                    let sched_id = self.fiber_sched_id(fiber_ref).unwrap_or(0);
                    let data = channel_mut(self, chan)?;
                    data.cross_thread.as_ref().expect("threaded channel").lock().expect("channel mutex poisoned").push_back(packed);
                    data.send_count += 1;
                    data.pending_writers.push_back(lumen_core::channel::Waiter { fiber: fiber_ref, sched_id });
                    Ok(PushOutcome::WouldBlock)
                }
            };
        }

        let is_full = self.with_channel(chan, |c| c.is_full())?;
        if !is_full {
            let data = channel_mut(self, chan)?;
            data.queue.push_back(value);
            data.send_count += 1;
            return Ok(PushOutcome::Sent);
        }

        match mode {
            PushMode::NonBlocking => Ok(PushOutcome::QueueFull),
            PushMode::Blocking | PushMode::Select => {
                let sched_id = self.fiber_sched_id(fiber_ref).unwrap_or(0);
                let data = channel_mut(self, chan)?;
                // Transient overflow: the spec permits capacity+1 items to
                // sit in the queue for the instant between a blocking push
                // and the pusher actually parking.
                data.queue.push_back(value);
                data.send_count += 1;
                data.pending_writers.push_back(lumen_core::channel::Waiter { fiber: fiber_ref, sched_id });
                Ok(PushOutcome::WouldBlock)
            }
        }
    }

    pub fn channel_pop(
        &mut self,
        fiber_ref: GcRef,
        chan: GcRef,
        mode: PopMode,
        events: &mut EventLoop,
    ) -> Result<PopOutcome, LumenError> {
        let threaded = self.with_channel(chan, |c| c.cross_thread.is_some())?;
        let popped = if threaded {
            let bytes = {
                let data = channel_mut(self, chan)?;
                data.cross_thread.as_ref().expect("threaded channel").lock().expect("channel mutex poisoned").pop_front()
            };
            match bytes {
                Some(b) => Some(unmarshal(self, &b, AbstractHooks::default())?),
                None => None,
            }
        } else {
            channel_mut(self, chan)?.queue.pop_front()
        };

        if let Some(v) = popped {
            {
                let data = channel_mut(self, chan)?;
                data.receive_count += 1;
            }
            // A writer parked earlier already has its value sitting in the
            // queue (transient overflow); waking it just lets its blocked
            // push call return now that there's room.
            if let Some(w) = self.next_live_writer(chan)? {
                let envelope = self.give_envelope(chan);
                events.schedule_soon(w.fiber, envelope, w.sched_id);
            }
            return Ok(PopOutcome::Received(v));
        }

        let closed = self.with_channel(chan, |c| c.closed)?;
        if closed {
            return Ok(PopOutcome::Closed);
        }
        match mode {
            PopMode::NonBlocking => Ok(PopOutcome::QueueEmpty),
            PopMode::Blocking | PopMode::Select => {
                let sched_id = self.fiber_sched_id(fiber_ref).unwrap_or(0);
                let data = channel_mut(self, chan)?;
                data.pending_readers.push_back(lumen_core::channel::Waiter { fiber: fiber_ref, sched_id });
                Ok(PopOutcome::WouldBlock)
            }
        }
    }

    pub fn channel_close(&mut self, chan: GcRef, events: &mut EventLoop) -> Result<(), LumenError> {
        let (readers, writers) = {
            let data = channel_mut(self, chan)?;
            data.closed = true;
            (
                data.pending_readers.drain(..).collect::<Vec<_>>(),
                data.pending_writers.drain(..).collect::<Vec<_>>(),
            )
        };
        lumen_core::stats::record_channel_closed();
        for w in readers.into_iter().chain(writers.into_iter()) {
            if self.fiber_sched_id(w.fiber) != Some(w.sched_id) {
                continue;
            }
            let envelope = self.close_envelope(chan);
            events.schedule_soon(w.fiber, envelope, w.sched_id);
        }
        Ok(())
    }

    /// First pass: try every clause non-blockingly in order. Honors closed
    /// channels immediately. A write clause with a live pending reader
    /// hands off directly rather than enqueuing behind it. Returns `None`
    /// if no clause is immediately satisfiable (caller should enqueue as
    /// pending on all remaining clauses and suspend).
    fn try_clauses_once(
        &mut self,
        clauses: &[SelectClause],
        events: &mut EventLoop,
    ) -> Result<Option<SelectEnvelope>, LumenError> {
        for i in 0..clauses.len() {
            match &clauses[i] {
                SelectClause::Read(chan) => {
                    let chan = *chan;
                    let (closed, has_value) = self.with_channel(chan, |c| (c.closed, !c.queue.is_empty()))?;
                    if has_value {
                        let v = channel_mut(self, chan)?.queue.pop_front().expect("checked non-empty");
                        {
                            let data = channel_mut(self, chan)?;
                            data.receive_count += 1;
                        }
                        if let Some(w) = self.next_live_writer(chan)? {
                            let envelope = self.give_envelope(chan);
                            events.schedule_soon(w.fiber, envelope, w.sched_id);
                        }
                        return Ok(Some(SelectEnvelope::Take(chan, v)));
                    }
                    if closed {
                        return Ok(Some(SelectEnvelope::Close(chan)));
                    }
                }
                SelectClause::Write(chan, value) => {
                    let chan = *chan;
                    let value = value.clone();
                    let closed = self.with_channel(chan, |c| c.closed)?;
                    if closed {
                        return Ok(Some(SelectEnvelope::Close(chan)));
                    }
                    if let Some(w) = self.next_live_reader(chan)? {
                        {
                            let data = channel_mut(self, chan)?;
                            data.send_count += 1;
                            data.receive_count += 1;
                        }
                        let envelope = self.take_envelope(chan, value);
                        events.schedule_soon(w.fiber, envelope, w.sched_id);
                        return Ok(Some(SelectEnvelope::Give(chan)));
                    }
                    let is_full = self.with_channel(chan, |c| c.is_full())?;
                    if !is_full {
                        let data = channel_mut(self, chan)?;
                        data.queue.push_back(value);
                        data.send_count += 1;
                        return Ok(Some(SelectEnvelope::Give(chan)));
                    }
                }
            }
        }
        Ok(None)
    }

    /// `select`: clauses tried in the given order on the non-blocking pass.
    pub fn select(
        &mut self,
        fiber_ref: GcRef,
        clauses: &[SelectClause],
        events: &mut EventLoop,
    ) -> Result<SelectEnvelope, LumenError> {
        self.select_inner(fiber_ref, clauses, events)
    }

    /// `rselect`: Fisher-Yates permutes clause order before the non-blocking
    /// pass so that, over many repetitions with all clauses satisfiable,
    /// each is chosen with probability ~1/k (spec's fairness property).
    /// `rand_bytes` supplies one byte of entropy per swap, from the
    /// embedder (no stdlib RNG is pulled in here).
    pub fn rselect(
        &mut self,
        fiber_ref: GcRef,
        clauses: Vec<SelectClause>,
        rand_bytes: &[u8],
        events: &mut EventLoop,
    ) -> Result<SelectEnvelope, LumenError> {
        let mut shuffled = clauses;
        let n = shuffled.len();
        for i in (1..n).rev() {
            let byte = rand_bytes.get(n - 1 - i).copied().unwrap_or(0);
            let j = (byte as usize) % (i + 1);
            shuffled.swap(i, j);
        }
        self.select_inner(fiber_ref, &shuffled, events)
    }

    fn select_inner(
        &mut self,
        fiber_ref: GcRef,
        clauses: &[SelectClause],
        events: &mut EventLoop,
    ) -> Result<SelectEnvelope, LumenError> {
        if let Some(env) = self.try_clauses_once(clauses, events)? {
            return Ok(env);
        }
        let sched_id = self.fiber_sched_id(fiber_ref).unwrap_or(0);
        for clause in clauses {
            match clause {
                SelectClause::Read(chan) => {
                    let data = channel_mut(self, *chan)?;
                    data.pending_readers.push_back(lumen_core::channel::Waiter { fiber: fiber_ref, sched_id });
                }
                SelectClause::Write(chan, _) => {
                    let data = channel_mut(self, *chan)?;
                    data.pending_writers.push_back(lumen_core::channel::Waiter { fiber: fiber_ref, sched_id });
                }
            }
        }
        Ok(SelectEnvelope::WouldBlock)
    }
}

fn channel_mut(vm: &mut Vm, chan: GcRef) -> Result<&mut ChannelData, LumenError> {
    match vm.heap.get_mut(chan) {
        HeapObj::Channel(c) => Ok(c),
        _ => Err(LumenError::TypeMismatch { expected: "channel", found: "other" }),
    }
}
