//! The cooperative event loop: a spawn-ready FIFO, a timer min-heap, and a
//! pluggable I/O `Poller`. No OS thread scheduler sits underneath this (the
//! teacher delegates to `may`'s runtime); here the loop itself decides what
//! runs next. `EventLoop` owns only scheduling *state* — pure data, no
//! `Vm` reference — because it doubles as the per-channel wakeup queue
//! `lumen-runtime::channel` schedules onto; the actual `resume` calls and
//! staleness checks that turn this state into execution live in
//! `Embedder::loop1`, which is the one place holding both a `Vm` and an
//! `EventLoop` together.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use lumen_core::value::Value;
use lumen_core::GcRef;

/// Platform I/O readiness source. `poll(2)` is the portable baseline;
/// `epoll` is selected on Linux at build time (spec's four-poller menu —
/// kqueue/IOCP are documented, not implemented here, since this crate only
/// targets the platforms the pack's examples build for).
pub trait Poller {
    fn register(&mut self, fd: i32, readable: bool, writable: bool);
    fn unregister(&mut self, fd: i32);
    /// Returns fds that became ready within `timeout` (`None` = block
    /// indefinitely, `Some(Duration::ZERO)` = non-blocking poll).
    fn wait(&mut self, timeout: Option<Duration>) -> Vec<i32>;
}

pub struct PollPoller {
    fds: Vec<libc::pollfd>,
}

impl PollPoller {
    pub fn new() -> Self {
        PollPoller { fds: Vec::new() }
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn register(&mut self, fd: i32, readable: bool, writable: bool) {
        let mut events = 0;
        if readable {
            events |= libc::POLLIN;
        }
        if writable {
            events |= libc::POLLOUT;
        }
        if let Some(entry) = self.fds.iter_mut().find(|p| p.fd == fd) {
            entry.events = events as i16;
        } else {
            self.fds.push(libc::pollfd { fd, events: events as i16, revents: 0 });
        }
    }

    fn unregister(&mut self, fd: i32) {
        self.fds.retain(|p| p.fd != fd);
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Vec<i32> {
        if self.fds.is_empty() {
            if let Some(d) = timeout {
                std::thread::sleep(d);
            }
            return Vec::new();
        }
        let millis = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, millis) };
        if n <= 0 {
            return Vec::new();
        }
        self.fds.iter().filter(|p| p.revents != 0).map(|p| p.fd).collect()
    }
}

#[cfg(target_os = "linux")]
pub struct EpollPoller {
    epfd: i32,
    registered: Vec<i32>,
}

#[cfg(target_os = "linux")]
impl EpollPoller {
    pub fn new() -> std::io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(EpollPoller { epfd, registered: Vec::new() })
    }
}

#[cfg(target_os = "linux")]
impl Poller for EpollPoller {
    fn register(&mut self, fd: i32, readable: bool, writable: bool) {
        let mut events = 0u32;
        if readable {
            events |= libc::EPOLLIN as u32;
        }
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let op = if self.registered.contains(&fd) { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if !self.registered.contains(&fd) {
            self.registered.push(fd);
        }
    }

    fn unregister(&mut self, fd: i32) {
        unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        self.registered.retain(|&x| x != fd);
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Vec<i32> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered.len().max(1)];
        let millis = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, millis) };
        if n <= 0 {
            return Vec::new();
        }
        events[..n as usize].iter().map(|e| e.u64 as i32).collect()
    }
}

#[cfg(target_os = "linux")]
impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

/// A task queued for the next spawn-FIFO drain: the fiber to resume, the
/// value to resume it with, and the `sched_id` it carried at schedule time
/// (§4.F step 2's `expected_sched_id == fiber.sched_id` staleness check).
#[derive(Clone, Debug)]
pub struct Task {
    pub fiber: GcRef,
    pub value: Value,
    pub expected_sched_id: u64,
}

/// One pending timer. `curr_fiber` distinguishes a deadline (liveness check
/// only, cancels with "deadline expired") from a sleep/timeout (keyed to
/// `expected_sched_id`; `is_error` picks cancel-with-"timeout" vs
/// resume-with-nil).
struct TimerEntry {
    deadline_millis: u64,
    fiber: GcRef,
    curr_fiber: bool,
    is_error: bool,
    expected_sched_id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_millis == other.deadline_millis
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline pops first.
        other.deadline_millis.cmp(&self.deadline_millis)
    }
}

/// A due timer handed back to the caller (`Embedder::loop1`) to act on; see
/// `TimerEntry` for field meanings.
pub struct DueTimer {
    pub fiber: GcRef,
    pub curr_fiber: bool,
    pub is_error: bool,
    pub expected_sched_id: u64,
}

/// Which side of a stream a fiber is parked on, and what it was told to
/// expect (§4.F suspension points / §6 stream surface). `expected_sched_id`
/// guards against delivering a stale readiness event the same way channel
/// waiters and timers do.
#[derive(Clone, Copy)]
struct StreamWaiter {
    fiber: GcRef,
    expected_sched_id: u64,
}

#[derive(Default)]
struct StreamWaiters {
    read: Option<StreamWaiter>,
    write: Option<StreamWaiter>,
}

pub struct EventLoop {
    ready: VecDeque<Task>,
    timers: BinaryHeap<TimerEntry>,
    clock_millis: u64,
    poller: Option<Box<dyn Poller>>,
    streams: HashMap<i32, StreamWaiters>,
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            clock_millis: 0,
            poller: None,
            streams: HashMap::new(),
        }
    }

    pub fn set_poller(&mut self, poller: Box<dyn Poller>) {
        self.poller = Some(poller);
    }

    /// Enter `fiber` (with `value`, resumable only while `expected_sched_id`
    /// still matches) at the FIFO head, ahead of anything already queued —
    /// the ordering guarantee `schedule_soon` carries per §4.F.
    pub fn schedule_soon(&mut self, fiber: GcRef, value: Value, expected_sched_id: u64) {
        self.ready.push_front(Task { fiber, value, expected_sched_id });
    }

    /// Enter `fiber` at the FIFO tail (the ordinary `schedule` path).
    pub fn schedule(&mut self, fiber: GcRef, value: Value, expected_sched_id: u64) {
        self.ready.push_back(Task { fiber, value, expected_sched_id });
    }

    pub fn pop_ready(&mut self) -> Option<Task> {
        self.ready.pop_front()
    }

    /// Register a sleep/timeout: fires in `delay_millis`, resuming with nil
    /// (`is_error = false`) or cancelling with "timeout" (`is_error = true`)
    /// unless `fiber.sched_id` has moved on from `expected_sched_id` by
    /// then.
    pub fn schedule_timer(&mut self, fiber: GcRef, delay_millis: u64, is_error: bool, expected_sched_id: u64) {
        self.timers.push(TimerEntry {
            deadline_millis: self.clock_millis + delay_millis,
            fiber,
            curr_fiber: false,
            is_error,
            expected_sched_id,
        });
    }

    /// Register a deadline: a liveness-only timer that cancels `fiber` with
    /// "deadline expired" if it can still be resumed when the deadline
    /// arrives, and is silently dropped otherwise.
    pub fn schedule_deadline(&mut self, fiber: GcRef, delay_millis: u64) {
        self.timers.push(TimerEntry {
            deadline_millis: self.clock_millis + delay_millis,
            fiber,
            curr_fiber: true,
            is_error: false,
            expected_sched_id: 0,
        });
    }

    /// Advance the simulated clock by `millis`.
    pub fn advance(&mut self, millis: u64) {
        self.clock_millis += millis;
    }

    /// Drain every timer now due, handing each back for the caller to
    /// interpret against live fiber state (this module has no heap access
    /// to do that itself).
    pub fn drain_due_timers(&mut self) -> Vec<DueTimer> {
        let mut due = Vec::new();
        while let Some(top) = self.timers.peek() {
            if top.deadline_millis > self.clock_millis {
                break;
            }
            let entry = self.timers.pop().expect("peeked Some");
            due.push(DueTimer {
                fiber: entry.fiber,
                curr_fiber: entry.curr_fiber,
                is_error: entry.is_error,
                expected_sched_id: entry.expected_sched_id,
            });
        }
        due
    }

    /// Duration until the next timer fires, or `None` if there is none
    /// (the poller should then block indefinitely).
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.peek().map(|t| Duration::from_millis(t.deadline_millis.saturating_sub(self.clock_millis)))
    }

    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.timers.is_empty()
    }

    /// Park the current fiber on `fd`'s read or write slot (§6: "a stream
    /// wraps an OS handle... the loop registers handles with the platform
    /// poller on create"). A second concurrent waiter on the same side is
    /// a programmer error at the call site, not handled here.
    pub fn register_io(&mut self, fd: i32, readable: bool, writable: bool, fiber: GcRef, expected_sched_id: u64) {
        if let Some(poller) = &mut self.poller {
            poller.register(fd, readable, writable);
        }
        let waiters = self.streams.entry(fd).or_default();
        let waiter = StreamWaiter { fiber, expected_sched_id };
        if readable {
            waiters.read = Some(waiter);
        }
        if writable {
            waiters.write = Some(waiter);
        }
    }

    /// Deregister `fd` and return whichever fibers were waiting on it, so
    /// the caller can cancel them deterministically (§4.F: "a stream being
    /// closed while fibers are waiting cancels them deterministically").
    pub fn unregister_io(&mut self, fd: i32) -> Vec<GcRef> {
        if let Some(poller) = &mut self.poller {
            poller.unregister(fd);
        }
        match self.streams.remove(&fd) {
            Some(w) => w.read.into_iter().chain(w.write).map(|x| x.fiber).collect(),
            None => Vec::new(),
        }
    }

    /// Poll for I/O readiness, bounded by the next timer's delay (or
    /// indefinitely if there is none and the ready queue is empty), and
    /// return the fibers to resume paired with whether it was their read or
    /// write side that became ready.
    pub fn poll_io(&mut self) -> Vec<(GcRef, u64, bool)> {
        let Some(poller) = &mut self.poller else { return Vec::new() };
        if self.streams.is_empty() {
            return Vec::new();
        }
        let timeout = if !self.ready.is_empty() { Some(Duration::ZERO) } else { self.next_deadline() };
        let ready_fds = poller.wait(timeout);
        let mut out = Vec::new();
        for fd in ready_fds {
            if let Some(w) = self.streams.get(&fd) {
                if let Some(r) = w.read {
                    out.push((r.fiber, r.expected_sched_id, true));
                }
                if let Some(wr) = w.write {
                    out.push((wr.fiber, wr.expected_sched_id, false));
                }
            }
        }
        out
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gc(i: u32) -> GcRef {
        GcRef { index: i, generation: 0 }
    }

    #[test]
    fn timer_fires_after_advance_past_deadline() {
        let mut el = EventLoop::new();
        el.schedule_timer(gc(1), 100, false, 0);
        el.advance(50);
        assert!(el.drain_due_timers().is_empty());
        el.advance(51);
        let due = el.drain_due_timers();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].fiber, gc(1));
    }

    #[test]
    fn deadline_timer_is_distinguished_from_sleep_timer() {
        let mut el = EventLoop::new();
        el.schedule_deadline(gc(2), 10);
        el.advance(20);
        let due = el.drain_due_timers();
        assert_eq!(due.len(), 1);
        assert!(due[0].curr_fiber);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut el = EventLoop::new();
        el.schedule_timer(gc(20), 200, false, 0);
        el.schedule_timer(gc(10), 100, false, 0);
        el.advance(250);
        let due = el.drain_due_timers();
        assert_eq!(due[0].fiber, gc(10));
        assert_eq!(due[1].fiber, gc(20));
    }

    #[test]
    fn schedule_soon_enters_ahead_of_schedule() {
        let mut el = EventLoop::new();
        el.schedule(gc(1), Value::Nil, 0);
        el.schedule_soon(gc(2), Value::Nil, 0);
        assert_eq!(el.pop_ready().unwrap().fiber, gc(2));
        assert_eq!(el.pop_ready().unwrap().fiber, gc(1));
    }
}
