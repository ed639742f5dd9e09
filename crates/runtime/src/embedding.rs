//! The plain-Rust embedding surface: construct a `Vm`, register native
//! functions and abstract types, build value graphs, spawn and drive
//! fibers to completion. This is the boundary a host program (or a REPL,
//! which is out of scope here) programs against instead of reaching into
//! `vm::Vm` directly.

use std::cell::RefCell;
use std::rc::Rc;

use lumen_core::heap::HeapObj;
use lumen_core::table::Table;
use lumen_core::value::{CFunctionPtr, Value};
use lumen_core::{FuncDef, GcRef, Signal, SignalKind};

use crate::channel::PushMode;
use crate::config::RuntimeConfig;
use crate::eventloop::EventLoop;
use crate::vm::Vm;

/// A `Vm` plus the cooperative scheduler driving its fibers. Grounded on
/// the teacher's top-level `Interpreter` handle, which likewise bundles a
/// VM instance with the runtime state needed to actually make it go.
pub struct Embedder {
    pub vm: Vm,
    pub events: EventLoop,
    config: RuntimeConfig,
}

impl Embedder {
    pub fn new(config: RuntimeConfig) -> Self {
        crate::diagnostics::install_signal_handler();
        Embedder { vm: Vm::new(config.gc_interval), events: EventLoop::new(), config }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Bind a native function under `name` in the global table, the same
    /// slot `resolve` falls back to when a symbol has no lexical binding.
    pub fn register_native(&mut self, name: &str, f: CFunctionPtr) {
        let key = Value::String(Rc::new(name.into()));
        match self.vm.heap.get(self.vm.globals) {
            HeapObj::Table(t) => t.borrow_mut().insert(key, Value::CFunction(f)),
            _ => unreachable!("globals is always a table"),
        };
    }

    /// Register an arbitrary host type under the abstract-value umbrella.
    /// The returned `GcRef` is what callers wrap in `Value::Abstract`.
    pub fn make_abstract<T: 'static>(&mut self, payload: T) -> GcRef {
        self.vm.heap.alloc(HeapObj::Abstract(Box::new(payload)), std::mem::size_of::<T>())
    }

    pub fn downcast_abstract<T: 'static>(&self, r: GcRef) -> Option<&T> {
        match self.vm.heap.get(r) {
            HeapObj::Abstract(b) => b.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Build a fresh top-level fiber (a "thunk") out of a compiled
    /// `FuncDef` and schedule it to run on the next drive.
    pub fn make_thunk(&mut self, funcdef: Rc<FuncDef>) -> GcRef {
        let fiber = self.vm.spawn(funcdef, self.config.max_registers);
        let sched_id = self.vm.fiber_sched_id(fiber).unwrap_or(0);
        self.events.schedule_soon(fiber, Value::Nil, sched_id);
        fiber
    }

    /// Resume one fiber with `args`, interpreting its signal: `Event`
    /// re-enqueues it for a later drive, everything else is handed back
    /// to the caller to interpret (`Yield` for cooperative yields back to
    /// the host, `Error`/`User(_)` for unhandled conditions, `Ok` for a
    /// completed thunk).
    pub fn resume(&mut self, fiber: GcRef, args: Vec<Value>) -> Signal {
        let signal = self.vm.resume(fiber, args);
        if signal.kind == SignalKind::Event {
            let sched_id = self.vm.fiber_sched_id(fiber).unwrap_or(0);
            self.events.schedule_soon(fiber, Value::Nil, sched_id);
        }
        signal
    }

    /// One tick of the event loop (three steps, run in order):
    ///
    /// 1. Drain every timer now due. A deadline (`curr_fiber`) cancels its
    ///    target with "deadline expired" if it can still be resumed, and is
    ///    dropped silently otherwise. A sleep/timeout resumes with nil, or
    ///    cancels with "timeout" if it was armed as an error timer, unless
    ///    the fiber's `sched_id` has moved on since the timer was set (it
    ///    resumed some other way already, so the timer is stale).
    /// 2. Drain the spawn FIFO. Each task's `expected_sched_id` is checked
    ///    against the fiber's live `sched_id` the same way; a terminal
    ///    (`Ok`/`Error`) signal dispatches to the fiber's supervisor
    ///    channel, if it registered one.
    /// 3. Poll I/O readiness, bounded by the next timer's deadline, and
    ///    dispatch each ready stream side to its waiting fiber.
    pub fn loop1(&mut self) -> Vec<(GcRef, Signal)> {
        let mut terminal = Vec::new();

        for due in self.events.drain_due_timers() {
            if due.curr_fiber {
                if let Some(signal) = self.vm.cancel_fiber(due.fiber, "deadline expired") {
                    self.dispatch_supervisor(due.fiber, &signal);
                    terminal.push((due.fiber, signal));
                }
                continue;
            }
            if self.vm.fiber_sched_id(due.fiber) != Some(due.expected_sched_id) {
                continue;
            }
            if due.is_error {
                if let Some(signal) = self.vm.cancel_fiber(due.fiber, "timeout") {
                    self.dispatch_supervisor(due.fiber, &signal);
                    terminal.push((due.fiber, signal));
                }
            } else {
                self.dispatch(due.fiber, Value::Nil, due.expected_sched_id, &mut terminal);
            }
        }

        while let Some(task) = self.events.pop_ready() {
            self.dispatch(task.fiber, task.value, task.expected_sched_id, &mut terminal);
        }

        for (fiber, expected_sched_id, _readable) in self.events.poll_io() {
            self.dispatch(fiber, Value::Nil, expected_sched_id, &mut terminal);
        }

        terminal
    }

    fn dispatch(&mut self, fiber: GcRef, value: Value, expected_sched_id: u64, terminal: &mut Vec<(GcRef, Signal)>) {
        if self.vm.fiber_sched_id(fiber) != Some(expected_sched_id) {
            return;
        }
        let signal = self.vm.resume(fiber, vec![value]);
        match signal.kind {
            SignalKind::Event => {
                let sched_id = self.vm.fiber_sched_id(fiber).unwrap_or(0);
                self.events.schedule_soon(fiber, Value::Nil, sched_id);
            }
            SignalKind::Yield | SignalKind::User(_) => {}
            SignalKind::Ok | SignalKind::Error => {
                self.dispatch_supervisor(fiber, &signal);
                terminal.push((fiber, signal));
            }
        }
    }

    fn dispatch_supervisor(&mut self, fiber: GcRef, signal: &Signal) {
        let Some(sup) = self.vm.fiber_supervisor(fiber) else { return };
        let tag_name = if signal.kind == SignalKind::Ok { "ok" } else { "error" };
        let tag = self.vm.intern(tag_name);
        let envelope = Value::Tuple(Rc::from(vec![Value::Keyword(tag), signal.payload.clone()]));
        let _ = self.vm.channel_push(fiber, sup, envelope, PushMode::NonBlocking, &mut self.events);
    }

    /// Drain the ready queue and due timers until both are empty,
    /// returning every terminal (`Ok`/`Error`) signal observed along the
    /// way. Fibers that yield or park on an event are simply not resumed
    /// again until something re-schedules them. A thin convenience layer
    /// over repeated `loop1` ticks plus clock advancement for hosts that
    /// don't need per-tick control.
    pub fn run_until_idle(&mut self) -> Vec<(GcRef, Signal)> {
        let mut terminal = Vec::new();
        loop {
            terminal.extend(self.loop1());
            if !self.events.is_idle() {
                if let Some(wait) = self.events.next_deadline() {
                    self.events.advance(wait.as_millis() as u64);
                    continue;
                }
            }
            if self.events.is_idle() {
                break;
            }
        }
        terminal
    }

    pub fn make_table(&mut self) -> GcRef {
        self.vm.heap.alloc(HeapObj::Table(RefCell::new(Table::new())), 0)
    }

    pub fn make_array(&mut self, items: Vec<Value>) -> GcRef {
        let size = items.len() * std::mem::size_of::<Value>();
        self.vm.heap.alloc(HeapObj::Array(RefCell::new(items)), size)
    }

    pub fn string(&self, s: impl Into<Rc<str>>) -> Value {
        Value::String(Rc::new(lumen_core::LString::new(s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_identity(args: &mut [Value]) -> Result<Value, lumen_core::LumenError> {
        Ok(args.first().cloned().unwrap_or(Value::Nil))
    }

    #[test]
    fn registered_native_is_visible_in_globals() {
        let mut emb = Embedder::new(RuntimeConfig::default());
        emb.register_native("identity", native_identity);
        match emb.vm.heap.get(emb.vm.globals) {
            HeapObj::Table(t) => {
                let key = Value::String(Rc::new("identity".into()));
                assert!(t.borrow().get(&key).is_some());
            }
            _ => panic!("globals is always a table"),
        }
    }

    #[test]
    fn abstract_value_round_trips_through_downcast() {
        let mut emb = Embedder::new(RuntimeConfig::default());
        let r = emb.make_abstract::<u64>(42);
        assert_eq!(emb.downcast_abstract::<u64>(r), Some(&42));
        assert_eq!(emb.downcast_abstract::<String>(r), None);
    }

    #[test]
    fn run_until_idle_drains_an_immediately_returning_thunk() {
        let mut emb = Embedder::new(RuntimeConfig::default());
        let funcdef = Rc::new(FuncDef {
            arity: 0,
            is_variadic: false,
            num_slots: 1,
            bytecode: Rc::from(vec![
                crate::opcodes::Instruction { op: crate::opcodes::Opcode::LoadInt, a: 0, b: 0, c: 0 }.encode(),
                crate::opcodes::Instruction { op: crate::opcodes::Opcode::Return, a: 0, b: 0, c: 0 }.encode(),
            ]),
            constants: Rc::from(vec![]),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("t"),
        });
        let fiber = emb.make_thunk(funcdef);
        let terminal = emb.run_until_idle();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].0, fiber);
        assert_eq!(terminal[0].1.kind, SignalKind::Ok);
    }
}
