//! End-to-end scenarios exercising a fiber's full signal sequence, a
//! two-fiber channel hand-off, deadline cancellation, and a marshal
//! round-trip through a separate `Vm`. Each test drives the public
//! embedding surface rather than poking at crate-internal state.

use std::rc::Rc;

use lumen_core::heap::HeapObj;
use lumen_core::value::Value;
use lumen_core::{FuncDef, GcRef, SignalKind};

use lumen_runtime::channel::{PopMode, PopOutcome, PushMode, PushOutcome};
use lumen_runtime::marshal::{marshal, unmarshal, AbstractHooks};
use lumen_runtime::opcodes::{Instruction, Opcode};
use lumen_runtime::{Embedder, EventLoop, RuntimeConfig, Vm};

fn thunk(bytecode: Vec<Instruction>, num_slots: u16) -> Rc<FuncDef> {
    Rc::new(FuncDef {
        arity: 0,
        is_variadic: false,
        num_slots,
        bytecode: bytecode.into_iter().map(|i| i.encode()).collect::<Vec<_>>().into(),
        constants: Rc::from(vec![]),
        children: Rc::from(vec![]),
        captured_envs: Rc::from(vec![]),
        closure_bitset: 0,
        source_map: Rc::from(vec![]),
        symbolmap: Rc::from(vec![]),
        source_name: Rc::from("e2e"),
    })
}

/// Never executed; stands in for a fiber used purely as a channel-waiter
/// identity in tests that don't need to resume it.
fn idle_fiber(vm: &mut Vm) -> GcRef {
    vm.spawn(thunk(vec![Instruction { op: Opcode::Return, a: 0, b: 0, c: 0 }], 1), 16)
}

#[test]
fn fiber_yields_three_times_then_returns_then_rejects_a_fifth_resume() {
    // r0=1 yield, r1=2 yield, r2=3 yield, r3=4 return.
    let fd = thunk(
        vec![
            Instruction { op: Opcode::LoadInt, a: 0, b: 1, c: 0 },
            Instruction { op: Opcode::Signal, a: 0, b: 0, c: 1 },
            Instruction { op: Opcode::LoadInt, a: 1, b: 2, c: 0 },
            Instruction { op: Opcode::Signal, a: 0, b: 1, c: 1 },
            Instruction { op: Opcode::LoadInt, a: 2, b: 3, c: 0 },
            Instruction { op: Opcode::Signal, a: 0, b: 2, c: 1 },
            Instruction { op: Opcode::LoadInt, a: 3, b: 4, c: 0 },
            Instruction { op: Opcode::Return, a: 3, b: 0, c: 0 },
        ],
        4,
    );
    let mut vm = Vm::new(1_000_000);
    let fiber = vm.spawn(fd, 1024);

    let signals: Vec<_> = (0..4).map(|_| vm.resume(fiber, vec![])).collect();
    assert_eq!(signals[0].kind, SignalKind::Yield);
    assert_eq!(signals[0].payload, Value::Int(1));
    assert_eq!(signals[1].kind, SignalKind::Yield);
    assert_eq!(signals[1].payload, Value::Int(2));
    assert_eq!(signals[2].kind, SignalKind::Yield);
    assert_eq!(signals[2].payload, Value::Int(3));
    assert_eq!(signals[3].kind, SignalKind::Ok);
    assert_eq!(signals[3].payload, Value::Int(4));

    let fifth = vm.resume(fiber, vec![]);
    assert_eq!(fifth.kind, SignalKind::Error);
}

#[test]
fn channel_round_trip_delivers_two_writes_to_two_reads_in_order() {
    let mut vm = Vm::new(1_000_000);
    let mut events = EventLoop::new();
    let chan = vm.open_channel(1, false);
    let writer = idle_fiber(&mut vm);
    let reader = idle_fiber(&mut vm);

    let first_write = vm.channel_push(writer, chan, Value::Int(b'a' as i64), PushMode::Blocking, &mut events).unwrap();
    assert!(matches!(first_write, PushOutcome::Sent));
    // Channel is now at capacity; the second write parks the writer behind
    // a transient overflow slot rather than failing outright.
    let second_write = vm.channel_push(writer, chan, Value::Int(b'b' as i64), PushMode::Blocking, &mut events).unwrap();
    assert!(matches!(second_write, PushOutcome::WouldBlock));

    let mut received = Vec::new();
    for _ in 0..2 {
        match vm.channel_pop(reader, chan, PopMode::Blocking, &mut events).unwrap() {
            PopOutcome::Received(v) => received.push(v),
            _ => panic!("expected a received value"),
        }
    }

    assert_eq!(received, vec![Value::Int(b'a' as i64), Value::Int(b'b' as i64)]);

    // The writer's parked wakeup was posted once the first pop freed a slot.
    let woken = events.pop_ready().expect("writer should have been woken on the first pop");
    assert_eq!(woken.fiber, writer);
    assert!(events.is_idle());
}

#[test]
fn deadline_cancels_a_sleeping_fiber_with_deadline_expired() {
    let mut emb = Embedder::new(RuntimeConfig::default());
    let fiber = idle_fiber(&mut emb.vm);
    emb.events.schedule_deadline(fiber, 10);

    let terminal = loop {
        let done = emb.loop1();
        if !done.is_empty() {
            break done;
        }
        let wait = emb.events.next_deadline().expect("a deadline is still pending");
        emb.events.advance(wait.as_millis() as u64);
    };

    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].0, fiber);
    assert_eq!(terminal[0].1.kind, SignalKind::Error);
    match &terminal[0].1.payload {
        Value::String(s) => assert_eq!(s.as_str(), "deadline expired"),
        other => panic!("expected a string payload, got {other:?}"),
    }
}

#[test]
fn marshal_round_trip_resolves_a_self_reference_through_a_fresh_vm() {
    let mut source = Vm::new(1_000_000);
    let cell = source.heap.alloc(HeapObj::Array(std::cell::RefCell::new(Vec::new())), 0);
    // A tuple nested inside the array, one of whose own fields points back
    // at the array that holds it -- the named reference the backref tag
    // exists to resolve without looping forever.
    let inner = Value::Tuple(Rc::from(vec![Value::Int(1), Value::array(cell)]));
    if let HeapObj::Array(a) = source.heap.get(cell) {
        a.borrow_mut().push(inner);
    }
    let root = Value::array(cell);

    let bytes = marshal(&source, &root, AbstractHooks::default()).unwrap();

    let mut fresh = Vm::new(1_000_000);
    let back = unmarshal(&mut fresh, &bytes, AbstractHooks::default()).unwrap();

    let mut visited = std::collections::HashSet::new();
    match back {
        Value::Array(back_ref) => {
            visited.insert(back_ref);
            match fresh.heap.get(back_ref) {
                HeapObj::Array(a) => {
                    let contents = a.borrow();
                    assert_eq!(contents.len(), 1);
                    match &contents[0] {
                        Value::Tuple(items) => {
                            assert_eq!(items[0], Value::Int(1));
                            match items[1] {
                                Value::Array(self_ref) => assert!(visited.contains(&self_ref)),
                                ref other => panic!("expected the self-reference to decode as an array, got {other:?}"),
                            }
                        }
                        other => panic!("expected the nested tuple to survive the round-trip, got {other:?}"),
                    }
                }
                _ => panic!("expected an array"),
            }
        }
        other => panic!("expected an array, got {other:?}"),
    }
}
