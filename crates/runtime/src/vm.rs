//! The register-based bytecode dispatch loop.
//!
//! Per spec §9's redesign note, a single `resume` call never stack-switches
//! mid-opcode (the teacher's `may::coroutine` model): the loop below runs
//! until the fiber's bytecode raises a signal or its outermost frame
//! returns, then hands a `Signal` back to the caller (the event loop in
//! `eventloop.rs`, or an embedder calling `resume` directly). Suspension is
//! therefore always an explicit, observable point — never an arbitrary
//! instruction boundary.

use lumen_core::heap::{Heap, HeapObj};
use lumen_core::interner::{InternedId, Interner};
use lumen_core::table::Table;
use lumen_core::value::Value;
use lumen_core::{EnvSource, Fiber, FiberStatus, FuncDef, GcRef, LumenError, Signal, SignalKind};
use std::cell::RefCell;
use std::rc::Rc;

use crate::opcodes::{Instruction, Opcode};

pub struct Vm {
    pub heap: Heap,
    pub globals: GcRef,
    interner: Interner,
    next_sched_id: u64,
}

impl Vm {
    pub fn new(gc_interval: usize) -> Self {
        let mut heap = Heap::new(gc_interval);
        let globals = heap.alloc(HeapObj::Table(RefCell::new(Table::new())), 0);
        heap.pin(globals);
        Vm { heap, globals, interner: Interner::new(), next_sched_id: 1 }
    }

    /// Intern `text`, for symbols/keywords arriving off the wire (the
    /// marshaller) or out of the compiler's own reader.
    pub fn intern(&mut self, text: &str) -> InternedId {
        self.interner.intern(text)
    }

    pub fn resolve_interned(&self, id: InternedId) -> &str {
        self.interner.resolve(id)
    }

    pub fn spawn(&mut self, funcdef: Rc<FuncDef>, max_registers: usize) -> GcRef {
        let sched_id = self.next_sched_id;
        self.next_sched_id += 1;
        let fiber = Fiber::new(funcdef, max_registers, sched_id);
        let r = self.heap.alloc(HeapObj::Fiber(RefCell::new(Some(fiber))), 256);
        lumen_core::stats::record_fiber_spawned();
        r
    }

    fn take_fiber(&self, r: GcRef) -> Fiber {
        match self.heap.get(r) {
            HeapObj::Fiber(cell) => cell
                .replace(None)
                .expect("resume called re-entrantly on the same fiber"),
            _ => panic!("GcRef does not reference a fiber"),
        }
    }

    fn put_fiber(&self, r: GcRef, fiber: Fiber) {
        match self.heap.get(r) {
            HeapObj::Fiber(cell) => *cell.borrow_mut() = Some(fiber),
            _ => panic!("GcRef does not reference a fiber"),
        }
    }

    /// Current `sched_id` of the fiber at `r`, or `None` if it isn't a
    /// fiber or is currently taken out for an in-progress resume (the
    /// caller should treat that as "can't tell, don't act yet").
    pub fn fiber_sched_id(&self, r: GcRef) -> Option<u64> {
        match self.heap.get(r) {
            HeapObj::Fiber(cell) => cell.borrow().as_ref().map(|f| f.sched_id),
            _ => None,
        }
    }

    /// Whether the fiber at `r` is in a state `resume` would accept.
    pub fn fiber_can_resume(&self, r: GcRef) -> bool {
        match self.heap.get(r) {
            HeapObj::Fiber(cell) => cell.borrow().as_ref().map(|f| f.can_resume()).unwrap_or(false),
            _ => false,
        }
    }

    /// The fiber's registered supervisor channel, if any.
    pub fn fiber_supervisor(&self, r: GcRef) -> Option<GcRef> {
        match self.heap.get(r) {
            HeapObj::Fiber(cell) => cell.borrow().as_ref().and_then(|f| f.supervisor),
            _ => None,
        }
    }

    /// Forcibly complete a fiber with a terminal `Error` signal carrying
    /// `reason`, without executing any further bytecode. Models deadline
    /// expiry and timeout cancellation (§4.F), which both need to end a
    /// parked fiber's life without a "resume with injected error" opcode.
    /// Returns `None` if the fiber cannot currently be resumed (already
    /// dead, or taken out by an in-progress resume elsewhere).
    pub fn cancel_fiber(&mut self, r: GcRef, reason: &str) -> Option<Signal> {
        if !self.fiber_can_resume(r) {
            return None;
        }
        let mut fiber = self.take_fiber(r);
        let signal = Signal {
            kind: SignalKind::Error,
            payload: Value::String(Rc::new(reason.into())),
        };
        fiber.status = FiberStatus::Error;
        fiber.last_signal = Some(signal.clone());
        lumen_core::stats::record_fiber_completed();
        self.put_fiber(r, fiber);
        Some(signal)
    }

    /// Resume a fiber with the given arguments, running until it yields,
    /// raises an event/error/user signal, or returns.
    pub fn resume(&mut self, fiber_ref: GcRef, args: Vec<Value>) -> Signal {
        let mut fiber = self.take_fiber(fiber_ref);
        if !fiber.can_resume() {
            self.put_fiber(fiber_ref, fiber);
            return Signal {
                kind: SignalKind::Error,
                payload: Value::String(Rc::new(
                    LumenError::ResourceClosed("fiber").to_string().into(),
                )),
            };
        }
        fiber.status = FiberStatus::Alive;
        fiber.sched_id = self.next_sched_id;
        self.next_sched_id += 1;
        if fiber.frames.len() == 1 && fiber.frames[0].pc == 0 {
            let base = fiber.current_frame().register_base as usize;
            for (i, a) in args.into_iter().enumerate() {
                if base + i < fiber.registers.len() {
                    fiber.registers[base + i] = a;
                }
            }
            let funcdef = fiber.current_frame().funcdef.clone();
            fiber.box_captured_slots(&mut self.heap, &funcdef, fiber.current_frame().register_base);
        }

        let signal = self.run(&mut fiber);

        fiber.status = match signal.kind {
            SignalKind::Yield | SignalKind::Event | SignalKind::User(_) => FiberStatus::Suspended,
            SignalKind::Ok => {
                lumen_core::stats::record_fiber_completed();
                FiberStatus::Dead
            }
            SignalKind::Error => {
                lumen_core::stats::record_fiber_completed();
                FiberStatus::Error
            }
        };
        fiber.last_signal = Some(signal.clone());
        self.put_fiber(fiber_ref, fiber);

        if self.heap.should_collect() {
            self.collect_garbage(&[]);
        }
        signal
    }

    /// Run a mark-sweep pass, rooted at the VM's globals plus anything the
    /// caller still needs live (e.g. a register holding a value not yet
    /// stored anywhere else).
    pub fn collect_garbage(&mut self, extra_roots: &[Value]) {
        self.heap.collect(extra_roots);
        lumen_core::stats::record_collection(self.heap.stats());
    }

    fn run(&mut self, fiber: &mut Fiber) -> Signal {
        loop {
            let frame_idx = fiber.frames.len() - 1;
            let pc = fiber.frames[frame_idx].pc;
            let word = fiber.frames[frame_idx].funcdef.bytecode[pc as usize];
            fiber.frames[frame_idx].pc += 1;
            let insn = Instruction::decode(word);
            match self.execute(fiber, insn) {
                Step::Continue => continue,
                Step::Finished(sig) => return sig,
            }
        }
    }

    fn reg(fiber: &Fiber, n: u8) -> Value {
        let base = fiber.current_frame().register_base as usize;
        fiber.registers[base + n as usize].clone()
    }

    fn set_reg(fiber: &mut Fiber, n: u8, v: Value) {
        let base = fiber.current_frame().register_base as usize;
        fiber.registers[base + n as usize] = v;
    }

    fn execute(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        use Opcode::*;
        match insn.op {
            NoOp => Step::Continue,
            LoadNil => {
                Self::set_reg(fiber, insn.a, Value::Nil);
                Step::Continue
            }
            LoadTrue => {
                Self::set_reg(fiber, insn.a, Value::Bool(true));
                Step::Continue
            }
            LoadFalse => {
                Self::set_reg(fiber, insn.a, Value::Bool(false));
                Step::Continue
            }
            LoadInt => {
                Self::set_reg(fiber, insn.a, Value::Int(insn.imm16() as i64));
                Step::Continue
            }
            LoadConst => {
                // `a` is the destination register, `b`/`c` a 16-bit
                // constant-pool index (mirrors MakeClosure's idx16).
                let idx = insn.idx16() as usize;
                let c = fiber.current_frame().funcdef.constants[idx].clone();
                Self::set_reg(fiber, insn.a, c);
                Step::Continue
            }
            Move => {
                let v = Self::reg(fiber, insn.b);
                Self::set_reg(fiber, insn.a, v);
                Step::Continue
            }
            MoveUp => self.exec_move_up(fiber, insn),
            MoveUpSet => self.exec_move_up_set(fiber, insn),
            Add | Sub | Mul | Div | Mod | BAnd | BOr | BXor | Shl | Shr => {
                self.exec_binop(fiber, insn)
            }
            Neg => {
                let v = Self::reg(fiber, insn.b);
                match arith_neg(&v) {
                    Ok(r) => {
                        Self::set_reg(fiber, insn.a, r);
                        Step::Continue
                    }
                    Err(e) => self.raise(fiber, e),
                }
            }
            BNot => {
                let v = Self::reg(fiber, insn.b);
                match v {
                    Value::Int(i) => {
                        Self::set_reg(fiber, insn.a, Value::Int(!i));
                        Step::Continue
                    }
                    other => self.raise(
                        fiber,
                        LumenError::TypeMismatch { expected: "integer", found: other.type_name() },
                    ),
                }
            }
            Eq | Neq | Lt | Lte | Gt | Gte => self.exec_cmp(fiber, insn),
            Jump => {
                let off = insn.imm24_signed();
                self.jump(fiber, off);
                Step::Continue
            }
            JumpIf => {
                if Self::reg(fiber, insn.a).is_truthy() {
                    self.jump(fiber, insn.imm16() as i32);
                }
                Step::Continue
            }
            JumpIfNot => {
                if !Self::reg(fiber, insn.a).is_truthy() {
                    self.jump(fiber, insn.imm16() as i32);
                }
                Step::Continue
            }
            MakeArray => {
                let start = insn.b;
                let count = insn.c;
                let base = fiber.current_frame().register_base as usize;
                let items = (0..count)
                    .map(|i| fiber.registers[base + start as usize + i as usize].clone())
                    .collect::<Vec<_>>();
                let r = self.heap.alloc(HeapObj::Array(RefCell::new(items)), 16);
                Self::set_reg(fiber, insn.a, Value::array(r));
                Step::Continue
            }
            MakeBuffer => {
                let r = self.heap.alloc(HeapObj::Buffer(RefCell::new(Vec::new())), 16);
                Self::set_reg(fiber, insn.a, Value::Buffer(r));
                Step::Continue
            }
            MakeTuple => {
                let start = insn.b;
                let count = insn.c;
                let base = fiber.current_frame().register_base as usize;
                let items: Vec<Value> = (0..count)
                    .map(|i| fiber.registers[base + start as usize + i as usize].clone())
                    .collect();
                Self::set_reg(fiber, insn.a, Value::Tuple(items.into()));
                Step::Continue
            }
            MakeStruct => {
                let start = insn.b;
                let count = insn.c;
                let base = fiber.current_frame().register_base as usize;
                let items: Vec<Value> = (0..count)
                    .map(|i| fiber.registers[base + start as usize + i as usize].clone())
                    .collect();
                let data = lumen_core::table::make_struct(items);
                Self::set_reg(fiber, insn.a, Value::Struct(Rc::new(data)));
                Step::Continue
            }
            MakeTable => {
                let r = self.heap.alloc(HeapObj::Table(RefCell::new(Table::new())), 32);
                Self::set_reg(fiber, insn.a, Value::table(r));
                Step::Continue
            }
            MakeClosure => self.exec_make_closure(fiber, insn),
            Get => self.exec_get(fiber, insn),
            Put => self.exec_put(fiber, insn),
            Call | TailCall => self.exec_call(fiber, insn),
            Return => {
                let v = Self::reg(fiber, insn.a);
                if fiber.frames.len() == 1 {
                    return Step::Finished(Signal { kind: SignalKind::Ok, payload: v });
                }
                let dest = fiber.current_frame().call_dest;
                fiber.pop_frame();
                Self::set_reg(fiber, dest, v);
                Step::Continue
            }
            Signal => {
                let payload = Self::reg(fiber, insn.b);
                let kind = match insn.c {
                    0 => SignalKind::Ok,
                    1 => SignalKind::Yield,
                    2 => SignalKind::Event,
                    3 => SignalKind::Error,
                    n => SignalKind::User(n - 4),
                };
                Step::Finished(Signal { kind, payload })
            }
            Error => {
                let payload = Self::reg(fiber, insn.a);
                Step::Finished(Signal { kind: SignalKind::Error, payload })
            }
            Resume => self.exec_resume(fiber, insn),
            Propagate => {
                let payload = Self::reg(fiber, insn.a);
                Step::Finished(Signal { kind: SignalKind::Error, payload })
            }
            Next => {
                // advance-iterator primitive: callers drive `each`/`loop`
                // desugarings through this; the value model's containers
                // are random-access so `Next` just increments a counter
                // register (b) and checks it against a length register (c).
                let idx = Self::reg(fiber, insn.b);
                let len = Self::reg(fiber, insn.c);
                if let (Value::Int(i), Value::Int(l)) = (idx, len) {
                    Self::set_reg(fiber, insn.a, Value::Bool(i < l));
                } else {
                    return self.raise(
                        fiber,
                        LumenError::TypeMismatch { expected: "integer", found: "other" },
                    );
                }
                Step::Continue
            }
            Cancel => {
                // Marks the current frame's pending suspension (if any) as
                // cancelled; the event loop consults this via the fiber's
                // last_signal before deciding whether to redeliver.
                fiber.last_signal = None;
                Step::Continue
            }
        }
    }

    fn jump(&self, fiber: &mut Fiber, offset: i32) {
        let frame = fiber.frames.last_mut().expect("active frame");
        frame.pc = (frame.pc as i64 + offset as i64) as u32;
    }

    fn raise(&self, fiber: &mut Fiber, err: LumenError) -> Step {
        let _ = fiber;
        Step::Finished(Signal {
            kind: SignalKind::Error,
            payload: Value::String(Rc::new(err.to_string().into())),
        })
    }

    fn exec_binop(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let a = Self::reg(fiber, insn.b);
        let b = Self::reg(fiber, insn.c);
        match arith_binop(insn.op, &a, &b) {
            Ok(v) => {
                Self::set_reg(fiber, insn.a, v);
                Step::Continue
            }
            Err(e) => self.raise(fiber, e),
        }
    }

    fn exec_cmp(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let a = Self::reg(fiber, insn.b);
        let b = Self::reg(fiber, insn.c);
        let result = match insn.op {
            Opcode::Eq => a.structural_eq(&b),
            Opcode::Neq => !a.structural_eq(&b),
            _ => match numeric_cmp(&a, &b) {
                Ok(ord) => match insn.op {
                    Opcode::Lt => ord == std::cmp::Ordering::Less,
                    Opcode::Lte => ord != std::cmp::Ordering::Greater,
                    Opcode::Gt => ord == std::cmp::Ordering::Greater,
                    Opcode::Gte => ord != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                },
                Err(e) => return self.raise(fiber, e),
            },
        };
        Self::set_reg(fiber, insn.a, Value::Bool(result));
        Step::Continue
    }

    fn exec_move_up(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let cell = if insn.c == 0 {
            match Self::reg(fiber, insn.b) {
                Value::Array(r) => r,
                other => {
                    return self.raise(
                        fiber,
                        LumenError::TypeMismatch { expected: "boxed local", found: other.type_name() },
                    )
                }
            }
        } else {
            fiber.current_frame().function_env[insn.b as usize]
        };
        let v = match self.heap.get(cell) {
            HeapObj::Array(arr) => arr.borrow()[0].clone(),
            _ => return self.raise(fiber, LumenError::TypeMismatch { expected: "boxed local", found: "other" }),
        };
        Self::set_reg(fiber, insn.a, v);
        Step::Continue
    }

    fn exec_move_up_set(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let cell = if insn.c == 0 {
            match Self::reg(fiber, insn.b) {
                Value::Array(r) => r,
                other => {
                    return self.raise(
                        fiber,
                        LumenError::TypeMismatch { expected: "boxed local", found: other.type_name() },
                    )
                }
            }
        } else {
            fiber.current_frame().function_env[insn.b as usize]
        };
        let v = Self::reg(fiber, insn.a);
        match self.heap.get(cell) {
            HeapObj::Array(arr) => arr.borrow_mut()[0] = v,
            _ => return self.raise(fiber, LumenError::TypeMismatch { expected: "boxed local", found: "other" }),
        }
        Step::Continue
    }

    fn exec_make_closure(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let child_idx = insn.idx16() as usize;
        let parent_funcdef = fiber.current_frame().funcdef.clone();
        let child = parent_funcdef.children[child_idx].clone();
        let parent_base = fiber.current_frame().register_base as usize;
        let mut envs = Vec::with_capacity(child.captured_envs.len());
        for desc in child.captured_envs.iter() {
            let cell = match desc.source {
                EnvSource::ParentLocal(slot) => match fiber.registers[parent_base + slot as usize] {
                    Value::Array(r) => r,
                    _ => return self.raise(fiber, LumenError::MacroExpansion("capture of unboxed local".into())),
                },
                EnvSource::ParentUpvalue(idx) => fiber.current_frame().function_env[idx as usize],
            };
            envs.push(cell);
        }
        let data = lumen_core::function::FunctionData { def: child, envs };
        let r = self.heap.alloc(HeapObj::Function(data), 32);
        Self::set_reg(fiber, insn.a, Value::function(r));
        Step::Continue
    }

    fn exec_get(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let container = Self::reg(fiber, insn.b);
        let key = Self::reg(fiber, insn.c);
        let result = match &container {
            Value::Array(r) => match (&key, self.heap.get(*r)) {
                (Value::Int(i), HeapObj::Array(a)) => {
                    let a = a.borrow();
                    a.get(*i as usize).cloned()
                }
                _ => None,
            },
            Value::Tuple(items) => match key {
                Value::Int(i) if i >= 0 && (i as usize) < items.len() => Some(items[i as usize].clone()),
                _ => None,
            },
            Value::Struct(s) => match key {
                Value::Int(i) if i >= 0 && (i as usize) < s.fields.len() => Some(s.fields[i as usize].clone()),
                _ => None,
            },
            Value::Table(r) => match self.heap.get(*r) {
                HeapObj::Table(t) => t.borrow().get(&key).cloned(),
                _ => None,
            },
            other => {
                return self.raise(
                    fiber,
                    LumenError::TypeMismatch { expected: "indexable", found: other.type_name() },
                )
            }
        };
        Self::set_reg(fiber, insn.a, result.unwrap_or(Value::Nil));
        Step::Continue
    }

    fn exec_put(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let container = Self::reg(fiber, insn.a);
        let key = Self::reg(fiber, insn.b);
        let value = Self::reg(fiber, insn.c);
        match &container {
            Value::Array(r) => match (&key, self.heap.get(*r)) {
                (Value::Int(i), HeapObj::Array(a)) => {
                    let mut a = a.borrow_mut();
                    let idx = *i as usize;
                    if idx >= a.len() {
                        a.resize(idx + 1, Value::Nil);
                    }
                    a[idx] = value;
                    Step::Continue
                }
                _ => self.raise(fiber, LumenError::TypeMismatch { expected: "integer index", found: key.type_name() }),
            },
            Value::Table(r) => match self.heap.get(*r) {
                HeapObj::Table(t) => {
                    t.borrow_mut().insert(key, value);
                    Step::Continue
                }
                _ => unreachable!(),
            },
            other => self.raise(fiber, LumenError::TypeMismatch { expected: "mutable container", found: other.type_name() }),
        }
    }

    fn exec_call(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let func_val = Self::reg(fiber, insn.b);
        let argc = insn.c;
        let base = fiber.current_frame().register_base as usize;
        let args: Vec<Value> = (0..argc)
            .map(|i| fiber.registers[base + insn.b as usize + 1 + i as usize].clone())
            .collect();
        match func_val {
            Value::Function(r) => {
                let (def, envs) = match self.heap.get(r) {
                    HeapObj::Function(f) => (f.def.clone(), f.envs.clone()),
                    _ => return self.raise(fiber, LumenError::TypeMismatch { expected: "function", found: "other" }),
                };
                let call_dest = if insn.op == Opcode::TailCall {
                    // A tail call discards the current frame and forwards its
                    // return destination: when the new frame returns, the
                    // value lands where *this* frame's caller expects it.
                    let inherited = fiber.current_frame().call_dest;
                    fiber.pop_frame();
                    inherited
                } else {
                    insn.a
                };
                match fiber.begin_frame_with_dest(&mut self.heap, def, envs, &args, call_dest) {
                    Ok(()) => Step::Continue,
                    Err(e) => self.raise(fiber, e),
                }
            }
            Value::CFunction(f) => {
                let mut args = args;
                match f(&mut args) {
                    Ok(v) => {
                        Self::set_reg(fiber, insn.a, v);
                        Step::Continue
                    }
                    Err(e) => self.raise(fiber, e),
                }
            }
            other => self.raise(fiber, LumenError::TypeMismatch { expected: "callable", found: other.type_name() }),
        }
    }

    fn exec_resume(&mut self, fiber: &mut Fiber, insn: Instruction) -> Step {
        let target = Self::reg(fiber, insn.b);
        let arg = Self::reg(fiber, insn.c);
        let target_ref = match target {
            Value::Fiber(r) => r,
            other => {
                return self.raise(fiber, LumenError::TypeMismatch { expected: "fiber", found: other.type_name() })
            }
        };
        let sig = self.resume(target_ref, vec![arg]);
        let masked = fiber.signal_mask & lumen_core::fiber::mask_bit(sig.kind) != 0;
        let tuple = Value::Tuple(
            vec![Value::Int(signal_tag(sig.kind)), sig.payload.clone()].into(),
        );
        Self::set_reg(fiber, insn.a, tuple);
        if !masked && !matches!(sig.kind, SignalKind::Ok) {
            return Step::Finished(sig);
        }
        Step::Continue
    }
}

fn signal_tag(kind: SignalKind) -> i64 {
    match kind {
        SignalKind::Ok => 0,
        SignalKind::Yield => 1,
        SignalKind::Event => 2,
        SignalKind::Error => 3,
        SignalKind::User(n) => 4 + n as i64,
    }
}

enum Step {
    Continue,
    Finished(Signal),
}

fn arith_neg(v: &Value) -> Result<Value, LumenError> {
    match v {
        Value::Int(i) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| LumenError::Numeric("integer overflow".into())),
        Value::Real(r) => Ok(Value::Real(-r)),
        other => Err(LumenError::TypeMismatch { expected: "number", found: other.type_name() }),
    }
}

fn arith_binop(op: Opcode, a: &Value, b: &Value) -> Result<Value, LumenError> {
    use Opcode::*;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let r = match op {
                Add => x.checked_add(*y),
                Sub => x.checked_sub(*y),
                Mul => x.checked_mul(*y),
                Div => {
                    if *y == 0 {
                        return Err(LumenError::Numeric("division by zero".into()));
                    }
                    x.checked_div(*y)
                }
                Mod => {
                    if *y == 0 {
                        return Err(LumenError::Numeric("division by zero".into()));
                    }
                    x.checked_rem(*y)
                }
                BAnd => Some(x & y),
                BOr => Some(x | y),
                BXor => Some(x ^ y),
                Shl => Some(x.wrapping_shl(*y as u32)),
                Shr => Some(x.wrapping_shr(*y as u32)),
                _ => unreachable!(),
            };
            r.map(Value::Int).ok_or_else(|| LumenError::Numeric("integer overflow".into()))
        }
        (Value::Real(_), _) | (_, Value::Real(_)) if matches!(op, Add | Sub | Mul | Div | Mod) => {
            let x = as_f64(a)?;
            let y = as_f64(b)?;
            let r = match op {
                Add => x + y,
                Sub => x - y,
                Mul => x * y,
                Div => x / y,
                Mod => x % y,
                _ => unreachable!(),
            };
            Ok(Value::Real(r))
        }
        _ => Err(LumenError::TypeMismatch { expected: "number", found: b.type_name() }),
    }
}

fn as_f64(v: &Value) -> Result<f64, LumenError> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Real(r) => Ok(*r),
        other => Err(LumenError::TypeMismatch { expected: "number", found: other.type_name() }),
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Result<std::cmp::Ordering, LumenError> {
    let x = as_f64(a)?;
    let y = as_f64(b)?;
    x.partial_cmp(&y).ok_or_else(|| LumenError::Numeric("comparison with NaN".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::Instruction;
    use lumen_core::funcdef::{EnvDescriptor, SourcePos};

    fn make_simple(bytecode: Vec<Instruction>, constants: Vec<Value>, num_slots: u16) -> Rc<FuncDef> {
        Rc::new(FuncDef {
            arity: 0,
            is_variadic: false,
            num_slots,
            bytecode: bytecode.into_iter().map(|i| i.encode()).collect::<Vec<_>>().into(),
            constants: constants.into(),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![SourcePos { pc: 0, line: 1, column: 1 }]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("test"),
        })
    }

    #[test]
    fn arithmetic_end_to_end() {
        // r0 = 2, r1 = 3, r2 = r0 + r1, return r2
        let fd = make_simple(
            vec![
                Instruction { op: Opcode::LoadInt, a: 0, b: 2, c: 0 },
                Instruction { op: Opcode::LoadInt, a: 1, b: 3, c: 0 },
                Instruction { op: Opcode::Add, a: 2, b: 0, c: 1 },
                Instruction { op: Opcode::Return, a: 2, b: 0, c: 0 },
            ],
            vec![],
            3,
        );
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(fd, 1024);
        let sig = vm.resume(fiber, vec![]);
        assert_eq!(sig.kind, SignalKind::Ok);
        assert_eq!(sig.payload, Value::Int(5));
    }

    #[test]
    fn recursive_countdown_via_self_call() {
        // fn(n) = if n <= 0 { 0 } else { self_tail_call(n - 1) } -- modeled
        // with a loop using Jump instead of real recursion to keep the
        // fixture self-contained (no global lookup wired up here).
        let fd = make_simple(
            vec![
                Instruction { op: Opcode::LoadInt, a: 0, b: 5, c: 0 }, // r0 = 5 (counter)
                Instruction { op: Opcode::LoadInt, a: 1, b: 0, c: 0 }, // r1 = 0
                // loop: if r0 <= r1 jump to return
                Instruction { op: Opcode::Lte, a: 2, b: 0, c: 1 },
                Instruction { op: Opcode::JumpIf, a: 2, b: 3, c: 0 }, // +3 -> Return
                Instruction { op: Opcode::LoadInt, a: 3, b: 1, c: 0 },
                Instruction { op: Opcode::Sub, a: 0, b: 0, c: 3 },
                Instruction { op: Opcode::Jump, a: 0xfc, b: 0xff, c: 0xff }, // -4
                Instruction { op: Opcode::Return, a: 0, b: 0, c: 0 },
            ],
            vec![],
            4,
        );
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(fd, 1024);
        let sig = vm.resume(fiber, vec![]);
        assert_eq!(sig.payload, Value::Int(0));
    }

    #[test]
    fn fiber_yields_then_returns_then_is_dead() {
        let fd = make_simple(
            vec![
                Instruction { op: Opcode::LoadInt, a: 0, b: 1, c: 0 },
                Instruction { op: Opcode::Signal, a: 0, b: 0, c: 1 }, // yield 1
                Instruction { op: Opcode::LoadInt, a: 1, b: 2, c: 0 },
                Instruction { op: Opcode::Return, a: 1, b: 0, c: 0 },
            ],
            vec![],
            2,
        );
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(fd, 1024);
        let first = vm.resume(fiber, vec![]);
        assert_eq!(first.kind, SignalKind::Yield);
        assert_eq!(first.payload, Value::Int(1));
        let second = vm.resume(fiber, vec![]);
        assert_eq!(second.kind, SignalKind::Ok);
        assert_eq!(second.payload, Value::Int(2));
        let third = vm.resume(fiber, vec![]);
        assert_eq!(third.kind, SignalKind::Error);
    }

    #[test]
    fn closure_over_shared_upvalue_sees_mutation() {
        // r0 is pre-boxed at fiber creation (closure_bitset bit 0), so it
        // already holds a boxed cell before any bytecode runs. Ordinary
        // instructions never touch r0 directly; MOVE_UP_SET/MOVE_UP route
        // through the box register (b, mode c=0) to read/write the shared
        // cell, proving a later read observes an earlier write.
        let mut parent = (*make_simple(
            vec![
                Instruction { op: Opcode::LoadInt, a: 1, b: 99, c: 0 }, // scratch r1 = 99
                Instruction { op: Opcode::MoveUpSet, a: 1, b: 0, c: 0 }, // box[r0] = r1
                Instruction { op: Opcode::MoveUp, a: 2, b: 0, c: 0 },    // r2 = box[r0]
                Instruction { op: Opcode::Return, a: 2, b: 0, c: 0 },
            ],
            vec![],
            3,
        ))
        .clone();
        parent.closure_bitset = 0b1;
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(Rc::new(parent), 1024);
        let sig = vm.resume(fiber, vec![]);
        assert_eq!(sig.payload, Value::Int(99));
    }

    #[test]
    fn array_get_put_round_trip() {
        let fd = make_simple(
            vec![
                Instruction { op: Opcode::LoadInt, a: 0, b: 10, c: 0 },
                Instruction { op: Opcode::LoadInt, a: 1, b: 20, c: 0 },
                Instruction { op: Opcode::MakeArray, a: 2, b: 0, c: 2 },
                Instruction { op: Opcode::LoadInt, a: 3, b: 0, c: 0 },
                Instruction { op: Opcode::Get, a: 4, b: 2, c: 3 },
                Instruction { op: Opcode::Return, a: 4, b: 0, c: 0 },
            ],
            vec![],
            5,
        );
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(fd, 1024);
        let sig = vm.resume(fiber, vec![]);
        assert_eq!(sig.payload, Value::Int(10));
    }

    #[test]
    fn calling_nested_function_returns_its_value() {
        // child(x) = x, called with one argument landing in its own r0.
        let child = Rc::new(FuncDef {
            arity: 1,
            is_variadic: false,
            num_slots: 1,
            bytecode: vec![Instruction { op: Opcode::Return, a: 0, b: 0, c: 0 }]
                .into_iter()
                .map(|i| i.encode())
                .collect::<Vec<_>>()
                .into(),
            constants: Rc::from(vec![]),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("child"),
        });
        let envdesc: Rc<[EnvDescriptor]> = Rc::from(vec![]);
        let _ = envdesc; // not exercised in this fixture (no captures)
        let parent_children: Rc<[Rc<FuncDef>]> = Rc::from(vec![child]);
        let parent = Rc::new(FuncDef {
            arity: 0,
            is_variadic: false,
            num_slots: 3,
            bytecode: vec![
                Instruction { op: Opcode::MakeClosure, a: 0, b: 0, c: 0 }, // r0 = closure (callee in r0, arg in r1)
                Instruction { op: Opcode::LoadInt, a: 1, b: 7, c: 0 },     // r1 = argument value
                Instruction { op: Opcode::Call, a: 2, b: 0, c: 1 },        // r2 = call r0(r1)
                Instruction { op: Opcode::Return, a: 2, b: 0, c: 0 },
            ]
            .into_iter()
            .map(|i| i.encode())
            .collect::<Vec<_>>()
            .into(),
            constants: Rc::from(vec![]),
            children: parent_children,
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("parent"),
        });
        let mut vm = Vm::new(1_000_000);
        let fiber = vm.spawn(parent, 1024);
        let sig = vm.resume(fiber, vec![]);
        assert_eq!(sig.payload, Value::Int(7));
    }
}
