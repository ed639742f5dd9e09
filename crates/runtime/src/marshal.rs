//! Deterministic tagged-byte image format: `marshal`/`unmarshal` a `Value`
//! graph, including shared and cyclic structure, to and from a flat byte
//! buffer.
//!
//! Grounded on the teacher's `seq-compiler` constant-pool encoding (a tag
//! byte followed by a type-specific payload, varint-style small-integer
//! fast paths) generalized from "function constants only" to "arbitrary
//! live values, with back-references for anything that can be shared or
//! cyclic." Only heap-addressed kinds (`Array`, `Table`, `Function`,
//! `Fiber`) need back-reference bookkeeping; `Tuple`/`Struct`/`String` are
//! acyclic by construction and are always written inline.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use lumen_core::heap::HeapObj;
use lumen_core::table::Table;
use lumen_core::value::{StructData, Value};
use lumen_core::{EnvDescriptor, EnvSource, Fiber, FiberStatus, Frame, FuncDef, GcRef, LString, LumenError, SourcePos};

use crate::vm::Vm;

const TAG_NIL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INT_SMALL: u8 = 3; // payload byte itself encodes value - 100..100 as offset
const TAG_INT_FULL: u8 = 4;
const TAG_REAL: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_SYMBOL: u8 = 7;
const TAG_KEYWORD: u8 = 8;
const TAG_TUPLE: u8 = 9;
const TAG_STRUCT: u8 = 10;
const TAG_ARRAY: u8 = 11;
const TAG_TABLE: u8 = 12;
const TAG_BUFFER: u8 = 13;
const TAG_FUNCTION: u8 = 14;
const TAG_FIBER: u8 = 15;
const TAG_BACKREF: u8 = 16;
const TAG_ABSTRACT: u8 = 17;

const SMALL_INT_MIN: i64 = -100;
const SMALL_INT_MAX: i64 = 100;

pub type EncodeHook = fn(&GcRef) -> Option<Vec<u8>>;
pub type DecodeHook = fn(&[u8]) -> Option<Box<dyn std::any::Any>>;

/// Optional per-embedder hook tables for `Value::Abstract` payloads, which
/// carry no generic representation of their own.
#[derive(Default, Clone, Copy)]
pub struct AbstractHooks {
    pub encode: Option<EncodeHook>,
    pub decode: Option<DecodeHook>,
}

struct Encoder<'a> {
    vm: &'a Vm,
    out: Vec<u8>,
    seen: HashMap<GcRef, u32>,
    hooks: AbstractHooks,
}

/// Serialize `value` to the image format. Shared/cyclic heap references
/// that have already been written are replaced with a `TAG_BACKREF` index
/// rather than re-encoded, so a cyclic `Array` round-trips without
/// recursing forever.
pub fn marshal(vm: &Vm, value: &Value, hooks: AbstractHooks) -> Result<Vec<u8>, LumenError> {
    let mut enc = Encoder { vm, out: Vec::new(), seen: HashMap::new(), hooks };
    enc.write_value(value)?;
    Ok(enc.out)
}

impl<'a> Encoder<'a> {
    fn write_value(&mut self, v: &Value) -> Result<(), LumenError> {
        match v {
            Value::Nil => self.out.push(TAG_NIL),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Int(i) => self.write_int(*i),
            Value::Real(r) => {
                self.out.push(TAG_REAL);
                self.out.extend_from_slice(&r.to_bits().to_le_bytes());
            }
            Value::String(s) => self.write_bytes(TAG_STRING, s.as_str().as_bytes()),
            Value::Symbol(id) => self.write_interned(TAG_SYMBOL, *id),
            Value::Keyword(id) => self.write_interned(TAG_KEYWORD, *id),
            Value::Tuple(items) => {
                self.out.push(TAG_TUPLE);
                self.write_len(items.len());
                for item in items.iter() {
                    self.write_value(item)?;
                }
            }
            Value::Struct(s) => {
                self.out.push(TAG_STRUCT);
                self.write_len(s.fields.len());
                for field in s.fields.iter() {
                    self.write_value(field)?;
                }
            }
            Value::Array(r) => self.write_heap_ref(TAG_ARRAY, *r, |enc, obj| match obj {
                HeapObj::Array(a) => {
                    let items = a.borrow().clone();
                    enc.write_len(items.len());
                    for item in &items {
                        enc.write_value(item)?;
                    }
                    Ok(())
                }
                _ => unreachable!(),
            }),
            Value::Table(r) => self.write_heap_ref(TAG_TABLE, *r, |enc, obj| match obj {
                HeapObj::Table(t) => {
                    let entries: Vec<(Value, Value)> =
                        t.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    enc.write_len(entries.len());
                    for (k, v) in &entries {
                        enc.write_value(k)?;
                        enc.write_value(v)?;
                    }
                    Ok(())
                }
                _ => unreachable!(),
            }),
            Value::Buffer(r) => self.write_heap_ref(TAG_BUFFER, *r, |enc, obj| match obj {
                HeapObj::Buffer(b) => {
                    let bytes = b.borrow().clone();
                    enc.write_len(bytes.len());
                    enc.out.extend_from_slice(&bytes);
                    Ok(())
                }
                _ => unreachable!(),
            }),
            Value::Function(r) => self.write_heap_ref(TAG_FUNCTION, *r, |enc, obj| match obj {
                HeapObj::Function(f) => {
                    enc.write_funcdef(&f.def)?;
                    enc.write_len(f.envs.len());
                    for env in &f.envs {
                        enc.write_value(&Value::array(*env))?;
                    }
                    Ok(())
                }
                _ => unreachable!(),
            }),
            Value::Fiber(r) => self.write_heap_ref(TAG_FIBER, *r, |enc, obj| match obj {
                HeapObj::Fiber(cell) => {
                    let guard = cell.borrow();
                    let fiber = guard.as_ref().ok_or_else(|| {
                        LumenError::MarshalFormat("fiber is currently running and cannot be marshalled".into())
                    })?;
                    enc.out.push(fiber_status_tag(fiber.status));
                    enc.write_len(fiber.frames.len());
                    for frame in &fiber.frames {
                        enc.write_funcdef(&frame.funcdef)?;
                        enc.write_len(frame.function_env.len());
                        for env in &frame.function_env {
                            enc.write_value(&Value::array(*env))?;
                        }
                        enc.out.extend_from_slice(&frame.pc.to_le_bytes());
                        enc.out.push(frame.call_dest);
                        enc.out.extend_from_slice(&frame.funcdef.arity.to_le_bytes());
                        enc.out.extend_from_slice(&frame.funcdef.num_slots.to_le_bytes());
                        let base = frame.register_base as usize;
                        let num_slots = frame.funcdef.num_slots as usize;
                        for slot in &fiber.registers[base..base + num_slots] {
                            enc.write_value(slot)?;
                        }
                    }
                    Ok(())
                }
                _ => unreachable!(),
            }),
            Value::Abstract(r) => {
                let hook = self.hooks.encode.ok_or_else(|| {
                    LumenError::MarshalFormat("no encode hook registered for abstract value".into())
                })?;
                let payload = hook(r).ok_or_else(|| {
                    LumenError::MarshalFormat("abstract encode hook refused this value".into())
                })?;
                self.out.push(TAG_ABSTRACT);
                self.write_len(payload.len());
                self.out.extend_from_slice(&payload);
            }
            Value::CFunction(_) | Value::Channel(_) | Value::Pointer(_) => {
                return Err(LumenError::MarshalFormat(format!(
                    "{} is not marshalable",
                    v.type_name()
                )));
            }
        }
        Ok(())
    }

    fn write_int(&mut self, i: i64) {
        if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&i) {
            self.out.push(TAG_INT_SMALL);
            self.out.push((i - SMALL_INT_MIN) as u8);
        } else {
            self.out.push(TAG_INT_FULL);
            self.out.extend_from_slice(&i.to_le_bytes());
        }
    }

    fn write_bytes(&mut self, tag: u8, bytes: &[u8]) {
        self.out.push(tag);
        self.write_len(bytes.len());
        self.out.extend_from_slice(bytes);
    }

    fn write_interned(&mut self, tag: u8, id: lumen_core::interner::InternedId) {
        // Symbols/keywords marshal by name; the receiving interner assigns
        // whatever handle it likes on unmarshal.
        let name = self.vm.resolve_interned(id);
        self.write_bytes(tag, name.as_bytes());
    }

    fn write_len(&mut self, len: usize) {
        self.out.extend_from_slice(&(len as u32).to_le_bytes());
    }

    fn write_heap_ref(
        &mut self,
        tag: u8,
        r: GcRef,
        body: impl FnOnce(&mut Self, &HeapObj) -> Result<(), LumenError>,
    ) -> Result<(), LumenError> {
        if let Some(&idx) = self.seen.get(&r) {
            self.out.push(TAG_BACKREF);
            self.write_len(idx as usize);
            return Ok(());
        }
        let idx = self.seen.len() as u32;
        self.seen.insert(r, idx);
        self.out.push(tag);
        // `self.vm` is `&'a Vm`, so this reborrow's lifetime is `'a`,
        // independent of the `&mut self` `body` takes below.
        let obj = self.vm.heap.get(r);
        body(self, obj)
    }

    fn write_funcdef(&mut self, def: &Rc<FuncDef>) -> Result<(), LumenError> {
        self.out.extend_from_slice(&def.arity.to_le_bytes());
        self.out.push(def.is_variadic as u8);
        self.out.extend_from_slice(&def.num_slots.to_le_bytes());
        self.write_len(def.bytecode.len());
        for word in def.bytecode.iter() {
            self.out.extend_from_slice(&word.to_le_bytes());
        }
        self.write_len(def.constants.len());
        for c in def.constants.iter() {
            self.write_value(c)?;
        }
        self.write_len(def.children.len());
        for child in def.children.iter() {
            self.write_funcdef(child)?;
        }
        self.write_len(def.captured_envs.len());
        for e in def.captured_envs.iter() {
            match e.source {
                EnvSource::ParentLocal(slot) => {
                    self.out.push(0);
                    self.out.extend_from_slice(&slot.to_le_bytes());
                }
                EnvSource::ParentUpvalue(idx) => {
                    self.out.push(1);
                    self.out.extend_from_slice(&idx.to_le_bytes());
                }
            }
        }
        self.out.extend_from_slice(&def.closure_bitset.to_le_bytes());
        self.write_bytes(0xff, def.source_name.as_bytes());
        Ok(())
    }
}

fn fiber_status_tag(status: FiberStatus) -> u8 {
    match status {
        FiberStatus::New => 0,
        FiberStatus::Alive => 1,
        FiberStatus::Suspended => 2,
        FiberStatus::Dead => 3,
        FiberStatus::Error => 4,
    }
}

fn fiber_status_from_tag(tag: u8) -> Result<FiberStatus, LumenError> {
    match tag {
        0 => Ok(FiberStatus::New),
        1 => Ok(FiberStatus::Alive),
        2 => Ok(FiberStatus::Suspended),
        3 => Ok(FiberStatus::Dead),
        4 => Ok(FiberStatus::Error),
        other => Err(LumenError::MarshalFormat(format!("unknown fiber status tag {other}"))),
    }
}

struct Decoder<'a> {
    vm: &'a mut Vm,
    buf: &'a [u8],
    pos: usize,
    backrefs: Vec<Value>,
    hooks: AbstractHooks,
}

pub fn unmarshal(vm: &mut Vm, buf: &[u8], hooks: AbstractHooks) -> Result<Value, LumenError> {
    let mut dec = Decoder { vm, buf, pos: 0, backrefs: Vec::new(), hooks };
    dec.read_value()
}

impl<'a> Decoder<'a> {
    fn take_byte(&mut self) -> Result<u8, LumenError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| LumenError::MarshalFormat("truncated image".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], LumenError> {
        if self.pos + n > self.buf.len() {
            return Err(LumenError::MarshalFormat("truncated image".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn take_len(&mut self) -> Result<usize, LumenError> {
        let bytes = self.take_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()) as usize)
    }

    fn take_u16(&mut self) -> Result<u16, LumenError> {
        let bytes = self.take_bytes(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_value(&mut self) -> Result<Value, LumenError> {
        let tag = self.take_byte()?;
        match tag {
            TAG_NIL => Ok(Value::Nil),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_INT_SMALL => {
                let offset = self.take_byte()?;
                Ok(Value::Int(offset as i64 + SMALL_INT_MIN))
            }
            TAG_INT_FULL => {
                let bytes = self.take_bytes(8)?;
                Ok(Value::Int(i64::from_le_bytes(bytes.try_into().unwrap())))
            }
            TAG_REAL => {
                let bytes = self.take_bytes(8)?;
                Ok(Value::Real(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap()))))
            }
            TAG_STRING => {
                let s = self.read_string()?;
                Ok(Value::String(Rc::new(LString::new(s))))
            }
            TAG_SYMBOL => {
                let s = self.read_string()?;
                Ok(Value::Symbol(self.vm.intern(&s)))
            }
            TAG_KEYWORD => {
                let s = self.read_string()?;
                Ok(Value::Keyword(self.vm.intern(&s)))
            }
            TAG_TUPLE => {
                let len = self.take_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(Value::Tuple(items.into()))
            }
            TAG_STRUCT => {
                let len = self.take_len()?;
                let mut fields = Vec::with_capacity(len);
                for _ in 0..len {
                    fields.push(self.read_value()?);
                }
                let data: StructData = lumen_core::table::make_struct(fields);
                Ok(Value::Struct(Rc::new(data)))
            }
            TAG_ARRAY => {
                let r = self.vm.heap.alloc(HeapObj::Array(RefCell::new(Vec::new())), 0);
                let v = Value::array(r);
                self.backrefs.push(v.clone());
                let len = self.take_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                if let HeapObj::Array(a) = self.vm.heap.get_mut(r) {
                    *a.borrow_mut() = items;
                }
                Ok(v)
            }
            TAG_TABLE => {
                let r = self.vm.heap.alloc(HeapObj::Table(RefCell::new(Table::new())), 0);
                let v = Value::table(r);
                self.backrefs.push(v.clone());
                let len = self.take_len()?;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let k = self.read_value()?;
                    let val = self.read_value()?;
                    entries.push((k, val));
                }
                if let HeapObj::Table(t) = self.vm.heap.get_mut(r) {
                    let mut table = t.borrow_mut();
                    for (k, val) in entries {
                        table.insert(k, val);
                    }
                }
                Ok(v)
            }
            TAG_BUFFER => {
                let len = self.take_len()?;
                let bytes = self.take_bytes(len)?.to_vec();
                let r = self.vm.heap.alloc(HeapObj::Buffer(RefCell::new(bytes)), len);
                let v = Value::Buffer(r);
                self.backrefs.push(v.clone());
                Ok(v)
            }
            TAG_FUNCTION => {
                // Reserve this value's backref slot before recursing into
                // its constants/envs, matching the index the encoder
                // assigned before it wrote the function's body.
                let slot = self.backrefs.len();
                self.backrefs.push(Value::Nil);
                let def = Rc::new(self.read_funcdef()?);
                let env_len = self.take_len()?;
                let mut envs = Vec::with_capacity(env_len);
                for _ in 0..env_len {
                    match self.read_value()? {
                        Value::Array(r) => envs.push(r),
                        _ => return Err(LumenError::MarshalFormat("function env must be an array".into())),
                    }
                }
                let r = self.vm.heap.alloc(
                    HeapObj::Function(lumen_core::function::FunctionData { def, envs }),
                    128,
                );
                let v = Value::function(r);
                self.backrefs[slot] = v.clone();
                Ok(v)
            }
            TAG_FIBER => {
                let status = fiber_status_from_tag(self.take_byte()?)?;
                let slot = self.backrefs.len();
                self.backrefs.push(Value::Nil);
                let frame_count = self.take_len()?;
                let mut frames = Vec::with_capacity(frame_count);
                let mut registers = Vec::new();
                for _ in 0..frame_count {
                    let funcdef = Rc::new(self.read_funcdef()?);
                    let env_len = self.take_len()?;
                    let mut function_env = Vec::with_capacity(env_len);
                    for _ in 0..env_len {
                        match self.read_value()? {
                            Value::Array(r) => function_env.push(r),
                            _ => return Err(LumenError::MarshalFormat("fiber frame env must be an array".into())),
                        }
                    }
                    let pc = u32::from_le_bytes(self.take_bytes(4)?.try_into().unwrap());
                    let call_dest = self.take_byte()?;
                    let _argc = self.take_u16()?;
                    let frame_size = self.take_u16()?;
                    let register_base = registers.len() as u32;
                    for _ in 0..frame_size {
                        registers.push(self.read_value()?);
                    }
                    frames.push(Frame { funcdef, function_env, pc, register_base, is_tail: false, call_dest });
                }
                let max_registers = registers.len().max(1 << 20);
                let fiber = Fiber::from_parts(status, frames, registers, max_registers);
                let r = self.vm.heap.alloc(HeapObj::Fiber(RefCell::new(Some(fiber))), 256);
                let v = Value::Fiber(r);
                self.backrefs[slot] = v.clone();
                Ok(v)
            }
            TAG_BACKREF => {
                let idx = self.take_len()?;
                self.backrefs
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| LumenError::MarshalFormat("back-reference out of range".into()))
            }
            TAG_ABSTRACT => {
                let len = self.take_len()?;
                let payload = self.take_bytes(len)?;
                let hook = self
                    .hooks
                    .decode
                    .ok_or_else(|| LumenError::MarshalFormat("no decode hook registered for abstract value".into()))?;
                let boxed = hook(payload)
                    .ok_or_else(|| LumenError::MarshalFormat("abstract decode hook rejected payload".into()))?;
                let r = self.vm.heap.alloc(HeapObj::Abstract(boxed), payload.len());
                Ok(Value::Abstract(r))
            }
            other => Err(LumenError::MarshalFormat(format!("unknown tag byte {other}"))),
        }
    }

    fn read_string(&mut self) -> Result<String, LumenError> {
        let len = self.take_len()?;
        let bytes = self.take_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| LumenError::MarshalFormat("invalid utf-8".into()))
    }

    fn read_funcdef(&mut self) -> Result<FuncDef, LumenError> {
        let arity = self.take_u16()?;
        let is_variadic = self.take_byte()? != 0;
        let num_slots = self.take_u16()?;
        let bc_len = self.take_len()?;
        let mut bytecode = Vec::with_capacity(bc_len);
        for _ in 0..bc_len {
            let bytes = self.take_bytes(4)?;
            bytecode.push(u32::from_le_bytes(bytes.try_into().unwrap()));
        }
        let const_len = self.take_len()?;
        let mut constants = Vec::with_capacity(const_len);
        for _ in 0..const_len {
            constants.push(self.read_value()?);
        }
        let child_len = self.take_len()?;
        let mut children = Vec::with_capacity(child_len);
        for _ in 0..child_len {
            children.push(Rc::new(self.read_funcdef()?));
        }
        let env_len = self.take_len()?;
        let mut captured_envs = Vec::with_capacity(env_len);
        for _ in 0..env_len {
            let kind = self.take_byte()?;
            let idx = self.take_u16()?;
            captured_envs.push(EnvDescriptor {
                source: if kind == 0 { EnvSource::ParentLocal(idx) } else { EnvSource::ParentUpvalue(idx) },
            });
        }
        let bitset_bytes = self.take_bytes(8)?;
        let closure_bitset = u64::from_le_bytes(bitset_bytes.try_into().unwrap());
        let name_tag = self.take_byte()?;
        debug_assert_eq!(name_tag, 0xff);
        let source_name = self.read_string()?;
        Ok(FuncDef {
            arity,
            is_variadic,
            num_slots,
            bytecode: bytecode.into(),
            constants: constants.into(),
            children: children.into(),
            captured_envs: captured_envs.into(),
            closure_bitset,
            source_map: Rc::from(Vec::<SourcePos>::new()),
            symbolmap: Rc::from(Vec::new()),
            source_name: source_name.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integers_round_trip_through_single_byte_encoding() {
        let mut vm = Vm::new(1_000_000);
        let bytes = marshal(&vm, &Value::Int(42), AbstractHooks::default()).unwrap();
        assert_eq!(bytes[0], TAG_INT_SMALL);
        assert_eq!(bytes.len(), 2);
        let back = unmarshal(&mut vm, &bytes, AbstractHooks::default()).unwrap();
        assert_eq!(back, Value::Int(42));
    }

    #[test]
    fn large_integers_use_the_full_width_encoding() {
        let mut vm = Vm::new(1_000_000);
        let bytes = marshal(&vm, &Value::Int(1_000_000), AbstractHooks::default()).unwrap();
        assert_eq!(bytes[0], TAG_INT_FULL);
        let back = unmarshal(&mut vm, &bytes, AbstractHooks::default()).unwrap();
        assert_eq!(back, Value::Int(1_000_000));
    }

    #[test]
    fn nested_tuple_round_trips() {
        let mut vm = Vm::new(1_000_000);
        let v = Value::Tuple(Rc::from(vec![
            Value::Int(1),
            Value::Tuple(Rc::from(vec![Value::Bool(true), Value::Nil])),
        ]));
        let bytes = marshal(&vm, &v, AbstractHooks::default()).unwrap();
        let back = unmarshal(&mut vm, &bytes, AbstractHooks::default()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn self_referential_array_round_trips_without_looping_forever() {
        let mut vm = Vm::new(1_000_000);
        let r = vm.heap.alloc(HeapObj::Array(RefCell::new(Vec::new())), 0);
        if let HeapObj::Array(a) = vm.heap.get(r) {
            a.borrow_mut().push(Value::array(r));
        }
        let v = Value::array(r);
        let bytes = marshal(&vm, &v, AbstractHooks::default()).unwrap();
        let back = unmarshal(&mut vm, &bytes, AbstractHooks::default()).unwrap();
        match back {
            Value::Array(back_r) => match vm.heap.get(back_r) {
                HeapObj::Array(a) => {
                    assert_eq!(a.borrow().len(), 1);
                    assert_eq!(a.borrow()[0], Value::array(back_r));
                }
                _ => panic!("expected array"),
            },
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn fiber_round_trips_through_marshal() {
        let mut vm = Vm::new(1_000_000);
        let funcdef = Rc::new(FuncDef {
            arity: 1,
            is_variadic: false,
            num_slots: 2,
            bytecode: Rc::from(vec![0u32]),
            constants: Rc::from(vec![]),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("t"),
        });
        let fiber_ref = vm.spawn(funcdef, 64);
        if let HeapObj::Fiber(cell) = vm.heap.get(fiber_ref) {
            cell.borrow_mut().as_mut().unwrap().registers[0] = Value::Int(7);
        }
        let bytes = marshal(&vm, &Value::Fiber(fiber_ref), AbstractHooks::default()).unwrap();
        let back = unmarshal(&mut vm, &bytes, AbstractHooks::default()).unwrap();
        match back {
            Value::Fiber(r) => match vm.heap.get(r) {
                HeapObj::Fiber(cell) => {
                    let guard = cell.borrow();
                    let fiber = guard.as_ref().unwrap();
                    assert_eq!(fiber.status, FiberStatus::New);
                    assert_eq!(fiber.frames.len(), 1);
                    assert_eq!(fiber.registers[0], Value::Int(7));
                }
                _ => panic!("expected fiber"),
            },
            _ => panic!("expected fiber"),
        }
    }

    #[test]
    fn fiber_currently_resuming_cannot_be_marshalled() {
        let mut vm = Vm::new(1_000_000);
        let funcdef = Rc::new(FuncDef {
            arity: 0,
            is_variadic: false,
            num_slots: 0,
            bytecode: Rc::from(vec![]),
            constants: Rc::from(vec![]),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("t"),
        });
        let fiber_ref = vm.spawn(funcdef, 64);
        if let HeapObj::Fiber(cell) = vm.heap.get(fiber_ref) {
            *cell.borrow_mut() = None;
        }
        let err = marshal(&vm, &Value::Fiber(fiber_ref), AbstractHooks::default()).unwrap_err();
        assert!(matches!(err, LumenError::MarshalFormat(_)));
    }

    #[test]
    fn channels_are_rejected_as_unmarshalable() {
        let mut vm = Vm::new(1_000_000);
        let chan = vm.open_channel(1, false);
        let err = marshal(&vm, &Value::Channel(chan), AbstractHooks::default()).unwrap_err();
        assert!(matches!(err, LumenError::MarshalFormat(_)));
    }
}
