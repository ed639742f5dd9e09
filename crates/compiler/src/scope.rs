//! Scope tree and per-function register allocation.
//!
//! Each function gets two bitsets over its register file: `ua` marks which
//! slots a nested closure has captured (and which therefore outlive the
//! block that declared them, boxed, per `Fiber::box_captured_slots`), the
//! allocator's own bump cursor plays the `ra` role from the data model.
//! Both are capped at 64 slots, matching `FuncDef::closure_bitset`'s width
//! (see DESIGN.md on why that cap is a deliberate, not incidental, choice).
//!
//! Slot reuse happens at block granularity: popping a block resets the
//! bump cursor back to where the block started unless any slot the block
//! declared was captured, in which case the whole range is left retired
//! rather than working out exactly which slots inside it are still live.

use std::rc::Rc;

use lumen_core::funcdef::{EnvDescriptor, FuncDef, SourcePos};
use lumen_core::value::Value;

use crate::error::CompileError;

pub const MAX_SLOTS: u16 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Param,
    Def,
    Macro,
    DynamicDef,
    Var,
}

#[derive(Clone, Debug)]
pub struct Binding {
    pub name: String,
    pub kind: BindingKind,
    pub slot: u16,
    /// `def`/`macro` bindings whose value is known at compile time fold
    /// straight to a constant instead of a register read.
    pub constant: Option<Value>,
}

struct Block {
    bindings: Vec<Binding>,
    base_slot: u16,
    is_loop: bool,
}

/// One function's worth of compiler state: its scope stack, register
/// allocator, and the bytecode/constant/child buffers being assembled for
/// it. `funcdef_builder` drains this into a finished `FuncDef`.
pub struct FunctionScope {
    pub arity: u16,
    pub is_variadic: bool,
    pub source_name: Rc<str>,
    blocks: Vec<Block>,
    next_slot: u16,
    pub max_slot: u16,
    pub ua: u64,
    pub captured_envs: Vec<EnvDescriptor>,
    pub captured_names: Vec<String>,
    pub bytecode: Vec<u32>,
    pub constants: Vec<Value>,
    pub children: Vec<Rc<FuncDef>>,
    pub source_map: Vec<SourcePos>,
    pub symbolmap: Vec<(u16, String)>,
}

impl FunctionScope {
    pub fn new(arity: u16, is_variadic: bool, source_name: impl Into<Rc<str>>) -> Self {
        FunctionScope {
            arity,
            is_variadic,
            source_name: source_name.into(),
            blocks: vec![Block { bindings: Vec::new(), base_slot: 0, is_loop: false }],
            next_slot: 0,
            max_slot: 0,
            ua: 0,
            captured_envs: Vec::new(),
            captured_names: Vec::new(),
            bytecode: Vec::new(),
            constants: Vec::new(),
            children: Vec::new(),
            source_map: Vec::new(),
            symbolmap: Vec::new(),
        }
    }

    pub fn push_block(&mut self, is_loop: bool) {
        self.blocks.push(Block { bindings: Vec::new(), base_slot: self.next_slot, is_loop });
    }

    pub fn pop_block(&mut self) {
        let block = self.blocks.pop().expect("unbalanced scope block");
        let any_captured = (block.base_slot..self.next_slot).any(|slot| self.ua & (1 << slot) != 0);
        if !any_captured {
            self.next_slot = block.base_slot;
        }
    }

    pub fn in_loop(&self) -> bool {
        self.blocks.iter().rev().any(|b| b.is_loop)
    }

    pub fn alloc_slot(&mut self, line: u32) -> Result<u16, CompileError> {
        if self.next_slot >= MAX_SLOTS {
            return Err(CompileError::new(
                format!("function uses more than {} registers", MAX_SLOTS),
                line,
                0,
            ));
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slot = self.max_slot.max(self.next_slot);
        Ok(slot)
    }

    /// Reserve `n` contiguous, unnamed temporary slots (a call's argument
    /// window, a literal's element window). Not tracked as a binding, so
    /// nothing but the block-level reset ever reclaims them.
    pub fn alloc_contiguous(&mut self, n: u16, line: u32) -> Result<u16, CompileError> {
        let base = self.next_slot;
        for _ in 0..n {
            self.alloc_slot(line)?;
        }
        Ok(base)
    }

    pub fn declare(
        &mut self,
        name: &str,
        kind: BindingKind,
        constant: Option<Value>,
        line: u32,
    ) -> Result<u16, CompileError> {
        let slot = self.alloc_slot(line)?;
        self.blocks
            .last_mut()
            .expect("at least one block always open")
            .bindings
            .push(Binding { name: name.to_string(), kind, slot, constant });
        Ok(slot)
    }

    /// Bind a parameter; parameters are never constant-folded.
    pub fn declare_param(&mut self, name: &str) -> u16 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.max_slot = self.max_slot.max(self.next_slot);
        self.blocks[0].bindings.push(Binding {
            name: name.to_string(),
            kind: BindingKind::Param,
            slot,
            constant: None,
        });
        slot
    }

    /// Look up `name` within this function's own scopes only (innermost
    /// block first). Callers above a function boundary go through
    /// `capture_analysis` instead.
    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        for block in self.blocks.iter().rev() {
            if let Some(b) = block.bindings.iter().rev().find(|b| b.name == name) {
                return Some(b);
            }
        }
        None
    }

    pub fn mark_captured(&mut self, slot: u16) {
        self.ua |= 1 << slot;
    }

    pub fn is_captured(&self, slot: u16) -> bool {
        self.ua & (1 << slot) != 0
    }

    /// Record (or reuse) an upvalue this function forwards from its own
    /// enclosing function, returning its index into `captured_envs`.
    pub fn add_capture(&mut self, name: &str, source: EnvDescriptor) -> u16 {
        if let Some(i) = self.captured_names.iter().position(|n| n == name) {
            return i as u16;
        }
        self.captured_envs.push(source);
        self.captured_names.push(name.to_string());
        (self.captured_envs.len() - 1) as u16
    }

    pub fn here(&self) -> u32 {
        self.bytecode.len() as u32
    }

    pub fn emit(&mut self, word: u32, line: u32, column: u32) -> u32 {
        let pc = self.here();
        self.bytecode.push(word);
        if self.source_map.last().map(|p| p.line) != Some(line) {
            self.source_map.push(SourcePos { pc, line, column });
        }
        pc
    }

    /// Patch a `Jump`'s 24-bit relative-offset operand, emitted before the
    /// jump target was known.
    pub fn patch_jump24(&mut self, pc: u32, target: u32) {
        let offset = target as i32 - (pc as i32 + 1);
        let raw = (offset as u32) & 0x00ff_ffff;
        let op = self.bytecode[pc as usize] & 0xff;
        self.bytecode[pc as usize] = op | (raw << 8);
    }

    /// Patch a `JumpIf`/`JumpIfNot`'s 16-bit relative-offset operand (its
    /// `a` byte is the condition register and stays untouched).
    pub fn patch_jump16(&mut self, pc: u32, target: u32) {
        let offset = (target as i32 - (pc as i32 + 1)) as i16 as u16;
        let word = self.bytecode[pc as usize];
        let op = word & 0xff;
        let a = word & 0xff00;
        self.bytecode[pc as usize] = op | a | ((offset as u32 & 0xff) << 16) | (((offset as u32 >> 8) & 0xff) << 24);
    }

    pub fn add_constant(&mut self, v: Value) -> u32 {
        for (i, c) in self.constants.iter().enumerate() {
            if c.structural_eq(&v) {
                return i as u32;
            }
        }
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn add_child(&mut self, def: Rc<FuncDef>) -> u16 {
        self.children.push(def);
        (self.children.len() - 1) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_reuse_after_block_exit_when_not_captured() {
        let mut s = FunctionScope::new(0, false, "t");
        s.push_block(false);
        let a = s.declare("a", BindingKind::Def, None, 1).unwrap();
        s.pop_block();
        s.push_block(false);
        let b = s.declare("b", BindingKind::Def, None, 1).unwrap();
        s.pop_block();
        assert_eq!(a, b);
    }

    #[test]
    fn captured_slot_is_never_reused() {
        let mut s = FunctionScope::new(0, false, "t");
        s.push_block(false);
        let a = s.declare("a", BindingKind::Def, None, 1).unwrap();
        s.mark_captured(a);
        s.pop_block();
        s.push_block(false);
        let b = s.declare("b", BindingKind::Def, None, 1).unwrap();
        s.pop_block();
        assert_ne!(a, b);
    }

    #[test]
    fn max_slot_is_monotonic_across_reuse() {
        let mut s = FunctionScope::new(0, false, "t");
        for _ in 0..3 {
            s.push_block(false);
            s.declare("x", BindingKind::Def, None, 1).unwrap();
            s.pop_block();
        }
        assert_eq!(s.max_slot, 1);
    }
}
