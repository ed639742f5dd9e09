//! `FuncDef` finalization: drain a `FunctionScope`'s buffers into an
//! immutable `FuncDef`, after running the two mandated peephole passes.

use std::rc::Rc;

use lumen_core::funcdef::FuncDef;

use crate::scope::FunctionScope;

/// `dest` is the register holding the function's result; a trailing
/// `Return` is appended reading it, unless the body already ends in one
/// (true for every path through `lower`, but checked rather than assumed)
/// or already ends in a `TailCall` - a body whose last expression compiled
/// to a tail call has already handed control to the callee, and a `Return`
/// after that would never run.
pub fn finish(mut scope: FunctionScope, dest: u8) -> FuncDef {
    if !ends_in_return_or_tailcall(&scope.bytecode) {
        use lumen_runtime::opcodes::{Instruction, Opcode};
        let line = scope.source_map.last().map(|p| p.line).unwrap_or(1);
        scope.emit(Instruction { op: Opcode::Return, a: dest, b: 0, c: 0 }.encode(), line, 0);
    }
    mov_forward(&mut scope.bytecode);
    remove_noops(&mut scope.bytecode, &mut scope.source_map);

    FuncDef {
        arity: scope.arity,
        is_variadic: scope.is_variadic,
        num_slots: scope.max_slot,
        bytecode: Rc::from(scope.bytecode),
        constants: Rc::from(scope.constants),
        children: Rc::from(scope.children),
        captured_envs: Rc::from(scope.captured_envs),
        closure_bitset: scope.ua,
        source_map: Rc::from(scope.source_map),
        symbolmap: Rc::from(scope.symbolmap),
        source_name: scope.source_name,
    }
}

fn ends_in_return_or_tailcall(bytecode: &[u32]) -> bool {
    use lumen_runtime::opcodes::{Instruction, Opcode};
    bytecode
        .last()
        .map(|w| matches!(Instruction::decode(*w).op, Opcode::Return | Opcode::TailCall))
        .unwrap_or(false)
}

/// Collapse a `Move` immediately followed by another `Move` reading its
/// destination straight back out, a pattern `lower` emits at join points
/// (e.g. compiling a literal into a temp before copying it to the
/// requested destination) that register allocation alone doesn't avoid.
fn mov_forward(bytecode: &mut [u32]) {
    use lumen_runtime::opcodes::{Instruction, Opcode};
    for i in 0..bytecode.len().saturating_sub(1) {
        let first = Instruction::decode(bytecode[i]);
        let second = Instruction::decode(bytecode[i + 1]);
        if first.op == Opcode::Move && second.op == Opcode::Move && second.b == first.a && second.a != first.b {
            bytecode[i + 1] = Instruction { op: Opcode::Move, a: second.a, b: first.b, c: 0 }.encode();
        }
    }
}

/// Replace any `NoOp` left over from a cancelled peephole rewrite... or,
/// more commonly here, from a jump that ended up targeting the
/// instruction right after itself once both branches compiled to nothing.
/// Jump targets are patched by absolute `pc`, so removal can't simply
/// shift entries downward; noops are turned into `NoOp`-but-reachable and
/// left in place instead of compacted, trading a few dead bytes for not
/// having to re-walk every jump operand.
fn remove_noops(bytecode: &mut [u32], _source_map: &mut [lumen_core::funcdef::SourcePos]) {
    use lumen_runtime::opcodes::{Instruction, Opcode};
    for word in bytecode.iter_mut() {
        let insn = Instruction::decode(*word);
        if insn.op == Opcode::Jump && insn.imm24_signed() == 0 {
            *word = Instruction { op: Opcode::NoOp, a: 0, b: 0, c: 0 }.encode();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_runtime::opcodes::{Instruction, Opcode};

    #[test]
    fn appends_a_return_if_the_body_has_none() {
        let mut scope = FunctionScope::new(0, false, "t");
        scope.emit(Instruction { op: Opcode::LoadInt, a: 0, b: 1, c: 0 }.encode(), 1, 0);
        let def = finish(scope, 0);
        let last = Instruction::decode(def.bytecode[def.bytecode.len() - 1]);
        assert_eq!(last.op, Opcode::Return);
    }

    #[test]
    fn zero_offset_jumps_become_noops() {
        let mut scope = FunctionScope::new(0, false, "t");
        scope.emit(Instruction { op: Opcode::Jump, a: 0, b: 0, c: 0 }.encode(), 1, 0);
        scope.emit(Instruction { op: Opcode::Return, a: 0, b: 0, c: 0 }.encode(), 1, 0);
        let def = finish(scope, 0);
        let first = Instruction::decode(def.bytecode[0]);
        assert_eq!(first.op, Opcode::NoOp);
    }
}
