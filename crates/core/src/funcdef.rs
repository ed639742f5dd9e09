//! `FuncDef`: the immutable compiled-code object the compiler emits and the
//! VM dispatches. Holds everything the dispatch loop needs without any
//! back-reference to the compiler that produced it — this is the
//! (arena, index)-free half of the redesign note: `FuncDef`s form a DAG
//! (a function's children are its nested closures), never a cycle, so a
//! plain `Rc` is sufficient and no heap-arena slot is spent on them.

use crate::value::Value;
use std::rc::Rc;

/// Describes where a closure's captured upvalue comes from, relative to the
/// *immediately* enclosing function's frame. The compiler's `resolve`
/// installs one `EnvDescriptor` per intermediate function boundary on the
/// way from a binding's defining scope down to the closure that uses it
/// (spec §4.D step 4), so by the time bytecode is emitted every reference is
/// only ever one hop away: either a boxed local of the immediate parent, or
/// an upvalue the parent itself already forwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvSource {
    /// A slot in the immediately enclosing function's own register file,
    /// pre-boxed because `closure_bitset` marks it as captured.
    ParentLocal(u16),
    /// An entry already present in the immediately enclosing function's own
    /// captured-environment vector (forwarded another level up).
    ParentUpvalue(u16),
}

#[derive(Clone, Copy, Debug)]
pub struct EnvDescriptor {
    pub source: EnvSource,
}

/// One entry in the bytecode-to-source-position table used for error
/// reporting (spec's "source map" FuncDef field).
#[derive(Clone, Copy, Debug)]
pub struct SourcePos {
    pub pc: u32,
    pub line: u32,
    pub column: u32,
}

#[derive(Clone, Debug)]
pub struct FuncDef {
    pub arity: u16,
    pub is_variadic: bool,
    pub num_slots: u16,
    pub bytecode: Rc<[u32]>,
    pub constants: Rc<[Value]>,
    pub children: Rc<[Rc<FuncDef>]>,
    /// Upvalues this function captures from enclosing functions, in the
    /// order its `CLOSURE` instruction lists them.
    pub captured_envs: Rc<[EnvDescriptor]>,
    /// Bitset: which slots of *this* function's register file are captured
    /// by a nested closure (and therefore must be boxed/shared rather than
    /// reused after the defining frame returns).
    pub closure_bitset: u64,
    pub source_map: Rc<[SourcePos]>,
    /// Maps bytecode slot indices back to the symbol name bound there, for
    /// diagnostics and the debugger-facing embedding API.
    pub symbolmap: Rc<[(u16, String)]>,
    pub source_name: Rc<str>,
}

impl FuncDef {
    pub fn line_for_pc(&self, pc: u32) -> Option<(u32, u32)> {
        self.source_map
            .iter()
            .rev()
            .find(|p| p.pc <= pc)
            .map(|p| (p.line, p.column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FuncDef {
        FuncDef {
            arity: 1,
            is_variadic: false,
            num_slots: 2,
            bytecode: Rc::from(vec![0u32, 1, 2]),
            constants: Rc::from(vec![]),
            children: Rc::from(vec![]),
            captured_envs: Rc::from(vec![]),
            closure_bitset: 0,
            source_map: Rc::from(vec![
                SourcePos { pc: 0, line: 1, column: 1 },
                SourcePos { pc: 2, line: 2, column: 4 },
            ]),
            symbolmap: Rc::from(vec![]),
            source_name: Rc::from("test"),
        }
    }

    #[test]
    fn line_for_pc_picks_nearest_preceding_entry() {
        let fd = sample();
        assert_eq!(fd.line_for_pc(0), Some((1, 1)));
        assert_eq!(fd.line_for_pc(1), Some((1, 1)));
        assert_eq!(fd.line_for_pc(2), Some((2, 4)));
    }
}
