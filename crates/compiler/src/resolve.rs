//! Symbol resolution: the `resolve(sym)` algorithm.
//!
//! Order: walk the live function-scope stack from innermost out looking
//! for a lexical binding (installing a capture chain if it's found above
//! the current function boundary); fall back to the dynamic global
//! table; fall back to the `:missing-symbol` hook bound in that same
//! table, guarded against re-entrant invocation; otherwise "unknown
//! symbol".

use lumen_core::value::Value;
use lumen_core::GcRef;

use crate::capture_analysis::install_capture_chain;
use crate::error::CompileError;
use crate::macroexpand;
use crate::scope::BindingKind;
use crate::Compiler;

#[derive(Clone, Debug)]
pub enum Resolved {
    /// A value already known at compile time (`def`/`macro` with a
    /// constant body folds straight through instead of a register read).
    Constant(Value),
    /// A register in the current function's own frame.
    Local(u16),
    /// An index into the current function's `captured_envs`.
    Upvalue(u16),
    /// Not found lexically; read through the global table at runtime.
    Global,
}

impl Compiler<'_> {
    pub fn resolve(&mut self, name: &str, line: u32) -> Result<Resolved, CompileError> {
        if let Some(r) = self.resolve_lexical(name) {
            return Ok(r);
        }
        if self.global_get(name).is_some() {
            return Ok(Resolved::Global);
        }
        if !self.in_missing_symbol_handler {
            if let Some(handler) = self.global_get(":missing-symbol").and_then(|v| v.as_gc_ref()) {
                self.in_missing_symbol_handler = true;
                let outcome = self.invoke_missing_symbol(handler, name);
                self.in_missing_symbol_handler = false;
                if outcome? {
                    return Ok(Resolved::Global);
                }
            }
        }
        Err(CompileError::new(format!("unknown symbol: {}", name), line, 0))
    }

    /// Search this function's own scopes, then each enclosing function's,
    /// installing a capture chain across every boundary crossed.
    fn resolve_lexical(&mut self, name: &str) -> Option<Resolved> {
        let depth = self.scopes.len();
        let here = depth - 1;
        if let Some(b) = self.scopes[here].lookup(name) {
            if let Some(c) = &b.constant {
                return Some(Resolved::Constant(c.clone()));
            }
            return Some(Resolved::Local(b.slot));
        }
        for home in (0..here).rev() {
            if let Some(b) = self.scopes[home].lookup(name) {
                if let Some(c) = &b.constant {
                    return Some(Resolved::Constant(c.clone()));
                }
                // `var` bindings crossing a function boundary are captured
                // as a boxed local the same as any other slot; only the
                // mutation discipline (MOVE_UP_SET vs MOVE_UP) differs.
                let slot = b.slot;
                let idx = install_capture_chain(&mut self.scopes, home, slot, name);
                return Some(Resolved::Upvalue(idx));
            }
        }
        None
    }

    fn global_get(&self, name: &str) -> Option<Value> {
        let key = Value::String(std::rc::Rc::new(lumen_core::LString::new(name)));
        match self.vm.heap.get(self.vm.globals) {
            lumen_core::HeapObj::Table(t) => t.borrow().get(&key).cloned(),
            _ => None,
        }
    }

    fn invoke_missing_symbol(&mut self, handler: GcRef, name: &str) -> Result<bool, CompileError> {
        let arg = Value::Symbol(self.vm.intern(name));
        let result = macroexpand::run_to_completion(self.vm, handler, vec![arg], self.config.max_macro_expansions)?;
        Ok(result.is_truthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::FunctionScope;
    use crate::{CompilerConfig, Compiler};
    use lumen_runtime::config::RuntimeConfig;
    use lumen_runtime::Vm;

    #[test]
    fn unbound_symbol_with_no_global_and_no_handler_errors() {
        let mut vm = Vm::new(RuntimeConfig::default().gc_interval);
        let mut c = Compiler::new(&mut vm, CompilerConfig::default()).unwrap();
        c.scopes.push(FunctionScope::new(0, false, "t"));
        let err = c.resolve("nowhere", 3).unwrap_err();
        assert!(err.message.contains("nowhere"));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn local_binding_resolves_without_crossing_a_function_boundary() {
        let mut vm = Vm::new(RuntimeConfig::default().gc_interval);
        let mut c = Compiler::new(&mut vm, CompilerConfig::default()).unwrap();
        let mut scope = FunctionScope::new(0, false, "t");
        scope.push_block(false);
        let slot = scope.declare("x", BindingKind::Def, None, 1).unwrap();
        c.scopes.push(scope);
        match c.resolve("x", 1).unwrap() {
            Resolved::Local(s) => assert_eq!(s, slot),
            other => panic!("expected Local, got {:?}", other),
        }
    }

    #[test]
    fn binding_above_a_function_boundary_resolves_as_an_upvalue() {
        let mut vm = Vm::new(RuntimeConfig::default().gc_interval);
        let mut c = Compiler::new(&mut vm, CompilerConfig::default()).unwrap();
        let mut outer = FunctionScope::new(0, false, "outer");
        outer.push_block(false);
        outer.declare("x", BindingKind::Def, None, 1).unwrap();
        c.scopes.push(outer);
        c.scopes.push(FunctionScope::new(0, false, "inner"));
        match c.resolve("x", 1).unwrap() {
            Resolved::Upvalue(0) => {}
            other => panic!("expected Upvalue(0), got {:?}", other),
        }
    }
}
