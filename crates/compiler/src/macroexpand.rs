//! Compile-time execution of macros and the `:missing-symbol` hook.
//!
//! Both run an ordinary `Value::Function` to completion against the same
//! `Vm` the compiled program will later execute on, via a dedicated fiber
//! the compiler drives itself rather than handing to an embedder's event
//! loop. Macros are assumed top-level (no captured environment) in
//! practice, but `run_to_completion` still wires up a non-empty `envs` if
//! given one, since nothing about the mechanism requires otherwise.

use std::rc::Rc;

use lumen_core::funcdef::FuncDef;
use lumen_core::heap::HeapObj;
use lumen_core::value::Value;
use lumen_core::{GcRef, SignalKind};
use lumen_runtime::Vm;

use crate::error::CompileError;

const FIBER_REGISTER_BUDGET: usize = 4096;

/// Drive `func` to completion with `args`, resuming through any
/// `Yield`/`Event`/`User` signal it raises along the way (a macro that
/// itself uses fibers internally still terminates, as long as it
/// eventually produces an `Ok` signal). `max_steps` bounds the number of
/// resumes so a macro that never settles fails loudly instead of hanging
/// the compile.
pub fn run_to_completion(
    vm: &mut Vm,
    func: GcRef,
    args: Vec<Value>,
    max_steps: u32,
) -> Result<Value, CompileError> {
    let (def, envs): (Rc<FuncDef>, Vec<GcRef>) = match vm.heap.get(func) {
        HeapObj::Function(f) => (f.def.clone(), f.envs.clone()),
        _ => return Err(CompileError::new("macro value is not a function", 0, 0)),
    };
    let fiber = vm.spawn(def, FIBER_REGISTER_BUDGET);
    if !envs.is_empty() {
        if let HeapObj::Fiber(cell) = vm.heap.get(fiber) {
            if let Some(f) = cell.borrow_mut().as_mut() {
                f.frames[0].function_env = envs;
            }
        }
    }

    let mut signal = vm.resume(fiber, args);
    let mut steps = 0u32;
    loop {
        match signal.kind {
            SignalKind::Ok => return Ok(signal.payload),
            SignalKind::Error => {
                return Err(CompileError::new(
                    format!("macro expansion raised an error: {:?}", signal.payload),
                    0,
                    0,
                ))
            }
            SignalKind::Yield | SignalKind::Event | SignalKind::User(_) => {
                steps += 1;
                if steps > max_steps {
                    return Err(CompileError::new("recursed too deeply in macro expansion", 0, 0));
                }
                signal = vm.resume(fiber, Vec::new());
            }
        }
    }
}

/// Expand one macro call: `form`'s tail elements become the macro's
/// arguments (an atom standing in for a reader-level macro gets the atom
/// itself as its sole argument).
pub fn expand_macro(
    vm: &mut Vm,
    macro_fn: GcRef,
    form: &Value,
    max_steps: u32,
) -> Result<Value, CompileError> {
    let args = match form {
        Value::Tuple(items) => items[1..].to_vec(),
        other => vec![other.clone()],
    };
    run_to_completion(vm, macro_fn, args, max_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::FunctionScope;
    use lumen_core::value::Value;
    use lumen_runtime::config::RuntimeConfig;
    use lumen_runtime::opcodes::{Instruction, Opcode};

    fn vm() -> Vm {
        Vm::new(RuntimeConfig::default().gc_interval)
    }

    fn make_identity_macro(vm: &mut Vm) -> GcRef {
        // (fn (x) x) compiled by hand: one param, return it unchanged.
        let mut scope = FunctionScope::new(1, false, "identity-macro");
        scope.declare_param("x");
        scope.emit(Instruction { op: Opcode::Return, a: 0, b: 0, c: 0 }.encode(), 1, 0);
        let def = Rc::new(crate::funcdef_builder::finish(scope, 0));
        // Build a real closure value over `def` directly rather than
        // going through bytecode: MakeClosure needs a parent frame, but
        // a captureless FuncDef can be wrapped with no parent at all.
        let func_data = lumen_core::function::FunctionData { def, envs: Vec::new() };
        vm.heap.alloc(HeapObj::Function(func_data), 64)
    }

    #[test]
    fn run_to_completion_returns_the_immediate_ok_payload() {
        let mut vm = vm();
        let macro_fn = make_identity_macro(&mut vm);
        let result = run_to_completion(&mut vm, macro_fn, vec![Value::Int(7)], 16).unwrap();
        assert!(matches!(result, Value::Int(7)));
    }

    #[test]
    fn expand_macro_passes_call_tail_as_arguments() {
        let mut vm = vm();
        let macro_fn = make_identity_macro(&mut vm);
        let sym = vm.intern("m");
        let form = Value::Tuple(Rc::from(vec![Value::Symbol(sym), Value::Int(9)]));
        let result = expand_macro(&mut vm, macro_fn, &form, 16).unwrap();
        assert!(matches!(result, Value::Int(9)));
    }
}
