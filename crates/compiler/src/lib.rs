//! Single-pass AST-to-bytecode compiler.
//!
//! The AST is itself a `Value` tree (tuples, symbols, literals - whatever
//! a reader would hand back), so there is no separate AST type to parse
//! into: `compile` walks `Value` directly. A `Compiler` bundles the live
//! function-scope stack (`scope::FunctionScope`) with a `&mut Vm`, since
//! both symbol resolution (global fallback) and macro expansion need to
//! run code against the same VM instance the compiled result will later
//! execute on.

pub mod capture_analysis;
pub mod config;
pub mod error;
pub mod funcdef_builder;
pub mod lint;
pub mod lower;
pub mod macroexpand;
pub mod resolve;
pub mod scope;

pub use config::CompilerConfig;
pub use error::CompileError;

use std::path::PathBuf;
use std::rc::Rc;

use lumen_core::funcdef::FuncDef;
use lumen_core::value::Value;
use lumen_runtime::Vm;

use scope::FunctionScope;

pub struct CompileResult {
    pub funcdef: Rc<FuncDef>,
    pub diagnostics: Vec<lint::LintDiagnostic>,
}

pub struct Compiler<'a> {
    pub vm: &'a mut Vm,
    pub config: CompilerConfig,
    pub(crate) linter: lint::Linter,
    pub(crate) scopes: Vec<FunctionScope>,
    pub(crate) diagnostics: Vec<lint::LintDiagnostic>,
    pub(crate) in_missing_symbol_handler: bool,
    /// Names bound by `defmacro` earlier in this same compile. A macro
    /// must be defined before its first use, matching the data model's
    /// single-pass, top-to-bottom compilation.
    pub(crate) known_macros: std::collections::HashSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(vm: &'a mut Vm, config: CompilerConfig) -> Result<Self, CompileError> {
        let linter = lint::Linter::with_defaults().map_err(|e| CompileError::new(e, 0, 0))?;
        Ok(Compiler {
            vm,
            config,
            linter,
            scopes: Vec::new(),
            diagnostics: Vec::new(),
            in_missing_symbol_handler: false,
            known_macros: std::collections::HashSet::new(),
        })
    }

    pub(crate) fn current_scope(&mut self) -> &mut FunctionScope {
        self.scopes.last_mut().expect("compile always has an active function scope")
    }

    /// Compile one top-level form into a zero-argument thunk `FuncDef`.
    pub fn compile(&mut self, ast: &Value, source_name: &str) -> Result<CompileResult, CompileError> {
        let source_path = PathBuf::from(source_name);
        // Reborrows only the `vm` field, leaving `self.linter` free to
        // borrow alongside it in the `lint` call below.
        let vm_ref: &Vm = &*self.vm;
        let resolve_name = |id: lumen_core::InternedId| -> String { vm_ref.resolve_interned(id).to_string() };
        let diags = self.linter.lint(&resolve_name, ast, &source_path, 1);
        self.diagnostics.extend(diags.clone());
        if let Some(worst) = diags.iter().find(|d| d.severity >= self.config.lint_floor) {
            return Err(CompileError::new(
                format!("lint {} at compile-time floor: {}", worst.id, worst.message),
                worst.line,
                0,
            ));
        }

        self.scopes.push(FunctionScope::new(0, false, source_name));
        let dest = lower::lower_toplevel(self, ast)?;
        let scope = self.scopes.pop().expect("pushed above");
        let funcdef = funcdef_builder::finish(scope, dest);
        Ok(CompileResult { funcdef: Rc::new(funcdef), diagnostics: self.diagnostics.clone() })
    }
}
