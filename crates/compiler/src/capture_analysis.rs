//! Closure capture installation.
//!
//! When `resolve` finds a binding above the current function boundary, it
//! needs one `EnvDescriptor` per intermediate function scope on the path
//! from the binding's home function down to the closure that references
//! it, so that by the time bytecode is emitted every reference is only
//! ever one hop from its immediate parent: either a boxed local of that
//! parent, or an upvalue the parent itself already forwards.

use lumen_core::funcdef::{EnvDescriptor, EnvSource};

use crate::scope::FunctionScope;

/// `scopes` is the live function-scope stack, outermost first. `home` is
/// the index of the function that owns the binding, `home_slot` its
/// register slot there. Marks `home_slot` captured in the home function
/// and threads an upvalue index down through every function between
/// `home` and `scopes.last()`, returning the upvalue index the innermost
/// function should read.
pub fn install_capture_chain(
    scopes: &mut [FunctionScope],
    home: usize,
    home_slot: u16,
    name: &str,
) -> u16 {
    scopes[home].mark_captured(home_slot);
    let mut source = EnvDescriptor { source: EnvSource::ParentLocal(home_slot) };
    let mut upvalue_idx = 0;
    for scope in scopes.iter_mut().skip(home + 1) {
        upvalue_idx = scope.add_capture(name, source);
        source = EnvDescriptor { source: EnvSource::ParentUpvalue(upvalue_idx) };
    }
    upvalue_idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::BindingKind;

    #[test]
    fn single_hop_captures_parent_local() {
        let mut outer = FunctionScope::new(0, false, "outer");
        outer.push_block(false);
        let slot = outer.declare("x", BindingKind::Def, None, 1).unwrap();
        let inner = FunctionScope::new(0, false, "inner");
        let mut scopes = vec![outer, inner];
        let idx = install_capture_chain(&mut scopes, 0, slot, "x");
        assert_eq!(idx, 0);
        assert!(scopes[0].is_captured(slot));
        assert_eq!(scopes[1].captured_envs.len(), 1);
        assert!(matches!(scopes[1].captured_envs[0].source, EnvSource::ParentLocal(s) if s == slot));
    }

    #[test]
    fn two_hops_forward_as_upvalue() {
        let mut outer = FunctionScope::new(0, false, "outer");
        outer.push_block(false);
        let slot = outer.declare("x", BindingKind::Def, None, 1).unwrap();
        let middle = FunctionScope::new(0, false, "middle");
        let inner = FunctionScope::new(0, false, "inner");
        let mut scopes = vec![outer, middle, inner];
        let idx = install_capture_chain(&mut scopes, 0, slot, "x");
        assert!(matches!(scopes[1].captured_envs[0].source, EnvSource::ParentLocal(s) if s == slot));
        assert!(matches!(scopes[2].captured_envs[idx as usize].source, EnvSource::ParentUpvalue(0)));
    }
}
