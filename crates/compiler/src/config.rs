//! Compiler configuration, env-var-overridable the way
//! `lumen_runtime::RuntimeConfig` is.

use std::env;

#[derive(Clone, Debug)]
pub struct CompilerConfig {
    /// Hard ceiling on macro-expansion passes for a single form, guarding
    /// against a macro that never reaches a fixed point.
    pub max_macro_expansions: u32,
    /// Lints at or above this severity abort compilation; below it they
    /// are only collected for the caller to display.
    pub lint_floor: crate::lint::Severity,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig { max_macro_expansions: 512, lint_floor: crate::lint::Severity::Strict }
    }
}

impl CompilerConfig {
    pub fn from_env() -> Self {
        let mut cfg = CompilerConfig::default();
        if let Ok(v) = env::var("LUMEN_MAX_MACRO_EXPANSIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_macro_expansions = n;
            }
        }
        if let Ok(v) = env::var("LUMEN_LINT_FLOOR") {
            if let Some(s) = crate::lint::Severity::from_str(&v) {
                cfg.lint_floor = s;
            }
        }
        cfg
    }
}
