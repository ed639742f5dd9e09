//! Lint engine: structural pattern matching over the `Value`-tree AST.
//!
//! Phase 1 (inherited from this module's own phased rollout): a rule
//! matches on a form's head symbol, not a full pattern language. That is
//! enough to flag the cheap, mechanical issues - a `do` wrapping a single
//! sub-expression, an empty `fn` body - without needing a structural
//! pattern DSL. Severity names follow the three compiler lint levels:
//! relaxed, normal, strict.

use std::path::PathBuf;

use lumen_core::value::Value;
use lumen_core::InternedId;
use serde::Deserialize;

pub static DEFAULT_LINTS: &str = include_str!("lints.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Relaxed,
    Normal,
    Strict,
}

impl Severity {
    pub fn from_str(s: &str) -> Option<Severity> {
        match s.to_ascii_lowercase().as_str() {
            "relaxed" => Some(Severity::Relaxed),
            "normal" => Some(Severity::Normal),
            "strict" => Some(Severity::Strict),
            _ => None,
        }
    }

    pub fn to_lsp_severity(&self) -> u32 {
        match self {
            Severity::Strict => 1,
            Severity::Normal => 2,
            Severity::Relaxed => 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LintRule {
    pub id: String,
    /// Head symbol of the form this rule inspects, e.g. `"do"`.
    pub form: String,
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Normal
}

#[derive(Debug, Clone, Deserialize)]
pub struct LintConfig {
    #[serde(rename = "lint")]
    pub rules: Vec<LintRule>,
}

impl LintConfig {
    pub fn from_toml(s: &str) -> Result<Self, String> {
        toml::from_str(s).map_err(|e| format!("failed to parse lint config: {e}"))
    }

    pub fn default_config() -> Result<Self, String> {
        Self::from_toml(DEFAULT_LINTS)
    }

    /// User rules override defaults with the same id.
    pub fn merge(&mut self, other: LintConfig) {
        for rule in other.rules {
            if let Some(existing) = self.rules.iter_mut().find(|r| r.id == rule.id) {
                *existing = rule;
            } else {
                self.rules.push(rule);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LintDiagnostic {
    pub id: String,
    pub message: String,
    pub severity: Severity,
    pub source_name: PathBuf,
    pub line: u32,
}

pub struct Linter {
    rules: Vec<LintRule>,
}

impl Linter {
    pub fn new(config: &LintConfig) -> Self {
        Linter { rules: config.rules.clone() }
    }

    pub fn with_defaults() -> Result<Self, String> {
        Ok(Linter::new(&LintConfig::default_config()?))
    }

    /// Walk `ast` looking for forms whose head symbol matches a
    /// configured rule. Every hit is reported regardless of severity;
    /// `compile` is the one that decides whether a diagnostic at or
    /// above `CompilerConfig::lint_floor` should abort compilation.
    pub fn lint(
        &self,
        resolve_name: &dyn Fn(InternedId) -> String,
        ast: &Value,
        source_name: &PathBuf,
        line: u32,
    ) -> Vec<LintDiagnostic> {
        let mut out = Vec::new();
        self.walk(resolve_name, ast, source_name, line, &mut out);
        out
    }

    fn walk(
        &self,
        resolve_name: &dyn Fn(InternedId) -> String,
        node: &Value,
        source_name: &PathBuf,
        line: u32,
        out: &mut Vec<LintDiagnostic>,
    ) {
        if let Value::Tuple(items) = node {
            if let Some(Value::Symbol(id)) = items.first() {
                let head = resolve_name(*id);
                for rule in &self.rules {
                    if rule.form == head {
                        out.push(LintDiagnostic {
                            id: rule.id.clone(),
                            message: rule.message.clone(),
                            severity: rule.severity,
                            source_name: source_name.clone(),
                            line,
                        });
                    }
                }
            }
            for item in items.iter() {
                self.walk(resolve_name, item, source_name, line, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::value::Value;
    use std::rc::Rc;

    fn resolve_fixture(id: InternedId) -> String {
        match id.0 {
            0 => "do".to_string(),
            1 => "def".to_string(),
            _ => "?".to_string(),
        }
    }

    #[test]
    fn default_config_parses() {
        let cfg = LintConfig::default_config().expect("default lints parse");
        assert!(!cfg.rules.is_empty());
    }

    #[test]
    fn matching_form_head_produces_a_diagnostic() {
        let cfg = LintConfig::from_toml(
            "[[lint]]\nid = \"single-form-do\"\nform = \"do\"\nmessage = \"redundant do\"\nseverity = \"relaxed\"\n",
        )
        .unwrap();
        let linter = Linter::new(&cfg);
        let ast = Value::Tuple(Rc::from(vec![Value::Symbol(InternedId(0)), Value::Int(1)]));
        let hits = linter.lint(&resolve_fixture, &ast, &PathBuf::from("t"), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, Severity::Relaxed);
    }

    #[test]
    fn nested_forms_are_visited() {
        let cfg = LintConfig::from_toml(
            "[[lint]]\nid = \"x\"\nform = \"def\"\nmessage = \"m\"\n",
        )
        .unwrap();
        let linter = Linter::new(&cfg);
        let inner = Value::Tuple(Rc::from(vec![Value::Symbol(InternedId(1)), Value::Int(2)]));
        let ast = Value::Tuple(Rc::from(vec![Value::Symbol(InternedId(0)), inner]));
        let hits = linter.lint(&resolve_fixture, &ast, &PathBuf::from("t"), 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "x");
    }
}
