//! Compiler-local error type.
//!
//! Mirrors the teacher's hand-rolled `Result<T, String>` convention (see
//! `resolver.rs`) but carries enough structure that a caller can build the
//! `{error, line, column, optional macro-fiber}` result object the spec
//! requires rather than a bare string.

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    /// Set when the error happened while driving a macro-expansion fiber,
    /// so the caller can still report which expansion produced it.
    pub macro_fiber: Option<lumen_core::GcRef>,
}

impl CompileError {
    pub fn new(message: impl Into<String>, line: u32, column: u32) -> Self {
        CompileError { message: message.into(), line, column, macro_fiber: None }
    }

    pub fn at_macro(message: impl Into<String>, line: u32, column: u32, fiber: lumen_core::GcRef) -> Self {
        CompileError { message: message.into(), line, column, macro_fiber: Some(fiber) }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.line, self.column)
    }
}

impl std::error::Error for CompileError {}

impl From<CompileError> for lumen_core::LumenError {
    fn from(e: CompileError) -> Self {
        lumen_core::LumenError::Compile { message: e.message, line: e.line, column: e.column }
    }
}
