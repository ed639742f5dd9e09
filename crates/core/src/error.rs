//! Error taxonomy shared by every layer of the runtime.
//!
//! Mirrors the teacher's hand-rolled `CodeGenError` convention: a plain enum
//! with a manual `Display`/`Error`/`From` impl rather than a derive-macro
//! error crate. `lumen-runtime` and `lumen-compiler` build their own error
//! types around this one rather than pulling in `thiserror`.

use std::fmt;

/// The fixed error taxonomy a running program can observe.
///
/// `WouldBlock` is internal only: it is never surfaced to a fiber's `error`
/// signal, it drives the event loop's retry logic.
#[derive(Debug, Clone, PartialEq)]
pub enum LumenError {
    TypeMismatch { expected: &'static str, found: &'static str },
    ArityMismatch { expected: usize, found: usize, variadic: bool },
    IndexOutOfRange { index: i64, len: usize },
    Numeric(String),
    ResourceClosed(&'static str),
    WouldBlock,
    MarshalFormat(String),
    SymbolUnknown(String),
    MacroExpansion(String),
    Compile { message: String, line: u32, column: u32 },
    StackOverflow,
    OutOfMemory,
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LumenError::TypeMismatch { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            LumenError::ArityMismatch { expected, found, variadic } => {
                if *variadic {
                    write!(f, "arity mismatch: expected at least {expected} arguments, found {found}")
                } else {
                    write!(f, "arity mismatch: expected {expected} arguments, found {found}")
                }
            }
            LumenError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            LumenError::Numeric(msg) => write!(f, "numeric error: {msg}"),
            LumenError::ResourceClosed(kind) => write!(f, "{kind} is closed"),
            LumenError::WouldBlock => write!(f, "operation would block"),
            LumenError::MarshalFormat(msg) => write!(f, "malformed image data: {msg}"),
            LumenError::SymbolUnknown(name) => write!(f, "unknown symbol: {name}"),
            LumenError::MacroExpansion(msg) => write!(f, "macro expansion error: {msg}"),
            LumenError::Compile { message, line, column } => {
                write!(f, "{message} at {line}:{column}")
            }
            LumenError::StackOverflow => write!(f, "stack overflow"),
            LumenError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for LumenError {}

impl LumenError {
    /// `true` for errors that are fatal to the whole process rather than
    /// recoverable at a fiber boundary (spec: out-of-memory aborts).
    pub fn is_fatal(&self) -> bool {
        matches!(self, LumenError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_position_for_compile_errors() {
        let e = LumenError::Compile { message: "unexpected )".into(), line: 3, column: 7 };
        assert_eq!(e.to_string(), "unexpected ) at 3:7");
    }

    #[test]
    fn out_of_memory_is_fatal() {
        assert!(LumenError::OutOfMemory.is_fatal());
        assert!(!LumenError::WouldBlock.is_fatal());
    }
}
