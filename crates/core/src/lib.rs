//! Value model and heap for the Lumen runtime.
//!
//! This crate owns the shared data model (spec §3): `Value`, the
//! mark-sweep `Heap`, the symbol/keyword `Interner`, `Table`, `FuncDef`,
//! `Function`, `Fiber`, and `ChannelData`. Execution (the bytecode
//! dispatch loop, the event loop, channel operation semantics, the
//! marshaller) lives in `lumen-runtime` and operates on these types.

pub mod channel;
pub mod error;
pub mod fiber;
pub mod funcdef;
pub mod function;
pub mod gcstring;
pub mod heap;
pub mod interner;
pub mod stats;
pub mod table;
pub mod value;

pub use channel::ChannelData;
pub use error::LumenError;
pub use fiber::{Fiber, FiberFlags, FiberStatus, Frame, Signal, SignalKind, SignalMask};
pub use funcdef::{EnvDescriptor, EnvSource, FuncDef, SourcePos};
pub use function::FunctionData;
pub use gcstring::LString;
pub use heap::{Color, GcRef, Heap, HeapObj, HeapStatsSnapshot, Trace};
pub use interner::{Interner, InternedId};
pub use table::Table;
pub use value::{CFunctionPtr, StructData, Value};
