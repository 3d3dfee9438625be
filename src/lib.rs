//! tplvm: a stack-based bytecode interpreter for a small template/directive language.
//!
//! Compiled modules (JSON files or hand-assembled `ModuleObject`s) run against a
//! host-supplied set of globals and native directives.
//!
//! # Entry points
//!
//! - `Runtime::import_module` runs a module's entry code once and yields its module frame
//! - `Runtime::exec_callable` invokes any callable, bytecode or native
//!
//! Both return an `AsyncResult`; bytecode that awaits an unsettled host result
//! suspends the interpreter until the host settles it.

#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod bytecode;
pub mod config;
pub mod error;
pub mod loader;
pub mod render;
pub mod value;
pub mod vm;

pub use bytecode::{CallSpec, CodeObject, Constant, Instruction, ModuleObject, OpCode};
pub use config::InterpreterConfig;
pub use error::{RuntimeError, TraceEntry, VmError};
pub use loader::{DirLoader, MemoryLoader, ModuleLoader};
pub use value::{AsyncResult, AsyncState, ClassNode, DataRange, Value};
pub use vm::{
    Callable, DirectiveDescriptor, DirectiveFactory, DirectiveRegistry, Interpreter, Runtime,
};
