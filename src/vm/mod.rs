//! Stack-based interpreter for compiled template modules.
//!
//! `Interpreter` owns the frame stack, the operand stack and the module frames.
//! `Runtime` wraps it for hosts and drives suspension on pending async results.

pub mod builtins;
pub mod callable;
pub mod frame;
pub mod interpreter;
mod interpreter_calls;
mod interpreter_ops;
pub mod runtime;
pub mod stack;

pub use callable::{
    Callable, CallableBody, DirectiveDescriptor, DirectiveFactory, DirectiveRegistry, NativeFn,
};
pub use frame::{ExecutionFrame, FrameRef, DIRECTIVE_VAR, MODULE_VAR};
pub use interpreter::{settlement_record, Interpreter, Step, Suspension};
pub use runtime::Runtime;
pub use stack::OperandStack;
