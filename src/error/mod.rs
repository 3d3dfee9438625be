//! Error types for the interpreter.
//!
//! `RuntimeError` is raised by every layer of the engine. When an error escapes a
//! public invocation it is wrapped into a `VmError`, which adds the frame-stack
//! trace captured at the point of failure.

use std::fmt;

use thiserror::Error;

use crate::bytecode::OpCode;

/// Runtime errors.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Name '{0}' is not defined")]
    NameNotFound(String),

    #[error("Missing argument '{argument}' for '{callable}'")]
    MissingArgument { callable: String, argument: String },

    #[error("Wrong arguments for '{callable}': {message}")]
    Arity { callable: String, message: String },

    #[error("Index out of bounds: {index} (length {length})")]
    IndexOutOfBounds { index: i64, length: usize },

    #[error("Directive '{0}' is not registered")]
    DirectiveNotFound(String),

    #[error("'{type_name}' does not support {capability}")]
    NotImplemented {
        type_name: String,
        capability: &'static str,
    },

    #[error("Cannot compare {left} with {right}")]
    NotComparable { left: String, right: String },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Maximum call depth of {0} frames exceeded")]
    RecursionLimit(usize),

    #[error("Value nesting exceeds {0} levels")]
    NestingLimit(usize),

    #[error("Awaited result was rejected: {0}")]
    HostRejection(Box<VmError>),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    General(String),
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn name_not_found(name: impl Into<String>) -> Self {
        Self::NameNotFound(name.into())
    }

    pub fn missing_argument(callable: impl Into<String>, argument: impl Into<String>) -> Self {
        Self::MissingArgument {
            callable: callable.into(),
            argument: argument.into(),
        }
    }

    pub fn arity(callable: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Arity {
            callable: callable.into(),
            message: message.into(),
        }
    }

    pub fn not_implemented(type_name: impl Into<String>, capability: &'static str) -> Self {
        Self::NotImplemented {
            type_name: type_name.into(),
            capability,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// True for stack/frame invariant violations, which point at a compiler or VM
    /// defect rather than at the template being executed.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// One line of a frame-stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    /// Name of the callable executing in the frame.
    pub callable: String,
    /// Module that declared the callable.
    pub module: String,
    /// Instruction cursor at the time of failure.
    pub instruction: usize,
    /// Opcode under the cursor; `None` for native directives and finished frames.
    pub opcode: Option<OpCode>,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Some(op) => write!(
                f,
                "at {} ({}) instruction {} [{:?}]",
                self.callable, self.module, self.instruction, op
            ),
            None => write!(f, "at {} ({}) <native>", self.callable, self.module),
        }
    }
}

/// An error that escaped an interpreter invocation, with its trace.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct VmError {
    #[source]
    pub error: RuntimeError,
    /// Innermost frame first.
    pub trace: Vec<TraceEntry>,
}

impl VmError {
    pub fn new(error: RuntimeError, trace: Vec<TraceEntry>) -> Self {
        Self { error, trace }
    }

    /// Build an error for a host to reject an `AsyncResult` with.
    pub fn host(message: impl Into<String>) -> Self {
        Self::new(RuntimeError::General(message.into()), Vec::new())
    }

    pub fn is_internal(&self) -> bool {
        self.error.is_internal()
    }

    /// Render the error followed by its trace, one entry per line.
    pub fn report(&self) -> String {
        let mut out = self.error.to_string();
        for entry in &self.trace {
            out.push_str("\n  ");
            out.push_str(&entry.to_string());
        }
        out
    }
}

impl From<RuntimeError> for VmError {
    fn from(error: RuntimeError) -> Self {
        Self::new(error, Vec::new())
    }
}
