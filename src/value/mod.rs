//! Runtime values for the directive VM.
//!
//! `Value` is a closed tagged union. Scalars copy by value; `Array` and
//! `AssocArray` are reference-shared inside one invocation and deep-copied
//! whenever a constant is materialized; code objects and callables are immutable.

pub mod async_result;
pub mod class_node;
pub mod range;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;

use crate::bytecode::{CodeRef, ModuleObject};
use crate::error::RuntimeError;
use crate::vm::callable::Callable;
use crate::vm::frame::FrameRef;

pub use async_result::{AsyncResult, AsyncState};
pub use class_node::{ClassNode, DateTimeNode, DeclClass, DeclClassInstance};
pub use range::DataRange;

/// Shared ordered string-keyed map.
pub type Dict = Rc<RefCell<IndexMap<String, Value>>>;

/// Deepest container nesting that comparison and rendering walk into.
pub const MAX_NESTING: usize = 128;

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    Undef,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    DateTime(DateTime<FixedOffset>),
    String(String),
    Array(Rc<RefCell<Vec<Value>>>),
    /// String-keyed mapping (assoc array).
    AssocArray(Dict),
    ClassNode(Rc<dyn ClassNode>),
    CodeObject(CodeRef),
    Callable(Rc<Callable>),
    Frame(FrameRef),
    Range(Rc<DataRange>),
    AsyncResult(AsyncResult<Value>),
    Module(Rc<ModuleObject>),
}

/// Type tag of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Undef,
    Null,
    Bool,
    Int,
    Float,
    DateTime,
    String,
    Array,
    AssocArray,
    ClassNode,
    CodeObject,
    Callable,
    Frame,
    Range,
    AsyncResult,
    Module,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Undef => "undef",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::DateTime => "datetime",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::AssocArray => "assoc",
            ValueKind::ClassNode => "object",
            ValueKind::CodeObject => "code",
            ValueKind::Callable => "callable",
            ValueKind::Frame => "frame",
            ValueKind::Range => "range",
            ValueKind::AsyncResult => "async",
            ValueKind::Module => "module",
        }
    }

    /// Kinds that take part in `==`.
    pub fn is_comparable(self) -> bool {
        matches!(
            self,
            ValueKind::Undef
                | ValueKind::Null
                | ValueKind::Bool
                | ValueKind::Int
                | ValueKind::Float
                | ValueKind::DateTime
                | ValueKind::String
                | ValueKind::Array
                | ValueKind::AssocArray
        )
    }
}

/// Build an assoc array value from string key-value pairs.
pub fn dict_from_pairs<I, K>(pairs: I) -> Value
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    Value::dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn dict(map: IndexMap<String, Value>) -> Self {
        Value::AssocArray(Rc::new(RefCell::new(map)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Undef => ValueKind::Undef,
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::AssocArray(_) => ValueKind::AssocArray,
            Value::ClassNode(_) => ValueKind::ClassNode,
            Value::CodeObject(_) => ValueKind::CodeObject,
            Value::Callable(_) => ValueKind::Callable,
            Value::Frame(_) => ValueKind::Frame,
            Value::Range(_) => ValueKind::Range,
            Value::AsyncResult(_) => ValueKind::AsyncResult,
            Value::Module(_) => ValueKind::Module,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::ClassNode(node) => node.class_name(),
            other => other.kind().name().to_string(),
        }
    }

    pub fn is_undef_or_null(&self) -> bool {
        matches!(self, Value::Undef | Value::Null)
    }

    fn mismatch(&self, expected: &str) -> RuntimeError {
        RuntimeError::type_mismatch(expected, self.type_name())
    }

    // --- Accessors ---

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(other.mismatch("int")),
        }
    }

    /// Numeric value as float; integers are widened.
    pub fn as_float(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Float(n) => Ok(*n),
            Value::Int(n) => Ok(*n as f64),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_datetime(&self) -> Result<DateTime<FixedOffset>, RuntimeError> {
        match self {
            Value::DateTime(dt) => Ok(*dt),
            other => Err(other.mismatch("datetime")),
        }
    }

    pub fn as_array(&self) -> Result<Rc<RefCell<Vec<Value>>>, RuntimeError> {
        match self {
            Value::Array(arr) => Ok(arr.clone()),
            other => Err(other.mismatch("array")),
        }
    }

    pub fn as_dict(&self) -> Result<Dict, RuntimeError> {
        match self {
            Value::AssocArray(map) => Ok(map.clone()),
            other => Err(other.mismatch("assoc")),
        }
    }

    pub fn as_class_node(&self) -> Result<Rc<dyn ClassNode>, RuntimeError> {
        match self {
            Value::ClassNode(node) => Ok(node.clone()),
            other => Err(other.mismatch("object")),
        }
    }

    pub fn as_callable(&self) -> Result<Rc<Callable>, RuntimeError> {
        match self {
            Value::Callable(c) => Ok(c.clone()),
            other => Err(other.mismatch("callable")),
        }
    }

    pub fn as_frame(&self) -> Result<FrameRef, RuntimeError> {
        match self {
            Value::Frame(frame) => Ok(frame.clone()),
            other => Err(other.mismatch("frame")),
        }
    }

    pub fn as_range(&self) -> Result<Rc<DataRange>, RuntimeError> {
        match self {
            Value::Range(range) => Ok(range.clone()),
            other => Err(other.mismatch("range")),
        }
    }

    pub fn as_async_result(&self) -> Result<AsyncResult<Value>, RuntimeError> {
        match self {
            Value::AsyncResult(result) => Ok(result.clone()),
            other => Err(other.mismatch("async")),
        }
    }

    // --- Semantics ---

    /// Structural equality.
    ///
    /// Different comparable kinds are simply unequal (undef and null are equal to
    /// each other); any non-comparable operand is an error. NaN equals NaN so
    /// that equality stays reflexive.
    pub fn equals(&self, other: &Value) -> Result<bool, RuntimeError> {
        self.equals_at(other, 0)
    }

    fn equals_at(&self, other: &Value, depth: usize) -> Result<bool, RuntimeError> {
        if depth > MAX_NESTING {
            return Err(RuntimeError::NestingLimit(MAX_NESTING));
        }
        let (left, right) = (self.kind(), other.kind());
        if !left.is_comparable() || !right.is_comparable() {
            return Err(RuntimeError::NotComparable {
                left: self.type_name(),
                right: other.type_name(),
            });
        }
        Ok(match (self, other) {
            (Value::Undef | Value::Null, Value::Undef | Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ok(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    if !x.equals_at(y, depth + 1)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::AssocArray(a), Value::AssocArray(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ok(true);
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (k, x) in a.iter() {
                    match b.get(k) {
                        Some(y) if x.equals_at(y, depth + 1)? => {}
                        _ => return Ok(false),
                    }
                }
                true
            }
            _ => false,
        })
    }

    /// Emptiness: the basis of truthiness for everything but booleans.
    pub fn is_empty(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Undef | Value::Null => Ok(true),
            Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::DateTime(_) => Ok(false),
            Value::String(s) => Ok(s.is_empty()),
            Value::Array(arr) => Ok(arr.borrow().is_empty()),
            Value::AssocArray(map) => Ok(map.borrow().is_empty()),
            Value::ClassNode(node) => node.is_empty(),
            Value::Range(range) => Ok(range.is_empty()),
            Value::CodeObject(_)
            | Value::Callable(_)
            | Value::Frame(_)
            | Value::AsyncResult(_)
            | Value::Module(_) => Ok(false),
        }
    }

    pub fn truthy(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Ok(!other.is_empty()?),
        }
    }

    pub fn length(&self) -> Result<usize, RuntimeError> {
        match self {
            Value::String(s) => Ok(s.chars().count()),
            Value::Array(arr) => Ok(arr.borrow().len()),
            Value::AssocArray(map) => Ok(map.borrow().len()),
            Value::ClassNode(node) => node.length(),
            Value::Range(range) => Ok(range.remaining()),
            other => Err(other.mismatch("value with a length")),
        }
    }

    /// Recursively copy arrays and assoc arrays; everything else is shared or scalar.
    ///
    /// A container reached twice is copied once, so self-referencing values
    /// copy into self-referencing values.
    pub fn deep_copy(&self) -> Value {
        self.copy_into(&mut HashMap::new())
    }

    fn copy_into(&self, copies: &mut HashMap<*const (), Value>) -> Value {
        let Some(addr) = self.container_addr() else {
            return self.clone();
        };
        if let Some(copy) = copies.get(&addr) {
            return copy.clone();
        }
        match self {
            Value::Array(arr) => {
                let copy = Rc::new(RefCell::new(Vec::new()));
                copies.insert(addr, Value::Array(copy.clone()));
                let items: Vec<Value> = arr.borrow().iter().map(|v| v.copy_into(copies)).collect();
                *copy.borrow_mut() = items;
                Value::Array(copy)
            }
            Value::AssocArray(map) => {
                let copy = Rc::new(RefCell::new(IndexMap::new()));
                copies.insert(addr, Value::AssocArray(copy.clone()));
                let entries: IndexMap<String, Value> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.copy_into(copies)))
                    .collect();
                *copy.borrow_mut() = entries;
                Value::AssocArray(copy)
            }
            other => other.clone(),
        }
    }

    /// Identity of a shared container.
    fn container_addr(&self) -> Option<*const ()> {
        match self {
            Value::Array(arr) => Some(Rc::as_ptr(arr) as *const ()),
            Value::AssocArray(map) => Some(Rc::as_ptr(map) as *const ()),
            _ => None,
        }
    }

    /// Text form; a container already being written, or nested past
    /// `MAX_NESTING`, is shown as `...`.
    fn write_text(&self, f: &mut fmt::Formatter<'_>, open: &mut Vec<*const ()>) -> fmt::Result {
        let addr = self.container_addr();
        if let Some(addr) = addr {
            if open.contains(&addr) || open.len() >= MAX_NESTING {
                return match self {
                    Value::Array(_) => write!(f, "[...]"),
                    _ => write!(f, "{{...}}"),
                };
            }
            open.push(addr);
        }
        let written = match self {
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, val) in arr.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    val.write_text(f, open)?;
                }
                write!(f, "]")
            }
            Value::AssocArray(map) => {
                write!(f, "{{")?;
                for (i, (key, val)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: ", key)?;
                    val.write_text(f, open)?;
                }
                write!(f, "}}")
            }
            other => write!(f, "{}", ScalarText(other)),
        };
        if addr.is_some() {
            open.pop();
        }
        written
    }

    fn write_debug(&self, f: &mut fmt::Formatter<'_>, open: &mut Vec<*const ()>) -> fmt::Result {
        let addr = self.container_addr();
        if let Some(addr) = addr {
            if open.contains(&addr) || open.len() >= MAX_NESTING {
                return write!(f, "...");
            }
            open.push(addr);
        }
        let written = match self {
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, val) in arr.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    val.write_debug(f, open)?;
                }
                write!(f, "]")
            }
            Value::AssocArray(map) => {
                write!(f, "{{")?;
                for (i, (key, val)) in map.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: ", key)?;
                    val.write_debug(f, open)?;
                }
                write!(f, "}}")
            }
            Value::Undef => write!(f, "Undef"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::DateTime(dt) => write!(f, "DateTime({})", dt.to_rfc3339()),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::ClassNode(node) => write!(f, "{:?}", node),
            other => write!(f, "{}", ScalarText(other)),
        };
        if addr.is_some() {
            open.pop();
        }
        written
    }

    /// Reference identity for shared kinds, value identity for scalars.
    fn same_identity(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::ClassNode(a), Value::ClassNode(b)) => Rc::ptr_eq(a, b),
            (Value::CodeObject(a), Value::CodeObject(b)) => a.ptr_eq(b),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b),
            (Value::Frame(a), Value::Frame(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Rc::ptr_eq(a, b),
            (Value::AsyncResult(a), Value::AsyncResult(b)) => a.ptr_eq(b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match self.equals(other) {
            Ok(eq) => eq,
            Err(_) => self.same_identity(other),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

/// Template text form: undef and null render as nothing.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_text(f, &mut Vec::new())
    }
}

/// Text of a non-container value.
struct ScalarText<'a>(&'a Value);

impl fmt::Display for ScalarText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Undef | Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) => write!(f, "[...]"),
            Value::AssocArray(_) => write!(f, "{{...}}"),
            Value::ClassNode(node) => write!(f, "<{}>", node.class_name()),
            Value::CodeObject(code) => write!(f, "<code {}>", code.code().symbol.name),
            Value::Callable(c) => write!(f, "<directive {}>", c.name()),
            Value::Frame(frame) => write!(f, "<frame {}>", frame.borrow().callable().name()),
            Value::Range(_) => write!(f, "<range>"),
            Value::AsyncResult(r) => write!(f, "<async {:?}>", r.state()),
            Value::Module(m) => write!(f, "<module {}>", m.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_debug(f, &mut Vec::new())
    }
}
