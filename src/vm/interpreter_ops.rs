//! Operator semantics: arithmetic, ordering, membership, indexing, attributes, slicing.

use std::cmp::Ordering;

use crate::error::RuntimeError;
use crate::value::{ClassNode, DateTimeNode, Value};

use super::interpreter::Interpreter;

fn overflow(op: &str) -> RuntimeError {
    RuntimeError::new(format!("Integer overflow in {}", op))
}

fn operand_mismatch(op: &str, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::type_mismatch(
        format!("operands supporting {}", op),
        format!("{} and {}", a.type_name(), b.type_name()),
    )
}

/// Resolve a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if resolved >= 0 && (resolved as usize) < len {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Clamp a slice bound into `0..=len`.
fn clamp_bound(bound: Option<i64>, len: usize, default: usize) -> usize {
    match bound {
        None => default,
        Some(i) if i < 0 => (len as i64 + i).max(0) as usize,
        Some(i) => (i as usize).min(len),
    }
}

fn slice_bound(value: &Value) -> Result<Option<i64>, RuntimeError> {
    match value {
        Value::Undef | Value::Null => Ok(None),
        Value::Int(n) => Ok(Some(*n)),
        other => Err(RuntimeError::type_mismatch("int or null", other.type_name())),
    }
}

impl Interpreter {
    // --- Arithmetic ---

    pub(crate) fn op_add(&self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x.checked_add(*y).map(Value::Int).ok_or_else(|| overflow("+")),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
            (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{}{}", x, y))),
            (Value::Array(x), Value::Array(y)) => {
                let mut items = x.borrow().clone();
                items.extend(y.borrow().iter().cloned());
                Ok(Value::array(items))
            }
            _ => Err(operand_mismatch("+", &a, &b)),
        }
    }

    pub(crate) fn op_subtract(&self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x.checked_sub(*y).map(Value::Int).ok_or_else(|| overflow("-")),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x - y)),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 - y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x - *y as f64)),
            _ => Err(operand_mismatch("-", &a, &b)),
        }
    }

    pub(crate) fn op_multiply(&self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map(Value::Int).ok_or_else(|| overflow("*")),
            (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
            (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 * y)),
            (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x * *y as f64)),
            (Value::String(s), Value::Int(n)) | (Value::Int(n), Value::String(s)) => {
                let count = usize::try_from((*n).max(0)).unwrap_or(usize::MAX);
                let limit = self.config().max_string_bytes;
                match s.len().checked_mul(count) {
                    Some(size) if size <= limit => Ok(Value::String(s.repeat(count))),
                    _ => Err(RuntimeError::new(format!(
                        "String repetition exceeds the {} byte limit",
                        limit
                    ))),
                }
            }
            _ => Err(operand_mismatch("*", &a, &b)),
        }
    }

    pub(crate) fn op_divide(&self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero),
            (Value::Int(x), Value::Int(y)) => x.checked_div(*y).map(Value::Int).ok_or_else(|| overflow("/")),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let divisor = b.as_float()?;
                if divisor == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                Ok(Value::Float(a.as_float()? / divisor))
            }
            _ => Err(operand_mismatch("/", &a, &b)),
        }
    }

    pub(crate) fn op_modulo(&self, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero),
            (Value::Int(x), Value::Int(y)) => x.checked_rem(*y).map(Value::Int).ok_or_else(|| overflow("%")),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let divisor = b.as_float()?;
                if divisor == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                Ok(Value::Float(a.as_float()? % divisor))
            }
            _ => Err(operand_mismatch("%", &a, &b)),
        }
    }

    pub(crate) fn op_negate(&self, a: Value) -> Result<Value, RuntimeError> {
        match a {
            Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| overflow("negation")),
            Value::Float(n) => Ok(Value::Float(-n)),
            other => Err(RuntimeError::type_mismatch("number", other.type_name())),
        }
    }

    // --- Comparison ---

    /// Ordering of two values; `None` when floats are unordered (NaN).
    pub(crate) fn op_compare(&self, a: &Value, b: &Value) -> Result<Option<Ordering>, RuntimeError> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(Some(x.cmp(y))),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                Ok(a.as_float()?.partial_cmp(&b.as_float()?))
            }
            (Value::String(x), Value::String(y)) => Ok(Some(x.cmp(y))),
            (Value::DateTime(x), Value::DateTime(y)) => Ok(Some(x.cmp(y))),
            _ => Err(operand_mismatch("ordering", a, b)),
        }
    }

    pub(crate) fn op_contains(&self, item: &Value, container: &Value) -> Result<bool, RuntimeError> {
        match container {
            Value::Array(items) => Ok(items.borrow().iter().any(|candidate| candidate == item)),
            Value::AssocArray(map) => Ok(map.borrow().contains_key(item.as_str()?)),
            Value::String(s) => Ok(s.contains(item.as_str()?)),
            Value::Undef | Value::Null => Ok(false),
            Value::Frame(frame) => Ok(frame.borrow().has_value(item.as_str()?)),
            other => Err(RuntimeError::type_mismatch("container", other.type_name())),
        }
    }

    // --- Indexing ---

    pub(crate) fn op_get_item(&self, target: &Value, key: &Value) -> Result<Value, RuntimeError> {
        match (target, key) {
            (Value::Array(items), Value::Int(i)) => {
                let items = items.borrow();
                normalize_index(*i, items.len())
                    .map(|idx| items[idx].clone())
                    .ok_or(RuntimeError::IndexOutOfBounds {
                        index: *i,
                        length: items.len(),
                    })
            }
            (Value::String(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                normalize_index(*i, chars.len())
                    .map(|idx| Value::String(chars[idx].to_string()))
                    .ok_or(RuntimeError::IndexOutOfBounds {
                        index: *i,
                        length: chars.len(),
                    })
            }
            (Value::AssocArray(map), Value::String(k)) => {
                Ok(map.borrow().get(k).cloned().unwrap_or(Value::Undef))
            }
            (Value::AssocArray(map), Value::Int(n)) => {
                Ok(map.borrow().get(&n.to_string()).cloned().unwrap_or(Value::Undef))
            }
            (Value::Frame(frame), Value::String(k)) => frame.borrow().get_value(k),
            (Value::ClassNode(node), key) => node.get_at(key),
            _ => Err(RuntimeError::type_mismatch(
                "indexable value",
                format!("{} indexed by {}", target.type_name(), key.type_name()),
            )),
        }
    }

    pub(crate) fn op_set_item(&self, target: &Value, key: &Value, value: Value) -> Result<(), RuntimeError> {
        match (target, key) {
            (Value::Array(items), Value::Int(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let idx = normalize_index(*i, len)
                    .ok_or(RuntimeError::IndexOutOfBounds { index: *i, length: len })?;
                items[idx] = value;
                Ok(())
            }
            (Value::AssocArray(map), Value::String(k)) => {
                map.borrow_mut().insert(k.clone(), value);
                Ok(())
            }
            (Value::AssocArray(map), Value::Int(n)) => {
                map.borrow_mut().insert(n.to_string(), value);
                Ok(())
            }
            (Value::Frame(frame), Value::String(k)) => {
                frame.borrow_mut().set_value(k.clone(), value);
                Ok(())
            }
            (Value::ClassNode(node), Value::String(k)) => node.set_attr(k, value),
            _ => Err(RuntimeError::type_mismatch(
                "assignable container",
                format!("{} indexed by {}", target.type_name(), key.type_name()),
            )),
        }
    }

    // --- Attributes ---

    pub(crate) fn op_get_attr(&self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        match target {
            Value::AssocArray(map) => Ok(map.borrow().get(name).cloned().unwrap_or(Value::Undef)),
            Value::Frame(frame) => frame.borrow().get_value(name),
            Value::ClassNode(node) => node.get_attr(name),
            Value::DateTime(dt) => DateTimeNode::new(*dt).get_attr(name),
            Value::Array(_) | Value::String(_) if name == "length" => {
                Ok(Value::Int(target.length()? as i64))
            }
            Value::Callable(callable) if name == "name" => {
                Ok(Value::String(callable.name().to_string()))
            }
            Value::Module(module) if name == "name" => Ok(Value::String(module.name.clone())),
            other => Err(RuntimeError::type_mismatch(
                format!("value with attribute '{}'", name),
                other.type_name(),
            )),
        }
    }

    pub(crate) fn op_set_attr(&self, target: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match target {
            Value::AssocArray(map) => {
                map.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Frame(frame) => {
                frame.borrow_mut().set_value(name, value);
                Ok(())
            }
            Value::ClassNode(node) => node.set_attr(name, value),
            other => Err(RuntimeError::type_mismatch("object", other.type_name())),
        }
    }

    // --- Slicing ---

    pub(crate) fn op_slice(&self, target: &Value, start: &Value, end: &Value) -> Result<Value, RuntimeError> {
        let (start, end) = (slice_bound(start)?, slice_bound(end)?);
        match target {
            Value::Array(items) => {
                let items = items.borrow();
                let from = clamp_bound(start, items.len(), 0);
                let to = clamp_bound(end, items.len(), items.len());
                let slice = if from < to { items[from..to].to_vec() } else { Vec::new() };
                Ok(Value::array(slice))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let from = clamp_bound(start, chars.len(), 0);
                let to = clamp_bound(end, chars.len(), chars.len());
                let slice: String = if from < to { chars[from..to].iter().collect() } else { String::new() };
                Ok(Value::String(slice))
            }
            Value::ClassNode(node) => node.slice(start, end),
            other => Err(RuntimeError::type_mismatch("sliceable value", other.type_name())),
        }
    }
}
