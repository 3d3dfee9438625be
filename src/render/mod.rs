//! Turning a final value into output text or JSON.
//!
//! Class nodes take part through two well-known methods, `render` and
//! `__serialize__`, invoked through the interpreter's synchronous call protocol.

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::value::{ClassNode, Value, MAX_NESTING};
use crate::vm::{Callable, Interpreter};

pub const RENDER_METHOD: &str = "render";
pub const SERIALIZE_METHOD: &str = "__serialize__";

/// Text form of `value`. Arrays concatenate their rendered items.
pub fn to_text(interp: &mut Interpreter, value: &Value) -> Result<String, RuntimeError> {
    text_at(interp, value, 0)
}

fn text_at(interp: &mut Interpreter, value: &Value, depth: usize) -> Result<String, RuntimeError> {
    if depth > MAX_NESTING {
        return Err(RuntimeError::NestingLimit(MAX_NESTING));
    }
    match value {
        Value::ClassNode(node) => match method(node, RENDER_METHOD)? {
            Some(render) => {
                let rendered = interp.call_sync(&render, Vec::new(), None)?;
                text_at(interp, &rendered, depth + 1)
            }
            None => Ok(value.to_string()),
        },
        Value::Array(items) => {
            let items = items.borrow().clone();
            let mut out = String::new();
            for item in &items {
                out.push_str(&text_at(interp, item, depth + 1)?);
            }
            Ok(out)
        }
        other => Ok(other.to_string()),
    }
}

/// JSON form of `value`.
pub fn to_json(interp: &mut Interpreter, value: &Value) -> Result<serde_json::Value, RuntimeError> {
    json_at(interp, value, 0)
}

fn json_at(
    interp: &mut Interpreter,
    value: &Value,
    depth: usize,
) -> Result<serde_json::Value, RuntimeError> {
    if depth > MAX_NESTING {
        return Err(RuntimeError::NestingLimit(MAX_NESTING));
    }
    match value {
        Value::Undef | Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Int(n) => Ok(serde_json::Value::Number((*n).into())),
        Value::Float(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| RuntimeError::new("Cannot convert float to JSON (NaN or Infinity)")),
        Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        Value::DateTime(dt) => Ok(serde_json::Value::String(dt.to_rfc3339())),
        Value::Array(items) => {
            let items = items.borrow().clone();
            let json: Result<Vec<_>, _> = items.iter().map(|item| json_at(interp, item, depth + 1)).collect();
            Ok(serde_json::Value::Array(json?))
        }
        Value::AssocArray(map) => {
            let entries = map.borrow().clone();
            let mut out = serde_json::Map::new();
            for (key, item) in &entries {
                out.insert(key.clone(), json_at(interp, item, depth + 1)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        Value::Frame(frame) => {
            let snapshot = Value::dict(frame.borrow().snapshot());
            json_at(interp, &snapshot, depth + 1)
        }
        Value::ClassNode(node) => {
            let data = match method(node, SERIALIZE_METHOD)? {
                Some(serialize) => interp.call_sync(&serialize, Vec::new(), None)?,
                None => node.serialize()?,
            };
            if matches!(data, Value::ClassNode(_)) {
                return Err(RuntimeError::type_mismatch("plain data", data.type_name()));
            }
            json_at(interp, &data, depth + 1)
        }
        other => Err(RuntimeError::not_implemented(other.type_name(), "JSON serialization")),
    }
}

/// Convert parsed JSON into a value.
pub fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => Value::dict(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), from_json(v)))
                .collect(),
        ),
    }
}

/// A callable attribute of `node`, or `None` when it has no such member.
fn method(node: &Rc<dyn ClassNode>, name: &str) -> Result<Option<Rc<Callable>>, RuntimeError> {
    match node.get_attr(name) {
        Ok(Value::Callable(callable)) => Ok(Some(callable)),
        Ok(_) => Ok(None),
        Err(RuntimeError::NameNotFound(_)) | Err(RuntimeError::NotImplemented { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
