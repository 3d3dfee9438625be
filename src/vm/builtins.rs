//! Core native directives seeded into every global frame.

use std::rc::Rc;

use chrono::{DateTime, FixedOffset, Local};

use crate::error::RuntimeError;
use crate::value::{DataRange, Value};

use super::callable::{DirectiveDescriptor, DirectiveRegistry};
use super::interpreter::Interpreter;

/// Registry holding the core directives; hosts chain their own on top of it.
pub fn registry() -> DirectiveRegistry {
    let mut registry = DirectiveRegistry::new();
    registry
        .register(DirectiveDescriptor::new("scope", &[], scope).transparent())
        .register(
            DirectiveDescriptor::new("range", &["start", "stop", "step"], range)
                .with_default("stop", Value::Null)
                .with_default("step", Value::Int(1)),
        )
        .register(DirectiveDescriptor::new("length", &["value"], length))
        .register(DirectiveDescriptor::new("string", &["value"], string))
        .register(DirectiveDescriptor::new("keys", &["value"], keys))
        .register(DirectiveDescriptor::new("now", &[], now))
        .register(DirectiveDescriptor::new("isEmpty", &["value"], is_empty));
    registry
}

/// Snapshot of the nearest scope-owning frame's variables.
fn scope(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let frame = interp.enclosing_scope()?;
    let snapshot = frame.borrow().snapshot();
    interp.push(Value::dict(snapshot));
    Ok(())
}

/// `range(stop)` or `range(start, stop, step)`.
fn range(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let start = interp.arg("start")?.as_int()?;
    let stop = interp.arg("stop")?;
    let step = interp.arg("step")?.as_int()?;
    let range = if stop.is_undef_or_null() {
        DataRange::ints(0, start, step)?
    } else {
        DataRange::ints(start, stop.as_int()?, step)?
    };
    interp.push(Value::Range(Rc::new(range)));
    Ok(())
}

fn length(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let len = interp.arg("value")?.length()?;
    let len = i64::try_from(len)
        .map_err(|_| RuntimeError::new(format!("length {} does not fit an integer", len)))?;
    interp.push(Value::Int(len));
    Ok(())
}

fn string(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let value = interp.arg("value")?;
    interp.push(Value::String(value.to_string()));
    Ok(())
}

fn keys(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let names: Vec<String> = match interp.arg("value")? {
        Value::AssocArray(map) => map.borrow().keys().cloned().collect(),
        Value::Frame(frame) => frame.borrow().snapshot().into_keys().collect(),
        Value::ClassNode(node) => node.serialize()?.as_dict()?.borrow().keys().cloned().collect(),
        other => return Err(RuntimeError::type_mismatch("assoc", other.type_name())),
    };
    interp.push(Value::array(names.into_iter().map(Value::String).collect()));
    Ok(())
}

fn now(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let now: DateTime<FixedOffset> = Local::now().into();
    interp.push(Value::DateTime(now));
    Ok(())
}

fn is_empty(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let empty = interp.arg("value")?.is_empty()?;
    interp.push(Value::Bool(empty));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterpreterConfig;
    use crate::loader::MemoryLoader;
    use crate::vm::callable::{Callable, DirectiveFactory};
    use indexmap::IndexMap;
    use pretty_assertions::assert_eq;

    fn interp() -> Interpreter {
        Interpreter::new(
            InterpreterConfig::default(),
            Rc::new(registry()),
            Rc::new(MemoryLoader::new()),
            IndexMap::new(),
        )
    }

    fn call(vm: &mut Interpreter, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let callable = vm.directive(name)?;
        vm.call_sync(&callable, args, None)
    }

    #[test]
    fn test_registry_contents() {
        let names: Vec<String> = registry().interps().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["scope", "range", "length", "string", "keys", "now", "isEmpty"]
        );
    }

    #[test]
    fn test_range_forms() {
        let mut vm = interp();
        let r = call(&mut vm, "range", vec![Value::Int(3)]).unwrap();
        assert_eq!(r.as_range().unwrap().collect().to_string(), "[0, 1, 2]");
        let r = call(&mut vm, "range", vec![Value::Int(1), Value::Int(7), Value::Int(3)]).unwrap();
        assert_eq!(r.as_range().unwrap().collect().to_string(), "[1, 4]");
        assert!(call(&mut vm, "range", vec![Value::Int(1), Value::Int(2), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_length_and_is_empty() {
        let mut vm = interp();
        assert_eq!(call(&mut vm, "length", vec![Value::from("abc")]).unwrap(), Value::Int(3));
        assert_eq!(call(&mut vm, "isEmpty", vec![Value::Null]).unwrap(), Value::Bool(true));
        assert!(call(&mut vm, "length", vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn test_length_of_huge_range() {
        let mut vm = interp();
        let args = vec![Value::Int(0), Value::Int(i64::MAX), Value::Int(2)];
        let range = call(&mut vm, "range", args).unwrap();
        assert_eq!(call(&mut vm, "length", vec![range.clone()]).unwrap(), Value::Int(1 << 62));
        assert_eq!(call(&mut vm, "isEmpty", vec![range.clone()]).unwrap(), Value::Bool(false));
        assert!(range.truthy().unwrap());

        let args = vec![Value::Int(i64::MIN), Value::Int(i64::MAX), Value::Int(1)];
        let whole = call(&mut vm, "range", args).unwrap();
        assert!(call(&mut vm, "length", vec![whole]).is_err());
    }

    #[test]
    fn test_keys_and_string() {
        let mut vm = interp();
        let mut map = IndexMap::new();
        map.insert("b".to_string(), Value::Int(1));
        map.insert("a".to_string(), Value::Int(2));
        let keys = call(&mut vm, "keys", vec![Value::dict(map)]).unwrap();
        assert_eq!(keys.to_string(), "[b, a]");
        assert_eq!(call(&mut vm, "string", vec![Value::Int(42)]).unwrap(), Value::from("42"));
    }

    #[test]
    fn test_now_is_datetime() {
        let mut vm = interp();
        assert!(matches!(call(&mut vm, "now", Vec::new()).unwrap(), Value::DateTime(_)));
    }

    #[test]
    fn test_scope_skips_transparent_frames() {
        let mut vm = interp();
        let scope = vm.directive("scope").unwrap();
        let probe = Rc::new(Callable::native(
            "probe",
            &["item"],
            Rc::new(move |interp: &mut Interpreter| {
                let snapshot = interp.call_sync(&scope, Vec::new(), None)?;
                interp.push(snapshot);
                Ok(())
            }),
        ));
        let snapshot = vm.call_sync(&probe, vec![Value::from("x")], None).unwrap();
        let map = snapshot.as_dict().unwrap();
        assert_eq!(map.borrow()["item"], Value::from("x"));
        assert!(!map.borrow().contains_key("__directive__"));
    }
}
