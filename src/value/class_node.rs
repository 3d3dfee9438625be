//! Object-like values: the capability trait and its built-in implementations.
//!
//! A `ClassNode` answers only the capabilities it supports; every default
//! method fails with `NotImplemented` naming the class and the capability.

use std::any::Any;
use std::cell::RefCell;
use std::fmt::{self, Write};
use std::rc::{Rc, Weak};

use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::value::{DataRange, Value};
use crate::vm::callable::{Callable, NativeFn};
use crate::vm::Interpreter;

/// Capability set of an object-like value.
pub trait ClassNode {
    fn class_name(&self) -> String;

    fn as_any(&self) -> &dyn Any;

    fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        let _ = name;
        Err(RuntimeError::not_implemented(self.class_name(), "attribute access"))
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let _ = (name, value);
        Err(RuntimeError::not_implemented(self.class_name(), "attribute assignment"))
    }

    fn get_at(&self, key: &Value) -> Result<Value, RuntimeError> {
        let _ = key;
        Err(RuntimeError::not_implemented(self.class_name(), "indexing"))
    }

    fn range(&self) -> Result<DataRange, RuntimeError> {
        Err(RuntimeError::not_implemented(self.class_name(), "iteration"))
    }

    fn slice(&self, start: Option<i64>, end: Option<i64>) -> Result<Value, RuntimeError> {
        let _ = (start, end);
        Err(RuntimeError::not_implemented(self.class_name(), "slicing"))
    }

    /// The callable to invoke when the object itself is called.
    fn call(&self) -> Result<Rc<Callable>, RuntimeError> {
        Err(RuntimeError::not_implemented(self.class_name(), "calls"))
    }

    fn length(&self) -> Result<usize, RuntimeError> {
        Err(RuntimeError::not_implemented(self.class_name(), "length"))
    }

    fn is_empty(&self) -> Result<bool, RuntimeError> {
        Err(RuntimeError::not_implemented(self.class_name(), "emptiness"))
    }

    /// Plain-data form used by JSON output.
    fn serialize(&self) -> Result<Value, RuntimeError> {
        Err(RuntimeError::not_implemented(self.class_name(), "serialization"))
    }
}

impl fmt::Debug for dyn ClassNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.class_name())
    }
}

// ============ DateTime ============

pub const DEFAULT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Attribute view over a `Value::DateTime`.
#[derive(Debug, Clone, Copy)]
pub struct DateTimeNode(pub DateTime<FixedOffset>);

impl DateTimeNode {
    pub fn new(dt: DateTime<FixedOffset>) -> Self {
        Self(dt)
    }

    fn format_callable(&self) -> Rc<Callable> {
        let func: NativeFn = Rc::new(datetime_format);
        Callable::native("format", &["pattern"], func)
            .with_default("pattern", Value::string(DEFAULT_DATETIME_FORMAT))
            .bind(Value::DateTime(self.0))
    }
}

/// Format a datetime, reporting bad patterns instead of panicking.
pub fn format_datetime(dt: &DateTime<FixedOffset>, pattern: &str) -> Result<String, RuntimeError> {
    let mut out = String::new();
    write!(out, "{}", dt.format(pattern))
        .map_err(|_| RuntimeError::new(format!("Invalid datetime format '{}'", pattern)))?;
    Ok(out)
}

fn datetime_format(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let dt = interp.arg("this")?.as_datetime()?;
    let pattern = interp.arg("pattern")?;
    let text = format_datetime(&dt, pattern.as_str()?)?;
    interp.push(Value::String(text));
    Ok(())
}

impl ClassNode for DateTimeNode {
    fn class_name(&self) -> String {
        "DateTime".to_string()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        let dt = &self.0;
        Ok(match name {
            "year" => Value::Int(dt.year() as i64),
            "month" => Value::Int(dt.month() as i64),
            "day" => Value::Int(dt.day() as i64),
            "hour" => Value::Int(dt.hour() as i64),
            "minute" => Value::Int(dt.minute() as i64),
            "second" => Value::Int(dt.second() as i64),
            "weekday" => Value::Int(dt.weekday().num_days_from_monday() as i64),
            "timestamp" => Value::Int(dt.timestamp()),
            "iso" => Value::String(dt.to_rfc3339()),
            "format" => Value::Callable(self.format_callable()),
            _ => return Err(RuntimeError::name_not_found(format!("DateTime.{}", name))),
        })
    }

    fn is_empty(&self) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    fn serialize(&self) -> Result<Value, RuntimeError> {
        Ok(Value::String(self.0.to_rfc3339()))
    }
}

// ============ Declared classes ============

/// A class declared by bytecode (`MakeClass`).
///
/// Construction goes through the synthesized `__new__` callable, which takes
/// the same attributes and defaults as `__init__`.
pub struct DeclClass {
    name: String,
    attrs: RefCell<IndexMap<String, Value>>,
    base: Option<Rc<DeclClass>>,
    init: Rc<Callable>,
    me: Weak<DeclClass>,
}

impl DeclClass {
    pub fn new(
        name: impl Into<String>,
        mut attrs: IndexMap<String, Value>,
        base: Option<Rc<DeclClass>>,
    ) -> Result<Rc<Self>, RuntimeError> {
        let name = name.into();
        let init = match attrs.get("__init__") {
            Some(value) => value.as_callable()?,
            None => match &base {
                Some(base) => base.init.clone(),
                None => {
                    let noop: NativeFn = Rc::new(|interp: &mut Interpreter| {
                        interp.push(Value::Undef);
                        Ok(())
                    });
                    let init = Rc::new(Callable::native("__init__", &[], noop));
                    attrs.insert("__init__".to_string(), Value::Callable(init.clone()));
                    init
                }
            },
        };

        if !attrs.contains_key("__new__") {
            let construct: NativeFn = Rc::new(construct_instance);
            let mut new = Callable::native("__new__", &[], construct);
            new.set_signature(init.attributes().to_vec(), init.defaults().clone());
            attrs.insert("__new__".to_string(), Value::Callable(Rc::new(new)));
        }

        Ok(Rc::new_cyclic(|me| DeclClass {
            name,
            attrs: RefCell::new(attrs),
            base,
            init,
            me: me.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<&Rc<DeclClass>> {
        self.base.as_ref()
    }

    pub fn init(&self) -> &Rc<Callable> {
        &self.init
    }

    /// Recover the concrete class behind a class-node value.
    pub fn downcast(node: &Rc<dyn ClassNode>) -> Option<Rc<DeclClass>> {
        node.as_any()
            .downcast_ref::<DeclClass>()
            .and_then(|class| class.me.upgrade())
    }

    fn handle(&self) -> Result<Rc<DeclClass>, RuntimeError> {
        self.me
            .upgrade()
            .ok_or_else(|| RuntimeError::internal(format!("class '{}' was dropped", self.name)))
    }

    pub fn as_value(&self) -> Result<Value, RuntimeError> {
        let node: Rc<dyn ClassNode> = self.handle()?;
        Ok(Value::ClassNode(node))
    }

    /// Own attribute first, then the base chain.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.attrs.borrow().get(name) {
            return Some(value.clone());
        }
        self.base.as_ref().and_then(|base| base.lookup(name))
    }

    pub fn is_subclass_of(&self, other: &DeclClass) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match &self.base {
            Some(base) => base.is_subclass_of(other),
            None => false,
        }
    }

    /// Allocate an instance seeded with `__init__`'s defaults.
    pub fn instantiate(&self) -> Result<Rc<DeclClassInstance>, RuntimeError> {
        let data = self
            .init
            .defaults()
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy()))
            .collect();
        let class = self.handle()?;
        Ok(Rc::new_cyclic(|me| DeclClassInstance {
            class,
            data: RefCell::new(data),
            me: me.clone(),
        }))
    }
}

/// Native body of `__new__`: `this` is the class being instantiated.
fn construct_instance(interp: &mut Interpreter) -> Result<(), RuntimeError> {
    let node = interp.arg("this")?.as_class_node()?;
    let class = DeclClass::downcast(&node)
        .ok_or_else(|| RuntimeError::type_mismatch("class", node.class_name()))?;

    let init = class.init.clone();
    let mut args = IndexMap::new();
    for attribute in init.attributes() {
        args.insert(attribute.clone(), interp.arg(attribute)?);
    }

    let instance: Rc<dyn ClassNode> = class.instantiate()?;
    let instance = Value::ClassNode(instance);
    interp.call_sync(&init.bind(instance.clone()), Vec::new(), Some(args))?;
    interp.push(instance);
    Ok(())
}

impl fmt::Debug for DeclClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclClass")
            .field("name", &self.name)
            .field("base", &self.base.as_ref().map(|b| b.name.clone()))
            .finish()
    }
}

impl ClassNode for DeclClass {
    fn class_name(&self) -> String {
        self.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        if name == "__name__" {
            return Ok(Value::String(self.name.clone()));
        }
        match self.lookup(name) {
            Some(Value::Callable(new)) if name == "__new__" => {
                Ok(Value::Callable(new.bind(self.as_value()?)))
            }
            Some(value) => Ok(value),
            None => Err(RuntimeError::name_not_found(format!("{}.{}", self.name, name))),
        }
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.attrs.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn call(&self) -> Result<Rc<Callable>, RuntimeError> {
        match self.lookup("__new__") {
            Some(value) => Ok(value.as_callable()?.bind(self.as_value()?)),
            None => Err(RuntimeError::not_implemented(self.class_name(), "calls")),
        }
    }

    fn is_empty(&self) -> Result<bool, RuntimeError> {
        Ok(false)
    }
}

/// An instance of a `DeclClass`.
pub struct DeclClassInstance {
    class: Rc<DeclClass>,
    data: RefCell<IndexMap<String, Value>>,
    me: Weak<DeclClassInstance>,
}

impl DeclClassInstance {
    pub fn class(&self) -> &Rc<DeclClass> {
        &self.class
    }

    /// Snapshot of the instance data.
    pub fn data(&self) -> IndexMap<String, Value> {
        self.data.borrow().clone()
    }

    fn as_value(&self) -> Result<Value, RuntimeError> {
        let node: Rc<dyn ClassNode> = self.me.upgrade().ok_or_else(|| {
            RuntimeError::internal(format!("instance of '{}' was dropped", self.class.name))
        })?;
        Ok(Value::ClassNode(node))
    }
}

impl fmt::Debug for DeclClassInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclClassInstance")
            .field("class", &self.class.name)
            .field("fields", &self.data.borrow().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClassNode for DeclClassInstance {
    fn class_name(&self) -> String {
        self.class.name.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_attr(&self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.data.borrow().get(name) {
            return Ok(value.clone());
        }
        if name == "__class__" {
            return self.class.as_value();
        }
        match self.class.lookup(name) {
            Some(Value::Callable(method)) => Ok(Value::Callable(method.bind(self.as_value()?))),
            Some(value) => Ok(value),
            None => Err(RuntimeError::name_not_found(format!(
                "{}.{}",
                self.class.name, name
            ))),
        }
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.data.borrow_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn get_at(&self, key: &Value) -> Result<Value, RuntimeError> {
        self.get_attr(key.as_str()?)
    }

    fn is_empty(&self) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    fn serialize(&self) -> Result<Value, RuntimeError> {
        Ok(Value::dict(self.data()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_dt() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 0)
            .unwrap()
    }

    #[test]
    fn test_datetime_attributes() {
        let node = DateTimeNode::new(sample_dt());
        assert_eq!(node.get_attr("year").unwrap().as_int().unwrap(), 2024);
        assert_eq!(node.get_attr("month").unwrap().as_int().unwrap(), 3);
        assert_eq!(node.get_attr("weekday").unwrap().as_int().unwrap(), 5);
        assert!(node.get_attr("nope").is_err());
        assert!(matches!(node.get_attr("format").unwrap(), Value::Callable(_)));
    }

    #[test]
    fn test_datetime_lacks_slicing() {
        let node = DateTimeNode::new(sample_dt());
        match node.slice(None, None).unwrap_err() {
            RuntimeError::NotImplemented { type_name, capability } => {
                assert_eq!(type_name, "DateTime");
                assert_eq!(capability, "slicing");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_format_datetime() {
        assert_eq!(format_datetime(&sample_dt(), "%Y/%m/%d").unwrap(), "2024/03/09");
        assert!(format_datetime(&sample_dt(), "%Q").is_err());
    }

    #[test]
    fn test_class_without_init_gets_noop_init_and_new() {
        let class = DeclClass::new("Page", IndexMap::new(), None).unwrap();
        assert!(class.lookup("__init__").is_some());
        let new = class.call().unwrap();
        assert_eq!(new.name(), "__new__");
        assert!(new.attributes().is_empty());
        assert!(new.this().is_some());
    }

    #[test]
    fn test_subclass_inherits_base_attributes() {
        let mut attrs = IndexMap::new();
        attrs.insert("kind".to_string(), Value::from("base"));
        let base = DeclClass::new("Base", attrs, None).unwrap();
        let child = DeclClass::new("Child", IndexMap::new(), Some(base.clone())).unwrap();
        assert_eq!(child.get_attr("kind").unwrap().as_str().unwrap(), "base");
        assert!(child.is_subclass_of(&base));
        assert!(!base.is_subclass_of(&child));
        assert!(Rc::ptr_eq(child.init(), base.init()));
    }

    #[test]
    fn test_instance_lookup_order() {
        let mut attrs = IndexMap::new();
        attrs.insert("title".to_string(), Value::from("class-level"));
        let class = DeclClass::new("Card", attrs, None).unwrap();
        let instance = class.instantiate().unwrap();
        assert_eq!(instance.get_attr("title").unwrap().as_str().unwrap(), "class-level");
        instance.set_attr("title", Value::from("own")).unwrap();
        assert_eq!(instance.get_attr("title").unwrap().as_str().unwrap(), "own");
        assert!(matches!(
            instance.get_attr("missing"),
            Err(RuntimeError::NameNotFound(_))
        ));
    }

    #[test]
    fn test_instance_methods_are_bound() {
        let class = DeclClass::new("Card", IndexMap::new(), None).unwrap();
        let instance = class.instantiate().unwrap();
        match instance.get_attr("__init__").unwrap() {
            Value::Callable(method) => assert!(method.this().is_some()),
            other => panic!("expected callable, got {:?}", other),
        }
    }

    #[test]
    fn test_downcast() {
        let class = DeclClass::new("Card", IndexMap::new(), None).unwrap();
        let node: Rc<dyn ClassNode> = class.clone();
        assert!(DeclClass::downcast(&node).is_some());
        let dt: Rc<dyn ClassNode> = Rc::new(DateTimeNode::new(sample_dt()));
        assert!(DeclClass::downcast(&dt).is_none());
    }
}
