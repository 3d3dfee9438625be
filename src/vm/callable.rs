//! Callables and the native directive protocol.
//!
//! A `Callable` wraps either compiled bytecode or a native directive function.
//! Native directives read their declared attributes from the current frame
//! and leave exactly one result value on the current stack block.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::{CodeRef, Symbol};
use crate::error::RuntimeError;
use crate::value::Value;
use crate::vm::Interpreter;

/// Signature of a native directive body.
pub type NativeFn = Rc<dyn Fn(&mut Interpreter) -> Result<(), RuntimeError>>;

#[derive(Clone)]
pub enum CallableBody {
    Code(CodeRef),
    Native(NativeFn),
}

/// A directive ready to be invoked.
#[derive(Clone)]
pub struct Callable {
    symbol: Symbol,
    body: CallableBody,
    defaults: IndexMap<String, Value>,
    this: Option<Value>,
    scoped: bool,
}

impl Callable {
    pub fn from_code(code: CodeRef, defaults: IndexMap<String, Value>) -> Self {
        let object = code.code();
        Self {
            symbol: object.symbol.clone(),
            scoped: !object.noscope,
            body: CallableBody::Code(code),
            defaults,
            this: None,
        }
    }

    pub fn native(name: impl Into<String>, attributes: &[&str], func: NativeFn) -> Self {
        Self {
            symbol: Symbol::new(
                name,
                attributes.iter().map(|a| a.to_string()).collect(),
                String::new(),
            ),
            body: CallableBody::Native(func),
            defaults: IndexMap::new(),
            this: None,
            scoped: true,
        }
    }

    pub fn from_descriptor(descriptor: &DirectiveDescriptor) -> Self {
        Self {
            symbol: Symbol::new(
                descriptor.name.clone(),
                descriptor.attributes.clone(),
                String::new(),
            ),
            body: CallableBody::Native(descriptor.func.clone()),
            defaults: descriptor.defaults.clone(),
            this: None,
            scoped: descriptor.scoped,
        }
    }

    pub fn with_default(mut self, name: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    /// Run in a transparent frame.
    pub fn transparent(mut self) -> Self {
        self.scoped = false;
        self
    }

    /// Replace the declared attributes and defaults.
    pub fn set_signature(&mut self, attributes: Vec<String>, defaults: IndexMap<String, Value>) {
        self.symbol.attributes = attributes;
        self.defaults = defaults;
    }

    /// A copy of this callable with `this` bound.
    pub fn bind(&self, this: Value) -> Rc<Callable> {
        let mut bound = self.clone();
        bound.this = Some(this);
        Rc::new(bound)
    }

    pub fn name(&self) -> &str {
        &self.symbol.name
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn module_name(&self) -> &str {
        &self.symbol.module
    }

    pub fn attributes(&self) -> &[String] {
        &self.symbol.attributes
    }

    pub fn defaults(&self) -> &IndexMap<String, Value> {
        &self.defaults
    }

    pub fn this(&self) -> Option<&Value> {
        self.this.as_ref()
    }

    pub fn body(&self) -> &CallableBody {
        &self.body
    }

    pub fn owns_scope(&self) -> bool {
        self.scoped
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, CallableBody::Native(_))
    }

    pub fn code(&self) -> Option<&CodeRef> {
        match &self.body {
            CallableBody::Code(code) => Some(code),
            CallableBody::Native(_) => None,
        }
    }

    pub fn native_fn(&self) -> Option<NativeFn> {
        match &self.body {
            CallableBody::Native(func) => Some(func.clone()),
            CallableBody::Code(_) => None,
        }
    }

    /// Whether this runs a module's entry code object.
    pub fn is_module_entry(&self) -> bool {
        self.code().is_some_and(|code| code.is_module_entry())
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.symbol.name)
            .field("module", &self.symbol.module)
            .field("attributes", &self.symbol.attributes)
            .field("native", &self.is_native())
            .field("bound", &self.this.is_some())
            .finish()
    }
}

// ============ Directive registration ============

/// Registration record of a native directive.
#[derive(Clone)]
pub struct DirectiveDescriptor {
    pub name: String,
    pub attributes: Vec<String>,
    pub defaults: IndexMap<String, Value>,
    pub scoped: bool,
    pub func: NativeFn,
}

impl DirectiveDescriptor {
    pub fn new<F>(name: impl Into<String>, attributes: &[&str], func: F) -> Self
    where
        F: Fn(&mut Interpreter) -> Result<(), RuntimeError> + 'static,
    {
        Self {
            name: name.into(),
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            defaults: IndexMap::new(),
            scoped: true,
            func: Rc::new(func),
        }
    }

    pub fn with_default(mut self, name: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(name.into(), value);
        self
    }

    pub fn transparent(mut self) -> Self {
        self.scoped = false;
        self
    }
}

impl fmt::Debug for DirectiveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectiveDescriptor")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Source of native directives.
pub trait DirectiveFactory {
    /// Every directive this factory provides.
    fn interps(&self) -> Vec<DirectiveDescriptor>;

    fn get(&self, name: &str) -> Option<DirectiveDescriptor>;

    fn lookup(&self, name: &str) -> Result<DirectiveDescriptor, RuntimeError> {
        self.get(name)
            .ok_or_else(|| RuntimeError::DirectiveNotFound(name.to_string()))
    }
}

/// A directive table with an optional base factory consulted on miss.
#[derive(Default)]
pub struct DirectiveRegistry {
    entries: IndexMap<String, DirectiveDescriptor>,
    base: Option<Rc<dyn DirectiveFactory>>,
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: Rc<dyn DirectiveFactory>) -> Self {
        Self {
            entries: IndexMap::new(),
            base: Some(base),
        }
    }

    /// Register a directive, replacing any earlier one with the same name.
    pub fn register(&mut self, descriptor: DirectiveDescriptor) -> &mut Self {
        self.entries.insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DirectiveFactory for DirectiveRegistry {
    fn interps(&self) -> Vec<DirectiveDescriptor> {
        let mut all: IndexMap<String, DirectiveDescriptor> = IndexMap::new();
        if let Some(base) = &self.base {
            for descriptor in base.interps() {
                all.insert(descriptor.name.clone(), descriptor);
            }
        }
        for (name, descriptor) in &self.entries {
            all.insert(name.clone(), descriptor.clone());
        }
        all.into_values().collect()
    }

    fn get(&self, name: &str) -> Option<DirectiveDescriptor> {
        match self.entries.get(name) {
            Some(descriptor) => Some(descriptor.clone()),
            None => self.base.as_ref().and_then(|base| base.get(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, value: i64) -> DirectiveDescriptor {
        DirectiveDescriptor::new(name, &[], move |interp: &mut Interpreter| {
            interp.push(Value::Int(value));
            Ok(())
        })
    }

    #[test]
    fn test_bind_keeps_original_unbound() {
        let callable = Callable::from_descriptor(&constant("one", 1));
        let bound = callable.bind(Value::from("ctx"));
        assert!(callable.this().is_none());
        assert_eq!(bound.this().unwrap().as_str().unwrap(), "ctx");
        assert_eq!(bound.name(), "one");
    }

    #[test]
    fn test_native_body() {
        let callable = Callable::from_descriptor(&constant("one", 1).transparent());
        assert!(callable.is_native());
        assert!(callable.code().is_none());
        assert!(!callable.owns_scope());
        assert!(!callable.is_module_entry());
    }

    #[test]
    fn test_registry_falls_back_to_base() {
        let mut base = DirectiveRegistry::new();
        base.register(constant("one", 1)).register(constant("two", 2));
        let mut derived = DirectiveRegistry::with_base(Rc::new(base));
        derived.register(constant("two", 22)).register(constant("three", 3));

        assert!(derived.get("one").is_some());
        assert!(derived.get("three").is_some());
        let names: Vec<String> = derived.interps().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_lookup_missing_directive() {
        let registry = DirectiveRegistry::with_base(Rc::new(DirectiveRegistry::new()));
        match registry.lookup("ghost") {
            Err(RuntimeError::DirectiveNotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("unexpected {:?}", other.map(|d| d.name)),
        }
    }
}
