//! Compiled modules: code objects plus a shared constant pool.

use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::instruction::Instruction;
use crate::error::RuntimeError;
use crate::value::Value;

/// Identity of a callable: its name, declared attributes and declaring module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    /// Declared attribute (parameter) names, in positional order.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Name of the declaring module; empty for native directives.
    #[serde(default)]
    pub module: String,
}

impl Symbol {
    pub fn new(name: impl Into<String>, attributes: Vec<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes,
            module: module.into(),
        }
    }
}

/// A compiled body of instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub symbol: Symbol,
    pub instructions: Vec<Instruction>,
    /// Transparent frames do not own a variable scope of their own.
    #[serde(default)]
    pub noscope: bool,
}

impl CodeObject {
    pub fn new(name: impl Into<String>, attributes: &[&str], instructions: Vec<Instruction>) -> Self {
        Self {
            symbol: Symbol::new(
                name,
                attributes.iter().map(|a| a.to_string()).collect(),
                String::new(),
            ),
            instructions,
            noscope: false,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// A constant pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Undef,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// RFC 3339 timestamp.
    DateTime(String),
    Array(Vec<Constant>),
    Dict(IndexMap<String, Constant>),
    /// Index into the module's code objects.
    Code(usize),
}

/// A compiled module: code objects plus a constant pool.
///
/// Modules are read-mostly shared data; loading a constant always yields fresh
/// containers so one invocation cannot corrupt the pool for the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleObject {
    pub name: String,
    #[serde(default)]
    pub constants: Vec<Constant>,
    pub code: Vec<CodeObject>,
    /// Index of the entry code object.
    #[serde(default)]
    pub main: usize,
}

impl ModuleObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constants: Vec::new(),
            code: Vec::new(),
            main: 0,
        }
    }

    /// Parse a JSON-serialized module and check its internal references.
    pub fn from_json(source: &str) -> Result<Self, RuntimeError> {
        let module: ModuleObject = serde_json::from_str(source)
            .map_err(|e| RuntimeError::new(format!("Invalid module file: {}", e)))?;
        module.finish()
    }

    /// Add a constant to the pool and return its index.
    pub fn add_const(&mut self, constant: Constant) -> i32 {
        // Names are looked up by index on every access, so reuse identical strings.
        if let Constant::String(ref s) = constant {
            if let Some(i) = self
                .constants
                .iter()
                .position(|c| matches!(c, Constant::String(existing) if existing == s))
            {
                return i as i32;
            }
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as i32
    }

    /// Add a code object and return its index.
    pub fn add_code(&mut self, code: CodeObject) -> usize {
        self.code.push(code);
        self.code.len() - 1
    }

    /// Stamp every code object with this module's name and validate references.
    pub fn finish(mut self) -> Result<Self, RuntimeError> {
        for code in &mut self.code {
            if code.symbol.module.is_empty() {
                code.symbol.module = self.name.clone();
            }
        }
        if self.main >= self.code.len() {
            return Err(RuntimeError::new(format!(
                "Module '{}' has no entry code object {}",
                self.name, self.main
            )));
        }
        for constant in &self.constants {
            self.check_constant(constant)?;
        }
        Ok(self)
    }

    fn check_constant(&self, constant: &Constant) -> Result<(), RuntimeError> {
        match constant {
            Constant::Code(i) if *i >= self.code.len() => Err(RuntimeError::new(format!(
                "Module '{}' references missing code object {}",
                self.name, i
            ))),
            Constant::Array(items) => items.iter().try_for_each(|c| self.check_constant(c)),
            Constant::Dict(entries) => entries.values().try_for_each(|c| self.check_constant(c)),
            _ => Ok(()),
        }
    }

    pub fn get_const(&self, index: usize) -> Result<&Constant, RuntimeError> {
        self.constants.get(index).ok_or_else(|| {
            RuntimeError::internal(format!(
                "constant {} out of range in module '{}'",
                index, self.name
            ))
        })
    }

    /// Read a string constant (variable and attribute names).
    pub fn name_const(&self, index: usize) -> Result<&str, RuntimeError> {
        match self.get_const(index)? {
            Constant::String(s) => Ok(s),
            other => Err(RuntimeError::internal(format!(
                "constant {} in module '{}' is not a name: {:?}",
                index, self.name, other
            ))),
        }
    }

    pub fn main_code(self: &Rc<Self>) -> CodeRef {
        CodeRef {
            module: self.clone(),
            index: self.main,
        }
    }

    /// Materialize a constant as a fresh runtime value.
    pub fn load_const(self: &Rc<Self>, index: usize) -> Result<Value, RuntimeError> {
        let constant = self.get_const(index)?;
        self.materialize(constant)
    }

    fn materialize(self: &Rc<Self>, constant: &Constant) -> Result<Value, RuntimeError> {
        Ok(match constant {
            Constant::Undef => Value::Undef,
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::String(s) => Value::String(s.clone()),
            Constant::DateTime(s) => Value::DateTime(
                chrono::DateTime::parse_from_rfc3339(s)
                    .map_err(|e| RuntimeError::new(format!("Invalid datetime '{}': {}", s, e)))?,
            ),
            Constant::Array(items) => Value::array(
                items
                    .iter()
                    .map(|c| self.materialize(c))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Constant::Dict(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (k, c) in entries {
                    map.insert(k.clone(), self.materialize(c)?);
                }
                Value::dict(map)
            }
            Constant::Code(i) => Value::CodeObject(CodeRef::new(self.clone(), *i)?),
        })
    }
}

/// A code object together with the module whose constant pool it reads.
#[derive(Debug, Clone)]
pub struct CodeRef {
    module: Rc<ModuleObject>,
    index: usize,
}

impl CodeRef {
    pub fn new(module: Rc<ModuleObject>, index: usize) -> Result<Self, RuntimeError> {
        if index >= module.code.len() {
            return Err(RuntimeError::internal(format!(
                "code object {} out of range in module '{}'",
                index, module.name
            )));
        }
        Ok(Self { module, index })
    }

    pub fn code(&self) -> &CodeObject {
        &self.module.code[self.index]
    }

    pub fn module(&self) -> &Rc<ModuleObject> {
        &self.module
    }

    /// Whether this is the entry code object of its module.
    pub fn is_module_entry(&self) -> bool {
        self.index == self.module.main
    }

    pub fn ptr_eq(&self, other: &CodeRef) -> bool {
        Rc::ptr_eq(&self.module, &other.module) && self.index == other.index
    }
}
