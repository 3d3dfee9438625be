//! Execution frames: one activation of a callable.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::Instruction;
use crate::error::RuntimeError;
use crate::value::Value;
use crate::vm::callable::Callable;

pub type FrameRef = Rc<RefCell<ExecutionFrame>>;

/// Bookkeeping variable holding the running directive's name.
pub const DIRECTIVE_VAR: &str = "__directive__";
/// Bookkeeping variable holding the declaring module's name.
pub const MODULE_VAR: &str = "__module__";

/// A callable bound to its variables and instruction cursor.
#[derive(Debug)]
pub struct ExecutionFrame {
    callable: Rc<Callable>,
    variables: IndexMap<String, Value>,
    cursor: usize,
}

impl ExecutionFrame {
    pub fn new(callable: Rc<Callable>, args: IndexMap<String, Value>) -> Self {
        let mut variables = IndexMap::with_capacity(args.len() + 2);
        variables.insert(DIRECTIVE_VAR.to_string(), Value::String(callable.name().to_string()));
        variables.insert(MODULE_VAR.to_string(), Value::String(callable.module_name().to_string()));
        variables.extend(args);
        Self {
            callable,
            variables,
            cursor: 0,
        }
    }

    pub fn new_ref(callable: Rc<Callable>, args: IndexMap<String, Value>) -> FrameRef {
        Rc::new(RefCell::new(Self::new(callable, args)))
    }

    pub fn callable(&self) -> &Rc<Callable> {
        &self.callable
    }

    pub fn owns_scope(&self) -> bool {
        self.callable.owns_scope()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.variables.get(name).cloned()
    }

    pub fn get_value(&self, name: &str) -> Result<Value, RuntimeError> {
        self.get_local(name)
            .ok_or_else(|| RuntimeError::name_not_found(name))
    }

    /// Create or overwrite a variable of this frame only.
    pub fn set_value(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &IndexMap<String, Value> {
        &self.variables
    }

    /// User-visible variables, without the bookkeeping entries.
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        self.variables
            .iter()
            .filter(|(k, _)| k.as_str() != DIRECTIVE_VAR && k.as_str() != MODULE_VAR)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    fn instruction_count(&self) -> usize {
        self.callable.code().map_or(0, |code| code.code().len())
    }

    /// Move the cursor; `index == len` is allowed and ends the frame.
    pub fn set_jump(&mut self, index: usize) -> Result<(), RuntimeError> {
        if self.callable.is_native() {
            return Ok(());
        }
        let len = self.instruction_count();
        if index > len {
            return Err(RuntimeError::internal(format!(
                "jump to {} past the end of '{}' ({} instructions)",
                index,
                self.callable.name(),
                len
            )));
        }
        self.cursor = index;
        Ok(())
    }

    /// Move the cursor to end-of-code.
    pub fn finish(&mut self) {
        self.cursor = self.instruction_count();
    }

    #[inline]
    pub fn advance(&mut self) {
        self.cursor += 1;
    }

    pub fn has_more_instructions(&self) -> bool {
        self.cursor < self.instruction_count()
    }

    pub fn current_instruction(&self) -> Option<Instruction> {
        self.callable
            .code()
            .and_then(|code| code.code().instructions.get(self.cursor).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, ModuleObject, OpCode};
    use crate::vm::callable::NativeFn;
    use crate::vm::Interpreter;

    fn bytecode_callable() -> Rc<Callable> {
        let mut module = ModuleObject::new("pages");
        module.add_code(CodeObject::new(
            "main",
            &["name"],
            vec![
                Instruction::bare(OpCode::LoadNull),
                Instruction::bare(OpCode::Return),
            ],
        ));
        let module = Rc::new(module.finish().unwrap());
        Rc::new(Callable::from_code(module.main_code(), IndexMap::new()))
    }

    fn native_callable() -> Rc<Callable> {
        let func: NativeFn = Rc::new(|interp: &mut Interpreter| {
            interp.push(Value::Null);
            Ok(())
        });
        Rc::new(Callable::native("noop", &[], func))
    }

    #[test]
    fn test_bookkeeping_entries() {
        let frame = ExecutionFrame::new(bytecode_callable(), IndexMap::new());
        assert_eq!(frame.get_value(DIRECTIVE_VAR).unwrap().as_str().unwrap(), "main");
        assert_eq!(frame.get_value(MODULE_VAR).unwrap().as_str().unwrap(), "pages");
        assert!(frame.snapshot().is_empty());
    }

    #[test]
    fn test_get_and_set() {
        let mut args = IndexMap::new();
        args.insert("name".to_string(), Value::from("Ada"));
        let mut frame = ExecutionFrame::new(bytecode_callable(), args);
        assert!(frame.has_value("name"));
        frame.set_value("count", Value::Int(2));
        assert_eq!(frame.get_value("count").unwrap().as_int().unwrap(), 2);
        assert!(matches!(
            frame.get_value("missing"),
            Err(RuntimeError::NameNotFound(_))
        ));
    }

    #[test]
    fn test_cursor_and_jumps() {
        let mut frame = ExecutionFrame::new(bytecode_callable(), IndexMap::new());
        assert!(frame.has_more_instructions());
        assert_eq!(frame.current_instruction().unwrap().op, OpCode::LoadNull);
        frame.advance();
        assert_eq!(frame.current_instruction().unwrap().op, OpCode::Return);
        frame.set_jump(2).unwrap();
        assert!(!frame.has_more_instructions());
        assert!(frame.set_jump(3).unwrap_err().is_internal());
    }

    #[test]
    fn test_native_frames_have_no_instructions() {
        let mut frame = ExecutionFrame::new(native_callable(), IndexMap::new());
        assert!(!frame.has_more_instructions());
        assert!(frame.current_instruction().is_none());
        frame.set_jump(40).unwrap();
        assert_eq!(frame.cursor(), 0);
    }
}
