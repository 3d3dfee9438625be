//! Call protocol: argument binding, frame entry, imports and nested synchronous calls.

use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::bytecode::{CallSpec, ModuleObject};
use crate::error::{RuntimeError, VmError};
use crate::value::{AsyncResult, Dict, Value};

use super::callable::Callable;
use super::frame::ExecutionFrame;
use super::interpreter::{Interpreter, Invocation, Resumption, Step, Suspension};

impl Interpreter {
    /// Execute a `Call`: pop the callee, keyword dict and positional arguments,
    /// bind them and enter the callee's frame.
    pub(crate) fn call(&mut self, spec: CallSpec) -> Result<(), RuntimeError> {
        let callee = self.stack.pop()?;
        let callable = Self::resolve_callable(callee)?;
        let kwargs = if spec.has_keyword_dict() {
            Some(self.stack.pop()?.as_dict()?)
        } else {
            None
        };
        let positional = self.stack.pop_n(spec.positional())?;
        let args = Self::bind_arguments(&callable, positional, kwargs.as_ref())?;
        self.enter(callable, args)
    }

    fn resolve_callable(callee: Value) -> Result<Rc<Callable>, RuntimeError> {
        match callee {
            Value::Callable(callable) => Ok(callable),
            Value::ClassNode(node) => node.call(),
            Value::CodeObject(code) => Ok(Rc::new(Callable::from_code(code, IndexMap::new()))),
            other => Err(RuntimeError::type_mismatch("callable", other.type_name())),
        }
    }

    /// Map call-site values onto the callable's declared attributes.
    fn bind_arguments(
        callable: &Callable,
        positional: Vec<Value>,
        kwargs: Option<&Dict>,
    ) -> Result<IndexMap<String, Value>, RuntimeError> {
        let attributes = callable.attributes();
        if positional.len() > attributes.len() {
            return Err(RuntimeError::arity(
                callable.name(),
                format!(
                    "takes {} arguments but {} were given",
                    attributes.len(),
                    positional.len()
                ),
            ));
        }

        let given = positional.len();
        let mut bound: IndexMap<String, Value> = attributes.iter().cloned().zip(positional).collect();

        let kwargs = kwargs.map(|dict| dict.borrow().clone()).unwrap_or_default();
        for key in kwargs.keys() {
            if key == "this" {
                continue;
            }
            if !attributes.contains(key) {
                return Err(RuntimeError::arity(
                    callable.name(),
                    format!("unexpected keyword argument '{}'", key),
                ));
            }
            if bound.contains_key(key) {
                return Err(RuntimeError::arity(
                    callable.name(),
                    format!("argument '{}' given twice", key),
                ));
            }
        }

        for name in &attributes[given..] {
            let value = match kwargs.get(name) {
                Some(value) => value.clone(),
                None => match callable.defaults().get(name) {
                    Some(default) => default.deep_copy(),
                    None => return Err(RuntimeError::missing_argument(callable.name(), name)),
                },
            };
            bound.insert(name.clone(), value);
        }

        let this = callable.this().cloned().or_else(|| kwargs.get("this").cloned());
        if let Some(this) = this {
            bound.insert("this".to_string(), this);
        }
        Ok(bound)
    }

    /// Push a frame for `callable`; native bodies run immediately.
    pub(crate) fn enter(
        &mut self,
        callable: Rc<Callable>,
        args: IndexMap<String, Value>,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeError::RecursionLimit(self.config.max_frames));
        }
        debug!(
            callable = callable.name(),
            module = callable.module_name(),
            depth = self.frames.len(),
            "call"
        );

        let frame = ExecutionFrame::new_ref(callable.clone(), args);
        if callable.is_module_entry() {
            self.module_frames
                .insert(callable.module_name().to_string(), frame.clone());
        }
        self.frames.push(frame);
        self.stack.open_block();

        if let Some(func) = callable.native_fn() {
            func(self)?;
        }
        Ok(())
    }

    /// Stage a call the same way compiled code does, then perform it.
    pub(crate) fn push_call(
        &mut self,
        callable: &Rc<Callable>,
        args: Vec<Value>,
        kwargs: Option<IndexMap<String, Value>>,
    ) -> Result<(), RuntimeError> {
        let spec = CallSpec::new(args.len(), kwargs.is_some());
        for arg in args {
            self.stack.push(arg);
        }
        if let Some(kwargs) = kwargs {
            self.stack.push(Value::dict(kwargs));
        }
        self.stack.push(Value::Callable(callable.clone()));
        self.call(spec)
    }

    /// Run `callable` to completion inside the current invocation.
    ///
    /// Used by native directives and the render back end. The call cannot
    /// suspend: awaiting an unsettled result or loading a module asynchronously
    /// fails with an internal error. If the call fails, its frame trace is kept
    /// for the enclosing invocation; a directive that recovers from the error
    /// should call `discard_fault`.
    pub fn call_sync(
        &mut self,
        callable: &Rc<Callable>,
        args: Vec<Value>,
        kwargs: Option<IndexMap<String, Value>>,
    ) -> Result<Value, RuntimeError> {
        let base_depth = self.frames.len();
        self.stack.open_block();
        self.sync_calls += 1;
        let outcome = match self.push_call(callable, args, kwargs) {
            Ok(()) => self.run_until(base_depth),
            Err(e) => Err(self.fault(e, base_depth)),
        };
        self.sync_calls -= 1;

        let result = match outcome {
            Ok(Step::Done(value)) => Ok(value),
            Ok(Step::Suspended(_)) => {
                self.unwind_to(base_depth);
                Err(RuntimeError::internal("synchronous call suspended"))
            }
            Err(e) => Err(e),
        };
        self.stack.close_block()?;
        result
    }

    // --- Imports ---

    /// Start importing `name`.
    ///
    /// Returns `None` when the import is under way or already done (a cached
    /// module frame is pushed directly), or the pending load to suspend on.
    pub(crate) fn import(
        &mut self,
        name: &str,
    ) -> Result<Option<AsyncResult<Rc<ModuleObject>>>, RuntimeError> {
        if let Some(frame) = self.module_frames.get(name) {
            debug!(module = name, "import cached");
            self.stack.push(Value::Frame(frame.clone()));
            return Ok(None);
        }
        if let Some(module) = self.loader.get(name) {
            self.enter_module(name, module)?;
            return Ok(None);
        }

        debug!(module = name, "loading module");
        let pending = self.loader.load(name);
        match pending.outcome() {
            Some(Ok(module)) => {
                self.enter_module(name, module)?;
                Ok(None)
            }
            Some(Err(error)) => Err(RuntimeError::HostRejection(Box::new(error))),
            None if self.sync_calls > 0 => Err(RuntimeError::internal(format!(
                "module '{}' cannot be loaded inside a synchronous call",
                name
            ))),
            None => Ok(Some(pending)),
        }
    }

    /// Enter a module's entry code object.
    pub(crate) fn enter_module(
        &mut self,
        name: &str,
        module: Rc<ModuleObject>,
    ) -> Result<(), RuntimeError> {
        if module.name != name {
            return Err(RuntimeError::new(format!(
                "loader returned module '{}' for '{}'",
                module.name, name
            )));
        }
        let callable = Rc::new(Callable::from_code(module.main_code(), IndexMap::new()));
        self.enter(callable, IndexMap::new())
    }

    // --- Public invocations ---

    /// Claim the interpreter for a public invocation and open its host block.
    pub(crate) fn begin_invocation(
        &mut self,
        result: AsyncResult<Value>,
    ) -> Result<usize, RuntimeError> {
        if self.invocation.is_some() {
            return Err(RuntimeError::internal(
                "interpreter busy: an invocation is suspended",
            ));
        }
        let base_depth = self.frames.len();
        self.stack.open_block();
        self.fault_trace = None;
        self.invocation = Some(Invocation { base_depth, result });
        Ok(base_depth)
    }

    /// Release the invocation, returning the result to settle.
    pub(crate) fn end_invocation(&mut self) -> Option<AsyncResult<Value>> {
        let invocation = self.invocation.take()?;
        self.unwind_to(invocation.base_depth);
        if let Err(e) = self.stack.close_block() {
            tracing::error!(error = %e, "host block missing at end of invocation");
        }
        Some(invocation.result)
    }

    /// Close the invocation after a failure, pairing the error with its trace.
    pub(crate) fn fail_invocation(
        &mut self,
        error: RuntimeError,
    ) -> (Option<AsyncResult<Value>>, VmError) {
        let trace = match self.fault_trace.take() {
            Some(trace) => trace,
            None => self.capture_trace(),
        };
        (self.end_invocation(), VmError::new(error, trace))
    }

    pub(crate) fn start_call(
        &mut self,
        base_depth: usize,
        callable: &Rc<Callable>,
        args: Vec<Value>,
        kwargs: Option<IndexMap<String, Value>>,
    ) -> Result<Step, RuntimeError> {
        match self.push_call(callable, args, kwargs) {
            Ok(()) => self.run_until(base_depth),
            Err(e) => Err(self.fault(e, base_depth)),
        }
    }

    pub(crate) fn start_import(&mut self, base_depth: usize, name: &str) -> Result<Step, RuntimeError> {
        match self.import(name) {
            Ok(None) if self.frames.len() > base_depth => self.run_until(base_depth),
            Ok(None) => Ok(Step::Done(self.stack.pop()?)),
            Ok(Some(pending)) => Ok(Step::Suspended(Suspension::Load {
                module: name.to_string(),
                pending,
            })),
            Err(e) => Err(self.fault(e, base_depth)),
        }
    }

    /// Continue a suspended invocation with the host's answer.
    pub(crate) fn resume(&mut self, resumption: Resumption) -> Result<Step, RuntimeError> {
        let base_depth = self
            .invocation
            .as_ref()
            .map(|invocation| invocation.base_depth)
            .ok_or_else(|| RuntimeError::internal("resumed without a suspended invocation"))?;
        debug!(depth = self.frames.len(), "resuming");

        let started = match resumption {
            Resumption::Settled { outcome, strict } => self.settle_await(outcome, strict),
            Resumption::Loaded { module, object } => self.enter_module(&module, object),
            Resumption::LoadFailed(error) => Err(RuntimeError::HostRejection(Box::new(error))),
        };
        match started {
            Ok(()) => self.run_until(base_depth),
            Err(e) => Err(self.fault(e, base_depth)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, Constant, Instruction, OpCode};
    use crate::config::InterpreterConfig;
    use crate::loader::MemoryLoader;
    use crate::vm::builtins;
    use crate::vm::callable::{DirectiveDescriptor, NativeFn};

    fn interpreter() -> Interpreter {
        Interpreter::new(
            InterpreterConfig::default(),
            Rc::new(builtins::registry()),
            Rc::new(MemoryLoader::new()),
            IndexMap::new(),
        )
    }

    fn echo(attributes: &[&str]) -> Rc<Callable> {
        let names: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        let func: NativeFn = Rc::new(move |interp: &mut Interpreter| {
            let mut out = IndexMap::new();
            for name in &names {
                out.insert(name.clone(), interp.arg(name)?);
            }
            if let Ok(this) = interp.arg("this") {
                out.insert("this".to_string(), this);
            }
            interp.push(Value::dict(out));
            Ok(())
        });
        Rc::new(Callable::native("echo", attributes, func))
    }

    fn kw(pairs: &[(&str, Value)]) -> Option<IndexMap<String, Value>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    fn field(result: &Value, name: &str) -> Value {
        result.as_dict().unwrap().borrow()[name].clone()
    }

    #[test]
    fn test_positional_then_keyword() {
        let mut interp = interpreter();
        let callable = echo(&["a", "b"]);
        let result = interp
            .call_sync(&callable, vec![Value::Int(1)], kw(&[("b", Value::Int(2))]))
            .unwrap();
        assert_eq!(field(&result, "a").as_int().unwrap(), 1);
        assert_eq!(field(&result, "b").as_int().unwrap(), 2);
    }

    #[test]
    fn test_defaults_fill_missing_attributes() {
        let mut interp = interpreter();
        let mut callable = (*echo(&["a", "b"])).clone();
        let mut defaults = IndexMap::new();
        defaults.insert("b".to_string(), Value::from("dflt"));
        callable.set_signature(vec!["a".into(), "b".into()], defaults);
        let result = interp
            .call_sync(&Rc::new(callable), vec![Value::Int(1)], None)
            .unwrap();
        assert_eq!(field(&result, "b").as_str().unwrap(), "dflt");
    }

    #[test]
    fn test_missing_argument() {
        let mut interp = interpreter();
        let err = interp.call_sync(&echo(&["a"]), Vec::new(), None).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingArgument { .. }));
        assert_eq!(interp.stack().total_len(), 0);
    }

    #[test]
    fn test_too_many_positional_arguments() {
        let mut interp = interpreter();
        let err = interp
            .call_sync(&echo(&["a"]), vec![Value::Int(1), Value::Int(2)], None)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Arity { .. }));
    }

    #[test]
    fn test_unexpected_and_duplicate_keywords() {
        let mut interp = interpreter();
        let err = interp
            .call_sync(&echo(&["a"]), Vec::new(), kw(&[("zzz", Value::Int(1))]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Arity { .. }));

        let err = interp
            .call_sync(&echo(&["a"]), vec![Value::Int(1)], kw(&[("a", Value::Int(2))]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Arity { .. }));
    }

    #[test]
    fn test_this_binding() {
        let mut interp = interpreter();
        let result = interp
            .call_sync(&echo(&[]), Vec::new(), kw(&[("this", Value::from("kw"))]))
            .unwrap();
        assert_eq!(field(&result, "this").as_str().unwrap(), "kw");

        let bound = echo(&[]).bind(Value::from("bound"));
        let result = interp
            .call_sync(&bound, Vec::new(), kw(&[("this", Value::from("kw"))]))
            .unwrap();
        assert_eq!(field(&result, "this").as_str().unwrap(), "bound");
    }

    #[test]
    fn test_recursion_limit() {
        let mut module = ModuleObject::new("loop");
        let name = module.add_const(Constant::String("again".into()));
        let code = module.add_const(Constant::Code(1));
        module.add_code(CodeObject::new("main", &[], vec![
            Instruction::new(OpCode::LoadConst, code),
            Instruction::bare(OpCode::MakeFunction),
            Instruction::new(OpCode::StoreGlobal, name),
            Instruction::bare(OpCode::LoadNull),
            Instruction::bare(OpCode::Return),
        ]));
        module.add_code(CodeObject::new("again", &[], vec![
            Instruction::new(OpCode::LoadGlobal, name),
            Instruction::new(OpCode::Call, CallSpec::new(0, false).operand()),
            Instruction::bare(OpCode::Return),
        ]));
        let module = Rc::new(module.finish().unwrap());

        let mut interp = Interpreter::new(
            InterpreterConfig {
                max_frames: 16,
                ..InterpreterConfig::default()
            },
            Rc::new(builtins::registry()),
            Rc::new(MemoryLoader::new()),
            IndexMap::new(),
        );
        let frame = interp
            .call_sync(&Rc::new(Callable::from_code(module.main_code(), IndexMap::new())), Vec::new(), None)
            .unwrap()
            .as_frame()
            .unwrap();
        let again = frame.borrow().get_value("again").unwrap().as_callable().unwrap();
        let err = interp.call_sync(&again, Vec::new(), None).unwrap_err();
        assert!(matches!(err, RuntimeError::RecursionLimit(16)));
        assert_eq!(interp.frame_depth(), 0);
    }

    #[test]
    fn test_directive_lookup() {
        let interp = interpreter();
        assert!(interp.directive("length").is_ok());
        assert!(matches!(
            interp.directive("nope"),
            Err(RuntimeError::DirectiveNotFound(_))
        ));
    }

    #[test]
    fn test_native_error_propagates_from_directive() {
        let mut interp = interpreter();
        let failing = Rc::new(Callable::from_descriptor(&DirectiveDescriptor::new(
            "fail",
            &[],
            |_: &mut Interpreter| Err(RuntimeError::new("nope")),
        )));
        assert!(interp.call_sync(&failing, Vec::new(), None).is_err());
        assert_eq!(interp.frame_depth(), 0);
        assert_eq!(interp.stack().depth(), 0);
    }
}
