//! Public entry points: module import and callable execution.
//!
//! Both return an `AsyncResult`. When the bytecode awaits a host result that is
//! not settled yet, the interpreter state stays frozen inside the runtime and a
//! continuation registered on that result resumes the loop later.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use tracing::{debug, error, warn};

use crate::config::InterpreterConfig;
use crate::error::{RuntimeError, VmError};
use crate::loader::ModuleLoader;
use crate::value::{AsyncResult, Value};

use super::builtins;
use super::callable::{Callable, DirectiveFactory};
use super::interpreter::{Interpreter, Resumption, Step, Suspension};

/// Shared handle to one interpreter.
#[derive(Clone)]
pub struct Runtime {
    interp: Rc<RefCell<Interpreter>>,
}

impl Runtime {
    pub fn new(
        config: InterpreterConfig,
        factory: Rc<dyn DirectiveFactory>,
        loader: Rc<dyn ModuleLoader>,
        extra_globals: IndexMap<String, Value>,
    ) -> Self {
        Self {
            interp: Rc::new(RefCell::new(Interpreter::new(
                config,
                factory,
                loader,
                extra_globals,
            ))),
        }
    }

    /// Default configuration and the core directives.
    pub fn with_loader(loader: Rc<dyn ModuleLoader>) -> Self {
        Self::new(
            InterpreterConfig::default(),
            Rc::new(builtins::registry()),
            loader,
            IndexMap::new(),
        )
    }

    /// Run `f` against the interpreter unless it is running or suspended.
    ///
    /// A suspended invocation's state stays untouched until the host settles
    /// the result it awaits.
    pub fn with_interpreter<R>(&self, f: impl FnOnce(&mut Interpreter) -> R) -> Result<R, RuntimeError> {
        let mut interp = self
            .interp
            .try_borrow_mut()
            .map_err(|_| RuntimeError::internal("interpreter is running"))?;
        if interp.is_suspended() {
            return Err(RuntimeError::internal(
                "interpreter busy: an invocation is suspended",
            ));
        }
        Ok(f(&mut interp))
    }

    pub fn is_suspended(&self) -> bool {
        self.interp
            .try_borrow()
            .map(|interp| interp.is_suspended())
            .unwrap_or(false)
    }

    /// Import a module, resolving to its module frame.
    pub fn import_module(&self, name: &str) -> AsyncResult<Value> {
        let result = AsyncResult::new();
        let step = {
            let Ok(mut interp) = self.interp.try_borrow_mut() else {
                result.reject(RuntimeError::internal("interpreter is running").into());
                return result;
            };
            let base_depth = match interp.begin_invocation(result.clone()) {
                Ok(depth) => depth,
                Err(e) => {
                    result.reject(e.into());
                    return result;
                }
            };
            debug!(module = name, "import_module");
            interp.start_import(base_depth, name)
        };
        Self::settle(&self.interp, step);
        result
    }

    /// Invoke `callable`, resolving to its result value.
    pub fn exec_callable(
        &self,
        callable: &Rc<Callable>,
        args: Vec<Value>,
        kwargs: Option<IndexMap<String, Value>>,
    ) -> AsyncResult<Value> {
        let result = AsyncResult::new();
        let step = {
            let Ok(mut interp) = self.interp.try_borrow_mut() else {
                result.reject(RuntimeError::internal("interpreter is running").into());
                return result;
            };
            let base_depth = match interp.begin_invocation(result.clone()) {
                Ok(depth) => depth,
                Err(e) => {
                    result.reject(e.into());
                    return result;
                }
            };
            debug!(callable = callable.name(), "exec_callable");
            interp.start_call(base_depth, callable, args, kwargs)
        };
        Self::settle(&self.interp, step);
        result
    }

    /// Finish, fail or park the current invocation according to `step`.
    fn settle(interp: &Rc<RefCell<Interpreter>>, step: Result<Step, RuntimeError>) {
        let step = match step {
            Ok(Step::Suspended(suspension)) => {
                Self::suspend(interp, suspension);
                return;
            }
            other => other,
        };

        let (result, outcome) = {
            let Ok(mut state) = interp.try_borrow_mut() else {
                error!("interpreter borrowed while settling an invocation");
                return;
            };
            match step {
                Ok(Step::Done(value)) => (state.end_invocation(), Ok(value)),
                Err(e) => {
                    let (result, failure) = state.fail_invocation(e);
                    (result, Err(failure))
                }
                Ok(Step::Suspended(_)) => return,
            }
        };

        match (result, outcome) {
            (Some(result), Ok(value)) => {
                result.resolve(value);
            }
            (Some(result), Err(failure)) => {
                log_failure(&failure);
                result.reject(failure);
            }
            (None, Err(failure)) => {
                error!(error = %failure.report(), "failure with no invocation to report to");
            }
            (None, Ok(_)) => error!("invocation finished twice"),
        }
    }

    /// Register the continuation that resumes the loop once the host settles.
    fn suspend(interp: &Rc<RefCell<Interpreter>>, suspension: Suspension) {
        let on_success = Rc::downgrade(interp);
        let on_failure = on_success.clone();
        match suspension {
            Suspension::Await { pending, strict } => {
                debug!(strict, "invocation suspended on await");
                pending.then(
                    move |value| {
                        Self::resume(
                            &on_success,
                            Resumption::Settled {
                                outcome: Ok(value),
                                strict,
                            },
                        )
                    },
                    move |failure| {
                        Self::resume(
                            &on_failure,
                            Resumption::Settled {
                                outcome: Err(failure),
                                strict,
                            },
                        )
                    },
                );
            }
            Suspension::Load { module, pending } => {
                debug!(module = %module, "invocation suspended on module load");
                pending.then(
                    move |object| Self::resume(&on_success, Resumption::Loaded { module, object }),
                    move |failure| Self::resume(&on_failure, Resumption::LoadFailed(failure)),
                );
            }
        }
    }

    fn resume(interp: &Weak<RefCell<Interpreter>>, resumption: Resumption) {
        let Some(interp) = interp.upgrade() else {
            warn!("host settled a result after its interpreter was dropped");
            return;
        };
        let step = {
            let Ok(mut state) = interp.try_borrow_mut() else {
                error!("host settled a result while the interpreter was running");
                return;
            };
            state.resume(resumption)
        };
        Self::settle(&interp, step);
    }
}

fn log_failure(failure: &VmError) {
    if failure.is_internal() {
        error!(error = %failure.report(), "invocation failed");
    } else {
        warn!(error = %failure.report(), "invocation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, Constant, Instruction, ModuleObject, OpCode};
    use crate::loader::MemoryLoader;
    use crate::value::AsyncState;
    use crate::vm::callable::DirectiveDescriptor;
    use pretty_assertions::assert_eq;

    fn await_module(strict: bool) -> ModuleObject {
        let mut module = ModuleObject::new("waiter");
        let pending = module.add_const(Constant::String("pending".into()));
        module.add_code(CodeObject::new(
            "main",
            &[],
            vec![Instruction::bare(OpCode::LoadNull), Instruction::bare(OpCode::Return)],
        ));
        module.add_code(CodeObject::new(
            "wait",
            &[],
            vec![
                Instruction::new(OpCode::LoadGlobal, pending),
                Instruction::new(OpCode::Await, if strict { 0 } else { 1 }),
                Instruction::bare(OpCode::Return),
            ],
        ));
        module.finish().unwrap()
    }

    fn wait_callable(module: ModuleObject) -> Rc<Callable> {
        let module = Rc::new(module);
        let code = crate::bytecode::CodeRef::new(module, 1).unwrap();
        Rc::new(Callable::from_code(code, IndexMap::new()))
    }

    fn runtime_with(pending: &AsyncResult<Value>) -> Runtime {
        let mut globals = IndexMap::new();
        globals.insert("pending".to_string(), Value::AsyncResult(pending.clone()));
        Runtime::new(
            InterpreterConfig::default(),
            Rc::new(builtins::registry()),
            Rc::new(MemoryLoader::new()),
            globals,
        )
    }

    #[test]
    fn test_exec_native_resolves_synchronously() {
        let runtime = Runtime::with_loader(Rc::new(MemoryLoader::new()));
        let length = runtime.with_interpreter(|i| i.directive("length")).unwrap().unwrap();
        let result = runtime.exec_callable(&length, vec![Value::from("four")], None);
        assert_eq!(result.state(), AsyncState::Success);
        assert_eq!(result.outcome().unwrap().unwrap(), Value::Int(4));
    }

    #[test]
    fn test_await_suspends_and_resumes() {
        let pending = AsyncResult::new();
        let runtime = runtime_with(&pending);
        let result = runtime.exec_callable(&wait_callable(await_module(false)), Vec::new(), None);
        assert!(!result.is_settled());
        assert!(runtime.is_suspended());

        pending.resolve(Value::Int(9));
        assert!(!runtime.is_suspended());
        let record = result.outcome().unwrap().unwrap();
        let record = record.as_dict().unwrap();
        assert_eq!(record.borrow()["isError"], Value::Bool(false));
        assert_eq!(record.borrow()["data"], Value::Int(9));
    }

    #[test]
    fn test_settle_mode_keeps_error_record() {
        let pending = AsyncResult::new();
        let runtime = runtime_with(&pending);
        let result = runtime.exec_callable(&wait_callable(await_module(false)), Vec::new(), None);
        pending.reject(VmError::host("timeout"));
        let record = result.outcome().unwrap().unwrap();
        assert_eq!(record.as_dict().unwrap().borrow()["isError"], Value::Bool(true));
    }

    #[test]
    fn test_busy_while_suspended() {
        let pending = AsyncResult::new();
        let runtime = runtime_with(&pending);
        let _first = runtime.exec_callable(&wait_callable(await_module(true)), Vec::new(), None);
        let second = runtime.exec_callable(&wait_callable(await_module(true)), Vec::new(), None);
        match second.outcome() {
            Some(Err(failure)) => assert!(failure.is_internal()),
            other => panic!("expected busy rejection, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[test]
    fn test_interpreter_is_closed_while_suspended() {
        let pending = AsyncResult::new();
        let runtime = runtime_with(&pending);
        let result = runtime.exec_callable(&wait_callable(await_module(false)), Vec::new(), None);

        let settle = pending.clone();
        let resolver = Rc::new(Callable::from_descriptor(&DirectiveDescriptor::new(
            "resolver",
            &[],
            move |interp: &mut Interpreter| {
                settle.resolve(Value::Int(1));
                interp.push(Value::Null);
                Ok(())
            },
        )));
        let attempt = runtime.with_interpreter(|i| i.call_sync(&resolver, Vec::new(), None));
        assert!(matches!(attempt, Err(RuntimeError::Internal(_))));
        assert_eq!(pending.state(), AsyncState::Pending);
        assert!(runtime.is_suspended());

        pending.resolve(Value::Int(1));
        assert!(!runtime.is_suspended());
        let record = result.outcome().unwrap().unwrap();
        assert_eq!(record.as_dict().unwrap().borrow()["data"], Value::Int(1));
        assert!(runtime.with_interpreter(|i| i.frame_depth()).is_ok());
    }

    #[test]
    fn test_reentrant_exec_from_directive_is_rejected() {
        let runtime = Runtime::with_loader(Rc::new(MemoryLoader::new()));
        let handle = runtime.clone();
        let nested = Rc::new(Callable::from_descriptor(&DirectiveDescriptor::new(
            "nested",
            &[],
            move |interp: &mut Interpreter| {
                let inner = handle.import_module("anything");
                interp.push(Value::Bool(matches!(inner.outcome(), Some(Err(_)))));
                Ok(())
            },
        )));
        let result = runtime.exec_callable(&nested, Vec::new(), None);
        assert_eq!(result.outcome().unwrap().unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_pending_module_load_resumes_import() {
        struct SlowLoader {
            pending: AsyncResult<Rc<ModuleObject>>,
        }
        impl ModuleLoader for SlowLoader {
            fn get(&self, _name: &str) -> Option<Rc<ModuleObject>> {
                None
            }
            fn load(&self, _name: &str) -> AsyncResult<Rc<ModuleObject>> {
                self.pending.clone()
            }
        }

        let pending = AsyncResult::new();
        let runtime = Runtime::with_loader(Rc::new(SlowLoader {
            pending: pending.clone(),
        }));
        let result = runtime.import_module("waiter");
        assert!(!result.is_settled());

        pending.resolve(Rc::new(await_module(true)));
        assert!(matches!(result.outcome(), Some(Ok(Value::Frame(_)))));
    }
}
