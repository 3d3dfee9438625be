//! The interpreter core: fetch-decode-execute loop.
//!
//! Every frame owns one block of the operand stack. A frame whose cursor runs
//! off its instructions (or a native frame, which has none) is finished the
//! same way: its block must hold exactly one value, which becomes the result
//! pushed onto the caller's block.

use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::bytecode::{CallSpec, CodeRef, Instruction, ModuleObject, OpCode};
use crate::config::InterpreterConfig;
use crate::error::{RuntimeError, TraceEntry, VmError};
use crate::loader::ModuleLoader;
use crate::value::{dict_from_pairs, AsyncResult, ClassNode, DataRange, DeclClass, Value};

use super::callable::{Callable, DirectiveFactory};
use super::frame::{ExecutionFrame, FrameRef};
use super::stack::OperandStack;

/// What the loop should do after an instruction.
pub(crate) enum Flow {
    /// Advance the dispatching frame's cursor.
    Next,
    /// The cursor was already moved.
    Jump,
    Suspend(Suspension),
}

/// A host operation the interpreter is waiting on.
pub enum Suspension {
    Await {
        pending: AsyncResult<Value>,
        strict: bool,
    },
    Load {
        module: String,
        pending: AsyncResult<Rc<ModuleObject>>,
    },
}

/// Outcome of running the loop.
pub enum Step {
    Done(Value),
    Suspended(Suspension),
}

/// How a suspended invocation continues.
pub(crate) enum Resumption {
    Settled {
        outcome: Result<Value, VmError>,
        strict: bool,
    },
    Loaded {
        module: String,
        object: Rc<ModuleObject>,
    },
    LoadFailed(VmError),
}

/// The public invocation currently in progress or suspended.
pub(crate) struct Invocation {
    pub(crate) base_depth: usize,
    pub(crate) result: AsyncResult<Value>,
}

/// Interpreter state: frame stack, operand stack, module frames and globals.
pub struct Interpreter {
    pub(crate) frames: Vec<FrameRef>,
    pub(crate) stack: OperandStack,
    /// Root frame of every imported module, by module name.
    pub(crate) module_frames: IndexMap<String, FrameRef>,
    global_frame: FrameRef,
    factory: Rc<dyn DirectiveFactory>,
    pub(crate) loader: Rc<dyn ModuleLoader>,
    pub(crate) config: InterpreterConfig,
    /// Depth of nested `call_sync` invocations; suspension is illegal when > 0.
    pub(crate) sync_calls: usize,
    /// Trace of the innermost failure, captured before unwinding.
    pub(crate) fault_trace: Option<Vec<TraceEntry>>,
    pub(crate) invocation: Option<Invocation>,
}

impl Interpreter {
    pub fn new(
        config: InterpreterConfig,
        factory: Rc<dyn DirectiveFactory>,
        loader: Rc<dyn ModuleLoader>,
        extra_globals: IndexMap<String, Value>,
    ) -> Self {
        let mut globals = IndexMap::new();
        for descriptor in factory.interps() {
            globals.insert(
                descriptor.name.clone(),
                Value::Callable(Rc::new(Callable::from_descriptor(&descriptor))),
            );
        }
        globals.extend(extra_globals);
        debug!(globals = globals.len(), "interpreter created");

        let owner = Rc::new(Callable::native(
            "<global>",
            &[],
            Rc::new(|interp: &mut Interpreter| {
                interp.push(Value::Undef);
                Ok(())
            }),
        ));

        Self {
            frames: Vec::with_capacity(64),
            stack: OperandStack::with_capacity(config.initial_stack_capacity),
            module_frames: IndexMap::new(),
            global_frame: ExecutionFrame::new_ref(owner, globals),
            factory,
            loader,
            config,
            sync_calls: 0,
            fault_trace: None,
            invocation: None,
        }
    }

    // --- Directive-facing API ---

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop()
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Result<FrameRef, RuntimeError> {
        self.frames
            .last()
            .cloned()
            .ok_or_else(|| RuntimeError::internal("no active frame"))
    }

    /// Read a variable (a declared attribute, for directives) of the current frame.
    pub fn arg(&self, name: &str) -> Result<Value, RuntimeError> {
        self.current_frame()?.borrow().get_value(name)
    }

    pub fn global_frame(&self) -> &FrameRef {
        &self.global_frame
    }

    pub fn module_frame(&self, name: &str) -> Option<FrameRef> {
        self.module_frames.get(name).cloned()
    }

    /// The nearest scope-owning frame, walking down from the top of the frame stack.
    pub fn enclosing_scope(&self) -> Result<FrameRef, RuntimeError> {
        self.frames
            .iter()
            .rev()
            .find(|frame| frame.borrow().owns_scope())
            .cloned()
            .ok_or_else(|| RuntimeError::internal("no scope-owning frame on the stack"))
    }

    /// A native directive from the factory chain.
    pub fn directive(&self, name: &str) -> Result<Rc<Callable>, RuntimeError> {
        let descriptor = self.factory.lookup(name)?;
        Ok(Rc::new(Callable::from_descriptor(&descriptor)))
    }

    /// Whether a public invocation is waiting on a host result.
    pub fn is_suspended(&self) -> bool {
        self.invocation.is_some()
    }

    // --- Main loop ---

    /// Run until the frame stack drops back to `base_depth` or the loop suspends.
    ///
    /// On failure the trace is captured and frames above `base_depth` are unwound.
    pub(crate) fn run_until(&mut self, base_depth: usize) -> Result<Step, RuntimeError> {
        match self.run_loop(base_depth) {
            Err(e) => Err(self.fault(e, base_depth)),
            ok => ok,
        }
    }

    fn run_loop(&mut self, base_depth: usize) -> Result<Step, RuntimeError> {
        loop {
            if self.frames.len() <= base_depth {
                return Err(RuntimeError::internal("frame stack fell below the invocation base"));
            }
            let frame = self.current_frame()?;
            let next = frame.borrow().current_instruction();

            let Some(ins) = next else {
                let result = self.finish_frame()?;
                if self.frames.len() > base_depth {
                    self.stack.push(result);
                    continue;
                }
                return Ok(Step::Done(result));
            };

            trace!(
                callable = %frame.borrow().callable().name(),
                at = frame.borrow().cursor(),
                op = ?ins.op,
                arg = ins.arg,
                "dispatch"
            );

            match self.dispatch(&frame, ins)? {
                Flow::Next => frame.borrow_mut().advance(),
                Flow::Jump => {}
                Flow::Suspend(suspension) => {
                    frame.borrow_mut().advance();
                    return Ok(Step::Suspended(suspension));
                }
            }
        }
    }

    /// Pop the finished top frame and return its result.
    fn finish_frame(&mut self) -> Result<Value, RuntimeError> {
        let len = self.stack.length();
        if len != 1 {
            let name = self.current_frame()?.borrow().callable().name().to_string();
            return Err(RuntimeError::internal(format!(
                "'{}' finished with {} values in its block, expected 1",
                name, len
            )));
        }
        let result = self.stack.pop()?;
        self.stack.close_block()?;
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| RuntimeError::internal("finish with an empty frame stack"))?;

        let module_entry = frame.borrow().callable().is_module_entry();
        debug!(
            callable = %frame.borrow().callable().name(),
            depth = self.frames.len(),
            "frame finished"
        );
        if module_entry {
            Ok(Value::Frame(frame))
        } else {
            Ok(result)
        }
    }

    // --- Failure handling ---

    /// Frames top-first, cut at the configured trace limit.
    pub(crate) fn capture_trace(&self) -> Vec<TraceEntry> {
        self.frames
            .iter()
            .rev()
            .take(self.config.trace_limit)
            .map(|frame| {
                let frame = frame.borrow();
                let callable = frame.callable();
                let module = if callable.module_name().is_empty() {
                    "<native>".to_string()
                } else {
                    callable.module_name().to_string()
                };
                TraceEntry {
                    callable: callable.name().to_string(),
                    module,
                    instruction: frame.cursor(),
                    opcode: frame.current_instruction().map(|ins| ins.op),
                }
            })
            .collect()
    }

    /// Record the trace (unless a deeper failure already did) and unwind to `base_depth`.
    pub(crate) fn fault(&mut self, error: RuntimeError, base_depth: usize) -> RuntimeError {
        if self.fault_trace.is_none() {
            self.fault_trace = Some(self.capture_trace());
        }
        self.unwind_to(base_depth);
        error
    }

    /// Forget a recorded failure trace, for directives that recover from a failed `call_sync`.
    pub fn discard_fault(&mut self) {
        self.fault_trace = None;
    }

    pub(crate) fn unwind_to(&mut self, base_depth: usize) {
        while self.frames.len() > base_depth {
            let Some(frame) = self.frames.pop() else { break };
            let callable = frame.borrow().callable().clone();
            // A module whose entry code failed must run again on the next import.
            if callable.is_module_entry() {
                let name = callable.module_name();
                let registered = self
                    .module_frames
                    .get(name)
                    .is_some_and(|registered| Rc::ptr_eq(registered, &frame));
                if registered {
                    self.module_frames.shift_remove(name);
                }
            }
            if self.stack.close_block().is_err() {
                break;
            }
        }
    }

    // --- Dispatch ---

    fn code_of(frame: &FrameRef) -> Result<CodeRef, RuntimeError> {
        frame
            .borrow()
            .callable()
            .code()
            .cloned()
            .ok_or_else(|| RuntimeError::internal("instruction dispatched in a native frame"))
    }

    fn operand_index(ins: Instruction) -> Result<usize, RuntimeError> {
        ins.index().ok_or_else(|| {
            RuntimeError::internal(format!("negative operand {} for {:?}", ins.arg, ins.op))
        })
    }

    fn name_operand(frame: &FrameRef, ins: Instruction) -> Result<String, RuntimeError> {
        let code = Self::code_of(frame)?;
        let index = Self::operand_index(ins)?;
        Ok(code.module().name_const(index)?.to_string())
    }

    fn jump(frame: &FrameRef, ins: Instruction) -> Result<Flow, RuntimeError> {
        frame.borrow_mut().set_jump(Self::operand_index(ins)?)?;
        Ok(Flow::Jump)
    }

    fn binary(&mut self) -> Result<(Value, Value), RuntimeError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        Ok((a, b))
    }

    fn dispatch(&mut self, frame: &FrameRef, ins: Instruction) -> Result<Flow, RuntimeError> {
        match ins.op {
            OpCode::Nop => {}

            // ============ Constants & Stack ============
            OpCode::LoadConst => {
                let code = Self::code_of(frame)?;
                let value = code.module().load_const(Self::operand_index(ins)?)?;
                self.stack.push(value);
            }
            OpCode::LoadUndef => self.stack.push(Value::Undef),
            OpCode::LoadNull => self.stack.push(Value::Null),
            OpCode::LoadTrue => self.stack.push(Value::Bool(true)),
            OpCode::LoadFalse => self.stack.push(Value::Bool(false)),
            OpCode::Pop => {
                self.stack.pop()?;
            }
            OpCode::Dup => {
                let top = self.stack.peek_back(0)?.clone();
                self.stack.push(top);
            }
            OpCode::Swap => {
                let (a, b) = self.binary()?;
                self.stack.push(b);
                self.stack.push(a);
            }

            // ============ Variables ============
            OpCode::LoadName => {
                let name = Self::name_operand(frame, ins)?;
                let value = frame.borrow().get_value(&name)?;
                self.stack.push(value);
            }
            OpCode::LoadGlobal => {
                let name = Self::name_operand(frame, ins)?;
                let value = self.lookup_global(frame, &name)?;
                self.stack.push(value);
            }
            OpCode::StoreName => {
                let name = Self::name_operand(frame, ins)?;
                let value = self.stack.pop()?;
                frame.borrow_mut().set_value(name, value);
            }
            OpCode::StoreGlobal => {
                let name = Self::name_operand(frame, ins)?;
                let value = self.stack.pop()?;
                let module = frame.borrow().callable().module_name().to_string();
                let target = self.module_frames.get(&module).cloned().ok_or_else(|| {
                    RuntimeError::internal(format!("module '{}' has no root frame", module))
                })?;
                target.borrow_mut().set_value(name, value);
            }

            // ============ Arithmetic ============
            OpCode::Add => {
                let (a, b) = self.binary()?;
                let result = self.op_add(a, b)?;
                self.stack.push(result);
            }
            OpCode::Sub => {
                let (a, b) = self.binary()?;
                let result = self.op_subtract(a, b)?;
                self.stack.push(result);
            }
            OpCode::Mul => {
                let (a, b) = self.binary()?;
                let result = self.op_multiply(a, b)?;
                self.stack.push(result);
            }
            OpCode::Div => {
                let (a, b) = self.binary()?;
                let result = self.op_divide(a, b)?;
                self.stack.push(result);
            }
            OpCode::Mod => {
                let (a, b) = self.binary()?;
                let result = self.op_modulo(a, b)?;
                self.stack.push(result);
            }
            OpCode::Neg => {
                let a = self.stack.pop()?;
                let result = self.op_negate(a)?;
                self.stack.push(result);
            }

            // ============ Comparison & Logic ============
            OpCode::Eq => {
                let (a, b) = self.binary()?;
                self.stack.push(Value::Bool(a.equals(&b)?));
            }
            OpCode::Ne => {
                let (a, b) = self.binary()?;
                self.stack.push(Value::Bool(!a.equals(&b)?));
            }
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                use std::cmp::Ordering::*;
                let (a, b) = self.binary()?;
                let ordering = self.op_compare(&a, &b)?;
                let result = match ins.op {
                    OpCode::Lt => matches!(ordering, Some(Less)),
                    OpCode::Le => matches!(ordering, Some(Less | Equal)),
                    OpCode::Gt => matches!(ordering, Some(Greater)),
                    _ => matches!(ordering, Some(Greater | Equal)),
                };
                self.stack.push(Value::Bool(result));
            }
            OpCode::Not => {
                let a = self.stack.pop()?;
                self.stack.push(Value::Bool(!a.truthy()?));
            }
            OpCode::Contains => {
                let (item, container) = self.binary()?;
                let found = self.op_contains(&item, &container)?;
                self.stack.push(Value::Bool(found));
            }

            // ============ Construction ============
            OpCode::Concat => {
                let parts = self.stack.pop_n(Self::operand_index(ins)?)?;
                let text: String = parts.iter().map(|part| part.to_string()).collect();
                self.stack.push(Value::String(text));
            }
            OpCode::MakeArray => {
                let items = self.stack.pop_n(Self::operand_index(ins)?)?;
                self.stack.push(Value::array(items));
            }
            OpCode::MakeDict => {
                let count = Self::operand_index(ins)?;
                let flat = self.stack.pop_n(count * 2)?;
                let mut map = IndexMap::with_capacity(count);
                let mut pairs = flat.into_iter();
                while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
                    map.insert(Self::dict_key(&key)?, value);
                }
                self.stack.push(Value::dict(map));
            }
            OpCode::MakeFunction => {
                let code = match self.stack.pop()? {
                    Value::CodeObject(code) => code,
                    other => return Err(RuntimeError::type_mismatch("code", other.type_name())),
                };
                let defaults = if ins.arg & 1 == 1 {
                    self.stack.pop()?.as_dict()?.borrow().clone()
                } else {
                    IndexMap::new()
                };
                self.stack
                    .push(Value::Callable(Rc::new(Callable::from_code(code, defaults))));
            }
            OpCode::MakeClass => {
                let name = self.stack.pop()?.as_str()?.to_string();
                let attrs = self.stack.pop()?.as_dict()?.borrow().clone();
                let base = if ins.arg & 1 == 1 {
                    match self.stack.pop()? {
                        Value::Undef | Value::Null => None,
                        Value::ClassNode(node) => Some(DeclClass::downcast(&node).ok_or_else(|| {
                            RuntimeError::type_mismatch("class", node.class_name())
                        })?),
                        other => return Err(RuntimeError::type_mismatch("class", other.type_name())),
                    }
                } else {
                    None
                };
                debug!(class = %name, "class declared");
                let class: Rc<dyn ClassNode> = DeclClass::new(name, attrs, base)?;
                self.stack.push(Value::ClassNode(class));
            }

            // ============ Access ============
            OpCode::GetItem => {
                let (target, key) = self.binary()?;
                let value = self.op_get_item(&target, &key)?;
                self.stack.push(value);
            }
            OpCode::SetItem => {
                let value = self.stack.pop()?;
                let (target, key) = self.binary()?;
                self.op_set_item(&target, &key, value)?;
            }
            OpCode::GetAttr => {
                let name = Self::name_operand(frame, ins)?;
                let target = self.stack.pop()?;
                let value = self.op_get_attr(&target, &name)?;
                self.stack.push(value);
            }
            OpCode::SetAttr => {
                let name = Self::name_operand(frame, ins)?;
                let (target, value) = self.binary()?;
                self.op_set_attr(&target, &name, value)?;
            }
            OpCode::Slice => {
                let end = self.stack.pop()?;
                let (target, start) = self.binary()?;
                let value = self.op_slice(&target, &start, &end)?;
                self.stack.push(value);
            }

            // ============ Control Flow ============
            OpCode::Jump => return Self::jump(frame, ins),
            OpCode::JumpIfFalse => {
                if !self.stack.pop()?.truthy()? {
                    return Self::jump(frame, ins);
                }
            }
            OpCode::JumpIfTrue => {
                if self.stack.pop()?.truthy()? {
                    return Self::jump(frame, ins);
                }
            }
            OpCode::JumpIfFalseOrPop => {
                if !self.stack.peek_back(0)?.truthy()? {
                    return Self::jump(frame, ins);
                }
                self.stack.pop()?;
            }
            OpCode::JumpIfTrueOrPop => {
                if self.stack.peek_back(0)?.truthy()? {
                    return Self::jump(frame, ins);
                }
                self.stack.pop()?;
            }

            // ============ Iteration ============
            OpCode::GetIter => {
                let iterable = self.stack.pop()?;
                self.stack.push(Value::Range(DataRange::over(&iterable)?));
            }
            OpCode::ForIter => {
                let range = self.stack.peek_back(0)?.as_range()?;
                match range.next_value() {
                    Some(item) => self.stack.push(item),
                    None => {
                        self.stack.pop()?;
                        return Self::jump(frame, ins);
                    }
                }
            }

            // ============ Calls ============
            OpCode::Call => self.call(CallSpec::from_operand(ins.arg))?,
            OpCode::Return => {
                let result = self.stack.pop()?;
                self.stack.clear_block();
                self.stack.push(result);
                frame.borrow_mut().finish();
                return Ok(Flow::Jump);
            }
            OpCode::Import => {
                let name = Self::name_operand(frame, ins)?;
                if let Some(pending) = self.import(&name)? {
                    return Ok(Flow::Suspend(Suspension::Load {
                        module: name,
                        pending,
                    }));
                }
            }
            OpCode::Await => {
                let strict = ins.arg == 0;
                let pending = self.stack.pop()?.as_async_result()?;
                match pending.outcome() {
                    Some(outcome) => self.settle_await(outcome, strict)?,
                    None if self.sync_calls > 0 => {
                        return Err(RuntimeError::internal(
                            "cannot await an unsettled result inside a synchronous call",
                        ))
                    }
                    None => {
                        debug!(strict, "suspending on await");
                        return Ok(Flow::Suspend(Suspension::Await { pending, strict }));
                    }
                }
            }
        }
        Ok(Flow::Next)
    }

    fn dict_key(key: &Value) -> Result<String, RuntimeError> {
        match key {
            Value::String(s) => Ok(s.clone()),
            Value::Int(n) => Ok(n.to_string()),
            other => Err(RuntimeError::type_mismatch("string key", other.type_name())),
        }
    }

    /// Free-variable read: current frame, the declaring module's root frame,
    /// the global frame, then the directive factory.
    pub(crate) fn lookup_global(&self, frame: &FrameRef, name: &str) -> Result<Value, RuntimeError> {
        let module = {
            let frame = frame.borrow();
            if let Some(value) = frame.get_local(name) {
                return Ok(value);
            }
            frame.callable().module_name().to_string()
        };
        if let Some(root) = self.module_frames.get(&module) {
            if let Some(value) = root.borrow().get_local(name) {
                return Ok(value);
            }
        }
        if let Some(value) = self.global_frame.borrow().get_local(name) {
            return Ok(value);
        }
        match self.factory.get(name) {
            Some(descriptor) => Ok(Value::Callable(Rc::new(Callable::from_descriptor(&descriptor)))),
            None => Err(RuntimeError::name_not_found(name)),
        }
    }

    /// Push the settlement record of an awaited result.
    pub(crate) fn settle_await(
        &mut self,
        outcome: Result<Value, VmError>,
        strict: bool,
    ) -> Result<(), RuntimeError> {
        match outcome {
            Ok(data) => {
                self.stack.push(settlement_record(false, data));
                Ok(())
            }
            Err(error) => {
                self.stack
                    .push(settlement_record(true, Value::String(error.to_string())));
                if strict {
                    return Err(RuntimeError::HostRejection(Box::new(error)));
                }
                Ok(())
            }
        }
    }
}

/// `{isError, data}` record pushed when an awaited result settles.
pub fn settlement_record(is_error: bool, data: Value) -> Value {
    dict_from_pairs([("isError", Value::Bool(is_error)), ("data", data)])
}
