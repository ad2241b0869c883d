// Lunar Processor
// Stack-based dispatch loop; one processor per thread of execution

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use super::arith::{self, ArithOp};
use super::caller::ValueCaller;
use super::coroutine::Coroutine;
use super::function::{CallHandler, Closure, NativeFunction, TailCall, UpvalueCell};
use super::runtime::Runtime;
use super::table::TableRef;
use super::value::{Number, Value};
use crate::compiler::{Instruction, OpCode};
use crate::debugger::{WatchItem, WatchSnapshot};
use crate::error::{LuaError, LuaResult, SourceRef, StackFrame};
use crate::scope::{SymbolKind, SymbolRef};

/// Longest `__index` / `__newindex` chain followed before giving up
const MAX_TAG_LOOP: usize = 100;

/// Frames recorded in an error's stack trace
const MAX_TRACE_FRAMES: usize = 20;

/// How a run of the dispatch loop ended
#[derive(Debug)]
pub(crate) enum Exec {
    Returned(Value),
    Yielded(Value),
}

/// Outcome of a call made from the dispatch loop
enum Flow {
    Continue,
    Yield(Value),
}

/// A local variable slot; captured variables live in shared cells
#[derive(Clone)]
enum LocalSlot {
    Value(Value),
    Cell(UpvalueCell),
}

impl LocalSlot {
    fn new(value: Value, captured: bool) -> Self {
        if captured {
            LocalSlot::Cell(Rc::new(RefCell::new(value)))
        } else {
            LocalSlot::Value(value)
        }
    }

    fn get(&self) -> Value {
        match self {
            LocalSlot::Value(v) => v.clone(),
            LocalSlot::Cell(c) => c.borrow().clone(),
        }
    }

    fn set(&mut self, value: Value) {
        match self {
            LocalSlot::Value(v) => *v = value,
            LocalSlot::Cell(c) => *c.borrow_mut() = value,
        }
    }
}

/// Call frame for a script function
struct CallFrame {
    closure: Rc<Closure>,
    return_ip: usize,
    /// Operand stack height when the frame was entered
    base: usize,
    locals: Vec<LocalSlot>,
    layout: Option<Rc<[SymbolRef]>>,
    /// Pending to-be-closed values, one list per open block
    blocks: Vec<SmallVec<[Value; 2]>>,
    /// Returning from this frame ends the current run
    stop: bool,
    handler: CallHandler,
    /// Protected calls open in this frame and below it
    protected_depth: usize,
}

impl CallFrame {
    fn slot_name(&self, slot: usize) -> String {
        self.layout
            .as_ref()
            .and_then(|l| l.get(slot))
            .map(|s| s.name.to_string())
            .unwrap_or_else(|| "?".to_string())
    }
}

/// The Lunar virtual machine for one thread of execution
pub struct Processor {
    runtime: Rc<Runtime>,
    code: Rc<Vec<Instruction>>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    ip: usize,
    coroutine: Option<Weak<Coroutine>>,
    /// Nested runs started on this processor by natives, metamethods and host calls;
    /// the script-wide limit is kept by the runtime
    native_depth: usize,
}

impl Processor {
    pub fn new(runtime: Rc<Runtime>, coroutine: Option<Weak<Coroutine>>) -> Self {
        let code = runtime.code();
        Self {
            runtime,
            code,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            ip: 0,
            coroutine,
            native_depth: 0,
        }
    }

    // ==================== Entry points ====================

    /// Calls any callable value and waits for its results
    pub fn call_function(&mut self, function: &Value, args: Vec<Value>) -> LuaResult<Value> {
        let _native = self.runtime.enter_native()?;
        self.native_depth += 1;
        let result = self.call_nested(function, args);
        self.native_depth -= 1;
        result
    }

    /// First resume of a coroutine
    pub(crate) fn start(&mut self, function: &Value, args: Vec<Value>) -> LuaResult<Exec> {
        match function {
            Value::Function(closure) => {
                self.enter_closure(Rc::clone(closure), args, false, CallHandler::None)?;
                self.mark_stop();
                self.run()
            }
            Value::ClrFunction(native) => match native.invoke(self, args)? {
                Value::YieldRequest(values) => Ok(Exec::Yielded(Value::from_values(values.to_vec()))),
                other => Ok(Exec::Returned(self.resolve_request(other)?)),
            },
            other => Ok(Exec::Returned(self.call_function(other, args)?)),
        }
    }

    /// Continues a suspended coroutine; `args` become the results of its yield
    pub(crate) fn resume(&mut self, args: Vec<Value>) -> LuaResult<Exec> {
        if self.frames.is_empty() {
            return Ok(Exec::Returned(Value::from_values(args)));
        }
        self.push(Value::from_values(args))?;
        self.run_from(0)
    }

    /// Unwinds every frame, running pending `__close` handlers
    pub(crate) fn close_all(&mut self) -> LuaResult<()> {
        let mut failure = None;
        while let Some(frame) = self.frames.last() {
            if frame.blocks.is_empty() {
                self.frames.pop();
                continue;
            }
            let error = failure.as_ref().map(LuaError::to_script_value);
            if let Err(err) = self.leave_block(error) {
                failure = Some(err);
            }
        }
        self.stack.clear();
        failure.map_or(Ok(()), Err)
    }

    fn call_nested(&mut self, function: &Value, args: Vec<Value>) -> LuaResult<Value> {
        match function {
            Value::Function(closure) => {
                let saved_ip = self.ip;
                self.enter_closure(Rc::clone(closure), args, false, CallHandler::None)?;
                self.mark_stop();
                let outcome = self.run();
                self.ip = saved_ip;
                match outcome? {
                    Exec::Returned(value) => Ok(value),
                    Exec::Yielded(_) => Err(LuaError::cannot_yield()),
                }
            }
            Value::ClrFunction(native) => {
                let result = native.invoke(self, args)?;
                self.resolve_request(result)
            }
            other => {
                let mut args = args;
                let handler = self.resolve_call_handler(other.clone(), &mut args, None)?;
                self.call_nested(&handler, args)
            }
        }
    }

    /// Performs a request a native returned outside the dispatch loop
    fn resolve_request(&mut self, result: Value) -> LuaResult<Value> {
        match result {
            Value::TailCallRequest(request) => {
                let outcome = self.call_nested(&request.function, request.args.clone());
                match &request.handler {
                    CallHandler::None => outcome,
                    handler => self.protected_outcome(outcome, handler),
                }
            }
            Value::YieldRequest(_) => Err(self.yield_error()),
            other => Ok(other),
        }
    }

    fn yield_error(&self) -> LuaError {
        if self.coroutine.is_none() {
            LuaError::cannot_yield_main()
        } else {
            LuaError::cannot_yield()
        }
    }

    fn mark_stop(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.stop = true;
        }
    }

    // ==================== Run loop and error recovery ====================

    fn run(&mut self) -> LuaResult<Exec> {
        let floor = self.frames.len().saturating_sub(1);
        self.run_from(floor)
    }

    /// Dispatches until the frame at `floor` returns, recovering protected errors
    fn run_from(&mut self, floor: usize) -> LuaResult<Exec> {
        loop {
            match self.execute() {
                Ok(exec) => return Ok(exec),
                Err(err) => self.recover(err, floor)?,
            }
        }
    }

    fn recover(&mut self, mut err: LuaError, floor: usize) -> LuaResult<()> {
        if let Some(frame) = self.frames.last() {
            let chunk = Rc::clone(&frame.closure.chunk);
            err.decorate(&chunk, self.current_source_ref());
        }

        let protected = if err.is_recoverable() {
            (floor..self.frames.len())
                .rev()
                .find(|&i| !matches!(self.frames[i].handler, CallHandler::None))
        } else {
            None
        };

        let Some(target) = protected else {
            while self.frames.len() > floor {
                if err.stack_trace.len() < MAX_TRACE_FRAMES {
                    let frame = self.stack_frame(self.frames.len() - 1);
                    err.push_frame(frame);
                }
                let (next, _) = self.unwind_frame(err);
                err = next;
            }
            return Err(err);
        };

        while self.frames.len() > target + 1 {
            let (next, _) = self.unwind_frame(err);
            err = next;
        }
        let (err, frame) = self.unwind_frame(err);
        let frame = frame.ok_or_else(|| LuaError::internal("protected frame vanished"))?;
        log::trace!("protected call caught: {}", err.decorated_message);

        let value = self.error_value(err, &frame.handler)?;
        self.ip = frame.return_ip;
        self.push(Value::from_values(vec![Value::Boolean(false), value]))
    }

    /// Pops the top frame, closing its pending variables with the error
    fn unwind_frame(&mut self, mut err: LuaError) -> (LuaError, Option<CallFrame>) {
        while self.frames.last().is_some_and(|f| !f.blocks.is_empty()) {
            if let Err(close_err) = self.leave_block(Some(err.to_script_value())) {
                err = close_err;
            }
        }
        let frame = self.frames.pop();
        if let Some(frame) = &frame {
            self.stack.truncate(frame.base);
        }
        (err, frame)
    }

    /// The value a protected call reports for `err`
    fn error_value(&mut self, err: LuaError, handler: &CallHandler) -> LuaResult<Value> {
        let value = err.to_script_value();
        match handler {
            CallHandler::ProtectedWith(message_handler) => {
                match self.call_function(message_handler, vec![value]) {
                    Ok(result) => Ok(result.into_scalar()),
                    Err(e) if e.is_recoverable() => Ok(e.to_script_value()),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(value),
        }
    }

    fn protected_outcome(&mut self, outcome: LuaResult<Value>, handler: &CallHandler) -> LuaResult<Value> {
        match outcome {
            Ok(value) => Ok(Value::from_values(vec![Value::Boolean(true), value])),
            Err(err) if err.is_recoverable() => {
                let value = self.error_value(err, handler)?;
                Ok(Value::from_values(vec![Value::Boolean(false), value]))
            }
            Err(err) => Err(err),
        }
    }

    // ==================== Dispatch ====================

    fn execute(&mut self) -> LuaResult<Exec> {
        loop {
            if self.ip >= self.code.len() {
                self.code = self.runtime.code();
            }
            let code = Rc::clone(&self.code);
            let instr = code.get(self.ip).ok_or_else(|| {
                LuaError::internal(format!("instruction pointer {} out of range", self.ip))
            })?;
            if let Some(source_ref) = instr.source_ref {
                if self.runtime.is_debugging() {
                    self.debugger_check(source_ref);
                }
            }
            self.ip += 1;

            match instr.opcode {
                OpCode::Nop => {}

                OpCode::Pop => {
                    let len = self.stack.len().saturating_sub(instr.num_val);
                    self.stack.truncate(len);
                }

                OpCode::Literal => self.push(instr.value.clone().unwrap_or_default())?,

                OpCode::Closure => {
                    let closure = self.make_closure(instr)?;
                    self.push(closure)?;
                }

                OpCode::NewTable => self.push(Value::new_table())?,

                OpCode::TblInitN => {
                    let value = self.pop()?.into_scalar();
                    let key = self.pop()?;
                    let table = self.peek_table()?;
                    table.borrow_mut().set(&key, value)?;
                }

                OpCode::TblInitI => {
                    let value = self.pop()?;
                    let table = self.peek_table()?;
                    let mut table = table.borrow_mut();
                    if instr.num_val2 == 1 {
                        for (i, v) in value.tuple_values().into_iter().enumerate() {
                            table.set_int((instr.num_val + i) as i64, v);
                        }
                    } else {
                        table.set_int(instr.num_val as i64, value.into_scalar());
                    }
                }

                OpCode::Local => {
                    let value = self.local(instr.num_val)?;
                    self.push(value)?;
                }

                OpCode::StoreLcl => {
                    let value = self.operand(instr)?;
                    let slot = symbol_of(instr)?.index;
                    self.set_local(slot, value)?;
                }

                OpCode::DefLcl => {
                    let value = self.operand(instr)?;
                    let symbol = symbol_of(instr)?;
                    let fresh = LocalSlot::new(value, symbol.captured);
                    let frame = self.frame_mut()?;
                    match frame.locals.get_mut(symbol.index) {
                        Some(slot) => *slot = fresh,
                        None => return Err(LuaError::internal("local slot out of range")),
                    }
                }

                OpCode::Upvalue => {
                    let cell = self.upvalue(instr.num_val)?;
                    let value = cell.borrow().clone();
                    self.push(value)?;
                }

                OpCode::StoreUpv => {
                    let value = self.operand(instr)?;
                    let cell = self.upvalue(symbol_of(instr)?.index)?;
                    *cell.borrow_mut() = value;
                }

                OpCode::GetGlobal => {
                    let key = instr.value.clone().unwrap_or_default();
                    let value = self.get_global(&key)?;
                    self.push(value)?;
                }

                OpCode::SetGlobal => {
                    let value = self.operand(instr)?;
                    let key = instr.value.clone().unwrap_or_default();
                    let globals = Value::Table(Rc::clone(self.runtime.globals()));
                    self.set_index(&globals, &key, value, None)?;
                }

                OpCode::Env => self.push(Value::Table(Rc::clone(self.runtime.globals())))?,

                OpCode::Index => {
                    let key = self.pop()?;
                    let object = self.pop()?;
                    let value = self.index_value(&object, &key, instr.name.as_deref())?;
                    self.push(value)?;
                }

                OpCode::IndexN => {
                    let key = instr.value.clone().unwrap_or_default();
                    let object = self.pop()?;
                    let value = self.index_value(&object, &key, instr.name.as_deref())?;
                    self.push(value)?;
                }

                OpCode::IndexSet => {
                    let value = self.operand(instr)?;
                    let key = self.pop()?;
                    let object = self.pop()?;
                    self.set_index(&object, &key, value, instr.name.as_deref())?;
                }

                OpCode::IndexSetN => {
                    let value = self.operand(instr)?;
                    let key = instr.value.clone().unwrap_or_default();
                    let object = self.pop()?;
                    self.set_index(&object, &key, value, instr.name.as_deref())?;
                }

                OpCode::Method => {
                    let key = instr.value.clone().unwrap_or_default();
                    let object = self.pop()?;
                    let function = self.index_value(&object, &key, None)?;
                    self.push(function)?;
                    self.push(object)?;
                }

                OpCode::BeginFn => {
                    return Err(LuaError::internal("function prologue reached by fallthrough"));
                }

                OpCode::Call => {
                    let args = self.take_args(instr.num_val)?;
                    let function = self.pop()?;
                    let tail = instr.num_val2 == 1;
                    if let Flow::Yield(values) =
                        self.call_value(function, args, tail, instr.name.as_deref())?
                    {
                        return Ok(Exec::Yielded(values));
                    }
                }

                OpCode::Ret => {
                    let result = if instr.num_val == 1 {
                        self.pop()?
                    } else {
                        Value::Void
                    };
                    if let Some(value) = self.return_from_frame(result)? {
                        return Ok(Exec::Returned(value));
                    }
                }

                OpCode::Jump => self.ip = instr.num_val,

                OpCode::Jf => {
                    if !self.pop()?.is_truthy() {
                        self.ip = instr.num_val;
                    }
                }

                OpCode::JtOrPop => {
                    if self.peek(0)?.is_truthy() {
                        self.ip = instr.num_val;
                    } else {
                        self.pop()?;
                    }
                }

                OpCode::JfOrPop => {
                    if self.peek(0)?.is_truthy() {
                        self.pop()?;
                    } else {
                        self.ip = instr.num_val;
                    }
                }

                OpCode::Concat => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = self.concat(a, b)?;
                    self.push(value)?;
                }

                OpCode::Eq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.equals(&a, &b)?;
                    self.push(Value::Boolean(equal != (instr.num_val == 1)))?;
                }

                OpCode::Less | OpCode::LessEq => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let (a, b) = if instr.num_val == 1 { (b, a) } else { (a, b) };
                    let result = if instr.opcode == OpCode::Less {
                        self.compare_less(&a, &b)?
                    } else {
                        self.compare_less_equal(&a, &b)?
                    };
                    self.push(Value::Boolean(result))?;
                }

                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Power
                | OpCode::FloorDiv
                | OpCode::BitAnd
                | OpCode::BitOr
                | OpCode::BitXor
                | OpCode::ShiftLeft
                | OpCode::ShiftRight => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let value = self.arith(binary_op(instr.opcode), a, b)?;
                    self.push(value)?;
                }

                OpCode::Neg | OpCode::BitNot => {
                    let a = self.pop()?;
                    let op = if instr.opcode == OpCode::Neg {
                        ArithOp::Unm
                    } else {
                        ArithOp::BitNot
                    };
                    let value = self.arith(op, a.clone(), a)?;
                    self.push(value)?;
                }

                OpCode::Not => {
                    let a = self.pop()?;
                    self.push(Value::Boolean(!a.is_truthy()))?;
                }

                OpCode::Len => {
                    let a = self.pop()?;
                    let value = self.length(&a)?;
                    self.push(value)?;
                }

                OpCode::MkTuple => {
                    let start = self.stack_start(instr.num_val)?;
                    let values: Vec<Value> = self.stack.drain(start..).collect();
                    self.push(Value::from_values(values))?;
                }

                OpCode::Scalar => {
                    let value = self.pop()?.into_scalar();
                    self.push(value)?;
                }

                OpCode::ToNum => {
                    let value = self.pop()?.into_scalar();
                    let number = match &value {
                        Value::Number(n) => Some(*n),
                        Value::String(_) if !self.runtime.profile().integer_subtype => {
                            value.to_number().map(|n| self.runtime.normalize(n))
                        }
                        _ => None,
                    };
                    let what = match instr.num_val {
                        0 => "initial value",
                        1 => "limit",
                        _ => "step",
                    };
                    let number = number.ok_or_else(|| LuaError::for_loop_value(what))?;
                    self.push(Value::Number(number))?;
                }

                OpCode::Enter => {
                    let frame = self.frame_mut()?;
                    frame.blocks.push(SmallVec::new());
                    let to = instr.num_val2.min(frame.locals.len());
                    for slot in instr.num_val..to {
                        frame.locals[slot] = LocalSlot::Value(Value::Nil);
                    }
                }

                OpCode::Leave => self.leave_block(None)?,

                OpCode::Exit => {
                    for _ in 0..instr.num_val {
                        self.leave_block(None)?;
                    }
                }

                OpCode::MarkClose => {
                    let value = self.local(instr.num_val)?;
                    if value.is_truthy() {
                        if self.runtime.metamethod(&value, "__close").is_none() {
                            let name = self.frame()?.slot_name(instr.num_val);
                            return Err(LuaError::close_metamethod_expected(&name));
                        }
                        if let Some(block) = self.frame_mut()?.blocks.last_mut() {
                            block.push(value);
                        }
                    }
                }

                OpCode::ForPrep => self.for_prepare(instr.num_val)?,

                OpCode::JFor => {
                    let base = instr.num_val2;
                    let counter = self.local_number(base)?;
                    let limit = self.local_number(base + 1)?;
                    let step = self.local_number(base + 2)?;
                    let inside = if step.as_f64() > 0.0 {
                        arith::less_equal(counter, limit)
                    } else {
                        arith::less_equal(limit, counter)
                    };
                    if !inside {
                        self.ip = instr.num_val;
                    }
                }

                OpCode::Incr => {
                    let base = instr.num_val;
                    let counter = self.local_number(base)?;
                    let step = self.local_number(base + 2)?;
                    let next = match (counter, step) {
                        (Number::Integer(c), Number::Integer(s)) => match c.checked_add(s) {
                            Some(v) => Number::Integer(v),
                            // past the end either way
                            None => Number::Float(if s > 0 { f64::INFINITY } else { f64::NEG_INFINITY }),
                        },
                        (c, s) => self.runtime.normalize(Number::Float(c.as_f64() + s.as_f64())),
                    };
                    self.set_local(base, Value::Number(next))?;
                }

                OpCode::IterPrep => self.iterator_prepare(instr.num_val)?,

                OpCode::IterUpd => {
                    let first = self.peek(0)?.tuple_get(0);
                    if first.is_nil() {
                        self.pop()?;
                        self.ip = instr.num_val;
                    } else {
                        self.set_local(instr.num_val2, first)?;
                    }
                }

                OpCode::Invalid => {
                    return Err(LuaError::internal(format!("invalid opcode at {}", self.ip - 1)));
                }
            }
        }
    }

    // ==================== Calls ====================

    fn call_value(
        &mut self,
        function: Value,
        args: Vec<Value>,
        tail: bool,
        described: Option<&str>,
    ) -> LuaResult<Flow> {
        match function {
            Value::Function(closure) => {
                self.enter_closure(closure, args, tail, CallHandler::None)?;
                Ok(Flow::Continue)
            }
            Value::ClrFunction(native) => self.call_native(&native, args),
            other => {
                let mut args = args;
                let handler = self.resolve_call_handler(other, &mut args, described)?;
                self.call_value(handler, args, tail, described)
            }
        }
    }

    /// Follows `__call` metamethods to a function, prepending each callee to the arguments
    fn resolve_call_handler(
        &self,
        callee: Value,
        args: &mut Vec<Value>,
        described: Option<&str>,
    ) -> LuaResult<Value> {
        let mut current = callee;
        for depth in 0..MAX_TAG_LOOP {
            if current.is_function() {
                return Ok(current);
            }
            match self.runtime.metamethod(&current, "__call") {
                Some(handler) if !handler.is_nil() => {
                    args.insert(0, current);
                    current = handler;
                }
                _ => {
                    let described = if depth == 0 { described } else { None };
                    return Err(LuaError::call_of(current.type_name(), described));
                }
            }
        }
        Err(LuaError::runtime("'__call' chain too long; possible loop"))
    }

    fn call_native(&mut self, native: &NativeFunction, args: Vec<Value>) -> LuaResult<Flow> {
        match native.invoke(self, args)? {
            Value::TailCallRequest(request) => self.perform_request(&request),
            Value::YieldRequest(values) => {
                if self.coroutine.is_none() || self.native_depth > 0 {
                    return Err(self.yield_error());
                }
                Ok(Flow::Yield(Value::from_values(values.to_vec())))
            }
            result => {
                self.push(result)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Carries out a call a native asked for, inside the dispatch loop when possible
    fn perform_request(&mut self, request: &TailCall) -> LuaResult<Flow> {
        match (&request.handler, &request.function) {
            (CallHandler::None, function) => {
                self.call_value(function.clone(), request.args.clone(), false, None)
            }
            (handler, Value::Function(closure)) => {
                self.enter_closure(Rc::clone(closure), request.args.clone(), false, handler.clone())?;
                Ok(Flow::Continue)
            }
            (handler, function) => {
                let outcome = self.call_function(function, request.args.clone());
                let result = self.protected_outcome(outcome, handler)?;
                self.push(result)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn enter_closure(
        &mut self,
        closure: Rc<Closure>,
        args: Vec<Value>,
        tail: bool,
        handler: CallHandler,
    ) -> LuaResult<()> {
        if closure.entry >= self.code.len() {
            self.code = self.runtime.code();
        }
        let entry = closure.entry;
        let code = Rc::clone(&self.code);
        let prologue = code
            .get(closure.entry)
            .filter(|i| i.opcode == OpCode::BeginFn)
            .ok_or_else(|| LuaError::internal("closure entry is not a function prologue"))?;

        let slot_count = prologue.num_val;
        let params = prologue.num_val2;
        let is_vararg = matches!(prologue.value, Some(Value::Boolean(true)));
        let layout = prologue.symbols.clone();
        let captured = |slot: usize| {
            layout
                .as_ref()
                .and_then(|l| l.get(slot))
                .is_some_and(|s| s.captured)
        };

        let mut locals = Vec::with_capacity(slot_count);
        let mut args = args.into_iter();
        for slot in 0..params {
            locals.push(LocalSlot::new(args.next().unwrap_or_default(), captured(slot)));
        }
        if is_vararg {
            let rest = Value::from_values(args.collect());
            locals.push(LocalSlot::new(rest, captured(params)));
        }
        locals.resize(slot_count.max(locals.len()), LocalSlot::Value(Value::Nil));

        if tail && !self.frames.is_empty() {
            while self.frames.last().is_some_and(|f| !f.blocks.is_empty()) {
                self.leave_block(None)?;
            }
            let frame = self.frame_mut()?;
            frame.closure = closure;
            frame.locals = locals;
            frame.layout = layout;
            let base = frame.base;
            self.stack.truncate(base);
        } else {
            let limits = self.runtime.limits();
            if self.frames.len() >= limits.max_call_depth {
                return Err(LuaError::stack_overflow());
            }
            // protected calls nest like native calls, even when reached through a tail call
            let outer = self.frames.last().map_or(0, |f| f.protected_depth);
            let protected_depth = match handler {
                CallHandler::None => outer,
                _ => {
                    if outer + self.runtime.native_depth() >= limits.max_native_depth {
                        return Err(LuaError::stack_overflow());
                    }
                    outer + 1
                }
            };
            self.frames.push(CallFrame {
                closure,
                return_ip: self.ip,
                base: self.stack.len(),
                locals,
                layout,
                blocks: Vec::new(),
                stop: false,
                handler,
                protected_depth,
            });
        }

        self.ip = entry + 1;
        Ok(())
    }

    /// Pops the top frame; Some(result) when the current run is over
    fn return_from_frame(&mut self, result: Value) -> LuaResult<Option<Value>> {
        while self.frames.last().is_some_and(|f| !f.blocks.is_empty()) {
            self.leave_block(None)?;
        }
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| LuaError::internal("return without a frame"))?;
        self.stack.truncate(frame.base);

        let result = match frame.handler {
            CallHandler::None => result,
            _ => Value::from_values(vec![Value::Boolean(true), result]),
        };
        if frame.stop {
            return Ok(Some(result));
        }
        self.ip = frame.return_ip;
        self.push(result)?;
        Ok(None)
    }

    fn take_args(&mut self, count: usize) -> LuaResult<Vec<Value>> {
        let start = self.stack_start(count)?;
        let mut args: Vec<Value> = self.stack.drain(start..).collect();
        match args.pop() {
            Some(Value::Tuple(items)) => args.extend(items.iter().cloned()),
            Some(Value::Void) | None => {}
            Some(last) => args.push(last),
        }
        Ok(args)
    }

    fn make_closure(&mut self, instr: &Instruction) -> LuaResult<Value> {
        let frame = self.frame_mut()?;
        let mut upvalues = Vec::new();
        for symbol in instr.symbols.iter().flat_map(|s| s.iter()) {
            let cell = match symbol.kind {
                SymbolKind::Local => {
                    let slot = frame
                        .locals
                        .get_mut(symbol.index)
                        .ok_or_else(|| LuaError::internal("captured slot out of range"))?;
                    match slot {
                        LocalSlot::Cell(cell) => Rc::clone(cell),
                        LocalSlot::Value(value) => {
                            let cell = Rc::new(RefCell::new(std::mem::take(value)));
                            *slot = LocalSlot::Cell(Rc::clone(&cell));
                            cell
                        }
                    }
                }
                SymbolKind::Upvalue => frame
                    .closure
                    .upvalues
                    .get(symbol.index)
                    .cloned()
                    .ok_or_else(|| LuaError::internal("captured upvalue out of range"))?,
                _ => return Err(LuaError::internal("closures capture locals and upvalues only")),
            };
            upvalues.push(cell);
        }
        let name = instr.name.clone().unwrap_or_else(|| Rc::from("anonymous"));
        let chunk = Rc::clone(&frame.closure.chunk);
        Ok(Value::Function(Rc::new(Closure::new(instr.num_val, upvalues, name, chunk))))
    }

    // ==================== Blocks and loops ====================

    /// Leaves the innermost block, closing its pending values in reverse order
    fn leave_block(&mut self, error: Option<Value>) -> LuaResult<()> {
        let pending = self.frame_mut()?.blocks.pop().unwrap_or_default();
        let mut failure = None;
        for value in pending.into_iter().rev() {
            let error = failure
                .as_ref()
                .map(LuaError::to_script_value)
                .or_else(|| error.clone())
                .unwrap_or_default();
            if let Some(handler) = self.runtime.metamethod(&value, "__close") {
                if let Err(err) = self.call_function(&handler, vec![value, error]) {
                    failure = Some(err);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn for_prepare(&mut self, base: usize) -> LuaResult<()> {
        let start = self.local_number(base)?;
        let limit = self.local_number(base + 1)?;
        let step = self.local_number(base + 2)?;
        if step.as_f64() == 0.0 {
            return Err(LuaError::for_step_zero());
        }
        let float_loop = !(start.is_integer() && step.is_integer());
        if float_loop && self.runtime.profile().integer_subtype {
            self.set_local(base, Value::float(start.as_f64()))?;
            self.set_local(base + 1, Value::float(limit.as_f64()))?;
            self.set_local(base + 2, Value::float(step.as_f64()))?;
        }
        Ok(())
    }

    fn iterator_prepare(&mut self, base: usize) -> LuaResult<()> {
        let explist = self.pop()?;
        let mut function = explist.tuple_get(0);
        let mut state = explist.tuple_get(1);
        let mut control = explist.tuple_get(2);

        if !function.is_function() {
            if let Some(handler) = self.runtime.metamethod(&function, "__iterator") {
                let triple = self.call_function(&handler, vec![function, state, control])?;
                function = triple.tuple_get(0);
                state = triple.tuple_get(1);
                control = triple.tuple_get(2);
            } else if matches!(function, Value::Table(_))
                && self.runtime.metamethod(&function, "__call").is_none()
            {
                state = function;
                function = Value::native("next", crate::builtins::basic::next);
                control = Value::Nil;
            }
        }

        self.set_local(base, function)?;
        self.set_local(base + 1, state)?;
        self.set_local(base + 2, control)
    }

    // ==================== Operators and metamethods ====================

    fn arith(&mut self, op: ArithOp, a: Value, b: Value) -> LuaResult<Value> {
        if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            let integers = self.runtime.profile().integer_subtype;
            return Ok(Value::Number(arith::arith(op, x, y, integers)?));
        }
        let handler = self
            .runtime
            .metamethod(&a, op.event())
            .or_else(|| self.runtime.metamethod(&b, op.event()));
        match handler {
            Some(handler) => Ok(self.call_function(&handler, vec![a, b])?.into_scalar()),
            None => {
                let culprit = if a.to_number().is_none() { &a } else { &b };
                Err(if op.is_bitwise() {
                    LuaError::bitwise_on(culprit.type_name())
                } else {
                    LuaError::arithmetic_on(culprit.type_name())
                })
            }
        }
    }

    fn concat(&mut self, a: Value, b: Value) -> LuaResult<Value> {
        if let (Some(mut x), Some(y)) = (a.to_lua_bytes(), b.to_lua_bytes()) {
            x.extend_from_slice(&y);
            return Ok(Value::from_bytes(x));
        }
        let handler = self
            .runtime
            .metamethod(&a, "__concat")
            .or_else(|| self.runtime.metamethod(&b, "__concat"));
        match handler {
            Some(handler) => Ok(self.call_function(&handler, vec![a, b])?.into_scalar()),
            None => {
                let culprit = if a.to_lua_bytes().is_none() { &a } else { &b };
                Err(LuaError::concat_on(culprit.type_name()))
            }
        }
    }

    fn equals(&mut self, a: &Value, b: &Value) -> LuaResult<bool> {
        if a.raw_equals(b) {
            return Ok(true);
        }
        match (a, b) {
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_)) => {
                let handler = self
                    .runtime
                    .metamethod(a, "__eq")
                    .or_else(|| self.runtime.metamethod(b, "__eq"));
                match handler {
                    Some(handler) => {
                        Ok(self.call_function(&handler, vec![a.clone(), b.clone()])?.is_truthy())
                    }
                    None => Ok(false),
                }
            }
            _ => Ok(false),
        }
    }

    fn compare_less(&mut self, a: &Value, b: &Value) -> LuaResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(arith::less_than(*x, *y)),
            (Value::String(x), Value::String(y)) => Ok(x < y),
            _ => match self.comparison_handler(a, b, "__lt") {
                Some(handler) => {
                    Ok(self.call_function(&handler, vec![a.clone(), b.clone()])?.is_truthy())
                }
                None => Err(LuaError::compare(a.type_name(), b.type_name())),
            },
        }
    }

    fn compare_less_equal(&mut self, a: &Value, b: &Value) -> LuaResult<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(arith::less_equal(*x, *y)),
            (Value::String(x), Value::String(y)) => Ok(x <= y),
            _ => {
                if let Some(handler) = self.comparison_handler(a, b, "__le") {
                    return Ok(self.call_function(&handler, vec![a.clone(), b.clone()])?.is_truthy());
                }
                // dialects before 5.4 fall back to `not (b < a)`
                if !self.runtime.profile().to_be_closed_variables {
                    if let Some(handler) = self.comparison_handler(a, b, "__lt") {
                        let lt = self.call_function(&handler, vec![b.clone(), a.clone()])?;
                        return Ok(!lt.is_truthy());
                    }
                }
                Err(LuaError::compare(a.type_name(), b.type_name()))
            }
        }
    }

    fn comparison_handler(&self, a: &Value, b: &Value, event: &str) -> Option<Value> {
        self.runtime
            .metamethod(a, event)
            .or_else(|| self.runtime.metamethod(b, event))
    }

    fn length(&mut self, value: &Value) -> LuaResult<Value> {
        if let Value::String(s) = value {
            return Ok(Value::integer(s.len() as i64));
        }
        if let Some(handler) = self.runtime.metamethod(value, "__len") {
            return Ok(self.call_function(&handler, vec![value.clone()])?.into_scalar());
        }
        match value {
            Value::Table(t) => Ok(Value::integer(t.borrow().len() as i64)),
            other => Err(LuaError::length_of(other.type_name())),
        }
    }

    fn get_global(&mut self, key: &Value) -> LuaResult<Value> {
        let globals = Rc::clone(self.runtime.globals());
        let (value, has_metatable) = {
            let table = globals.borrow();
            (table.get(key), table.metatable.is_some())
        };
        if !value.is_nil() || !has_metatable {
            return Ok(value);
        }
        self.index_value(&Value::Table(globals), key, None)
    }

    /// `object[key]` following `__index` chains
    pub fn index_value(&mut self, object: &Value, key: &Value, described: Option<&str>) -> LuaResult<Value> {
        let mut current = object.clone();
        for depth in 0..MAX_TAG_LOOP {
            let handler = match &current {
                Value::Table(t) => {
                    let handler = {
                        let table = t.borrow();
                        let raw = table.get(key);
                        if !raw.is_nil() {
                            return Ok(raw);
                        }
                        table
                            .metatable
                            .as_ref()
                            .map(|m| m.borrow().get_str("__index"))
                            .filter(|h| !h.is_nil())
                    };
                    match handler {
                        Some(handler) => handler,
                        None => return Ok(Value::Nil),
                    }
                }
                other => match self.runtime.metamethod(other, "__index") {
                    Some(handler) => handler,
                    None => {
                        let described = if depth == 0 { described } else { None };
                        return Err(LuaError::index_of(other.type_name(), described));
                    }
                },
            };
            if handler.is_function() {
                let result = self.call_function(&handler, vec![current, key.clone()])?;
                return Ok(result.into_scalar());
            }
            current = handler;
        }
        Err(LuaError::runtime("'__index' chain too long; possible loop"))
    }

    /// `object[key] = value` following `__newindex` chains
    pub fn set_index(
        &mut self,
        object: &Value,
        key: &Value,
        value: Value,
        described: Option<&str>,
    ) -> LuaResult<()> {
        let mut current = object.clone();
        for depth in 0..MAX_TAG_LOOP {
            let handler = match &current {
                Value::Table(t) => {
                    let handler = {
                        let table = t.borrow();
                        if !table.get(key).is_nil() {
                            None
                        } else {
                            table
                                .metatable
                                .as_ref()
                                .map(|m| m.borrow().get_str("__newindex"))
                                .filter(|h| !h.is_nil())
                        }
                    };
                    match handler {
                        Some(handler) => handler,
                        None => return t.borrow_mut().set(key, value),
                    }
                }
                other => match self.runtime.metamethod(other, "__newindex") {
                    Some(handler) => handler,
                    None => {
                        let described = if depth == 0 { described } else { None };
                        return Err(LuaError::index_of(other.type_name(), described));
                    }
                },
            };
            if handler.is_function() {
                self.call_function(&handler, vec![current, key.clone(), value])?;
                return Ok(());
            }
            current = handler;
        }
        Err(LuaError::runtime("'__newindex' chain too long; possible loop"))
    }

    /// `tostring` honouring `__tostring` and `__name`
    pub fn tostring_value(&mut self, value: &Value) -> LuaResult<Value> {
        if let Some(handler) = self.runtime.metamethod(value, "__tostring") {
            let result = self.call_function(&handler, vec![value.clone()])?.into_scalar();
            return match result {
                Value::String(_) => Ok(result),
                Value::Number(n) => Ok(Value::string(&n.to_lua_string())),
                _ => Err(LuaError::runtime("'__tostring' must return a string")),
            };
        }
        match value {
            Value::String(_) => Ok(value.clone()),
            Value::Table(_) | Value::UserData(_) => match self.runtime.metamethod(value, "__name") {
                Some(Value::String(name)) => Ok(Value::string(&format!(
                    "{}: 0x{:08x}",
                    String::from_utf8_lossy(&name),
                    value.address()
                ))),
                _ => Ok(Value::string(&value.to_display_string())),
            },
            other => Ok(Value::string(&other.to_display_string())),
        }
    }

    // ==================== Stack and frame helpers ====================

    fn push(&mut self, value: Value) -> LuaResult<()> {
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> LuaResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| LuaError::internal("operand stack underflow"))
    }

    fn peek(&self, distance: usize) -> LuaResult<&Value> {
        let index = self
            .stack
            .len()
            .checked_sub(1 + distance)
            .ok_or_else(|| LuaError::internal("operand stack underflow"))?;
        Ok(&self.stack[index])
    }

    fn stack_start(&self, count: usize) -> LuaResult<usize> {
        self.stack
            .len()
            .checked_sub(count)
            .ok_or_else(|| LuaError::internal("operand stack underflow"))
    }

    fn peek_table(&self) -> LuaResult<TableRef> {
        match self.peek(0)? {
            Value::Table(t) => Ok(Rc::clone(t)),
            _ => Err(LuaError::internal("table constructor lost its table")),
        }
    }

    /// Value a store instruction reads: `num_val` below the top, element `num_val2`
    fn operand(&self, instr: &Instruction) -> LuaResult<Value> {
        Ok(self.peek(instr.num_val)?.tuple_get(instr.num_val2))
    }

    fn frame(&self) -> LuaResult<&CallFrame> {
        self.frames
            .last()
            .ok_or_else(|| LuaError::internal("no active call frame"))
    }

    fn frame_mut(&mut self) -> LuaResult<&mut CallFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| LuaError::internal("no active call frame"))
    }

    fn local(&self, slot: usize) -> LuaResult<Value> {
        self.frame()?
            .locals
            .get(slot)
            .map(LocalSlot::get)
            .ok_or_else(|| LuaError::internal("local slot out of range"))
    }

    fn local_number(&self, slot: usize) -> LuaResult<Number> {
        self.local(slot)?
            .as_number()
            .ok_or_else(|| LuaError::internal("loop control slot is not a number"))
    }

    fn set_local(&mut self, slot: usize, value: Value) -> LuaResult<()> {
        match self.frame_mut()?.locals.get_mut(slot) {
            Some(local) => {
                local.set(value);
                Ok(())
            }
            None => Err(LuaError::internal("local slot out of range")),
        }
    }

    fn upvalue(&self, index: usize) -> LuaResult<UpvalueCell> {
        self.frame()?
            .closure
            .upvalues
            .get(index)
            .cloned()
            .ok_or_else(|| LuaError::internal("upvalue index out of range"))
    }

    /// Address of the instruction frame `index` is executing
    fn frame_ip(&self, index: usize) -> usize {
        match self.frames.get(index + 1) {
            Some(above) => above.return_ip.saturating_sub(1),
            None => self.ip.saturating_sub(1),
        }
    }

    /// Nearest source location at or before `ip` within the same function
    fn source_ref_at(&self, ip: usize) -> Option<SourceRef> {
        let mut at = ip.min(self.code.len().checked_sub(1)?);
        loop {
            let instr = &self.code[at];
            if let Some(source_ref) = instr.source_ref {
                return Some(source_ref);
            }
            if instr.opcode == OpCode::BeginFn || at == 0 {
                return None;
            }
            at -= 1;
        }
    }

    fn current_source_ref(&self) -> Option<SourceRef> {
        self.source_ref_at(self.ip.saturating_sub(1))
    }

    fn stack_frame(&self, index: usize) -> StackFrame {
        let frame = &self.frames[index];
        let line = self
            .source_ref_at(self.frame_ip(index))
            .map_or(0, |r| r.from_line as usize);
        StackFrame::new(frame.closure.name.to_string(), frame.closure.chunk.to_string(), line)
    }

    // ==================== Debugger ====================

    fn debugger_check(&mut self, source_ref: SourceRef) {
        let runtime = Rc::clone(&self.runtime);
        let mut guard = runtime.debugger.borrow_mut();
        let Some(state) = guard.as_mut() else {
            return;
        };
        let depth = self.frames.len();
        if !state.should_pause(source_ref, depth) {
            return;
        }
        let watches = WatchSnapshot {
            call_stack: self.call_stack_items(),
            locals: self.local_items(),
            operands: self.operand_items(),
        };
        state.pause(self.ip, source_ref, depth, &watches);
    }

    fn call_stack_items(&self) -> Vec<WatchItem> {
        (0..self.frames.len())
            .rev()
            .map(|i| {
                let frame = &self.frames[i];
                let location = self.source_ref_at(self.frame_ip(i));
                WatchItem {
                    name: frame.closure.name.to_string(),
                    value: format!(
                        "{}:{}",
                        frame.closure.chunk,
                        location.map_or(0, |r| r.from_line)
                    ),
                    location,
                }
            })
            .collect()
    }

    fn local_items(&self) -> Vec<WatchItem> {
        let Some(frame) = self.frames.last() else {
            return Vec::new();
        };
        frame
            .locals
            .iter()
            .enumerate()
            .map(|(i, slot)| (frame.slot_name(i), slot.get()))
            .filter(|(name, _)| !name.starts_with('('))
            .map(|(name, value)| WatchItem {
                name,
                value: value.to_display_string(),
                location: None,
            })
            .collect()
    }

    fn operand_items(&self) -> Vec<WatchItem> {
        let base = self.frames.last().map_or(0, |f| f.base);
        self.stack[base.min(self.stack.len())..]
            .iter()
            .enumerate()
            .map(|(i, v)| WatchItem {
                name: i.to_string(),
                value: v.to_display_string(),
                location: None,
            })
            .collect()
    }
}

impl ValueCaller for Processor {
    fn call(&mut self, callee: &Value, args: Vec<Value>) -> LuaResult<Value> {
        self.call_function(callee, args)
    }

    fn runtime(&self) -> Rc<Runtime> {
        Rc::clone(&self.runtime)
    }

    fn index(&mut self, object: &Value, key: &Value) -> LuaResult<Value> {
        self.index_value(object, key, None)
    }

    fn tostring(&mut self, value: &Value) -> LuaResult<Value> {
        self.tostring_value(value)
    }

    fn less_than(&mut self, a: &Value, b: &Value) -> LuaResult<bool> {
        self.compare_less(a, b)
    }

    fn current_coroutine(&self) -> Option<Rc<Coroutine>> {
        self.coroutine.as_ref().and_then(Weak::upgrade)
    }

    fn is_yieldable(&self) -> bool {
        self.coroutine.is_some() && self.native_depth == 0
    }

    fn caller_location(&self, level: usize) -> Option<String> {
        let index = self.frames.len().checked_sub(level.max(1))?;
        let frame = &self.frames[index];
        let line = self.source_ref_at(self.frame_ip(index))?.from_line;
        Some(format!("{}:{}:", frame.closure.chunk, line))
    }
}

fn symbol_of(instr: &Instruction) -> LuaResult<&SymbolRef> {
    instr
        .symbol()
        .ok_or_else(|| LuaError::internal(format!("{} without a symbol", instr.opcode)))
}

fn binary_op(opcode: OpCode) -> ArithOp {
    match opcode {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Div => ArithOp::Div,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Power => ArithOp::Pow,
        OpCode::FloorDiv => ArithOp::FloorDiv,
        OpCode::BitAnd => ArithOp::BitAnd,
        OpCode::BitOr => ArithOp::BitOr,
        OpCode::BitXor => ArithOp::BitXor,
        OpCode::ShiftLeft => ArithOp::Shl,
        _ => ArithOp::Shr,
    }
}
