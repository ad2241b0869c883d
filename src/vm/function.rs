// Lunar Function Objects
// Script closures over shared upvalue cells, and host functions

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::caller::ValueCaller;
use super::value::Value;
use crate::error::LuaResult;

/// A captured variable shared between a frame slot and the closures over it
pub type UpvalueCell = Rc<RefCell<Value>>;

/// Script function: bytecode entry point plus captured variables
pub struct Closure {
    /// Address of the function's BeginFn instruction
    pub entry: usize,
    pub upvalues: Vec<UpvalueCell>,
    pub name: Rc<str>,
    pub chunk: Rc<str>,
}

impl Closure {
    pub fn new(entry: usize, upvalues: Vec<UpvalueCell>, name: Rc<str>, chunk: Rc<str>) -> Self {
        Self {
            entry,
            upvalues,
            name,
            chunk,
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<closure {} @{}>", self.name, self.entry)
    }
}

/// Native function type: receives the calling VM and the (expanded) arguments
pub type NativeFn = dyn Fn(&mut dyn ValueCaller, Vec<Value>) -> LuaResult<Value>;

/// Host function callable from scripts
pub struct NativeFunction {
    pub name: String,
    func: Box<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&mut dyn ValueCaller, Vec<Value>) -> LuaResult<Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn invoke(&self, caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
        (self.func)(caller, args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// How errors raised by a requested call are handled
#[derive(Debug, Clone)]
pub enum CallHandler {
    /// Errors propagate normally
    None,
    /// `pcall`: results get a leading `true`, errors become `false, message`
    Protected,
    /// `xpcall`: like Protected, with the error passed through a handler
    ProtectedWith(Value),
}

/// Call the VM performs on behalf of a native (pcall and friends)
#[derive(Debug)]
pub struct TailCall {
    pub function: Value,
    pub args: Vec<Value>,
    pub handler: CallHandler,
}

impl TailCall {
    pub fn request(function: Value, args: Vec<Value>, handler: CallHandler) -> Value {
        Value::TailCallRequest(Rc::new(TailCall {
            function,
            args,
            handler,
        }))
    }
}
