// Lunar Value Caller
// Lets native functions call back into the VM that invoked them

use std::rc::Rc;

use super::coroutine::Coroutine;
use super::runtime::Runtime;
use super::value::Value;
use crate::error::LuaResult;

/// Interface a native function gets to the running VM
pub trait ValueCaller {
    /// Call any callable value; the result is a scalar or a Tuple
    fn call(&mut self, callee: &Value, args: Vec<Value>) -> LuaResult<Value>;

    /// Shared state of the owning script
    fn runtime(&self) -> Rc<Runtime>;

    /// `object[key]` honouring `__index`
    fn index(&mut self, object: &Value, key: &Value) -> LuaResult<Value>;

    /// `tostring(value)` honouring `__tostring` and `__name`
    fn tostring(&mut self, value: &Value) -> LuaResult<Value>;

    /// `a < b` honouring `__lt`
    fn less_than(&mut self, a: &Value, b: &Value) -> LuaResult<bool>;

    /// Coroutine this VM runs, None on the main thread
    fn current_coroutine(&self) -> Option<Rc<Coroutine>>;

    fn is_yieldable(&self) -> bool;

    /// `chunk:line:` of the function `level` frames up (1 = the caller of the native)
    fn caller_location(&self, level: usize) -> Option<String>;
}
