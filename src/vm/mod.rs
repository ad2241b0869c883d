// Lunar VM Module

pub mod arith;
pub mod caller;
pub mod coroutine;
pub mod function;
pub mod processor;
pub mod runtime;
pub mod table;
pub mod value;

pub use caller::ValueCaller;
pub use coroutine::{Coroutine, CoroutineState};
pub use function::{CallHandler, Closure, NativeFunction, TailCall, UpvalueCell};
pub use processor::Processor;
pub use runtime::{Limits, Runtime};
pub use table::{Table, TableRef};
pub use value::{LuaStr, Number, UserData, Value};
