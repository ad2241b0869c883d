// Lunar Coroutine Library
// Provides: create, resume, yield, status, wrap, isyieldable, running, close

use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::{arg, arg_type, library_table, values, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::profile::{CompatibilityProfile, LuaVersion, VersionGuard};
use crate::vm::{Coroutine, Table, Value, ValueCaller};

pub fn create_coroutine_lib(profile: &CompatibilityProfile) -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("create", create);
    functions.insert("resume", resume);
    functions.insert("yield", yield_values);
    functions.insert("status", status);
    functions.insert("wrap", wrap);
    functions.insert("isyieldable", isyieldable);
    functions.insert("running", running);
    if profile.coroutine_close {
        functions.insert("close", close);
    }

    library_table(functions)
}

fn check_function(args: &[Value], index: usize, func: &str) -> LuaResult<Value> {
    let value = arg(args, index);
    if value.is_function() {
        Ok(value)
    } else {
        Err(LuaError::bad_argument_type(index + 1, func, "function", arg_type(args, index)))
    }
}

fn check_thread(args: &[Value], index: usize, func: &str) -> LuaResult<Rc<Coroutine>> {
    match arg(args, index) {
        Value::Thread(co) => Ok(co),
        _ => Err(LuaError::bad_argument_type(index + 1, func, "coroutine", arg_type(args, index))),
    }
}

fn create(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let function = check_function(&args, 0, "create")?;
    Ok(Value::Thread(Coroutine::new(caller.runtime(), function)))
}

fn resume(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let co = check_thread(&args, 0, "resume")?;
    let rest = args.into_iter().skip(1).collect();
    match co.resume(rest, caller.current_coroutine()) {
        Ok(result) => Ok(values(vec![Value::Boolean(true), result])),
        Err(err) if err.is_recoverable() => {
            Ok(values(vec![Value::Boolean(false), err.to_script_value()]))
        }
        Err(err) => Err(err),
    }
}

fn yield_values(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    Ok(Value::YieldRequest(Rc::from(args.into_boxed_slice())))
}

fn status(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let co = check_thread(&args, 0, "status")?;
    let running = caller
        .current_coroutine()
        .is_some_and(|current| Rc::ptr_eq(&current, &co));
    let name = if running { "running" } else { co.state().as_str() };
    Ok(Value::string(name))
}

fn wrap(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let function = check_function(&args, 0, "wrap")?;
    let co = Coroutine::new(caller.runtime(), function);
    Ok(Value::native("wrap", move |caller, args| {
        co.resume(args, caller.current_coroutine())
    }))
}

fn isyieldable(caller: &mut dyn ValueCaller, _args: Vec<Value>) -> LuaResult<Value> {
    Ok(Value::Boolean(caller.is_yieldable()))
}

fn running(caller: &mut dyn ValueCaller, _args: Vec<Value>) -> LuaResult<Value> {
    let runtime = caller.runtime();
    let current = caller.current_coroutine();
    let is_main = current.is_none();
    let thread = current.unwrap_or_else(|| runtime.main_thread());
    if VersionGuard::is_available(runtime.version(), LuaVersion::Lua52) {
        Ok(values(vec![Value::Thread(thread), Value::Boolean(is_main)]))
    } else if is_main {
        // 5.1 reports nil on the main thread
        Ok(Value::Nil)
    } else {
        Ok(Value::Thread(thread))
    }
}

fn close(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let co = check_thread(&args, 0, "close")?;
    co.close()
}
