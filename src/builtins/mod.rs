// Lunar Standard Library
// Registers the core modules into a runtime, filtered by the active profile

pub mod basic;
pub mod bit32;
pub mod coroutine;
mod lpattern;
pub mod math;
pub mod os;
pub mod string;
pub mod table;
pub mod utf8;

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::{LuaError, LuaResult};
use crate::options::CoreModules;
use crate::vm::{LuaStr, Number, Runtime, Table, TableRef, Value, ValueCaller};

/// Signature shared by every library function
pub type BuiltinFn = fn(&mut dyn ValueCaller, Vec<Value>) -> LuaResult<Value>;

/// Installs the selected modules as globals of `runtime`
pub fn register_stdlib(runtime: &Rc<Runtime>, modules: CoreModules) {
    let profile = runtime.profile();
    let globals = Rc::clone(runtime.globals());
    let mut g = globals.borrow_mut();

    if modules.basic {
        basic::register(&mut g, profile);
        g.set_str("_G", Value::Table(Rc::clone(&globals)));
    }
    if modules.coroutine {
        g.set_str("coroutine", library_value(coroutine::create_coroutine_lib(profile)));
    }
    if modules.table {
        g.set_str("table", library_value(table::create_table_lib(profile)));
    }
    if modules.string {
        let lib = Rc::new(std::cell::RefCell::new(string::create_string_lib(profile)));
        let mut metatable = Table::new();
        metatable.set_str("__index", Value::Table(Rc::clone(&lib)));
        runtime.set_string_metatable(Some(Rc::new(std::cell::RefCell::new(metatable))));
        g.set_str("string", Value::Table(lib));
    }
    if modules.math {
        g.set_str("math", library_value(math::create_math_lib(profile)));
    }
    if modules.bit32 && profile.bit32_library {
        g.set_str("bit32", library_value(bit32::create_bit32_lib()));
    }
    if modules.utf8 && profile.utf8_library {
        g.set_str("utf8", library_value(utf8::create_utf8_lib()));
    }
    if modules.os {
        g.set_str("os", library_value(os::create_os_lib()));
    }
    log::debug!("standard library registered for {}", profile.display_name());
}

/// Table of natives, inserted in name order so traversal is reproducible
pub(crate) fn library_table(functions: FxHashMap<&'static str, BuiltinFn>) -> Table {
    let mut names: Vec<_> = functions.into_iter().collect();
    names.sort_by_key(|(name, _)| *name);
    let mut table = Table::new();
    for (name, func) in names {
        table.set_str(name, Value::native(name, func));
    }
    table
}

fn library_value(table: Table) -> Value {
    Value::table(table)
}

// ==================== Argument helpers ====================

pub(crate) fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).map(Value::to_scalar).unwrap_or_default()
}

/// Type name for messages; missing arguments read "no value"
pub(crate) fn arg_type(args: &[Value], index: usize) -> &'static str {
    match args.get(index) {
        None | Some(Value::Void) => "no value",
        Some(v) => v.type_name(),
    }
}

pub(crate) fn check_any(args: &[Value], index: usize, func: &str) -> LuaResult<Value> {
    match args.get(index) {
        None | Some(Value::Void) => Err(LuaError::bad_argument(index + 1, func, "value expected")),
        Some(v) => Ok(v.to_scalar()),
    }
}

pub(crate) fn check_number(args: &[Value], index: usize, func: &str) -> LuaResult<Number> {
    arg(args, index)
        .to_number()
        .ok_or_else(|| LuaError::bad_argument_type(index + 1, func, "number", arg_type(args, index)))
}

pub(crate) fn check_integer(args: &[Value], index: usize, func: &str) -> LuaResult<i64> {
    let number = check_number(args, index, func)?;
    number
        .as_integer()
        .ok_or_else(|| LuaError::bad_argument(index + 1, func, "number has no integer representation"))
}

pub(crate) fn opt_integer(args: &[Value], index: usize, func: &str, default: i64) -> LuaResult<i64> {
    if arg(args, index).is_nil() {
        Ok(default)
    } else {
        check_integer(args, index, func)
    }
}

/// String argument; numbers are converted the way the string library does
pub(crate) fn check_string(args: &[Value], index: usize, func: &str) -> LuaResult<LuaStr> {
    match arg(args, index) {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(Rc::from(n.to_lua_string().into_bytes().into_boxed_slice())),
        _ => Err(LuaError::bad_argument_type(index + 1, func, "string", arg_type(args, index))),
    }
}

pub(crate) fn opt_string(args: &[Value], index: usize, func: &str) -> LuaResult<Option<LuaStr>> {
    if arg(args, index).is_nil() {
        Ok(None)
    } else {
        check_string(args, index, func).map(Some)
    }
}

pub(crate) fn check_table(args: &[Value], index: usize, func: &str) -> LuaResult<TableRef> {
    match arg(args, index) {
        Value::Table(t) => Ok(t),
        _ => Err(LuaError::bad_argument_type(index + 1, func, "table", arg_type(args, index))),
    }
}

/// Float result, collapsed to an integer in dialects without the subtype
pub(crate) fn float_result(caller: &dyn ValueCaller, f: f64) -> Value {
    Value::Number(caller.runtime().normalize(Number::Float(f)))
}

/// Relative string position (negative counts from the end) to a 1-based index
pub(crate) fn string_position(pos: i64, len: usize) -> i64 {
    if pos >= 0 {
        pos
    } else if pos.unsigned_abs() as usize > len {
        0
    } else {
        len as i64 + pos + 1
    }
}

pub(crate) fn values(list: Vec<Value>) -> Value {
    Value::from_values(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_arguments_read_no_value() {
        let args = vec![Value::integer(1)];
        assert_eq!(arg_type(&args, 0), "number");
        assert_eq!(arg_type(&args, 1), "no value");
        let err = check_table(&args, 0, "insert").unwrap_err();
        assert_eq!(err.message, "bad argument #1 to 'insert' (table expected, got number)");
    }

    #[test]
    fn numbers_pass_as_strings_and_back() {
        let args = vec![Value::string(" 12 "), Value::integer(7), Value::float(2.5)];
        assert_eq!(check_integer(&args, 0, "f").unwrap(), 12);
        assert_eq!(&*check_string(&args, 1, "f").unwrap(), b"7");
        assert!(check_integer(&args, 2, "f").is_err());
        assert_eq!(opt_integer(&args, 5, "f", 9).unwrap(), 9);
    }

    #[test]
    fn negative_positions_count_from_the_end() {
        assert_eq!(string_position(-1, 5), 5);
        assert_eq!(string_position(-9, 5), 0);
        assert_eq!(string_position(3, 5), 3);
    }
}
