// Lunar Basic Functions
// Provides: print, assert, error, pcall, xpcall, type, tostring, tonumber, select,
// ipairs, pairs, next, raw*, setmetatable, getmetatable, load, unpack, loadstring, warn

use rustc_hash::FxHashMap;

use super::{arg, arg_type, check_any, check_integer, check_table, opt_integer, values, BuiltinFn};
use crate::error::{ErrorKind, LuaError, LuaResult};
use crate::profile::{CompatibilityProfile, LuaVersion, VersionGuard};
use crate::vm::{CallHandler, Table, TailCall, Value, ValueCaller};

pub fn register(globals: &mut Table, profile: &CompatibilityProfile) {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("print", print);
    functions.insert("assert", assert);
    functions.insert("error", error);
    functions.insert("pcall", pcall);
    functions.insert("xpcall", xpcall);
    functions.insert("type", type_of);
    functions.insert("tostring", tostring);
    functions.insert("tonumber", tonumber);
    functions.insert("select", select);
    functions.insert("ipairs", ipairs);
    functions.insert("pairs", pairs);
    functions.insert("next", next);
    functions.insert("rawget", rawget);
    functions.insert("rawset", rawset);
    functions.insert("rawequal", rawequal);
    functions.insert("rawlen", rawlen);
    functions.insert("setmetatable", setmetatable);
    functions.insert("getmetatable", getmetatable);
    functions.insert("load", load);

    if profile.global_unpack {
        functions.insert("unpack", super::table::unpack);
        functions.insert("loadstring", loadstring);
    }
    if profile.warn_function {
        functions.insert("warn", warn);
    }

    let mut names: Vec<_> = functions.into_iter().collect();
    names.sort_by_key(|(name, _)| *name);
    for (name, func) in names {
        globals.set_str(name, Value::native(name, func));
    }
    globals.set_str("_VERSION", Value::string(profile.version_string()));
}

fn print(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let mut line = Vec::new();
    for (i, value) in args.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        match caller.tostring(value)? {
            Value::String(s) => line.extend_from_slice(&s),
            other => line.extend_from_slice(other.to_display_string().as_bytes()),
        }
    }
    println!("{}", String::from_utf8_lossy(&line));
    Ok(Value::Void)
}

fn assert(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = check_any(&args, 0, "assert")?;
    if value.is_truthy() {
        return Ok(values(args));
    }
    match args.get(1).map(Value::to_scalar) {
        None | Some(Value::Nil) => Err(LuaError::runtime("assertion failed!")),
        Some(message) => Err(LuaError::with_value(message)),
    }
}

fn error(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = arg(&args, 0);
    let level = opt_integer(&args, 1, "error", 1)?;
    let value = match &value {
        Value::String(s) if level > 0 => match caller.caller_location(level as usize) {
            Some(location) => {
                let mut text = format!("{} ", location).into_bytes();
                text.extend_from_slice(s);
                Value::from_bytes(text)
            }
            None => value,
        },
        _ => value,
    };
    Err(LuaError::with_value(value))
}

fn pcall(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let function = check_any(&args, 0, "pcall")?;
    let rest = args.into_iter().skip(1).collect();
    Ok(TailCall::request(function, rest, CallHandler::Protected))
}

fn xpcall(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let function = arg(&args, 0);
    let handler = check_any(&args, 1, "xpcall")?;
    let rest = args.into_iter().skip(2).collect();
    Ok(TailCall::request(function, rest, CallHandler::ProtectedWith(handler)))
}

fn type_of(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = check_any(&args, 0, "type")?;
    Ok(Value::string(value.type_name()))
}

fn tostring(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = check_any(&args, 0, "tostring")?;
    caller.tostring(&value)
}

fn tonumber(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = check_any(&args, 0, "tonumber")?;
    let base = arg(&args, 1);
    if base.is_nil() {
        return Ok(value.to_number().map(Value::Number).unwrap_or_default());
    }
    let base = check_integer(&args, 1, "tonumber")?;
    if !(2..=36).contains(&base) {
        return Err(LuaError::bad_argument(2, "tonumber", "base out of range"));
    }
    let Value::String(text) = value else {
        return Err(LuaError::bad_argument_type(1, "tonumber", "string", arg_type(&args, 0)));
    };
    Ok(parse_with_base(&text, base as u32).map(Value::integer).unwrap_or_default())
}

fn parse_with_base(text: &[u8], base: u32) -> Option<i64> {
    let text = std::str::from_utf8(text).ok()?.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut n: i64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(base)?;
        n = n.wrapping_mul(base as i64).wrapping_add(d as i64);
    }
    Some(if negative { n.wrapping_neg() } else { n })
}

fn select(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let count = args.len().saturating_sub(1) as i64;
    if let Value::String(s) = arg(&args, 0) {
        if &*s == b"#" {
            return Ok(Value::integer(count));
        }
    }
    let n = check_integer(&args, 0, "select")?;
    let start = if n < 0 {
        if n < -count {
            return Err(LuaError::bad_argument(1, "select", "index out of range"));
        }
        count + n
    } else if n == 0 {
        return Err(LuaError::bad_argument(1, "select", "index out of range"));
    } else {
        (n - 1).min(count)
    };
    Ok(values(args.into_iter().skip(1 + start as usize).collect()))
}

fn ipairs(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let target = check_any(&args, 0, "ipairs")?;
    Ok(values(vec![
        Value::native("ipairs_iterator", ipairs_iterator),
        target,
        Value::integer(0),
    ]))
}

fn ipairs_iterator(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let i = check_integer(&args, 1, "ipairs")?.wrapping_add(1);
    let key = Value::integer(i);
    let value = caller.index(&arg(&args, 0), &key)?;
    if value.is_nil() {
        Ok(Value::Nil)
    } else {
        Ok(values(vec![key, value]))
    }
}

fn pairs(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let target = check_any(&args, 0, "pairs")?;
    let runtime = caller.runtime();
    if VersionGuard::is_available(runtime.version(), LuaVersion::Lua52) {
        if let Some(handler) = runtime.metamethod(&target, "__pairs") {
            let triple = caller.call(&handler, vec![target])?;
            return Ok(values(vec![triple.tuple_get(0), triple.tuple_get(1), triple.tuple_get(2)]));
        }
    }
    if !matches!(target, Value::Table(_)) {
        return Err(LuaError::bad_argument_type(1, "pairs", "table", target.type_name()));
    }
    Ok(values(vec![Value::native("next", next), target, Value::Nil]))
}

/// `next(t, k)`; also the iterator behind `pairs` and plain-table `for ... in`
pub(crate) fn next(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "next")?;
    let entry = table.borrow().next(&arg(&args, 1))?;
    Ok(match entry {
        Some((k, v)) => values(vec![k, v]),
        None => Value::Nil,
    })
}

fn rawget(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "rawget")?;
    let value = table.borrow().get(&arg(&args, 1));
    Ok(value)
}

fn rawset(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "rawset")?;
    table.borrow_mut().set(&arg(&args, 1), arg(&args, 2))?;
    Ok(Value::Table(table))
}

fn rawequal(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let a = check_any(&args, 0, "rawequal")?;
    let b = check_any(&args, 1, "rawequal")?;
    Ok(Value::Boolean(a.raw_equals(&b)))
}

fn rawlen(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    match arg(&args, 0) {
        Value::Table(t) => Ok(Value::integer(t.borrow().len() as i64)),
        Value::String(s) => Ok(Value::integer(s.len() as i64)),
        _ => Err(LuaError::bad_argument(1, "rawlen", "table or string expected")),
    }
}

fn setmetatable(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let table = check_table(&args, 0, "setmetatable")?;
    let metatable = match arg(&args, 1) {
        Value::Nil => None,
        Value::Table(mt) => Some(mt),
        _ => return Err(LuaError::bad_argument(2, "setmetatable", "nil or table expected")),
    };
    let protected = table
        .borrow()
        .metatable
        .as_ref()
        .is_some_and(|mt| !mt.borrow().get_str("__metatable").is_nil());
    if protected {
        return Err(LuaError::runtime("cannot change a protected metatable"));
    }
    table.borrow_mut().metatable = metatable;
    Ok(Value::Table(table))
}

fn getmetatable(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let value = arg(&args, 0);
    let Some(metatable) = caller.runtime().metatable_of(&value) else {
        return Ok(Value::Nil);
    };
    let guard = metatable.borrow().get_str("__metatable");
    if !guard.is_nil() {
        return Ok(guard);
    }
    Ok(Value::Table(metatable))
}

fn load(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let source = match arg(&args, 0) {
        Value::String(s) => s.to_vec(),
        piece_fn if piece_fn.is_function() => {
            let mut source = Vec::new();
            loop {
                match caller.call(&piece_fn, Vec::new())?.into_scalar() {
                    Value::String(piece) if !piece.is_empty() => source.extend_from_slice(&piece),
                    Value::Nil | Value::String(_) => break,
                    _ => return Err(LuaError::runtime("reader function must return a string")),
                }
            }
            source
        }
        _ => return Err(LuaError::bad_argument_type(1, "load", "string", arg_type(&args, 0))),
    };
    if !arg(&args, 3).is_nil() {
        return Err(LuaError::bad_argument(4, "load", "custom environments are not supported"));
    }
    compile(caller, &source, arg(&args, 1))
}

fn loadstring(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let source = super::check_string(&args, 0, "loadstring")?;
    compile(caller, &source, arg(&args, 1))
}

/// Compiles a chunk for `load`; syntax errors come back as `nil, message`
fn compile(caller: &mut dyn ValueCaller, source: &[u8], name: Value) -> LuaResult<Value> {
    let runtime = caller.runtime();
    let name = match name {
        Value::String(s) => String::from_utf8_lossy(&s).into_owned(),
        _ => runtime.next_chunk_name(),
    };
    let text = String::from_utf8_lossy(source);
    match runtime.load(&text, &name) {
        Ok(function) => Ok(function),
        Err(err) if err.kind != ErrorKind::InternalError => {
            Ok(values(vec![Value::Nil, Value::string(&err.decorated_message)]))
        }
        Err(err) => Err(err),
    }
}

fn warn(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let mut message = Vec::new();
    for i in 0..args.len().max(1) {
        message.extend_from_slice(&super::check_string(&args, i, "warn")?);
    }
    let runtime = caller.runtime();
    match message.as_slice() {
        b"@on" => runtime.set_warnings(true),
        b"@off" => runtime.set_warnings(false),
        text if runtime.warnings_enabled() && !text.starts_with(b"@") => {
            log::warn!("{}", String::from_utf8_lossy(text));
            eprintln!("Lua warning: {}", String::from_utf8_lossy(text));
        }
        _ => {}
    }
    Ok(Value::Void)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbers_in_other_bases() {
        assert_eq!(parse_with_base(b"ff", 16), Some(255));
        assert_eq!(parse_with_base(b" -101 ", 2), Some(-5));
        assert_eq!(parse_with_base(b"z", 36), Some(35));
        assert_eq!(parse_with_base(b"8", 8), None);
        assert_eq!(parse_with_base(b"", 10), None);
    }

    #[test]
    fn versioned_globals_follow_the_profile() {
        let mut g = Table::new();
        register(&mut g, CompatibilityProfile::for_version(LuaVersion::Lua51));
        assert!(!g.get_str("unpack").is_nil());
        assert!(g.get_str("warn").is_nil());

        let mut g = Table::new();
        register(&mut g, CompatibilityProfile::for_version(LuaVersion::Lua54));
        assert!(g.get_str("unpack").is_nil());
        assert!(!g.get_str("warn").is_nil());
        assert_eq!(g.get_str("_VERSION"), Value::string("Lua 5.4"));
    }
}
