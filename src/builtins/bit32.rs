// Lunar bit32 Library (Lua 5.2)
// Provides: band, bor, bxor, bnot, lshift, rshift, arshift, btest, extract, replace, lrotate, rrotate

use rustc_hash::FxHashMap;

use super::{arg, check_integer, check_number, library_table, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::vm::{Table, Value, ValueCaller};

pub fn create_bit32_lib() -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("band", band);
    functions.insert("bor", bor);
    functions.insert("bxor", bxor);
    functions.insert("bnot", bnot);
    functions.insert("lshift", lshift);
    functions.insert("rshift", rshift);
    functions.insert("arshift", arshift);
    functions.insert("btest", btest);
    functions.insert("extract", extract);
    functions.insert("replace", replace);
    functions.insert("lrotate", lrotate);
    functions.insert("rrotate", rrotate);

    library_table(functions)
}

/// Any number reduced modulo 2^32
fn check_u32(args: &[Value], index: usize, func: &str) -> LuaResult<u32> {
    let f = check_number(args, index, func)?.as_f64();
    Ok(f.floor().rem_euclid(4_294_967_296.0) as u32)
}

fn result(n: u32) -> LuaResult<Value> {
    Ok(Value::integer(n as i64))
}

fn fold(args: &[Value], func: &str, init: u32, op: fn(u32, u32) -> u32) -> LuaResult<u32> {
    let mut acc = init;
    for i in 0..args.len() {
        acc = op(acc, check_u32(args, i, func)?);
    }
    Ok(acc)
}

fn band(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    result(fold(&args, "band", u32::MAX, |a, b| a & b)?)
}

fn bor(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    result(fold(&args, "bor", 0, |a, b| a | b)?)
}

fn bxor(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    result(fold(&args, "bxor", 0, |a, b| a ^ b)?)
}

fn btest(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    Ok(Value::Boolean(fold(&args, "btest", u32::MAX, |a, b| a & b)? != 0))
}

fn bnot(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    result(!check_u32(&args, 0, "bnot")?)
}

/// Logical shift; negative displacements shift the other way
fn shift(x: u32, disp: i64) -> u32 {
    if disp <= -32 || disp >= 32 {
        0
    } else if disp >= 0 {
        x << disp
    } else {
        x >> -disp
    }
}

fn lshift(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "lshift")?;
    let disp = check_integer(&args, 1, "lshift")?;
    result(shift(x, disp))
}

fn rshift(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "rshift")?;
    let disp = check_integer(&args, 1, "rshift")?;
    result(shift(x, disp.saturating_neg()))
}

fn arshift(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "arshift")?;
    let disp = check_integer(&args, 1, "arshift")?;
    if disp < 0 || x & 0x8000_0000 == 0 {
        return result(shift(x, disp.saturating_neg()));
    }
    if disp >= 32 {
        return result(u32::MAX);
    }
    result(((x as i32) >> disp) as u32)
}

fn field_arguments(args: &[Value], index: usize, func: &str) -> LuaResult<(u32, u32)> {
    let field = check_integer(args, index, func)?;
    let width = match arg(args, index + 1) {
        Value::Nil => 1,
        _ => check_integer(args, index + 1, func)?,
    };
    if field < 0 {
        return Err(LuaError::bad_argument(index + 1, func, "field cannot be negative"));
    }
    if width <= 0 {
        return Err(LuaError::bad_argument(index + 2, func, "width must be positive"));
    }
    if field.saturating_add(width) > 32 {
        return Err(LuaError::runtime("trying to access non-existent bits"));
    }
    Ok((field as u32, width as u32))
}

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

fn extract(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "extract")?;
    let (field, width) = field_arguments(&args, 1, "extract")?;
    result((x >> field) & mask(width))
}

fn replace(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "replace")?;
    let v = check_u32(&args, 1, "replace")?;
    let (field, width) = field_arguments(&args, 2, "replace")?;
    let m = mask(width) << field;
    result((x & !m) | ((v << field) & m))
}

fn lrotate(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "lrotate")?;
    let disp = check_integer(&args, 1, "lrotate")?;
    result(x.rotate_left(disp.rem_euclid(32) as u32))
}

fn rrotate(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_u32(&args, 0, "rrotate")?;
    let disp = check_integer(&args, 1, "rrotate")?;
    result(x.rotate_right(disp.rem_euclid(32) as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shifts_saturate_at_the_word_size() {
        assert_eq!(shift(1, 31), 0x8000_0000);
        assert_eq!(shift(1, 32), 0);
        assert_eq!(shift(0x10, -4), 1);
        assert_eq!(mask(3), 0b111);
        assert_eq!(mask(32), u32::MAX);
    }

    #[test]
    fn arguments_wrap_modulo_two_to_the_32() {
        let args = vec![Value::integer(-1), Value::float(4294967297.0)];
        assert_eq!(check_u32(&args, 0, "band").unwrap(), u32::MAX);
        assert_eq!(check_u32(&args, 1, "band").unwrap(), 1);
    }
}
