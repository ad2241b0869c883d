// Lunar Math Library
// Provides: abs, ceil, floor, sqrt, sin, cos, tan, asin, acos, atan, exp, log, max, min,
// fmod, modf, huge, pi, random, randomseed, pow (5.1/5.2), tointeger, type, maxinteger,
// mininteger, ult (5.3+)

use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use super::{arg, check_any, check_integer, check_number, float_result, library_table, values, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::profile::{CompatibilityProfile, LuaVersion, VersionGuard};
use crate::vm::arith;
use crate::vm::{Number, Table, Value, ValueCaller};

pub fn create_math_lib(profile: &CompatibilityProfile) -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("abs", math_abs);
    functions.insert("ceil", math_ceil);
    functions.insert("floor", math_floor);
    functions.insert("sqrt", math_sqrt);
    functions.insert("sin", math_sin);
    functions.insert("cos", math_cos);
    functions.insert("tan", math_tan);
    functions.insert("asin", math_asin);
    functions.insert("acos", math_acos);
    functions.insert("atan", math_atan);
    functions.insert("exp", math_exp);
    functions.insert("log", math_log);
    functions.insert("max", math_max);
    functions.insert("min", math_min);
    functions.insert("fmod", math_fmod);
    functions.insert("modf", math_modf);
    functions.insert("random", math_random);
    functions.insert("randomseed", math_randomseed);

    let version = profile.version;
    if VersionGuard::is_available_in_range(version, LuaVersion::Lua51, LuaVersion::Lua52) {
        functions.insert("pow", math_pow);
    }
    if VersionGuard::is_available(version, LuaVersion::Lua53) {
        functions.insert("tointeger", math_tointeger);
        functions.insert("type", math_type);
        functions.insert("ult", math_ult);
    }

    let mut table = library_table(functions);
    table.set_str("pi", Value::float(std::f64::consts::PI));
    table.set_str("huge", Value::float(f64::INFINITY));
    if profile.integer_subtype {
        table.set_str("maxinteger", Value::integer(i64::MAX));
        table.set_str("mininteger", Value::integer(i64::MIN));
    }
    table
}

fn unary(caller: &mut dyn ValueCaller, args: &[Value], name: &str, op: fn(f64) -> f64) -> LuaResult<Value> {
    let n = check_number(args, 0, name)?;
    Ok(float_result(caller, op(n.as_f64())))
}

fn math_abs(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    Ok(Value::Number(match check_number(&args, 0, "abs")? {
        Number::Integer(i) => Number::Integer(i.wrapping_abs()),
        Number::Float(f) => Number::Float(f.abs()),
    }))
}

/// Integral float to an integer when it fits, as `floor`/`ceil` report it
fn integral(f: f64) -> Value {
    match crate::vm::value::float_to_integer(f) {
        Some(i) => Value::integer(i),
        None => Value::float(f),
    }
}

fn math_floor(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    match check_number(&args, 0, "floor")? {
        Number::Integer(i) => Ok(Value::integer(i)),
        Number::Float(f) => Ok(integral(f.floor())),
    }
}

fn math_ceil(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    match check_number(&args, 0, "ceil")? {
        Number::Integer(i) => Ok(Value::integer(i)),
        Number::Float(f) => Ok(integral(f.ceil())),
    }
}

fn math_sqrt(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "sqrt", f64::sqrt)
}

fn math_sin(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "sin", f64::sin)
}

fn math_cos(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "cos", f64::cos)
}

fn math_tan(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "tan", f64::tan)
}

fn math_asin(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "asin", f64::asin)
}

fn math_acos(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "acos", f64::acos)
}

fn math_atan(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let y = check_number(&args, 0, "atan")?.as_f64();
    let x = match arg(&args, 1) {
        Value::Nil => 1.0,
        _ => check_number(&args, 1, "atan")?.as_f64(),
    };
    Ok(float_result(caller, y.atan2(x)))
}

fn math_exp(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    unary(caller, &args, "exp", f64::exp)
}

fn math_log(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_number(&args, 0, "log")?.as_f64();
    let result = match arg(&args, 1) {
        Value::Nil => x.ln(),
        _ => match check_number(&args, 1, "log")?.as_f64() {
            b if b == 2.0 => x.log2(),
            b if b == 10.0 => x.log10(),
            b => x.ln() / b.ln(),
        },
    };
    Ok(float_result(caller, result))
}

fn math_pow(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let x = check_number(&args, 0, "pow")?.as_f64();
    let y = check_number(&args, 1, "pow")?.as_f64();
    Ok(float_result(caller, x.powf(y)))
}

fn extreme(args: &[Value], name: &str, pick_later: fn(Number, Number) -> bool) -> LuaResult<Value> {
    let mut best = check_number(args, 0, name)?;
    for i in 1..args.len() {
        let n = check_number(args, i, name)?;
        if pick_later(best, n) {
            best = n;
        }
    }
    Ok(Value::Number(best))
}

fn math_max(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    extreme(&args, "max", arith::less_than)
}

fn math_min(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    extreme(&args, "min", |best, n| arith::less_than(n, best))
}

fn math_fmod(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let a = check_number(&args, 0, "fmod")?;
    let b = check_number(&args, 1, "fmod")?;
    let integers = caller.runtime().profile().integer_subtype;
    match (a, b) {
        (Number::Integer(x), Number::Integer(y)) if integers => {
            if y == 0 {
                return Err(LuaError::bad_argument(2, "fmod", "zero"));
            }
            // truncated remainder; -1 would overflow for i64::MIN
            Ok(Value::integer(if y == -1 { 0 } else { x % y }))
        }
        (x, y) => Ok(float_result(caller, x.as_f64() % y.as_f64())),
    }
}

fn math_modf(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let n = check_number(&args, 0, "modf")?.as_f64();
    let whole = if n.is_infinite() { n } else { n.trunc() };
    let fraction = if n.is_infinite() { 0.0 } else { n - whole };
    Ok(values(vec![float_result(caller, whole), float_result(caller, fraction)]))
}

fn math_random(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let runtime = caller.runtime();
    let (low, high) = match args.len() {
        0 => {
            let f: f64 = runtime.rng().random();
            return Ok(Value::float(f));
        }
        1 => (1, check_integer(&args, 0, "random")?),
        2 => (check_integer(&args, 0, "random")?, check_integer(&args, 1, "random")?),
        _ => return Err(LuaError::runtime("wrong number of arguments to 'random'")),
    };
    if low > high {
        let index = if args.len() == 1 { 1 } else { 2 };
        return Err(LuaError::bad_argument(index, "random", "interval is empty"));
    }
    let n = runtime.rng().random_range(low..=high);
    Ok(Value::integer(n))
}

fn math_randomseed(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let runtime = caller.runtime();
    match arg(&args, 0) {
        Value::Nil => {
            let seed = rand::rngs::StdRng::from_os_rng().random::<u64>();
            runtime.seed_rng(seed);
        }
        _ => {
            let n = check_number(&args, 0, "randomseed")?;
            let seed = match n {
                Number::Integer(i) => i as u64,
                Number::Float(f) => f.to_bits(),
            };
            runtime.seed_rng(seed);
        }
    }
    Ok(Value::Void)
}

fn math_tointeger(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    Ok(match arg(&args, 0) {
        Value::Number(n) => n.as_integer().map(Value::integer).unwrap_or_default(),
        _ => Value::Nil,
    })
}

fn math_type(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    Ok(match check_any(&args, 0, "type")? {
        Value::Number(Number::Integer(_)) => Value::string("integer"),
        Value::Number(Number::Float(_)) => Value::string("float"),
        _ => Value::Nil,
    })
}

fn math_ult(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let a = check_integer(&args, 0, "ult")?;
    let b = check_integer(&args, 1, "ult")?;
    Ok(Value::Boolean((a as u64) < (b as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_only_functions_start_at_lua53() {
        let lib = create_math_lib(CompatibilityProfile::for_version(LuaVersion::Lua52));
        assert!(lib.get_str("tointeger").is_nil());
        assert!(lib.get_str("maxinteger").is_nil());
        assert!(!lib.get_str("pow").is_nil());

        let lib = create_math_lib(CompatibilityProfile::for_version(LuaVersion::Lua53));
        assert_eq!(lib.get_str("maxinteger"), Value::integer(i64::MAX));
        assert!(lib.get_str("pow").is_nil());
    }

    #[test]
    fn floor_keeps_floats_that_do_not_fit() {
        assert_eq!(integral(3.0), Value::integer(3));
        assert!(matches!(integral(1e300), Value::Number(Number::Float(_))));
    }
}
