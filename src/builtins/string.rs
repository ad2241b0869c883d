// Lunar String Library
// Provides: len, sub, upper, lower, rep, reverse, byte, char, format, find, match, gmatch, gsub
// Strings are byte strings; the library is also the `__index` of the string metatable

use std::cell::Cell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::lpattern::{self, Capture};
use super::{arg, arg_type, check_integer, check_string, library_table, opt_integer, values, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::profile::CompatibilityProfile;
use crate::vm::{LuaStr, Number, Table, Value, ValueCaller};
use crate::vm::value::fmt_g;

/// Longest string `rep` will build
const MAX_STRING_SIZE: usize = i32::MAX as usize;

pub fn create_string_lib(_profile: &CompatibilityProfile) -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("len", len);
    functions.insert("sub", sub);
    functions.insert("upper", upper);
    functions.insert("lower", lower);
    functions.insert("rep", rep);
    functions.insert("reverse", reverse);
    functions.insert("byte", byte);
    functions.insert("char", char_codes);
    functions.insert("format", format);
    functions.insert("find", find);
    functions.insert("match", match_pattern);
    functions.insert("gmatch", gmatch);
    functions.insert("gsub", gsub);

    library_table(functions)
}

/// Start position: 0 and out-of-range negatives clamp to 1
fn start_index(pos: i64, len: usize) -> usize {
    if pos > 0 {
        pos as usize
    } else if pos == 0 || pos.unsigned_abs() as usize > len {
        1
    } else {
        (len as i64 + pos + 1) as usize
    }
}

/// End position: negatives count from the end, clamped to the length
fn end_index(pos: i64, len: usize) -> usize {
    if pos > len as i64 {
        len
    } else if pos >= 0 {
        pos as usize
    } else if pos.unsigned_abs() as usize > len {
        0
    } else {
        (len as i64 + pos + 1) as usize
    }
}

fn len(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "len")?;
    Ok(Value::integer(s.len() as i64))
}

fn sub(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "sub")?;
    let start = start_index(opt_integer(&args, 1, "sub", 1)?, s.len());
    let end = end_index(opt_integer(&args, 2, "sub", -1)?, s.len());
    if start > end {
        return Ok(Value::string(""));
    }
    Ok(Value::bytes(&s[start - 1..end]))
}

fn upper(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "upper")?;
    Ok(Value::from_bytes(s.to_ascii_uppercase()))
}

fn lower(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "lower")?;
    Ok(Value::from_bytes(s.to_ascii_lowercase()))
}

fn rep(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "rep")?;
    let n = check_integer(&args, 1, "rep")?;
    let separator = super::opt_string(&args, 2, "rep")?;
    if n <= 0 {
        return Ok(Value::string(""));
    }
    let sep_len = separator.as_ref().map_or(0, |sep| sep.len());
    let total = (s.len() + sep_len)
        .checked_mul(n as usize)
        .filter(|&t| t <= MAX_STRING_SIZE)
        .ok_or_else(|| LuaError::runtime("resulting string too large"))?;

    let mut output = Vec::with_capacity(total);
    for i in 0..n {
        if i > 0 {
            if let Some(sep) = &separator {
                output.extend_from_slice(sep);
            }
        }
        output.extend_from_slice(&s);
    }
    Ok(Value::from_bytes(output))
}

fn reverse(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "reverse")?;
    Ok(Value::from_bytes(s.iter().rev().copied().collect()))
}

fn byte(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "byte")?;
    let first = opt_integer(&args, 1, "byte", 1)?;
    let start = start_index(first, s.len());
    let end = end_index(opt_integer(&args, 2, "byte", first)?, s.len());
    if start > end {
        return Ok(Value::Void);
    }
    Ok(values(
        s[start - 1..end]
            .iter()
            .map(|&b| Value::integer(b as i64))
            .collect(),
    ))
}

fn char_codes(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let mut output = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let code = check_integer(&args, i, "char")?;
        let byte = u8::try_from(code).map_err(|_| LuaError::bad_argument(i + 1, "char", "value out of range"))?;
        output.push(byte);
    }
    Ok(Value::from_bytes(output))
}

// ==================== format ====================

#[derive(Default)]
struct FormatSpec {
    left: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    /// Parses flags, width and precision; returns the spec and the conversion byte
    fn parse(fmt: &[u8], mut i: usize) -> LuaResult<(FormatSpec, u8, usize)> {
        let mut spec = FormatSpec::default();
        while let Some(&c) = fmt.get(i) {
            match c {
                b'-' => spec.left = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alternate = true,
                b'0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        let digits = |i: &mut usize| {
            let begin = *i;
            let mut n = 0usize;
            while let Some(d) = fmt.get(*i).filter(|c| c.is_ascii_digit()) {
                n = n * 10 + (d - b'0') as usize;
                *i += 1;
            }
            (n, *i - begin)
        };
        let (width, count) = digits(&mut i);
        if count > 2 {
            return Err(LuaError::runtime("invalid conversion (width too long)"));
        }
        spec.width = width;
        if fmt.get(i) == Some(&b'.') {
            i += 1;
            let (precision, count) = digits(&mut i);
            if count > 2 {
                return Err(LuaError::runtime("invalid conversion (precision too long)"));
            }
            spec.precision = Some(precision);
        }
        let conversion = *fmt
            .get(i)
            .ok_or_else(|| LuaError::runtime("invalid conversion '%' to 'format'"))?;
        Ok((spec, conversion, i + 1))
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    /// Pads `sign + prefix + body` to the field width
    fn pad(&self, sign: &str, prefix: &str, body: &str, zero_allowed: bool) -> String {
        let len = sign.len() + prefix.len() + body.len();
        if len >= self.width {
            return format!("{}{}{}", sign, prefix, body);
        }
        let fill = self.width - len;
        if self.left {
            format!("{}{}{}{}", sign, prefix, body, " ".repeat(fill))
        } else if self.zero && zero_allowed {
            format!("{}{}{}{}", sign, prefix, "0".repeat(fill), body)
        } else {
            format!("{}{}{}{}", " ".repeat(fill), sign, prefix, body)
        }
    }
}

/// `%e`-style exponent: at least two digits with an explicit sign
fn c_exponent(f: f64, precision: usize, upper: bool) -> String {
    let text = format!("{:.*e}", precision, f);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let e = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}{}{}{:02}", mantissa, e, sign, exponent.abs())
}

fn format_float(spec: &FormatSpec, conversion: u8, f: f64) -> String {
    let upper = conversion.is_ascii_uppercase();
    let sign = spec.sign(f.is_sign_negative() && !f.is_nan());
    let magnitude = f.abs();
    if !f.is_finite() {
        let body = if f.is_nan() { "nan" } else { "inf" };
        let body = if upper { body.to_ascii_uppercase() } else { body.to_string() };
        return spec.pad(sign, "", &body, false);
    }
    let precision = spec.precision.unwrap_or(6);
    let body = match conversion.to_ascii_lowercase() {
        b'f' => format!("{:.*}", precision, magnitude),
        b'e' => c_exponent(magnitude, precision, upper),
        _ => {
            let text = fmt_g(magnitude, precision.max(1));
            if upper {
                text.to_ascii_uppercase()
            } else {
                text
            }
        }
    };
    spec.pad(sign, "", &body, true)
}

fn format_integer(spec: &FormatSpec, conversion: u8, n: i64) -> String {
    let (sign, prefix, mut digits) = match conversion {
        b'x' => ("", if spec.alternate && n != 0 { "0x" } else { "" }, format!("{:x}", n as u64)),
        b'X' => ("", if spec.alternate && n != 0 { "0X" } else { "" }, format!("{:X}", n as u64)),
        b'o' => ("", if spec.alternate { "0" } else { "" }, format!("{:o}", n as u64)),
        _ => (spec.sign(n < 0), "", n.unsigned_abs().to_string()),
    };
    if let Some(precision) = spec.precision {
        if precision == 0 && n == 0 {
            digits.clear();
        } else if digits.len() < precision {
            digits = format!("{}{}", "0".repeat(precision - digits.len()), digits);
        }
    }
    spec.pad(sign, prefix, &digits, spec.precision.is_none())
}

/// `%q`: a string literal that reads back to the same value
fn quote(value: &Value) -> LuaResult<Vec<u8>> {
    match value {
        Value::String(s) => {
            let mut out = vec![b'"'];
            for (i, &b) in s.iter().enumerate() {
                match b {
                    b'"' | b'\\' | b'\n' => out.extend_from_slice(&[b'\\', b]),
                    0 => {
                        let next_is_digit = s.get(i + 1).is_some_and(u8::is_ascii_digit);
                        out.extend_from_slice(if next_is_digit { b"\\000" } else { b"\\0" });
                    }
                    c if c.is_ascii_control() => {
                        let next_is_digit = s.get(i + 1).is_some_and(u8::is_ascii_digit);
                        let escaped = if next_is_digit {
                            format!("\\{:03}", c)
                        } else {
                            format!("\\{}", c)
                        };
                        out.extend_from_slice(escaped.as_bytes());
                    }
                    c => out.push(c),
                }
            }
            out.push(b'"');
            Ok(out)
        }
        Value::Number(Number::Integer(i)) => Ok(i.to_string().into_bytes()),
        Value::Number(Number::Float(f)) => {
            let text = if f.is_infinite() {
                if *f > 0.0 { "1e9999".to_string() } else { "-1e9999".to_string() }
            } else if f.is_nan() {
                "(0/0)".to_string()
            } else if f.fract() == 0.0 && f.abs() < 1e16 {
                format!("{:.1}", f)
            } else {
                fmt_g(*f, 17)
            };
            Ok(text.into_bytes())
        }
        Value::Nil | Value::Boolean(_) => Ok(value.to_display_string().into_bytes()),
        _ => Err(LuaError::bad_argument(2, "format", "value has no literal form")),
    }
}

fn format(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let fmt = check_string(&args, 0, "format")?;
    let integers = caller.runtime().profile().integer_subtype;
    let mut output = Vec::with_capacity(fmt.len());
    let mut next_arg = 1;
    let mut i = 0;

    while i < fmt.len() {
        let c = fmt[i];
        i += 1;
        if c != b'%' {
            output.push(c);
            continue;
        }
        if fmt.get(i) == Some(&b'%') {
            output.push(b'%');
            i += 1;
            continue;
        }

        let (spec, conversion, next) = FormatSpec::parse(&fmt, i)?;
        i = next;
        let index = next_arg;
        next_arg += 1;
        if index >= args.len() {
            return Err(LuaError::bad_argument(index + 1, "format", "no value"));
        }

        match conversion {
            b'd' | b'i' | b'u' | b'c' | b'x' | b'X' | b'o' => {
                let n = if integers {
                    check_integer(&args, index, "format")?
                } else {
                    super::check_number(&args, index, "format")?.as_f64() as i64
                };
                if conversion == b'c' {
                    output.push(n as u8);
                } else {
                    output.extend_from_slice(format_integer(&spec, conversion, n).as_bytes());
                }
            }
            b'e' | b'E' | b'f' | b'F' | b'g' | b'G' => {
                let f = super::check_number(&args, index, "format")?.as_f64();
                output.extend_from_slice(format_float(&spec, conversion, f).as_bytes());
            }
            b'q' => output.extend_from_slice(&quote(&arg(&args, index))?),
            b's' => {
                let text = match caller.tostring(&arg(&args, index))? {
                    Value::String(s) => s,
                    other => Rc::from(other.to_display_string().into_bytes().into_boxed_slice()),
                };
                let text = match spec.precision {
                    Some(p) if p < text.len() => &text[..p],
                    _ => &text[..],
                };
                let body = String::from_utf8_lossy(text);
                if spec.width > 0 && text.is_ascii() {
                    output.extend_from_slice(spec.pad("", "", &body, false).as_bytes());
                } else {
                    output.extend_from_slice(text);
                }
            }
            other => {
                return Err(LuaError::runtime(format!(
                    "invalid conversion '%{}' to 'format'",
                    char::from(other)
                )))
            }
        }
    }
    Ok(Value::from_bytes(output))
}

// ==================== Pattern matching ====================

fn capture_value(source: &[u8], capture: Capture) -> Value {
    match capture {
        Capture::Span(begin, end) => Value::bytes(&source[begin..end]),
        Capture::Position(p) => Value::integer(p as i64 + 1),
    }
}

/// Captures as values; the whole match stands in when there are none
fn capture_values(source: &[u8], start: usize, end: usize, captures: &[Capture]) -> Vec<Value> {
    if captures.is_empty() {
        vec![Value::bytes(&source[start..end])]
    } else {
        captures.iter().map(|&c| capture_value(source, c)).collect()
    }
}

fn find_or_match(args: &[Value], func: &str, find: bool) -> LuaResult<Value> {
    let source = check_string(args, 0, func)?;
    let pattern = check_string(args, 1, func)?;
    let init = start_index(opt_integer(args, 2, func, 1)?, source.len());
    if init > source.len() + 1 {
        return Ok(Value::Nil);
    }

    if find && (arg(args, 3).is_truthy() || lpattern::is_plain(&pattern)) {
        let found = if pattern.is_empty() {
            Some(init - 1)
        } else {
            source[init - 1..]
                .windows(pattern.len())
                .position(|w| w == &pattern[..])
                .map(|p| p + init - 1)
        };
        return Ok(match found {
            Some(p) => values(vec![
                Value::integer(p as i64 + 1),
                Value::integer((p + pattern.len()) as i64),
            ]),
            None => Value::Nil,
        });
    }

    match lpattern::find(&source, &pattern, init - 1)? {
        Some((start, end, captures)) if find => {
            let mut results = vec![Value::integer(start as i64 + 1), Value::integer(end as i64)];
            results.extend(captures.iter().map(|&c| capture_value(&source, c)));
            Ok(values(results))
        }
        Some((start, end, captures)) => Ok(values(capture_values(&source, start, end, &captures))),
        None => Ok(Value::Nil),
    }
}

fn find(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    find_or_match(&args, "find", true)
}

fn match_pattern(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    find_or_match(&args, "match", false)
}

fn gmatch(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let source: LuaStr = check_string(&args, 0, "gmatch")?;
    let pattern: LuaStr = check_string(&args, 1, "gmatch")?;
    let position = Cell::new(0usize);
    let last_match = Cell::new(None::<usize>);

    Ok(Value::native("gmatch_iterator", move |_caller, _args| {
        let mut start = position.get();
        while start <= source.len() {
            if let Some((end, captures)) = lpattern::match_at(&source, &pattern, start)? {
                if last_match.get() != Some(end) {
                    position.set(end);
                    last_match.set(Some(end));
                    return Ok(values(capture_values(&source, start, end, &captures)));
                }
            }
            start += 1;
        }
        position.set(start);
        Ok(Value::Nil)
    }))
}

fn gsub(caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let source = check_string(&args, 0, "gsub")?;
    let pattern = check_string(&args, 1, "gsub")?;
    let replacement = arg(&args, 2);
    if !matches!(
        replacement,
        Value::String(_) | Value::Number(_) | Value::Table(_) | Value::Function(_) | Value::ClrFunction(_)
    ) {
        return Err(LuaError::bad_argument_type(
            3,
            "gsub",
            "string/function/table",
            arg_type(&args, 2),
        ));
    }
    let max_replacements = match arg(&args, 3) {
        Value::Nil => i64::MAX,
        _ => check_integer(&args, 3, "gsub")?,
    };
    let (anchored, pattern) = match pattern.first() {
        Some(b'^') => (true, &pattern[1..]),
        _ => (false, &pattern[..]),
    };

    let mut output = Vec::with_capacity(source.len());
    let mut position = 0;
    let mut last_match = None;
    let mut count = 0i64;
    while count < max_replacements {
        match lpattern::match_at(&source, pattern, position)? {
            Some((end, captures)) if last_match != Some(end) => {
                count += 1;
                let whole = &source[position..end];
                let replaced = substitute(caller, &replacement, &source, whole, position, end, &captures)?;
                output.extend_from_slice(&replaced);
                position = end;
                last_match = Some(end);
            }
            _ if position < source.len() => {
                output.push(source[position]);
                position += 1;
            }
            _ => break,
        }
        if anchored {
            break;
        }
    }
    if position < source.len() {
        output.extend_from_slice(&source[position..]);
    }
    Ok(values(vec![Value::from_bytes(output), Value::integer(count)]))
}

fn substitute(
    caller: &mut dyn ValueCaller,
    replacement: &Value,
    source: &[u8],
    whole: &[u8],
    start: usize,
    end: usize,
    captures: &[Capture],
) -> LuaResult<Vec<u8>> {
    let value = match replacement {
        Value::String(_) | Value::Number(_) => {
            let template = replacement.to_lua_bytes().unwrap_or_default();
            return expand_template(&template, source, whole, start, end, captures);
        }
        Value::Table(_) => {
            let key = capture_values(source, start, end, captures).swap_remove(0);
            caller.index(replacement, &key)?
        }
        _ => caller
            .call(replacement, capture_values(source, start, end, captures))?
            .into_scalar(),
    };
    match value {
        Value::Nil | Value::Boolean(false) => Ok(whole.to_vec()),
        Value::String(s) => Ok(s.to_vec()),
        Value::Number(n) => Ok(n.to_lua_string().into_bytes()),
        other => Err(LuaError::runtime(format!(
            "invalid replacement value (a {})",
            other.type_name()
        ))),
    }
}

fn expand_template(
    template: &[u8],
    source: &[u8],
    whole: &[u8],
    start: usize,
    end: usize,
    captures: &[Capture],
) -> LuaResult<Vec<u8>> {
    let mut out = Vec::with_capacity(template.len());
    let mut i = 0;
    while i < template.len() {
        let c = template[i];
        i += 1;
        if c != b'%' {
            out.push(c);
            continue;
        }
        match template.get(i) {
            Some(b'%') => out.push(b'%'),
            Some(b'0') => out.extend_from_slice(whole),
            Some(&d) if d.is_ascii_digit() => {
                let index = (d - b'1') as usize;
                let value = if captures.is_empty() && index == 0 {
                    Value::bytes(&source[start..end])
                } else {
                    let capture = captures
                        .get(index)
                        .ok_or_else(|| LuaError::runtime(format!("invalid capture index %{}", index + 1)))?;
                    capture_value(source, *capture)
                };
                out.extend_from_slice(&value.to_lua_bytes().unwrap_or_default());
            }
            _ => return Err(LuaError::runtime("invalid use of '%' in replacement string")),
        }
        i += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(flags: &str) -> (FormatSpec, u8) {
        let (spec, conversion, _) = FormatSpec::parse(flags.as_bytes(), 0).unwrap();
        (spec, conversion)
    }

    #[test]
    fn integer_conversions_honour_flags() {
        let (s, c) = spec("05d");
        assert_eq!(format_integer(&s, c, -42), "-0042");
        let (s, c) = spec("-4d");
        assert_eq!(format_integer(&s, c, 7), "7   ");
        let (s, c) = spec("#x");
        assert_eq!(format_integer(&s, c, 255), "0xff");
        let (s, c) = spec("+.3d");
        assert_eq!(format_integer(&s, c, 5), "+005");
    }

    #[test]
    fn float_conversions_match_c() {
        let (s, c) = spec(".2f");
        assert_eq!(format_float(&s, c, 3.14159), "3.14");
        let (s, c) = spec("e");
        assert_eq!(format_float(&s, c, 12345.678), "1.234568e+04");
        let (s, c) = spec("g");
        assert_eq!(format_float(&s, c, 0.0001), "0.0001");
        let (s, c) = spec("8.3f");
        assert_eq!(format_float(&s, c, -1.5), "  -1.500");
        let (s, c) = spec("f");
        assert_eq!(format_float(&s, c, f64::INFINITY), "inf");
    }

    #[test]
    fn quoting_escapes_control_bytes() {
        let quoted = quote(&Value::bytes(b"a\"b\n\x01")).unwrap();
        assert_eq!(quoted, b"\"a\\\"b\\\n\\1\"".to_vec());
        assert_eq!(quote(&Value::integer(7)).unwrap(), b"7".to_vec());
    }

    #[test]
    fn relative_positions() {
        assert_eq!(start_index(-3, 5), 3);
        assert_eq!(start_index(0, 5), 1);
        assert_eq!(end_index(-1, 5), 5);
        assert_eq!(end_index(10, 5), 5);
        assert_eq!(end_index(-10, 5), 0);
    }

    #[test]
    fn replacement_templates() {
        let source = b"hello world";
        let captures = [Capture::Span(0, 5)];
        let out = expand_template(b"<%1|%0|%%>", source, &source[0..5], 0, 5, &captures).unwrap();
        assert_eq!(out, b"<hello|hello|%>".to_vec());
        assert!(expand_template(b"%z", source, source, 0, 5, &captures).is_err());
    }
}
