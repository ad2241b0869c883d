// Lunar utf8 Library (Lua 5.3+)
// Provides: char, charpattern, codepoint, len, offset, codes

use rustc_hash::FxHashMap;

use super::{check_integer, check_string, library_table, opt_integer, string_position, values, BuiltinFn};
use crate::error::{LuaError, LuaResult};
use crate::vm::{Table, Value, ValueCaller};

const CHAR_PATTERN: &[u8] = b"[\x00-\x7F\xC2-\xFD][\x80-\xBF]*";
const MAX_CODEPOINT: i64 = 0x7FFF_FFFF;

pub fn create_utf8_lib() -> Table {
    let mut functions: FxHashMap<&'static str, BuiltinFn> = FxHashMap::default();

    functions.insert("char", utf8_char);
    functions.insert("codepoint", codepoint);
    functions.insert("len", len);
    functions.insert("offset", offset);
    functions.insert("codes", codes);

    let mut table = library_table(functions);
    table.set_str("charpattern", Value::bytes(CHAR_PATTERN));
    table
}

/// Encodes a code point up to 2^31 with the original (up to six byte) scheme
fn encode(code: u32, out: &mut Vec<u8>) {
    if code < 0x80 {
        out.push(code as u8);
        return;
    }
    let mut tail = Vec::with_capacity(5);
    let mut rest = code;
    let mut limit = 0x3f;
    while rest > limit {
        tail.push(0x80 | (rest & 0x3f) as u8);
        rest >>= 6;
        limit >>= 1;
    }
    let lead = ((!limit << 1) | rest) as u8;
    out.push(lead);
    out.extend(tail.into_iter().rev());
}

/// Decodes the sequence at `s[i..]`; returns the code point and its byte length
fn decode(s: &[u8], i: usize, strict: bool) -> Option<(u32, usize)> {
    let first = *s.get(i)?;
    if first < 0x80 {
        return Some((first as u32, 1));
    }
    if first & 0x40 == 0 {
        return None;
    }
    let mut count = 0;
    let mut code: u32 = 0;
    let mut lead = first;
    while lead & 0x40 != 0 {
        count += 1;
        if count > 5 {
            return None;
        }
        let cont = *s.get(i + count)?;
        if cont & 0xC0 != 0x80 {
            return None;
        }
        code = (code << 6) | (cont & 0x3F) as u32;
        lead <<= 1;
    }
    code |= ((lead & 0x7F) as u32) << (count * 5);
    const LIMITS: [u32; 6] = [!0, 0x80, 0x800, 0x1_0000, 0x20_0000, 0x400_0000];
    if code < LIMITS[count] {
        return None;
    }
    if strict && (code > 0x10FFFF || (0xD800..=0xDFFF).contains(&code)) {
        return None;
    }
    Some((code, count + 1))
}

fn is_continuation(b: u8) -> bool {
    b & 0xC0 == 0x80
}

fn utf8_char(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let mut out = Vec::new();
    for i in 0..args.len() {
        let code = check_integer(&args, i, "char")?;
        if !(0..=MAX_CODEPOINT).contains(&code) {
            return Err(LuaError::bad_argument(i + 1, "char", "value out of range"));
        }
        encode(code as u32, &mut out);
    }
    Ok(Value::from_bytes(out))
}

fn codepoint(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "codepoint")?;
    let i = string_position(opt_integer(&args, 1, "codepoint", 1)?, s.len());
    let j = string_position(opt_integer(&args, 2, "codepoint", i)?, s.len());
    let lax = super::arg(&args, 3).is_truthy();
    if i < 1 {
        return Err(LuaError::bad_argument(2, "codepoint", "out of bounds"));
    }
    if j > s.len() as i64 {
        return Err(LuaError::bad_argument(3, "codepoint", "out of bounds"));
    }
    let mut codes = Vec::new();
    let mut at = (i - 1) as usize;
    while (at as i64) < j {
        let (code, size) =
            decode(&s, at, !lax).ok_or_else(|| LuaError::runtime("invalid UTF-8 code"))?;
        codes.push(Value::integer(code as i64));
        at += size;
    }
    Ok(values(codes))
}

fn len(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "len")?;
    let i = string_position(opt_integer(&args, 1, "len", 1)?, s.len());
    let j = string_position(opt_integer(&args, 2, "len", -1)?, s.len());
    let lax = super::arg(&args, 3).is_truthy();
    if i < 1 || i > s.len() as i64 + 1 {
        return Err(LuaError::bad_argument(2, "len", "initial position out of bounds"));
    }
    if j > s.len() as i64 {
        return Err(LuaError::bad_argument(3, "len", "final position out of bounds"));
    }
    let mut count = 0;
    let mut at = (i - 1) as usize;
    while (at as i64) < j {
        match decode(&s, at, !lax) {
            Some((_, size)) => {
                at += size;
                count += 1;
            }
            None => return Ok(values(vec![Value::Nil, Value::integer(at as i64 + 1)])),
        }
    }
    Ok(Value::integer(count))
}

fn offset(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "offset")?;
    let n = check_integer(&args, 1, "offset")?;
    let default = if n >= 0 { 1 } else { s.len() as i64 + 1 };
    let i = string_position(opt_integer(&args, 2, "offset", default)?, s.len());
    if i < 1 || i > s.len() as i64 + 1 {
        return Err(LuaError::bad_argument(3, "offset", "position out of bounds"));
    }
    let continuation = |at: usize| s.get(at).is_some_and(|&b| is_continuation(b));
    let mut at = (i - 1) as usize;
    let mut n = n;

    if n == 0 {
        while at > 0 && continuation(at) {
            at -= 1;
        }
        return Ok(Value::integer(at as i64 + 1));
    }
    if continuation(at) {
        return Err(LuaError::runtime("initial position is a continuation byte"));
    }
    if n < 0 {
        while n < 0 && at > 0 {
            at -= 1;
            while at > 0 && continuation(at) {
                at -= 1;
            }
            n += 1;
        }
    } else {
        n -= 1;
        while n > 0 && at < s.len() {
            at += 1;
            while continuation(at) {
                at += 1;
            }
            n -= 1;
        }
    }
    if n == 0 {
        Ok(Value::integer(at as i64 + 1))
    } else {
        Ok(Value::Nil)
    }
}

fn codes(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "codes")?;
    Ok(values(vec![
        Value::native("codes_iterator", codes_iterator),
        Value::String(s),
        Value::integer(0),
    ]))
}

fn codes_iterator(_caller: &mut dyn ValueCaller, args: Vec<Value>) -> LuaResult<Value> {
    let s = check_string(&args, 0, "codes")?;
    let mut at = check_integer(&args, 1, "codes")?.max(0) as usize;
    // skip the sequence the previous step returned
    if at > 0 {
        while s.get(at).is_some_and(|&b| is_continuation(b)) {
            at += 1;
        }
    }
    if at >= s.len() {
        return Ok(Value::Nil);
    }
    let (code, _) = decode(&s, at, true).ok_or_else(|| LuaError::runtime("invalid UTF-8 code"))?;
    Ok(values(vec![Value::integer(at as i64 + 1), Value::integer(code as i64)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_multibyte_sequences() {
        let mut out = Vec::new();
        for code in [0x24, 0xA2, 0x20AC, 0x1_0348] {
            encode(code, &mut out);
        }
        assert_eq!(out, "$¢€𐍈".as_bytes());
        assert_eq!(decode(&out, 1, true), Some((0xA2, 2)));
        assert_eq!(decode(&out, 3, true), Some((0x20AC, 3)));
        assert_eq!(decode(&out, 6, true), Some((0x1_0348, 4)));
        assert_eq!(decode(&out, 2, true), None);
    }

    #[test]
    fn rejects_overlong_and_surrogate_forms() {
        assert_eq!(decode(&[0xC0, 0x80], 0, true), None);
        assert_eq!(decode(&[0xED, 0xA0, 0x80], 0, true), None);
        assert!(decode(&[0xED, 0xA0, 0x80], 0, false).is_some());
    }
}
