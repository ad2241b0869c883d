// Lunar Runtime Values
// Tagged dynamic values shared by the VM, the standard library and the host

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::coroutine::Coroutine;
use super::function::{Closure, NativeFunction, TailCall};
use super::table::{Table, TableRef};
use crate::error::LuaResult;
use crate::lexer::scanner::parse_number;
use crate::lexer::TokenKind;
use crate::vm::caller::ValueCaller;

/// Immutable byte string; Lua strings are not required to be UTF-8
pub type LuaStr = Rc<[u8]>;

/// 2^63 as a float, the first value past the i64 range
const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Number subtype
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Number::Integer(_))
    }

    /// Exact integer value, if the number has one
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Number::Integer(i) => Some(i),
            Number::Float(f) => float_to_integer(f),
        }
    }

    /// Integral floats in range collapse to integers
    pub fn normalized(self) -> Number {
        match self {
            Number::Float(f) => match float_to_integer(f) {
                Some(i) if !(f == 0.0 && f.is_sign_negative()) => Number::Integer(i),
                _ => self,
            },
            int => int,
        }
    }

    /// String-to-number coercion: surrounding whitespace and a sign are allowed
    pub fn parse(text: &[u8]) -> Option<Number> {
        let text = std::str::from_utf8(text).ok()?.trim_matches(|c: char| c.is_ascii_whitespace());
        let (negative, digits) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        if digits.starts_with(['-', '+']) || digits.is_empty() {
            return None;
        }
        let number = match parse_number(digits)? {
            TokenKind::Integer(i) => Number::Integer(i),
            TokenKind::Float(f) => Number::Float(f),
            _ => return None,
        };
        Some(match (negative, number) {
            (false, n) => n,
            (true, Number::Integer(i)) => Number::Integer(i.wrapping_neg()),
            (true, Number::Float(f)) => Number::Float(-f),
        })
    }

    /// Text form used by `tostring` and concatenation
    pub fn to_lua_string(self) -> String {
        match self {
            Number::Integer(i) => i.to_string(),
            Number::Float(f) => {
                let mut text = fmt_g(f, 14);
                if text.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
                    text.push_str(".0");
                }
                text
            }
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (Number::Float(a), Number::Float(b)) => a == b,
            (Number::Integer(i), Number::Float(f)) | (Number::Float(f), Number::Integer(i)) => {
                float_to_integer(f) == Some(i)
            }
        }
    }
}

/// Converts a float with an exact integer value in i64 range
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.fract() == 0.0 && f >= -TWO_POW_63 && f < TWO_POW_63 {
        Some(f as i64)
    } else {
        None
    }
}

/// C-style `%.<precision>g` formatting
pub fn fmt_g(value: f64, precision: usize) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= precision as i32 {
        format!(
            "{}e{}{:02}",
            strip_fraction_zeros(mantissa),
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_fraction_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Host object exposed to scripts
pub struct UserData {
    pub type_name: String,
    pub data: RefCell<Box<dyn Any>>,
    pub metatable: RefCell<Option<TableRef>>,
}

impl UserData {
    pub fn new(type_name: impl Into<String>, data: Box<dyn Any>) -> Self {
        Self {
            type_name: type_name.into(),
            data: RefCell::new(data),
            metatable: RefCell::new(None),
        }
    }
}

/// Runtime value types
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    /// Absence of a value: zero results when expanded, nil as a scalar
    Void,
    Boolean(bool),
    Number(Number),
    String(LuaStr),
    Table(TableRef),
    Function(Rc<Closure>),
    ClrFunction(Rc<NativeFunction>),
    UserData(Rc<UserData>),
    /// Multiple values; never contains another tuple
    Tuple(Rc<[Value]>),
    Thread(Rc<Coroutine>),
    /// Returned by natives that want the VM to perform a call for them
    TailCallRequest(Rc<TailCall>),
    /// Returned by `coroutine.yield` to suspend the running coroutine
    YieldRequest(Rc<[Value]>),
}

impl Value {
    pub fn integer(i: i64) -> Value {
        Value::Number(Number::Integer(i))
    }

    pub fn float(f: f64) -> Value {
        Value::Number(Number::Float(f))
    }

    pub fn string(s: &str) -> Value {
        Value::String(Rc::from(s.as_bytes()))
    }

    pub fn bytes(b: &[u8]) -> Value {
        Value::String(Rc::from(b))
    }

    pub fn from_bytes(b: Vec<u8>) -> Value {
        Value::String(Rc::from(b.into_boxed_slice()))
    }

    pub fn table(table: Table) -> Value {
        Value::Table(Rc::new(RefCell::new(table)))
    }

    pub fn new_table() -> Value {
        Value::table(Table::new())
    }

    pub fn native(
        name: &str,
        func: impl Fn(&mut dyn ValueCaller, Vec<Value>) -> LuaResult<Value> + 'static,
    ) -> Value {
        Value::ClrFunction(Rc::new(NativeFunction::new(name, func)))
    }

    /// Packs a value list: non-final tuples are truncated, a final tuple is expanded
    pub fn from_values(values: Vec<Value>) -> Value {
        let needs_flattening = values
            .iter()
            .any(|v| matches!(v, Value::Tuple(_) | Value::Void));
        let values = if needs_flattening {
            let count = values.len();
            let mut flat = Vec::with_capacity(count);
            for (i, value) in values.into_iter().enumerate() {
                if i + 1 == count {
                    value.expand_into(&mut flat);
                } else {
                    flat.push(value.into_scalar());
                }
            }
            flat
        } else {
            values
        };

        match values.len() {
            0 => Value::Void,
            1 => values.into_iter().next().unwrap_or(Value::Nil),
            _ => Value::Tuple(Rc::from(values.into_boxed_slice())),
        }
    }

    fn expand_into(self, out: &mut Vec<Value>) {
        match self {
            Value::Tuple(items) => out.extend(items.iter().cloned()),
            Value::Void => {}
            other => out.push(other),
        }
    }

    /// Flattens to the list of values this value stands for
    pub fn tuple_values(&self) -> Vec<Value> {
        match self {
            Value::Tuple(items) => items.to_vec(),
            Value::Void => Vec::new(),
            other => vec![other.clone()],
        }
    }

    /// The `index`-th value of a multi-value, nil when out of range
    pub fn tuple_get(&self, index: usize) -> Value {
        match self {
            Value::Tuple(items) => items.get(index).cloned().unwrap_or(Value::Nil),
            Value::Void => Value::Nil,
            other if index == 0 => other.clone(),
            _ => Value::Nil,
        }
    }

    pub fn to_scalar(&self) -> Value {
        match self {
            Value::Tuple(items) => items.first().cloned().unwrap_or(Value::Nil),
            Value::Void => Value::Nil,
            other => other.clone(),
        }
    }

    pub fn into_scalar(self) -> Value {
        match self {
            Value::Tuple(items) => items.first().cloned().unwrap_or(Value::Nil),
            Value::Void => Value::Nil,
            other => other,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil | Value::Void => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) | Value::ClrFunction(_) => "function",
            Value::UserData(_) => "userdata",
            Value::Thread(_) => "thread",
            Value::Tuple(items) => items.first().map(|v| v.type_name()).unwrap_or("nil"),
            Value::TailCallRequest(_) | Value::YieldRequest(_) => "request",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil | Value::Void)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Void | Value::Boolean(false) => false,
            Value::Tuple(items) => items.first().map(|v| v.is_truthy()).unwrap_or(false),
            _ => true,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_) | Value::ClrFunction(_))
    }

    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Number, converting numeric strings
    pub fn to_number(&self) -> Option<Number> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => Number::parse(s),
            _ => None,
        }
    }

    /// Exact integer, converting numeric strings and integral floats
    pub fn to_integer(&self) -> Option<i64> {
        self.to_number().and_then(Number::as_integer)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// String contents, converting numbers the way concatenation does
    pub fn to_lua_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::String(s) => Some(s.to_vec()),
            Value::Number(n) => Some(n.to_lua_string().into_bytes()),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableRef> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Identity address of reference values
    pub fn address(&self) -> usize {
        match self {
            Value::Table(t) => Rc::as_ptr(t) as *const u8 as usize,
            Value::Function(f) => Rc::as_ptr(f) as *const u8 as usize,
            Value::ClrFunction(f) => Rc::as_ptr(f) as *const u8 as usize,
            Value::UserData(u) => Rc::as_ptr(u) as *const u8 as usize,
            Value::Thread(c) => Rc::as_ptr(c) as *const u8 as usize,
            _ => 0,
        }
    }

    /// Primitive equality: no metamethods, numbers compare by value
    pub fn raw_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil | Value::Void, Value::Nil | Value::Void) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::ClrFunction(a), Value::ClrFunction(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `tostring` without metamethods
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Nil | Value::Void => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => n.to_lua_string(),
            Value::String(s) => String::from_utf8_lossy(s).into_owned(),
            Value::Table(_) => format!("table: 0x{:08x}", self.address()),
            Value::Function(_) => format!("function: 0x{:08x}", self.address()),
            Value::ClrFunction(f) => format!("builtin: {}", f.name),
            Value::UserData(u) => format!("{}: 0x{:08x}", u.type_name, self.address()),
            Value::Thread(_) => format!("thread: 0x{:08x}", self.address()),
            Value::Tuple(items) => items
                .iter()
                .map(|v| v.to_display_string())
                .collect::<Vec<_>>()
                .join("\t"),
            Value::TailCallRequest(_) => "(tail call request)".to_string(),
            Value::YieldRequest(_) => "(yield request)".to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.raw_equals(y))
            }
            _ => self.raw_equals(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", String::from_utf8_lossy(s)),
            Value::Void => write!(f, "void"),
            Value::Tuple(items) => f.debug_tuple("Tuple").field(&items.as_ref()).finish(),
            other => write!(f, "{}", other.to_display_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::from_bytes(s.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_numbers_like_lua() {
        assert_eq!(Number::Integer(42).to_lua_string(), "42");
        assert_eq!(Number::Float(1.0).to_lua_string(), "1.0");
        assert_eq!(Number::Float(0.1).to_lua_string(), "0.1");
        assert_eq!(Number::Float(1e100).to_lua_string(), "1e+100");
        assert_eq!(Number::Float(-2.5e-7).to_lua_string(), "-2.5e-07");
        assert_eq!(Number::Float(f64::INFINITY).to_lua_string(), "inf");
        assert_eq!(Number::Float(3.14159265358979).to_lua_string(), "3.1415926535898");
        assert_eq!(fmt_g(100000.0, 6), "100000");
        assert_eq!(fmt_g(1000000.0, 6), "1e+06");
    }

    #[test]
    fn integer_and_float_compare_exactly() {
        assert_eq!(Number::Integer(3), Number::Float(3.0));
        assert_ne!(Number::Integer(3), Number::Float(3.5));
        assert_ne!(Number::Integer(i64::MAX), Number::Float(TWO_POW_63));
        assert_eq!(Number::Float(4.0).normalized().as_integer(), Some(4));
        assert!(!Number::Float(-0.0).normalized().is_integer());
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(Number::parse(b"  10  "), Some(Number::Integer(10)));
        assert_eq!(Number::parse(b"-0x10"), Some(Number::Integer(-16)));
        assert_eq!(Number::parse(b"1e2"), Some(Number::Float(100.0)));
        assert_eq!(Number::parse(b"--1"), None);
        assert_eq!(Number::parse(b"abc"), None);
        assert_eq!(Number::parse(b""), None);
    }

    #[test]
    fn tuples_flatten_only_in_last_position() {
        let inner = Value::from_values(vec![Value::integer(1), Value::integer(2)]);
        let packed = Value::from_values(vec![inner.clone(), inner]);
        assert_eq!(
            packed.tuple_values(),
            vec![Value::integer(1), Value::integer(1), Value::integer(2)]
        );
        assert!(matches!(Value::from_values(vec![]), Value::Void));
        assert_eq!(Value::from_values(vec![Value::Boolean(true)]), Value::Boolean(true));
        assert_eq!(Value::Void.to_scalar(), Value::Nil);
        assert!(!Value::Void.is_truthy());
    }
}
