// Lunar Arithmetic
// Integer/float operator semantics and exact mixed-subtype comparisons

use super::value::Number;
use crate::error::{LuaError, LuaResult};

const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;

/// Arithmetic and bitwise operators, including the unary ones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    FloorDiv,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Unm,
    BitNot,
}

impl ArithOp {
    /// Metamethod consulted when an operand is not a number
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::FloorDiv => "__idiv",
            ArithOp::BitAnd => "__band",
            ArithOp::BitOr => "__bor",
            ArithOp::BitXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
            ArithOp::Unm => "__unm",
            ArithOp::BitNot => "__bnot",
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BitAnd
                | ArithOp::BitOr
                | ArithOp::BitXor
                | ArithOp::Shl
                | ArithOp::Shr
                | ArithOp::BitNot
        )
    }
}

/// Applies `op`; `integers` is false for dialects where every number is a double
pub fn arith(op: ArithOp, a: Number, b: Number, integers: bool) -> LuaResult<Number> {
    use Number::{Float, Integer};

    if op.is_bitwise() {
        let x = a.as_integer().ok_or_else(LuaError::no_integer_representation)?;
        let y = b.as_integer().ok_or_else(LuaError::no_integer_representation)?;
        return Ok(Integer(match op {
            ArithOp::BitAnd => x & y,
            ArithOp::BitOr => x | y,
            ArithOp::BitXor => x ^ y,
            ArithOp::Shl => shift_left(x, y),
            ArithOp::Shr => shift_left(x, y.wrapping_neg()),
            _ => !x,
        }));
    }

    let result = match (op, a, b) {
        (ArithOp::Add, Integer(x), Integer(y)) => int_or_float(x.checked_add(y), x.wrapping_add(y), integers, || x as f64 + y as f64),
        (ArithOp::Sub, Integer(x), Integer(y)) => int_or_float(x.checked_sub(y), x.wrapping_sub(y), integers, || x as f64 - y as f64),
        (ArithOp::Mul, Integer(x), Integer(y)) => int_or_float(x.checked_mul(y), x.wrapping_mul(y), integers, || x as f64 * y as f64),
        (ArithOp::Unm, Integer(x), _) => int_or_float(x.checked_neg(), x.wrapping_neg(), integers, || -(x as f64)),
        (ArithOp::Mod, Integer(x), Integer(y)) if integers => {
            if y == 0 {
                return Err(LuaError::runtime("attempt to perform 'n%%0'"));
            }
            let r = x.wrapping_rem(y);
            Integer(if r != 0 && (r ^ y) < 0 { r + y } else { r })
        }
        (ArithOp::FloorDiv, Integer(x), Integer(y)) if integers => {
            if y == 0 {
                return Err(LuaError::runtime("attempt to perform 'n//0'"));
            }
            let q = x.wrapping_div(y);
            Integer(if x.wrapping_rem(y) != 0 && (x ^ y) < 0 { q - 1 } else { q })
        }
        (op, a, b) => {
            let (x, y) = (a.as_f64(), b.as_f64());
            Float(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Pow => x.powf(y),
                ArithOp::Unm => -x,
                ArithOp::FloorDiv => (x / y).floor(),
                _ => float_mod(x, y),
            })
        }
    };

    Ok(if integers { result } else { result.normalized() })
}

fn int_or_float(checked: Option<i64>, wrapped: i64, integers: bool, float: impl Fn() -> f64) -> Number {
    match (integers, checked) {
        (true, _) => Number::Integer(wrapped),
        (false, Some(v)) => Number::Integer(v),
        (false, None) => Number::Float(float()),
    }
}

fn float_mod(x: f64, y: f64) -> f64 {
    let m = x % y;
    if m != 0.0 && (m < 0.0) != (y < 0.0) {
        m + y
    } else {
        m
    }
}

fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}

/// `a < b` without rounding errors between subtypes
pub fn less_than(a: Number, b: Number) -> bool {
    use Number::{Float, Integer};
    match (a, b) {
        (Integer(x), Integer(y)) => x < y,
        (Float(x), Float(y)) => x < y,
        (Integer(i), Float(f)) => int_lt_float(i, f),
        (Float(f), Integer(i)) => float_lt_int(f, i),
    }
}

/// `a <= b` without rounding errors between subtypes
pub fn less_equal(a: Number, b: Number) -> bool {
    use Number::{Float, Integer};
    match (a, b) {
        (Integer(x), Integer(y)) => x <= y,
        (Float(x), Float(y)) => x <= y,
        (Integer(i), Float(f)) => int_le_float(i, f),
        (Float(f), Integer(i)) => float_le_int(f, i),
    }
}

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f < -TWO_POW_63 {
        false
    } else {
        i < f.ceil() as i64
    }
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        true
    } else if f < -TWO_POW_63 {
        false
    } else {
        i <= f.floor() as i64
    }
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f < -TWO_POW_63 {
        true
    } else {
        (f.floor() as i64) < i
    }
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_POW_63 {
        false
    } else if f < -TWO_POW_63 {
        true
    } else {
        (f.ceil() as i64) <= i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Number::{Float, Integer};

    #[test]
    fn integer_division_rounds_toward_negative_infinity() {
        assert_eq!(arith(ArithOp::FloorDiv, Integer(7), Integer(-2), true).unwrap(), Integer(-4));
        assert_eq!(arith(ArithOp::Mod, Integer(-7), Integer(3), true).unwrap(), Integer(2));
        assert_eq!(arith(ArithOp::Mod, Float(5.5), Float(-2.0), true).unwrap(), Float(-0.5));
        assert!(arith(ArithOp::Mod, Integer(1), Integer(0), true).is_err());
    }

    #[test]
    fn integer_overflow_wraps_only_with_subtype() {
        assert_eq!(
            arith(ArithOp::Add, Integer(i64::MAX), Integer(1), true).unwrap(),
            Integer(i64::MIN)
        );
        assert!(matches!(
            arith(ArithOp::Add, Integer(i64::MAX), Integer(1), false).unwrap(),
            Float(_)
        ));
        assert_eq!(arith(ArithOp::Div, Integer(6), Integer(3), false).unwrap(), Integer(2));
        assert_eq!(arith(ArithOp::Div, Integer(6), Integer(3), true).unwrap(), Float(2.0));
    }

    #[test]
    fn bitwise_requires_integral_operands() {
        assert_eq!(arith(ArithOp::Shl, Integer(1), Integer(4), true).unwrap(), Integer(16));
        assert_eq!(arith(ArithOp::Shr, Integer(-1), Integer(63), true).unwrap(), Integer(1));
        assert_eq!(arith(ArithOp::BitAnd, Float(3.0), Integer(1), true).unwrap(), Integer(1));
        assert!(arith(ArithOp::BitOr, Float(1.5), Integer(1), true).is_err());
    }

    #[test]
    fn mixed_comparisons_are_exact() {
        assert!(less_than(Integer(1), Float(1.5)));
        assert!(!less_than(Integer(2), Float(1.5)));
        assert!(less_equal(Float(2.0), Integer(2)));
        assert!(!less_than(Integer(i64::MAX), Float(TWO_POW_63 - 1024.0)));
        assert!(!less_than(Float(f64::NAN), Integer(0)));
    }
}
