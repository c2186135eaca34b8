//! Generic operations on [Value]s. These define the language's semantics: the interpreter uses
//! them directly, and generated code calls them (as VM functions) wherever it has no specialised
//! template.

use crate::value::{Heap, Value, ValueType};
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::BitAnd => "bitand",
            BinaryOp::BitOr => "bitor",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    /// Compare two ordered values.
    pub fn eval<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Lt => "lt",
            CmpOp::Le => "le",
            CmpOp::Gt => "gt",
            CmpOp::Ge => "ge",
            CmpOp::Eq => "eq",
            CmpOp::Ne => "ne",
        };
        write!(f, "{s}")
    }
}

pub fn to_number(heap: &Heap, v: Value) -> f64 {
    match v {
        Value::Undefined | Value::Object(_) => f64::NAN,
        Value::Null => 0.0,
        Value::Boolean(b) => f64::from(u8::from(b)),
        Value::Int32(x) => f64::from(x),
        Value::Double(d) => d,
        Value::String(s) => {
            let s = heap.string(s).trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
    }
}

pub fn to_boolean(heap: &Heap, v: Value) -> bool {
    match v {
        Value::Undefined | Value::Null => false,
        Value::Boolean(b) => b,
        Value::Int32(x) => x != 0,
        Value::Double(d) => !(d == 0.0 || d.is_nan()),
        Value::String(s) => !heap.string(s).is_empty(),
        Value::Object(_) => true,
    }
}

/// Convert to a 32-bit integer with wrap-around, mapping NaN and infinities to 0.
pub fn to_int32(heap: &Heap, v: Value) -> i32 {
    if let Value::Int32(x) = v {
        return x;
    }
    let d = to_number(heap, v);
    if !d.is_finite() {
        return 0;
    }
    let m = d.trunc().rem_euclid(4294967296.0);
    m as u32 as i32
}

pub fn binary(heap: &mut Heap, op: BinaryOp, a: Value, b: Value) -> Value {
    match op {
        BinaryOp::Add => add(heap, a, b),
        BinaryOp::Sub => arith(heap, a, b, i32::checked_sub, |x, y| x - y),
        BinaryOp::Mul => arith(heap, a, b, i32::checked_mul, |x, y| x * y),
        BinaryOp::BitAnd => Value::Int32(to_int32(heap, a) & to_int32(heap, b)),
        BinaryOp::BitOr => Value::Int32(to_int32(heap, a) | to_int32(heap, b)),
    }
}

/// The type of `binary(op, a, b)`, worked out without touching the heap.
pub fn binary_type(op: BinaryOp, a: Value, b: Value) -> ValueType {
    let int_op: fn(i32, i32) -> Option<i32> = match op {
        BinaryOp::BitAnd | BinaryOp::BitOr => return ValueType::Int32,
        BinaryOp::Add if a.ty() == ValueType::String || b.ty() == ValueType::String => {
            return ValueType::String
        }
        BinaryOp::Add => i32::checked_add,
        BinaryOp::Sub => i32::checked_sub,
        BinaryOp::Mul => i32::checked_mul,
    };
    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) if int_op(x, y).is_some() => ValueType::Int32,
        _ => ValueType::Double,
    }
}

/// `+`: integer addition that overflows into a double, string concatenation if either side is a
/// string, and numeric addition otherwise.
pub fn add(heap: &mut Heap, a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::String(_), _) | (_, Value::String(_)) => {
            let s = format!("{}{}", heap.display(a), heap.display(b));
            Value::String(heap.intern(&s))
        }
        _ => arith(heap, a, b, i32::checked_add, |x, y| x + y),
    }
}

fn arith(
    heap: &Heap,
    a: Value,
    b: Value,
    int_op: fn(i32, i32) -> Option<i32>,
    dbl_op: fn(f64, f64) -> f64,
) -> Value {
    if let (Value::Int32(x), Value::Int32(y)) = (a, b) {
        if let Some(r) = int_op(x, y) {
            return Value::Int32(r);
        }
    }
    Value::Double(dbl_op(to_number(heap, a), to_number(heap, b)))
}

pub fn compare(heap: &Heap, op: CmpOp, a: Value, b: Value) -> bool {
    match op {
        CmpOp::Eq => strict_equals(a, b),
        CmpOp::Ne => !strict_equals(a, b),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => op.eval(heap.string(x), heap.string(y)),
            (Value::Int32(x), Value::Int32(y)) => op.eval(x, y),
            _ => op.eval(to_number(heap, a), to_number(heap, b)),
        },
    }
}

/// `===`: no conversions, except that integers and doubles compare numerically.
pub fn strict_equals(a: Value, b: Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addition() {
        let mut h = Heap::new();
        assert_eq!(add(&mut h, Value::Int32(2), Value::Int32(3)), Value::Int32(5));
        assert_eq!(
            add(&mut h, Value::Int32(i32::MAX), Value::Int32(1)),
            Value::Double(2147483648.0)
        );
        assert_eq!(
            add(&mut h, Value::Int32(1), Value::Double(0.5)),
            Value::Double(1.5)
        );
        let s = h.intern("n=");
        let r = add(&mut h, Value::String(s), Value::Int32(4));
        assert_eq!(h.display(r), "n=4");
        assert!(add(&mut h, Value::Undefined, Value::Int32(1))
            .as_f64()
            .unwrap()
            .is_nan());
    }

    #[test]
    fn result_types_without_side_effects() {
        let mut h = Heap::new();
        let s = Value::String(h.intern("s"));
        let operands = [
            Value::Int32(i32::MAX),
            Value::Int32(-1),
            Value::Double(0.5),
            Value::Null,
            s,
        ];
        let ops = [
            BinaryOp::Add,
            BinaryOp::Sub,
            BinaryOp::Mul,
            BinaryOp::BitAnd,
            BinaryOp::BitOr,
        ];
        for op in ops {
            for a in operands {
                for b in operands {
                    let ty = binary_type(op, a, b);
                    assert_eq!(ty, binary(&mut h, op, a, b).ty(), "{a:?} {op} {b:?}");
                }
            }
        }
    }

    #[test]
    fn conversions() {
        let mut h = Heap::new();
        assert_eq!(to_int32(&h, Value::Double(4294967297.0)), 1);
        assert_eq!(to_int32(&h, Value::Double(-1.5)), -1);
        assert_eq!(to_int32(&h, Value::Double(f64::NAN)), 0);
        let s = h.intern(" 12 ");
        assert_eq!(to_number(&h, Value::String(s)), 12.0);
        assert!(!to_boolean(&h, Value::Double(f64::NAN)));
        let e = h.intern("");
        assert!(!to_boolean(&h, Value::String(e)));
        assert_eq!(
            binary(&mut h, BinaryOp::BitOr, Value::Double(2.9), Value::Int32(4)),
            Value::Int32(6)
        );
    }

    #[test]
    fn comparisons() {
        let mut h = Heap::new();
        assert!(compare(&h, CmpOp::Lt, Value::Int32(1), Value::Double(1.5)));
        assert!(!compare(&h, CmpOp::Lt, Value::Double(f64::NAN), Value::Int32(1)));
        assert!(compare(&h, CmpOp::Eq, Value::Int32(2), Value::Double(2.0)));
        assert!(!compare(&h, CmpOp::Eq, Value::Int32(0), Value::Boolean(false)));
        let a = h.intern("a");
        let b = h.intern("b");
        assert!(compare(&h, CmpOp::Lt, Value::String(a), Value::String(b)));
        assert!(compare(&h, CmpOp::Ne, Value::String(a), Value::String(b)));
    }
}
