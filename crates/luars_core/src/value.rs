//! The tagged value type.
//!
//! A safe Rust `enum` rather than a NaN/pointer-boxed union: every arm is
//! either a scalar or a small arena index, so the compiler enforces the tag
//! instead of unsafe bit tricks. String/Table/Function/Userdata are held by
//! arena id (see `gc.rs`), not embedded or reference-counted.

use std::fmt;

use crate::gc::{FunctionId, TableId, UserdataId};
use crate::string_pool::{StringId, StringPool};

/// The observable type returned by `type_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
}

impl ValueType {
    /// Index into `State`'s fixed-size per-type default-metatable array.
    pub fn as_index(self) -> usize {
        self as usize
    }

    pub const COUNT: usize = 7;
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Nil => "nil",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Table => "table",
            ValueType::Function => "function",
            ValueType::Userdata => "userdata",
        };
        write!(f, "{}", s)
    }
}

/// Distinguishes the two number sub-types returned by `subtype_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberSubtype {
    Integer,
    Float,
}

/// The tagged value. `Copy` because every arm is either a scalar or a small
/// arena index.
#[derive(Debug, Clone, Copy)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Userdata(UserdataId),
}

impl Value {
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Only nil and false are falsey; everything else, including 0 and the
    /// empty string, is truthy.
    #[inline]
    pub fn to_boolean(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    pub fn type_of(&self) -> ValueType {
        match self {
            Value::Nil => ValueType::Nil,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Integer(_) | Value::Float(_) => ValueType::Number,
            Value::String(_) => ValueType::String,
            Value::Table(_) => ValueType::Table,
            Value::Function(_) => ValueType::Function,
            Value::Userdata(_) => ValueType::Userdata,
        }
    }

    pub fn subtype_of(&self) -> Option<NumberSubtype> {
        match self {
            Value::Integer(_) => Some(NumberSubtype::Integer),
            Value::Float(_) => Some(NumberSubtype::Float),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Floats pass through, integers widen, strings parse (with whitespace
    /// trimmed). Needs `strings` to read string byte content out of the
    /// interner.
    pub fn try_float(&self, strings: &StringPool) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::String(id) => strings.get(*id).trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Integers pass through, exact-integral floats narrow, strings parse
    /// either as an integer literal (`0x` hex supported) or as an
    /// exactly-integral float.
    pub fn try_integer(&self, strings: &StringPool) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => {
                let i = *f as i64;
                if i as f64 == *f {
                    Some(i)
                } else {
                    None
                }
            }
            Value::String(id) => {
                let s = strings.get(*id).trim();
                if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    return i64::from_str_radix(hex, 16).ok();
                }
                if let Some(hex) = s.strip_prefix("-0x").or_else(|| s.strip_prefix("-0X")) {
                    return i64::from_str_radix(hex, 16).ok().map(|v: i64| -v);
                }
                if let Ok(i) = s.parse::<i64>() {
                    return Some(i);
                }
                let f: f64 = s.parse().ok()?;
                let i = f as i64;
                if i as f64 == f {
                    Some(i)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Raw (non-metamethod) string conversion, used by `to_string` when no
    /// `__tostring` is present. Addresses/identity for table/function/userdata
    /// are rendered by the caller (it owns the arena indices to format).
    pub fn to_display_string(&self, strings: &StringPool) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => {
                let mut buf = itoa::Buffer::new();
                buf.format(*i).to_string()
            }
            Value::Float(f) => format_float(*f),
            Value::String(id) => strings.get(*id).to_string(),
            Value::Table(id) => format!("table: 0x{:012x}", id.index()),
            Value::Function(id) => format!("function: 0x{:012x}", id.index()),
            Value::Userdata(id) => format!("userdata: 0x{:012x}", id.index()),
        }
    }

    /// Raw equality. Strings compare by interned id, which is sound because
    /// `StringPool::intern` guarantees structural sharing: equal bytes
    /// always produce the same `StringId`.
    pub fn raw_equals(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Integer(a), Float(b)) | (Float(b), Integer(a)) => (*a as f64) == *b,
            (String(a), String(b)) => a == b,
            (Table(a), Table(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            (Userdata(a), Userdata(b)) => a == b,
            _ => false,
        }
    }

    /// Raw numeric ordering; `None` if either side isn't a number.
    pub fn raw_number_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

/// Shortest round-trip decimal, matching `%.14g`-style formatting: integral
/// floats still show a decimal point so they remain visibly distinct from
/// integers.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let mut s = format!("{:.14e}", f);
    // Prefer plain decimal formatting for the common case; fall back to the
    // shortest Rust gives us for very large/small magnitudes.
    if f == 0.0 {
        return "0.0".to_string();
    }
    let plain = format!("{}", f);
    if plain.len() <= 17 {
        s = plain;
    }
    if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("nan") {
        s.push_str(".0");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StringPool {
        StringPool::new()
    }

    #[test]
    fn boolean_coercion_rules() {
        assert!(!Value::Nil.to_boolean());
        assert!(!Value::Boolean(false).to_boolean());
        assert!(Value::Boolean(true).to_boolean());
        assert!(Value::Integer(0).to_boolean());
        let mut p = pool();
        let empty = p.intern("");
        assert!(Value::String(empty).to_boolean());
    }

    #[test]
    fn integer_float_raw_equal_cross_subtype() {
        assert!(Value::Integer(3).raw_equals(&Value::Float(3.0)));
        assert!(!Value::Integer(3).raw_equals(&Value::Float(3.5)));
    }

    #[test]
    fn try_integer_from_string_hex() {
        let mut p = pool();
        let s = p.intern("0xFF");
        assert_eq!(Value::String(s).try_integer(&p), Some(255));
    }

    #[test]
    fn try_float_trims_whitespace() {
        let mut p = pool();
        let s = p.intern("  3.5 ");
        assert_eq!(Value::String(s).try_float(&p), Some(3.5));
    }
}
