// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int,
    Float,
    Str,
}

impl ColumnType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'i' => Some(Self::Int),
            b'f' => Some(Self::Float),
            b's' => Some(Self::Str),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::Int => b'i',
            Self::Float => b'f',
            Self::Str => b's',
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "string",
        };
        f.write_str(name)
    }
}

/// How a column's values are stored inside a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Categorical,
    Bigram,
    /// The whole row is a zstd block.
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub col_type: ColumnType,
    pub compression: Compression,
    pub start: usize,
    pub end: usize,
}

impl Column {
    pub fn width(&self) -> usize {
        self.end - self.start
    }
}

/// A typed literal used by filters and by index keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
}

impl Value {
    pub fn str(s: impl AsRef<[u8]>) -> Self {
        Self::Str(s.as_ref().to_vec())
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Self::Int(_) => ColumnType::Int,
            Self::Float(_) => ColumnType::Float,
            Self::Str(_) => ColumnType::Str,
        }
    }

    /// Total order over values of one type; values of different types order by type.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            _ => type_rank(self.column_type()).cmp(&type_rank(other.column_type())),
        }
    }

    /// Comparison used by filters: like [`Value::total_cmp`] except that numerically
    /// equal floats (`-0.0` and `0.0`) compare equal.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) if a == b => Ordering::Equal,
            _ => self.total_cmp(other),
        }
    }
}

fn type_rank(t: ColumnType) -> u8 {
    match t {
        ColumnType::Int => 0,
        ColumnType::Float => 1,
        ColumnType::Str => 2,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(&String::from_utf8_lossy(v)),
        }
    }
}

/// Parses a decoded cell into a typed value.
///
/// Blank cells of numeric columns are missing and yield `None`. A non-blank cell that
/// does not parse as its column's type means the file is damaged.
pub fn parse_cell(cell: &[u8], col_type: ColumnType) -> Result<Option<Value>> {
    match col_type {
        ColumnType::Str => Ok(Some(Value::Str(cell.to_vec()))),
        ColumnType::Int | ColumnType::Float if is_blank(cell) => Ok(None),
        ColumnType::Int => std::str::from_utf8(cell)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|v| Some(Value::Int(v)))
            .ok_or_else(|| Error::corrupt("int cell does not parse")),
        ColumnType::Float => std::str::from_utf8(cell)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|v| Some(Value::Float(v)))
            .ok_or_else(|| Error::corrupt("float cell does not parse")),
    }
}

pub fn is_blank(v: &[u8]) -> bool {
    v.iter().all(|&b| b == b' ')
}

fn is_int_literal(v: &[u8]) -> bool {
    let digits = match v.first() {
        Some(b'+') | Some(b'-') => &v[1..],
        _ => v,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return false;
    }
    std::str::from_utf8(v)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .is_some()
}

fn is_float_literal(v: &[u8]) -> bool {
    let mut i = 0usize;
    if matches!(v.first(), Some(b'+') | Some(b'-')) {
        i += 1;
    }
    let mut mantissa_digits = 0usize;
    while i < v.len() && v[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < v.len() && v[i] == b'.' {
        i += 1;
        while i < v.len() && v[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return false;
    }
    if i < v.len() && (v[i] == b'e' || v[i] == b'E') {
        i += 1;
        if i < v.len() && (v[i] == b'+' || v[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < v.len() && v[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == v.len()
        && std::str::from_utf8(v)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .is_some_and(f64::is_finite)
}

/// Classifies one source value. Blank values carry no type evidence.
pub fn classify(v: &[u8]) -> Option<ColumnType> {
    if is_blank(v) {
        None
    } else if is_int_literal(v) {
        Some(ColumnType::Int)
    } else if is_float_literal(v) {
        Some(ColumnType::Float)
    } else {
        Some(ColumnType::Str)
    }
}

/// Accumulates type evidence for a column; the result does not depend on observation order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeTracker {
    seen_int: bool,
    seen_float: bool,
    seen_str: bool,
}

impl TypeTracker {
    pub fn observe(&mut self, v: &[u8]) {
        match classify(v) {
            Some(ColumnType::Int) => self.seen_int = true,
            Some(ColumnType::Float) => self.seen_float = true,
            Some(ColumnType::Str) => self.seen_str = true,
            None => {}
        }
    }

    pub fn merge(&mut self, other: TypeTracker) {
        self.seen_int |= other.seen_int;
        self.seen_float |= other.seen_float;
        self.seen_str |= other.seen_str;
    }

    pub fn resolve(self) -> ColumnType {
        if self.seen_str || !(self.seen_int || self.seen_float) {
            ColumnType::Str
        } else if self.seen_float {
            ColumnType::Float
        } else {
            ColumnType::Int
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infer(values: &[&str]) -> ColumnType {
        let mut t = TypeTracker::default();
        for v in values {
            t.observe(v.as_bytes());
        }
        t.resolve()
    }

    #[test]
    fn test_classify_literals() {
        assert_eq!(classify(b"42"), Some(ColumnType::Int));
        assert_eq!(classify(b"-7"), Some(ColumnType::Int));
        assert_eq!(classify(b"+7"), Some(ColumnType::Int));
        assert_eq!(classify(b"1.5"), Some(ColumnType::Float));
        assert_eq!(classify(b".5"), Some(ColumnType::Float));
        assert_eq!(classify(b"1e10"), Some(ColumnType::Float));
        assert_eq!(classify(b"-2.5E-3"), Some(ColumnType::Float));
        assert_eq!(classify(b"99999999999999999999"), Some(ColumnType::Float));
        assert_eq!(classify(b"nan"), Some(ColumnType::Str));
        assert_eq!(classify(b"inf"), Some(ColumnType::Str));
        assert_eq!(classify(b"1e"), Some(ColumnType::Str));
        assert_eq!(classify(b"."), Some(ColumnType::Str));
        assert_eq!(classify(b"abc"), Some(ColumnType::Str));
        assert_eq!(classify(b""), None);
        assert_eq!(classify(b"   "), None);
    }

    #[test]
    fn test_type_priority_is_order_independent() {
        assert_eq!(infer(&["1", "2", "3"]), ColumnType::Int);
        assert_eq!(infer(&["1", "2.5", "3"]), ColumnType::Float);
        assert_eq!(infer(&["2.5", "1", "3"]), ColumnType::Float);
        assert_eq!(infer(&["1", "x", "2.5"]), ColumnType::Str);
        assert_eq!(infer(&["x", "1", "2.5"]), ColumnType::Str);
        assert_eq!(infer(&["", "1", ""]), ColumnType::Int);
        assert_eq!(infer(&["", ""]), ColumnType::Str);
    }

    #[test]
    fn test_tracker_merge_matches_single_pass() {
        let mut a = TypeTracker::default();
        a.observe(b"1");
        let mut b = TypeTracker::default();
        b.observe(b"2.0");
        a.merge(b);
        assert_eq!(a.resolve(), ColumnType::Float);
    }

    #[test]
    fn test_parse_cell() {
        assert_eq!(parse_cell(b"12", ColumnType::Int).unwrap(), Some(Value::Int(12)));
        assert_eq!(parse_cell(b"", ColumnType::Int).unwrap(), None);
        assert_eq!(parse_cell(b"1e2", ColumnType::Float).unwrap(), Some(Value::Float(100.0)));
        assert_eq!(parse_cell(b"", ColumnType::Str).unwrap(), Some(Value::str("")));
        assert!(matches!(parse_cell(b"x", ColumnType::Int), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_value_total_cmp() {
        assert_eq!(Value::Int(1).total_cmp(&Value::Int(2)), Ordering::Less);
        assert_eq!(Value::Float(2.0).total_cmp(&Value::Float(-1.0)), Ordering::Greater);
        assert_eq!(Value::str("ab").total_cmp(&Value::str("b")), Ordering::Less);
        assert_eq!(Value::Float(-0.0).total_cmp(&Value::Float(0.0)), Ordering::Less);
        assert_eq!(Value::Float(-0.0).compare(&Value::Float(0.0)), Ordering::Equal);
        assert_eq!(Value::Float(-0.5).compare(&Value::Float(0.0)), Ordering::Less);
        assert_eq!(ColumnType::from_tag(ColumnType::Float.to_tag()), Some(ColumnType::Float));
    }
}
