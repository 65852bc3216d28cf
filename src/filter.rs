// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filter algebra: construction, validation against a table's schema and per-value tests.

use crate::error::{Error, Result};
use crate::schema::{parse_cell, ColumnType, Value};
use crate::storage::Table;
use regex::bytes::Regex;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "eq" | "=" | "==" => Ok(Self::Eq),
            "ne" | "!=" | "<>" => Ok(Self::Ne),
            "lt" | "<" => Ok(Self::Lt),
            "le" | "<=" => Ok(Self::Le),
            "gt" | ">" => Ok(Self::Gt),
            "ge" | ">=" => Ok(Self::Ge),
            other => Err(Error::invalid(format!("unknown operator {other:?}"))),
        }
    }

    /// Whether `cell <op> value` holds given `cell.cmp(value)`.
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

/// A predicate tree over the rows of one table.
#[derive(Debug, Clone)]
pub enum Filter {
    NoFilter,
    Compare {
        column: String,
        op: Operator,
        value: Value,
    },
    StartsWith {
        column: String,
        prefix: Vec<u8>,
    },
    EndsWith {
        column: String,
        suffix: Vec<u8>,
    },
    /// Regex search anywhere in the value; `negated` selects the non-matching rows.
    Like {
        column: String,
        pattern: Regex,
        negated: bool,
    },
    /// `low <= value <= high`.
    Range {
        column: String,
        low: Value,
        high: Value,
    },
    Head(usize),
    Tail(usize),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn compare(column: impl Into<String>, op: Operator, value: Value) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    pub fn starts_with(column: impl Into<String>, prefix: impl AsRef<[u8]>) -> Self {
        Self::StartsWith {
            column: column.into(),
            prefix: prefix.as_ref().to_vec(),
        }
    }

    pub fn ends_with(column: impl Into<String>, suffix: impl AsRef<[u8]>) -> Self {
        Self::EndsWith {
            column: column.into(),
            suffix: suffix.as_ref().to_vec(),
        }
    }

    pub fn like(column: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::like_impl(column.into(), pattern, false)
    }

    pub fn not_like(column: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::like_impl(column.into(), pattern, true)
    }

    fn like_impl(column: String, pattern: &str, negated: bool) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| Error::invalid(format!("bad pattern {pattern:?}: {e}")))?;
        Ok(Self::Like {
            column,
            pattern,
            negated,
        })
    }

    /// Inclusive range; both bounds must have the same type and `low <= high`.
    pub fn range(column: impl Into<String>, low: Value, high: Value) -> Result<Self> {
        if low.column_type() != high.column_type() {
            return Err(Error::invalid(format!(
                "range bounds have different types: {} and {}",
                low.column_type(),
                high.column_type()
            )));
        }
        if low.compare(&high) == Ordering::Greater {
            return Err(Error::invalid(format!("range low {low} is above high {high}")));
        }
        Ok(Self::Range {
            column: column.into(),
            low,
            high,
        })
    }

    pub fn head(n: usize) -> Self {
        Self::Head(n)
    }

    pub fn tail(n: usize) -> Self {
        Self::Tail(n)
    }

    pub fn and(self, other: Filter) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Column tested by a leaf predicate.
    pub fn column(&self) -> Option<&str> {
        match self {
            Self::Compare { column, .. }
            | Self::StartsWith { column, .. }
            | Self::EndsWith { column, .. }
            | Self::Like { column, .. }
            | Self::Range { column, .. } => Some(column),
            _ => None,
        }
    }

    /// Verifies every referenced column exists and accepts the filter's value type.
    pub fn check_types(&self, table: &Table) -> Result<()> {
        let expect = |column: &str, value_type: ColumnType| -> Result<()> {
            let column_type = table.column_type(column)?;
            if column_type == value_type {
                Ok(())
            } else {
                Err(Error::TypeMismatch {
                    column: column.to_string(),
                    column_type,
                    value_type,
                })
            }
        };
        match self {
            Self::NoFilter | Self::Head(_) | Self::Tail(_) => Ok(()),
            Self::Compare { column, value, .. } => expect(column, value.column_type()),
            Self::Range { column, low, .. } => expect(column, low.column_type()),
            Self::StartsWith { column, .. }
            | Self::EndsWith { column, .. }
            | Self::Like { column, .. } => expect(column, ColumnType::Str),
            Self::And(a, b) | Self::Or(a, b) => {
                a.check_types(table)?;
                b.check_types(table)
            }
        }
    }

    /// Tests one decoded cell against a leaf predicate.
    ///
    /// Blank cells of numeric columns never match.
    pub(crate) fn test_cell(&self, cell: &[u8], col_type: ColumnType) -> Result<bool> {
        Ok(match self {
            Self::Compare { op, value, .. } => match compare_cell(cell, col_type, value)? {
                Some(ord) => op.holds(ord),
                None => false,
            },
            Self::Range { low, high, .. } => {
                match (
                    compare_cell(cell, col_type, low)?,
                    compare_cell(cell, col_type, high)?,
                ) {
                    (Some(lo), Some(hi)) => lo != Ordering::Less && hi != Ordering::Greater,
                    _ => false,
                }
            }
            Self::StartsWith { prefix, .. } => cell.starts_with(prefix),
            Self::EndsWith { suffix, .. } => cell.ends_with(suffix),
            Self::Like {
                pattern, negated, ..
            } => pattern.is_match(cell) != *negated,
            _ => return Err(Error::invalid("not a column predicate")),
        })
    }
}

/// Orders a decoded cell against `value`; `None` when the cell is a missing number.
pub(crate) fn compare_cell(cell: &[u8], col_type: ColumnType, value: &Value) -> Result<Option<Ordering>> {
    if let (ColumnType::Str, Value::Str(v)) = (col_type, value) {
        return Ok(Some(cell.cmp(v.as_slice())));
    }
    Ok(parse_cell(cell, col_type)?.map(|c| c.compare(value)))
}
