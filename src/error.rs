// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy shared by the builder, the index builder and the query engine.

use crate::schema::ColumnType;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("type mismatch on column {column}: column is {column_type}, filter value is {value_type}")]
    TypeMismatch {
        column: String,
        column_type: ColumnType,
        value_type: ColumnType,
    },

    /// The source produced no columns or no data rows.
    #[error("no columns or no data rows found in input")]
    EmptyInput,

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Section map, coordinate table, dictionary or row block failed to decode.
    #[error("corrupt table file: {0}")]
    Corrupt(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True for errors caused by the filter or select list not matching the table schema.
    pub fn is_schema_error(&self) -> bool {
        matches!(self, Self::UnknownColumn(_) | Self::TypeMismatch { .. })
    }

    /// Maps a "no such file" I/O failure on `path` to [`Error::NotFound`].
    pub(crate) fn from_open(err: io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.into())
        } else {
            Self::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_classification() {
        assert!(Error::UnknownColumn("x".into()).is_schema_error());
        assert!(Error::TypeMismatch {
            column: "a".into(),
            column_type: ColumnType::Str,
            value_type: ColumnType::Float,
        }
        .is_schema_error());
        assert!(!Error::EmptyInput.is_schema_error());
        assert!(!Error::invalid("bad").is_schema_error());
    }

    #[test]
    fn test_open_not_found_maps_to_not_found() {
        let err = Error::from_open(io::Error::from(io::ErrorKind::NotFound), "missing.nc");
        assert!(matches!(err, Error::NotFound(p) if p == PathBuf::from("missing.nc")));
        let err = Error::from_open(io::Error::from(io::ErrorKind::PermissionDenied), "x");
        assert!(matches!(err, Error::Io(_)));
    }
}
