// SPDX-License-Identifier: AGPL-3.0-or-later
//
// NanoCol (Community Edition)
// An embeddable fixed-width columnar table format with sorted secondary indexes.

pub mod builder;
pub mod compressor;
pub mod error;
pub mod filter;
pub mod index;
pub mod options;
pub mod query;
pub mod schema;
pub mod search;
pub mod storage;
pub mod tablefile;

pub use crate::builder::{build, convert};
pub use crate::error::{Error, Result};
pub use crate::filter::{Filter, Operator};
pub use crate::index::{build_pair, build_single, indexes};
pub use crate::options::{BuildOptions, CompressionMode, IndexSpec, QueryOptions, ReadOptions};
pub use crate::query::{head, query, tail, QueryEngine};
pub use crate::schema::{Column, ColumnType, Compression, Value};
pub use crate::storage::Table;

/// Version of this library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
