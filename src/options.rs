// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{Error, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::PathBuf;
use std::sync::OnceLock;

const DEFAULT_ROW_BATCH_SIZE: usize = 65_536;

fn default_parallelism() -> usize {
    static THREADS: OnceLock<usize> = OnceLock::new();
    *THREADS.get_or_init(|| {
        std::env::var("NANOCOL_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    })
}

fn default_tmp_dir() -> Option<PathBuf> {
    static TMP: OnceLock<Option<PathBuf>> = OnceLock::new();
    TMP.get_or_init(|| {
        std::env::var_os("NANOCOL_TMP_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    #[default]
    None,
    /// Categorical or bigram dictionary per column.
    Dictionary,
    /// Every row compressed as its own zstd block.
    Block,
}

impl CompressionMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "dictionary" | "dict" => Ok(Self::Dictionary),
            "block" | "zstd" => Ok(Self::Block),
            other => Err(Error::invalid(format!("unknown compression mode: {other}"))),
        }
    }
}

/// A secondary index to build alongside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSpec {
    Column(String),
    /// Index over the byte-reversed values, for suffix searches.
    Reversed(String),
    Pair(String, String),
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub index_columns: Vec<IndexSpec>,
    pub delimiter: u8,
    pub comment_prefix: Option<Vec<u8>>,
    pub compression: CompressionMode,
    pub parallelism: usize,
    pub row_batch_size: usize,
    pub tmp_dir: Option<PathBuf>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            index_columns: Vec::new(),
            delimiter: b'\t',
            comment_prefix: Some(b"#".to_vec()),
            compression: CompressionMode::None,
            parallelism: default_parallelism(),
            row_batch_size: DEFAULT_ROW_BATCH_SIZE,
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl BuildOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if matches!(self.delimiter, b'\n' | b'\r') {
            return Err(Error::invalid("delimiter cannot be a line terminator"));
        }
        if self.row_batch_size == 0 {
            return Err(Error::invalid("row_batch_size must be >= 1"));
        }
        if let Some(prefix) = &self.comment_prefix {
            if prefix.is_empty() {
                return Err(Error::invalid("comment prefix cannot be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Map the file instead of reading it into memory.
    pub use_memory_mapping: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            use_memory_mapping: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub parallelism: usize,
    pub tmp_dir: Option<PathBuf>,
    /// Evaluate leaves through secondary index files when they exist.
    pub use_indexes: bool,
    pub read: ReadOptions,
    pub output_delimiter: u8,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            tmp_dir: default_tmp_dir(),
            use_indexes: true,
            read: ReadOptions::default(),
            output_delimiter: b'\t',
        }
    }
}

/// Parses a delimiter argument; exactly one byte is accepted.
pub fn parse_delimiter(s: &str) -> Result<u8> {
    match s {
        "\\t" | "tab" => Ok(b'\t'),
        _ if s.len() == 1 => Ok(s.as_bytes()[0]),
        _ => Err(Error::invalid(format!(
            "delimiter must be a single byte, got {s:?}"
        ))),
    }
}

/// Builds the worker pool for one build or query call.
pub(crate) fn worker_pool(parallelism: usize) -> Result<ThreadPool> {
    let requested = parallelism.max(1);
    let try_build = |n| ThreadPoolBuilder::new().num_threads(n).build();
    match try_build(requested) {
        Ok(pool) => Ok(pool),
        Err(_) if requested > 1 => try_build(1).map_err(|e| {
            Error::Io(std::io::Error::other(format!("worker pool: {e}")))
        }),
        Err(e) => Err(Error::Io(std::io::Error::other(format!("worker pool: {e}")))),
    }
}
