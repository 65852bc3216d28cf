// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delimited text → table file.
//!
//! The build runs in two passes over the parsed source. Pass 1 walks columns (split
//! into ranges across the worker pool) to infer types, widths and, for dictionary
//! compression, the distinct values. Pass 2 walks rows in batches, each worker writing
//! its encoded rows to its own temporary segment; segments are concatenated in batch
//! order when the file is assembled.

use crate::compressor::{compress_block, CompressionMeta, DictKind, Dictionary};
use crate::error::{Error, Result};
use crate::index;
use crate::options::{worker_pool, BuildOptions, CompressionMode, IndexSpec, ReadOptions};
use crate::schema::{ColumnType, Compression, TypeTracker};
use crate::storage::Table;
use crate::tablefile::{self, ColumnLayout, RowData, RowLengths, TableLayout};
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Converts the delimited text file at `source` into a table file at `dest`.
pub fn convert(source: impl AsRef<Path>, dest: impl AsRef<Path>, options: &BuildOptions) -> Result<Table> {
    let source = source.as_ref();
    let file = File::open(source).map_err(|e| Error::from_open(e, source))?;
    build(BufReader::new(file), dest, options)
}

/// Builds a table file at `dest` from delimited text rows, then any requested indexes.
pub fn build<R: BufRead>(source: R, dest: impl AsRef<Path>, options: &BuildOptions) -> Result<Table> {
    let dest = dest.as_ref();
    let _span = tracing::info_span!("build", dest = %dest.display()).entered();
    options.validate()?;

    let source = SourceTable::read(source, options)?;
    validate_index_specs(&source.names, &options.index_columns)?;
    tracing::info!(
        rows = source.rows.len(),
        columns = source.names.len(),
        "parsed source"
    );

    let pool = worker_pool(options.parallelism)?;
    let profiles = pool.install(|| profile_columns(&source, options));
    let plan = plan_columns(&source.names, profiles, source.rows.len(), options.compression);
    for c in &plan {
        tracing::debug!(
            column = %c.name,
            col_type = %c.col_type,
            width = c.width,
            compression = ?c.compression,
            "column planned"
        );
    }

    remove_stale_indexes(dest)?;

    let tmp_root = options.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let tmp = tempfile::Builder::new()
        .prefix("nanocol-build-")
        .tempdir_in(&tmp_root)?;

    let result = pool
        .install(|| write_segments(&source, &plan, options, tmp.path()))
        .and_then(|segments| assemble(dest, &plan, segments, options.compression));

    if let Err(e) = tmp.close() {
        tracing::warn!(error = %e, "failed to remove temporary build directory");
    }
    let written = result?;
    tracing::info!(bytes = written, "table written");

    for spec in &options.index_columns {
        index::build_index(dest, spec, options)?;
    }
    Table::open(dest, ReadOptions::default())
}

/// Deletes the index files of a previous table at `dest`. Runs before the table is
/// replaced, so a failure leaves the old table and its indexes together.
fn remove_stale_indexes(dest: &Path) -> Result<()> {
    for (_, stale) in index::indexes(dest)? {
        match std::fs::remove_file(&stale) {
            Ok(()) => tracing::debug!(index = %stale.display(), "removed stale index"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// The parsed source: header names and the delimited fields of each data row.
struct SourceTable {
    names: Vec<String>,
    lines: Vec<Vec<u8>>,
    rows: Vec<Vec<(usize, usize)>>,
}

impl SourceTable {
    fn read<R: BufRead>(mut source: R, options: &BuildOptions) -> Result<Self> {
        let is_comment = |line: &[u8]| {
            options
                .comment_prefix
                .as_deref()
                .is_some_and(|p| line.starts_with(p))
        };

        let mut header: Option<Vec<u8>> = None;
        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if source.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if is_comment(&buf) {
                continue;
            }
            if header.is_none() {
                header = Some(buf.clone());
            } else {
                lines.push(buf.clone());
            }
        }

        let header = header.unwrap_or_default();
        if header.is_empty() {
            return Err(Error::EmptyInput);
        }
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        for raw in header.split(|&b| b == options.delimiter) {
            let name = std::str::from_utf8(tablefile::trim_padding(raw))
                .map_err(|_| Error::invalid("column name is not valid utf-8"))?
                .to_string();
            if !seen.insert(name.clone()) {
                return Err(Error::invalid(format!("duplicate column name {name:?}")));
            }
            names.push(name);
        }

        if names.len() > 1 {
            lines.retain(|l| !l.is_empty());
        }
        if lines.is_empty() {
            return Err(Error::EmptyInput);
        }
        if lines.len() > u32::MAX as usize {
            return Err(Error::invalid("tables are limited to u32::MAX rows"));
        }

        let mut rows = Vec::with_capacity(lines.len());
        for (n, line) in lines.iter().enumerate() {
            let mut fields = Vec::with_capacity(names.len());
            let mut start = 0usize;
            for (i, &b) in line.iter().enumerate() {
                if b == options.delimiter {
                    fields.push((start, i));
                    start = i + 1;
                }
            }
            fields.push((start, line.len()));
            if fields.len() != names.len() {
                return Err(Error::invalid(format!(
                    "data row {} has {} fields, header has {}",
                    n + 1,
                    fields.len(),
                    names.len()
                )));
            }
            rows.push(fields);
        }
        Ok(Self { names, lines, rows })
    }

    /// A field without trailing spaces, which cell padding would not preserve.
    fn field(&self, row: usize, col: usize) -> &[u8] {
        let (s, e) = self.rows[row][col];
        tablefile::trim_padding(&self.lines[row][s..e])
    }
}

fn validate_index_specs(names: &[String], specs: &[IndexSpec]) -> Result<()> {
    let known = |c: &String| {
        if !names.contains(c) {
            return Err(Error::UnknownColumn(c.clone()));
        }
        index::check_indexable(c)
    };
    for spec in specs {
        match spec {
            IndexSpec::Column(c) | IndexSpec::Reversed(c) => known(c)?,
            IndexSpec::Pair(a, b) => {
                known(a)?;
                known(b)?;
                if a == b {
                    return Err(Error::invalid("two-column index needs two distinct columns"));
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
struct ColumnProfile<'a> {
    col_type: ColumnType,
    max_len: usize,
    distinct: Option<Vec<&'a [u8]>>,
}

/// Pass 1: one worker per range of columns.
fn profile_columns<'a>(source: &'a SourceTable, options: &BuildOptions) -> Vec<ColumnProfile<'a>> {
    let ncols = source.names.len();
    let collect_distinct = options.compression == CompressionMode::Dictionary;
    let range_len = ncols.div_ceil(options.parallelism.max(1)).max(1);
    let cols: Vec<usize> = (0..ncols).collect();
    cols.par_chunks(range_len)
        .flat_map_iter(|range| {
            range.iter().map(move |&c| {
                let mut tracker = TypeTracker::default();
                let mut max_len = 0usize;
                let mut distinct: HashSet<&[u8]> = HashSet::new();
                for r in 0..source.rows.len() {
                    let v = source.field(r, c);
                    max_len = max_len.max(v.len());
                    tracker.observe(v);
                    if collect_distinct {
                        distinct.insert(v);
                    }
                }
                ColumnProfile {
                    col_type: tracker.resolve(),
                    max_len,
                    distinct: collect_distinct.then(|| {
                        let mut d: Vec<&[u8]> = distinct.into_iter().collect();
                        d.sort_unstable();
                        d
                    }),
                }
            })
        })
        .collect()
}

#[derive(Debug)]
struct ColumnPlan {
    name: String,
    col_type: ColumnType,
    width: usize,
    compression: Compression,
    dictionary: Option<Dictionary>,
}

fn plan_columns(
    names: &[String],
    profiles: Vec<ColumnProfile<'_>>,
    num_rows: usize,
    mode: CompressionMode,
) -> Vec<ColumnPlan> {
    names
        .iter()
        .zip(profiles)
        .map(|(name, p)| {
            let plain_width = p.max_len.max(1);
            let mut plan = ColumnPlan {
                name: name.clone(),
                col_type: p.col_type,
                width: plain_width,
                compression: if mode == CompressionMode::Block {
                    Compression::Block
                } else {
                    Compression::None
                },
                dictionary: None,
            };
            if let Some(distinct) = p.distinct {
                let dict = Dictionary::plan(&distinct, num_rows);
                let width = distinct
                    .iter()
                    .map(|v| dict.encoded_len(v))
                    .max()
                    .unwrap_or(0)
                    .max(1);
                // Only worth it when rows get narrower.
                if width < plain_width {
                    plan.width = width;
                    plan.compression = match dict.kind() {
                        DictKind::Categorical => Compression::Categorical,
                        DictKind::Bigram => Compression::Bigram,
                    };
                    plan.dictionary = Some(dict);
                }
            }
            plan
        })
        .collect()
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    len: u64,
    /// Compressed length of each row, block mode only.
    block_lens: Vec<u64>,
}

/// Pass 2: encodes rows batch by batch, one segment file per batch.
fn write_segments(
    source: &SourceTable,
    plan: &[ColumnPlan],
    options: &BuildOptions,
    tmp_dir: &Path,
) -> Result<Vec<Segment>> {
    let row_width: usize = plan.iter().map(|c| c.width).sum();
    let encoders: Vec<_> = plan
        .iter()
        .map(|c| c.dictionary.as_ref().map(Dictionary::encoder))
        .collect();
    let block = options.compression == CompressionMode::Block;
    let row_ids: Vec<usize> = (0..source.rows.len()).collect();

    row_ids
        .par_chunks(options.row_batch_size)
        .enumerate()
        .map(|(batch, rows)| {
            let path = tmp_dir.join(format!("rows.{batch:08}"));
            let mut w = BufWriter::new(File::create(&path)?);
            let mut row = Vec::with_capacity(row_width);
            let mut cell = Vec::new();
            let mut len = 0u64;
            let mut block_lens = Vec::new();
            for &r in rows {
                row.clear();
                for (c, col) in plan.iter().enumerate() {
                    let value = source.field(r, c);
                    match &encoders[c] {
                        Some(enc) => {
                            cell.clear();
                            enc.encode_into(value, &mut cell)?;
                            tablefile::push_padded(&mut row, &cell, col.width);
                        }
                        None => tablefile::push_padded(&mut row, value, col.width),
                    }
                }
                if row.len() != row_width {
                    return Err(Error::Io(std::io::Error::other(format!(
                        "row {r} encoded to {} bytes, expected {row_width}",
                        row.len()
                    ))));
                }
                if block {
                    let compressed = compress_block(&row)?;
                    w.write_all(&compressed)?;
                    block_lens.push(compressed.len() as u64);
                    len += compressed.len() as u64;
                } else {
                    w.write_all(&row)?;
                    len += row.len() as u64;
                }
            }
            w.flush()?;
            tracing::debug!(batch, rows = rows.len(), bytes = len, "segment written");
            Ok(Segment {
                path,
                len,
                block_lens,
            })
        })
        .collect()
}

fn assemble(
    dest: &Path,
    plan: &[ColumnPlan],
    segments: Vec<Segment>,
    mode: CompressionMode,
) -> Result<u64> {
    let row_width: usize = plan.iter().map(|c| c.width).sum();
    let lengths = if mode == CompressionMode::Block {
        let total: usize = segments.iter().map(|s| s.block_lens.len()).sum();
        let mut offsets = Vec::with_capacity(total + 1);
        let mut acc = 0u64;
        offsets.push(0);
        for len in segments.iter().flat_map(|s| s.block_lens.iter()) {
            acc += len;
            offsets.push(acc);
        }
        RowLengths::Offsets(offsets)
    } else {
        RowLengths::Fixed(row_width)
    };

    let cmpr = match mode {
        CompressionMode::None => None,
        CompressionMode::Block => Some(CompressionMeta::Block.encode()),
        CompressionMode::Dictionary => {
            let dicts: Vec<(String, Dictionary)> = plan
                .iter()
                .filter_map(|c| c.dictionary.clone().map(|d| (c.name.clone(), d)))
                .collect();
            (!dicts.is_empty()).then(|| CompressionMeta::Dictionaries(dicts).encode())
        }
    };

    let layout = TableLayout {
        columns: plan
            .iter()
            .map(|c| ColumnLayout {
                name: c.name.clone(),
                col_type: c.col_type,
                width: c.width,
            })
            .collect(),
        rows: RowData::Segments(segments.into_iter().map(|s| (s.path, s.len)).collect()),
        lengths,
        cmpr,
    };
    tablefile::write_table_file(dest, layout)
}
