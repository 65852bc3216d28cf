// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filter evaluation and row output.
//!
//! Leaves are answered from an index file when one exists for the column, otherwise by
//! scanning the table in contiguous chunks across the worker pool. Matching rows are
//! kept in a `RoaringBitmap`, so results are sets iterated in ascending row order.

use crate::error::{Error, Result};
use crate::filter::{Filter, Operator};
use crate::index::{index_path, Index};
use crate::options::{worker_pool, IndexSpec, QueryOptions};
use crate::schema::Value;
use crate::storage::Table;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Results with at least this many rows are written by several workers.
const SHARD_MIN_ROWS: u64 = 4096;

/// Runs `filter` against the table at `table` and writes the selected columns to `sink`.
///
/// `select` of `None` outputs every column. Returns the number of rows written.
pub fn query<W: Write>(
    table: impl AsRef<Path>,
    filter: &Filter,
    select: Option<&[&str]>,
    sink: &mut W,
    options: &QueryOptions,
) -> Result<u64> {
    let table = Table::open(table, options.read)?;
    QueryEngine::new(&table, options.clone()).query(filter, select, sink)
}

/// The first `n` rows.
pub fn head<W: Write>(
    table: impl AsRef<Path>,
    n: usize,
    select: Option<&[&str]>,
    sink: &mut W,
    options: &QueryOptions,
) -> Result<u64> {
    query(table, &Filter::Head(n), select, sink, options)
}

/// The last `n` rows.
pub fn tail<W: Write>(
    table: impl AsRef<Path>,
    n: usize,
    select: Option<&[&str]>,
    sink: &mut W,
    options: &QueryOptions,
) -> Result<u64> {
    query(table, &Filter::Tail(n), select, sink, options)
}

pub struct QueryEngine<'t> {
    table: &'t Table,
    options: QueryOptions,
}

impl<'t> QueryEngine<'t> {
    pub fn new(table: &'t Table, options: QueryOptions) -> Self {
        Self { table, options }
    }

    /// Ids of the rows matching `filter`.
    pub fn row_ids(&self, filter: &Filter) -> Result<RoaringBitmap> {
        filter.check_types(self.table)?;
        let pool = worker_pool(self.options.parallelism)?;
        pool.install(|| self.evaluate(filter, None))
    }

    pub fn query<W: Write>(&self, filter: &Filter, select: Option<&[&str]>, sink: &mut W) -> Result<u64> {
        let _span = tracing::info_span!("query", table = %self.table.path().display()).entered();
        let (names, cols) = self.resolve_select(select)?;
        filter.check_types(self.table)?;

        let pool = worker_pool(self.options.parallelism)?;
        let ids = pool.install(|| self.evaluate(filter, None))?;
        tracing::debug!(matches = ids.len(), "filter evaluated");

        let delim = self.options.output_delimiter;
        let mut header = Vec::new();
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                header.push(delim);
            }
            header.extend_from_slice(name.as_bytes());
        }
        header.push(b'\n');
        sink.write_all(&header)?;

        if ids.len() >= SHARD_MIN_ROWS && pool.current_num_threads() > 1 {
            self.write_sharded(&pool, &ids, &cols, sink)?;
        } else {
            self.write_rows(ids.iter(), &cols, sink)?;
        }
        sink.flush()?;
        Ok(ids.len())
    }

    fn resolve_select(&self, select: Option<&[&str]>) -> Result<(Vec<String>, Vec<usize>)> {
        match select {
            None => {
                let names = self.table.column_names()?;
                let cols = (0..names.len()).collect();
                Ok((names, cols))
            }
            Some([]) => Err(Error::invalid("select list is empty")),
            Some(list) => {
                let cols = list
                    .iter()
                    .map(|c| self.table.column_index(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok((list.iter().map(|c| c.to_string()).collect(), cols))
            }
        }
    }

    fn write_rows<W: Write>(&self, ids: impl Iterator<Item = u32>, cols: &[usize], out: &mut W) -> Result<()> {
        let delim = self.options.output_delimiter;
        let mut line = Vec::new();
        for id in ids {
            let row = self.table.read_row(id as usize)?;
            line.clear();
            for (i, &c) in cols.iter().enumerate() {
                if i > 0 {
                    line.push(delim);
                }
                self.table.decode_cell(&row, c, &mut line)?;
            }
            line.push(b'\n');
            out.write_all(&line)?;
        }
        Ok(())
    }

    /// Each worker renders a contiguous slice of the result into its own temporary file;
    /// the files are then copied to `sink` in order.
    fn write_sharded<W: Write>(
        &self,
        pool: &rayon::ThreadPool,
        ids: &RoaringBitmap,
        cols: &[usize],
        sink: &mut W,
    ) -> Result<()> {
        let ids: Vec<u32> = ids.iter().collect();
        let chunk = ids.len().div_ceil(pool.current_num_threads()).max(1);
        let tmp_root = self.options.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let tmp = tempfile::Builder::new()
            .prefix("nanocol-query-")
            .tempdir_in(&tmp_root)?;
        let dir = tmp.path();

        let result = pool
            .install(|| {
                ids.par_chunks(chunk)
                    .enumerate()
                    .map(|(i, part)| {
                        let path = dir.join(format!("shard.{i:06}"));
                        let mut w = BufWriter::new(File::create(&path)?);
                        self.write_rows(part.iter().copied(), cols, &mut w)?;
                        w.flush()?;
                        Ok(path)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .and_then(|shards| {
                for path in shards {
                    let mut f = File::open(&path)?;
                    io::copy(&mut f, sink)?;
                }
                Ok(())
            });

        if let Err(e) = tmp.close() {
            tracing::warn!(error = %e, "failed to remove temporary query directory");
        }
        result
    }

    fn all_rows(&self) -> RoaringBitmap {
        let mut all = RoaringBitmap::new();
        all.insert_range(0..self.table.num_rows() as u32);
        all
    }

    /// Rows of `candidates` (every row when `None`) matching `filter`.
    fn evaluate(&self, filter: &Filter, candidates: Option<&RoaringBitmap>) -> Result<RoaringBitmap> {
        if candidates.is_some_and(RoaringBitmap::is_empty) {
            return Ok(RoaringBitmap::new());
        }
        let restrict = |bits: RoaringBitmap| match candidates {
            Some(c) => bits & c,
            None => bits,
        };
        let n = self.table.num_rows() as u32;
        match filter {
            Filter::NoFilter => Ok(candidates.cloned().unwrap_or_else(|| self.all_rows())),
            Filter::Head(k) => {
                let mut bits = RoaringBitmap::new();
                bits.insert_range(0..n.min(u32::try_from(*k).unwrap_or(u32::MAX)));
                Ok(restrict(bits))
            }
            Filter::Tail(k) => {
                let mut bits = RoaringBitmap::new();
                bits.insert_range(n.saturating_sub(u32::try_from(*k).unwrap_or(u32::MAX))..n);
                Ok(restrict(bits))
            }
            Filter::And(a, b) => {
                if let Some(bits) = self.try_pair_index(a, b)? {
                    return Ok(restrict(bits));
                }
                let left = self.evaluate(a, candidates)?;
                self.evaluate(b, Some(&left))
            }
            Filter::Or(a, b) => {
                let left = self.evaluate(a, candidates)?;
                let rest = match candidates {
                    Some(c) => c - &left,
                    None => self.all_rows() - &left,
                };
                let right = self.evaluate(b, Some(&rest))?;
                Ok(left | right)
            }
            leaf => {
                if let Some(bits) = self.try_index(leaf)? {
                    return Ok(restrict(bits));
                }
                self.scan(leaf, candidates)
            }
        }
    }

    fn open_index(&self, spec: IndexSpec, columns: &[&str]) -> Result<Option<Index>> {
        if !self.options.use_indexes {
            return Ok(None);
        }
        Index::open(&index_path(self.table.path(), &spec), self.table, columns, self.options.read)
    }

    fn try_index(&self, leaf: &Filter) -> Result<Option<RoaringBitmap>> {
        let Some(column) = leaf.column() else {
            return Ok(None);
        };
        let spec = match leaf {
            // Reversed keys lose the value's leading spaces to padding.
            Filter::EndsWith { suffix, .. } if suffix.first() == Some(&b' ') => return Ok(None),
            Filter::EndsWith { .. } => IndexSpec::Reversed(column.to_string()),
            _ => IndexSpec::Column(column.to_string()),
        };
        match self.open_index(spec, &[column])? {
            Some(index) => {
                let bits = index.lookup(leaf)?;
                tracing::debug!(column, matches = bits.len(), "leaf answered from index");
                Ok(Some(bits))
            }
            None => Ok(None),
        }
    }

    /// `And(a == v, lo <= b <= hi)` in either order, answered from an `a____b` index.
    fn try_pair_index(&self, left: &Filter, right: &Filter) -> Result<Option<RoaringBitmap>> {
        let (eq_col, value, range_col, low, high) = match pair_operands(left, right)
            .or_else(|| pair_operands(right, left))
        {
            Some(parts) => parts,
            None => return Ok(None),
        };
        if eq_col == range_col {
            return Ok(None);
        }
        let spec = IndexSpec::Pair(eq_col.to_string(), range_col.to_string());
        match self.open_index(spec, &[eq_col, range_col])? {
            Some(index) => {
                let bits = index.lookup_pair(value, low, high)?;
                tracing::debug!(eq_col, range_col, matches = bits.len(), "and answered from pair index");
                Ok(Some(bits))
            }
            None => Ok(None),
        }
    }

    /// Tests a leaf against every candidate row, split into contiguous chunks per worker.
    fn scan(&self, leaf: &Filter, candidates: Option<&RoaringBitmap>) -> Result<RoaringBitmap> {
        let column = leaf
            .column()
            .ok_or_else(|| Error::invalid("not a column predicate"))?;
        let col = self.table.column_index(column)?;
        let col_type = self.table.type_at(col);
        let workers = rayon::current_num_threads().max(1);

        let test_rows = |rows: &mut dyn Iterator<Item = u32>| -> Result<RoaringBitmap> {
            let mut cell = Vec::new();
            let mut out = RoaringBitmap::new();
            for id in rows {
                let row = self.table.read_row(id as usize)?;
                cell.clear();
                self.table.decode_cell(&row, col, &mut cell)?;
                if leaf.test_cell(&cell, col_type)? {
                    out.insert(id);
                }
            }
            Ok(out)
        };

        let bits = match candidates {
            Some(c) => {
                let ids: Vec<u32> = c.iter().collect();
                let chunk = ids.len().div_ceil(workers).max(1);
                ids.par_chunks(chunk)
                    .map(|part| test_rows(&mut part.iter().copied()))
                    .try_reduce(RoaringBitmap::new, |a, b| Ok(a | b))?
            }
            None => {
                let n = self.table.num_rows() as u32;
                let chunk = (n as usize).div_ceil(workers).max(1) as u32;
                (0..n)
                    .step_by(chunk as usize)
                    .collect::<Vec<_>>()
                    .into_par_iter()
                    .map(|start| test_rows(&mut (start..start.saturating_add(chunk).min(n))))
                    .try_reduce(RoaringBitmap::new, |a, b| Ok(a | b))?
            }
        };
        tracing::debug!(column, matches = bits.len(), "leaf answered by scan");
        Ok(bits)
    }
}

fn pair_operands<'f>(eq: &'f Filter, range: &'f Filter) -> Option<(&'f str, &'f Value, &'f str, &'f Value, &'f Value)> {
    match (eq, range) {
        (
            Filter::Compare {
                column: a,
                op: Operator::Eq,
                value,
            },
            Filter::Range {
                column: b,
                low,
                high,
            },
        ) => Some((a.as_str(), value, b.as_str(), low, high)),
        _ => None,
    }
}
