// SPDX-License-Identifier: AGPL-3.0-or-later

//! Secondary indexes.
//!
//! An index is itself a table file holding `(value [, value2], row_index)` sorted by
//! value. Lookups are boundary searches over the sorted value column followed by a
//! read of the row-index column for the matching position range.

use crate::error::{Error, Result};
use crate::filter::{compare_cell, Filter, Operator};
use crate::options::{worker_pool, BuildOptions, IndexSpec, ReadOptions};
use crate::schema::{parse_cell, ColumnType, Value};
use crate::search::prefix_end;
use crate::storage::Table;
use crate::tablefile::{self, ColumnLayout, RowData, RowLengths, TableLayout};
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::cmp::Ordering;
use std::ops::Range;
use std::path::{Path, PathBuf};

const INDEX_MARKER: &str = ".idx_";
const REVERSED_SUFFIX: &str = ".reversed";
const PAIR_SEPARATOR: &str = "____";
const ROW_INDEX_COLUMN: &str = "row_index";

/// Position ranges at least this long are materialized in parallel.
const PARALLEL_MATERIALIZE_MIN: usize = 1 << 16;

/// Path of the index file described by `spec` for the table at `table`.
pub fn index_path(table: &Path, spec: &IndexSpec) -> PathBuf {
    let mut name = table.as_os_str().to_os_string();
    name.push(INDEX_MARKER);
    match spec {
        IndexSpec::Column(c) => name.push(c),
        IndexSpec::Reversed(c) => {
            name.push(c);
            name.push(REVERSED_SUFFIX);
        }
        IndexSpec::Pair(a, b) => {
            name.push(a);
            name.push(PAIR_SEPARATOR);
            name.push(b);
        }
    }
    PathBuf::from(name)
}

fn parse_index_name(suffix: &str) -> IndexSpec {
    if let Some(col) = suffix.strip_suffix(REVERSED_SUFFIX) {
        IndexSpec::Reversed(col.to_string())
    } else if let Some((a, b)) = suffix.split_once(PAIR_SEPARATOR) {
        IndexSpec::Pair(a.to_string(), b.to_string())
    } else {
        IndexSpec::Column(suffix.to_string())
    }
}

/// Rejects column names whose index file name would read back as a different index.
pub(crate) fn check_indexable(column: &str) -> Result<()> {
    if column.ends_with(REVERSED_SUFFIX) || column.contains(PAIR_SEPARATOR) {
        return Err(Error::invalid(format!(
            "column {column:?} cannot be indexed: its name ends with {REVERSED_SUFFIX:?} or contains {PAIR_SEPARATOR:?}"
        )));
    }
    Ok(())
}

/// Lists the index files present next to the table at `table`, sorted by path.
pub fn indexes(table: impl AsRef<Path>) -> Result<Vec<(IndexSpec, PathBuf)>> {
    let table = table.as_ref();
    let file_name = table
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::invalid(format!("not a table path: {}", table.display())))?;
    let prefix = format!("{file_name}{INDEX_MARKER}");
    let dir = match table.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::from_open(e, dir))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        if suffix.is_empty() || !entry.file_type()?.is_file() {
            continue;
        }
        out.push((parse_index_name(suffix), entry.path()));
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(out)
}

/// Builds the index described by `spec` over the table at `table`.
pub fn build_index(table: impl AsRef<Path>, spec: &IndexSpec, options: &BuildOptions) -> Result<PathBuf> {
    match spec {
        IndexSpec::Column(c) => build_single(table, c, false, options),
        IndexSpec::Reversed(c) => build_single(table, c, true, options),
        IndexSpec::Pair(a, b) => build_pair(table, a, b, options),
    }
}

pub fn build_single(
    table: impl AsRef<Path>,
    column: &str,
    reverse: bool,
    options: &BuildOptions,
) -> Result<PathBuf> {
    let spec = if reverse {
        IndexSpec::Reversed(column.to_string())
    } else {
        IndexSpec::Column(column.to_string())
    };
    write_index(table.as_ref(), &spec, &[column], reverse, options)
}

pub fn build_pair(table: impl AsRef<Path>, first: &str, second: &str, options: &BuildOptions) -> Result<PathBuf> {
    if first == second {
        return Err(Error::invalid("two-column index needs two distinct columns"));
    }
    let spec = IndexSpec::Pair(first.to_string(), second.to_string());
    write_index(table.as_ref(), &spec, &[first, second], false, options)
}

#[derive(Debug)]
struct IndexEntry {
    keys: Vec<(Value, Vec<u8>)>,
    row: u32,
}

fn cmp_entries(a: &IndexEntry, b: &IndexEntry) -> Ordering {
    a.keys
        .iter()
        .zip(&b.keys)
        .map(|((x, _), (y, _))| x.total_cmp(y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.row.cmp(&b.row))
}

fn write_index(
    table_path: &Path,
    spec: &IndexSpec,
    columns: &[&str],
    reverse: bool,
    options: &BuildOptions,
) -> Result<PathBuf> {
    for c in columns {
        check_indexable(c)?;
    }
    let dest = index_path(table_path, spec);
    let _span = tracing::info_span!("build_index", index = %dest.display()).entered();
    let table = Table::open(table_path, ReadOptions::default())?;
    let cols = columns
        .iter()
        .map(|c| table.column_index(c))
        .collect::<Result<Vec<_>>>()?;
    let types: Vec<ColumnType> = cols.iter().map(|&c| table.type_at(c)).collect();
    if reverse && types[0] != ColumnType::Str {
        return Err(Error::invalid(format!(
            "reversed index needs a string column, {} is {}",
            columns[0], types[0]
        )));
    }

    let pool = worker_pool(options.parallelism)?;
    let chunk = table.num_rows().div_ceil(options.parallelism.max(1)).max(1);
    let starts: Vec<usize> = (0..table.num_rows()).step_by(chunk).collect();
    let mut entries = pool.install(|| -> Result<Vec<IndexEntry>> {
        let parts = starts
            .par_iter()
            .map(|&start| {
                let end = (start + chunk).min(table.num_rows());
                let mut out = Vec::with_capacity(end - start);
                let mut cell = Vec::new();
                'rows: for row in start..end {
                    let bytes = table.read_row(row)?;
                    let mut keys = Vec::with_capacity(cols.len());
                    for (&c, &t) in cols.iter().zip(&types) {
                        cell.clear();
                        table.decode_cell(&bytes, c, &mut cell)?;
                        if reverse {
                            cell.reverse();
                            // Sort on the key as it reads back from the padded file.
                            let kept = tablefile::trim_padding(&cell).len();
                            cell.truncate(kept);
                        }
                        // Missing numbers can never match a lookup.
                        let Some(key) = parse_cell(&cell, t)? else {
                            continue 'rows;
                        };
                        keys.push((key, cell.clone()));
                    }
                    out.push(IndexEntry { keys, row: row as u32 });
                }
                Ok(out)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut entries: Vec<IndexEntry> = parts.into_iter().flatten().collect();
        entries.par_sort_unstable_by(cmp_entries);
        Ok(entries)
    })?;

    let mut layout_cols: Vec<ColumnLayout> = columns
        .iter()
        .zip(&types)
        .enumerate()
        .map(|(k, (name, &col_type))| ColumnLayout {
            name: name.to_string(),
            col_type,
            width: entries
                .iter()
                .map(|e| e.keys[k].1.len())
                .max()
                .unwrap_or(0)
                .max(1),
        })
        .collect();
    layout_cols.push(ColumnLayout {
        name: ROW_INDEX_COLUMN.to_string(),
        col_type: ColumnType::Int,
        width: tablefile::digit_width(table.num_rows().saturating_sub(1) as u64),
    });
    let row_width: usize = layout_cols.iter().map(|c| c.width).sum();

    let mut data = Vec::with_capacity(entries.len() * row_width);
    for e in entries.drain(..) {
        for (k, (_, text)) in e.keys.iter().enumerate() {
            tablefile::push_padded(&mut data, text, layout_cols[k].width);
        }
        let row = tablefile::encode_decimal(e.row as u64);
        tablefile::push_padded(&mut data, &row, layout_cols[cols.len()].width);
    }
    let rows = data.len() / row_width;
    let layout = TableLayout {
        columns: layout_cols,
        rows: RowData::Bytes(data),
        lengths: RowLengths::Fixed(row_width),
        cmpr: None,
    };
    let bytes = tablefile::write_table_file(&dest, layout)?;
    tracing::info!(rows, bytes, "index written");
    Ok(dest)
}

/// An opened index file bound to the table it indexes.
pub(crate) struct Index {
    file: Table,
    keys: usize,
    table_rows: usize,
}

impl Index {
    /// Opens the index at `path` if it exists and still matches the table's column types.
    pub(crate) fn open(
        path: &Path,
        table: &Table,
        columns: &[&str],
        read: ReadOptions,
    ) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let file = Table::open(path, read)?;
        if file.num_columns() != columns.len() + 1 {
            return Err(Error::corrupt(format!("index {} has wrong shape", path.display())));
        }
        for (k, c) in columns.iter().enumerate() {
            if file.type_at(k) != table.column_type(c)? {
                tracing::warn!(index = %path.display(), "index type differs from table, ignoring");
                return Ok(None);
            }
        }
        Ok(Some(Self {
            file,
            keys: columns.len(),
            table_rows: table.num_rows(),
        }))
    }

    fn len(&self) -> usize {
        self.file.num_rows()
    }

    fn key_cell(&self, pos: usize, k: usize, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        let row = self.file.read_row(pos)?;
        self.file.decode_cell(&row, k, out)
    }

    fn key_cmp(&self, pos: usize, k: usize, value: &Value, buf: &mut Vec<u8>) -> Result<Ordering> {
        self.key_cell(pos, k, buf)?;
        compare_cell(buf, self.file.type_at(k), value)?
            .ok_or_else(|| Error::corrupt("blank key in index"))
    }

    /// End of the prefix of `range` whose key `k` satisfies `op` against `value`.
    fn boundary(&self, range: Range<usize>, k: usize, value: &Value, op: Operator) -> Result<usize> {
        let mut buf = Vec::new();
        prefix_end(range.start, range.end, |pos| {
            Ok(op.holds(self.key_cmp(pos, k, value, &mut buf)?))
        })
    }

    /// Positions whose first key equals `value`.
    fn equal_range(&self, value: &Value) -> Result<Range<usize>> {
        let lo = self.boundary(0..self.len(), 0, value, Operator::Lt)?;
        let hi = self.boundary(lo..self.len(), 0, value, Operator::Le)?;
        Ok(lo..hi)
    }

    fn prefix_range(&self, prefix: &[u8]) -> Result<Range<usize>> {
        let lo = self.boundary(0..self.len(), 0, &Value::Str(prefix.to_vec()), Operator::Lt)?;
        let mut buf = Vec::new();
        let hi = prefix_end(lo, self.len(), |pos| {
            self.key_cell(pos, 0, &mut buf)?;
            Ok(buf.starts_with(prefix))
        })?;
        Ok(lo..hi)
    }

    fn row_id(&self, pos: usize, buf: &mut Vec<u8>) -> Result<u32> {
        self.key_cell(pos, self.keys, buf)?;
        let row = tablefile::parse_decimal(buf)? as usize;
        if row >= self.table_rows {
            return Err(Error::corrupt("index row points past the end of the table"));
        }
        Ok(row as u32)
    }

    /// Row ids stored at `range`; runs in parallel on the current pool for long ranges.
    fn rows(&self, range: Range<usize>) -> Result<RoaringBitmap> {
        let collect = |r: Range<usize>| -> Result<RoaringBitmap> {
            let mut buf = Vec::new();
            let mut ids = Vec::with_capacity(r.len());
            for pos in r {
                ids.push(self.row_id(pos, &mut buf)?);
            }
            ids.sort_unstable();
            Ok(ids.into_iter().collect())
        };
        if range.len() < PARALLEL_MATERIALIZE_MIN {
            return collect(range);
        }
        let chunk = range.len().div_ceil(rayon::current_num_threads()).max(1);
        (range.start..range.end)
            .step_by(chunk)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|s| collect(s..(s + chunk).min(range.end)))
            .try_reduce(RoaringBitmap::new, |a, b| Ok(a | b))
    }

    /// Rows whose key passes `keep`, testing every position of the value column.
    fn scan_keys<F>(&self, keep: F) -> Result<RoaringBitmap>
    where
        F: Fn(&[u8]) -> Result<bool> + Sync,
    {
        let n = self.len();
        let chunk = n.div_ceil(rayon::current_num_threads()).max(1);
        (0..n)
            .step_by(chunk)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|s| {
                let mut buf = Vec::new();
                let mut out = RoaringBitmap::new();
                for pos in s..(s + chunk).min(n) {
                    self.key_cell(pos, 0, &mut buf)?;
                    if keep(&buf)? {
                        out.insert(self.row_id(pos, &mut buf)?);
                    }
                }
                Ok(out)
            })
            .try_reduce(RoaringBitmap::new, |a, b| Ok(a | b))
    }

    /// Evaluates a leaf filter over this single-column index.
    pub(crate) fn lookup(&self, filter: &Filter) -> Result<RoaringBitmap> {
        let n = self.len();
        match filter {
            Filter::Compare { op, value, .. } => {
                let eq = self.equal_range(value)?;
                match op {
                    Operator::Eq => self.rows(eq),
                    Operator::Ne => Ok(self.rows(0..eq.start)? | self.rows(eq.end..n)?),
                    Operator::Lt => self.rows(0..eq.start),
                    Operator::Le => self.rows(0..eq.end),
                    Operator::Gt => self.rows(eq.end..n),
                    Operator::Ge => self.rows(eq.start..n),
                }
            }
            Filter::Range { low, high, .. } => {
                let lo = self.boundary(0..n, 0, low, Operator::Lt)?;
                let hi = self.boundary(lo..n, 0, high, Operator::Le)?;
                self.rows(lo..hi)
            }
            Filter::StartsWith { prefix, .. } => self.rows(self.prefix_range(prefix)?),
            Filter::EndsWith { suffix, .. } => {
                let reversed: Vec<u8> = suffix.iter().rev().copied().collect();
                self.rows(self.prefix_range(&reversed)?)
            }
            Filter::Like { .. } => {
                let col_type = self.file.type_at(0);
                self.scan_keys(|key| filter.test_cell(key, col_type))
            }
            _ => Err(Error::invalid("filter cannot be answered from an index")),
        }
    }

    /// Rows where the first key equals `value` and the second lies in `[low, high]`.
    pub(crate) fn lookup_pair(&self, value: &Value, low: &Value, high: &Value) -> Result<RoaringBitmap> {
        let eq = self.equal_range(value)?;
        let lo = self.boundary(eq.clone(), 1, low, Operator::Lt)?;
        let hi = self.boundary(lo..eq.end, 1, high, Operator::Le)?;
        self.rows(lo..hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;
    use std::io::Cursor;

    const FIXTURE: &str = "ID\tIntA\tCategoricalB\tScore\n\
A\t5\tlow\t1.5\n\
B\t7\thigh\t\n\
C\t6\tlow\t-2\n\
D\t5\tmedium\t0\n\
E\t6\tglow\t9.25\n";

    fn fixture(dir: &Path) -> (PathBuf, BuildOptions) {
        let dest = dir.join("t.nc");
        let opts = BuildOptions {
            parallelism: 2,
            ..Default::default()
        };
        builder::build(Cursor::new(FIXTURE), &dest, &opts).unwrap();
        (dest, opts)
    }

    fn ids(bitmap: RoaringBitmap) -> Vec<u32> {
        bitmap.iter().collect()
    }

    fn open(path: &Path, table: &Table, cols: &[&str]) -> Index {
        Index::open(path, table, cols, ReadOptions::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_index_naming() {
        let t = Path::new("/data/t.nc");
        assert_eq!(
            index_path(t, &IndexSpec::Column("a".into())),
            PathBuf::from("/data/t.nc.idx_a")
        );
        assert_eq!(
            index_path(t, &IndexSpec::Reversed("a".into())),
            PathBuf::from("/data/t.nc.idx_a.reversed")
        );
        assert_eq!(
            index_path(t, &IndexSpec::Pair("a".into(), "b".into())),
            PathBuf::from("/data/t.nc.idx_a____b")
        );
        assert_eq!(parse_index_name("a____b"), IndexSpec::Pair("a".into(), "b".into()));
        assert_eq!(parse_index_name("x.reversed"), IndexSpec::Reversed("x".into()));
    }

    #[test]
    fn test_index_file_is_sorted_and_skips_blank_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        let path = build_single(&table_path, "Score", false, &opts).unwrap();
        let index = Table::open(&path, ReadOptions::default()).unwrap();
        assert_eq!(index.num_rows(), 4);
        let keys: Vec<Vec<u8>> = (0..4).map(|i| index.cell(i, 0).unwrap()).collect();
        assert_eq!(keys, vec![b"-2".to_vec(), b"0".to_vec(), b"1.5".to_vec(), b"9.25".to_vec()]);
        let rows: Vec<Vec<u8>> = (0..4).map(|i| index.cell(i, 1).unwrap()).collect();
        assert_eq!(rows, vec![b"2".to_vec(), b"3".to_vec(), b"0".to_vec(), b"4".to_vec()]);
    }

    #[test]
    fn test_single_index_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        let table = Table::open(&table_path, ReadOptions::default()).unwrap();
        let path = build_single(&table_path, "IntA", false, &opts).unwrap();
        let index = open(&path, &table, &["IntA"]);

        let cmp = |op, v| ids(index.lookup(&Filter::compare("IntA", op, Value::Int(v))).unwrap());
        assert_eq!(cmp(Operator::Eq, 5), vec![0, 3]);
        assert_eq!(cmp(Operator::Ne, 5), vec![1, 2, 4]);
        assert_eq!(cmp(Operator::Lt, 6), vec![0, 3]);
        assert_eq!(cmp(Operator::Le, 6), vec![0, 2, 3, 4]);
        assert_eq!(cmp(Operator::Gt, 6), vec![1]);
        assert_eq!(cmp(Operator::Ge, 7), vec![1]);
        assert_eq!(cmp(Operator::Eq, 4), Vec::<u32>::new());
        assert_eq!(cmp(Operator::Gt, 100), Vec::<u32>::new());

        let range = |lo, hi| {
            ids(index
                .lookup(&Filter::range("IntA", Value::Int(lo), Value::Int(hi)).unwrap())
                .unwrap())
        };
        assert_eq!(range(5, 6), vec![0, 2, 3, 4]);
        assert_eq!(range(6, 6), vec![2, 4]);
        assert_eq!(range(-10, 4), Vec::<u32>::new());
        assert_eq!(range(0, 100), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_string_and_reversed_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        let table = Table::open(&table_path, ReadOptions::default()).unwrap();
        let plain = build_single(&table_path, "CategoricalB", false, &opts).unwrap();
        let reversed = build_single(&table_path, "CategoricalB", true, &opts).unwrap();
        let plain = open(&plain, &table, &["CategoricalB"]);
        let reversed = open(&reversed, &table, &["CategoricalB"]);

        assert_eq!(ids(plain.lookup(&Filter::starts_with("CategoricalB", "lo")).unwrap()), vec![0, 2]);
        assert_eq!(ids(plain.lookup(&Filter::starts_with("CategoricalB", "")).unwrap()), vec![0, 1, 2, 3, 4]);
        assert_eq!(ids(reversed.lookup(&Filter::ends_with("CategoricalB", "ow")).unwrap()), vec![0, 2, 4]);
        assert_eq!(
            ids(plain.lookup(&Filter::like("CategoricalB", "i.h").unwrap()).unwrap()),
            vec![1]
        );
        assert_eq!(
            ids(plain.lookup(&Filter::not_like("CategoricalB", "ow$").unwrap()).unwrap()),
            vec![1, 3]
        );
    }

    #[test]
    fn test_pair_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        let table = Table::open(&table_path, ReadOptions::default()).unwrap();
        let path = build_pair(&table_path, "CategoricalB", "IntA", &opts).unwrap();
        let index = open(&path, &table, &["CategoricalB", "IntA"]);
        let got = index
            .lookup_pair(&Value::str("low"), &Value::Int(5), &Value::Int(6))
            .unwrap();
        assert_eq!(ids(got), vec![0, 2]);
        let got = index
            .lookup_pair(&Value::str("low"), &Value::Int(6), &Value::Int(9))
            .unwrap();
        assert_eq!(ids(got), vec![2]);
        let got = index
            .lookup_pair(&Value::str("none"), &Value::Int(0), &Value::Int(9))
            .unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_reversed_index_requires_string_column() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        assert!(matches!(
            build_single(&table_path, "IntA", true, &opts),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            build_single(&table_path, "Nope", false, &opts),
            Err(Error::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_names_that_clash_with_index_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table_path = dir.path().join("n.nc");
        let opts = BuildOptions::default();
        builder::build(Cursor::new("a____b\tx.reversed\tok\n1\t2\t3\n"), &table_path, &opts).unwrap();
        for (col, reverse) in [("a____b", false), ("x.reversed", false), ("x.reversed", true)] {
            assert!(matches!(
                build_single(&table_path, col, reverse, &opts),
                Err(Error::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            build_pair(&table_path, "ok", "x.reversed", &opts),
            Err(Error::InvalidArgument(_))
        ));
        assert!(build_single(&table_path, "ok", false, &opts).is_ok());
        assert!(indexes(&table_path).unwrap().len() == 1);

        let with_bad_index = BuildOptions {
            index_columns: vec![IndexSpec::Column("a____b".into())],
            ..Default::default()
        };
        let err = builder::build(Cursor::new("a____b\n1\n"), dir.path().join("m.nc"), &with_bad_index);
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_list_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let (table_path, opts) = fixture(dir.path());
        assert!(indexes(&table_path).unwrap().is_empty());
        build_single(&table_path, "IntA", false, &opts).unwrap();
        build_single(&table_path, "ID", true, &opts).unwrap();
        build_pair(&table_path, "ID", "IntA", &opts).unwrap();
        let specs: Vec<IndexSpec> = indexes(&table_path).unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            specs,
            vec![
                IndexSpec::Reversed("ID".into()),
                IndexSpec::Pair("ID".into(), "IntA".into()),
                IndexSpec::Column("IntA".into()),
            ]
        );
    }
}
