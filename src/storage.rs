// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::compressor::{decompress_block, CompressionMeta, DictKind, Dictionary};
use crate::error::{Error, Result};
use crate::options::ReadOptions;
use crate::schema::{parse_cell, Column, ColumnType, Compression, Value};
use crate::search;
use crate::tablefile::{
    self, ByteRange, DigitTable, SectionMap, KEY_CC, KEY_CMPR, KEY_CN_CC, KEY_CN_DATA, KEY_CN_LL,
    KEY_CN_MCCL, KEY_CT, KEY_DATA, KEY_LL, KEY_MCCL, KEY_MCTL, KEY_MLL,
};
use memmap2::{Mmap, MmapOptions};
use std::borrow::Cow;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};

enum FileBuffer {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RowLayout {
    Fixed,
    /// Offsets into `data` of each compressed row, `num_rows + 1` entries.
    Blocks { offsets: ByteRange, width: usize },
}

/// The column-name lookup table: rows of (padded name, position) sorted by name.
#[derive(Debug, Clone, Copy)]
struct NameTable {
    data: ByteRange,
    row_len: usize,
    name_end: usize,
    len: usize,
}

/// A read-only view of a table file (or index file).
pub struct Table {
    path: PathBuf,
    buf: FileBuffer,
    data: ByteRange,
    layout: RowLayout,
    num_rows: usize,
    /// `num_columns + 1` start coordinates, the last one is the row width.
    coords: Vec<usize>,
    types: Vec<ColumnType>,
    compression: Vec<Compression>,
    dictionaries: Vec<Option<Dictionary>>,
    names: NameTable,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("num_rows", &self.num_rows)
            .field("num_columns", &self.types.len())
            .finish()
    }
}

impl Table {
    pub fn open(path: impl AsRef<Path>, options: ReadOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| Error::from_open(e, &path))?;
        let len = file.metadata()?.len();
        let buf = if options.use_memory_mapping && len > 0 {
            FileBuffer::Mapped(unsafe { MmapOptions::new().map(&file)? })
        } else {
            let mut v = Vec::with_capacity(len as usize);
            file.read_to_end(&mut v)?;
            FileBuffer::Owned(v)
        };
        let table = Self::parse(path, buf)?;
        tracing::debug!(
            path = %table.path.display(),
            rows = table.num_rows,
            columns = table.num_columns(),
            "table opened"
        );
        Ok(table)
    }

    fn parse(path: PathBuf, buf: FileBuffer) -> Result<Self> {
        let map = tablefile::read_section_map(&buf)?;
        let decimal = |key: &str| -> Result<usize> {
            Ok(tablefile::parse_decimal(map.require(key)?.slice(&buf))? as usize)
        };

        let data = map.require(KEY_DATA)?;
        let coords = DigitTable::new(map.require(KEY_CC)?.slice(&buf), decimal(KEY_MCCL)?)?.to_vec()?;
        if coords.first() != Some(&0) || coords.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::corrupt("column coordinates are not ascending from 0"));
        }
        let num_columns = coords.len() - 1;
        if num_columns == 0 {
            return Err(Error::corrupt("table has no columns"));
        }
        let row_width = coords[num_columns];

        let mctl = decimal(KEY_MCTL)?;
        let ct = map.require(KEY_CT)?.slice(&buf);
        if mctl == 0 || num_columns.checked_mul(mctl) != Some(ct.len()) {
            return Err(Error::corrupt("column type table size mismatch"));
        }
        let types = ct
            .chunks(mctl)
            .map(|tag| ColumnType::from_tag(tag[0]).ok_or_else(|| Error::corrupt("unknown column type tag")))
            .collect::<Result<Vec<_>>>()?;

        let (layout, num_rows) = match map.get(KEY_MLL) {
            Some(_) => {
                let width = decimal(KEY_MLL)?;
                let offsets = map.require(KEY_LL)?;
                let table = DigitTable::new(offsets.slice(&buf), width)?;
                if table.is_empty() || table.get(0)? != 0 || table.get(table.len() - 1)? as usize != data.len() {
                    return Err(Error::corrupt("row offset table does not span the data section"));
                }
                (RowLayout::Blocks { offsets, width }, table.len() - 1)
            }
            None => {
                if decimal(KEY_LL)? != row_width {
                    return Err(Error::corrupt("row length disagrees with column coordinates"));
                }
                if row_width == 0 || data.len() % row_width != 0 {
                    return Err(Error::corrupt("data section is not a whole number of rows"));
                }
                (RowLayout::Fixed, data.len() / row_width)
            }
        };
        if num_rows > u32::MAX as usize {
            return Err(Error::invalid("tables are limited to u32::MAX rows"));
        }

        let names = Self::parse_name_table(&map, &buf, num_columns)?;
        let mut table = Self {
            path,
            buf,
            data,
            layout,
            num_rows,
            coords,
            types,
            compression: vec![Compression::None; num_columns],
            dictionaries: vec![None; num_columns],
            names,
        };

        match map.get(KEY_CMPR) {
            None if matches!(layout, RowLayout::Blocks { .. }) => {
                return Err(Error::corrupt("row offsets without block compression marker"));
            }
            None => {}
            Some(range) => match CompressionMeta::decode(range.slice(&table.buf))? {
                CompressionMeta::Block => {
                    if !matches!(layout, RowLayout::Blocks { .. }) {
                        return Err(Error::corrupt("block compression without row offsets"));
                    }
                    table.compression.fill(Compression::Block);
                }
                CompressionMeta::Dictionaries(dicts) => {
                    if matches!(layout, RowLayout::Blocks { .. }) {
                        return Err(Error::corrupt("dictionaries in a block compressed table"));
                    }
                    for (name, dict) in dicts {
                        let col = table
                            .find_column(&name)?
                            .ok_or_else(|| Error::corrupt(format!("dictionary for unknown column {name}")))?;
                        table.compression[col] = match dict.kind() {
                            DictKind::Categorical => Compression::Categorical,
                            DictKind::Bigram => Compression::Bigram,
                        };
                        table.dictionaries[col] = Some(dict);
                    }
                }
            },
        }
        Ok(table)
    }

    fn parse_name_table(map: &SectionMap, buf: &[u8], num_columns: usize) -> Result<NameTable> {
        let width = tablefile::parse_decimal(map.require(KEY_CN_MCCL)?.slice(buf))? as usize;
        let cc = DigitTable::new(map.require(KEY_CN_CC)?.slice(buf), width)?;
        let row_len = tablefile::parse_decimal(map.require(KEY_CN_LL)?.slice(buf))? as usize;
        if cc.len() != 3 || cc.get(0)? != 0 || cc.get(2)? as usize != row_len {
            return Err(Error::corrupt("column name table coordinates"));
        }
        let name_end = cc.get(1)? as usize;
        let data = map.require(KEY_CN_DATA)?;
        if name_end >= row_len || row_len.checked_mul(num_columns) != Some(data.len()) {
            return Err(Error::corrupt("column name table size mismatch"));
        }
        Ok(NameTable {
            data,
            row_len,
            name_end,
            len: num_columns,
        })
    }

    /// Name and column position stored in row `i` of the name table.
    fn name_entry(&self, i: usize) -> Result<(&[u8], usize)> {
        let t = &self.names;
        let start = t.data.start + i * t.row_len;
        let row = &self.buf[start..start + t.row_len];
        let name = tablefile::trim_padding(&row[..t.name_end]);
        let pos = tablefile::parse_decimal(&row[t.name_end..])? as usize;
        if pos >= self.types.len() {
            return Err(Error::corrupt("column name table points past the last column"));
        }
        Ok((name, pos))
    }

    fn find_column(&self, name: &str) -> Result<Option<usize>> {
        let found = search::find_exact(0, self.names.len, |i| {
            Ok(self.name_entry(i)?.0.cmp(name.as_bytes()))
        })?;
        found.map(|i| self.name_entry(i).map(|(_, pos)| pos)).transpose()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.types.len()
    }

    pub fn row_width(&self) -> usize {
        self.coords[self.types.len()]
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.find_column(name)?
            .ok_or_else(|| Error::UnknownColumn(name.to_string()))
    }

    /// Column names in column order.
    pub fn column_names(&self) -> Result<Vec<String>> {
        let mut names = vec![None; self.num_columns()];
        for i in 0..self.names.len {
            let (name, pos) = self.name_entry(i)?;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| Error::corrupt("column name is not utf-8"))?;
            if names[pos].replace(name).is_some() {
                return Err(Error::corrupt("two names for one column"));
            }
        }
        names
            .into_iter()
            .map(|n| n.ok_or_else(|| Error::corrupt("column without a name")))
            .collect()
    }

    pub fn column(&self, name: &str) -> Result<Column> {
        let i = self.column_index(name)?;
        Ok(Column {
            name: name.to_string(),
            col_type: self.types[i],
            compression: self.compression[i],
            start: self.coords[i],
            end: self.coords[i + 1],
        })
    }

    pub fn column_type(&self, name: &str) -> Result<ColumnType> {
        Ok(self.types[self.column_index(name)?])
    }

    pub fn compression(&self, name: &str) -> Result<Compression> {
        Ok(self.compression[self.column_index(name)?])
    }

    pub(crate) fn type_at(&self, col: usize) -> ColumnType {
        self.types[col]
    }

    /// Raw bytes of one row, decompressed when the table is block compressed.
    pub fn read_row(&self, row: usize) -> Result<Cow<'_, [u8]>> {
        if row >= self.num_rows {
            return Err(Error::invalid(format!("row {row} out of range")));
        }
        let data = self.data.slice(&self.buf);
        match self.layout {
            RowLayout::Fixed => {
                let w = self.row_width();
                Ok(Cow::Borrowed(&data[row * w..(row + 1) * w]))
            }
            RowLayout::Blocks { offsets, width } => {
                let table = DigitTable::new(offsets.slice(&self.buf), width)?;
                let start = table.get(row)? as usize;
                let end = table.get(row + 1)? as usize;
                if start > end || end > data.len() {
                    return Err(Error::corrupt(format!("row {row} block out of bounds")));
                }
                decompress_block(&data[start..end], self.row_width()).map(Cow::Owned)
            }
        }
    }

    /// Appends the decoded value of column `col` from `row_bytes` to `out`.
    pub fn decode_cell(&self, row_bytes: &[u8], col: usize, out: &mut Vec<u8>) -> Result<()> {
        let cell = tablefile::trim_padding(&row_bytes[self.coords[col]..self.coords[col + 1]]);
        match &self.dictionaries[col] {
            Some(dict) => dict.decode_into(cell, out),
            None => {
                out.extend_from_slice(cell);
                Ok(())
            }
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Result<Vec<u8>> {
        let bytes = self.read_row(row)?;
        let mut out = Vec::new();
        self.decode_cell(&bytes, col, &mut out)?;
        Ok(out)
    }

    /// Typed value of a cell; `None` for a blank numeric cell.
    pub fn value(&self, row: usize, col: usize) -> Result<Option<Value>> {
        parse_cell(&self.cell(row, col)?, self.types[col])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;
    use crate::options::{BuildOptions, CompressionMode};
    use std::io::Cursor;

    const FIXTURE: &str = "ID\tIntA\tFloatB\tCategoricalB\n\
A\t5\t1.5\tlow\n\
B\t7\t\thigh\n\
C\t6\t2\tlow\n\
D\t5\t-1\tmedium\n\
E\t6\t0.25\tlow\n";

    fn fixture(dir: &Path, mode: CompressionMode) -> PathBuf {
        let dest = dir.join(format!("fixture_{mode:?}.nc"));
        let opts = BuildOptions {
            compression: mode,
            parallelism: 2,
            ..Default::default()
        };
        builder::build(Cursor::new(FIXTURE), &dest, &opts).unwrap();
        dest
    }

    #[test]
    fn test_open_reads_schema() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::open(fixture(dir.path(), CompressionMode::None), ReadOptions::default()).unwrap();
        assert_eq!(table.num_rows(), 5);
        assert_eq!(table.num_columns(), 4);
        assert_eq!(table.column_names().unwrap(), vec!["ID", "IntA", "FloatB", "CategoricalB"]);
        assert_eq!(table.column_type("FloatB").unwrap(), ColumnType::Float);
        let col = table.column("IntA").unwrap();
        assert_eq!((col.start, col.end), (1, 2));
        assert!(matches!(table.column("nope"), Err(Error::UnknownColumn(_))));
    }

    #[test]
    fn test_cells_decode_in_every_mode() {
        let dir = tempfile::tempdir().unwrap();
        for mode in [CompressionMode::None, CompressionMode::Dictionary, CompressionMode::Block] {
            for mapped in [true, false] {
                let table = Table::open(
                    fixture(dir.path(), mode),
                    ReadOptions {
                        use_memory_mapping: mapped,
                    },
                )
                .unwrap();
                assert_eq!(table.cell(3, 3).unwrap(), b"medium");
                assert_eq!(table.cell(1, 0).unwrap(), b"B");
                assert_eq!(table.value(1, 1).unwrap(), Some(Value::Int(7)));
                assert_eq!(table.value(1, 2).unwrap(), None);
                assert_eq!(table.value(4, 2).unwrap(), Some(Value::Float(0.25)));
                assert!(table.read_row(5).is_err());
            }
        }
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Table::open(dir.path().join("absent.nc"), ReadOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_damaged_files_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path(), CompressionMode::None);
        let bytes = std::fs::read(&path).unwrap();

        let damaged = dir.path().join("damaged.nc");
        for cut in [0, 3, bytes.len() / 2, bytes.len() - 1] {
            std::fs::write(&damaged, &bytes[..cut]).unwrap();
            let err = Table::open(&damaged, ReadOptions::default()).unwrap_err();
            assert!(matches!(err, Error::Corrupt(_)), "cut at {cut}: {err:?}");
        }

        std::fs::write(&damaged, b"not a table file at all").unwrap();
        assert!(matches!(
            Table::open(&damaged, ReadOptions::default()),
            Err(Error::Corrupt(_))
        ));
    }

    fn raw_table(dir: &Path, sections: &[(&str, Vec<u8>)]) -> PathBuf {
        let sizes: Vec<(&str, usize)> = sections.iter().map(|(k, v)| (*k, v.len())).collect();
        let (mut file, _) = tablefile::negotiate_header(&sizes).unwrap();
        for (_, bytes) in sections {
            file.extend_from_slice(bytes);
        }
        let path = dir.join("raw.nc");
        std::fs::write(&path, file).unwrap();
        path
    }

    #[test]
    fn test_huge_sizes_in_header_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let names = || {
            vec![
                (KEY_CN_DATA, b"x0y1".to_vec()),
                (KEY_CN_CC, b"012".to_vec()),
                (KEY_CN_MCCL, b"1".to_vec()),
                (KEY_CN_LL, b"2".to_vec()),
            ]
        };
        let base = |mctl: &[u8]| {
            let mut s = vec![
                (KEY_DATA, b"ab".to_vec()),
                (KEY_CC, b"012".to_vec()),
                (KEY_MCCL, b"1".to_vec()),
                (KEY_CT, b"ss".to_vec()),
                (KEY_MCTL, mctl.to_vec()),
                (KEY_LL, b"2".to_vec()),
            ];
            s.extend(names());
            s
        };
        let path = raw_table(dir.path(), &base(b"1"));
        let table = Table::open(&path, ReadOptions::default()).unwrap();
        assert_eq!(table.cell(0, 1).unwrap(), b"b");

        let path = raw_table(dir.path(), &base(u64::MAX.to_string().as_bytes()));
        assert!(matches!(Table::open(&path, ReadOptions::default()), Err(Error::Corrupt(_))));

        let mut sections = base(b"1");
        sections.retain(|(k, _)| !k.starts_with("cn"));
        sections.extend([
            (KEY_CN_DATA, b"x0y1".to_vec()),
            (KEY_CN_CC, format!("{:020}{:020}{}", 0, 1, u64::MAX).into_bytes()),
            (KEY_CN_MCCL, b"20".to_vec()),
            (KEY_CN_LL, u64::MAX.to_string().into_bytes()),
        ]);
        let path = raw_table(dir.path(), &sections);
        assert!(matches!(Table::open(&path, ReadOptions::default()), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_oversized_block_row_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let block = crate::compressor::compress_block(b"abc").unwrap();
        let width = 10u64.pow(18);
        let mut sections = vec![
            (KEY_DATA, block.clone()),
            (KEY_CC, format!("{:019}{width}", 0).into_bytes()),
            (KEY_MCCL, b"19".to_vec()),
            (KEY_CT, b"s".to_vec()),
            (KEY_MCTL, b"1".to_vec()),
            (KEY_LL, format!("{:03}{:03}", 0, block.len()).into_bytes()),
            (KEY_MLL, b"3".to_vec()),
            (KEY_CN_DATA, b"x0".to_vec()),
            (KEY_CN_CC, b"012".to_vec()),
            (KEY_CN_MCCL, b"1".to_vec()),
            (KEY_CN_LL, b"2".to_vec()),
        ];
        sections.push((KEY_CMPR, CompressionMeta::Block.encode()));
        let path = raw_table(dir.path(), &sections);
        let table = Table::open(&path, ReadOptions::default()).unwrap();
        assert!(matches!(table.read_row(0), Err(Error::Corrupt(_))));
    }
}
