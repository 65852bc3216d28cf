// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of a table file:
//!
//! ```text
//! <decimal map length>\n<section map><section bytes...>
//! ```
//!
//! The section map is a JSON object from section key to an absolute `[start, end)`
//! byte range. Because the ranges include the header itself, the map is sized by a
//! fixed-point loop in [`negotiate_header`].

use crate::error::{Error, Result};
use crate::schema::ColumnType;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const KEY_DATA: &str = "data";
pub const KEY_CC: &str = "cc";
pub const KEY_MCCL: &str = "mccl";
pub const KEY_LL: &str = "ll";
pub const KEY_MLL: &str = "mll";
pub const KEY_CT: &str = "ct";
pub const KEY_MCTL: &str = "mctl";
pub const KEY_CMPR: &str = "cmpr";
pub const KEY_CN_DATA: &str = "cndata";
pub const KEY_CN_CC: &str = "cncc";
pub const KEY_CN_MCCL: &str = "cnmccl";
pub const KEY_CN_LL: &str = "cnll";

const MAX_PREFIX_DIGITS: usize = 20;
const MAX_NEGOTIATION_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionMap {
    ranges: BTreeMap<String, ByteRange>,
}

impl SectionMap {
    pub fn get(&self, key: &str) -> Option<ByteRange> {
        self.ranges.get(key).copied()
    }

    pub fn require(&self, key: &str) -> Result<ByteRange> {
        self.get(key)
            .ok_or_else(|| Error::corrupt(format!("missing section {key}")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ranges.keys().map(String::as_str)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let plain: BTreeMap<&str, [u64; 2]> = self
            .ranges
            .iter()
            .map(|(k, r)| (k.as_str(), [r.start as u64, r.end as u64]))
            .collect();
        serde_json::to_vec(&plain).map_err(|e| Error::Io(e.into()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let plain: BTreeMap<String, [u64; 2]> = serde_json::from_slice(bytes)
            .map_err(|e| Error::corrupt(format!("section map: {e}")))?;
        let mut ranges = BTreeMap::new();
        for (key, [start, end]) in plain {
            let start = usize::try_from(start)
                .map_err(|_| Error::corrupt("section offset overflow"))?;
            let end = usize::try_from(end)
                .map_err(|_| Error::corrupt("section offset overflow"))?;
            ranges.insert(key, ByteRange { start, end });
        }
        Ok(Self { ranges })
    }
}

/// Parses the length prefix and section map of a table file and validates every range.
pub fn read_section_map(buf: &[u8]) -> Result<SectionMap> {
    let newline = buf
        .iter()
        .take(MAX_PREFIX_DIGITS + 1)
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::corrupt("missing length prefix"))?;
    let map_len = parse_decimal(&buf[..newline])? as usize;
    let map_start = newline + 1;
    let map_end = map_start
        .checked_add(map_len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Error::corrupt("section map out of bounds"))?;
    let map = SectionMap::decode(&buf[map_start..map_end])?;
    for (key, range) in &map.ranges {
        if range.start > range.end || range.start < map_end || range.end > buf.len() {
            return Err(Error::corrupt(format!(
                "section {key} range {}..{} out of bounds",
                range.start, range.end
            )));
        }
    }
    Ok(map)
}

/// Finds a header whose section offsets account for the header's own length.
///
/// Each round serializes the map with offsets based on the previous round's header
/// length. Digit counts only grow with the offsets, so this settles quickly.
pub fn negotiate_header(sections: &[(&str, usize)]) -> Result<(Vec<u8>, SectionMap)> {
    negotiate_header_within(sections, MAX_NEGOTIATION_ROUNDS)
}

fn negotiate_header_within(sections: &[(&str, usize)], rounds: usize) -> Result<(Vec<u8>, SectionMap)> {
    let mut header_len = 0usize;
    for _ in 0..rounds {
        let mut ranges = BTreeMap::new();
        let mut offset = header_len;
        for (key, len) in sections {
            ranges.insert(
                (*key).to_string(),
                ByteRange {
                    start: offset,
                    end: offset + len,
                },
            );
            offset += len;
        }
        let map = SectionMap { ranges };
        let encoded = map.encode()?;
        let mut header = format!("{}\n", encoded.len()).into_bytes();
        header.extend_from_slice(&encoded);
        if header.len() == header_len {
            return Ok((header, map));
        }
        header_len = header.len();
    }
    Err(Error::corrupt(format!(
        "section map size did not converge in {rounds} rounds"
    )))
}

pub fn encode_decimal(v: u64) -> Vec<u8> {
    v.to_string().into_bytes()
}

pub fn parse_decimal(bytes: &[u8]) -> Result<u64> {
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return Err(Error::corrupt("expected decimal digits"));
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::corrupt("decimal overflow"))
}

pub fn digit_width(v: u64) -> usize {
    let mut n = 1usize;
    let mut v = v;
    while v >= 10 {
        v /= 10;
        n += 1;
    }
    n
}

/// Encodes values as zero-padded decimals of one shared width.
pub fn encode_digit_table(values: &[u64]) -> (Vec<u8>, usize) {
    let width = values.iter().copied().map(digit_width).max().unwrap_or(1);
    let mut out = Vec::with_capacity(values.len() * width);
    for v in values {
        out.extend_from_slice(format!("{v:0width$}").as_bytes());
    }
    (out, width)
}

/// Read view over a zero-padded decimal table.
#[derive(Debug, Clone, Copy)]
pub struct DigitTable<'a> {
    bytes: &'a [u8],
    width: usize,
}

impl<'a> DigitTable<'a> {
    pub fn new(bytes: &'a [u8], width: usize) -> Result<Self> {
        if width == 0 || width > MAX_PREFIX_DIGITS || bytes.len() % width != 0 {
            return Err(Error::corrupt("digit table width mismatch"));
        }
        Ok(Self { bytes, width })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, i: usize) -> Result<u64> {
        let start = i * self.width;
        if start + self.width > self.bytes.len() {
            return Err(Error::corrupt("digit table index out of bounds"));
        }
        parse_decimal(&self.bytes[start..start + self.width])
    }

    pub fn to_vec(&self) -> Result<Vec<usize>> {
        (0..self.len()).map(|i| self.get(i).map(|v| v as usize)).collect()
    }
}

/// Strips the space padding that follows a cell's value.
pub fn trim_padding(cell: &[u8]) -> &[u8] {
    let end = cell
        .iter()
        .rposition(|&b| b != b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    &cell[..end]
}

/// Appends `value` padded with spaces to `width` bytes.
pub fn push_padded(out: &mut Vec<u8>, value: &[u8], width: usize) {
    debug_assert!(value.len() <= width);
    out.extend_from_slice(value);
    out.resize(out.len() + (width - value.len()), b' ');
}

/// Row bytes of a table being assembled.
#[derive(Debug)]
pub enum RowData {
    Bytes(Vec<u8>),
    /// Ordered segment files written by parallel workers.
    Segments(Vec<(PathBuf, u64)>),
}

impl RowData {
    fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Segments(segs) => segs.iter().map(|(_, len)| *len as usize).sum(),
        }
    }
}

#[derive(Debug)]
pub enum RowLengths {
    /// Every row is this many bytes.
    Fixed(usize),
    /// Cumulative offsets of independently compressed rows, `num_rows + 1` entries.
    Offsets(Vec<u64>),
}

#[derive(Debug, Clone)]
pub struct ColumnLayout {
    pub name: String,
    pub col_type: ColumnType,
    pub width: usize,
}

/// Everything needed to write a table file.
#[derive(Debug)]
pub struct TableLayout {
    pub columns: Vec<ColumnLayout>,
    pub rows: RowData,
    pub lengths: RowLengths,
    pub cmpr: Option<Vec<u8>>,
}

/// Encodes the sorted name → position lookup table as its own fixed-width table.
fn encode_name_table(columns: &[ColumnLayout]) -> [(&'static str, Vec<u8>); 4] {
    let mut names: Vec<(&[u8], usize)> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_bytes(), i))
        .collect();
    names.sort();
    let name_w = names.iter().map(|(n, _)| n.len()).max().unwrap_or(0).max(1);
    let idx_w = digit_width(columns.len().saturating_sub(1) as u64);
    let mut data = Vec::with_capacity(names.len() * (name_w + idx_w));
    for (name, idx) in &names {
        push_padded(&mut data, name, name_w);
        data.extend_from_slice(format!("{idx:0idx_w$}").as_bytes());
    }
    let (cc, mccl) = encode_digit_table(&[0, name_w as u64, (name_w + idx_w) as u64]);
    [
        (KEY_CN_DATA, data),
        (KEY_CN_CC, cc),
        (KEY_CN_MCCL, encode_decimal(mccl as u64)),
        (KEY_CN_LL, encode_decimal((name_w + idx_w) as u64)),
    ]
}

/// Writes `layout` to `dest`, replacing any existing file once the write completes.
pub fn write_table_file(dest: &Path, layout: TableLayout) -> Result<u64> {
    let mut coords = Vec::with_capacity(layout.columns.len() + 1);
    let mut acc = 0u64;
    coords.push(0);
    for c in &layout.columns {
        acc += c.width as u64;
        coords.push(acc);
    }
    let (cc, mccl) = encode_digit_table(&coords);
    let mctl = 1usize;
    let ct: Vec<u8> = layout.columns.iter().map(|c| c.col_type.to_tag()).collect();

    let mut meta: Vec<(&str, Vec<u8>)> = vec![
        (KEY_CC, cc),
        (KEY_MCCL, encode_decimal(mccl as u64)),
        (KEY_CT, ct),
        (KEY_MCTL, encode_decimal(mctl as u64)),
    ];
    match &layout.lengths {
        RowLengths::Fixed(len) => meta.push((KEY_LL, encode_decimal(*len as u64))),
        RowLengths::Offsets(offsets) => {
            let (table, width) = encode_digit_table(offsets);
            meta.push((KEY_LL, table));
            meta.push((KEY_MLL, encode_decimal(width as u64)));
        }
    }
    meta.extend(encode_name_table(&layout.columns));
    if let Some(cmpr) = layout.cmpr {
        meta.push((KEY_CMPR, cmpr));
    }

    let mut sizes: Vec<(&str, usize)> = vec![(KEY_DATA, layout.rows.len())];
    sizes.extend(meta.iter().map(|(k, v)| (*k, v.len())));
    let (header, _) = negotiate_header(&sizes)?;

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut written = header.len() as u64;
    {
        let mut w = BufWriter::new(tmp.as_file());
        w.write_all(&header)?;
        match &layout.rows {
            RowData::Bytes(b) => w.write_all(b)?,
            RowData::Segments(segs) => {
                for (path, _) in segs {
                    let mut seg = File::open(path).map_err(|e| Error::from_open(e, path))?;
                    io::copy(&mut seg, &mut w)?;
                }
            }
        }
        written += layout.rows.len() as u64;
        for (_, bytes) in &meta {
            w.write_all(bytes)?;
            written += bytes.len() as u64;
        }
        w.flush()?;
    }
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiated_offsets_include_header() {
        let (header, map) = negotiate_header(&[("data", 10), ("cc", 4)]).unwrap();
        let data = map.get("data").unwrap();
        assert_eq!(data.start, header.len());
        assert_eq!(data.end, header.len() + 10);
        assert_eq!(map.get("cc").unwrap().start, header.len() + 10);

        let mut file = header.clone();
        file.extend_from_slice(&[b'x'; 14]);
        assert_eq!(read_section_map(&file).unwrap(), map);
    }

    #[test]
    fn test_negotiation_across_digit_growth() {
        // Offsets near a power of ten force the map to grow by a digit.
        for len in [80usize, 90, 95, 99, 990, 9_990, 99_990] {
            let (header, map) = negotiate_header(&[("data", len), ("ll", 3)]).unwrap();
            assert_eq!(map.get("data").unwrap().start, header.len());
            assert_eq!(map.get("ll").unwrap().end, header.len() + len + 3);
        }
    }

    #[test]
    fn test_negotiation_gives_up_after_round_limit() {
        // One round only measures the header; it cannot also confirm the offsets.
        let err = negotiate_header_within(&[("data", 10)], 1).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
        assert!(negotiate_header_within(&[("data", 10)], 3).is_ok());
    }

    #[test]
    fn test_read_section_map_rejects_out_of_bounds() {
        let (header, _) = negotiate_header(&[("data", 100)]).unwrap();
        let mut file = header.clone();
        file.extend_from_slice(&[0u8; 10]);
        assert!(matches!(read_section_map(&file), Err(Error::Corrupt(_))));
        assert!(matches!(read_section_map(b"abc"), Err(Error::Corrupt(_))));
        assert!(matches!(read_section_map(b"5\n{\"a\""), Err(Error::Corrupt(_))));
        assert!(matches!(read_section_map(b""), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_digit_table() {
        let (bytes, width) = encode_digit_table(&[0, 7, 123]);
        assert_eq!(width, 3);
        assert_eq!(bytes, b"000007123");
        let table = DigitTable::new(&bytes, width).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2).unwrap(), 123);
        assert!(table.get(3).is_err());
        assert!(DigitTable::new(b"12345", 2).is_err());
    }

    #[test]
    fn test_trim_and_pad() {
        let mut out = Vec::new();
        push_padded(&mut out, b"ab", 4);
        assert_eq!(out, b"ab  ");
        assert_eq!(trim_padding(&out), b"ab");
        assert_eq!(trim_padding(b"    "), b"");
        assert_eq!(trim_padding(b" a "), b" a");
    }

    #[test]
    fn test_write_table_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("t.nc");
        let layout = TableLayout {
            columns: vec![
                ColumnLayout {
                    name: "b".into(),
                    col_type: ColumnType::Int,
                    width: 2,
                },
                ColumnLayout {
                    name: "a".into(),
                    col_type: ColumnType::Str,
                    width: 3,
                },
            ],
            rows: RowData::Bytes(b"1 xyz22ab ".to_vec()),
            lengths: RowLengths::Fixed(5),
            cmpr: None,
        };
        let written = write_table_file(&dest, layout).unwrap();
        let buf = std::fs::read(&dest).unwrap();
        assert_eq!(written as usize, buf.len());
        let map = read_section_map(&buf).unwrap();
        assert_eq!(map.require(KEY_DATA).unwrap().slice(&buf), b"1 xyz22ab ");
        assert_eq!(map.require(KEY_CC).unwrap().slice(&buf), b"025");
        assert_eq!(map.require(KEY_CT).unwrap().slice(&buf), b"is");
        assert_eq!(map.require(KEY_LL).unwrap().slice(&buf), b"5");
        assert_eq!(map.require(KEY_CN_DATA).unwrap().slice(&buf), b"a1b0");
        assert!(map.get(KEY_CMPR).is_none());
    }
}
