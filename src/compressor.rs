// SPDX-License-Identifier: AGPL-3.0-or-later
// =========================================================
// Column value codecs
// Categorical dictionary + bigram dictionary + zstd row blocks
// =========================================================

use crate::error::{Error, Result};
use std::collections::HashMap;

const CMPR_DICTIONARY: u8 = b'D';
const CMPR_BLOCK: u8 = b'z';
const KIND_CATEGORICAL: u8 = b'c';
const KIND_BIGRAM: u8 = b'b';

/// Usable symbols per code byte: every byte value except the space padding byte.
const CODE_RADIX: u64 = 255;
const MAX_CODE_WIDTH: usize = 8;
const ZSTD_LEVEL: i32 = 3;

/// Columns whose cardinality ratio is at or below this are encoded as whole values.
pub const CATEGORICAL_MAX_RATIO: f64 = 0.10;

// =========================================================
// Variable Length Integer (varint)
// =========================================================

fn uvarint_encode(mut x: u64, out: &mut Vec<u8>) {
    loop {
        let mut b = (x & 0x7F) as u8;
        x >>= 7;
        if x != 0 {
            b |= 0x80;
            out.push(b);
        } else {
            out.push(b);
            break;
        }
    }
}

fn uvarint_decode(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut val = 0u64;
    let mut shift = 0;
    let mut pos = pos;

    loop {
        if pos >= buf.len() {
            return Err(Error::corrupt("uvarint: EOF"));
        }
        if shift > 63 {
            return Err(Error::corrupt("uvarint: overflow"));
        }
        let b = buf[pos];
        pos += 1;
        val |= ((b & 0x7F) as u64) << shift;
        if (b & 0x80) == 0 {
            return Ok((val, pos));
        }
        shift += 7;
    }
}

fn read_bytes<'a>(buf: &'a [u8], pos: usize, len: u64) -> Result<(&'a [u8], usize)> {
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| pos.checked_add(len))
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| Error::corrupt("compression metadata truncated"))?;
    Ok((&buf[pos..end], end))
}

// =========================================================
// Code space
// =========================================================

/// Smallest number of code bytes able to enumerate `n` distinct entries.
pub fn code_width(n: usize) -> usize {
    let mut width = 1usize;
    let mut capacity = CODE_RADIX;
    while capacity < n as u64 && width < MAX_CODE_WIDTH {
        width += 1;
        capacity = capacity.saturating_mul(CODE_RADIX);
    }
    width
}

#[inline]
fn digit_to_byte(d: u8) -> u8 {
    if d < b' ' {
        d
    } else {
        d + 1
    }
}

#[inline]
fn byte_to_digit(b: u8) -> Option<u8> {
    match b.cmp(&b' ') {
        std::cmp::Ordering::Less => Some(b),
        std::cmp::Ordering::Equal => None,
        std::cmp::Ordering::Greater => Some(b - 1),
    }
}

/// Writes the `index`-th code of `width` bytes. Codes are big-endian base-255 numbers
/// whose digits skip 0x20, so byte order of codes follows index order.
fn push_code(index: u64, width: usize, out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + width, 0);
    let mut rest = index;
    for slot in out[start..].iter_mut().rev() {
        *slot = digit_to_byte((rest % CODE_RADIX) as u8);
        rest /= CODE_RADIX;
    }
}

fn code_index(code: &[u8]) -> Option<u64> {
    let mut index = 0u64;
    for &b in code {
        index = index
            .checked_mul(CODE_RADIX)?
            .checked_add(byte_to_digit(b)? as u64)?;
    }
    Some(index)
}

// =========================================================
// Dictionaries
// =========================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictKind {
    Categorical,
    Bigram,
}

/// A closed dictionary: entry `i` is stored as the `i`-th code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dictionary {
    kind: DictKind,
    width: usize,
    entries: Vec<Vec<u8>>,
}

impl Dictionary {
    fn from_sorted(kind: DictKind, mut entries: Vec<Vec<u8>>) -> Self {
        entries.sort();
        entries.dedup();
        Self {
            kind,
            width: code_width(entries.len()),
            entries,
        }
    }

    pub fn categorical<I>(distinct: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self::from_sorted(DictKind::Categorical, distinct.into_iter().collect())
    }

    pub fn bigram<'a, I>(distinct: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut grams: Vec<Vec<u8>> = Vec::new();
        for v in distinct {
            grams.extend(v.chunks(2).map(<[u8]>::to_vec));
        }
        Self::from_sorted(DictKind::Bigram, grams)
    }

    /// Chooses the dictionary for a column with `distinct` values over `num_rows` rows.
    pub fn plan(distinct: &[&[u8]], num_rows: usize) -> Self {
        let ratio = distinct.len() as f64 / num_rows.max(1) as f64;
        if ratio <= CATEGORICAL_MAX_RATIO {
            Self::categorical(distinct.iter().map(|v| v.to_vec()))
        } else {
            Self::bigram(distinct.iter().copied())
        }
    }

    pub fn kind(&self) -> DictKind {
        self.kind
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded byte length of `value`.
    pub fn encoded_len(&self, value: &[u8]) -> usize {
        match self.kind {
            DictKind::Categorical => self.width,
            DictKind::Bigram => value.len().div_ceil(2) * self.width,
        }
    }

    pub fn encoder(&self) -> DictEncoder<'_> {
        let lookup = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.as_slice(), i as u64))
            .collect();
        DictEncoder { dict: self, lookup }
    }

    /// Appends the original value of a trimmed, encoded cell to `out`.
    pub fn decode_into(&self, code: &[u8], out: &mut Vec<u8>) -> Result<()> {
        match self.kind {
            DictKind::Categorical => {
                if code.len() != self.width {
                    return Err(Error::corrupt("categorical code width mismatch"));
                }
                out.extend_from_slice(self.entry(code)?);
            }
            DictKind::Bigram => {
                if code.len() % self.width != 0 {
                    return Err(Error::corrupt("bigram code width mismatch"));
                }
                for chunk in code.chunks(self.width) {
                    out.extend_from_slice(self.entry(chunk)?);
                }
            }
        }
        Ok(())
    }

    fn entry(&self, code: &[u8]) -> Result<&[u8]> {
        code_index(code)
            .and_then(|i| self.entries.get(i as usize))
            .map(Vec::as_slice)
            .ok_or_else(|| Error::corrupt("code not present in dictionary"))
    }

    pub fn decode(&self, code: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(code.len() * 2);
        self.decode_into(code, &mut out)?;
        Ok(out)
    }
}

/// Value → code lookup used while writing rows.
pub struct DictEncoder<'a> {
    dict: &'a Dictionary,
    lookup: HashMap<&'a [u8], u64>,
}

impl DictEncoder<'_> {
    pub fn encode_into(&self, value: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let find = |key: &[u8]| {
            self.lookup.get(key).copied().ok_or_else(|| {
                Error::invalid(format!(
                    "value {:?} missing from column dictionary",
                    String::from_utf8_lossy(value)
                ))
            })
        };
        match self.dict.kind {
            DictKind::Categorical => push_code(find(value)?, self.dict.width, out),
            DictKind::Bigram => {
                for gram in value.chunks(2) {
                    push_code(find(gram)?, self.dict.width, out);
                }
            }
        }
        Ok(())
    }
}

// =========================================================
// Compression metadata section (`cmpr`)
// =========================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionMeta {
    Block,
    Dictionaries(Vec<(String, Dictionary)>),
}

impl CompressionMeta {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Block => vec![CMPR_BLOCK],
            Self::Dictionaries(dicts) => {
                let mut out = vec![CMPR_DICTIONARY];
                uvarint_encode(dicts.len() as u64, &mut out);
                for (name, dict) in dicts {
                    uvarint_encode(name.len() as u64, &mut out);
                    out.extend_from_slice(name.as_bytes());
                    out.push(match dict.kind {
                        DictKind::Categorical => KIND_CATEGORICAL,
                        DictKind::Bigram => KIND_BIGRAM,
                    });
                    uvarint_encode(dict.width as u64, &mut out);
                    uvarint_encode(dict.entries.len() as u64, &mut out);
                    for e in &dict.entries {
                        uvarint_encode(e.len() as u64, &mut out);
                        out.extend_from_slice(e);
                    }
                }
                out
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf.first() {
            Some(&CMPR_BLOCK) if buf.len() == 1 => return Ok(Self::Block),
            Some(&CMPR_DICTIONARY) => {}
            _ => return Err(Error::corrupt("unknown compression marker")),
        }
        let (count, mut pos) = uvarint_decode(buf, 1)?;
        let mut dicts = Vec::new();
        for _ in 0..count {
            let (name_len, p) = uvarint_decode(buf, pos)?;
            let (name, p) = read_bytes(buf, p, name_len)?;
            let name = std::str::from_utf8(name)
                .map_err(|_| Error::corrupt("dictionary column name is not utf-8"))?
                .to_string();
            let (kind, p) = read_bytes(buf, p, 1)?;
            let kind = match kind[0] {
                KIND_CATEGORICAL => DictKind::Categorical,
                KIND_BIGRAM => DictKind::Bigram,
                _ => return Err(Error::corrupt("unknown dictionary kind")),
            };
            let (width, p) = uvarint_decode(buf, p)?;
            let (n, mut p) = uvarint_decode(buf, p)?;
            // Every entry needs at least its length byte.
            if n > (buf.len() - p) as u64 {
                return Err(Error::corrupt("dictionary entry count out of bounds"));
            }
            let mut entries = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let (len, q) = uvarint_decode(buf, p)?;
                let (entry, q) = read_bytes(buf, q, len)?;
                entries.push(entry.to_vec());
                p = q;
            }
            if width as usize != code_width(entries.len()) {
                return Err(Error::corrupt("dictionary code width mismatch"));
            }
            dicts.push((
                name,
                Dictionary {
                    kind,
                    width: width as usize,
                    entries,
                },
            ));
            pos = p;
        }
        if pos != buf.len() {
            return Err(Error::corrupt("trailing bytes after compression metadata"));
        }
        Ok(Self::Dictionaries(dicts))
    }
}

// =========================================================
// Row blocks
// =========================================================

pub fn compress_block(row: &[u8]) -> Result<Vec<u8>> {
    Ok(zstd::bulk::compress(row, ZSTD_LEVEL)?)
}

pub fn decompress_block(block: &[u8], row_len: usize) -> Result<Vec<u8>> {
    // Checked against the frame header before `row_len` bytes are allocated.
    match zstd::zstd_safe::get_frame_content_size(block) {
        Ok(Some(n)) if n == row_len as u64 => {}
        _ => return Err(Error::corrupt("row block length mismatch")),
    }
    let row = zstd::bulk::decompress(block, row_len)
        .map_err(|e| Error::corrupt(format!("row block: {e}")))?;
    if row.len() != row_len {
        return Err(Error::corrupt("row block length mismatch"));
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_width_skips_space() {
        assert_eq!(code_width(0), 1);
        assert_eq!(code_width(1), 1);
        assert_eq!(code_width(255), 1);
        // 256 distinct entries no longer fit one byte once 0x20 is reserved.
        assert_eq!(code_width(256), 2);
        assert_eq!(code_width(255 * 255), 2);
        assert_eq!(code_width(255 * 255 + 1), 3);
    }

    #[test]
    fn test_codes_never_contain_space_and_keep_order() {
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..(255u64 * 3) {
            let mut code = Vec::new();
            push_code(i, 2, &mut code);
            assert!(!code.contains(&b' '));
            assert_eq!(code_index(&code), Some(i));
            if let Some(p) = &prev {
                assert!(p < &code);
            }
            prev = Some(code);
        }
        assert_eq!(code_index(b" "), None);
    }

    #[test]
    fn test_categorical_roundtrip() {
        let values: Vec<&[u8]> = vec![b"red", b"green", b"blue", b""];
        let dict = Dictionary::categorical(values.iter().map(|v| v.to_vec()));
        assert_eq!(dict.kind(), DictKind::Categorical);
        assert_eq!(dict.width(), 1);
        let enc = dict.encoder();
        for v in &values {
            let mut code = Vec::new();
            enc.encode_into(v, &mut code).unwrap();
            assert_eq!(code.len(), dict.encoded_len(v));
            assert_eq!(dict.decode(&code).unwrap(), v.to_vec());
        }
    }

    #[test]
    fn test_bigram_roundtrip_odd_lengths() {
        let values: Vec<&[u8]> = vec![b"abc", b"abcd", b"x", b"", b"hello world"];
        let dict = Dictionary::bigram(values.iter().copied());
        let enc = dict.encoder();
        for v in &values {
            let mut code = Vec::new();
            enc.encode_into(v, &mut code).unwrap();
            assert_eq!(code.len(), dict.encoded_len(v));
            assert_eq!(dict.decode(&code).unwrap(), v.to_vec());
        }
    }

    #[test]
    fn test_encoding_value_outside_dictionary_fails() {
        let dict = Dictionary::categorical(vec![b"a".to_vec()]);
        let mut out = Vec::new();
        assert!(dict.encoder().encode_into(b"b", &mut out).is_err());
    }

    #[test]
    fn test_plan_uses_cardinality_ratio() {
        let low: Vec<&[u8]> = vec![b"a", b"b"];
        assert_eq!(Dictionary::plan(&low, 20).kind(), DictKind::Categorical);
        assert_eq!(Dictionary::plan(&low, 19).kind(), DictKind::Bigram);
    }

    #[test]
    fn test_wide_dictionary_roundtrip() {
        let values: Vec<Vec<u8>> = (0..600).map(|i| format!("v{i:04}").into_bytes()).collect();
        let dict = Dictionary::categorical(values.clone());
        assert_eq!(dict.width(), 2);
        let enc = dict.encoder();
        for v in &values {
            let mut code = Vec::new();
            enc.encode_into(v, &mut code).unwrap();
            assert_eq!(&dict.decode(&code).unwrap(), v);
        }
    }

    #[test]
    fn test_cmpr_roundtrip() {
        let meta = CompressionMeta::Dictionaries(vec![
            ("a".into(), Dictionary::categorical(vec![b"x".to_vec(), b"y".to_vec()])),
            ("b".into(), Dictionary::bigram([&b"hello"[..]])),
        ]);
        assert_eq!(CompressionMeta::decode(&meta.encode()).unwrap(), meta);
        assert_eq!(
            CompressionMeta::decode(&CompressionMeta::Block.encode()).unwrap(),
            CompressionMeta::Block
        );
    }

    #[test]
    fn test_cmpr_rejects_garbage() {
        assert!(CompressionMeta::decode(b"").is_err());
        assert!(CompressionMeta::decode(b"q").is_err());
        assert!(CompressionMeta::decode(b"D\x01\x05ab").is_err());
        assert!(CompressionMeta::decode(b"D\x01\x01aq\x01\x00").is_err());
        assert!(CompressionMeta::decode(b"D\x00junk").is_err());
    }

    #[test]
    fn test_block_roundtrip() {
        let row = b"alpha   12  3.5   ".to_vec();
        let block = compress_block(&row).unwrap();
        assert_eq!(decompress_block(&block, row.len()).unwrap(), row);
        assert!(decompress_block(b"not zstd", row.len()).is_err());
    }
}
