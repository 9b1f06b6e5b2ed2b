//! 解压后的内存包与其负载编解码
//!
//! 负载格式：
//! ```text
//! ┌──────────────────────────────────┐
//! │ pack_type    (u8)                │
//! │ encoding     (u8)                │
//! │ compression  (u8)                │
//! │ reserved     (u8)                │
//! │ num_records  (u32 LE)            │
//! │ uncomp_size  (u32 LE)            │
//! │ body (compressed)                │
//! │   null_bitmap   (u64 LE × words) │
//! │   delete_bitmap (u64 LE × words) │
//! │   values        (encoded)        │
//! │ CRC32        (u32 LE)            │
//! └──────────────────────────────────┘
//! ```

use byteorder::{ByteOrder, LittleEndian};
use crate::common::{OlapError, Result};
use crate::compression;
use crate::encoding;
use crate::field_type::{CompressionType, EncodingType, PackType};

const HEADER_LEN: usize = 12;

/// 索引构建与粗糙检查读取包内容的最小接口
pub trait PackSource {
    fn num_records(&self) -> usize;
    fn is_null(&self, row: usize) -> bool;
    /// 数值包的行值（实数为 f64 位模式）
    fn get_val_int(&self, row: usize) -> i64;
    /// 字符串包的行值
    fn get_val_binary(&self, row: usize) -> &[u8];
}

#[derive(Debug, Clone, PartialEq)]
enum PackData {
    Int(Vec<i64>),
    Str(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pack {
    nulls:   Bitmap,
    deletes: Bitmap,
    data:    PackData,
}

impl Pack {
    pub fn new(pack_type: PackType) -> Self {
        let data = match pack_type {
            PackType::Int => PackData::Int(Vec::new()),
            PackType::Str => PackData::Str(Vec::new()),
        };
        Self { nulls: Bitmap::default(), deletes: Bitmap::default(), data }
    }

    /// 由全 null 的平凡包物化
    pub fn null_only(pack_type: PackType, rows: usize) -> Self {
        let mut p = Self::new(pack_type);
        for _ in 0..rows { p.push_null(); }
        p
    }

    /// 由统一值数值包物化
    pub fn uniform_int(value: i64, rows: usize) -> Self {
        let mut p = Self::new(PackType::Int);
        for _ in 0..rows { p.push_int(value); }
        p
    }

    pub fn pack_type(&self) -> PackType {
        match self.data {
            PackData::Int(_) => PackType::Int,
            PackData::Str(_) => PackType::Str,
        }
    }

    pub fn len(&self)      -> usize { self.nulls.len() }
    pub fn is_empty(&self) -> bool  { self.len() == 0 }

    pub fn push_null(&mut self) {
        match &mut self.data {
            PackData::Int(v) => v.push(0),
            PackData::Str(v) => v.push(Vec::new()),
        }
        self.nulls.push(true);
        self.deletes.push(false);
    }

    pub fn push_int(&mut self, value: i64) {
        if let PackData::Int(v) = &mut self.data {
            v.push(value);
            self.nulls.push(false);
            self.deletes.push(false);
        }
    }

    pub fn push_str(&mut self, value: &[u8]) {
        if let PackData::Str(v) = &mut self.data {
            v.push(value.to_vec());
            self.nulls.push(false);
            self.deletes.push(false);
        }
    }

    pub fn set_null(&mut self, row: usize) {
        match &mut self.data {
            PackData::Int(v) => v[row] = 0,
            PackData::Str(v) => v[row].clear(),
        }
        self.nulls.set(row, true);
    }

    pub fn set_int(&mut self, row: usize, value: i64) {
        if let PackData::Int(v) = &mut self.data {
            v[row] = value;
            self.nulls.set(row, false);
        }
    }

    pub fn set_str(&mut self, row: usize, value: &[u8]) {
        if let PackData::Str(v) = &mut self.data {
            v[row] = value.to_vec();
            self.nulls.set(row, false);
        }
    }

    /// 标记删除；已删除返回 false
    pub fn delete(&mut self, row: usize) -> bool {
        if self.deletes.get(row) { return false; }
        self.deletes.set(row, true);
        true
    }

    pub fn is_deleted(&self, row: usize) -> bool { self.deletes.get(row) }

    pub fn get_val_double(&self, row: usize) -> f64 {
        f64::from_bits(self.get_val_int(row) as u64)
    }

    pub fn num_nulls(&self)   -> usize { self.nulls.count_ones() }
    pub fn num_deleted(&self) -> usize { self.deletes.count_ones() }

    // ── 负载编解码 ────────────────────────────────────────────────────────────

    pub fn save(&self, enc: EncodingType, comp: CompressionType) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        self.nulls.write_to(&mut body);
        self.deletes.write_to(&mut body);
        match &self.data {
            PackData::Int(v) => body.extend_from_slice(&encoding::encode_ints(v, enc)),
            PackData::Str(v) => body.extend_from_slice(&encoding::encode_strings(v)),
        }
        let compressed = compression::compress(&body, comp)?;

        let mut out = Vec::with_capacity(HEADER_LEN + compressed.len() + 4);
        out.push(match self.pack_type() { PackType::Int => 0, PackType::Str => 1 });
        out.push(enc.to_code());
        out.push(comp.to_code());
        out.push(0);
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, self.len() as u32);
        out.extend_from_slice(&word);
        LittleEndian::write_u32(&mut word, body.len() as u32);
        out.extend_from_slice(&word);
        out.extend_from_slice(&compressed);

        let crc = crc32fast::hash(&out);
        LittleEndian::write_u32(&mut word, crc);
        out.extend_from_slice(&word);
        Ok(out)
    }

    pub fn load(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 4 {
            return Err(OlapError::Database("pack payload too short".into()));
        }
        let payload_end = data.len() - 4;
        let stored_crc = LittleEndian::read_u32(&data[payload_end..]);
        if stored_crc != crc32fast::hash(&data[..payload_end]) {
            return Err(OlapError::ChecksumMismatch);
        }
        let pack_type = match data[0] {
            0 => PackType::Int,
            1 => PackType::Str,
            t => return Err(OlapError::Database(format!("unknown pack type {t}"))),
        };
        let enc   = EncodingType::from_code(data[1])?;
        let comp  = CompressionType::from_code(data[2])?;
        let count = LittleEndian::read_u32(&data[4..8]) as usize;
        let uncomp_size = LittleEndian::read_u32(&data[8..12]) as usize;

        let body = compression::decompress(&data[HEADER_LEN..payload_end], comp, uncomp_size)?;
        let (nulls, pos)   = Bitmap::read_from(&body, 0, count)?;
        let (deletes, pos) = Bitmap::read_from(&body, pos, count)?;
        let values = &body[pos..];
        let data = match pack_type {
            PackType::Int => PackData::Int(encoding::decode_ints(values, enc, count)?),
            PackType::Str => PackData::Str(encoding::decode_strings(values, count)?),
        };
        Ok(Self { nulls, deletes, data })
    }
}

impl PackSource for Pack {
    fn num_records(&self) -> usize { self.len() }

    fn is_null(&self, row: usize) -> bool { self.nulls.get(row) }

    fn get_val_int(&self, row: usize) -> i64 {
        match &self.data {
            PackData::Int(v) => v[row],
            PackData::Str(_) => 0,
        }
    }

    fn get_val_binary(&self, row: usize) -> &[u8] {
        match &self.data {
            PackData::Str(v) => &v[row],
            PackData::Int(_) => &[],
        }
    }
}

// ── 位图 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
struct Bitmap {
    words: Vec<u64>,
    len:   usize,
}

impl Bitmap {
    fn len(&self) -> usize { self.len }

    fn push(&mut self, bit: bool) {
        if self.len % 64 == 0 { self.words.push(0); }
        self.len += 1;
        self.set(self.len - 1, bit);
    }

    fn get(&self, i: usize) -> bool { self.words[i / 64] >> (i % 64) & 1 == 1 }

    fn set(&mut self, i: usize, bit: bool) {
        if bit {
            self.words[i / 64] |= 1 << (i % 64);
        } else {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.words.len() * 8, 0);
        LittleEndian::write_u64_into(&self.words, &mut out[start..]);
    }

    fn read_from(data: &[u8], pos: usize, len: usize) -> Result<(Self, usize)> {
        let n = len.div_ceil(64);
        let end = pos + n * 8;
        if end > data.len() {
            return Err(OlapError::Encoding("bitmap past end of pack body".into()));
        }
        let mut words = vec![0u64; n];
        LittleEndian::read_u64_into(&data[pos..end], &mut words);
        Ok((Self { words, len }, end))
    }
}
