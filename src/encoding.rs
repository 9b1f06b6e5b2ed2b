//! 包内值编码
//!
//! - **Plain**：每值 8 字节小端
//! - **DeltaBinary**：首值 + zigzag varint 增量，适合有序 ID / 时间列
//! - 字符串统一为 (u32 长度, 字节) 序列

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use crate::common::{OlapError, Result};
use crate::field_type::EncodingType;

// ── 整数 ──────────────────────────────────────────────────────────────────────

pub fn encode_ints(values: &[i64], enc: EncodingType) -> Vec<u8> {
    match enc {
        EncodingType::Plain       => plain::encode(values),
        EncodingType::DeltaBinary => delta::encode(values),
    }
}

pub fn decode_ints(data: &[u8], enc: EncodingType, count: usize) -> Result<Vec<i64>> {
    match enc {
        EncodingType::Plain       => plain::decode(data, count),
        EncodingType::DeltaBinary => delta::decode(data, count),
    }
}

impl EncodingType {
    pub fn to_code(self) -> u8 {
        match self {
            Self::Plain       => 0,
            Self::DeltaBinary => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Plain),
            1 => Ok(Self::DeltaBinary),
            _ => Err(OlapError::Encoding(format!("unknown encoding {code}"))),
        }
    }
}

// ── Plain ─────────────────────────────────────────────────────────────────────
mod plain {
    use super::*;

    pub fn encode(values: &[i64]) -> Vec<u8> {
        let mut out = vec![0u8; values.len() * 8];
        LittleEndian::write_i64_into(values, &mut out);
        out
    }

    pub fn decode(data: &[u8], count: usize) -> Result<Vec<i64>> {
        if data.len() != count * 8 {
            return Err(OlapError::Encoding(
                format!("plain: {} bytes for {count} values", data.len())));
        }
        let mut out = vec![0i64; count];
        LittleEndian::read_i64_into(data, &mut out);
        Ok(out)
    }
}

// ── Delta Binary ──────────────────────────────────────────────────────────────
mod delta {
    use super::*;

    fn zigzag(v: i64) -> u64 { ((v << 1) ^ (v >> 63)) as u64 }
    fn unzigzag(v: u64) -> i64 { ((v >> 1) as i64) ^ -((v & 1) as i64) }

    fn put_varint(out: &mut Vec<u8>, mut v: u64) {
        while v >= 0x80 {
            out.push((v as u8) | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
    }

    fn get_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let b = *data.get(*pos)
                .ok_or_else(|| OlapError::Encoding("delta: truncated varint".into()))?;
            *pos += 1;
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 { return Ok(v); }
            shift += 7;
            if shift > 63 {
                return Err(OlapError::Encoding("delta: varint overflow".into()));
            }
        }
    }

    pub fn encode(values: &[i64]) -> Vec<u8> {
        let mut out = Vec::with_capacity(values.len() + 8);
        let mut prev = 0i64;
        for &v in values {
            put_varint(&mut out, zigzag(v.wrapping_sub(prev)));
            prev = v;
        }
        out
    }

    pub fn decode(data: &[u8], count: usize) -> Result<Vec<i64>> {
        let mut out = Vec::with_capacity(count);
        let mut pos = 0;
        let mut prev = 0i64;
        for _ in 0..count {
            prev = prev.wrapping_add(unzigzag(get_varint(data, &mut pos)?));
            out.push(prev);
        }
        if pos != data.len() {
            return Err(OlapError::Encoding("delta: trailing bytes".into()));
        }
        Ok(out)
    }
}

// ── 字符串 ────────────────────────────────────────────────────────────────────

pub fn encode_strings(values: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = values.iter().map(|v| v.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for v in values {
        // Vec<u8> 写入不会失败
        let _ = out.write_u32::<LittleEndian>(v.len() as u32);
        out.extend_from_slice(v);
    }
    out
}

pub fn decode_strings(data: &[u8], count: usize) -> Result<Vec<Vec<u8>>> {
    let mut cur = Cursor::new(data);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cur.read_u32::<LittleEndian>()
            .map_err(|e| OlapError::Encoding(e.to_string()))? as usize;
        let start = cur.position() as usize;
        let end = start + len;
        if end > data.len() {
            return Err(OlapError::Encoding("string value past end of block".into()));
        }
        out.push(data[start..end].to_vec());
        cur.set_position(end as u64);
    }
    Ok(out)
}
