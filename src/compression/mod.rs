//! 包数据压缩/解压（LZ4 / None）

use crate::common::{OlapError, Result};
use crate::field_type::CompressionType;

impl CompressionType {
    pub fn to_code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            _ => Err(OlapError::Compression(format!("unknown codec {code}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: CompressionType) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| OlapError::Compression(e.to_string())),
    }
}

pub fn decompress(
    data:             &[u8],
    codec:            CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match codec {
        CompressionType::None => data.to_vec(),
        CompressionType::Lz4  => {
            if uncompressed_len == 0 { return Ok(Vec::new()); }
            lz4::block::decompress(data, Some(uncompressed_len as i32))
                .map_err(|e| OlapError::Compression(e.to_string()))?
        }
    };
    if out.len() != uncompressed_len {
        return Err(OlapError::Compression(
            format!("expected {uncompressed_len} bytes, got {}", out.len())));
    }
    Ok(out)
}
