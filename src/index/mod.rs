//! 粗糙集索引（Rough Set Index）
//!
//! 三种包级近似索引，回答 RS_NONE / RS_SOME / RS_ALL：
//! - **Histogram**：数值列 (min, max) 区间的 1024 位分布
//! - **CMap**：字符串列每个字节位置出现过的字符
//! - **Bloom**：等值查询的概率过滤
//!
//! 每个列版本各写一份过滤器文件：`filters/<kind>/<hex tx>`，
//! 文件尾附 CRC32。读取失败时返回 None，调用方退化为 RS_SOME。

pub mod bloom;
pub mod cmap;
pub mod histogram;

use std::path::{Path, PathBuf};
use tracing::warn;
use crate::common::{OlapError, Result, TxId};
use crate::meta::{self, COL_FILTER_DIR};

pub use bloom::{Bloom, BloomFilter};
pub use cmap::CMap;
pub use histogram::Histogram;

pub const FILTER_KINDS: [&str; 3] = [Histogram::KIND, CMap::KIND, Bloom::KIND];

/// 可持久化的包级索引
pub trait RoughIndex: Sized {
    const KIND: &'static str;
    fn encode(&self) -> Vec<u8>;
    fn decode(data: &[u8]) -> Result<Self>;
}

pub fn filter_path(col_dir: &Path, kind: &str, xid: TxId) -> PathBuf {
    col_dir.join(COL_FILTER_DIR).join(kind).join(xid.to_hex())
}

pub fn save<T: RoughIndex>(col_dir: &Path, xid: TxId, index: &T, sync: bool) -> Result<()> {
    let mut data = index.encode();
    let crc = crc32fast::hash(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    meta::write_file(&filter_path(col_dir, T::KIND, xid), &data, sync)
}

fn try_load<T: RoughIndex>(path: &Path) -> Result<T> {
    let data = meta::read_file(path)?;
    if data.len() < 4 {
        return Err(OlapError::Database("short filter file".into()));
    }
    let (body, tail) = data.split_at(data.len() - 4);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(tail);
    if u32::from_le_bytes(crc) != crc32fast::hash(body) {
        return Err(OlapError::ChecksumMismatch);
    }
    T::decode(body)
}

/// 文件不存在视为未建；其余失败记日志后同样视为未建
pub fn load<T: RoughIndex>(col_dir: &Path, xid: TxId) -> Option<T> {
    let path = filter_path(col_dir, T::KIND, xid);
    if !path.exists() {
        return None;
    }
    match try_load(&path) {
        Ok(index) => Some(index),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "rough index unusable, falling back to full scan");
            None
        }
    }
}

pub fn remove_all(col_dir: &Path, xid: TxId) {
    for kind in FILTER_KINDS {
        meta::remove_stale(&filter_path(col_dir, kind, xid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn corrupted_filter_degrades_to_none() {
        let dir = TempDir::new().unwrap();
        for kind in FILTER_KINDS {
            fs::create_dir_all(dir.path().join(COL_FILTER_DIR).join(kind)).unwrap();
        }
        let mut h = Histogram::new(true);
        h.invalidate(3);
        save(dir.path(), TxId(5), &h, false).unwrap();
        assert_eq!(load::<Histogram>(dir.path(), TxId(5)), Some(h));
        assert_eq!(load::<CMap>(dir.path(), TxId(5)), None);

        let p = filter_path(dir.path(), Histogram::KIND, TxId(5));
        let mut raw = fs::read(&p).unwrap();
        raw[0] ^= 0xff;
        fs::write(&p, raw).unwrap();
        assert_eq!(load::<Histogram>(dir.path(), TxId(5)), None);
    }
}
