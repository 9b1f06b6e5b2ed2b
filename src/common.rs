//! 全局基础类型与错误定义

use std::path::{Path, PathBuf};
use thiserror::Error;

// ── ID 类型 ───────────────────────────────────────────────────────────────────

pub type TableId  = u32;
pub type ColumnId = u32;

/// 事务 ID：既是 MVCC 时间戳，也是磁盘版本文件名的后缀（16 位十六进制）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxId(pub u64);

impl TxId {
    pub const ZERO: TxId = TxId(0);
    /// 尚未被删除的 DPN 的 xmax
    pub const MAX:  TxId = TxId(u64::MAX);

    pub fn to_hex(self) -> String { format!("{:016x}", self.0) }

    pub fn from_hex(s: &str) -> Option<TxId> {
        u64::from_str_radix(s, 16).ok().map(TxId)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// DPN 数组中的槽位下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackIndex(pub u32);

impl PackIndex {
    pub const INVALID: PackIndex = PackIndex(u32::MAX);

    pub fn is_valid(self) -> bool { self != Self::INVALID }
    pub fn as_usize(self) -> usize { self.0 as usize }
}

impl From<usize> for PackIndex {
    fn from(i: usize) -> Self { PackIndex(i as u32) }
}

// ── 数值哨兵 ──────────────────────────────────────────────────────────────────

pub const PLUS_INF_64:  i64 = i64::MAX;
pub const MINUS_INF_64: i64 = i64::MIN;

// ── Rough Set 结果 ────────────────────────────────────────────────────────────

/// 包级粗糙判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RsValue {
    /// 不可能有匹配行
    None,
    /// 可能有匹配行，需要解压扫描
    Some,
    /// 所有行都匹配
    All,
}

impl RsValue {
    /// 否定谓词：NONE ↔ ALL，SOME 不变
    pub fn negate(self) -> Self {
        match self {
            Self::None => Self::All,
            Self::All  => Self::None,
            Self::Some => Self::Some,
        }
    }

    /// 有 null 时 ALL 不可信
    pub fn widen_if(self, nulls_possible: bool) -> Self {
        if nulls_possible && self == Self::All { Self::Some } else { self }
    }

    /// 合并两个来源：NONE 优先，ALL 需双方同意
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, _) | (_, Self::None) => Self::None,
            (Self::All, Self::All)            => Self::All,
            _                                 => Self::Some,
        }
    }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum OlapError {
    /// 磁盘结构损坏：魔数/版本错误、列行数不一致、数据段重叠
    #[error("database error: {0}")]
    Database(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("file error on {}: {source}", .path.display())]
    File {
        path:   PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("system error: {0}")]
    System(String),
    #[error("query killed")]
    Killed,
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("kv store busy")]
    KvBusy,
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, OlapError>;

/// 给 io::Result 附带出错文件路径
pub trait FileContext<T> {
    fn with_path(self, path: &Path) -> Result<T>;
}

impl<T> FileContext<T> for std::io::Result<T> {
    fn with_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| OlapError::File { path: path.to_path_buf(), source })
    }
}
