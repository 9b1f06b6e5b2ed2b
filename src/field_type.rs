//! 列的逻辑类型、包类型与运行时值

use crate::common::{OlapError, Result};

/// 列的逻辑类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int8, Int16, Int32, Int64,
    Float32, Float64,
    Varchar,
    /// 日期存储为天数
    Date,
}

impl ColumnType {
    pub fn pack_type(self) -> PackType {
        match self {
            Self::Varchar => PackType::Str,
            _             => PackType::Int,
        }
    }

    pub fn is_real(self) -> bool { matches!(self, Self::Float32 | Self::Float64) }

    pub fn is_string(self) -> bool { self == Self::Varchar }

    /// 定点类型（整数/日期）；排序器只对定点列按统计量排序
    pub fn is_fixed(self) -> bool { !self.is_real() && !self.is_string() }

    pub fn to_code(self) -> u8 {
        match self {
            Self::Int8    => 0,
            Self::Int16   => 1,
            Self::Int32   => 2,
            Self::Int64   => 3,
            Self::Float32 => 4,
            Self::Float64 => 5,
            Self::Varchar => 6,
            Self::Date    => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Int8,
            1 => Self::Int16,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::Float32,
            5 => Self::Float64,
            6 => Self::Varchar,
            7 => Self::Date,
            _ => return Err(OlapError::Database(format!("unknown column type code {code}"))),
        })
    }
}

/// 包的物理类型：数值包（i64 / f64 位模式）或字符串包
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType { Int, Str }

/// 整数值编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    Plain,
    DeltaBinary,
}

/// 压缩方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Lz4,
}

/// 列定义（写入 COL_META）
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name:        String,
    pub column_type: ColumnType,
    pub is_nullable: bool,
    pub encoding:    EncodingType,
    pub compression: CompressionType,
    /// 是否为该列维护 Bloom 过滤器
    pub bloom:       bool,
    pub precision:   u32,
    pub scale:       u32,
}

impl ColumnMeta {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        // 整数默认 Delta，其余 Plain
        let encoding = if column_type.is_fixed() {
            EncodingType::DeltaBinary
        } else {
            EncodingType::Plain
        };
        Self {
            name: name.into(), column_type,
            is_nullable: true, encoding,
            compression: CompressionType::Lz4,
            bloom: false, precision: 0, scale: 0,
        }
    }

    pub fn with_encoding(mut self, enc: EncodingType) -> Self {
        self.encoding = enc; self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn with_bloom(mut self) -> Self {
        self.bloom = true; self
    }
    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = precision; self.scale = scale; self
    }
    pub fn not_null(mut self) -> Self {
        self.is_nullable = false; self
    }

    pub fn pack_type(&self) -> PackType { self.column_type.pack_type() }
}

/// 列值（运行时表示）
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v)  => Some(*v as i64),
            Self::Int16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            other            => other.as_i64().map(|v| v as f64),
        }
    }
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self { Self::Bytes(b) => Some(b.as_slice()), _ => None }
    }

    /// 转为数值包内部表示：整数原值，实数取 f64 位模式
    pub fn to_pack_int(&self, column_type: ColumnType) -> Result<Option<i64>> {
        if self.is_null() { return Ok(None); }
        let v = if column_type.is_real() {
            self.as_f64().map(|d| d.to_bits() as i64)
        } else {
            self.as_i64()
        };
        v.map(Some).ok_or_else(|| OlapError::Encoding(
            format!("value {self} does not fit column type {column_type:?}")))
    }

    /// 从数值包内部表示还原
    pub fn from_pack_int(v: i64, column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::Float32 | ColumnType::Float64 => Self::Float64(f64::from_bits(v as u64)),
            _                                         => Self::Int64(v),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null       => write!(f, "NULL"),
            Self::Int8(v)    => write!(f, "{v}"),
            Self::Int16(v)   => write!(f, "{v}"),
            Self::Int32(v)   => write!(f, "{v}"),
            Self::Int64(v)   => write!(f, "{v}"),
            Self::Float32(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Bytes(b)   => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}
