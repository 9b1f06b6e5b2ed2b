//! 表/列的持久化元数据文件
//!
//! 表目录布局：
//! ```text
//! <table>/
//!   table.desc              TABLE_META {magic, ver, id, pss}
//!   V.<hex tx>              表版本文件：每列一个 TX_ID
//!   VERSION -> V.<hex tx>   当前发布版本（符号链接）
//!   VERSION.tmp             仅在原子发布窗口内存在
//!   columns/<i>/
//!     META                  COL_META
//!     DN                    DPN 数组（定长、mmap）
//!     DATA                  包负载
//!     v/<hex tx>            COL_VER_HDR + 包索引表
//!     filters/{hist,cmap,bloom}/<hex tx>
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;
use crate::common::{FileContext, OlapError, PackIndex, Result, TableId, TxId};
use crate::config::MAX_PSS;
use crate::field_type::{ColumnMeta, ColumnType, CompressionType, EncodingType};

pub const TABLE_DESC_FILE:        &str = "table.desc";
pub const TABLE_VERSION_FILE:     &str = "VERSION";
pub const TABLE_VERSION_FILE_TMP: &str = "VERSION.tmp";
pub const TABLE_VERSION_PREFIX:   &str = "V.";
pub const COLUMN_DIR:             &str = "columns";
pub const COL_META_FILE:          &str = "META";
pub const COL_DN_FILE:            &str = "DN";
pub const COL_DATA_FILE:          &str = "DATA";
pub const COL_VERSION_DIR:        &str = "v";
pub const COL_FILTER_DIR:         &str = "filters";

pub const TABLE_MAGIC:        u32 = 0x5442_4c45; // "TBLE"
pub const TABLE_DATA_VERSION: u32 = 2;
pub const COL_MAGIC:          u32 = 0x434f_4c4d; // "COLM"
pub const COL_DATA_VERSION:   u32 = 3;

const COL_FLAG_NULLABLE: u8 = 1;
const COL_FLAG_BLOOM:    u8 = 1 << 1;

// ── 文件辅助 ──────────────────────────────────────────────────────────────────

/// 写整个文件，按需 fsync
pub fn write_file(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true).create(true).truncate(true)
        .open(path).with_path(path)?;
    f.write_all(bytes).with_path(path)?;
    if sync { f.sync_all().with_path(path)?; }
    Ok(())
}

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path).with_path(path)?.read_to_end(&mut buf).with_path(path)?;
    Ok(buf)
}

pub fn fsync_file(path: &Path) -> Result<()> {
    File::open(path).with_path(path)?.sync_all().with_path(path)
}

/// 目录项（新建/rename 的文件名）的持久化依赖目录 fsync
pub fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir).with_path(dir)?.sync_all().with_path(dir)
}

/// 删除过期文件；不存在即视为已删，其他失败只记日志
pub fn remove_stale(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale file"),
    }
}

fn corrupt(path: &Path, what: &str) -> OlapError {
    OlapError::Database(format!("{what}: {}", path.display()))
}

// ── 表描述 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    pub table_id:        TableId,
    pub pack_size_shift: u8,
}

impl TableMeta {
    pub fn write(&self, path: &Path, sync: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(13);
        buf.write_u32::<LittleEndian>(TABLE_MAGIC).with_path(path)?;
        buf.write_u32::<LittleEndian>(TABLE_DATA_VERSION).with_path(path)?;
        buf.write_u32::<LittleEndian>(self.table_id).with_path(path)?;
        buf.write_u8(self.pack_size_shift).with_path(path)?;
        write_file(path, &buf, sync)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = read_file(path)?;
        let mut cur = Cursor::new(data.as_slice());
        let magic = cur.read_u32::<LittleEndian>().map_err(|_| corrupt(path, "short table descriptor"))?;
        let ver   = cur.read_u32::<LittleEndian>().map_err(|_| corrupt(path, "short table descriptor"))?;
        if magic != TABLE_MAGIC || ver != TABLE_DATA_VERSION {
            return Err(corrupt(path, "bad table descriptor magic/version"));
        }
        let table_id        = cur.read_u32::<LittleEndian>().map_err(|_| corrupt(path, "short table descriptor"))?;
        let pack_size_shift = cur.read_u8().map_err(|_| corrupt(path, "short table descriptor"))?;
        if pack_size_shift > MAX_PSS {
            return Err(corrupt(path, &format!("pack size shift {pack_size_shift} too large")));
        }
        Ok(Self { table_id, pack_size_shift })
    }
}

// ── 表版本文件 ────────────────────────────────────────────────────────────────

pub fn version_file_name(xid: TxId) -> String {
    format!("{TABLE_VERSION_PREFIX}{}", xid.to_hex())
}

/// 每列一个 TX_ID
pub fn write_table_version(path: &Path, versions: &[TxId], sync: bool) -> Result<()> {
    let mut buf = Vec::with_capacity(versions.len() * 8);
    for v in versions {
        buf.write_u64::<LittleEndian>(v.0).with_path(path)?;
    }
    write_file(path, &buf, sync)
}

pub fn read_table_version(path: &Path) -> Result<Vec<TxId>> {
    let data = read_file(path)?;
    if data.len() % 8 != 0 {
        return Err(corrupt(path, "truncated table version file"));
    }
    let mut cur = Cursor::new(data.as_slice());
    (0..data.len() / 8)
        .map(|_| cur.read_u64::<LittleEndian>().map(TxId).with_path(path))
        .collect()
}

// ── 列描述 ────────────────────────────────────────────────────────────────────

pub fn write_column_meta(path: &Path, meta: &ColumnMeta, pss: u8, sync: bool) -> Result<()> {
    let mut buf = Vec::new();
    let w = |r: std::io::Result<()>| r.with_path(path);
    w(buf.write_u32::<LittleEndian>(COL_MAGIC))?;
    w(buf.write_u32::<LittleEndian>(COL_DATA_VERSION))?;
    w(buf.write_u8(pss))?;
    w(buf.write_u8(meta.column_type.to_code()))?;
    w(buf.write_u8(meta.encoding.to_code() << 4 | meta.compression.to_code()))?;
    let mut flags = 0u8;
    if meta.is_nullable { flags |= COL_FLAG_NULLABLE; }
    if meta.bloom       { flags |= COL_FLAG_BLOOM; }
    w(buf.write_u8(flags))?;
    w(buf.write_u32::<LittleEndian>(meta.precision))?;
    w(buf.write_u32::<LittleEndian>(meta.scale))?;
    w(buf.write_u16::<LittleEndian>(meta.name.len() as u16))?;
    buf.extend_from_slice(meta.name.as_bytes());
    write_file(path, &buf, sync)
}

/// 返回 (列定义, pack_size_shift)
pub fn read_column_meta(path: &Path) -> Result<(ColumnMeta, u8)> {
    let data = read_file(path)?;
    let mut cur = Cursor::new(data.as_slice());
    let short = |_| corrupt(path, "short column meta");
    let magic = cur.read_u32::<LittleEndian>().map_err(short)?;
    let ver   = cur.read_u32::<LittleEndian>().map_err(short)?;
    if magic != COL_MAGIC || ver != COL_DATA_VERSION {
        return Err(corrupt(path, "bad column meta magic/version"));
    }
    let pss         = cur.read_u8().map_err(short)?;
    let column_type = ColumnType::from_code(cur.read_u8().map_err(short)?)?;
    let fmt         = cur.read_u8().map_err(short)?;
    let flags       = cur.read_u8().map_err(short)?;
    let precision   = cur.read_u32::<LittleEndian>().map_err(short)?;
    let scale       = cur.read_u32::<LittleEndian>().map_err(short)?;
    let name_len    = cur.read_u16::<LittleEndian>().map_err(short)? as usize;
    let mut name = vec![0u8; name_len];
    cur.read_exact(&mut name).map_err(short)?;
    let meta = ColumnMeta {
        name:        String::from_utf8_lossy(&name).into_owned(),
        column_type,
        is_nullable: flags & COL_FLAG_NULLABLE != 0,
        encoding:    EncodingType::from_code(fmt >> 4)?,
        compression: CompressionType::from_code(fmt & 0x0f)?,
        bloom:       flags & COL_FLAG_BLOOM != 0,
        precision,
        scale,
    };
    Ok((meta, pss))
}

// ── 列版本 ────────────────────────────────────────────────────────────────────

/// COL_VER_HDR
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ColumnVersionHeader {
    pub num_of_records:  u64,
    pub num_of_nulls:    u64,
    pub num_of_packs:    u32,
    pub num_of_deleted:  u64,
    pub auto_inc:        u64,
    pub min:             i64,
    pub max:             i64,
    pub natural_size:    u64,
    pub compressed_size: u64,
}

pub fn column_version_path(col_dir: &Path, xid: TxId) -> PathBuf {
    col_dir.join(COL_VERSION_DIR).join(xid.to_hex())
}

pub fn write_column_version(
    path: &Path,
    hdr:  &ColumnVersionHeader,
    idx:  &[PackIndex],
    sync: bool,
) -> Result<()> {
    let mut buf = Vec::with_capacity(68 + idx.len() * 4);
    let w = |r: std::io::Result<()>| r.with_path(path);
    w(buf.write_u64::<LittleEndian>(hdr.num_of_records))?;
    w(buf.write_u64::<LittleEndian>(hdr.num_of_nulls))?;
    w(buf.write_u32::<LittleEndian>(idx.len() as u32))?;
    w(buf.write_u64::<LittleEndian>(hdr.num_of_deleted))?;
    w(buf.write_u64::<LittleEndian>(hdr.auto_inc))?;
    w(buf.write_i64::<LittleEndian>(hdr.min))?;
    w(buf.write_i64::<LittleEndian>(hdr.max))?;
    w(buf.write_u64::<LittleEndian>(hdr.natural_size))?;
    w(buf.write_u64::<LittleEndian>(hdr.compressed_size))?;
    for i in idx {
        w(buf.write_u32::<LittleEndian>(i.0))?;
    }
    write_file(path, &buf, sync)
}

pub fn read_column_version(path: &Path) -> Result<(ColumnVersionHeader, Vec<PackIndex>)> {
    let data = read_file(path)?;
    let mut cur = Cursor::new(data.as_slice());
    let short = |_| corrupt(path, "short column version file");
    let mut hdr = ColumnVersionHeader {
        num_of_records:  cur.read_u64::<LittleEndian>().map_err(short)?,
        num_of_nulls:    cur.read_u64::<LittleEndian>().map_err(short)?,
        num_of_packs:    cur.read_u32::<LittleEndian>().map_err(short)?,
        ..Default::default()
    };
    hdr.num_of_deleted  = cur.read_u64::<LittleEndian>().map_err(short)?;
    hdr.auto_inc        = cur.read_u64::<LittleEndian>().map_err(short)?;
    hdr.min             = cur.read_i64::<LittleEndian>().map_err(short)?;
    hdr.max             = cur.read_i64::<LittleEndian>().map_err(short)?;
    hdr.natural_size    = cur.read_u64::<LittleEndian>().map_err(short)?;
    hdr.compressed_size = cur.read_u64::<LittleEndian>().map_err(short)?;
    let idx = (0..hdr.num_of_packs)
        .map(|_| cur.read_u32::<LittleEndian>().map(PackIndex).map_err(short))
        .collect::<Result<Vec<_>>>()?;
    Ok((hdr, idx))
}

/// 列目录下的空文件骨架
pub fn create_column_dir(col_dir: &Path, meta: &ColumnMeta, pss: u8, dn_size: u64) -> Result<()> {
    fs::create_dir_all(col_dir.join(COL_VERSION_DIR)).with_path(col_dir)?;
    for kind in crate::index::FILTER_KINDS {
        let dir = col_dir.join(COL_FILTER_DIR).join(kind);
        fs::create_dir_all(&dir).with_path(&dir)?;
    }
    write_column_meta(&col_dir.join(COL_META_FILE), meta, pss, false)?;
    let dn = col_dir.join(COL_DN_FILE);
    File::create(&dn).with_path(&dn)?.set_len(dn_size).with_path(&dn)?;
    let data = col_dir.join(COL_DATA_FILE);
    File::create(&data).with_path(&data)?;
    let hdr = ColumnVersionHeader { min: i64::MAX, max: i64::MIN, ..Default::default() };
    write_column_version(&column_version_path(col_dir, TxId::ZERO), &hdr, &[], false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn remove_stale_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("V.1");
        remove_stale(&p);
        write_file(&p, b"x", false).unwrap();
        remove_stale(&p);
        assert!(!p.exists());
    }

    #[test]
    fn table_meta_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join(TABLE_DESC_FILE);
        TableMeta { table_id: 9, pack_size_shift: 16 }.write(&p, false).unwrap();
        assert_eq!(TableMeta::read(&p).unwrap().table_id, 9);

        let mut raw = read_file(&p).unwrap();
        raw[0] ^= 1;
        write_file(&p, &raw, false).unwrap();
        assert!(matches!(TableMeta::read(&p), Err(OlapError::Database(_))));
    }

    #[test]
    fn table_meta_rejects_oversized_pack() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join(TABLE_DESC_FILE);
        TableMeta { table_id: 1, pack_size_shift: MAX_PSS + 1 }.write(&p, false).unwrap();
        assert!(TableMeta::read(&p).is_err());
    }

    #[test]
    fn column_meta_keeps_flags() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join(COL_META_FILE);
        let meta = ColumnMeta::new("city", ColumnType::Varchar).with_bloom().not_null();
        write_column_meta(&p, &meta, 12, false).unwrap();
        let (back, pss) = read_column_meta(&p).unwrap();
        assert_eq!(pss, 12);
        assert_eq!(back.name, "city");
        assert!(back.bloom && !back.is_nullable);
        assert_eq!(back.column_type, ColumnType::Varchar);
    }

    #[test]
    fn column_version_lists_packs() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("v");
        let hdr = ColumnVersionHeader { num_of_records: 10, num_of_nulls: 2, min: -3, max: 8, ..Default::default() };
        write_column_version(&p, &hdr, &[PackIndex(4), PackIndex(0)], false).unwrap();
        let (h, idx) = read_column_version(&p).unwrap();
        assert_eq!(h.num_of_packs, 2);
        assert_eq!((h.num_of_records, h.min, h.max), (10, -3, 8));
        assert_eq!(idx, vec![PackIndex(4), PackIndex(0)]);
    }
}
