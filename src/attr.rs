//! Attr：绑定到某个列版本的列视图
//!
//! 读快照中的 Attr 只读；写快照中的 Attr 持有写事务 ID，修改时对包做
//! 写时复制（分配 `local` DPN），提交时由 [`Attr::save_version`] 落盘、
//! [`Attr::post_commit`] 发布，或由 [`Attr::rollback`] 丢弃。

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;
use crate::column_share::ColumnShare;
use crate::common::{
    ColumnId, OlapError, PackIndex, Result, TxId, MINUS_INF_64, PLUS_INF_64,
};
use crate::config::StorageConfig;
use crate::dpn::{str_prefix, Dpn};
use crate::field_type::{ColumnMeta, ColumnType, CompressionType, PackType, Value};
use crate::index::{self, Bloom, CMap, Histogram};
use crate::meta::{self, ColumnVersionHeader, COL_VERSION_DIR};
use crate::pack::{Pack, PackSource};
use crate::pack_orderer::ColumnStats;
use crate::transaction::KillSwitch;

pub struct Attr {
    pub(crate) share:   Arc<ColumnShare>,
    pub(crate) config:  Arc<StorageConfig>,
    version:            TxId,
    /// 写快照所属事务
    tx:                 Option<TxId>,
    /// 低于此值的退役 DPN 可被复用
    reclaim_floor:      TxId,
    pub(crate) hdr:     ColumnVersionHeader,
    /// 逻辑包号 → DPN 槽位
    pub(crate) idx:     Vec<PackIndex>,
    no_change:          bool,
    /// 写事务持有的可变包
    local_packs:        BTreeMap<usize, Pack>,
    pub(crate) hist:    Option<Histogram>,
    pub(crate) cmap:    Option<CMap>,
    pub(crate) bloom:   Option<Bloom>,
}

impl std::fmt::Debug for Attr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attr")
            .field("column", &self.share.col_id())
            .field("version", &self.version)
            .field("tx", &self.tx)
            .field("packs", &self.idx.len())
            .finish()
    }
}

/// 读取包内容的句柄：写事务的本地包或已固定的共享包
pub enum PackView<'a> {
    Local(&'a Pack),
    Pinned(PinnedPack),
}

impl Deref for PackView<'_> {
    type Target = Pack;
    fn deref(&self) -> &Pack {
        match self {
            Self::Local(p)  => p,
            Self::Pinned(p) => &p.pack,
        }
    }
}

/// 校验后的待写入值
#[derive(Debug, Clone, Copy)]
enum Cell<'v> {
    Null,
    Int(i64),
    Str(&'v [u8]),
}

/// 离开作用域时释放包缓存引用
pub struct PinnedPack {
    share: Arc<ColumnShare>,
    idx:   PackIndex,
    pack:  Arc<Pack>,
}

impl Drop for PinnedPack {
    fn drop(&mut self) { self.share.unlock_pack(self.idx); }
}

impl Attr {
    pub fn open(
        share:         Arc<ColumnShare>,
        config:        Arc<StorageConfig>,
        version:       TxId,
        tx:            Option<TxId>,
        reclaim_floor: TxId,
    ) -> Result<Self> {
        let dir = share.dir().to_path_buf();
        let (hdr, idx) = meta::read_column_version(&meta::column_version_path(&dir, version))?;
        let writable = tx.is_some();
        let meta = share.meta().clone();

        let mut hist = None;
        let mut cmap = None;
        match meta.pack_type() {
            PackType::Int => {
                hist = index::load::<Histogram>(&dir, version)
                    .or_else(|| writable.then(|| Histogram::new(meta.column_type.is_fixed())));
            }
            PackType::Str => {
                cmap = index::load::<CMap>(&dir, version)
                    .or_else(|| writable.then(|| CMap::new(config.cmap_positions)));
            }
        }
        let bloom = if meta.bloom {
            index::load::<Bloom>(&dir, version)
                .or_else(|| writable.then(|| Bloom::new(config.bloom_bits_per_key)))
        } else {
            None
        };

        Ok(Self {
            share, config, version, tx, reclaim_floor, hdr, idx,
            no_change: true,
            local_packs: BTreeMap::new(),
            hist, cmap, bloom,
        })
    }

    pub fn col_id(&self)       -> ColumnId    { self.share.col_id() }
    pub fn meta(&self)         -> &ColumnMeta { self.share.meta() }
    pub fn column_type(&self)  -> ColumnType  { self.meta().column_type }
    pub fn pack_type(&self)    -> PackType    { self.meta().pack_type() }
    pub fn version(&self)      -> TxId        { self.version }
    pub fn num_of_obj(&self)   -> u64         { self.hdr.num_of_records }
    pub fn num_of_nulls(&self) -> u64         { self.hdr.num_of_nulls }
    pub fn num_of_deleted(&self) -> u64       { self.hdr.num_of_deleted }
    pub fn num_of_packs(&self) -> usize       { self.idx.len() }
    pub fn header(&self)       -> &ColumnVersionHeader { &self.hdr }
    pub fn pack_indices(&self) -> &[PackIndex] { &self.idx }
    pub fn has_changes(&self)  -> bool        { !self.no_change }

    pub fn pack_size(&self) -> usize { 1usize << self.share.pss() }

    pub fn dpn(&self, pack_no: usize) -> Dpn { self.share.get_dpn(self.idx[pack_no]) }

    fn locate(&self, row: u64) -> (usize, usize) {
        let pss = self.share.pss();
        ((row >> pss) as usize, (row & ((1u64 << pss) - 1)) as usize)
    }

    fn write_tx(&self) -> Result<TxId> {
        self.tx.ok_or_else(|| OlapError::Unsupported("write on a read-only snapshot".into()))
    }

    // ── 读 ────────────────────────────────────────────────────────────────────

    /// 取包内容；共享包在返回值存活期间保持固定
    pub fn pack(&self, pack_no: usize) -> Result<PackView<'_>> {
        if let Some(p) = self.local_packs.get(&pack_no) {
            return Ok(PackView::Local(p));
        }
        let idx = self.idx[pack_no];
        let pack = self.share.lock_pack_for_use(idx)?;
        Ok(PackView::Pinned(PinnedPack { share: self.share.clone(), idx, pack }))
    }

    /// 显式固定（供 PackGuardian 使用），返回被固定的槽位；本地包无需固定
    pub fn lock_pack_for_use(&self, pack_no: usize) -> Result<Option<PackIndex>> {
        if self.local_packs.contains_key(&pack_no) { return Ok(None); }
        let idx = self.idx[pack_no];
        self.share.lock_pack_for_use(idx)?;
        Ok(Some(idx))
    }

    pub fn get_value(&self, row: u64) -> Result<Value> {
        if row >= self.num_of_obj() {
            return Err(OlapError::Unsupported(format!("row {row} out of range")));
        }
        let (pack_no, off) = self.locate(row);
        let dpn = self.dpn(pack_no);
        if !self.local_packs.contains_key(&pack_no) {
            if dpn.null_only() { return Ok(Value::Null); }
            if dpn.trivial()   { return Ok(Value::from_pack_int(dpn.min_i, self.column_type())); }
        }
        let pack = self.pack(pack_no)?;
        Ok(self.value_at(&pack, off))
    }

    fn value_at(&self, pack: &Pack, off: usize) -> Value {
        if pack.is_null(off) {
            return Value::Null;
        }
        match self.pack_type() {
            PackType::Int => Value::from_pack_int(pack.get_val_int(off), self.column_type()),
            PackType::Str => Value::Bytes(pack.get_val_binary(off).to_vec()),
        }
    }

    /// 顺序扫描全部未删除行，按 kill 间隔检查取消
    pub fn scan<F>(&self, kill: &KillSwitch, mut f: F) -> Result<()>
    where
        F: FnMut(u64, Value) -> Result<()>,
    {
        let pack_size = self.pack_size() as u64;
        for pack_no in 0..self.num_of_packs() {
            let pack = self.pack(pack_no)?;
            let base = pack_no as u64 * pack_size;
            for off in 0..pack.len() {
                let row = base + off as u64;
                kill.check(row)?;
                if pack.is_deleted(off) { continue; }
                f(row, self.value_at(&pack, off))?;
            }
        }
        Ok(())
    }

    // ── 写 ────────────────────────────────────────────────────────────────────

    /// 已提交的包先复制出本地 DPN 与可变包
    fn copy_pack_for_write(&mut self, pack_no: usize) -> Result<()> {
        let tx = self.write_tx()?;
        let old_idx = self.idx[pack_no];
        let old = self.share.get_dpn(old_idx);
        if old.local {
            if !self.local_packs.contains_key(&pack_no) {
                let pack = self.share.load_pack(&old)?;
                self.local_packs.insert(pack_no, pack);
            }
            return Ok(());
        }
        let pack = self.share.load_pack(&old)?;
        let new_idx = self.share.alloc_dpn(tx, Some(old_idx), self.reclaim_floor)?;
        debug!(column = self.col_id(), pack_no, from = old_idx.0, to = new_idx.0, "copy pack for write");
        // 副本不得与来源共用负载段
        self.share.update_dpn(new_idx, |d| d.synced = false);
        self.idx[pack_no] = new_idx;
        self.local_packs.insert(pack_no, pack);
        self.no_change = false;
        Ok(())
    }

    fn prepare_pack_for_load(&mut self) -> Result<usize> {
        let tx = self.write_tx()?;
        let full = self.idx.last()
            .map_or(true, |&i| self.share.get_dpn(i).num_of_records as usize >= self.pack_size());
        if full {
            let new_idx = self.share.alloc_dpn(tx, None, self.reclaim_floor)?;
            self.idx.push(new_idx);
            self.local_packs.insert(self.idx.len() - 1, Pack::new(self.pack_type()));
        } else {
            self.copy_pack_for_write(self.idx.len() - 1)?;
        }
        Ok(self.idx.len() - 1)
    }

    /// 按列类型检查一批值，不写入
    pub fn check_values(&self, values: &[Value]) -> Result<()> {
        self.to_cells(values).map(|_| ())
    }

    fn to_cells<'v>(&self, values: &'v [Value]) -> Result<Vec<Cell<'v>>> {
        let column_type = self.column_type();
        let nullable = self.meta().is_nullable;
        values.iter().map(|v| {
            if v.is_null() {
                return if nullable {
                    Ok(Cell::Null)
                } else {
                    Err(OlapError::Encoding("null value in NOT NULL column".into()))
                };
            }
            match column_type.pack_type() {
                PackType::Int => Ok(v.to_pack_int(column_type)?.map_or(Cell::Null, Cell::Int)),
                PackType::Str => v.as_bytes().map(Cell::Str).ok_or_else(|| {
                    OlapError::Encoding(format!("value {v} is not a string"))
                }),
            }
        }).collect()
    }

    /// 追加一批值，按包大小切分；任一值不合法时整批不写
    pub fn load_data(&mut self, values: &[Value]) -> Result<()> {
        self.write_tx()?;
        let cells = self.to_cells(values)?;
        let mut rest = cells.as_slice();
        while !rest.is_empty() {
            let pack_no = self.prepare_pack_for_load()?;
            let pack_size = self.pack_size();
            let pack = self.local_pack_mut(pack_no)?;
            let n = (pack_size - pack.len()).min(rest.len());
            let (chunk, tail) = rest.split_at(n);
            let mut nulls = 0u64;
            for cell in chunk {
                match *cell {
                    Cell::Null   => { pack.push_null(); nulls += 1; }
                    Cell::Int(x) => pack.push_int(x),
                    Cell::Str(b) => pack.push_str(b),
                }
            }
            self.hdr.num_of_records += n as u64;
            self.hdr.num_of_nulls   += nulls;
            self.refresh_dpn_stats(pack_no)?;
            rest = tail;
        }
        self.no_change = false;
        Ok(())
    }

    pub fn update_value(&mut self, row: u64, value: &Value) -> Result<()> {
        if row >= self.num_of_obj() {
            return Err(OlapError::Unsupported(format!("row {row} out of range")));
        }
        if value.is_null() && !self.meta().is_nullable {
            return Err(OlapError::Encoding("null value in NOT NULL column".into()));
        }
        let (pack_no, off) = self.locate(row);
        self.copy_pack_for_write(pack_no)?;
        let column_type = self.column_type();
        let pack = self.local_pack_mut(pack_no)?;
        let was_null = pack.is_null(off);
        match (value, column_type.pack_type()) {
            (Value::Null, _) => pack.set_null(off),
            (v, PackType::Int) => match v.to_pack_int(column_type)? {
                Some(x) => pack.set_int(off, x),
                None    => pack.set_null(off),
            },
            (v, PackType::Str) => {
                let b = v.as_bytes()
                    .ok_or_else(|| OlapError::Encoding(format!("value {v} is not a string")))?;
                pack.set_str(off, b);
            }
        }
        let is_null = pack.is_null(off);
        match (was_null, is_null) {
            (false, true) => self.hdr.num_of_nulls += 1,
            (true, false) => self.hdr.num_of_nulls -= 1,
            _             => {}
        }
        self.refresh_dpn_stats(pack_no)?;
        self.no_change = false;
        Ok(())
    }

    pub fn delete_value(&mut self, row: u64) -> Result<()> {
        if row >= self.num_of_obj() {
            return Err(OlapError::Unsupported(format!("row {row} out of range")));
        }
        let (pack_no, off) = self.locate(row);
        self.copy_pack_for_write(pack_no)?;
        if self.local_pack_mut(pack_no)?.delete(off) {
            self.hdr.num_of_deleted += 1;
            self.refresh_dpn_stats(pack_no)?;
            self.no_change = false;
        }
        Ok(())
    }

    fn local_pack_mut(&mut self, pack_no: usize) -> Result<&mut Pack> {
        self.local_packs.get_mut(&pack_no)
            .ok_or_else(|| OlapError::System(format!("pack {pack_no} is not writable")))
    }

    /// 按本地包内容重算 DPN 统计量；该包的过滤器作废，提交时重建
    fn refresh_dpn_stats(&mut self, pack_no: usize) -> Result<()> {
        if let Some(h) = self.hist.as_mut()  { h.invalidate(pack_no); }
        if let Some(c) = self.cmap.as_mut()  { c.invalidate(pack_no); }
        if let Some(b) = self.bloom.as_mut() { b.invalidate(pack_no); }
        let is_real = self.column_type().is_real();
        let pack = self.local_packs.get(&pack_no)
            .ok_or_else(|| OlapError::System(format!("pack {pack_no} is not writable")))?;
        let stats = PackStats::compute(pack, is_real);
        self.share.update_dpn(self.idx[pack_no], |d| {
            d.num_of_records = pack.len() as u32;
            d.num_of_nulls   = pack.num_nulls() as u32;
            d.num_of_deleted = pack.num_deleted() as u32;
            d.min_i  = stats.min;
            d.max_i  = stats.max;
            d.sum_i  = stats.sum;
            d.synced = false;
        });
        Ok(())
    }

    // ── 提交 ──────────────────────────────────────────────────────────────────

    /// 持久化本地包、过滤器与列版本文件；无修改返回 false
    pub fn save_version(&mut self) -> Result<bool> {
        let Some(tx) = self.tx else { return Ok(false); };
        if self.no_change {
            return Ok(false);
        }
        let sync = self.config.sync_buffers;
        let meta = self.meta().clone();
        // 列声明为不压缩时优先，否则用引擎配置
        let comp = match meta.compression {
            CompressionType::None => CompressionType::None,
            _                     => self.config.compression,
        };

        for (&pack_no, pack) in &self.local_packs {
            let idx = self.idx[pack_no];
            let dpn = self.share.get_dpn(idx);
            if !dpn.local { continue; }
            refresh_filters(&mut self.hist, &mut self.cmap, &mut self.bloom, meta.column_type, pack_no, &dpn, pack);
            if dpn.trivial() {
                self.share.drop_payload(idx);
            } else if !dpn.synced {
                let bytes = pack.save(meta.encoding, comp)?;
                self.share.write_payload(idx, &bytes)?;
            }
        }

        self.recompute_header();
        let dir = self.share.dir().to_path_buf();
        if let Some(h) = &self.hist  { index::save(&dir, tx, h, sync)?; }
        if let Some(c) = &self.cmap  { index::save(&dir, tx, c, sync)?; }
        if let Some(b) = &self.bloom { index::save(&dir, tx, b, sync)?; }
        meta::write_column_version(&meta::column_version_path(&dir, tx), &self.hdr, &self.idx, sync)?;

        self.share.sync_dpns()?;
        if sync {
            self.share.sync_data()?;
            meta::fsync_dir(&dir.join(COL_VERSION_DIR))?;
            for kind in index::FILTER_KINDS {
                meta::fsync_dir(&dir.join(meta::COL_FILTER_DIR).join(kind))?;
            }
        }
        debug!(column = self.col_id(), tx = %tx, packs = self.idx.len(), "column version saved");
        Ok(true)
    }

    fn recompute_header(&mut self) {
        let is_real = self.column_type().is_real();
        let mut min = PLUS_INF_64;
        let mut max = MINUS_INF_64;
        let mut compressed = 0u64;
        for &i in &self.idx {
            let d = self.share.get_dpn(i);
            compressed += d.data_length;
            if d.null_only() || self.pack_type() == PackType::Str { continue; }
            if is_real {
                if min == PLUS_INF_64 || d.min_d() < f64::from_bits(min as u64) { min = d.min_i; }
                if max == MINUS_INF_64 || d.max_d() > f64::from_bits(max as u64) { max = d.max_i; }
            } else {
                min = min.min(d.min_i);
                max = max.max(d.max_i);
            }
        }
        self.hdr.num_of_packs    = self.idx.len() as u32;
        self.hdr.min             = min;
        self.hdr.max             = max;
        self.hdr.compressed_size = compressed;
        self.hdr.natural_size    = self.hdr.num_of_records * 8;
    }

    /// 提交后：清 local、退役写时复制来源、删除旧列版本
    pub fn post_commit(&mut self, retire_xid: TxId) {
        let Some(tx) = self.tx.take() else { return; };
        if self.no_change {
            return;
        }
        for &pack_no in self.local_packs.keys() {
            let idx = self.idx[pack_no];
            let dpn = self.share.update_dpn(idx, |d| d.local = false);
            if dpn.base.is_valid() {
                self.share.update_dpn(dpn.base, |d| d.xmax = retire_xid);
                self.share.update_dpn(idx, |d| d.base = PackIndex::INVALID);
            }
        }
        self.local_packs.clear();
        let old = std::mem::replace(&mut self.version, tx);
        let dir = self.share.dir().to_path_buf();
        meta::remove_stale(&meta::column_version_path(&dir, old));
        index::remove_all(&dir, old);
        self.share.set_auto_inc(self.hdr.auto_inc);
        self.no_change = true;
    }

    /// 丢弃本地 DPN 以及失败提交可能留下的版本文件
    pub fn rollback(&mut self) {
        let Some(tx) = self.tx.take() else { return; };
        for &pack_no in self.local_packs.keys() {
            let idx = self.idx[pack_no];
            if self.share.get_dpn(idx).local {
                self.share.release_dpn(idx);
            }
        }
        self.local_packs.clear();
        if !self.no_change {
            let dir = self.share.dir().to_path_buf();
            meta::remove_stale(&meta::column_version_path(&dir, tx));
            index::remove_all(&dir, tx);
        }
        self.no_change = true;
    }
}

/// 按包内容重建该包的 Histogram / CMap / Bloom
fn refresh_filters(
    hist:        &mut Option<Histogram>,
    cmap:        &mut Option<CMap>,
    bloom:       &mut Option<Bloom>,
    column_type: ColumnType,
    pack_no:     usize,
    dpn:         &Dpn,
    pack:        &Pack,
) {
    if let Some(h) = hist.as_mut() {
        h.update(pack_no, dpn, Some(pack));
    }
    if let Some(c) = cmap.as_mut() {
        c.update(pack_no, dpn, Some(pack));
    }
    if let Some(b) = bloom.as_mut() {
        let keys: Vec<Vec<u8>> = (0..pack.len())
            .filter(|&r| !pack.is_null(r))
            .map(|r| bloom_key(pack, r, column_type))
            .collect();
        b.update(pack_no, keys.iter().map(|k| k.as_slice()));
    }
}

/// Bloom 键：数值取十进制文本
pub(crate) fn bloom_key(pack: &Pack, row: usize, column_type: ColumnType) -> Vec<u8> {
    match column_type.pack_type() {
        PackType::Str => pack.get_val_binary(row).to_vec(),
        PackType::Int => int_bloom_key(pack.get_val_int(row), column_type),
    }
}

pub(crate) fn int_bloom_key(v: i64, column_type: ColumnType) -> Vec<u8> {
    if column_type.is_real() {
        f64::from_bits(v as u64).to_string().into_bytes()
    } else {
        v.to_string().into_bytes()
    }
}

struct PackStats {
    min: i64,
    max: i64,
    sum: i64,
}

impl PackStats {
    fn compute(pack: &Pack, is_real: bool) -> Self {
        let rows = (0..pack.len()).filter(|&r| !pack.is_null(r));
        match pack.pack_type() {
            PackType::Int if is_real => {
                let mut st: Option<(f64, f64)> = None;
                let mut sum = 0f64;
                for r in rows {
                    let v = pack.get_val_double(r);
                    sum += v;
                    st = Some(match st {
                        None           => (v, v),
                        Some((lo, hi)) => (
                            if v.total_cmp(&lo).is_lt() { v } else { lo },
                            if v.total_cmp(&hi).is_gt() { v } else { hi },
                        ),
                    });
                }
                match st {
                    Some((lo, hi)) => Self {
                        min: lo.to_bits() as i64, max: hi.to_bits() as i64, sum: sum.to_bits() as i64,
                    },
                    None => Self { min: PLUS_INF_64, max: MINUS_INF_64, sum: 0 },
                }
            }
            PackType::Int => {
                let mut s = Self { min: PLUS_INF_64, max: MINUS_INF_64, sum: 0 };
                for r in rows {
                    let v = pack.get_val_int(r);
                    s.min = s.min.min(v);
                    s.max = s.max.max(v);
                    s.sum = s.sum.wrapping_add(v);
                }
                s
            }
            PackType::Str => {
                let mut lo: Option<&[u8]> = None;
                let mut hi: Option<&[u8]> = None;
                let mut max_len = 0usize;
                for r in rows {
                    let v = pack.get_val_binary(r);
                    max_len = max_len.max(v.len());
                    lo = Some(lo.map_or(v, |m| m.min(v)));
                    hi = Some(hi.map_or(v, |m| m.max(v)));
                }
                match (lo, hi) {
                    (Some(lo), Some(hi)) => Self {
                        min: i64::from_le_bytes(str_prefix(lo)),
                        max: i64::from_le_bytes(str_prefix(hi)),
                        sum: max_len as i64,
                    },
                    _ => Self { min: 0, max: -1, sum: 0 },
                }
            }
        }
    }
}

impl ColumnStats for Attr {
    fn num_packs(&self) -> usize { self.num_of_packs() }

    fn is_fixed(&self) -> bool { self.column_type().is_fixed() }

    fn pack_min_int(&self, pack: usize) -> i64 { self.dpn(pack).min_i }

    fn pack_max_int(&self, pack: usize) -> i64 { self.dpn(pack).max_i }

    fn pack_null_only(&self, pack: usize) -> bool { self.dpn(pack).null_only() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::ColumnMeta;
    use tempfile::TempDir;

    fn writable(dir: &std::path::Path, ct: ColumnType, pss: u8) -> Attr {
        let config = Arc::new(StorageConfig::default().with_pack_size_shift(pss).with_sync_buffers(false));
        let meta = ColumnMeta::new("c", ct);
        meta::create_column_dir(dir, &meta, pss, config.dpn_file_size).unwrap();
        let share = Arc::new(ColumnShare::open(dir, 0, TxId::ZERO, &config).unwrap());
        Attr::open(share, config, TxId::ZERO, Some(TxId(10)), TxId::ZERO).unwrap()
    }

    fn ints(v: &[Option<i64>]) -> Vec<Value> {
        v.iter().map(|x| x.map_or(Value::Null, Value::Int64)).collect()
    }

    #[test]
    fn pack_with_null_is_not_uniform() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Int64, 2);
        a.load_data(&ints(&[Some(1), None, Some(1), Some(1)])).unwrap();
        let d = a.dpn(0);
        assert_eq!((d.num_of_records, d.num_of_nulls, d.min_i, d.max_i), (4, 1, 1, 1));
        assert!(!d.uniform() && !d.null_only() && !d.trivial());
    }

    #[test]
    fn load_spills_into_new_packs() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Int32, 2);
        a.load_data(&ints(&[Some(1), Some(2), Some(3)])).unwrap();
        a.load_data(&ints(&[Some(4), Some(5), None, Some(7)])).unwrap();
        assert_eq!(a.num_of_packs(), 2);
        assert_eq!(a.num_of_obj(), 7);
        assert_eq!(a.num_of_nulls(), 1);
        assert_eq!(a.get_value(3).unwrap(), Value::Int64(4));
        assert_eq!(a.get_value(5).unwrap(), Value::Null);
        assert_eq!((a.dpn(1).min_i, a.dpn(1).max_i), (5, 7));
    }

    #[test]
    fn rejected_batch_leaves_column_untouched() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Int64, 2);
        a.load_data(&ints(&[Some(5)])).unwrap();
        assert!(matches!(
            a.load_data(&[Value::Int64(1), Value::Bytes(b"x".to_vec())]),
            Err(OlapError::Encoding(_))
        ));
        assert_eq!(a.num_of_obj(), 1);
        assert_eq!(a.dpn(0).num_of_records, 1);

        a.load_data(&ints(&[Some(2)])).unwrap();
        assert_eq!(a.num_of_obj(), 2);
        assert_eq!(a.dpn(0).num_of_records, 2);
        assert_eq!(a.get_value(1).unwrap(), Value::Int64(2));
    }

    #[test]
    fn null_in_not_null_column_is_rejected_up_front() {
        let tmp = TempDir::new().unwrap();
        let config = Arc::new(StorageConfig::default().with_pack_size_shift(2).with_sync_buffers(false));
        let meta = ColumnMeta::new("c", ColumnType::Int64).not_null();
        meta::create_column_dir(tmp.path(), &meta, 2, config.dpn_file_size).unwrap();
        let share = Arc::new(ColumnShare::open(tmp.path(), 0, TxId::ZERO, &config).unwrap());
        let mut a = Attr::open(share, config, TxId::ZERO, Some(TxId(10)), TxId::ZERO).unwrap();
        assert!(a.check_values(&ints(&[Some(1), None])).is_err());
        assert!(a.load_data(&ints(&[Some(1), Some(2), Some(3), Some(4), None])).is_err());
        assert_eq!(a.num_of_obj(), 0);
        assert_eq!(a.num_of_packs(), 0);
    }

    #[test]
    fn uniform_pack_has_no_payload_after_save() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Int64, 2);
        a.load_data(&ints(&[Some(9), Some(9), Some(9), Some(9), Some(1), Some(2)])).unwrap();
        assert!(a.save_version().unwrap());
        assert!(!a.dpn(0).has_payload());
        assert!(a.dpn(1).has_payload());
        a.post_commit(TxId(10));
        assert_eq!(a.get_value(2).unwrap(), Value::Int64(9));
        assert_eq!(a.get_value(4).unwrap(), Value::Int64(1));
        assert!(!a.dpn(1).local);
    }

    #[test]
    fn rollback_releases_local_dpns() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Varchar, 2);
        a.load_data(&[Value::Bytes(b"x".to_vec())]).unwrap();
        let idx = a.pack_indices()[0];
        a.rollback();
        assert!(!a.share.get_dpn(idx).used);
    }

    #[test]
    fn read_only_snapshot_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let a = writable(tmp.path(), ColumnType::Int64, 2);
        let mut ro = Attr::open(a.share.clone(), a.config.clone(), TxId::ZERO, None, TxId::ZERO).unwrap();
        assert!(ro.load_data(&ints(&[Some(1)])).is_err());
    }

    #[test]
    fn string_stats_use_prefixes() {
        let tmp = TempDir::new().unwrap();
        let mut a = writable(tmp.path(), ColumnType::Varchar, 3);
        let vals: Vec<Value> = [&b"banana"[..], b"apple", b"cherry-pie-long"]
            .iter().map(|s| Value::Bytes(s.to_vec())).collect();
        a.load_data(&vals).unwrap();
        let d = a.dpn(0);
        assert_eq!(&d.min_s()[..5], b"apple");
        assert_eq!(&d.max_s(), b"cherry-p");
        assert_eq!(d.max_len(), 15);
        assert!(!d.trivial());
    }
}
