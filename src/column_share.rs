//! ColumnShare：一列在所有事务间共享的物理状态
//!
//! - DPN 数组：定长文件 `DN`，整体 mmap；槽位以 [`PackIndex`] 寻址
//! - 负载文件 `DATA`：按 (dataAddress, dataLength) 定位压缩包
//! - 段表：按偏移排序的已占用区间，首次适配分配
//!
//! DPN 与段表只由当前唯一的写事务修改；读者只会访问已提交的 DPN。

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};
use crate::common::{ColumnId, FileContext, OlapError, PackIndex, Result, TxId};
use crate::config::{StorageConfig, DPN_INC_CNT, DPN_SIZE};
use crate::dpn::{Dpn, DpnSlot, DPN_INVALID_ADDR};
use crate::field_type::{ColumnMeta, PackType};
use crate::meta::{self, COL_DATA_FILE, COL_DN_FILE, COL_META_FILE};
use crate::pack::Pack;

/// 并发首次加载时的等待间隔
const LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seg {
    offset: u64,
    len:    u64,
    idx:    PackIndex,
}

pub struct ColumnShare {
    dir:       PathBuf,
    col_id:    ColumnId,
    meta:      ColumnMeta,
    pss:       u8,
    max_dpns:  usize,
    slots:     RwLock<Vec<Arc<DpnSlot>>>,
    dn:        Mutex<MmapMut>,
    data_file: File,
    segs:      Mutex<Vec<Seg>>,
    auto_inc:  AtomicU64,
}

impl std::fmt::Debug for ColumnShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnShare")
            .field("dir", &self.dir)
            .field("col_id", &self.col_id)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl ColumnShare {
    /// 打开列目录，并按 `version` 指向的列版本重建 DPN 使用状态
    pub fn open(dir: &Path, col_id: ColumnId, version: TxId, config: &StorageConfig) -> Result<Self> {
        let (meta, pss) = meta::read_column_meta(&dir.join(COL_META_FILE))?;

        let dn_path = dir.join(COL_DN_FILE);
        let dn_file = OpenOptions::new().read(true).write(true).open(&dn_path).with_path(&dn_path)?;
        let mut len = dn_file.metadata().with_path(&dn_path)?.len();
        if len < config.dpn_file_size {
            dn_file.set_len(config.dpn_file_size).with_path(&dn_path)?;
            len = config.dpn_file_size;
        }
        // SAFETY: DN 文件只由本进程内的 ColumnShare 修改，且文件长度在映射期间不变
        let dn = unsafe { MmapMut::map_mut(&dn_file) }.with_path(&dn_path)?;

        let data_path = dir.join(COL_DATA_FILE);
        let data_file = OpenOptions::new().read(true).write(true).open(&data_path).with_path(&data_path)?;

        let share = Self {
            dir: dir.to_path_buf(),
            col_id,
            meta,
            pss,
            max_dpns:  len as usize / DPN_SIZE,
            slots:     RwLock::new(Vec::new()),
            dn:        Mutex::new(dn),
            data_file,
            segs:      Mutex::new(Vec::new()),
            auto_inc:  AtomicU64::new(0),
        };
        share.scan_dpn(version)?;
        Ok(share)
    }

    pub fn dir(&self)       -> &Path       { &self.dir }
    pub fn col_id(&self)    -> ColumnId    { self.col_id }
    pub fn meta(&self)      -> &ColumnMeta { &self.meta }
    pub fn pss(&self)       -> u8          { self.pss }
    pub fn pack_type(&self) -> PackType    { self.meta.pack_type() }
    pub fn capacity(&self)  -> usize       { self.slots.read().len() }
    pub fn auto_inc(&self)  -> u64         { self.auto_inc.load(Ordering::Acquire) }

    pub fn set_auto_inc(&self, v: u64) { self.auto_inc.store(v, Ordering::Release); }

    /// 只保留当前版本引用的 DPN，其余槽位释放
    fn scan_dpn(&self, version: TxId) -> Result<()> {
        let (hdr, idx) = meta::read_column_version(&meta::column_version_path(&self.dir, version))?;
        self.auto_inc.store(hdr.auto_inc, Ordering::Release);

        if idx.iter().any(|i| i.as_usize() >= self.max_dpns) {
            return Err(OlapError::Database(format!("bad dpn index: {}", self.dir.display())));
        }
        let referenced: HashSet<PackIndex> = idx.iter().copied().collect();
        let capacity = idx.iter().map(|i| i.as_usize() + 1).max()
            .map_or(0, |n| n.div_ceil(DPN_INC_CNT) * DPN_INC_CNT)
            .min(self.max_dpns);

        let mut slots = Vec::with_capacity(capacity);
        let mut segs = Vec::new();
        {
            let mut dn = self.dn.lock();
            for i in 0..capacity {
                let rec = &mut dn[i * DPN_SIZE..(i + 1) * DPN_SIZE];
                let mut dpn = Dpn::decode(rec);
                if referenced.contains(&PackIndex::from(i)) {
                    dpn.used   = true;
                    dpn.base   = PackIndex::INVALID;
                    dpn.synced = true;
                    dpn.xmax   = TxId::MAX;
                    if dpn.local {
                        warn!(path = %self.dir.display(), pack = i, "uncommitted pack found");
                        dpn.local = false;
                    }
                    if dpn.has_payload() {
                        segs.push(Seg { offset: dpn.data_address, len: dpn.data_length, idx: PackIndex::from(i) });
                    }
                } else {
                    dpn = Dpn::default();
                }
                dpn.encode(rec);
                slots.push(Arc::new(DpnSlot::new(dpn)));
            }
        }

        segs.sort_by_key(|s| s.offset);
        for w in segs.windows(2) {
            if w[1].offset < w[0].offset + w[0].len {
                for s in &segs {
                    error!(pack = s.idx.0, offset = s.offset, len = s.len, "segment");
                }
                return Err(OlapError::Database(format!("bad DPN index file: {}", self.dir.display())));
            }
        }
        *self.slots.write() = slots;
        *self.segs.lock() = segs;
        Ok(())
    }

    // ── DPN 槽位 ──────────────────────────────────────────────────────────────

    /// 越界访问属于编程错误
    pub fn slot(&self, idx: PackIndex) -> Arc<DpnSlot> {
        let slots = self.slots.read();
        assert!(idx.as_usize() < slots.len(), "dpn index {} out of range {}", idx.0, slots.len());
        slots[idx.as_usize()].clone()
    }

    pub fn get_dpn(&self, idx: PackIndex) -> Dpn { self.slot(idx).get() }

    fn store(&self, idx: PackIndex, dpn: &Dpn) {
        let i = idx.as_usize();
        dpn.encode(&mut self.dn.lock()[i * DPN_SIZE..(i + 1) * DPN_SIZE]);
    }

    pub fn update_dpn<F: FnOnce(&mut Dpn)>(&self, idx: PackIndex, f: F) -> Dpn {
        let slot = self.slot(idx);
        let mut dpn = slot.dpn.write();
        f(&mut dpn);
        self.store(idx, &dpn);
        *dpn
    }

    /// 分配新 DPN；有 `from` 时写时复制其统计量与负载引用
    ///
    /// 优先复用未使用的槽位，或 xmax 早于 `reclaim_floor` 的已退役槽位。
    pub fn alloc_dpn(&self, xid: TxId, from: Option<PackIndex>, reclaim_floor: TxId) -> Result<PackIndex> {
        let src = from.map(|i| (i, self.get_dpn(i)));
        let src_ref = src.as_ref().map(|(i, d)| (*i, d));
        let pack_type = self.pack_type();

        let mut slots = self.slots.write();
        for (i, slot) in slots.iter().enumerate() {
            let idx = PackIndex::from(i);
            if Some(idx) == from { continue; }
            let mut dpn = slot.dpn.write();
            if dpn.used && dpn.xmax >= reclaim_floor { continue; }
            if dpn.used {
                debug!(path = %self.dir.display(), pack = i, xmax = %dpn.xmax, "reclaiming retired dpn");
                slot.pack.reset();
                self.segs.lock().retain(|s| s.idx != idx);
            }
            *dpn = Dpn::init(xid, pack_type, src_ref);
            self.store(idx, &dpn);
            return Ok(idx);
        }

        if slots.len() >= self.max_dpns {
            return Err(OlapError::OutOfMemory(format!(
                "failed to allocate new DN: {} ({} slots)", self.dir.display(), self.max_dpns)));
        }
        let first_new = slots.len();
        let new_cap = (first_new + DPN_INC_CNT).min(self.max_dpns);
        slots.extend((first_new..new_cap).map(|_| Arc::new(DpnSlot::default())));
        let idx = PackIndex::from(first_new);
        let dpn = Dpn::init(xid, pack_type, src_ref);
        *slots[first_new].dpn.write() = dpn;
        self.store(idx, &dpn);
        debug!(path = %self.dir.display(), capacity = new_cap, "dpn array grown");
        Ok(idx)
    }

    /// 丢弃写事务的本地 DPN
    pub fn release_dpn(&self, idx: PackIndex) {
        let slot = self.slot(idx);
        slot.pack.reset();
        self.segs.lock().retain(|s| s.idx != idx);
        let mut dpn = slot.dpn.write();
        *dpn = Dpn::default();
        self.store(idx, &dpn);
    }

    pub fn sync_dpns(&self) -> Result<()> {
        self.dn.lock().flush().with_path(&self.dir.join(COL_DN_FILE))
    }

    // ── 负载段 ────────────────────────────────────────────────────────────────

    /// 首次适配：第一个能容纳 len 的空洞，否则追加到末尾
    pub fn alloc_seg(&self, idx: PackIndex, len: u64) -> u64 {
        let mut segs = self.segs.lock();
        let mut prev = 0u64;
        for (pos, s) in segs.iter().enumerate() {
            if s.offset - prev >= len {
                segs.insert(pos, Seg { offset: prev, len, idx });
                return prev;
            }
            prev = s.offset + s.len;
        }
        segs.push(Seg { offset: prev, len, idx });
        prev
    }

    pub fn free_seg(&self, idx: PackIndex) {
        self.segs.lock().retain(|s| s.idx != idx);
    }

    /// 写出包负载并更新 DPN 的地址
    pub fn write_payload(&self, idx: PackIndex, bytes: &[u8]) -> Result<()> {
        self.free_seg(idx);
        let addr = self.alloc_seg(idx, bytes.len() as u64);
        let path = self.dir.join(COL_DATA_FILE);
        if let Err(e) = self.data_file.write_all_at(bytes, addr) {
            self.free_seg(idx);
            return Err(e).with_path(&path);
        }
        self.update_dpn(idx, |d| {
            d.data_address = addr;
            d.data_length  = bytes.len() as u64;
            d.synced       = true;
        });
        Ok(())
    }

    /// 平凡包不占负载
    pub fn drop_payload(&self, idx: PackIndex) {
        self.free_seg(idx);
        self.update_dpn(idx, |d| {
            d.data_address = DPN_INVALID_ADDR;
            d.data_length  = 0;
            d.synced       = true;
        });
    }

    pub fn sync_data(&self) -> Result<()> {
        self.data_file.sync_all().with_path(&self.dir.join(COL_DATA_FILE))
    }

    /// 从 DPN 物化解压包
    pub fn load_pack(&self, dpn: &Dpn) -> Result<Pack> {
        let rows = dpn.num_of_records as usize;
        if dpn.null_only() {
            return Ok(Pack::null_only(self.pack_type(), rows));
        }
        if dpn.trivial() {
            return Ok(Pack::uniform_int(dpn.min_i, rows));
        }
        if !dpn.has_payload() {
            return Err(OlapError::Database(format!(
                "non-trivial pack without payload: {}", self.dir.display())));
        }
        let path = self.dir.join(COL_DATA_FILE);
        let mut buf = vec![0u8; dpn.data_length as usize];
        self.data_file.read_exact_at(&mut buf, dpn.data_address).with_path(&path)?;
        let pack = Pack::load(&buf)?;
        if pack.len() != rows {
            return Err(OlapError::Database(format!(
                "pack at {} has {} rows, dpn says {rows}", dpn.data_address, pack.len())));
        }
        Ok(pack)
    }

    // ── 包缓存 ────────────────────────────────────────────────────────────────

    /// 固定并返回解压包；首个加载者负责解压，其他线程等待
    pub fn lock_pack_for_use(&self, idx: PackIndex) -> Result<Arc<Pack>> {
        let slot = self.slot(idx);
        loop {
            if slot.pack.inc_ref() {
                return slot.pack.get().ok_or_else(|| {
                    OlapError::System(format!("pack {} pinned but not cached", idx.0))
                });
            }
            if slot.pack.begin_load() {
                return match self.load_pack(&slot.get()) {
                    Ok(pack) => {
                        debug!(path = %self.dir.display(), pack = idx.0, "pack loaded");
                        let pack = Arc::new(pack);
                        slot.pack.finish_load(pack.clone());
                        Ok(pack)
                    }
                    Err(e) => {
                        slot.pack.abort_load();
                        Err(e)
                    }
                };
            }
            std::thread::sleep(LOAD_RETRY_INTERVAL);
        }
    }

    pub fn unlock_pack(&self, idx: PackIndex) {
        self.slot(idx).pack.dec_ref();
    }
}
