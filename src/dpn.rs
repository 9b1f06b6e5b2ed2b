//! DPN（Data Pack Node）：每个包一条定长元数据记录
//!
//! 磁盘布局（88 字节，小端）：
//! ```text
//! ┌─────┬──────────────────────────────────────────────┐
//! │  0  │ flags u8   bit0 used / bit1 local / bit2 synced│
//! │     │            bit3 string_pack                  │
//! │  4  │ base            u32                          │
//! │  8  │ numOfRecords    u32                          │
//! │ 12  │ numOfNulls      u32                          │
//! │ 16  │ numOfDeleted    u32                          │
//! │ 24  │ dataAddress     u64                          │
//! │ 32  │ dataLength      u64                          │
//! │ 40  │ xmin            u64                          │
//! │ 48  │ xmax            u64                          │
//! │ 56  │ min  (i64 / f64 / 8 字节前缀)                │
//! │ 64  │ max                                          │
//! │ 72  │ sum  (字符串包为最大长度)                    │
//! │ 80  │ 包缓存标记（磁盘上恒为 0）                   │
//! └─────┴──────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use crate::common::{PackIndex, TxId, MINUS_INF_64, PLUS_INF_64};
use crate::config::DPN_SIZE;
use crate::field_type::PackType;
use crate::pack::Pack;

/// 无负载时的 dataAddress
pub const DPN_INVALID_ADDR: u64 = u64::MAX;

const FLAG_USED:   u8 = 1;
const FLAG_LOCAL:  u8 = 1 << 1;
const FLAG_SYNCED: u8 = 1 << 2;
const FLAG_STRING: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dpn {
    pub used:           bool,
    /// 由单个写事务独占，尚未提交
    pub local:          bool,
    /// 磁盘负载与内存包一致
    pub synced:         bool,
    pub string_pack:    bool,
    /// 写时复制的来源槽位
    pub base:           PackIndex,
    pub num_of_records: u32,
    pub num_of_nulls:   u32,
    pub num_of_deleted: u32,
    pub data_address:   u64,
    pub data_length:    u64,
    pub xmin:           TxId,
    pub xmax:           TxId,
    pub min_i:          i64,
    pub max_i:          i64,
    pub sum_i:          i64,
}

impl Default for Dpn {
    fn default() -> Self {
        Self {
            used: false, local: false, synced: false, string_pack: false,
            base: PackIndex::INVALID,
            num_of_records: 0, num_of_nulls: 0, num_of_deleted: 0,
            data_address: DPN_INVALID_ADDR, data_length: 0,
            xmin: TxId::ZERO, xmax: TxId::ZERO,
            min_i: 0, max_i: 0, sum_i: 0,
        }
    }
}

impl Dpn {
    /// 新分配的 DPN 总是归写会话所有
    pub fn init(xid: TxId, pack_type: PackType, from: Option<(PackIndex, &Dpn)>) -> Self {
        let mut dpn = match from {
            Some((_, src)) => *src,
            None => {
                let mut d = Dpn::default();
                match pack_type {
                    PackType::Int => { d.min_i = PLUS_INF_64; d.max_i = MINUS_INF_64; }
                    PackType::Str => { d.min_i = 0; d.max_i = -1; d.string_pack = true; }
                }
                d
            }
        };
        dpn.used   = true;
        dpn.local  = true;
        dpn.synced = true;
        dpn.base   = from.map(|(i, _)| i).unwrap_or(PackIndex::INVALID);
        dpn.xmin   = xid;
        dpn.xmax   = TxId::MAX;
        dpn
    }

    pub fn null_only(&self) -> bool { self.num_of_records == self.num_of_nulls }

    /// 字符串包的统计量只是 8 字节前缀，不能据此判定统一
    pub fn uniform(&self) -> bool {
        self.num_of_nulls == 0 && self.min_i == self.max_i && !self.string_pack
    }

    /// 平凡包无需物理负载
    pub fn trivial(&self) -> bool {
        (self.uniform() || self.null_only()) && self.num_of_deleted == 0
    }

    pub fn has_payload(&self) -> bool { self.data_address != DPN_INVALID_ADDR }

    pub fn min_d(&self) -> f64 { f64::from_bits(self.min_i as u64) }
    pub fn max_d(&self) -> f64 { f64::from_bits(self.max_i as u64) }
    pub fn sum_d(&self) -> f64 { f64::from_bits(self.sum_i as u64) }

    pub fn min_s(&self) -> [u8; 8] { self.min_i.to_le_bytes() }
    pub fn max_s(&self) -> [u8; 8] { self.max_i.to_le_bytes() }

    pub fn set_min_s(&mut self, prefix: [u8; 8]) { self.min_i = i64::from_le_bytes(prefix); }
    pub fn set_max_s(&mut self, prefix: [u8; 8]) { self.max_i = i64::from_le_bytes(prefix); }

    /// 字符串包内最长值的字节数
    pub fn max_len(&self) -> usize { self.sum_i.max(0) as usize }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= DPN_SIZE);
        out[..DPN_SIZE].fill(0);
        let mut flags = 0u8;
        if self.used        { flags |= FLAG_USED; }
        if self.local       { flags |= FLAG_LOCAL; }
        if self.synced      { flags |= FLAG_SYNCED; }
        if self.string_pack { flags |= FLAG_STRING; }
        out[0] = flags;
        LittleEndian::write_u32(&mut out[4..8],   self.base.0);
        LittleEndian::write_u32(&mut out[8..12],  self.num_of_records);
        LittleEndian::write_u32(&mut out[12..16], self.num_of_nulls);
        LittleEndian::write_u32(&mut out[16..20], self.num_of_deleted);
        LittleEndian::write_u64(&mut out[24..32], self.data_address);
        LittleEndian::write_u64(&mut out[32..40], self.data_length);
        LittleEndian::write_u64(&mut out[40..48], self.xmin.0);
        LittleEndian::write_u64(&mut out[48..56], self.xmax.0);
        LittleEndian::write_i64(&mut out[56..64], self.min_i);
        LittleEndian::write_i64(&mut out[64..72], self.max_i);
        LittleEndian::write_i64(&mut out[72..80], self.sum_i);
    }

    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= DPN_SIZE);
        let flags = buf[0];
        Self {
            used:           flags & FLAG_USED != 0,
            local:          flags & FLAG_LOCAL != 0,
            synced:         flags & FLAG_SYNCED != 0,
            string_pack:    flags & FLAG_STRING != 0,
            base:           PackIndex(LittleEndian::read_u32(&buf[4..8])),
            num_of_records: LittleEndian::read_u32(&buf[8..12]),
            num_of_nulls:   LittleEndian::read_u32(&buf[12..16]),
            num_of_deleted: LittleEndian::read_u32(&buf[16..20]),
            data_address:   LittleEndian::read_u64(&buf[24..32]),
            data_length:    LittleEndian::read_u64(&buf[32..40]),
            xmin:           TxId(LittleEndian::read_u64(&buf[40..48])),
            xmax:           TxId(LittleEndian::read_u64(&buf[48..56])),
            min_i:          LittleEndian::read_i64(&buf[56..64]),
            max_i:          LittleEndian::read_i64(&buf[64..72]),
            sum_i:          LittleEndian::read_i64(&buf[72..80]),
        }
    }
}

/// 取字符串的 8 字节前缀（不足补 0）
pub fn str_prefix(v: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    let n = v.len().min(8);
    out[..n].copy_from_slice(&v[..n]);
    out
}

/// 前缀的有效长度（去掉尾部补零）
pub fn prefix_len(p: &[u8; 8]) -> usize {
    p.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1)
}

// ── 包缓存标记 ────────────────────────────────────────────────────────────────

const TAG_EMPTY:   u64 = 0;
const TAG_LOADING: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackState {
    Empty,
    Loading,
    Loaded { refcount: u64 },
}

/// 解压包的引用计数：0 = 未加载，LOADING = 正在加载，其余 = 引用计数
#[derive(Debug, Default)]
pub struct PackRef {
    tag:  AtomicU64,
    pack: Mutex<Option<Arc<Pack>>>,
}

impl PackRef {
    pub fn state(&self) -> PackState {
        match self.tag.load(Ordering::Acquire) {
            TAG_EMPTY   => PackState::Empty,
            TAG_LOADING => PackState::Loading,
            n           => PackState::Loaded { refcount: n },
        }
    }

    /// 已加载时引用计数加一
    pub fn inc_ref(&self) -> bool {
        let mut cur = self.tag.load(Ordering::Acquire);
        loop {
            if cur == TAG_EMPTY || cur == TAG_LOADING { return false; }
            match self.tag.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_)  => return true,
                Err(v) => cur = v,
            }
        }
    }

    /// 抢占加载权
    pub fn begin_load(&self) -> bool {
        self.tag
            .compare_exchange(TAG_EMPTY, TAG_LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_load(&self, pack: Arc<Pack>) {
        let mut slot = self.pack.lock();
        *slot = Some(pack);
        self.tag.store(1, Ordering::Release);
    }

    pub fn abort_load(&self) {
        self.tag.store(TAG_EMPTY, Ordering::Release);
    }

    /// 引用计数减一；归零时释放缓存，返回是否已释放
    pub fn dec_ref(&self) -> bool {
        let mut slot = self.pack.lock();
        let mut cur = self.tag.load(Ordering::Acquire);
        loop {
            assert!(cur != TAG_EMPTY && cur != TAG_LOADING, "unlocking a pack that is not locked");
            match self.tag.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_)  => break,
                Err(v) => cur = v,
            }
        }
        if cur == 1 {
            *slot = None;
            return true;
        }
        false
    }

    pub fn get(&self) -> Option<Arc<Pack>> { self.pack.lock().clone() }

    /// 槽位复用时清空
    pub fn reset(&self) {
        let mut slot = self.pack.lock();
        *slot = None;
        self.tag.store(TAG_EMPTY, Ordering::Release);
    }
}

/// DPN 数组中的一个槽位：元数据 + 解压包缓存
#[derive(Debug, Default)]
pub struct DpnSlot {
    pub dpn:  RwLock<Dpn>,
    pub pack: PackRef,
}

impl DpnSlot {
    pub fn new(dpn: Dpn) -> Self {
        Self { dpn: RwLock::new(dpn), pack: PackRef::default() }
    }

    pub fn get(&self) -> Dpn { *self.dpn.read() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_88_bytes() {
        let mut dpn = Dpn::init(TxId(7), PackType::Int, None);
        dpn.num_of_records = 4;
        dpn.num_of_nulls   = 1;
        dpn.min_i          = 1;
        dpn.max_i          = 1;
        dpn.data_address   = 4096;
        let mut buf = [0xaau8; DPN_SIZE];
        dpn.encode(&mut buf);
        assert_eq!(&buf[80..88], &[0u8; 8]);
        assert_eq!(Dpn::decode(&buf), dpn);
    }

    #[test]
    fn new_dpn_is_local_and_empty() {
        let int = Dpn::init(TxId(3), PackType::Int, None);
        assert!(int.used && int.local && int.synced);
        assert_eq!((int.min_i, int.max_i), (PLUS_INF_64, MINUS_INF_64));
        assert_eq!(int.xmax, TxId::MAX);
        assert!(!int.base.is_valid());
        assert!(int.null_only() && int.trivial());

        let s = Dpn::init(TxId(3), PackType::Str, None);
        assert_eq!((s.min_i, s.max_i), (0, -1));
    }

    #[test]
    fn copy_on_write_keeps_stats_and_records_base() {
        let mut src = Dpn::init(TxId(1), PackType::Int, None);
        src.local = false;
        src.num_of_records = 10;
        src.min_i = 3;
        src.max_i = 9;
        let cow = Dpn::init(TxId(2), PackType::Int, Some((PackIndex(5), &src)));
        assert_eq!(cow.base, PackIndex(5));
        assert_eq!((cow.min_i, cow.max_i, cow.num_of_records), (3, 9, 10));
        assert!(cow.local);
        assert_eq!(cow.xmin, TxId(2));
    }

    #[test]
    fn trivial_matches_uniform_or_null_only() {
        let mut d = Dpn::init(TxId(1), PackType::Int, None);
        d.num_of_records = 4;
        d.num_of_nulls   = 1;
        d.min_i = 1;
        d.max_i = 1;
        assert!(!d.uniform() && !d.null_only() && !d.trivial());
        d.num_of_nulls = 0;
        assert!(d.uniform() && d.trivial());
        d.num_of_deleted = 1;
        assert!(!d.trivial());
    }

    #[test]
    fn pack_ref_pins_and_evicts() {
        let r = PackRef::default();
        assert!(!r.inc_ref());
        assert!(r.begin_load());
        assert!(!r.begin_load());
        assert_eq!(r.state(), PackState::Loading);
        r.finish_load(Arc::new(Pack::uniform_int(1, 2)));
        assert!(r.inc_ref());
        assert_eq!(r.state(), PackState::Loaded { refcount: 2 });
        assert!(!r.dec_ref());
        assert!(r.dec_ref());
        assert_eq!(r.state(), PackState::Empty);
        assert!(r.get().is_none());
    }

    #[test]
    #[should_panic]
    fn unlock_underflow_panics() {
        PackRef::default().dec_ref();
    }

    #[test]
    fn prefixes() {
        assert_eq!(prefix_len(&str_prefix(b"abc")), 3);
        assert_eq!(prefix_len(&str_prefix(b"abcdefghijk")), 8);
        assert_eq!(prefix_len(&str_prefix(b"")), 0);
    }
}
