//! 存储层配置

use std::sync::Arc;
use crate::field_type::CompressionType;
use crate::testing::FailPoints;

/// 每个 DPN 记录的固定字节数（内存与磁盘一致）
pub const DPN_SIZE: usize = 88;
/// DPN 数组按此粒度扩容
pub const ALLOC_UNIT: usize = 11 * 4096;
pub const DPN_INC_CNT: usize = ALLOC_UNIT / DPN_SIZE;
/// 包大小上限 2^16 行
pub const MAX_PSS: u8 = 16;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// 每包行数 = 1 << pack_size_shift
    pub pack_size_shift:       u8,
    /// DPN 数组文件的固定大小（字节）
    pub dpn_file_size:         u64,
    /// 提交时是否 fsync
    pub sync_buffers:          bool,
    /// CMap 跟踪的字节位置数
    pub cmap_positions:        usize,
    pub bloom_bits_per_key:    usize,
    /// PackOrderer 精确排序的百分比
    pub sorted_percentage:     f64,
    pub max_sorted_packs:      usize,
    /// 每隔多少行检查一次 kill 标志
    pub kill_check_interval:   u64,
    /// 历史快照弱引用超过此数量时清理已失效的
    pub version_history_limit: usize,
    pub compression:           CompressionType,
    pub fail_points:           Arc<FailPoints>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            pack_size_shift:       16,
            dpn_file_size:         (DPN_SIZE * 65536) as u64,
            sync_buffers:          true,
            cmap_positions:        64,
            bloom_bits_per_key:    10,
            sorted_percentage:     10.0,
            max_sorted_packs:      1000,
            kill_check_interval:   32 * 1024,
            version_history_limit: 64,
            compression:           CompressionType::Lz4,
            fail_points:           Arc::new(FailPoints::new()),
        }
    }
}

impl StorageConfig {
    pub fn with_pack_size_shift(mut self, pss: u8) -> Self {
        self.pack_size_shift = pss; self
    }
    pub fn with_dpn_file_size(mut self, bytes: u64) -> Self {
        self.dpn_file_size = bytes; self
    }
    pub fn with_sync_buffers(mut self, sync: bool) -> Self {
        self.sync_buffers = sync; self
    }
    pub fn with_cmap_positions(mut self, n: usize) -> Self {
        self.cmap_positions = n; self
    }
    pub fn with_sorted_percentage(mut self, pct: f64, max_packs: usize) -> Self {
        self.sorted_percentage = pct; self.max_sorted_packs = max_packs; self
    }
    pub fn with_kill_check_interval(mut self, rows: u64) -> Self {
        self.kill_check_interval = rows.max(1); self
    }
    pub fn with_compression(mut self, comp: CompressionType) -> Self {
        self.compression = comp; self
    }
    pub fn with_fail_points(mut self, fp: Arc<FailPoints>) -> Self {
        self.fail_points = fp; self
    }

    pub fn pack_size(&self) -> usize { 1usize << self.pack_size_shift }

    /// DPN 数组的最大槽位数
    pub fn max_dpns(&self) -> usize { self.dpn_file_size as usize / DPN_SIZE }
}
