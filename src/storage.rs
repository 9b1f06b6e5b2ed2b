//! 顶层存储协调器

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::RwLock;
use tracing::info;
use crate::common::{FileContext, OlapError, Result, TableId};
use crate::config::StorageConfig;
use crate::field_type::ColumnMeta;
use crate::kv::{KvStore, MemKvStore};
use crate::table::TableShare;
use crate::transaction::{Transaction, TxManager};

// ── TableShare 分片注册表 ─────────────────────────────────────────────────────

const NUM_SHARDS: usize = 64;

#[derive(Default)]
struct Shard {
    tables: HashMap<PathBuf, Arc<TableShare>>,
}

/// 使用 64 个 RwLock Shard 降低查表竞争
pub struct StorageEngine {
    data_dir: PathBuf,
    config:   Arc<StorageConfig>,
    tx_mgr:   Arc<TxManager>,
    kv:       Arc<dyn KvStore>,
    shards:   Vec<RwLock<Shard>>,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("data_dir", &self.data_dir)
            .field("tables", &self.table_count())
            .finish()
    }
}

impl StorageEngine {
    pub fn new(data_dir: &Path, config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(data_dir).with_path(data_dir)?;
        let shards = (0..NUM_SHARDS).map(|_| RwLock::new(Shard::default())).collect();
        info!(data_dir = %data_dir.display(), "storage engine started");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config:   Arc::new(config),
            tx_mgr:   Arc::new(TxManager::new()),
            kv:       Arc::new(MemKvStore::new()),
            shards,
        })
    }

    /// 替换 KV 协作方
    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = kv; self
    }

    pub fn data_dir(&self)   -> &Path               { &self.data_dir }
    pub fn config(&self)     -> &Arc<StorageConfig> { &self.config }
    pub fn tx_manager(&self) -> &Arc<TxManager>     { &self.tx_mgr }
    pub fn kv_store(&self)   -> &Arc<dyn KvStore>   { &self.kv }

    /// 表名对应的目录
    pub fn table_path(&self, name: &str) -> PathBuf { self.data_dir.join(name) }

    fn shard(&self, path: &Path) -> &RwLock<Shard> {
        let mut h = DefaultHasher::new();
        path.hash(&mut h);
        &self.shards[(h.finish() as usize) % NUM_SHARDS]
    }

    // ── DDL ───────────────────────────────────────────────────────────────────

    pub fn create_table(&self, name: &str, table_id: TableId, columns: &[ColumnMeta]) -> Result<Arc<TableShare>> {
        let path = self.table_path(name);
        let share = Arc::new(TableShare::create(&path, table_id, columns, self.config.clone())?);
        self.shard(&path).write().tables.insert(path, share.clone());
        Ok(share)
    }

    /// 已注册的直接返回，否则从磁盘打开
    pub fn get_table_share(&self, name: &str) -> Result<Arc<TableShare>> {
        let path = self.table_path(name);
        if let Some(s) = self.shard(&path).read().tables.get(&path) {
            return Ok(s.clone());
        }
        if !path.exists() {
            return Err(OlapError::TableNotFound(name.into()));
        }
        let mut shard = self.shard(&path).write();
        if let Some(s) = shard.tables.get(&path) {
            return Ok(s.clone());
        }
        let share = Arc::new(TableShare::open(&path, self.config.clone())?);
        self.tx_mgr.observe(share.current_version());
        shard.tables.insert(path, share.clone());
        Ok(share)
    }

    /// 注销并删除表目录
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let path = self.table_path(name);
        let removed = self.shard(&path).write().tables.remove(&path);
        if removed.is_none() && !path.exists() {
            return Err(OlapError::TableNotFound(name.into()));
        }
        drop(removed);
        fs::remove_dir_all(&path).with_path(&path)?;
        info!(table = %path.display(), "table dropped");
        Ok(())
    }

    pub fn table_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().tables.len()).sum()
    }

    // ── 事务 ──────────────────────────────────────────────────────────────────

    pub fn begin_transaction(&self) -> Transaction {
        Transaction::begin(self.tx_mgr.clone(), &self.config)
    }
}
