//! 事务：MVCC 上下文、提交与回滚
//!
//! TX_ID 以进程启动时的 epoch 秒数左移 32 位为种子，逐个递增；
//! 同一个 ID 既是可见性时间戳，也是磁盘版本文件名的后缀。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use crate::common::{OlapError, Result, TxId};
use crate::config::StorageConfig;
use crate::kv::{KvStore, KvTransaction};
use crate::table::{Table, TableShare};

// ── TX_ID 分配 ────────────────────────────────────────────────────────────────

/// 活跃事务集合与 TX_ID 序列
#[derive(Debug)]
pub struct TxManager {
    next:    AtomicU64,
    max_xid: AtomicU64,
    live:    Mutex<BTreeSet<TxId>>,
}

impl TxManager {
    pub fn new() -> Self {
        let secs = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        Self::with_seed(secs << 32)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            next:    AtomicU64::new(seed.max(1)),
            max_xid: AtomicU64::new(0),
            live:    Mutex::new(BTreeSet::new()),
        }
    }

    /// 分配新 TX_ID 并登记为活跃
    pub fn begin(&self) -> TxId {
        let mut live = self.live.lock();
        let xid = TxId(self.next.fetch_add(1, Ordering::SeqCst));
        self.max_xid.fetch_max(xid.0, Ordering::SeqCst);
        live.insert(xid);
        xid
    }

    pub fn end(&self, xid: TxId) { self.live.lock().remove(&xid); }

    /// 保证之后分配的 TX_ID 大于磁盘上已见过的版本
    pub fn observe(&self, xid: TxId) {
        self.next.fetch_max(xid.0.saturating_add(1), Ordering::SeqCst);
    }

    pub fn min_live_xid(&self) -> Option<TxId> { self.live.lock().first().copied() }

    /// 已分配过的最大 TX_ID
    pub fn max_xid(&self) -> TxId { TxId(self.max_xid.load(Ordering::SeqCst)) }

    pub fn num_live(&self) -> usize { self.live.lock().len() }
}

impl Default for TxManager {
    fn default() -> Self { Self::new() }
}

// ── 取消 ──────────────────────────────────────────────────────────────────────

/// 共享的 kill 标志，扫描时按行间隔轮询
#[derive(Debug, Clone)]
pub struct KillSwitch {
    flag:     Arc<AtomicBool>,
    interval: u64,
}

impl KillSwitch {
    pub fn new(interval: u64) -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), interval: interval.max(1) }
    }

    pub fn kill(&self) { self.flag.store(true, Ordering::Release); }

    pub fn is_killed(&self) -> bool { self.flag.load(Ordering::Acquire) }

    pub fn check(&self, row: u64) -> Result<()> {
        if row % self.interval == 0 && self.is_killed() {
            return Err(OlapError::Killed);
        }
        Ok(())
    }
}

impl Default for KillSwitch {
    fn default() -> Self { Self::new(StorageConfig::default().kill_check_interval) }
}

// ── Transaction ───────────────────────────────────────────────────────────────

struct WriteEntry {
    share: Arc<TableShare>,
    table: Arc<Table>,
}

pub struct Transaction {
    xid:          TxId,
    manager:      Arc<TxManager>,
    kill:         KillSwitch,
    read_tables:  BTreeMap<PathBuf, Arc<Table>>,
    write_tables: BTreeMap<PathBuf, WriteEntry>,
    kv:           Option<KvTransaction>,
    closed:       bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.xid)
            .field("read_tables", &self.read_tables.len())
            .field("write_tables", &self.write_tables.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Transaction {
    pub fn begin(manager: Arc<TxManager>, config: &StorageConfig) -> Self {
        let xid = manager.begin();
        debug!(tx = %xid, "transaction started");
        Self {
            xid,
            manager,
            kill:         KillSwitch::new(config.kill_check_interval),
            read_tables:  BTreeMap::new(),
            write_tables: BTreeMap::new(),
            kv:           None,
            closed:       false,
        }
    }

    pub fn xid(&self) -> TxId { self.xid }

    pub fn kill_switch(&self) -> &KillSwitch { &self.kill }

    pub fn kill(&self) { self.kill.kill(); }

    /// 读快照；本事务已在写的表返回写快照
    pub fn add_table_rd(&mut self, share: &Arc<TableShare>) -> Result<Arc<Table>> {
        let path = share.dir().to_path_buf();
        if let Some(w) = self.write_tables.get(&path) {
            return Ok(w.table.clone());
        }
        if let Some(t) = self.read_tables.get(&path) {
            return Ok(t.clone());
        }
        let table = share.get_snapshot()?;
        self.read_tables.insert(path, table.clone());
        Ok(table)
    }

    /// 写快照；同一张表的其他写者提交或回滚前阻塞
    pub fn add_table_wr(&mut self, share: &Arc<TableShare>) -> Result<Arc<Table>> {
        let path = share.dir().to_path_buf();
        if let Some(w) = self.write_tables.get(&path) {
            return Ok(w.table.clone());
        }
        let table = share.get_table_for_write(self.xid, &self.manager)?;
        self.read_tables.remove(&path);
        self.write_tables.insert(path, WriteEntry { share: share.clone(), table: table.clone() });
        Ok(table)
    }

    pub fn get_table_by_path(&self, path: &Path) -> Option<Arc<Table>> {
        self.write_tables.get(path).map(|w| w.table.clone())
            .or_else(|| self.read_tables.get(path).cloned())
    }

    /// 移出事务；写快照随之回滚
    pub fn remove_table(&mut self, path: &Path) {
        if let Some(w) = self.write_tables.remove(path) {
            w.table.rollback();
        }
        self.read_tables.remove(path);
    }

    /// 按需开启 KV 子事务
    pub fn kv(&mut self, store: &Arc<dyn KvStore>) -> &mut KvTransaction {
        self.kv.get_or_insert_with(|| KvTransaction::begin(store.clone()))
    }

    /// 依次发布各写表；任一表失败时其余未提交的表回滚
    pub fn commit(&mut self) -> Result<()> {
        assert!(!self.closed, "transaction {} already closed", self.xid);
        let mut result = Ok(());
        let tables = std::mem::take(&mut self.write_tables);
        for (path, w) in tables {
            if result.is_err() {
                w.table.rollback();
                continue;
            }
            match w.table.commit_version(self.xid) {
                Ok(changed) => w.share.commit_write(&w.table, self.manager.max_xid(), changed),
                Err(e) => {
                    if w.table.is_published() {
                        w.share.commit_write(&w.table, self.manager.max_xid(), true);
                    } else {
                        w.table.rollback();
                    }
                    warn!(tx = %self.xid, table = %path.display(), error = %e, "commit failed");
                    result = Err(e);
                }
            }
        }
        if let Some(mut kv) = self.kv.take() {
            if result.is_ok() {
                result = kv.commit();
            } else {
                kv.rollback();
            }
        }
        self.finish();
        if result.is_ok() {
            info!(tx = %self.xid, "transaction committed");
        }
        result
    }

    pub fn rollback(&mut self) {
        if self.closed {
            return;
        }
        for w in std::mem::take(&mut self.write_tables).into_values() {
            w.table.rollback();
        }
        if let Some(mut kv) = self.kv.take() {
            kv.rollback();
        }
        self.finish();
        info!(tx = %self.xid, "transaction rolled back");
    }

    fn finish(&mut self) {
        self.read_tables.clear();
        self.manager.end(self.xid);
        self.closed = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) { self.rollback(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xids_are_monotonic_and_tracked() {
        let mgr = TxManager::with_seed(10);
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b > a);
        assert_eq!(mgr.min_live_xid(), Some(a));
        mgr.end(a);
        assert_eq!(mgr.min_live_xid(), Some(b));
        assert_eq!(mgr.max_xid(), b);
        mgr.end(b);
        assert_eq!(mgr.min_live_xid(), None);
    }

    #[test]
    fn observed_versions_push_the_sequence_forward() {
        let mgr = TxManager::with_seed(5);
        mgr.observe(TxId(40));
        assert_eq!(mgr.begin(), TxId(41));
        mgr.observe(TxId(3));
        assert_eq!(mgr.begin(), TxId(42));
    }

    #[test]
    fn seed_uses_wall_clock_high_bits() {
        let xid = TxManager::new().begin();
        assert!(xid.0 >> 32 > 0);
    }

    #[test]
    fn kill_switch_polls_at_interval() {
        let k = KillSwitch::new(4);
        k.kill();
        assert!(k.check(3).is_ok());
        assert!(matches!(k.check(8), Err(OlapError::Killed)));
    }

    #[test]
    fn drop_ends_transaction() {
        let mgr = Arc::new(TxManager::with_seed(1));
        {
            let _tx = Transaction::begin(mgr.clone(), &StorageConfig::default());
            assert_eq!(mgr.num_live(), 1);
        }
        assert_eq!(mgr.num_live(), 0);
    }
}
