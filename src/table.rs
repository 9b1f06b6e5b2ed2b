//! TableShare 与 Table 快照
//!
//! ```text
//!            TableShare (每表一个)
//!   ┌──────────────────────────────────────┐
//!   │ columns: ColumnShare × N             │
//!   │ current ──► Arc<Table>  (最新已提交)  │
//!   │ history ──► [(retire_xid, Weak)]     │
//!   │ write_mtx ─ 单写者互斥                │
//!   └──────────────────────────────────────┘
//!          │ get_snapshot          │ get_table_for_write
//!          ▼                       ▼
//!     Table (只读)            Table (持写锁，Attr 带 tx)
//! ```
//!
//! 写快照提交时走符号链接原子发布（见 [`Table::commit_version`]），
//! 随后成为新的 `current`，旧快照降级为弱引用留在历史中。

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};
use crate::attr::Attr;
use crate::column_share::ColumnShare;
use crate::common::{ColumnId, FileContext, OlapError, Result, RsValue, TableId, TxId};
use crate::config::{StorageConfig, MAX_PSS};
use crate::field_type::{ColumnMeta, Value};
use crate::meta::{
    self, TableMeta, COLUMN_DIR, TABLE_DESC_FILE, TABLE_VERSION_FILE, TABLE_VERSION_FILE_TMP,
    TABLE_VERSION_PREFIX,
};
use crate::rough::Descriptor;
use crate::testing::CrashPoint;
use crate::transaction::{KillSwitch, TxManager};

type WriteGuard = ArcMutexGuard<RawMutex, ()>;

fn column_dir(table_dir: &Path, col: usize) -> PathBuf {
    table_dir.join(COLUMN_DIR).join(col.to_string())
}

/// VERSION 符号链接指向的版本文件名
fn published_version(dir: &Path) -> Result<(TxId, String)> {
    let link = dir.join(TABLE_VERSION_FILE);
    let target = fs::read_link(&link).with_path(&link)?;
    let name = target.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or_else(|| OlapError::Database(format!("bad version link: {}", link.display())))?;
    let xid = name.strip_prefix(TABLE_VERSION_PREFIX)
        .and_then(TxId::from_hex)
        .ok_or_else(|| OlapError::Database(format!("bad version file name {name}: {}", dir.display())))?;
    Ok((xid, name))
}

// ── TableShare ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Current {
    /// 每列当前发布的版本
    versions:      Vec<TxId>,
    table_version: TxId,
    snapshot:      Option<Arc<Table>>,
    /// 被替换下来的快照及其退役时的 TX_ID
    history:       Vec<(TxId, Weak<Table>)>,
}

/// 一张表在所有事务间共享的状态
pub struct TableShare {
    dir:         PathBuf,
    desc:        TableMeta,
    config:      Arc<StorageConfig>,
    columns:     Vec<Arc<ColumnShare>>,
    current:     Mutex<Current>,
    write_mtx:   Arc<Mutex<()>>,
    write_table: Mutex<Weak<Table>>,
}

impl std::fmt::Debug for TableShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableShare")
            .field("dir", &self.dir)
            .field("table_id", &self.desc.table_id)
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl TableShare {
    /// 建表：描述文件、列目录、零号版本文件以及 VERSION 链接
    pub fn create(
        dir:      &Path,
        table_id: TableId,
        columns:  &[ColumnMeta],
        config:   Arc<StorageConfig>,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(OlapError::Unsupported("table without columns".into()));
        }
        if config.pack_size_shift > MAX_PSS {
            return Err(OlapError::Unsupported(format!("pack size shift {} too large", config.pack_size_shift)));
        }
        let desc_path = dir.join(TABLE_DESC_FILE);
        if desc_path.exists() {
            return Err(OlapError::Database(format!("table already exists: {}", dir.display())));
        }
        fs::create_dir_all(dir).with_path(dir)?;
        let sync = config.sync_buffers;
        let pss = config.pack_size_shift;

        for (i, col) in columns.iter().enumerate() {
            meta::create_column_dir(&column_dir(dir, i), col, pss, config.dpn_file_size)?;
        }
        let name = meta::version_file_name(TxId::ZERO);
        meta::write_table_version(&dir.join(&name), &vec![TxId::ZERO; columns.len()], sync)?;
        let link = dir.join(TABLE_VERSION_FILE);
        symlink(&name, &link).with_path(&link)?;
        TableMeta { table_id, pack_size_shift: pss }.write(&desc_path, sync)?;
        if sync {
            meta::fsync_dir(&dir.join(COLUMN_DIR))?;
            meta::fsync_dir(dir)?;
        }
        info!(table = %dir.display(), table_id, columns = columns.len(), "table created");
        Self::open(dir, config)
    }

    pub fn open(dir: &Path, config: Arc<StorageConfig>) -> Result<Self> {
        let desc = TableMeta::read(&dir.join(TABLE_DESC_FILE))?;
        let (table_version, name) = published_version(dir)?;
        let versions = meta::read_table_version(&dir.join(&name))?;
        if versions.is_empty() {
            return Err(OlapError::Database(format!("empty table version file: {}", dir.display())));
        }
        let columns = versions.iter().enumerate()
            .map(|(i, &v)| ColumnShare::open(&column_dir(dir, i), i as ColumnId, v, &config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        if let Some(c) = columns.iter().find(|c| c.pss() != desc.pack_size_shift) {
            return Err(OlapError::Database(format!(
                "column {} pack size shift {} differs from table {}", c.col_id(), c.pss(), desc.pack_size_shift)));
        }
        let tmp = dir.join(TABLE_VERSION_FILE_TMP);
        if tmp.symlink_metadata().is_ok() {
            warn!(path = %tmp.display(), "interrupted commit left a temporary version link");
        }
        info!(table = %dir.display(), table_id = desc.table_id, version = %table_version, "table opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            desc,
            config,
            columns,
            current: Mutex::new(Current { versions, table_version, snapshot: None, history: Vec::new() }),
            write_mtx:   Arc::new(Mutex::new(())),
            write_table: Mutex::new(Weak::new()),
        })
    }

    pub fn dir(&self)         -> &Path              { &self.dir }
    pub fn table_id(&self)    -> TableId            { self.desc.table_id }
    pub fn num_columns(&self) -> usize              { self.columns.len() }
    pub fn config(&self)      -> &Arc<StorageConfig> { &self.config }

    pub fn column_meta(&self, col: usize) -> &ColumnMeta { self.columns[col].meta() }

    /// 当前发布的表版本
    pub fn current_version(&self) -> TxId { self.current.lock().table_version }

    /// 最新已提交快照；首次调用时物化并缓存
    pub fn get_snapshot(&self) -> Result<Arc<Table>> {
        let mut cur = self.current.lock();
        if let Some(t) = &cur.snapshot {
            return Ok(t.clone());
        }
        let table = Arc::new(Table::open(self, &cur.versions, cur.table_version, None, TxId::MAX, None)?);
        table.verify()?;
        cur.snapshot = Some(table.clone());
        Ok(table)
    }

    /// 取得写快照；已有写者时阻塞等待
    pub fn get_table_for_write(&self, xid: TxId, manager: &TxManager) -> Result<Arc<Table>> {
        let guard = self.write_mtx.lock_arc();
        if let Some(prev) = self.write_table.lock().upgrade() {
            assert!(!prev.holds_write_lock(), "table {} already has a writer", self.dir.display());
        }
        let floor = self.reclaim_floor(manager);
        let (versions, table_version) = {
            let cur = self.current.lock();
            (cur.versions.clone(), cur.table_version)
        };
        let table = Arc::new(Table::open(self, &versions, table_version, Some(xid), floor, Some(guard))?);
        *self.write_table.lock() = Arc::downgrade(&table);
        debug!(table = %self.dir.display(), tx = %xid, reclaim_floor = %floor, "write snapshot acquired");
        Ok(table)
    }

    /// 已退役 DPN 的 xmax 低于此值才可复用
    pub fn reclaim_floor(&self, manager: &TxManager) -> TxId {
        let mut cur = self.current.lock();
        cur.history.retain(|(_, w)| w.strong_count() > 0);
        let oldest_snapshot = cur.history.iter().map(|(x, _)| *x).min();
        [oldest_snapshot, manager.min_live_xid()].into_iter().flatten().min().unwrap_or(TxId::MAX)
    }

    /// 写快照提交成功后：发布 DPN、切换 current、释放写锁
    pub fn commit_write(&self, table: &Arc<Table>, retire_xid: TxId, changed: bool) {
        let mut cur = self.current.lock();
        table.post_commit(retire_xid);
        if changed {
            cur.versions = table.column_versions();
            cur.table_version = table.version();
            if let Some(prev) = cur.snapshot.replace(table.clone()) {
                cur.history.push((retire_xid, Arc::downgrade(&prev)));
            }
            if cur.history.len() > self.config.version_history_limit {
                cur.history.retain(|(_, w)| w.strong_count() > 0);
            }
        }
        drop(cur);
        table.release_write_lock();
    }

    /// 仍可能被读者持有的历史快照数
    pub fn history_len(&self) -> usize {
        self.current.lock().history.iter().filter(|(_, w)| w.strong_count() > 0).count()
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// 绑定到某个表版本的列视图集合
pub struct Table {
    dir:         PathBuf,
    config:      Arc<StorageConfig>,
    version:     Mutex<TxId>,
    tx:          Option<TxId>,
    attrs:       Vec<RwLock<Attr>>,
    /// VERSION 已指向本事务的版本文件
    published:   AtomicBool,
    write_guard: Mutex<Option<WriteGuard>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("dir", &self.dir)
            .field("version", &self.version())
            .field("tx", &self.tx)
            .field("columns", &self.attrs.len())
            .finish()
    }
}

impl Table {
    fn open(
        share:         &TableShare,
        versions:      &[TxId],
        table_version: TxId,
        tx:            Option<TxId>,
        reclaim_floor: TxId,
        guard:         Option<WriteGuard>,
    ) -> Result<Self> {
        let attrs = share.columns.iter().zip(versions)
            .map(|(c, &v)| Attr::open(c.clone(), share.config.clone(), v, tx, reclaim_floor).map(RwLock::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dir:         share.dir.clone(),
            config:      share.config.clone(),
            version:     Mutex::new(table_version),
            tx,
            attrs,
            published:   AtomicBool::new(false),
            write_guard: Mutex::new(guard),
        })
    }

    pub fn dir(&self)         -> &Path        { &self.dir }
    pub fn version(&self)     -> TxId         { *self.version.lock() }
    pub fn tx(&self)          -> Option<TxId> { self.tx }
    pub fn num_columns(&self) -> usize        { self.attrs.len() }
    pub fn is_published(&self) -> bool        { self.published.load(Ordering::Acquire) }

    pub fn holds_write_lock(&self) -> bool { self.write_guard.lock().is_some() }

    pub fn column_versions(&self) -> Vec<TxId> {
        self.attrs.iter().map(|a| a.read().version()).collect()
    }

    pub fn attr(&self, col: usize) -> RwLockReadGuard<'_, Attr> { self.attrs[col].read() }

    pub fn attr_mut(&self, col: usize) -> RwLockWriteGuard<'_, Attr> { self.attrs[col].write() }

    pub fn num_rows(&self) -> u64 {
        self.attrs.first().map_or(0, |a| a.read().num_of_obj())
    }

    pub fn num_packs(&self) -> usize {
        self.attrs.first().map_or(0, |a| a.read().num_of_packs())
    }

    /// 各列行数必须一致
    pub fn verify(&self) -> Result<()> {
        let counts: Vec<u64> = self.attrs.iter().map(|a| a.read().num_of_obj()).collect();
        if counts.windows(2).any(|w| w[0] != w[1]) {
            error!(table = %self.dir.display(), ?counts, "column row counts differ");
            return Err(OlapError::Database("Data integrity is broken".into()));
        }
        Ok(())
    }

    // ── 读 ────────────────────────────────────────────────────────────────────

    pub fn get_value(&self, col: usize, row: u64) -> Result<Value> { self.attr(col).get_value(row) }

    pub fn scan_column<F>(&self, col: usize, kill: &KillSwitch, f: F) -> Result<()>
    where
        F: FnMut(u64, Value) -> Result<()>,
    {
        self.attr(col).scan(kill, f)
    }

    /// 逐包粗糙判定，结果可直接交给 PackOrderer 作过滤
    pub fn rough_filter(&self, col: usize, d: &Descriptor) -> Vec<RsValue> {
        let attr = self.attr(col);
        (0..attr.num_of_packs()).map(|p| attr.rough_check(p, d, false)).collect()
    }

    // ── 写 ────────────────────────────────────────────────────────────────────

    /// 按行追加；每行须覆盖全部列，任一值不合法时不写入任何列
    pub fn load_rows(&self, rows: &[Vec<Value>]) -> Result<()> {
        let n = self.attrs.len();
        if let Some(r) = rows.iter().find(|r| r.len() != n) {
            return Err(OlapError::Unsupported(format!("row has {} values, table has {n} columns", r.len())));
        }
        let columns: Vec<Vec<Value>> = (0..n)
            .map(|col| rows.iter().map(|r| r[col].clone()).collect())
            .collect();
        // 全部列校验通过后才写入
        for (attr, values) in self.attrs.iter().zip(&columns) {
            attr.read().check_values(values)?;
        }
        for (attr, values) in self.attrs.iter().zip(&columns) {
            attr.write().load_data(values)?;
        }
        Ok(())
    }

    pub fn update_value(&self, col: usize, row: u64, value: &Value) -> Result<()> {
        self.attr_mut(col).update_value(row, value)
    }

    pub fn delete_row(&self, row: u64) -> Result<()> {
        for attr in &self.attrs {
            attr.write().delete_value(row)?;
        }
        Ok(())
    }

    // ── 提交 ──────────────────────────────────────────────────────────────────

    /// 原子发布本事务的新版本；无修改返回 false
    ///
    /// 1. 校验各列行数
    /// 2. 各列并行 `save_version`
    /// 3. 写 `V.<hex tx>`
    /// 4. 建 `VERSION.tmp` 链接并 fsync 版本文件与表目录
    /// 5. rename 覆盖 `VERSION`，再 fsync 表目录
    /// 6. 删除旧版本文件
    ///
    /// 第 5 步之前失败时 VERSION 仍指向旧版本。
    pub fn commit_version(&self, xid: TxId) -> Result<bool> {
        assert_eq!(self.tx, Some(xid), "commit on a snapshot not owned by tx {xid}");
        let fp = &self.config.fail_points;
        self.verify()?;

        let changed = self.save_columns()?;
        fp.hit(CrashPoint::AfterSaveVersion)?;
        if !changed.iter().any(|&c| c) {
            debug!(table = %self.dir.display(), tx = %xid, "nothing to commit");
            return Ok(false);
        }

        let sync = self.config.sync_buffers;
        let versions: Vec<TxId> = self.attrs.iter().zip(&changed)
            .map(|(a, &c)| if c { xid } else { a.read().version() })
            .collect();
        let name = meta::version_file_name(xid);
        let version_path = self.dir.join(&name);
        meta::write_table_version(&version_path, &versions, sync)?;
        debug!(path = %version_path.display(), "table version file written");
        fp.hit(CrashPoint::AfterVersionFile)?;

        let tmp = self.dir.join(TABLE_VERSION_FILE_TMP);
        link_tmp(&name, &tmp)?;
        if sync {
            meta::fsync_file(&version_path)?;
            meta::fsync_dir(&self.dir)?;
        }
        fp.hit(CrashPoint::AfterTmpSymlink)?;

        let link = self.dir.join(TABLE_VERSION_FILE);
        fs::rename(&tmp, &link).with_path(&link)?;
        self.published.store(true, Ordering::Release);
        if sync {
            meta::fsync_dir(&self.dir)?;
        }
        fp.hit(CrashPoint::AfterRename)?;

        let old = self.version();
        if old != xid {
            let old_path = self.dir.join(meta::version_file_name(old));
            if let Err(e) = fs::remove_file(&old_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %old_path.display(), error = %e, "failed to remove old version file");
                }
            }
        }
        info!(
            table = %self.dir.display(), tx = %xid,
            changed = changed.iter().filter(|&&c| c).count(),
            rows = self.num_rows(),
            "version published"
        );
        Ok(true)
    }

    fn save_columns(&self) -> Result<Vec<bool>> {
        std::thread::scope(|s| {
            let handles: Vec<_> = self.attrs.iter()
                .map(|a| s.spawn(move || a.write().save_version()))
                .collect();
            handles.into_iter()
                .map(|h| -> Result<bool> {
                    h.join().map_err(|_| OlapError::System("column save thread panicked".into()))?
                })
                .collect()
        })
    }

    fn post_commit(&self, retire_xid: TxId) {
        let Some(xid) = self.tx else { return; };
        if self.is_published() {
            *self.version.lock() = xid;
        }
        for a in &self.attrs {
            a.write().post_commit(retire_xid);
        }
    }

    fn release_write_lock(&self) { self.write_guard.lock().take(); }

    /// 丢弃本地修改并释放写锁；已发布的版本不回滚
    pub fn rollback(&self) {
        let Some(xid) = self.tx else { return; };
        let Some(guard) = self.write_guard.lock().take() else { return; };
        if self.is_published() {
            warn!(table = %self.dir.display(), tx = %xid, "rollback after publish ignored");
            drop(guard);
            return;
        }
        for a in &self.attrs {
            a.write().rollback();
        }
        meta::remove_stale(&self.dir.join(meta::version_file_name(xid)));
        debug!(table = %self.dir.display(), tx = %xid, "write snapshot rolled back");
        drop(guard);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.holds_write_lock() {
            self.rollback();
        }
    }
}

/// 建临时链接；崩溃遗留的同名链接先删除再重试
fn link_tmp(target: &str, tmp: &Path) -> Result<()> {
    match symlink(target, tmp) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %tmp.display(), "removing stale temporary version link");
            fs::remove_file(tmp).with_path(tmp)?;
            symlink(target, tmp).with_path(tmp)
        }
        Err(e) => Err(OlapError::File { path: tmp.to_path_buf(), source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_type::ColumnType;
    use tempfile::TempDir;

    fn config() -> Arc<StorageConfig> {
        Arc::new(StorageConfig::default().with_pack_size_shift(2).with_sync_buffers(false))
    }

    fn two_columns() -> Vec<ColumnMeta> {
        vec![ColumnMeta::new("id", ColumnType::Int64), ColumnMeta::new("name", ColumnType::Varchar)]
    }

    fn row(id: i64, name: &str) -> Vec<Value> { vec![Value::Int64(id), Value::Bytes(name.as_bytes().to_vec())] }

    #[test]
    fn create_publishes_version_zero() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 7, &two_columns(), config()).unwrap();
        assert_eq!(share.current_version(), TxId::ZERO);
        assert_eq!(share.num_columns(), 2);
        assert_eq!(share.get_snapshot().unwrap().num_rows(), 0);
        assert!(TableShare::create(tmp.path(), 7, &two_columns(), config()).is_err());
    }

    #[test]
    fn commit_swaps_current_and_keeps_old_snapshot() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 1, &two_columns(), config()).unwrap();
        let mgr = TxManager::with_seed(100);
        let before = share.get_snapshot().unwrap();

        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        w.load_rows(&[row(1, "a"), row(2, "b"), row(3, "c")]).unwrap();
        assert!(w.commit_version(xid).unwrap());
        share.commit_write(&w, mgr.max_xid(), true);
        mgr.end(xid);
        drop(w);

        assert_eq!(before.num_rows(), 0);
        let after = share.get_snapshot().unwrap();
        assert_eq!(after.num_rows(), 3);
        assert_eq!(after.version(), xid);
        assert_eq!(share.history_len(), 1);
        drop(before);
        assert_eq!(share.history_len(), 0);

        let target = fs::read_link(tmp.path().join(TABLE_VERSION_FILE)).unwrap();
        assert_eq!(target, PathBuf::from(meta::version_file_name(xid)));
        assert!(!tmp.path().join(meta::version_file_name(TxId::ZERO)).exists());
    }

    #[test]
    fn mismatched_row_counts_fail_verify() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 1, &two_columns(), config()).unwrap();
        let mgr = TxManager::with_seed(100);
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        w.attr_mut(0).load_data(&[Value::Int64(1)]).unwrap();
        assert!(matches!(w.commit_version(xid), Err(OlapError::Database(_))));
        w.rollback();
        assert!(!w.holds_write_lock());
    }

    #[test]
    fn unchanged_write_publishes_nothing() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 1, &two_columns(), config()).unwrap();
        let mgr = TxManager::with_seed(100);
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        assert!(!w.commit_version(xid).unwrap());
        share.commit_write(&w, mgr.max_xid(), false);
        assert_eq!(share.current_version(), TxId::ZERO);
    }

    #[test]
    fn stale_tmp_link_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 1, &two_columns(), config()).unwrap();
        symlink("V.dangling", tmp.path().join(TABLE_VERSION_FILE_TMP)).unwrap();
        let mgr = TxManager::with_seed(100);
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        w.load_rows(&[row(1, "x")]).unwrap();
        assert!(w.commit_version(xid).unwrap());
        share.commit_write(&w, mgr.max_xid(), true);
        assert!(tmp.path().join(TABLE_VERSION_FILE_TMP).symlink_metadata().is_err());
        drop((w, share));

        let share = TableShare::open(tmp.path(), config()).unwrap();
        assert_eq!(share.current_version(), xid);
        assert_eq!(share.get_snapshot().unwrap().get_value(1, 0).unwrap(), Value::Bytes(b"x".to_vec()));
    }

    #[test]
    fn rough_filter_covers_every_pack() {
        let tmp = TempDir::new().unwrap();
        let share = TableShare::create(tmp.path(), 1, &two_columns(), config()).unwrap();
        let mgr = TxManager::with_seed(100);
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        let rows: Vec<_> = (0..10).map(|i| row(i, "n")).collect();
        w.load_rows(&rows).unwrap();
        let f = w.rough_filter(0, &Descriptor::eq(Value::Int64(5)));
        assert_eq!(f, vec![RsValue::None, RsValue::Some, RsValue::None]);
        w.rollback();
    }
}
