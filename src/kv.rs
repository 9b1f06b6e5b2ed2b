//! 事务型 KV 协作方
//!
//! 行存溢出与二级索引只把它当作有序的字节键值存储：快照读、
//! 批量原子写。[`MemKvStore`] 是进程内的多版本实现。

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use tracing::{debug, warn};
use crate::common::{OlapError, Result};

pub type KvPair = (Vec<u8>, Vec<u8>);

/// 原子提交的一组写；`None` 表示删除
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self { Self::default() }

    pub fn put(&mut self, key: &[u8], value: &[u8]) { self.ops.push((key.to_vec(), Some(value.to_vec()))); }

    pub fn delete(&mut self, key: &[u8]) { self.ops.push((key.to_vec(), None)); }

    pub fn len(&self) -> usize { self.ops.len() }

    pub fn is_empty(&self) -> bool { self.ops.is_empty() }
}

pub trait KvStore: Send + Sync + Debug {
    /// 当前序列号，作为快照读的上界
    fn snapshot(&self) -> u64;

    fn get(&self, key: &[u8], snapshot: Option<u64>) -> Result<Option<Vec<u8>>>;

    /// 从 `start`（含）起按键升序最多取 `limit` 项
    fn scan_from(&self, start: &[u8], snapshot: Option<u64>, limit: usize) -> Result<Vec<KvPair>>;

    fn write_batch(&self, batch: WriteBatch) -> Result<()>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut b = WriteBatch::new();
        b.put(key, value);
        self.write_batch(b)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut b = WriteBatch::new();
        b.delete(key);
        self.write_batch(b)
    }
}

// ── MemKvStore ────────────────────────────────────────────────────────────────

type Versions = Vec<(u64, Option<Vec<u8>>)>;

#[derive(Debug, Default)]
pub struct MemKvStore {
    data:     RwLock<BTreeMap<Vec<u8>, Versions>>,
    seq:      AtomicU64,
    /// 接下来若干次调用返回 KvBusy
    busy:     AtomicU32,
}

impl MemKvStore {
    pub fn new() -> Self { Self::default() }

    /// 让接下来 `n` 次读写返回 [`OlapError::KvBusy`]
    pub fn inject_busy(&self, n: u32) { self.busy.store(n, Ordering::SeqCst); }

    fn check_busy(&self) -> Result<()> {
        let taken = self.busy.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if taken.is_ok() { Err(OlapError::KvBusy) } else { Ok(()) }
    }

    fn visible(versions: &Versions, snapshot: u64) -> Option<&Vec<u8>> {
        versions.iter().rev().find(|(s, _)| *s <= snapshot).and_then(|(_, v)| v.as_ref())
    }
}

impl KvStore for MemKvStore {
    fn snapshot(&self) -> u64 { self.seq.load(Ordering::SeqCst) }

    fn get(&self, key: &[u8], snapshot: Option<u64>) -> Result<Option<Vec<u8>>> {
        self.check_busy()?;
        let at = snapshot.unwrap_or(u64::MAX);
        Ok(self.data.read().get(key).and_then(|v| Self::visible(v, at)).cloned())
    }

    fn scan_from(&self, start: &[u8], snapshot: Option<u64>, limit: usize) -> Result<Vec<KvPair>> {
        self.check_busy()?;
        let at = snapshot.unwrap_or(u64::MAX);
        let data = self.data.read();
        Ok(data.range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .filter_map(|(k, v)| Self::visible(v, at).map(|v| (k.clone(), v.clone())))
            .take(limit)
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        self.check_busy()?;
        let mut data = self.data.write();
        let seq = self.seq.load(Ordering::SeqCst) + 1;
        for (k, v) in batch.ops {
            data.entry(k).or_default().push((seq, v));
        }
        self.seq.store(seq, Ordering::SeqCst);
        Ok(())
    }
}

// ── KvTransaction ─────────────────────────────────────────────────────────────

/// 缓冲写并在提交时一次性写入；读取先看本地缓冲再看快照
#[derive(Debug)]
pub struct KvTransaction {
    store:    Arc<dyn KvStore>,
    snapshot: u64,
    pending:  BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl KvTransaction {
    pub fn begin(store: Arc<dyn KvStore>) -> Self {
        let snapshot = store.snapshot();
        Self { store, snapshot, pending: BTreeMap::new() }
    }

    pub fn snapshot(&self) -> u64 { self.snapshot }

    /// 释放并重新获取快照
    pub fn refresh_snapshot(&mut self) { self.snapshot = self.store.snapshot(); }

    /// KvBusy 时刷新快照重试一次
    fn retry_busy<T, F>(&mut self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut(&dyn KvStore, u64) -> Result<T>,
    {
        match f(self.store.as_ref(), self.snapshot) {
            Err(OlapError::KvBusy) => {
                warn!(op = what, snapshot = self.snapshot, "kv store busy, retrying with a new snapshot");
                self.refresh_snapshot();
                f(self.store.as_ref(), self.snapshot)
            }
            other => other,
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.pending.get(key) {
            return Ok(v.clone());
        }
        self.retry_busy("get", |s, snap| s.get(key, Some(snap)))
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) { self.pending.insert(key.to_vec(), Some(value.to_vec())); }

    pub fn delete(&mut self, key: &[u8]) { self.pending.insert(key.to_vec(), None); }

    pub fn scan_from(&mut self, start: &[u8], limit: usize) -> Result<Vec<KvPair>> {
        let extra = self.pending.len();
        let base = self.retry_busy("scan", |s, snap| s.scan_from(start, Some(snap), limit + extra))?;
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> =
            base.into_iter().map(|(k, v)| (k, Some(v))).collect();
        for (k, v) in self.pending.range::<[u8], _>((Bound::Included(start), Bound::Unbounded)) {
            merged.insert(k.clone(), v.clone());
        }
        Ok(merged.into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .take(limit)
            .collect())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for (k, v) in &self.pending {
            match v {
                Some(v) => batch.put(k, v),
                None    => batch.delete(k),
            }
        }
        self.retry_busy("commit", |s, _| s.write_batch(batch.clone()))?;
        debug!(writes = self.pending.len(), "kv transaction committed");
        self.pending.clear();
        Ok(())
    }

    pub fn rollback(&mut self) { self.pending.clear(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<MemKvStore> { Arc::new(MemKvStore::new()) }

    #[test]
    fn snapshot_reads_ignore_later_writes() {
        let s = store();
        s.put(b"k", b"1").unwrap();
        let mut tx = KvTransaction::begin(s.clone());
        s.put(b"k", b"2").unwrap();
        assert_eq!(tx.get(b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(s.get(b"k", None).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn pending_writes_overlay_scans() {
        let s = store();
        for k in [&b"a"[..], b"b", b"c"] {
            s.put(k, b"v").unwrap();
        }
        let mut tx = KvTransaction::begin(s.clone());
        tx.delete(b"b");
        tx.put(b"bb", b"new");
        let keys: Vec<_> = tx.scan_from(b"a", 10).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"bb".to_vec(), b"c".to_vec()]);
        tx.rollback();
        assert_eq!(s.scan_from(b"b", None, 1).unwrap()[0].0, b"b".to_vec());
    }

    #[test]
    fn busy_is_retried_once() {
        let s = store();
        let mut tx = KvTransaction::begin(s.clone());
        tx.put(b"k", b"v");
        s.inject_busy(1);
        tx.commit().unwrap();
        assert_eq!(s.get(b"k", None).unwrap(), Some(b"v".to_vec()));

        s.inject_busy(2);
        assert!(matches!(tx.get(b"x"), Err(OlapError::KvBusy)));
    }
}
