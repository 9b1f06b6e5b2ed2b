//! 快照可见性、单写者互斥、DPN 复用与取消

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use olap_pack_storage::common::{OlapError, PackIndex, TxId};
use olap_pack_storage::config::StorageConfig;
use olap_pack_storage::field_type::{ColumnMeta, ColumnType, Value};
use olap_pack_storage::storage::StorageEngine;
use olap_pack_storage::table::{Table, TableShare};
use olap_pack_storage::transaction::{KillSwitch, TxManager};
use tempfile::TempDir;

fn config() -> StorageConfig {
    StorageConfig::default()
        .with_pack_size_shift(3)
        .with_sync_buffers(false)
        .with_kill_check_interval(16)
}

fn engine(dir: &Path) -> StorageEngine { StorageEngine::new(dir, config()).unwrap() }

fn columns() -> Vec<ColumnMeta> {
    vec![ColumnMeta::new("k", ColumnType::Int32), ColumnMeta::new("v", ColumnType::Varchar)]
}

fn row(k: i32) -> Vec<Value> { vec![Value::Int32(k), Value::Bytes(format!("v{k}").into_bytes())] }

fn rows(range: std::ops::Range<i32>) -> Vec<Vec<Value>> { range.map(row).collect() }

fn keys(t: &Table) -> Vec<i64> {
    let mut out = Vec::new();
    t.scan_column(0, &KillSwitch::new(1), |_, v| {
        out.push(v.as_i64().unwrap_or(i64::MIN));
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn reader_keeps_its_snapshot_across_commits() {
    let tmp = TempDir::new().unwrap();
    let e = engine(tmp.path());
    let share = e.create_table("t", 1, &columns()).unwrap();

    let mut tx = e.begin_transaction();
    tx.add_table_wr(&share).unwrap().load_rows(&rows(0..12)).unwrap();
    tx.commit().unwrap();

    let mut reader = e.begin_transaction();
    let old = reader.add_table_rd(&share).unwrap();

    let mut writer = e.begin_transaction();
    let w = writer.add_table_wr(&share).unwrap();
    w.update_value(0, 1, &Value::Int32(-1)).unwrap();
    w.update_value(1, 1, &Value::Null).unwrap();
    w.delete_row(9).unwrap();
    w.load_rows(&rows(12..20)).unwrap();
    // 本事务的读看到自己的写
    assert!(Arc::ptr_eq(&writer.add_table_rd(&share).unwrap(), &w));
    assert_eq!(keys(&w).len(), 19);
    drop(w);
    writer.commit().unwrap();

    assert_eq!(old.num_rows(), 12);
    assert_eq!(old.get_value(0, 1).unwrap(), Value::Int64(1));
    assert_eq!(old.get_value(1, 1).unwrap(), Value::Bytes(b"v1".to_vec()));
    assert_eq!(keys(&old), (0..12).collect::<Vec<i64>>());
    assert!(Arc::ptr_eq(&reader.add_table_rd(&share).unwrap(), &old));

    let mut fresh = e.begin_transaction();
    let new = fresh.add_table_rd(&share).unwrap();
    assert_eq!(new.num_rows(), 20);
    assert_eq!(new.get_value(0, 1).unwrap(), Value::Int64(-1));
    assert_eq!(new.get_value(1, 1).unwrap(), Value::Null);
    let k = keys(&new);
    assert_eq!(k.len(), 19);
    assert!(!k.contains(&9));
    assert_eq!(share.history_len(), 1);

    drop(old);
    reader.rollback();
    assert_eq!(share.history_len(), 0);
}

#[test]
fn second_writer_waits_for_the_first() {
    let tmp = TempDir::new().unwrap();
    let e = engine(tmp.path());
    let share = e.create_table("t", 1, &columns()).unwrap();

    let mut first = e.begin_transaction();
    first.add_table_wr(&share).unwrap().load_rows(&rows(0..3)).unwrap();

    let (tx_seen, rx_seen) = mpsc::channel();
    let (engine, table) = (&e, &share);
    thread::scope(|s| {
        s.spawn(move || {
            let mut second = engine.begin_transaction();
            let w = second.add_table_wr(table).unwrap();
            tx_seen.send(w.num_rows()).unwrap();
            w.load_rows(&rows(3..5)).unwrap();
            drop(w);
            second.commit().unwrap();
        });

        assert!(rx_seen.recv_timeout(Duration::from_millis(200)).is_err());
        first.commit().unwrap();
        // 第二个写者基于第一个写者发布的版本
        assert_eq!(rx_seen.recv_timeout(Duration::from_secs(10)).unwrap(), 3);
    });

    let snap = share.get_snapshot().unwrap();
    assert_eq!(keys(&snap), (0..5).collect::<Vec<i64>>());
    assert_eq!(e.tx_manager().num_live(), 0);
}

#[test]
fn rolled_back_writer_releases_the_lock() {
    let tmp = TempDir::new().unwrap();
    let e = engine(tmp.path());
    let share = e.create_table("t", 1, &columns()).unwrap();

    let mut a = e.begin_transaction();
    a.add_table_wr(&share).unwrap().load_rows(&rows(0..4)).unwrap();
    drop(a);

    let mut b = e.begin_transaction();
    let w = b.add_table_wr(&share).unwrap();
    assert_eq!(w.num_rows(), 0);
    drop(w);
    b.commit().unwrap();
    assert_eq!(share.current_version(), TxId::ZERO);
}

/// 写快照 → 提交 → 释放
fn update_first(share: &TableShare, mgr: &TxManager, value: i32) -> PackIndex {
    let xid = mgr.begin();
    let w = share.get_table_for_write(xid, mgr).unwrap();
    w.update_value(0, 0, &Value::Int32(value)).unwrap();
    let idx = w.attr(0).pack_indices()[0];
    assert!(w.commit_version(xid).unwrap());
    share.commit_write(&w, mgr.max_xid(), true);
    mgr.end(xid);
    idx
}

#[test]
fn retired_dpns_are_reused_only_after_readers_leave() {
    let tmp = TempDir::new().unwrap();
    let share = TableShare::create(tmp.path(), 1, &columns(), Arc::new(config())).unwrap();
    let mgr = TxManager::with_seed(50);

    let xid = mgr.begin();
    let w = share.get_table_for_write(xid, &mgr).unwrap();
    w.load_rows(&rows(0..4)).unwrap();
    assert!(w.commit_version(xid).unwrap());
    share.commit_write(&w, mgr.max_xid(), true);
    mgr.end(xid);
    drop(w);

    let s0 = share.get_snapshot().unwrap();
    assert_eq!(s0.attr(0).pack_indices(), &[PackIndex(0)]);

    assert_eq!(update_first(&share, &mgr, 10), PackIndex(1));
    // 仍有读者持有 s0，slot 0 不能复用
    assert!(share.reclaim_floor(&mgr) <= mgr.max_xid());
    assert_eq!(update_first(&share, &mgr, 20), PackIndex(2));
    assert_eq!(s0.get_value(0, 0).unwrap(), Value::Int64(0));

    drop(s0);
    assert_eq!(share.reclaim_floor(&mgr), TxId::MAX);
    assert_eq!(update_first(&share, &mgr, 30), PackIndex(0));

    let now = share.get_snapshot().unwrap();
    assert_eq!(now.get_value(0, 0).unwrap(), Value::Int64(30));
    assert_eq!(now.get_value(1, 3).unwrap(), Value::Bytes(b"v3".to_vec()));
}

#[test]
fn killed_scan_stops_at_the_next_check() {
    let tmp = TempDir::new().unwrap();
    let e = engine(tmp.path());
    let share = e.create_table("t", 1, &columns()).unwrap();
    let mut tx = e.begin_transaction();
    tx.add_table_wr(&share).unwrap().load_rows(&rows(0..100)).unwrap();
    tx.commit().unwrap();

    let mut tx = e.begin_transaction();
    let t = tx.add_table_rd(&share).unwrap();
    let kill = tx.kill_switch().clone();
    let mut seen = 0u64;
    let r = t.scan_column(1, tx.kill_switch(), |row, _| {
        seen += 1;
        if row == 20 {
            kill.kill();
        }
        Ok(())
    });
    assert!(matches!(r, Err(OlapError::Killed)));
    assert_eq!(seen, 32);

    assert!(matches!(t.scan_column(0, tx.kill_switch(), |_, _| Ok(())), Err(OlapError::Killed)));
}

#[test]
fn rejected_rows_leave_every_column_unchanged() {
    let tmp = TempDir::new().unwrap();
    let e = engine(tmp.path());
    let share = e.create_table("t", 1, &columns()).unwrap();

    let mut tx = e.begin_transaction();
    let w = tx.add_table_wr(&share).unwrap();
    w.load_rows(&rows(0..3)).unwrap();
    let bad = vec![row(3), vec![Value::Int32(4), Value::Int32(4)]];
    assert!(matches!(w.load_rows(&bad), Err(OlapError::Encoding(_))));
    assert_eq!(w.attr(0).num_of_obj(), 3);
    assert_eq!(w.attr(1).num_of_obj(), 3);

    w.load_rows(&rows(3..5)).unwrap();
    assert_eq!(keys(&w), (0..5).collect::<Vec<i64>>());
    assert_eq!(w.get_value(1, 4).unwrap(), Value::Bytes(b"v4".to_vec()));
    drop(w);
    tx.commit().unwrap();
    assert_eq!(share.get_snapshot().unwrap().num_rows(), 5);
}
