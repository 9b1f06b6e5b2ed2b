//! 提交协议的崩溃一致性
//!
//! 在每个注入点让提交失败，然后从磁盘重新打开表：rename 之前崩溃看到
//! 旧版本，rename 之后看到新版本；两种情况下后续提交都必须成功。

use std::fs;
use std::path::Path;
use std::sync::Arc;
use olap_pack_storage::common::{OlapError, TxId};
use olap_pack_storage::config::StorageConfig;
use olap_pack_storage::field_type::{ColumnMeta, ColumnType, Value};
use olap_pack_storage::meta::{self, TABLE_VERSION_FILE, TABLE_VERSION_FILE_TMP};
use olap_pack_storage::storage::StorageEngine;
use olap_pack_storage::table::{Table, TableShare};
use olap_pack_storage::testing::{CrashPoint, FailPoints};
use olap_pack_storage::transaction::TxManager;
use tempfile::TempDir;

const POINTS: [CrashPoint; 4] = [
    CrashPoint::AfterSaveVersion,
    CrashPoint::AfterVersionFile,
    CrashPoint::AfterTmpSymlink,
    CrashPoint::AfterRename,
];

fn config(fp: &Arc<FailPoints>) -> Arc<StorageConfig> {
    Arc::new(
        StorageConfig::default()
            .with_pack_size_shift(2)
            .with_sync_buffers(true)
            .with_fail_points(fp.clone()),
    )
}

fn columns() -> Vec<ColumnMeta> {
    vec![
        ColumnMeta::new("id", ColumnType::Int64),
        ColumnMeta::new("tag", ColumnType::Varchar).with_bloom(),
    ]
}

fn row(id: i64) -> Vec<Value> { vec![Value::Int64(id), Value::Bytes(format!("t{id}").into_bytes())] }

fn commit(share: &TableShare, mgr: &TxManager, f: impl FnOnce(&Table)) -> TxId {
    let xid = mgr.begin();
    let w = share.get_table_for_write(xid, mgr).unwrap();
    f(&w);
    assert!(w.commit_version(xid).unwrap());
    share.commit_write(&w, mgr.max_xid(), true);
    mgr.end(xid);
    xid
}

/// 基线：10 行，id = 0..10
fn seeded(dir: &Path, fp: &Arc<FailPoints>, mgr: &TxManager) -> TxId {
    let share = TableShare::create(dir, 1, &columns(), config(fp)).unwrap();
    commit(&share, mgr, |t| t.load_rows(&(0..10).map(row).collect::<Vec<_>>()).unwrap())
}

/// 追加 5 行、改写第 0 行、删除第 3 行
fn modify(t: &Table) {
    t.load_rows(&(10..15).map(row).collect::<Vec<_>>()).unwrap();
    t.update_value(0, 0, &Value::Int64(-1)).unwrap();
    t.delete_row(3).unwrap();
}

fn assert_old(t: &Table) {
    assert_eq!(t.num_rows(), 10);
    assert_eq!(t.get_value(0, 0).unwrap(), Value::Int64(0));
    assert_eq!(t.get_value(0, 3).unwrap(), Value::Int64(3));
    assert_eq!(t.attr(0).num_of_deleted(), 0);
}

fn assert_new(t: &Table) {
    assert_eq!(t.num_rows(), 15);
    assert_eq!(t.get_value(0, 0).unwrap(), Value::Int64(-1));
    assert_eq!(t.get_value(0, 14).unwrap(), Value::Int64(14));
    assert_eq!(t.get_value(1, 12).unwrap(), Value::Bytes(b"t12".to_vec()));
    assert_eq!(t.attr(0).num_of_deleted(), 1);
}

fn assert_reopens_and_accepts_commits(dir: &Path, fp: &Arc<FailPoints>, expect_new: bool, crashed: TxId) {
    let share = TableShare::open(dir, config(fp)).unwrap();
    let snap = share.get_snapshot().unwrap();
    snap.verify().unwrap();
    if expect_new {
        assert_eq!(share.current_version(), crashed);
        assert_new(&snap);
    } else {
        assert_ne!(share.current_version(), crashed);
        assert_old(&snap);
    }
    let before = snap.num_rows();
    drop(snap);

    let mgr = TxManager::with_seed(900);
    let xid = commit(&share, &mgr, |t| t.load_rows(&[row(100)]).unwrap());
    drop(share);

    let share = TableShare::open(dir, config(fp)).unwrap();
    assert_eq!(share.current_version(), xid);
    let snap = share.get_snapshot().unwrap();
    assert_eq!(snap.num_rows(), before + 1);
    assert_eq!(snap.get_value(0, before).unwrap(), Value::Int64(100));
    assert!(dir.join(TABLE_VERSION_FILE_TMP).symlink_metadata().is_err());
}

#[test]
fn process_death_at_each_point_recovers() {
    for point in POINTS {
        let tmp = TempDir::new().unwrap();
        let fp = Arc::new(FailPoints::new());
        let mgr = TxManager::with_seed(1);
        seeded(tmp.path(), &fp, &mgr);

        let share = TableShare::open(tmp.path(), config(&fp)).unwrap();
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        modify(&w);
        fp.arm(point);
        assert!(matches!(w.commit_version(xid), Err(OlapError::System(_))), "{point:?}");

        // 进程在此处死亡：不回滚，不做任何清理
        std::mem::forget(w);
        drop(share);

        assert_reopens_and_accepts_commits(tmp.path(), &fp, point == CrashPoint::AfterRename, xid);
    }
}

#[test]
fn failed_commit_rolls_back_or_finishes() {
    for point in POINTS {
        let tmp = TempDir::new().unwrap();
        let fp = Arc::new(FailPoints::new());
        let mgr = TxManager::with_seed(1);
        let base = seeded(tmp.path(), &fp, &mgr);

        let share = TableShare::open(tmp.path(), config(&fp)).unwrap();
        let xid = mgr.begin();
        let w = share.get_table_for_write(xid, &mgr).unwrap();
        modify(&w);
        fp.arm(point);
        assert!(w.commit_version(xid).is_err());

        let published = point == CrashPoint::AfterRename;
        assert_eq!(w.is_published(), published);
        if published {
            share.commit_write(&w, mgr.max_xid(), true);
        } else {
            w.rollback();
            assert!(!tmp.path().join(meta::version_file_name(xid)).exists(), "{point:?}");
        }
        assert!(!w.holds_write_lock());
        mgr.end(xid);

        let snap = share.get_snapshot().unwrap();
        if published {
            assert_eq!(share.current_version(), xid);
            assert_new(&snap);
        } else {
            assert_eq!(share.current_version(), base);
            assert_old(&snap);
        }
        let target = fs::read_link(tmp.path().join(TABLE_VERSION_FILE)).unwrap();
        assert_eq!(target.to_str(), Some(meta::version_file_name(share.current_version()).as_str()));
        drop((snap, w, share));

        assert_reopens_and_accepts_commits(tmp.path(), &fp, published, xid);
    }
}

#[test]
fn transaction_commit_reports_injected_failure() {
    let tmp = TempDir::new().unwrap();
    let fp = Arc::new(FailPoints::new());
    let engine = StorageEngine::new(tmp.path(), StorageConfig::default()
        .with_pack_size_shift(2)
        .with_sync_buffers(false)
        .with_fail_points(fp.clone()))
        .unwrap();
    let a = engine.create_table("a", 1, &columns()).unwrap();
    let b = engine.create_table("b", 2, &columns()).unwrap();

    let mut tx = engine.begin_transaction();
    tx.add_table_wr(&a).unwrap().load_rows(&[row(1)]).unwrap();
    tx.add_table_wr(&b).unwrap().load_rows(&[row(2)]).unwrap();
    fp.arm(CrashPoint::AfterVersionFile);
    assert!(tx.commit().is_err());
    assert_eq!(engine.tx_manager().num_live(), 0);

    // 第一张表失败，第二张回滚
    assert_eq!(a.get_snapshot().unwrap().num_rows(), 0);
    assert_eq!(b.get_snapshot().unwrap().num_rows(), 0);

    let mut tx = engine.begin_transaction();
    tx.add_table_wr(&b).unwrap().load_rows(&[row(3)]).unwrap();
    tx.commit().unwrap();
    assert_eq!(b.get_snapshot().unwrap().get_value(0, 0).unwrap(), Value::Int64(3));
}
