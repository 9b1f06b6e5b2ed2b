//! # olap-pack-storage 使用案例
//!
//! 1. 启动 StorageEngine
//! 2. 建表（含 Bloom 过滤器的字符串列）
//! 3. 事务写入并原子发布
//! 4. 粗糙集过滤：逐包 NONE / SOME / ALL
//! 5. PackOrderer 按包最小值排序访问
//! 6. 快照隔离：旧读者不受新提交影响
//! 7. 重新打开引擎，从 VERSION 链接恢复

use std::sync::Arc;
use olap_pack_storage::{
    common::{Result, RsValue},
    config::StorageConfig,
    field_type::{ColumnMeta, ColumnType, Value},
    pack_orderer::{OrderType, PackOrderer},
    rough::{Descriptor, Operator},
    storage::StorageEngine,
};

fn main() -> Result<()> {
    println!("═══════════════════════════════════════════════════════════");
    println!("   olap-pack-storage 演示                                  ");
    println!("═══════════════════════════════════════════════════════════\n");

    let data_dir = std::env::temp_dir().join("olap-pack-demo");
    let _ = std::fs::remove_dir_all(&data_dir);
    let config = StorageConfig::default()
        .with_pack_size_shift(10)
        .with_sync_buffers(false);

    // =========================================================================
    // 1. 启动 StorageEngine
    // =========================================================================
    println!("【1】启动 StorageEngine ...");
    let engine = StorageEngine::new(&data_dir, config.clone())?;
    println!("    data_dir  = {}", engine.data_dir().display());
    println!("    pack_size = {} 行\n", engine.config().pack_size());

    // =========================================================================
    // 2. 建表
    // =========================================================================
    println!("【2】创建表 `orders` ...");
    let columns = vec![
        ColumnMeta::new("order_id", ColumnType::Int64).not_null(),
        ColumnMeta::new("amount",   ColumnType::Float64),
        ColumnMeta::new("status",   ColumnType::Varchar).with_bloom(),
    ];
    let orders = engine.create_table("orders", 1000, &columns)?;
    println!("    ✓ 列数 = {}  版本 = {}\n", orders.num_columns(), orders.current_version());

    // =========================================================================
    // 3. 写入并提交
    // =========================================================================
    println!("【3】写入 10000 行并提交 ...");
    let statuses = ["pending", "paid", "shipped", "delivered", "cancelled"];
    let rows: Vec<Vec<Value>> = (0i64..10_000)
        .map(|i| vec![
            Value::Int64(1_000_000 + i),
            if i % 97 == 0 { Value::Null } else { Value::Float64(9.9 + i as f64 * 0.5) },
            Value::Bytes(statuses[i as usize % 5].as_bytes().to_vec()),
        ])
        .collect();

    let mut tx = engine.begin_transaction();
    let t = tx.add_table_wr(&orders)?;
    t.load_rows(&rows)?;
    drop(t);
    tx.commit()?;
    let v1 = orders.current_version();
    println!("    ✓ 已发布版本 {v1}\n");

    // =========================================================================
    // 4. 粗糙集过滤
    // =========================================================================
    println!("【4】粗糙集过滤 ...");
    let mut reader = engine.begin_transaction();
    let snap = reader.add_table_rd(&orders)?;
    println!("    行数 = {}  包数 = {}", snap.num_rows(), snap.num_packs());

    let by_id = Descriptor::between(Value::Int64(1_003_000), Value::Int64(1_004_500));
    let f = snap.rough_filter(0, &by_id);
    println!("    order_id BETWEEN 1003000 AND 1004500 → {:?}", f);

    let by_amount = Descriptor::compare(Operator::More, Value::Float64(4000.0));
    println!("    amount > 4000.0                     → {:?}", snap.rough_filter(1, &by_amount));

    let missing = Descriptor::eq(Value::Bytes(b"refunded".to_vec()));
    let none = snap.rough_filter(2, &missing).iter().filter(|r| **r == RsValue::None).count();
    println!("    status = 'refunded' 被排除的包       = {none}/{}\n", snap.num_packs());

    // =========================================================================
    // 5. PackOrderer
    // =========================================================================
    println!("【5】PackOrderer (MinDesc, 带过滤) ...");
    let visit: Vec<usize> = {
        let attr = snap.attr(0);
        PackOrderer::new(&*attr, OrderType::MinDesc, Some(f.as_slice()), engine.config()).collect()
    };
    println!("    访问顺序 = {visit:?}");

    let mut hits = 0u64;
    snap.scan_column(0, reader.kill_switch(), |_, v| {
        if by_id.matches(&v) { hits += 1; }
        Ok(())
    })?;
    println!("    精确扫描命中行数 = {hits}\n");

    // =========================================================================
    // 6. 快照隔离
    // =========================================================================
    println!("【6】更新 + 删除，旧读者不受影响 ...");
    let mut writer = engine.begin_transaction();
    let w = writer.add_table_wr(&orders)?;
    w.update_value(2, 0, &Value::Bytes(b"refunded".to_vec()))?;
    w.delete_row(1)?;
    drop(w);
    writer.commit()?;

    println!("    旧快照 status[0] = {}", snap.get_value(2, 0)?);
    let mut fresh = engine.begin_transaction();
    let now = fresh.add_table_rd(&orders)?;
    println!("    新快照 status[0] = {}  已删除行数 = {}", now.get_value(2, 0)?, now.attr(0).num_of_deleted());
    println!("    历史快照数 = {}", orders.history_len());
    drop(snap);
    reader.rollback();
    fresh.rollback();
    println!("    读者结束后历史快照数 = {}\n", orders.history_len());

    // =========================================================================
    // 7. 重新打开
    // =========================================================================
    println!("【7】重新打开引擎 ...");
    let latest = orders.current_version();
    drop(now);
    drop(orders);
    drop(engine);
    let engine = StorageEngine::new(&data_dir, config)?;
    let orders: Arc<_> = engine.get_table_share("orders")?;
    println!("    ✓ 版本 {} (提交前 {v1})，行数 = {}",
        orders.current_version(), orders.get_snapshot()?.num_rows());
    assert_eq!(orders.current_version(), latest);

    println!("\n═══════════════════════════════════════════════════════════");
    println!("   全部演示完成 ✓");
    println!("═══════════════════════════════════════════════════════════");
    Ok(())
}
