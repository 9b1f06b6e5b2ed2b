//! # olap-pack-storage
//!
//! 列式 OLAP 引擎的包存储核心：
//! - **DPN / ColumnShare**：每包一条定长元数据，DPN 数组 mmap，写时复制分配
//! - **粗糙集索引**：Histogram / CMap / Bloom，包级回答 NONE / SOME / ALL
//! - **PackOrderer**：按包统计量给出扫描顺序
//! - **TableShare / Transaction**：TX_ID 多版本快照，符号链接原子发布
//!
//! ## 整体架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StorageEngine                         │
//! │   TxManager (TX_ID 序列 / 活跃集合)     TableShare × N (64 分片) │
//! │                                              │               │
//! │   Transaction ── add_table_rd ──► Table (只读快照)            │
//! │        │      ── add_table_wr ──► Table (写快照, 持写锁)      │
//! │        │                              │                      │
//! │      commit                        Attr × 列数                │
//! │        │                      ┌───────┴────────┐             │
//! │   commit_version          ColumnShare      RoughCheck         │
//! │   (V.<tx> + VERSION 链接)  ├─ DN   (DPN 数组)  ├─ Histogram   │
//! │                           ├─ DATA (包负载)    ├─ CMap         │
//! │                           └─ v/<tx> 列版本    └─ Bloom        │
//! │                                                              │
//! │   PackOrderer ◄── DPN min/max + 粗糙过滤结果                  │
//! │   PackGuardian ── 每 (线程, 维度, 列) 固定一个解压包           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ──────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod testing;
pub mod field_type;

// ── 包与编解码 ────────────────────────────────────────────────────────────────
pub mod encoding;
pub mod compression;
pub mod pack;

// ── 列存储 ────────────────────────────────────────────────────────────────────
pub mod dpn;
pub mod meta;
pub mod index;
pub mod column_share;
pub mod attr;
pub mod rough;
pub mod pack_orderer;
pub mod guardian;

// ── 表与事务 ──────────────────────────────────────────────────────────────────
pub mod table;
pub mod transaction;
pub mod kv;
pub mod storage;
