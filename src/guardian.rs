//! PackGuardian：按 (线程, 维度, 列) 固定当前正在访问的包
//!
//! 同一键只固定一个包；固定新包时释放旧包，扫描越过一个包后
//! 其缓存即可被回收。释放的是固定时记下的 DPN 槽位，之后该包被
//! 写时复制或随提交转为共享都不影响配对。

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use parking_lot::Mutex;
use crate::column_share::ColumnShare;
use crate::common::{PackIndex, Result};
use crate::table::Table;

type PinKey = (ThreadId, usize, usize);

struct Pin {
    table:   Arc<Table>,
    pack_no: usize,
    /// 实际加了引用的槽位；本地包为 None
    held:    Option<(Arc<ColumnShare>, PackIndex)>,
}

impl Pin {
    fn release(self) {
        if let Some((share, idx)) = self.held {
            share.unlock_pack(idx);
        }
    }
}

#[derive(Default)]
pub struct PackGuardian {
    pins: Mutex<HashMap<PinKey, Pin>>,
}

impl std::fmt::Debug for PackGuardian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackGuardian").field("pinned", &self.pins.lock().len()).finish()
    }
}

impl PackGuardian {
    pub fn new() -> Self { Self::default() }

    /// 固定 `col` 列的 `pack_no` 包，释放当前线程在该 (维度, 列) 上的前一个包
    pub fn lock_pack(&self, table: &Arc<Table>, dim: usize, col: usize, pack_no: usize) -> Result<()> {
        let key = (thread::current().id(), dim, col);
        let mut pins = self.pins.lock();
        if pins.get(&key).is_some_and(|p| p.pack_no == pack_no && Arc::ptr_eq(&p.table, table)) {
            return Ok(());
        }
        let held = {
            let attr = table.attr(col);
            attr.lock_pack_for_use(pack_no)?.map(|idx| (attr.share.clone(), idx))
        };
        if let Some(old) = pins.insert(key, Pin { table: table.clone(), pack_no, held }) {
            old.release();
        }
        Ok(())
    }

    /// 当前线程在 `dim` 上固定的包号
    pub fn pinned(&self, dim: usize, col: usize) -> Option<usize> {
        self.pins.lock().get(&(thread::current().id(), dim, col)).map(|p| p.pack_no)
    }

    /// 释放当前线程固定的全部包
    pub fn unlock_all(&self) {
        let me = thread::current().id();
        let mut pins = self.pins.lock();
        let mine: Vec<PinKey> = pins.keys().filter(|k| k.0 == me).copied().collect();
        for key in mine {
            if let Some(p) = pins.remove(&key) {
                p.release();
            }
        }
    }
}

impl Drop for PackGuardian {
    fn drop(&mut self) {
        for (_, p) in self.pins.get_mut().drain() {
            p.release();
        }
    }
}
