//! 提交协议的崩溃注入点
//!
//! 提交流程在每个关键步骤后调用 [`FailPoints::hit`]。被武装的点返回
//! `OlapError::System`，此时磁盘状态与进程在该点被杀死完全一致；随后重新
//! 打开表即可验证崩溃一致性。

use std::sync::atomic::{AtomicU8, Ordering};
use crate::common::{OlapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CrashPoint {
    /// 各列 DPN / 数据 / 列版本文件已写出，表版本文件尚未写
    AfterSaveVersion = 1,
    /// 新表版本文件已写出，临时符号链接尚未创建
    AfterVersionFile = 2,
    /// 临时符号链接已创建并落盘，尚未 rename
    AfterTmpSymlink  = 3,
    /// rename 已完成，旧版本文件尚未删除
    AfterRename      = 4,
}

impl CrashPoint {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::AfterSaveVersion),
            2 => Some(Self::AfterVersionFile),
            3 => Some(Self::AfterTmpSymlink),
            4 => Some(Self::AfterRename),
            _ => None,
        }
    }
}

/// 单发故障注入器：触发一次后自动解除
#[derive(Debug, Default)]
pub struct FailPoints {
    armed: AtomicU8,
}

impl FailPoints {
    pub fn new() -> Self { Self::default() }

    pub fn arm(&self, point: CrashPoint) {
        self.armed.store(point as u8, Ordering::SeqCst);
    }

    pub fn disarm(&self) { self.armed.store(0, Ordering::SeqCst); }

    pub fn armed(&self) -> Option<CrashPoint> {
        CrashPoint::from_u8(self.armed.load(Ordering::SeqCst))
    }

    pub fn hit(&self, point: CrashPoint) -> Result<()> {
        if self.armed
            .compare_exchange(point as u8, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(OlapError::System(format!("injected crash at {point:?}")));
        }
        Ok(())
    }
}
