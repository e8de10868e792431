//! 记录处理上下文
//!
//! 封装"哪个 worker 正在处理第几篇"这一信息

use std::fmt::Display;

/// 记录处理上下文
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordCtx {
    /// worker 编号（从 1 开始，与批次编号一致）
    pub worker_id: usize,

    /// 记录索引（从 1 开始）
    pub index: usize,
}

impl RecordCtx {
    pub fn new(worker_id: usize, index: usize) -> Self {
        Self { worker_id, index }
    }
}

impl Display for RecordCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Worker-{} 记录#{}]", self.worker_id, self.index)
    }
}
