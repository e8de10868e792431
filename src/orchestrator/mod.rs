//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批次划分和并发调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_dispatcher` - 批量调度器
//! - 计算 P / T，静态切分批次
//! - 准备输出文件，清零用量统计
//! - 启动、停止进度监控
//! - 等待所有 worker 并汇总
//!
//! ### `worker` - 单批次处理器
//! - 按索引顺序遍历一个批次
//! - 单篇失败时记日志并继续
//! - 按取消策略响应停止信号
//!
//! ### `progress_monitor` - 进度监控
//! - 定时输出进度、剩余时间和费用预估
//!
//! ## 层次关系
//!
//! ```text
//! batch_dispatcher (处理 RecordSet)
//!     ↓
//! worker (处理一个 Batch)
//!     ↓
//! workflow::RecordFlow (处理单篇 Record)
//!     ↓
//! services (能力层：judgment / pricing / usage / result_sink)
//! ```

pub mod batch_dispatcher;
pub mod progress_monitor;
pub mod worker;

pub use batch_dispatcher::{partition, Batch, Dispatcher, MaxCount, RunSummary};
pub use progress_monitor::{ProgressMonitor, ProgressReport};
pub use worker::{run_batch, BatchOutcome, WorkerCtx};
