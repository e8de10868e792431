//! # Paper Screen
//!
//! 用 LLM 批量筛选文献的并发引擎：对每篇记录判断是否与研究问题相关，
//! 把相关记录的原始条目写入结果文件，并实时统计 token 用量和费用。
//!
//! ## 架构设计
//!
//! 本系统采用四层架构：
//!
//! ### ① 数据层（Models）
//! - `models/` - 记录、检索条件、密钥与密钥池
//! - `load_records` - 从 JSON 加载已提取好的记录
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单篇记录
//! - `LlmJudge` - 相关性判定能力（实现 `RelevanceJudge`）
//! - `PriceTable` - 分时段计价能力
//! - `UsageAccumulator` - 用量与进度统计
//! - `ResultSink` - 结果与日志写入能力
//! - `ResultAnalyst` - 运行结束后的结果分析（使用预留的分析密钥）
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一篇记录"的完整处理流程
//! - `RecordCtx` - 上下文封装（worker_id + index）
//! - `RecordFlow` - 流程编排（判定 → 计费 → 写入 → 统计）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_dispatcher` - 批次切分、并发调度、汇总
//! - `orchestrator/worker` - 单批次处理
//! - `orchestrator/progress_monitor` - 进度监控
//!
//! ## 模块结构

pub mod config;
pub mod error;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{CancelPolicy, Config};
pub use error::{AnalysisError, AppError, AppResult, ClassificationError};
pub use models::{load_records, Credential, CredentialPool, Query, Record, RecordSet};
pub use orchestrator::{Dispatcher, MaxCount, RunSummary};
pub use services::{
    JudgmentRequest, JudgmentResponse, LlmJudge, RelevanceJudge, ResultAnalyst, Verdict,
};
pub use workflow::{RecordCtx, RecordFlow};
