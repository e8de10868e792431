//! 单批次处理器 - 编排层
//!
//! 一个 worker 绑定一个批次和一个密钥，按索引顺序逐篇调用 [`RecordFlow`]。
//! 单篇失败只记日志，不中断本批次，也不影响其他 worker。

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CancelPolicy;
use crate::error::ClassificationError;
use crate::models::{Credential, Query, RecordSet};
use crate::orchestrator::batch_dispatcher::Batch;
use crate::services::TokenUsage;
use crate::workflow::{RecordCtx, RecordFlow};

/// worker 共享的运行环境
#[derive(Clone)]
pub struct WorkerCtx {
    pub flow: Arc<RecordFlow>,
    pub records: Arc<RecordSet>,
    pub query: Arc<Query>,
    pub cancel_policy: CancelPolicy,
    pub stop: CancellationToken,
}

/// 一个批次的处理结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub worker_id: usize,
    pub relevant: usize,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub processed: usize,
    pub failed: usize,
    /// 收到停止信号而提前结束
    pub cancelled: bool,
}

/// 处理一个批次
///
/// 在 `StopBetweenRecords` 策略下，每篇开始前检查停止信号；
/// 正在进行中的调用不会被打断。
pub async fn run_batch(batch: Batch, credential: Credential, ctx: WorkerCtx) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        worker_id: batch.worker_id,
        ..Default::default()
    };

    info!(
        "[Worker-{}] 🚀 开始处理记录 {}-{}（共 {} 篇），密钥: {}",
        batch.worker_id,
        batch.start,
        batch.end,
        batch.len(),
        credential
    );

    for index in batch.indices() {
        if ctx.cancel_policy == CancelPolicy::StopBetweenRecords && ctx.stop.is_cancelled() {
            warn!(
                "[Worker-{}] ⏹️ 收到停止信号，在记录 {} 之前结束本批次",
                batch.worker_id, index
            );
            outcome.cancelled = true;
            break;
        }

        let Some(record) = ctx.records.get(index) else {
            debug!("[Worker-{}] 记录 {} 不在工作集中，跳过", batch.worker_id, index);
            continue;
        };

        let record_ctx = RecordCtx::new(batch.worker_id, index);
        match ctx
            .flow
            .process(record, &ctx.query, &credential, &record_ctx)
            .await
        {
            Ok(result) => {
                outcome.processed += 1;
                outcome.tokens.add(&result.tokens);
                outcome.cost += result.cost;
                if result.verdict.is_relevant() {
                    outcome.relevant += 1;
                }
            }
            Err(e) => {
                outcome.failed += 1;
                ctx.flow.accumulator().record_failure();
                match &e {
                    ClassificationError::Unrecorded { tokens, cost, .. } => {
                        // 用量已在流程里计入累加器，这里只补到批次结果
                        outcome.tokens.add(tokens);
                        outcome.cost += cost;
                        warn!("{} ⚠️ 结果写入失败: {}", record_ctx, e)
                    }
                    _ => warn!("{} ⚠️ 判定失败，跳过: {}", record_ctx, e),
                }
                ctx.flow
                    .sink()
                    .trace(&format!(
                        "[Worker-{}] record {} failed: {}",
                        batch.worker_id, index, e
                    ))
                    .await;
            }
        }
    }

    ctx.flow.accumulator().worker_finished();

    info!(
        "[Worker-{}] ✓ 批次结束: 完成 {}，相关 {}，失败 {}",
        batch.worker_id, outcome.processed, outcome.relevant, outcome.failed
    );

    outcome
}
