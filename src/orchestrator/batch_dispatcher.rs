//! 批量调度器 - 编排层
//!
//! ## 职责
//!
//! 把待处理记录静态切分成连续的批次，每个批次绑定一个密钥和一个 worker 并发处理，
//! 最后汇总结果。
//!
//! ## 核心流程
//!
//! 1. **确定规模**：P = min(最大数量, 记录数)，T = min(密钥数, P)
//! 2. **静态切分**：前 `P mod T` 个批次各多分 1 篇，按索引顺序连续切分
//! 3. **准备运行**：清零用量统计，创建（截断）输出文件，启动进度监控
//! 4. **并发处理**：每个批次一个 tokio 任务，单篇或单个 worker 的失败不影响其他 worker
//! 5. **汇总**：等待全部 worker，有限时间内停止进度监控，输出统计
//!
//! ## 设计特点
//!
//! - **无工作窃取**：批次在调度时就固定
//! - **向下委托**：单批次交给 `worker::run_batch`，单篇交给 `RecordFlow`

use chrono::Local;
use futures::future::join_all;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CancelPolicy, Config};
use crate::error::{AppResult, DispatchError};
use crate::models::{Credential, Query, RecordSet};
use crate::orchestrator::progress_monitor::ProgressMonitor;
use crate::orchestrator::worker::{run_batch, BatchOutcome, WorkerCtx};
use crate::services::{
    PriceTable, RelevanceJudge, ResultSink, RunArtifacts, TokenUsage, UsageAccumulator,
};
use crate::utils::format_duration;
use crate::utils::logging::{banner, rule};
use crate::workflow::RecordFlow;

/// 本次最多处理多少篇
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxCount {
    #[default]
    Unbounded,
    Limit(usize),
}

impl MaxCount {
    /// 结合实际记录数得到 P
    pub fn resolve(self, available: usize) -> usize {
        match self {
            MaxCount::Unbounded => available,
            MaxCount::Limit(n) => n.min(available),
        }
    }
}

impl From<Option<usize>> for MaxCount {
    fn from(value: Option<usize>) -> Self {
        value.map_or(MaxCount::Unbounded, MaxCount::Limit)
    }
}

/// 一个批次：连续的记录索引 `start..=end`（从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// 从 1 开始，与日志中的 `Worker-i` 一致
    pub worker_id: usize,
    pub start: usize,
    pub end: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn indices(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// 把索引 `1..=p` 切成 `min(t, p)` 个连续批次
///
/// 第 i 个批次（i 从 0 计）在 `i < p mod t` 时分到 `p / t + 1` 篇，否则 `p / t` 篇，
/// 其 `worker_id` 为 `i + 1`。
pub fn partition(p: usize, t: usize) -> Vec<Batch> {
    let t = t.min(p);
    if t == 0 {
        return Vec::new();
    }

    let base = p / t;
    let remainder = p % t;
    let mut next = 1;
    (0..t)
        .map(|i| {
            let size = if i < remainder { base + 1 } else { base };
            let batch = Batch {
                worker_id: i + 1,
                start: next,
                end: next + size - 1,
            };
            next += size;
            batch
        })
        .collect()
}

/// 一次运行的汇总
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub relevant: usize,
    pub failed: usize,
    pub tokens: TokenUsage,
    /// 按每篇完成时刻价格累计的费用
    pub accrued_cost: f64,
    /// 按结束时刻价格对总用量计价
    pub instant_cost: f64,
    pub elapsed: Duration,
    pub workers: usize,
    /// 有 worker 因停止信号提前结束
    pub cancelled: bool,
    /// P = 0 时没有输出文件
    pub artifacts: Option<RunArtifacts>,
}

impl RunSummary {
    /// 每秒完成的记录数（墙钟时间，已包含并发）
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }

    /// 按并发折算的单篇耗时，即吞吐量的倒数
    pub fn time_per_record(&self) -> Option<Duration> {
        let throughput = self.throughput();
        (throughput > 0.0).then(|| Duration::from_secs_f64(1.0 / throughput))
    }
}

/// 批量调度器
pub struct Dispatcher {
    judge: Arc<dyn RelevanceJudge>,
    accumulator: Arc<UsageAccumulator>,
    pricing: Arc<PriceTable>,
    model: String,
    result_folder: PathBuf,
    log_folder: PathBuf,
    save_full_log: bool,
    verbose_logging: bool,
    progress_interval: Duration,
    monitor_join_timeout: Duration,
    cancel_policy: CancelPolicy,
}

impl Dispatcher {
    pub fn new(config: &Config, judge: Arc<dyn RelevanceJudge>) -> AppResult<Self> {
        Ok(Self {
            judge,
            accumulator: Arc::new(UsageAccumulator::new()),
            pricing: Arc::new(config.price_table()?),
            model: config.model_name.clone(),
            result_folder: PathBuf::from(&config.result_folder),
            log_folder: PathBuf::from(&config.log_folder),
            save_full_log: config.save_full_log,
            verbose_logging: config.verbose_logging,
            progress_interval: Duration::from_millis(config.progress_interval_ms.max(1)),
            monitor_join_timeout: Duration::from_millis(config.monitor_join_timeout_ms),
            cancel_policy: config.cancel_policy,
        })
    }

    pub fn accumulator(&self) -> Arc<UsageAccumulator> {
        Arc::clone(&self.accumulator)
    }

    /// 运行一次筛选
    ///
    /// 没有处理密钥时返回 `DispatchError::NoWorkers`，此时不会创建任何文件；
    /// 没有可处理的记录时返回空汇总。
    pub async fn dispatch(
        &self,
        records: Arc<RecordSet>,
        max_count: MaxCount,
        credentials: &[Credential],
        query: &Query,
        stop: CancellationToken,
    ) -> AppResult<RunSummary> {
        if credentials.is_empty() {
            error!("❌ {}", DispatchError::NoWorkers);
            return Err(DispatchError::NoWorkers.into());
        }

        let p = max_count.resolve(records.len());
        if p == 0 {
            warn!("⚠️ 没有需要处理的记录，程序结束");
            return Ok(RunSummary::default());
        }

        let batches = partition(p, credentials.len());
        let worker_count = batches.len();
        let started = Instant::now();
        let started_at = Local::now();

        self.accumulator.reset(p);
        self.accumulator.set_active_workers(worker_count);

        let artifacts = RunArtifacts::named(
            &self.result_folder,
            &self.log_folder,
            started_at,
            self.save_full_log,
        );
        let sink = Arc::new(ResultSink::create(artifacts, query, started_at)?);

        log_startup(p, worker_count, credentials.len(), &sink.artifacts().result);

        let monitor = ProgressMonitor::spawn(
            Arc::clone(&self.accumulator),
            Arc::clone(&sink),
            Arc::clone(&self.pricing),
            self.model.clone(),
            self.progress_interval,
            &stop,
        );

        let flow = RecordFlow::new(
            Arc::clone(&self.judge),
            Arc::clone(&self.accumulator),
            Arc::clone(&sink),
            Arc::clone(&self.pricing),
            self.model.clone(),
        )
        .with_verbose_logging(self.verbose_logging);

        let ctx = WorkerCtx {
            flow: Arc::new(flow),
            records,
            query: Arc::new(query.clone()),
            cancel_policy: self.cancel_policy,
            stop,
        };

        // 每个批次一个任务，密钥按位置分配
        let mut worker_ids = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for (batch, credential) in batches.into_iter().zip(credentials.iter()) {
            worker_ids.push(batch.worker_id);
            handles.push(tokio::spawn(run_batch(batch, credential.clone(), ctx.clone())));
        }

        let mut summary = RunSummary {
            workers: worker_count,
            ..Default::default()
        };

        for (worker_id, joined) in worker_ids.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(outcome) => {
                    log_batch_complete(&outcome);
                    summary.processed += outcome.processed;
                    summary.relevant += outcome.relevant;
                    summary.failed += outcome.failed;
                    summary.tokens.add(&outcome.tokens);
                    summary.accrued_cost += outcome.cost;
                    summary.cancelled |= outcome.cancelled;
                }
                Err(e) => {
                    error!("[Worker-{}] ❌ 任务执行失败: {}", worker_id, e);
                    sink.trace(&format!("[Worker-{}] batch failed: {}", worker_id, e))
                        .await;
                    self.accumulator.worker_finished();
                }
            }
        }

        if !monitor.stop(self.monitor_join_timeout).await {
            sink.trace("progress monitor did not stop in time").await;
        }

        summary.elapsed = started.elapsed();
        summary.instant_cost = self.pricing.instant_cost(
            summary.tokens.volume(),
            &self.model,
            Local::now().naive_local(),
        );
        summary.artifacts = Some(sink.artifacts().clone());

        // 最终统计同时写入完整日志
        for line in final_stats(&summary, p, &self.pricing) {
            info!("{}", line);
            sink.trace(&line).await;
        }
        if summary.cancelled {
            warn!("⏹️ 运行被停止，部分记录未处理");
            sink.trace("run stopped before all records were processed").await;
        }
        info!("\n结果已保存至: {}", sink.artifacts().result.display());

        Ok(summary)
    }
}

// ========== 日志辅助函数 ==========

fn log_startup(total: usize, workers: usize, credentials: usize, result: &Path) {
    info!("{}", banner());
    info!("🚀 开始筛选 - 多 worker 并发模式");
    info!("📄 待处理记录: {} 篇", total);
    info!("📊 worker 数: {}（可用密钥 {} 个）", workers, credentials);
    info!("📁 结果文件: {}", result.display());
    info!("{}", banner());
}

fn log_batch_complete(outcome: &BatchOutcome) {
    info!("{}", rule());
    info!(
        "✓ Worker-{} 完成: 处理 {}，相关 {}，失败 {}{}",
        outcome.worker_id,
        outcome.processed,
        outcome.relevant,
        outcome.failed,
        if outcome.cancelled { "（已提前停止）" } else { "" }
    );
    info!("{}", rule());
}

fn final_stats(summary: &RunSummary, total: usize, pricing: &PriceTable) -> Vec<String> {
    let per_record = summary
        .time_per_record()
        .map_or_else(|| "-".to_string(), |d| format!("{:.2} 秒", d.as_secs_f64()));

    vec![
        banner(),
        "📊 全部处理完成统计".to_string(),
        format!("完成时间: {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
        banner(),
        format!("✅ 已处理: {}/{}", summary.processed, total),
        format!("🎯 相关: {}", summary.relevant),
        format!("❌ 失败: {}", summary.failed),
        format!(
            "🔢 token: 共 {}（输入 {}，输出 {}，缓存命中 {}）",
            summary.tokens.total,
            summary.tokens.prompt,
            summary.tokens.completion,
            summary.tokens.cache_hit
        ),
        format!(
            "💰 费用: {}（按结束时价格 {}）",
            pricing.format_price(summary.accrued_cost),
            pricing.format_price(summary.instant_cost)
        ),
        format!("⏱️ 用时: {}", format_duration(summary.elapsed)),
        format!(
            "⚡ 速度: {:.2} 篇/秒，平均每篇 {}（{} 个 worker 并发）",
            summary.throughput(),
            per_record,
            summary.workers
        ),
        banner(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_complete_and_balanced() {
        for p in 0..=40 {
            for t in 0..=12 {
                let batches = partition(p, t);
                assert_eq!(batches.len(), t.min(p));

                let indices: Vec<usize> = batches.iter().flat_map(|b| b.indices()).collect();
                let expected: Vec<usize> = if batches.is_empty() {
                    Vec::new()
                } else {
                    (1..=p).collect()
                };
                assert_eq!(indices, expected, "p={} t={}", p, t);

                if let (Some(max), Some(min)) = (
                    batches.iter().map(Batch::len).max(),
                    batches.iter().map(Batch::len).min(),
                ) {
                    assert!(max - min <= 1);
                    assert!(min >= 1);
                }
            }
        }
    }

    #[test]
    fn test_partition_remainder_goes_first() {
        let batches = partition(10, 3);
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(batches[1].indices(), 5..=7);
        let ids: Vec<usize> = batches.iter().map(|b| b.worker_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_throughput_accounts_for_concurrency() {
        let summary = RunSummary {
            processed: 20,
            workers: 4,
            elapsed: Duration::from_secs(10),
            ..Default::default()
        };
        assert!((summary.throughput() - 2.0).abs() < 1e-9);
        assert_eq!(summary.time_per_record(), Some(Duration::from_millis(500)));

        let empty = RunSummary::default();
        assert_eq!(empty.throughput(), 0.0);
        assert_eq!(empty.time_per_record(), None);
    }

    #[test]
    fn test_final_stats_include_speed() {
        let pricing = Config::default().price_table().unwrap();
        let summary = RunSummary {
            processed: 20,
            workers: 4,
            elapsed: Duration::from_secs(10),
            ..Default::default()
        };
        let lines = final_stats(&summary, 20, &pricing);
        let speed = lines.iter().find(|l| l.contains("篇/秒")).unwrap();
        assert!(speed.contains("2.00 篇/秒"));
        assert!(speed.contains("0.50 秒"));
        assert!(speed.contains("4 个 worker"));
    }

    #[test]
    fn test_max_count_resolve() {
        assert_eq!(MaxCount::Unbounded.resolve(7), 7);
        assert_eq!(MaxCount::Limit(3).resolve(7), 3);
        assert_eq!(MaxCount::Limit(30).resolve(7), 7);
        assert_eq!(MaxCount::from(None), MaxCount::Unbounded);
        assert_eq!(MaxCount::from(Some(2)), MaxCount::Limit(2));
    }
}
