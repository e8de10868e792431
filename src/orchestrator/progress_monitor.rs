//! 进度监控 - 编排层
//!
//! 运行期间的后台任务：按固定间隔读取用量快照，估算剩余时间和总费用，
//! 输出到日志和完整日志。
//!
//! 停止是"请求并最多等待一段时间"：超时后直接放弃等待，不阻塞运行结束。

use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::services::{PriceTable, ResultSink, UsageAccumulator, UsageSnapshot};
use crate::utils::format_duration;

/// 一次进度报告
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    pub percent: f64,
    pub done: usize,
    pub total: usize,
    pub active_workers: usize,
    /// 最近几篇的平均耗时
    pub mean_latency: Option<Duration>,
    /// 考虑并发后每篇的实际耗时
    pub per_record: Duration,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub eta: NaiveDateTime,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub total_tokens: u64,
    pub projected_tokens: f64,
    pub per_record_cost: f64,
    pub consumed_cost: f64,
    pub projected_cost: f64,
}

impl ProgressReport {
    /// 根据快照计算进度报告；还没有完成任何记录时返回 None
    pub fn compute(
        snapshot: &UsageSnapshot,
        pricing: &PriceTable,
        model: &str,
        now: NaiveDateTime,
    ) -> Option<Self> {
        if snapshot.processed == 0 {
            return None;
        }

        let processed = snapshot.processed as f64;
        let done = snapshot.processed + snapshot.failed;
        let left = snapshot.total.saturating_sub(done);
        let elapsed_secs = snapshot.elapsed.as_secs_f64();
        let mean_latency = snapshot.mean_duration();

        let remaining_secs = match mean_latency {
            Some(mean) if snapshot.active_workers > 0 => {
                left as f64 * mean.as_secs_f64() / snapshot.active_workers as f64
            }
            _ => left as f64 * elapsed_secs / processed,
        };
        let remaining = Duration::from_secs_f64(remaining_secs.max(0.0));
        let eta = now
            + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());

        let tokens = &snapshot.tokens;
        let total_tokens = tokens.total as f64;
        let per_record_cost = snapshot.cost / processed;

        let projected_cost = if left > 0 {
            let tokens_per_second = if elapsed_secs > 0.0 {
                total_tokens / elapsed_secs
            } else {
                0.0
            };
            let prompt_ratio = if tokens.total > 0 {
                tokens.prompt as f64 / total_tokens
            } else {
                0.0
            };
            let cached = tokens.cache_hit + tokens.cache_miss;
            let cache_miss_ratio = if cached > 0 {
                tokens.cache_miss as f64 / cached as f64
            } else {
                1.0
            };
            snapshot.cost
                + pricing.projected_cost(
                    remaining_secs,
                    tokens_per_second,
                    prompt_ratio,
                    cache_miss_ratio,
                    model,
                    now,
                )
        } else {
            per_record_cost * snapshot.total as f64
        };

        Some(Self {
            percent: if snapshot.total > 0 {
                done as f64 / snapshot.total as f64 * 100.0
            } else {
                100.0
            },
            done,
            total: snapshot.total,
            active_workers: snapshot.active_workers,
            mean_latency,
            per_record: Duration::from_secs_f64(elapsed_secs / processed),
            elapsed: snapshot.elapsed,
            remaining,
            eta,
            avg_prompt_tokens: tokens.prompt as f64 / processed,
            avg_completion_tokens: tokens.completion as f64 / processed,
            total_tokens: tokens.total,
            projected_tokens: total_tokens / processed * snapshot.total as f64,
            per_record_cost,
            consumed_cost: snapshot.cost,
            projected_cost,
        })
    }

    pub fn render(&self, pricing: &PriceTable) -> String {
        let latency = self
            .mean_latency
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "📊 进度: {:.1}% ({}/{}) | 活跃 worker: {}\n\
             ⏱️ 平均耗时: {} | 每篇实际: {} | 已用: {} | 剩余: {} | 预计完成: {}\n\
             🔢 平均 token 输入/输出: {:.0}/{:.0} | 已用 token: {} | 预计总 token: {:.0}\n\
             💰 每篇: {} | 已花费: {} | 预计总费用: {}",
            self.percent,
            self.done,
            self.total,
            self.active_workers,
            latency,
            format_duration(self.per_record),
            format_duration(self.elapsed),
            format_duration(self.remaining),
            self.eta.format("%H:%M:%S"),
            self.avg_prompt_tokens,
            self.avg_completion_tokens,
            self.total_tokens,
            self.projected_tokens,
            pricing.format_price(self.per_record_cost),
            pricing.format_price(self.consumed_cost),
            pricing.format_price(self.projected_cost),
        )
    }
}

/// 后台进度监控任务
pub struct ProgressMonitor {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl ProgressMonitor {
    /// 启动监控
    ///
    /// `stop` 是整次运行的停止信号，监控在它被取消时同样会退出。
    pub fn spawn(
        accumulator: Arc<UsageAccumulator>,
        sink: Arc<ResultSink>,
        pricing: Arc<PriceTable>,
        model: String,
        interval: Duration,
        stop: &CancellationToken,
    ) -> Self {
        let shutdown = stop.child_token();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("进度监控已停止");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = accumulator.snapshot();
                        let now = Local::now().naive_local();
                        if let Some(report) = ProgressReport::compute(&snapshot, &pricing, &model, now) {
                            let text = report.render(&pricing);
                            info!("{}", text);
                            sink.trace(&text).await;
                        }
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    /// 请求停止并最多等待 `timeout`
    ///
    /// 返回 false 表示监控没有按时退出，任务被放弃等待。
    pub async fn stop(self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("⚠️ 进度监控任务异常退出: {}", e);
                true
            }
            Err(_) => {
                warn!("⚠️ 进度监控在 {:?} 内没有停止，不再等待", timeout);
                false
            }
        }
    }
}
