//! 用量统计服务 - 业务能力层
//!
//! 进程内唯一的 token / 进度计数器，由调度器创建并以 `Arc` 共享给所有 worker。
//!
//! 两组字段各有一把锁：
//! - token 组：每篇记录完成时由对应 worker 更新一次
//! - 进度组：已处理数量、最近 10 次耗时、活跃 worker 数
//!
//! 读取快照时分别持有两把锁，所以快照可能出现"进度已 +1 但 token 还没加上"
//! 这样的瞬时不一致，只影响进度报告。

use crate::services::pricing::TokenVolume;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 耗时历史保留的条数
pub const DURATION_HISTORY_LEN: usize = 10;

/// 估算时每个字符约合的 token 数
const TOKENS_PER_CHAR: f64 = 0.6;
/// 估算时输入 token 占比
const ESTIMATED_PROMPT_SHARE: f64 = 0.8;

/// 一次调用（或累计）的 token 用量
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
    pub cache_hit: u64,
    pub cache_miss: u64,
}

impl TokenUsage {
    /// 服务没有返回用量时按字符数估算
    ///
    /// 总量约为字符数 × 0.6，其中 80% 记为输入且全部视为缓存未命中。
    pub fn estimate_from_chars(chars: usize) -> Self {
        let total = (chars as f64 * TOKENS_PER_CHAR) as u64;
        let prompt = (total as f64 * ESTIMATED_PROMPT_SHARE) as u64;
        Self {
            total,
            prompt,
            completion: total - prompt,
            cache_hit: 0,
            cache_miss: prompt,
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.total += other.total;
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.cache_hit += other.cache_hit;
        self.cache_miss += other.cache_miss;
    }

    pub fn volume(&self) -> TokenVolume {
        TokenVolume {
            prompt: self.prompt as f64,
            completion: self.completion as f64,
            cache_hit: self.cache_hit as f64,
            cache_miss: self.cache_miss as f64,
        }
    }
}

#[derive(Debug, Default)]
struct TokenLedger {
    usage: TokenUsage,
    /// 按每篇完成时刻的价格累计的费用
    cost: f64,
}

#[derive(Debug)]
struct ProgressLedger {
    processed: usize,
    failed: usize,
    total: usize,
    durations: VecDeque<Duration>,
    active_workers: usize,
    started: Instant,
    started_at: DateTime<Local>,
}

impl ProgressLedger {
    fn fresh(total: usize) -> Self {
        Self {
            processed: 0,
            failed: 0,
            total,
            durations: VecDeque::with_capacity(DURATION_HISTORY_LEN),
            active_workers: 0,
            started: Instant::now(),
            started_at: Local::now(),
        }
    }
}

/// 某一时刻的用量快照
#[derive(Clone, Debug)]
pub struct UsageSnapshot {
    pub tokens: TokenUsage,
    pub cost: f64,
    pub processed: usize,
    pub failed: usize,
    pub total: usize,
    pub durations: Vec<Duration>,
    pub active_workers: usize,
    pub elapsed: Duration,
    pub started_at: DateTime<Local>,
}

impl UsageSnapshot {
    /// 最近几篇的平均耗时
    pub fn mean_duration(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        let sum: Duration = self.durations.iter().sum();
        Some(sum / self.durations.len() as u32)
    }
}

/// 线程安全的用量累加器
#[derive(Debug)]
pub struct UsageAccumulator {
    tokens: Mutex<TokenLedger>,
    progress: Mutex<ProgressLedger>,
}

impl Default for UsageAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(TokenLedger::default()),
            progress: Mutex::new(ProgressLedger::fresh(0)),
        }
    }

    /// 清零并记录新的开始时间
    ///
    /// 每次运行开始、任何 worker 启动之前调用一次；不能与活跃 worker 并发调用。
    pub fn reset(&self, total: usize) {
        *self.tokens.lock() = TokenLedger::default();
        *self.progress.lock() = ProgressLedger::fresh(total);
    }

    /// 累加一篇记录的 token 用量和费用
    pub fn record_tokens(&self, usage: &TokenUsage, cost: f64) {
        let mut ledger = self.tokens.lock();
        ledger.usage.add(usage);
        ledger.cost += cost;
    }

    /// 记录一篇记录的耗时并把已处理数 +1
    pub fn record_progress(&self, elapsed: Duration) {
        let mut ledger = self.progress.lock();
        ledger.processed += 1;
        if ledger.durations.len() == DURATION_HISTORY_LEN {
            ledger.durations.pop_front();
        }
        ledger.durations.push_back(elapsed);
    }

    /// 记录一次单篇失败
    pub fn record_failure(&self) {
        self.progress.lock().failed += 1;
    }

    pub fn set_active_workers(&self, count: usize) {
        self.progress.lock().active_workers = count;
    }

    pub fn worker_finished(&self) {
        let mut ledger = self.progress.lock();
        ledger.active_workers = ledger.active_workers.saturating_sub(1);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let (tokens, cost) = {
            let ledger = self.tokens.lock();
            (ledger.usage, ledger.cost)
        };
        let progress = self.progress.lock();
        UsageSnapshot {
            tokens,
            cost,
            processed: progress.processed,
            failed: progress.failed,
            total: progress.total,
            durations: progress.durations.iter().copied().collect(),
            active_workers: progress.active_workers,
            elapsed: progress.started.elapsed(),
            started_at: progress.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn usage(total: u64) -> TokenUsage {
        TokenUsage {
            total,
            prompt: total - 10,
            completion: 10,
            cache_hit: 5,
            cache_miss: total - 15,
        }
    }

    #[test]
    fn test_reset_is_idempotent() {
        let acc = UsageAccumulator::new();
        acc.record_tokens(&usage(100), 0.5);
        acc.record_progress(Duration::from_millis(30));
        acc.set_active_workers(4);

        acc.reset(7);
        let first = acc.snapshot();
        acc.reset(7);
        let second = acc.snapshot();

        for snap in [&first, &second] {
            assert_eq!(snap.tokens, TokenUsage::default());
            assert_eq!(snap.cost, 0.0);
            assert_eq!(snap.processed, 0);
            assert_eq!(snap.failed, 0);
            assert_eq!(snap.total, 7);
            assert!(snap.durations.is_empty());
            assert_eq!(snap.active_workers, 0);
        }
    }

    #[test]
    fn test_duration_history_is_bounded() {
        let acc = UsageAccumulator::new();
        for ms in 1..=15u64 {
            acc.record_progress(Duration::from_millis(ms));
        }
        let snap = acc.snapshot();
        assert_eq!(snap.processed, 15);
        assert_eq!(snap.durations.len(), DURATION_HISTORY_LEN);
        assert_eq!(snap.durations[0], Duration::from_millis(6));
        assert_eq!(snap.mean_duration(), Some(Duration::from_micros(10_500)));
    }

    #[test]
    fn test_estimate_from_chars() {
        let estimated = TokenUsage::estimate_from_chars(1000);
        assert_eq!(estimated.total, 600);
        assert_eq!(estimated.prompt, 480);
        assert_eq!(estimated.completion, 120);
        assert_eq!(estimated.cache_miss, 480);
        assert_eq!(estimated.cache_hit, 0);
    }

    #[test]
    fn test_worker_finished_saturates() {
        let acc = UsageAccumulator::new();
        acc.set_active_workers(1);
        acc.worker_finished();
        acc.worker_finished();
        assert_eq!(acc.snapshot().active_workers, 0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let acc = Arc::new(UsageAccumulator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        acc.record_tokens(&usage(20), 0.001);
                        acc.record_progress(Duration::from_millis(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = acc.snapshot();
        assert_eq!(snap.processed, 2000);
        assert_eq!(snap.tokens.total, 40_000);
        assert!((snap.cost - 2.0).abs() < 1e-9);
    }
}
