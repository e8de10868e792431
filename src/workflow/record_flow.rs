//! 记录处理流程 - 流程层
//!
//! 核心职责：定义"一篇记录"的完整处理流程
//!
//! 流程顺序：
//! 1. 调用判定服务（唯一的等待点）
//! 2. 取用量（服务未报告时按字符数估算）并计价，立即累加 token
//! 3. 写入判定日志；相关时写入结果文件和 Accepted 日志
//! 4. 全部写入成功后才计入进度
//!
//! 第 3 步失败时返回 [`ClassificationError::Unrecorded`]，带上已计费的用量，
//! 这篇记录只算失败，不会同时算作已完成。

use chrono::Local;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ClassificationError;
use crate::models::{Credential, Query, Record};
use crate::services::{
    JudgmentRequest, PriceTable, RelevanceJudge, ResultSink, TokenUsage, UsageAccumulator, Verdict,
};
use crate::utils::logging::truncate_text;
use crate::workflow::record_ctx::RecordCtx;

/// 一篇记录的处理结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordOutcome {
    pub verdict: Verdict,
    pub tokens: TokenUsage,
    /// 按完成时刻的价格计算的费用
    pub cost: f64,
}

/// 记录处理流程
///
/// - 只处理单篇记录
/// - 不关心批次划分和取消
/// - 出错时返回 `ClassificationError`，由 worker 决定怎么处理
pub struct RecordFlow {
    judge: Arc<dyn RelevanceJudge>,
    accumulator: Arc<UsageAccumulator>,
    sink: Arc<ResultSink>,
    pricing: Arc<PriceTable>,
    model: String,
    verbose_logging: bool,
}

impl RecordFlow {
    pub fn new(
        judge: Arc<dyn RelevanceJudge>,
        accumulator: Arc<UsageAccumulator>,
        sink: Arc<ResultSink>,
        pricing: Arc<PriceTable>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            judge,
            accumulator,
            sink,
            pricing,
            model: model.into(),
            verbose_logging: false,
        }
    }

    pub fn with_verbose_logging(mut self, verbose: bool) -> Self {
        self.verbose_logging = verbose;
        self
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    pub fn accumulator(&self) -> &UsageAccumulator {
        &self.accumulator
    }

    pub async fn process(
        &self,
        record: &Record,
        query: &Query,
        credential: &Credential,
        ctx: &RecordCtx,
    ) -> Result<RecordOutcome, ClassificationError> {
        if self.verbose_logging {
            debug!("{} 📄 {}", ctx, truncate_text(&record.title, 80));
        }

        let started = Instant::now();
        let request = JudgmentRequest {
            query,
            title: &record.title,
            abstract_text: &record.abstract_text,
        };
        let response = self.judge.judge(&request, credential).await?;
        let elapsed = started.elapsed();

        let tokens = match response.usage {
            Some(usage) => usage,
            None => {
                warn!("{} ⚠️ 服务未返回用量，按字符数估算", ctx);
                TokenUsage::estimate_from_chars(response.exchanged_chars)
            }
        };
        let cost = self
            .pricing
            .instant_cost(tokens.volume(), &self.model, Local::now().naive_local());

        // 服务已经计费，无论后面能否写入都要记账
        self.accumulator.record_tokens(&tokens, cost);

        self.write_artifacts(record, response.verdict, &response.justification)
            .await
            .map_err(|e| e.unrecorded(tokens, cost))?;
        self.accumulator.record_progress(elapsed);

        if response.verdict.is_relevant() {
            info!("{} ✓ 相关: {}", ctx, truncate_text(&record.title, 60));
        } else if self.verbose_logging {
            debug!("{} ✗ 不相关: {}", ctx, response.justification);
        }

        Ok(RecordOutcome {
            verdict: response.verdict,
            tokens,
            cost,
        })
    }

    async fn write_artifacts(
        &self,
        record: &Record,
        verdict: Verdict,
        justification: &str,
    ) -> Result<(), ClassificationError> {
        self.sink
            .append_judgment(&record.title, verdict, justification)
            .await?;
        if verdict.is_relevant() {
            self.sink.append_accepted(record, justification).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::Provenance;
    use crate::services::{JudgmentResponse, RunArtifacts};
    use async_trait::async_trait;
    use std::fs;

    struct FixedJudge {
        verdict: Verdict,
        usage: Option<TokenUsage>,
    }

    #[async_trait]
    impl RelevanceJudge for FixedJudge {
        async fn judge(
            &self,
            _request: &JudgmentRequest<'_>,
            _credential: &Credential,
        ) -> Result<JudgmentResponse, ClassificationError> {
            Ok(JudgmentResponse {
                verdict: self.verdict,
                justification: "fixed".to_string(),
                usage: self.usage,
                exchanged_chars: 1000,
            })
        }
    }

    fn record() -> Record {
        Record {
            index: 1,
            title: "Caption placement in VR".to_string(),
            abstract_text: "abstract".to_string(),
            raw_entry: "@inproceedings{vr1, title={Caption placement in VR}}".to_string(),
            provenance: Provenance::default(),
        }
    }

    fn flow(dir: &std::path::Path, judge: FixedJudge) -> (RecordFlow, Arc<UsageAccumulator>) {
        let query = Query::new("captions", "", "");
        let artifacts = RunArtifacts::named(dir, dir, Local::now(), false);
        let sink = Arc::new(ResultSink::create(artifacts, &query, Local::now()).unwrap());
        let accumulator = Arc::new(UsageAccumulator::new());
        let pricing = Arc::new(Config::default().price_table().unwrap());
        let flow = RecordFlow::new(
            Arc::new(judge),
            Arc::clone(&accumulator),
            sink,
            pricing,
            "deepseek-chat",
        );
        (flow, accumulator)
    }

    #[tokio::test]
    async fn test_relevant_record_is_written_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let usage = TokenUsage {
            total: 150,
            prompt: 100,
            completion: 50,
            cache_hit: 40,
            cache_miss: 60,
        };
        let (flow, accumulator) = flow(
            dir.path(),
            FixedJudge {
                verdict: Verdict::Relevant,
                usage: Some(usage),
            },
        );
        let query = Query::new("captions", "", "");
        let credential = Credential::new("sk-test-0000000001").unwrap();

        let outcome = flow
            .process(&record(), &query, &credential, &RecordCtx::new(1, 1))
            .await
            .unwrap();

        assert_eq!(outcome.tokens, usage);
        assert!(outcome.cost > 0.0);
        let snapshot = accumulator.snapshot();
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.tokens, usage);

        let result = fs::read_to_string(&flow.sink().artifacts().result).unwrap();
        assert!(result.contains("@inproceedings{vr1"));
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, accumulator) = flow(
            dir.path(),
            FixedJudge {
                verdict: Verdict::NotRelevant,
                usage: None,
            },
        );
        let query = Query::new("captions", "", "");
        let credential = Credential::new("sk-test-0000000001").unwrap();

        let outcome = flow
            .process(&record(), &query, &credential, &RecordCtx::new(1, 1))
            .await
            .unwrap();

        assert_eq!(outcome.tokens, TokenUsage::estimate_from_chars(1000));
        assert_eq!(accumulator.snapshot().tokens.total, 600);

        let result = fs::read_to_string(&flow.sink().artifacts().result).unwrap();
        assert!(!result.contains("@inproceedings"));
        let judgments = fs::read_to_string(&flow.sink().artifacts().judgments_log).unwrap();
        assert!(judgments.contains(r#""verdict": "N""#));
    }

    #[tokio::test]
    async fn test_unwritable_log_fails_record_but_keeps_usage() {
        let dir = tempfile::tempdir().unwrap();
        let (flow, accumulator) = flow(
            dir.path(),
            FixedJudge {
                verdict: Verdict::Relevant,
                usage: None,
            },
        );
        // 判定日志变成目录后无法以追加方式打开
        let judgments = flow.sink().artifacts().judgments_log.clone();
        fs::remove_file(&judgments).unwrap();
        fs::create_dir(&judgments).unwrap();

        let query = Query::new("captions", "", "");
        let credential = Credential::new("sk-test-0000000001").unwrap();
        let err = flow
            .process(&record(), &query, &credential, &RecordCtx::new(1, 1))
            .await
            .unwrap_err();

        let (tokens, cost) = err.billed().unwrap();
        assert_eq!(tokens, TokenUsage::estimate_from_chars(1000));
        assert!(cost > 0.0);

        let snapshot = accumulator.snapshot();
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.tokens.total, 600);

        let result = fs::read_to_string(&flow.sink().artifacts().result).unwrap();
        assert!(!result.contains("@inproceedings"));
    }
}
