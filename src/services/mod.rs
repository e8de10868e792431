pub mod analysis;
pub mod judgment;
pub mod pricing;
pub mod result_sink;
pub mod usage;

pub use analysis::{AnalysisPaper, BriefSummary, DeepSummary, ResultAnalyst};
pub use judgment::{JudgmentRequest, JudgmentResponse, LlmJudge, RelevanceJudge, Verdict};
pub use pricing::{DiscountWindow, ModelPricing, PriceRate, PriceTable, TariffPeriod, TokenVolume};
pub use result_sink::{ResultSink, RunArtifacts};
pub use usage::{TokenUsage, UsageAccumulator, UsageSnapshot};
