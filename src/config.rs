use crate::error::{AppError, AppResult, ConfigError};
use crate::services::pricing::{DiscountWindow, ModelPricing, PriceRate, PriceTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// 默认系统提示词 - 用于判断论文相关性
const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at judging whether an academic paper is relevant to a user's research question.

Decide in order:
1. If the abstract is highly relevant to the research question, the paper is relevant. Stop.
2. Skip this step if #Requirements# is empty. If the abstract satisfies the requirements, the paper is relevant. Stop.
3. Skip this step if #Keywords# is empty. If the abstract is only weakly related but the full text very likely contains the keywords and is likely highly relevant, the paper is relevant. Otherwise it is not relevant.

Keywords are case-insensitive; consider synonyms and abbreviations.

Answer with a JSON object only:
{
    "relevant": "Y",
    "reason": "one short sentence"
}
"relevant" must be exactly "Y" or "N"."#;

/// 取消信号的语义
///
/// 停止信号总会停止进度报告；该策略决定 worker 是否也在记录之间提前结束。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// 每篇记录开始前检查停止信号，收到后结束本批次
    #[default]
    StopBetweenRecords,
    /// 停止信号只关闭进度报告，已分配的批次全部跑完
    FinishBatches,
}

impl std::str::FromStr for CancelPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_between_records" => Ok(CancelPolicy::StopBetweenRecords),
            "finish_batches" => Ok(CancelPolicy::FinishBatches),
            _ => Err(()),
        }
    }
}

/// 价格配置（单位：货币/百万 tokens）
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// 货币符号
    pub currency: String,
    /// 优惠时段开始（HH:MM，含）
    pub discount_start: String,
    /// 优惠时段结束（HH:MM，含）
    pub discount_end: String,
    /// 价格表中找不到模型时使用的模型
    pub default_model: String,
    /// 模型 -> 各时段价格
    pub models: HashMap<String, ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "deepseek-chat".to_string(),
            ModelPricing {
                standard: PriceRate::new(0.5, 2.0, 8.0),
                discount: PriceRate::new(0.25, 1.0, 4.0),
            },
        );
        models.insert(
            "deepseek-reasoner".to_string(),
            ModelPricing {
                standard: PriceRate::new(1.0, 4.0, 16.0),
                discount: PriceRate::new(0.25, 1.0, 4.0),
            },
        );
        Self {
            currency: "¥".to_string(),
            discount_start: "00:30".to_string(),
            discount_end: "08:30".to_string(),
            default_model: "deepseek-chat".to_string(),
            models,
        }
    }
}

/// 程序配置文件
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- LLM 配置 ---
    pub api_base_url: String,
    pub model_name: String,
    /// 全部 API 密钥（最后 `reserved_analysis_keys` 个留作结果分析）
    pub api_keys: Vec<String>,
    /// 预留给结果分析、不参与筛选的密钥数量
    pub reserved_analysis_keys: usize,
    pub temperature: f32,
    pub system_prompt: String,
    pub include_requirements_in_prompt: bool,
    pub include_keywords_in_prompt: bool,
    // --- 检索问题 ---
    pub research_question: String,
    pub keywords: String,
    pub requirements: String,
    // --- 输入输出 ---
    /// 已解析好的记录文件（JSON 数组）
    pub records_file: String,
    /// 最多处理多少篇；None 表示全部
    pub max_papers: Option<usize>,
    pub result_folder: String,
    pub log_folder: String,
    /// 是否保存完整日志（Trace 文件）
    pub save_full_log: bool,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    // --- 运行控制 ---
    pub progress_interval_ms: u64,
    pub monitor_join_timeout_ms: u64,
    pub cancel_policy: CancelPolicy,
    pub pricing: PricingConfig,
    // --- 结果分析 ---
    /// 运行结束后用第一个分析密钥生成简要总结
    pub generate_summary: bool,
    /// 再用第二个分析密钥生成深度总结
    pub deep_summary: bool,
    pub analysis_model: String,
    pub deep_analysis_model: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.deepseek.com".to_string(),
            model_name: "deepseek-chat".to_string(),
            api_keys: Vec::new(),
            reserved_analysis_keys: 2,
            temperature: 1.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            include_requirements_in_prompt: true,
            include_keywords_in_prompt: true,
            research_question: String::new(),
            keywords: String::new(),
            requirements: String::new(),
            records_file: "records.json".to_string(),
            max_papers: None,
            result_folder: "Result".to_string(),
            log_folder: "Log".to_string(),
            save_full_log: true,
            verbose_logging: false,
            progress_interval_ms: 1000,
            monitor_join_timeout_ms: 2000,
            cancel_policy: CancelPolicy::default(),
            pricing: PricingConfig::default(),
            generate_summary: true,
            deep_summary: false,
            analysis_model: "deepseek-chat".to_string(),
            deep_analysis_model: "deepseek-reasoner".to_string(),
        }
    }
}

impl Config {
    /// 默认配置 + 环境变量覆盖
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件加载配置，缺省字段使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::file_read_failed(path_str.clone(), e))?;
        let config: Config = toml::from_str(&content).map_err(|source| {
            ConfigError::TomlParseFailed {
                path: path_str,
                source,
            }
        })?;
        Ok(config)
    }

    /// 按优先级加载：配置文件（可选） → 环境变量
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let base = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    /// 用环境变量覆盖已有配置
    pub fn with_env_overrides(self) -> Self {
        Self {
            api_base_url: env_string("API_BASE_URL").unwrap_or(self.api_base_url),
            model_name: env_string("MODEL_NAME").unwrap_or(self.model_name),
            api_keys: env_string("API_KEYS")
                .map(|v| {
                    v.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or(self.api_keys),
            reserved_analysis_keys: env_parse("RESERVED_ANALYSIS_KEYS")
                .unwrap_or(self.reserved_analysis_keys),
            research_question: env_string("RESEARCH_QUESTION").unwrap_or(self.research_question),
            keywords: env_string("KEYWORDS").unwrap_or(self.keywords),
            requirements: env_string("REQUIREMENTS").unwrap_or(self.requirements),
            records_file: env_string("RECORDS_FILE").unwrap_or(self.records_file),
            max_papers: env_parse("MAX_PAPERS").map(Some).unwrap_or(self.max_papers),
            result_folder: env_string("RESULT_FOLDER").unwrap_or(self.result_folder),
            log_folder: env_string("LOG_FOLDER").unwrap_or(self.log_folder),
            save_full_log: env_parse("SAVE_FULL_LOG").unwrap_or(self.save_full_log),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(self.verbose_logging),
            cancel_policy: env_parse("CANCEL_POLICY").unwrap_or(self.cancel_policy),
            generate_summary: env_parse("GENERATE_SUMMARY").unwrap_or(self.generate_summary),
            deep_summary: env_parse("DEEP_SUMMARY").unwrap_or(self.deep_summary),
            ..self
        }
    }

    /// 根据价格配置构建价格表
    pub fn price_table(&self) -> AppResult<PriceTable> {
        let window = DiscountWindow::parse(
            &self.pricing.discount_start,
            &self.pricing.discount_end,
        )?;
        if !self.pricing.models.contains_key(&self.pricing.default_model) {
            return Err(ConfigError::MissingDefaultModel {
                model: self.pricing.default_model.clone(),
            }
            .into());
        }
        Ok(PriceTable::new(
            self.pricing.models.clone(),
            self.pricing.default_model.clone(),
            window,
        )
        .with_currency(self.pricing.currency.clone()))
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// 解析失败时记录警告并保留原值
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(
                "⚠️ {}，使用原配置",
                ConfigError::EnvVarParseFailed {
                    var_name: name.to_string(),
                    value,
                    expected_type: std::any::type_name::<T>().to_string(),
                }
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_price_table_builds() {
        let table = Config::default().price_table().unwrap();
        assert_eq!(table.default_model(), "deepseek-chat");
    }

    #[test]
    fn test_toml_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("screen.toml");
        std::fs::write(
            &path,
            r#"
model_name = "deepseek-reasoner"
api_keys = ["sk-a", "sk-b", "sk-c"]
cancel_policy = "finish_batches"

[pricing]
discount_start = "01:00"
"#,
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.model_name, "deepseek-reasoner");
        assert_eq!(config.api_keys.len(), 3);
        assert_eq!(config.cancel_policy, CancelPolicy::FinishBatches);
        assert_eq!(config.reserved_analysis_keys, 2);
        assert_eq!(config.pricing.discount_start, "01:00");
        assert_eq!(config.pricing.discount_end, "08:30");
        assert!(config.pricing.models.contains_key("deepseek-chat"));
        assert!(config.generate_summary);
        assert!(!config.deep_summary);
        assert_eq!(config.deep_analysis_model, "deepseek-reasoner");
    }

    #[test]
    fn test_invalid_discount_window_rejected() {
        let mut config = Config::default();
        config.pricing.discount_end = "8h30".to_string();
        assert!(matches!(
            config.price_table(),
            Err(AppError::Config(ConfigError::InvalidTimeOfDay { .. }))
        ));
    }

    #[test]
    fn test_missing_default_model_rejected() {
        let mut config = Config::default();
        config.pricing.default_model = "gpt-x".to_string();
        assert!(matches!(
            config.price_table(),
            Err(AppError::Config(ConfigError::MissingDefaultModel { .. }))
        ));
    }

    #[test]
    fn test_cancel_policy_from_str() {
        assert_eq!(
            "finish_batches".parse::<CancelPolicy>(),
            Ok(CancelPolicy::FinishBatches)
        );
        assert!("later".parse::<CancelPolicy>().is_err());
    }
}
