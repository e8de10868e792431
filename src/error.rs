use async_openai::error::OpenAIError;
use thiserror::Error;

use crate::services::TokenUsage;

/// 应用程序错误类型
///
/// 只用于"运行无法开始"这一类致命错误；单篇记录的失败见 [`ClassificationError`]。
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// API 密钥相关错误
    #[error("密钥错误: {0}")]
    Credential(#[from] CredentialError),
    /// 调度错误
    #[error("调度错误: {0}")]
    Dispatch(#[from] DispatchError),
    /// 文件操作错误
    #[error("文件错误: {0}")]
    File(#[from] FileError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// TOML 配置解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 时间格式无效（期望 HH:MM）
    #[error("无效的时间 '{value}'，期望 HH:MM 格式")]
    InvalidTimeOfDay { value: String },
    /// 价格表中缺少默认模型
    #[error("价格表中没有默认模型 {model} 的价格")]
    MissingDefaultModel { model: String },
}

/// API 密钥错误
#[derive(Debug, Error)]
pub enum CredentialError {
    /// 空密钥
    #[error("API密钥不能为空")]
    Empty,
    /// 没有任何可用于处理的密钥
    #[error("没有可用于处理的API密钥")]
    NoneForProcessing,
}

/// 调度错误
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 没有可用的工作线程（处理密钥数为 0）
    #[error("没有可用的工作线程：处理密钥数为 0")]
    NoWorkers,
}

/// 文件操作错误
#[derive(Debug, Error)]
pub enum FileError {
    /// 文件不存在
    #[error("文件不存在: {path}")]
    NotFound { path: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 创建目录失败
    #[error("创建目录失败 ({path}): {source}")]
    CreateDirFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 解析失败
    #[error("JSON解析失败 ({path}): {source}")]
    JsonParseFailed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 单篇记录的判定错误
///
/// 只在 worker 内部流转：worker 显式匹配后记录日志并继续下一篇，
/// 不会传播到调度器。
#[derive(Debug, Error)]
pub enum ClassificationError {
    /// 调用判定服务失败（包括构建请求失败）
    #[error("LLM API调用失败 (模型: {model}): {source}")]
    Api {
        model: String,
        #[source]
        source: OpenAIError,
    },
    /// 判定服务没有返回内容
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 结果文件写入失败
    #[error("写入结果文件失败 ({path}): {source}")]
    Sink {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 判定已完成并计费，但结果没能落盘
    ///
    /// 这篇记录算失败，已消耗的用量仍要计入统计。
    #[error("{source}（已计费 {} token）", .tokens.total)]
    Unrecorded {
        tokens: TokenUsage,
        cost: f64,
        #[source]
        source: Box<ClassificationError>,
    },
    /// 其他错误（测试桩或自定义判定服务使用）
    #[error("{0}")]
    Other(String),
}

/// 结果分析错误
///
/// 分析在全部批次结束后进行，失败只影响摘要，不影响筛选结果。
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("没有可供分析的相关记录")]
    NoPapers,
    #[error("LLM API调用失败 (模型: {model}): {source}")]
    Api {
        model: String,
        #[source]
        source: OpenAIError,
    },
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    #[error("分析结果不是合法的 JSON: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("{0}")]
    File(#[from] FileError),
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建文件读取错误
    pub fn file_read_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::ReadFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建文件写入错误
    pub fn file_write_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::WriteFailed {
            path: path.into(),
            source,
        })
    }

    /// 创建目录错误
    pub fn create_dir_failed(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File(FileError::CreateDirFailed {
            path: path.into(),
            source,
        })
    }
}

impl ClassificationError {
    /// 创建 LLM API 调用错误
    pub fn api(model: impl Into<String>, source: OpenAIError) -> Self {
        ClassificationError::Api {
            model: model.into(),
            source,
        }
    }

    /// 创建结果文件写入错误
    pub fn sink(path: impl Into<String>, source: std::io::Error) -> Self {
        ClassificationError::Sink {
            path: path.into(),
            source,
        }
    }

    /// 给已计费但未落盘的错误附上用量
    pub fn unrecorded(self, tokens: TokenUsage, cost: f64) -> Self {
        ClassificationError::Unrecorded {
            tokens,
            cost,
            source: Box::new(self),
        }
    }

    /// 失败前已经计费的用量和费用
    pub fn billed(&self) -> Option<(TokenUsage, f64)> {
        match self {
            ClassificationError::Unrecorded { tokens, cost, .. } => Some((*tokens, *cost)),
            _ => None,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_error_display() {
        let err: AppError = DispatchError::NoWorkers.into();
        assert_eq!(err.to_string(), "调度错误: 没有可用的工作线程：处理密钥数为 0");
    }

    #[test]
    fn test_sink_error_keeps_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ClassificationError::sink("Result/Result_x.bib", io);
        assert!(err.to_string().contains("Result/Result_x.bib"));
        assert!(err.billed().is_none());
    }

    #[test]
    fn test_unrecorded_error_carries_billed_usage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let tokens = TokenUsage::estimate_from_chars(1000);
        let err = ClassificationError::sink("Log/Judgments_x.txt", io).unrecorded(tokens, 0.25);

        assert_eq!(err.billed(), Some((tokens, 0.25)));
        let text = err.to_string();
        assert!(text.contains("Log/Judgments_x.txt"));
        assert!(text.contains("600 token"));
    }
}
