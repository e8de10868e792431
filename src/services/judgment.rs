//! 相关性判定服务 - 业务能力层
//!
//! 只负责"判断一篇记录是否相关"这一个能力，不关心批次和流程。
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 兼容 OpenAI API 的服务（如 DeepSeek）
//! - 每个密钥缓存一个客户端；调用只发一次，不做重试

use crate::config::Config;
use crate::error::ClassificationError;
use crate::models::{Credential, Query};
use crate::services::usage::TokenUsage;
use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// 模型响应无法解析时写入的理由
pub const FORMAT_ERROR_JUSTIFICATION: &str = "response format error";

/// 二元判定结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Relevant,
    NotRelevant,
}

impl Verdict {
    /// 写入日志时使用的符号
    pub fn symbol(self) -> &'static str {
        match self {
            Verdict::Relevant => "Y",
            Verdict::NotRelevant => "N",
        }
    }

    pub fn is_relevant(self) -> bool {
        self == Verdict::Relevant
    }
}

/// 一次判定请求
#[derive(Debug, Clone, Copy)]
pub struct JudgmentRequest<'a> {
    pub query: &'a Query,
    pub title: &'a str,
    pub abstract_text: &'a str,
}

/// 判定服务的返回
#[derive(Debug, Clone)]
pub struct JudgmentResponse {
    pub verdict: Verdict,
    pub justification: String,
    /// 服务报告的用量；None 表示服务没有报告
    pub usage: Option<TokenUsage>,
    /// 提示词与响应的总字符数，用于估算用量
    pub exchanged_chars: usize,
}

/// 外部相关性判定服务
///
/// 每篇记录调用一次；返回错误表示这篇记录判定失败，调用方不会重试。
#[async_trait]
pub trait RelevanceJudge: Send + Sync {
    async fn judge(
        &self,
        request: &JudgmentRequest<'_>,
        credential: &Credential,
    ) -> Result<JudgmentResponse, ClassificationError>;
}

/// 基于 LLM 的判定服务
pub struct LlmJudge {
    api_base_url: String,
    model_name: String,
    temperature: f32,
    system_prompt: String,
    include_requirements: bool,
    include_keywords: bool,
    clients: Mutex<HashMap<Credential, Client<OpenAIConfig>>>,
}

impl LlmJudge {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            model_name: config.model_name.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            include_requirements: config.include_requirements_in_prompt,
            include_keywords: config.include_keywords_in_prompt,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, credential: &Credential) -> Client<OpenAIConfig> {
        self.clients
            .lock()
            .entry(credential.clone())
            .or_insert_with(|| chat_client(&self.api_base_url, credential))
            .clone()
    }

    /// 构建请求：要求模型以 JSON 对象作答
    pub fn build_request(&self, user_prompt: &str) -> Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(chat_messages(&self.system_prompt, user_prompt)?)
            .temperature(self.temperature)
            .response_format(ResponseFormat::JsonObject)
            .build()
    }

    /// 构建用户消息
    pub fn build_user_prompt(&self, request: &JudgmentRequest<'_>) -> String {
        let mut prompt = format!("#Research question#: {}\n\n", request.query.question);
        if self.include_requirements {
            prompt.push_str(&format!("#Requirements#: {}\n\n", request.query.requirements));
        }
        if self.include_keywords {
            prompt.push_str(&format!("#Keywords#: {}\n\n", request.query.keywords));
        }
        prompt.push_str(&format!(
            "#Title#: {}\n\n#Abstract#: {}\n",
            request.title, request.abstract_text
        ));
        prompt
    }
}

#[async_trait]
impl RelevanceJudge for LlmJudge {
    async fn judge(
        &self,
        request: &JudgmentRequest<'_>,
        credential: &Credential,
    ) -> Result<JudgmentResponse, ClassificationError> {
        let user_prompt = self.build_user_prompt(request);
        let to_api_err = |e| ClassificationError::api(&self.model_name, e);

        debug!("调用 LLM API，模型: {}，密钥: {}", self.model_name, credential);

        let chat_request = self.build_request(&user_prompt).map_err(to_api_err)?;

        let response = self
            .client_for(credential)
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| {
                warn!("LLM API 调用失败: {}", e);
                to_api_err(e)
            })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ClassificationError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        let usage = response.usage.as_ref().map(|u| {
            let prompt = u64::from(u.prompt_tokens);
            let cache_hit = u
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens)
                .map(u64::from)
                .unwrap_or(0)
                .min(prompt);
            TokenUsage {
                total: u64::from(u.total_tokens),
                prompt,
                completion: u64::from(u.completion_tokens),
                cache_hit,
                cache_miss: prompt - cache_hit,
            }
        });

        let parsed = parse_verdict(&content);
        Ok(JudgmentResponse {
            verdict: parsed.verdict,
            justification: parsed.justification,
            usage,
            exchanged_chars: self.system_prompt.chars().count()
                + user_prompt.chars().count()
                + content.chars().count(),
        })
    }
}

/// 解析后的判定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVerdict {
    pub verdict: Verdict,
    pub justification: String,
}

#[derive(Deserialize)]
struct RawVerdict {
    relevant: Option<String>,
    reason: Option<String>,
}

/// 为一个密钥创建兼容 OpenAI 的客户端
pub(crate) fn chat_client(api_base_url: &str, credential: &Credential) -> Client<OpenAIConfig> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(credential.expose())
        .with_api_base(api_base_url);
    Client::with_config(openai_config)
}

/// 系统消息 + 用户消息
pub(crate) fn chat_messages(
    system_prompt: &str,
    user_prompt: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    Ok(vec![
        ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt)
                .build()?,
        ),
        ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()?,
        ),
    ])
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").expect("code fence pattern is valid")
    })
}

/// 去掉 `</think>` 之前的推理内容和外层 Markdown 代码块
pub(crate) fn json_payload(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(pos) = text.find("</think>") {
        text = text[pos + "</think>".len()..].trim();
    }
    match code_fence().captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text,
    }
}

/// 解析模型的结构化输出
///
/// 无法解析或判定值不是 Y/N 时一律视为不相关，不返回错误。
pub fn parse_verdict(raw: &str) -> ParsedVerdict {
    let text = json_payload(raw);

    let parsed: RawVerdict = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("⚠️ 无法解析模型返回的JSON: {}，原始响应: {}", e, raw);
            return ParsedVerdict {
                verdict: Verdict::NotRelevant,
                justification: FORMAT_ERROR_JUSTIFICATION.to_string(),
            };
        }
    };

    let verdict = match parsed.relevant.as_deref().map(|v| v.trim().to_ascii_uppercase()) {
        Some(v) if v == "Y" => Verdict::Relevant,
        Some(v) if v == "N" => Verdict::NotRelevant,
        Some(other) => {
            warn!("⚠️ 模型返回了意外的relevant值: {}", other);
            Verdict::NotRelevant
        }
        None => {
            warn!("⚠️ JSON响应中缺少relevant字段: {}", text);
            Verdict::NotRelevant
        }
    };

    let justification = parsed.reason.unwrap_or_else(|| {
        warn!("⚠️ JSON响应中缺少reason字段");
        String::new()
    });

    ParsedVerdict {
        verdict,
        justification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let parsed = parse_verdict(r#"{"relevant": "Y", "reason": "studies captions"}"#);
        assert_eq!(parsed.verdict, Verdict::Relevant);
        assert_eq!(parsed.justification, "studies captions");
    }

    #[test]
    fn test_parse_lowercase_and_fenced() {
        let raw = "```json\n{\"relevant\": \"n\", \"reason\": \"off topic\"}\n```";
        let parsed = parse_verdict(raw);
        assert_eq!(parsed.verdict, Verdict::NotRelevant);
        assert_eq!(parsed.justification, "off topic");
    }

    #[test]
    fn test_parse_strips_think_block() {
        let raw = "<think>weighing it up {not json}</think>\n{\"relevant\": \"Y\", \"reason\": \"ok\"}";
        assert_eq!(parse_verdict(raw).verdict, Verdict::Relevant);
    }

    #[test]
    fn test_unexpected_value_is_negative() {
        let parsed = parse_verdict(r#"{"relevant": "maybe", "reason": "unsure"}"#);
        assert_eq!(parsed.verdict, Verdict::NotRelevant);
        assert_eq!(parsed.justification, "unsure");
    }

    #[test]
    fn test_malformed_is_format_error() {
        let parsed = parse_verdict("Yes, this paper is relevant.");
        assert_eq!(parsed.verdict, Verdict::NotRelevant);
        assert_eq!(parsed.justification, FORMAT_ERROR_JUSTIFICATION);
    }

    #[test]
    fn test_user_prompt_respects_toggles() {
        let mut config = Config::default();
        config.include_keywords_in_prompt = false;
        let judge = LlmJudge::new(&config);
        let query = Query::new("caption design", "subtitle", "user study");
        let request = JudgmentRequest {
            query: &query,
            title: "T",
            abstract_text: "A",
        };
        let prompt = judge.build_user_prompt(&request);
        assert!(prompt.starts_with("#Research question#: caption design"));
        assert!(prompt.contains("#Requirements#: user study"));
        assert!(!prompt.contains("#Keywords#"));
        assert!(prompt.ends_with("#Abstract#: A\n"));
    }

    #[test]
    fn test_request_asks_for_json_object() {
        let config = Config::default();
        let judge = LlmJudge::new(&config);
        let request = judge.build_request("#Title#: T").unwrap();
        assert_eq!(request.response_format, Some(ResponseFormat::JsonObject));
        assert_eq!(request.model, config.model_name);
        assert_eq!(request.messages.len(), 2);
    }

    /// 测试真实 API 调用
    ///
    /// 运行方式：
    /// ```bash
    /// API_KEYS=sk-... cargo test test_live_judgment -- --ignored --nocapture
    /// ```
    #[tokio::test]
    #[ignore]
    async fn test_live_judgment() {
        let _ = tracing_subscriber::fmt::try_init();

        let config = Config::from_env();
        let credential = Credential::new(config.api_keys.first().cloned().unwrap_or_default())
            .expect("API_KEYS must be set");
        let judge = LlmJudge::new(&config);
        let query = Query::new("Explore caption and subtitle design", "", "Should conduct a user study");
        let request = JudgmentRequest {
            query: &query,
            title: "Evaluating speaker-attributed captions in 360° video",
            abstract_text: "We ran a user study with 24 deaf participants comparing caption placements.",
        };

        let response = judge.judge(&request, &credential).await.unwrap();
        println!("{:?}", response);
        assert!(response.usage.is_some());
    }
}
