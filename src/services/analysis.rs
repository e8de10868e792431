//! 结果分析服务 - 业务能力层
//!
//! 筛选结束后读取本次结果文件中的相关条目，用预留的分析密钥请求模型做聚类总结：
//! - 简要总结：第一个分析密钥，给出聚类关键词和分类统计
//! - 深度总结：第二个分析密钥，基于简要总结的关键词做详细分析
//!
//! 分析密钥从不参与筛选，两类调用互不抢占速率限制。

use crate::config::Config;
use crate::error::{AnalysisError, FileError};
use crate::models::Credential;
use crate::services::judgment::{chat_client, chat_messages, json_payload};
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

/// 摘要预览的最大字符数
const ABSTRACT_PREVIEW_CHARS: usize = 200;
const NO_ABSTRACT: &str = "No abstract available";
const DEEP_TEMPERATURE: f32 = 0.5;

/// 一个花括号字段，允许一层嵌套
const BIB_FIELD: &str = r"(?is)\bFIELD\s*=\s*\{([^{}]*(?:\{[^{}]*\}[^{}]*)*)\}";

const BRIEF_SYSTEM_PROMPT: &str = r#"The user will provide paper information. Please perform clustering analysis, categorize the papers into fewer than 10 clusters with keywords, and provide statistical data analysis including counts and percentages for each category.

CRITICAL REQUIREMENTS:
1. Must categorize ALL papers into clear groups
2. Must provide exact counts and percentages for each category
3. Must include a statistical overview with the total paper count
4. Must analyze research trends and patterns
5. Output the result as a JSON object

EXAMPLE JSON OUTPUT:
{
    "keywords": "Machine Translation, Human-Computer Interaction, Accessibility",
    "summary": "=== STATISTICAL OVERVIEW ===\nTotal Papers Analyzed: 8\n\n=== CATEGORY BREAKDOWN ===\n1. Mobile Translation Apps: 3 papers (37.5%)\n..."
}"#;

const DEEP_SYSTEM_PROMPT: &str = r#"The user will provide clustering keywords and paper information. Based on the clustering keywords, classify the papers, give the statistics of each category, and output a detailed analysis as a JSON object.

EXAMPLE JSON OUTPUT:
{
    "keywords": "Machine Translation, Human-Computer Interaction, Accessibility",
    "detailed_analysis": {
        "categories": [
            {
                "name": "Mobile translation",
                "count": 3,
                "percentage": 37.5,
                "papers": ["Paper 1", "Paper 3", "Paper 8"],
                "key_technologies": ["real-time translation", "speech processing"],
                "research_trends": "from basic translation towards context-aware experiences"
            }
        ],
        "research_gaps": ["..."],
        "future_directions": ["..."],
        "methodology_analysis": {
            "experimental_design": "...",
            "evaluation_metrics": "...",
            "common_limitations": "..."
        }
    },
    "summary": "..."
}"#;

/// 结果文件中的一篇相关记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisPaper {
    pub title: String,
    /// 摘要前 200 个字符，超出部分以 `...` 结尾
    pub abstract_preview: String,
    pub keywords: Option<String>,
}

/// 简要总结
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BriefSummary {
    pub keywords: String,
    pub summary: String,
}

impl BriefSummary {
    pub fn render(&self) -> String {
        format!(
            "===== Brief Summary =====\nKeywords: {}\n\n{}\n",
            self.keywords, self.summary
        )
    }
}

/// 深度总结
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeepSummary {
    pub keywords: String,
    pub detailed_analysis: serde_json::Value,
    pub summary: String,
}

impl DeepSummary {
    pub fn render(&self) -> String {
        let detail = serde_json::to_string_pretty(&self.detailed_analysis).unwrap_or_default();
        format!(
            "===== Deep Summary =====\nKeywords: {}\n\n{}\n\nDetailed analysis:\n{}\n",
            self.keywords, self.summary, detail
        )
    }
}

fn field_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        ["title", "abstract", "keywords"].map(|field| {
            Regex::new(&BIB_FIELD.replace("FIELD", field)).expect("bib field pattern is valid")
        })
    })
}

fn field(pattern: &Regex, entry: &str) -> Option<String> {
    pattern
        .captures(entry)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn preview(text: &str) -> String {
    if text.chars().count() > ABSTRACT_PREVIEW_CHARS {
        let head: String = text.chars().take(ABSTRACT_PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// 从结果文件内容中取出每个条目的标题、摘要预览和关键词
///
/// 条目以行首 `@` 分隔，文件头（`%` 注释）被跳过；没有标题的条目忽略。
pub fn parse_bib_entries(content: &str) -> Vec<AnalysisPaper> {
    let [title_re, abstract_re, keywords_re] = field_patterns();
    let mut chunks = content.split("\n@");
    if !content.trim_start().starts_with('@') {
        chunks.next();
    }

    chunks
        .filter_map(|entry| {
            let Some(title) = field(title_re, entry) else {
                debug!("跳过没有标题的条目");
                return None;
            };
            Some(AnalysisPaper {
                title,
                abstract_preview: field(abstract_re, entry)
                    .map(|a| preview(&a))
                    .unwrap_or_else(|| NO_ABSTRACT.to_string()),
                keywords: field(keywords_re, entry),
            })
        })
        .collect()
}

/// 读取本次运行的结果文件
///
/// 文件里没有任何条目时返回 `AnalysisError::NoPapers`。
pub async fn load_result_papers(path: impl AsRef<Path>) -> Result<Vec<AnalysisPaper>, AnalysisError> {
    let path = path.as_ref();
    let path_str = path.display().to_string();
    if !path.exists() {
        return Err(FileError::NotFound { path: path_str }.into());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| FileError::ReadFailed {
            path: path_str.clone(),
            source,
        })?;

    let papers = parse_bib_entries(&content);
    if papers.is_empty() {
        return Err(AnalysisError::NoPapers);
    }
    info!("✓ 从 {} 解析到 {} 篇相关记录", path_str, papers.len());
    Ok(papers)
}

/// 把记录列表排成分析用的用户消息
pub fn format_papers_for_prompt(papers: &[AnalysisPaper]) -> String {
    papers
        .iter()
        .enumerate()
        .map(|(i, paper)| {
            let mut text = format!(
                "Paper {}. Title: {}\n   Abstract: {}",
                i + 1,
                paper.title,
                paper.abstract_preview
            );
            if let Some(keywords) = &paper.keywords {
                text.push_str(&format!("\n   Keywords: {}", keywords));
            }
            text
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 解析模型返回的 JSON 总结
pub fn parse_summary<T: DeserializeOwned>(raw: &str) -> Result<T, AnalysisError> {
    Ok(serde_json::from_str(json_payload(raw))?)
}

/// 结果分析服务
pub struct ResultAnalyst {
    api_base_url: String,
    brief_model: String,
    deep_model: String,
}

impl ResultAnalyst {
    pub fn new(config: &Config) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            brief_model: config.analysis_model.clone(),
            deep_model: config.deep_analysis_model.clone(),
        }
    }

    pub fn brief_request(
        &self,
        papers: &[AnalysisPaper],
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.brief_model)
            .messages(chat_messages(BRIEF_SYSTEM_PROMPT, &format_papers_for_prompt(papers))?)
            .response_format(ResponseFormat::JsonObject)
            .build()
    }

    pub fn deep_request(
        &self,
        papers: &[AnalysisPaper],
        clustering_keywords: &str,
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let user_prompt = format!(
            "Clustering keywords: {}\n\n{}\n\nPlease run the deep analysis based on the clustering keywords above.",
            clustering_keywords,
            format_papers_for_prompt(papers)
        );
        CreateChatCompletionRequestArgs::default()
            .model(&self.deep_model)
            .messages(chat_messages(DEEP_SYSTEM_PROMPT, &user_prompt)?)
            .response_format(ResponseFormat::JsonObject)
            .temperature(DEEP_TEMPERATURE)
            .build()
    }

    /// 生成简要总结（聚类关键词 + 分类统计）
    pub async fn brief_summary(
        &self,
        papers: &[AnalysisPaper],
        credential: &Credential,
    ) -> Result<BriefSummary, AnalysisError> {
        if papers.is_empty() {
            return Err(AnalysisError::NoPapers);
        }
        let request = self.brief_request(papers).map_err(|source| AnalysisError::Api {
            model: self.brief_model.clone(),
            source,
        })?;
        let content = self.complete(request, &self.brief_model, credential).await?;
        let summary = parse_summary(&content)?;
        info!("✓ 简要总结生成完成，模型: {}，密钥: {}", self.brief_model, credential);
        Ok(summary)
    }

    /// 在简要总结的关键词基础上生成深度总结
    pub async fn deep_summary(
        &self,
        papers: &[AnalysisPaper],
        clustering_keywords: &str,
        credential: &Credential,
    ) -> Result<DeepSummary, AnalysisError> {
        if papers.is_empty() {
            return Err(AnalysisError::NoPapers);
        }
        let request = self
            .deep_request(papers, clustering_keywords)
            .map_err(|source| AnalysisError::Api {
                model: self.deep_model.clone(),
                source,
            })?;
        let content = self.complete(request, &self.deep_model, credential).await?;
        let summary = parse_summary(&content)?;
        info!("✓ 深度总结生成完成，模型: {}，密钥: {}", self.deep_model, credential);
        Ok(summary)
    }

    async fn complete(
        &self,
        request: CreateChatCompletionRequest,
        model: &str,
        credential: &Credential,
    ) -> Result<String, AnalysisError> {
        debug!("调用分析模型: {}，密钥: {}", model, credential);
        let response = chat_client(&self.api_base_url, credential)
            .chat()
            .create(request)
            .await
            .map_err(|source| AnalysisError::Api {
                model: model.to_string(),
                source,
            })?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AnalysisError::EmptyContent {
                model: model.to_string(),
            })
    }
}

/// 把分析结果写入文件，必要时创建目录
pub async fn save_report(path: impl AsRef<Path>, report: &str) -> Result<(), AnalysisError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| FileError::CreateDirFailed {
                path: parent.display().to_string(),
                source,
            })?;
    }
    tokio::fs::write(path, report)
        .await
        .map_err(|source| FileError::WriteFailed {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULT_FILE: &str = "% Query Time: 2025-01-01 10:00:00
% Research Question: caption design
% Keywords: caption

% Search Topic {caption design}

@inproceedings{gaze2023,
  booktitle = {Proceedings of CHI},
  title = {A View on the Viewer: Gaze-Adaptive {C}aptions for Videos},
  abstract = {Subtitles play a crucial role in cross-lingual distribution of multimedia content.},
  keywords = {eye tracking, subtitles}
}

@article{noabstract,
  title = {Speaker Labels in 360 Video}
}

@misc{untitled,
  note = {no title here}
}
";

    #[test]
    fn test_parse_result_file_entries() {
        let papers = parse_bib_entries(RESULT_FILE);
        assert_eq!(papers.len(), 2);

        assert_eq!(
            papers[0].title,
            "A View on the Viewer: Gaze-Adaptive {C}aptions for Videos"
        );
        assert!(papers[0].abstract_preview.starts_with("Subtitles play"));
        assert_eq!(papers[0].keywords.as_deref(), Some("eye tracking, subtitles"));

        assert_eq!(papers[1].title, "Speaker Labels in 360 Video");
        assert_eq!(papers[1].abstract_preview, NO_ABSTRACT);
        assert_eq!(papers[1].keywords, None);
    }

    #[test]
    fn test_long_abstract_is_truncated() {
        let long = "字".repeat(250);
        let entry = format!("@article{{x,\n  title = {{T}},\n  abstract = {{{}}}\n}}", long);
        let papers = parse_bib_entries(&entry);
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].abstract_preview.chars().count(), ABSTRACT_PREVIEW_CHARS + 3);
        assert!(papers[0].abstract_preview.ends_with("..."));
    }

    #[test]
    fn test_prompt_lists_papers_in_order() {
        let papers = parse_bib_entries(RESULT_FILE);
        let prompt = format_papers_for_prompt(&papers);
        let lines: Vec<&str> = prompt.lines().collect();
        assert!(lines[0].starts_with("Paper 1. Title: A View on the Viewer"));
        assert_eq!(lines[2], "   Keywords: eye tracking, subtitles");
        assert_eq!(lines[3], "Paper 2. Title: Speaker Labels in 360 Video");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_requests_use_analysis_models() {
        let config = Config::default();
        let analyst = ResultAnalyst::new(&config);
        let papers = parse_bib_entries(RESULT_FILE);

        let brief = analyst.brief_request(&papers).unwrap();
        assert_eq!(brief.model, "deepseek-chat");
        assert_eq!(brief.response_format, Some(ResponseFormat::JsonObject));

        let deep = analyst.deep_request(&papers, "Captions, Gaze").unwrap();
        assert_eq!(deep.model, "deepseek-reasoner");
        assert_eq!(deep.temperature, Some(DEEP_TEMPERATURE));
        assert_eq!(deep.response_format, Some(ResponseFormat::JsonObject));
    }

    #[test]
    fn test_parse_fenced_summary() {
        let raw = "```json\n{\"keywords\": \"Captions\", \"summary\": \"2 papers\"}\n```";
        let brief: BriefSummary = parse_summary(raw).unwrap();
        assert_eq!(brief.keywords, "Captions");
        assert!(brief.render().contains("2 papers"));

        let deep: DeepSummary =
            parse_summary(r#"{"keywords": "K", "detailed_analysis": {"categories": []}}"#).unwrap();
        assert_eq!(deep.summary, "");
        assert!(deep.render().contains("\"categories\""));

        assert!(matches!(
            parse_summary::<BriefSummary>("not json"),
            Err(AnalysisError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_header_only_result_has_no_papers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Result_x.bib");
        std::fs::write(&path, "% Query Time: now\n\n% Search Topic {x}\n\n").unwrap();

        let err = load_result_papers(&path).await.unwrap_err();
        assert!(matches!(err, AnalysisError::NoPapers));

        let missing = load_result_papers(dir.path().join("nope.bib")).await.unwrap_err();
        assert!(matches!(missing, AnalysisError::File(FileError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_save_report_creates_folder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Log").join("Summary_x.txt");
        save_report(&path, "report").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "report");
    }
}
