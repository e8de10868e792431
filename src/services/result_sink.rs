//! 结果写入服务 - 业务能力层
//!
//! 每次运行四个只追加的文本文件：
//! - `Result_<ts>.bib`：相关记录的原始条目
//! - `Accepted_<ts>.txt`：相关记录的 `{title, justification}`
//! - `Judgments_<ts>.txt`：每一篇记录的 `{title, verdict, justification}`
//! - `Trace_<ts>.txt`（可选）：诊断信息和进度报告
//!
//! 所有 worker 共用一把异步写锁；每次追加都是"打开-追加-关闭"，
//! 不同 worker 的条目以记录为粒度交错，单条内容不会被截断。
//! 追加走 `tokio::fs`，不阻塞运行时的工作线程。

use crate::error::{AppError, AppResult, ClassificationError};
use crate::models::{Query, Record};
use crate::services::judgment::Verdict;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 一次运行的输出文件路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub result: PathBuf,
    pub accepted_log: PathBuf,
    pub judgments_log: PathBuf,
    pub trace_log: Option<PathBuf>,
    /// 结果分析的输出，运行结束后才会写入
    pub summary_log: PathBuf,
}

impl RunArtifacts {
    /// 根据运行开始时间生成文件名
    pub fn named(
        result_folder: impl AsRef<Path>,
        log_folder: impl AsRef<Path>,
        started_at: DateTime<Local>,
        with_trace: bool,
    ) -> Self {
        let ts = started_at.format("%Y%m%d_%H%M%S").to_string();
        let logs = log_folder.as_ref();
        Self {
            result: result_folder.as_ref().join(format!("Result_{}.bib", ts)),
            accepted_log: logs.join(format!("Accepted_{}.txt", ts)),
            judgments_log: logs.join(format!("Judgments_{}.txt", ts)),
            trace_log: with_trace.then(|| logs.join(format!("Trace_{}.txt", ts))),
            summary_log: logs.join(format!("Summary_{}.txt", ts)),
        }
    }
}

#[derive(Serialize)]
struct JudgmentEntry<'a> {
    title: &'a str,
    verdict: &'a str,
    justification: &'a str,
}

#[derive(Serialize)]
struct AcceptedEntry<'a> {
    title: &'a str,
    justification: &'a str,
}

/// 结果写入服务
pub struct ResultSink {
    artifacts: RunArtifacts,
    write_lock: Mutex<()>,
}

impl ResultSink {
    /// 创建（截断）全部输出文件并写入文件头
    ///
    /// 只在运行开始、任何 worker 启动之前调用一次，这里的同步 IO 不会与追加竞争。
    pub fn create(artifacts: RunArtifacts, query: &Query, query_time: DateTime<Local>) -> AppResult<Self> {
        for path in [&artifacts.result, &artifacts.accepted_log, &artifacts.judgments_log]
            .into_iter()
            .chain(artifacts.trace_log.as_ref())
        {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .map_err(|e| AppError::create_dir_failed(parent.display().to_string(), e))?;
            }
        }

        let time = query_time.format("%Y-%m-%d %H:%M:%S").to_string();

        let mut result_header = header_lines("%", &time, query);
        result_header.push_str(&format!("\n% Search Topic {{{}}}\n\n", query.question));
        write_new(&artifacts.result, &result_header)?;

        let log_header = header_lines("//", &time, query) + "\n";
        write_new(&artifacts.accepted_log, &log_header)?;
        write_new(&artifacts.judgments_log, &log_header)?;
        if let Some(trace) = &artifacts.trace_log {
            write_new(trace, &log_header)?;
        }

        debug!("输出文件已创建: {:?}", artifacts);

        Ok(Self {
            artifacts,
            write_lock: Mutex::new(()),
        })
    }

    pub fn artifacts(&self) -> &RunArtifacts {
        &self.artifacts
    }

    /// 记录一篇的判定结果（无论是否相关）
    pub async fn append_judgment(
        &self,
        title: &str,
        verdict: Verdict,
        justification: &str,
    ) -> Result<(), ClassificationError> {
        let block = to_block(&JudgmentEntry {
            title,
            verdict: verdict.symbol(),
            justification,
        });
        let _guard = self.write_lock.lock().await;
        append(&self.artifacts.judgments_log, &format!("{}\n\n", block)).await
    }

    /// 写入相关记录：原始条目进结果文件，理由进 Accepted 日志
    pub async fn append_accepted(
        &self,
        record: &Record,
        justification: &str,
    ) -> Result<(), ClassificationError> {
        let block = to_block(&AcceptedEntry {
            title: &record.title,
            justification,
        });
        let _guard = self.write_lock.lock().await;
        append(&self.artifacts.result, &format!("{}\n\n", record.raw_entry)).await?;
        append(&self.artifacts.accepted_log, &format!("{}\n", block)).await
    }

    /// 写入完整日志；未启用时什么都不做
    pub async fn trace(&self, message: &str) {
        let Some(path) = &self.artifacts.trace_log else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        if let Err(e) = append(path, &format!("{}\n", message)).await {
            warn!("⚠️ 写入完整日志失败: {}", e);
        }
    }
}

fn header_lines(prefix: &str, time: &str, query: &Query) -> String {
    let mut header = format!(
        "{p} Query Time: {}\n{p} Research Question: {}\n{p} Keywords: {}\n",
        time,
        query.question,
        query.keywords,
        p = prefix
    );
    if !query.requirements.trim().is_empty() {
        header.push_str(&format!("{} Requirements: {}\n", prefix, query.requirements.trim()));
    }
    header
}

fn to_block<T: Serialize>(entry: &T) -> String {
    serde_json::to_string_pretty(entry).unwrap_or_default()
}

fn write_new(path: &Path, content: &str) -> AppResult<()> {
    fs::write(path, content).map_err(|e| AppError::file_write_failed(path.display().to_string(), e))
}

async fn append(path: &Path, content: &str) -> Result<(), ClassificationError> {
    let to_sink_err = |e| ClassificationError::sink(path.display().to_string(), e);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(to_sink_err)?;
    file.write_all(content.as_bytes()).await.map_err(to_sink_err)?;
    file.flush().await.map_err(to_sink_err)
}
