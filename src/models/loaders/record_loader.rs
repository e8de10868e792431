use crate::error::{AppError, AppResult, FileError};
use crate::models::record::{RecordSeed, RecordSet};
use std::path::Path;
use tokio::fs;

/// 从 JSON 文件加载已提取好的记录，并分配 1..=N 的索引
///
/// 文件内容是记录数组，每项包含 `title`、`abstract`、`entry`、
/// `source_folder`、`source_file`。
pub async fn load_records(path: impl AsRef<Path>) -> AppResult<RecordSet> {
    let path = path.as_ref();
    let path_str = path.display().to_string();

    if !path.exists() {
        return Err(FileError::NotFound { path: path_str }.into());
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| AppError::file_read_failed(path_str.clone(), e))?;

    let seeds: Vec<RecordSeed> = serde_json::from_str(&content).map_err(|source| {
        FileError::JsonParseFailed {
            path: path_str.clone(),
            source,
        }
    })?;

    tracing::info!("✓ 从 {} 加载了 {} 篇记录", path_str, seeds.len());

    Ok(RecordSet::from_seeds(seeds))
}
