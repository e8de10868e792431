use anyhow::Result;
use paper_screen::error::CredentialError;
use paper_screen::services::analysis::{load_result_papers, save_report};
use paper_screen::services::RunArtifacts;
use paper_screen::{
    load_records, utils::logging, AnalysisError, AppError, Config, Credential, CredentialPool,
    Dispatcher, LlmJudge, MaxCount, Query, ResultAnalyst,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置：第一个参数为可选的 TOML 配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    // 初始化日志
    logging::init(config.verbose_logging);

    if config.research_question.trim().is_empty() {
        warn!("⚠️ 研究问题为空，判定结果可能没有意义");
    }

    // 密钥划分
    let pool = CredentialPool::new(config.api_keys.clone(), config.reserved_analysis_keys);
    let processing = pool.reserve_for_processing();
    let analysis = pool.reserve_for_analysis();
    if processing.is_empty() {
        return Err(AppError::from(CredentialError::NoneForProcessing).into());
    }
    info!(
        "🔑 密钥: 共 {} 个，处理用 {} 个，分析预留 {} 个",
        pool.len(),
        processing.len(),
        analysis.len()
    );

    let records = Arc::new(load_records(&config.records_file).await?);

    let query = Query::new(
        config.research_question.clone(),
        config.keywords.clone(),
        config.requirements.clone(),
    );

    // Ctrl-C 触发停止信号
    let stop = CancellationToken::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⏹️ 收到 Ctrl-C，正在停止...");
            ctrl_c_stop.cancel();
        }
    });

    let judge = Arc::new(LlmJudge::new(&config));
    let dispatcher = Dispatcher::new(&config, judge)?;
    let summary = dispatcher
        .dispatch(
            records,
            MaxCount::from(config.max_papers),
            &processing,
            &query,
            stop,
        )
        .await?;

    info!(
        "🎉 完成: 相关 {}/{} 篇，失败 {} 篇",
        summary.relevant, summary.processed, summary.failed
    );

    // 结果分析：失败只影响摘要，不影响筛选结果
    if let (true, Some(artifacts)) = (config.generate_summary, &summary.artifacts) {
        if summary.relevant == 0 {
            info!("没有相关记录，跳过结果分析");
        } else if let Err(e) = analyze_results(&config, &analysis, artifacts).await {
            warn!("⚠️ 结果分析失败: {}", e);
        }
    }

    Ok(())
}

/// 简要总结用第一个分析密钥，深度总结用第二个
async fn analyze_results(
    config: &Config,
    keys: &[Credential],
    artifacts: &RunArtifacts,
) -> Result<(), AnalysisError> {
    let Some(brief_key) = keys.first() else {
        warn!("⚠️ 没有预留的分析密钥，跳过结果分析");
        return Ok(());
    };

    let papers = load_result_papers(&artifacts.result).await?;
    let analyst = ResultAnalyst::new(config);

    info!("📝 正在生成简要总结（{} 篇）...", papers.len());
    let brief = analyst.brief_summary(&papers, brief_key).await?;
    let mut report = brief.render();

    if config.deep_summary {
        match keys.get(1) {
            Some(deep_key) => {
                info!("📝 正在生成深度总结...");
                let deep = analyst
                    .deep_summary(&papers, &brief.keywords, deep_key)
                    .await?;
                report.push('\n');
                report.push_str(&deep.render());
            }
            None => warn!("⚠️ 深度总结需要第二个分析密钥，已跳过"),
        }
    }

    save_report(&artifacts.summary_log, &report).await?;
    info!("📝 分析结果已保存至: {}", artifacts.summary_log.display());
    Ok(())
}
