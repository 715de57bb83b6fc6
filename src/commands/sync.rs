//! 同步运行相关命令

use crate::core::{ActionKind, Plan, ProgressReporter, SyncOptions, SyncReport};
use crate::db::SyncLog;
use crate::AppState;
use std::path::Path;

/// 读取同步选项文件并校验
pub fn load_options(path: &Path) -> Result<SyncOptions, String> {
    let options = SyncOptions::load(path).map_err(|e| format!("读取同步选项失败: {}", e))?;
    options.validate().map_err(|e| e.to_string())?;
    Ok(options)
}

/// 执行一次同步
pub async fn run_sync(
    state: &AppState,
    options: &SyncOptions,
    progress: ProgressReporter,
) -> Result<SyncReport, String> {
    state
        .engine
        .run(options, progress)
        .await
        .map_err(|e| format!("同步失败: {}", e))
}

/// 只分析差异，不修改任何一侧
pub async fn preview_sync(state: &AppState, options: &SyncOptions) -> Result<Plan, String> {
    state
        .engine
        .preview(options)
        .await
        .map_err(|e| format!("分析失败: {}", e))
}

/// 取消正在进行的同步或分析
pub fn cancel_sync(state: &AppState) {
    state.engine.cancel();
}

/// 最近的运行记录
pub async fn sync_history(
    state: &AppState,
    options: &SyncOptions,
    limit: i64,
) -> Result<Vec<SyncLog>, String> {
    SyncLog::load_recent(&state.db, &options.job_key(), limit)
        .await
        .map_err(|e| format!("读取运行记录失败: {}", e))
}

/// 计划的文本摘要，每个有效动作一行
pub fn describe_plan(plan: &Plan) -> Vec<String> {
    let mut lines: Vec<String> = plan
        .actions
        .iter()
        .filter(|a| a.kind != ActionKind::Skip)
        .map(|a| format!("{:?} {:?} {}", a.kind, a.direction, a.relative_path))
        .collect();
    let s = &plan.summary;
    lines.push(format!(
        "新增 {}，更新 {}，删除 {}，跳过 {}，冲突 {}，共 {} 字节",
        s.create_count, s.update_count, s.delete_count, s.skip_count, s.conflict_count, s.transfer_bytes
    ));
    for e in &plan.scan_errors {
        lines.push(format!("扫描失败 {}: {}", e.path, e.message));
    }
    lines
}
