//! 传输任务命令

use crate::core::{FetchRequest, TransferSettings, TransferTask};
use crate::db::StorageConfig;
use crate::pipeline::{AlgorithmConfig, EncryptionOptions};
use crate::storage::{remote::RemoteStorage, DownloadUrlProvider};
use crate::AppState;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("读取 {:?} 失败: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("解析 {:?} 失败: {}", path, e))
}

/// 从加密配置文件得到算法组合
pub fn load_algorithm(path: Option<&Path>) -> Result<Option<AlgorithmConfig>, String> {
    path.map(|p| {
        let options: EncryptionOptions = read_json(p)?;
        AlgorithmConfig::from_options(&options).map_err(|e| e.to_string())
    })
    .transpose()
}

pub async fn list_tasks(state: &AppState) -> Vec<TransferTask> {
    state.executor.get_all().await
}

/// 从云端存储按对象 id 下载到本地，立即返回任务 id
pub async fn fetch_object(
    state: &AppState,
    storage_file: &Path,
    object_id: &str,
    destination: PathBuf,
    encryption: Option<&Path>,
) -> Result<String, String> {
    let config: StorageConfig = read_json(storage_file)?;
    let algorithm = load_algorithm(encryption)?;
    let provider: Arc<dyn DownloadUrlProvider> = Arc::new(
        RemoteStorage::from_config(&config)
            .await
            .map_err(|e| format!("初始化存储失败: {}", e))?,
    );

    state
        .executor
        .fetch(FetchRequest {
            provider,
            storage: Some(config),
            object_id: object_id.to_string(),
            destination,
            algorithm,
            settings: TransferSettings {
                keep_partial: true,
                ..TransferSettings::default()
            },
        })
        .await
        .map_err(|e| e.to_string())
}

pub async fn pause_task(state: &AppState, id: &str) -> Result<(), String> {
    state.executor.pause(id).await.map_err(|e| e.to_string())
}

pub async fn cancel_task(state: &AppState, id: &str) -> Result<(), String> {
    state.executor.cancel(id).await.map_err(|e| e.to_string())
}

pub async fn resume_task(state: &AppState, id: &str, encryption: Option<&Path>) -> Result<(), String> {
    let algorithm = load_algorithm(encryption)?;
    state
        .executor
        .resume(id, algorithm)
        .await
        .map_err(|e| e.to_string())
}

/// 等待任务结束（完成、失败、取消或暂停）
pub async fn wait_task(state: &AppState, id: &str) -> Result<TransferTask, String> {
    state.executor.wait(id).await.map_err(|e| e.to_string())
}

/// 修改全局下载限速并写入配置
pub fn set_speed_limit(state: &mut AppState, bytes_per_sec: u64) -> Result<(), String> {
    state.executor.set_speed_limit(bytes_per_sec);
    state.config.download_speed_limit = bytes_per_sec;
    state.config.save(&state.config_dir).map_err(|e| e.to_string())
}
