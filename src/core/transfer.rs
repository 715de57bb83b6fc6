//! 传输执行器：全局并发槽位、任务状态机、暂停/恢复/取消与断点续传

mod copy;

pub use copy::{move_to_recycle, recycle_path};

use super::chunker::ChunkerParams;
use super::options::{HashAlgorithm, SyncOptions};
use super::task_store::TaskStore;
use crate::db::StorageConfig;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::AlgorithmConfig;
use crate::storage::{DownloadUrlProvider, FileEntry, HttpSource, LocalStorage, RemoteStorage, Storage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Transferring,
    Paused,
    Canceled,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Transferring => "transferring",
            TaskStatus::Paused => "paused",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// 合法的下一个状态
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Transferring | Paused | Canceled | Failed)
                | (Transferring, Pending | Paused | Canceled | Completed | Failed)
                | (Paused, Pending | Canceled)
                | (Failed, Pending | Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TaskStatus {
    fn from(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "transferring" => TaskStatus::Transferring,
            "paused" => TaskStatus::Paused,
            "canceled" => TaskStatus::Canceled,
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        }
    }
}

/// 任务的数据来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SourceRef {
    /// 同步运行中某个存储上的路径
    Path { storage: String, path: String },
    /// 云端对象，通过下载链接读取
    Remote {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        storage: Option<StorageConfig>,
        object_id: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        url_issued_at: Option<DateTime<Utc>>,
    },
}

impl SourceRef {
    /// 让下一次读取重新申请下载链接
    pub fn mark_url_stale(&mut self) {
        if let SourceRef::Remote {
            url, url_issued_at, ..
        } = self
        {
            *url = None;
            *url_issued_at = None;
        }
    }

    pub fn describe(&self) -> &str {
        match self {
            SourceRef::Path { path, .. } => path,
            SourceRef::Remote { object_id, .. } => object_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub source_ref: SourceRef,
    pub destination_path: String,
    pub status: TaskStatus,
    pub total_bytes: Option<u64>,
    pub transferred_bytes: u64,
    /// 已落盘并可以续传的偏移
    pub committed_bytes: u64,
    /// 字节/秒
    pub speed: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_encrypted: bool,
    pub temp_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferTask {
    pub fn new(
        source_ref: SourceRef,
        destination: impl Into<String>,
        total_bytes: Option<u64>,
        is_encrypted: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_ref,
            destination_path: destination.into(),
            status: TaskStatus::Pending,
            total_bytes,
            transferred_bytes: 0,
            committed_bytes: 0,
            speed: 0,
            start_time: None,
            end_time: None,
            is_encrypted,
            temp_path: None,
            error: None,
            created_at: Utc::now(),
        }
    }
}

/// 执行器配置（进程级）
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_parallel: usize,
    /// 字节/秒，0 表示不限速
    pub speed_limit: u64,
    pub completed_retention: usize,
    pub url_staleness: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            speed_limit: 0,
            completed_retention: 1000,
            url_staleness: Duration::from_secs(300),
        }
    }
}

/// 单个传输的重试、分块和校验参数
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub temp_suffix: String,
    pub chunker: Option<ChunkerParams>,
    pub verify: Option<HashAlgorithm>,
    /// 失败后保留临时文件以便续传
    pub keep_partial: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 500,
            temp_suffix: ".synctmp".to_string(),
            chunker: None,
            verify: None,
            keep_partial: false,
        }
    }
}

impl TransferSettings {
    pub fn from_options(options: &SyncOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            retry_base_delay_ms: options.retry_base_delay_ms,
            temp_suffix: options.temp_file_suffix.clone(),
            chunker: options.chunker_params(),
            verify: options.verify_after_copy.then_some(options.hash_algorithm),
            keep_partial: false,
        }
    }
}

pub enum ContentSource {
    Storage {
        storage: Arc<dyn Storage>,
        path: String,
    },
    Remote {
        provider: Arc<dyn DownloadUrlProvider>,
        object_id: String,
    },
}

/// 写入时对内容做的变换
#[derive(Debug, Clone)]
pub enum Codec {
    Plain,
    /// 加密/压缩后写入，可选把原文件名写进流头
    Encode {
        config: AlgorithmConfig,
        name: Option<String>,
    },
    /// 下载的是编码流，落盘前解码
    Decode { config: AlgorithmConfig },
}

impl Codec {
    fn is_encrypted(&self) -> bool {
        !matches!(self, Codec::Plain)
    }
}

/// 目标已存在时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    /// 覆盖，可选先把旧版本移到回收站
    Replace { recycle: bool },
    /// 改名为 `name (n).ext`
    Disambiguate,
}

pub struct TransferRequest {
    pub source: ContentSource,
    pub target: Arc<dyn Storage>,
    pub target_path: String,
    pub size: Option<u64>,
    /// 完成后设置的修改时间
    pub modified: Option<DateTime<Utc>>,
    pub codec: Codec,
    pub collision: Collision,
    pub settings: TransferSettings,
    /// 整个运行的取消信号
    pub cancel: CancellationToken,
}

/// 按需下载单个云端对象
pub struct FetchRequest {
    pub provider: Arc<dyn DownloadUrlProvider>,
    /// 保存下来用于进程重启后恢复
    pub storage: Option<StorageConfig>,
    pub object_id: String,
    pub destination: PathBuf,
    pub algorithm: Option<AlgorithmConfig>,
    pub settings: TransferSettings,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub task_id: String,
    pub final_path: String,
    /// 落盘后的目标条目
    pub entry: Option<FileEntry>,
    pub bytes: u64,
    pub recovered_name: Option<String>,
}

/// 正在运行的任务的控制句柄
struct TaskControl {
    token: Mutex<CancellationToken>,
    wake: Notify,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    fn interrupt(&self) {
        self.lock().cancel();
    }

    fn rearm(&self) {
        *self.lock() = CancellationToken::new();
    }
}

fn temp_name(path: &str, suffix: &str) -> String {
    let unique = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}{}", path, suffix, &unique[..12])
}

pub struct TransferExecutor {
    tasks: RwLock<HashMap<String, TransferTask>>,
    controls: Mutex<HashMap<String, Arc<TaskControl>>>,
    semaphore: Arc<Semaphore>,
    speed_limit: AtomicU64,
    store: Option<TaskStore>,
    config: ExecutorConfig,
    http: HttpSource,
}

impl TransferExecutor {
    pub fn new(config: ExecutorConfig, store: Option<TaskStore>) -> SyncResult<Self> {
        Ok(Self {
            tasks: RwLock::new(HashMap::new()),
            controls: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            speed_limit: AtomicU64::new(config.speed_limit),
            store,
            http: HttpSource::new()?,
            config,
        })
    }

    pub fn set_speed_limit(&self, bytes_per_sec: u64) {
        self.speed_limit.store(bytes_per_sec, Ordering::Relaxed);
        info!("全局限速: {} B/s", bytes_per_sec);
    }

    fn controls(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskControl>>> {
        self.controls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self, id: &str) -> Option<Arc<TaskControl>> {
        self.controls().get(id).cloned()
    }

    fn attach(&self, id: &str) -> Arc<TaskControl> {
        let ctl = Arc::new(TaskControl::new());
        self.controls().insert(id.to_string(), ctl.clone());
        ctl
    }

    fn detach(&self, id: &str) {
        self.controls().remove(id);
    }

    async fn persist(&self, task: &TransferTask) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(task).await {
                warn!("保存任务状态失败 {}: {}", task.id, e);
            }
        }
    }

    async fn register(&self, task: TransferTask) -> String {
        let id = task.id.clone();
        debug!("提交任务 {}: {} -> {}", id, task.source_ref.describe(), task.destination_path);
        self.persist(&task).await;
        self.tasks.write().await.insert(id.clone(), task);
        id
    }

    pub async fn get(&self, id: &str) -> Option<TransferTask> {
        self.tasks.read().await.get(id).cloned()
    }

    /// 全部任务，按创建时间排序
    pub async fn get_all(&self) -> Vec<TransferTask> {
        let mut all: Vec<TransferTask> = self.tasks.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    async fn status(&self, id: &str) -> SyncResult<TaskStatus> {
        self.tasks
            .read()
            .await
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| SyncError::TaskNotFound(id.to_string()))
    }

    /// 修改任务字段（不改变状态），返回修改后的副本
    async fn update(&self, id: &str, f: impl FnOnce(&mut TransferTask)) -> Option<TransferTask> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id)?;
        f(task);
        Some(task.clone())
    }

    /// 唯一的状态修改入口，非法转换返回 InvalidTransition
    pub async fn transition(&self, id: &str, to: TaskStatus) -> SyncResult<TransferTask> {
        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| SyncError::TaskNotFound(id.to_string()))?;
            let from = task.status;
            if !from.can_transition_to(to) {
                return Err(SyncError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to,
                });
            }
            let now = Utc::now();
            task.status = to;
            task.speed = 0;
            match to {
                TaskStatus::Transferring => {
                    task.start_time.get_or_insert(now);
                    task.error = None;
                }
                TaskStatus::Pending => task.end_time = None,
                TaskStatus::Completed | TaskStatus::Canceled | TaskStatus::Failed => {
                    task.end_time = Some(now)
                }
                TaskStatus::Paused => {}
            }
            task.clone()
        };

        debug!("任务 {} -> {}", id, to);
        self.persist(&task).await;
        if to == TaskStatus::Completed {
            self.evict_completed().await;
        }
        Ok(task)
    }

    /// 已完成任务超过上限时淘汰最旧的
    async fn evict_completed(&self) {
        let evicted: Vec<String> = {
            let mut tasks = self.tasks.write().await;
            let mut completed: Vec<(DateTime<Utc>, String)> = tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| (t.end_time.unwrap_or(t.created_at), t.id.clone()))
                .collect();
            if completed.len() <= self.config.completed_retention {
                return;
            }
            completed.sort();
            let surplus = completed.len() - self.config.completed_retention;
            let ids: Vec<String> = completed.into_iter().take(surplus).map(|(_, id)| id).collect();
            for id in &ids {
                tasks.remove(id);
            }
            ids
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&evicted).await {
                warn!("删除过期任务记录失败: {}", e);
            }
        }
        debug!("淘汰 {} 个已完成任务", evicted.len());
    }

    /// 进程启动时加载任务。未完成的任务转为暂停，下载链接标记为过期
    pub async fn recover(&self) -> SyncResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all().await?;
        let total = loaded.len();
        let mut interrupted = 0;

        for mut task in loaded {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Transferring) {
                task.status = TaskStatus::Paused;
                task.speed = 0;
                task.source_ref.mark_url_stale();
                self.persist(&task).await;
                interrupted += 1;
            }
            self.tasks.write().await.insert(task.id.clone(), task);
        }
        self.evict_completed().await;

        info!("恢复 {} 个任务，其中 {} 个中断的任务转为暂停", total, interrupted);
        Ok(total)
    }

    pub async fn pause(&self, id: &str) -> SyncResult<()> {
        self.transition(id, TaskStatus::Paused).await?;
        if let Some(ctl) = self.control(id) {
            ctl.interrupt();
        }
        info!("任务已暂停: {}", id);
        Ok(())
    }

    pub async fn cancel(&self, id: &str) -> SyncResult<()> {
        let task = self.transition(id, TaskStatus::Canceled).await?;
        match self.control(id) {
            Some(ctl) => {
                ctl.interrupt();
                ctl.wake.notify_one();
            }
            None => Self::discard_detached_temp(&task).await,
        }
        info!("任务已取消: {}", id);
        Ok(())
    }

    /// 没有运行中的工作者时，只有云端下载任务能独立恢复
    pub async fn resume(
        self: &Arc<Self>,
        id: &str,
        algorithm: Option<AlgorithmConfig>,
    ) -> SyncResult<()> {
        if let Some(ctl) = self.control(id) {
            self.transition(id, TaskStatus::Pending).await?;
            ctl.rearm();
            ctl.wake.notify_one();
            info!("任务已恢复: {}", id);
            return Ok(());
        }

        let task = self
            .get(id)
            .await
            .ok_or_else(|| SyncError::TaskNotFound(id.to_string()))?;
        let SourceRef::Remote {
            storage: Some(config),
            object_id,
            ..
        } = task.source_ref.clone()
        else {
            return Err(SyncError::Configuration(format!(
                "任务 {} 属于同步运行，需要重新运行同步来恢复",
                id
            )));
        };
        if task.is_encrypted && algorithm.is_none() {
            return Err(SyncError::Configuration(format!(
                "任务 {} 是加密下载，恢复时需要提供解密配置",
                id
            )));
        }

        let destination = PathBuf::from(&task.destination_path);
        let (target, file_name) = Self::local_target(&destination).await?;
        let provider: Arc<dyn DownloadUrlProvider> =
            Arc::new(RemoteStorage::from_config(&config).await?);

        self.transition(id, TaskStatus::Pending).await?;
        let request = TransferRequest {
            source: ContentSource::Remote {
                provider,
                object_id,
            },
            target,
            target_path: file_name,
            size: task.total_bytes,
            modified: None,
            codec: algorithm
                .map(|config| Codec::Decode { config })
                .unwrap_or(Codec::Plain),
            collision: Collision::Disambiguate,
            settings: TransferSettings {
                keep_partial: true,
                ..TransferSettings::default()
            },
            cancel: CancellationToken::new(),
        };
        self.spawn_driver(id.to_string(), request);
        info!("任务已重新启动: {}", id);
        Ok(())
    }

    async fn local_target(destination: &std::path::Path) -> SyncResult<(Arc<dyn Storage>, String)> {
        let file_name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SyncError::Configuration(format!("无效的下载路径: {:?}", destination)))?
            .to_string();
        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let target: Arc<dyn Storage> = Arc::new(LocalStorage::new(&dir)?);
        Ok((target, file_name))
    }

    async fn discard_detached_temp(task: &TransferTask) {
        if let (SourceRef::Remote { .. }, Some(temp)) = (&task.source_ref, &task.temp_path) {
            let dir = PathBuf::from(&task.destination_path)
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default();
            let _ = tokio::fs::remove_file(dir.join(temp)).await;
        }
    }

    /// 按需下载，立即返回任务 id
    pub async fn fetch(self: &Arc<Self>, request: FetchRequest) -> SyncResult<String> {
        let FetchRequest {
            provider,
            storage,
            object_id,
            destination,
            algorithm,
            settings,
        } = request;

        let (target, file_name) = Self::local_target(&destination).await?;
        let total = match provider.object_size(&object_id).await {
            Ok(size) => size,
            Err(e) => {
                warn!("获取对象大小失败 {}: {}", object_id, e);
                None
            }
        };

        let mut task = TransferTask::new(
            SourceRef::Remote {
                storage,
                object_id: object_id.clone(),
                url: None,
                url_issued_at: None,
            },
            destination.to_string_lossy(),
            total,
            algorithm.is_some(),
        );
        task.temp_path = Some(temp_name(&file_name, &settings.temp_suffix));
        let id = self.register(task).await;

        let request = TransferRequest {
            source: ContentSource::Remote {
                provider,
                object_id,
            },
            target,
            target_path: file_name,
            size: total,
            modified: None,
            codec: algorithm
                .map(|config| Codec::Decode { config })
                .unwrap_or(Codec::Plain),
            collision: Collision::Disambiguate,
            settings: TransferSettings {
                keep_partial: true,
                ..settings
            },
            cancel: CancellationToken::new(),
        };
        self.spawn_driver(id.clone(), request);
        Ok(id)
    }

    fn spawn_driver(self: &Arc<Self>, id: String, request: TransferRequest) {
        let ctl = self.attach(&id);
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.drive(&id, ctl, &request).await {
                warn!("下载任务 {} 结束: {}", id, e);
            }
        });
    }

    /// 同步写入：在调用方的并发里执行，完成后返回结果
    pub async fn transfer(&self, request: TransferRequest) -> SyncResult<TransferOutcome> {
        let source_ref = match &request.source {
            ContentSource::Storage { storage, path } => SourceRef::Path {
                storage: storage.name().to_string(),
                path: path.clone(),
            },
            ContentSource::Remote { object_id, .. } => SourceRef::Remote {
                storage: None,
                object_id: object_id.clone(),
                url: None,
                url_issued_at: None,
            },
        };
        let mut task = TransferTask::new(
            source_ref,
            request.target_path.clone(),
            request.size,
            request.codec.is_encrypted(),
        );
        task.temp_path = Some(temp_name(&request.target_path, &request.settings.temp_suffix));
        let id = self.register(task).await;
        let ctl = self.attach(&id);
        self.drive(&id, ctl, &request).await
    }

    /// 等待任务离开 Pending/Transferring
    pub async fn wait(&self, id: &str) -> SyncResult<TransferTask> {
        loop {
            let task = self
                .get(id)
                .await
                .ok_or_else(|| SyncError::TaskNotFound(id.to_string()))?;
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Transferring) {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn drive(
        &self,
        id: &str,
        ctl: Arc<TaskControl>,
        req: &TransferRequest,
    ) -> SyncResult<TransferOutcome> {
        scopeguard::defer! {
            self.detach(id);
        }
        let mut attempt = 0u32;

        loop {
            match self.status(id).await? {
                TaskStatus::Canceled => return self.abandon(id, req).await,
                TaskStatus::Paused => {
                    info!("任务 {} 暂停中，等待恢复", id);
                    tokio::select! {
                        _ = ctl.wake.notified() => {}
                        _ = req.cancel.cancelled() => {
                            let _ = self.transition(id, TaskStatus::Canceled).await;
                        }
                    }
                    continue;
                }
                TaskStatus::Transferring => {
                    self.transition(id, TaskStatus::Pending).await?;
                }
                status if status.is_terminal() => return Err(SyncError::Interrupted(status)),
                _ => {}
            }
            if req.cancel.is_cancelled() {
                self.transition(id, TaskStatus::Canceled).await?;
                continue;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| SyncError::transfer(&req.target_path, e))?
                }
                _ = ctl.wake.notified() => continue,
                _ = req.cancel.cancelled() => continue,
            };
            // 排队期间可能被暂停
            match self.transition(id, TaskStatus::Transferring).await {
                Ok(_) => {}
                Err(SyncError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }

            let token = ctl.token();
            let result = self.attempt(id, req, &token).await;
            drop(permit);

            match result {
                Ok(outcome) => {
                    if let Err(e) = self.transition(id, TaskStatus::Completed).await {
                        warn!("任务 {} 完成时状态已被修改: {}", id, e);
                    }
                    debug!("传输完成: {} ({} bytes)", outcome.final_path, outcome.bytes);
                    return Ok(outcome);
                }
                Err(SyncError::Interrupted(_)) => {
                    if req.cancel.is_cancelled() {
                        let _ = self.transition(id, TaskStatus::Canceled).await;
                    }
                    continue;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.update(id, |t| t.error = Some(message.clone())).await;

                    if e.is_retryable() && attempt < req.settings.max_retries {
                        let delay = req
                            .settings
                            .retry_base_delay_ms
                            .saturating_mul(1u64 << attempt.min(16));
                        attempt += 1;
                        warn!(
                            "传输失败，{}ms 后重试 ({}/{}): {}",
                            delay, attempt, req.settings.max_retries, message
                        );
                        if self.transition(id, TaskStatus::Pending).await.is_ok() {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                                _ = req.cancel.cancelled() => {}
                            }
                        }
                        continue;
                    }

                    error!("传输最终失败 (已重试 {} 次): {}", attempt, message);
                    let _ = self.transition(id, TaskStatus::Failed).await;
                    if !req.settings.keep_partial {
                        self.remove_temp(id, req).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn abandon(&self, id: &str, req: &TransferRequest) -> SyncResult<TransferOutcome> {
        self.remove_temp(id, req).await;
        Err(SyncError::Interrupted(TaskStatus::Canceled))
    }

    async fn remove_temp(&self, id: &str, req: &TransferRequest) {
        let Some(temp) = self.get(id).await.and_then(|t| t.temp_path) else {
            return;
        };
        for path in [temp.clone(), copy::decoded_name(&temp)] {
            if let Err(e) = req.target.delete(&path).await {
                debug!("删除临时文件失败 {}: {}", path, e);
            }
        }
        self.update(id, |t| {
            t.committed_bytes = 0;
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DownloadUrl;
    use async_trait::async_trait;

    fn executor() -> Arc<TransferExecutor> {
        Arc::new(TransferExecutor::new(ExecutorConfig::default(), None).unwrap())
    }

    fn local(dir: &std::path::Path) -> Arc<dyn Storage> {
        Arc::new(LocalStorage::new(dir).unwrap())
    }

    fn request(src: Arc<dyn Storage>, dst: Arc<dyn Storage>, path: &str) -> TransferRequest {
        TransferRequest {
            source: ContentSource::Storage {
                storage: src,
                path: path.to_string(),
            },
            target: dst,
            target_path: path.to_string(),
            size: None,
            modified: None,
            codec: Codec::Plain,
            collision: Collision::Replace { recycle: false },
            settings: TransferSettings {
                retry_base_delay_ms: 1,
                ..TransferSettings::default()
            },
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Transferring));
        assert!(Transferring.can_transition_to(Pending));
        assert!(Paused.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Paused.can_transition_to(Transferring));
        assert!(!Paused.can_transition_to(Completed));
        for to in [Pending, Transferring, Paused, Canceled, Completed, Failed] {
            assert!(!Completed.can_transition_to(to));
            assert!(!Canceled.can_transition_to(to));
        }
        assert_eq!(TaskStatus::from("transferring"), Transferring);
        assert_eq!(Paused.to_string(), "paused");
    }

    #[test]
    fn test_source_ref_json() {
        let r = SourceRef::Remote {
            storage: None,
            object_id: "a/b".into(),
            url: None,
            url_issued_at: None,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "remote");
        assert_eq!(json["objectId"], "a/b");
    }

    #[tokio::test]
    async fn test_transfer_copies_and_completes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("d")).unwrap();
        std::fs::write(src.path().join("d/a.txt"), b"hello").unwrap();

        let exec = executor();
        let outcome = exec
            .transfer(request(local(src.path()), local(dst.path()), "d/a.txt"))
            .await
            .unwrap();
        assert_eq!(outcome.final_path, "d/a.txt");
        assert_eq!(outcome.bytes, 5);
        assert_eq!(std::fs::read(dst.path().join("d/a.txt")).unwrap(), b"hello");

        let task = exec.get(&outcome.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.transferred_bytes, 5);
        // 临时文件已经改名
        let names: Vec<_> = std::fs::read_dir(dst.path().join("d")).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_fails_after_retries() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let exec = executor();
        let err = exec
            .transfer(request(local(src.path()), local(dst.path()), "nope.txt"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let tasks = exec.get_all().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error.is_some());
        assert!(exec.transition(&tasks[0].id, TaskStatus::Completed).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_states_reject_control() {
        let exec = executor();
        let task = TransferTask::new(
            SourceRef::Path {
                storage: "x".into(),
                path: "a".into(),
            },
            "a",
            Some(1),
            false,
        );
        let id = exec.register(task).await;
        exec.cancel(&id).await.unwrap();
        assert!(matches!(
            exec.pause(&id).await,
            Err(SyncError::InvalidTransition { .. })
        ));
        assert!(matches!(
            exec.cancel("missing").await,
            Err(SyncError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_retention() {
        let config = ExecutorConfig {
            completed_retention: 2,
            ..ExecutorConfig::default()
        };
        let exec = TransferExecutor::new(config, None).unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            let task = TransferTask::new(
                SourceRef::Path {
                    storage: "x".into(),
                    path: format!("{}", i),
                },
                format!("{}", i),
                Some(1),
                false,
            );
            let id = exec.register(task).await;
            exec.transition(&id, TaskStatus::Transferring).await.unwrap();
            exec.transition(&id, TaskStatus::Completed).await.unwrap();
            ids.push(id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let remaining: Vec<String> = exec.get_all().await.into_iter().map(|t| t.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());
    }

    /// 从本地文件提供“下载链接”的测试桩
    struct FileUrlProvider {
        server: String,
    }

    #[async_trait]
    impl DownloadUrlProvider for FileUrlProvider {
        async fn download_url(&self, object_id: &str) -> anyhow::Result<DownloadUrl> {
            Ok(DownloadUrl {
                url: format!("{}/{}", self.server, object_id),
                expires_at: Utc::now() + chrono::Duration::minutes(10),
            })
        }
    }

    #[tokio::test]
    async fn test_fetch_unreachable_url_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor();
        let id = exec
            .fetch(FetchRequest {
                provider: Arc::new(FileUrlProvider {
                    server: "http://127.0.0.1:9".into(),
                }),
                storage: None,
                object_id: "obj.bin".into(),
                destination: dir.path().join("obj.bin"),
                algorithm: None,
                settings: TransferSettings {
                    max_retries: 0,
                    ..TransferSettings::default()
                },
            })
            .await
            .unwrap();
        let task = exec.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        match &task.source_ref {
            SourceRef::Remote { url, .. } => assert!(url.as_deref().unwrap().ends_with("/obj.bin")),
            _ => panic!("unexpected source ref"),
        }
    }

    #[tokio::test]
    async fn test_resume_sync_task_without_worker_is_rejected() {
        let exec = executor();
        let task = TransferTask::new(
            SourceRef::Path {
                storage: "x".into(),
                path: "a".into(),
            },
            "a",
            None,
            false,
        );
        let id = exec.register(task).await;
        exec.pause(&id).await.unwrap();
        assert!(matches!(
            exec.resume(&id, None).await,
            Err(SyncError::Configuration(_))
        ));
    }
}
