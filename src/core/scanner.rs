use super::ignore::IgnoreRules;
use crate::error::{SyncError, SyncResult};
use crate::storage::{FileEntry, Storage};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 跟随符号链接时的最大深度（防止链接成环）
const MAX_DEPTH: usize = 128;

/// 扫描配置
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// 并发枚举的目录数
    pub workers: usize,
    /// 是否进入符号链接指向的目录
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            follow_symlinks: false,
        }
    }
}

/// 单个路径的扫描错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// 按路径排序的条目
    pub entries: BTreeMap<String, FileEntry>,
    pub errors: Vec<PathError>,
    /// 枚举失败的子目录，其内容不在结果中
    pub failed_dirs: Vec<String>,
}

impl ScanResult {
    /// 路径是否位于枚举失败的子目录之下（包括目录自身）
    pub fn is_under_failed_dir(&self, path: &str) -> bool {
        self.failed_dirs.iter().any(|dir| {
            path == dir
                || (path.len() > dir.len()
                    && path.starts_with(dir.as_str())
                    && path.as_bytes()[dir.len()] == b'/')
        })
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_dir()).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// 并发目录树扫描器：每个工作单元负责一个目录，子目录作为新的工作单元入队
pub struct TreeScanner {
    storage: Arc<dyn Storage>,
    rules: Arc<IgnoreRules>,
    config: ScanConfig,
    cancel: Option<CancellationToken>,
}

impl TreeScanner {
    pub fn new(storage: Arc<dyn Storage>, rules: Arc<IgnoreRules>, config: ScanConfig) -> Self {
        Self {
            storage,
            rules,
            config,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// 扫描整棵树。根目录不可读时返回错误，其余错误收集在结果里
    pub async fn scan(&self) -> SyncResult<ScanResult> {
        info!("开始扫描存储: {}", self.storage.name());

        let root_children = self
            .storage
            .list_children("")
            .await
            .map_err(|e| SyncError::Scan {
                path: self.storage.name().to_string(),
                message: e.to_string(),
            })?;

        let mut result = ScanResult::default();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        self.accept(root_children, 0, &mut result, &mut queue);

        let workers = self.config.workers.max(1);
        let mut in_flight = FuturesUnordered::new();

        loop {
            if self.is_cancelled() {
                return Err(SyncError::Interrupted(
                    crate::core::transfer::TaskStatus::Canceled,
                ));
            }

            while in_flight.len() < workers {
                let Some((dir, depth)) = queue.pop_front() else {
                    break;
                };
                let storage = self.storage.clone();
                in_flight.push(async move {
                    let listed = storage.list_children(&dir).await;
                    (dir, depth, listed)
                });
            }

            let Some((dir, depth, listed)) = in_flight.next().await else {
                break;
            };

            match listed {
                Ok(children) => self.accept(children, depth + 1, &mut result, &mut queue),
                Err(e) => {
                    warn!("扫描目录失败: {} - {}", dir, e);
                    result.errors.push(PathError {
                        path: dir.clone(),
                        message: e.to_string(),
                    });
                    result.failed_dirs.push(dir);
                }
            }
        }

        info!(
            "扫描完成: {} 个条目, {} 个文件, {} 个错误",
            result.entries.len(),
            result.file_count(),
            result.errors.len()
        );
        Ok(result)
    }

    fn accept(
        &self,
        children: Vec<FileEntry>,
        depth: usize,
        result: &mut ScanResult,
        queue: &mut VecDeque<(String, usize)>,
    ) {
        for entry in children {
            if self.rules.is_ignored(&entry.path, entry.is_dir()) {
                debug!("排除: {}", entry.path);
                continue;
            }

            if entry.is_dir() {
                let descend = !entry.attributes.is_symlink || self.config.follow_symlinks;
                if descend && depth < MAX_DEPTH {
                    queue.push_back((entry.path.clone(), depth));
                } else if descend {
                    warn!("目录层级过深，停止深入: {}", entry.path);
                }
            }
            result.entries.insert(entry.path.clone(), entry);
        }
    }
}
