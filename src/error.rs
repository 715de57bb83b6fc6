//! 错误分类
//!
//! 扫描与比较错误不会中止同步；配置错误总是在任何传输开始前中止；
//! 传输错误只有在 `continueOnError = false` 时才会中止整个运行。

use crate::core::transfer::TaskStatus;
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("扫描失败 '{path}': {message}")]
    Scan { path: String, message: String },

    #[error("比较失败 '{path}': {message}")]
    Comparison { path: String, message: String },

    #[error("传输失败 '{path}': {message}")]
    Transfer { path: String, message: String },

    #[error("校验失败 '{path}': 摘要不匹配")]
    Verification { path: String },

    #[error("任务 {id} 不能从 {from} 转换到 {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 传输循环观察到暂停或取消
    #[error("传输被中断: {0}")]
    Interrupted(TaskStatus),

    #[error("加密/压缩管道错误: {0}")]
    Pipeline(String),

    #[error("存储错误: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// 是否值得重试（配置错误和状态机错误重试也不会成功）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transfer { .. }
                | SyncError::Verification { .. }
                | SyncError::Storage(_)
                | SyncError::Io(_)
        )
    }

    pub fn transfer(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SyncError::Transfer {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
