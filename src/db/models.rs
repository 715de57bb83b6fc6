use crate::core::progress::StatisticsSnapshot;
use serde::{Deserialize, Serialize};

/// 存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
}

/// 存储配置（同步源/目标或按需下载的云端命名空间）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            typ: StorageType::Local,
            path: Some(path.into()),
            bucket: None,
            region: None,
            access_key: None,
            secret_key: None,
            endpoint: None,
            prefix: None,
            username: None,
            password: None,
            root: None,
        }
    }
}

/// 一次同步运行的最终状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == RunStatus::Completed
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RunStatus {
    fn from(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "completed_with_errors" => RunStatus::CompletedWithErrors,
            "canceled" => RunStatus::Canceled,
            _ => RunStatus::Failed,
        }
    }
}

/// 运行历史
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub job_key: String,
    pub source_path: String,
    pub target_path: String,
    pub sync_mode: String,
    pub status: RunStatus,
    pub started_at: i64,
    pub finished_at: i64,
    pub statistics: StatisticsSnapshot,
    pub error_summary: Option<String>,
}

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncLogRow {
    pub id: i64,
    pub job_key: String,
    pub source_path: String,
    pub target_path: String,
    pub sync_mode: String,
    pub status: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub files_copied: i64,
    pub files_updated: i64,
    pub files_deleted: i64,
    pub files_skipped: i64,
    pub directories_created: i64,
    pub directories_deleted: i64,
    pub errors: i64,
    pub bytes_processed: i64,
    pub error_summary: Option<String>,
}

impl From<SyncLogRow> for SyncLog {
    fn from(row: SyncLogRow) -> Self {
        SyncLog {
            job_key: row.job_key,
            source_path: row.source_path,
            target_path: row.target_path,
            sync_mode: row.sync_mode,
            status: RunStatus::from(row.status.as_str()),
            started_at: row.started_at,
            finished_at: row.finished_at,
            statistics: StatisticsSnapshot {
                files_copied: row.files_copied as u64,
                files_updated: row.files_updated as u64,
                files_deleted: row.files_deleted as u64,
                files_skipped: row.files_skipped as u64,
                directories_created: row.directories_created as u64,
                directories_deleted: row.directories_deleted as u64,
                errors: row.errors as u64,
                bytes_processed: row.bytes_processed as u64,
            },
            error_summary: row.error_summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_json() {
        let json = r#"{"type":"s3","bucket":"b","region":"us-east-1","accessKey":"ak","secretKey":"sk"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.typ, StorageType::S3);
        assert_eq!(config.access_key.as_deref(), Some("ak"));

        let back = serde_json::to_string(&config).unwrap();
        assert!(back.contains("\"secretKey\":\"sk\""));
        assert!(!back.contains("endpoint"));
    }

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Completed,
            RunStatus::CompletedWithErrors,
            RunStatus::Failed,
            RunStatus::Canceled,
        ] {
            assert_eq!(RunStatus::from(status.as_str()), status);
        }
        assert!(RunStatus::Completed.is_success());
        assert!(!RunStatus::CompletedWithErrors.is_success());
    }
}
