pub mod models;
pub use models::*;

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
pub use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

/// 打开（必要时创建）状态数据库并执行迁移
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool> {
    // SQLite 连接字符串格式: sqlite:path，Windows 路径需要转换反斜杠
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid database path"))?
        .replace('\\', "/");

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // SQLite 单文件，不需要太多连接
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

impl SyncLog {
    /// 写入一条运行历史
    pub async fn save(&self, pool: &SqlitePool) -> Result<i64> {
        let stats = &self.statistics;
        let result = sqlx::query(
            r#"
            INSERT INTO sync_logs (job_key, source_path, target_path, sync_mode, status,
                started_at, finished_at, files_copied, files_updated, files_deleted, files_skipped,
                directories_created, directories_deleted, errors, bytes_processed, error_summary)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.job_key)
        .bind(&self.source_path)
        .bind(&self.target_path)
        .bind(&self.sync_mode)
        .bind(self.status.as_str())
        .bind(self.started_at)
        .bind(self.finished_at)
        .bind(stats.files_copied as i64)
        .bind(stats.files_updated as i64)
        .bind(stats.files_deleted as i64)
        .bind(stats.files_skipped as i64)
        .bind(stats.directories_created as i64)
        .bind(stats.directories_deleted as i64)
        .bind(stats.errors as i64)
        .bind(stats.bytes_processed as i64)
        .bind(&self.error_summary)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 最近的运行历史（新的在前）
    pub async fn load_recent(pool: &SqlitePool, job_key: &str, limit: i64) -> Result<Vec<SyncLog>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            "SELECT * FROM sync_logs WHERE job_key = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(job_key)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(SyncLog::from).collect())
    }
}
