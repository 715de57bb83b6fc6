//! 传输任务持久化：每个任务一行，进程启动时整体加载

use super::transfer::{SourceRef, TaskStatus, TransferTask};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct TransferTaskRow {
    id: String,
    source_ref: String,
    destination_path: String,
    status: String,
    total_bytes: Option<i64>,
    transferred_bytes: i64,
    committed_bytes: i64,
    speed: i64,
    start_time: Option<i64>,
    end_time: Option<i64>,
    is_encrypted: bool,
    temp_path: Option<String>,
    error: Option<String>,
    created_at: i64,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

impl TryFrom<TransferTaskRow> for TransferTask {
    type Error = anyhow::Error;

    fn try_from(row: TransferTaskRow) -> Result<Self> {
        let source_ref: SourceRef = serde_json::from_str(&row.source_ref)?;
        Ok(TransferTask {
            id: row.id,
            source_ref,
            destination_path: row.destination_path,
            status: TaskStatus::from(row.status.as_str()),
            total_bytes: row.total_bytes.map(|v| v as u64),
            transferred_bytes: row.transferred_bytes as u64,
            committed_bytes: row.committed_bytes as u64,
            speed: row.speed as u64,
            start_time: row.start_time.map(from_millis),
            end_time: row.end_time.map(from_millis),
            is_encrypted: row.is_encrypted,
            temp_path: row.temp_path,
            error: row.error,
            created_at: from_millis(row.created_at),
        })
    }
}

/// 任务状态存储
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<SqlitePool>,
}

impl TaskStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 创建或更新任务
    pub async fn upsert(&self, task: &TransferTask) -> Result<()> {
        let source_ref = serde_json::to_string(&task.source_ref)?;
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"INSERT INTO transfer_tasks
               (id, source_ref, destination_path, status, total_bytes, transferred_bytes, committed_bytes,
                speed, start_time, end_time, is_encrypted, temp_path, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   source_ref = excluded.source_ref,
                   status = excluded.status,
                   total_bytes = excluded.total_bytes,
                   transferred_bytes = excluded.transferred_bytes,
                   committed_bytes = excluded.committed_bytes,
                   speed = excluded.speed,
                   start_time = excluded.start_time,
                   end_time = excluded.end_time,
                   temp_path = excluded.temp_path,
                   error = excluded.error,
                   updated_at = excluded.updated_at"#,
        )
        .bind(&task.id)
        .bind(&source_ref)
        .bind(&task.destination_path)
        .bind(task.status.as_str())
        .bind(task.total_bytes.map(|v| v as i64))
        .bind(task.transferred_bytes as i64)
        .bind(task.committed_bytes as i64)
        .bind(task.speed as i64)
        .bind(task.start_time.map(|t| t.timestamp_millis()))
        .bind(task.end_time.map(|t| t.timestamp_millis()))
        .bind(task.is_encrypted)
        .bind(&task.temp_path)
        .bind(&task.error)
        .bind(task.created_at.timestamp_millis())
        .bind(now)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    /// 记录已提交的偏移（分块传输每提交一块调用一次）
    pub async fn update_progress(&self, id: &str, transferred: u64, committed: u64) -> Result<()> {
        sqlx::query(
            "UPDATE transfer_tasks SET transferred_bytes = ?, committed_bytes = ?, updated_at = ? WHERE id = ?",
        )
        .bind(transferred as i64)
        .bind(committed as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// 加载全部任务，无法解析的行跳过
    pub async fn load_all(&self) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query_as::<_, TransferTaskRow>(
            "SELECT id, source_ref, destination_path, status, total_bytes, transferred_bytes, committed_bytes,
                    speed, start_time, end_time, is_encrypted, temp_path, error, created_at
             FROM transfer_tasks ORDER BY created_at",
        )
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                TransferTask::try_from(row)
                    .map_err(|e| tracing::warn!("跳过无法解析的任务记录 {}: {}", id, e))
                    .ok()
            })
            .collect())
    }

    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        let mut removed = 0;
        let mut tx = self.db.begin().await?;
        for id in ids {
            let result = sqlx::query("DELETE FROM transfer_tasks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open_pool(&dir.path().join("tasks.db")).await.unwrap();
        (dir, TaskStore::new(Arc::new(pool)))
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let (_dir, store) = store().await;
        let mut task = TransferTask::new(
            SourceRef::Path {
                storage: "local:/src".into(),
                path: "a/b.txt".into(),
            },
            "a/b.txt",
            Some(10),
            false,
        );
        store.upsert(&task).await.unwrap();

        task.status = TaskStatus::Transferring;
        task.start_time = Some(Utc::now());
        store.upsert(&task).await.unwrap();
        store.update_progress(&task.id, 6, 4).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        let back = &loaded[0];
        assert_eq!(back.id, task.id);
        assert_eq!(back.status, TaskStatus::Transferring);
        assert_eq!(back.source_ref, task.source_ref);
        assert_eq!(back.transferred_bytes, 6);
        assert_eq!(back.committed_bytes, 4);
        assert_eq!(back.total_bytes, Some(10));

        assert_eq!(store.delete(&[task.id.clone()]).await.unwrap(), 1);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_source_ref_roundtrip() {
        let (_dir, store) = store().await;
        let task = TransferTask::new(
            SourceRef::Remote {
                storage: None,
                object_id: "docs/report.pdf".into(),
                url: Some("https://example.com/x".into()),
                url_issued_at: Some(Utc::now()),
            },
            "/tmp/report.pdf",
            None,
            true,
        );
        store.upsert(&task).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded[0].source_ref, task.source_ref);
        assert!(loaded[0].is_encrypted);
        assert_eq!(loaded[0].total_bytes, None);
    }
}
