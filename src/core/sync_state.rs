//! 同步点：上一次两侧一致时每个路径的大小和修改时间，用于双向同步判断哪一侧发生了变化

use crate::storage::FileEntry;
use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    pub path: String,
    pub is_dir: bool,
    pub source_size: u64,
    pub source_mtime: i64,
    pub target_size: u64,
    pub target_mtime: i64,
}

impl SyncPoint {
    pub fn from_entries(path: &str, source: &FileEntry, target: &FileEntry) -> Self {
        Self {
            path: path.to_string(),
            is_dir: source.is_dir(),
            source_size: source.size,
            source_mtime: source.modified_at.timestamp(),
            target_size: target.size,
            target_mtime: target.modified_at.timestamp(),
        }
    }

    fn changed(size: u64, mtime: i64, entry: &FileEntry, threshold: i64) -> bool {
        if entry.is_dir() {
            return false;
        }
        entry.size != size || (entry.modified_at.timestamp() - mtime).abs() > threshold
    }

    /// 源端条目自同步点以来是否变化（目录只看存在与否）
    pub fn source_changed(&self, entry: &FileEntry, threshold: i64) -> bool {
        entry.is_dir() != self.is_dir
            || Self::changed(self.source_size, self.source_mtime, entry, threshold)
    }

    pub fn target_changed(&self, entry: &FileEntry, threshold: i64) -> bool {
        entry.is_dir() != self.is_dir
            || Self::changed(self.target_size, self.target_mtime, entry, threshold)
    }
}

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct SyncPointRow {
    path: String,
    is_dir: bool,
    source_size: i64,
    source_mtime: i64,
    target_size: i64,
    target_mtime: i64,
}

impl From<SyncPointRow> for SyncPoint {
    fn from(row: SyncPointRow) -> Self {
        SyncPoint {
            path: row.path,
            is_dir: row.is_dir,
            source_size: row.source_size as u64,
            source_mtime: row.source_mtime,
            target_size: row.target_size as u64,
            target_mtime: row.target_mtime,
        }
    }
}

/// 同步点存储
pub struct SyncStateStore {
    db: Arc<SqlitePool>,
}

impl SyncStateStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// 加载作业的全部同步点（以路径为键）
    pub async fn load(&self, job_key: &str) -> Result<HashMap<String, SyncPoint>> {
        let rows = sqlx::query_as::<_, SyncPointRow>(
            "SELECT path, is_dir, source_size, source_mtime, target_size, target_mtime
             FROM sync_points WHERE job_key = ?",
        )
        .bind(job_key)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let point: SyncPoint = r.into();
                (point.path.clone(), point)
            })
            .collect())
    }

    /// 批量写入和删除，在一个事务里完成
    pub async fn apply(&self, job_key: &str, upserts: &[SyncPoint], removals: &[String]) -> Result<()> {
        if upserts.is_empty() && removals.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.db.begin().await?;

        for point in upserts {
            sqlx::query(
                r#"INSERT INTO sync_points (job_key, path, is_dir, source_size, source_mtime, target_size, target_mtime, synced_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                   ON CONFLICT(job_key, path) DO UPDATE SET
                       is_dir = excluded.is_dir,
                       source_size = excluded.source_size,
                       source_mtime = excluded.source_mtime,
                       target_size = excluded.target_size,
                       target_mtime = excluded.target_mtime,
                       synced_at = excluded.synced_at"#,
            )
            .bind(job_key)
            .bind(&point.path)
            .bind(point.is_dir)
            .bind(point.source_size as i64)
            .bind(point.source_mtime)
            .bind(point.target_size as i64)
            .bind(point.target_mtime)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        for path in removals {
            sqlx::query("DELETE FROM sync_points WHERE job_key = ? AND path = ?")
                .bind(job_key)
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!("同步点已更新: {} 条写入, {} 条删除", upserts.len(), removals.len());
        Ok(())
    }

    /// 删除作业的所有同步点
    pub async fn clear(&self, job_key: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sync_points WHERE job_key = ?")
            .bind(job_key)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_change_detection() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let src = FileEntry::file("a", 10, t);
        let dst = FileEntry::file("a", 10, t);
        let point = SyncPoint::from_entries("a", &src, &dst);

        assert!(!point.source_changed(&src, 2));
        let touched = FileEntry::file("a", 10, t + chrono::Duration::seconds(1));
        assert!(!point.source_changed(&touched, 2));
        let edited = FileEntry::file("a", 11, t);
        assert!(point.target_changed(&edited, 2));
        let dir = FileEntry::dir("a", t);
        assert!(point.source_changed(&dir, 2));
    }

    #[tokio::test]
    async fn test_apply_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::open_pool(&dir.path().join("s.db")).await.unwrap();
        let store = SyncStateStore::new(Arc::new(pool));

        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let e = FileEntry::file("x/y.txt", 5, t);
        let p1 = SyncPoint::from_entries("x/y.txt", &e, &e);
        let p2 = SyncPoint::from_entries("z", &e, &e);
        store.apply("job", &[p1.clone(), p2], &[]).await.unwrap();

        let loaded = store.load("job").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["x/y.txt"], p1);

        store.apply("job", &[], &["z".to_string()]).await.unwrap();
        assert_eq!(store.load("job").await.unwrap().len(), 1);
        assert!(store.load("other").await.unwrap().is_empty());
        assert_eq!(store.clear("job").await.unwrap(), 1);
    }
}
