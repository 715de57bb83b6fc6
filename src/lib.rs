use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod storage;

pub use config::EngineConfig;
pub use crate::core::{SyncEngine, SyncOptions, SyncReport, TransferExecutor};
pub use db::models::{StorageConfig, StorageType};
pub use error::{SyncError, SyncResult};

/// 进程内共享的状态
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub executor: Arc<TransferExecutor>,
    pub engine: Arc<SyncEngine>,
    pub config_dir: PathBuf,
    pub config: EngineConfig,
}

impl AppState {
    /// 使用默认数据目录（可被配置中的 dataPath 覆盖）
    pub async fn new() -> anyhow::Result<Self> {
        let default_dir = config::default_config_dir();
        std::fs::create_dir_all(&default_dir)?;
        let config_dir = EngineConfig::load(&default_dir).data_dir(&default_dir);
        Self::with_dir(&config_dir).await
    }

    /// 在指定目录下打开数据库和缓存
    pub async fn with_dir(config_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let config = EngineConfig::load(config_dir);

        let db = Arc::new(db::open_pool(&config_dir.join("syncengine.db")).await?);
        let store = crate::core::TaskStore::new(db.clone());
        let executor = Arc::new(TransferExecutor::new(config.executor_config(), Some(store))?);

        let recovered = executor.recover().await?;
        if recovered > 0 {
            tracing::info!("已加载 {} 个传输任务", recovered);
        }

        let engine = Arc::new(
            SyncEngine::new(db.clone(), executor.clone())
                .with_listing_cache(config_dir.join("cache"), config.listing_ttl())
                .with_portable_enumeration(config.portable_enumeration),
        );

        Ok(Self {
            db,
            executor,
            engine,
            config_dir: config_dir.to_path_buf(),
            config,
        })
    }

    /// 清理资源（进程退出前调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理资源...");
        self.engine.cancel();

        tracing::debug!("关闭数据库连接池...");
        self.db.close().await;
        tracing::info!("资源清理完成");
    }
}
