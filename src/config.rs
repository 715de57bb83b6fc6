//! 进程级配置：`config.json` 中按键分节保存（`engine`、`log`）

use crate::core::transfer::ExecutorConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";
const APP_DIR: &str = "syncengine";

/// 读取 config.json 中的一节，文件不存在或内容无效时返回 None
pub fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join(CONFIG_FILE)).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content).ok()?;
    serde_json::from_value(config.get(key)?.clone()).ok()
}

/// 更新 config.json 中的一节，保留其他内容
pub fn save_section<T: Serialize>(config_dir: &Path, key: &str, value: &T) -> io::Result<()> {
    fs::create_dir_all(config_dir)?;
    let file = config_dir.join(CONFIG_FILE);
    let mut config = fs::read_to_string(&file)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| serde_json::json!({}));

    config[key] = serde_json::to_value(value).map_err(io::Error::other)?;
    let content = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
    fs::write(&file, content)
}

/// 默认配置目录：系统配置目录下的 syncengine
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)))
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// 自定义数据目录（数据库、日志、缓存）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    pub max_parallel_transfers: usize,
    /// 字节/秒，0 表示不限速
    pub download_speed_limit: u64,
    pub completed_retention: usize,
    pub url_staleness_secs: u64,
    /// 云端列表缓存有效期（秒），0 表示关闭
    pub remote_listing_ttl: u64,
    /// 强制使用可移植的目录枚举
    pub portable_enumeration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            max_parallel_transfers: 4,
            download_speed_limit: 0,
            completed_retention: 1000,
            url_staleness_secs: 300,
            remote_listing_ttl: 0,
            portable_enumeration: false,
        }
    }
}

impl EngineConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "engine").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "engine", self)
    }

    /// 实际使用的数据目录：自定义路径存在时优先
    pub fn data_dir(&self, default_dir: &Path) -> PathBuf {
        self.data_path
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .inspect(|p| tracing::debug!("使用自定义数据路径: {:?}", p))
            .unwrap_or_else(|| default_dir.to_path_buf())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_parallel: self.max_parallel_transfers.max(1),
            speed_limit: self.download_speed_limit,
            completed_retention: self.completed_retention,
            url_staleness: Duration::from_secs(self.url_staleness_secs),
        }
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.remote_listing_ttl)
    }
}

/// 解析数据目录：先读默认目录下的配置，再应用 dataPath
pub fn resolve_data_dir() -> PathBuf {
    let default_dir = default_config_dir();
    EngineConfig::load(&default_dir).data_dir(&default_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(EngineConfig::load(dir.path()), EngineConfig::default());
    }

    #[test]
    fn test_sections_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            download_speed_limit: 1024,
            remote_listing_ttl: 60,
            ..EngineConfig::default()
        };
        config.save(dir.path()).unwrap();
        save_section(dir.path(), "other", &serde_json::json!({"x": 1})).unwrap();

        assert_eq!(EngineConfig::load(dir.path()), config);
        let other: serde_json::Value = load_section(dir.path(), "other").unwrap();
        assert_eq!(other["x"], 1);
        assert_eq!(config.executor_config().speed_limit, 1024);
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "not json").unwrap();
        assert_eq!(EngineConfig::load(dir.path()), EngineConfig::default());
        // 保存会覆盖损坏的文件
        EngineConfig::default().save(dir.path()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()), EngineConfig::default());
    }

    #[test]
    fn test_data_dir_override_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let default_dir = PathBuf::from("/nonexistent/default");
        let config = EngineConfig {
            data_path: Some(dir.path().to_string_lossy().into_owned()),
            ..EngineConfig::default()
        };
        assert_eq!(config.data_dir(&default_dir), dir.path());

        let missing = EngineConfig {
            data_path: Some("/nonexistent/custom".into()),
            ..EngineConfig::default()
        };
        assert_eq!(missing.data_dir(&default_dir), default_dir);
    }
}
