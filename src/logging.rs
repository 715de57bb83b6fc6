//! 日志：按大小轮转的文件日志和 tracing 订阅器初始化

use crate::config::{load_section, save_section};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub enabled: bool,
    /// 单个日志文件上限（MB），1..=100
    pub max_size_mb: u32,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 5,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log").unwrap_or_default()
    }

    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        save_section(config_dir, "log", self)
    }

    /// 修改配置，非法的日志级别返回错误
    pub fn apply(
        &mut self,
        enabled: Option<bool>,
        max_size_mb: Option<u32>,
        level: Option<&str>,
    ) -> Result<(), String> {
        if let Some(level) = level {
            let level = level.to_lowercase();
            if !LEVELS.contains(&level.as_str()) {
                return Err(format!("无效的日志级别: {}", level));
            }
            self.level = level;
        }
        if let Some(enabled) = enabled {
            self.enabled = enabled;
        }
        if let Some(size) = max_size_mb {
            self.max_size_mb = size.clamp(1, 100);
        }
        Ok(())
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 超过上限时把 app.log 轮转为 app.log.old
pub struct SizeRotatingWriter {
    path: PathBuf,
    max_size: u64,
    written: u64,
    file: File,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join("app.log");
        let max_size = u64::from(max_size_mb.clamp(1, 100)) * 1024 * 1024;

        let existing = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate(&path)?;
        }
        let file = Self::open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            written,
            file,
        })
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn rotate(path: &Path) -> io::Result<()> {
        let backup = path.with_extension("log.old");
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(path, &backup)
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.max_size && self.written > 0 {
            self.file.flush()?;
            Self::rotate(&self.path)?;
            self.file = Self::open(&self.path)?;
            self.written = 0;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["hyper=warn", "reqwest=warn", "sqlx=warn", "opendal=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }
    filter
}

/// 初始化全局订阅器。返回的 guard 需要保持到进程退出，否则日志可能丢失
pub fn init(log_dir: &Path) -> Option<WorkerGuard> {
    let config = LogConfig::load(log_dir);
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let console = cfg!(debug_assertions).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(io::stderr)
    });

    match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
        Ok(writer) => {
            let (writer, guard) = tracing_appender::non_blocking(writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter(&config))
                .with(file_layer)
                .with(console)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件不可写时退回到标准错误
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter(&config))
                .with_writer(io::stderr)
                .try_init();
            tracing::warn!("无法创建日志文件 {:?}: {}", log_dir, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_validates_level() {
        let mut config = LogConfig::default();
        assert!(config.apply(None, Some(500), Some("DEBUG")).is_ok());
        assert_eq!(config.level, "debug");
        assert_eq!(config.max_size_mb, 100);
        assert!(config.apply(Some(false), None, Some("verbose")).is_err());
        // 失败时不修改其他字段
        assert!(config.enabled);
    }

    #[test]
    fn test_log_config_persisted_under_log_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            enabled: false,
            max_size_mb: 7,
            level: "warn".into(),
        };
        config.save(dir.path()).unwrap();
        assert_eq!(LogConfig::load(dir.path()), config);
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("config.json")).unwrap()).unwrap();
        assert_eq!(raw["log"]["maxSizeMb"], 7);
    }

    #[test]
    fn test_writer_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 300 * 1024];
        for _ in 0..4 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();
        assert!(dir.path().join("app.log.old").exists());
        assert!(fs::metadata(dir.path().join("app.log")).unwrap().len() <= 1024 * 1024);
    }
}
