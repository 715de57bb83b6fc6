//! 远程列表缓存
//!
//! 云端枚举慢且按请求计费，完整的扫描结果在有效期内直接复用。
//! 有扫描错误的结果不缓存；目标端被修改后由引擎清除。

use super::scanner::ScanResult;
use crate::storage::FileEntry;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// 同步的哪一侧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl Side {
    fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Target => "target",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedListing {
    entries: Vec<FileEntry>,
    cached_at: DateTime<Utc>,
    /// 存储配置指纹，配置变化后缓存作废
    fingerprint: String,
}

pub struct ListingCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ListingCache {
    /// `ttl` 为 0 时缓存不生效
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    fn file(&self, job_key: &str, side: Side) -> PathBuf {
        self.dir.join(format!("{}_{}.json", job_key, side.as_str()))
    }

    fn fingerprint(config_json: &str) -> String {
        blake3::hash(config_json.as_bytes()).to_hex()[..16].to_string()
    }

    /// 读取未过期的列表；损坏、过期或配置变化时删除缓存文件
    pub async fn load(&self, job_key: &str, side: Side, config_json: &str) -> Option<ScanResult> {
        if !self.enabled() {
            return None;
        }
        let path = self.file(job_key, side);
        let data = tokio::fs::read(&path).await.ok()?;

        let cached: CachedListing = match serde_json::from_slice(&data) {
            Ok(c) => c,
            Err(e) => {
                debug!("列表缓存损坏 {:?}: {}", path, e);
                let _ = tokio::fs::remove_file(&path).await;
                return None;
            }
        };
        if cached.fingerprint != Self::fingerprint(config_json) {
            info!("存储配置已变化，丢弃列表缓存");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        let age = (Utc::now() - cached.cached_at).to_std().unwrap_or_default();
        if age > self.ttl {
            debug!("列表缓存已过期 ({}s)", age.as_secs());
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        info!(
            "使用 {} 端列表缓存: {} 个条目 ({})",
            side.as_str(),
            cached.entries.len(),
            format_age(age.as_secs())
        );
        let entries: BTreeMap<String, FileEntry> = cached
            .entries
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect();
        Some(ScanResult {
            entries,
            ..ScanResult::default()
        })
    }

    pub async fn save(&self, job_key: &str, side: Side, config_json: &str, scan: &ScanResult) -> Result<()> {
        if !self.enabled() || !scan.errors.is_empty() || !scan.failed_dirs.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let cached = CachedListing {
            entries: scan.entries.values().cloned().collect(),
            cached_at: Utc::now(),
            fingerprint: Self::fingerprint(config_json),
        };
        let path = self.file(job_key, side);
        tokio::fs::write(&path, serde_json::to_vec(&cached)?).await?;
        debug!("已缓存 {} 个条目到 {:?}", cached.entries.len(), path);
        Ok(())
    }

    pub async fn clear(&self, job_key: &str) {
        for side in [Side::Source, Side::Target] {
            let _ = tokio::fs::remove_file(self.file(job_key, side)).await;
        }
    }
}

pub fn format_age(secs: u64) -> String {
    match secs {
        0..=59 => format!("{}秒前", secs),
        60..=3599 => format!("{}分钟前", secs / 60),
        3600..=86399 => format!("{}小时前", secs / 3600),
        _ => format!("{}天前", secs / 86400),
    }
}
