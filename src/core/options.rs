//! 单次同步运行的配置（JSON 字段名稳定，可以原样保存和加载）

use super::chunker::ChunkerParams;
use super::ignore::IgnoreRules;
use crate::db::StorageConfig;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::{AlgorithmConfig, EncryptionOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 回收站目录（位于目标根目录下）
pub const RECYCLE_DIR: &str = ".synctrash";

/// 平均块大小上限（MB）
pub const MAX_CHUNK_SIZE_MB: u64 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// 单向：源为准，目标多余的文件保留
    #[default]
    OneWay,
    /// 镜像：源为准，删除目标多余的文件
    Mirror,
    /// 双向：两边的修改都会传播
    TwoWay,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareMethod {
    Size,
    DateTime,
    #[default]
    DateTimeAndSize,
    Content,
    Hash,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Xxh3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    SourceWins,
    TargetWins,
    KeepBoth,
    Skip,
    #[default]
    Newer,
    Older,
    Larger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    pub source_path: String,
    pub target_path: String,
    pub sync_mode: SyncMode,
    pub compare_method: CompareMethod,
    pub hash_algorithm: HashAlgorithm,
    /// 大文件抽样哈希的比例，0 表示关闭抽样（完整哈希）
    pub sampling_rate: f64,
    pub sampling_min_file_size: u64,
    pub date_time_threshold_seconds: i64,
    pub ignore_patterns: Vec<String>,
    pub max_parallel_operations: usize,
    #[serde(rename = "chunkSizeMB")]
    pub chunk_size_mb: u64,
    pub conflict_resolution: ConflictResolution,
    pub max_retries: u32,
    pub continue_on_error: bool,
    pub use_recycle_bin: bool,
    pub preserve_file_time: bool,
    pub verify_after_copy: bool,
    pub temp_file_suffix: String,
    pub follow_symlinks: bool,
    pub scan_workers: usize,
    pub retry_base_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_storage: Option<StorageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_storage: Option<StorageConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionOptions>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            source_path: String::new(),
            target_path: String::new(),
            sync_mode: SyncMode::OneWay,
            compare_method: CompareMethod::DateTimeAndSize,
            hash_algorithm: HashAlgorithm::Blake3,
            sampling_rate: 0.0,
            sampling_min_file_size: 64 * 1024 * 1024,
            date_time_threshold_seconds: 2,
            ignore_patterns: Vec::new(),
            max_parallel_operations: 4,
            chunk_size_mb: 0,
            conflict_resolution: ConflictResolution::Newer,
            max_retries: 3,
            continue_on_error: true,
            use_recycle_bin: false,
            preserve_file_time: true,
            verify_after_copy: false,
            temp_file_suffix: ".synctmp".to_string(),
            follow_symlinks: false,
            scan_workers: 8,
            retry_base_delay_ms: 500,
            source_storage: None,
            target_storage: None,
            encryption: None,
        }
    }
}

impl SyncOptions {
    pub fn new(source: impl Into<String>, target: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            source_path: source.into(),
            target_path: target.into(),
            sync_mode: mode,
            ..Default::default()
        }
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::Configuration(format!("解析配置文件失败 {:?}: {}", path, e)))
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Configuration(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 在任何传输开始前校验配置
    pub fn validate(&self) -> SyncResult<()> {
        let fail = |msg: String| Err(SyncError::Configuration(msg));

        if self.source_path.trim().is_empty() && self.source_storage.is_none() {
            return fail("sourcePath 不能为空".into());
        }
        if self.target_path.trim().is_empty() && self.target_storage.is_none() {
            return fail("targetPath 不能为空".into());
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) || self.sampling_rate.is_nan() {
            return fail(format!("samplingRate 必须在 [0, 1] 之间: {}", self.sampling_rate));
        }
        if self.date_time_threshold_seconds < 0 {
            return fail("dateTimeThresholdSeconds 不能为负数".into());
        }
        if self.max_parallel_operations == 0 {
            return fail("maxParallelOperations 至少为 1".into());
        }
        if self.scan_workers == 0 {
            return fail("scanWorkers 至少为 1".into());
        }
        if self.temp_file_suffix.is_empty()
            || self.temp_file_suffix.contains('/')
            || self.temp_file_suffix.contains('\\')
        {
            return fail(format!("无效的 tempFileSuffix: {:?}", self.temp_file_suffix));
        }
        if self.chunk_size_mb > MAX_CHUNK_SIZE_MB {
            return fail(format!(
                "chunkSizeMB 不能超过 {}，当前为 {}",
                MAX_CHUNK_SIZE_MB, self.chunk_size_mb
            ));
        }
        if let Some(enc) = &self.encryption {
            // 编码后的大小与明文不同，只能按修改时间比较
            if self.compare_method != CompareMethod::DateTime {
                return fail(format!(
                    "启用加密时 compareMethod 只能为 DateTime，当前为 {:?}",
                    self.compare_method
                ));
            }
            if self.sync_mode == SyncMode::TwoWay {
                return fail("加密同步不支持 TwoWay 模式".into());
            }
            AlgorithmConfig::from_options(enc)?;
        }
        self.ignore_rules()?;
        Ok(())
    }

    /// 作业标识：源和目标路径决定同步点的归属
    pub fn job_key(&self) -> String {
        let hash = blake3::hash(format!("{}|{}", self.source_path, self.target_path).as_bytes());
        hash.to_hex()[..16].to_string()
    }

    /// 忽略规则，总是排除临时文件和回收站
    pub fn ignore_rules(&self) -> SyncResult<IgnoreRules> {
        let mut patterns = self.ignore_patterns.clone();
        patterns.push(format!("*{}*", self.temp_file_suffix));
        patterns.push(format!("/{}/", RECYCLE_DIR));
        IgnoreRules::new(&patterns)
    }

    /// 分块传输参数，chunkSizeMB = 0 时关闭
    pub fn chunker_params(&self) -> Option<ChunkerParams> {
        (self.chunk_size_mb > 0)
            .then(|| ChunkerParams::with_average(self.chunk_size_mb.saturating_mul(1024 * 1024)))
    }

    pub fn algorithm(&self) -> SyncResult<Option<AlgorithmConfig>> {
        self.encryption
            .as_ref()
            .map(AlgorithmConfig::from_options)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CipherKind, CompressionKind};

    #[test]
    fn test_defaults_from_empty_json() {
        let options: SyncOptions =
            serde_json::from_str(r#"{"sourcePath":"/a","targetPath":"/b"}"#).unwrap();
        assert_eq!(options.sync_mode, SyncMode::OneWay);
        assert_eq!(options.compare_method, CompareMethod::DateTimeAndSize);
        assert_eq!(options.sampling_rate, 0.0);
        assert_eq!(options.temp_file_suffix, ".synctmp");
        assert!(options.continue_on_error);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_json_field_names_are_stable() {
        let options = SyncOptions {
            chunk_size_mb: 4,
            ..SyncOptions::new("/a", "/b", SyncMode::Mirror)
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["chunkSizeMB"], 4);
        assert_eq!(json["syncMode"], "Mirror");
        assert_eq!(json["dateTimeThresholdSeconds"], 2);
        assert!(json.get("encryption").is_none());

        let back: SyncOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back.chunk_size_mb, 4);
        assert_eq!(back.sync_mode, SyncMode::Mirror);
    }

    #[test]
    fn test_validation_errors() {
        let base = SyncOptions::new("/a", "/b", SyncMode::OneWay);

        let mut o = base.clone();
        o.source_path.clear();
        assert!(matches!(o.validate(), Err(SyncError::Configuration(_))));

        let mut o = base.clone();
        o.sampling_rate = 1.5;
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.max_parallel_operations = 0;
        assert!(o.validate().is_err());

        let mut o = base.clone();
        o.temp_file_suffix = "a/b".into();
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_encryption_requires_datetime_compare() {
        let mut o = SyncOptions::new("/a", "/b", SyncMode::OneWay);
        o.encryption = Some(EncryptionOptions {
            compression: CompressionKind::Lz4,
            cipher: CipherKind::Aes256Gcm,
            passphrase: "pw".into(),
            zstd_level: 3,
            encrypt_names: false,
        });
        assert!(o.validate().is_err());
        o.compare_method = CompareMethod::DateTime;
        assert!(o.validate().is_ok());
        assert!(o.algorithm().unwrap().is_some());
    }

    #[test]
    fn test_job_key_and_ignore_rules() {
        let a = SyncOptions::new("/a", "/b", SyncMode::OneWay);
        let b = SyncOptions::new("/a", "/c", SyncMode::OneWay);
        assert_eq!(a.job_key().len(), 16);
        assert_ne!(a.job_key(), b.job_key());

        let rules = a.ignore_rules().unwrap();
        assert!(rules.is_ignored("x/file.txt.synctmp0a1b", false));
        assert!(rules.is_ignored(".synctrash", true));
        assert!(!rules.is_ignored("file.txt", false));
    }

    #[test]
    fn test_chunker_params() {
        let mut o = SyncOptions::new("/a", "/b", SyncMode::OneWay);
        assert!(o.chunker_params().is_none());
        o.chunk_size_mb = 1;
        let p = o.chunker_params().unwrap();
        assert_eq!(p.average_size, 1024 * 1024);
        assert_eq!(p.min_size, 256 * 1024);
        assert_eq!(p.max_size, 4 * 1024 * 1024);

        o.chunk_size_mb = MAX_CHUNK_SIZE_MB;
        assert!(o.validate().is_ok());
        o.chunk_size_mb = MAX_CHUNK_SIZE_MB + 1;
        assert!(matches!(o.validate(), Err(SyncError::Configuration(_))));

        // 未校验的极端值不会溢出
        o.chunk_size_mb = u64::MAX;
        let p = o.chunker_params().unwrap();
        assert_eq!(p.average_size, u64::MAX);
        assert_eq!(p.max_size, u64::MAX);
    }

    #[test]
    fn test_encryption_rejects_two_way() {
        let mut o = SyncOptions::new("/a", "/b", SyncMode::TwoWay);
        o.compare_method = CompareMethod::DateTime;
        o.encryption = Some(EncryptionOptions {
            compression: CompressionKind::None,
            cipher: CipherKind::ChaCha20Poly1305,
            passphrase: "pw".into(),
            zstd_level: 3,
            encrypt_names: false,
        });
        assert!(matches!(o.validate(), Err(SyncError::Configuration(_))));
        o.sync_mode = SyncMode::Mirror;
        assert!(o.validate().is_ok());
    }
}
