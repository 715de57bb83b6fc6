//! 比较引擎：判断源和目标的一对条目是否相同
//!
//! 抽样哈希（`samplingRate > 0` 且文件不小于 `samplingMinFileSize`）只读取按文件大小
//! 播种选出的部分块，是有概率漏判的近似比较，默认关闭，需要显式开启。

use super::options::{CompareMethod, HashAlgorithm, SyncOptions};
use crate::error::{SyncError, SyncResult};
use crate::storage::{FileEntry, Storage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// 抽样哈希的块大小
pub const SAMPLE_BLOCK_SIZE: u64 = 64 * 1024;
const COMPARE_BUF_SIZE: usize = 256 * 1024;

/// 可选算法的增量摘要
pub enum Digester {
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
}

impl Digester {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => Digester::Blake3(Box::new(blake3::Hasher::new())),
            HashAlgorithm::Xxh3 => Digester::Xxh3(Box::new(xxhash_rust::xxh3::Xxh3::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Blake3(h) => {
                h.update(data);
            }
            Digester::Xxh3(h) => h.update(data),
        }
    }

    pub fn finalize(&self) -> String {
        match self {
            Digester::Blake3(h) => h.finalize().to_hex().to_string(),
            Digester::Xxh3(h) => format!("{:032x}", h.digest128()),
        }
    }
}

/// 读满缓冲区（直到 EOF），返回读取的字节数
async fn read_full<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// 完整读取并计算摘要
pub async fn digest_reader<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    algorithm: HashAlgorithm,
) -> std::io::Result<(String, u64)> {
    let mut digester = Digester::new(algorithm);
    let mut buf = vec![0u8; COMPARE_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        total += n as u64;
    }
    Ok((digester.finalize(), total))
}

/// 抽样块的索引：首尾块总是包含，其余按文件大小播种随机选择
pub fn sample_blocks(size: u64, rate: f64) -> Vec<u64> {
    let blocks = size.div_ceil(SAMPLE_BLOCK_SIZE).max(1);
    if blocks <= 2 {
        return (0..blocks).collect();
    }
    let wanted = ((blocks as f64 * rate).ceil() as u64).clamp(2, blocks);
    let mut rng = StdRng::seed_from_u64(size);
    let mut picked: Vec<u64> =
        rand::seq::index::sample(&mut rng, (blocks - 2) as usize, (wanted - 2) as usize)
            .into_iter()
            .map(|i| i as u64 + 1)
            .collect();
    picked.push(0);
    picked.push(blocks - 1);
    picked.sort_unstable();
    picked
}

#[derive(Debug, Clone)]
pub struct CompareEngine {
    method: CompareMethod,
    algorithm: HashAlgorithm,
    sampling_rate: f64,
    sampling_min_file_size: u64,
    threshold_seconds: i64,
}

impl CompareEngine {
    pub fn from_options(options: &SyncOptions) -> Self {
        Self {
            method: options.compare_method,
            algorithm: options.hash_algorithm,
            sampling_rate: options.sampling_rate,
            sampling_min_file_size: options.sampling_min_file_size,
            threshold_seconds: options.date_time_threshold_seconds,
        }
    }

    pub fn method(&self) -> CompareMethod {
        self.method
    }

    fn times_equal(&self, a: &FileEntry, b: &FileEntry) -> bool {
        (a.modified_at - b.modified_at).num_seconds().abs() <= self.threshold_seconds
    }

    /// 只靠元数据能得出的结论；需要读取内容时返回 None
    pub fn metadata_equal(&self, a: &FileEntry, b: &FileEntry) -> Option<bool> {
        if a.is_dir() || b.is_dir() {
            return Some(a.is_dir() == b.is_dir());
        }
        match self.method {
            CompareMethod::Size => Some(a.size == b.size),
            CompareMethod::DateTime => Some(self.times_equal(a, b)),
            CompareMethod::DateTimeAndSize => Some(a.size == b.size && self.times_equal(a, b)),
            CompareMethod::Content | CompareMethod::Hash => {
                if a.size != b.size {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }

    /// 比较两个条目，读取失败返回 Comparison 错误
    pub async fn are_equal(
        &self,
        a: &FileEntry,
        source: &dyn Storage,
        b: &FileEntry,
        target: &dyn Storage,
    ) -> SyncResult<bool> {
        if let Some(equal) = self.metadata_equal(a, b) {
            return Ok(equal);
        }
        let result = match self.method {
            CompareMethod::Content => content_equal(source, &a.path, target, &b.path).await,
            _ => {
                let da = self.file_digest(source, a).await;
                let db = self.file_digest(target, b).await;
                match (da, db) {
                    (Ok(da), Ok(db)) => Ok(da == db),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
        };
        result.map_err(|e| SyncError::Comparison {
            path: a.path.clone(),
            message: e.to_string(),
        })
    }

    /// 比较失败时按“不同”处理，宁可多传也不漏传
    pub async fn are_equal_or_assume_different(
        &self,
        a: &FileEntry,
        source: &dyn Storage,
        b: &FileEntry,
        target: &dyn Storage,
    ) -> bool {
        match self.are_equal(a, source, b, target).await {
            Ok(equal) => equal,
            Err(e) => {
                warn!("{}，按不同处理", e);
                false
            }
        }
    }

    /// 文件摘要，大文件按配置抽样
    pub async fn file_digest(&self, storage: &dyn Storage, entry: &FileEntry) -> anyhow::Result<String> {
        if self.sampling_rate > 0.0 && entry.size >= self.sampling_min_file_size {
            debug!("抽样哈希: {} ({} bytes)", entry.path, entry.size);
            return sampled_digest(storage, &entry.path, entry.size, self.algorithm, self.sampling_rate)
                .await;
        }
        let mut reader = storage.open_read(&entry.path, 0).await?;
        Ok(digest_reader(&mut reader, self.algorithm).await?.0)
    }
}

/// 逐字节比较两个文件，遇到第一个差异立即返回
pub async fn content_equal(
    source: &dyn Storage,
    source_path: &str,
    target: &dyn Storage,
    target_path: &str,
) -> anyhow::Result<bool> {
    let mut ra = source.open_read(source_path, 0).await?;
    let mut rb = target.open_read(target_path, 0).await?;
    let mut ba = vec![0u8; COMPARE_BUF_SIZE];
    let mut bb = vec![0u8; COMPARE_BUF_SIZE];
    loop {
        let na = read_full(&mut ra, &mut ba).await?;
        let nb = read_full(&mut rb, &mut bb).await?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// 抽样摘要：文件大小参与计算，选中的块按顺序读取
pub async fn sampled_digest(
    storage: &dyn Storage,
    path: &str,
    size: u64,
    algorithm: HashAlgorithm,
    rate: f64,
) -> anyhow::Result<String> {
    let mut digester = Digester::new(algorithm);
    digester.update(&size.to_le_bytes());
    let mut buf = vec![0u8; SAMPLE_BLOCK_SIZE as usize];
    for block in sample_blocks(size, rate) {
        let offset = block * SAMPLE_BLOCK_SIZE;
        let len = SAMPLE_BLOCK_SIZE.min(size - offset) as usize;
        let mut reader = storage.open_read(path, offset).await?;
        let n = read_full(&mut reader, &mut buf[..len]).await?;
        digester.update(&block.to_le_bytes());
        digester.update(&buf[..n]);
    }
    Ok(digester.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::SyncMode;
    use crate::storage::LocalStorage;
    use chrono::{Duration, Utc};

    fn engine(method: CompareMethod) -> CompareEngine {
        let mut options = SyncOptions::new("/a", "/b", SyncMode::OneWay);
        options.compare_method = method;
        CompareEngine::from_options(&options)
    }

    #[test]
    fn test_metadata_methods() {
        let now = Utc::now();
        let a = FileEntry::file("x", 10, now);
        let same_size_later = FileEntry::file("x", 10, now + Duration::seconds(60));
        let close_time = FileEntry::file("x", 11, now + Duration::seconds(1));

        assert_eq!(engine(CompareMethod::Size).metadata_equal(&a, &same_size_later), Some(true));
        assert_eq!(engine(CompareMethod::DateTime).metadata_equal(&a, &close_time), Some(true));
        assert_eq!(
            engine(CompareMethod::DateTimeAndSize).metadata_equal(&a, &close_time),
            Some(false)
        );
        assert_eq!(
            engine(CompareMethod::DateTimeAndSize).metadata_equal(&a, &same_size_later),
            Some(false)
        );
        assert_eq!(engine(CompareMethod::Content).metadata_equal(&a, &same_size_later), None);
        assert_eq!(engine(CompareMethod::Hash).metadata_equal(&a, &close_time), Some(false));
    }

    #[test]
    fn test_dir_vs_file() {
        let now = Utc::now();
        let d = FileEntry::dir("x", now);
        let f = FileEntry::file("x", 0, now);
        let e = engine(CompareMethod::Size);
        assert_eq!(e.metadata_equal(&d, &d.clone()), Some(true));
        assert_eq!(e.metadata_equal(&d, &f), Some(false));
    }

    #[test]
    fn test_sample_blocks_deterministic() {
        let size = 100 * SAMPLE_BLOCK_SIZE + 5;
        let a = sample_blocks(size, 0.1);
        assert_eq!(a, sample_blocks(size, 0.1));
        assert_eq!(a.first(), Some(&0));
        assert_eq!(a.last(), Some(&100));
        assert_eq!(a.len(), 11);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_blocks(10, 0.5), vec![0]);
    }

    #[tokio::test]
    async fn test_content_and_hash_compare() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("f"), b"hello world").unwrap();
        std::fs::write(dst.path().join("f"), b"hello world").unwrap();
        std::fs::write(dst.path().join("g"), b"hello World").unwrap();
        let s = LocalStorage::new(src.path()).unwrap();
        let d = LocalStorage::new(dst.path()).unwrap();

        let now = Utc::now();
        let a = FileEntry::file("f", 11, now);
        let same = FileEntry::file("f", 11, now - Duration::hours(1));
        let other = FileEntry::file("g", 11, now);

        for method in [CompareMethod::Content, CompareMethod::Hash] {
            let e = engine(method);
            assert!(e.are_equal(&a, &s, &same, &d).await.unwrap());
            assert!(!e.are_equal(&a, &s, &other, &d).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_read_error_assumes_different() {
        let src = tempfile::tempdir().unwrap();
        let s = LocalStorage::new(src.path()).unwrap();
        let now = Utc::now();
        let missing = FileEntry::file("missing", 3, now);
        let e = engine(CompareMethod::Content);

        assert!(matches!(
            e.are_equal(&missing, &s, &missing, &s).await,
            Err(SyncError::Comparison { .. })
        ));
        assert!(!e.are_equal_or_assume_different(&missing, &s, &missing, &s).await);
    }

    #[tokio::test]
    async fn test_sampled_digest_only_reads_sampled_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let size = 40 * SAMPLE_BLOCK_SIZE as usize;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big"), &data).unwrap();
        let s = LocalStorage::new(dir.path()).unwrap();

        let blocks = sample_blocks(size as u64, 0.1);
        let unsampled = (0..40u64).find(|b| !blocks.contains(b)).unwrap();

        let before = sampled_digest(&s, "big", size as u64, HashAlgorithm::Xxh3, 0.1)
            .await
            .unwrap();
        let mut changed = data.clone();
        changed[(unsampled * SAMPLE_BLOCK_SIZE) as usize] ^= 1;
        std::fs::write(dir.path().join("big"), &changed).unwrap();
        let after = sampled_digest(&s, "big", size as u64, HashAlgorithm::Xxh3, 0.1)
            .await
            .unwrap();
        // 抽样之外的修改检测不到：这是抽样比较的已知代价
        assert_eq!(before, after);

        changed[0] ^= 1;
        std::fs::write(dir.path().join("big"), &changed).unwrap();
        let first_changed = sampled_digest(&s, "big", size as u64, HashAlgorithm::Xxh3, 0.1)
            .await
            .unwrap();
        assert_ne!(before, first_changed);
    }
}
