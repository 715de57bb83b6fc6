use super::{normalize_path, ByteReader, FileAttributes, FileEntry, ObjectWriter, Storage};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 目录枚举得到的原始条目
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: SystemTime,
    pub readonly: bool,
}

/// 平台目录枚举接口，只列出直接子项
pub trait DirLister: Send + Sync {
    fn list(&self, dir: &Path) -> io::Result<Vec<RawEntry>>;

    fn kind(&self) -> &'static str;
}

/// 基于 read_dir 的原生枚举：文件类型直接取自目录项，不额外 stat
pub struct ReadDirLister;

impl DirLister for ReadDirLister {
    fn list(&self, dir: &Path) -> io::Result<Vec<RawEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("读取目录项失败: {:?} - {}", dir, e);
                    continue;
                }
            };
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    warn!("获取文件类型失败: {:?} - {}", entry.path(), e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_symlink = file_type.is_symlink();
            let metadata = if is_symlink {
                std::fs::metadata(entry.path())
            } else {
                entry.metadata()
            };
            entries.push(raw_entry(name, is_symlink, file_type.is_dir(), metadata));
        }
        Ok(entries)
    }

    fn kind(&self) -> &'static str {
        "read_dir"
    }
}

/// 可移植的后备实现（walkdir，深度 1）
pub struct WalkDirLister;

impl DirLister for WalkDirLister {
    fn list(&self, dir: &Path) -> io::Result<Vec<RawEntry>> {
        // walkdir 在根目录不可读时只会产生一个错误条目，这里先显式检查
        std::fs::read_dir(dir)?;

        let mut entries = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("读取目录项失败: {:?} - {}", dir, e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_symlink = entry.path_is_symlink();
            let metadata = if is_symlink {
                std::fs::metadata(entry.path())
            } else {
                entry.metadata().map_err(io::Error::from)
            };
            entries.push(raw_entry(name, is_symlink, entry.file_type().is_dir(), metadata));
        }
        Ok(entries)
    }

    fn kind(&self) -> &'static str {
        "walkdir"
    }
}

fn raw_entry(
    name: String,
    is_symlink: bool,
    is_dir_hint: bool,
    metadata: io::Result<std::fs::Metadata>,
) -> RawEntry {
    match metadata {
        Ok(meta) => RawEntry {
            name,
            is_dir: meta.is_dir(),
            is_symlink,
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            readonly: meta.permissions().readonly(),
        },
        // 断开的符号链接：记录下来但没有内容
        Err(_) => RawEntry {
            name,
            is_dir: is_dir_hint,
            is_symlink,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            readonly: false,
        },
    }
}

/// 启动时选择一次枚举实现
pub fn select_lister(prefer_portable: bool) -> Arc<dyn DirLister> {
    if prefer_portable {
        debug!("使用可移植目录枚举 (walkdir)");
        return Arc::new(WalkDirLister);
    }
    match std::fs::read_dir(std::env::temp_dir()) {
        Ok(_) => Arc::new(ReadDirLister),
        Err(e) => {
            warn!("原生目录枚举不可用，回退到 walkdir: {}", e);
            Arc::new(WalkDirLister)
        }
    }
}

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
    lister: Arc<dyn DirLister>,
}

impl LocalStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_lister(path, Arc::new(ReadDirLister))
    }

    /// 根目录不存在时创建
    pub fn with_lister(path: impl AsRef<Path>, lister: Arc<dyn DirLister>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        Self::existing(base_path, lister)
    }

    /// 打开已存在的根目录，不存在或不是目录时报错
    pub fn existing(path: impl AsRef<Path>, lister: Arc<dyn DirLister>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.is_dir() {
            bail!("根目录不存在或不是目录: {}", base_path.display());
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            name,
            lister,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Ok(self.base_path.clone());
        }
        let relative = Path::new(&path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("非法的相对路径: {}", path);
        }
        Ok(self.base_path.join(relative))
    }

    fn to_entry(path: String, raw: &RawEntry) -> FileEntry {
        let is_hidden = raw.name.starts_with('.');
        FileEntry {
            path,
            size: raw.size,
            modified_at: DateTime::<Utc>::from(raw.modified),
            attributes: FileAttributes {
                is_dir: raw.is_dir,
                is_hidden,
                is_symlink: raw.is_symlink,
                is_readonly: raw.readonly,
            },
            content_hash: None,
        }
    }
}

struct LocalWriter {
    inner: BufWriter<fs::File>,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        self.inner.get_ref().sync_data().await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.inner.flush().await?;
        self.inner.get_ref().sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve_path(path)?;
        let lister = self.lister.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let raw = tokio::task::spawn_blocking(move || lister.list(&dir)).await??;

        let parent = normalize_path(path);
        Ok(raw
            .iter()
            .map(|r| Self::to_entry(super::join_path(&parent, &r.name), r))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        let full_path = self.resolve_path(path)?;

        let link_meta = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let is_symlink = link_meta.file_type().is_symlink();
        let metadata = if is_symlink {
            fs::metadata(&full_path).await
        } else {
            Ok(link_meta)
        };

        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = raw_entry(name, is_symlink, false, metadata);
        Ok(Some(Self::to_entry(normalize_path(path), &raw)))
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<ByteReader> {
        let mut file = fs::File::open(self.resolve_path(path)?).await?;
        if offset > 0 {
            file.seek(io::SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(file))
    }

    async fn open_write(
        &self,
        path: &str,
        resume_from: u64,
    ) -> Result<(Box<dyn ObjectWriter>, u64)> {
        let full_path = self.resolve_path(path)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let existing = match fs::metadata(&full_path).await {
            Ok(m) => m.len(),
            Err(_) => 0,
        };

        let (file, start) = if resume_from > 0 && existing > 0 {
            // 截断到已提交的偏移，丢弃可能写了一半的尾部
            let start = resume_from.min(existing);
            let mut file = fs::OpenOptions::new().write(true).open(&full_path).await?;
            file.set_len(start).await?;
            file.seek(io::SeekFrom::Start(start)).await?;
            (file, start)
        } else {
            (fs::File::create(&full_path).await?, 0)
        };

        let writer = LocalWriter {
            inner: BufWriter::with_capacity(1024 * 1024, file),
        };
        Ok((Box::new(writer), start))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve_path(from)?;
        let to = self.resolve_path(to)?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::metadata(&to).await.map(|m| m.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&to).await?;
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }

        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::create_dir_all(&full_path).await?;
        Ok(())
    }

    async fn set_modified(&self, path: &str, modified: DateTime<Utc>) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        let time = filetime::FileTime::from_unix_time(
            modified.timestamp(),
            modified.timestamp_subsec_nanos(),
        );
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&full_path, time)).await??;
        Ok(true)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn listers() -> Vec<Arc<dyn DirLister>> {
        vec![Arc::new(ReadDirLister), Arc::new(WalkDirLister)]
    }

    #[test]
    fn test_existing_requires_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(LocalStorage::existing(&missing, Arc::new(ReadDirLister)).is_err());
        assert!(!missing.exists());
        assert!(LocalStorage::with_lister(&missing, Arc::new(ReadDirLister)).is_ok());
        assert!(missing.is_dir());
    }

    #[tokio::test]
    async fn test_listers_agree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        for lister in listers() {
            let storage = LocalStorage::with_lister(dir.path(), lister.clone()).unwrap();
            let mut entries = storage.list_children("").await.unwrap();
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            let names: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
            assert_eq!(names, vec![".hidden", "a.txt", "sub"], "{}", lister.kind());
            assert!(entries[0].attributes.is_hidden);
            assert_eq!(entries[1].size, 3);
            assert!(entries[2].is_dir());
        }
    }

    #[tokio::test]
    async fn test_list_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        for lister in listers() {
            let storage = LocalStorage::with_lister(dir.path(), lister).unwrap();
            assert!(storage.list_children("nope").await.is_err());
        }
    }

    #[tokio::test]
    async fn test_resume_write_truncates_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        let (mut w, start) = storage.open_write("f.tmp", 0).await.unwrap();
        assert_eq!(start, 0);
        w.write(b"0123456789").await.unwrap();
        w.finish().await.unwrap();

        let (mut w, start) = storage.open_write("f.tmp", 4).await.unwrap();
        assert_eq!(start, 4);
        w.write(b"ab").await.unwrap();
        w.finish().await.unwrap();

        assert_eq!(storage.read("f.tmp").await.unwrap(), b"0123ab");
    }

    #[tokio::test]
    async fn test_open_read_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello world").unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let mut r = storage.open_read("f", 6).await.unwrap();
        let mut buf = String::new();
        r.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "world");
    }

    #[tokio::test]
    async fn test_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        assert!(storage.stat("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_set_modified_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let when = DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        assert!(storage.set_modified("f", when).await.unwrap());
        let entry = storage.stat("f").await.unwrap().unwrap();
        assert_eq!(entry.modified_at.timestamp(), 1_600_000_000);
    }
}
