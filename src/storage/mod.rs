pub mod http;
pub mod local;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use http::{HttpSource, UrlExpired};
pub use local::{select_lister, DirLister, LocalStorage, ReadDirLister, WalkDirLister};
pub use remote::RemoteStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 文件属性
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    pub is_dir: bool,
    pub is_hidden: bool,
    pub is_symlink: bool,
    pub is_readonly: bool,
}

/// 一次扫描得到的文件快照，身份是规范化后的相对路径
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub attributes: FileAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            size,
            modified_at,
            attributes: FileAttributes::default(),
            content_hash: None,
        }
    }

    pub fn dir(path: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            size: 0,
            modified_at,
            attributes: FileAttributes {
                is_dir: true,
                ..Default::default()
            },
            content_hash: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.is_dir
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// 规范化路径分隔符（统一使用 /，去掉首尾分隔符和 `.` 段）
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// 拼接相对路径，空的父路径表示根目录
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// 相对路径的父目录（根目录下的条目返回空串）
pub fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// 读取流
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// 写入流。`finish` 之前写入的数据不保证可见
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 把已写入的数据落盘，分块传输用它来提交块边界
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<()>;
}

#[async_trait]
impl<W: ObjectWriter + ?Sized> ObjectWriter for Box<W> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }

    async fn finish(&mut self) -> Result<()> {
        (**self).finish().await
    }
}

#[async_trait]
impl ObjectWriter for Vec<u8> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 存储抽象接口（本地目录或云端命名空间的一个根）
#[async_trait]
pub trait Storage: Send + Sync {
    /// 列出目录的直接子项，`""` 表示根目录
    async fn list_children(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// 获取元数据，不存在返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileEntry>>;

    /// 从 offset 开始读取
    async fn open_read(&self, path: &str, offset: u64) -> Result<ByteReader>;

    /// 打开写入流；尽量从 `resume_from` 续写，返回实际的起始偏移
    async fn open_write(&self, path: &str, resume_from: u64)
        -> Result<(Box<dyn ObjectWriter>, u64)>;

    /// 重命名，目标已存在时覆盖
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 删除文件或目录
    async fn delete(&self, path: &str) -> Result<()>;

    /// 创建目录（包括父目录）
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 设置修改时间，不支持时返回 false
    async fn set_modified(&self, _path: &str, _modified: DateTime<Utc>) -> Result<bool> {
        Ok(false)
    }

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path, 0).await?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;

    fn is_remote(&self) -> bool {
        false
    }
}

/// 下载链接
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// 云端存储额外提供的按需下载能力
#[async_trait]
pub trait DownloadUrlProvider: Send + Sync {
    async fn download_url(&self, object_id: &str) -> Result<DownloadUrl>;

    /// 对象大小（未知时返回 None）
    async fn object_size(&self, _object_id: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// 根据配置创建存储实例；没有远程配置时使用本地目录。
/// `create_if_missing` 为 false 时本地根目录必须已存在
pub async fn open_storage(
    path: &str,
    config: Option<&crate::db::StorageConfig>,
    portable_enumeration: bool,
    create_if_missing: bool,
) -> Result<Arc<dyn Storage>> {
    match config {
        Some(config) if config.typ != crate::db::StorageType::Local => {
            Ok(Arc::new(RemoteStorage::from_config(config).await?) as Arc<dyn Storage>)
        }
        _ => {
            let root = config.and_then(|c| c.path.as_deref()).unwrap_or(path);
            tracing::info!("初始化本地存储: {}", root);
            let lister = select_lister(portable_enumeration);
            let storage = if create_if_missing {
                LocalStorage::with_lister(root, lister)?
            } else {
                LocalStorage::existing(root, lister)?
            };
            Ok(Arc::new(storage) as Arc<dyn Storage>)
        }
    }
}
