use super::{
    normalize_path, ByteReader, DownloadUrl, DownloadUrlProvider, FileAttributes, FileEntry,
    ObjectWriter, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::db::{StorageConfig, StorageType};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use opendal::{layers::TimeoutLayer, ErrorKind, Operator};
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

/// 远程读取的单次请求大小
const READ_BLOCK: u64 = 1024 * 1024;
/// 预签名下载链接的有效期
const PRESIGN_TTL_SECS: u64 = 3600;

/// 基于 opendal 的云端命名空间（S3 / WebDAV）
pub struct RemoteStorage {
    operator: Operator,
    name: String,
    /// WebDAV 写入前需要逐级创建父目录
    create_parents: bool,
}

impl RemoteStorage {
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.typ {
            StorageType::S3 => {
                let bucket = config
                    .bucket
                    .as_ref()
                    .ok_or_else(|| anyhow!("S3 storage requires bucket"))?;
                let region = config
                    .region
                    .as_ref()
                    .ok_or_else(|| anyhow!("S3 storage requires region"))?;
                let access_key = config
                    .access_key
                    .as_ref()
                    .ok_or_else(|| anyhow!("S3 storage requires accessKey"))?;
                let secret_key = config
                    .secret_key
                    .as_ref()
                    .ok_or_else(|| anyhow!("S3 storage requires secretKey"))?;
                tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
                Self::s3(
                    bucket,
                    region,
                    access_key,
                    secret_key,
                    config.endpoint.clone(),
                    config.prefix.clone(),
                )
            }
            StorageType::WebDav => {
                let endpoint = config
                    .endpoint
                    .as_ref()
                    .ok_or_else(|| anyhow!("WebDAV storage requires endpoint"))?;
                let username = config
                    .username
                    .as_ref()
                    .ok_or_else(|| anyhow!("WebDAV storage requires username"))?;
                let password = config
                    .password
                    .as_ref()
                    .ok_or_else(|| anyhow!("WebDAV storage requires password"))?;
                tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
                Self::webdav(endpoint, username, password, config.root.clone()).await
            }
            StorageType::Local => Err(anyhow!("本地存储不能作为远程存储打开")),
        }
    }

    pub fn s3(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            name,
            create_parents: false,
        })
    }

    pub async fn webdav(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Self::with_timeouts(Operator::new(builder)?.finish());

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        // 某些 WebDAV 服务器需要先创建根目录，目录可能已存在
        let _ = operator.create_dir("/").await;

        Ok(Self {
            operator,
            name,
            create_parents: true,
        })
    }

    fn with_timeouts(operator: Operator) -> Operator {
        operator.layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        )
    }

    fn dir_path(path: &str) -> String {
        let path = normalize_path(path);
        if path.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", path)
        }
    }

    fn to_entry(path: String, meta: &opendal::Metadata) -> FileEntry {
        let name = path.rsplit('/').next().unwrap_or(&path);
        FileEntry {
            attributes: FileAttributes {
                is_dir: meta.is_dir(),
                is_hidden: name.starts_with('.'),
                ..Default::default()
            },
            size: if meta.is_dir() { 0 } else { meta.content_length() },
            modified_at: meta.last_modified().unwrap_or(DateTime::UNIX_EPOCH),
            content_hash: meta.etag().map(|s| s.trim_matches('"').to_string()),
            path,
        }
    }

    async fn ensure_parents(&self, path: &str) {
        if !self.create_parents {
            return;
        }
        let parts: Vec<&str> = path.split('/').collect();
        let mut current = String::new();
        for part in &parts[..parts.len().saturating_sub(1)] {
            current.push_str(part);
            current.push('/');
            // 忽略创建目录的错误（可能已存在）
            let _ = self.operator.create_dir(&current).await;
        }
    }
}

struct RemoteWriter {
    inner: Option<opendal::Writer>,
}

#[async_trait]
impl ObjectWriter for RemoteWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .inner
            .as_mut()
            .ok_or_else(|| anyhow!("写入流已关闭"))?;
        writer.write(data.to_vec()).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.inner.take() {
            writer.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn list_children(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = Self::dir_path(path);
        let entries = self.operator.list(&dir).await?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry_path = normalize_path(entry.path());
            // 有些服务会把目录自身也列出来
            if entry_path.is_empty() || Self::dir_path(&entry_path) == dir {
                continue;
            }

            let meta = entry.metadata();
            if !meta.is_dir() && meta.last_modified().is_none() {
                let full = self.operator.stat(entry.path()).await?;
                files.push(Self::to_entry(entry_path, &full));
            } else {
                files.push(Self::to_entry(entry_path, meta));
            }
        }

        Ok(files)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        match self.operator.stat(&normalize_path(path)).await {
            Ok(meta) => Ok(Some(Self::to_entry(normalize_path(path), &meta))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<ByteReader> {
        let path = normalize_path(path);
        let size = self.operator.stat(&path).await?.content_length();
        let operator = self.operator.clone();

        let stream = futures::stream::try_unfold(offset, move |pos| {
            let operator = operator.clone();
            let path = path.clone();
            async move {
                if pos >= size {
                    return Ok::<_, io::Error>(None);
                }
                let end = (pos + READ_BLOCK).min(size);
                let data: Bytes = operator
                    .read_with(&path)
                    .range(pos..end)
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                    .to_bytes();
                if data.is_empty() {
                    return Ok(None);
                }
                let next = pos + data.len() as u64;
                Ok(Some((data, next)))
            }
        });

        Ok(Box::pin(StreamReader::new(Box::pin(stream))))
    }

    async fn open_write(
        &self,
        path: &str,
        _resume_from: u64,
    ) -> Result<(Box<dyn ObjectWriter>, u64)> {
        // 对象存储不支持续写，总是从头开始
        let path = normalize_path(path);
        self.ensure_parents(&path).await;
        let writer = self.operator.writer(&path).await?;
        Ok((Box::new(RemoteWriter { inner: Some(writer) }), 0))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        self.ensure_parents(&to).await;

        match self.operator.rename(&from, &to).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                debug!("{} 不支持 rename，改用 copy + delete", self.name);
            }
            Err(e) => return Err(e.into()),
        }

        match self.operator.copy(&from, &to).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                let data = self.operator.read(&from).await?;
                self.operator.write(&to, data).await?;
            }
            Err(e) => return Err(e.into()),
        }
        self.operator.delete(&from).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let is_dir = matches!(self.operator.stat(&path).await, Ok(m) if m.is_dir());
        let result = if is_dir {
            self.operator.remove_all(&Self::dir_path(&path)).await
        } else {
            self.operator.delete(&path).await
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        self.operator.create_dir(&Self::dir_path(path)).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        true
    }
}

#[async_trait]
impl DownloadUrlProvider for RemoteStorage {
    async fn download_url(&self, object_id: &str) -> Result<DownloadUrl> {
        let ttl = Duration::from_secs(PRESIGN_TTL_SECS);
        let request = self
            .operator
            .presign_read(&normalize_path(object_id), ttl)
            .await?;
        Ok(DownloadUrl {
            url: request.uri().to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(PRESIGN_TTL_SECS as i64),
        })
    }

    async fn object_size(&self, object_id: &str) -> Result<Option<u64>> {
        Ok(self.stat(object_id).await?.map(|e| e.size))
    }
}
