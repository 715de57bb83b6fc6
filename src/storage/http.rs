use super::ByteReader;
use anyhow::{Context, Result};
use futures::TryStreamExt;
use reqwest::{header, Client, StatusCode};
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

/// 下载链接已过期（403 / 410），调用方需要重新获取链接
#[derive(Debug, thiserror::Error)]
#[error("下载链接已失效: HTTP {0}")]
pub struct UrlExpired(pub u16);

/// 通过 HTTP 下载链接读取云端文件，支持 Range 续传
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(super::OP_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(super::IO_TIMEOUT_SECS))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client })
    }

    /// 从 offset 开始读取；服务器忽略 Range 时返回的实际起始偏移为 0
    pub async fn open(&self, url: &str, offset: u64) -> Result<(ByteReader, u64, Option<u64>)> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::GONE {
            return Err(UrlExpired(status.as_u16()).into());
        }
        let response = response.error_for_status()?;

        let start = if status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            if offset > 0 {
                debug!("服务器不支持 Range，从头开始下载");
            }
            0
        };
        let total = response.content_length().map(|len| len + start);

        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok((Box::pin(StreamReader::new(stream)), start, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_expired_downcast() {
        let err: anyhow::Error = UrlExpired(403).into();
        assert!(err.downcast_ref::<UrlExpired>().is_some());
        assert!(err.to_string().contains("403"));
    }
}
