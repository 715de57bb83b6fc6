//! 单次传输尝试：打开源、写临时文件、提交、校验、落位

use super::{Codec, Collision, ContentSource, SourceRef, TaskStatus, TransferExecutor, TransferOutcome, TransferRequest};
use crate::core::chunker::chunk_stream;
use crate::core::comparator::{digest_reader, Digester};
use crate::core::conflict::disambiguate_name;
use crate::core::options::{HashAlgorithm, RECYCLE_DIR};
use crate::core::progress::SpeedMeter;
use crate::error::{SyncError, SyncResult};
use crate::pipeline::{decode, EncodingWriter};
use crate::storage::{join_path, parent_path, ByteReader, DownloadUrlProvider, ObjectWriter, Storage, UrlExpired};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BUFFER_SIZE: usize = 1024 * 1024;
const THROTTLE_POLL: Duration = Duration::from_millis(50);
const MIN_THROTTLED_PIECE: usize = 16 * 1024;

pub(super) fn decoded_name(temp: &str) -> String {
    format!("{}.dec", temp)
}

/// 只计算摘要的写入端，用于校验加密后的内容
struct DigestSink {
    digester: Digester,
}

#[async_trait]
impl ObjectWriter for DigestSink {
    async fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.digester.update(data);
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 一次尝试内的累计状态
struct Pump {
    start: u64,
    transferred: u64,
    meter: SpeedMeter,
    digest: Option<Digester>,
}

impl TransferExecutor {
    pub(super) async fn attempt(
        &self,
        id: &str,
        req: &TransferRequest,
        token: &CancellationToken,
    ) -> SyncResult<TransferOutcome> {
        let task = self
            .get(id)
            .await
            .ok_or_else(|| SyncError::TaskNotFound(id.to_string()))?;
        let temp = task
            .temp_path
            .clone()
            .ok_or_else(|| SyncError::Configuration(format!("任务 {} 没有临时路径", id)))?;
        let path = req.target_path.as_str();
        let target = req.target.as_ref();

        // 编码输出不能从中间续写
        let resumable = !matches!(req.codec, Codec::Encode { .. });
        let wanted = if resumable { task.committed_bytes } else { 0 };

        if let Some(parent) = Some(parent_path(&temp)).filter(|p| !p.is_empty()) {
            target.create_dir(parent).await.map_err(|e| SyncError::transfer(path, e))?;
        }
        let (mut writer, mut start) = target
            .open_write(&temp, wanted)
            .await
            .map_err(|e| SyncError::transfer(path, e))?;
        let (reader, source_start) = self.open_source(id, req, start).await?;
        if source_start != start {
            debug!("源端无法从 {} 续读，从头开始: {}", start, path);
            let (fresh, _) = target
                .open_write(&temp, 0)
                .await
                .map_err(|e| SyncError::transfer(path, e))?;
            writer = fresh;
            start = 0;
        }
        if start > 0 {
            info!("从 {} 字节处续传: {}", start, path);
        }

        let mut sink: Box<dyn ObjectWriter> = match &req.codec {
            Codec::Encode { config, name } => {
                Box::new(EncodingWriter::new(writer, config.clone(), name.as_deref()))
            }
            _ => writer,
        };
        let mut pump = Pump {
            start,
            transferred: start,
            meter: SpeedMeter::new(),
            digest: match (&req.settings.verify, start) {
                (Some(alg), 0) => Some(Digester::new(*alg)),
                _ => None,
            },
        };
        self.update(id, |t| {
            t.transferred_bytes = start;
            t.committed_bytes = start;
        })
        .await;

        match req.settings.chunker {
            Some(params) => {
                let mut chunks = Box::pin(chunk_stream(reader, params));
                loop {
                    let next = tokio::select! {
                        next = chunks.next() => next,
                        _ = token.cancelled() => return Err(self.interrupted(id).await),
                        _ = req.cancel.cancelled() => return Err(self.interrupted(id).await),
                    };
                    let Some(chunk) = next else { break };
                    let chunk = chunk.map_err(|e| SyncError::transfer(path, e))?;
                    self.pump(id, req, sink.as_mut(), &chunk.data, &mut pump, token).await?;
                    if resumable {
                        sink.flush().await.map_err(|e| SyncError::transfer(path, e))?;
                        self.commit(id, pump.transferred).await;
                    }
                }
            }
            None => {
                let mut reader = reader;
                let mut buf = vec![0u8; BUFFER_SIZE];
                loop {
                    let n = tokio::select! {
                        n = reader.read(&mut buf) => n.map_err(|e| SyncError::transfer(path, e))?,
                        _ = token.cancelled() => return Err(self.interrupted(id).await),
                        _ = req.cancel.cancelled() => return Err(self.interrupted(id).await),
                    };
                    if n == 0 {
                        break;
                    }
                    self.pump(id, req, sink.as_mut(), &buf[..n], &mut pump, token).await?;
                }
            }
        }
        sink.finish().await.map_err(|e| SyncError::transfer(path, e))?;
        drop(sink);
        self.commit(id, pump.transferred).await;

        if let (Some(total), true) = (req.size, resumable) {
            if pump.transferred != total {
                return Err(SyncError::transfer(
                    path,
                    format!("大小不一致: 期望 {} 字节，实际 {} 字节", total, pump.transferred),
                ));
            }
        }

        if let (Some(alg), false) = (req.settings.verify, matches!(req.codec, Codec::Decode { .. })) {
            self.verify(id, req, &temp, alg, pump.digest.take()).await?;
        }

        // 解码下载的编码流
        let (staged, recovered_name) = match &req.codec {
            Codec::Decode { config } => {
                let decoded = decoded_name(&temp);
                let mut reader = target.open_read(&temp, 0).await.map_err(|e| SyncError::transfer(path, e))?;
                let (mut out, _) = target
                    .open_write(&decoded, 0)
                    .await
                    .map_err(|e| SyncError::transfer(path, e))?;
                let name = match decode(&mut reader, &mut out, config).await {
                    Ok(name) => name,
                    Err(e) => {
                        let _ = target.delete(&decoded).await;
                        return Err(e);
                    }
                };
                drop(reader);
                let _ = target.delete(&temp).await;
                self.commit(id, 0).await;
                (decoded, name)
            }
            _ => (temp.clone(), None),
        };

        let wanted_path = match recovered_name.as_deref().and_then(|n| n.rsplit(['/', '\\']).next()) {
            Some(name) if !name.is_empty() => join_path(parent_path(path), name),
            _ => path.to_string(),
        };
        let final_path = self.place(target, &staged, &wanted_path, req.collision).await?;

        if let Some(modified) = req.modified {
            match target.set_modified(&final_path, modified).await {
                Ok(_) => {}
                Err(e) => warn!("设置修改时间失败 {}: {}", final_path, e),
            }
        }
        let entry = target.stat(&final_path).await.map_err(|e| SyncError::transfer(path, e))?;

        Ok(TransferOutcome {
            task_id: id.to_string(),
            final_path,
            entry,
            bytes: pump.transferred - pump.start,
            recovered_name,
        })
    }

    /// 打开源读取流，返回实际的起始偏移
    async fn open_source(&self, id: &str, req: &TransferRequest, offset: u64) -> SyncResult<(ByteReader, u64)> {
        match &req.source {
            ContentSource::Storage { storage, path } => {
                let reader = storage
                    .open_read(path, offset)
                    .await
                    .map_err(|e| SyncError::transfer(path.as_str(), e))?;
                Ok((reader, offset))
            }
            ContentSource::Remote { provider, object_id } => {
                let url = self.current_url(id, provider.as_ref(), object_id, false).await?;
                match self.http.open(&url, offset).await {
                    Ok((reader, start, _)) => Ok((reader, start)),
                    Err(e) if e.downcast_ref::<UrlExpired>().is_some() => {
                        info!("下载链接已失效，重新获取: {}", object_id);
                        let url = self.current_url(id, provider.as_ref(), object_id, true).await?;
                        let (reader, start, _) = self
                            .http
                            .open(&url, offset)
                            .await
                            .map_err(|e| SyncError::transfer(object_id.as_str(), e))?;
                        Ok((reader, start))
                    }
                    Err(e) => Err(SyncError::transfer(object_id.as_str(), e)),
                }
            }
        }
    }

    /// 缓存的链接过期或不存在时向云端重新申请
    async fn current_url(
        &self,
        id: &str,
        provider: &dyn DownloadUrlProvider,
        object_id: &str,
        force: bool,
    ) -> SyncResult<String> {
        if !force {
            if let Some(SourceRef::Remote {
                url: Some(url),
                url_issued_at: Some(issued),
                ..
            }) = self.get(id).await.map(|t| t.source_ref)
            {
                let age = (Utc::now() - issued).to_std().unwrap_or_default();
                if age < self.config.url_staleness {
                    return Ok(url);
                }
            }
        }

        let fresh = provider
            .download_url(object_id)
            .await
            .map_err(|e| SyncError::transfer(object_id, e))?;
        debug!("获取下载链接: {} (过期时间 {})", object_id, fresh.expires_at);
        let updated = self
            .update(id, |t| {
                if let SourceRef::Remote { url, url_issued_at, .. } = &mut t.source_ref {
                    *url = Some(fresh.url.clone());
                    *url_issued_at = Some(Utc::now());
                }
            })
            .await;
        if let Some(task) = updated {
            self.persist(&task).await;
        }
        Ok(fresh.url)
    }

    /// 分片写入，每片之间检查中断、限速并更新进度
    async fn pump(
        &self,
        id: &str,
        req: &TransferRequest,
        sink: &mut dyn ObjectWriter,
        data: &[u8],
        pump: &mut Pump,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        // 限速时切得更细，单次写入不会远超额度
        let piece_size = match self.speed_limit.load(Ordering::Relaxed) {
            0 => BUFFER_SIZE,
            limit => usize::try_from(limit / 4)
                .unwrap_or(BUFFER_SIZE)
                .clamp(MIN_THROTTLED_PIECE, BUFFER_SIZE),
        };
        for piece in data.chunks(piece_size) {
            self.throttle(id, &mut pump.meter, token).await;
            if token.is_cancelled() || req.cancel.is_cancelled() {
                return Err(self.interrupted(id).await);
            }
            sink.write(piece)
                .await
                .map_err(|e| SyncError::transfer(req.target_path.as_str(), e))?;
            if let Some(digest) = pump.digest.as_mut() {
                digest.update(piece);
            }
            pump.transferred += piece.len() as u64;

            let transferred = pump.transferred;
            let speed = pump.meter.record(piece.len() as u64);
            self.update(id, |t| {
                t.transferred_bytes = match t.total_bytes {
                    Some(total) => transferred.min(total),
                    None => transferred,
                };
                if let Some(speed) = speed {
                    t.speed = speed;
                }
            })
            .await;
        }
        Ok(())
    }

    async fn interrupted(&self, id: &str) -> SyncError {
        SyncError::Interrupted(self.status(id).await.unwrap_or(TaskStatus::Canceled))
    }

    async fn commit(&self, id: &str, committed: u64) {
        let Some(task) = self.update(id, |t| t.committed_bytes = committed).await else {
            return;
        };
        if let Some(store) = &self.store {
            if let Err(e) = store
                .update_progress(id, task.transferred_bytes, task.committed_bytes)
                .await
            {
                warn!("保存传输进度失败 {}: {}", id, e);
            }
        }
    }

    /// 所有传输中任务的速度之和超过限速时等待。
    ///
    /// 本任务用当前窗口的即时速度，其他任务用最近一次测得的速度
    async fn throttle(&self, id: &str, meter: &mut SpeedMeter, token: &CancellationToken) {
        let limit = self.speed_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        loop {
            let others: u64 = self
                .tasks
                .read()
                .await
                .values()
                .filter(|t| t.id != id && t.status == TaskStatus::Transferring)
                .map(|t| t.speed)
                .sum();
            if others.saturating_add(meter.current()) <= limit || token.is_cancelled() {
                return;
            }
            tokio::time::sleep(THROTTLE_POLL).await;
            if let Some(speed) = meter.tick() {
                self.update(id, |t| t.speed = speed).await;
            }
        }
    }

    /// 写完后读回临时文件校验摘要，不一致时丢弃临时文件
    async fn verify(
        &self,
        id: &str,
        req: &TransferRequest,
        temp: &str,
        algorithm: HashAlgorithm,
        streamed: Option<Digester>,
    ) -> SyncResult<()> {
        let path = req.target_path.as_str();
        let expected = match streamed {
            Some(digest) => digest.finalize(),
            None => {
                let (mut reader, _) = self.open_source(id, req, 0).await?;
                digest_reader(&mut reader, algorithm)
                    .await
                    .map_err(|e| SyncError::transfer(path, e))?
                    .0
            }
        };

        let mut reader = req
            .target
            .open_read(temp, 0)
            .await
            .map_err(|e| SyncError::transfer(path, e))?;
        let actual = match &req.codec {
            Codec::Encode { config, .. } => {
                let mut sink = DigestSink {
                    digester: Digester::new(algorithm),
                };
                decode(&mut reader, &mut sink, config).await?;
                sink.digester.finalize()
            }
            _ => {
                digest_reader(&mut reader, algorithm)
                    .await
                    .map_err(|e| SyncError::transfer(path, e))?
                    .0
            }
        };
        drop(reader);

        if expected != actual {
            warn!("校验失败 {}: 期望 {}，实际 {}", path, expected, actual);
            let _ = req.target.delete(temp).await;
            self.commit(id, 0).await;
            return Err(SyncError::Verification {
                path: path.to_string(),
            });
        }
        debug!("校验通过: {}", path);
        Ok(())
    }

    /// 把临时文件移动到最终位置，返回最终路径
    async fn place(
        &self,
        target: &dyn Storage,
        staged: &str,
        wanted: &str,
        collision: Collision,
    ) -> SyncResult<String> {
        let final_path = match collision {
            Collision::Replace { recycle } => {
                if recycle {
                    if let Some(existing) = target.stat(wanted).await.map_err(|e| SyncError::transfer(wanted, e))? {
                        if !existing.is_dir() {
                            move_to_recycle(target, wanted).await?;
                        }
                    }
                }
                wanted.to_string()
            }
            Collision::Disambiguate => {
                if target.exists(wanted).await.map_err(|e| SyncError::transfer(wanted, e))? {
                    let mut taken = std::collections::HashSet::new();
                    let mut candidate = wanted.to_string();
                    while target
                        .exists(&candidate)
                        .await
                        .map_err(|e| SyncError::transfer(wanted, e))?
                    {
                        taken.insert(candidate);
                        candidate = disambiguate_name(wanted, |p| taken.contains(p));
                    }
                    info!("目标已存在，另存为: {}", candidate);
                    candidate
                } else {
                    wanted.to_string()
                }
            }
        };

        target
            .rename(staged, &final_path)
            .await
            .map_err(|e| SyncError::transfer(final_path.as_str(), e))?;
        Ok(final_path)
    }
}

/// 回收站中的路径：`.synctrash/<时间戳>/<原路径>`
pub fn recycle_path(path: &str) -> String {
    format!("{}/{}/{}", RECYCLE_DIR, Utc::now().format("%Y%m%d_%H%M%S"), path)
}

/// 把已有条目移到回收站，保留相对路径
pub async fn move_to_recycle(target: &dyn Storage, path: &str) -> SyncResult<String> {
    let dest = recycle_path(path);
    let parent = parent_path(&dest);
    target
        .create_dir(parent)
        .await
        .map_err(|e| SyncError::transfer(path, e))?;
    target
        .rename(path, &dest)
        .await
        .map_err(|e| SyncError::transfer(path, e))?;
    debug!("移到回收站: {} -> {}", path, dest);
    Ok(dest)
}
