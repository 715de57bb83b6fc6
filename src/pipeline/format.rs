use super::compress::{compress, decompress};
use super::AlgorithmConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::ObjectWriter;
use anyhow::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAGIC: &[u8; 4] = b"SENC";
const VERSION: u8 = 2;
const FLAG_NAME: u8 = 0x01;
const NAME_AAD: &[u8] = b"SENC-name";

/// 每帧明文的最大长度
pub const FRAME_SIZE: usize = 1024 * 1024;
/// 帧密文长度上限（压缩膨胀 + nonce/tag 余量）
const MAX_FRAME_PAYLOAD: usize = FRAME_SIZE + FRAME_SIZE / 64 + 1024;

/// 帧序号和末帧标记一起参与认证，截断或重排都无法通过解码
fn frame_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_le_bytes());
    aad[8] = last as u8;
    aad
}

fn seal_frame(config: &AlgorithmConfig, index: u64, last: bool, plain: &[u8]) -> SyncResult<Vec<u8>> {
    let mut packed = vec![last as u8];
    packed.extend_from_slice(&compress(config.compression, plain)?);
    config.cipher.seal(&packed, &frame_aad(index, last))
}

fn open_frame(config: &AlgorithmConfig, index: u64, last: bool, payload: &[u8]) -> SyncResult<Vec<u8>> {
    let packed = config.cipher.open(payload, &frame_aad(index, last))?;
    // 无加密时也靠标记字节发现截断
    match packed.split_first() {
        Some((&marker, rest)) if marker == last as u8 => decompress(rest, FRAME_SIZE),
        _ => Err(SyncError::Pipeline(format!("第 {} 帧的结束标记不符，流可能被截断", index))),
    }
}

/// 把明文写入流编码后交给内层写入器
pub struct EncodingWriter<W: ObjectWriter> {
    inner: W,
    config: AlgorithmConfig,
    name: Option<String>,
    buffer: Vec<u8>,
    frame_index: u64,
    header_written: bool,
}

impl<W: ObjectWriter> EncodingWriter<W> {
    /// `name` 只在启用文件名加密时写入头部，解码时可以取回
    pub fn new(inner: W, config: AlgorithmConfig, name: Option<&str>) -> Self {
        let name = name.filter(|_| config.encrypt_names).map(str::to_string);
        Self {
            inner,
            config,
            name,
            buffer: Vec::with_capacity(FRAME_SIZE),
            frame_index: 0,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        let sealed_name = match &self.name {
            Some(name) => Some(self.config.cipher.seal(name.as_bytes(), NAME_AAD)?),
            None => None,
        };

        let mut header = Vec::with_capacity(64);
        header.extend_from_slice(MAGIC);
        header.push(VERSION);
        header.push(self.config.cipher.id());
        header.push(if sealed_name.is_some() { FLAG_NAME } else { 0 });
        let name_bytes = sealed_name.unwrap_or_default();
        let name_len = u16::try_from(name_bytes.len())
            .map_err(|_| SyncError::Pipeline("文件名过长".into()))?;
        header.extend_from_slice(&name_len.to_le_bytes());
        header.extend_from_slice(&name_bytes);

        self.inner.write(&header).await?;
        self.header_written = true;
        Ok(())
    }

    async fn emit_frame(&mut self, len: usize, last: bool) -> Result<()> {
        let payload = seal_frame(&self.config, self.frame_index, last, &self.buffer[..len])?;
        self.buffer.drain(..len);
        self.frame_index += 1;

        self.inner.write(&(payload.len() as u32).to_le_bytes()).await?;
        self.inner.write(&payload).await
    }
}

#[async_trait]
impl<W: ObjectWriter> ObjectWriter for EncodingWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.write_header().await?;
        self.buffer.extend_from_slice(data);
        // 至少留一帧到 finish，末帧要带结束标记
        while self.buffer.len() > FRAME_SIZE {
            self.emit_frame(FRAME_SIZE, false).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }

    async fn finish(&mut self) -> Result<()> {
        self.write_header().await?;
        self.emit_frame(self.buffer.len(), true).await?;
        self.inner.write(&0u32.to_le_bytes()).await?;
        self.inner.finish().await
    }
}

/// 读取明文流，编码后写入 `writer`，返回已完成的写入器
pub async fn encode<R, W>(
    reader: &mut R,
    writer: W,
    config: &AlgorithmConfig,
    name: Option<&str>,
) -> SyncResult<W>
where
    R: AsyncRead + Unpin + ?Sized,
    W: ObjectWriter,
{
    let mut encoder = EncodingWriter::new(writer, config.clone(), name);
    let mut buf = vec![0u8; FRAME_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        encoder.write(&buf[..n]).await?;
    }
    encoder.finish().await?;
    Ok(encoder.into_inner())
}

fn truncated(e: std::io::Error) -> SyncError {
    if e.kind() == ErrorKind::UnexpectedEof {
        SyncError::Pipeline("编码流被截断".into())
    } else {
        SyncError::Io(e)
    }
}

/// 解码到 `writer`，启用文件名加密时返回原始文件名
pub async fn decode<R, W>(
    reader: &mut R,
    writer: &mut W,
    config: &AlgorithmConfig,
) -> SyncResult<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: ObjectWriter + ?Sized,
{
    let mut fixed = [0u8; 9];
    reader.read_exact(&mut fixed).await.map_err(truncated)?;
    if &fixed[..4] != MAGIC {
        return Err(SyncError::Pipeline("不是加密流（魔数不匹配）".into()));
    }
    if fixed[4] != VERSION {
        return Err(SyncError::Pipeline(format!("不支持的流版本: {}", fixed[4])));
    }
    if fixed[5] != config.cipher.id() {
        return Err(SyncError::Pipeline(format!(
            "加密算法不匹配: 流中为 {}，配置为 {:?}",
            fixed[5], config.cipher
        )));
    }
    let flags = fixed[6];
    let name_len = u16::from_le_bytes([fixed[7], fixed[8]]) as usize;
    let mut name_bytes = vec![0u8; name_len];
    reader.read_exact(&mut name_bytes).await.map_err(truncated)?;

    let name = if flags & FLAG_NAME != 0 {
        let plain = config.cipher.open(&name_bytes, NAME_AAD)?;
        Some(
            String::from_utf8(plain)
                .map_err(|_| SyncError::Pipeline("文件名不是有效的 UTF-8".into()))?,
        )
    } else {
        None
    };

    let read_len = |len: [u8; 4]| -> SyncResult<usize> {
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(SyncError::Pipeline(format!("帧长度异常: {}", len)));
        }
        Ok(len)
    };

    let mut index = 0u64;
    let mut payload = Vec::with_capacity(FRAME_SIZE);
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(truncated)?;
    let mut len = read_len(len_buf)?;
    if len == 0 {
        return Err(SyncError::Pipeline("编码流缺少末帧".into()));
    }
    loop {
        payload.resize(len, 0);
        reader.read_exact(&mut payload).await.map_err(truncated)?;
        // 下一个长度为 0 时本帧是末帧
        reader.read_exact(&mut len_buf).await.map_err(truncated)?;
        let next = read_len(len_buf)?;
        let last = next == 0;

        let plain = open_frame(config, index, last, &payload)?;
        writer.write(&plain).await?;
        if last {
            break;
        }
        index += 1;
        len = next;
    }

    writer.finish().await?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Cipher, Compression};

    fn configs() -> Vec<AlgorithmConfig> {
        let mut out = Vec::new();
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd { level: 3 }] {
            for cipher in [
                Cipher::None,
                Cipher::Aes256Gcm { key: [3; 32] },
                Cipher::ChaCha20Poly1305 { key: [4; 32] },
            ] {
                out.push(AlgorithmConfig {
                    compression,
                    cipher,
                    encrypt_names: true,
                });
            }
        }
        out
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 31) ^ (i >> 7)) as u8).collect()
    }

    #[tokio::test]
    async fn test_decode_inverts_encode_for_all_combinations() {
        // 跨帧边界的数据
        let data = sample(FRAME_SIZE * 2 + 12345);
        for config in configs() {
            let encoded = encode(&mut &data[..], Vec::new(), &config, Some("报告 2024.pdf"))
                .await
                .unwrap();
            let mut decoded = Vec::new();
            let name = decode(&mut &encoded[..], &mut decoded, &config).await.unwrap();
            assert_eq!(decoded, data, "{:?}", config);
            assert_eq!(name.as_deref(), Some("报告 2024.pdf"));
        }
    }

    #[tokio::test]
    async fn test_empty_stream_and_no_name() {
        let config = AlgorithmConfig {
            compression: Compression::Lz4,
            cipher: Cipher::Aes256Gcm { key: [9; 32] },
            encrypt_names: false,
        };
        let encoded = encode(&mut &b""[..], Vec::new(), &config, Some("ignored.txt"))
            .await
            .unwrap();
        let mut decoded = Vec::new();
        let name = decode(&mut &encoded[..], &mut decoded, &config).await.unwrap();
        assert!(decoded.is_empty());
        assert_eq!(name, None);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails() {
        let config = AlgorithmConfig {
            compression: Compression::None,
            cipher: Cipher::ChaCha20Poly1305 { key: [1; 32] },
            encrypt_names: false,
        };
        let encoded = encode(&mut &sample(5000)[..], Vec::new(), &config, None)
            .await
            .unwrap();
        // 去掉结束帧
        let cut = &encoded[..encoded.len() - 4];
        let mut out = Vec::new();
        let err = decode(&mut &cut[..], &mut out, &config).await.unwrap_err();
        assert!(matches!(err, SyncError::Pipeline(_)));
    }

    /// 在帧边界截断并补上结束标记，仍然不能解码成功
    #[tokio::test]
    async fn test_cut_at_frame_boundary_fails() {
        let data = sample(FRAME_SIZE * 2);
        for config in configs() {
            let encoded = encode(&mut &data[..], Vec::new(), &config, Some("a.bin"))
                .await
                .unwrap();
            let name_len = u16::from_le_bytes([encoded[7], encoded[8]]) as usize;
            let first = 9 + name_len;
            let frame_len =
                u32::from_le_bytes(encoded[first..first + 4].try_into().unwrap()) as usize;
            let mut forged = encoded[..first + 4 + frame_len].to_vec();
            forged.extend_from_slice(&0u32.to_le_bytes());

            let mut out = Vec::new();
            let err = decode(&mut &forged[..], &mut out, &config).await.unwrap_err();
            assert!(matches!(err, SyncError::Pipeline(_)), "{:?}", config);
        }
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let config = AlgorithmConfig {
            compression: Compression::Lz4,
            cipher: Cipher::Aes256Gcm { key: [1; 32] },
            encrypt_names: false,
        };
        let other = AlgorithmConfig {
            cipher: Cipher::Aes256Gcm { key: [2; 32] },
            ..config.clone()
        };
        let encoded = encode(&mut &sample(100)[..], Vec::new(), &config, None)
            .await
            .unwrap();
        let mut out = Vec::new();
        assert!(decode(&mut &encoded[..], &mut out, &other).await.is_err());
    }

    #[tokio::test]
    async fn test_encoding_writer_incremental_writes() {
        let config = AlgorithmConfig {
            compression: Compression::Zstd { level: 1 },
            cipher: Cipher::Aes256Gcm { key: [5; 32] },
            encrypt_names: false,
        };
        let data = sample(FRAME_SIZE + 77);
        let mut writer = EncodingWriter::new(Vec::new(), config.clone(), None);
        for piece in data.chunks(4096) {
            writer.write(piece).await.unwrap();
        }
        writer.finish().await.unwrap();
        let encoded = writer.into_inner();

        let mut decoded = Vec::new();
        decode(&mut &encoded[..], &mut decoded, &config).await.unwrap();
        assert_eq!(decoded, data);
    }
}
