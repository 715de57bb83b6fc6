use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// 压缩算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
    Zstd { level: i32 },
}

/// 压缩并在前面加 1 字节算法标记
pub fn compress(compression: Compression, data: &[u8]) -> SyncResult<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, data.to_vec()),
        Compression::Lz4 => (TAG_LZ4, lz4_flex::compress_prepend_size(data)),
        Compression::Zstd { level } => (
            TAG_ZSTD,
            zstd::bulk::compress(data, level)
                .map_err(|e| SyncError::Pipeline(format!("zstd 压缩失败: {}", e)))?,
        ),
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// 按标记解压，输出不超过 `limit` 字节（防止解压炸弹）
pub fn decompress(data: &[u8], limit: usize) -> SyncResult<Vec<u8>> {
    let (&tag, payload) = data
        .split_first()
        .ok_or_else(|| SyncError::Pipeline("压缩数据为空".into()))?;

    let out = match tag {
        TAG_NONE => payload.to_vec(),
        TAG_LZ4 => {
            let size = payload
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .ok_or_else(|| SyncError::Pipeline("lz4 数据过短".into()))?;
            if size > limit {
                return Err(SyncError::Pipeline(format!(
                    "lz4 解压后大小 {} 超过上限 {}",
                    size, limit
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| SyncError::Pipeline(format!("lz4 解压失败: {}", e)))?
        }
        TAG_ZSTD => zstd::bulk::decompress(payload, limit)
            .map_err(|e| SyncError::Pipeline(format!("zstd 解压失败: {}", e)))?,
        other => {
            return Err(SyncError::Pipeline(format!("未知的压缩标记: {:#04x}", other)));
        }
    };

    if out.len() > limit {
        return Err(SyncError::Pipeline(format!(
            "解压后大小 {} 超过上限 {}",
            out.len(),
            limit
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_codec_roundtrip() {
        let data = b"abcabcabcabcabcabcabcabcabcabc".repeat(100);
        for c in [Compression::None, Compression::Lz4, Compression::Zstd { level: 3 }] {
            let packed = compress(c, &data).unwrap();
            assert_eq!(decompress(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn test_rejects_lz4_bomb() {
        let mut bomb = vec![TAG_LZ4];
        bomb.extend_from_slice(&(1u32 << 30).to_le_bytes());
        bomb.extend_from_slice(&[0u8; 10]);
        assert!(decompress(&bomb, 1024 * 1024).is_err());
    }

    #[test]
    fn test_unknown_tag() {
        assert!(decompress(&[0x7f, 1, 2, 3], 16).is_err());
        assert!(decompress(&[], 16).is_err());
    }
}
