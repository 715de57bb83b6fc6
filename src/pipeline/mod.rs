//! 加密/压缩管道
//!
//! 在传输的读写流外面透明地套一层编码。流格式：
//!
//! ```text
//! "SENC" | version u8 | cipher u8 | flags u8 | name_len u16 | name
//! ( frame_len u32 | seal(last u8 ‖ tag ‖ compressed, aad = frame index ‖ last) )+
//! 0u32
//! ```
//!
//! 至少有一帧，最后一帧的 `last` 为 1（空流也写一个空的末帧）。

pub mod cipher;
pub mod compress;
mod format;

pub use cipher::Cipher;
pub use compress::Compression;
pub use format::{decode, encode, EncodingWriter, FRAME_SIZE};

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// 加密算法名称（配置文件中的取值）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherKind {
    #[serde(rename = "none")]
    None,
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

/// 压缩算法名称（配置文件中的取值）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Lz4,
    Zstd,
}

/// 任务或同步作业的加密配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionOptions {
    #[serde(default)]
    pub compression: CompressionKind,
    #[serde(default)]
    pub cipher: CipherKind,
    pub passphrase: String,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    #[serde(default)]
    pub encrypt_names: bool,
}

fn default_zstd_level() -> i32 {
    3
}

/// 解析后的算法组合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmConfig {
    pub compression: Compression,
    pub cipher: Cipher,
    pub encrypt_names: bool,
}

impl AlgorithmConfig {
    pub fn from_options(options: &EncryptionOptions) -> SyncResult<Self> {
        if options.passphrase.is_empty() && options.cipher != CipherKind::None {
            return Err(SyncError::Configuration("加密口令不能为空".into()));
        }
        let key = blake3::derive_key("syncengine content key v1", options.passphrase.as_bytes());

        let compression = match options.compression {
            CompressionKind::None => Compression::None,
            CompressionKind::Lz4 => Compression::Lz4,
            CompressionKind::Zstd => Compression::Zstd {
                level: options.zstd_level,
            },
        };
        let cipher = match options.cipher {
            CipherKind::None => Cipher::None,
            CipherKind::Aes256Gcm => Cipher::Aes256Gcm { key },
            CipherKind::ChaCha20Poly1305 => Cipher::ChaCha20Poly1305 { key },
        };

        Ok(Self {
            compression,
            cipher,
            encrypt_names: options.encrypt_names,
        })
    }

    /// 目标端的对象路径（启用文件名加密时逐段加密）
    pub fn encode_path(&self, path: &str) -> SyncResult<String> {
        if self.encrypt_names {
            self.cipher.encrypt_path(path)
        } else {
            Ok(path.to_string())
        }
    }

    pub fn decode_path(&self, path: &str) -> SyncResult<String> {
        if self.encrypt_names {
            self.cipher.decrypt_path(path)
        } else {
            Ok(path.to_string())
        }
    }
}
