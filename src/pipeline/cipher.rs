use crate::error::{SyncError, SyncResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const NAME_AAD: &[u8] = b"syncengine-name";

/// 认证加密算法，密钥在创建任务时一次性解析
#[derive(Clone, PartialEq, Eq)]
pub enum Cipher {
    None,
    Aes256Gcm { key: [u8; 32] },
    ChaCha20Poly1305 { key: [u8; 32] },
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 不输出密钥
        f.write_str(match self {
            Cipher::None => "None",
            Cipher::Aes256Gcm { .. } => "Aes256Gcm",
            Cipher::ChaCha20Poly1305 { .. } => "ChaCha20Poly1305",
        })
    }
}

impl Cipher {
    /// 写入流头部的算法编号
    pub fn id(&self) -> u8 {
        match self {
            Cipher::None => 0,
            Cipher::Aes256Gcm { .. } => 1,
            Cipher::ChaCha20Poly1305 { .. } => 2,
        }
    }

    pub fn is_encrypting(&self) -> bool {
        !matches!(self, Cipher::None)
    }

    /// 加密，输出 `[nonce][ciphertext+tag]`，nonce 随机
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> SyncResult<Vec<u8>> {
        if !self.is_encrypting() {
            return Ok(plaintext.to_vec());
        }
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.seal_with_nonce(&nonce, plaintext, aad)
    }

    fn seal_with_nonce(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        aad: &[u8],
    ) -> SyncResult<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = match self {
            Cipher::None => return Ok(plaintext.to_vec()),
            Cipher::Aes256Gcm { key } => aes_gcm::Aes256Gcm::new(key.into())
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Cipher::ChaCha20Poly1305 { key } => {
                chacha20poly1305::ChaCha20Poly1305::new(key.into())
                    .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| SyncError::Pipeline("加密失败".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// 解密 `seal` 的输出，aad 必须一致
    pub fn open(&self, data: &[u8], aad: &[u8]) -> SyncResult<Vec<u8>> {
        if !self.is_encrypting() {
            return Ok(data.to_vec());
        }
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(SyncError::Pipeline("密文过短".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        match self {
            Cipher::None => Ok(data.to_vec()),
            Cipher::Aes256Gcm { key } => aes_gcm::Aes256Gcm::new(key.into())
                .decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Cipher::ChaCha20Poly1305 { key } => {
                chacha20poly1305::ChaCha20Poly1305::new(key.into())
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| SyncError::Pipeline("解密失败：密钥错误或数据被篡改".into()))
    }

    /// 确定性地加密一个文件名（同一名称总是得到同一密文）
    pub fn encrypt_name(&self, name: &str) -> SyncResult<String> {
        let key = match self {
            Cipher::None => return Ok(name.to_string()),
            Cipher::Aes256Gcm { key } | Cipher::ChaCha20Poly1305 { key } => key,
        };
        let nonce_key = blake3::derive_key("syncengine name nonce v1", key);
        let digest = blake3::keyed_hash(&nonce_key, name.as_bytes());
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest.as_bytes()[..NONCE_LEN]);

        let sealed = self.seal_with_nonce(&nonce, name.as_bytes(), NAME_AAD)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt_name(&self, encoded: &str) -> SyncResult<String> {
        if !self.is_encrypting() {
            return Ok(encoded.to_string());
        }
        let sealed = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| SyncError::Pipeline(format!("文件名编码无效: {}", e)))?;
        let plain = self.open(&sealed, NAME_AAD)?;
        String::from_utf8(plain).map_err(|_| SyncError::Pipeline("文件名不是有效的 UTF-8".into()))
    }

    /// 逐段加密相对路径，保持目录结构
    pub fn encrypt_path(&self, path: &str) -> SyncResult<String> {
        path.split('/')
            .map(|part| self.encrypt_name(part))
            .collect::<SyncResult<Vec<_>>>()
            .map(|parts| parts.join("/"))
    }

    pub fn decrypt_path(&self, path: &str) -> SyncResult<String> {
        path.split('/')
            .map(|part| self.decrypt_name(part))
            .collect::<SyncResult<Vec<_>>>()
            .map(|parts| parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphers() -> Vec<Cipher> {
        vec![
            Cipher::Aes256Gcm { key: [0x11; 32] },
            Cipher::ChaCha20Poly1305 { key: [0x22; 32] },
        ]
    }

    #[test]
    fn test_seal_open() {
        for cipher in ciphers() {
            let sealed = cipher.seal(b"secret message", b"aad").unwrap();
            assert_ne!(&sealed[NONCE_LEN..], b"secret message");
            assert_eq!(cipher.open(&sealed, b"aad").unwrap(), b"secret message");
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        for cipher in ciphers() {
            let sealed = cipher.seal(b"data", b"frame-0").unwrap();
            assert!(cipher.open(&sealed, b"frame-1").is_err());
        }
    }

    #[test]
    fn test_tampered_fails() {
        let cipher = Cipher::Aes256Gcm { key: [7; 32] };
        let mut sealed = cipher.seal(b"data", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.open(&sealed, b"").is_err());
        assert!(cipher.open(&sealed[..10], b"").is_err());
    }

    #[test]
    fn test_name_encryption_is_deterministic() {
        for cipher in ciphers() {
            let a = cipher.encrypt_path("docs/report.pdf").unwrap();
            let b = cipher.encrypt_path("docs/report.pdf").unwrap();
            assert_eq!(a, b);
            assert_eq!(a.split('/').count(), 2);
            assert!(!a.contains("report"));
            assert_eq!(cipher.decrypt_path(&a).unwrap(), "docs/report.pdf");
        }
    }

    #[test]
    fn test_plain_cipher_is_identity() {
        let cipher = Cipher::None;
        assert_eq!(cipher.seal(b"x", b"a").unwrap(), b"x");
        assert_eq!(cipher.encrypt_path("a/b").unwrap(), "a/b");
        assert_eq!(format!("{:?}", Cipher::Aes256Gcm { key: [1; 32] }), "Aes256Gcm");
    }
}
