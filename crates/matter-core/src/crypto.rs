//! # crypto 模块说明
//!
//! ## 角色定位（Why）
//! - 会话建立（PASE/CASE）、报文加解密与证书签名全部经由
//!   [`CryptoProvider`] 服务完成；平台可以注册自己的硬件/系统后端，
//!   协议逻辑对具体实现保持无感；
//! - 仓库自带 [`SoftwareCrypto`]：纯软件实现，保证工作区自足、可测试。
//!
//! ## 核心契约（What）
//! - 对称 AEAD：16 字节密钥、12 字节 nonce，关联数据覆盖报文头；
//! - 哈希/HMAC/HKDF/PBKDF2 全部固定为 SHA-256 族；
//! - 签名：操作密钥对的生成、签名与验签；密钥字节可导出用于持久化。
//!
//! ## 风险提示（Trade-offs）
//! - 软件后端以 AES-GCM 与 Ed25519 承担 AEAD 与签名职责；接入经过认证的
//!   平台后端时在环境中覆盖本服务即可，上层代码无需变更。

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::environment::EnvironmentService;
use crate::error::{MatterError, Result, codes};

/// 对称会话密钥长度（AES-128）。
pub const SYMMETRIC_KEY_LEN: usize = 16;
/// AEAD nonce 长度。
pub const AEAD_NONCE_LEN: usize = 12;
/// 签名长度（Ed25519）。
pub const SIGNATURE_LEN: usize = 64;
/// 公钥长度。
pub const PUBLIC_KEY_LEN: usize = 32;

/// 操作密钥对：fabric 的节点操作证书对应的签名密钥。
pub struct OperationalKeypair {
    signing: SigningKey,
}

impl OperationalKeypair {
    /// 从持久化的 32 字节私钥恢复。
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// 导出私钥字节用于持久化。
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// 对应的公钥字节。
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }
}

impl Clone for OperationalKeypair {
    fn clone(&self) -> Self {
        Self {
            signing: SigningKey::from_bytes(&self.signing.to_bytes()),
        }
    }
}

impl std::fmt::Debug for OperationalKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 私钥字节绝不进入日志。
        f.debug_struct("OperationalKeypair")
            .field("public_key", &hex_preview(&self.public_key()))
            .finish()
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect::<String>() + "…"
}

/// 协议栈使用的加密原语集合。
pub trait CryptoProvider: Send + Sync + 'static {
    /// 以密码学安全随机源填充缓冲区。
    fn fill_random(&self, buf: &mut [u8]);

    fn sha256(&self, data: &[u8]) -> [u8; 32];

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32];

    /// HKDF-SHA256 扩展；`out` 长度即请求的输出长度。
    fn hkdf_sha256(&self, salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()>;

    /// PBKDF2-HMAC-SHA256，用于从口令派生 PASE 验证材料。
    fn pbkdf2_sha256(&self, secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]);

    /// AEAD 加密；返回密文（尾部含认证标签）。
    fn aead_encrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// AEAD 解密；标签校验失败返回 `message.decrypt_failed`。
    fn aead_decrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;

    fn generate_keypair(&self) -> OperationalKeypair;

    fn sign(&self, keypair: &OperationalKeypair, message: &[u8]) -> [u8; SIGNATURE_LEN];

    fn verify(
        &self,
        public_key: &[u8; PUBLIC_KEY_LEN],
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<()>;
}

/// 将加密后端注册进环境的服务包装。
pub struct CryptoService {
    provider: Arc<dyn CryptoProvider>,
}

impl CryptoService {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// 默认注册纯软件后端。
    pub fn software() -> Self {
        Self::new(Arc::new(SoftwareCrypto))
    }

    pub fn provider(&self) -> Arc<dyn CryptoProvider> {
        Arc::clone(&self.provider)
    }
}

impl EnvironmentService for CryptoService {}

/// 纯软件加密后端。
#[derive(Clone, Copy, Debug, Default)]
pub struct SoftwareCrypto;

impl CryptoProvider for SoftwareCrypto {
    fn fill_random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        let mut mac =
            <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    fn hkdf_sha256(&self, salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
        let salt = if salt.is_empty() { None } else { Some(salt) };
        Hkdf::<Sha256>::new(salt, ikm).expand(info, out).map_err(|_| {
            MatterError::implementation(
                codes::SERVICE_CONSTRUCTION,
                format!("hkdf output length {} out of bounds", out.len()),
            )
        })
    }

    fn pbkdf2_sha256(&self, secret: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, out);
    }

    fn aead_encrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| MatterError::implementation(codes::SERVICE_CONSTRUCTION, "bad aead key"))?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| MatterError::framing(codes::MESSAGE_DECRYPT_FAILED, "aead seal failed"))
    }

    fn aead_decrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        nonce: &[u8; AEAD_NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| MatterError::implementation(codes::SERVICE_CONSTRUCTION, "bad aead key"))?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| {
                MatterError::framing(codes::MESSAGE_DECRYPT_FAILED, "aead tag verification failed")
            })
    }

    fn generate_keypair(&self) -> OperationalKeypair {
        OperationalKeypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    fn sign(&self, keypair: &OperationalKeypair, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        keypair.signing.sign(message).to_bytes()
    }

    fn verify(
        &self,
        public_key: &[u8; PUBLIC_KEY_LEN],
        message: &[u8],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<()> {
        let key = VerifyingKey::from_bytes(public_key).map_err(|err| {
            MatterError::framing(codes::SESSION_INVALID_CERTIFICATE, "malformed public key")
                .with_cause(err)
        })?;
        key.verify(message, &Signature::from_bytes(signature))
            .map_err(|err| {
                MatterError::protocol(codes::SESSION_INVALID_CERTIFICATE, "signature mismatch")
                    .with_cause(err)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_roundtrip_and_tamper_detection() {
        let crypto = SoftwareCrypto;
        let key = [0x11u8; SYMMETRIC_KEY_LEN];
        let nonce = [0x22u8; AEAD_NONCE_LEN];
        let aad = b"header bytes";

        let sealed = crypto
            .aead_encrypt(&key, &nonce, aad, b"payload")
            .expect("encrypt");
        let opened = crypto
            .aead_decrypt(&key, &nonce, aad, &sealed)
            .expect("decrypt");
        assert_eq!(opened, b"payload");

        let mut tampered = sealed.clone();
        tampered[0] ^= 0x01;
        let err = crypto
            .aead_decrypt(&key, &nonce, aad, &tampered)
            .expect_err("tamper must fail");
        assert_eq!(err.code(), codes::MESSAGE_DECRYPT_FAILED);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let crypto = SoftwareCrypto;
        let keypair = crypto.generate_keypair();
        let sig = crypto.sign(&keypair, b"noc-tbs");
        crypto
            .verify(&keypair.public_key(), b"noc-tbs", &sig)
            .expect("valid signature");
        assert!(crypto.verify(&keypair.public_key(), b"other", &sig).is_err());
    }

    #[test]
    fn sha256_matches_known_vector() {
        let crypto = SoftwareCrypto;
        let digest = crypto.sha256(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn keypair_bytes_roundtrip() {
        let crypto = SoftwareCrypto;
        let keypair = crypto.generate_keypair();
        let restored = OperationalKeypair::from_bytes(&keypair.to_bytes());
        assert_eq!(keypair.public_key(), restored.public_key());
    }
}
