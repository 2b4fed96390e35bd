//! 操作证书模型：fabric PKI 链（RCAC → ICAC? → NOC）的构造与校验。
//!
//! # 契约说明（What）
//! - 证书以 TLV 结构承载：序列号、fabric、节点号（仅 NOC）、公钥、
//!   CA 标志与签发者签名；
//! - 链校验顺序：ICAC 存在时 root→ICAC→NOC，否则 root→NOC；fabric
//!   一致性与 CA 位同时校验；
//! - 签名算法由注册的加密后端决定，证书结构不绑定具体曲线。

use matter_codec_tlv::{Tag, TlvValue, decode, encode};
use matter_core::crypto::{CryptoProvider, OperationalKeypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{FabricId, NodeId};

/// 一张操作证书。
#[derive(Clone, Debug, PartialEq)]
pub struct OperationalCert {
    pub serial: u64,
    pub fabric_id: FabricId,
    /// NOC 必填；CA 证书为空。
    pub node_id: Option<NodeId>,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub is_ca: bool,
    pub signature: [u8; SIGNATURE_LEN],
}

impl OperationalCert {
    /// 待签名部分的规范字节。
    fn tbs_bytes(&self) -> Vec<u8> {
        let mut fields = vec![
            (Tag::Context(1), TlvValue::UnsignedInt(self.serial)),
            (Tag::Context(2), TlvValue::UnsignedInt(self.fabric_id.raw())),
            (Tag::Context(4), TlvValue::Bytes(self.public_key.to_vec())),
            (Tag::Context(5), TlvValue::Bool(self.is_ca)),
        ];
        if let Some(node_id) = self.node_id {
            fields.insert(2, (Tag::Context(3), TlvValue::UnsignedInt(node_id.raw())));
        }
        encode(&TlvValue::Structure(fields))
    }

    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![
            (Tag::Context(1), TlvValue::UnsignedInt(self.serial)),
            (Tag::Context(2), TlvValue::UnsignedInt(self.fabric_id.raw())),
            (Tag::Context(4), TlvValue::Bytes(self.public_key.to_vec())),
            (Tag::Context(5), TlvValue::Bool(self.is_ca)),
            (Tag::Context(6), TlvValue::Bytes(self.signature.to_vec())),
        ];
        if let Some(node_id) = self.node_id {
            fields.insert(2, (Tag::Context(3), TlvValue::UnsignedInt(node_id.raw())));
        }
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        let field_u64 = |tag: u8| value.field(tag).and_then(|v| v.as_u64());
        let field_bytes = |tag: u8| value.field(tag).and_then(|v| v.as_bytes());

        let public_key_raw = field_bytes(4).ok_or_else(|| malformed("public key"))?;
        let signature_raw = field_bytes(6).ok_or_else(|| malformed("signature"))?;
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        if public_key_raw.len() != PUBLIC_KEY_LEN || signature_raw.len() != SIGNATURE_LEN {
            return Err(malformed("key or signature length"));
        }
        public_key.copy_from_slice(public_key_raw);
        signature.copy_from_slice(signature_raw);

        Ok(Self {
            serial: field_u64(1).ok_or_else(|| malformed("serial"))?,
            fabric_id: FabricId(field_u64(2).ok_or_else(|| malformed("fabric id"))?),
            node_id: field_u64(3).map(NodeId),
            public_key,
            is_ca: value
                .field(5)
                .and_then(|v| v.as_bool())
                .ok_or_else(|| malformed("ca flag"))?,
            signature,
        })
    }

    /// 用签发者公钥校验本证书。
    pub fn verify_signed_by(
        &self,
        crypto: &dyn CryptoProvider,
        issuer_public_key: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<()> {
        crypto.verify(issuer_public_key, &self.tbs_bytes(), &self.signature)
    }
}

fn malformed(what: &str) -> MatterError {
    MatterError::framing(
        codes::SESSION_INVALID_CERTIFICATE,
        format!("certificate missing/invalid {what}"),
    )
}

/// 构造自签名根证书（RCAC）。
pub fn self_signed_root(crypto: &dyn CryptoProvider, keypair: &OperationalKeypair, serial: u64) -> OperationalCert {
    let mut cert = OperationalCert {
        serial,
        fabric_id: FabricId(0),
        node_id: None,
        public_key: keypair.public_key(),
        is_ca: true,
        signature: [0; SIGNATURE_LEN],
    };
    cert.signature = crypto.sign(keypair, &cert.tbs_bytes());
    cert
}

/// 由签发者（root 或 ICA）签发一张 NOC。
pub fn issue_noc(
    crypto: &dyn CryptoProvider,
    issuer: &OperationalKeypair,
    serial: u64,
    fabric_id: FabricId,
    node_id: NodeId,
    subject_public_key: [u8; PUBLIC_KEY_LEN],
) -> OperationalCert {
    let mut cert = OperationalCert {
        serial,
        fabric_id,
        node_id: Some(node_id),
        public_key: subject_public_key,
        is_ca: false,
        signature: [0; SIGNATURE_LEN],
    };
    cert.signature = crypto.sign(issuer, &cert.tbs_bytes());
    cert
}

/// 由 root 签发一张中间 CA 证书。
pub fn issue_icac(
    crypto: &dyn CryptoProvider,
    root: &OperationalKeypair,
    serial: u64,
    fabric_id: FabricId,
    subject_public_key: [u8; PUBLIC_KEY_LEN],
) -> OperationalCert {
    let mut cert = OperationalCert {
        serial,
        fabric_id,
        node_id: None,
        public_key: subject_public_key,
        is_ca: true,
        signature: [0; SIGNATURE_LEN],
    };
    cert.signature = crypto.sign(root, &cert.tbs_bytes());
    cert
}

/// NOC 链（NOC + 可选 ICAC）。
#[derive(Clone, Debug, PartialEq)]
pub struct NocChain {
    pub noc: OperationalCert,
    pub icac: Option<OperationalCert>,
}

impl NocChain {
    /// 校验整条链到给定 fabric 根。
    ///
    /// # 契约说明（What）
    /// - **前置条件**：`root_public_key` 必须来自本地信任的 RCAC；
    /// - **后置条件**：返回 `Ok` 时 NOC 的 `(fabric_id, node_id,
    ///   public_key)` 可作为对端身份使用。
    pub fn validate(
        &self,
        crypto: &dyn CryptoProvider,
        root_public_key: &[u8; PUBLIC_KEY_LEN],
        fabric_id: FabricId,
    ) -> Result<()> {
        if self.noc.is_ca || self.noc.node_id.is_none() {
            return Err(invalid_chain("noc must be a non-ca node certificate"));
        }
        if self.noc.fabric_id != fabric_id {
            return Err(invalid_chain("noc fabric mismatch"));
        }
        match &self.icac {
            Some(icac) => {
                if !icac.is_ca {
                    return Err(invalid_chain("icac missing ca flag"));
                }
                if icac.fabric_id != fabric_id {
                    return Err(invalid_chain("icac fabric mismatch"));
                }
                icac.verify_signed_by(crypto, root_public_key)?;
                self.noc.verify_signed_by(crypto, &icac.public_key)
            }
            None => self.noc.verify_signed_by(crypto, root_public_key),
        }
    }

    /// NOC 宣称的节点身份。
    pub fn node_id(&self) -> Result<NodeId> {
        self.noc
            .node_id
            .ok_or_else(|| invalid_chain("noc carries no node id"))
    }
}

fn invalid_chain(reason: &str) -> MatterError {
    MatterError::protocol(codes::SESSION_INVALID_CERTIFICATE, reason.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::crypto::SoftwareCrypto;

    #[test]
    fn direct_chain_validates() {
        let crypto = SoftwareCrypto;
        let root_keys = crypto.generate_keypair();
        let node_keys = crypto.generate_keypair();
        let noc = issue_noc(
            &crypto,
            &root_keys,
            1,
            FabricId(0x10),
            NodeId(0x55),
            node_keys.public_key(),
        );
        let chain = NocChain { noc, icac: None };
        chain
            .validate(&crypto, &root_keys.public_key(), FabricId(0x10))
            .expect("valid chain");
        assert_eq!(chain.node_id().expect("node id"), NodeId(0x55));
    }

    #[test]
    fn intermediate_chain_validates_and_detects_forgery() {
        let crypto = SoftwareCrypto;
        let root_keys = crypto.generate_keypair();
        let ica_keys = crypto.generate_keypair();
        let node_keys = crypto.generate_keypair();

        let icac = issue_icac(&crypto, &root_keys, 2, FabricId(0x10), ica_keys.public_key());
        let noc = issue_noc(
            &crypto,
            &ica_keys,
            3,
            FabricId(0x10),
            NodeId(0x66),
            node_keys.public_key(),
        );
        let chain = NocChain {
            noc: noc.clone(),
            icac: Some(icac),
        };
        chain
            .validate(&crypto, &root_keys.public_key(), FabricId(0x10))
            .expect("valid chain");

        // 其它根签不出这条链。
        let other_root = crypto.generate_keypair();
        assert!(
            chain
                .validate(&crypto, &other_root.public_key(), FabricId(0x10))
                .is_err()
        );

        // 篡改 fabric 号破坏签名。
        let mut tampered = noc;
        tampered.fabric_id = FabricId(0x11);
        let chain = NocChain {
            noc: tampered,
            icac: None,
        };
        assert!(
            chain
                .validate(&crypto, &root_keys.public_key(), FabricId(0x11))
                .is_err()
        );
    }

    #[test]
    fn cert_tlv_roundtrip() {
        let crypto = SoftwareCrypto;
        let keys = crypto.generate_keypair();
        let cert = self_signed_root(&crypto, &keys, 9);
        let decoded = OperationalCert::from_tlv(&cert.to_tlv()).expect("decode");
        assert_eq!(decoded, cert);
        decoded
            .verify_signed_by(&crypto, &keys.public_key())
            .expect("self signature");
    }
}
