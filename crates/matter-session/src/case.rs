//! CASE：证书认证的运营会话建立（Sigma1/2/3 与恢复快路径）。
//!
//! # 流程（What）
//! - 全量握手：`Sigma1 → Sigma2 → Sigma3`；双方交换 NOC 链并用操作
//!   密钥对传输脚本签名，链校验到各自信任的 fabric 根；
//! - 目的标识：`Sigma1.destination_id` 以 IPK 对 `(随机数, 根公钥,
//!   fabric, 目标节点)` 做 HMAC，响应方据此定位本地 fabric 而不暴露
//!   身份；
//! - 恢复：携带过往会话的 `resumption_id` 时，双方以缓存的恢复密钥
//!   直接走 `Sigma2Resume`，跳过证书交换。
//!
//! # 密钥（How）
//! 方向密钥 = HKDF(ikm = IPK ‖ 双方 NOC 公钥, salt = 双方随机数,
//! info = "SessionKeys")；恢复路径的 ikm 为缓存的恢复密钥。

use crate::cert::NocChain;
use crate::session::{SessionKeys, derive_session_keys};
use matter_codec_tlv::{Tag, TlvValue, decode, encode};
use matter_core::crypto::{CryptoProvider, OperationalKeypair, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{FabricId, FabricIndex, NodeId, SessionId};
use std::sync::Arc;

const RANDOM_LEN: usize = 32;
/// 恢复标识长度。
pub const RESUMPTION_ID_LEN: usize = 16;

/// 会话建立所需的本地 fabric 凭据视图（fabric 管理器产出）。
#[derive(Clone)]
pub struct FabricCredentials {
    pub fabric_index: FabricIndex,
    pub fabric_id: FabricId,
    pub local_node_id: NodeId,
    pub root_public_key: [u8; PUBLIC_KEY_LEN],
    pub ipk: [u8; 16],
    pub noc_chain: NocChain,
    pub keypair: Arc<OperationalKeypair>,
}

impl std::fmt::Debug for FabricCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricCredentials")
            .field("fabric_index", &self.fabric_index)
            .field("fabric_id", &self.fabric_id)
            .field("local_node_id", &self.local_node_id)
            .finish()
    }
}

impl FabricCredentials {
    /// 计算指向 `peer` 的目的标识。
    pub fn destination_id(
        &self,
        crypto: &dyn CryptoProvider,
        initiator_random: &[u8],
        peer: NodeId,
    ) -> [u8; 32] {
        let mut input = initiator_random.to_vec();
        input.extend_from_slice(&self.root_public_key);
        input.extend_from_slice(&self.fabric_id.raw().to_le_bytes());
        input.extend_from_slice(&peer.raw().to_le_bytes());
        crypto.hmac_sha256(&self.ipk, &input)
    }
}

/// 可恢复会话的缓存记录（持久化于 `sessions/resumption/<peer>`）。
#[derive(Clone, Debug, PartialEq)]
pub struct ResumptionRecord {
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    pub shared_secret: [u8; 32],
    pub peer_node_id: NodeId,
    pub fabric_index: FabricIndex,
}

// ---- 消息模型 ----

#[derive(Clone, Debug, PartialEq)]
pub struct Sigma1 {
    pub initiator_random: Vec<u8>,
    pub initiator_session_id: u16,
    pub destination_id: Vec<u8>,
    pub resumption_id: Option<Vec<u8>>,
}

impl Sigma1 {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![
            (Tag::Context(1), TlvValue::Bytes(self.initiator_random.clone())),
            (
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(self.initiator_session_id)),
            ),
            (Tag::Context(3), TlvValue::Bytes(self.destination_id.clone())),
        ];
        if let Some(resumption_id) = &self.resumption_id {
            fields.push((Tag::Context(6), TlvValue::Bytes(resumption_id.clone())));
        }
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            initiator_random: required_bytes(&value, 1)?,
            initiator_session_id: required_u16(&value, 2)?,
            destination_id: required_bytes(&value, 3)?,
            resumption_id: value.field(6).and_then(|v| v.as_bytes()).map(<[u8]>::to_vec),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sigma2 {
    pub responder_random: Vec<u8>,
    pub responder_session_id: u16,
    pub responder_noc: Vec<u8>,
    pub responder_icac: Option<Vec<u8>>,
    pub signature: Vec<u8>,
    pub resumption_id: Vec<u8>,
}

impl Sigma2 {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![
            (Tag::Context(1), TlvValue::Bytes(self.responder_random.clone())),
            (
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(self.responder_session_id)),
            ),
            (Tag::Context(3), TlvValue::Bytes(self.responder_noc.clone())),
            (Tag::Context(5), TlvValue::Bytes(self.signature.clone())),
            (Tag::Context(6), TlvValue::Bytes(self.resumption_id.clone())),
        ];
        if let Some(icac) = &self.responder_icac {
            fields.insert(3, (Tag::Context(4), TlvValue::Bytes(icac.clone())));
        }
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            responder_random: required_bytes(&value, 1)?,
            responder_session_id: required_u16(&value, 2)?,
            responder_noc: required_bytes(&value, 3)?,
            responder_icac: value.field(4).and_then(|v| v.as_bytes()).map(<[u8]>::to_vec),
            signature: required_bytes(&value, 5)?,
            resumption_id: required_bytes(&value, 6)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sigma3 {
    pub initiator_noc: Vec<u8>,
    pub initiator_icac: Option<Vec<u8>>,
    pub signature: Vec<u8>,
}

impl Sigma3 {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![(Tag::Context(1), TlvValue::Bytes(self.initiator_noc.clone()))];
        if let Some(icac) = &self.initiator_icac {
            fields.push((Tag::Context(2), TlvValue::Bytes(icac.clone())));
        }
        fields.push((Tag::Context(3), TlvValue::Bytes(self.signature.clone())));
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            initiator_noc: required_bytes(&value, 1)?,
            initiator_icac: value.field(2).and_then(|v| v.as_bytes()).map(<[u8]>::to_vec),
            signature: required_bytes(&value, 3)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sigma2Resume {
    pub responder_session_id: u16,
    pub resume_mic: Vec<u8>,
}

impl Sigma2Resume {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (
                Tag::Context(1),
                TlvValue::UnsignedInt(u64::from(self.responder_session_id)),
            ),
            (Tag::Context(2), TlvValue::Bytes(self.resume_mic.clone())),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            responder_session_id: required_u16(&value, 1)?,
            resume_mic: required_bytes(&value, 2)?,
        })
    }
}

fn required_bytes(value: &TlvValue, tag: u8) -> Result<Vec<u8>> {
    value
        .field(tag)
        .and_then(|v| v.as_bytes())
        .map(<[u8]>::to_vec)
        .ok_or_else(|| {
            MatterError::framing(
                codes::TLV_MALFORMED,
                format!("case payload missing field {tag}"),
            )
        })
}

fn required_u16(value: &TlvValue, tag: u8) -> Result<u16> {
    value
        .field(tag)
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| {
            MatterError::framing(
                codes::TLV_MALFORMED,
                format!("case payload missing field {tag}"),
            )
        })
}

// ---- 派生与签名辅助 ----

fn full_ikm(ipk: &[u8; 16], initiator_pub: &[u8], responder_pub: &[u8]) -> Vec<u8> {
    let mut ikm = ipk.to_vec();
    ikm.extend_from_slice(initiator_pub);
    ikm.extend_from_slice(responder_pub);
    ikm
}

fn salt(initiator_random: &[u8], responder_random: &[u8]) -> Vec<u8> {
    let mut s = initiator_random.to_vec();
    s.extend_from_slice(responder_random);
    s
}

fn sigma2_tbs(sigma1: &Sigma1, responder_random: &[u8], responder_noc: &[u8]) -> Vec<u8> {
    let mut tbs = sigma1.to_tlv();
    tbs.extend_from_slice(responder_random);
    tbs.extend_from_slice(responder_noc);
    tbs
}

fn sigma3_tbs(sigma1: &Sigma1, responder_random: &[u8], initiator_noc: &[u8]) -> Vec<u8> {
    let mut tbs = sigma1.to_tlv();
    tbs.extend_from_slice(responder_random);
    tbs.extend_from_slice(b"sigma3");
    tbs.extend_from_slice(initiator_noc);
    tbs
}

fn to_signature(raw: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let mut sig = [0u8; SIGNATURE_LEN];
    if raw.len() != SIGNATURE_LEN {
        return Err(MatterError::framing(
            codes::SESSION_INVALID_CERTIFICATE,
            "signature length mismatch",
        ));
    }
    sig.copy_from_slice(raw);
    Ok(sig)
}

fn decode_chain(noc: &[u8], icac: Option<&Vec<u8>>) -> Result<NocChain> {
    Ok(NocChain {
        noc: crate::cert::OperationalCert::from_tlv(noc)?,
        icac: icac
            .map(|bytes| crate::cert::OperationalCert::from_tlv(bytes))
            .transpose()?,
    })
}

/// 建立成功的产物。
#[derive(Debug)]
pub struct CaseOutcome {
    pub keys: SessionKeys,
    pub peer_session_id: SessionId,
    pub peer_node_id: NodeId,
    pub fabric_index: FabricIndex,
    pub resumption: ResumptionRecord,
}

// ---- 发起方 ----

/// CASE 发起方状态机。
pub struct CaseInitiator {
    crypto: Arc<dyn CryptoProvider>,
    fabric: FabricCredentials,
    peer_node_id: NodeId,
    local_session_id: SessionId,
    initiator_random: Vec<u8>,
    resumption: Option<ResumptionRecord>,
    sigma1: Option<Sigma1>,
}

impl CaseInitiator {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        fabric: FabricCredentials,
        peer_node_id: NodeId,
        local_session_id: SessionId,
        resumption: Option<ResumptionRecord>,
    ) -> Self {
        let mut initiator_random = vec![0u8; RANDOM_LEN];
        crypto.fill_random(&mut initiator_random);
        Self {
            crypto,
            fabric,
            peer_node_id,
            local_session_id,
            initiator_random,
            resumption,
            sigma1: None,
        }
    }

    /// 产出 Sigma1（有缓存恢复记录时自动携带 resumption id）。
    pub fn sigma1(&mut self) -> Sigma1 {
        let sigma1 = Sigma1 {
            initiator_random: self.initiator_random.clone(),
            initiator_session_id: self.local_session_id.raw(),
            destination_id: self
                .fabric
                .destination_id(self.crypto.as_ref(), &self.initiator_random, self.peer_node_id)
                .to_vec(),
            resumption_id: self
                .resumption
                .as_ref()
                .map(|record| record.resumption_id.to_vec()),
        };
        self.sigma1 = Some(sigma1.clone());
        sigma1
    }

    /// 全量路径：校验 Sigma2，产出 Sigma3。
    pub fn on_sigma2(&mut self, sigma2: &Sigma2) -> Result<(Sigma3, CaseOutcome)> {
        let sigma1 = self
            .sigma1
            .as_ref()
            .ok_or_else(|| establishment_failed("sigma2 before sigma1"))?;

        let peer_chain = decode_chain(&sigma2.responder_noc, sigma2.responder_icac.as_ref())?;
        peer_chain.validate(
            self.crypto.as_ref(),
            &self.fabric.root_public_key,
            self.fabric.fabric_id,
        )?;
        let peer_node = peer_chain.node_id()?;
        if peer_node != self.peer_node_id {
            return Err(establishment_failed("responder noc names a different node"));
        }
        let tbs = sigma2_tbs(sigma1, &sigma2.responder_random, &sigma2.responder_noc);
        self.crypto.verify(
            &peer_chain.noc.public_key,
            &tbs,
            &to_signature(&sigma2.signature)?,
        )?;

        let local_noc = self.fabric.noc_chain.noc.to_tlv();
        let sigma3_tbs = sigma3_tbs(sigma1, &sigma2.responder_random, &local_noc);
        let sigma3 = Sigma3 {
            initiator_noc: local_noc,
            initiator_icac: self
                .fabric
                .noc_chain
                .icac
                .as_ref()
                .map(|icac| icac.to_tlv()),
            signature: self
                .crypto
                .sign(&self.fabric.keypair, &sigma3_tbs)
                .to_vec(),
        };

        let ikm = full_ikm(
            &self.fabric.ipk,
            &self.fabric.noc_chain.noc.public_key,
            &peer_chain.noc.public_key,
        );
        let salt = salt(&self.initiator_random, &sigma2.responder_random);
        let keys = derive_session_keys(self.crypto.as_ref(), &ikm, &salt, b"SessionKeys")?;

        let mut resumption_id = [0u8; RESUMPTION_ID_LEN];
        if sigma2.resumption_id.len() == RESUMPTION_ID_LEN {
            resumption_id.copy_from_slice(&sigma2.resumption_id);
        }
        let resumption = ResumptionRecord {
            resumption_id,
            shared_secret: self.crypto.hmac_sha256(&ikm, b"resumption-secret"),
            peer_node_id: self.peer_node_id,
            fabric_index: self.fabric.fabric_index,
        };

        Ok((
            sigma3,
            CaseOutcome {
                keys,
                peer_session_id: SessionId(sigma2.responder_session_id),
                peer_node_id: self.peer_node_id,
                fabric_index: self.fabric.fabric_index,
                resumption,
            },
        ))
    }

    /// 恢复路径：校验 Sigma2Resume。
    pub fn on_sigma2_resume(&mut self, resume: &Sigma2Resume) -> Result<CaseOutcome> {
        let record = self
            .resumption
            .clone()
            .ok_or_else(|| establishment_failed("resume without cached record"))?;
        let expected = self.crypto.hmac_sha256(
            &record.shared_secret,
            &[self.initiator_random.as_slice(), b"resume-mic"].concat(),
        );
        if resume.resume_mic != expected {
            return Err(establishment_failed("resume mic mismatch"));
        }
        let keys = derive_session_keys(
            self.crypto.as_ref(),
            &record.shared_secret,
            &self.initiator_random,
            b"ResumedSessionKeys",
        )?;
        Ok(CaseOutcome {
            keys,
            peer_session_id: SessionId(resume.responder_session_id),
            peer_node_id: self.peer_node_id,
            fabric_index: self.fabric.fabric_index,
            resumption: record,
        })
    }
}

// ---- 响应方 ----

/// Sigma1 处理结果：全量或恢复。
pub enum ResponderReply {
    Sigma2(Sigma2),
    Resume(Sigma2Resume, CaseOutcome),
}

/// CASE 响应方状态机。
pub struct CaseResponder {
    crypto: Arc<dyn CryptoProvider>,
    fabric: FabricCredentials,
    local_session_id: SessionId,
    responder_random: Vec<u8>,
    resumption_id: [u8; RESUMPTION_ID_LEN],
    pending: Option<PendingSigma3>,
}

struct PendingSigma3 {
    sigma1: Sigma1,
    ikm_prefix: [u8; 16],
}

impl CaseResponder {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        fabric: FabricCredentials,
        local_session_id: SessionId,
    ) -> Self {
        let mut responder_random = vec![0u8; RANDOM_LEN];
        crypto.fill_random(&mut responder_random);
        let mut resumption_id = [0u8; RESUMPTION_ID_LEN];
        crypto.fill_random(&mut resumption_id);
        Self {
            crypto,
            fabric,
            local_session_id,
            responder_random,
            resumption_id,
            pending: None,
        }
    }

    /// 检查 Sigma1 的目的标识是否指向本 fabric 的本节点。
    pub fn matches_destination(&self, sigma1: &Sigma1) -> bool {
        let expected = self.fabric.destination_id(
            self.crypto.as_ref(),
            &sigma1.initiator_random,
            self.fabric.local_node_id,
        );
        sigma1.destination_id == expected
    }

    /// 处理 Sigma1：命中恢复记录走快路径，否则产出 Sigma2。
    pub fn on_sigma1(
        &mut self,
        sigma1: &Sigma1,
        cached_resumption: Option<&ResumptionRecord>,
    ) -> Result<ResponderReply> {
        if !self.matches_destination(sigma1) {
            return Err(MatterError::protocol(
                codes::SESSION_ESTABLISHMENT_FAILED,
                "destination id does not match any local fabric",
            ));
        }

        if let (Some(requested), Some(record)) = (&sigma1.resumption_id, cached_resumption) {
            if requested.as_slice() == record.resumption_id {
                let mic = self.crypto.hmac_sha256(
                    &record.shared_secret,
                    &[sigma1.initiator_random.as_slice(), b"resume-mic"].concat(),
                );
                let keys = derive_session_keys(
                    self.crypto.as_ref(),
                    &record.shared_secret,
                    &sigma1.initiator_random,
                    b"ResumedSessionKeys",
                )?;
                let outcome = CaseOutcome {
                    keys,
                    peer_session_id: SessionId(sigma1.initiator_session_id),
                    peer_node_id: record.peer_node_id,
                    fabric_index: self.fabric.fabric_index,
                    resumption: record.clone(),
                };
                return Ok(ResponderReply::Resume(
                    Sigma2Resume {
                        responder_session_id: self.local_session_id.raw(),
                        resume_mic: mic.to_vec(),
                    },
                    outcome,
                ));
            }
        }

        let local_noc = self.fabric.noc_chain.noc.to_tlv();
        let tbs = sigma2_tbs(sigma1, &self.responder_random, &local_noc);
        let sigma2 = Sigma2 {
            responder_random: self.responder_random.clone(),
            responder_session_id: self.local_session_id.raw(),
            responder_noc: local_noc,
            responder_icac: self
                .fabric
                .noc_chain
                .icac
                .as_ref()
                .map(|icac| icac.to_tlv()),
            signature: self.crypto.sign(&self.fabric.keypair, &tbs).to_vec(),
            resumption_id: self.resumption_id.to_vec(),
        };
        self.pending = Some(PendingSigma3 {
            sigma1: sigma1.clone(),
            ikm_prefix: self.fabric.ipk,
        });
        Ok(ResponderReply::Sigma2(sigma2))
    }

    /// 处理 Sigma3，完成全量握手。
    pub fn on_sigma3(&mut self, sigma3: &Sigma3) -> Result<CaseOutcome> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| establishment_failed("sigma3 before sigma1"))?;

        let peer_chain = decode_chain(&sigma3.initiator_noc, sigma3.initiator_icac.as_ref())?;
        peer_chain.validate(
            self.crypto.as_ref(),
            &self.fabric.root_public_key,
            self.fabric.fabric_id,
        )?;
        let tbs = sigma3_tbs(&pending.sigma1, &self.responder_random, &sigma3.initiator_noc);
        self.crypto.verify(
            &peer_chain.noc.public_key,
            &tbs,
            &to_signature(&sigma3.signature)?,
        )?;

        let peer_node_id = peer_chain.node_id()?;
        let ikm = full_ikm(
            &pending.ikm_prefix,
            &peer_chain.noc.public_key,
            &self.fabric.noc_chain.noc.public_key,
        );
        let salt = salt(&pending.sigma1.initiator_random, &self.responder_random);
        let keys = derive_session_keys(self.crypto.as_ref(), &ikm, &salt, b"SessionKeys")?;

        Ok(CaseOutcome {
            keys,
            peer_session_id: SessionId(pending.sigma1.initiator_session_id),
            peer_node_id,
            fabric_index: self.fabric.fabric_index,
            resumption: ResumptionRecord {
                resumption_id: self.resumption_id,
                shared_secret: self.crypto.hmac_sha256(&ikm, b"resumption-secret"),
                peer_node_id,
                fabric_index: self.fabric.fabric_index,
            },
        })
    }
}

fn establishment_failed(reason: &str) -> MatterError {
    MatterError::protocol(
        codes::SESSION_ESTABLISHMENT_FAILED,
        format!("case: {reason}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{issue_noc, self_signed_root};
    use matter_core::crypto::SoftwareCrypto;

    fn fabric_pair() -> (FabricCredentials, FabricCredentials) {
        let crypto = SoftwareCrypto;
        let root_keys = crypto.generate_keypair();
        let root_cert = self_signed_root(&crypto, &root_keys, 1);
        let fabric_id = FabricId(0x2906);
        let ipk = [0x42u8; 16];

        let make = |node_id: NodeId, serial: u64| {
            let node_keys = crypto.generate_keypair();
            let noc = issue_noc(
                &crypto,
                &root_keys,
                serial,
                fabric_id,
                node_id,
                node_keys.public_key(),
            );
            FabricCredentials {
                fabric_index: FabricIndex(1),
                fabric_id,
                local_node_id: node_id,
                root_public_key: root_cert.public_key,
                ipk,
                noc_chain: NocChain { noc, icac: None },
                keypair: Arc::new(node_keys),
            }
        };
        (make(NodeId(0x1001), 2), make(NodeId(0x2002), 3))
    }

    #[test]
    fn full_handshake_derives_matching_keys() {
        let (controller, device) = fabric_pair();
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);

        let mut initiator = CaseInitiator::new(
            Arc::clone(&crypto),
            controller,
            NodeId(0x2002),
            SessionId(31),
            None,
        );
        let mut responder = CaseResponder::new(Arc::clone(&crypto), device, SessionId(32));

        let sigma1 = Sigma1::from_tlv(&initiator.sigma1().to_tlv()).expect("sigma1");
        let ResponderReply::Sigma2(sigma2) =
            responder.on_sigma1(&sigma1, None).expect("sigma2")
        else {
            panic!("expected full handshake");
        };
        let sigma2 = Sigma2::from_tlv(&sigma2.to_tlv()).expect("sigma2 tlv");
        let (sigma3, initiator_outcome) = initiator.on_sigma2(&sigma2).expect("sigma3");
        let sigma3 = Sigma3::from_tlv(&sigma3.to_tlv()).expect("sigma3 tlv");
        let responder_outcome = responder.on_sigma3(&sigma3).expect("outcome");

        assert_eq!(
            initiator_outcome.keys.initiator_to_responder,
            responder_outcome.keys.initiator_to_responder
        );
        assert_eq!(responder_outcome.peer_node_id, NodeId(0x1001));
        assert_eq!(initiator_outcome.peer_node_id, NodeId(0x2002));
        assert_eq!(
            initiator_outcome.resumption.resumption_id,
            responder_outcome.resumption.resumption_id
        );
    }

    #[test]
    fn resumption_skips_certificate_exchange() {
        let (controller, device) = fabric_pair();
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);

        // 先跑一轮全量握手拿到恢复记录。
        let mut initiator = CaseInitiator::new(
            Arc::clone(&crypto),
            controller.clone(),
            NodeId(0x2002),
            SessionId(41),
            None,
        );
        let mut responder = CaseResponder::new(Arc::clone(&crypto), device.clone(), SessionId(42));
        let sigma1 = initiator.sigma1();
        let ResponderReply::Sigma2(sigma2) =
            responder.on_sigma1(&sigma1, None).expect("sigma2")
        else {
            panic!("expected full handshake");
        };
        let (sigma3, initiator_outcome) = initiator.on_sigma2(&sigma2).expect("sigma3");
        let responder_outcome = responder.on_sigma3(&sigma3).expect("outcome");

        // 恢复路径。
        let mut resumed_initiator = CaseInitiator::new(
            Arc::clone(&crypto),
            controller,
            NodeId(0x2002),
            SessionId(51),
            Some(initiator_outcome.resumption),
        );
        let mut resumed_responder =
            CaseResponder::new(Arc::clone(&crypto), device, SessionId(52));
        let sigma1 = resumed_initiator.sigma1();
        assert!(sigma1.resumption_id.is_some());
        let ResponderReply::Resume(resume, responder_resumed) = resumed_responder
            .on_sigma1(&sigma1, Some(&responder_outcome.resumption))
            .expect("resume")
        else {
            panic!("expected resume path");
        };
        let initiator_resumed = resumed_initiator
            .on_sigma2_resume(&resume)
            .expect("resume outcome");
        assert_eq!(
            initiator_resumed.keys.initiator_to_responder,
            responder_resumed.keys.initiator_to_responder
        );
    }

    #[test]
    fn wrong_destination_is_rejected() {
        let (controller, device) = fabric_pair();
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let mut initiator = CaseInitiator::new(
            Arc::clone(&crypto),
            controller,
            NodeId(0xdead),
            SessionId(61),
            None,
        );
        let mut responder = CaseResponder::new(Arc::clone(&crypto), device, SessionId(62));
        let sigma1 = initiator.sigma1();
        assert!(responder.on_sigma1(&sigma1, None).is_err());
    }
}
