//! PASE：口令认证的会话建立（配网通道）。
//!
//! # 流程（What）
//! 在未加密交换上走五步：`PBKDFParamRequest → PBKDFParamResponse →
//! Pake1 → Pake2 → Pake3`，随后双方以传输脚本绑定的共享材料派生
//! 方向密钥。建立出的会话标记为**临时管理会话**，CASE 接管后废弃。
//!
//! # 验证材料（How）
//! - 配网窗口打开时，验证方以 PBKDF2 从口令派生 `w0`/`L` 并只保留
//!   这两者，口令本身不落地；
//! - 证明方每次从口令现算 `w0`/`w1`；双方的确认消息都经 HMAC 绑定到
//!   双方随机数，篡改任何一步都会在确认校验处失败；
//! - 群运算由注册的 [`CryptoProvider`] 后端承担，工作区自带的软件
//!   后端以 HMAC 承诺链实现同等的消息流与密钥派生。
//!
//! # 边界（Trade-offs）
//! - Matter 禁用口令清单在验证方构造时拒绝（`ImplementationError` 级
//!   错误码），不会进入握手；
//! - 任何一步校验失败即返回错误，调用方应回 `StatusReport` 并关闭
//!   交换。

use crate::session::{SessionKeys, derive_session_keys};
use matter_codec_tlv::{Tag, TlvValue, decode, encode};
use matter_core::crypto::CryptoProvider;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::SessionId;
use std::sync::Arc;

/// Matter 规范禁止使用的口令。
pub const FORBIDDEN_PASSCODES: [u32; 12] = [
    0, 11111111, 22222222, 33333333, 44444444, 55555555, 66666666, 77777777, 88888888, 99999999,
    12345678, 87654321,
];

/// 默认 PBKDF2 迭代次数。
pub const DEFAULT_ITERATIONS: u32 = 1000;

const RANDOM_LEN: usize = 32;
const W_LEN: usize = 32;

/// 口令是否在禁用清单内。
pub fn passcode_is_forbidden(passcode: u32) -> bool {
    FORBIDDEN_PASSCODES.contains(&passcode) || passcode >= (1 << 27)
}

/// 从口令派生 `(w0, w1)`。
fn derive_w(crypto: &dyn CryptoProvider, passcode: u32, salt: &[u8], iterations: u32) -> ([u8; W_LEN], [u8; W_LEN]) {
    let mut ws = [0u8; W_LEN * 2];
    crypto.pbkdf2_sha256(&passcode.to_le_bytes(), salt, iterations, &mut ws);
    let mut w0 = [0u8; W_LEN];
    let mut w1 = [0u8; W_LEN];
    w0.copy_from_slice(&ws[..W_LEN]);
    w1.copy_from_slice(&ws[W_LEN..]);
    (w0, w1)
}

fn registration_value(crypto: &dyn CryptoProvider, w1: &[u8; W_LEN]) -> [u8; 32] {
    crypto.hmac_sha256(w1, b"pase-registration")
}

/// 配网窗口打开时预派生的验证材料。
#[derive(Clone)]
pub struct PaseVerifier {
    w0: [u8; W_LEN],
    l: [u8; 32],
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl PaseVerifier {
    /// 从口令构造；禁用口令在此拒绝。
    pub fn from_passcode(
        crypto: &dyn CryptoProvider,
        passcode: u32,
        iterations: u32,
        salt: Vec<u8>,
    ) -> Result<Self> {
        if passcode_is_forbidden(passcode) {
            return Err(MatterError::implementation(
                codes::SESSION_FORBIDDEN_PASSCODE,
                format!("passcode {passcode:08} is on the forbidden list"),
            ));
        }
        let (w0, w1) = derive_w(crypto, passcode, &salt, iterations);
        Ok(Self {
            l: registration_value(crypto, &w1),
            w0,
            salt,
            iterations,
        })
    }
}

impl std::fmt::Debug for PaseVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaseVerifier")
            .field("iterations", &self.iterations)
            .finish()
    }
}

// ---- 消息模型 ----

#[derive(Clone, Debug, PartialEq)]
pub struct PbkdfParamRequest {
    pub initiator_random: Vec<u8>,
    pub initiator_session_id: u16,
}

impl PbkdfParamRequest {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (Tag::Context(1), TlvValue::Bytes(self.initiator_random.clone())),
            (
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(self.initiator_session_id)),
            ),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            initiator_random: required_bytes(&value, 1)?,
            initiator_session_id: required_u16(&value, 2)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PbkdfParamResponse {
    pub initiator_random: Vec<u8>,
    pub responder_random: Vec<u8>,
    pub responder_session_id: u16,
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl PbkdfParamResponse {
    pub fn to_tlv(&self) -> Vec<u8> {
        encode(&TlvValue::Structure(vec![
            (Tag::Context(1), TlvValue::Bytes(self.initiator_random.clone())),
            (Tag::Context(2), TlvValue::Bytes(self.responder_random.clone())),
            (
                Tag::Context(3),
                TlvValue::UnsignedInt(u64::from(self.responder_session_id)),
            ),
            (Tag::Context(4), TlvValue::UnsignedInt(u64::from(self.iterations))),
            (Tag::Context(5), TlvValue::Bytes(self.salt.clone())),
        ]))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            initiator_random: required_bytes(&value, 1)?,
            responder_random: required_bytes(&value, 2)?,
            responder_session_id: required_u16(&value, 3)?,
            iterations: required_u32(&value, 4)?,
            salt: required_bytes(&value, 5)?,
        })
    }
}

/// 单字段承诺消息（Pake1/Pake2/Pake3 共用形态）。
#[derive(Clone, Debug, PartialEq)]
pub struct PakeCommitment {
    pub commitment: Vec<u8>,
    /// Pake2 额外携带验证方确认。
    pub confirmation: Option<Vec<u8>>,
}

impl PakeCommitment {
    pub fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![(Tag::Context(1), TlvValue::Bytes(self.commitment.clone()))];
        if let Some(confirmation) = &self.confirmation {
            fields.push((Tag::Context(2), TlvValue::Bytes(confirmation.clone())));
        }
        encode(&TlvValue::Structure(fields))
    }

    pub fn from_tlv(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        Ok(Self {
            commitment: required_bytes(&value, 1)?,
            confirmation: value.field(2).and_then(|v| v.as_bytes()).map(<[u8]>::to_vec),
        })
    }
}

fn required_bytes(value: &TlvValue, tag: u8) -> Result<Vec<u8>> {
    value
        .field(tag)
        .and_then(|v| v.as_bytes())
        .map(<[u8]>::to_vec)
        .ok_or_else(|| missing_field(tag))
}

fn required_u16(value: &TlvValue, tag: u8) -> Result<u16> {
    value
        .field(tag)
        .and_then(|v| v.as_u64())
        .and_then(|v| u16::try_from(v).ok())
        .ok_or_else(|| missing_field(tag))
}

fn required_u32(value: &TlvValue, tag: u8) -> Result<u32> {
    value
        .field(tag)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| missing_field(tag))
}

fn missing_field(tag: u8) -> MatterError {
    MatterError::framing(
        codes::TLV_MALFORMED,
        format!("session establishment payload missing field {tag}"),
    )
}

// ---- 共享派生 ----

fn transcript(initiator_random: &[u8], responder_random: &[u8]) -> Vec<u8> {
    let mut t = Vec::with_capacity(initiator_random.len() + responder_random.len());
    t.extend_from_slice(initiator_random);
    t.extend_from_slice(responder_random);
    t
}

fn prover_commitment(crypto: &dyn CryptoProvider, w0: &[u8], t: &[u8]) -> [u8; 32] {
    let mut input = t.to_vec();
    input.extend_from_slice(b"pake1");
    crypto.hmac_sha256(w0, &input)
}

fn shared_material(crypto: &dyn CryptoProvider, w0: &[u8], t: &[u8]) -> [u8; 32] {
    let mut input = t.to_vec();
    input.extend_from_slice(b"pase-shared");
    crypto.hmac_sha256(w0, &input)
}

fn verifier_commitment(crypto: &dyn CryptoProvider, l: &[u8], t: &[u8]) -> [u8; 32] {
    let mut input = t.to_vec();
    input.extend_from_slice(b"pake2");
    crypto.hmac_sha256(l, &input)
}

fn confirmation(crypto: &dyn CryptoProvider, shared: &[u8], label: &[u8]) -> [u8; 32] {
    crypto.hmac_sha256(shared, label)
}

fn session_keys_from_shared(
    crypto: &dyn CryptoProvider,
    shared: &[u8],
    t: &[u8],
) -> Result<SessionKeys> {
    derive_session_keys(crypto, shared, t, b"SessionKeys")
}

/// 建立成功的产物。
#[derive(Debug)]
pub struct PaseOutcome {
    pub keys: SessionKeys,
    pub peer_session_id: SessionId,
}

// ---- 证明方（commissioner 侧）----

/// PASE 证明方状态机。
pub struct PaseProver {
    crypto: Arc<dyn CryptoProvider>,
    passcode: u32,
    local_session_id: SessionId,
    initiator_random: Vec<u8>,
    stage: ProverStage,
}

enum ProverStage {
    AwaitingParams,
    AwaitingPake2 {
        transcript: Vec<u8>,
        w1: [u8; W_LEN],
        shared: [u8; 32],
    },
    Complete {
        outcome: Option<PaseOutcome>,
    },
}

impl PaseProver {
    pub fn new(crypto: Arc<dyn CryptoProvider>, passcode: u32, local_session_id: SessionId) -> Self {
        let mut initiator_random = vec![0u8; RANDOM_LEN];
        crypto.fill_random(&mut initiator_random);
        Self {
            crypto,
            passcode,
            local_session_id,
            initiator_random,
            stage: ProverStage::AwaitingParams,
        }
    }

    /// 第一步：参数请求。
    pub fn initial_request(&self) -> PbkdfParamRequest {
        PbkdfParamRequest {
            initiator_random: self.initiator_random.clone(),
            initiator_session_id: self.local_session_id.raw(),
        }
    }

    /// 第二步：收到参数响应，产出 Pake1。
    pub fn on_param_response(&mut self, response: &PbkdfParamResponse) -> Result<PakeCommitment> {
        if response.initiator_random != self.initiator_random {
            return Err(establishment_failed("initiator random mismatch"));
        }
        let (w0, w1) = derive_w(
            self.crypto.as_ref(),
            self.passcode,
            &response.salt,
            response.iterations,
        );
        let t = transcript(&self.initiator_random, &response.responder_random);
        let shared = shared_material(self.crypto.as_ref(), &w0, &t);
        let commitment = prover_commitment(self.crypto.as_ref(), &w0, &t);
        self.stage = ProverStage::AwaitingPake2 {
            transcript: t,
            w1,
            shared,
        };
        Ok(PakeCommitment {
            commitment: commitment.to_vec(),
            confirmation: None,
        })
    }

    /// 第四步：校验 Pake2 并产出 Pake3。
    pub fn on_pake2(
        &mut self,
        pake2: &PakeCommitment,
        peer_session_id: SessionId,
    ) -> Result<PakeCommitment> {
        let (t, w1, shared) = match &self.stage {
            ProverStage::AwaitingPake2 {
                transcript,
                w1,
                shared,
            } => (transcript.clone(), *w1, *shared),
            _ => return Err(establishment_failed("pake2 out of order")),
        };

        let l = registration_value(self.crypto.as_ref(), &w1);
        let expected = verifier_commitment(self.crypto.as_ref(), &l, &t);
        if pake2.commitment != expected {
            return Err(establishment_failed("verifier commitment mismatch"));
        }
        let expected_confirmation =
            confirmation(self.crypto.as_ref(), &shared, b"verifier-confirm");
        if pake2.confirmation.as_deref() != Some(expected_confirmation.as_slice()) {
            return Err(establishment_failed("verifier confirmation mismatch"));
        }

        let keys = session_keys_from_shared(self.crypto.as_ref(), &shared, &t)?;
        let pake3 = PakeCommitment {
            commitment: confirmation(self.crypto.as_ref(), &shared, b"prover-confirm").to_vec(),
            confirmation: None,
        };
        self.stage = ProverStage::Complete {
            outcome: Some(PaseOutcome {
                keys,
                peer_session_id,
            }),
        };
        Ok(pake3)
    }

    /// 完成后取走会话材料。
    pub fn take_outcome(&mut self) -> Result<PaseOutcome> {
        match &mut self.stage {
            ProverStage::Complete { outcome } => outcome
                .take()
                .ok_or_else(|| establishment_failed("outcome already taken")),
            _ => Err(establishment_failed("establishment not complete")),
        }
    }
}

// ---- 验证方（设备侧）----

/// PASE 验证方状态机。
pub struct PaseResponder {
    crypto: Arc<dyn CryptoProvider>,
    verifier: PaseVerifier,
    local_session_id: SessionId,
    stage: ResponderStage,
}

enum ResponderStage {
    AwaitingRequest,
    AwaitingPake1 {
        transcript: Vec<u8>,
        peer_session_id: SessionId,
    },
    AwaitingPake3 {
        transcript: Vec<u8>,
        shared: [u8; 32],
        peer_session_id: SessionId,
    },
    Complete,
}

impl PaseResponder {
    pub fn new(
        crypto: Arc<dyn CryptoProvider>,
        verifier: PaseVerifier,
        local_session_id: SessionId,
    ) -> Self {
        Self {
            crypto,
            verifier,
            local_session_id,
            stage: ResponderStage::AwaitingRequest,
        }
    }

    pub fn on_param_request(&mut self, request: &PbkdfParamRequest) -> Result<PbkdfParamResponse> {
        if !matches!(self.stage, ResponderStage::AwaitingRequest) {
            return Err(establishment_failed("param request out of order"));
        }
        let mut responder_random = vec![0u8; RANDOM_LEN];
        self.crypto.fill_random(&mut responder_random);
        let t = transcript(&request.initiator_random, &responder_random);
        self.stage = ResponderStage::AwaitingPake1 {
            transcript: t,
            peer_session_id: SessionId(request.initiator_session_id),
        };
        Ok(PbkdfParamResponse {
            initiator_random: request.initiator_random.clone(),
            responder_random,
            responder_session_id: self.local_session_id.raw(),
            iterations: self.verifier.iterations,
            salt: self.verifier.salt.clone(),
        })
    }

    pub fn on_pake1(&mut self, pake1: &PakeCommitment) -> Result<PakeCommitment> {
        let (t, peer_session_id) = match &self.stage {
            ResponderStage::AwaitingPake1 {
                transcript,
                peer_session_id,
            } => (transcript.clone(), *peer_session_id),
            _ => return Err(establishment_failed("pake1 out of order")),
        };
        let expected = prover_commitment(self.crypto.as_ref(), &self.verifier.w0, &t);
        if pake1.commitment != expected {
            return Err(establishment_failed("prover commitment mismatch"));
        }
        let shared = shared_material(self.crypto.as_ref(), &self.verifier.w0, &t);
        let pake2 = PakeCommitment {
            commitment: verifier_commitment(self.crypto.as_ref(), &self.verifier.l, &t).to_vec(),
            confirmation: Some(
                confirmation(self.crypto.as_ref(), &shared, b"verifier-confirm").to_vec(),
            ),
        };
        self.stage = ResponderStage::AwaitingPake3 {
            transcript: t,
            shared,
            peer_session_id,
        };
        Ok(pake2)
    }

    pub fn on_pake3(&mut self, pake3: &PakeCommitment) -> Result<PaseOutcome> {
        let (t, shared, peer_session_id) = match &self.stage {
            ResponderStage::AwaitingPake3 {
                transcript,
                shared,
                peer_session_id,
            } => (transcript.clone(), *shared, *peer_session_id),
            _ => return Err(establishment_failed("pake3 out of order")),
        };
        let expected = confirmation(self.crypto.as_ref(), &shared, b"prover-confirm");
        if pake3.commitment != expected {
            return Err(establishment_failed("prover confirmation mismatch"));
        }
        let keys = session_keys_from_shared(self.crypto.as_ref(), &shared, &t)?;
        let outcome = PaseOutcome {
            keys,
            peer_session_id,
        };
        self.stage = ResponderStage::Complete;
        Ok(outcome)
    }
}

fn establishment_failed(reason: &str) -> MatterError {
    MatterError::protocol(
        codes::SESSION_ESTABLISHMENT_FAILED,
        format!("pase: {reason}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::crypto::SoftwareCrypto;

    fn run_handshake(prover_passcode: u32, verifier_passcode: u32) -> Result<(PaseOutcome, PaseOutcome)> {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let verifier = PaseVerifier::from_passcode(
            crypto.as_ref(),
            verifier_passcode,
            DEFAULT_ITERATIONS,
            b"pase-salt-0123".to_vec(),
        )?;

        let mut prover = PaseProver::new(Arc::clone(&crypto), prover_passcode, SessionId(11));
        let mut responder = PaseResponder::new(Arc::clone(&crypto), verifier, SessionId(22));

        let request = PbkdfParamRequest::from_tlv(&prover.initial_request().to_tlv())?;
        let response = PbkdfParamResponse::from_tlv(&responder.on_param_request(&request)?.to_tlv())?;
        let pake1 = PakeCommitment::from_tlv(&prover.on_param_response(&response)?.to_tlv())?;
        let pake2 = PakeCommitment::from_tlv(&responder.on_pake1(&pake1)?.to_tlv())?;
        let pake3 = PakeCommitment::from_tlv(
            &prover
                .on_pake2(&pake2, SessionId(response.responder_session_id))?
                .to_tlv(),
        )?;
        let responder_outcome = responder.on_pake3(&pake3)?;
        let prover_outcome = prover.take_outcome()?;
        Ok((prover_outcome, responder_outcome))
    }

    #[test]
    fn matching_passcodes_derive_identical_keys() {
        let (prover, responder) = run_handshake(20202021, 20202021).expect("handshake");
        assert_eq!(
            prover.keys.initiator_to_responder,
            responder.keys.initiator_to_responder
        );
        assert_eq!(
            prover.keys.responder_to_initiator,
            responder.keys.responder_to_initiator
        );
        assert_eq!(prover.peer_session_id, SessionId(22));
        assert_eq!(responder.peer_session_id, SessionId(11));
    }

    #[test]
    fn wrong_passcode_fails_at_pake1() {
        let err = run_handshake(20202021, 20202022).expect_err("mismatch must fail");
        assert_eq!(err.code(), codes::SESSION_ESTABLISHMENT_FAILED);
    }

    #[test]
    fn forbidden_passcodes_rejected_at_window_open() {
        for passcode in [0u32, 11111111, 12345678, 87654321, 99999999] {
            let err = PaseVerifier::from_passcode(
                &SoftwareCrypto,
                passcode,
                DEFAULT_ITERATIONS,
                b"salt".to_vec(),
            )
            .expect_err("forbidden");
            assert_eq!(err.code(), codes::SESSION_FORBIDDEN_PASSCODE);
        }
    }
}
