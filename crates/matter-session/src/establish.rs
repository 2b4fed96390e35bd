//! 会话建立驱动：把 PASE/CASE 状态机接到交换层上。
//!
//! # 结构（How）
//! - 发起侧是两个 async 驱动函数：逐步发消息、等响应、喂状态机，成功
//!   后把产出的密钥组装成 [`SecureSession`] 并注册进会话表；
//! - 响应侧是挂在安全通道协议号上的 [`SecureChannelHandler`]：按首条
//!   消息的 opcode 分流到 PASE/CASE 响应流程；节点策略（配网窗口、
//!   fabric 凭据、恢复记录）通过 [`SecureChannelDelegate`] 注入。

use crate::case::{
    CaseInitiator, CaseOutcome, CaseResponder, FabricCredentials, ResponderReply,
    ResumptionRecord, Sigma1, Sigma2, Sigma2Resume, Sigma3,
};
use crate::exchange::{
    Exchange, ExchangeManager, InboundMessage, ProtocolHandler, StatusReport,
};
use crate::manager::SessionManager;
use crate::pase::{
    PakeCommitment, PaseProver, PaseResponder, PaseVerifier, PbkdfParamRequest,
    PbkdfParamResponse,
};
use crate::session::{
    SecureSession, SessionKind, SessionParameters, SessionRole,
};
use matter_core::crypto::CryptoProvider;
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::SecureChannelStatus;
use matter_core::types::{NodeId, ProtocolId};
use matter_transport::Channel;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// 安全通道协议的 opcode 清单。
pub mod opcode {
    pub const PBKDF_PARAM_REQUEST: u8 = 0x20;
    pub const PBKDF_PARAM_RESPONSE: u8 = 0x21;
    pub const PASE_PAKE1: u8 = 0x22;
    pub const PASE_PAKE2: u8 = 0x23;
    pub const PASE_PAKE3: u8 = 0x24;
    pub const CASE_SIGMA1: u8 = 0x30;
    pub const CASE_SIGMA2: u8 = 0x31;
    pub const CASE_SIGMA3: u8 = 0x32;
    pub const CASE_SIGMA2_RESUME: u8 = 0x33;
    pub const STATUS_REPORT: u8 = 0x40;
}

/// 单步建立消息的等待上限。
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// 等待指定 opcode；中途收到状态报告视为对端拒绝。
async fn expect_message(exchange: &mut Exchange, expected: u8) -> Result<InboundMessage> {
    let message = exchange.next_message(STEP_TIMEOUT).await?;
    if message.header.opcode == opcode::STATUS_REPORT && expected != opcode::STATUS_REPORT {
        let report = StatusReport::decode(&message.payload)?;
        return Err(MatterError::protocol(
            codes::SESSION_ESTABLISHMENT_FAILED,
            format!(
                "peer rejected establishment (general {}, code {})",
                report.general_code, report.protocol_code
            ),
        ));
    }
    if message.header.opcode != expected {
        return Err(MatterError::protocol(
            codes::EXCHANGE_UNEXPECTED_MESSAGE,
            format!(
                "expected opcode 0x{expected:02x}, got 0x{:02x}",
                message.header.opcode
            ),
        ));
    }
    Ok(message)
}

async fn send_status(exchange: &Exchange, status: SecureChannelStatus) -> Result<()> {
    let report = StatusReport {
        general_code: if status == SecureChannelStatus::SessionEstablishmentSuccess {
            0
        } else {
            1
        },
        protocol_id: u32::from(ProtocolId::SECURE_CHANNEL.raw()),
        protocol_code: status.raw(),
    };
    exchange.send(opcode::STATUS_REPORT, &report.encode()).await
}

/// 发起 PASE（commissioner → 设备）。
pub async fn establish_pase(
    manager: &Arc<ExchangeManager>,
    crypto: Arc<dyn CryptoProvider>,
    channel: Arc<dyn Channel>,
    passcode: u32,
    parameters: SessionParameters,
) -> Result<Arc<SecureSession>> {
    let sessions = Arc::clone(manager.sessions());
    let local_id = sessions.allocate_local_id();
    let mut prover = PaseProver::new(Arc::clone(&crypto), passcode, local_id);
    let mut exchange = manager.initiate_unsecured(Arc::clone(&channel), ProtocolId::SECURE_CHANNEL);

    exchange
        .send(opcode::PBKDF_PARAM_REQUEST, &prover.initial_request().to_tlv())
        .await?;
    let message = expect_message(&mut exchange, opcode::PBKDF_PARAM_RESPONSE).await?;
    let response = PbkdfParamResponse::from_tlv(&message.payload)?;

    let pake1 = prover.on_param_response(&response)?;
    exchange.send(opcode::PASE_PAKE1, &pake1.to_tlv()).await?;
    let message = expect_message(&mut exchange, opcode::PASE_PAKE2).await?;
    let pake2 = PakeCommitment::from_tlv(&message.payload)?;

    let pake3 = prover.on_pake2(
        &pake2,
        matter_core::types::SessionId(response.responder_session_id),
    )?;
    exchange.send(opcode::PASE_PAKE3, &pake3.to_tlv()).await?;
    let message = expect_message(&mut exchange, opcode::STATUS_REPORT).await?;
    let report = StatusReport::decode(&message.payload)?;
    if report.general_code != 0 {
        return Err(MatterError::protocol(
            codes::SESSION_ESTABLISHMENT_FAILED,
            format!("pase rejected with code {}", report.protocol_code),
        ));
    }

    let outcome = prover.take_outcome()?;
    let session = Arc::new(SecureSession::new(
        SessionKind::Pase,
        SessionRole::Initiator,
        local_id,
        outcome.peer_session_id,
        NodeId(0),
        NodeId(0),
        None,
        outcome.keys,
        parameters,
        channel,
        crypto,
        1,
    ));
    sessions.insert(Arc::clone(&session))?;
    Ok(session)
}

/// 发起 CASE（fabric 内的运营连接）。
pub async fn establish_case(
    manager: &Arc<ExchangeManager>,
    crypto: Arc<dyn CryptoProvider>,
    channel: Arc<dyn Channel>,
    fabric: FabricCredentials,
    peer_node_id: NodeId,
    resumption: Option<ResumptionRecord>,
    parameters: SessionParameters,
) -> Result<(Arc<SecureSession>, ResumptionRecord)> {
    let sessions = Arc::clone(manager.sessions());
    let local_id = sessions.allocate_local_id();
    let local_node_id = fabric.local_node_id;
    let fabric_index = fabric.fabric_index;
    let mut initiator = CaseInitiator::new(
        Arc::clone(&crypto),
        fabric,
        peer_node_id,
        local_id,
        resumption,
    );
    let mut exchange = manager.initiate_unsecured(Arc::clone(&channel), ProtocolId::SECURE_CHANNEL);

    exchange
        .send(opcode::CASE_SIGMA1, &initiator.sigma1().to_tlv())
        .await?;
    let message = exchange.next_message(STEP_TIMEOUT).await?;

    let outcome: CaseOutcome = match message.header.opcode {
        opcode::CASE_SIGMA2 => {
            let sigma2 = Sigma2::from_tlv(&message.payload)?;
            let (sigma3, outcome) = initiator.on_sigma2(&sigma2)?;
            exchange.send(opcode::CASE_SIGMA3, &sigma3.to_tlv()).await?;
            let message = expect_message(&mut exchange, opcode::STATUS_REPORT).await?;
            let report = StatusReport::decode(&message.payload)?;
            if report.general_code != 0 {
                return Err(MatterError::protocol(
                    codes::SESSION_ESTABLISHMENT_FAILED,
                    format!("case rejected with code {}", report.protocol_code),
                ));
            }
            outcome
        }
        opcode::CASE_SIGMA2_RESUME => {
            let resume = Sigma2Resume::from_tlv(&message.payload)?;
            let outcome = initiator.on_sigma2_resume(&resume)?;
            send_status(&exchange, SecureChannelStatus::SessionEstablishmentSuccess).await?;
            outcome
        }
        opcode::STATUS_REPORT => {
            let report = StatusReport::decode(&message.payload)?;
            return Err(MatterError::protocol(
                codes::SESSION_ESTABLISHMENT_FAILED,
                format!("case rejected with code {}", report.protocol_code),
            ));
        }
        other => {
            return Err(MatterError::protocol(
                codes::EXCHANGE_UNEXPECTED_MESSAGE,
                format!("unexpected opcode 0x{other:02x} during case"),
            ));
        }
    };

    let session = Arc::new(SecureSession::new(
        SessionKind::Case,
        SessionRole::Initiator,
        local_id,
        outcome.peer_session_id,
        local_node_id,
        outcome.peer_node_id,
        Some(fabric_index),
        outcome.keys,
        parameters,
        channel,
        crypto,
        1,
    ));
    sessions.insert(Arc::clone(&session))?;
    Ok((session, outcome.resumption))
}

/// 节点策略注入点：安全通道响应侧需要的全部上下文。
pub trait SecureChannelDelegate: Send + Sync {
    /// 配网窗口开着时返回验证材料；关着返回 `None`。
    fn pase_verifier(&self) -> Option<PaseVerifier>;

    /// 本地全部 fabric 凭据（CASE 目的标识按序匹配）。
    fn fabrics(&self) -> Vec<FabricCredentials>;

    /// 按恢复标识查缓存记录。
    fn resumption_for(&self, resumption_id: &[u8]) -> Option<ResumptionRecord>;

    /// 新会话的本端参数。
    fn session_parameters(&self) -> SessionParameters {
        SessionParameters::default()
    }

    /// 会话建立完成的回调（持久化恢复记录、收敛 MDNS 广播等）。
    fn on_session_established(
        &self,
        session: &Arc<SecureSession>,
        resumption: Option<&ResumptionRecord>,
    );
}

/// 安全通道协议处理器（响应侧）。
pub struct SecureChannelHandler {
    manager: Weak<ExchangeManager>,
    crypto: Arc<dyn CryptoProvider>,
    delegate: Arc<dyn SecureChannelDelegate>,
}

impl SecureChannelHandler {
    pub fn new(
        manager: &Arc<ExchangeManager>,
        crypto: Arc<dyn CryptoProvider>,
        delegate: Arc<dyn SecureChannelDelegate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
            crypto,
            delegate,
        })
    }

    /// 注册到交换管理器。
    pub fn install(manager: &Arc<ExchangeManager>, crypto: Arc<dyn CryptoProvider>, delegate: Arc<dyn SecureChannelDelegate>) {
        let handler = Self::new(manager, crypto, delegate);
        manager.register_handler(ProtocolId::SECURE_CHANNEL, handler);
    }
}

impl ProtocolHandler for SecureChannelHandler {
    fn on_exchange(&self, exchange: Exchange, first: InboundMessage) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let crypto = Arc::clone(&self.crypto);
        let delegate = Arc::clone(&self.delegate);
        tokio::spawn(async move {
            let result = match first.header.opcode {
                opcode::PBKDF_PARAM_REQUEST => {
                    respond_pase(&manager, crypto, delegate, exchange, first).await
                }
                opcode::CASE_SIGMA1 => {
                    respond_case(&manager, crypto, delegate, exchange, first).await
                }
                opcode::STATUS_REPORT => Ok(()),
                other => {
                    debug!(opcode = other, "unexpected first message on secure channel");
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "session establishment failed");
            }
        });
    }
}

async fn respond_pase(
    manager: &Arc<ExchangeManager>,
    crypto: Arc<dyn CryptoProvider>,
    delegate: Arc<dyn SecureChannelDelegate>,
    mut exchange: Exchange,
    first: InboundMessage,
) -> Result<()> {
    let Some(verifier) = delegate.pase_verifier() else {
        send_status(&exchange, SecureChannelStatus::Busy).await?;
        return Err(MatterError::protocol(
            codes::SESSION_ESTABLISHMENT_FAILED,
            "pase attempted while commissioning window closed",
        ));
    };

    let sessions = Arc::clone(manager.sessions());
    let local_id = sessions.allocate_local_id();
    let mut responder = PaseResponder::new(Arc::clone(&crypto), verifier, local_id);

    let request = PbkdfParamRequest::from_tlv(&first.payload)?;
    let response = responder.on_param_request(&request)?;
    exchange
        .send(opcode::PBKDF_PARAM_RESPONSE, &response.to_tlv())
        .await?;

    let message = expect_message(&mut exchange, opcode::PASE_PAKE1).await?;
    let pake1 = PakeCommitment::from_tlv(&message.payload)?;
    let pake2 = match responder.on_pake1(&pake1) {
        Ok(pake2) => pake2,
        Err(err) => {
            send_status(&exchange, SecureChannelStatus::InvalidParameter).await?;
            return Err(err);
        }
    };
    exchange.send(opcode::PASE_PAKE2, &pake2.to_tlv()).await?;

    let message = expect_message(&mut exchange, opcode::PASE_PAKE3).await?;
    let pake3 = PakeCommitment::from_tlv(&message.payload)?;
    let outcome = match responder.on_pake3(&pake3) {
        Ok(outcome) => outcome,
        Err(err) => {
            send_status(&exchange, SecureChannelStatus::InvalidParameter).await?;
            return Err(err);
        }
    };
    send_status(&exchange, SecureChannelStatus::SessionEstablishmentSuccess).await?;

    let session = Arc::new(SecureSession::new(
        SessionKind::Pase,
        SessionRole::Responder,
        local_id,
        outcome.peer_session_id,
        NodeId(0),
        NodeId(0),
        None,
        outcome.keys,
        delegate.session_parameters(),
        exchange.channel(),
        crypto,
        1,
    ));
    sessions.insert(Arc::clone(&session))?;
    delegate.on_session_established(&session, None);
    Ok(())
}

async fn respond_case(
    manager: &Arc<ExchangeManager>,
    crypto: Arc<dyn CryptoProvider>,
    delegate: Arc<dyn SecureChannelDelegate>,
    mut exchange: Exchange,
    first: InboundMessage,
) -> Result<()> {
    let sigma1 = Sigma1::from_tlv(&first.payload)?;
    let sessions = Arc::clone(manager.sessions());
    let local_id = sessions.allocate_local_id();

    // 目的标识逐个 fabric 匹配；全不命中按无共同信任根拒绝。
    let mut responder = None;
    for fabric in delegate.fabrics() {
        let candidate = CaseResponder::new(Arc::clone(&crypto), fabric, local_id);
        if candidate.matches_destination(&sigma1) {
            responder = Some(candidate);
            break;
        }
    }
    let Some(mut responder) = responder else {
        send_status(&exchange, SecureChannelStatus::NoSharedTrustRoots).await?;
        return Err(MatterError::protocol(
            codes::SESSION_ESTABLISHMENT_FAILED,
            "sigma1 destination matches no local fabric",
        ));
    };

    let cached = sigma1
        .resumption_id
        .as_ref()
        .and_then(|id| delegate.resumption_for(id));

    match responder.on_sigma1(&sigma1, cached.as_ref())? {
        ResponderReply::Resume(resume, outcome) => {
            exchange
                .send(opcode::CASE_SIGMA2_RESUME, &resume.to_tlv())
                .await?;
            let message = expect_message(&mut exchange, opcode::STATUS_REPORT).await?;
            let report = StatusReport::decode(&message.payload)?;
            if report.general_code != 0 {
                return Err(MatterError::protocol(
                    codes::SESSION_ESTABLISHMENT_FAILED,
                    "initiator rejected resumption",
                ));
            }
            finish_case_responder(&sessions, local_id, crypto, delegate, exchange, outcome).await
        }
        ResponderReply::Sigma2(sigma2) => {
            exchange.send(opcode::CASE_SIGMA2, &sigma2.to_tlv()).await?;
            let message = expect_message(&mut exchange, opcode::CASE_SIGMA3).await?;
            let sigma3 = Sigma3::from_tlv(&message.payload)?;
            let outcome = match responder.on_sigma3(&sigma3) {
                Ok(outcome) => outcome,
                Err(err) => {
                    send_status(&exchange, SecureChannelStatus::InvalidParameter).await?;
                    return Err(err);
                }
            };
            send_status(&exchange, SecureChannelStatus::SessionEstablishmentSuccess).await?;
            finish_case_responder(&sessions, local_id, crypto, delegate, exchange, outcome).await
        }
    }
}

async fn finish_case_responder(
    sessions: &Arc<SessionManager>,
    local_id: matter_core::types::SessionId,
    crypto: Arc<dyn CryptoProvider>,
    delegate: Arc<dyn SecureChannelDelegate>,
    exchange: Exchange,
    outcome: CaseOutcome,
) -> Result<()> {
    let local_node_id = delegate
        .fabrics()
        .iter()
        .find(|fabric| fabric.fabric_index == outcome.fabric_index)
        .map(|fabric| fabric.local_node_id)
        .unwrap_or(NodeId(0));
    let session = Arc::new(SecureSession::new(
        SessionKind::Case,
        SessionRole::Responder,
        local_id,
        outcome.peer_session_id,
        local_node_id,
        outcome.peer_node_id,
        Some(outcome.fabric_index),
        outcome.keys,
        delegate.session_parameters(),
        exchange.channel(),
        crypto,
        1,
    ));
    sessions.insert(Arc::clone(&session))?;
    delegate.on_session_established(&session, Some(&outcome.resumption));
    Ok(())
}
