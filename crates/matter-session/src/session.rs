//! 安全会话：对称加解密上下文与会话参数。

use crate::counters::{RxWindow, TxCounter};
use crate::message::{MessageHeader, PayloadHeader, SessionType};
use matter_core::crypto::{AEAD_NONCE_LEN, CryptoProvider, SYMMETRIC_KEY_LEN};
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{FabricIndex, NodeId, SessionId};
use matter_transport::Channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 会话协商出的计时参数，MRP 退避与订阅保活都以此为基准。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionParameters {
    pub idle_interval: Duration,
    pub active_interval: Duration,
    pub active_threshold: Duration,
    /// 低功耗设备标志（间歇在线）。
    pub idle_capable: bool,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            active_interval: Duration::from_millis(300),
            active_threshold: Duration::from_millis(4000),
            idle_capable: false,
        }
    }
}

/// 会话的建立方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionKind {
    /// 口令认证的配网会话，CASE 接管后废弃。
    Pase,
    /// 证书认证的运营会话。
    Case,
}

/// 本端在建立流程中的角色。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// 建立流程派生的方向密钥与附加材料。
#[derive(Clone, Copy)]
pub struct SessionKeys {
    pub initiator_to_responder: [u8; SYMMETRIC_KEY_LEN],
    pub responder_to_initiator: [u8; SYMMETRIC_KEY_LEN],
    pub attestation_challenge: [u8; SYMMETRIC_KEY_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // 密钥材料不进日志。
        f.write_str("SessionKeys{..}")
    }
}

/// 以 HKDF 一次展开三段密钥材料。
pub fn derive_session_keys(
    crypto: &dyn CryptoProvider,
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<SessionKeys> {
    let mut okm = [0u8; SYMMETRIC_KEY_LEN * 3];
    crypto.hkdf_sha256(salt, ikm, info, &mut okm)?;
    let mut keys = SessionKeys {
        initiator_to_responder: [0; SYMMETRIC_KEY_LEN],
        responder_to_initiator: [0; SYMMETRIC_KEY_LEN],
        attestation_challenge: [0; SYMMETRIC_KEY_LEN],
    };
    keys.initiator_to_responder
        .copy_from_slice(&okm[..SYMMETRIC_KEY_LEN]);
    keys.responder_to_initiator
        .copy_from_slice(&okm[SYMMETRIC_KEY_LEN..SYMMETRIC_KEY_LEN * 2]);
    keys.attestation_challenge
        .copy_from_slice(&okm[SYMMETRIC_KEY_LEN * 2..]);
    Ok(keys)
}

type CloseListener = Box<dyn Fn() + Send + Sync>;

/// `seal` 的产物：完整线缆帧与其消息计数。
#[derive(Clone, Debug)]
pub struct SealedFrame {
    pub bytes: Vec<u8>,
    pub counter: u32,
}

/// 一条已建立的安全会话。
///
/// # 契约说明（What）
/// - `seal` 产出完整线缆帧（明文消息头 + 密文载荷），内部推进发送计数；
/// - `open` 校验重放窗口并解密，返回载荷头与应用字节；
/// - 会话关闭后两者都拒绝工作；关闭监听器恰好回调一次，订阅层借此
///   跟随会话销毁。
pub struct SecureSession {
    pub kind: SessionKind,
    pub role: SessionRole,
    pub local_id: SessionId,
    pub peer_id: SessionId,
    pub local_node_id: NodeId,
    pub peer_node_id: NodeId,
    pub fabric_index: Option<FabricIndex>,
    pub parameters: SessionParameters,
    encrypt_key: [u8; SYMMETRIC_KEY_LEN],
    decrypt_key: [u8; SYMMETRIC_KEY_LEN],
    attestation_challenge: [u8; SYMMETRIC_KEY_LEN],
    tx: TxCounter,
    rx: RxWindow,
    channel: Arc<dyn Channel>,
    crypto: Arc<dyn CryptoProvider>,
    last_peer_activity: Mutex<Option<Instant>>,
    closed: AtomicBool,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl SecureSession {
    /// 以建立流程的产出组装会话。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SessionKind,
        role: SessionRole,
        local_id: SessionId,
        peer_id: SessionId,
        local_node_id: NodeId,
        peer_node_id: NodeId,
        fabric_index: Option<FabricIndex>,
        keys: SessionKeys,
        parameters: SessionParameters,
        channel: Arc<dyn Channel>,
        crypto: Arc<dyn CryptoProvider>,
        initial_counter: u32,
    ) -> Self {
        let (encrypt_key, decrypt_key) = match role {
            SessionRole::Initiator => (keys.initiator_to_responder, keys.responder_to_initiator),
            SessionRole::Responder => (keys.responder_to_initiator, keys.initiator_to_responder),
        };
        Self {
            kind,
            role,
            local_id,
            peer_id,
            local_node_id,
            peer_node_id,
            fabric_index,
            parameters,
            encrypt_key,
            decrypt_key,
            attestation_challenge: keys.attestation_challenge,
            tx: TxCounter::new(initial_counter),
            rx: RxWindow::new(),
            channel,
            crypto,
            last_peer_activity: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// 设备证明流程使用的挑战材料。
    pub fn attestation_challenge(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.attestation_challenge
    }

    /// 会话是否仍可用。
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// 打包并加密一帧；返回线缆字节与本帧占用的计数值（MRP 重传对账用）。
    pub fn seal(&self, payload_header: &PayloadHeader, payload: &[u8]) -> Result<SealedFrame> {
        self.ensure_open()?;
        let counter = self.tx.advance();
        let header = MessageHeader {
            session_id: self.peer_id,
            session_type: SessionType::Unicast,
            counter,
            source: Some(self.local_node_id),
            destination: Some(self.peer_node_id),
        };
        let aad = header.encode();
        let nonce = build_nonce(counter, self.local_node_id);

        let mut plaintext = payload_header.encode();
        plaintext.extend_from_slice(payload);
        let ciphertext = self
            .crypto
            .aead_encrypt(&self.encrypt_key, &nonce, &aad, &plaintext)?;

        let mut bytes = aad;
        bytes.extend_from_slice(&ciphertext);
        Ok(SealedFrame { bytes, counter })
    }

    /// 解密一帧（消息头已在上层解析）。
    pub fn open(
        &self,
        header: &MessageHeader,
        header_bytes: &[u8],
        ciphertext: &[u8],
    ) -> Result<(PayloadHeader, Vec<u8>)> {
        self.ensure_open()?;
        let source = header.source.unwrap_or(self.peer_node_id);
        let nonce = build_nonce(header.counter, source);
        let plaintext =
            self.crypto
                .aead_decrypt(&self.decrypt_key, &nonce, header_bytes, ciphertext)?;
        // 解密成功后才登记计数，避免伪造帧污染窗口。
        self.rx.accept(header.counter)?;
        let (payload_header, consumed) = PayloadHeader::decode(&plaintext)?;
        Ok((payload_header, plaintext[consumed..].to_vec()))
    }

    /// 登记对端活动时刻。
    pub fn mark_peer_active(&self, now: Instant) {
        *self.last_peer_activity.lock().expect("activity lock") = Some(now);
    }

    /// 对端最近是否在活跃阈值内发过报文。
    pub fn peer_is_active(&self, now: Instant) -> bool {
        self.last_peer_activity
            .lock()
            .expect("activity lock")
            .is_some_and(|last| now.duration_since(last) <= self.parameters.active_threshold)
    }

    /// MRP 首轮退避的基准间隔。
    pub fn mrp_base_interval(&self, now: Instant) -> Duration {
        if self.peer_is_active(now) {
            self.parameters.active_interval
        } else {
            self.parameters.idle_interval
        }
    }

    /// 注册关闭监听器；会话已关闭时立即回调。
    pub fn on_close(&self, listener: impl Fn() + Send + Sync + 'static) {
        if !self.is_open() {
            listener();
            return;
        }
        self.close_listeners
            .lock()
            .expect("listener lock")
            .push(Box::new(listener));
    }

    /// 关闭会话并通知监听器；幂等。
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<CloseListener> = self
            .close_listeners
            .lock()
            .expect("listener lock")
            .drain(..)
            .collect();
        for listener in listeners {
            listener();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MatterError::io(
                codes::SESSION_NOT_FOUND,
                format!("session {} already closed", self.local_id),
            ))
        }
    }
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("kind", &self.kind)
            .field("local_id", &self.local_id)
            .field("peer_id", &self.peer_id)
            .field("peer_node_id", &self.peer_node_id)
            .field("fabric_index", &self.fabric_index)
            .finish()
    }
}

fn build_nonce(counter: u32, source: NodeId) -> [u8; AEAD_NONCE_LEN] {
    let mut nonce = [0u8; AEAD_NONCE_LEN];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce[4..].copy_from_slice(&source.raw().to_le_bytes());
    nonce
}

/// 测试辅助：无真实网络的会话构造。
#[cfg(test)]
pub mod tests_support {
    use super::*;
    use matter_core::crypto::SoftwareCrypto;
    use matter_transport::{ChannelInfo, ChannelKind, PeerAddress};

    pub struct NullChannel {
        info: ChannelInfo,
    }

    impl NullChannel {
        pub fn new() -> Arc<dyn Channel> {
            let addr = PeerAddress::Udp("127.0.0.1:5540".parse().expect("addr"));
            Arc::new(Self {
                info: ChannelInfo {
                    kind: ChannelKind::Udp,
                    local: addr.clone(),
                    remote: addr,
                    reliable: false,
                    max_payload: 1232,
                },
            })
        }
    }

    #[async_trait::async_trait]
    impl Channel for NullChannel {
        fn info(&self) -> &ChannelInfo {
            &self.info
        }

        async fn send(&self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    /// 构造一条指向空通道的会话（仓储/关闭语义测试用）。
    pub fn loopback_session(
        local_id: SessionId,
        peer_id: SessionId,
        fabric_index: Option<FabricIndex>,
    ) -> Arc<SecureSession> {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let keys = derive_session_keys(&SoftwareCrypto, b"secret", b"salt", b"loopback")
            .expect("derive keys");
        Arc::new(SecureSession::new(
            SessionKind::Case,
            SessionRole::Initiator,
            local_id,
            peer_id,
            NodeId(1),
            NodeId(2),
            fabric_index,
            keys,
            SessionParameters::default(),
            NullChannel::new(),
            crypto,
            1,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::NullChannel;
    use super::*;
    use matter_core::crypto::SoftwareCrypto;
    use matter_core::types::{ExchangeId, ProtocolId};

    fn keys() -> SessionKeys {
        derive_session_keys(&SoftwareCrypto, b"shared secret", b"salt", b"test-keys")
            .expect("derive")
    }

    fn session_pair() -> (SecureSession, SecureSession) {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(SoftwareCrypto);
        let initiator = SecureSession::new(
            SessionKind::Case,
            SessionRole::Initiator,
            SessionId(11),
            SessionId(22),
            NodeId(1),
            NodeId(2),
            Some(FabricIndex(1)),
            keys(),
            SessionParameters::default(),
            NullChannel::new(),
            Arc::clone(&crypto),
            100,
        );
        let responder = SecureSession::new(
            SessionKind::Case,
            SessionRole::Responder,
            SessionId(22),
            SessionId(11),
            NodeId(2),
            NodeId(1),
            Some(FabricIndex(1)),
            keys(),
            SessionParameters::default(),
            NullChannel::new(),
            crypto,
            500,
        );
        (initiator, responder)
    }

    fn payload_header() -> PayloadHeader {
        PayloadHeader {
            initiator: true,
            needs_ack: false,
            ack_counter: None,
            opcode: 0x02,
            exchange_id: ExchangeId(3),
            protocol_id: ProtocolId::INTERACTION_MODEL,
        }
    }

    #[test]
    fn seal_open_roundtrip_between_roles() {
        let (initiator, responder) = session_pair();
        let frame = initiator
            .seal(&payload_header(), b"read request")
            .expect("seal");
        assert_eq!(frame.counter, 100);
        let (header, consumed) = MessageHeader::decode(&frame.bytes).expect("header");
        assert_eq!(header.session_id, SessionId(22));
        let (decoded, payload) = responder
            .open(&header, &frame.bytes[..consumed], &frame.bytes[consumed..])
            .expect("open");
        assert_eq!(decoded, payload_header());
        assert_eq!(payload, b"read request");
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let (initiator, responder) = session_pair();
        let frame = initiator.seal(&payload_header(), b"x").expect("seal");
        let (header, consumed) = MessageHeader::decode(&frame.bytes).expect("header");
        responder
            .open(&header, &frame.bytes[..consumed], &frame.bytes[consumed..])
            .expect("first delivery");
        let err = responder
            .open(&header, &frame.bytes[..consumed], &frame.bytes[consumed..])
            .expect_err("replay");
        assert_eq!(err.code(), codes::MESSAGE_COUNTER_REPLAY);
    }

    #[test]
    fn close_notifies_listener_once() {
        let (initiator, _) = session_pair();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let listener_hits = Arc::clone(&hits);
        initiator.on_close(move || {
            listener_hits.fetch_add(1, Ordering::SeqCst);
        });
        initiator.close();
        initiator.close();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(initiator.seal(&payload_header(), b"x").is_err());
    }
}
