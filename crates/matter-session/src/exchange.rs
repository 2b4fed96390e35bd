//! 交换层：会话之上的请求/响应通道与协议分发。
//!
//! # 职责（What）
//! - 为每条逻辑对话分配交换号，入站帧按 `(会话, 交换号, 发起方位)`
//!   路由到对应邮箱；对端新发起的交换派发给按协议号注册的处理器；
//! - 在不可靠通道上自动执行 MRP：发送侧登记待确认帧并按退避重传，
//!   接收侧对 `needs_ack` 帧回独立确认；
//! - 未加密帧（session id 0）承载 PASE/CASE 建立与其确认，复用同一套
//!   路由与重传机制。
//!
//! # 生命周期（How）
//! - [`Exchange`] Drop 时撤销路由；会话关闭导致后续路由失败，等待中的
//!   `next_message` 以超时或通道关闭错误返回；
//! - 重传次数耗尽按传输瞬断处理：记录日志并关闭承载会话。

use crate::manager::SessionManager;
use crate::message::{MessageHeader, PayloadHeader, SessionType};
use crate::mrp::{RetransmissionSchedule, STANDALONE_ACK_OPCODE};
use crate::counters::TxCounter;
use crate::session::SecureSession;
use dashmap::DashMap;
use matter_core::clock::Clock;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{ExchangeId, NodeId, ProtocolId, SessionId};
use matter_transport::{Channel, ConnectionlessTransport, PeerAddress};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};

/// 交付给处理器/调用方的入站消息。
#[derive(Debug)]
pub struct InboundMessage {
    pub header: PayloadHeader,
    pub payload: Vec<u8>,
    pub peer: PeerAddress,
}

/// 按协议号注册的入站交换处理器。
///
/// 实现应快速返回（通常 `tokio::spawn` 处理任务），阻塞会拖住收包路径。
pub trait ProtocolHandler: Send + Sync {
    fn on_exchange(&self, exchange: Exchange, first: InboundMessage);
}

type ExchangeKey = (u16, u16, bool);
type AckKey = (u16, u32);

#[derive(Clone)]
enum SendContext {
    Secured(Arc<SecureSession>),
    Unsecured {
        channel: Arc<dyn Channel>,
        peer_node: Option<NodeId>,
    },
}

impl SendContext {
    fn reliable(&self) -> bool {
        match self {
            SendContext::Secured(session) => session.channel().info().reliable,
            SendContext::Unsecured { channel, .. } => channel.info().reliable,
        }
    }

    fn session_key(&self) -> u16 {
        match self {
            SendContext::Secured(session) => session.local_id.raw(),
            SendContext::Unsecured { .. } => 0,
        }
    }
}

/// 交换管理器。
pub struct ExchangeManager {
    clock: Arc<dyn Clock>,
    sessions: Arc<SessionManager>,
    handlers: DashMap<u16, Arc<dyn ProtocolHandler>>,
    routes: DashMap<ExchangeKey, mpsc::Sender<InboundMessage>>,
    pending_acks: DashMap<AckKey, Arc<Notify>>,
    unsecured_tx: TxCounter,
    unsecured_node_id: NodeId,
    next_exchange: AtomicU16,
}

impl ExchangeManager {
    pub fn new(clock: Arc<dyn Clock>, sessions: Arc<SessionManager>) -> Arc<Self> {
        let mut rng = rand::thread_rng();
        Arc::new(Self {
            clock,
            sessions,
            handlers: DashMap::new(),
            routes: DashMap::new(),
            pending_acks: DashMap::new(),
            unsecured_tx: TxCounter::new(rng.r#gen()),
            // 建立阶段使用的临时节点号，避免裸 0 在抓包里混淆。
            unsecured_node_id: NodeId(rng.r#gen()),
            next_exchange: AtomicU16::new(rng.r#gen()),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// 注册协议处理器；同协议号后注册者覆盖先注册者。
    pub fn register_handler(&self, protocol: ProtocolId, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(protocol.raw(), handler);
    }

    /// 把一个无连接传输接入交换层。
    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn ConnectionlessTransport>) {
        let manager = Arc::downgrade(self);
        let transport_weak = Arc::downgrade(&transport);
        transport.on_data(Arc::new(move |peer, frame| {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            let Some(transport) = transport_weak.upgrade() else {
                return;
            };
            let reply = match transport.open_channel(peer.clone()) {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(error = %err, %peer, "cannot open reply channel");
                    return;
                }
            };
            tokio::spawn(async move {
                if let Err(err) = manager.process_frame(peer, frame, reply).await {
                    // 分帧类失败只丢弃并记录（§ 错误策略）。
                    trace!(error = %err, "inbound frame dropped");
                }
            });
        }));
    }

    /// 在已建立的安全会话上发起一个新交换。
    pub fn initiate(self: &Arc<Self>, session: Arc<SecureSession>, protocol: ProtocolId) -> Exchange {
        self.build_exchange(SendContext::Secured(session), protocol, true)
    }

    /// 在未加密通道上发起一个新交换（会话建立用）。
    pub fn initiate_unsecured(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        protocol: ProtocolId,
    ) -> Exchange {
        self.build_exchange(
            SendContext::Unsecured {
                channel,
                peer_node: None,
            },
            protocol,
            true,
        )
    }

    fn build_exchange(
        self: &Arc<Self>,
        context: SendContext,
        protocol: ProtocolId,
        is_initiator: bool,
    ) -> Exchange {
        let exchange_id = ExchangeId(self.next_exchange.fetch_add(1, Ordering::Relaxed));
        // 己方发起的交换收到的回复带 initiator=false。
        let key = (context.session_key(), exchange_id.raw(), !is_initiator);
        let (tx, rx) = mpsc::channel(8);
        self.routes.insert(key, tx);
        Exchange {
            manager: Arc::clone(self),
            context,
            exchange_id,
            protocol,
            is_initiator,
            key,
            rx,
        }
    }

    /// 处理一帧入站数据。
    async fn process_frame(
        self: &Arc<Self>,
        peer: PeerAddress,
        frame: Vec<u8>,
        reply: Arc<dyn Channel>,
    ) -> Result<()> {
        let (header, offset) = MessageHeader::decode(&frame)?;

        let (payload_header, payload, context) = if header.is_unsecured() {
            let (payload_header, consumed) = PayloadHeader::decode(&frame[offset..])?;
            (
                payload_header,
                frame[offset + consumed..].to_vec(),
                SendContext::Unsecured {
                    channel: reply,
                    peer_node: header.source,
                },
            )
        } else {
            let session = self.sessions.get(header.session_id).ok_or_else(|| {
                MatterError::framing(
                    codes::SESSION_NOT_FOUND,
                    format!("frame for unknown {}", header.session_id),
                )
            })?;
            session.mark_peer_active(self.clock.now());
            let (payload_header, payload) =
                session.open(&header, &frame[..offset], &frame[offset..])?;
            (payload_header, payload, SendContext::Secured(session))
        };

        // 确认对账：捎带或独立确认都在此消化。
        if let Some(ack) = payload_header.ack_counter {
            if let Some((_, notify)) = self
                .pending_acks
                .remove(&(context.session_key(), ack))
            {
                notify.notify_one();
            }
        }

        let standalone_ack = payload_header.protocol_id == ProtocolId::SECURE_CHANNEL
            && payload_header.opcode == STANDALONE_ACK_OPCODE;

        // 对端要求确认：立即回独立确认帧。
        if payload_header.needs_ack {
            let ack_header = PayloadHeader {
                initiator: !payload_header.initiator,
                needs_ack: false,
                ack_counter: Some(header.counter),
                opcode: STANDALONE_ACK_OPCODE,
                exchange_id: payload_header.exchange_id,
                protocol_id: ProtocolId::SECURE_CHANNEL,
            };
            if let Err(err) = self.transmit(&context, &ack_header, &[]).await {
                debug!(error = %err, "standalone ack send failed");
            }
        }

        if standalone_ack {
            return Ok(());
        }

        let key = (
            context.session_key(),
            payload_header.exchange_id.raw(),
            payload_header.initiator,
        );
        let inbound = InboundMessage {
            header: payload_header,
            payload,
            peer,
        };

        if let Some(route) = self.routes.get(&key) {
            let sender = route.value().clone();
            drop(route);
            if sender.send(inbound).await.is_err() {
                self.routes.remove(&key);
            }
            return Ok(());
        }

        if !payload_header.initiator {
            trace!(
                exchange = %payload_header.exchange_id,
                "response for unknown exchange dropped"
            );
            return Ok(());
        }

        let Some(handler) = self
            .handlers
            .get(&payload_header.protocol_id.raw())
            .map(|entry| Arc::clone(&entry))
        else {
            return Err(MatterError::protocol(
                codes::EXCHANGE_UNKNOWN_PROTOCOL,
                format!("no handler for {}", payload_header.protocol_id),
            ));
        };

        let (tx, rx) = mpsc::channel(8);
        self.routes.insert(key, tx);
        let exchange = Exchange {
            manager: Arc::clone(self),
            context,
            exchange_id: payload_header.exchange_id,
            protocol: payload_header.protocol_id,
            is_initiator: false,
            key,
            rx,
        };
        handler.on_exchange(exchange, inbound);
        Ok(())
    }

    /// 发送一帧（按上下文选择加密或明文），必要时启动重传任务。
    async fn transmit(
        self: &Arc<Self>,
        context: &SendContext,
        payload_header: &PayloadHeader,
        payload: &[u8],
    ) -> Result<()> {
        let needs_ack = payload_header.needs_ack;
        match context {
            SendContext::Secured(session) => {
                let frame = session.seal(payload_header, payload)?;
                session.channel().send(&frame.bytes).await?;
                if needs_ack {
                    self.track_retransmission(
                        context.clone(),
                        frame.bytes,
                        frame.counter,
                        session.mrp_base_interval(self.clock.now()),
                    );
                }
            }
            SendContext::Unsecured { channel, peer_node } => {
                let counter = self.unsecured_tx.advance();
                let header = MessageHeader {
                    session_id: SessionId(0),
                    session_type: SessionType::Unicast,
                    counter,
                    source: Some(self.unsecured_node_id),
                    destination: *peer_node,
                };
                let mut bytes = header.encode();
                bytes.extend_from_slice(&payload_header.encode());
                bytes.extend_from_slice(payload);
                channel.send(&bytes).await?;
                if needs_ack {
                    self.track_retransmission(
                        context.clone(),
                        bytes,
                        counter,
                        crate::session::SessionParameters::default().idle_interval,
                    );
                }
            }
        }
        Ok(())
    }

    fn track_retransmission(
        self: &Arc<Self>,
        context: SendContext,
        frame: Vec<u8>,
        counter: u32,
        base_interval: Duration,
    ) {
        let ack_key = (context.session_key(), counter);
        let notify = Arc::new(Notify::new());
        self.pending_acks.insert(ack_key, Arc::clone(&notify));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut schedule = RetransmissionSchedule::new(base_interval);
            loop {
                let Some(delay) = schedule.next_delay() else {
                    warn!(counter, "mrp retransmissions exhausted, tearing session down");
                    if let SendContext::Secured(session) = &context {
                        manager.sessions.close(session.local_id);
                    }
                    break;
                };
                tokio::select! {
                    _ = notify.notified() => break,
                    _ = manager.clock.sleep(delay) => {
                        let channel = match &context {
                            SendContext::Secured(session) => Arc::clone(session.channel()),
                            SendContext::Unsecured { channel, .. } => Arc::clone(channel),
                        };
                        if let Err(err) = channel.send(&frame).await {
                            debug!(error = %err, counter, "mrp retransmission failed");
                        }
                    }
                }
            }
            manager.pending_acks.remove(&ack_key);
        });
    }
}

/// 一条交换的持有端。
pub struct Exchange {
    manager: Arc<ExchangeManager>,
    context: SendContext,
    exchange_id: ExchangeId,
    protocol: ProtocolId,
    is_initiator: bool,
    key: ExchangeKey,
    rx: mpsc::Receiver<InboundMessage>,
}

impl Exchange {
    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }

    pub fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    /// 承载本交换的安全会话（未加密交换返回 `None`）。
    pub fn session(&self) -> Option<Arc<SecureSession>> {
        match &self.context {
            SendContext::Secured(session) => Some(Arc::clone(session)),
            SendContext::Unsecured { .. } => None,
        }
    }

    /// 底层字节通道（会话建立完成后用于组装新会话）。
    pub fn channel(&self) -> Arc<dyn Channel> {
        match &self.context {
            SendContext::Secured(session) => Arc::clone(session.channel()),
            SendContext::Unsecured { channel, .. } => Arc::clone(channel),
        }
    }

    /// 发送一条交换消息。
    pub async fn send(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        let payload_header = PayloadHeader {
            initiator: self.is_initiator,
            needs_ack: !self.context.reliable(),
            ack_counter: None,
            opcode,
            exchange_id: self.exchange_id,
            protocol_id: self.protocol,
        };
        self.manager
            .transmit(&self.context, &payload_header, payload)
            .await
    }

    /// 等待下一条入站消息。
    pub async fn next_message(&mut self, timeout: Duration) -> Result<InboundMessage> {
        tokio::select! {
            received = self.rx.recv() => received.ok_or_else(|| {
                MatterError::io(codes::EXCHANGE_NO_RESPONSE, "exchange routing torn down")
            }),
            _ = self.manager.clock.sleep(timeout) => Err(MatterError::io(
                codes::EXCHANGE_NO_RESPONSE,
                format!("no response on {} within {timeout:?}", self.exchange_id),
            )),
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.manager.routes.remove(&self.key);
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("exchange_id", &self.exchange_id)
            .field("protocol", &self.protocol)
            .field("is_initiator", &self.is_initiator)
            .finish()
    }
}

/// 安全通道的状态报告载荷。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StatusReport {
    pub general_code: u16,
    pub protocol_id: u32,
    pub protocol_code: u16,
}

impl StatusReport {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.general_code.to_le_bytes());
        out.extend_from_slice(&self.protocol_id.to_le_bytes());
        out.extend_from_slice(&self.protocol_code.to_le_bytes());
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < 8 {
            return Err(MatterError::framing(
                codes::MESSAGE_MALFORMED,
                "status report truncated",
            ));
        }
        Ok(Self {
            general_code: u16::from_le_bytes([input[0], input[1]]),
            protocol_id: u32::from_le_bytes([input[2], input[3], input[4], input[5]]),
            protocol_code: u16::from_le_bytes([input[6], input[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_core::clock::SystemClock;
    use matter_transport::UdpTransport;
    use std::sync::Mutex;

    /// 回显处理器：收到什么发回什么。
    struct EchoHandler {
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ProtocolHandler for EchoHandler {
        fn on_exchange(&self, exchange: Exchange, first: InboundMessage) {
            self.seen.lock().expect("seen lock").push(first.payload.clone());
            tokio::spawn(async move {
                exchange
                    .send(first.header.opcode, &first.payload)
                    .await
                    .expect("echo send");
            });
        }
    }

    async fn manager_with_udp() -> (Arc<ExchangeManager>, Arc<UdpTransport>) {
        let sessions = Arc::new(SessionManager::new());
        let manager = ExchangeManager::new(Arc::new(SystemClock), sessions);
        let transport = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        manager.attach_transport(transport.clone() as Arc<dyn ConnectionlessTransport>);
        (manager, transport)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsecured_exchange_roundtrip_with_ack() {
        let (server, server_transport) = manager_with_udp().await;
        let (client, client_transport) = manager_with_udp().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        server.register_handler(
            ProtocolId::SECURE_CHANNEL,
            Arc::new(EchoHandler { seen: Arc::clone(&seen) }),
        );

        let channel = client_transport
            .open_channel(PeerAddress::Udp(server_transport.local_addr()))
            .expect("open channel");
        let mut exchange = client.initiate_unsecured(channel, ProtocolId::SECURE_CHANNEL);
        exchange.send(0x20, b"pbkdf-request").await.expect("send");

        let reply = exchange
            .next_message(Duration::from_secs(5))
            .await
            .expect("echo reply");
        assert_eq!(reply.payload, b"pbkdf-request");
        assert_eq!(reply.header.opcode, 0x20);
        assert!(!reply.header.initiator);
        assert_eq!(seen.lock().expect("seen lock").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_protocol_is_dropped_without_route() {
        let (server, server_transport) = manager_with_udp().await;
        let (client, client_transport) = manager_with_udp().await;
        let _ = &server;

        let channel = client_transport
            .open_channel(PeerAddress::Udp(server_transport.local_addr()))
            .expect("open channel");
        let mut exchange = client.initiate_unsecured(channel, ProtocolId(0x7777));
        exchange.send(0x01, b"nobody listens").await.expect("send");
        let err = exchange
            .next_message(Duration::from_millis(400))
            .await
            .expect_err("no handler means no reply");
        assert_eq!(err.code(), codes::EXCHANGE_NO_RESPONSE);
    }

    #[test]
    fn status_report_roundtrip() {
        let report = StatusReport {
            general_code: 0,
            protocol_id: 0x0000,
            protocol_code: 3,
        };
        assert_eq!(StatusReport::decode(&report.encode()).expect("decode"), report);
    }
}
