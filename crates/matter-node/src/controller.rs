//! Controller：commissioner 角色与已配网对端的运营通道。
//!
//! # 配网驱动（What）
//! 发现候选 → 逐地址尝试 PASE → 在临时管理通道上按阶段下发
//! `ArmFailSafe → SetRegulatoryConfig → CSRRequest →
//! AddTrustedRootCertificate → AddNOC → CommissioningComplete` →
//! 以 CASE 重连运营通道并登记 peer。任何一步失败即返回错误，设备端
//! 的 failsafe 负责回滚。

use crate::discovery::{CommissionableCandidate, ControllerDiscovery, DiscoveryIdentifier};
use crate::fabric::Fabric;
use dashmap::DashMap;
use matter_codec_tlv::{Tag, TlvValue};
use matter_core::clock::{Clock, ClockService};
use matter_core::crypto::{CryptoProvider, CryptoService, OperationalKeypair};
use matter_core::environment::Environment;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{
    EndpointNumber, FabricId, FabricIndex, NodeId, VendorId,
};
use matter_datamodel::clusters::{
    self, general_commissioning_commands as gc, operational_credentials_commands as oc,
};
use matter_interaction::sustained::{ReportSink, SustainedSubscription};
use matter_interaction::{
    CommandData, CommandPath, InteractionClient, InvokeRequest, SubscribeRequest,
};
use matter_mdns::scanner::MdnsScanner;
use matter_session::{
    ExchangeManager, NocChain, ResumptionRecord, SecureSession, SessionManager,
    SessionParameters, establish_case, establish_pase, issue_noc, self_signed_root,
};
use matter_transport::{ConnectionlessTransport, PeerAddress, UdpTransport};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Controller 配置。
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub vendor_id: VendorId,
    pub node_id: NodeId,
    pub fabric_id: FabricId,
    /// 测试用：MDNS 查询改发到指定地址（传统单播解析）。
    pub mdns_targets: Option<Vec<SocketAddr>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            vendor_id: VendorId(0xfff1),
            node_id: NodeId(0x0000_0000_0001_0001),
            fabric_id: FabricId(0x2906),
            mdns_targets: None,
        }
    }
}

/// 一次配网的参数。
#[derive(Clone, Debug)]
pub struct CommissionOptions {
    pub passcode: u32,
    pub discriminator: u16,
    pub timeout: Duration,
}

impl CommissionOptions {
    pub fn new(passcode: u32, discriminator: u16) -> Self {
        Self {
            passcode,
            discriminator,
            timeout: Duration::from_secs(90),
        }
    }
}

/// 已配网/已发现的远端节点。
pub struct Peer {
    pub node_id: NodeId,
    pub address: PeerAddress,
    session: Mutex<Arc<SecureSession>>,
    resumption: Mutex<ResumptionRecord>,
}

impl Peer {
    pub fn session(&self) -> Arc<SecureSession> {
        Arc::clone(&self.session.lock().expect("peer session lock"))
    }
}

/// Commissioner / 运营控制器。
pub struct Controller {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    crypto: Arc<dyn CryptoProvider>,
    sessions: Arc<SessionManager>,
    exchanges: Arc<ExchangeManager>,
    transport: Arc<UdpTransport>,
    fabric: Fabric,
    /// 签发设备 NOC 用的根 CA 私钥（fabric 结构里只有根证书）。
    root_ca_keypair: Arc<OperationalKeypair>,
    peers: DashMap<u64, Arc<Peer>>,
    next_device_node: AtomicU64,
    next_serial: AtomicU64,
}

impl Controller {
    pub async fn start(
        environment: &Arc<Environment>,
        config: ControllerConfig,
    ) -> Result<Arc<Self>> {
        if !environment.has::<ClockService>() {
            environment.set(Arc::new(ClockService::system()));
        }
        if !environment.has::<CryptoService>() {
            environment.set(Arc::new(CryptoService::software()));
        }
        let clock = environment.get::<ClockService>()?.clock();
        let crypto = environment.get::<CryptoService>()?.provider();

        // controller 自身的 fabric：根 CA + 自己的 NOC。
        let root_ca_keypair = Arc::new(crypto.generate_keypair());
        let root_cert = self_signed_root(crypto.as_ref(), &root_ca_keypair, 1);
        let controller_keys = crypto.generate_keypair();
        let controller_noc = issue_noc(
            crypto.as_ref(),
            &root_ca_keypair,
            2,
            config.fabric_id,
            config.node_id,
            controller_keys.public_key(),
        );
        let mut ipk = [0u8; 16];
        crypto.fill_random(&mut ipk);
        let fabric = Fabric {
            index: FabricIndex(1),
            fabric_id: config.fabric_id,
            local_node_id: config.node_id,
            vendor_id: config.vendor_id,
            label: "controller".into(),
            root_cert,
            noc_chain: NocChain {
                noc: controller_noc,
                icac: None,
            },
            ipk,
            keypair: Arc::new(controller_keys),
            case_admin_subject: config.node_id,
        };

        let sessions = Arc::new(SessionManager::new());
        let exchanges = ExchangeManager::new(Arc::clone(&clock), Arc::clone(&sessions));
        let transport = UdpTransport::bind(std::net::SocketAddr::new(
            std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            0,
        ))
        .await?;
        exchanges.attach_transport(Arc::clone(&transport) as Arc<dyn ConnectionlessTransport>);

        info!(node = %config.node_id, fabric = %config.fabric_id, "controller started");
        Ok(Arc::new(Self {
            config,
            clock,
            crypto,
            sessions,
            exchanges,
            transport,
            fabric,
            root_ca_keypair,
            peers: DashMap::new(),
            next_device_node: AtomicU64::new(0x1000),
            next_serial: AtomicU64::new(100),
        }))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, node_id: NodeId) -> Option<Arc<Peer>> {
        self.peers.get(&node_id.raw()).map(|entry| Arc::clone(&entry))
    }

    pub fn exchanges(&self) -> &Arc<ExchangeManager> {
        &self.exchanges
    }

    async fn discovery(&self) -> Result<ControllerDiscovery> {
        let scanner = match &self.config.mdns_targets {
            Some(targets) => {
                MdnsScanner::with_targets(Arc::clone(&self.clock), targets.clone()).await?
            }
            None => MdnsScanner::bind(Arc::clone(&self.clock)).await?,
        };
        Ok(ControllerDiscovery::new(Arc::clone(&self.clock), scanner, None))
    }

    /// 发现并配网一台设备；返回分配的节点号。
    pub async fn commission(&self, options: CommissionOptions) -> Result<NodeId> {
        self.commission_with_identifier(
            &DiscoveryIdentifier::LongDiscriminator(options.discriminator),
            options.passcode,
            options.timeout,
        )
        .await
    }

    /// 以配对码（手动 11/21 位串或 `MT:` 二维码载荷）发起配网。
    pub async fn commission_with_code(&self, code: &str, timeout: Duration) -> Result<NodeId> {
        let (identifier, passcode) = if code.starts_with("MT:") {
            let payload = matter_codec_pairing::decode_qr(code)?;
            (
                DiscoveryIdentifier::LongDiscriminator(payload.discriminator),
                payload.passcode,
            )
        } else {
            let manual = matter_codec_pairing::decode_manual(code)?;
            (
                DiscoveryIdentifier::ShortDiscriminator(manual.short_discriminator),
                manual.passcode,
            )
        };
        self.commission_with_identifier(&identifier, passcode, timeout).await
    }

    async fn commission_with_identifier(
        &self,
        identifier: &DiscoveryIdentifier,
        passcode: u32,
        timeout: Duration,
    ) -> Result<NodeId> {
        let discovery = self.discovery().await?;
        let candidates = discovery
            .discover_commissionable(identifier, timeout)
            .await?;
        self.commission_candidates(&candidates, passcode).await
    }

    /// 对已发现的候选集逐地址尝试 PASE 并执行配网序列。
    pub async fn commission_candidates(
        &self,
        candidates: &[CommissionableCandidate],
        passcode: u32,
    ) -> Result<NodeId> {
        let mut last_error = MatterError::io(
            codes::DISCOVERY_TIMEOUT,
            "candidate pool exhausted before pase succeeded",
        );
        for candidate in candidates {
            for address in &candidate.addresses {
                let channel = match self.transport.open_channel(address.clone()) {
                    Ok(channel) => channel,
                    Err(err) => {
                        last_error = err;
                        continue;
                    }
                };
                let pase = match establish_pase(
                    &self.exchanges,
                    Arc::clone(&self.crypto),
                    channel,
                    passcode,
                    SessionParameters::default(),
                )
                .await
                {
                    Ok(session) => session,
                    Err(err) => {
                        debug!(%address, error = %err, "pase attempt failed");
                        last_error = err;
                        continue;
                    }
                };
                match self.run_commissioning_steps(&pase, address.clone()).await {
                    Ok(node_id) => return Ok(node_id),
                    Err(err) => {
                        warn!(%address, error = %err, "commissioning sequence failed");
                        last_error = err;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn run_commissioning_steps(
        &self,
        pase: &Arc<SecureSession>,
        address: PeerAddress,
    ) -> Result<NodeId> {
        let client = InteractionClient::new(Arc::clone(&self.exchanges), Arc::clone(pase));
        let root = EndpointNumber(0);

        // 1. ArmFailSafe(60s, breadcrumb=1)
        let response = single_invoke(
            &client,
            root,
            clusters::GENERAL_COMMISSIONING,
            gc::ARM_FAIL_SAFE,
            TlvValue::Structure(vec![
                (Tag::Context(0), TlvValue::UnsignedInt(60)),
                (Tag::Context(1), TlvValue::UnsignedInt(1)),
            ]),
        )
        .await?;
        decode_invoke_error(&response, "ArmFailSafe")?;

        // 2. SetRegulatoryConfig(indoor, XX, breadcrumb=2)
        let response = single_invoke(
            &client,
            root,
            clusters::GENERAL_COMMISSIONING,
            gc::SET_REGULATORY_CONFIG,
            TlvValue::Structure(vec![
                (Tag::Context(0), TlvValue::UnsignedInt(0)),
                (Tag::Context(1), TlvValue::Utf8("XX".into())),
                (Tag::Context(2), TlvValue::UnsignedInt(2)),
            ]),
        )
        .await?;
        decode_invoke_error(&response, "SetRegulatoryConfig")?;

        // 3. CSRRequest → 设备操作公钥
        let mut nonce = vec![0u8; 32];
        self.crypto.fill_random(&mut nonce);
        let response = single_invoke(
            &client,
            root,
            clusters::OPERATIONAL_CREDENTIALS,
            oc::CSR_REQUEST,
            TlvValue::Structure(vec![(Tag::Context(0), TlvValue::Bytes(nonce))]),
        )
        .await?;
        let elements = response
            .field(0)
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| step_failed("CSRRequest", "missing nocsr elements"))?;
        let elements = matter_codec_tlv::decode(elements)?;
        let device_public_key: [u8; 32] = elements
            .field(0)
            .and_then(|v| v.as_bytes())
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| step_failed("CSRRequest", "bad device public key"))?;

        // 4. AddTrustedRootCertificate(本 fabric 的根)
        let response = single_invoke(
            &client,
            root,
            clusters::OPERATIONAL_CREDENTIALS,
            oc::ADD_TRUSTED_ROOT_CERTIFICATE,
            TlvValue::Structure(vec![(
                Tag::Context(0),
                TlvValue::Bytes(self.fabric.root_cert.to_tlv()),
            )]),
        )
        .await?;
        let _ = response;

        // 5. AddNOC：为设备签发 NOC
        let device_node_id = NodeId(self.next_device_node.fetch_add(1, Ordering::Relaxed));
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let device_noc = issue_noc(
            self.crypto.as_ref(),
            &self.root_ca_keypair,
            serial,
            self.config.fabric_id,
            device_node_id,
            device_public_key,
        );
        let response = single_invoke(
            &client,
            root,
            clusters::OPERATIONAL_CREDENTIALS,
            oc::ADD_NOC,
            TlvValue::Structure(vec![
                (Tag::Context(0), TlvValue::Bytes(device_noc.to_tlv())),
                (Tag::Context(2), TlvValue::Bytes(self.fabric.ipk.to_vec())),
                (
                    Tag::Context(3),
                    TlvValue::UnsignedInt(self.config.node_id.raw()),
                ),
                (
                    Tag::Context(4),
                    TlvValue::UnsignedInt(u64::from(self.config.vendor_id.raw())),
                ),
            ]),
        )
        .await?;
        decode_invoke_error(&response, "AddNOC")?;

        // 6. CommissioningComplete
        let response = single_invoke(
            &client,
            root,
            clusters::GENERAL_COMMISSIONING,
            gc::COMMISSIONING_COMPLETE,
            TlvValue::Structure(Vec::new()),
        )
        .await?;
        decode_invoke_error(&response, "CommissioningComplete")?;

        // 7. CASE 重连运营通道
        self.connect_case(device_node_id, &address, None).await?;
        info!(%device_node_id, "device commissioned and operational");
        Ok(device_node_id)
    }

    async fn connect_case(
        &self,
        node_id: NodeId,
        address: &PeerAddress,
        resumption: Option<ResumptionRecord>,
    ) -> Result<Arc<SecureSession>> {
        let channel = self.transport.open_channel(address.clone())?;
        let (session, resumption) = establish_case(
            &self.exchanges,
            Arc::clone(&self.crypto),
            channel,
            self.fabric.credentials(),
            node_id,
            resumption,
            SessionParameters::default(),
        )
        .await?;

        match self.peers.get(&node_id.raw()) {
            Some(peer) => {
                *peer.session.lock().expect("peer session lock") = Arc::clone(&session);
                *peer.resumption.lock().expect("peer resumption lock") = resumption;
            }
            None => {
                self.peers.insert(
                    node_id.raw(),
                    Arc::new(Peer {
                        node_id,
                        address: address.clone(),
                        session: Mutex::new(Arc::clone(&session)),
                        resumption: Mutex::new(resumption),
                    }),
                );
            }
        }
        Ok(session)
    }

    /// 取得指向 peer 的交互客户端；会话失效时用恢复记录重建 CASE。
    pub async fn client_for(&self, node_id: NodeId) -> Result<InteractionClient> {
        let peer = self.peer(node_id).ok_or_else(|| {
            MatterError::protocol(codes::PATH_NOT_FOUND, format!("unknown peer {node_id}"))
        })?;
        let session = peer.session();
        let session = if session.is_open() {
            session
        } else {
            let resumption = peer.resumption.lock().expect("peer resumption lock").clone();
            self.connect_case(node_id, &peer.address, Some(resumption))
                .await?
        };
        Ok(InteractionClient::new(Arc::clone(&self.exchanges), session))
    }

    /// 对 peer 建立断线自愈的持续订阅。
    pub fn sustained_subscribe(
        self: &Arc<Self>,
        node_id: NodeId,
        request: SubscribeRequest,
        sink: ReportSink,
    ) -> Arc<SustainedSubscription> {
        let controller = Arc::clone(self);
        SustainedSubscription::start(
            Arc::clone(&self.clock),
            Arc::new(move || {
                let controller = Arc::clone(&controller);
                let request = request.clone();
                Box::pin(async move {
                    let client = controller.client_for(node_id).await?;
                    client.subscribe(&request).await
                })
            }),
            sink,
        )
    }
}

/// 发单条命令并取回其响应字段（状态型响应折算为空结构体）。
pub async fn single_invoke(
    client: &InteractionClient,
    endpoint: EndpointNumber,
    cluster: matter_core::types::ClusterId,
    command: matter_core::types::CommandId,
    fields: TlvValue,
) -> Result<TlvValue> {
    let request = InvokeRequest {
        timed_request: false,
        invokes: vec![CommandData {
            path: CommandPath {
                endpoint,
                cluster,
                command,
            },
            fields,
            command_ref: None,
        }],
    };
    let response = client.invoke(&request, None).await?;
    let item = response.responses.into_iter().next().ok_or_else(|| {
        MatterError::protocol(codes::EXCHANGE_UNEXPECTED_MESSAGE, "empty invoke response")
    })?;
    if let Some(status) = item.status {
        if !status.is_success() {
            return Err(MatterError::protocol(
                codes::COMMISSIONING_ORDER,
                format!("{command} rejected with {status:?}"),
            ));
        }
        return Ok(TlvValue::Structure(Vec::new()));
    }
    Ok(item.fields.unwrap_or(TlvValue::Structure(Vec::new())))
}

/// 检查带 `errorCode` 字段的命令响应。
pub fn decode_invoke_error(fields: &TlvValue, step: &str) -> Result<()> {
    let error_code = fields.field(0).and_then(|v| v.as_u64()).unwrap_or(0);
    if error_code != 0 {
        return Err(step_failed(step, &format!("device error code {error_code}")));
    }
    Ok(())
}

fn step_failed(step: &str, reason: &str) -> MatterError {
    MatterError::protocol(
        codes::COMMISSIONING_ORDER,
        format!("{step} failed: {reason}"),
    )
}
