//! 服务端节点：端点树、配网命令面与广告生命周期的组合根。
//!
//! # 启动次序（How）
//! 1. 从环境取时钟/加密/存储服务（缺省时注册默认实现）；
//! 2. 组装根端点（Descriptor、BasicInformation、GeneralCommissioning、
//!    NetworkCommissioning、OperationalCredentials）并激活；
//! 3. 启动 UDP 传输、交换管理器、交互引擎、安全通道处理器与 BDX；
//! 4. 已有 fabric 则直接发运营广告；否则等配网窗口打开后发可配网广告。
//!
//! # 配网命令面（What）
//! GeneralCommissioning 与 OperationalCredentials 的命令处理器在此落地：
//! ArmFailSafe → SetRegulatoryConfig → CSRRequest →
//! AddTrustedRootCertificate → AddNOC →（可选网络配置）→
//! CommissioningComplete；failsafe 到期按日志逆序回滚。

use crate::fabric::{Fabric, FabricManager};
use crate::failsafe::{Failsafe, JournalEntry, RollbackFn};
use crate::stream::ChangeNotificationService;
use matter_codec_tlv::{Tag, TlvValue};
use matter_core::clock::{Clock, ClockService};
use matter_core::config::CoreVars;
use matter_core::crypto::{CryptoProvider, CryptoService};
use matter_core::environment::Environment;
use matter_core::error::{MatterError, Result, codes};
use matter_core::status::Status;
use matter_core::storage::{StorageContext, StorageManager, StorageService};
use matter_core::types::{
    AttributeId, DeviceTypeId, EndpointNumber, NodeId, ProductId, VendorId,
};
use matter_datamodel::clusters::{
    self, general_commissioning_commands as gc, operational_credentials_commands as oc,
};
use matter_datamodel::supervisor::ClusterPlan;
use matter_datamodel::transaction::Datasource;
use matter_datamodel::{Behavior, CommandOutcome, DeviceType, Endpoint, EventLog};
use matter_interaction::{InteractionConfig, InteractionEngine};
use matter_mdns::advert::{
    CommissionableAdvertisement, CommissioningMode, OperationalAdvertisement, SessionIntervals,
};
use matter_mdns::server::{MdnsServer, MdnsServerConfig};
use matter_mdns::wire::Name;
use matter_session::pase::DEFAULT_ITERATIONS;
use matter_session::{
    ExchangeManager, FabricCredentials, NocChain, OperationalCert, PaseVerifier,
    ResumptionRecord, SecureChannelDelegate, SecureChannelHandler, SecureSession, SessionKind,
    SessionManager, SessionParameters,
};
use matter_transport::{ConnectionlessTransport, UdpTransport};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 节点配置。
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub device_name: String,
    pub device_type: DeviceTypeId,
    /// Matter UDP 端口；0 让内核分配（测试）。
    pub port: u16,
    /// MDNS 端口；0 让内核分配并停用组播加入（测试）。
    pub mdns_port: u16,
    pub enable_ipv4: bool,
    pub addresses: Vec<IpAddr>,
    pub max_cumulative_failsafe: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            vendor_id: VendorId(0xfff1),
            product_id: ProductId(0x8000),
            device_name: "matter-node".into(),
            device_type: DeviceTypeId(0x0100),
            port: 5540,
            mdns_port: matter_mdns::server::MDNS_PORT,
            enable_ipv4: true,
            addresses: vec![IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)],
            max_cumulative_failsafe: Duration::from_secs(900),
        }
    }
}

struct CommissioningWindow {
    discriminator: u16,
    verifier: PaseVerifier,
}

/// 服务端节点。
pub struct ServerNode {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    crypto: Arc<dyn CryptoProvider>,
    storage: Arc<dyn StorageService>,
    root: Arc<Endpoint>,
    event_log: Arc<EventLog>,
    fabrics: Arc<FabricManager>,
    failsafe: Arc<Failsafe>,
    sessions: Arc<SessionManager>,
    exchanges: Arc<ExchangeManager>,
    transport: Arc<UdpTransport>,
    mdns: Arc<MdnsServer>,
    engine: Arc<InteractionEngine>,
    changes: Arc<ChangeNotificationService>,
    resumptions: dashmap::DashMap<Vec<u8>, ResumptionRecord>,
    window: Mutex<Option<CommissioningWindow>>,
    /// 配网状态迁移的节点级互斥（fabric 增删、failsafe 武装/解除）。
    commissioning_lock: Mutex<()>,
    instance_id: String,
}

impl ServerNode {
    /// 启动节点。`extra_endpoints` 在激活前挂到根端点下。
    pub async fn start(
        environment: &Arc<Environment>,
        config: NodeConfig,
        extra_endpoints: Vec<Arc<Endpoint>>,
    ) -> Result<Arc<Self>> {
        init_default_services(environment);
        let clock = environment.get::<ClockService>()?.clock();
        let crypto = environment.get::<CryptoService>()?.provider();
        let storage = environment.get::<StorageManager>()?.backend();
        let vars = environment
            .maybe_get::<CoreVars>()
            .unwrap_or_else(|| Arc::new(CoreVars::default()));

        let root = build_root_endpoint(&config, Arc::clone(&storage));
        for endpoint in extra_endpoints {
            root.add_child(endpoint);
        }
        root.activate()?;

        let event_log = EventLog::with_storage(
            Arc::clone(&clock),
            matter_datamodel::events::DEFAULT_RING_CAPACITY,
            Arc::clone(&storage),
        );
        let fabrics = FabricManager::load(Arc::clone(&storage));
        let failsafe = Failsafe::new(Arc::clone(&clock), config.max_cumulative_failsafe);
        let sessions = Arc::new(SessionManager::new());
        let exchanges = ExchangeManager::new(Arc::clone(&clock), Arc::clone(&sessions));

        let transport = UdpTransport::bind(std::net::SocketAddr::new(
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            config.port,
        ))
        .await?;
        exchanges.attach_transport(Arc::clone(&transport) as Arc<dyn ConnectionlessTransport>);

        let engine = InteractionEngine::new(
            Arc::clone(&clock),
            Arc::clone(&root),
            Arc::clone(&event_log),
            InteractionConfig::default(),
        );
        engine.install(&exchanges);
        matter_bdx_install(&exchanges, Arc::clone(&storage));

        let mdns = MdnsServer::bind(
            MdnsServerConfig {
                hostname: format!("{}.local", config.device_name),
                addresses: if config.addresses.is_empty() {
                    vec![IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)]
                } else {
                    config.addresses.clone()
                },
                enable_ipv4: config.enable_ipv4 && vars.mdns_ipv4(),
                port: config.mdns_port,
            },
            Arc::clone(&clock),
        )
        .await?;

        let mut instance_bytes = [0u8; 8];
        crypto.fill_random(&mut instance_bytes);
        let instance_id: String = instance_bytes.iter().map(|b| format!("{b:02X}")).collect();

        let changes = ChangeNotificationService::new();
        changes.attach_tree(NodeId(0), &root);

        let node = Arc::new(Self {
            config,
            clock,
            crypto,
            storage,
            root,
            event_log,
            fabrics,
            failsafe,
            sessions,
            exchanges,
            transport,
            mdns,
            engine,
            changes,
            resumptions: dashmap::DashMap::new(),
            window: Mutex::new(None),
            commissioning_lock: Mutex::new(()),
            instance_id,
        });

        SecureChannelHandler::install(
            &node.exchanges,
            Arc::clone(&node.crypto),
            Arc::new(NodeDelegate(Arc::downgrade(&node))),
        );
        node.install_commissioning_handlers();
        node.load_resumptions();

        if node.is_commissioned() {
            node.advertise_operational();
        }
        info!(port = node.local_port(), "server node started");
        Ok(node)
    }

    pub fn local_port(&self) -> u16 {
        self.transport.local_addr().port()
    }

    pub fn root(&self) -> &Arc<Endpoint> {
        &self.root
    }

    pub fn interaction(&self) -> &Arc<InteractionEngine> {
        &self.engine
    }

    pub fn exchanges(&self) -> &Arc<ExchangeManager> {
        &self.exchanges
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn fabrics(&self) -> &Arc<FabricManager> {
        &self.fabrics
    }

    pub fn changes(&self) -> &Arc<ChangeNotificationService> {
        &self.changes
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.event_log
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 节点是否已有 fabric（否则处于可配网状态）。
    pub fn is_commissioned(&self) -> bool {
        !self.fabrics.is_empty()
    }

    /// MDNS 套接字地址（测试以传统单播对准它）。
    pub fn mdns_local_addr(&self) -> Result<std::net::SocketAddr> {
        self.mdns.local_addr()
    }

    /// 运行期追加一个 Thermostat 端点并接通原子写协调器。
    pub fn add_thermostat_endpoint(&self, number: EndpointNumber) -> Result<Arc<Endpoint>> {
        let endpoint = Endpoint::new(number, "thermostat", Vec::new());
        let behavior = Behavior::new(
            Datasource::new(
                number,
                Arc::new(ClusterPlan::compile(clusters::thermostat(), 0)),
                None,
            ),
            false,
        );
        matter_interaction::install_atomic_request(
            &behavior,
            Arc::clone(self.engine.atomic()),
            clusters::thermostat_ids::ATOMIC_REQUEST,
            clusters::thermostat_ids::ATOMIC_RESPONSE,
        );
        endpoint.add_behavior(behavior);
        self.root.add_child(Arc::clone(&endpoint));
        endpoint.activate()?;
        Ok(endpoint)
    }

    /// 打开基础配网窗口并发布可配网广告。
    pub fn open_commissioning_window(&self, passcode: u32, discriminator: u16) -> Result<()> {
        let mut salt = vec![0u8; 16];
        self.crypto.fill_random(&mut salt);
        let verifier =
            PaseVerifier::from_passcode(self.crypto.as_ref(), passcode, DEFAULT_ITERATIONS, salt)?;
        *self.window.lock().expect("window lock") = Some(CommissioningWindow {
            discriminator,
            verifier,
        });

        self.mdns.advertise(
            CommissionableAdvertisement {
                instance_id: self.instance_id.clone(),
                discriminator,
                vendor_id: self.config.vendor_id,
                product_id: self.config.product_id,
                mode: CommissioningMode::Basic,
                device_type: self.config.device_type,
                device_name: Some(self.config.device_name.clone()),
                intervals: SessionIntervals::default(),
                pairing_hint: 0,
                pairing_instructions: None,
                idle_capable: false,
                port: self.local_port(),
            }
            .into_service(),
        );
        info!(discriminator, "commissioning window opened");
        Ok(())
    }

    /// 关闭配网窗口并撤下可配网广告。
    pub fn close_commissioning_window(&self) {
        *self.window.lock().expect("window lock") = None;
        self.mdns.withdraw(&Name::parse(&format!(
            "{}.{}",
            self.instance_id,
            matter_mdns::advert::COMMISSIONABLE_SERVICE
        )));
    }

    fn advertise_operational(&self) {
        for fabric in self.fabrics.all() {
            self.mdns.advertise(
                OperationalAdvertisement {
                    compressed_fabric_id: fabric.compressed_fabric_id(self.crypto.as_ref()),
                    node_id: fabric.local_node_id,
                    intervals: SessionIntervals::default(),
                    port: self.local_port(),
                }
                .into_service(),
            );
        }
    }

    // ---- 恢复记录持久化（sessions/resumption/<peer>）----

    fn resumption_context() -> StorageContext {
        StorageContext::new("sessions").child("resumption")
    }

    fn load_resumptions(&self) {
        let context = Self::resumption_context();
        for key in self.storage.keys(&context) {
            let Some(bytes) = self.storage.get(&context, &key) else {
                continue;
            };
            if let Some(record) = decode_resumption(&bytes) {
                self.resumptions.insert(record.resumption_id.to_vec(), record);
            }
        }
    }

    fn store_resumption(&self, record: &ResumptionRecord) {
        self.resumptions
            .insert(record.resumption_id.to_vec(), record.clone());
        self.storage.set(
            &Self::resumption_context(),
            &record.peer_node_id.raw().to_string(),
            encode_resumption(record),
        );
    }

    // ---- 配网命令面 ----

    fn behavior(&self, cluster: matter_core::types::ClusterId) -> Option<Arc<Behavior>> {
        self.root.behavior(cluster)
    }

    fn rollback_fn(self: &Arc<Self>) -> RollbackFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |journal| {
            if let Some(node) = weak.upgrade() {
                node.apply_rollback(journal);
            }
        })
    }

    /// 逆序回放 failsafe 日志。
    fn apply_rollback(&self, journal: Vec<JournalEntry>) {
        let _guard = self.commissioning_lock.lock().expect("commissioning lock");
        // 先关 PASE（临时管理通道随回滚作废）。
        self.sessions.close_for_peer(NodeId(0));
        for entry in journal.into_iter().rev() {
            match entry {
                JournalEntry::TrustedRootStaged => self.fabrics.discard_staged_roots(),
                JournalEntry::FabricAdded(index) => {
                    self.sessions.close_for_fabric(index);
                    self.fabrics.remove(index);
                }
                JournalEntry::NocUpdated {
                    index,
                    prior_chain,
                    prior_keypair,
                } => {
                    if let Err(err) = self.fabrics.update_noc(index, prior_chain, prior_keypair) {
                        warn!(error = %err, "noc restore failed during rollback");
                    }
                }
                JournalEntry::AttributeSnapshot {
                    endpoint,
                    cluster,
                    attribute,
                    prior,
                } => {
                    let restored = self
                        .root
                        .find(endpoint)
                        .and_then(|e| e.behavior(cluster))
                        .map(|b| b.datasource().write_one(attribute, prior));
                    if let Some(Err(err)) = restored {
                        warn!(error = %err, "attribute restore failed during rollback");
                    }
                }
            }
        }
        // breadcrumb 归零。
        if let Some(behavior) = self.behavior(clusters::GENERAL_COMMISSIONING) {
            let _ = behavior
                .datasource()
                .write_one(AttributeId(0), TlvValue::UnsignedInt(0));
        }
        info!("failsafe rollback applied");
    }

    fn install_commissioning_handlers(self: &Arc<Self>) {
        let Some(general) = self.behavior(clusters::GENERAL_COMMISSIONING) else {
            return;
        };
        let Some(credentials) = self.behavior(clusters::OPERATIONAL_CREDENTIALS) else {
            return;
        };

        // ArmFailSafe
        let node = Arc::downgrade(self);
        general.set_command(
            gc::ARM_FAIL_SAFE,
            Arc::new(move |ctx, fields| {
                let node = upgrade(&node)?;
                let expiry = fields
                    .field(0)
                    .and_then(|v| v.as_u64())
                    .unwrap_or(60);
                node.failsafe
                    .arm(Duration::from_secs(expiry), node.rollback_fn())?;
                write_breadcrumb(ctx, fields, 1)?;
                Ok(command_response(gc::ARM_FAIL_SAFE_RESPONSE, 0))
            }),
        );

        // SetRegulatoryConfig
        let node = Arc::downgrade(self);
        general.set_command(
            gc::SET_REGULATORY_CONFIG,
            Arc::new(move |ctx, fields| {
                let node = upgrade(&node)?;
                node.failsafe.ensure_armed()?;
                let location = fields.field(0).and_then(|v| v.as_u64()).unwrap_or(0);
                ctx.behavior
                    .datasource()
                    .write_one(AttributeId(2), TlvValue::UnsignedInt(location))?;
                write_breadcrumb(ctx, fields, 2)?;
                Ok(command_response(gc::SET_REGULATORY_CONFIG_RESPONSE, 0))
            }),
        );

        // CommissioningComplete
        let node = Arc::downgrade(self);
        general.set_command(
            gc::COMMISSIONING_COMPLETE,
            Arc::new(move |ctx, _fields| {
                let node = upgrade(&node)?;
                node.failsafe.disarm_commit()?;
                ctx.behavior
                    .datasource()
                    .write_one(AttributeId(0), TlvValue::UnsignedInt(0))?;
                node.close_commissioning_window();
                node.advertise_operational();
                node.mdns.reduce_broadcast();

                // 响应送达后关闭临时管理通道。
                let sessions = Arc::clone(&node.sessions);
                let clock = Arc::clone(&node.clock);
                tokio::spawn(async move {
                    clock.sleep(Duration::from_secs(1)).await;
                    close_pase_sessions(&sessions);
                });
                info!("commissioning complete, node operational");
                Ok(command_response(gc::COMMISSIONING_COMPLETE_RESPONSE, 0))
            }),
        );

        // CSRRequest
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::CSR_REQUEST,
            Arc::new(move |_ctx, fields| {
                let node = upgrade(&node)?;
                node.failsafe.ensure_armed()?;
                let nonce = fields
                    .field(0)
                    .and_then(|v| v.as_bytes())
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                let keypair = node.crypto.generate_keypair();
                let public_key = keypair.public_key().to_vec();
                let attestation = node.crypto.sign(&keypair, &nonce).to_vec();
                node.failsafe.stash_keypair(keypair)?;

                let elements = matter_codec_tlv::encode(&TlvValue::Structure(vec![
                    (Tag::Context(0), TlvValue::Bytes(public_key)),
                    (Tag::Context(1), TlvValue::Bytes(nonce)),
                ]));
                Ok(CommandOutcome::Response {
                    command: oc::CSR_RESPONSE,
                    fields: TlvValue::Structure(vec![
                        (Tag::Context(0), TlvValue::Bytes(elements)),
                        (Tag::Context(1), TlvValue::Bytes(attestation)),
                    ]),
                })
            }),
        );

        // AddTrustedRootCertificate
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::ADD_TRUSTED_ROOT_CERTIFICATE,
            Arc::new(move |_ctx, fields| {
                let node = upgrade(&node)?;
                node.failsafe.ensure_armed()?;
                let cert_bytes = fields
                    .field(0)
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| malformed_command("rootCaCertificate"))?;
                let cert = OperationalCert::from_tlv(cert_bytes)?;
                cert.verify_signed_by(node.crypto.as_ref(), &cert.public_key)?;
                node.fabrics.stage_trusted_root(cert);
                node.failsafe.record(JournalEntry::TrustedRootStaged)?;
                Ok(CommandOutcome::Status(Status::Success))
            }),
        );

        // AddNOC
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::ADD_NOC,
            Arc::new(move |_ctx, fields| {
                let node = upgrade(&node)?;
                node.failsafe.ensure_armed()?;
                node.handle_add_noc(fields)
            }),
        );

        // UpdateNOC：在既有 fabric 上替换操作凭据，旧材料入回滚日志。
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::UPDATE_NOC,
            Arc::new(move |ctx, fields| {
                let node = upgrade(&node)?;
                node.failsafe.ensure_armed()?;
                let index = ctx
                    .subject
                    .fabric_index
                    .ok_or_else(|| malformed_command("no accessing fabric"))?;
                let fabric = node.fabrics.get(index).ok_or_else(|| {
                    MatterError::protocol(codes::PATH_NOT_FOUND, format!("no fabric at {index}"))
                })?;

                let noc_bytes = fields
                    .field(0)
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| malformed_command("nocValue"))?;
                let chain = NocChain {
                    noc: OperationalCert::from_tlv(noc_bytes)?,
                    icac: fields
                        .field(1)
                        .and_then(|v| v.as_bytes())
                        .map(OperationalCert::from_tlv)
                        .transpose()?,
                };
                chain.validate(
                    node.crypto.as_ref(),
                    &fabric.root_cert.public_key,
                    fabric.fabric_id,
                )?;
                let keypair = node.failsafe.take_keypair().ok_or_else(|| {
                    MatterError::protocol(
                        codes::COMMISSIONING_ORDER,
                        "update-noc without a preceding csr request",
                    )
                })?;
                if chain.noc.public_key != keypair.public_key() {
                    return Err(MatterError::protocol(
                        codes::SESSION_INVALID_CERTIFICATE,
                        "noc public key does not match the issued csr",
                    ));
                }

                let (prior_chain, prior_keypair) =
                    node.fabrics.update_noc(index, chain, Arc::new(keypair))?;
                node.failsafe.record(JournalEntry::NocUpdated {
                    index,
                    prior_chain,
                    prior_keypair,
                })?;
                Ok(noc_response(0, index.raw()))
            }),
        );

        // UpdateFabricLabel
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::UPDATE_FABRIC_LABEL,
            Arc::new(move |ctx, fields| {
                let node = upgrade(&node)?;
                let label = fields
                    .field(0)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned();
                let index = ctx
                    .subject
                    .fabric_index
                    .ok_or_else(|| malformed_command("no accessing fabric"))?;
                node.fabrics.update_label(index, label)?;
                Ok(noc_response(0, index.raw()))
            }),
        );

        // RemoveFabric
        let node = Arc::downgrade(self);
        credentials.set_command(
            oc::REMOVE_FABRIC,
            Arc::new(move |_ctx, fields| {
                let node = upgrade(&node)?;
                let index = matter_core::types::FabricIndex(
                    fields.field(0).and_then(|v| v.as_u64()).unwrap_or(0) as u8,
                );
                node.sessions.close_for_fabric(index);
                match node.fabrics.remove(index) {
                    Some(_) => Ok(noc_response(0, index.raw())),
                    None => Ok(CommandOutcome::Status(Status::NotFound)),
                }
            }),
        );
    }

    /// AddNOC：校验链、落 fabric 槽位并记入回滚日志。
    fn handle_add_noc(self: &Arc<Self>, fields: &TlvValue) -> Result<CommandOutcome> {
        let _guard = self.commissioning_lock.lock().expect("commissioning lock");
        let noc_bytes = fields
            .field(0)
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| malformed_command("nocValue"))?;
        let icac_bytes = fields.field(1).and_then(|v| v.as_bytes());
        let ipk_bytes = fields
            .field(2)
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| malformed_command("ipkValue"))?;
        let case_admin = fields.field(3).and_then(|v| v.as_u64()).unwrap_or(0);
        let admin_vendor = fields.field(4).and_then(|v| v.as_u64()).unwrap_or(0) as u16;

        let noc = OperationalCert::from_tlv(noc_bytes)?;
        let chain = NocChain {
            noc,
            icac: icac_bytes.map(OperationalCert::from_tlv).transpose()?,
        };

        let keypair = self.failsafe.take_keypair().ok_or_else(|| {
            MatterError::protocol(
                codes::COMMISSIONING_ORDER,
                "add-noc without a preceding csr request",
            )
        })?;
        if chain.noc.public_key != keypair.public_key() {
            return Err(MatterError::protocol(
                codes::SESSION_INVALID_CERTIFICATE,
                "noc public key does not match the issued csr",
            ));
        }

        // 在暂存信任根里找出能为这条链验签的根；找不到即步骤顺序违例。
        let root_cert = self
            .fabrics
            .take_root_for_chain(&chain, self.crypto.as_ref())
            .ok_or_else(|| {
                MatterError::protocol(
                    codes::COMMISSIONING_ORDER,
                    "add-noc before add-trusted-root-certificate",
                )
            })?;

        let mut ipk = [0u8; 16];
        if ipk_bytes.len() != 16 {
            return Err(malformed_command("ipk length"));
        }
        ipk.copy_from_slice(ipk_bytes);

        let index = self.fabrics.allocate_index()?;
        let fabric = Fabric {
            index,
            fabric_id: chain.noc.fabric_id,
            local_node_id: chain.node_id()?,
            vendor_id: VendorId(admin_vendor),
            label: String::new(),
            root_cert,
            noc_chain: chain,
            ipk,
            keypair: Arc::new(keypair),
            case_admin_subject: NodeId(case_admin),
        };
        self.fabrics.insert(fabric)?;
        self.failsafe.record(JournalEntry::FabricAdded(index))?;
        Ok(noc_response(0, index.raw()))
    }
}

fn close_pase_sessions(sessions: &Arc<SessionManager>) {
    // PASE 会话以空节点号登记。
    sessions.close_for_peer(NodeId(0));
}

fn upgrade(node: &Weak<ServerNode>) -> Result<Arc<ServerNode>> {
    node.upgrade().ok_or_else(|| {
        MatterError::implementation(codes::SERVICE_UNAVAILABLE, "node is shutting down")
    })
}

fn malformed_command(what: &str) -> MatterError {
    MatterError::framing(codes::TLV_MALFORMED, format!("command payload: {what}"))
}

fn command_response(command: matter_core::types::CommandId, error_code: u64) -> CommandOutcome {
    CommandOutcome::Response {
        command,
        fields: TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::UnsignedInt(error_code)),
            (Tag::Context(1), TlvValue::Utf8(String::new())),
        ]),
    }
}

fn noc_response(status: u64, fabric_index: u8) -> CommandOutcome {
    CommandOutcome::Response {
        command: oc::NOC_RESPONSE,
        fields: TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::UnsignedInt(status)),
            (
                Tag::Context(1),
                TlvValue::UnsignedInt(u64::from(fabric_index)),
            ),
        ]),
    }
}

fn write_breadcrumb(
    ctx: &matter_datamodel::CommandContext,
    fields: &TlvValue,
    default: u64,
) -> Result<()> {
    let breadcrumb = fields
        .field(1)
        .and_then(|v| v.as_u64())
        .unwrap_or(default);
    ctx.behavior
        .datasource()
        .write_one(AttributeId(0), TlvValue::UnsignedInt(breadcrumb))?;
    Ok(())
}

fn encode_resumption(record: &ResumptionRecord) -> Vec<u8> {
    matter_codec_tlv::encode(&TlvValue::Structure(vec![
        (Tag::Context(0), TlvValue::Bytes(record.resumption_id.to_vec())),
        (Tag::Context(1), TlvValue::Bytes(record.shared_secret.to_vec())),
        (
            Tag::Context(2),
            TlvValue::UnsignedInt(record.peer_node_id.raw()),
        ),
        (
            Tag::Context(3),
            TlvValue::UnsignedInt(u64::from(record.fabric_index.raw())),
        ),
    ]))
}

fn decode_resumption(bytes: &[u8]) -> Option<ResumptionRecord> {
    let value = matter_codec_tlv::decode(bytes).ok()?;
    let id = value.field(0)?.as_bytes()?;
    let secret = value.field(1)?.as_bytes()?;
    if id.len() != 16 || secret.len() != 32 {
        return None;
    }
    let mut resumption_id = [0u8; 16];
    resumption_id.copy_from_slice(id);
    let mut shared_secret = [0u8; 32];
    shared_secret.copy_from_slice(secret);
    Some(ResumptionRecord {
        resumption_id,
        shared_secret,
        peer_node_id: NodeId(value.field(2)?.as_u64()?),
        fabric_index: matter_core::types::FabricIndex(value.field(3)?.as_u64()? as u8),
    })
}

/// 安全通道响应侧的节点策略。
struct NodeDelegate(Weak<ServerNode>);

impl SecureChannelDelegate for NodeDelegate {
    fn pase_verifier(&self) -> Option<PaseVerifier> {
        let node = self.0.upgrade()?;
        let window = node.window.lock().expect("window lock");
        window.as_ref().map(|w| w.verifier.clone())
    }

    fn fabrics(&self) -> Vec<FabricCredentials> {
        let Some(node) = self.0.upgrade() else {
            return Vec::new();
        };
        node.fabrics.all().iter().map(Fabric::credentials).collect()
    }

    fn resumption_for(&self, resumption_id: &[u8]) -> Option<ResumptionRecord> {
        let node = self.0.upgrade()?;
        node.resumptions
            .get(resumption_id)
            .map(|entry| entry.clone())
    }

    fn session_parameters(&self) -> SessionParameters {
        SessionParameters::default()
    }

    fn on_session_established(
        &self,
        session: &Arc<SecureSession>,
        resumption: Option<&ResumptionRecord>,
    ) {
        let Some(node) = self.0.upgrade() else {
            return;
        };
        debug!(session = %session.local_id, kind = ?session.kind, "session established");
        if let Some(record) = resumption {
            node.store_resumption(record);
        }
        if session.kind == SessionKind::Case {
            node.mdns.reduce_broadcast();
        }
    }
}

fn init_default_services(environment: &Arc<Environment>) {
    if !environment.has::<ClockService>() {
        environment.set(Arc::new(ClockService::system()));
    }
    if !environment.has::<CryptoService>() {
        environment.set(Arc::new(CryptoService::software()));
    }
    if !environment.has::<StorageManager>() {
        environment.set(Arc::new(StorageManager::memory()));
    }
}

fn matter_bdx_install(exchanges: &Arc<ExchangeManager>, storage: Arc<dyn StorageService>) {
    // BDX 处理器与 OTA 存储共用节点级后端。
    matter_bdx::BdxHandler::new(storage).install(exchanges);
}

/// 组装根端点（端点 0）。
fn build_root_endpoint(config: &NodeConfig, storage: Arc<dyn StorageService>) -> Arc<Endpoint> {
    let root = Endpoint::new(EndpointNumber(0), "root", Vec::new());
    let node_context = StorageContext::new("nodes").child("0").child("0");

    let make = |schema: matter_datamodel::ClusterSchema, early: bool| {
        let cluster = schema.id;
        Behavior::new(
            Datasource::new(
                EndpointNumber(0),
                Arc::new(ClusterPlan::compile(schema, 0)),
                Some((Arc::clone(&storage), node_context.child(cluster.raw().to_string()))),
            ),
            early,
        )
    };

    let descriptor = make(clusters::descriptor(), true);
    let basic = make(clusters::basic_information(), true);
    let general = make(clusters::general_commissioning(), false);
    let network = make(clusters::network_commissioning(), false);
    let credentials = make(clusters::operational_credentials(), false);

    // BasicInformation 的出厂字段。
    let _ = basic.datasource().write_one(
        AttributeId(0x0002),
        TlvValue::UnsignedInt(u64::from(config.vendor_id.raw())),
    );
    let _ = basic.datasource().write_one(
        AttributeId(0x0004),
        TlvValue::UnsignedInt(u64::from(config.product_id.raw())),
    );
    let _ = basic.datasource().write_one(
        AttributeId(0x0003),
        TlvValue::Utf8(config.device_name.clone()),
    );

    root.add_behavior(descriptor);
    root.add_behavior(basic);
    root.add_behavior(general);
    root.add_behavior(network);
    root.add_behavior(credentials);
    root
}

/// 预置的 OnOff 灯端点（演示负载与端到端测试共用）。
pub fn on_off_light_endpoint(number: EndpointNumber) -> Arc<Endpoint> {
    let endpoint = Endpoint::new(
        number,
        "light",
        vec![DeviceType {
            id: DeviceTypeId(0x0100),
            revision: 3,
            required_server_clusters: vec![clusters::ON_OFF],
        }],
    );
    let behavior = Behavior::new(
        Datasource::new(
            number,
            Arc::new(ClusterPlan::compile(clusters::on_off(), 0)),
            None,
        ),
        false,
    );

    let set_on_off = |value: bool| {
        Arc::new(move |ctx: &matter_datamodel::CommandContext, _fields: &TlvValue| {
            ctx.behavior
                .datasource()
                .write_one(AttributeId(0), TlvValue::Bool(value))?;
            Ok(CommandOutcome::Status(Status::Success))
        })
    };
    behavior.set_command(clusters::on_off_commands::OFF, set_on_off(false));
    behavior.set_command(clusters::on_off_commands::ON, set_on_off(true));
    behavior.set_command(
        clusters::on_off_commands::TOGGLE,
        Arc::new(|ctx, _fields| {
            let current = ctx
                .behavior
                .datasource()
                .get(AttributeId(0))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            ctx.behavior
                .datasource()
                .write_one(AttributeId(0), TlvValue::Bool(!current))?;
            Ok(CommandOutcome::Status(Status::Success))
        }),
    );
    endpoint.add_behavior(behavior);
    endpoint
}
