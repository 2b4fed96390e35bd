//! 端到端场景：配网、交互与回滚走完整的回环 UDP 协议栈。

use matter_codec_tlv::TlvValue;
use matter_core::clock::SystemClock;
use matter_core::crypto::{CryptoProvider, SoftwareCrypto};
use matter_core::environment::Environment;
use matter_core::types::{AttributeId, EndpointNumber, NodeId};
use matter_datamodel::clusters;
use matter_interaction::{
    AttributePath, AttributeReport, InteractionClient, ReadRequest, SubscribeRequest,
};
use matter_node::{
    CommissionOptions, Controller, ControllerConfig, NodeConfig, ServerNode,
    on_off_light_endpoint, single_invoke,
};
use matter_session::{SessionManager, SessionParameters, establish_pase};
use matter_transport::{ConnectionlessTransport, PeerAddress, UdpTransport};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const PASSCODE: u32 = 20202021;
const DISCRIMINATOR: u16 = 3840;

fn test_node_config() -> NodeConfig {
    NodeConfig {
        port: 0,
        mdns_port: 0,
        enable_ipv4: false,
        addresses: vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
        ..NodeConfig::default()
    }
}

async fn start_server() -> (Arc<ServerNode>, SocketAddr) {
    let environment = Environment::root("server");
    let node = ServerNode::start(
        &environment,
        test_node_config(),
        vec![on_off_light_endpoint(EndpointNumber(1))],
    )
    .await
    .expect("start node");
    node.open_commissioning_window(PASSCODE, DISCRIMINATOR)
        .expect("open window");
    let mdns_addr = {
        let addr = node.mdns_local_addr().expect("mdns addr");
        SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
    };
    (node, mdns_addr)
}

async fn start_controller(mdns_addr: SocketAddr) -> Arc<Controller> {
    let environment = Environment::root("controller");
    Controller::start(
        &environment,
        ControllerConfig {
            mdns_targets: Some(vec![mdns_addr]),
            ..ControllerConfig::default()
        },
    )
    .await
    .expect("start controller")
}

#[tokio::test(flavor = "multi_thread")]
async fn commission_then_toggle_reports_within_a_second() {
    let (node, mdns_addr) = start_server().await;
    let controller = start_controller(mdns_addr).await;

    let device = controller
        .commission(CommissionOptions::new(PASSCODE, DISCRIMINATOR))
        .await
        .expect("commission");

    assert_eq!(controller.peer_count(), 1);
    assert!(node.is_commissioned());

    let client = controller.client_for(device).await.expect("case client");

    // 订阅 OnOff 的全属性。
    let mut subscription = client
        .subscribe(&SubscribeRequest {
            read: ReadRequest {
                attribute_paths: vec![AttributePath {
                    endpoint: Some(EndpointNumber(1)),
                    cluster: Some(clusters::ON_OFF),
                    attribute: None,
                }],
                ..ReadRequest::default()
            },
            min_interval_s: 0,
            max_interval_s: 30,
        })
        .await
        .expect("subscribe");
    let baseline_on_off = subscription
        .baseline
        .iter()
        .find_map(|report| match report {
            AttributeReport::Data { path, value, .. }
                if path.attribute == Some(AttributeId(0)) =>
            {
                value.as_bool()
            }
            _ => None,
        })
        .expect("baseline onOff");
    assert!(!baseline_on_off, "fresh light starts off");

    // Toggle 后 1 秒内必须收到变更报告。
    single_invoke(
        &client,
        EndpointNumber(1),
        clusters::ON_OFF,
        clusters::on_off_commands::TOGGLE,
        TlvValue::Structure(Vec::new()),
    )
    .await
    .expect("toggle");

    let report = subscription
        .next_report(Duration::from_secs(1))
        .await
        .expect("change report");
    let toggled = report
        .iter()
        .find_map(|entry| match entry {
            AttributeReport::Data { path, value, .. }
                if path.attribute == Some(AttributeId(0)) =>
            {
                value.as_bool()
            }
            _ => None,
        })
        .expect("onOff in report");
    assert!(toggled, "toggle turns the light on");
}

#[tokio::test(flavor = "multi_thread")]
async fn failsafe_expiry_rolls_back_half_finished_commissioning() {
    let (node, _mdns) = start_server().await;

    // 手工 PASE：只走到 AddTrustedRootCertificate，不发 AddNOC。
    let sessions = Arc::new(SessionManager::new());
    let exchanges = matter_session::ExchangeManager::new(Arc::new(SystemClock), sessions);
    let transport = UdpTransport::bind("[::]:0".parse().expect("addr"))
        .await
        .expect("bind");
    exchanges.attach_transport(transport.clone() as Arc<dyn ConnectionlessTransport>);
    let channel = transport
        .open_channel(PeerAddress::Udp(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            node.local_port(),
        )))
        .expect("open channel");
    let crypto = Arc::new(SoftwareCrypto);
    let pase = establish_pase(
        &exchanges,
        crypto.clone(),
        channel,
        PASSCODE,
        SessionParameters::default(),
    )
    .await
    .expect("pase");
    let client = InteractionClient::new(Arc::clone(&exchanges), pase);

    // 短 failsafe 便于测试到期。
    single_invoke(
        &client,
        EndpointNumber(0),
        clusters::GENERAL_COMMISSIONING,
        clusters::general_commissioning_commands::ARM_FAIL_SAFE,
        TlvValue::Structure(vec![
            (matter_codec_tlv::Tag::Context(0), TlvValue::UnsignedInt(1)),
            (matter_codec_tlv::Tag::Context(1), TlvValue::UnsignedInt(1)),
        ]),
    )
    .await
    .expect("arm failsafe");

    let root_keys = SoftwareCrypto.generate_keypair();
    let root_cert = matter_session::self_signed_root(&SoftwareCrypto, &root_keys, 1);
    single_invoke(
        &client,
        EndpointNumber(0),
        clusters::OPERATIONAL_CREDENTIALS,
        clusters::operational_credentials_commands::ADD_TRUSTED_ROOT_CERTIFICATE,
        TlvValue::Structure(vec![(
            matter_codec_tlv::Tag::Context(0),
            TlvValue::Bytes(root_cert.to_tlv()),
        )]),
    )
    .await
    .expect("add trusted root");
    assert_eq!(node.fabrics().staged_root_count(), 1);

    // 等 failsafe 到期触发回滚。
    tokio::time::sleep(Duration::from_millis(1600)).await;

    assert_eq!(node.fabrics().staged_root_count(), 0, "staged roots rolled back");
    assert!(node.fabrics().is_empty(), "no fabric added");
    assert!(!node.is_commissioned());
    let breadcrumb = node
        .root()
        .behavior(clusters::GENERAL_COMMISSIONING)
        .expect("general commissioning")
        .datasource()
        .get(AttributeId(0))
        .and_then(|v| v.as_u64());
    assert_eq!(breadcrumb, Some(0), "breadcrumb reset to 0");
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_times_out_without_advertiser() {
    // 指向一个没人听的端口。
    let controller = start_controller(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9)).await;
    let err = controller
        .commission(CommissionOptions {
            timeout: Duration::from_secs(2),
            ..CommissionOptions::new(PASSCODE, 1234)
        })
        .await
        .expect_err("nothing to discover");
    assert_eq!(err.code(), matter_core::error::codes::DISCOVERY_TIMEOUT);
}

#[tokio::test(flavor = "multi_thread")]
async fn plain_write_to_atomic_attribute_is_rejected() {
    let (node, mdns_addr) = start_server().await;
    node.add_thermostat_endpoint(EndpointNumber(2))
        .expect("thermostat endpoint");
    let controller = start_controller(mdns_addr).await;

    // 这一条走二维码配对码入口。
    let code = matter_codec_pairing::encode_qr(&matter_codec_pairing::QrPairingPayload {
        vendor_id: matter_core::types::VendorId(0xfff1),
        product_id: matter_core::types::ProductId(0x8000),
        flow: matter_codec_pairing::CommissioningFlow::Standard,
        discovery_capabilities: matter_codec_pairing::DiscoveryCapabilities {
            on_ip_network: true,
            ..Default::default()
        },
        discriminator: DISCRIMINATOR,
        passcode: PASSCODE,
        extension: None,
    })
    .expect("encode qr");
    let device = controller
        .commission_with_code(&code, Duration::from_secs(30))
        .await
        .expect("commission via qr code");
    let client = controller.client_for(device).await.expect("client");

    let response = client
        .write(
            &matter_interaction::WriteRequest {
                timed_request: false,
                writes: vec![matter_interaction::AttributeData {
                    path: AttributePath::concrete(
                        EndpointNumber(2),
                        clusters::THERMOSTAT,
                        clusters::thermostat_ids::PRESETS,
                    ),
                    value: TlvValue::Array(vec![TlvValue::UnsignedInt(1)]),
                }],
            },
            None,
        )
        .await
        .expect("write response");
    assert_eq!(
        response.statuses[0].status,
        matter_core::status::Status::InvalidInState,
        "atomic attributes reject writes outside an atomic session"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn sustained_subscription_reestablishes_after_session_loss() {
    let (node, mdns_addr) = start_server().await;
    let controller = start_controller(mdns_addr).await;
    let device = controller
        .commission(CommissionOptions::new(PASSCODE, DISCRIMINATOR))
        .await
        .expect("commission");

    let sink_reports = Arc::new(std::sync::Mutex::new(0usize));
    let counted = Arc::clone(&sink_reports);
    let sustained = controller.sustained_subscribe(
        device,
        SubscribeRequest {
            read: ReadRequest {
                attribute_paths: vec![AttributePath {
                    endpoint: Some(EndpointNumber(1)),
                    cluster: Some(clusters::ON_OFF),
                    attribute: None,
                }],
                ..ReadRequest::default()
            },
            min_interval_s: 0,
            max_interval_s: 1,
        },
        Arc::new(move |_reports| {
            *counted.lock().expect("count") += 1;
        }),
    );

    sustained.wait_for(true).await;
    let first_id = sustained.subscription_id().expect("first id");

    // 模拟网络断裂：服务端撕掉全部会话。
    node.sessions().close_all();
    sustained.wait_for(false).await;

    // 自动以 CASE 重建并重订阅；新订阅号不同于旧值。
    sustained.wait_for(true).await;
    let second_id = sustained.subscription_id().expect("second id");
    assert_ne!(first_id, second_id, "resubscription allocates a fresh id");
    assert!(*sink_reports.lock().expect("count") >= 2, "baseline delivered twice");
    sustained.close();
}
