//! MDNS 服务端：组播套接字、查询分发与通告调度。
//!
//! # 实现策略（How）
//! - 每个地址族一个组播套接字（IPv6 必开，IPv4 受配置开关控制），由
//!   `socket2` 完成端口复用与组播加入后移交 Tokio；
//! - 查询处理走 [`QueryResponder`] 策略引擎；TC 置位的查询在 500 ms 窗口
//!   内缓存等待延续报文，合并后统一处理；
//! - 源端口不是 5353 的查询按传统单播解析处理，应答直接回源（该路径
//!   也被工作区内的回环测试使用）；
//! - 通告循环独立任务运行：初始两连发、变更即触发、稳态周期刷新。

use crate::advert::ServiceAdvertisement;
use crate::responder::{AnnouncementSchedule, QueryResponder, ResponseRoute};
use crate::wire::{DnsMessage, Name};
use matter_core::clock::Clock;
use matter_core::environment::EnvironmentService;
use matter_core::error::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// mDNS 标准端口与组播组。
pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

/// 截断查询的缓冲窗口。
const TRUNCATED_QUERY_WINDOW: Duration = Duration::from_millis(500);

/// 服务端配置。
#[derive(Clone, Debug)]
pub struct MdnsServerConfig {
    /// 本机主机名（`<name>.local`）。
    pub hostname: String,
    /// 对外公布的地址集合。
    pub addresses: Vec<IpAddr>,
    /// 是否同时服务 IPv4（`MATTER_MDNS_IPV4`）。
    pub enable_ipv4: bool,
    /// 监听端口；测试可用 0 让内核分配（同时禁用组播加入）。
    pub port: u16,
}

impl Default for MdnsServerConfig {
    fn default() -> Self {
        Self {
            hostname: "matter-node.local".into(),
            addresses: Vec::new(),
            enable_ipv4: true,
            port: MDNS_PORT,
        }
    }
}

struct ServerState {
    clock: Arc<dyn Clock>,
    hostname: Name,
    addresses: Vec<IpAddr>,
    responder: Mutex<QueryResponder>,
    schedule: Mutex<AnnouncementSchedule>,
    adverts: Mutex<HashMap<Name, ServiceAdvertisement>>,
    pending_truncated: Mutex<HashMap<SocketAddr, DnsMessage>>,
    announce: Notify,
}

impl ServerState {
    fn rebuild_records(&self) {
        let adverts = self.adverts.lock().expect("advert lock");
        let mut records = Vec::new();
        for advert in adverts.values() {
            records.extend(advert.records(&self.hostname, &self.addresses));
        }
        self.responder
            .lock()
            .expect("responder lock")
            .replace_records(records);
    }
}

/// MDNS 服务端句柄。
pub struct MdnsServer {
    state: Arc<ServerState>,
    socket_v6: Arc<UdpSocket>,
    socket_v4: Option<Arc<UdpSocket>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MdnsServer {
    /// 绑定套接字并启动接收/通告任务。
    pub async fn bind(config: MdnsServerConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let join_multicast = config.port == MDNS_PORT;
        let socket_v6 = Arc::new(bind_multicast_v6(config.port, join_multicast)?);
        let socket_v4 = if config.enable_ipv4 {
            Some(Arc::new(bind_multicast_v4(config.port, join_multicast)?))
        } else {
            None
        };

        let state = Arc::new(ServerState {
            clock,
            hostname: Name::parse(&config.hostname),
            addresses: config.addresses,
            responder: Mutex::new(QueryResponder::new()),
            schedule: Mutex::new(AnnouncementSchedule::default()),
            adverts: Mutex::new(HashMap::new()),
            pending_truncated: Mutex::new(HashMap::new()),
            announce: Notify::new(),
        });

        let server = Arc::new(Self {
            state: Arc::clone(&state),
            socket_v6: Arc::clone(&socket_v6),
            socket_v4: socket_v4.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(spawn_receive_loop(Arc::clone(&state), Arc::clone(&socket_v6)));
        if let Some(socket_v4) = &socket_v4 {
            tasks.push(spawn_receive_loop(Arc::clone(&state), Arc::clone(socket_v4)));
        }
        tasks.push(spawn_announce_loop(
            Arc::clone(&state),
            Arc::clone(&socket_v6),
            socket_v4,
        ));
        *server.tasks.lock().expect("task lock") = tasks;

        Ok(server)
    }

    /// 本机 IPv6 套接字地址（测试用）。
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket_v6.local_addr().map_err(matter_core::MatterError::from)?)
    }

    /// 发布或更新一个服务广告；触发通告连发。
    pub fn advertise(&self, advert: ServiceAdvertisement) {
        self.state
            .adverts
            .lock()
            .expect("advert lock")
            .insert(advert.instance.clone(), advert);
        self.state.rebuild_records();
        self.state.schedule.lock().expect("schedule lock").mark_changed();
        self.state.announce.notify_one();
    }

    /// 撤下一个服务广告。
    pub fn withdraw(&self, instance: &Name) {
        self.state.adverts.lock().expect("advert lock").remove(instance);
        self.state.rebuild_records();
        self.state.announce.notify_one();
    }

    /// 对端会话建立后收敛广播节奏。
    pub fn reduce_broadcast(&self) {
        self.state.schedule.lock().expect("schedule lock").reduce();
    }

    /// 停止全部后台任务。
    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }
}

impl Drop for MdnsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EnvironmentService for MdnsServer {
    fn close(&self) {
        self.shutdown();
    }
}

fn spawn_receive_loop(state: Arc<ServerState>, socket: Arc<UdpSocket>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 9000];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "mdns receive loop terminated");
                    return;
                }
            };
            let message = match DnsMessage::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    trace!(error = %err, %from, "dropping malformed dns packet");
                    continue;
                }
            };
            handle_message(&state, &socket, from, message).await;
        }
    })
}

async fn handle_message(
    state: &Arc<ServerState>,
    socket: &Arc<UdpSocket>,
    from: SocketAddr,
    message: DnsMessage,
) {
    if message.is_response {
        return;
    }

    // 截断查询：缓存并等待延续；到期后按已有内容处理。
    let merged = {
        let mut pending = state.pending_truncated.lock().expect("pending lock");
        match pending.remove(&from) {
            Some(mut buffered) => {
                buffered.questions.extend(message.questions.clone());
                buffered.truncated = message.truncated;
                buffered
            }
            None => message,
        }
    };
    if merged.truncated {
        state
            .pending_truncated
            .lock()
            .expect("pending lock")
            .insert(from, merged);
        let state = Arc::clone(state);
        let socket = Arc::clone(socket);
        tokio::spawn(async move {
            state.clock.sleep(TRUNCATED_QUERY_WINDOW).await;
            let expired = state
                .pending_truncated
                .lock()
                .expect("pending lock")
                .remove(&from);
            if let Some(mut query) = expired {
                query.truncated = false;
                process_query(&state, &socket, from, query).await;
            }
        });
        return;
    }

    process_query(state, socket, from, merged).await;
}

async fn process_query(
    state: &Arc<ServerState>,
    socket: &Arc<UdpSocket>,
    from: SocketAddr,
    query: DnsMessage,
) {
    let legacy_unicast = from.port() != MDNS_PORT;
    let outcome = state
        .responder
        .lock()
        .expect("responder lock")
        .respond(&query, state.clock.now());
    let Some((mut reply, route)) = outcome else {
        return;
    };

    let destination = if legacy_unicast || route == ResponseRoute::Unicast {
        reply.id = query.id;
        from
    } else {
        multicast_destination(socket)
    };
    if let Err(err) = socket.send_to(&reply.encode(), destination).await {
        debug!(error = %err, %destination, "mdns reply send failed");
    }
}

fn multicast_destination(socket: &UdpSocket) -> SocketAddr {
    match socket.local_addr() {
        Ok(addr) if addr.is_ipv4() => SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT),
        _ => SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT),
    }
}

fn spawn_announce_loop(
    state: Arc<ServerState>,
    socket_v6: Arc<UdpSocket>,
    socket_v4: Option<Arc<UdpSocket>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = state.schedule.lock().expect("schedule lock").next_delay();
            tokio::select! {
                _ = state.clock.sleep(delay) => {}
                _ = state.announce.notified() => {}
            }
            let announcement = state
                .responder
                .lock()
                .expect("responder lock")
                .announcement(state.clock.now());
            let Some(announcement) = announcement else {
                continue;
            };
            let bytes = announcement.encode();
            let v6_dest = SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT);
            if let Err(err) = socket_v6.send_to(&bytes, v6_dest).await {
                trace!(error = %err, "ipv6 announcement failed");
            }
            if let Some(socket_v4) = &socket_v4 {
                let v4_dest = SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT);
                if let Err(err) = socket_v4.send_to(&bytes, v4_dest).await {
                    trace!(error = %err, "ipv4 announcement failed");
                }
            }
        }
    })
}

fn bind_multicast_v6(port: u16, join: bool) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV6,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(matter_core::MatterError::from)?;
    socket
        .set_reuse_address(true)
        .map_err(matter_core::MatterError::from)?;
    socket
        .set_only_v6(true)
        .map_err(matter_core::MatterError::from)?;
    socket
        .set_nonblocking(true)
        .map_err(matter_core::MatterError::from)?;
    let bind: SocketAddr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    socket.bind(&bind.into()).map_err(matter_core::MatterError::from)?;
    if join {
        socket
            .join_multicast_v6(&MDNS_GROUP_V6, 0)
            .map_err(matter_core::MatterError::from)?;
    }
    Ok(UdpSocket::from_std(socket.into()).map_err(matter_core::MatterError::from)?)
}

fn bind_multicast_v4(port: u16, join: bool) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(matter_core::MatterError::from)?;
    socket
        .set_reuse_address(true)
        .map_err(matter_core::MatterError::from)?;
    socket
        .set_nonblocking(true)
        .map_err(matter_core::MatterError::from)?;
    let bind: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind.into()).map_err(matter_core::MatterError::from)?;
    if join {
        socket
            .join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)
            .map_err(matter_core::MatterError::from)?;
    }
    Ok(UdpSocket::from_std(socket.into()).map_err(matter_core::MatterError::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::{OperationalAdvertisement, SessionIntervals};
    use crate::wire::{Question, rtype};
    use matter_core::clock::SystemClock;
    use matter_core::types::NodeId;

    async fn test_server() -> Arc<MdnsServer> {
        let config = MdnsServerConfig {
            hostname: "unit.local".into(),
            addresses: vec!["127.0.0.1".parse().expect("addr")],
            enable_ipv4: false,
            port: 0,
        };
        let server = MdnsServer::bind(config, Arc::new(SystemClock))
            .await
            .expect("bind server");
        server.advertise(
            OperationalAdvertisement {
                compressed_fabric_id: 0x1111222233334444,
                node_id: NodeId(5),
                intervals: SessionIntervals::default(),
                port: 5540,
            }
            .into_service(),
        );
        server
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn legacy_unicast_query_gets_direct_reply() {
        let server = test_server().await;
        let server_addr = {
            let addr = server.local_addr().expect("local addr");
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        };

        let client = UdpSocket::bind("[::1]:0").await.expect("bind client");
        let query = DnsMessage::query(vec![Question {
            name: Name::parse(crate::advert::OPERATIONAL_SERVICE),
            qtype: rtype::PTR,
            unicast_response: false,
        }]);
        client
            .send_to(&query.encode(), server_addr)
            .await
            .expect("send query");

        let mut buf = vec![0u8; 9000];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("reply within timeout")
            .expect("recv");
        let reply = DnsMessage::decode(&buf[..len]).expect("decode reply");
        assert!(reply.is_response);
        assert_eq!(reply.answers.len(), 1);
        let instance = reply.answers[0].name.to_string();
        assert!(instance.starts_with("_matter._tcp.local"));
    }
}
