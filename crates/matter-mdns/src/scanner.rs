//! Commissioner 侧扫描器：浏览服务类型并聚合发现结果。

use crate::server::{MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};
use crate::wire::{DnsMessage, Name, Question, Record, RecordData, rtype};
use matter_core::clock::Clock;
use matter_core::error::Result;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

/// 一次发现结果：实例与其解析出的可达信息。
#[derive(Clone, Debug, Default)]
pub struct DiscoveredService {
    pub instance: String,
    pub hostname: Option<Name>,
    pub port: Option<u16>,
    pub txt: HashMap<String, String>,
    pub addresses: Vec<IpAddr>,
}

impl DiscoveredService {
    /// TXT 中的长判别码（`D` 键）。
    pub fn discriminator(&self) -> Option<u16> {
        self.txt.get("D").and_then(|raw| raw.parse().ok())
    }

    /// TXT 中的 vendor/product（`VP` 键，`<vid>+<pid>`）。
    pub fn vendor_product(&self) -> Option<(u16, u16)> {
        let raw = self.txt.get("VP")?;
        let (vendor, product) = raw.split_once('+')?;
        Some((vendor.parse().ok()?, product.parse().ok()?))
    }

    /// 可直接拨号的套接字地址，按 IPv6 优先排序。
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        let port = self.port.unwrap_or(5540);
        let mut addrs: Vec<SocketAddr> = self
            .addresses
            .iter()
            .map(|addr| SocketAddr::new(*addr, port))
            .collect();
        addrs.sort_by_key(|addr| match addr {
            SocketAddr::V6(_) => 0,
            SocketAddr::V4(_) => 1,
        });
        addrs
    }
}

/// MDNS 扫描器。
///
/// # 契约说明（What）
/// - `browse` 周期性重发 PTR 查询（指数退避），聚合应答直到谓词满足或
///   超时；超时并非错误，返回当时已聚合的结果；
/// - 查询目标默认为两个组播组，测试可用 [`MdnsScanner::with_targets`]
///   指向具体服务端地址（传统单播解析路径）。
pub struct MdnsScanner {
    socket: UdpSocket,
    clock: Arc<dyn Clock>,
    targets: Vec<SocketAddr>,
}

impl MdnsScanner {
    /// 绑定临时端口并指向标准组播组。
    pub async fn bind(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_targets(
            clock,
            vec![
                SocketAddr::new(IpAddr::V6(MDNS_GROUP_V6), MDNS_PORT),
                SocketAddr::new(IpAddr::V4(MDNS_GROUP_V4), MDNS_PORT),
            ],
        )
        .await
    }

    /// 指定查询目标地址集合。
    pub async fn with_targets(clock: Arc<dyn Clock>, targets: Vec<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind("[::]:0")
            .await
            .map_err(matter_core::MatterError::from)?;
        Ok(Self {
            socket,
            clock,
            targets,
        })
    }

    /// 浏览一个服务类型。
    ///
    /// `stop` 谓词在每次聚合更新后评估，返回 `true` 时立即结束浏览。
    pub async fn browse(
        &self,
        service: &Name,
        timeout: Duration,
        mut stop: impl FnMut(&[DiscoveredService]) -> bool,
    ) -> Result<Vec<DiscoveredService>> {
        let deadline = self.clock.now() + timeout;
        let mut found: Vec<DiscoveredService> = Vec::new();
        let mut backoff = Duration::from_millis(500);
        let mut buf = vec![0u8; 9000];

        'rounds: loop {
            let query = DnsMessage::query(vec![Question {
                name: service.clone(),
                qtype: rtype::PTR,
                unicast_response: false,
            }]);
            let bytes = query.encode();
            for target in &self.targets {
                if let Err(err) = self.socket.send_to(&bytes, *target).await {
                    trace!(error = %err, %target, "mdns query send failed");
                }
            }

            let round_end = (self.clock.now() + backoff).min(deadline);
            loop {
                let remaining = round_end.saturating_duration_since(self.clock.now());
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    received = self.socket.recv_from(&mut buf) => {
                        let Ok((len, _)) = received else { break };
                        if let Ok(message) = DnsMessage::decode(&buf[..len]) {
                            merge_response(service, &message, &mut found);
                            if stop(&found) {
                                break 'rounds;
                            }
                        }
                    }
                    _ = self.clock.sleep(remaining) => break,
                }
            }

            if self.clock.now() >= deadline {
                break;
            }
            backoff = (backoff * 2).min(Duration::from_secs(16));
        }
        Ok(found)
    }
}

/// 把一帧应答并入聚合结果。
fn merge_response(service: &Name, message: &DnsMessage, found: &mut Vec<DiscoveredService>) {
    if !message.is_response {
        return;
    }
    let records: Vec<&Record> = message.answers.iter().chain(message.additionals.iter()).collect();

    for record in &records {
        let RecordData::Ptr(instance_name) = &record.data else {
            continue;
        };
        if !record.name.ends_with(service) {
            continue;
        }
        let instance_label = instance_name
            .labels()
            .first()
            .cloned()
            .unwrap_or_default();
        let index = match found.iter().position(|s| s.instance == instance_label) {
            Some(index) => index,
            None => {
                found.push(DiscoveredService {
                    instance: instance_label.clone(),
                    ..DiscoveredService::default()
                });
                found.len() - 1
            }
        };
        let entry = &mut found[index];

        for detail in &records {
            if detail.name == *instance_name {
                match &detail.data {
                    RecordData::Srv { port, target, .. } => {
                        entry.port = Some(*port);
                        entry.hostname = Some(target.clone());
                    }
                    RecordData::Txt(pairs) => {
                        for pair in pairs {
                            if let Some((key, value)) = pair.split_once('=') {
                                entry.txt.insert(key.to_uppercase(), value.to_owned());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        if let Some(hostname) = entry.hostname.clone() {
            for detail in &records {
                if detail.name == hostname {
                    let address = match &detail.data {
                        RecordData::A(v4) => Some(IpAddr::V4(*v4)),
                        RecordData::Aaaa(v6) => Some(IpAddr::V6(*v6)),
                        _ => None,
                    };
                    if let Some(address) = address {
                        if !entry.addresses.contains(&address) {
                            entry.addresses.push(address);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advert::{
        CommissionableAdvertisement, CommissioningMode, SessionIntervals,
    };
    use crate::server::{MdnsServer, MdnsServerConfig};
    use matter_core::clock::SystemClock;
    use matter_core::types::{DeviceTypeId, ProductId, VendorId};
    use std::net::Ipv6Addr;

    #[tokio::test(flavor = "multi_thread")]
    async fn browse_finds_commissionable_instance_by_discriminator() {
        let server = MdnsServer::bind(
            MdnsServerConfig {
                hostname: "scan-target.local".into(),
                addresses: vec!["::1".parse().expect("addr")],
                enable_ipv4: false,
                port: 0,
            },
            Arc::new(SystemClock),
        )
        .await
        .expect("bind server");
        server.advertise(
            CommissionableAdvertisement {
                instance_id: "00DEADBEEF00CAFE".into(),
                discriminator: 1234,
                vendor_id: VendorId(0xfff1),
                product_id: ProductId(0x8001),
                mode: CommissioningMode::Basic,
                device_type: DeviceTypeId(0x0100),
                device_name: None,
                intervals: SessionIntervals::default(),
                pairing_hint: 0,
                pairing_instructions: None,
                idle_capable: false,
                port: 5540,
            }
            .into_service(),
        );

        let server_port = server.local_addr().expect("addr").port();
        let scanner = MdnsScanner::with_targets(
            Arc::new(SystemClock),
            vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), server_port)],
        )
        .await
        .expect("bind scanner");

        let found = scanner
            .browse(
                &Name::parse(crate::advert::COMMISSIONABLE_SERVICE),
                Duration::from_secs(10),
                |found| found.iter().any(|s| s.discriminator() == Some(1234)),
            )
            .await
            .expect("browse");

        let device = found
            .iter()
            .find(|s| s.discriminator() == Some(1234))
            .expect("device discovered");
        assert_eq!(device.port, Some(5540));
        assert_eq!(device.vendor_product(), Some((0xfff1, 0x8001)));
        assert!(!device.socket_addrs().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn browse_times_out_empty_without_advertiser() {
        let scanner = MdnsScanner::with_targets(
            Arc::new(SystemClock),
            vec![SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 1)],
        )
        .await
        .expect("bind scanner");
        let found = scanner
            .browse(
                &Name::parse(crate::advert::COMMISSIONABLE_SERVICE),
                Duration::from_millis(600),
                |_| false,
            )
            .await
            .expect("browse");
        assert!(found.is_empty());
    }
}
