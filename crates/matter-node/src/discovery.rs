//! Commissioner 侧发现：按标识过滤的候选设备枚举。
//!
//! # 候选排序（What）
//! UDP 候选排在 BLE 之前；IP 候选内部 IPv6 先于 IPv4。PASE 按此顺序
//! 逐个尝试，直到成功或候选耗尽。

use matter_core::clock::Clock;
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{NodeId, ProductId, VendorId};
use matter_mdns::advert::{COMMISSIONABLE_SERVICE, OPERATIONAL_SERVICE};
use matter_mdns::scanner::{DiscoveredService, MdnsScanner};
use matter_mdns::wire::Name;
use matter_transport::PeerAddress;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 发现阶段使用的设备标识。
#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryIdentifier {
    /// 12 位长判别码（二维码路径）。
    LongDiscriminator(u16),
    /// 4 位短判别码（手动配对码路径）。
    ShortDiscriminator(u8),
    /// 厂商/产品过滤。
    VendorProduct(VendorId, ProductId),
    /// MDNS 实例名（预发现设备）。
    InstanceId(String),
    /// 不过滤。
    Any,
}

impl DiscoveryIdentifier {
    fn matches(&self, service: &DiscoveredService) -> bool {
        match self {
            DiscoveryIdentifier::LongDiscriminator(wanted) => {
                service.discriminator() == Some(*wanted)
            }
            DiscoveryIdentifier::ShortDiscriminator(wanted) => service
                .discriminator()
                .map(|long| (long >> 8) as u8 == *wanted)
                .unwrap_or(false),
            DiscoveryIdentifier::VendorProduct(vendor, product) => {
                service.vendor_product() == Some((vendor.raw(), product.raw()))
            }
            DiscoveryIdentifier::InstanceId(instance) => {
                service.instance.eq_ignore_ascii_case(instance)
            }
            DiscoveryIdentifier::Any => true,
        }
    }
}

/// 一个可配网候选。
#[derive(Clone, Debug)]
pub struct CommissionableCandidate {
    pub instance: String,
    pub discriminator: Option<u16>,
    pub vendor_product: Option<(u16, u16)>,
    /// 已按 UDP 优先、IPv6 先于 IPv4 排序。
    pub addresses: Vec<PeerAddress>,
}

/// BLE 扫描器挂载点（驱动胶水在环境中注册实现）。
pub trait BleScanner: Send + Sync {
    fn scan(&self, identifier: &DiscoveryIdentifier, timeout: Duration) -> Vec<CommissionableCandidate>;
}

/// Controller 的发现聚合器。
pub struct ControllerDiscovery {
    clock: Arc<dyn Clock>,
    scanner: MdnsScanner,
    ble: Option<Arc<dyn BleScanner>>,
}

impl ControllerDiscovery {
    pub fn new(clock: Arc<dyn Clock>, scanner: MdnsScanner, ble: Option<Arc<dyn BleScanner>>) -> Self {
        Self {
            clock,
            scanner,
            ble,
        }
    }

    /// 扫描可配网设备；超时且无候选时返回 `discovery.timeout`。
    pub async fn discover_commissionable(
        &self,
        identifier: &DiscoveryIdentifier,
        timeout: Duration,
    ) -> Result<Vec<CommissionableCandidate>> {
        let start = self.clock.now();
        let wanted = identifier.clone();
        let found = self
            .scanner
            .browse(
                &Name::parse(COMMISSIONABLE_SERVICE),
                timeout,
                move |services| services.iter().any(|service| wanted.matches(service)),
            )
            .await?;

        let mut candidates: Vec<CommissionableCandidate> = found
            .iter()
            .filter(|service| identifier.matches(service))
            .map(|service| CommissionableCandidate {
                instance: service.instance.clone(),
                discriminator: service.discriminator(),
                vendor_product: service.vendor_product(),
                addresses: service
                    .socket_addrs()
                    .into_iter()
                    .map(PeerAddress::Udp)
                    .collect(),
            })
            .collect();

        if let Some(ble) = &self.ble {
            let elapsed = self.clock.now().duration_since(start);
            let remaining = timeout.saturating_sub(elapsed);
            // UDP 候选在前，BLE 候选殿后。
            candidates.extend(ble.scan(identifier, remaining));
        }

        if candidates.is_empty() {
            debug!(?identifier, "discovery window elapsed without a match");
            return Err(MatterError::io(
                codes::DISCOVERY_TIMEOUT,
                format!("no commissionable device matched {identifier:?} within {timeout:?}"),
            ));
        }
        Ok(candidates)
    }

    /// 解析一个已配网节点的运营地址。
    pub async fn discover_operational(
        &self,
        compressed_fabric_id: u64,
        node_id: NodeId,
        timeout: Duration,
    ) -> Result<Vec<PeerAddress>> {
        let wanted = format!("{compressed_fabric_id:016X}-{:016X}", node_id.raw());
        let target = wanted.clone();
        let found = self
            .scanner
            .browse(&Name::parse(OPERATIONAL_SERVICE), timeout, move |services| {
                services
                    .iter()
                    .any(|service| service.instance.eq_ignore_ascii_case(&target))
            })
            .await?;

        let addresses: Vec<PeerAddress> = found
            .iter()
            .filter(|service| service.instance.eq_ignore_ascii_case(&wanted))
            .flat_map(|service| service.socket_addrs())
            .map(PeerAddress::Udp)
            .collect();
        if addresses.is_empty() {
            return Err(MatterError::io(
                codes::DISCOVERY_TIMEOUT,
                format!("operational node {node_id} not resolved within {timeout:?}"),
            ));
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(instance: &str, discriminator: u16) -> DiscoveredService {
        let mut service = DiscoveredService {
            instance: instance.to_owned(),
            ..DiscoveredService::default()
        };
        service.txt.insert("D".into(), discriminator.to_string());
        service.txt.insert("VP".into(), "65521+32768".into());
        service
    }

    #[test]
    fn identifier_matching_rules() {
        let sample = service("A1B2", 3840);
        assert!(DiscoveryIdentifier::LongDiscriminator(3840).matches(&sample));
        assert!(!DiscoveryIdentifier::LongDiscriminator(3841).matches(&sample));
        assert!(DiscoveryIdentifier::ShortDiscriminator(15).matches(&sample));
        assert!(
            DiscoveryIdentifier::VendorProduct(VendorId(0xfff1), ProductId(0x8000))
                .matches(&sample)
        );
        assert!(DiscoveryIdentifier::InstanceId("a1b2".into()).matches(&sample));
        assert!(DiscoveryIdentifier::Any.matches(&sample));
    }
}
