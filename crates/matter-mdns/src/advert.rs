//! 广告载荷构建：可配网与运营两种 DNS-SD 服务形态。
//!
//! # 契约说明（What）
//! - 可配网服务 `_matterc._udp.local`：实例名为 16 位十六进制随机串，
//!   TXT 携带 `D/VP/CM/DT/DN/SII/SAI/SAT/T/ICD/PH/PI`；另发布
//!   `_L<长判别码>`、`_S<短判别码>`、`_CM` 子类型指针供过滤查询；
//! - 运营服务 `_matter._tcp.local`：实例名
//!   `<压缩FabricId>-<NodeId>`（各 16 位大写十六进制），TXT 携带会话
//!   间隔键；另发布 `_I<压缩FabricId>` 子类型。

use crate::wire::{Name, Record, RecordData};
use matter_core::types::{DeviceTypeId, NodeId, ProductId, VendorId};
use std::net::IpAddr;
use std::time::Duration;

/// 可配网服务类型。
pub const COMMISSIONABLE_SERVICE: &str = "_matterc._udp.local";
/// 运营服务类型。
pub const OPERATIONAL_SERVICE: &str = "_matter._tcp.local";
/// Matter 默认 UDP 端口。
pub const DEFAULT_PORT: u16 = 5540;

/// 对外广告的会话参数（TXT `SII`/`SAI`/`SAT`）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionIntervals {
    pub idle: Duration,
    pub active: Duration,
    pub active_threshold: Duration,
}

impl Default for SessionIntervals {
    fn default() -> Self {
        Self {
            idle: Duration::from_millis(500),
            active: Duration::from_millis(300),
            active_threshold: Duration::from_millis(4000),
        }
    }
}

/// 配网窗口的开放状态（TXT `CM`）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommissioningMode {
    /// 窗口关闭。
    Closed,
    /// 基础配网窗口开放。
    Basic,
    /// 增强配网窗口开放（动态 passcode）。
    Enhanced,
}

impl CommissioningMode {
    fn txt_value(&self) -> &'static str {
        match self {
            CommissioningMode::Closed => "0",
            CommissioningMode::Basic => "1",
            CommissioningMode::Enhanced => "2",
        }
    }
}

/// 可配网广告的内容描述。
#[derive(Clone, Debug)]
pub struct CommissionableAdvertisement {
    /// 16 位十六进制实例名（通常为随机 8 字节）。
    pub instance_id: String,
    /// 12 位长判别码。
    pub discriminator: u16,
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub mode: CommissioningMode,
    pub device_type: DeviceTypeId,
    pub device_name: Option<String>,
    pub intervals: SessionIntervals,
    /// 配对提示位图（TXT `PH`）。
    pub pairing_hint: u32,
    /// 配对说明文本（TXT `PI`）。
    pub pairing_instructions: Option<String>,
    /// 低功耗设备标志（TXT `ICD`）。
    pub idle_capable: bool,
    pub port: u16,
}

impl CommissionableAdvertisement {
    /// 转为通用服务广告。
    pub fn into_service(self) -> ServiceAdvertisement {
        let service = Name::parse(COMMISSIONABLE_SERVICE);
        let instance = Name::parse(&format!("{}.{COMMISSIONABLE_SERVICE}", self.instance_id));
        let short = self.discriminator >> 8;

        let mut subtypes = vec![
            Name::parse(&format!("_l{}._sub.{COMMISSIONABLE_SERVICE}", self.discriminator)),
            Name::parse(&format!("_s{short}._sub.{COMMISSIONABLE_SERVICE}")),
        ];
        if !matches!(self.mode, CommissioningMode::Closed) {
            subtypes.push(Name::parse(&format!("_cm._sub.{COMMISSIONABLE_SERVICE}")));
        }

        let mut txt = vec![
            format!("D={}", self.discriminator),
            format!("VP={}+{}", self.vendor_id.raw(), self.product_id.raw()),
            format!("CM={}", self.mode.txt_value()),
            format!("DT={}", self.device_type.raw()),
        ];
        if let Some(name) = &self.device_name {
            txt.push(format!("DN={name}"));
        }
        txt.extend(interval_txt(&self.intervals));
        txt.push("T=0".to_owned());
        if self.idle_capable {
            txt.push("ICD=1".to_owned());
        }
        txt.push(format!("PH={}", self.pairing_hint));
        if let Some(instructions) = &self.pairing_instructions {
            txt.push(format!("PI={instructions}"));
        }

        ServiceAdvertisement {
            service,
            instance,
            subtypes,
            port: self.port,
            txt,
        }
    }
}

/// 运营广告的内容描述。
#[derive(Clone, Debug)]
pub struct OperationalAdvertisement {
    /// 压缩 fabric 标识（根公钥与 fabric id 派生的 64 位）。
    pub compressed_fabric_id: u64,
    pub node_id: NodeId,
    pub intervals: SessionIntervals,
    pub port: u16,
}

impl OperationalAdvertisement {
    pub fn instance_id(&self) -> String {
        format!(
            "{:016X}-{:016X}",
            self.compressed_fabric_id,
            self.node_id.raw()
        )
    }

    pub fn into_service(self) -> ServiceAdvertisement {
        let service = Name::parse(OPERATIONAL_SERVICE);
        let instance = Name::parse(&format!("{}.{OPERATIONAL_SERVICE}", self.instance_id()));
        let subtypes = vec![Name::parse(&format!(
            "_i{:016x}._sub.{OPERATIONAL_SERVICE}",
            self.compressed_fabric_id
        ))];
        let mut txt = interval_txt(&self.intervals);
        txt.push("T=0".to_owned());

        ServiceAdvertisement {
            service,
            instance,
            subtypes,
            port: self.port,
            txt,
        }
    }
}

fn interval_txt(intervals: &SessionIntervals) -> Vec<String> {
    vec![
        format!("SII={}", intervals.idle.as_millis()),
        format!("SAI={}", intervals.active.as_millis()),
        format!("SAT={}", intervals.active_threshold.as_millis()),
    ]
}

/// 归一化后的服务广告：记录生成的输入。
#[derive(Clone, Debug)]
pub struct ServiceAdvertisement {
    pub service: Name,
    pub instance: Name,
    pub subtypes: Vec<Name>,
    pub port: u16,
    pub txt: Vec<String>,
}

impl ServiceAdvertisement {
    /// 针对一个接口（主机名 + 地址集合）物化全部记录。
    pub fn records(&self, hostname: &Name, addresses: &[IpAddr]) -> Vec<Record> {
        let mut records = vec![Record {
            name: self.service.clone(),
            ttl: 4500,
            cache_flush: false,
            data: RecordData::Ptr(self.instance.clone()),
        }];
        for subtype in &self.subtypes {
            records.push(Record {
                name: subtype.clone(),
                ttl: 4500,
                cache_flush: false,
                data: RecordData::Ptr(self.instance.clone()),
            });
        }
        records.push(Record {
            name: self.instance.clone(),
            ttl: 120,
            cache_flush: true,
            data: RecordData::Srv {
                priority: 0,
                weight: 0,
                port: self.port,
                target: hostname.clone(),
            },
        });
        records.push(Record {
            name: self.instance.clone(),
            ttl: 4500,
            cache_flush: true,
            data: RecordData::Txt(self.txt.clone()),
        });
        for address in addresses {
            records.push(Record {
                name: hostname.clone(),
                ttl: 120,
                cache_flush: true,
                data: match address {
                    IpAddr::V4(v4) => RecordData::A(*v4),
                    IpAddr::V6(v6) => RecordData::Aaaa(*v6),
                },
            });
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commissionable() -> ServiceAdvertisement {
        CommissionableAdvertisement {
            instance_id: "A1B2C3D4E5F60708".into(),
            discriminator: 3840,
            vendor_id: VendorId(0xfff1),
            product_id: ProductId(0x8000),
            mode: CommissioningMode::Basic,
            device_type: DeviceTypeId(0x0100),
            device_name: Some("Light".into()),
            intervals: SessionIntervals::default(),
            pairing_hint: 33,
            pairing_instructions: None,
            idle_capable: false,
            port: DEFAULT_PORT,
        }
        .into_service()
    }

    #[test]
    fn commissionable_txt_keys() {
        let advert = commissionable();
        assert!(advert.txt.contains(&"D=3840".to_owned()));
        assert!(advert.txt.contains(&"VP=65521+32768".to_owned()));
        assert!(advert.txt.contains(&"CM=1".to_owned()));
        assert!(advert.txt.contains(&"SII=500".to_owned()));
        assert!(advert.txt.contains(&"SAI=300".to_owned()));
        assert!(advert.txt.contains(&"SAT=4000".to_owned()));
        assert!(advert.txt.contains(&"PH=33".to_owned()));
    }

    #[test]
    fn commissionable_subtypes_cover_both_discriminators() {
        let advert = commissionable();
        let rendered: Vec<String> = advert.subtypes.iter().map(|n| n.to_string()).collect();
        assert!(rendered.contains(&"_l3840._sub._matterc._udp.local.".to_owned()));
        assert!(rendered.contains(&"_s15._sub._matterc._udp.local.".to_owned()));
        assert!(rendered.contains(&"_cm._sub._matterc._udp.local.".to_owned()));
    }

    #[test]
    fn operational_instance_name_format() {
        let advert = OperationalAdvertisement {
            compressed_fabric_id: 0x1122334455667788,
            node_id: NodeId(0x0000000000000009),
            intervals: SessionIntervals::default(),
            port: DEFAULT_PORT,
        };
        assert_eq!(advert.instance_id(), "1122334455667788-0000000000000009");
    }

    #[test]
    fn records_materialize_per_interface() {
        let advert = commissionable();
        let host = Name::parse("device.local");
        let records = advert.records(&host, &["fe80::1".parse().expect("addr")]);
        // PTR(service) + 3 子类型 PTR + SRV + TXT + AAAA。
        assert_eq!(records.len(), 7);
        assert!(records.iter().any(|r| matches!(r.data, RecordData::Srv { port: 5540, .. })));
    }
}
