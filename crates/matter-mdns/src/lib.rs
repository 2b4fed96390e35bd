#![doc = r#"
# matter-mdns

## 模块使命（Why）
- **被发现与去发现**：Matter 设备靠 DNS-SD 宣告自己（可配网期的
  `_matterc._udp`、入网后的 `_matter._tcp`），commissioner 靠同一套
  协议按判别码/厂商号扫描候选设备；本 crate 同时承担服务端与扫描端。
- **守规矩的组播公民**：mDNS 在共享链路上运行，重复抑制、单播应答
  约束与通告节奏直接决定网络噪声水平，策略全部集中在
  [`responder`] 中以便单测验证。

## 核心契约（What）
- [`wire`]：DNS 报文编解码（编码不压缩、解码支持压缩指针）；
- [`advert`]：两种服务形态的记录物化（TXT 键逐字对齐规范）；
- [`server`]：组播套接字、TC 查询缓冲、通告循环；
- [`scanner`]：带指数退避的浏览循环与结果聚合。

## 风险提示（Trade-offs）
- 服务端按地址族各持一个套接字，未做按物理接口的多实例管理；需要
  按接口隔离时由部署方以 `MATTER_MDNS_NETWORK_INTERFACE` 约束宿主
  路由。
"#]

pub mod advert;
pub mod responder;
pub mod scanner;
pub mod server;
pub mod wire;

pub use advert::{
    CommissionableAdvertisement, CommissioningMode, OperationalAdvertisement,
    ServiceAdvertisement, SessionIntervals,
};
pub use scanner::{DiscoveredService, MdnsScanner};
pub use server::{MdnsServer, MdnsServerConfig};
