#![doc = r#"
# matter-interaction

## 模块使命（Why）
- **数据模型的线缆门面**：读/订阅/调用/写四类交互全部收敛到本 crate 的
  服务端引擎，按 schema 做准入、按事务做提交、按载荷预算分块上报；
- **订阅的两端**：服务端生命周期（节流、保活、配额）与客户端持续订阅
  （断线重建）都在这里，复用同一套报告编解码。

## 分层（What）
- [`messages`]：IM 消息面与 TLV 编解码；
- [`paths`]：wildcard 展开与逐路径准入；
- [`engine`]：服务端五操作引擎（含计时窗口与交互生命周期通知）；
- [`subscriptions`] / [`sustained`]：订阅的服务端与客户端；
- [`client`]：controller 侧操作驱动；
- [`atomic`]：多属性原子写协调器。
"#]

pub mod atomic;
pub mod client;
pub mod engine;
pub mod messages;
pub mod paths;
pub mod subscriptions;
pub mod sustained;

pub use atomic::{AtomicCoordinator, AtomicRequestType, install_atomic_request};
pub use client::{ClientSubscription, InteractionClient};
pub use engine::{InteractionConfig, InteractionEngine};
pub use messages::{
    AttributeData, AttributePath, AttributeReport, AttributeStatus, CommandData, CommandPath,
    DataVersionFilter, EventPath, EventReport, InvokeRequest, InvokeResponse, InvokeResponseItem,
    ReadRequest, ReportData, StatusResponse, SubscribeRequest, SubscribeResponse, TimedRequest,
    WriteRequest, WriteResponse, opcode,
};
pub use subscriptions::{ServerSubscription, SubscriptionEngine, SubscriptionLimits};
pub use sustained::{Reestablisher, ReportSink, SustainedSubscription};
