#![doc = r#"
# matter-node

## 模块使命（Why）
- **把层叠成设备**：下层 crate 各管一段（传输、会话、数据模型、交互、
  BDX），本 crate 把它们组合成两种可运行角色——可配网的服务端节点与
  执行配网/运营控制的 controller；
- **配网即事务**：设备侧以 failsafe 日志保证半途而废的配网完整回滚，
  controller 侧把阶段序列编排成一次可重试的驱动。

## 分层（What）
- [`fabric`]：管理域凭据表与级联清除；
- [`failsafe`]：武装计时器、回滚日志与代数化到期；
- [`node`]：服务端组合根（端点树、命令面、广告生命周期）；
- [`controller`]：commissioner 驱动、peer 注册表与 CASE 重连；
- [`discovery`]：MDNS/BLE 聚合发现与候选排序；
- [`stream`]：进程内变更广播与合并差量流。

## 可观测性（How）
全链路 `tracing`；进程入口以 [`init_logging`] 按 `MATTER_LOG_LEVEL` /
`MATTER_LOG_FORMAT` 初始化订阅器。
"#]

pub mod controller;
pub mod discovery;
pub mod fabric;
pub mod failsafe;
pub mod node;
pub mod stream;

pub use controller::{
    CommissionOptions, Controller, ControllerConfig, Peer, decode_invoke_error, single_invoke,
};
pub use discovery::{
    BleScanner, CommissionableCandidate, ControllerDiscovery, DiscoveryIdentifier,
};
pub use fabric::{Fabric, FabricManager};
pub use failsafe::{Failsafe, JournalEntry};
pub use node::{NodeConfig, ServerNode, on_off_light_endpoint};
pub use stream::{
    Change, ChangeNotificationService, StateStream, StateStreamOptions,
};

use matter_core::config::CoreVars;

/// 按环境变量初始化 `tracing` 订阅器；重复调用为空操作。
pub fn init_logging(vars: &CoreVars) {
    let filter = tracing_subscriber::EnvFilter::try_new(vars.log_level().unwrap_or("info"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if vars.log_format() == Some("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        // 已有全局订阅器（测试里常见），保持现状。
    }
}
