#![doc = r#"
# matter-core

## 模块使命（Why）
- **统一地基**：为 Matter 协议栈的上层 crate（传输、会话、数据模型、交互
  引擎、节点运行时）提供共享的环境注册表、错误域、标识符与基础服务契约，
  保证各层只通过这些契约耦合。
- **可替换的平台边界**：加密、时钟、存储是设备平台差异最大的三块，全部
  以服务形式注册进 [`Environment`](environment::Environment)；认证平台的
  后端可在不改动协议逻辑的情况下替换仓库自带的软件实现。
- **可复现的时间语义**：重传退避、订阅节流、failsafe 到期等定时行为统一
  依赖注入的 [`Clock`](clock::Clock)，测试用虚拟时钟推进，CI 结果确定。

## 核心契约（What）
- [`error`]：稳定错误码 + 处理策略分类的统一错误域；
- [`status`]：错误域到 Matter 线缆状态码的唯一翻译点；
- [`types`]：全域标识符 newtype；
- [`environment`]：命名环境树、类型键服务槽位、引用计数共享视图；
- [`clock`] / [`crypto`] / [`storage`]：三大平台服务契约与默认实现；
- [`config`]：`MATTER_*` 环境变量覆盖快照。

## 实现策略（How）
- 服务注册表以 `TypeId` 为键、`Arc` 共享实例；工厂构造期间释放槽位锁，
  允许工厂递归获取依赖；
- 错误采用两层结构：各 crate 内部 `thiserror` 枚举承载细粒度上下文，在
  边界统一折叠为 [`MatterError`](error::MatterError)。
"#]

pub mod clock;
pub mod config;
pub mod crypto;
pub mod environment;
pub mod error;
pub mod status;
pub mod storage;
pub mod types;

pub use error::{MatterError, Result};

/// 常用类型的一站式导入。
pub mod prelude {
    pub use crate::clock::{Clock, ClockService, MockClock, SystemClock};
    pub use crate::config::CoreVars;
    pub use crate::crypto::{CryptoProvider, CryptoService, OperationalKeypair, SoftwareCrypto};
    pub use crate::environment::{
        Environment, EnvironmentService, ServiceConsumer, ServiceEvent, SharedServices,
    };
    pub use crate::error::{ErrorCategory, MatterError, Result, codes};
    pub use crate::status::{SecureChannelStatus, Status};
    pub use crate::storage::{MemoryStorage, StorageContext, StorageManager, StorageService};
    pub use crate::types::*;
}
