#![doc = r#"
# matter-datamodel

## 模块使命（Why）
- **受监督的状态容器**：交互模型面对的不是裸内存，而是 schema 驱动、
  带校验、带访问控制、带事务语义的数据模型；本 crate 是这层监督的
  全部实现；
- **端点即组合根**：endpoint 持有 behavior，behavior 持有 datasource
  与事件面，所有权单向向下，diagnostics 需要的反向引用一律弱引用。

## 分层（What）
- [`schema`]：静态元数据模型（conformance / quality / access / 约束）；
- [`supervisor`]：装载期编译——默认值、已知默认缓存、校验与规范化；
- [`transaction`]：暂存式写事务，提交时版本恰好 +1；
- [`behavior`] / [`endpoint`]：运行时组合与激活次序；
- [`events`]：按优先级分环的节点事件存储；
- [`clusters`]：协议核心内置的标准集群定义子集。
"#]

pub mod behavior;
pub mod clusters;
pub mod endpoint;
pub mod events;
pub mod schema;
pub mod supervisor;
pub mod transaction;

pub use behavior::{
    BackingState, Behavior, BehaviorEvents, CommandContext, CommandHandler, CommandOutcome,
    InteractionEvent, Observable,
};
pub use endpoint::{DeviceType, Endpoint};
pub use events::{EventLog, EventRecord};
pub use schema::{
    AttributeAccess, AttributeSchema, ClusterSchema, CommandSchema, Conformance, Constraint,
    EventSchema, Privilege, Quality, ValueKind,
};
pub use supervisor::{AccessSubject, ClusterPlan, CompiledAttribute};
pub use transaction::{ChangeNotice, Datasource, Transaction};
