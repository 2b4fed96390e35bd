//! # types 模块说明
//!
//! ## 角色定位（Why）
//! - 收拢协议栈全域使用的标识符 newtype，阻断 `u16`/`u32`/`u64` 裸值在
//!   层间随意互换造成的错配（例如把 cluster id 当成 attribute id 使用）；
//! - Display 实现统一按 Matter 惯例输出十六进制，日志可直接对照抓包。
//!
//! ## 设计要求（What）
//! - newtype 一律 `Copy + Ord + Hash`，可作为各类索引键；
//! - 不在此定义任何行为逻辑，保持纯数据层。

use core::fmt;

macro_rules! wire_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $fmt:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub $inner);

        impl $name {
            /// 读取底层原始值。
            pub const fn raw(&self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, $fmt, self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(raw: $inner) -> Self {
                Self(raw)
            }
        }
    };
}

wire_id!(
    /// 64 位节点标识，在 fabric 内唯一。
    NodeId, u64, "node:0x{:016x}"
);
wire_id!(
    /// 64 位 fabric 标识，与根公钥组合构成管理域身份。
    FabricId, u64, "fabric:0x{:016x}"
);
wire_id!(
    /// 本地 fabric 槽位索引；0 保留表示“无 fabric”。
    FabricIndex, u8, "fabric-index:{}"
);
wire_id!(
    /// 厂商标识。
    VendorId, u16, "vendor:0x{:04x}"
);
wire_id!(
    /// 产品标识。
    ProductId, u16, "product:0x{:04x}"
);
wire_id!(
    /// 端点编号；0 为根端点。
    EndpointNumber, u16, "endpoint:{}"
);
wire_id!(
    /// 集群标识。
    ClusterId, u32, "cluster:0x{:04x}"
);
wire_id!(
    /// 属性标识。
    AttributeId, u32, "attribute:0x{:04x}"
);
wire_id!(
    /// 命令标识。
    CommandId, u32, "command:0x{:02x}"
);
wire_id!(
    /// 事件标识。
    EventId, u32, "event:0x{:02x}"
);
wire_id!(
    /// 单调递增的事件序号。
    EventNumber, u64, "event-number:{}"
);
wire_id!(
    /// 设备类型标识。
    DeviceTypeId, u32, "device-type:0x{:04x}"
);
wire_id!(
    /// 会话表中的本地/对端会话编号。
    SessionId, u16, "session:{}"
);
wire_id!(
    /// 会话内交换编号。
    ExchangeId, u16, "exchange:{}"
);

/// 每集群 32 位数据版本，任何属性变更提交时加一。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DataVersion(pub u32);

impl DataVersion {
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// 返回递增后的下一版本（回绕语义遵循 u32 溢出）。
    pub const fn next(&self) -> DataVersion {
        DataVersion(self.0.wrapping_add(1))
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Matter 帧携带的协议编号。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    /// 安全通道协议（MRP、PASE、CASE、状态报告）。
    pub const SECURE_CHANNEL: ProtocolId = ProtocolId(0x0000);
    /// 交互模型协议（读/订阅/调用/写/报告）。
    pub const INTERACTION_MODEL: ProtocolId = ProtocolId(0x0001);
    /// 批量数据交换协议。
    pub const BDX: ProtocolId = ProtocolId(0x0003);

    pub const fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolId::SECURE_CHANNEL => write!(f, "protocol:secure-channel"),
            ProtocolId::INTERACTION_MODEL => write!(f, "protocol:interaction-model"),
            ProtocolId::BDX => write!(f, "protocol:bdx"),
            ProtocolId(other) => write!(f, "protocol:0x{other:04x}"),
        }
    }
}

/// 事件优先级，对应事件环的三条持久化队列。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventPriority {
    Debug,
    Info,
    Critical,
}

impl EventPriority {
    /// 持久化上下文使用的稳定名称。
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Debug => "debug",
            EventPriority::Info => "info",
            EventPriority::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_matter_hex_convention() {
        assert_eq!(NodeId(0xdead).to_string(), "node:0x000000000000dead");
        assert_eq!(ClusterId(0x0006).to_string(), "cluster:0x0006");
        assert_eq!(ProtocolId::BDX.to_string(), "protocol:bdx");
    }

    #[test]
    fn data_version_increments_with_wraparound() {
        assert_eq!(DataVersion(1).next(), DataVersion(2));
        assert_eq!(DataVersion(u32::MAX).next(), DataVersion(0));
    }
}
