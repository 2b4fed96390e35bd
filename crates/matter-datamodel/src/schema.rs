//! 集群元数据模型：属性/命令/事件的 schema 描述。
//!
//! # 契约说明（What）
//! - 本模块只承载静态元数据（由规范生成库供给），不含运行时状态；
//! - conformance 可依赖 feature-map 位，编译期（plan 编译时）据当前
//!   feature 集合展开；
//! - quality 旗标与访问特权逐字对应规范定义。

use matter_codec_tlv::TlvValue;
use matter_core::types::{AttributeId, ClusterId, CommandId, EventId, EventPriority};

/// 元素的符合性要求。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Conformance {
    Mandatory,
    Optional,
    Disallowed,
    /// 依赖 feature-map 某一位：`when_set` 为真时该位置位才适用。
    Feature { bit: u8, when_set: bool },
}

impl Conformance {
    /// 在给定 feature-map 下是否适用。
    pub fn applies(&self, feature_map: u32) -> bool {
        match self {
            Conformance::Mandatory | Conformance::Optional => true,
            Conformance::Disallowed => false,
            Conformance::Feature { bit, when_set } => {
                (feature_map & (1 << bit) != 0) == *when_set
            }
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, Conformance::Mandatory)
    }
}

/// 质量旗标。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Quality {
    pub nullable: bool,
    pub fixed: bool,
    pub nonvolatile: bool,
    /// 中间变化被抑制，每订阅周期只上报一次。
    pub quieter: bool,
    /// 变化永不触发上报。
    pub changes_omitted: bool,
    /// 只能经原子写协议修改。
    pub atomic: bool,
    pub fabric_scoped: bool,
    /// 写入前必须有 TimedRequest。
    pub timed_write: bool,
}

impl Quality {
    pub const fn none() -> Self {
        Self {
            nullable: false,
            fixed: false,
            nonvolatile: false,
            quieter: false,
            changes_omitted: false,
            atomic: false,
            fabric_scoped: false,
            timed_write: false,
        }
    }
}

/// 访问特权级别，数值越大权限越高。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Privilege {
    View,
    Operate,
    Manage,
    Administer,
}

/// 属性的读/写特权；`write` 为 `None` 表示只读。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttributeAccess {
    pub read: Privilege,
    pub write: Option<Privilege>,
}

impl AttributeAccess {
    pub const RO_VIEW: AttributeAccess = AttributeAccess {
        read: Privilege::View,
        write: None,
    };
    pub const RW_OPERATE: AttributeAccess = AttributeAccess {
        read: Privilege::View,
        write: Some(Privilege::Operate),
    };
    pub const RW_MANAGE: AttributeAccess = AttributeAccess {
        read: Privilege::View,
        write: Some(Privilege::Manage),
    };
    pub const RW_ADMIN: AttributeAccess = AttributeAccess {
        read: Privilege::Administer,
        write: Some(Privilege::Administer),
    };
}

/// 属性的类型骨架；数值类型的界由位宽决定，附加约束另行收窄。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    Bool,
    Unsigned { bits: u8 },
    Signed { bits: u8 },
    Utf8 { max_len: u32 },
    Bytes { max_len: u32 },
    Structure,
    Array,
}

impl ValueKind {
    /// 无符号位宽的可表示最大值（同时充当 nullable 的 null 哨兵）。
    pub fn unsigned_max(bits: u8) -> u64 {
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    /// 有符号位宽的最小值（nullable 的 null 哨兵）。
    pub fn signed_min(bits: u8) -> i64 {
        if bits >= 64 {
            i64::MIN
        } else {
            -(1i64 << (bits - 1))
        }
    }

    pub fn signed_max(bits: u8) -> i64 {
        if bits >= 64 {
            i64::MAX
        } else {
            (1i64 << (bits - 1)) - 1
        }
    }
}

/// 数值约束（在类型界之内进一步收窄）。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Constraint {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// 一个属性的完整 schema。
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeSchema {
    pub id: AttributeId,
    pub name: &'static str,
    pub kind: ValueKind,
    pub conformance: Conformance,
    pub quality: Quality,
    pub access: AttributeAccess,
    pub constraint: Constraint,
    pub default: Option<TlvValue>,
}

/// 一个命令的 schema。
#[derive(Clone, Debug, PartialEq)]
pub struct CommandSchema {
    pub id: CommandId,
    pub name: &'static str,
    pub conformance: Conformance,
    pub invoke: Privilege,
    /// 调用前必须有 TimedRequest。
    pub timed: bool,
    /// 有类型响应的命令填响应命令号；否则回 CommandStatus。
    pub response: Option<CommandId>,
}

/// 一个事件的 schema。
#[derive(Clone, Debug, PartialEq)]
pub struct EventSchema {
    pub id: EventId,
    pub name: &'static str,
    pub conformance: Conformance,
    pub priority: EventPriority,
    pub read: Privilege,
    pub fabric_scoped: bool,
}

/// 一个集群的完整 schema。
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterSchema {
    pub id: ClusterId,
    pub name: &'static str,
    pub revision: u16,
    pub attributes: Vec<AttributeSchema>,
    pub commands: Vec<CommandSchema>,
    pub events: Vec<EventSchema>,
}

impl ClusterSchema {
    pub fn attribute(&self, id: AttributeId) -> Option<&AttributeSchema> {
        self.attributes.iter().find(|attr| attr.id == id)
    }

    pub fn command(&self, id: CommandId) -> Option<&CommandSchema> {
        self.commands.iter().find(|cmd| cmd.id == id)
    }

    pub fn event(&self, id: EventId) -> Option<&EventSchema> {
        self.events.iter().find(|event| event.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_conformance_follows_bitmap() {
        let on_when_set = Conformance::Feature {
            bit: 0,
            when_set: true,
        };
        assert!(on_when_set.applies(0b01));
        assert!(!on_when_set.applies(0b10));

        let off_when_set = Conformance::Feature {
            bit: 1,
            when_set: false,
        };
        assert!(off_when_set.applies(0b01));
        assert!(!off_when_set.applies(0b10));
    }

    #[test]
    fn nullable_sentinels_match_type_bounds() {
        assert_eq!(ValueKind::unsigned_max(8), 0xff);
        assert_eq!(ValueKind::unsigned_max(16), 0xffff);
        assert_eq!(ValueKind::signed_min(8), -128);
        assert_eq!(ValueKind::signed_max(8), 127);
    }
}
