//! # status 模块说明
//!
//! ## 角色定位（Why）
//! - 汇集交互模型与安全通道在线缆上使用的状态码，作为错误域到 Matter
//!   规范编号的唯一翻译点；
//! - 任何需要把 [`MatterError`](crate::error::MatterError) 回写给对端的
//!   位置都应经由本模块完成映射，避免散落的魔数。
//!
//! ## 设计要求（What）
//! - 枚举判别值与 Matter Core Specification 1.4 的编号逐一对应；
//! - 编解码提供 `from_raw`/`raw` 双向转换，未知编号保留原始值以便透传。

use crate::error::{ErrorCategory, MatterError, codes};

/// 交互模型状态码（Interaction Model Status Code）。
///
/// 判别值即线缆编号；`Reserved(u8)` 兜底保留未识别的编号，读取端不会
/// 因对端使用新版本规范而失败。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    Success,
    Failure,
    InvalidSubscription,
    UnsupportedAccess,
    UnsupportedEndpoint,
    InvalidAction,
    UnsupportedCommand,
    InvalidCommand,
    UnsupportedAttribute,
    ConstraintError,
    UnsupportedWrite,
    ResourceExhausted,
    NotFound,
    UnreportableAttribute,
    InvalidDataType,
    UnsupportedRead,
    DataVersionMismatch,
    Timeout,
    Busy,
    UnsupportedCluster,
    NoUpstreamSubscription,
    NeedsTimedInteraction,
    UnsupportedEvent,
    PathsExhausted,
    TimedRequestMismatch,
    FailsafeRequired,
    InvalidInState,
    Reserved(u8),
}

impl Status {
    /// 返回线缆编号。
    pub fn raw(&self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::Failure => 0x01,
            Status::InvalidSubscription => 0x7d,
            Status::UnsupportedAccess => 0x7e,
            Status::UnsupportedEndpoint => 0x7f,
            Status::InvalidAction => 0x80,
            Status::UnsupportedCommand => 0x81,
            Status::InvalidCommand => 0x85,
            Status::UnsupportedAttribute => 0x86,
            Status::ConstraintError => 0x87,
            Status::UnsupportedWrite => 0x88,
            Status::ResourceExhausted => 0x89,
            Status::NotFound => 0x8b,
            Status::UnreportableAttribute => 0x8c,
            Status::InvalidDataType => 0x8d,
            Status::UnsupportedRead => 0x8f,
            Status::DataVersionMismatch => 0x92,
            Status::Timeout => 0x94,
            Status::Busy => 0x9c,
            Status::UnsupportedCluster => 0xc3,
            Status::NoUpstreamSubscription => 0xc5,
            Status::NeedsTimedInteraction => 0xc6,
            Status::UnsupportedEvent => 0xc7,
            Status::PathsExhausted => 0xc8,
            Status::TimedRequestMismatch => 0xc9,
            Status::FailsafeRequired => 0xca,
            Status::InvalidInState => 0xcb,
            Status::Reserved(raw) => *raw,
        }
    }

    /// 从线缆编号还原状态码。
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Status::Success,
            0x01 => Status::Failure,
            0x7d => Status::InvalidSubscription,
            0x7e => Status::UnsupportedAccess,
            0x7f => Status::UnsupportedEndpoint,
            0x80 => Status::InvalidAction,
            0x81 => Status::UnsupportedCommand,
            0x85 => Status::InvalidCommand,
            0x86 => Status::UnsupportedAttribute,
            0x87 => Status::ConstraintError,
            0x88 => Status::UnsupportedWrite,
            0x89 => Status::ResourceExhausted,
            0x8b => Status::NotFound,
            0x8c => Status::UnreportableAttribute,
            0x8d => Status::InvalidDataType,
            0x8f => Status::UnsupportedRead,
            0x92 => Status::DataVersionMismatch,
            0x94 => Status::Timeout,
            0x9c => Status::Busy,
            0xc3 => Status::UnsupportedCluster,
            0xc5 => Status::NoUpstreamSubscription,
            0xc6 => Status::NeedsTimedInteraction,
            0xc7 => Status::UnsupportedEvent,
            0xc8 => Status::PathsExhausted,
            0xc9 => Status::TimedRequestMismatch,
            0xca => Status::FailsafeRequired,
            0xcb => Status::InvalidInState,
            other => Status::Reserved(other),
        }
    }

    /// 是否为成功状态。
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// 聚合两个状态时取“更严格”的一方。
    ///
    /// # 契约说明（What）
    /// - `ConstraintError` 优先于一般 `Failure`，其余非成功状态按先到先得；
    /// - 原子写提交等需要单一总状态的场景使用该函数折叠逐元素结果。
    pub fn strictest(self, other: Status) -> Status {
        match (self, other) {
            (Status::Success, b) => b,
            (a, Status::Success) => a,
            (Status::ConstraintError, _) | (_, Status::ConstraintError) => Status::ConstraintError,
            (a, _) => a,
        }
    }
}

impl From<&MatterError> for Status {
    /// 错误域到交互模型状态码的集中映射。
    ///
    /// 依据错误码精确映射；同 namespace 下未登记的错误按分类降级到
    /// 粗粒度状态（Framing → `InvalidCommand`，其余 → `Failure`）。
    fn from(err: &MatterError) -> Self {
        match err.code() {
            codes::PATH_NOT_FOUND => Status::UnsupportedAttribute,
            codes::CONSTRAINT => Status::ConstraintError,
            codes::INVALID_DATA_TYPE => Status::InvalidDataType,
            codes::OUT_OF_RANGE => Status::ConstraintError,
            codes::ACCESS_DENIED => Status::UnsupportedAccess,
            codes::INTERACTION_INVALID_ACTION => Status::InvalidAction,
            codes::INTERACTION_NEEDS_TIMED => Status::NeedsTimedInteraction,
            codes::INTERACTION_INVALID_SUBSCRIPTION => Status::InvalidSubscription,
            codes::COMMISSIONING_FAILSAFE_REQUIRED => Status::FailsafeRequired,
            codes::COMMISSIONING_ORDER => Status::ConstraintError,
            codes::EXCHANGE_NO_RESPONSE => Status::Timeout,
            _ => match err.category() {
                ErrorCategory::Framing => Status::InvalidCommand,
                _ => Status::Failure,
            },
        }
    }
}

/// 安全通道协议的通用状态报告编号。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecureChannelStatus {
    SessionEstablishmentSuccess,
    NoSharedTrustRoots,
    InvalidParameter,
    CloseSession,
    Busy,
}

impl SecureChannelStatus {
    pub fn raw(&self) -> u16 {
        match self {
            SecureChannelStatus::SessionEstablishmentSuccess => 0x0000,
            SecureChannelStatus::NoSharedTrustRoots => 0x0001,
            SecureChannelStatus::InvalidParameter => 0x0002,
            SecureChannelStatus::CloseSession => 0x0003,
            SecureChannelStatus::Busy => 0x0004,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0000 => Some(SecureChannelStatus::SessionEstablishmentSuccess),
            0x0001 => Some(SecureChannelStatus::NoSharedTrustRoots),
            0x0002 => Some(SecureChannelStatus::InvalidParameter),
            0x0003 => Some(SecureChannelStatus::CloseSession),
            0x0004 => Some(SecureChannelStatus::Busy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_preserves_known_and_reserved() {
        for raw in 0u8..=0xff {
            assert_eq!(Status::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn strictest_prefers_constraint_error() {
        assert_eq!(
            Status::Failure.strictest(Status::ConstraintError),
            Status::ConstraintError
        );
        assert_eq!(Status::Success.strictest(Status::Busy), Status::Busy);
        assert_eq!(Status::Success.strictest(Status::Success), Status::Success);
    }

    #[test]
    fn error_mapping_uses_registered_codes() {
        let err = MatterError::data_model(codes::CONSTRAINT, "value above max");
        assert_eq!(Status::from(&err), Status::ConstraintError);
        let err = MatterError::framing(codes::TLV_MALFORMED, "bad tag");
        assert_eq!(Status::from(&err), Status::InvalidCommand);
    }
}
