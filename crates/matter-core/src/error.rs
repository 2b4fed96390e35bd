//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为整个协议栈提供统一的错误域：跨层传递稳定错误码，使日志、指标与
//!   交互层的状态映射能够进行机器可读的根因识别；
//! - 各子 crate 以 `thiserror` 定义细粒度枚举，在边界处统一转换为
//!   [`MatterError`]，向上只暴露一种错误形态。
//!
//! ## 设计要求（What）
//! - 错误码遵循 `namespace.reason` 形式并保持稳定，例如 `tlv.malformed`、
//!   `session.counter_replay`；
//! - [`ErrorCategory`] 对齐协议处理策略：分帧类丢弃报文、协议类回复状态码、
//!   数据模型类落为逐路径状态、I/O 类触发重试或会话拆除、实现类标记构造失败；
//! - 关闭路径上的错误只记录日志、不再向上抛出，由调用方遵守该约定。

use core::fmt;
use std::error::Error as StdError;

/// 统一的结果别名，省去各层重复书写错误类型。
pub type Result<T, E = MatterError> = core::result::Result<T, E>;

/// 错误处理策略分类。
///
/// # 契约说明（What）
/// - `Framing`：报文/编码层损坏（TLV 残缺、解密失败、协议号不符），处理
///   策略是丢弃并视情况回 `InvalidCommand` 后关闭交换；
/// - `Protocol`：状态机违例（顺序错误、重复引用、未知订阅），回复具体的
///   Matter 状态码，进程不崩溃；
/// - `DataModel`：元素级失败（不支持的属性、约束冲突、权限不足），以
///   逐路径状态返回，整个交互继续；
/// - `Io`：瞬时传输失败（通道关闭、重传耗尽），可重试或向调用方传播超时；
/// - `Implementation`：配置/实现缺陷（缺少必需 behavior、非法口令），浮出
///   为构造失败，受影响单元进入 crashed 状态，节点其余部分保持可用。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Framing,
    Protocol,
    DataModel,
    Io,
    Implementation,
}

impl ErrorCategory {
    /// 返回分类的稳定名称，用于日志字段。
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Framing => "framing",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::DataModel => "data-model",
            ErrorCategory::Io => "io",
            ErrorCategory::Implementation => "implementation",
        }
    }
}

/// 底层原因的统一封装，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn StdError + Send + Sync + 'static>;

/// `MatterError` 是协议栈统一的错误载体。
///
/// # 设计背景（Why）
/// - 低层解析与网络错误需要在交换边界处转换为 Matter 状态码；携带稳定
///   错误码与分类后，转换逻辑可以集中在一处完成；
/// - Builder 风格的上下文累积（`with_cause`、`with_context`）避免在构造点
///   强行拼接字符串，调用链各层按需补充信息。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 应在 [`codes`] 模块中声明，或遵守
///   `namespace.reason` 命名约定；
/// - **后置条件**：所有构造方法返回拥有所有权的实例，可跨线程移动与重试。
#[derive(Debug)]
pub struct MatterError {
    code: &'static str,
    category: ErrorCategory,
    message: String,
    cause: Option<ErrorCause>,
}

impl MatterError {
    /// 以稳定错误码、分类与人类可读消息构造错误。
    pub fn new(code: &'static str, category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            code,
            category,
            message: message.into(),
            cause: None,
        }
    }

    /// 构造 `Framing` 类错误的便捷入口。
    pub fn framing(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Framing, message)
    }

    /// 构造 `Protocol` 类错误的便捷入口。
    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Protocol, message)
    }

    /// 构造 `DataModel` 类错误的便捷入口。
    pub fn data_model(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::DataModel, message)
    }

    /// 构造 `Io` 类错误的便捷入口。
    pub fn io(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Io, message)
    }

    /// 构造 `Implementation` 类错误的便捷入口。
    pub fn implementation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorCategory::Implementation, message)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取处理策略分类。
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 在已有消息前补充调用点上下文。
    pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", context.as_ref(), self.message);
        self
    }
}

impl fmt::Display for MatterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (cause: {cause})")?;
        }
        Ok(())
    }
}

impl StdError for MatterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for MatterError {
    fn from(err: std::io::Error) -> Self {
        MatterError::io(codes::IO_FAILURE, err.to_string()).with_cause(err)
    }
}

/// 全仓库共享的稳定错误码清单。
///
/// 约定：`namespace.reason`，namespace 与产生错误的 crate/层对应；新增
/// 错误码必须在此登记，禁止在调用点散落字符串字面量。
pub mod codes {
    /// 环境中找不到请求的服务，且无可用工厂。
    pub const SERVICE_UNAVAILABLE: &str = "environment.service_unavailable";
    /// 服务类型与注册槽位不匹配。
    pub const SERVICE_TYPE_MISMATCH: &str = "environment.service_type_mismatch";
    /// 服务工厂构造失败。
    pub const SERVICE_CONSTRUCTION: &str = "environment.service_construction";

    /// TLV 字节流残缺或标签非法。
    pub const TLV_MALFORMED: &str = "tlv.malformed";
    /// TLV 元素类型与 schema 不符。
    pub const TLV_UNEXPECTED_TYPE: &str = "tlv.unexpected_type";

    /// 配对码校验位或字符集非法。
    pub const PAIRING_CODE_INVALID: &str = "pairing.code_invalid";

    /// 报文头部无法解析。
    pub const MESSAGE_MALFORMED: &str = "message.malformed";
    /// 报文解密或标签校验失败。
    pub const MESSAGE_DECRYPT_FAILED: &str = "message.decrypt_failed";
    /// 报文计数器落入重放窗口。
    pub const MESSAGE_COUNTER_REPLAY: &str = "message.counter_replay";

    /// 会话表中找不到目标会话。
    pub const SESSION_NOT_FOUND: &str = "session.not_found";
    /// 会话建立被对端以状态码拒绝。
    pub const SESSION_ESTABLISHMENT_FAILED: &str = "session.establishment_failed";
    /// 口令在 Matter 禁用清单内。
    pub const SESSION_FORBIDDEN_PASSCODE: &str = "session.forbidden_passcode";
    /// 证书链校验失败。
    pub const SESSION_INVALID_CERTIFICATE: &str = "session.invalid_certificate";

    /// 交换等待响应超时（含 MRP 重传耗尽）。
    pub const EXCHANGE_NO_RESPONSE: &str = "exchange.no_response_timeout";
    /// 交换收到与状态机不符的报文。
    pub const EXCHANGE_UNEXPECTED_MESSAGE: &str = "exchange.unexpected_message";
    /// 交换指向的协议没有注册处理器。
    pub const EXCHANGE_UNKNOWN_PROTOCOL: &str = "exchange.unknown_protocol";

    /// 数据模型路径不存在。
    pub const PATH_NOT_FOUND: &str = "datamodel.path_not_found";
    /// 候选值违反 schema 约束。
    pub const CONSTRAINT: &str = "datamodel.constraint";
    /// 候选值类型与 schema 不符。
    pub const INVALID_DATA_TYPE: &str = "datamodel.invalid_data_type";
    /// 候选值超出数值范围。
    pub const OUT_OF_RANGE: &str = "datamodel.out_of_range";
    /// 访问权限不足或 fabric 不匹配。
    pub const ACCESS_DENIED: &str = "datamodel.access_denied";
    /// 必需 behavior 缺失导致端点无法激活。
    pub const BEHAVIOR_INITIALIZATION: &str = "datamodel.behavior_initialization";

    /// 交互层收到无法继续的请求。
    pub const INTERACTION_INVALID_ACTION: &str = "interaction.invalid_action";
    /// 需要 TimedRequest 前置而未提供。
    pub const INTERACTION_NEEDS_TIMED: &str = "interaction.needs_timed_interaction";
    /// 订阅 id 未知或已被回收。
    pub const INTERACTION_INVALID_SUBSCRIPTION: &str = "interaction.invalid_subscription";

    /// BDX 对端拒绝了请求的传输方式。
    pub const BDX_METHOD_NOT_SUPPORTED: &str = "bdx.transfer_method_not_supported";
    /// BDX 块计数器不连续。
    pub const BDX_BAD_BLOCK_COUNTER: &str = "bdx.bad_block_counter";
    /// BDX 会话空闲超时。
    pub const BDX_IDLE_TIMEOUT: &str = "bdx.idle_timeout";

    /// 提交步骤缺少前置的 failsafe。
    pub const COMMISSIONING_FAILSAFE_REQUIRED: &str = "commissioning.failsafe_required";
    /// 提交流程中的步骤顺序违例。
    pub const COMMISSIONING_ORDER: &str = "commissioning.order_violation";
    /// 限定时间内未发现匹配设备。
    pub const DISCOVERY_TIMEOUT: &str = "discovery.timeout";

    /// OTA 镜像头部损坏或魔数不符。
    pub const OTA_INVALID_IMAGE: &str = "ota.invalid_image";

    /// 未归类的底层 I/O 失败。
    pub const IO_FAILURE: &str = "io.failure";
    /// 任务被取消或宿主正在关闭。
    pub const CANCELLED: &str = "core.cancelled";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "socket gone");
        let err = MatterError::io(codes::IO_FAILURE, "send failed").with_cause(io);
        let rendered = err.to_string();
        assert!(rendered.contains("io.failure"));
        assert!(rendered.contains("socket gone"));
    }

    #[test]
    fn context_prepends_location() {
        let err = MatterError::framing(codes::TLV_MALFORMED, "truncated element")
            .with_context("attribute report");
        assert_eq!(err.message(), "attribute report: truncated element");
        assert_eq!(err.category(), ErrorCategory::Framing);
    }
}
