//! 传输层错误域，统一折叠为 [`MatterError`] 的 `Io`/`Framing` 分类。

use matter_core::error::{MatterError, codes};
use thiserror::Error;

/// 传输层错误。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 底层套接字操作失败。
    #[error("socket operation failed: {0}")]
    Socket(#[from] std::io::Error),

    /// 通道已关闭，报文无法送出。
    #[error("channel to {peer} is closed")]
    ChannelClosed { peer: String },

    /// 载荷超过通道的最大报文尺寸。
    #[error("payload of {len} bytes exceeds channel limit {limit}")]
    PayloadTooLarge { len: usize, limit: usize },

    /// BTP 握手报文损坏或版本不兼容。
    #[error("btp handshake rejected: {reason}")]
    HandshakeRejected { reason: &'static str },

    /// BTP 分段序号与重组状态机不符。
    #[error("btp segment out of order (expected {expected}, got {got})")]
    SegmentOutOfOrder { expected: u8, got: u8 },

    /// BTP 分段在缺少起始段的情况下到达。
    #[error("btp continuation segment without a begin segment")]
    OrphanSegment,
}

impl From<TransportError> for MatterError {
    fn from(err: TransportError) -> Self {
        match &err {
            TransportError::HandshakeRejected { .. }
            | TransportError::SegmentOutOfOrder { .. }
            | TransportError::OrphanSegment => {
                MatterError::framing(codes::MESSAGE_MALFORMED, err.to_string()).with_cause(err)
            }
            _ => MatterError::io(codes::IO_FAILURE, err.to_string()).with_cause(err),
        }
    }
}
