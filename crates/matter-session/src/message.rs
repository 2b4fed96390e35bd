//! Matter 报文头编解码：消息头（加密范围外）与载荷头（加密范围内）。
//!
//! # 线缆布局（What）
//! 消息头：`flags(1) | session_id(2 LE) | security_flags(1) |
//! message_counter(4 LE) | [source_node_id(8 LE)] | [dest_node_id(8 LE)]`；
//! `flags` 高 4 位为版本，低位标记源/目的节点号是否在场；
//! `security_flags` 低 2 位为会话类型（单播/组播），其余为控制位。
//!
//! 载荷头：`exchange_flags(1) | opcode(1) | exchange_id(2 LE) |
//! protocol_id(2 LE) | [ack_counter(4 LE)]`；
//! `exchange_flags`：`I` 发起方、`A` 携带确认、`R` 请求确认。

use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{ExchangeId, NodeId, ProtocolId, SessionId};

const VERSION: u8 = 0;
const FLAG_SOURCE_PRESENT: u8 = 0x04;
const FLAG_DEST_PRESENT: u8 = 0x01;

const SECURITY_SESSION_TYPE_MASK: u8 = 0x03;

const EXCHANGE_FLAG_INITIATOR: u8 = 0x01;
const EXCHANGE_FLAG_ACK: u8 = 0x02;
const EXCHANGE_FLAG_RELIABILITY: u8 = 0x04;

/// 会话类型（security flags 低 2 位）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionType {
    /// 单播会话；session_id 0 表示未加密的建立阶段。
    Unicast,
    /// 组播会话。
    Group,
}

impl SessionType {
    fn raw(&self) -> u8 {
        match self {
            SessionType::Unicast => 0,
            SessionType::Group => 1,
        }
    }
}

/// 消息头（认证数据，不加密）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MessageHeader {
    pub session_id: SessionId,
    pub session_type: SessionType,
    pub counter: u32,
    pub source: Option<NodeId>,
    pub destination: Option<NodeId>,
}

impl MessageHeader {
    /// 该报文是否运行在未加密的会话建立通道上。
    pub fn is_unsecured(&self) -> bool {
        self.session_id.raw() == 0 && self.session_type == SessionType::Unicast
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = VERSION << 4;
        if self.source.is_some() {
            flags |= FLAG_SOURCE_PRESENT;
        }
        if self.destination.is_some() {
            flags |= FLAG_DEST_PRESENT;
        }
        let mut out = Vec::with_capacity(24);
        out.push(flags);
        out.extend_from_slice(&self.session_id.raw().to_le_bytes());
        out.push(self.session_type.raw());
        out.extend_from_slice(&self.counter.to_le_bytes());
        if let Some(source) = self.source {
            out.extend_from_slice(&source.raw().to_le_bytes());
        }
        if let Some(destination) = self.destination {
            out.extend_from_slice(&destination.raw().to_le_bytes());
        }
        out
    }

    /// 解码消息头，返回 `(头, 剩余载荷偏移)`。
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(input);
        let flags = cursor.u8()?;
        if flags >> 4 != VERSION {
            return Err(MatterError::framing(
                codes::MESSAGE_MALFORMED,
                format!("unsupported message version {}", flags >> 4),
            ));
        }
        let session_id = SessionId(cursor.u16()?);
        let security = cursor.u8()?;
        let session_type = match security & SECURITY_SESSION_TYPE_MASK {
            0 => SessionType::Unicast,
            1 => SessionType::Group,
            other => {
                return Err(MatterError::framing(
                    codes::MESSAGE_MALFORMED,
                    format!("reserved session type {other}"),
                ));
            }
        };
        let counter = cursor.u32()?;
        let source = if flags & FLAG_SOURCE_PRESENT != 0 {
            Some(NodeId(cursor.u64()?))
        } else {
            None
        };
        let destination = if flags & FLAG_DEST_PRESENT != 0 {
            Some(NodeId(cursor.u64()?))
        } else {
            None
        };
        Ok((
            Self {
                session_id,
                session_type,
                counter,
                source,
                destination,
            },
            cursor.pos,
        ))
    }
}

/// 载荷头（加密范围内）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PayloadHeader {
    pub initiator: bool,
    /// 要求对端确认（MRP 在不可靠通道上置位）。
    pub needs_ack: bool,
    /// 捎带确认的对端计数器。
    pub ack_counter: Option<u32>,
    pub opcode: u8,
    pub exchange_id: ExchangeId,
    pub protocol_id: ProtocolId,
}

impl PayloadHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.initiator {
            flags |= EXCHANGE_FLAG_INITIATOR;
        }
        if self.ack_counter.is_some() {
            flags |= EXCHANGE_FLAG_ACK;
        }
        if self.needs_ack {
            flags |= EXCHANGE_FLAG_RELIABILITY;
        }
        let mut out = Vec::with_capacity(10);
        out.push(flags);
        out.push(self.opcode);
        out.extend_from_slice(&self.exchange_id.raw().to_le_bytes());
        out.extend_from_slice(&self.protocol_id.raw().to_le_bytes());
        if let Some(ack) = self.ack_counter {
            out.extend_from_slice(&ack.to_le_bytes());
        }
        out
    }

    /// 解码载荷头，返回 `(头, 应用载荷偏移)`。
    pub fn decode(input: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(input);
        let flags = cursor.u8()?;
        let opcode = cursor.u8()?;
        let exchange_id = ExchangeId(cursor.u16()?);
        let protocol_id = ProtocolId(cursor.u16()?);
        let ack_counter = if flags & EXCHANGE_FLAG_ACK != 0 {
            Some(cursor.u32()?)
        } else {
            None
        };
        Ok((
            Self {
                initiator: flags & EXCHANGE_FLAG_INITIATOR != 0,
                needs_ack: flags & EXCHANGE_FLAG_RELIABILITY != 0,
                ack_counter,
                opcode,
                exchange_id,
                protocol_id,
            },
            cursor.pos,
        ))
    }
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.input.get(self.pos..end).ok_or_else(|| {
            MatterError::framing(
                codes::MESSAGE_MALFORMED,
                format!("header truncated at byte {}", self.pos),
            )
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_header_roundtrip_with_node_ids() {
        let header = MessageHeader {
            session_id: SessionId(7),
            session_type: SessionType::Unicast,
            counter: 0xdeadbeef,
            source: Some(NodeId(0x1122)),
            destination: Some(NodeId(0x3344)),
        };
        let bytes = header.encode();
        let (decoded, consumed) = MessageHeader::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn payload_header_roundtrip_with_ack() {
        let header = PayloadHeader {
            initiator: true,
            needs_ack: true,
            ack_counter: Some(41),
            opcode: 0x08,
            exchange_id: ExchangeId(9),
            protocol_id: ProtocolId::INTERACTION_MODEL,
        };
        let bytes = header.encode();
        let (decoded, consumed) = PayloadHeader::decode(&bytes).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn truncated_header_is_framing_error() {
        let header = MessageHeader {
            session_id: SessionId(1),
            session_type: SessionType::Unicast,
            counter: 1,
            source: None,
            destination: None,
        };
        let bytes = header.encode();
        let err = MessageHeader::decode(&bytes[..3]).expect_err("truncated");
        assert_eq!(err.code(), codes::MESSAGE_MALFORMED);
    }
}
