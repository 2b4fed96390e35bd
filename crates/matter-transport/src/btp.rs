//! BTP（Bluetooth Transport Protocol）会话：BLE GATT 之上的分帧层。
//!
//! # 协议形态（What）
//! - 握手：中心设备经 C1 写入握手请求（版本提名、ATT MTU、接收窗口），
//!   外设经 C2 通知握手响应（选定版本、最终 MTU、窗口）；
//! - 数据：Matter 报文按协商 MTU 分段，段头携带 `Beginning/Continuing/
//!   Ending` 标志、序号与捎带确认；接收端按序重组；
//! - GATT 断链即会话终结，未完成的重组被丢弃。
//!
//! # 风险提示（Trade-offs）
//! - 重组状态机按单会话串行设计，乱序分段一律按协议违例拒绝，不做
//!   缓存回放。

use crate::error::TransportError;

/// Matter BLE 服务 UUID。
pub const GATT_SERVICE_UUID: &str = "0000FFF6-0000-1000-8000-00805F9B34FB";
/// C1：中心设备写入（client → server）。
pub const GATT_C1_UUID: &str = "18EE2EF5-263D-4559-959F-4F9C429F9D11";
/// C2：外设通知（server → client）。
pub const GATT_C2_UUID: &str = "18EE2EF5-263D-4559-959F-4F9C429F9D12";
/// C3：附加广告数据（只读）。
pub const GATT_C3_UUID: &str = "64630238-8772-45F2-B87D-748A83218F04";

/// 本实现支持的 BTP 协议版本。
pub const BTP_VERSION: u8 = 4;

const FLAG_BEGIN: u8 = 0x01;
const FLAG_CONTINUE: u8 = 0x02;
const FLAG_END: u8 = 0x04;
const FLAG_ACK: u8 = 0x08;
const FLAG_MANAGEMENT: u8 = 0x20;
const FLAG_HANDSHAKE: u8 = 0x40;

const HANDSHAKE_FLAGS: u8 = FLAG_HANDSHAKE | FLAG_MANAGEMENT | FLAG_BEGIN | FLAG_END;
const MANAGEMENT_OPCODE: u8 = 0x6c;

/// 握手请求：版本提名、期望 MTU 与接收窗口。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeRequest {
    /// 提名的协议版本，优先级从高到低，至多 8 个。
    pub versions: Vec<u8>,
    pub mtu: u16,
    pub window_size: u8,
}

impl HandshakeRequest {
    pub fn new(mtu: u16, window_size: u8) -> Self {
        Self {
            versions: vec![BTP_VERSION],
            mtu,
            window_size,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![HANDSHAKE_FLAGS, MANAGEMENT_OPCODE];
        // 版本提名按半字节打包，低半字节在前。
        let mut nibbles = [0u8; 4];
        for (i, version) in self.versions.iter().take(8).enumerate() {
            let shift = 4 * (i % 2);
            nibbles[i / 2] |= (version & 0x0f) << shift;
        }
        out.extend_from_slice(&nibbles);
        out.extend_from_slice(&self.mtu.to_le_bytes());
        out.push(self.window_size);
        out
    }

    pub fn decode(packet: &[u8]) -> Result<Self, TransportError> {
        if packet.len() != 9 || packet[0] != HANDSHAKE_FLAGS || packet[1] != MANAGEMENT_OPCODE {
            return Err(TransportError::HandshakeRejected {
                reason: "malformed handshake request",
            });
        }
        let mut versions = Vec::new();
        for i in 0..8 {
            let nibble = (packet[2 + i / 2] >> (4 * (i % 2))) & 0x0f;
            if nibble != 0 {
                versions.push(nibble);
            }
        }
        if versions.is_empty() {
            return Err(TransportError::HandshakeRejected {
                reason: "no versions nominated",
            });
        }
        Ok(Self {
            versions,
            mtu: u16::from_le_bytes([packet[6], packet[7]]),
            window_size: packet[8],
        })
    }

    /// 外设侧选版并产出响应；无共同版本时拒绝。
    pub fn accept(&self, local_mtu: u16, local_window: u8) -> Result<HandshakeResponse, TransportError> {
        if !self.versions.contains(&BTP_VERSION) {
            return Err(TransportError::HandshakeRejected {
                reason: "no common protocol version",
            });
        }
        Ok(HandshakeResponse {
            version: BTP_VERSION,
            mtu: self.mtu.min(local_mtu),
            window_size: self.window_size.min(local_window),
        })
    }
}

/// 握手响应：选定的版本、最终 MTU 与窗口。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub version: u8,
    pub mtu: u16,
    pub window_size: u8,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![HANDSHAKE_FLAGS, MANAGEMENT_OPCODE, self.version];
        out.extend_from_slice(&self.mtu.to_le_bytes());
        out.push(self.window_size);
        out
    }

    pub fn decode(packet: &[u8]) -> Result<Self, TransportError> {
        if packet.len() != 6 || packet[0] != HANDSHAKE_FLAGS || packet[1] != MANAGEMENT_OPCODE {
            return Err(TransportError::HandshakeRejected {
                reason: "malformed handshake response",
            });
        }
        Ok(Self {
            version: packet[2],
            mtu: u16::from_le_bytes([packet[3], packet[4]]),
            window_size: packet[5],
        })
    }
}

/// 数据面会话：分段与重组。
///
/// # 契约说明（What）
/// - `segment` 把一条 Matter 报文切成若干 GATT 写入/通知载荷；
/// - `assemble` 逐包喂入，凑齐 `Ending` 段时返回完整报文；
/// - 序号按 u8 回绕递增，捎带确认记录对端已看到的最后序号。
#[derive(Debug)]
pub struct BtpSession {
    mtu: usize,
    tx_seq: u8,
    rx_seq: Option<u8>,
    reassembly: Option<Reassembly>,
}

#[derive(Debug)]
struct Reassembly {
    expected_len: usize,
    buf: Vec<u8>,
}

impl BtpSession {
    /// 以协商结果创建会话。
    pub fn new(response: &HandshakeResponse) -> Self {
        Self {
            mtu: usize::from(response.mtu.max(23)),
            tx_seq: 0,
            rx_seq: None,
            reassembly: None,
        }
    }

    /// 把一条报文分段；每段不超过协商 MTU 扣除段头。
    pub fn segment(&mut self, message: &[u8]) -> Vec<Vec<u8>> {
        let ack = self.rx_seq;
        // 段头最大开销：flags + ack + seq + len。
        let first_capacity = self.mtu.saturating_sub(1 + ack.map_or(0, |_| 1) + 1 + 2).max(1);
        let rest_capacity = self.mtu.saturating_sub(2).max(1);

        let mut packets = Vec::new();
        let mut offset = 0;
        let mut first = true;
        loop {
            let capacity = if first { first_capacity } else { rest_capacity };
            let end = (offset + capacity).min(message.len());
            let last = end == message.len();

            let mut flags = 0u8;
            if first {
                flags |= FLAG_BEGIN;
            } else {
                flags |= FLAG_CONTINUE;
            }
            if last {
                flags |= FLAG_END;
            }

            let mut packet = Vec::with_capacity(self.mtu);
            if first && ack.is_some() {
                flags |= FLAG_ACK;
            }
            packet.push(flags);
            if first {
                if let Some(ack) = ack {
                    packet.push(ack);
                }
            }
            packet.push(self.tx_seq);
            self.tx_seq = self.tx_seq.wrapping_add(1);
            if first {
                packet.extend_from_slice(&(message.len() as u16).to_le_bytes());
            }
            packet.extend_from_slice(&message[offset..end]);
            packets.push(packet);

            if last {
                break;
            }
            offset = end;
            first = false;
        }
        packets
    }

    /// 喂入一个数据段；凑齐完整报文时返回。
    pub fn assemble(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let mut cursor = 0usize;
        let flags = *packet.first().ok_or(TransportError::OrphanSegment)?;
        cursor += 1;
        if flags & FLAG_ACK != 0 {
            // 捎带确认只用于窗口推进，重组路径直接跳过。
            cursor += 1;
        }
        let seq = *packet.get(cursor).ok_or(TransportError::OrphanSegment)?;
        cursor += 1;

        if let Some(prev) = self.rx_seq {
            let expected = prev.wrapping_add(1);
            if seq != expected {
                return Err(TransportError::SegmentOutOfOrder {
                    expected,
                    got: seq,
                });
            }
        }
        self.rx_seq = Some(seq);

        if flags & FLAG_BEGIN != 0 {
            let len_bytes = packet
                .get(cursor..cursor + 2)
                .ok_or(TransportError::OrphanSegment)?;
            let expected_len = usize::from(u16::from_le_bytes([len_bytes[0], len_bytes[1]]));
            cursor += 2;
            self.reassembly = Some(Reassembly {
                expected_len,
                buf: Vec::with_capacity(expected_len),
            });
        } else if self.reassembly.is_none() {
            return Err(TransportError::OrphanSegment);
        }

        let reassembly = self.reassembly.as_mut().expect("reassembly present");
        reassembly
            .buf
            .extend_from_slice(packet.get(cursor..).unwrap_or(&[]));

        if flags & FLAG_END != 0 {
            let done = self.reassembly.take().expect("reassembly present");
            if done.buf.len() != done.expected_len {
                return Err(TransportError::OrphanSegment);
            }
            return Ok(Some(done.buf));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiated(mtu: u16) -> HandshakeResponse {
        HandshakeResponse {
            version: BTP_VERSION,
            mtu,
            window_size: 4,
        }
    }

    #[test]
    fn handshake_roundtrip_and_negotiation() {
        let request = HandshakeRequest::new(185, 6);
        let decoded = HandshakeRequest::decode(&request.encode()).expect("decode request");
        assert_eq!(decoded, request);

        let response = decoded.accept(120, 4).expect("accept");
        assert_eq!(response.version, BTP_VERSION);
        assert_eq!(response.mtu, 120, "responder clamps to its own mtu");
        assert_eq!(response.window_size, 4);
        assert_eq!(
            HandshakeResponse::decode(&response.encode()).expect("decode response"),
            response
        );
    }

    #[test]
    fn rejects_unknown_versions() {
        let request = HandshakeRequest {
            versions: vec![1, 2],
            mtu: 100,
            window_size: 4,
        };
        assert!(matches!(
            request.accept(100, 4),
            Err(TransportError::HandshakeRejected { .. })
        ));
    }

    #[test]
    fn segment_and_reassemble_long_message() {
        let mut tx = BtpSession::new(&negotiated(32));
        let mut rx = BtpSession::new(&negotiated(32));

        let message: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        let packets = tx.segment(&message);
        assert!(packets.len() > 1);

        let mut assembled = None;
        for packet in &packets {
            assembled = rx.assemble(packet).expect("assemble");
        }
        assert_eq!(assembled.as_deref(), Some(message.as_slice()));
    }

    #[test]
    fn out_of_order_segment_is_rejected() {
        let mut tx = BtpSession::new(&negotiated(24));
        let mut rx = BtpSession::new(&negotiated(24));

        let packets = tx.segment(&vec![0xaa; 100]);
        assert!(packets.len() >= 3);
        rx.assemble(&packets[0]).expect("first segment");
        let err = rx.assemble(&packets[2]).expect_err("skipped segment");
        assert!(matches!(err, TransportError::SegmentOutOfOrder { .. }));
    }

    #[test]
    fn continuation_without_begin_is_orphan() {
        let mut tx = BtpSession::new(&negotiated(24));
        let mut rx = BtpSession::new(&negotiated(24));
        let packets = tx.segment(&vec![0xbb; 100]);
        let err = rx.assemble(&packets[1]).expect_err("no begin segment");
        assert!(matches!(err, TransportError::OrphanSegment));
    }
}
