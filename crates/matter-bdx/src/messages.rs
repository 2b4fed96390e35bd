//! BDX 消息编解码：Init/Accept/Block 家族与状态码。

use matter_core::error::{MatterError, Result, codes};

/// BDX 协议的 opcode 清单。
pub mod opcode {
    pub const SEND_INIT: u8 = 0x01;
    pub const SEND_ACCEPT: u8 = 0x02;
    pub const RECEIVE_INIT: u8 = 0x04;
    pub const RECEIVE_ACCEPT: u8 = 0x05;
    pub const BLOCK_QUERY: u8 = 0x10;
    pub const BLOCK: u8 = 0x11;
    pub const BLOCK_EOF: u8 = 0x12;
    pub const BLOCK_ACK: u8 = 0x13;
    pub const BLOCK_ACK_EOF: u8 = 0x14;
    pub const STATUS_REPORT: u8 = 0x40;
}

/// 协议版本（transfer control 低 4 位）。
pub const BDX_VERSION: u8 = 1;

const CONTROL_SENDER_DRIVE: u8 = 0x10;
const CONTROL_RECEIVER_DRIVE: u8 = 0x20;
const CONTROL_ASYNC: u8 = 0x40;

/// BDX 错误状态码。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdxStatusCode {
    LengthTooLarge,
    FileDesignatorUnknown,
    UnexpectedMessage,
    BadBlockCounter,
    TransferMethodNotSupported,
    TransferFailedUnknownError,
}

impl BdxStatusCode {
    pub fn raw(&self) -> u16 {
        match self {
            BdxStatusCode::LengthTooLarge => 0x0012,
            BdxStatusCode::FileDesignatorUnknown => 0x001f,
            BdxStatusCode::UnexpectedMessage => 0x003f,
            BdxStatusCode::BadBlockCounter => 0x0049,
            BdxStatusCode::TransferMethodNotSupported => 0x0050,
            BdxStatusCode::TransferFailedUnknownError => 0x005f,
        }
    }

    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x0012 => Some(BdxStatusCode::LengthTooLarge),
            0x001f => Some(BdxStatusCode::FileDesignatorUnknown),
            0x003f => Some(BdxStatusCode::UnexpectedMessage),
            0x0049 => Some(BdxStatusCode::BadBlockCounter),
            0x0050 => Some(BdxStatusCode::TransferMethodNotSupported),
            0x005f => Some(BdxStatusCode::TransferFailedUnknownError),
            _ => None,
        }
    }
}

/// 驱动方向。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriveMode {
    SenderDrive,
    ReceiverDrive,
}

/// 传输会话发起（SendInit 与 ReceiveInit 同构）。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferInit {
    pub version: u8,
    pub supports_sender_drive: bool,
    pub supports_receiver_drive: bool,
    pub supports_async: bool,
    pub max_block_size: u16,
    pub file_designator: String,
    pub start_offset: Option<u64>,
    pub max_length: Option<u64>,
}

impl TransferInit {
    pub fn new(file_designator: impl Into<String>, max_block_size: u16) -> Self {
        Self {
            version: BDX_VERSION,
            supports_sender_drive: true,
            supports_receiver_drive: true,
            supports_async: false,
            max_block_size,
            file_designator: file_designator.into(),
            start_offset: None,
            max_length: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut control = self.version & 0x0f;
        if self.supports_sender_drive {
            control |= CONTROL_SENDER_DRIVE;
        }
        if self.supports_receiver_drive {
            control |= CONTROL_RECEIVER_DRIVE;
        }
        if self.supports_async {
            control |= CONTROL_ASYNC;
        }
        let mut range_control = 0u8;
        if self.start_offset.is_some() {
            range_control |= 0x01;
        }
        if self.max_length.is_some() {
            range_control |= 0x02;
        }

        let mut out = vec![control, range_control];
        out.extend_from_slice(&self.max_block_size.to_le_bytes());
        if let Some(offset) = self.start_offset {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        if let Some(length) = self.max_length {
            out.extend_from_slice(&length.to_le_bytes());
        }
        let designator = self.file_designator.as_bytes();
        out.extend_from_slice(&(designator.len() as u16).to_le_bytes());
        out.extend_from_slice(designator);
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(input);
        let control = cursor.u8()?;
        let range_control = cursor.u8()?;
        let max_block_size = cursor.u16()?;
        let start_offset = if range_control & 0x01 != 0 {
            Some(cursor.u64()?)
        } else {
            None
        };
        let max_length = if range_control & 0x02 != 0 {
            Some(cursor.u64()?)
        } else {
            None
        };
        let designator_len = cursor.u16()? as usize;
        let designator = cursor.take(designator_len)?;
        Ok(Self {
            version: control & 0x0f,
            supports_sender_drive: control & CONTROL_SENDER_DRIVE != 0,
            supports_receiver_drive: control & CONTROL_RECEIVER_DRIVE != 0,
            supports_async: control & CONTROL_ASYNC != 0,
            max_block_size,
            file_designator: String::from_utf8_lossy(designator).into_owned(),
            start_offset,
            max_length,
        })
    }

    /// 响应方选模式：按其偏好序取双方都支持的第一个。
    pub fn negotiate(&self, preference: &[DriveMode]) -> Option<DriveMode> {
        preference.iter().copied().find(|mode| match mode {
            DriveMode::SenderDrive => self.supports_sender_drive,
            DriveMode::ReceiverDrive => self.supports_receiver_drive,
        })
    }
}

/// 传输接受（SendAccept 与 ReceiveAccept 同构）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransferAccept {
    pub version: u8,
    pub mode: DriveMode,
    pub max_block_size: u16,
    pub length: Option<u64>,
}

impl TransferAccept {
    pub fn encode(&self) -> Vec<u8> {
        let mut control = self.version & 0x0f;
        control |= match self.mode {
            DriveMode::SenderDrive => CONTROL_SENDER_DRIVE,
            DriveMode::ReceiverDrive => CONTROL_RECEIVER_DRIVE,
        };
        let mut out = vec![control, u8::from(self.length.is_some())];
        out.extend_from_slice(&self.max_block_size.to_le_bytes());
        if let Some(length) = self.length {
            out.extend_from_slice(&length.to_le_bytes());
        }
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(input);
        let control = cursor.u8()?;
        let has_length = cursor.u8()? != 0;
        let max_block_size = cursor.u16()?;
        let length = if has_length { Some(cursor.u64()?) } else { None };
        let mode = if control & CONTROL_RECEIVER_DRIVE != 0 {
            DriveMode::ReceiverDrive
        } else if control & CONTROL_SENDER_DRIVE != 0 {
            DriveMode::SenderDrive
        } else {
            return Err(malformed("accept carries no drive mode"));
        };
        Ok(Self {
            version: control & 0x0f,
            mode,
            max_block_size,
            length,
        })
    }
}

/// 数据块（Block 与 BlockEof 同构）。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub counter: u32,
    pub data: Vec<u8>,
}

impl Block {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&self.counter.to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(input);
        let counter = cursor.u32()?;
        Ok(Self {
            counter,
            data: cursor.rest().to_vec(),
        })
    }
}

/// 仅携带计数器的消息（BlockQuery/BlockAck/BlockAckEof）。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterOnly {
    pub counter: u32,
}

impl CounterOnly {
    pub fn encode(&self) -> Vec<u8> {
        self.counter.to_le_bytes().to_vec()
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(input);
        Ok(Self {
            counter: cursor.u32()?,
        })
    }
}

fn malformed(what: &str) -> MatterError {
    MatterError::framing(codes::MESSAGE_MALFORMED, format!("bdx payload: {what}"))
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
        let slice = self
            .input
            .get(self.pos..end)
            .ok_or_else(|| malformed("truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.input[self.pos..];
        self.pos = self.input.len();
        slice
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
    fn init_roundtrip_with_ranges() {
        let mut init = TransferInit::new("ota/firmware-1.5", 512);
        init.start_offset = Some(1024);
        init.max_length = Some(1 << 20);
        assert_eq!(TransferInit::decode(&init.encode()).expect("decode"), init);
    }

    #[test]
    fn negotiation_prefers_responder_order() {
        let init = TransferInit::new("ota/x", 64);
        assert_eq!(
            init.negotiate(&[DriveMode::ReceiverDrive, DriveMode::SenderDrive]),
            Some(DriveMode::ReceiverDrive)
        );

        let sender_only = TransferInit {
            supports_receiver_drive: false,
            ..TransferInit::new("ota/x", 64)
        };
        assert_eq!(
            sender_only.negotiate(&[DriveMode::ReceiverDrive, DriveMode::SenderDrive]),
            Some(DriveMode::SenderDrive)
        );
        assert_eq!(sender_only.negotiate(&[DriveMode::ReceiverDrive]), None);
    }

    #[test]
    fn accept_and_block_roundtrip() {
        let accept = TransferAccept {
            version: BDX_VERSION,
            mode: DriveMode::ReceiverDrive,
            max_block_size: 32,
            length: Some(256),
        };
        assert_eq!(
            TransferAccept::decode(&accept.encode()).expect("decode"),
            accept
        );

        let block = Block {
            counter: 7,
            data: vec![0xab; 32],
        };
        assert_eq!(Block::decode(&block.encode()).expect("decode"), block);
    }
}
