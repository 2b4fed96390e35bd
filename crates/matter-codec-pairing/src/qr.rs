//! 二维码配对载荷：`MT:` 前缀 + base-38 编码的打包位结构。
//!
//! # 位布局（What，LSB 先行）
//! `version(3) | vendorId(16) | productId(16) | flow(2) |
//!  discoveryCapabilities(8) | discriminator(12) | passcode(27) | pad(4)`
//! 共 88 bit = 11 字节；其后可追加 TLV 扩展段，一并参与 base-38。
//!
//! # base-38（How）
//! - 字符集 `0-9 A-Z - .`；每 3 字节按 24 位小端整数转 5 字符，尾部
//!   2 字节转 4 字符、1 字节转 2 字符；解码按同样分组逆运算。

use crate::PairingCodeError;
use matter_codec_tlv::TlvValue;
use matter_core::types::{ProductId, VendorId};

const ALPHABET: &[u8; 38] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-.";
const PREFIX: &str = "MT:";
const PACKED_LEN: usize = 11;
const VERSION: u8 = 0;

/// 设备声明的引导发现能力位图。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DiscoveryCapabilities {
    pub soft_access_point: bool,
    pub ble: bool,
    pub on_ip_network: bool,
}

impl DiscoveryCapabilities {
    pub fn raw(&self) -> u8 {
        u8::from(self.soft_access_point)
            | (u8::from(self.ble) << 1)
            | (u8::from(self.on_ip_network) << 2)
    }

    pub fn from_raw(raw: u8) -> Self {
        Self {
            soft_access_point: raw & 0x01 != 0,
            ble: raw & 0x02 != 0,
            on_ip_network: raw & 0x04 != 0,
        }
    }
}

/// 商用配网流程类别。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CommissioningFlow {
    #[default]
    Standard,
    UserIntent,
    Custom,
}

impl CommissioningFlow {
    fn raw(&self) -> u8 {
        match self {
            CommissioningFlow::Standard => 0,
            CommissioningFlow::UserIntent => 1,
            CommissioningFlow::Custom => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CommissioningFlow::UserIntent,
            2 => CommissioningFlow::Custom,
            _ => CommissioningFlow::Standard,
        }
    }
}

/// 二维码载荷内容。
#[derive(Clone, Debug, PartialEq)]
pub struct QrPairingPayload {
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub flow: CommissioningFlow,
    pub discovery_capabilities: DiscoveryCapabilities,
    /// 12 位长判别码。
    pub discriminator: u16,
    /// 27 位 setup 口令。
    pub passcode: u32,
    /// 可选 TLV 扩展段（厂商自定义引导信息）。
    pub extension: Option<TlvValue>,
}

/// 编码二维码载荷为 `MT:` 串。
pub fn encode_qr(payload: &QrPairingPayload) -> Result<String, PairingCodeError> {
    if payload.discriminator > 0x0fff {
        return Err(PairingCodeError::FieldOutOfRange {
            field: "discriminator",
        });
    }
    if payload.passcode >= (1 << 27) {
        return Err(PairingCodeError::FieldOutOfRange { field: "passcode" });
    }

    let mut bits = BitWriter::default();
    bits.push(u64::from(VERSION), 3);
    bits.push(u64::from(payload.vendor_id.raw()), 16);
    bits.push(u64::from(payload.product_id.raw()), 16);
    bits.push(u64::from(payload.flow.raw()), 2);
    bits.push(u64::from(payload.discovery_capabilities.raw()), 8);
    bits.push(u64::from(payload.discriminator), 12);
    bits.push(u64::from(payload.passcode), 27);
    bits.push(0, 4);
    let mut bytes = bits.into_bytes();
    debug_assert_eq!(bytes.len(), PACKED_LEN);

    if let Some(extension) = &payload.extension {
        bytes.extend_from_slice(&matter_codec_tlv::encode(extension));
    }

    Ok(format!("{PREFIX}{}", base38_encode(&bytes)))
}

/// 解码 `MT:` 串。
pub fn decode_qr(code: &str) -> Result<QrPairingPayload, PairingCodeError> {
    let encoded = code
        .strip_prefix(PREFIX)
        .ok_or(PairingCodeError::MissingPrefix)?;
    let bytes = base38_decode(encoded)?;
    if bytes.len() < PACKED_LEN {
        return Err(PairingCodeError::InvalidLength { len: bytes.len() });
    }

    let mut bits = BitReader::new(&bytes[..PACKED_LEN]);
    let version = bits.pull(3) as u8;
    if version != VERSION {
        return Err(PairingCodeError::UnsupportedVersion { version });
    }
    let vendor_id = VendorId(bits.pull(16) as u16);
    let product_id = ProductId(bits.pull(16) as u16);
    let flow = CommissioningFlow::from_raw(bits.pull(2) as u8);
    let discovery_capabilities = DiscoveryCapabilities::from_raw(bits.pull(8) as u8);
    let discriminator = bits.pull(12) as u16;
    let passcode = bits.pull(27) as u32;

    let extension = if bytes.len() > PACKED_LEN {
        Some(
            matter_codec_tlv::decode(&bytes[PACKED_LEN..])
                .map_err(|_| PairingCodeError::InvalidLength { len: bytes.len() })?,
        )
    } else {
        None
    };

    Ok(QrPairingPayload {
        vendor_id,
        product_id,
        flow,
        discovery_capabilities,
        discriminator,
        passcode,
        extension,
    })
}

/// LSB 先行的位写入器。
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit_offset: usize,
}

impl BitWriter {
    fn push(&mut self, value: u64, bits: usize) {
        for i in 0..bits {
            let bit = (value >> i) & 1;
            if self.bit_offset % 8 == 0 {
                self.bytes.push(0);
            }
            let last = self.bytes.len() - 1;
            self.bytes[last] |= (bit as u8) << (self.bit_offset % 8);
            self.bit_offset += 1;
        }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// LSB 先行的位读取器。
struct BitReader<'a> {
    bytes: &'a [u8],
    bit_offset: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            bit_offset: 0,
        }
    }

    fn pull(&mut self, bits: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..bits {
            let byte = self.bytes[self.bit_offset / 8];
            let bit = (byte >> (self.bit_offset % 8)) & 1;
            value |= u64::from(bit) << i;
            self.bit_offset += 1;
        }
        value
    }
}

fn base38_encode(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let mut value = 0u32;
        for (i, byte) in chunk.iter().enumerate() {
            value |= u32::from(*byte) << (8 * i);
        }
        let chars = match chunk.len() {
            1 => 2,
            2 => 4,
            _ => 5,
        };
        for _ in 0..chars {
            out.push(ALPHABET[(value % 38) as usize] as char);
            value /= 38;
        }
    }
    out
}

fn base38_decode(encoded: &str) -> Result<Vec<u8>, PairingCodeError> {
    let mut out = Vec::new();
    let chars: Vec<char> = encoded.chars().collect();
    for chunk in chars.chunks(5) {
        let bytes = match chunk.len() {
            2 => 1,
            4 => 2,
            5 => 3,
            _ => return Err(PairingCodeError::InvalidLength { len: chunk.len() }),
        };
        let mut value = 0u32;
        for ch in chunk.iter().rev() {
            let digit = ALPHABET
                .iter()
                .position(|c| *c as char == *ch)
                .ok_or(PairingCodeError::InvalidCharacter { ch: *ch })?;
            value = value * 38 + digit as u32;
        }
        for i in 0..bytes {
            out.push((value >> (8 * i)) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matter_codec_tlv::Tag;
    use proptest::prelude::*;

    fn sample_payload() -> QrPairingPayload {
        QrPairingPayload {
            vendor_id: VendorId(0xfff1),
            product_id: ProductId(0x8000),
            flow: CommissioningFlow::Standard,
            discovery_capabilities: DiscoveryCapabilities {
                on_ip_network: true,
                ble: true,
                soft_access_point: false,
            },
            discriminator: 3840,
            passcode: 20202021,
            extension: None,
        }
    }

    #[test]
    fn prefix_and_charset() {
        let code = encode_qr(&sample_payload()).expect("encode");
        assert!(code.starts_with("MT:"));
        assert!(code[3..]
            .bytes()
            .all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn rejects_foreign_prefix() {
        assert_eq!(decode_qr("XX:ABC"), Err(PairingCodeError::MissingPrefix));
    }

    #[test]
    fn tlv_extension_roundtrips() {
        let mut payload = sample_payload();
        payload.extension = Some(TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::Utf8("kitchen".into()),
        )]));
        let code = encode_qr(&payload).expect("encode");
        assert_eq!(decode_qr(&code).expect("decode"), payload);
    }

    proptest! {
        #[test]
        fn roundtrip_core_fields(
            vendor in any::<u16>(),
            product in any::<u16>(),
            flow_raw in 0u8..3,
            caps in 0u8..8,
            discriminator in 0u16..0x1000,
            passcode in 1u32..(1 << 27),
        ) {
            let payload = QrPairingPayload {
                vendor_id: VendorId(vendor),
                product_id: ProductId(product),
                flow: CommissioningFlow::from_raw(flow_raw),
                discovery_capabilities: DiscoveryCapabilities::from_raw(caps),
                discriminator,
                passcode,
                extension: None,
            };
            let code = encode_qr(&payload).expect("encode");
            prop_assert_eq!(decode_qr(&code).expect("decode"), payload);
        }
    }
}
