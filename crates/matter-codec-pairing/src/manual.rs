//! 手动配对码：11/21 位十进制串的布局与编解码。
//!
//! # 位布局（What）
//! - 块 1（1 位数字，3 bit）：`vid_pid_present << 2 | short_discriminator >> 2`；
//! - 块 2（5 位数字，16 bit）：`(short_discriminator & 0x3) << 14 | passcode & 0x3fff`；
//! - 块 3（4 位数字，13 bit）：`passcode >> 14`；
//! - 可选块 4/5（各 5 位数字）：vendor id 与 product id；
//! - 末位：对前序全部数字的 Verhoeff 校验位。
//!
//! 手动码只携带 12 位判别码的高 4 位（短判别码），commissioner 发现阶段
//! 据此过滤候选设备。

use crate::verhoeff;
use crate::PairingCodeError;
use matter_core::types::{ProductId, VendorId};

/// 口令的有效位宽（27 bit）。
const PASSCODE_BITS_MASK: u32 = 0x07ff_ffff;

/// 解码后的手动配对码内容。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ManualPairingCode {
    /// 27 位 setup 口令。
    pub passcode: u32,
    /// 4 位短判别码（长判别码的高 4 位）。
    pub short_discriminator: u8,
    /// 21 位形态携带的 vendor/product。
    pub vendor_product: Option<(VendorId, ProductId)>,
}

/// 编码手动配对码。
///
/// # 契约说明（What）
/// - `passcode` 超出 27 位、`short_discriminator` 超出 4 位时返回
///   [`PairingCodeError::FieldOutOfRange`]；
/// - 返回串长度为 11（无 VID/PID）或 21（含 VID/PID）。
pub fn encode_manual(
    passcode: u32,
    short_discriminator: u8,
    vendor_product: Option<(VendorId, ProductId)>,
) -> Result<String, PairingCodeError> {
    if passcode & !PASSCODE_BITS_MASK != 0 {
        return Err(PairingCodeError::FieldOutOfRange { field: "passcode" });
    }
    if short_discriminator > 0x0f {
        return Err(PairingCodeError::FieldOutOfRange {
            field: "short_discriminator",
        });
    }

    let vid_pid_present = u32::from(vendor_product.is_some());
    let chunk1 = (vid_pid_present << 2) | u32::from(short_discriminator >> 2);
    let chunk2 = (u32::from(short_discriminator & 0x03) << 14) | (passcode & 0x3fff);
    let chunk3 = passcode >> 14;

    let mut rendered = format!("{chunk1:01}{chunk2:05}{chunk3:04}");
    if let Some((vendor_id, product_id)) = vendor_product {
        rendered.push_str(&format!("{:05}{:05}", vendor_id.raw(), product_id.raw()));
    }

    let digits: Vec<u8> = rendered.bytes().map(|b| b - b'0').collect();
    rendered.push((b'0' + verhoeff::check_digit(&digits)) as char);
    Ok(rendered)
}

/// 解码并校验手动配对码；接受混入的空格与连字符分组。
pub fn decode_manual(code: &str) -> Result<ManualPairingCode, PairingCodeError> {
    let mut digits = Vec::with_capacity(21);
    for ch in code.chars() {
        match ch {
            '0'..='9' => digits.push(ch as u8 - b'0'),
            ' ' | '-' => continue,
            other => return Err(PairingCodeError::InvalidCharacter { ch: other }),
        }
    }

    if digits.len() != 11 && digits.len() != 21 {
        return Err(PairingCodeError::InvalidLength { len: digits.len() });
    }
    if !verhoeff::validate(&digits) {
        return Err(PairingCodeError::CheckDigitMismatch);
    }

    let chunk1 = u32::from(digits[0]);
    let chunk2 = digits[1..6].iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d));
    let chunk3 = digits[6..10].iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d));

    let short_discriminator = (((chunk1 & 0x03) << 2) | (chunk2 >> 14)) as u8;
    let passcode = (chunk3 << 14) | (chunk2 & 0x3fff);

    let vendor_product = if chunk1 & 0x04 != 0 {
        if digits.len() != 21 {
            return Err(PairingCodeError::InvalidLength { len: digits.len() });
        }
        let vendor = digits[10..15].iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d));
        let product = digits[15..20].iter().fold(0u32, |acc, d| acc * 10 + u32::from(*d));
        if vendor > u32::from(u16::MAX) || product > u32::from(u16::MAX) {
            return Err(PairingCodeError::FieldOutOfRange {
                field: "vendor_product",
            });
        }
        Some((VendorId(vendor as u16), ProductId(product as u16)))
    } else {
        if digits.len() != 11 {
            return Err(PairingCodeError::InvalidLength { len: digits.len() });
        }
        None
    };

    Ok(ManualPairingCode {
        passcode,
        short_discriminator,
        vendor_product,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_is_grouped_decodable() {
        let code = encode_manual(20202021, 0x0f, None).expect("encode");
        assert_eq!(code.len(), 11);

        // 带分组符的形态必须同样可解。
        let grouped = format!("{}-{}-{}", &code[..4], &code[4..8], &code[8..]);
        let decoded = decode_manual(&grouped).expect("decode");
        assert_eq!(decoded.passcode, 20202021);
        assert_eq!(decoded.short_discriminator, 0x0f);
        assert_eq!(decoded.vendor_product, None);
    }

    #[test]
    fn corrupted_digit_is_rejected() {
        let code = encode_manual(20202021, 0x0f, None).expect("encode");
        let mut bytes = code.into_bytes();
        bytes[3] = if bytes[3] == b'9' { b'0' } else { bytes[3] + 1 };
        let corrupted = String::from_utf8(bytes).expect("ascii");
        assert_eq!(
            decode_manual(&corrupted),
            Err(PairingCodeError::CheckDigitMismatch)
        );
    }

    #[test]
    fn out_of_range_fields_rejected() {
        assert_eq!(
            encode_manual(1 << 27, 0, None),
            Err(PairingCodeError::FieldOutOfRange { field: "passcode" })
        );
        assert_eq!(
            encode_manual(1, 0x10, None),
            Err(PairingCodeError::FieldOutOfRange {
                field: "short_discriminator"
            })
        );
    }

    proptest! {
        #[test]
        fn roundtrip_with_and_without_vid_pid(
            passcode in 1u32..(1 << 27),
            short in 0u8..16,
            vid_pid in proptest::option::of((any::<u16>(), any::<u16>())),
        ) {
            let vendor_product = vid_pid.map(|(v, p)| (VendorId(v), ProductId(p)));
            let code = encode_manual(passcode, short, vendor_product).expect("encode");
            prop_assert_eq!(code.len(), if vendor_product.is_some() { 21 } else { 11 });
            let decoded = decode_manual(&code).expect("decode");
            prop_assert_eq!(decoded.passcode, passcode);
            prop_assert_eq!(decoded.short_discriminator, short);
            prop_assert_eq!(decoded.vendor_product, vendor_product);
        }
    }
}
