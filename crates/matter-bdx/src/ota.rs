//! OTA 镜像容器：魔数前缀 + TLV 头 + 载荷。
//!
//! # 布局（What）
//! `0x1BEEF11E`（u32 LE）| 文件总长（u64 LE）| TLV 头 | 载荷。
//! TLV 头字段：vendorId、productId、softwareVersion、
//! softwareVersionString（1..64）、payloadSize、可选的适用版本区间与
//! 发布说明 URL、imageDigestType（IANA 哈希编号）、imageDigest（≤64 字节）。

use matter_codec_tlv::{Tag, TlvValue, TlvWriter, TlvReader};
use matter_core::error::{MatterError, Result, codes};
use matter_core::types::{ProductId, VendorId};
use sha2::{Digest, Sha256};

/// 文件魔数。
pub const OTA_MAGIC: u32 = 0x1bee_f11e;

/// IANA Named Information 注册表中 sha-256 的编号。
pub const DIGEST_TYPE_SHA256: u8 = 1;

/// 镜像头。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OtaImageHeader {
    pub vendor_id: VendorId,
    pub product_id: ProductId,
    pub software_version: u32,
    pub software_version_string: String,
    pub payload_size: u64,
    pub min_applicable_software_version: Option<u32>,
    pub max_applicable_software_version: Option<u32>,
    pub release_notes_url: Option<String>,
    pub image_digest_type: u8,
    pub image_digest: Vec<u8>,
}

impl OtaImageHeader {
    fn to_tlv(&self) -> Vec<u8> {
        let mut fields = vec![
            (Tag::Context(0), TlvValue::UnsignedInt(u64::from(self.vendor_id.raw()))),
            (Tag::Context(1), TlvValue::UnsignedInt(u64::from(self.product_id.raw()))),
            (
                Tag::Context(2),
                TlvValue::UnsignedInt(u64::from(self.software_version)),
            ),
            (
                Tag::Context(3),
                TlvValue::Utf8(self.software_version_string.clone()),
            ),
            (Tag::Context(4), TlvValue::UnsignedInt(self.payload_size)),
        ];
        if let Some(min) = self.min_applicable_software_version {
            fields.push((Tag::Context(5), TlvValue::UnsignedInt(u64::from(min))));
        }
        if let Some(max) = self.max_applicable_software_version {
            fields.push((Tag::Context(6), TlvValue::UnsignedInt(u64::from(max))));
        }
        if let Some(url) = &self.release_notes_url {
            fields.push((Tag::Context(7), TlvValue::Utf8(url.clone())));
        }
        fields.push((
            Tag::Context(8),
            TlvValue::UnsignedInt(u64::from(self.image_digest_type)),
        ));
        fields.push((Tag::Context(9), TlvValue::Bytes(self.image_digest.clone())));

        let mut writer = TlvWriter::new();
        writer.write(Tag::Anonymous, &TlvValue::Structure(fields));
        writer.into_bytes()
    }

    fn from_tlv_value(value: &TlvValue) -> Result<Self> {
        let u64_field = |tag: u8| value.field(tag).and_then(|v| v.as_u64());
        let text_field =
            |tag: u8| value.field(tag).and_then(|v| v.as_str()).map(str::to_owned);

        let version_string = text_field(3).ok_or_else(|| invalid("softwareVersionString"))?;
        if version_string.is_empty() || version_string.len() > 64 {
            return Err(invalid("softwareVersionString length"));
        }
        let digest = value
            .field(9)
            .and_then(|v| v.as_bytes())
            .map(<[u8]>::to_vec)
            .ok_or_else(|| invalid("imageDigest"))?;
        if digest.len() > 64 {
            return Err(invalid("imageDigest length"));
        }

        Ok(Self {
            vendor_id: VendorId(u64_field(0).ok_or_else(|| invalid("vendorId"))? as u16),
            product_id: ProductId(u64_field(1).ok_or_else(|| invalid("productId"))? as u16),
            software_version: u64_field(2).ok_or_else(|| invalid("softwareVersion"))? as u32,
            software_version_string: version_string,
            payload_size: u64_field(4).ok_or_else(|| invalid("payloadSize"))?,
            min_applicable_software_version: u64_field(5).map(|v| v as u32),
            max_applicable_software_version: u64_field(6).map(|v| v as u32),
            release_notes_url: text_field(7),
            image_digest_type: u64_field(8).ok_or_else(|| invalid("imageDigestType"))? as u8,
            image_digest: digest,
        })
    }
}

fn invalid(what: &str) -> MatterError {
    MatterError::framing(codes::OTA_INVALID_IMAGE, format!("ota image: {what}"))
}

/// 打包镜像：自动填 `payloadSize` 与 SHA-256 摘要。
pub fn write_image(
    vendor_id: VendorId,
    product_id: ProductId,
    software_version: u32,
    software_version_string: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let header = OtaImageHeader {
        vendor_id,
        product_id,
        software_version,
        software_version_string: software_version_string.to_owned(),
        payload_size: payload.len() as u64,
        min_applicable_software_version: None,
        max_applicable_software_version: None,
        release_notes_url: None,
        image_digest_type: DIGEST_TYPE_SHA256,
        image_digest: Sha256::digest(payload).to_vec(),
    };
    let header_tlv = header.to_tlv();
    if header.software_version_string.is_empty() || header.software_version_string.len() > 64 {
        return Err(invalid("softwareVersionString length"));
    }

    let total = 4u64 + 8 + header_tlv.len() as u64 + payload.len() as u64;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&OTA_MAGIC.to_le_bytes());
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&header_tlv);
    out.extend_from_slice(payload);
    Ok(out)
}

/// 解析镜像：返回头与载荷（载荷摘要经过校验）。
pub fn parse_image(bytes: &[u8]) -> Result<(OtaImageHeader, Vec<u8>)> {
    if bytes.len() < 12 {
        return Err(invalid("file shorter than prefix"));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != OTA_MAGIC {
        return Err(invalid("magic mismatch"));
    }
    let total = u64::from_le_bytes([
        bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11],
    ]);
    if total != bytes.len() as u64 {
        return Err(invalid("total size mismatch"));
    }

    let mut reader = TlvReader::new(&bytes[12..]);
    let (_, header_value) = reader.read().map_err(MatterError::from)?;
    let header = OtaImageHeader::from_tlv_value(&header_value)?;
    let payload = bytes[12 + reader.offset()..].to_vec();

    if payload.len() as u64 != header.payload_size {
        return Err(invalid("payload size mismatch"));
    }
    if header.image_digest_type == DIGEST_TYPE_SHA256
        && Sha256::digest(&payload).as_slice() != header.image_digest.as_slice()
    {
        return Err(invalid("payload digest mismatch"));
    }
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_roundtrip_preserves_header_and_digest() {
        let payload = vec![0xabu8; 256];
        let image = write_image(
            VendorId(0xfff1),
            ProductId(0x8000),
            15,
            "1.5.0",
            &payload,
        )
        .expect("write image");

        let (header, parsed_payload) = parse_image(&image).expect("parse image");
        assert_eq!(header.vendor_id, VendorId(0xfff1));
        assert_eq!(header.product_id, ProductId(0x8000));
        assert_eq!(header.software_version, 15);
        assert_eq!(header.payload_size, 256);
        assert_eq!(header.image_digest_type, DIGEST_TYPE_SHA256);
        assert_eq!(
            header.image_digest,
            Sha256::digest(&payload).to_vec(),
            "digest covers the payload bytes"
        );
        assert_eq!(parsed_payload, payload);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = vec![0x01u8; 64];
        let mut image = write_image(VendorId(1), ProductId(2), 3, "3.0", &payload).expect("write");
        let last = image.len() - 1;
        image[last] ^= 0xff;
        let err = parse_image(&image).expect_err("digest mismatch");
        assert_eq!(err.code(), codes::OTA_INVALID_IMAGE);
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let err = parse_image(&[0u8; 32]).expect_err("bad magic");
        assert_eq!(err.code(), codes::OTA_INVALID_IMAGE);
    }
}
