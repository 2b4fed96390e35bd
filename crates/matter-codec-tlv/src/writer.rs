//! TLV 写入器：值树 → 规范宽度的字节流。

use crate::value::{Tag, TlvValue};

// 元素类型编号（控制字节低 5 位）。
const TYPE_SIGNED_BASE: u8 = 0x00;
const TYPE_UNSIGNED_BASE: u8 = 0x04;
const TYPE_BOOL_FALSE: u8 = 0x08;
const TYPE_BOOL_TRUE: u8 = 0x09;
const TYPE_FLOAT32: u8 = 0x0a;
const TYPE_FLOAT64: u8 = 0x0b;
const TYPE_UTF8_BASE: u8 = 0x0c;
const TYPE_BYTES_BASE: u8 = 0x10;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCTURE: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

// 标签控制（控制字节高 3 位）。
const TAG_ANONYMOUS: u8 = 0;
const TAG_CONTEXT: u8 = 1;
const TAG_COMMON_2: u8 = 2;
const TAG_COMMON_4: u8 = 3;
const TAG_FULLY_QUALIFIED_6: u8 = 6;
const TAG_FULLY_QUALIFIED_8: u8 = 7;

/// TLV 写入器。
///
/// # 契约说明（What）
/// - 整数与长度前缀按最小宽度编码（规范形态）；
/// - `write` 可多次调用以产出顶层元素序列（交互模型的报告块即如此）。
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一个带标签的元素（容器会整树递归写入）。
    pub fn write(&mut self, tag: Tag, value: &TlvValue) {
        match value {
            TlvValue::SignedInt(v) => self.write_signed(tag, *v),
            TlvValue::UnsignedInt(v) => self.write_unsigned(tag, *v),
            TlvValue::Bool(v) => {
                self.control(tag, if *v { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE })
            }
            TlvValue::Float32(v) => {
                self.control(tag, TYPE_FLOAT32);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            TlvValue::Float64(v) => {
                self.control(tag, TYPE_FLOAT64);
                self.buf.extend_from_slice(&v.to_le_bytes());
            }
            TlvValue::Utf8(v) => self.write_string(tag, TYPE_UTF8_BASE, v.as_bytes()),
            TlvValue::Bytes(v) => self.write_string(tag, TYPE_BYTES_BASE, v),
            TlvValue::Null => self.control(tag, TYPE_NULL),
            TlvValue::Structure(fields) => {
                self.control(tag, TYPE_STRUCTURE);
                for (field_tag, field) in fields {
                    self.write(*field_tag, field);
                }
                self.buf.push(TYPE_END_CONTAINER);
            }
            TlvValue::Array(items) => {
                self.control(tag, TYPE_ARRAY);
                for item in items {
                    self.write(Tag::Anonymous, item);
                }
                self.buf.push(TYPE_END_CONTAINER);
            }
            TlvValue::List(entries) => {
                self.control(tag, TYPE_LIST);
                for (entry_tag, entry) in entries {
                    self.write(*entry_tag, entry);
                }
                self.buf.push(TYPE_END_CONTAINER);
            }
        }
    }

    /// 取出编码结果。
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// 当前已写入的字节数。
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn control(&mut self, tag: Tag, element_type: u8) {
        let (tag_control, tag_bytes) = encode_tag(tag);
        self.buf.push((tag_control << 5) | element_type);
        self.buf.extend_from_slice(&tag_bytes);
    }

    fn write_unsigned(&mut self, tag: Tag, v: u64) {
        let (width_code, bytes) = unsigned_width(v);
        self.control(tag, TYPE_UNSIGNED_BASE + width_code);
        self.buf.extend_from_slice(&v.to_le_bytes()[..bytes]);
    }

    fn write_signed(&mut self, tag: Tag, v: i64) {
        let (width_code, bytes) = signed_width(v);
        self.control(tag, TYPE_SIGNED_BASE + width_code);
        self.buf.extend_from_slice(&v.to_le_bytes()[..bytes]);
    }

    fn write_string(&mut self, tag: Tag, base: u8, payload: &[u8]) {
        let (width_code, bytes) = unsigned_width(payload.len() as u64);
        self.control(tag, base + width_code);
        self.buf
            .extend_from_slice(&(payload.len() as u64).to_le_bytes()[..bytes]);
        self.buf.extend_from_slice(payload);
    }
}

fn encode_tag(tag: Tag) -> (u8, Vec<u8>) {
    match tag {
        Tag::Anonymous => (TAG_ANONYMOUS, Vec::new()),
        Tag::Context(n) => (TAG_CONTEXT, vec![n]),
        Tag::Common(n) if n <= u16::MAX as u32 => {
            (TAG_COMMON_2, (n as u16).to_le_bytes().to_vec())
        }
        Tag::Common(n) => (TAG_COMMON_4, n.to_le_bytes().to_vec()),
        Tag::FullyQualified {
            vendor_id,
            profile,
            tag,
        } => {
            let mut bytes = Vec::with_capacity(8);
            bytes.extend_from_slice(&vendor_id.to_le_bytes());
            bytes.extend_from_slice(&profile.to_le_bytes());
            if tag <= u16::MAX as u32 {
                bytes.extend_from_slice(&(tag as u16).to_le_bytes());
                (TAG_FULLY_QUALIFIED_6, bytes)
            } else {
                bytes.extend_from_slice(&tag.to_le_bytes());
                (TAG_FULLY_QUALIFIED_8, bytes)
            }
        }
    }
}

fn unsigned_width(v: u64) -> (u8, usize) {
    if v <= u8::MAX as u64 {
        (0, 1)
    } else if v <= u16::MAX as u64 {
        (1, 2)
    } else if v <= u32::MAX as u64 {
        (2, 4)
    } else {
        (3, 8)
    }
}

fn signed_width(v: i64) -> (u8, usize) {
    if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
        (0, 1)
    } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
        (1, 2)
    } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        (2, 4)
    } else {
        (3, 8)
    }
}

/// 将单个匿名顶层元素编码为字节流。
pub fn encode(value: &TlvValue) -> Vec<u8> {
    encode_tagged(Tag::Anonymous, value)
}

/// 将单个带标签顶层元素编码为字节流。
pub fn encode_tagged(tag: Tag, value: &TlvValue) -> Vec<u8> {
    let mut writer = TlvWriter::new();
    writer.write(tag, value);
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_widths_for_unsigned() {
        assert_eq!(encode(&TlvValue::UnsignedInt(0)), vec![0x04, 0x00]);
        assert_eq!(encode(&TlvValue::UnsignedInt(255)), vec![0x04, 0xff]);
        assert_eq!(encode(&TlvValue::UnsignedInt(256)), vec![0x05, 0x00, 0x01]);
        assert_eq!(
            encode(&TlvValue::UnsignedInt(u32::MAX as u64 + 1)),
            vec![0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn context_tagged_structure_layout() {
        let value = TlvValue::Structure(vec![
            (Tag::Context(0), TlvValue::Bool(true)),
            (Tag::Context(1), TlvValue::UnsignedInt(7)),
        ]);
        // 0x15 structure, 0x29 = ctx-tag bool-true, 0x24 = ctx-tag u8, 0x18 end.
        assert_eq!(
            encode(&value),
            vec![0x15, 0x29, 0x00, 0x24, 0x01, 0x07, 0x18]
        );
    }
}
