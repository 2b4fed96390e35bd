//! TLV 读取器：字节流 → 值树，接受任意合法宽度的输入。

use crate::value::{Tag, TlvValue};
use crate::{MAX_NESTING_DEPTH, TlvError};

/// TLV 读取器。
///
/// # 契约说明（What）
/// - `read` 消费一个完整元素（容器递归读完到结束符）；
/// - 数值归一到 64 位表示，宽度信息不保留；
/// - 游标语义：读取失败后游标位置未定义，调用方应放弃整个输入。
#[derive(Debug)]
pub struct TlvReader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// 是否已消费到输入末尾。
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.input.len()
    }

    /// 当前游标偏移（诊断用）。
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// 读取下一个元素及其标签。
    pub fn read(&mut self) -> Result<(Tag, TlvValue), TlvError> {
        self.read_element(0)
    }

    fn read_element(&mut self, depth: usize) -> Result<(Tag, TlvValue), TlvError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(TlvError::NestedTooDeep);
        }
        let control = self.take_byte()?;
        let element_type = control & 0x1f;
        if element_type == 0x18 {
            return Err(TlvError::UnbalancedContainer {
                offset: self.pos - 1,
            });
        }
        let tag = self.read_tag(control >> 5)?;
        let value = self.read_value(element_type, depth)?;
        Ok((tag, value))
    }

    fn read_tag(&mut self, tag_control: u8) -> Result<Tag, TlvError> {
        match tag_control {
            0 => Ok(Tag::Anonymous),
            1 => Ok(Tag::Context(self.take_byte()?)),
            2 => Ok(Tag::Common(u16::from_le_bytes(self.take_array()?) as u32)),
            3 => Ok(Tag::Common(u32::from_le_bytes(self.take_array()?))),
            4 | 5 => Err(TlvError::ImplicitTag {
                offset: self.pos - 1,
            }),
            6 => {
                let vendor_id = u16::from_le_bytes(self.take_array()?);
                let profile = u16::from_le_bytes(self.take_array()?);
                let tag = u16::from_le_bytes(self.take_array()?) as u32;
                Ok(Tag::FullyQualified {
                    vendor_id,
                    profile,
                    tag,
                })
            }
            7 => {
                let vendor_id = u16::from_le_bytes(self.take_array()?);
                let profile = u16::from_le_bytes(self.take_array()?);
                let tag = u32::from_le_bytes(self.take_array()?);
                Ok(Tag::FullyQualified {
                    vendor_id,
                    profile,
                    tag,
                })
            }
            _ => unreachable!("tag control is a 3-bit field"),
        }
    }

    fn read_value(&mut self, element_type: u8, depth: usize) -> Result<TlvValue, TlvError> {
        match element_type {
            0x00..=0x03 => {
                let bytes = 1usize << (element_type & 0x03);
                let raw = self.take_slice(bytes)?;
                Ok(TlvValue::SignedInt(read_signed(raw)))
            }
            0x04..=0x07 => {
                let bytes = 1usize << (element_type & 0x03);
                let raw = self.take_slice(bytes)?;
                Ok(TlvValue::UnsignedInt(read_unsigned(raw)))
            }
            0x08 => Ok(TlvValue::Bool(false)),
            0x09 => Ok(TlvValue::Bool(true)),
            0x0a => Ok(TlvValue::Float32(f32::from_le_bytes(self.take_array()?))),
            0x0b => Ok(TlvValue::Float64(f64::from_le_bytes(self.take_array()?))),
            0x0c..=0x0f => {
                let payload = self.take_length_prefixed(element_type & 0x03)?;
                let offset = self.pos - payload.len();
                let text = core::str::from_utf8(payload)
                    .map_err(|_| TlvError::InvalidUtf8 { offset })?;
                Ok(TlvValue::Utf8(text.to_owned()))
            }
            0x10..=0x13 => {
                let payload = self.take_length_prefixed(element_type & 0x03)?;
                Ok(TlvValue::Bytes(payload.to_vec()))
            }
            0x14 => Ok(TlvValue::Null),
            0x15 => {
                let fields = self.read_container(depth, false)?;
                Ok(TlvValue::Structure(fields))
            }
            0x16 => {
                let entries = self.read_container(depth, true)?;
                Ok(TlvValue::Array(
                    entries.into_iter().map(|(_, value)| value).collect(),
                ))
            }
            0x17 => {
                let entries = self.read_container(depth, false)?;
                Ok(TlvValue::List(entries))
            }
            raw => Err(TlvError::UnknownElementType {
                raw,
                offset: self.pos - 1,
            }),
        }
    }

    fn read_container(
        &mut self,
        depth: usize,
        anonymous_only: bool,
    ) -> Result<Vec<(Tag, TlvValue)>, TlvError> {
        let mut entries = Vec::new();
        loop {
            match self.peek_byte()? {
                0x18 => {
                    self.pos += 1;
                    return Ok(entries);
                }
                _ => {
                    let offset = self.pos;
                    let (tag, value) = self.read_element(depth + 1)?;
                    if anonymous_only && tag != Tag::Anonymous {
                        return Err(TlvError::TaggedArrayElement { offset });
                    }
                    entries.push((tag, value));
                }
            }
        }
    }

    fn take_byte(&mut self) -> Result<u8, TlvError> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or(TlvError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn peek_byte(&self) -> Result<u8, TlvError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(TlvError::Truncated { offset: self.pos })
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8], TlvError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(TlvError::Truncated { offset: self.pos })?;
        let slice = &self.input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], TlvError> {
        let slice = self.take_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_length_prefixed(&mut self, width_code: u8) -> Result<&'a [u8], TlvError> {
        let bytes = 1usize << width_code;
        let raw = self.take_slice(bytes)?;
        let len = read_unsigned(raw) as usize;
        self.take_slice(len)
    }
}

fn read_unsigned(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..raw.len()].copy_from_slice(raw);
    u64::from_le_bytes(buf)
}

fn read_signed(raw: &[u8]) -> i64 {
    match raw.len() {
        1 => raw[0] as i8 as i64,
        2 => i16::from_le_bytes([raw[0], raw[1]]) as i64,
        4 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
        _ => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(raw);
            i64::from_le_bytes(buf)
        }
    }
}

/// 解码单个匿名顶层元素；剩余字节视为畸形输入。
pub fn decode(input: &[u8]) -> Result<TlvValue, TlvError> {
    decode_tagged(input).map(|(_, value)| value)
}

/// 解码单个带标签顶层元素。
pub fn decode_tagged(input: &[u8]) -> Result<(Tag, TlvValue), TlvError> {
    let mut reader = TlvReader::new(input);
    let element = reader.read()?;
    if !reader.is_at_end() {
        return Err(TlvError::TrailingBytes {
            remaining: input.len() - reader.offset(),
        });
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{encode, encode_tagged};
    use proptest::prelude::*;

    #[test]
    fn decodes_non_canonical_widths() {
        // 值 7 以 4 字节宽度编码；读取端归一为 u64。
        let wide = vec![0x06, 0x07, 0x00, 0x00, 0x00];
        assert_eq!(decode(&wide).expect("decode"), TlvValue::UnsignedInt(7));
    }

    #[test]
    fn rejects_truncated_container() {
        let bytes = encode(&TlvValue::Structure(vec![(
            Tag::Context(0),
            TlvValue::Bool(true),
        )]));
        let err = decode(&bytes[..bytes.len() - 1]).expect_err("missing end marker");
        assert!(matches!(err, TlvError::Truncated { .. }));
    }

    #[test]
    fn rejects_tagged_array_element() {
        // 手工构造：数组内放一个上下文标签元素。
        let bytes = vec![0x16, 0x29, 0x00, 0x18];
        let err = decode(&bytes).expect_err("tagged array element");
        assert!(matches!(err, TlvError::TaggedArrayElement { .. }));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&TlvValue::Null);
        bytes.push(0x00);
        assert!(matches!(
            decode(&bytes),
            Err(TlvError::TrailingBytes { remaining: 1 })
        ));
    }

    fn arb_scalar() -> impl Strategy<Value = TlvValue> {
        prop_oneof![
            any::<i64>().prop_map(TlvValue::SignedInt),
            any::<u64>().prop_map(TlvValue::UnsignedInt),
            any::<bool>().prop_map(TlvValue::Bool),
            proptest::num::f32::NORMAL.prop_map(TlvValue::Float32),
            proptest::num::f64::NORMAL.prop_map(TlvValue::Float64),
            ".{0,24}".prop_map(TlvValue::Utf8),
            proptest::collection::vec(any::<u8>(), 0..48).prop_map(TlvValue::Bytes),
            Just(TlvValue::Null),
        ]
    }

    fn arb_value() -> impl Strategy<Value = TlvValue> {
        arb_scalar().prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                proptest::collection::vec((any::<u8>(), inner.clone()), 0..6).prop_map(|fields| {
                    TlvValue::Structure(
                        fields
                            .into_iter()
                            .map(|(n, value)| (Tag::Context(n), value))
                            .collect(),
                    )
                }),
                proptest::collection::vec(inner, 0..6).prop_map(TlvValue::Array),
            ]
        })
    }

    proptest! {
        #[test]
        fn roundtrip_any_value(value in arb_value()) {
            let bytes = encode(&value);
            prop_assert_eq!(decode(&bytes).expect("decode"), value);
        }

        #[test]
        fn roundtrip_preserves_tags(n in any::<u8>(), value in arb_scalar()) {
            let bytes = encode_tagged(Tag::Context(n), &value);
            let (tag, decoded) = decode_tagged(&bytes).expect("decode");
            prop_assert_eq!(tag, Tag::Context(n));
            prop_assert_eq!(decoded, value);
        }
    }
}
