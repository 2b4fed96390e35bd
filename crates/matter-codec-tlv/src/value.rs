//! TLV 值模型：标签与元素的内存表示。

use core::fmt;

/// TLV 标签。
///
/// # 契约说明（What）
/// - `Anonymous`：无标签，数组元素与多数顶层元素使用；
/// - `Context(n)`：1 字节上下文标签，结构体字段的常规形态；
/// - `Common(n)`：Matter 公共 profile 标签，编码时 ≤ 0xFFFF 走 2 字节形态；
/// - `FullyQualified`：厂商自定义元素使用的 6/8 字节形态。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Tag {
    Anonymous,
    Context(u8),
    Common(u32),
    FullyQualified {
        vendor_id: u16,
        profile: u16,
        tag: u32,
    },
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Anonymous => write!(f, "tag:_"),
            Tag::Context(n) => write!(f, "tag:{n}"),
            Tag::Common(n) => write!(f, "tag:common({n})"),
            Tag::FullyQualified {
                vendor_id,
                profile,
                tag,
            } => write!(f, "tag:{vendor_id:04x}:{profile:04x}:{tag}"),
        }
    }
}

/// TLV 元素值。
///
/// 数值统一归一到 64 位；编码宽度由写入端按最小规范宽度选择。
#[derive(Clone, Debug, PartialEq)]
pub enum TlvValue {
    SignedInt(i64),
    UnsignedInt(u64),
    Bool(bool),
    Float32(f32),
    Float64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Null,
    /// 有序字段集合；字段标签在同一结构内应唯一。
    Structure(Vec<(Tag, TlvValue)>),
    /// 匿名元素的有序集合。
    Array(Vec<TlvValue>),
    /// 可带标签的有序集合。
    List(Vec<(Tag, TlvValue)>),
}

impl TlvValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TlvValue::UnsignedInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TlvValue::SignedInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TlvValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TlvValue::Utf8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TlvValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_structure(&self) -> Option<&[(Tag, TlvValue)]> {
        match self {
            TlvValue::Structure(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[TlvValue]> {
        match self {
            TlvValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TlvValue::Null)
    }

    /// 在结构体中按上下文标签号查找字段。
    pub fn field(&self, context_tag: u8) -> Option<&TlvValue> {
        let fields = match self {
            TlvValue::Structure(fields) | TlvValue::List(fields) => fields,
            _ => return None,
        };
        fields
            .iter()
            .find(|(tag, _)| matches!(tag, Tag::Context(n) if *n == context_tag))
            .map(|(_, value)| value)
    }

    /// 值的粗粒度类型名，用于诊断消息。
    pub fn type_name(&self) -> &'static str {
        match self {
            TlvValue::SignedInt(_) => "signed-int",
            TlvValue::UnsignedInt(_) => "unsigned-int",
            TlvValue::Bool(_) => "bool",
            TlvValue::Float32(_) => "float32",
            TlvValue::Float64(_) => "float64",
            TlvValue::Utf8(_) => "utf8",
            TlvValue::Bytes(_) => "bytes",
            TlvValue::Null => "null",
            TlvValue::Structure(_) => "structure",
            TlvValue::Array(_) => "array",
            TlvValue::List(_) => "list",
        }
    }
}

impl From<u64> for TlvValue {
    fn from(v: u64) -> Self {
        TlvValue::UnsignedInt(v)
    }
}

impl From<i64> for TlvValue {
    fn from(v: i64) -> Self {
        TlvValue::SignedInt(v)
    }
}

impl From<bool> for TlvValue {
    fn from(v: bool) -> Self {
        TlvValue::Bool(v)
    }
}

impl From<&str> for TlvValue {
    fn from(v: &str) -> Self {
        TlvValue::Utf8(v.to_owned())
    }
}

impl From<Vec<u8>> for TlvValue {
    fn from(v: Vec<u8>) -> Self {
        TlvValue::Bytes(v)
    }
}
