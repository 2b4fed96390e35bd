#![doc = r#"
# matter-codec-tlv

## 模块使命（Why）
- **协议的唯一线缆编码**：Matter 的交互模型载荷、会话建立参数、证书与
  OTA 头部全部使用 TLV（Tag-Length-Value）编码；本 crate 是工作区内
  所有需要产出或消费 TLV 字节流的组件共用的编解码层。
- **值模型与字节流解耦**：上层以 [`TlvValue`] 树操作数据，编码宽度、
  标签形态等线缆细节由读写器收敛在本 crate 内。

## 核心契约（What）
- [`TlvWriter`] 以最小宽度编码整数与长度前缀（规范宽度），保证
  `decode(encode(x)) == x` 成立；
- [`TlvReader`] 接受任意合法宽度的输入，数值统一归一到 64 位表示；
- 标签支持匿名、上下文（1 字节）、公共 profile（2/4 字节）与全限定
  （6/8 字节）形态；隐式 profile 标签缺少编码上下文，读到即报错。

## 风险提示（Trade-offs）
- 容器嵌套深度以 [`MAX_NESTING_DEPTH`] 为上限，超出按畸形输入拒绝，
  防御恶意构造的深递归载荷；
- 浮点数按位往返，NaN 载荷不做归一。
"#]

mod reader;
mod value;
mod writer;

pub use reader::{TlvReader, decode, decode_tagged};
pub use value::{Tag, TlvValue};
pub use writer::{TlvWriter, encode, encode_tagged};

use matter_core::error::{MatterError, codes};
use thiserror::Error;

/// 容器嵌套深度上限。
pub const MAX_NESTING_DEPTH: usize = 24;

/// TLV 编解码错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TlvError {
    /// 字节流在元素中途结束。
    #[error("tlv input truncated at offset {offset}")]
    Truncated { offset: usize },

    /// 控制字节携带未定义的元素类型。
    #[error("unknown tlv element type 0x{raw:02x} at offset {offset}")]
    UnknownElementType { raw: u8, offset: usize },

    /// 隐式 profile 标签在无 profile 上下文的通用解码器中不可解析。
    #[error("implicit-profile tag at offset {offset} cannot be decoded without context")]
    ImplicitTag { offset: usize },

    /// 容器结束符出现在非容器上下文。
    #[error("unbalanced end-of-container at offset {offset}")]
    UnbalancedContainer { offset: usize },

    /// 数组元素必须匿名。
    #[error("array element carries a tag at offset {offset}")]
    TaggedArrayElement { offset: usize },

    /// 字符串载荷不是合法 UTF-8。
    #[error("utf8 string payload invalid at offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// 嵌套深度超出 [`MAX_NESTING_DEPTH`]。
    #[error("container nesting exceeds {MAX_NESTING_DEPTH}")]
    NestedTooDeep,

    /// 顶层元素之后还有剩余字节。
    #[error("{remaining} trailing bytes after top-level element")]
    TrailingBytes { remaining: usize },
}

impl From<TlvError> for MatterError {
    fn from(err: TlvError) -> Self {
        MatterError::framing(codes::TLV_MALFORMED, err.to_string()).with_cause(err)
    }
}
