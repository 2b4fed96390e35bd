#![doc = r#"
# matter-codec-pairing

## 模块使命（Why）
- **带外引导信息的唯一载体**：新设备进入配网前，commissioner 只能通过
  手动输入的数字串或扫描二维码获得口令与判别码；本 crate 负责这两种
  格式的编解码，并保证与线缆另一端的实现字节级互通。
- **强校验**：手动码使用 Verhoeff 校验位拦截常见的抄写错误（单字替换、
  相邻换位），解码端对字符集与校验位双重把关。

## 核心契约（What）
- 手动配对码：11 位（无 VID/PID）或 21 位（含 VID/PID）十进制串；编码
  内容为 4 位短判别码与 27 位口令；
- 二维码载荷：`MT:` 前缀 + base-38 编码的打包位结构
  `(version, vendorId, productId, flow, discoveryCapabilities,
  discriminator, passcode)`，可附带 TLV 扩展段；
- 两种格式的 encode/decode 在其覆盖的字段集上互为逆运算。
"#]

mod manual;
mod qr;
mod verhoeff;

pub use manual::{ManualPairingCode, decode_manual, encode_manual};
pub use qr::{
    CommissioningFlow, DiscoveryCapabilities, QrPairingPayload, decode_qr, encode_qr,
};

use matter_core::error::{MatterError, codes};
use thiserror::Error;

/// 配对码编解码错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PairingCodeError {
    /// 长度既不是 11 也不是 21（手动码），或 base-38 分组长度非法。
    #[error("pairing code has invalid length {len}")]
    InvalidLength { len: usize },

    /// 含有字符集外的字符。
    #[error("pairing code contains invalid character `{ch}`")]
    InvalidCharacter { ch: char },

    /// Verhoeff 校验位不匹配。
    #[error("manual pairing code check digit mismatch")]
    CheckDigitMismatch,

    /// 缺少 `MT:` 前缀。
    #[error("qr payload missing MT: prefix")]
    MissingPrefix,

    /// 打包位结构的版本不受支持。
    #[error("qr payload version {version} unsupported")]
    UnsupportedVersion { version: u8 },

    /// 字段值超出其位宽（编码侧防御）。
    #[error("field `{field}` out of range")]
    FieldOutOfRange { field: &'static str },
}

impl From<PairingCodeError> for MatterError {
    fn from(err: PairingCodeError) -> Self {
        MatterError::framing(codes::PAIRING_CODE_INVALID, err.to_string()).with_cause(err)
    }
}
