#![doc = r#"
# matter-session

## 模块使命（Why）
- **从字节到受信通道**：本 crate 把传输层交付的裸数据报变成带身份、
  防重放、可靠送达的逻辑交换——上面的交互模型与 BDX 只面向
  [`Exchange`](exchange::Exchange) 编程；
- **两条建立路径**：配网期走口令认证（PASE），入网后走证书认证
  （CASE，含恢复快路径）；两者共享同一套未加密交换与状态机骨架。

## 分层（What）
- [`message`] / [`counters`]：报文头编解码、发送计数与重放窗口；
- [`session`] / [`manager`]：对称加密上下文与并发安全的会话表；
- [`pase`] / [`case`] / [`cert`]：建立协议状态机与操作证书链；
- [`mrp`]：不可靠通道上的重传退避；
- [`exchange`]：交换路由、协议分发与确认对账；
- [`establish`]：把状态机接到交换上的驱动与响应处理器。

## 并发模型（How）
- 会话表与路由表用 `DashMap`，守卫绝不跨 `await` 持有；
- 每个待确认帧一个重传任务，确认经 `Notify` 单次放行；
- 交换邮箱为有界 `mpsc`，慢消费者背压到发送端。
"#]

pub mod case;
pub mod cert;
pub mod counters;
pub mod establish;
pub mod exchange;
pub mod manager;
pub mod message;
pub mod mrp;
pub mod pase;
pub mod session;

pub use case::{CaseInitiator, CaseResponder, FabricCredentials, ResumptionRecord};
pub use cert::{NocChain, OperationalCert, issue_icac, issue_noc, self_signed_root};
pub use establish::{
    SecureChannelDelegate, SecureChannelHandler, establish_case, establish_pase, opcode,
};
pub use exchange::{Exchange, ExchangeManager, InboundMessage, ProtocolHandler, StatusReport};
pub use manager::SessionManager;
pub use message::{MessageHeader, PayloadHeader, SessionType};
pub use pase::{PaseProver, PaseResponder, PaseVerifier, passcode_is_forbidden};
pub use session::{
    SecureSession, SessionKeys, SessionKind, SessionParameters, SessionRole, derive_session_keys,
};
