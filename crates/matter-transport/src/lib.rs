#![doc = r#"
# matter-transport

## 模块使命（Why）
- **统一通路**：会话层只面向 [`Channel`](channel::Channel) 抽象收发
  字节报文，不感知底层是 UDP 数据报、TCP 流还是 BLE GATT 特征值；
- **无连接与有连接的分野**：UDP 以单一 `on_data` 钩子交付入站报文并按
  需打开出站通道；BLE 则先完成 BTP 握手（版本/MTU/窗口协商）再产出
  可靠通道。

## 核心契约（What）
- [`ChannelInfo`](channel::ChannelInfo) 描述 `(kind, 本端地址, 对端地址,
  可靠性, 最大载荷)` 五元组；MRP 只在 `reliable == false` 的通道上启用；
- [`UdpTransport`](udp::UdpTransport) 负责套接字生命周期，入站报文在
  独立任务中交付给注册的监听器；
- [`btp`] 提供 BTP 会话的握手编解码与分段/重组状态机，断链即关闭会话。

## 风险提示（Trade-offs）
- UDP 监听器回调在收包任务上同步执行，耗时处理应自行投递到任务队列；
- BTP 状态机只做单会话串行重组，乱序分段按协议违例拒绝。
"#]

pub mod btp;
pub mod channel;
mod error;
pub mod tcp;
pub mod udp;

pub use channel::{Channel, ChannelInfo, ChannelKind, ConnectionlessTransport, PeerAddress};
pub use error::TransportError;
pub use tcp::{TcpChannel, TcpTransport};
pub use udp::{UdpTransport, UdpTransportBuilder};

/// UDP 通道单报文最大载荷（IPv6 最小 MTU 扣除 IP/UDP 头）。
pub const MAX_UDP_PAYLOAD: usize = 1232;
