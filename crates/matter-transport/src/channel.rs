//! 通道抽象：按 `(种类, 地址, 可靠性, 最大载荷)` 刻画一条字节通路。

use async_trait::async_trait;
use matter_core::error::Result;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// 通道种类。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChannelKind {
    Udp,
    Tcp,
    Ble,
}

impl ChannelKind {
    /// 该种类的通道是否自带可靠传输（否则由 MRP 补偿）。
    pub fn reliable(&self) -> bool {
        !matches!(self, ChannelKind::Udp)
    }
}

/// 对端地址：IP 族传输用套接字地址，BLE 用外设标识。
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum PeerAddress {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Ble { peripheral: String },
}

impl PeerAddress {
    pub fn kind(&self) -> ChannelKind {
        match self {
            PeerAddress::Udp(_) => ChannelKind::Udp,
            PeerAddress::Tcp(_) => ChannelKind::Tcp,
            PeerAddress::Ble { .. } => ChannelKind::Ble,
        }
    }

    /// IP 族地址（BLE 返回 `None`）。
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddress::Udp(addr) | PeerAddress::Tcp(addr) => Some(*addr),
            PeerAddress::Ble { .. } => None,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Udp(addr) => write!(f, "udp://{addr}"),
            PeerAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
            PeerAddress::Ble { peripheral } => write!(f, "ble://{peripheral}"),
        }
    }
}

/// 通道元数据。
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub kind: ChannelKind,
    pub local: PeerAddress,
    pub remote: PeerAddress,
    pub reliable: bool,
    pub max_payload: usize,
}

/// 字节通道契约。
///
/// 实现必须保证 `send` 的原子性：单次调用要么整报文送出，要么报错，
/// 不得出现半个报文落到线缆上的情况。
#[async_trait]
pub trait Channel: Send + Sync {
    fn info(&self) -> &ChannelInfo;

    async fn send(&self, payload: &[u8]) -> Result<()>;
}

/// 入站报文监听器：`(来源地址, 报文)`。
pub type DataListener = Arc<dyn Fn(PeerAddress, Vec<u8>) + Send + Sync>;

/// 无连接传输契约（UDP）。
///
/// # 契约说明（What）
/// - `open_channel` 不产生握手流量，仅构造发往 `remote` 的发送句柄；
/// - `on_data` 注册唯一的入站钩子，后注册者替换先注册者。
pub trait ConnectionlessTransport: Send + Sync {
    fn open_channel(&self, remote: PeerAddress) -> Result<Arc<dyn Channel>>;

    fn on_data(&self, listener: DataListener);
}
